//! The TLV metadata block shared by entities and DOTs.
//!
//! Layout: `(tag u8 | len u8 | body[len])* | 0x00`. Unknown tags are
//! skipped via their length byte so newer writers stay readable.

use bosswave_crypto::VK_LEN;
use bosswave_crypto::Vk;
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use tracing::debug;

use crate::constants::MAX_TLV_STRING_LEN;
use crate::constants::TLV_COMMENT;
use crate::constants::TLV_CONTACT;
use crate::constants::TLV_CREATED;
use crate::constants::TLV_END;
use crate::constants::TLV_EXPIRES;
use crate::constants::TLV_PUBLISH_LIMITS;
use crate::constants::TLV_REVOKER;
use crate::dot::PublishLimits;
use crate::error::ObjectError;
use crate::error::Result;
use crate::wire::Reader;
use crate::wire::put_u64_le;

/// Decoded TLV metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TlvBlock {
    pub publish_limits: Option<PublishLimits>,
    pub created: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub revokers: Vec<Vk>,
    pub contact: String,
    pub comment: String,
}

fn ms_to_time(ms: u64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms as i64).single().ok_or_else(|| ObjectError::InvalidField {
        what: "timestamp",
        reason: format!("{ms} ms is out of range"),
    })
}

pub(crate) fn time_to_ms(t: &DateTime<Utc>) -> u64 {
    t.timestamp_millis().max(0) as u64
}

impl TlvBlock {
    /// Parse a TLV block up to and including its 0x00 terminator.
    pub fn parse(r: &mut Reader<'_>) -> Result<TlvBlock> {
        let mut block = TlvBlock::default();
        loop {
            let tag = r.u8()?;
            if tag == TLV_END {
                return Ok(block);
            }
            let len = r.u8()? as usize;
            match tag {
                TLV_PUBLISH_LIMITS => {
                    if len != 17 {
                        return Err(ObjectError::BadFieldLength {
                            field: "publish limits",
                            got: len,
                            expected: 17,
                        });
                    }
                    let mut body = Reader::new(r.take(17)?);
                    block.publish_limits = Some(PublishLimits {
                        tx_limit: body.u64_le()? as i64,
                        store_limit: body.u64_le()? as i64,
                        retain: body.u8()?,
                    });
                }
                TLV_CREATED => {
                    if len != 8 {
                        return Err(ObjectError::BadFieldLength {
                            field: "creation date",
                            got: len,
                            expected: 8,
                        });
                    }
                    block.created = Some(ms_to_time(r.u64_le()?)?);
                }
                TLV_EXPIRES => {
                    if len != 8 {
                        return Err(ObjectError::BadFieldLength {
                            field: "expiry date",
                            got: len,
                            expected: 8,
                        });
                    }
                    block.expires = Some(ms_to_time(r.u64_le()?)?);
                }
                TLV_REVOKER => {
                    if len != VK_LEN {
                        return Err(ObjectError::BadFieldLength {
                            field: "delegated revoker",
                            got: len,
                            expected: VK_LEN,
                        });
                    }
                    block.revokers.push(r.vk()?);
                }
                TLV_CONTACT => {
                    block.contact = r.utf8(len)?;
                }
                TLV_COMMENT => {
                    block.comment = r.utf8(len)?;
                }
                other => {
                    debug!(tag = other, len, "skipping unknown TLV tag");
                    r.take(len)?;
                }
            }
        }
    }

    /// Append the TLV block, including the terminator.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        if let Some(pl) = &self.publish_limits {
            buf.push(TLV_PUBLISH_LIMITS);
            buf.push(17);
            put_u64_le(buf, pl.tx_limit as u64);
            put_u64_le(buf, pl.store_limit as u64);
            buf.push(pl.retain);
        }
        if let Some(t) = &self.created {
            buf.push(TLV_CREATED);
            buf.push(8);
            put_u64_le(buf, time_to_ms(t));
        }
        if let Some(t) = &self.expires {
            buf.push(TLV_EXPIRES);
            buf.push(8);
            put_u64_le(buf, time_to_ms(t));
        }
        for r in &self.revokers {
            buf.push(TLV_REVOKER);
            buf.push(VK_LEN as u8);
            buf.extend_from_slice(r.as_bytes());
        }
        if !self.contact.is_empty() {
            let b = truncated(&self.contact);
            buf.push(TLV_CONTACT);
            buf.push(b.len() as u8);
            buf.extend_from_slice(b);
        }
        if !self.comment.is_empty() {
            let b = truncated(&self.comment);
            buf.push(TLV_COMMENT);
            buf.push(b.len() as u8);
            buf.extend_from_slice(b);
        }
        buf.push(TLV_END);
    }
}

/// Clamp a metadata string to the TLV length byte, on a char boundary.
fn truncated(s: &str) -> &[u8] {
    if s.len() <= MAX_TLV_STRING_LEN {
        return s.as_bytes();
    }
    let mut end = MAX_TLV_STRING_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].as_bytes()
}
