//! DOTs: declarations of trust.
//!
//! A DOT is a signed statement `giver -> receiver` with a TTL (how many
//! further delegation hops it allows) and either an access scope (a
//! permission set on a URI) or a free-form permission table. Wire form:
//!
//! `giver32 | receiver32 | ttl u8 | TLV* | 0x00 | tail | sig64`
//!
//! where the tail is `perm-bits u16 | mvk32 | suffix-len u16 | suffix` for
//! an access DOT and `(klen u8 | key | vlen u16 | value)* | 0x00` for a
//! permission DOT. The DOT's hash is the SHA-256 of everything before the
//! signature.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use bosswave_crypto::Keypair;
use bosswave_crypto::ObjHash;
use bosswave_crypto::SIG_LEN;
use bosswave_crypto::Vk;
use bosswave_crypto::sha256;
use bosswave_crypto::verify_blob;
use chrono::DateTime;
use chrono::SubsecRound;
use chrono::Utc;

use crate::constants::MAX_PERMISSION_KEY_LEN;
use crate::constants::MAX_PERMISSION_VALUE_LEN;
use crate::constants::RO_ACCESS_DOT;
use crate::constants::RO_PERMISSION_DOT;
use crate::error::ObjectError;
use crate::error::Result;
use crate::permissions::PermissionSet;
use crate::tlv::TlvBlock;
use crate::wire::Reader;
use crate::wire::put_u16_le;

/// Resource limits an access DOT may impose on messages it authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishLimits {
    pub tx_limit: i64,
    pub store_limit: i64,
    pub retain: u8,
}

/// The flavor-specific half of a DOT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotKind {
    /// Grants permissions on a namespace URI.
    Access {
        permissions: PermissionSet,
        mvk: Vk,
        suffix: String,
    },
    /// Grants an application-defined key/value table.
    Permission {
        /// Ordered so the encoded form is deterministic.
        kv: BTreeMap<String, String>,
    },
}

/// A declaration of trust, immutable once signed.
#[derive(Debug)]
pub struct Dot {
    content: Vec<u8>,
    hash: ObjHash,
    giver: Vk,
    receiver: Vk,
    ttl: u8,
    publish_limits: Option<PublishLimits>,
    created: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    revokers: Vec<Vk>,
    contact: String,
    comment: String,
    kind: DotKind,
    signature: [u8; SIG_LEN],
    sig_ok: OnceLock<bool>,
}

impl Dot {
    /// Parse a DOT from its wire form. `ronum` selects the flavor
    /// (`RO_ACCESS_DOT` or `RO_PERMISSION_DOT`).
    pub fn decode(ronum: u8, content: &[u8]) -> Result<Dot> {
        let mut r = Reader::new(content);
        let giver = r.vk()?;
        let receiver = r.vk()?;
        let ttl = r.u8()?;
        let block = TlvBlock::parse(&mut r)?;

        let kind = match ronum {
            RO_ACCESS_DOT => {
                let bits = r.u16_le()?;
                let mvk = r.vk()?;
                let suffix_len = r.u16_le()? as usize;
                let suffix = r.utf8(suffix_len)?;
                DotKind::Access {
                    permissions: PermissionSet::from_bits(bits),
                    mvk,
                    suffix,
                }
            }
            RO_PERMISSION_DOT => {
                let mut kv = BTreeMap::new();
                loop {
                    let klen = r.u8()? as usize;
                    if klen == 0 {
                        break;
                    }
                    let key = r.utf8(klen)?;
                    let vlen = r.u16_le()? as usize;
                    let value = r.utf8(vlen)?;
                    kv.insert(key, value);
                }
                DotKind::Permission { kv }
            }
            other => return Err(ObjectError::UnknownTag { tag: other }),
        };

        let signed_len = r.pos();
        let signature = r.signature()?;
        if r.remaining() != 0 {
            return Err(ObjectError::BadFieldLength {
                field: "dot body",
                got: content.len(),
                expected: content.len() - r.remaining(),
            });
        }

        Ok(Dot {
            hash: sha256(&content[..signed_len]),
            content: content.to_vec(),
            giver,
            receiver,
            ttl,
            publish_limits: block.publish_limits,
            created: block.created,
            expires: block.expires,
            revokers: block.revokers,
            contact: block.contact,
            comment: block.comment,
            kind,
            signature,
            sig_ok: OnceLock::new(),
        })
    }

    /// The routing object tag this DOT encodes under.
    pub fn ronum(&self) -> u8 {
        match self.kind {
            DotKind::Access { .. } => RO_ACCESS_DOT,
            DotKind::Permission { .. } => RO_PERMISSION_DOT,
        }
    }

    pub fn is_access(&self) -> bool {
        matches!(self.kind, DotKind::Access { .. })
    }

    /// SHA-256 over the signed byte range (signature excluded).
    pub fn hash(&self) -> ObjHash {
        self.hash
    }

    pub fn giver(&self) -> Vk {
        self.giver
    }

    pub fn receiver(&self) -> Vk {
        self.receiver
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    pub fn revokers(&self) -> &[Vk] {
        &self.revokers
    }

    pub fn contact(&self) -> &str {
        &self.contact
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn publish_limits(&self) -> Option<&PublishLimits> {
        self.publish_limits.as_ref()
    }

    pub fn kind(&self) -> &DotKind {
        &self.kind
    }

    /// Access-DOT permission set; `None` for permission DOTs.
    pub fn permission_set(&self) -> Option<PermissionSet> {
        match &self.kind {
            DotKind::Access { permissions, .. } => Some(*permissions),
            DotKind::Permission { .. } => None,
        }
    }

    /// Access-DOT namespace MVK.
    pub fn access_mvk(&self) -> Option<Vk> {
        match &self.kind {
            DotKind::Access { mvk, .. } => Some(*mvk),
            DotKind::Permission { .. } => None,
        }
    }

    /// Access-DOT URI suffix.
    pub fn access_suffix(&self) -> Option<&str> {
        match &self.kind {
            DotKind::Access { suffix, .. } => Some(suffix),
            DotKind::Permission { .. } => None,
        }
    }

    /// Full topic the access scope covers: `base64url(mvk)/suffix`.
    pub fn access_uri(&self) -> Option<String> {
        match &self.kind {
            DotKind::Access { mvk, suffix, .. } => Some(format!("{}/{}", mvk.to_base64(), suffix)),
            DotKind::Permission { .. } => None,
        }
    }

    /// Permission-DOT key/value table.
    pub fn permission_table(&self) -> Option<&BTreeMap<String, String>> {
        match &self.kind {
            DotKind::Access { .. } => None,
            DotKind::Permission { kv } => Some(kv),
        }
    }

    /// The full wire form, signature included.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn signature(&self) -> &[u8; SIG_LEN] {
        &self.signature
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e < now)
    }

    /// Check the giver's signature. Computed once and cached.
    pub fn sig_valid(&self) -> bool {
        *self
            .sig_ok
            .get_or_init(|| verify_blob(&self.giver, &self.signature, &self.content[..self.content.len() - SIG_LEN]))
    }
}

impl PartialEq for Dot {
    fn eq(&self, other: &Dot) -> bool {
        self.content == other.content
    }
}
impl Eq for Dot {}

impl std::fmt::Display for Dot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DotKind::Access { permissions, .. } => {
                write!(f, "DOT[{} {} -> {} on {}]", permissions, self.giver, self.receiver, self.access_uri().unwrap_or_default())
            }
            DotKind::Permission { kv } => {
                write!(f, "DOT[permission {} -> {} ({} keys)]", self.giver, self.receiver, kv.len())
            }
        }
    }
}

/// Builder producing a signed DOT.
#[derive(Debug)]
pub struct DotBuilder {
    giver: Vk,
    receiver: Vk,
    ttl: u8,
    publish_limits: Option<PublishLimits>,
    created: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    revokers: Vec<Vk>,
    contact: String,
    comment: String,
    omit_creation: bool,
    kind: DotKind,
}

impl DotBuilder {
    /// Start an access DOT granting `permissions` on `mvk/suffix`.
    pub fn access(giver: Vk, receiver: Vk, mvk: Vk, suffix: impl Into<String>, permissions: PermissionSet) -> DotBuilder {
        DotBuilder {
            giver,
            receiver,
            ttl: 0,
            publish_limits: None,
            created: None,
            expires: None,
            revokers: Vec::new(),
            contact: String::new(),
            comment: String::new(),
            omit_creation: false,
            kind: DotKind::Access {
                permissions,
                mvk,
                suffix: suffix.into(),
            },
        }
    }

    /// Start a permission DOT with an empty table.
    pub fn permission(giver: Vk, receiver: Vk) -> DotBuilder {
        DotBuilder {
            giver,
            receiver,
            ttl: 0,
            publish_limits: None,
            created: None,
            expires: None,
            revokers: Vec::new(),
            contact: String::new(),
            comment: String::new(),
            omit_creation: false,
            kind: DotKind::Permission { kv: BTreeMap::new() },
        }
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = contact.into();
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn revoker(mut self, vk: Vk) -> Self {
        self.revokers.push(vk);
        self
    }

    pub fn publish_limits(mut self, limits: PublishLimits) -> Self {
        self.publish_limits = Some(limits);
        self
    }

    pub fn expires(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at.trunc_subsecs(3));
        self
    }

    pub fn expires_in(self, delta: chrono::Duration) -> Self {
        let at = Utc::now() + delta;
        self.expires(at)
    }

    pub fn created(mut self, at: DateTime<Utc>) -> Self {
        self.created = Some(at.trunc_subsecs(3));
        self
    }

    pub fn omit_creation_date(mut self) -> Self {
        self.omit_creation = true;
        self
    }

    /// Set one key in a permission DOT's table.
    ///
    /// # Errors
    ///
    /// Rejects oversized keys/values and rejects the call entirely on an
    /// access DOT.
    pub fn permission_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || key.len() > MAX_PERMISSION_KEY_LEN {
            return Err(ObjectError::InvalidField {
                what: "permission key",
                reason: format!("length {} outside 1..={MAX_PERMISSION_KEY_LEN}", key.len()),
            });
        }
        if value.len() > MAX_PERMISSION_VALUE_LEN {
            return Err(ObjectError::InvalidField {
                what: "permission value",
                reason: format!("length {} exceeds {MAX_PERMISSION_VALUE_LEN}", value.len()),
            });
        }
        match &mut self.kind {
            DotKind::Permission { kv } => {
                kv.insert(key, value);
                Ok(self)
            }
            DotKind::Access { .. } => Err(ObjectError::InvalidField {
                what: "permission entry",
                reason: "not a permission DOT".to_string(),
            }),
        }
    }

    /// Encode and sign. The keypair must belong to the giver.
    pub fn build(mut self, keypair: &Keypair) -> Result<Dot> {
        if keypair.vk() != self.giver {
            return Err(ObjectError::KeyMismatch);
        }
        if self.created.is_none() && !self.omit_creation {
            self.created = Some(Utc::now().trunc_subsecs(3));
        }

        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(self.giver.as_bytes());
        buf.extend_from_slice(self.receiver.as_bytes());
        buf.push(self.ttl);
        let block = TlvBlock {
            publish_limits: self.publish_limits,
            created: self.created,
            expires: self.expires,
            revokers: self.revokers.clone(),
            contact: self.contact.clone(),
            comment: self.comment.clone(),
        };
        block.encode(&mut buf);

        match &self.kind {
            DotKind::Access { permissions, mvk, suffix } => {
                put_u16_le(&mut buf, permissions.to_bits());
                buf.extend_from_slice(mvk.as_bytes());
                if suffix.len() > u16::MAX as usize {
                    return Err(ObjectError::InvalidField {
                        what: "access suffix",
                        reason: format!("length {} exceeds {}", suffix.len(), u16::MAX),
                    });
                }
                put_u16_le(&mut buf, suffix.len() as u16);
                buf.extend_from_slice(suffix.as_bytes());
            }
            DotKind::Permission { kv } => {
                for (key, value) in kv {
                    buf.push(key.len() as u8);
                    buf.extend_from_slice(key.as_bytes());
                    put_u16_le(&mut buf, value.len() as u16);
                    buf.extend_from_slice(value.as_bytes());
                }
                buf.push(0);
            }
        }

        let hash = sha256(&buf);
        let signature = keypair.sign(&buf);
        buf.extend_from_slice(&signature);

        Ok(Dot {
            content: buf,
            hash,
            giver: self.giver,
            receiver: self.receiver,
            ttl: self.ttl,
            publish_limits: self.publish_limits,
            created: self.created,
            expires: self.expires,
            revokers: self.revokers,
            contact: self.contact,
            comment: self.comment,
            kind: self.kind,
            signature,
            sig_ok: OnceLock::from(true),
        })
    }
}
