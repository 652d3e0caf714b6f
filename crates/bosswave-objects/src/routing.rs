//! Routing objects: the typed metadata block of a message.
//!
//! On the wire each routing object is `tag u8 | len u16 | body[len]`.
//! Tags this codec does not understand surface as
//! [`ObjectError::UnknownTag`] so the message parser can log and skip
//! them.

use std::sync::Arc;

use bosswave_crypto::Vk;
use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;

use crate::constants::MAX_OBJECT_SIZE;
use crate::constants::RO_ACCESS_DCHAIN;
use crate::constants::RO_ACCESS_DCHAIN_HASH;
use crate::constants::RO_ACCESS_DOT;
use crate::constants::RO_ENTITY;
use crate::constants::RO_EXPIRY;
use crate::constants::RO_ORIGIN_VK;
use crate::constants::RO_PERMISSION_DCHAIN;
use crate::constants::RO_PERMISSION_DCHAIN_HASH;
use crate::constants::RO_PERMISSION_DOT;
use crate::dchain::DChain;
use crate::dot::Dot;
use crate::entity::Entity;
use crate::error::ObjectError;
use crate::error::Result;
use crate::wire::Reader;
use crate::wire::put_u64_le;

/// A parsed routing object.
#[derive(Debug, Clone)]
pub enum RoutingObject {
    /// An access or permission chain, hash or full form.
    Chain(Arc<DChain>),
    /// An access or permission DOT.
    Dot(Arc<Dot>),
    /// An entity.
    Entity(Arc<Entity>),
    /// The VK that signed the message.
    OriginVk(Vk),
    /// Message expiry, ms-epoch on the wire.
    Expiry(DateTime<Utc>),
}

impl RoutingObject {
    /// Parse a routing object body for the given tag.
    pub fn decode(tag: u8, body: &[u8]) -> Result<RoutingObject> {
        if body.len() > MAX_OBJECT_SIZE {
            return Err(ObjectError::ObjectTooLarge { size: body.len() });
        }
        match tag {
            RO_ACCESS_DCHAIN | RO_ACCESS_DCHAIN_HASH | RO_PERMISSION_DCHAIN | RO_PERMISSION_DCHAIN_HASH => {
                Ok(RoutingObject::Chain(Arc::new(DChain::decode(tag, body)?)))
            }
            RO_ACCESS_DOT | RO_PERMISSION_DOT => Ok(RoutingObject::Dot(Arc::new(Dot::decode(tag, body)?))),
            RO_ENTITY => Ok(RoutingObject::Entity(Arc::new(Entity::decode(body)?))),
            RO_ORIGIN_VK => {
                let vk = Vk::from_slice(body).ok_or(ObjectError::BadFieldLength {
                    field: "origin VK",
                    got: body.len(),
                    expected: 32,
                })?;
                Ok(RoutingObject::OriginVk(vk))
            }
            RO_EXPIRY => {
                let mut r = Reader::new(body);
                let ms = r.u64_le()?;
                if r.remaining() != 0 {
                    return Err(ObjectError::BadFieldLength {
                        field: "expiry",
                        got: body.len(),
                        expected: 8,
                    });
                }
                let at = Utc.timestamp_millis_opt(ms as i64).single().ok_or_else(|| ObjectError::InvalidField {
                    what: "expiry",
                    reason: format!("{ms} ms is out of range"),
                })?;
                Ok(RoutingObject::Expiry(at))
            }
            other => Err(ObjectError::UnknownTag { tag: other }),
        }
    }

    /// The wire tag for this object.
    pub fn ronum(&self) -> u8 {
        match self {
            RoutingObject::Chain(c) => c.ronum(),
            RoutingObject::Dot(d) => d.ronum(),
            RoutingObject::Entity(_) => RO_ENTITY,
            RoutingObject::OriginVk(_) => RO_ORIGIN_VK,
            RoutingObject::Expiry(_) => RO_EXPIRY,
        }
    }

    /// The wire body for this object.
    pub fn content(&self) -> Vec<u8> {
        match self {
            RoutingObject::Chain(c) => c.content(),
            RoutingObject::Dot(d) => d.content().to_vec(),
            RoutingObject::Entity(e) => e.content().to_vec(),
            RoutingObject::OriginVk(vk) => vk.as_bytes().to_vec(),
            RoutingObject::Expiry(at) => {
                let mut out = Vec::with_capacity(8);
                put_u64_le(&mut out, at.timestamp_millis().max(0) as u64);
                out
            }
        }
    }
}

/// Make an expiry routing object `delta` from now, at wire precision.
pub fn expiry_from_now(delta: chrono::Duration) -> RoutingObject {
    let at = Utc::now() + delta;
    let ms = at.timestamp_millis();
    RoutingObject::Expiry(Utc.timestamp_millis_opt(ms).single().unwrap_or(at))
}
