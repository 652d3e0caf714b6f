//! Entities: self-signed identity objects.
//!
//! Wire form: `vk32 | TLV* | 0x00 | sig64`. The signature is made by the
//! entity's own key and covers every byte preceding it.

use std::sync::OnceLock;

use bosswave_crypto::Keypair;
use bosswave_crypto::SIG_LEN;
use bosswave_crypto::Vk;
use bosswave_crypto::verify_blob;
use chrono::DateTime;
use chrono::SubsecRound;
use chrono::Utc;
use rand::CryptoRng;
use rand::RngCore;

use crate::error::ObjectError;
use crate::error::Result;
use crate::tlv::TlvBlock;
use crate::wire::Reader;

/// A parsed (or freshly built) entity.
///
/// Immutable once signed; shared out of the resolver cache as `Arc<Entity>`.
#[derive(Debug)]
pub struct Entity {
    content: Vec<u8>,
    vk: Vk,
    created: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    revokers: Vec<Vk>,
    contact: String,
    comment: String,
    signature: [u8; SIG_LEN],
    sig_ok: OnceLock<bool>,
}

impl Entity {
    /// Parse an entity from its wire form.
    pub fn decode(content: &[u8]) -> Result<Entity> {
        let mut r = Reader::new(content);
        let vk = r.vk()?;
        let block = TlvBlock::parse(&mut r)?;
        if block.publish_limits.is_some() {
            return Err(ObjectError::InvalidField {
                what: "entity TLV",
                reason: "publish limits are not valid on an entity".to_string(),
            });
        }
        let signature = r.signature()?;
        if r.remaining() != 0 {
            return Err(ObjectError::BadFieldLength {
                field: "entity body",
                got: content.len(),
                expected: content.len() - r.remaining(),
            });
        }
        Ok(Entity {
            content: content.to_vec(),
            vk,
            created: block.created,
            expires: block.expires,
            revokers: block.revokers,
            contact: block.contact,
            comment: block.comment,
            signature,
            sig_ok: OnceLock::new(),
        })
    }

    pub fn vk(&self) -> Vk {
        self.vk
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

    pub fn signature(&self) -> &[u8; SIG_LEN] {
        &self.signature
    }

    /// The full wire form, signature included.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// True once the expiry timestamp has passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e < now)
    }

    /// Check the self-signature. The result is computed once and cached;
    /// contents are immutable after construction.
    pub fn sig_valid(&self) -> bool {
        *self
            .sig_ok
            .get_or_init(|| verify_blob(&self.vk, &self.signature, &self.content[..self.content.len() - SIG_LEN]))
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Entity) -> bool {
        self.content == other.content
    }
}
impl Eq for Entity {}

/// Builder for a fresh entity. Produces the signed wire form and the
/// keypair that owns it.
#[derive(Debug, Default)]
pub struct EntityBuilder {
    created: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    revokers: Vec<Vk>,
    contact: String,
    comment: String,
    omit_creation: bool,
}

impl EntityBuilder {
    pub fn new() -> EntityBuilder {
        EntityBuilder::default()
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

    /// Absolute expiry. Truncated to millisecond precision, the wire
    /// resolution.
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

    /// Generate a keypair and produce the signed entity.
    pub fn build<R: RngCore + CryptoRng>(self, rng: &mut R) -> (Entity, Keypair) {
        let keypair = Keypair::generate(rng);
        let entity = self.build_with_keypair(&keypair);
        (entity, keypair)
    }

    /// Produce the signed entity for an existing keypair.
    pub fn build_with_keypair(mut self, keypair: &Keypair) -> Entity {
        if self.created.is_none() && !self.omit_creation {
            self.created = Some(Utc::now().trunc_subsecs(3));
        }
        let block = TlvBlock {
            publish_limits: None,
            created: self.created,
            expires: self.expires,
            revokers: self.revokers,
            contact: self.contact,
            comment: self.comment,
        };
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(keypair.vk().as_bytes());
        block.encode(&mut buf);
        let signature = keypair.sign(&buf);
        buf.extend_from_slice(&signature);
        Entity {
            content: buf,
            vk: keypair.vk(),
            created: block.created,
            expires: block.expires,
            revokers: block.revokers,
            contact: block.contact,
            comment: block.comment,
            signature,
            sig_ok: OnceLock::from(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_entity_roundtrip() {
        let mut rng = StdRng::seed_from_u64(1);
        let (entity, _kp) = EntityBuilder::new()
            .contact("ops@example.com")
            .comment("build floor gateway")
            .expires_in(chrono::Duration::days(30))
            .build(&mut rng);

        let parsed = Entity::decode(entity.content()).unwrap();
        assert_eq!(parsed, entity);
        assert_eq!(parsed.contact(), "ops@example.com");
        assert_eq!(parsed.comment(), "build floor gateway");
        assert_eq!(parsed.created(), entity.created());
        assert_eq!(parsed.expires(), entity.expires());
        assert!(parsed.sig_valid());
    }

    #[test]
    fn test_entity_revokers_roundtrip() {
        let mut rng = StdRng::seed_from_u64(2);
        let revoker = Keypair::generate(&mut rng).vk();
        let (entity, _) = EntityBuilder::new().revoker(revoker).omit_creation_date().build(&mut rng);
        let parsed = Entity::decode(entity.content()).unwrap();
        assert_eq!(parsed.revokers(), &[revoker]);
        assert!(parsed.created().is_none());
    }

    #[test]
    fn test_entity_tampered_sig_fails() {
        let mut rng = StdRng::seed_from_u64(3);
        let (entity, _) = EntityBuilder::new().comment("x").build(&mut rng);
        let mut bytes = entity.content().to_vec();
        // Flip a bit inside the signed region.
        bytes[40] ^= 0x01;
        let parsed = Entity::decode(&bytes).unwrap();
        assert!(!parsed.sig_valid());
    }

    #[test]
    fn test_entity_truncated_fails() {
        let mut rng = StdRng::seed_from_u64(4);
        let (entity, _) = EntityBuilder::new().build(&mut rng);
        let bytes = entity.content();
        assert!(Entity::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(Entity::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_entity_trailing_garbage_fails() {
        let mut rng = StdRng::seed_from_u64(5);
        let (entity, _) = EntityBuilder::new().build(&mut rng);
        let mut bytes = entity.content().to_vec();
        bytes.push(0xFF);
        assert!(Entity::decode(&bytes).is_err());
    }

    #[test]
    fn test_entity_expiry_clock() {
        let mut rng = StdRng::seed_from_u64(6);
        let (entity, _) = EntityBuilder::new().expires(Utc::now() - chrono::Duration::hours(1)).build(&mut rng);
        assert!(entity.is_expired_at(Utc::now()));
        let (fresh, _) = EntityBuilder::new().expires_in(chrono::Duration::hours(1)).build(&mut rng);
        assert!(!fresh.is_expired_at(Utc::now()));
    }
}
