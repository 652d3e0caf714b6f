//! The primary message type and its signed wire frame.
//!
//! Wire layout (signature-covered prefix):
//!
//! `type u8 | msg-id u64 | mvk32 | suffix-len u16 | suffix | type-tail |
//!  (ro-tag u8 | ro-len u16 | ro-body)* | 0x00 |
//!  (po-num u32 | po-len u32 | po-body)* | 0x00000000 | sig64`
//!
//! Publish and persist carry a one-byte consumer limit as the type tail;
//! unsubscribe carries the 16-byte unique ID of the target subscription.
//! The signature covers every byte preceding it.

use std::sync::Arc;

use bosswave_crypto::Keypair;
use bosswave_crypto::SIG_LEN;
use bosswave_crypto::Vk;
use bosswave_crypto::verify_blob;
use bosswave_objects::DChain;
use bosswave_objects::ObjectState;
use bosswave_objects::PayloadObject;
use bosswave_objects::RoutingObject;
use bosswave_objects::constants::MAX_OBJECT_SIZE;
use bosswave_uri::analyze_suffix;
use chrono::DateTime;
use chrono::Utc;
use tracing::warn;

use crate::chain::analyze_access_chain;
use crate::error::CoreError;
use crate::error::Result;
use crate::resolver::Resolver;

/// The eight request types that ride the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Publish = 0x01,
    Persist = 0x02,
    Subscribe = 0x03,
    Tap = 0x04,
    Query = 0x05,
    TapQuery = 0x06,
    List = 0x07,
    Unsubscribe = 0x08,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<MessageType> {
        Some(match v {
            0x01 => MessageType::Publish,
            0x02 => MessageType::Persist,
            0x03 => MessageType::Subscribe,
            0x04 => MessageType::Tap,
            0x05 => MessageType::Query,
            0x06 => MessageType::TapQuery,
            0x07 => MessageType::List,
            0x08 => MessageType::Unsubscribe,
            _ => return None,
        })
    }

    /// Publish-class types deliver a payload into a namespace.
    pub fn is_publish(self) -> bool {
        matches!(self, MessageType::Publish | MessageType::Persist)
    }

    /// Types that may not target wildcard URIs.
    pub fn forbids_wildcards(self) -> bool {
        matches!(self, MessageType::Publish | MessageType::Persist | MessageType::List)
    }
}

/// How far to elaborate the primary access chain before sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElaboratePac {
    /// Carry the chain hash only.
    #[default]
    None,
    /// Ensure the chain is hash-enumerated.
    Partial,
    /// Also attach every resolved DOT as a routing object.
    Full,
}

/// Identifies a message (and thus a subscription) uniquely: the message
/// ID plus the first eight bytes of the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct UniqueMessageId {
    pub mid: u64,
    pub sig: u64,
}

impl std::fmt::Display for UniqueMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:016x}", self.mid, self.sig)
    }
}

/// A message in both decoded and wire form.
#[derive(Debug, Clone)]
pub struct Message {
    /// The full wire frame, signature included. Empty until encoded.
    pub encoded: Vec<u8>,
    pub mtype: MessageType,
    pub message_id: u64,
    /// Consumer limit for publish/persist; zero means unlimited.
    pub consumers: u8,
    pub mvk: Vk,
    pub topic_suffix: String,
    pub signature: [u8; SIG_LEN],
    pub routing_objects: Vec<RoutingObject>,
    pub payload_objects: Vec<PayloadObject>,
    /// Target of an unsubscribe.
    pub unsub_target: Option<UniqueMessageId>,

    // Derived fields.
    /// Offset where the signature coverage ends in `encoded`.
    pub sig_cover_end: usize,
    pub origin_vk: Option<Vk>,
    /// `base64url(mvk)/suffix`.
    pub topic: String,
    pub expire_time: Option<DateTime<Utc>>,
    pub primary_access_chain: Option<Arc<DChain>>,
    /// Set by verification: the chain-merged topic suffix.
    pub merged_suffix: Option<String>,
    pub umid: UniqueMessageId,
}

impl Message {
    /// Start a message with empty object lists. `encode` must be called
    /// before the message can travel.
    pub fn new(mtype: MessageType, message_id: u64, mvk: Vk, topic_suffix: impl Into<String>) -> Message {
        let topic_suffix = topic_suffix.into();
        Message {
            encoded: Vec::new(),
            mtype,
            message_id,
            consumers: 0,
            mvk,
            topic: format!("{}/{}", mvk.to_base64(), topic_suffix),
            topic_suffix,
            signature: [0; SIG_LEN],
            routing_objects: Vec::new(),
            payload_objects: Vec::new(),
            unsub_target: None,
            sig_cover_end: 0,
            origin_vk: None,
            expire_time: None,
            primary_access_chain: None,
            merged_suffix: None,
            umid: UniqueMessageId::default(),
        }
    }

    /// Serialize and sign with the given keypair, filling `encoded`,
    /// `signature`, `sig_cover_end` and `umid`.
    pub fn encode(&mut self, keypair: &Keypair) {
        let mut b = Vec::with_capacity(4096);
        b.push(self.mtype as u8);
        b.extend_from_slice(&self.message_id.to_le_bytes());
        b.extend_from_slice(self.mvk.as_bytes());
        b.extend_from_slice(&(self.topic_suffix.len() as u16).to_le_bytes());
        b.extend_from_slice(self.topic_suffix.as_bytes());
        match self.mtype {
            MessageType::Publish | MessageType::Persist => b.push(self.consumers),
            MessageType::Unsubscribe => {
                let target = self.unsub_target.unwrap_or_default();
                b.extend_from_slice(&target.mid.to_le_bytes());
                b.extend_from_slice(&target.sig.to_le_bytes());
            }
            _ => {}
        }
        for ro in &self.routing_objects {
            let content = ro.content();
            b.push(ro.ronum());
            b.extend_from_slice(&(content.len() as u16).to_le_bytes());
            b.extend_from_slice(&content);
        }
        b.push(0);
        for po in &self.payload_objects {
            b.extend_from_slice(&po.ponum().to_le_bytes());
            b.extend_from_slice(&(po.content().len() as u32).to_le_bytes());
            b.extend_from_slice(po.content());
        }
        b.extend_from_slice(&[0, 0, 0, 0]);

        self.signature = keypair.sign(&b);
        self.sig_cover_end = b.len();
        b.extend_from_slice(&self.signature);
        self.encoded = b;
        self.umid = UniqueMessageId {
            mid: self.message_id,
            sig: u64::from_le_bytes(self.signature[..8].try_into().unwrap()),
        };
    }

    /// Parse a message from its wire frame.
    ///
    /// Routing objects that fail to parse are logged and skipped; every
    /// structural failure is a [`CoreError::BadEncoding`]-class error.
    pub fn decode(bytes: &[u8]) -> Result<Message> {
        use bosswave_objects::error::ObjectError;

        fn take<'a>(bytes: &'a [u8], idx: &mut usize, n: usize) -> Result<&'a [u8]> {
            if bytes.len() - *idx < n {
                return Err(CoreError::BadEncoding {
                    source: ObjectError::Truncated {
                        offset: *idx,
                        need: n - (bytes.len() - *idx),
                    },
                });
            }
            let out = &bytes[*idx..*idx + n];
            *idx += n;
            Ok(out)
        }

        let mut idx = 0usize;
        let mtype_raw = take(bytes, &mut idx, 1)?[0];
        let mtype = MessageType::from_u8(mtype_raw).ok_or(CoreError::BadEncoding {
            source: ObjectError::UnknownTag { tag: mtype_raw },
        })?;
        let message_id = u64::from_le_bytes(take(bytes, &mut idx, 8)?.try_into().unwrap());
        let mvk = Vk::from_slice(take(bytes, &mut idx, 32)?).unwrap();
        let suffix_len = u16::from_le_bytes(take(bytes, &mut idx, 2)?.try_into().unwrap()) as usize;
        let topic_suffix = String::from_utf8(take(bytes, &mut idx, suffix_len)?.to_vec()).map_err(|_| CoreError::BadUri {
            reason: "topic suffix is not valid UTF-8".to_string(),
        })?;

        let mut msg = Message::new(mtype, message_id, mvk, topic_suffix);
        msg.encoded = bytes.to_vec();

        match mtype {
            MessageType::Publish | MessageType::Persist => {
                msg.consumers = take(bytes, &mut idx, 1)?[0];
            }
            MessageType::Unsubscribe => {
                let mid = u64::from_le_bytes(take(bytes, &mut idx, 8)?.try_into().unwrap());
                let sig = u64::from_le_bytes(take(bytes, &mut idx, 8)?.try_into().unwrap());
                msg.unsub_target = Some(UniqueMessageId { mid, sig });
            }
            _ => {}
        }

        // Routing objects, until the zero tag.
        loop {
            let tag = take(bytes, &mut idx, 1)?[0];
            if tag == 0 {
                break;
            }
            let len = u16::from_le_bytes(take(bytes, &mut idx, 2)?.try_into().unwrap()) as usize;
            let body = take(bytes, &mut idx, len)?;
            match RoutingObject::decode(tag, body) {
                Ok(ro) => {
                    if msg.primary_access_chain.is_none()
                        && let RoutingObject::Chain(c) = &ro
                        && c.is_access()
                    {
                        msg.primary_access_chain = Some(c.clone());
                    }
                    if msg.origin_vk.is_none()
                        && let RoutingObject::OriginVk(vk) = &ro
                    {
                        msg.origin_vk = Some(*vk);
                    }
                    if msg.expire_time.is_none()
                        && let RoutingObject::Expiry(at) = &ro
                    {
                        msg.expire_time = Some(*at);
                    }
                    msg.routing_objects.push(ro);
                }
                Err(e) => {
                    // Forward compatibility: an unreadable routing object
                    // does not sink the message.
                    warn!(tag = format_args!("0x{tag:02x}"), error = %e, "skipping bad routing object");
                }
            }
        }

        // Payload objects, until the zero number.
        loop {
            let ponum = u32::from_le_bytes(take(bytes, &mut idx, 4)?.try_into().unwrap());
            if ponum == 0 {
                break;
            }
            let len = u32::from_le_bytes(take(bytes, &mut idx, 4)?.try_into().unwrap()) as usize;
            if len > MAX_OBJECT_SIZE {
                return Err(CoreError::BadEncoding {
                    source: ObjectError::ObjectTooLarge { size: len },
                });
            }
            let body = take(bytes, &mut idx, len)?.to_vec();
            msg.payload_objects.push(PayloadObject::new(ponum, body)?);
        }

        msg.sig_cover_end = idx;
        msg.signature = take(bytes, &mut idx, SIG_LEN)?.try_into().unwrap();
        msg.umid = UniqueMessageId {
            mid: msg.message_id,
            sig: u64::from_le_bytes(msg.signature[..8].try_into().unwrap()),
        };
        Ok(msg)
    }

    /// True once the message's expiry routing object is in the past.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.is_some_and(|e| e < now)
    }

    /// Full verification of an inbound (or about-to-be-sent) message.
    ///
    /// Resolves and validates every DOT of the primary access chain,
    /// checks all signatures, runs chain analysis, deduces the origin VK
    /// and finally checks the message signature. On success the derived
    /// `origin_vk` and `merged_suffix` fields are populated.
    ///
    /// Registry-resolved DOTs always win over copies embedded in the
    /// message's routing objects.
    pub async fn verify(&mut self, resolver: &dyn Resolver) -> Result<()> {
        if self.is_expired_at(Utc::now()) {
            return Err(CoreError::ExpiredMessage);
        }

        let info = analyze_suffix(&self.topic_suffix);
        if info.has_wildcard() && self.mtype.forbids_wildcards() {
            return Err(CoreError::BadOperation {
                reason: "cannot publish or list a URI with a wildcard".to_string(),
            });
        }
        if !info.valid {
            return Err(CoreError::BadUri {
                reason: format!("invalid topic suffix {:?}", self.topic_suffix),
            });
        }

        let pac = self.primary_access_chain.as_ref().ok_or(CoreError::BadPermissions {
            require: "a primary access chain".to_string(),
        })?;

        // Elaborate a hash-form chain through the resolver.
        let pac: Arc<DChain> = if pac.is_elaborated() {
            pac.clone()
        } else {
            let (resolved, _state) = resolver.resolve_access_dchain(pac.chain_hash()).await.map_err(|_| {
                CoreError::Unresolvable {
                    what: format!("access chain {}", pac.chain_hash()),
                }
            })?;
            self.primary_access_chain = Some(resolved.clone());
            resolved
        };

        // Resolve every DOT; anything but Valid sinks the request.
        let n = pac.num_hashes().unwrap_or(0);
        for i in 0..n {
            let hash = pac.dot_hash(i).expect("hash within chain length");
            let (dot, state) = resolver.resolve_dot(hash).await.map_err(|_| CoreError::BadPermissions {
                require: format!("resolvable PAC DOT {i}"),
            })?;
            if state != ObjectState::Valid {
                return Err(CoreError::BadPermissions {
                    require: format!("PAC DOT {i} valid (is {state})"),
                });
            }
            pac.set_dot(i, dot)?;
        }

        if !pac.check_all_sigs() {
            return Err(CoreError::InvalidSig { what: "PAC DOT" });
        }

        let analysis = analyze_access_chain(self.mtype, &self.topic_suffix, &pac)?;
        self.merged_suffix = Some(analysis.merged_uri.clone());

        // An open grant proves nothing about the sender: it must carry an
        // explicit origin. A targeted grant supplies the origin itself.
        if analysis.origin_vk.is_everybody() {
            if self.origin_vk.is_none() {
                return Err(CoreError::NoOrigin);
            }
        } else if self.origin_vk.is_none() {
            self.origin_vk = Some(analysis.origin_vk);
        }

        if self.mvk != analysis.mvk {
            return Err(CoreError::MvkMismatch);
        }

        let origin = self.origin_vk.ok_or(CoreError::NoOrigin)?;
        if !verify_blob(&origin, &self.signature, &self.encoded[..self.sig_cover_end]) {
            return Err(CoreError::InvalidSig { what: "message" });
        }
        Ok(())
    }
}
