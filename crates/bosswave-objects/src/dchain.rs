//! DOT chains: ordered sequences of DOT hashes.
//!
//! A chain exists in one of two wire forms: *hash form* (just the SHA-256
//! of the concatenated hash sequence) or *elaborated form* (the concrete
//! 32-byte hash sequence). Elaborated chains additionally carry lazily
//! resolved DOT slots; a slot is filled at most once and never replaced
//! with a different value.

use std::sync::Arc;
use std::sync::OnceLock;

use bosswave_crypto::HASH_LEN;
use bosswave_crypto::ObjHash;
use bosswave_crypto::Vk;
use bosswave_crypto::sha256;

use crate::constants::RO_ACCESS_DCHAIN;
use crate::constants::RO_ACCESS_DCHAIN_HASH;
use crate::constants::RO_PERMISSION_DCHAIN;
use crate::constants::RO_PERMISSION_DCHAIN_HASH;
use crate::dot::Dot;
use crate::error::ObjectError;
use crate::error::Result;

/// A DOT chain in hash or elaborated form, access or permission typed.
#[derive(Debug, Clone)]
pub struct DChain {
    dot_hashes: Vec<ObjHash>,
    chain_hash: ObjHash,
    dots: Vec<OnceLock<Arc<Dot>>>,
    is_access: bool,
    elaborated: bool,
}

impl DChain {
    /// Parse a chain from its wire form, dispatching on the routing tag.
    pub fn decode(ronum: u8, content: &[u8]) -> Result<DChain> {
        match ronum {
            RO_ACCESS_DCHAIN | RO_PERMISSION_DCHAIN => {
                if content.is_empty() || content.len() % HASH_LEN != 0 {
                    return Err(ObjectError::BadFieldLength {
                        field: "chain hash sequence",
                        got: content.len(),
                        expected: content.len().div_ceil(HASH_LEN).max(1) * HASH_LEN,
                    });
                }
                let dot_hashes: Vec<ObjHash> =
                    content.chunks_exact(HASH_LEN).map(|c| ObjHash::from_slice(c).unwrap()).collect();
                Ok(DChain {
                    chain_hash: sha256(content),
                    dots: (0..dot_hashes.len()).map(|_| OnceLock::new()).collect(),
                    dot_hashes,
                    is_access: ronum == RO_ACCESS_DCHAIN,
                    elaborated: true,
                })
            }
            RO_ACCESS_DCHAIN_HASH | RO_PERMISSION_DCHAIN_HASH => {
                let chain_hash = ObjHash::from_slice(content).ok_or(ObjectError::BadFieldLength {
                    field: "chain hash",
                    got: content.len(),
                    expected: HASH_LEN,
                })?;
                Ok(DChain {
                    dot_hashes: Vec::new(),
                    chain_hash,
                    dots: Vec::new(),
                    is_access: ronum == RO_ACCESS_DCHAIN_HASH,
                    elaborated: false,
                })
            }
            other => Err(ObjectError::UnknownTag { tag: other }),
        }
    }

    /// Build an elaborated chain directly from resolved DOTs.
    ///
    /// # Errors
    ///
    /// The chain must have at least one DOT and every DOT must match the
    /// requested flavor.
    pub fn from_dots(is_access: bool, dots: Vec<Arc<Dot>>) -> Result<DChain> {
        if dots.is_empty() {
            return Err(ObjectError::InvalidField {
                what: "chain",
                reason: "a chain needs at least one DOT".to_string(),
            });
        }
        if dots.iter().any(|d| d.is_access() != is_access) {
            return Err(ObjectError::InvalidField {
                what: "chain",
                reason: "DOT flavor does not match chain flavor".to_string(),
            });
        }
        let mut content = Vec::with_capacity(dots.len() * HASH_LEN);
        for d in &dots {
            content.extend_from_slice(d.hash().as_bytes());
        }
        Ok(DChain {
            chain_hash: sha256(&content),
            dot_hashes: dots.iter().map(|d| d.hash()).collect(),
            dots: dots.into_iter().map(OnceLock::from).collect(),
            is_access,
            elaborated: true,
        })
    }

    /// The routing object tag for the current form.
    pub fn ronum(&self) -> u8 {
        match (self.is_access, self.elaborated) {
            (true, true) => RO_ACCESS_DCHAIN,
            (true, false) => RO_ACCESS_DCHAIN_HASH,
            (false, true) => RO_PERMISSION_DCHAIN,
            (false, false) => RO_PERMISSION_DCHAIN_HASH,
        }
    }

    /// Wire content for the current form.
    pub fn content(&self) -> Vec<u8> {
        if self.elaborated {
            let mut out = Vec::with_capacity(self.dot_hashes.len() * HASH_LEN);
            for h in &self.dot_hashes {
                out.extend_from_slice(h.as_bytes());
            }
            out
        } else {
            self.chain_hash.as_bytes().to_vec()
        }
    }

    pub fn is_access(&self) -> bool {
        self.is_access
    }

    pub fn is_elaborated(&self) -> bool {
        self.elaborated
    }

    /// SHA-256 over the concatenated hash sequence.
    pub fn chain_hash(&self) -> ObjHash {
        self.chain_hash
    }

    /// Number of DOTs in an elaborated chain; `None` in hash form.
    pub fn num_hashes(&self) -> Option<usize> {
        self.elaborated.then_some(self.dot_hashes.len())
    }

    pub fn dot_hash(&self, idx: usize) -> Option<ObjHash> {
        self.dot_hashes.get(idx).copied()
    }

    pub fn dot_hashes(&self) -> &[ObjHash] {
        &self.dot_hashes
    }

    /// The resolved DOT in slot `idx`, if it has been filled.
    pub fn dot(&self, idx: usize) -> Option<Arc<Dot>> {
        self.dots.get(idx)?.get().cloned()
    }

    /// Fill slot `idx` with a resolved DOT.
    ///
    /// The DOT's hash must match the slot's hash. Filling an already
    /// filled slot is a no-op: slots are never overwritten.
    pub fn set_dot(&self, idx: usize, dot: Arc<Dot>) -> Result<()> {
        let expected = self.dot_hashes.get(idx).ok_or_else(|| ObjectError::InvalidField {
            what: "chain slot",
            reason: format!("index {idx} out of range"),
        })?;
        if dot.hash() != *expected {
            return Err(ObjectError::InvalidField {
                what: "chain slot",
                reason: "DOT hash does not match the chain's hash sequence".to_string(),
            });
        }
        let _ = self.dots[idx].set(dot);
        Ok(())
    }

    /// True once every slot holds its DOT.
    pub fn fully_resolved(&self) -> bool {
        self.elaborated && self.dots.iter().all(|s| s.get().is_some())
    }

    /// The receiver VK of the final DOT, if that slot is resolved.
    pub fn receiver_vk(&self) -> Option<Vk> {
        self.dots.last()?.get().map(|d| d.receiver())
    }

    /// Verify the signature of every resolved DOT. Fails if any slot is
    /// unresolved.
    pub fn check_all_sigs(&self) -> bool {
        self.elaborated && !self.dots.is_empty() && self.dots.iter().all(|s| s.get().is_some_and(|d| d.sig_valid()))
    }

    /// Strip the chain down to hash form, dropping elaboration.
    pub fn unelaborate(&self) -> DChain {
        DChain {
            dot_hashes: Vec::new(),
            chain_hash: self.chain_hash,
            dots: Vec::new(),
            is_access: self.is_access,
            elaborated: false,
        }
    }
}

impl PartialEq for DChain {
    fn eq(&self, other: &DChain) -> bool {
        self.is_access == other.is_access && self.elaborated == other.elaborated && self.chain_hash == other.chain_hash
    }
}
impl Eq for DChain {}
