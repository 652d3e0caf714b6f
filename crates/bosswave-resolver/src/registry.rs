//! The registry seam: the external source of truth for trust objects.
//!
//! The real registry is a blockchain contract; this module defines the
//! operations the core consumes plus an in-memory implementation for
//! tests and single-process deployments. Registry state reflects the
//! contract's view only (known/revoked); expiry and entity-state
//! combination happen in the resolution layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use bosswave_crypto::ObjHash;
use bosswave_crypto::Vk;
use bosswave_objects::DChain;
use bosswave_objects::Dot;
use bosswave_objects::Entity;
use bosswave_objects::ObjectState;
use snafu::Snafu;
use tokio::sync::broadcast;

/// Capacity of the new-block notification channel.
const BLOCK_CHANNEL_DEPTH: usize = 64;

/// Errors surfaced by registry lookups.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    /// The registry has no record of the object.
    #[snafu(display("registry has no record of {what}"))]
    NotFound {
        /// Description of the missing object.
        what: String,
    },

    /// The backend failed to answer.
    #[snafu(display("registry backend failure: {reason}"))]
    Backend {
        /// Transport or contract failure description.
        reason: String,
    },
}

/// Result alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// A change recorded by the registry in some block.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new DOT was granted.
    DotGranted { giver: Vk, nsvk: Option<Vk>, hash: ObjHash },
    /// A DOT was revoked.
    DotRevoked { hash: ObjHash },
    /// An entity was revoked.
    EntityRevoked { vk: Vk },
}

/// A registry event with the block that carried it.
#[derive(Debug, Clone)]
pub struct RegistryLog {
    pub block: u64,
    pub event: RegistryEvent,
}

/// Lookup and change-feed operations the resolution layer consumes.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve an entity by VK with the contract's view of its state.
    async fn entity(&self, vk: Vk) -> Result<(Arc<Entity>, ObjectState)>;

    /// Resolve a DOT by hash with the contract's view of its state.
    async fn dot(&self, hash: ObjHash) -> Result<(Arc<Dot>, ObjectState)>;

    /// Resolve an elaborated access chain by chain hash.
    async fn access_dchain(&self, hash: ObjHash) -> Result<(Arc<DChain>, ObjectState)>;

    /// Hashes of every DOT granted by `vk`.
    async fn dots_from(&self, vk: Vk) -> Result<Vec<ObjHash>>;

    /// The newest block number.
    async fn current_block(&self) -> u64;

    /// Subscribe to new-block notifications.
    fn block_events(&self) -> broadcast::Receiver<u64>;

    /// All change logs in blocks `from..=to`.
    async fn logs_between(&self, from: u64, to: u64) -> Result<Vec<RegistryLog>>;
}

#[derive(Default)]
struct MemoryRegistryState {
    entities: HashMap<Vk, Arc<Entity>>,
    revoked_entities: HashMap<Vk, bool>,
    dots: HashMap<ObjHash, Arc<Dot>>,
    revoked_dots: HashMap<ObjHash, bool>,
    dots_from: HashMap<Vk, Vec<ObjHash>>,
    chains: HashMap<ObjHash, Arc<DChain>>,
    logs: Vec<RegistryLog>,
    block: u64,
}

/// In-memory [`Registry`] used by tests and registry-less deployments.
///
/// Mutations advance the block counter, append a log and notify block
/// subscribers, mirroring how a chain-backed registry behaves.
pub struct MemoryRegistry {
    state: RwLock<MemoryRegistryState>,
    block_tx: broadcast::Sender<u64>,
}

impl Default for MemoryRegistry {
    fn default() -> MemoryRegistry {
        MemoryRegistry::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> MemoryRegistry {
        let (block_tx, _) = broadcast::channel(BLOCK_CHANNEL_DEPTH);
        MemoryRegistry {
            state: RwLock::new(MemoryRegistryState::default()),
            block_tx,
        }
    }

    fn advance(state: &mut MemoryRegistryState, event: RegistryEvent) -> u64 {
        state.block += 1;
        state.logs.push(RegistryLog {
            block: state.block,
            event,
        });
        state.block
    }

    /// Record an entity.
    pub fn publish_entity(&self, entity: Arc<Entity>) {
        let mut state = self.state.write().expect("registry lock poisoned");
        state.entities.insert(entity.vk(), entity);
    }

    /// Record a DOT and index it under its giver.
    pub fn publish_dot(&self, dot: Arc<Dot>) {
        let block = {
            let mut state = self.state.write().expect("registry lock poisoned");
            let hash = dot.hash();
            state.dots_from.entry(dot.giver()).or_default().push(hash);
            let event = RegistryEvent::DotGranted {
                giver: dot.giver(),
                nsvk: dot.access_mvk(),
                hash,
            };
            state.dots.insert(hash, dot);
            Self::advance(&mut state, event)
        };
        let _ = self.block_tx.send(block);
    }

    /// Record an elaborated chain.
    pub fn publish_chain(&self, chain: Arc<DChain>) {
        let mut state = self.state.write().expect("registry lock poisoned");
        state.chains.insert(chain.chain_hash(), chain);
    }

    /// Revoke an entity and notify subscribers.
    pub fn revoke_entity(&self, vk: Vk) {
        let block = {
            let mut state = self.state.write().expect("registry lock poisoned");
            state.revoked_entities.insert(vk, true);
            Self::advance(&mut state, RegistryEvent::EntityRevoked { vk })
        };
        let _ = self.block_tx.send(block);
    }

    /// Revoke a DOT and notify subscribers.
    pub fn revoke_dot(&self, hash: ObjHash) {
        let block = {
            let mut state = self.state.write().expect("registry lock poisoned");
            state.revoked_dots.insert(hash, true);
            Self::advance(&mut state, RegistryEvent::DotRevoked { hash })
        };
        let _ = self.block_tx.send(block);
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn entity(&self, vk: Vk) -> Result<(Arc<Entity>, ObjectState)> {
        let state = self.state.read().expect("registry lock poisoned");
        let entity = state.entities.get(&vk).cloned().ok_or_else(|| RegistryError::NotFound {
            what: format!("entity {vk}"),
        })?;
        let s = if state.revoked_entities.contains_key(&vk) {
            ObjectState::Revoked
        } else {
            ObjectState::Valid
        };
        Ok((entity, s))
    }

    async fn dot(&self, hash: ObjHash) -> Result<(Arc<Dot>, ObjectState)> {
        let state = self.state.read().expect("registry lock poisoned");
        let dot = state.dots.get(&hash).cloned().ok_or_else(|| RegistryError::NotFound {
            what: format!("dot {hash}"),
        })?;
        let s = if state.revoked_dots.contains_key(&hash) {
            ObjectState::Revoked
        } else {
            ObjectState::Valid
        };
        Ok((dot, s))
    }

    async fn access_dchain(&self, hash: ObjHash) -> Result<(Arc<DChain>, ObjectState)> {
        let state = self.state.read().expect("registry lock poisoned");
        let chain = state.chains.get(&hash).cloned().ok_or_else(|| RegistryError::NotFound {
            what: format!("chain {hash}"),
        })?;
        Ok((chain, ObjectState::Valid))
    }

    async fn dots_from(&self, vk: Vk) -> Result<Vec<ObjHash>> {
        let state = self.state.read().expect("registry lock poisoned");
        Ok(state.dots_from.get(&vk).cloned().unwrap_or_default())
    }

    async fn current_block(&self) -> u64 {
        self.state.read().expect("registry lock poisoned").block
    }

    fn block_events(&self) -> broadcast::Receiver<u64> {
        self.block_tx.subscribe()
    }

    async fn logs_between(&self, from: u64, to: u64) -> Result<Vec<RegistryLog>> {
        let state = self.state.read().expect("registry lock poisoned");
        Ok(state.logs.iter().filter(|l| l.block >= from && l.block <= to).cloned().collect())
    }
}
