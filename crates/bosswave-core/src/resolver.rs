//! The resolver seam consumed by message verification.
//!
//! Verification needs entities, DOTs and chains by identifier; where they
//! come from (cache, registry) is the resolver implementation's concern.
//! No resolver call may be made while holding a lock: implementations
//! perform registry I/O.

use std::sync::Arc;

use async_trait::async_trait;
use bosswave_crypto::ObjHash;
use bosswave_crypto::Vk;
use bosswave_objects::DChain;
use bosswave_objects::Dot;
use bosswave_objects::Entity;
use bosswave_objects::ObjectState;

use crate::error::Result;

/// A DOT paired with its registry-reported state.
#[derive(Debug, Clone)]
pub struct DotLink {
    pub dot: Arc<Dot>,
    pub state: ObjectState,
}

/// Lookup interface for trust objects.
///
/// Errors are reserved for registry/contract failures; revocation and
/// expiry are reported through [`ObjectState`].
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve an entity and its state by VK.
    async fn resolve_entity(&self, vk: Vk) -> Result<(Arc<Entity>, ObjectState)>;

    /// Resolve a DOT and its state by hash.
    async fn resolve_dot(&self, hash: ObjHash) -> Result<(Arc<Dot>, ObjectState)>;

    /// Resolve an access chain by chain hash, elaborated.
    async fn resolve_access_dchain(&self, hash: ObjHash) -> Result<(Arc<DChain>, ObjectState)>;

    /// All access DOTs granted by `vk`, with their states.
    async fn resolve_dots_from(&self, vk: Vk) -> Result<Vec<DotLink>>;
}
