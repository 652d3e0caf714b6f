//! The resolution cache: memoized entities, DOTs, granted-DOT lists and
//! built chains, with invariant-driven invalidation.
//!
//! All maps live under one coarse `std::sync::RwLock`. The lock is never
//! held across registry I/O: lookups read-check, drop the lock, await the
//! registry and then upgrade to insert.
//!
//! Invalidation invariants:
//! - entity revocation/expiry flushes the entity and every cached DOT it
//!   gives or receives;
//! - DOT revocation/expiry flushes that DOT;
//! - a new DOT from a VK flushes that VK's granted-from caches and the
//!   built chains of the DOT's namespace.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bosswave_core::CoreError;
use bosswave_core::DotLink;
use bosswave_core::Resolver;
use bosswave_crypto::ObjHash;
use bosswave_crypto::Vk;
use bosswave_objects::DChain;
use bosswave_objects::Dot;
use bosswave_objects::Entity;
use bosswave_objects::ObjectState;
use bosswave_objects::combine_states;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::registry::Registry;
use crate::registry::RegistryEvent;

/// Upper bound on how long the expiry sweep sleeps with nothing due.
const SWEEP_IDLE: Duration = Duration::from_secs(3600);
/// Lower bound between sweeps.
const SWEEP_MIN: Duration = Duration::from_secs(1);

/// Key of the built-chain cache inside one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainKey {
    pub target: Vk,
    pub uri: String,
    /// Canonical permission-string form of the desired set.
    pub perms: String,
}

#[derive(Default)]
struct CacheState {
    entities: HashMap<Vk, (Arc<Entity>, ObjectState)>,
    dots: HashMap<ObjHash, (Arc<Dot>, ObjectState)>,
    /// Opportunistic giver index: DOTs that happen to be cached.
    dots_from: HashMap<Vk, Vec<ObjHash>>,
    /// Complete giver index: everything the registry reported for a VK.
    dots_from_complete: HashMap<Vk, Vec<ObjHash>>,
    /// Receiver index, used for entity invalidation.
    dots_to: HashMap<Vk, Vec<ObjHash>>,
    /// nsvk -> key -> built chains.
    chains: HashMap<Vk, HashMap<ChainKey, Vec<Arc<DChain>>>>,
    last_block: u64,
}

/// The registry-backed resolution layer.
pub struct Resolution {
    registry: Arc<dyn Registry>,
    state: RwLock<CacheState>,
    expiry_wake: OnceLock<mpsc::Sender<()>>,
}

impl Resolution {
    pub fn new(registry: Arc<dyn Registry>) -> Arc<Resolution> {
        Arc::new(Resolution {
            registry,
            state: RwLock::new(CacheState::default()),
            expiry_wake: OnceLock::new(),
        })
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Cache maintenance
    // ------------------------------------------------------------------

    /// Drop a cached entity and every cached DOT touching it.
    pub fn flush_entity(&self, vk: Vk) {
        let mut state = self.state.write().expect("cache lock poisoned");
        state.entities.remove(&vk);
        for hash in state.dots_to.remove(&vk).unwrap_or_default() {
            state.dots.remove(&hash);
        }
        for hash in state.dots_from.remove(&vk).unwrap_or_default() {
            state.dots.remove(&hash);
        }
        debug!(%vk, "flushed entity and dependent DOTs");
    }

    /// Drop one cached DOT. The giver/receiver indexes keep their stale
    /// hash entries; they only drive flushes, not lookups.
    pub fn flush_dot(&self, hash: ObjHash) {
        let mut state = self.state.write().expect("cache lock poisoned");
        state.dots.remove(&hash);
    }

    /// Entity revocation is permanent: keep the entity and its dependent
    /// DOTs cached, pinned to `Revoked`, so later lookups answer without
    /// a registry round-trip.
    pub fn mark_entity_revoked(&self, vk: Vk) {
        let mut state = self.state.write().expect("cache lock poisoned");
        if let Some(entry) = state.entities.get_mut(&vk) {
            entry.1 = ObjectState::Revoked;
        }
        let dependents: Vec<ObjHash> = state
            .dots_to
            .get(&vk)
            .into_iter()
            .chain(state.dots_from.get(&vk))
            .flatten()
            .copied()
            .collect();
        for hash in dependents {
            if let Some(entry) = state.dots.get_mut(&hash) {
                entry.1 = ObjectState::Revoked;
            }
        }
        debug!(%vk, "pinned entity and dependent DOTs revoked");
    }

    /// DOT revocation is permanent: pin the cached state.
    pub fn mark_dot_revoked(&self, hash: ObjHash) {
        let mut state = self.state.write().expect("cache lock poisoned");
        if let Some(entry) = state.dots.get_mut(&hash) {
            entry.1 = ObjectState::Revoked;
        }
    }

    /// A new DOT appeared from `vk`: the complete granted-from answer is
    /// out of date. The opportunistic giver index stays — it only drives
    /// invalidation and picks the new DOT up when it is cached.
    pub fn flush_granted_from(&self, vk: Vk) {
        let mut state = self.state.write().expect("cache lock poisoned");
        state.dots_from_complete.remove(&vk);
    }

    /// A new DOT appeared under `nsvk`: built chains there may now be
    /// incomplete answers.
    pub fn flush_chains_under(&self, nsvk: Vk) {
        let mut state = self.state.write().expect("cache lock poisoned");
        state.chains.remove(&nsvk);
    }

    /// Cached built chains for a key, with every member DOT's state
    /// rechecked (a chain is only as good as its worst DOT).
    pub async fn lookup_chains(&self, nsvk: Vk, key: &ChainKey) -> Option<Vec<(Arc<DChain>, ObjectState)>> {
        let chains = {
            let state = self.state.read().expect("cache lock poisoned");
            state.chains.get(&nsvk)?.get(key)?.clone()
        };
        let mut out = Vec::with_capacity(chains.len());
        for chain in chains {
            let mut cs = ObjectState::Valid;
            for hash in chain.dot_hashes() {
                match self.resolve_dot(*hash).await {
                    Ok((_, ds)) => cs = combine_states(cs, ds),
                    Err(_) => cs = ObjectState::Error,
                }
                if cs != ObjectState::Valid {
                    break;
                }
            }
            out.push((chain, cs));
        }
        Some(out)
    }

    /// Remember built chains for a key.
    pub fn cache_chains(&self, nsvk: Vk, key: ChainKey, chains: Vec<Arc<DChain>>) {
        let mut state = self.state.write().expect("cache lock poisoned");
        state.chains.entry(nsvk).or_default().insert(key, chains);
    }

    /// Wake the expiry sweep out of its timer, if it is running.
    pub fn force_expiry_sweep(&self) {
        if let Some(tx) = self.expiry_wake.get() {
            let _ = tx.try_send(());
        }
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Spawn the expiry sweep and the registry tail reader.
    ///
    /// The sweep recomputes the soonest expiry among cached objects and
    /// re-runs at that time or on a forced wake. The tail reader consumes
    /// new-block notifications and flushes caches per the invalidation
    /// invariants.
    pub async fn start_tasks(self: Arc<Resolution>) -> (JoinHandle<()>, JoinHandle<()>) {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        // First start wins; a second call reuses the original channel.
        let _ = self.expiry_wake.set(wake_tx);

        let current = self.registry.current_block().await;
        {
            let mut state = self.state.write().expect("cache lock poisoned");
            state.last_block = current;
        }

        let sweep = tokio::spawn(Self::expiry_sweep_loop(self.clone(), wake_rx));
        let tail = tokio::spawn(Self::registry_tail_loop(self.clone()));
        (sweep, tail)
    }

    async fn expiry_sweep_loop(this: Arc<Resolution>, mut wake: mpsc::Receiver<()>) {
        let mut next = SWEEP_IDLE;
        loop {
            tokio::select! {
                _ = wake.recv() => {}
                _ = tokio::time::sleep(next) => {}
            }
            next = this.sweep_expired(Utc::now());
        }
    }

    /// Flush everything expired at `now`; return the delay until the next
    /// soonest expiry.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Duration {
        let mut expired_entities: Vec<Vk> = Vec::new();
        let mut expired_dots: Vec<ObjHash> = Vec::new();
        let mut soonest: Option<DateTime<Utc>> = None;
        {
            let state = self.state.read().expect("cache lock poisoned");
            for (vk, (entity, _)) in &state.entities {
                if entity.is_expired_at(now) {
                    expired_entities.push(*vk);
                } else if let Some(e) = entity.expires() {
                    soonest = Some(soonest.map_or(e, |s| s.min(e)));
                }
            }
            for (hash, (dot, _)) in &state.dots {
                if dot.is_expired_at(now) {
                    expired_dots.push(*hash);
                } else if let Some(e) = dot.expires() {
                    soonest = Some(soonest.map_or(e, |s| s.min(e)));
                }
            }
        }
        if !expired_entities.is_empty() || !expired_dots.is_empty() {
            info!(entities = expired_entities.len(), dots = expired_dots.len(), "expiry sweep flushing");
        }
        for vk in expired_entities {
            self.flush_entity(vk);
        }
        for hash in expired_dots {
            self.flush_dot(hash);
        }
        match soonest {
            Some(at) => {
                let delta = (at - now).to_std().unwrap_or(SWEEP_MIN);
                delta.clamp(SWEEP_MIN, SWEEP_IDLE)
            }
            None => SWEEP_IDLE,
        }
    }

    async fn registry_tail_loop(this: Arc<Resolution>) {
        let mut events = this.registry.block_events();
        loop {
            match events.recv().await {
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if let Err(e) = this.consume_registry_tail().await {
                        warn!(error = %e, "registry tail read failed");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("registry block feed closed, tail reader exiting");
                    return;
                }
            }
        }
    }

    /// Read logs since the last seen block and apply their invalidations.
    pub async fn consume_registry_tail(&self) -> Result<(), crate::registry::RegistryError> {
        let current = self.registry.current_block().await;
        let last = {
            let state = self.state.read().expect("cache lock poisoned");
            state.last_block
        };
        if current == last {
            return Ok(());
        }
        let logs = self.registry.logs_between(last + 1, current).await?;
        {
            let mut state = self.state.write().expect("cache lock poisoned");
            state.last_block = current;
        }
        for log in logs {
            match log.event {
                RegistryEvent::DotGranted { giver, nsvk, hash } => {
                    debug!(%giver, %hash, "tail: new DOT");
                    self.flush_granted_from(giver);
                    if let Some(nsvk) = nsvk {
                        self.flush_chains_under(nsvk);
                    }
                }
                RegistryEvent::DotRevoked { hash } => {
                    debug!(%hash, "tail: DOT revoked");
                    self.mark_dot_revoked(hash);
                }
                RegistryEvent::EntityRevoked { vk } => {
                    debug!(%vk, "tail: entity revoked");
                    self.mark_entity_revoked(vk);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup internals
    // ------------------------------------------------------------------

    fn entity_from_cache(&self, vk: Vk) -> Option<(Arc<Entity>, ObjectState)> {
        let state = self.state.read().expect("cache lock poisoned");
        state.entities.get(&vk).cloned()
    }

    fn dot_from_cache(&self, hash: ObjHash) -> Option<(Arc<Dot>, ObjectState)> {
        // A state cached here is trustworthy: any entity change would
        // have flushed the DOT.
        let state = self.state.read().expect("cache lock poisoned");
        state.dots.get(&hash).cloned()
    }

    fn cache_entity(&self, entity: Arc<Entity>, s: ObjectState) {
        let mut state = self.state.write().expect("cache lock poisoned");
        state.entities.insert(entity.vk(), (entity, s));
    }

    fn cache_dot(&self, dot: Arc<Dot>, s: ObjectState) {
        let mut state = self.state.write().expect("cache lock poisoned");
        let hash = dot.hash();
        let giver = dot.giver();
        let receiver = dot.receiver();
        let fresh = !state.dots_from.get(&giver).is_some_and(|v| v.contains(&hash));
        state.dots.insert(hash, (dot, s));
        // The giver and receiver indexes stay in step: a hash missing
        // from one is missing from both.
        if fresh {
            state.dots_from.entry(giver).or_default().push(hash);
            state.dots_to.entry(receiver).or_default().push(hash);
        }
    }

    /// Registry miss path for a DOT: combine in both entity states and
    /// the DOT's own expiry, as the contract may not.
    async fn dot_from_registry(&self, hash: ObjHash) -> bosswave_core::Result<(Arc<Dot>, ObjectState)> {
        let (dot, contract_state) = self.registry.dot(hash).await.map_err(|e| CoreError::Unresolvable {
            what: format!("dot {hash}: {e}"),
        })?;
        let mut s = contract_state;
        if s == ObjectState::Valid {
            let (_, giver_state) = self.resolve_entity(dot.giver()).await?;
            s = combine_states(s, giver_state);
        }
        if s == ObjectState::Valid && !dot.receiver().is_everybody() {
            let (_, receiver_state) = self.resolve_entity(dot.receiver()).await?;
            s = combine_states(s, receiver_state);
        }
        if s == ObjectState::Valid && dot.is_expired_at(Utc::now()) {
            s = ObjectState::Expired;
        }
        Ok((dot, s))
    }
}

#[async_trait]
impl Resolver for Resolution {
    async fn resolve_entity(&self, vk: Vk) -> bosswave_core::Result<(Arc<Entity>, ObjectState)> {
        if let Some(hit) = self.entity_from_cache(vk) {
            return Ok(hit);
        }
        let (entity, mut s) = self.registry.entity(vk).await.map_err(|e| CoreError::Unresolvable {
            what: format!("entity {vk}: {e}"),
        })?;
        if s == ObjectState::Valid && entity.is_expired_at(Utc::now()) {
            s = ObjectState::Expired;
        }
        self.cache_entity(entity.clone(), s);
        Ok((entity, s))
    }

    async fn resolve_dot(&self, hash: ObjHash) -> bosswave_core::Result<(Arc<Dot>, ObjectState)> {
        if let Some(hit) = self.dot_from_cache(hash) {
            return Ok(hit);
        }
        let (dot, s) = self.dot_from_registry(hash).await?;
        self.cache_dot(dot.clone(), s);
        Ok((dot, s))
    }

    async fn resolve_access_dchain(&self, hash: ObjHash) -> bosswave_core::Result<(Arc<DChain>, ObjectState)> {
        let (chain, contract_state) = self.registry.access_dchain(hash).await.map_err(|e| CoreError::Unresolvable {
            what: format!("chain {hash}: {e}"),
        })?;
        let mut s = contract_state;
        if s == ObjectState::Valid {
            // A chain is only as valid as its DOTs.
            for dh in chain.dot_hashes() {
                let (_, ds) = self.resolve_dot(*dh).await?;
                s = combine_states(s, ds);
                if s != ObjectState::Valid {
                    break;
                }
            }
        }
        Ok((chain, s))
    }

    async fn resolve_dots_from(&self, vk: Vk) -> bosswave_core::Result<Vec<DotLink>> {
        let cached = {
            let state = self.state.read().expect("cache lock poisoned");
            state.dots_from_complete.get(&vk).cloned()
        };
        let hashes = match cached {
            Some(hashes) => hashes,
            None => {
                let hashes = self.registry.dots_from(vk).await.map_err(|e| CoreError::Unresolvable {
                    what: format!("dots from {vk}: {e}"),
                })?;
                let mut state = self.state.write().expect("cache lock poisoned");
                state.dots_from_complete.insert(vk, hashes.clone());
                hashes
            }
        };
        let mut links = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let (dot, state) = self.resolve_dot(hash).await?;
            links.push(DotLink { dot, state });
        }
        Ok(links)
    }
}
