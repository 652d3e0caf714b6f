//! Resolution-cache and chain-builder behavior against the in-memory
//! registry.

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bosswave_core::MessageType;
use bosswave_core::Resolver;
use bosswave_core::analyze_access_chain;
use bosswave_crypto::EVERYBODY;
use bosswave_crypto::Keypair;
use bosswave_crypto::ObjHash;
use bosswave_crypto::Vk;
use bosswave_objects::DChain;
use bosswave_objects::Dot;
use bosswave_objects::DotBuilder;
use bosswave_objects::Entity;
use bosswave_objects::EntityBuilder;
use bosswave_objects::ObjectState;
use bosswave_objects::PermissionSet;
use bosswave_resolver::ChainBuildParams;
use bosswave_resolver::ChainBuilder;
use bosswave_resolver::MemoryRegistry;
use bosswave_resolver::Registry;
use bosswave_resolver::Resolution;
use chrono::Duration;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Wraps a registry and counts DOT lookups, to prove cache hits.
struct CountingRegistry {
    inner: MemoryRegistry,
    dot_calls: AtomicUsize,
}

impl CountingRegistry {
    fn new(inner: MemoryRegistry) -> CountingRegistry {
        CountingRegistry {
            inner,
            dot_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Registry for CountingRegistry {
    async fn entity(&self, vk: Vk) -> bosswave_resolver::registry::Result<(Arc<Entity>, ObjectState)> {
        self.inner.entity(vk).await
    }

    async fn dot(&self, hash: ObjHash) -> bosswave_resolver::registry::Result<(Arc<Dot>, ObjectState)> {
        self.dot_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.dot(hash).await
    }

    async fn access_dchain(&self, hash: ObjHash) -> bosswave_resolver::registry::Result<(Arc<DChain>, ObjectState)> {
        self.inner.access_dchain(hash).await
    }

    async fn dots_from(&self, vk: Vk) -> bosswave_resolver::registry::Result<Vec<ObjHash>> {
        self.inner.dots_from(vk).await
    }

    async fn current_block(&self) -> u64 {
        self.inner.current_block().await
    }

    fn block_events(&self) -> tokio::sync::broadcast::Receiver<u64> {
        self.inner.block_events()
    }

    async fn logs_between(&self, from: u64, to: u64) -> bosswave_resolver::registry::Result<Vec<bosswave_resolver::RegistryLog>> {
        self.inner.logs_between(from, to).await
    }
}

struct World {
    registry: Arc<CountingRegistry>,
    resolution: Arc<Resolution>,
    ns: Keypair,
    alice: Keypair,
    bob: Keypair,
    ns_to_alice: Arc<Dot>,
    alice_to_bob: Arc<Dot>,
}

/// ns -> alice (C*P on a/*), alice -> bob (C on a/b/+), entities for all.
fn world(seed: u64) -> World {
    let mut rng = StdRng::seed_from_u64(seed);
    let registry = MemoryRegistry::new();

    let mut actor = |rng: &mut StdRng| {
        let (entity, kp) = EntityBuilder::new().build(rng);
        registry.publish_entity(Arc::new(entity));
        kp
    };
    let ns = actor(&mut rng);
    let alice = actor(&mut rng);
    let bob = actor(&mut rng);

    let ns_to_alice = Arc::new(
        DotBuilder::access(ns.vk(), alice.vk(), ns.vk(), "a/*", PermissionSet::parse("C*P").unwrap())
            .ttl(5)
            .build(&ns)
            .unwrap(),
    );
    let alice_to_bob = Arc::new(
        DotBuilder::access(alice.vk(), bob.vk(), ns.vk(), "a/b/+", PermissionSet::parse("C").unwrap())
            .ttl(5)
            .build(&alice)
            .unwrap(),
    );
    registry.publish_dot(ns_to_alice.clone());
    registry.publish_dot(alice_to_bob.clone());

    let registry = Arc::new(CountingRegistry::new(registry));
    let resolution = Resolution::new(registry.clone());
    World {
        registry,
        resolution,
        ns,
        alice,
        bob,
        ns_to_alice,
        alice_to_bob,
    }
}

#[tokio::test]
async fn test_dot_resolution_is_cached() {
    let w = world(1);
    let hash = w.ns_to_alice.hash();
    let (_, s1) = w.resolution.resolve_dot(hash).await.unwrap();
    assert_eq!(s1, ObjectState::Valid);
    let calls_after_first = w.registry.dot_calls.load(Ordering::SeqCst);
    let (_, s2) = w.resolution.resolve_dot(hash).await.unwrap();
    assert_eq!(s2, ObjectState::Valid);
    assert_eq!(w.registry.dot_calls.load(Ordering::SeqCst), calls_after_first, "second lookup must hit the cache");
}

#[tokio::test]
async fn test_entity_revocation_pins_dependent_dots() {
    let w = world(2);
    let hash = w.ns_to_alice.hash();
    // Warm the cache.
    let (_, s) = w.resolution.resolve_dot(hash).await.unwrap();
    assert_eq!(s, ObjectState::Valid);

    // Revoke the giver and let the tail reader apply the event.
    w.registry.inner.revoke_entity(w.ns.vk());
    w.resolution.consume_registry_tail().await.unwrap();

    let calls_before = w.registry.dot_calls.load(Ordering::SeqCst);
    let (_, s) = w.resolution.resolve_dot(hash).await.unwrap();
    assert_eq!(s, ObjectState::Revoked);
    assert_eq!(w.registry.dot_calls.load(Ordering::SeqCst), calls_before, "revoked state must come from the cache");
}

#[tokio::test]
async fn test_dot_revocation_pins_state() {
    let w = world(3);
    let hash = w.alice_to_bob.hash();
    w.resolution.resolve_dot(hash).await.unwrap();
    w.registry.inner.revoke_dot(hash);
    w.resolution.consume_registry_tail().await.unwrap();
    let (_, s) = w.resolution.resolve_dot(hash).await.unwrap();
    assert_eq!(s, ObjectState::Revoked);
}

#[tokio::test]
async fn test_unresolved_giver_entity_degrades_dot() {
    // A DOT whose giver entity the registry does not know cannot be Valid.
    let mut rng = StdRng::seed_from_u64(4);
    let registry = MemoryRegistry::new();
    let ghost = Keypair::generate(&mut rng);
    let (receiver_entity, receiver) = EntityBuilder::new().build(&mut rng);
    registry.publish_entity(Arc::new(receiver_entity));
    let dot = Arc::new(
        DotBuilder::access(ghost.vk(), receiver.vk(), ghost.vk(), "x", PermissionSet::parse("C").unwrap())
            .build(&ghost)
            .unwrap(),
    );
    registry.publish_dot(dot.clone());
    let resolution = Resolution::new(Arc::new(registry));
    assert!(resolution.resolve_dot(dot.hash()).await.is_err());
}

#[tokio::test]
async fn test_expiry_sweep_flushes() {
    let mut rng = StdRng::seed_from_u64(5);
    let registry = MemoryRegistry::new();
    let (ns_entity, ns) = EntityBuilder::new().build(&mut rng);
    let (short_entity, short) = EntityBuilder::new().expires_in(Duration::milliseconds(300)).build(&mut rng);
    registry.publish_entity(Arc::new(ns_entity));
    registry.publish_entity(Arc::new(short_entity));
    let dot = Arc::new(
        DotBuilder::access(ns.vk(), short.vk(), ns.vk(), "x", PermissionSet::parse("C").unwrap())
            .expires_in(Duration::milliseconds(300))
            .build(&ns)
            .unwrap(),
    );
    registry.publish_dot(dot.clone());

    let resolution = Resolution::new(Arc::new(registry));
    let (_, s) = resolution.resolve_dot(dot.hash()).await.unwrap();
    assert_eq!(s, ObjectState::Valid);

    // Let everything lapse, then sweep: the cache drops the expired
    // objects and a fresh resolve reports the expiry.
    tokio::time::sleep(std::time::Duration::from_millis(450)).await;
    resolution.sweep_expired(Utc::now());
    let (_, s) = resolution.resolve_dot(dot.hash()).await.unwrap();
    assert_eq!(s, ObjectState::Expired);
}

#[tokio::test]
async fn test_chain_builder_finds_delegated_path() {
    let w = world(6);
    let builder = ChainBuilder::new(
        w.resolution.clone(),
        ChainBuildParams {
            nsvk: w.ns.vk(),
            uri_suffix: "a/b/x".to_string(),
            perms: PermissionSet::parse("C").unwrap(),
            target: w.bob.vk(),
        },
    );
    let chains = builder.build().await.unwrap();
    assert_eq!(chains.len(), 1);
    let chain = &chains[0];
    assert_eq!(chain.num_hashes(), Some(2));

    // A built chain must pass analysis for a compatible operation, with
    // at least the requested permissions.
    let analysis = analyze_access_chain(MessageType::Subscribe, "a/b/x", chain).unwrap();
    assert_eq!(analysis.origin_vk, w.bob.vk());
    assert!(PermissionSet::parse("C").unwrap().is_subset_of(&analysis.permissions));
}

#[tokio::test]
async fn test_chain_builder_direct_and_cache() {
    let w = world(7);
    let params = ChainBuildParams {
        nsvk: w.ns.vk(),
        uri_suffix: "a/q".to_string(),
        perms: PermissionSet::parse("P").unwrap(),
        target: w.alice.vk(),
    };
    let chains = ChainBuilder::new(w.resolution.clone(), params.clone()).build().await.unwrap();
    assert_eq!(chains.len(), 1);
    assert_eq!(chains[0].num_hashes(), Some(1));

    // Second build answers from the built-chain cache.
    let again = ChainBuilder::new(w.resolution.clone(), params).build().await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].chain_hash(), chains[0].chain_hash());
}

#[tokio::test]
async fn test_chain_builder_respects_permission_filter() {
    let w = world(8);
    // Bob only ever received C; asking for P yields nothing.
    let chains = ChainBuilder::new(
        w.resolution.clone(),
        ChainBuildParams {
            nsvk: w.ns.vk(),
            uri_suffix: "a/b/x".to_string(),
            perms: PermissionSet::parse("P").unwrap(),
            target: w.bob.vk(),
        },
    )
    .build()
    .await
    .unwrap();
    assert!(chains.is_empty());
}

#[tokio::test]
async fn test_chain_builder_everybody_terminal() {
    let mut rng = StdRng::seed_from_u64(9);
    let registry = MemoryRegistry::new();
    let (ns_entity, ns) = EntityBuilder::new().build(&mut rng);
    let stranger = Keypair::generate(&mut rng);
    registry.publish_entity(Arc::new(ns_entity));
    let open = Arc::new(
        DotBuilder::access(ns.vk(), EVERYBODY, ns.vk(), "pub/*", PermissionSet::parse("C+").unwrap())
            .ttl(1)
            .build(&ns)
            .unwrap(),
    );
    registry.publish_dot(open);
    let resolution = Resolution::new(Arc::new(registry));

    // An open grant satisfies any target.
    let chains = ChainBuilder::new(
        resolution,
        ChainBuildParams {
            nsvk: ns.vk(),
            uri_suffix: "pub/feed".to_string(),
            perms: PermissionSet::parse("C").unwrap(),
            target: stranger.vk(),
        },
    )
    .build()
    .await
    .unwrap();
    assert_eq!(chains.len(), 1);
}

#[tokio::test]
async fn test_new_dot_invalidates_built_chains() {
    let w = world(10);
    let params = ChainBuildParams {
        nsvk: w.ns.vk(),
        uri_suffix: "a/b/x".to_string(),
        perms: PermissionSet::parse("C").unwrap(),
        target: w.bob.vk(),
    };
    let first = ChainBuilder::new(w.resolution.clone(), params.clone()).build().await.unwrap();
    assert_eq!(first.len(), 1);

    // A second, direct grant ns -> bob lands in the registry.
    let direct = Arc::new(
        DotBuilder::access(w.ns.vk(), w.bob.vk(), w.ns.vk(), "a/*", PermissionSet::parse("C*").unwrap())
            .ttl(5)
            .build(&w.ns)
            .unwrap(),
    );
    w.registry.inner.publish_dot(direct);
    w.resolution.consume_registry_tail().await.unwrap();

    // The cache was flushed; the rebuild discovers both paths.
    let rebuilt = ChainBuilder::new(w.resolution.clone(), params).build().await.unwrap();
    assert_eq!(rebuilt.len(), 2);
}
