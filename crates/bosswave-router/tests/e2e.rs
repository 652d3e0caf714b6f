//! End-to-end router scenarios: local publish/subscribe through the full
//! pipeline, chain reduction, persist/query/list, and affinity
//! forwarding to a peer router.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bosswave_core::CoreError;
use bosswave_core::Delivery;
use bosswave_core::ElaboratePac;
use bosswave_core::MemoryStore;
use bosswave_core::MessageType;
use bosswave_core::SubHandler;
use bosswave_crypto::Keypair;
use bosswave_objects::DChain;
use bosswave_objects::DotBuilder;
use bosswave_objects::EntityBuilder;
use bosswave_objects::PayloadObject;
use bosswave_objects::PermissionSet;
use bosswave_peer::Frame;
use bosswave_peer::MemoryTransport;
use bosswave_peer::PeerLink;
use bosswave_peer::transport::MemoryServerEnd;
use bosswave_resolver::MemoryRegistry;
use bosswave_resolver::Resolution;
use bosswave_router::PublishParams;
use bosswave_router::QueryParams;
use bosswave_router::Router;
use bosswave_router::RouterClient;
use bosswave_router::SubscribeParams;
use bosswave_router::ListParams;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

struct World {
    registry: Arc<MemoryRegistry>,
    router: Arc<Router>,
    ns: Keypair,
    alice: Keypair,
    bob: Keypair,
    /// ns -> alice: C*P on a/*.
    alice_chain: Arc<DChain>,
    /// ns -> alice -> bob: reduced to C+ on a/b/+.
    bob_chain: Arc<DChain>,
}

fn world(seed: u64) -> World {
    let mut rng = StdRng::seed_from_u64(seed);
    let registry = Arc::new(MemoryRegistry::new());

    let mut actor = |rng: &mut StdRng| {
        let (entity, kp) = EntityBuilder::new().build(rng);
        registry.publish_entity(Arc::new(entity));
        kp
    };
    let ns = actor(&mut rng);
    let alice = actor(&mut rng);
    let bob = actor(&mut rng);

    let ns_to_alice = Arc::new(
        DotBuilder::access(ns.vk(), alice.vk(), ns.vk(), "a/*", PermissionSet::parse("C*T*P").unwrap())
            .ttl(5)
            .build(&ns)
            .unwrap(),
    );
    let alice_to_bob = Arc::new(
        DotBuilder::access(alice.vk(), bob.vk(), ns.vk(), "a/b/+", PermissionSet::parse("C+").unwrap())
            .ttl(5)
            .build(&alice)
            .unwrap(),
    );
    registry.publish_dot(ns_to_alice.clone());
    registry.publish_dot(alice_to_bob.clone());

    let alice_chain = Arc::new(DChain::from_dots(true, vec![ns_to_alice.clone()]).unwrap());
    let bob_chain = Arc::new(DChain::from_dots(true, vec![ns_to_alice, alice_to_bob]).unwrap());
    registry.publish_chain(alice_chain.clone());
    registry.publish_chain(bob_chain.clone());

    let resolution = Resolution::new(registry.clone());
    let router = Router::new(
        ns.clone(),
        vec![ns.vk()],
        resolution,
        Arc::new(MemoryStore::new()),
        HashMap::new(),
    );

    World {
        registry,
        router,
        ns,
        alice,
        bob,
        alice_chain,
        bob_chain,
    }
}

fn recorder() -> (SubHandler, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: SubHandler = Arc::new(move |d| {
        let _ = tx.send(d);
    });
    (handler, rx)
}

async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("delivery timeout").expect("channel open")
}

#[tokio::test]
async fn test_trivial_publish_delivery() {
    let w = world(1);

    // Bob subscribes to a/+ ... his grant only covers a/b/+, so use that.
    let subscriber = RouterClient::new(w.router.clone(), w.bob.clone());
    let (handler, mut deliveries) = recorder();
    let sub = subscriber
        .subscribe(
            SubscribeParams {
                mvk: w.ns.vk(),
                uri_suffix: "a/b/+".to_string(),
                primary_access_chain: Some(w.bob_chain.clone()),
                elaborate_pac: ElaboratePac::Partial,
                verify: true,
                ..SubscribeParams::default()
            },
            handler,
        )
        .await
        .unwrap();
    assert!(sub.is_new);

    // Alice publishes a payload under a/b/x.
    let publisher = RouterClient::new(w.router.clone(), w.alice.clone());
    let outcome = publisher
        .publish(PublishParams {
            mvk: w.ns.vk(),
            uri_suffix: "a/b/x".to_string(),
            primary_access_chain: Some(w.alice_chain.clone()),
            payload_objects: vec![PayloadObject::new(0x0102_0304, b"hello floor".to_vec()).unwrap()],
            elaborate_pac: ElaboratePac::Partial,
            verify: true,
            ..PublishParams::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.matched, 1);

    match next_delivery(&mut deliveries).await {
        Delivery::Message { msg, subid } => {
            assert_eq!(subid, sub.subid);
            assert_eq!(msg.topic_suffix, "a/b/x");
            assert_eq!(msg.topic, format!("{}/a/b/x", w.ns.vk().to_base64()));
            assert_eq!(msg.payload_objects[0].content(), b"hello floor");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_chain_reduction_gates_publish() {
    let w = world(2);
    let bob = RouterClient::new(w.router.clone(), w.bob.clone());

    // Subscribe through the reduced chain succeeds.
    let (handler, _rx) = recorder();
    bob.subscribe(
        SubscribeParams {
            mvk: w.ns.vk(),
            uri_suffix: "a/b/x".to_string(),
            primary_access_chain: Some(w.bob_chain.clone()),
            elaborate_pac: ElaboratePac::Partial,
            verify: true,
            ..SubscribeParams::default()
        },
        handler,
    )
    .await
    .unwrap();

    // Publish was reduced away by the second link.
    let err = bob
        .publish(PublishParams {
            mvk: w.ns.vk(),
            uri_suffix: "a/b/x".to_string(),
            primary_access_chain: Some(w.bob_chain.clone()),
            elaborate_pac: ElaboratePac::Partial,
            verify: true,
            ..PublishParams::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::BadPermissions { .. }));
}

#[tokio::test]
async fn test_consumer_limit_fanout() {
    let w = world(3);

    // Three subscribers on the same concrete topic.
    let mut rxs = Vec::new();
    for _ in 0..3 {
        let client = RouterClient::new(w.router.clone(), w.bob.clone());
        let (handler, rx) = recorder();
        client
            .subscribe(
                SubscribeParams {
                    mvk: w.ns.vk(),
                    uri_suffix: "a/b/x".to_string(),
                    primary_access_chain: Some(w.bob_chain.clone()),
                    elaborate_pac: ElaboratePac::Partial,
                    verify: true,
                    ..SubscribeParams::default()
                },
                handler,
            )
            .await
            .unwrap();
        rxs.push(rx);
    }

    let alice = RouterClient::new(w.router.clone(), w.alice.clone());
    let outcome = alice
        .publish(PublishParams {
            mvk: w.ns.vk(),
            uri_suffix: "a/b/x".to_string(),
            primary_access_chain: Some(w.alice_chain.clone()),
            consumers: 1,
            elaborate_pac: ElaboratePac::Partial,
            verify: true,
            ..PublishParams::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.matched, 3);
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.residual_consumers, 0);

    // Exactly one subscriber got it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let hits: usize = rxs.iter_mut().map(|rx| rx.try_recv().is_ok() as usize).sum();
    assert_eq!(hits, 1);
}

#[tokio::test]
async fn test_persist_query_list() {
    let w = world(4);
    let alice = RouterClient::new(w.router.clone(), w.alice.clone());

    for suffix in ["a/b/x", "a/b/y"] {
        alice
            .publish(PublishParams {
                mvk: w.ns.vk(),
                uri_suffix: suffix.to_string(),
                primary_access_chain: Some(w.alice_chain.clone()),
                payload_objects: vec![PayloadObject::new(0x0101_0101, suffix.as_bytes().to_vec()).unwrap()],
                elaborate_pac: ElaboratePac::Partial,
                verify: true,
                persist: true,
                ..PublishParams::default()
            })
            .await
            .unwrap();
    }

    // Query re-parses and re-verifies each stored message.
    let mut results = alice
        .query(QueryParams {
            mvk: w.ns.vk(),
            uri_suffix: "a/b/+".to_string(),
            primary_access_chain: Some(w.alice_chain.clone()),
            elaborate_pac: ElaboratePac::Partial,
            verify: true,
            ..QueryParams::default()
        })
        .await
        .unwrap();
    let mut topics = Vec::new();
    while let Some(m) = results.recv().await {
        assert_eq!(m.mtype, MessageType::Persist);
        topics.push(m.topic_suffix);
    }
    topics.sort();
    assert_eq!(topics, vec!["a/b/x".to_string(), "a/b/y".to_string()]);

    // List enumerates the immediate children actually persisted.
    let mut kids = alice
        .list(ListParams {
            mvk: w.ns.vk(),
            uri_suffix: "a/b".to_string(),
            primary_access_chain: Some(w.alice_chain.clone()),
            elaborate_pac: ElaboratePac::Partial,
            verify: false,
            ..ListParams::default()
        })
        .await
        .unwrap();
    let mut out = Vec::new();
    while let Some(k) = kids.recv().await {
        out.push(k);
    }
    out.sort();
    let prefix = format!("{}/a/b", w.ns.vk().to_base64());
    assert_eq!(out, vec![format!("{prefix}/x"), format!("{prefix}/y")]);
}

#[tokio::test]
async fn test_unsubscribe_ends_subscription() {
    let w = world(5);
    let bob = RouterClient::new(w.router.clone(), w.bob.clone());
    let (handler, mut deliveries) = recorder();
    let sub = bob
        .subscribe(
            SubscribeParams {
                mvk: w.ns.vk(),
                uri_suffix: "a/b/x".to_string(),
                primary_access_chain: Some(w.bob_chain.clone()),
                elaborate_pac: ElaboratePac::Partial,
                verify: true,
                ..SubscribeParams::default()
            },
            handler,
        )
        .await
        .unwrap();

    bob.unsubscribe(w.ns.vk(), sub.subid).await.unwrap();
    match next_delivery(&mut deliveries).await {
        Delivery::End { subid } => assert_eq!(subid, sub.subid),
        other => panic!("unexpected {other:?}"),
    }

    // A second unsubscribe has nothing to release.
    assert!(bob.unsubscribe(w.ns.vk(), sub.subid).await.is_err());
}

#[tokio::test]
async fn test_wildcard_publish_rejected_early() {
    let w = world(6);
    let alice = RouterClient::new(w.router.clone(), w.alice.clone());
    let err = alice
        .publish(PublishParams {
            mvk: w.ns.vk(),
            uri_suffix: "a/+".to_string(),
            primary_access_chain: Some(w.alice_chain.clone()),
            ..PublishParams::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::BadOperation { .. }));
}

#[tokio::test]
async fn test_affinity_forwards_to_peer() {
    let w = world(7);

    // A namespace this router does not own, served by a fake remote.
    let mut rng = StdRng::seed_from_u64(70);
    let remote_ns = Keypair::generate(&mut rng);
    let cert_sig = b"remote certificate signature".to_vec();
    let (transport, mut accepts) = MemoryTransport::new(cert_sig.clone());

    let remote_kp = remote_ns.clone();
    let server = tokio::spawn(async move {
        let mut end: MemoryServerEnd = accepts.recv().await.unwrap();
        let mut proof = Vec::with_capacity(96);
        proof.extend_from_slice(remote_kp.vk().as_bytes());
        proof.extend_from_slice(&remote_kp.sign(&cert_sig));
        end.writer.write_all(&proof).await.unwrap();
        end.writer.flush().await.unwrap();

        // The forwarded publish arrives as a message frame.
        let frame = Frame::read_from(&mut end.reader).await.unwrap();
        let msg = bosswave_core::Message::decode(&frame.body).unwrap();
        assert_eq!(msg.mvk, remote_kp.vk());
        assert_eq!(msg.topic_suffix, "lab/door");
        Frame::new(frame.seqno, 0x02, Frame::status_body(0, "")).write_to(&mut end.writer).await.unwrap();
        end
    });

    let link = PeerLink::connect(Arc::new(transport), remote_ns.vk()).await.unwrap();
    w.router.add_peer(remote_ns.vk(), link).await;

    let client = RouterClient::new(w.router.clone(), w.alice.clone());
    client
        .publish(PublishParams {
            mvk: remote_ns.vk(),
            uri_suffix: "lab/door".to_string(),
            verify: false,
            ..PublishParams::default()
        })
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_new_grant_visible_after_tail() {
    // The pipeline picks up fresh registry state through the resolution
    // layer: a grant added after startup authorizes new traffic.
    let w = world(8);
    let carol_kp = {
        let mut rng = StdRng::seed_from_u64(80);
        let (entity, kp) = EntityBuilder::new().build(&mut rng);
        w.registry.publish_entity(Arc::new(entity));
        kp
    };
    let grant = Arc::new(
        DotBuilder::access(w.ns.vk(), carol_kp.vk(), w.ns.vk(), "a/c", PermissionSet::parse("P").unwrap())
            .ttl(0)
            .build(&w.ns)
            .unwrap(),
    );
    w.registry.publish_dot(grant.clone());
    let chain = Arc::new(DChain::from_dots(true, vec![grant]).unwrap());
    w.registry.publish_chain(chain.clone());

    let carol = RouterClient::new(w.router.clone(), carol_kp);
    carol
        .publish(PublishParams {
            mvk: w.ns.vk(),
            uri_suffix: "a/c".to_string(),
            primary_access_chain: Some(chain),
            elaborate_pac: ElaboratePac::Full,
            verify: true,
            ..PublishParams::default()
        })
        .await
        .unwrap();
}
