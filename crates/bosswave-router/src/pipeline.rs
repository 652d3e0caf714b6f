//! The message pipeline and the router context.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bosswave_core::CoreError;
use bosswave_core::Delivery;
use bosswave_core::ElaboratePac;
use bosswave_core::Message;
use bosswave_core::MessageType;
use bosswave_core::PersistedStore;
use bosswave_core::PublishOutcome;
use bosswave_core::Resolver;
use bosswave_core::Result;
use bosswave_core::SubHandler;
use bosswave_core::Terminus;
use bosswave_core::UniqueMessageId;
use bosswave_core::terminus::ClientId;
use bosswave_crypto::Keypair;
use bosswave_crypto::Vk;
use bosswave_objects::DChain;
use bosswave_objects::PayloadObject;
use bosswave_objects::PermissionSet;
use bosswave_objects::RoutingObject;
use bosswave_peer::PeerEvent;
use bosswave_peer::PeerLink;
use bosswave_peer::TlsTransport;
use bosswave_resolver::ChainBuildParams;
use bosswave_resolver::ChainBuilder;
use bosswave_resolver::Resolution;
use bosswave_uri::analyze_suffix;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;

/// A publish or persist request.
#[derive(Default)]
pub struct PublishParams {
    pub mvk: Vk,
    pub uri_suffix: String,
    pub primary_access_chain: Option<Arc<DChain>>,
    pub routing_objects: Vec<RoutingObject>,
    pub payload_objects: Vec<PayloadObject>,
    pub expiry: Option<DateTime<Utc>>,
    pub expiry_delta: Option<chrono::Duration>,
    pub elaborate_pac: ElaboratePac,
    pub verify: bool,
    pub persist: bool,
    /// Consumer limit; zero means unlimited.
    pub consumers: u8,
}

/// A subscribe or tap request.
#[derive(Default)]
pub struct SubscribeParams {
    pub mvk: Vk,
    pub uri_suffix: String,
    pub primary_access_chain: Option<Arc<DChain>>,
    pub routing_objects: Vec<RoutingObject>,
    pub expiry: Option<DateTime<Utc>>,
    pub expiry_delta: Option<chrono::Duration>,
    pub elaborate_pac: ElaboratePac,
    pub verify: bool,
    /// Tap subscriptions see every message regardless of consumer limits.
    pub tap: bool,
}

/// A query or tap-query request.
#[derive(Default)]
pub struct QueryParams {
    pub mvk: Vk,
    pub uri_suffix: String,
    pub primary_access_chain: Option<Arc<DChain>>,
    pub routing_objects: Vec<RoutingObject>,
    pub expiry: Option<DateTime<Utc>>,
    pub expiry_delta: Option<chrono::Duration>,
    pub elaborate_pac: ElaboratePac,
    pub verify: bool,
    pub tap: bool,
}

/// A list request.
#[derive(Default)]
pub struct ListParams {
    pub mvk: Vk,
    pub uri_suffix: String,
    pub primary_access_chain: Option<Arc<DChain>>,
    pub routing_objects: Vec<RoutingObject>,
    pub expiry: Option<DateTime<Utc>>,
    pub expiry_delta: Option<chrono::Duration>,
    pub elaborate_pac: ElaboratePac,
    pub verify: bool,
}

/// What a subscribe produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOutcome {
    /// The effective subscription id (an existing one for a duplicate
    /// pattern from the same client).
    pub subid: UniqueMessageId,
    /// False when an existing subscription was reused.
    pub is_new: bool,
}

/// Process-wide router context.
pub struct Router {
    terminus: Arc<Terminus>,
    resolution: Arc<Resolution>,
    store: Arc<dyn PersistedStore>,
    entity: Keypair,
    our_mvks: Vec<Vk>,
    /// nsvk -> dial target for peer routers.
    peer_table: HashMap<Vk, String>,
    peers: tokio::sync::Mutex<HashMap<Vk, Arc<PeerLink>>>,
    mid: AtomicU64,
}

impl Router {
    pub fn new(
        entity: Keypair,
        our_mvks: Vec<Vk>,
        resolution: Arc<Resolution>,
        store: Arc<dyn PersistedStore>,
        peer_table: HashMap<Vk, String>,
    ) -> Arc<Router> {
        Arc::new(Router {
            terminus: Arc::new(Terminus::new()),
            resolution,
            store,
            entity,
            our_mvks,
            peer_table,
            peers: tokio::sync::Mutex::new(HashMap::new()),
            mid: AtomicU64::new(0),
        })
    }

    pub fn terminus(&self) -> &Arc<Terminus> {
        &self.terminus
    }

    pub fn resolution(&self) -> &Arc<Resolution> {
        &self.resolution
    }

    pub fn entity_vk(&self) -> Vk {
        self.entity.vk()
    }

    /// This router is the designated router for `mvk`.
    pub fn owns(&self, mvk: Vk) -> bool {
        self.our_mvks.contains(&mvk)
    }

    /// Attach a ready-made peer link (used by tests and static wiring).
    pub async fn add_peer(&self, nsvk: Vk, link: Arc<PeerLink>) {
        self.peers.lock().await.insert(nsvk, link);
    }

    /// The peer link for a foreign namespace, dialing on first use.
    pub async fn peer_for(&self, mvk: Vk) -> Result<Arc<PeerLink>> {
        {
            let peers = self.peers.lock().await;
            if let Some(link) = peers.get(&mvk) {
                return Ok(link.clone());
            }
        }
        let target = self.peer_table.get(&mvk).cloned().ok_or_else(|| CoreError::PeerError {
            reason: format!("no peer configured for namespace {mvk}"),
        })?;
        let transport = Arc::new(TlsTransport::new(target));
        let link = PeerLink::connect(transport, mvk).await.map_err(|e| CoreError::PeerError {
            reason: e.to_string(),
        })?;
        let mut peers = self.peers.lock().await;
        Ok(peers.entry(mvk).or_insert(link).clone())
    }

    /// Discover all valid access chains from a namespace to a target.
    pub async fn build_chain(
        &self,
        nsvk: Vk,
        uri_suffix: impl Into<String>,
        perms: PermissionSet,
        target: Vk,
    ) -> Result<Vec<Arc<DChain>>> {
        ChainBuilder::new(
            self.resolution.clone(),
            ChainBuildParams {
                nsvk,
                uri_suffix: uri_suffix.into(),
                perms,
                target,
            },
        )
        .build()
        .await
    }

    fn next_mid(&self) -> u64 {
        self.mid.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ------------------------------------------------------------------
    // Pipeline steps
    // ------------------------------------------------------------------

    /// Step 1: build the message and check the URI/operation shape early.
    fn new_message(&self, mtype: MessageType, mvk: Vk, uri_suffix: &str) -> Result<Message> {
        let info = analyze_suffix(uri_suffix);
        if !info.valid {
            return Err(CoreError::BadUri {
                reason: format!("invalid URI suffix {uri_suffix:?}"),
            });
        }
        if info.has_wildcard() && mtype.forbids_wildcards() {
            return Err(CoreError::BadOperation {
                reason: "wildcards are not valid for this operation".to_string(),
            });
        }
        Ok(Message::new(mtype, self.next_mid(), mvk, uri_suffix))
    }

    /// Step 3: elaborate the primary access chain per the request mode
    /// and attach it as a routing object.
    async fn do_pac(&self, msg: &mut Message, pac: Option<Arc<DChain>>, mode: ElaboratePac) -> Result<()> {
        let Some(pac) = pac else {
            if !matches!(mode, ElaboratePac::None) {
                return Err(CoreError::Unresolvable {
                    what: "PAC elaboration requested without a PAC".to_string(),
                });
            }
            return Ok(());
        };

        let pac = match mode {
            ElaboratePac::None => Arc::new(pac.unelaborate()),
            ElaboratePac::Partial | ElaboratePac::Full => {
                let pac = if pac.is_elaborated() {
                    pac
                } else {
                    let (resolved, _) = self.resolution.resolve_access_dchain(pac.chain_hash()).await?;
                    resolved
                };
                if matches!(mode, ElaboratePac::Full) {
                    let n = pac.num_hashes().unwrap_or(0);
                    for i in 0..n {
                        let hash = pac.dot_hash(i).expect("hash within chain length");
                        let (dot, _) = self.resolution.resolve_dot(hash).await?;
                        pac.set_dot(i, dot.clone())?;
                        msg.routing_objects.push(RoutingObject::Dot(dot));
                    }
                }
                pac
            }
        };
        msg.routing_objects.push(RoutingObject::Chain(pac.clone()));
        msg.primary_access_chain = Some(pac);
        Ok(())
    }

    /// Step 2: synthesize an origin VK unless the chain itself proves the
    /// sender. An open (everybody) grant, an unelaborated chain or a
    /// missing chain all leave the sender undeducible.
    fn check_add_origin_vk(msg: &mut Message, sender: Vk) {
        let chain_names_sender = msg
            .primary_access_chain
            .as_ref()
            .and_then(|pac| pac.receiver_vk())
            .is_some_and(|vk| !vk.is_everybody());
        if !chain_names_sender {
            msg.routing_objects.push(RoutingObject::OriginVk(sender));
            msg.origin_vk = Some(sender);
        }
    }

    fn attach_expiry(msg: &mut Message, expiry: Option<DateTime<Utc>>, delta: Option<chrono::Duration>) {
        if let Some(d) = delta {
            msg.routing_objects.push(bosswave_objects::expiry_from_now(d));
        } else if let Some(at) = expiry {
            msg.routing_objects.push(RoutingObject::Expiry(at));
        }
    }

    /// Step 4/5: encode, sign and optionally verify.
    async fn finish_message(&self, msg: &mut Message, signer: &Keypair, verify: bool) -> Result<()> {
        msg.encode(signer);
        if verify {
            msg.verify(self.resolution.as_ref()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local dispatch
    // ------------------------------------------------------------------

    async fn deliver_local_publish(&self, msg: Message, persist: bool) -> Result<PublishOutcome> {
        let msg = Arc::new(msg);
        let outcome = self.terminus.publish(&msg);
        if persist {
            self.store.put(&msg.topic, msg.encoded.clone()).await?;
        }
        Ok(outcome)
    }

    /// Forward peer subscription events into a handler, re-verifying
    /// every delivered message first.
    fn spawn_verifying_forwarder(&self, handler: SubHandler, subid: UniqueMessageId, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let resolution = self.resolution.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::Message(mut m) => {
                        if let Err(e) = m.verify(resolution.as_ref()).await {
                            info!(topic = %m.topic, error = %e, "dropping peer result (failed local validation)");
                            continue;
                        }
                        handler(Delivery::Message {
                            msg: Arc::new(*m),
                            subid,
                        });
                    }
                    PeerEvent::End => {
                        handler(Delivery::End { subid });
                        return;
                    }
                    PeerEvent::Uri(_) => {}
                }
            }
        });
    }
}

/// One attached client of the router.
pub struct RouterClient {
    router: Arc<Router>,
    client_id: ClientId,
    entity: Keypair,
}

impl RouterClient {
    /// Attach a client signing with the given entity.
    pub fn new(router: Arc<Router>, entity: Keypair) -> RouterClient {
        RouterClient {
            client_id: router.terminus.create_client(),
            router,
            entity,
        }
    }

    /// Attach a client signing with the router's own entity.
    pub fn with_router_entity(router: Arc<Router>) -> RouterClient {
        let entity = router.entity.clone();
        RouterClient::new(router, entity)
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Publish (or persist) a message into a namespace.
    ///
    /// Returns the local fan-out outcome for an owned namespace, or the
    /// default outcome after a successful peer forward.
    pub async fn publish(&self, params: PublishParams) -> Result<PublishOutcome> {
        let mtype = if params.persist {
            MessageType::Persist
        } else {
            MessageType::Publish
        };
        let router = &self.router;
        let mut msg = router.new_message(mtype, params.mvk, &params.uri_suffix)?;
        msg.consumers = params.consumers;
        msg.routing_objects = params.routing_objects;
        msg.payload_objects = params.payload_objects;
        router.do_pac(&mut msg, params.primary_access_chain, params.elaborate_pac).await?;
        Router::check_add_origin_vk(&mut msg, self.entity.vk());
        Router::attach_expiry(&mut msg, params.expiry, params.expiry_delta);
        router.finish_message(&mut msg, &self.entity, params.verify).await?;

        if router.owns(msg.mvk) {
            let outcome = router.deliver_local_publish(msg, params.persist).await?;
            debug!(delivered = outcome.delivered, "local publish complete");
            Ok(outcome)
        } else {
            let peer = router.peer_for(msg.mvk).await?;
            peer.publish(&msg).await.map_err(|e| CoreError::PeerError {
                reason: e.to_string(),
            })?;
            Ok(PublishOutcome::default())
        }
    }

    /// Subscribe (or tap). `handler` observes deliveries and the final
    /// end event; each invocation runs on its own task.
    pub async fn subscribe(&self, params: SubscribeParams, handler: SubHandler) -> Result<SubscribeOutcome> {
        let mtype = if params.tap {
            MessageType::Tap
        } else {
            MessageType::Subscribe
        };
        let router = &self.router;
        let mut msg = router.new_message(mtype, params.mvk, &params.uri_suffix)?;
        msg.routing_objects = params.routing_objects;
        router.do_pac(&mut msg, params.primary_access_chain, params.elaborate_pac).await?;
        Router::check_add_origin_vk(&mut msg, self.entity.vk());
        Router::attach_expiry(&mut msg, params.expiry, params.expiry_delta);
        router.finish_message(&mut msg, &self.entity, params.verify).await?;

        if router.owns(msg.mvk) {
            let subid = router.terminus.subscribe(self.client_id, &msg.topic, params.tap, msg.umid, handler);
            Ok(SubscribeOutcome {
                subid,
                is_new: subid == msg.umid,
            })
        } else {
            let peer = router.peer_for(msg.mvk).await?;
            let (subid, events) = peer.subscribe(&msg).await.map_err(|e| CoreError::PeerError {
                reason: e.to_string(),
            })?;
            router.spawn_verifying_forwarder(handler, subid, events);
            Ok(SubscribeOutcome {
                subid,
                is_new: subid == msg.umid,
            })
        }
    }

    /// Query persisted messages matching a pattern. Results are
    /// re-parsed and re-verified before emission; the stream closes after
    /// the final result.
    pub async fn query(&self, params: QueryParams) -> Result<mpsc::UnboundedReceiver<Message>> {
        let mtype = if params.tap {
            MessageType::TapQuery
        } else {
            MessageType::Query
        };
        let router = &self.router;
        let mut msg = router.new_message(mtype, params.mvk, &params.uri_suffix)?;
        msg.routing_objects = params.routing_objects;
        router.do_pac(&mut msg, params.primary_access_chain, params.elaborate_pac).await?;
        Router::check_add_origin_vk(&mut msg, self.entity.vk());
        Router::attach_expiry(&mut msg, params.expiry, params.expiry_delta);
        router.finish_message(&mut msg, &self.entity, params.verify).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        if router.owns(msg.mvk) {
            let mut hits = router.store.get_matching(&msg.topic).await?;
            let resolution = router.resolution.clone();
            tokio::spawn(async move {
                while let Some(bytes) = hits.recv().await {
                    let mut m = match Message::decode(&bytes) {
                        Ok(m) => m,
                        Err(e) => {
                            info!(error = %e, "dropping stored query result (malformed message)");
                            continue;
                        }
                    };
                    if let Err(e) = m.verify(resolution.as_ref()).await {
                        info!(topic = %m.topic, error = %e, "dropping stored query result (failed verify)");
                        continue;
                    }
                    if tx.send(m).is_err() {
                        return;
                    }
                }
            });
        } else {
            let peer = router.peer_for(msg.mvk).await?;
            let mut events = peer.query(&msg).await.map_err(|e| CoreError::PeerError {
                reason: e.to_string(),
            })?;
            let resolution = router.resolution.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        PeerEvent::Message(mut m) => {
                            if let Err(e) = m.verify(resolution.as_ref()).await {
                                info!(topic = %m.topic, error = %e, "dropping peer query result (failed verify)");
                                continue;
                            }
                            if tx.send(*m).is_err() {
                                return;
                            }
                        }
                        PeerEvent::End => return,
                        PeerEvent::Uri(_) => {}
                    }
                }
            });
        }
        Ok(rx)
    }

    /// List immediate child URIs under a concrete prefix.
    pub async fn list(&self, params: ListParams) -> Result<mpsc::UnboundedReceiver<String>> {
        let router = &self.router;
        let mut msg = router.new_message(MessageType::List, params.mvk, &params.uri_suffix)?;
        msg.routing_objects = params.routing_objects;
        router.do_pac(&mut msg, params.primary_access_chain, params.elaborate_pac).await?;
        Router::check_add_origin_vk(&mut msg, self.entity.vk());
        Router::attach_expiry(&mut msg, params.expiry, params.expiry_delta);
        router.finish_message(&mut msg, &self.entity, params.verify).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        if router.owns(msg.mvk) {
            let mut kids = router.store.list_children(&msg.topic).await?;
            tokio::spawn(async move {
                while let Some(child) = kids.recv().await {
                    if tx.send(child).is_err() {
                        return;
                    }
                }
            });
        } else {
            let peer = router.peer_for(msg.mvk).await?;
            let mut events = peer.list(&msg).await.map_err(|e| CoreError::PeerError {
                reason: e.to_string(),
            })?;
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        PeerEvent::Uri(u) => {
                            if tx.send(u).is_err() {
                                return;
                            }
                        }
                        PeerEvent::End => return,
                        PeerEvent::Message(_) => {}
                    }
                }
            });
        }
        Ok(rx)
    }

    /// Cancel a subscription made through this router.
    pub async fn unsubscribe(&self, mvk: Vk, subid: UniqueMessageId) -> Result<()> {
        let router = &self.router;
        if router.owns(mvk) {
            if router.terminus.unsubscribe(subid) {
                Ok(())
            } else {
                Err(CoreError::BadOperation {
                    reason: format!("no subscription {subid}"),
                })
            }
        } else {
            // The target is named by id; the suffix is not meaningful and
            // skips the URI shape check.
            let mut msg = Message::new(MessageType::Unsubscribe, router.next_mid(), mvk, "");
            msg.unsub_target = Some(subid);
            // An unsubscribe names its target by id; it carries no chain.
            Router::check_add_origin_vk(&mut msg, self.entity.vk());
            router.finish_message(&mut msg, &self.entity, false).await?;
            let peer = router.peer_for(mvk).await?;
            peer.unsubscribe(&msg).await.map_err(|e| CoreError::PeerError {
                reason: e.to_string(),
            })
        }
    }
}
