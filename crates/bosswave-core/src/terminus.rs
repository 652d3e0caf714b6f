//! The terminus: subscription dispatch for topics this router owns.
//!
//! Subscriptions live in a trie keyed by topic cells, with `+` and `*`
//! labels matched by the walker. Each node carries its own RW lock;
//! matching collects subscriptions under read locks and dispatches only
//! after every lock is released, because handlers may re-enter the trie.
//!
//! Messages reaching the terminus have already been verified and are
//! destined for an MVK this router owns.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::message::Message;
use crate::message::UniqueMessageId;

/// Identifies one attached client of this terminus.
pub type ClientId = u32;

/// What a subscription handler receives.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A matching message.
    Message {
        msg: Arc<Message>,
        /// The subscription this delivery belongs to.
        subid: UniqueMessageId,
    },
    /// The subscription was cancelled. Fired exactly once.
    End { subid: UniqueMessageId },
}

/// Subscription callback. Invoked once per delivery, each on its own
/// task; per-subscription ordering is not guaranteed.
pub type SubHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    subid: UniqueMessageId,
    client: ClientId,
    tap: bool,
    handler: SubHandler,
}

#[derive(Default)]
struct SubNode {
    children: RwLock<HashMap<String, Arc<SubNode>>>,
    subs: RwLock<HashMap<ClientId, Subscription>>,
}

impl SubNode {
    /// Walk/create nodes for `parts` and insert at the leaf. Returns the
    /// winning subscription id and the leaf node: an existing
    /// subscription by the same client wins over the new one.
    fn add(node: &Arc<SubNode>, parts: &[&str], sub: Subscription) -> (UniqueMessageId, Arc<SubNode>) {
        let Some((head, rest)) = parts.split_first() else {
            let mut subs = node.subs.write().expect("subs lock poisoned");
            if let Some(existing) = subs.get(&sub.client) {
                return (existing.subid, node.clone());
            }
            let subid = sub.subid;
            subs.insert(sub.client, sub);
            return (subid, node.clone());
        };

        let existing = {
            let children = node.children.read().expect("children lock poisoned");
            children.get(*head).cloned()
        };
        let child = match existing {
            Some(child) => child,
            None => {
                let mut children = node.children.write().expect("children lock poisoned");
                children.entry((*head).to_string()).or_insert_with(|| Arc::new(SubNode::default())).clone()
            }
        };
        SubNode::add(&child, rest, sub)
    }

    /// Collect subscriptions matching the remaining `parts` into `out`.
    fn rmatch(&self, parts: &[&str], out: &mut Vec<Subscription>) {
        let Some((head, rest)) = parts.split_first() else {
            let subs = self.subs.read().expect("subs lock poisoned");
            out.extend(subs.values().cloned());
            return;
        };

        let (exact, plus, star) = {
            let children = self.children.read().expect("children lock poisoned");
            (children.get(*head).cloned(), children.get("+").cloned(), children.get("*").cloned())
        };
        if let Some(n) = exact {
            n.rmatch(rest, out);
        }
        if let Some(n) = plus {
            n.rmatch(rest, out);
        }
        if let Some(n) = star {
            // `*` absorbs zero or more leading cells.
            for i in 0..=parts.len() {
                n.rmatch(&parts[i..], out);
            }
        }
    }
}

/// Outcome of a publish fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOutcome {
    /// Subscriptions that matched the topic.
    pub matched: usize,
    /// Non-tap deliveries actually made.
    pub delivered: usize,
    /// Consumer budget left unspent, for an upstream router to satisfy.
    /// Zero when the message carried no limit.
    pub residual_consumers: u8,
}

/// The subscription dispatch engine.
pub struct Terminus {
    root: Arc<SubNode>,
    /// subid -> owning node, for fast unsubscription.
    by_subid: RwLock<HashMap<UniqueMessageId, (ClientId, Arc<SubNode>)>>,
    next_client: AtomicU32,
}

impl Default for Terminus {
    fn default() -> Terminus {
        Terminus::new()
    }
}

impl Terminus {
    pub fn new() -> Terminus {
        Terminus {
            root: Arc::new(SubNode::default()),
            by_subid: RwLock::new(HashMap::new()),
            next_client: AtomicU32::new(1),
        }
    }

    /// Allocate a client id for a new attachment.
    pub fn create_client(&self) -> ClientId {
        self.next_client.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a subscription on `topic` for `client`.
    ///
    /// Idempotent per `(client, topic)`: if this client already holds a
    /// subscription on the exact pattern, the existing subscription id is
    /// returned and the supplied one is discarded.
    pub fn subscribe(
        &self,
        client: ClientId,
        topic: &str,
        tap: bool,
        subid: UniqueMessageId,
        handler: SubHandler,
    ) -> UniqueMessageId {
        let parts: Vec<&str> = topic.split('/').collect();
        let sub = Subscription {
            subid,
            client,
            tap,
            handler,
        };
        let (winner, node) = SubNode::add(&self.root, &parts, sub);
        if winner == subid {
            let mut by_subid = self.by_subid.write().expect("subid index poisoned");
            by_subid.insert(subid, (client, node));
        }
        winner
    }

    /// Fan a verified message out to matching subscriptions, using the
    /// process RNG for consumer-limit shuffling.
    pub fn publish(&self, msg: &Arc<Message>) -> PublishOutcome {
        self.publish_with_rng(msg, &mut rand::thread_rng())
    }

    /// Fan out with a caller-supplied RNG (deterministic in tests).
    ///
    /// With a consumer limit `k > 0` the matched list is shuffled and at
    /// most `k` non-tap subscriptions receive the message; taps always
    /// receive it. The accounting is best-effort under concurrency.
    pub fn publish_with_rng<R: Rng>(&self, msg: &Arc<Message>, rng: &mut R) -> PublishOutcome {
        let parts: Vec<&str> = msg.topic.split('/').collect();
        let mut matched: Vec<Subscription> = Vec::new();
        self.root.rmatch(&parts, &mut matched);

        let limit = msg.consumers as usize;
        if limit > 0 {
            matched.shuffle(rng);
        }

        let mut delivered = 0usize;
        for sub in &matched {
            if !sub.tap && limit > 0 && delivered == limit {
                continue;
            }
            if !sub.tap {
                delivered += 1;
            }
            let handler = sub.handler.clone();
            let delivery = Delivery::Message {
                msg: msg.clone(),
                subid: sub.subid,
            };
            tokio::spawn(async move { handler(delivery) });
        }
        debug!(topic = %msg.topic, matched = matched.len(), delivered, "terminus fan-out");

        PublishOutcome {
            matched: matched.len(),
            delivered,
            residual_consumers: if limit > 0 && delivered < limit {
                (limit - delivered) as u8
            } else {
                0
            },
        }
    }

    /// Remove a subscription and fire its end event exactly once.
    ///
    /// Returns false if the id is unknown (already unsubscribed).
    pub fn unsubscribe(&self, subid: UniqueMessageId) -> bool {
        let entry = {
            let mut by_subid = self.by_subid.write().expect("subid index poisoned");
            by_subid.remove(&subid)
        };
        let Some((client, node)) = entry else {
            return false;
        };
        let removed = {
            let mut subs = node.subs.write().expect("subs lock poisoned");
            subs.remove(&client)
        };
        // Empty branches are left in place; the walker never visits
        // labels the published topic does not name.
        match removed {
            Some(sub) => {
                let handler = sub.handler;
                tokio::spawn(async move { handler(Delivery::End { subid }) });
                true
            }
            None => false,
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.by_subid.read().expect("subid index poisoned").len()
    }
}
