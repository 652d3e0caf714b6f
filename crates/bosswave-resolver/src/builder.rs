//! The chain builder: graph search for grant paths.
//!
//! Vertices are VKs; edges are valid access DOTs granted from a VK,
//! sourced through the resolution layer. A scenario accumulates a chain
//! and its merged URI scope; it terminates when its tail VK reaches the
//! target identity or the open-grant everybody VK. Results are deduped by
//! chain hash and cached under `(nsvk, target, uri, perms)`.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use bosswave_core::CoreError;
use bosswave_core::Resolver;
use bosswave_core::Result;
use bosswave_crypto::Vk;
use bosswave_objects::DChain;
use bosswave_objects::Dot;
use bosswave_objects::ObjectState;
use bosswave_objects::PermissionSet;
use bosswave_uri::analyze_suffix;
use bosswave_uri::restrict_by;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::cache::ChainKey;
use crate::cache::Resolution;

/// The full chain hop budget before any DOT clamps it.
const INITIAL_TTL: i32 = 256;

/// Ceiling on scenarios explored per build; a cyclic trust graph can
/// otherwise mint paths faster than TTL clamps kill them.
const MAX_SCENARIOS: usize = 65_536;

/// What to search for.
#[derive(Debug, Clone)]
pub struct ChainBuildParams {
    /// Namespace the chains must authorize on.
    pub nsvk: Vk,
    /// URI suffix the chains must cover.
    pub uri_suffix: String,
    /// Minimum permission set every edge must grant.
    pub perms: PermissionSet,
    /// Identity the chains must empower.
    pub target: Vk,
}

/// A partial path through the grant graph.
#[derive(Debug, Clone)]
struct Scenario {
    chain: Vec<Arc<Dot>>,
    suffix: String,
}

impl Scenario {
    fn new(dot: Arc<Dot>) -> Scenario {
        let suffix = dot.access_suffix().unwrap_or_default().to_string();
        Scenario {
            chain: vec![dot],
            suffix,
        }
    }

    /// Remaining hop budget: start at 256, spend one per hop, clamp to
    /// each DOT's own TTL.
    fn ttl(&self) -> i32 {
        let mut ttl = INITIAL_TTL;
        for d in &self.chain {
            ttl -= 1;
            ttl = ttl.min(i32::from(d.ttl()));
        }
        ttl
    }

    fn terminal_vk(&self) -> Vk {
        self.chain.last().expect("scenario is never empty").receiver()
    }

    /// Extend by one DOT, failing when the URI scopes are incompatible or
    /// the hop budget runs out.
    fn extend(&self, dot: Arc<Dot>) -> Option<Scenario> {
        let suffix = restrict_by(&self.suffix, dot.access_suffix()?)?;
        let mut chain = self.chain.clone();
        chain.push(dot);
        let next = Scenario { chain, suffix };
        (next.ttl() >= 0).then_some(next)
    }
}

/// Discovers all valid access chains for a [`ChainBuildParams`].
pub struct ChainBuilder {
    resolution: Arc<Resolution>,
    params: ChainBuildParams,
    status: Option<mpsc::UnboundedSender<String>>,
}

impl ChainBuilder {
    pub fn new(resolution: Arc<Resolution>, params: ChainBuildParams) -> ChainBuilder {
        ChainBuilder {
            resolution,
            params,
            status: None,
        }
    }

    /// Attach a progress channel; build steps are narrated into it.
    pub fn with_status(mut self, status: mpsc::UnboundedSender<String>) -> ChainBuilder {
        self.status = Some(status);
        self
    }

    fn report(&self, msg: impl Into<String>) {
        if let Some(tx) = &self.status {
            let _ = tx.send(msg.into());
        }
    }

    /// An edge is usable if it is valid, targets our namespace, grants at
    /// least the desired permissions, and covers the required URI.
    fn dot_useful(&self, dot: &Dot, state: ObjectState) -> bool {
        if state != ObjectState::Valid {
            self.report(format!("rejecting DOT({}): state {state}", dot.hash()));
            return false;
        }
        if dot.access_mvk() != Some(self.params.nsvk) {
            self.report(format!("rejecting DOT({}): wrong namespace", dot.hash()));
            return false;
        }
        let Some(grant) = dot.permission_set() else {
            return false;
        };
        if !self.params.perms.is_subset_of(&grant) {
            self.report(format!("rejecting DOT({}): insufficient permissions", dot.hash()));
            return false;
        }
        match dot.access_suffix().and_then(|s| restrict_by(&self.params.uri_suffix, s)) {
            Some(merged) if merged == self.params.uri_suffix => true,
            _ => {
                self.report(format!("rejecting DOT({}): scope too restrictive", dot.hash()));
                false
            }
        }
    }

    /// Usable outgoing edges from `vk`.
    async fn options_from(&self, vk: Vk) -> Result<Vec<Arc<Dot>>> {
        let links = self.resolution.resolve_dots_from(vk).await?;
        Ok(links
            .into_iter()
            .filter(|l| l.dot.is_access() && self.dot_useful(&l.dot, l.state))
            .map(|l| l.dot)
            .collect())
    }

    fn is_terminal(&self, vk: Vk) -> bool {
        vk == self.params.target || vk.is_everybody()
    }

    /// Run the search, consulting the built-chain cache first.
    pub async fn build(&self) -> Result<Vec<Arc<DChain>>> {
        if !analyze_suffix(&self.params.uri_suffix).valid {
            return Err(CoreError::BadUri {
                reason: format!("invalid build target {:?}", self.params.uri_suffix),
            });
        }

        let key = ChainKey {
            target: self.params.target,
            uri: self.params.uri_suffix.clone(),
            perms: self.params.perms.to_string(),
        };
        if let Some(cached) = self.resolution.lookup_chains(self.params.nsvk, &key).await {
            info!(nsvk = %self.params.nsvk, "chain build cache hit");
            return Ok(cached.into_iter().filter(|(_, s)| *s == ObjectState::Valid).map(|(c, _)| c).collect());
        }
        debug!(nsvk = %self.params.nsvk, "chain build cache miss");

        let mut winners: Vec<Scenario> = Vec::new();
        let mut evals: VecDeque<Scenario> = VecDeque::new();
        let mut explored = 0usize;

        self.report(format!("looking for DOTs from {}", self.params.nsvk));
        for dot in self.options_from(self.params.nsvk).await? {
            let s = Scenario::new(dot);
            if self.is_terminal(s.terminal_vk()) {
                self.report("found valid scenario");
                winners.push(s);
            } else {
                evals.push_back(s);
            }
        }

        while let Some(s) = evals.pop_front() {
            explored += 1;
            if explored > MAX_SCENARIOS {
                warn!(max = MAX_SCENARIOS, "chain build scenario budget exhausted; results may be incomplete");
                break;
            }
            for dot in self.options_from(s.terminal_vk()).await? {
                let Some(next) = s.extend(dot) else {
                    continue;
                };
                if self.is_terminal(next.terminal_vk()) {
                    self.report("graph walk found a valid scenario");
                    winners.push(next);
                } else {
                    evals.push_back(next);
                }
            }
        }

        let mut seen: HashSet<bosswave_crypto::ObjHash> = HashSet::new();
        let mut chains: Vec<Arc<DChain>> = Vec::new();
        for s in winners {
            let chain = Arc::new(DChain::from_dots(true, s.chain)?);
            if seen.insert(chain.chain_hash()) {
                chains.push(chain);
            }
        }
        self.report("chain build complete");

        self.resolution.cache_chains(self.params.nsvk, key, chains.clone());
        Ok(chains)
    }
}
