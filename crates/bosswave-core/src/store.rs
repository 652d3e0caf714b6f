//! The persisted-message store seam.
//!
//! Persist is publish plus an append of the encoded message bytes keyed
//! by topic. The store itself is an external collaborator; this module
//! defines the interface the terminus glue consumes and an in-memory
//! implementation used by tests and the zero-disk dev mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use bosswave_uri::restrict_by;
use tokio::sync::mpsc;

use crate::error::Result;

/// Capacity of result streams handed back by store scans.
const SCAN_CHANNEL_DEPTH: usize = 64;

/// Durable storage of the latest persisted message per topic.
#[async_trait]
pub trait PersistedStore: Send + Sync {
    /// Store `bytes` as the current message on `topic` (concrete).
    async fn put(&self, topic: &str, bytes: Vec<u8>) -> Result<()>;

    /// Stream the stored message bytes whose topics match `pattern`
    /// (which may contain wildcards).
    async fn get_matching(&self, pattern: &str) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Stream the distinct immediate child URIs under a concrete prefix.
    async fn list_children(&self, prefix: &str) -> Result<mpsc::Receiver<String>>;
}

/// True when a concrete stored topic is covered by a query pattern.
///
/// Restriction against a concrete topic succeeds without changing it
/// exactly when the pattern covers the topic.
pub fn pattern_matches(stored: &str, pattern: &str) -> bool {
    restrict_by(stored, pattern).is_some_and(|merged| merged == stored)
}

/// In-memory [`PersistedStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistedStore for MemoryStore {
    async fn put(&self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        let mut map = self.inner.write().expect("store lock poisoned");
        map.insert(topic.to_string(), bytes);
        Ok(())
    }

    async fn get_matching(&self, pattern: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_DEPTH);
        let hits: Vec<Vec<u8>> = {
            let map = self.inner.read().expect("store lock poisoned");
            map.iter().filter(|(topic, _)| pattern_matches(topic, pattern)).map(|(_, v)| v.clone()).collect()
        };
        tokio::spawn(async move {
            for h in hits {
                if tx.send(h).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn list_children(&self, prefix: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_DEPTH);
        let want = format!("{}/", prefix.trim_end_matches('/'));
        let mut children: Vec<String> = {
            let map = self.inner.read().expect("store lock poisoned");
            map.keys()
                .filter_map(|topic| {
                    let rest = topic.strip_prefix(&want)?;
                    let cell = rest.split('/').next()?;
                    Some(format!("{want}{cell}"))
                })
                .collect()
        };
        children.sort();
        children.dedup();
        tokio::spawn(async move {
            for c in children {
                if tx.send(c).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
