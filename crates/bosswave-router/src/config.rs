//! Router configuration.
//!
//! Loaded from a TOML file by the daemon. Namespace keys are given in
//! the same base64url form they take in topics.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bosswave_crypto::Keypair;
use bosswave_crypto::SK_LEN;
use bosswave_crypto::Vk;
use bosswave_objects::Entity;
use serde::Deserialize;

/// One peer router entry: which namespace it serves and where to dial.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerEntry {
    /// base64url MVK of the namespace.
    pub nsvk: String,
    /// `host:port` dial target.
    pub address: String,
}

/// The daemon's configuration file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RouterConfig {
    /// Namespaces this router is authoritative for (base64url MVKs).
    #[serde(default)]
    pub mvks: Vec<String>,

    /// Path to the router's entity keyfile (`sk32 | entity wire form`).
    #[serde(default)]
    pub entity_keyfile: Option<String>,

    /// Remote routers by namespace.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,

    /// Tracing filter, overridable by `RUST_LOG`.
    #[serde(default)]
    pub log_filter: Option<String>,
}

impl RouterConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<RouterConfig> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let cfg: RouterConfig = toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(cfg)
    }

    /// The owned-namespace list as keys.
    pub fn owned_mvks(&self) -> Result<Vec<Vk>> {
        self.mvks
            .iter()
            .map(|s| Vk::from_base64(s).with_context(|| format!("bad MVK in config: {s:?}")))
            .collect()
    }

    /// The peer table as `nsvk -> address`.
    pub fn peer_table(&self) -> Result<HashMap<Vk, String>> {
        let mut table = HashMap::new();
        for entry in &self.peers {
            let vk = Vk::from_base64(&entry.nsvk).with_context(|| format!("bad peer nsvk: {:?}", entry.nsvk))?;
            table.insert(vk, entry.address.clone());
        }
        Ok(table)
    }
}

/// Parse an entity keyfile: the 32-byte signing key followed by the
/// entity's wire form. Returns the entity and its checked keypair.
pub fn load_entity_keyfile(bytes: &[u8]) -> Result<(Entity, Keypair)> {
    if bytes.len() <= SK_LEN {
        bail!("keyfile too short: {} bytes", bytes.len());
    }
    let sk: [u8; SK_LEN] = bytes[..SK_LEN].try_into().expect("checked length");
    let entity = Entity::decode(&bytes[SK_LEN..]).map_err(|e| anyhow::anyhow!("bad entity in keyfile: {e}"))?;
    let keypair = Keypair::from_parts(sk, entity.vk()).context("keyfile signing key does not match the entity")?;
    if !entity.sig_valid() {
        bail!("entity self-signature is invalid");
    }
    Ok((entity, keypair))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosswave_objects::EntityBuilder;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_config_parse() {
        let raw = r#"
            mvks = ["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="]
            log_filter = "info"

            [[peers]]
            nsvk = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
            address = "router2.example.com:4514"
        "#;
        let cfg: RouterConfig = toml::from_str(raw).unwrap();
        assert_eq!(cfg.mvks.len(), 1);
        assert_eq!(cfg.peers[0].address, "router2.example.com:4514");
        assert!(cfg.owned_mvks().is_ok());
        assert_eq!(cfg.peer_table().unwrap().len(), 1);
    }

    #[test]
    fn test_config_rejects_bad_vk() {
        let cfg = RouterConfig {
            mvks: vec!["not base64!!".to_string()],
            ..RouterConfig::default()
        };
        assert!(cfg.owned_mvks().is_err());
    }

    #[test]
    fn test_entity_keyfile_roundtrip() {
        let mut rng = StdRng::seed_from_u64(4);
        let (entity, kp) = EntityBuilder::new().contact("ops").build(&mut rng);
        let mut keyfile = kp.sk().to_vec();
        keyfile.extend_from_slice(entity.content());

        let (loaded, loaded_kp) = load_entity_keyfile(&keyfile).unwrap();
        assert_eq!(loaded.vk(), entity.vk());
        assert_eq!(loaded_kp.vk(), kp.vk());
    }

    #[test]
    fn test_entity_keyfile_rejects_mismatched_key() {
        let mut rng = StdRng::seed_from_u64(5);
        let (entity, _) = EntityBuilder::new().build(&mut rng);
        let other = bosswave_crypto::Keypair::generate(&mut rng);
        let mut keyfile = other.sk().to_vec();
        keyfile.extend_from_slice(entity.content());
        assert!(load_entity_keyfile(&keyfile).is_err());
    }
}
