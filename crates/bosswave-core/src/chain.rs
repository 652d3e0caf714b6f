//! Access-chain analysis: the permission reduction walk.
//!
//! Given an elaborated access chain and a target URI, walk the chain from
//! the namespace key outward, merging URI scopes and reducing permissions
//! link by link, then gate the result against the requested operation.

use bosswave_crypto::Vk;
use bosswave_objects::DChain;
use bosswave_objects::PermissionSet;
use bosswave_uri::analyze_suffix;
use bosswave_uri::restrict_by;

use crate::error::CoreError;
use crate::error::Result;
use crate::message::MessageType;

/// What a valid chain grants for a particular target URI.
#[derive(Debug, Clone)]
pub struct ChainAnalysis {
    /// Namespace the chain authorizes on.
    pub mvk: Vk,
    /// The target URI restricted by every link's scope.
    pub merged_uri: String,
    /// Permissions surviving every reduction.
    pub permissions: PermissionSet,
    /// Receiver of the final DOT: the identity the chain empowers.
    pub origin_vk: Vk,
    /// The merged URI contains `*`.
    pub has_star: bool,
    /// The merged URI contains `+`.
    pub has_plus: bool,
}

/// Validate an elaborated access chain against an operation and target
/// URI suffix.
///
/// The chain must be fully resolved (every DOT slot filled); signature
/// checks are the caller's responsibility.
pub fn analyze_access_chain(op: MessageType, target_suffix: &str, chain: &DChain) -> Result<ChainAnalysis> {
    let n = chain.num_hashes().filter(|&n| n > 0).ok_or(CoreError::Unresolvable {
        what: "unelaborated access chain".to_string(),
    })?;

    let first = chain.dot(0).ok_or(CoreError::Unresolvable {
        what: "chain DOT 0".to_string(),
    })?;
    let mvk = first.access_mvk().ok_or(CoreError::BadLink { hop: 0 })?;
    if first.giver() != mvk {
        return Err(CoreError::ChainOriginNotMvk);
    }

    let first_suffix = first.access_suffix().ok_or(CoreError::BadLink { hop: 0 })?;
    let mut uri = restrict_by(target_suffix, first_suffix).ok_or_else(|| CoreError::BadUri {
        reason: format!("{target_suffix} is incompatible with the chain root scope"),
    })?;
    let mut perms = first.permission_set().ok_or(CoreError::BadLink { hop: 0 })?;
    let mut ttl = i32::from(first.ttl());
    let mut tail = first.receiver();

    for hop in 1..n {
        let d = chain.dot(hop).ok_or_else(|| CoreError::Unresolvable {
            what: format!("chain DOT {hop}"),
        })?;
        ttl -= 1;
        if ttl < 0 {
            return Err(CoreError::TtlExpired { hop });
        }
        let link_perms = d.permission_set().ok_or(CoreError::BadLink { hop })?;
        perms.reduce_by(&link_perms);
        ttl = ttl.min(i32::from(d.ttl()));
        if tail != d.giver() || d.access_mvk() != Some(mvk) {
            return Err(CoreError::BadLink { hop });
        }
        let suffix = d.access_suffix().ok_or(CoreError::BadLink { hop })?;
        uri = restrict_by(&uri, suffix).ok_or(CoreError::OverconstrainedUri { hop })?;
        tail = d.receiver();
    }

    let info = analyze_suffix(&uri);
    if !info.valid {
        return Err(CoreError::OverconstrainedUri { hop: n - 1 });
    }

    // Gate the surviving permissions against the operation, using the
    // wildcard shape of the merged URI.
    let denied = |require: &str| CoreError::BadPermissions {
        require: require.to_string(),
    };
    match op {
        MessageType::Publish | MessageType::Persist => {
            if !perms.can_publish || info.has_star || info.has_plus {
                return Err(denied("P"));
            }
        }
        MessageType::Subscribe | MessageType::Query => {
            if !perms.can_consume
                || (info.has_plus && !perms.can_consume_plus)
                || (info.has_star && !perms.can_consume_star)
            {
                return Err(denied("C"));
            }
        }
        MessageType::Tap | MessageType::TapQuery => {
            if !perms.can_tap || (info.has_plus && !perms.can_tap_plus) || (info.has_star && !perms.can_tap_star) {
                return Err(denied("T"));
            }
        }
        MessageType::List => {
            if !perms.can_list || info.has_star || info.has_plus {
                return Err(denied("L"));
            }
        }
        MessageType::Unsubscribe => {
            return Err(CoreError::BadOperation {
                reason: "unsubscribe does not carry an access chain".to_string(),
            });
        }
    }

    Ok(ChainAnalysis {
        mvk,
        merged_uri: uri,
        permissions: perms,
        origin_vk: tail,
        has_star: info.has_star,
        has_plus: info.has_plus,
    })
}
