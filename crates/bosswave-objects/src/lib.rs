//! Wire codec for the objects that ride the BOSSWAVE bus.
//!
//! Everything here is a self-describing binary object with a
//! signature-covered prefix: entities (identities), DOTs (declarations of
//! trust), DOT chains, and the routing/payload objects that frame them
//! inside messages. All multi-byte integers are little-endian.
//!
//! Parsers treat input as untrusted: every length is bounds-checked and a
//! malformed object yields [`ObjectError`] rather than a panic.

pub mod constants;
pub mod dchain;
pub mod dot;
pub mod entity;
pub mod error;
pub mod payload;
pub mod permissions;
pub mod routing;

mod tlv;
mod wire;

pub use dchain::DChain;
pub use dot::Dot;
pub use dot::DotBuilder;
pub use dot::DotKind;
pub use dot::PublishLimits;
pub use entity::Entity;
pub use entity::EntityBuilder;
pub use error::ObjectError;
pub use error::Result;
pub use payload::PayloadObject;
pub use payload::ponum_dot_form;
pub use payload::ponum_from_dot_form;
pub use permissions::PermissionSet;
pub use routing::RoutingObject;
pub use routing::expiry_from_now;

/// Registry-reported validity of an entity, DOT or chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ObjectState {
    /// Not yet resolved.
    #[default]
    Unknown,
    /// Known to the registry and currently valid.
    Valid,
    /// Past its expiry timestamp.
    Expired,
    /// Revoked by its owner or a delegated revoker.
    Revoked,
    /// The registry could not answer.
    Error,
}

impl std::fmt::Display for ObjectState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ObjectState::Unknown => "Unknown",
            ObjectState::Valid => "Valid",
            ObjectState::Expired => "Expired",
            ObjectState::Revoked => "Revoked",
            ObjectState::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Combine object states pessimistically: a composite object is only as
/// valid as its worst member.
pub fn combine_states(a: ObjectState, b: ObjectState) -> ObjectState {
    use ObjectState::*;
    match (a, b) {
        (Error, _) | (_, Error) => Error,
        (Revoked, _) | (_, Revoked) => Revoked,
        (Expired, _) | (_, Expired) => Expired,
        (Unknown, _) | (_, Unknown) => Unknown,
        (Valid, Valid) => Valid,
    }
}
