//! The request-fatal error taxonomy of the router core.
//!
//! Parse failures of individual routing objects are logged and skipped by
//! the message parser; everything surfaced here aborts the request it
//! belongs to. No variant ever terminates the process.

use bosswave_objects::ObjectError;
use snafu::Snafu;

/// Errors surfaced by message verification, chain analysis, the terminus
/// and the pipeline.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoreError {
    /// The topic is malformed.
    #[snafu(display("bad URI: {reason}"))]
    BadUri {
        /// Why the topic was rejected.
        reason: String,
    },

    /// Adjacent chain links do not join, or a link changes namespace.
    #[snafu(display("chain has a bad link at hop {hop}"))]
    BadLink {
        /// Index of the offending DOT.
        hop: usize,
    },

    /// The first DOT's giver is not the namespace MVK.
    #[snafu(display("chain does not originate at the namespace key"))]
    ChainOriginNotMvk,

    /// The chain's hop budget ran out.
    #[snafu(display("chain TTL expired at hop {hop}"))]
    TtlExpired {
        /// Index of the DOT that exhausted the budget.
        hop: usize,
    },

    /// Merging URIs along the chain produced an incompatibility.
    #[snafu(display("overconstrained URI while merging at hop {hop}"))]
    OverconstrainedUri {
        /// Index of the DOT whose scope failed to merge.
        hop: usize,
    },

    /// The merged permissions do not allow the operation.
    #[snafu(display("bad permissions: require {require}"))]
    BadPermissions {
        /// Human form of the missing permission.
        require: String,
    },

    /// Neither the cache nor the registry could produce the object.
    #[snafu(display("could not resolve {what}"))]
    Unresolvable {
        /// Description of the missing object.
        what: String,
    },

    /// A signature check failed.
    #[snafu(display("invalid signature on {what}"))]
    InvalidSig {
        /// Which signature failed.
        what: &'static str,
    },

    /// The message's expiry routing object is in the past.
    #[snafu(display("message is expired"))]
    ExpiredMessage,

    /// No origin VK could be deduced for the message.
    #[snafu(display("cannot deduce message origin"))]
    NoOrigin,

    /// The access chain's namespace differs from the message's.
    #[snafu(display("chain namespace does not match message namespace"))]
    MvkMismatch,

    /// A wire structure failed to parse.
    #[snafu(display("bad encoding: {source}"))]
    BadEncoding {
        /// The codec failure.
        source: ObjectError,
    },

    /// The peer link failed while carrying this request.
    #[snafu(display("peer error: {reason}"))]
    PeerError {
        /// Transport-level description.
        reason: String,
    },

    /// The operation is not valid for this message (for example a publish
    /// to a wildcard topic).
    #[snafu(display("bad operation: {reason}"))]
    BadOperation {
        /// Why the operation was rejected.
        reason: String,
    },
}

impl From<ObjectError> for CoreError {
    fn from(source: ObjectError) -> CoreError {
        CoreError::BadEncoding { source }
    }
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
