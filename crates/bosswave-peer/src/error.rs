//! Peer link error types.

use snafu::Snafu;

/// Failures of the peer link.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PeerError {
    /// The underlying transport failed.
    #[snafu(display("peer transport failure: {source}"))]
    Transport {
        /// The I/O failure.
        source: std::io::Error,
    },

    /// The connect-time identity proof did not verify.
    #[snafu(display("peer identity proof rejected: {reason}"))]
    BadProof {
        /// Why the proof was rejected.
        reason: String,
    },

    /// The remote presented a different VK than expected.
    #[snafu(display("peer has a different VK than expected"))]
    WrongPeer,

    /// The remote answered a request with an error status.
    #[snafu(display("peer returned status {code}: {message}"))]
    Status {
        /// Remote status code.
        code: u16,
        /// Remote status message.
        message: String,
    },

    /// The link dropped while a point request was in flight.
    #[snafu(display("peer disconnected with the request in flight"))]
    Disconnected,

    /// A frame violated the protocol.
    #[snafu(display("bad peer frame: {reason}"))]
    BadFrame {
        /// What was malformed.
        reason: String,
    },
}

impl From<std::io::Error> for PeerError {
    fn from(source: std::io::Error) -> PeerError {
        PeerError::Transport { source }
    }
}

/// Result alias for peer link operations.
pub type Result<T> = std::result::Result<T, PeerError>;
