//! The peer link: a long-lived, reliable-reconnect client connection to a
//! remote designated router.
//!
//! A remote router proves its identity at connect time with a 96-byte
//! proof (`vk32 | sig64`): an Ed25519 signature over its TLS
//! certificate's signature bytes. Frames then carry
//! `(len u64 | seqno u64 | cmd u8 | body)`; point requests resolve a
//! single response frame, subscribe/query/list stream
//! `response, result*, end`. On transport failure the link backs off,
//! reconnects, re-verifies the proof and replays every active
//! subscription.

pub mod error;
pub mod frame;
pub mod link;
pub mod transport;

pub use error::PeerError;
pub use error::Result;
pub use frame::Frame;
pub use link::PeerEvent;
pub use link::PeerLink;
pub use transport::MemoryTransport;
pub use transport::PeerConnection;
pub use transport::PeerTransport;
pub use transport::TlsTransport;
