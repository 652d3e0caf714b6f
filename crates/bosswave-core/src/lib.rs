//! Core of the designated router: message codec and verification,
//! capability chain analysis, and the terminus subscription engine.
//!
//! Everything in this crate is transport-agnostic. The resolver and the
//! persisted store are consumed through traits; the router crate wires in
//! concrete implementations.

pub mod chain;
pub mod error;
pub mod message;
pub mod resolver;
pub mod store;
pub mod terminus;

pub use chain::ChainAnalysis;
pub use chain::analyze_access_chain;
pub use error::CoreError;
pub use error::Result;
pub use message::ElaboratePac;
pub use message::Message;
pub use message::MessageType;
pub use message::UniqueMessageId;
pub use resolver::DotLink;
pub use resolver::Resolver;
pub use store::MemoryStore;
pub use store::PersistedStore;
pub use terminus::Delivery;
pub use terminus::PublishOutcome;
pub use terminus::SubHandler;
pub use terminus::Terminus;
