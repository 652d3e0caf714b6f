//! The designated router: request pipeline, namespace affinity and the
//! process-level context that wires the core together.
//!
//! A request travels: build message, elaborate the primary access chain,
//! synthesize an origin VK if needed, encode and sign, verify, then
//! either dispatch locally into the terminus or forward to the peer
//! router that owns the namespace.

pub mod config;
pub mod pipeline;
pub mod view;

pub use config::RouterConfig;
pub use config::load_entity_keyfile;
pub use pipeline::ListParams;
pub use pipeline::PublishParams;
pub use pipeline::QueryParams;
pub use pipeline::Router;
pub use pipeline::RouterClient;
pub use pipeline::SubscribeOutcome;
pub use pipeline::SubscribeParams;
pub use view::Expr;
