//! Registry-backed resolution of trust objects, with an invariant-driven
//! cache and the chain-builder graph search.
//!
//! The registry (the blockchain source of truth) is an external
//! collaborator behind the [`Registry`] trait. [`Resolution`] layers the
//! coarse-locked cache described in the design on top of it and
//! implements the [`bosswave_core::Resolver`] seam consumed by message
//! verification. Two background tasks keep the cache honest: an expiry
//! sweep and a registry tail reader.

pub mod builder;
pub mod cache;
pub mod registry;

pub use builder::ChainBuildParams;
pub use builder::ChainBuilder;
pub use cache::ChainKey;
pub use cache::Resolution;
pub use registry::MemoryRegistry;
pub use registry::Registry;
pub use registry::RegistryError;
pub use registry::RegistryEvent;
pub use registry::RegistryLog;
