//! Broker engine implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::{MemoryBroker, MemoryEngine, Operation};
