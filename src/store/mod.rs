//! Durable per-device stores and the cache-coherence workers that feed them.

pub mod gdrive;
pub mod local;
pub mod node_store;

pub use node_store::{NodeStore, StoreError};
