//! The cache manager: facade over the per-device stores and their
//! coherence workers.

pub mod manager;

use serde::{Deserialize, Serialize};

pub use manager::{CacheError, CacheManager, Sn};

/// Load state of one displayed subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeLoadState {
	NotLoaded,
	Loading,
	Loaded,
	Refreshing,
	Failed,
}
