//! Event bus for cache state changes.
//!
//! Components emit events after their mutation has been committed; the bus
//! fans them out on a bounded broadcast channel. Slow subscribers observe
//! `Lagged` and resynchronise from the cache rather than stalling producers.

use crate::cache::TreeLoadState;
use crate::domain::device::Device;
use crate::domain::identifier::{Guid, NodeIdentifier};
use crate::domain::node::{DirMeta, Node};
use crate::domain::op::ErrorHandlingStrategy;
use crate::domain::uid::Uid;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 1024;

/// Integer discriminator carried on the wire with every signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum Signal {
	AgentStarted = 1,
	AgentShutdown = 2,
	DeviceUpserted = 3,
	TreeLoadStateUpdated = 10,
	NodeUpserted = 11,
	NodeRemoved = 12,
	SubtreeNodesChanged = 13,
	StatsUpdated = 14,
	RootGone = 15,
	BatchFailed = 20,
	HandleBatchFailed = 21,
	OpExecPlayStateChanged = 22,
	UiEnablementToggled = 30,
	SelectionChanged = 31,
}

/// A change notification. Per-node events for one node are delivered in the
/// order the cache applied them; `StatsUpdated` is coalesced, not per-node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Event {
	AgentStarted,
	AgentShutdown,
	DeviceUpserted {
		device: Device,
	},
	TreeLoadStateUpdated {
		tree_id: String,
		state: TreeLoadState,
	},
	NodeUpserted {
		node: Node,
	},
	NodeRemoved {
		node: Node,
	},
	SubtreeNodesChanged {
		subtree_root: NodeIdentifier,
		upserted: Vec<Node>,
		removed: Vec<Node>,
	},
	StatsUpdated {
		tree_id: String,
		stats: DirMeta,
	},
	RootGone {
		device_uid: Uid,
		root_path: String,
	},
	BatchFailed {
		batch_uid: Uid,
		message: String,
		detail: String,
	},
	HandleBatchFailed {
		batch_uid: Uid,
		strategy: ErrorHandlingStrategy,
	},
	OpExecPlayStateChanged {
		playing: bool,
	},
	UiEnablementToggled {
		enabled: bool,
	},
	SelectionChanged {
		tree_id: String,
		selected: Vec<Guid>,
	},
}

impl Event {
	pub fn signal(&self) -> Signal {
		match self {
			Self::AgentStarted => Signal::AgentStarted,
			Self::AgentShutdown => Signal::AgentShutdown,
			Self::DeviceUpserted { .. } => Signal::DeviceUpserted,
			Self::TreeLoadStateUpdated { .. } => Signal::TreeLoadStateUpdated,
			Self::NodeUpserted { .. } => Signal::NodeUpserted,
			Self::NodeRemoved { .. } => Signal::NodeRemoved,
			Self::SubtreeNodesChanged { .. } => Signal::SubtreeNodesChanged,
			Self::StatsUpdated { .. } => Signal::StatsUpdated,
			Self::RootGone { .. } => Signal::RootGone,
			Self::BatchFailed { .. } => Signal::BatchFailed,
			Self::HandleBatchFailed { .. } => Signal::HandleBatchFailed,
			Self::OpExecPlayStateChanged { .. } => Signal::OpExecPlayStateChanged,
			Self::UiEnablementToggled { .. } => Signal::UiEnablementToggled,
			Self::SelectionChanged { .. } => Signal::SelectionChanged,
		}
	}
}

/// Wire envelope for a signal delivered to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMsg {
	pub sig_int: i32,
	pub sender: String,
	pub event: Event,
}

impl SignalMsg {
	pub fn new(sender: impl Into<String>, event: Event) -> Self {
		Self {
			sig_int: event.signal() as i32,
			sender: sender.into(),
			event,
		}
	}
}

/// Broadcast fan-out of post-commit events.
pub struct EventBus {
	tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
	fn default() -> Self {
		let (tx, _) = broadcast::channel(BUS_CAPACITY);
		Self { tx }
	}
}

impl EventBus {
	pub fn emit(&self, event: Event) {
		// A send error just means nobody is subscribed right now.
		let _ = self.tx.send(event);
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Event> {
		self.tx.subscribe()
	}

	pub fn subscriber_count(&self) -> usize {
		self.tx.receiver_count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn events_reach_subscribers() {
		let bus = EventBus::default();
		let mut rx = bus.subscribe();
		bus.emit(Event::AgentStarted);
		let event = rx.recv().await.unwrap();
		assert_eq!(event.signal(), Signal::AgentStarted);
	}

	#[tokio::test]
	async fn emit_without_subscribers_is_fine() {
		let bus = EventBus::default();
		bus.emit(Event::AgentShutdown);
	}
}
