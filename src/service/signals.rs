//! Signal fan-out to RPC subscribers.
//!
//! Subscribers register with an optional tree-id filter and get a bounded
//! queue. A subscriber that stops draining its queue is dropped -- there is
//! no backpressure to producers.

use crate::infrastructure::events::{Event, EventBus, SignalMsg};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// Sender name stamped on signals originating in the agent itself.
pub const SENDER_AGENT: &str = "agent";

struct Subscriber {
	id: u64,
	tree_filter: Option<String>,
	tx: mpsc::Sender<SignalMsg>,
}

/// A live subscription handle; dropping the receiver unsubscribes.
pub struct Subscription {
	pub id: u64,
	pub rx: mpsc::Receiver<SignalMsg>,
}

/// Multiplexes bus events out to RPC subscribers.
pub struct SignalHub {
	next_id: AtomicU64,
	subscribers: StdMutex<Vec<Subscriber>>,
}

impl SignalHub {
	/// Create the hub and start pumping the event bus into it.
	pub fn start(events: Arc<EventBus>) -> Arc<Self> {
		let hub = Arc::new(Self {
			next_id: AtomicU64::new(1),
			subscribers: StdMutex::new(Vec::new()),
		});

		let pump = hub.clone();
		let mut rx = events.subscribe();
		tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(event) => pump.publish(SignalMsg::new(SENDER_AGENT, event)),
					Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
						warn!("Signal hub lagged {skipped} events");
					}
					Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
				}
			}
		});
		hub
	}

	/// Subscribe, optionally to one tree's signals only. Signals without a
	/// tree id reach every subscriber.
	pub fn subscribe(&self, tree_filter: Option<String>) -> Subscription {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
		info!("Signal subscriber {id} attached (filter: {tree_filter:?})");
		self.subscribers
			.lock()
			.expect("signal hub poisoned")
			.push(Subscriber { id, tree_filter, tx });
		Subscription { id, rx }
	}

	/// Deliver a signal to every matching subscriber, dropping the slow and
	/// the gone.
	pub fn publish(&self, msg: SignalMsg) {
		let tree_id = event_tree_id(&msg.event).map(str::to_string);
		let mut subscribers = self.subscribers.lock().expect("signal hub poisoned");
		subscribers.retain(|sub| {
			if let (Some(filter), Some(tree_id)) = (&sub.tree_filter, &tree_id) {
				if filter != tree_id {
					return true;
				}
			}
			match sub.tx.try_send(msg.clone()) {
				Ok(()) => true,
				Err(mpsc::error::TrySendError::Full(_)) => {
					warn!("Dropping slow signal subscriber {}", sub.id);
					false
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					debug!("Signal subscriber {} went away", sub.id);
					false
				}
			}
		});
	}

	pub fn subscriber_count(&self) -> usize {
		self.subscribers.lock().expect("signal hub poisoned").len()
	}
}

fn event_tree_id(event: &Event) -> Option<&str> {
	match event {
		Event::TreeLoadStateUpdated { tree_id, .. }
		| Event::StatsUpdated { tree_id, .. }
		| Event::SelectionChanged { tree_id, .. } => Some(tree_id),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cache::TreeLoadState;

	#[tokio::test]
	async fn tree_filter_routes_signals() {
		let events = Arc::new(EventBus::default());
		let hub = SignalHub::start(events.clone());
		let mut left = hub.subscribe(Some("tree-left".into()));
		let mut all = hub.subscribe(None);

		hub.publish(SignalMsg::new(
			SENDER_AGENT,
			Event::TreeLoadStateUpdated {
				tree_id: "tree-right".into(),
				state: TreeLoadState::Loaded,
			},
		));
		hub.publish(SignalMsg::new(
			SENDER_AGENT,
			Event::TreeLoadStateUpdated {
				tree_id: "tree-left".into(),
				state: TreeLoadState::Loaded,
			},
		));

		// The filtered subscriber sees only its own tree.
		let msg = left.rx.recv().await.unwrap();
		match &msg.event {
			Event::TreeLoadStateUpdated { tree_id, .. } => assert_eq!(tree_id, "tree-left"),
			other => panic!("unexpected event {other:?}"),
		}
		// The unfiltered one sees both.
		assert!(all.rx.recv().await.is_some());
		assert!(all.rx.recv().await.is_some());
	}

	#[tokio::test]
	async fn slow_subscribers_are_dropped() {
		let events = Arc::new(EventBus::default());
		let hub = SignalHub::start(events);
		let subscription = hub.subscribe(None);

		for _ in 0..(SUBSCRIBER_QUEUE_DEPTH + 8) {
			hub.publish(SignalMsg::new(SENDER_AGENT, Event::AgentStarted));
		}
		assert_eq!(hub.subscriber_count(), 0);
		drop(subscription);
	}
}
