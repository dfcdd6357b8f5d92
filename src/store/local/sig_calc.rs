//! Background MD5/SHA256 signature calculator.
//!
//! One worker per local device. Listens for upserted file nodes that lack
//! signatures, queues them, and hashes them in batches bounded by a byte
//! high-watermark, sleeping between batches so bulk loads don't monopolise
//! the disk. Cancellation is cooperative: checked between files, never
//! mid-file.

use crate::domain::node::Node;
use crate::domain::uid::Uid;
use crate::infrastructure::events::{Event, EventBus};
use crate::store::node_store::NodeStore;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
pub struct SigCalcConfig {
	pub batch_interval_ms: u64,
	pub bytes_per_batch_high_watermark: u64,
	pub large_file_threshold_bytes: u64,
}

impl Default for SigCalcConfig {
	fn default() -> Self {
		Self {
			batch_interval_ms: 1000,
			bytes_per_batch_high_watermark: 100 * 1024 * 1024,
			large_file_threshold_bytes: 1024 * 1024 * 1024,
		}
	}
}

/// Signature worker for one local device.
pub struct SignatureCalculator {
	device_uid: Uid,
	store: Arc<NodeStore>,
	events: Arc<EventBus>,
	config: SigCalcConfig,
}

impl SignatureCalculator {
	pub fn new(
		device_uid: Uid,
		store: Arc<NodeStore>,
		events: Arc<EventBus>,
		config: SigCalcConfig,
	) -> Self {
		Self {
			device_uid,
			store,
			events,
			config,
		}
	}

	/// Spawn the worker loop. It drains until `shutdown` flips true.
	pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		tokio::spawn(async move {
			let mut bus_rx = self.events.subscribe();
			let mut queue: VecDeque<Uid> = VecDeque::new();
			let mut interval =
				tokio::time::interval(Duration::from_millis(self.config.batch_interval_ms.max(1)));
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

			info!("Signature calculator for device {} started", self.device_uid);
			loop {
				tokio::select! {
					_ = shutdown.changed() => {
						if *shutdown.borrow() {
							break;
						}
					}
					event = bus_rx.recv() => {
						match event {
							Ok(event) => self.enqueue_from_event(&event, &mut queue),
							Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
								warn!("Signature calculator lagged {skipped} events");
							}
							Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
						}
					}
					_ = interval.tick() => {
						if !queue.is_empty() {
							self.process_batch(&mut queue, &shutdown).await;
						}
					}
				}
			}
			info!("Signature calculator for device {} stopped", self.device_uid);
		})
	}

	fn enqueue_from_event(&self, event: &Event, queue: &mut VecDeque<Uid>) {
		let consider = |node: &Node, queue: &mut VecDeque<Uid>| {
			if node.device_uid() == self.device_uid
				&& node.is_file()
				&& node.is_live()
				&& node.file_meta().map(|m| !m.has_signature()).unwrap_or(false)
			{
				trace!("Queueing node {} for signature calc", node.uid());
				queue.push_back(node.uid());
			}
		};
		match event {
			Event::NodeUpserted { node } => consider(node, queue),
			Event::SubtreeNodesChanged { upserted, .. } => {
				for node in upserted {
					consider(node, queue);
				}
			}
			_ => {}
		}
	}

	/// Pull nodes off the queue up to the byte high-watermark and hash them.
	async fn process_batch(&self, queue: &mut VecDeque<Uid>, shutdown: &watch::Receiver<bool>) {
		let mut batch = Vec::new();
		let mut batch_bytes: u64 = 0;
		while let Some(uid) = queue.pop_front() {
			if let Some(node) = self.store.get(uid).await {
				batch_bytes += node.size_bytes().unwrap_or(0);
				batch.push(node);
			}
			if batch_bytes > self.config.bytes_per_batch_high_watermark {
				break;
			}
		}
		if batch.is_empty() {
			return;
		}
		debug!(
			"Signature batch: {} nodes, {} bytes ({} still queued)",
			batch.len(),
			batch_bytes,
			queue.len()
		);

		for node in batch {
			if *shutdown.borrow() {
				return;
			}
			if let Err(e) = self.calc_and_store(node.uid()).await {
				debug!("Signature calc skipped node {}: {e}", node.uid());
			}
		}
	}

	/// Hash one node's content and write the signature back through the
	/// store. Returns false when the node no longer needs (or can't take) a
	/// signature.
	pub async fn calc_and_store(&self, uid: Uid) -> Result<bool, String> {
		// Re-fetch: the node may have been removed or re-hashed since it was
		// queued.
		let Some(node) = self.store.get(uid).await else {
			return Ok(false);
		};
		let Node::LocalFile(mut file) = node else {
			return Ok(false);
		};
		if file.meta.has_signature() {
			return Ok(false);
		}

		let size = file.meta.size_bytes.unwrap_or(0);
		if size > self.config.large_file_threshold_bytes {
			info!(
				"Calculating signature for large file ({} bytes), this may take a while: {}",
				size, file.full_path
			);
		}

		let path = file.full_path.clone();
		let result = tokio::task::spawn_blocking(move || compute_signatures(Path::new(&path)))
			.await
			.map_err(|e| e.to_string())?;

		let (md5, sha256) = match result {
			Ok(sigs) => sigs,
			// Most likely deleted from disk between scan and hash.
			Err(e) => {
				debug!("Failed to hash {}: {e}; assuming file was removed", file.full_path);
				return Ok(false);
			}
		};

		file.meta.md5 = Some(md5);
		file.meta.sha256 = Some(sha256);
		let node = Node::LocalFile(file);
		let node = self
			.store
			.upsert(node)
			.await
			.map_err(|e| e.to_string())?;
		self.events.emit(Event::NodeUpserted { node });
		Ok(true)
	}
}

/// Single-pass MD5 + SHA256 of a file, hex-encoded.
pub fn compute_signatures(path: &Path) -> std::io::Result<(String, String)> {
	let mut file = std::fs::File::open(path)?;
	let mut md5 = Md5::new();
	let mut sha256 = Sha256::new();
	let mut buf = [0u8; 64 * 1024];
	loop {
		let n = file.read(&mut buf)?;
		if n == 0 {
			break;
		}
		md5.update(&buf[..n]);
		sha256.update(&buf[..n]);
	}
	Ok((hex::encode(md5.finalize()), hex::encode(sha256.finalize())))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::node::{FileMeta, LocalFileNode, TrashStatus};
	use crate::domain::uid::UidAllocator;
	use tempfile::TempDir;

	#[test]
	fn known_signatures() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("hello.txt");
		std::fs::write(&path, b"hello").unwrap();
		let (md5, sha256) = compute_signatures(&path).unwrap();
		assert_eq!(md5, "5d41402abc4b2a76b9719d911017c592");
		assert_eq!(
			sha256,
			"2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
		);
	}

	async fn calculator(cache_dir: &TempDir) -> SignatureCalculator {
		let allocator = Arc::new(UidAllocator::load(cache_dir.path(), 1000, true).unwrap());
		allocator.ensure_next_uid_greater_than(Uid(500)).unwrap();
		let store = Arc::new(
			NodeStore::open(cache_dir.path(), Uid(2), &allocator)
				.await
				.unwrap(),
		);
		SignatureCalculator::new(
			Uid(2),
			store,
			Arc::new(EventBus::default()),
			SigCalcConfig::default(),
		)
	}

	fn file_node(uid: u32, path: &std::path::Path) -> Node {
		let meta = std::fs::metadata(path).unwrap();
		Node::LocalFile(LocalFileNode {
			device_uid: Uid(2),
			uid: Uid(uid),
			parent_uid: Uid(1),
			name: path.file_name().unwrap().to_string_lossy().to_string(),
			full_path: path.to_string_lossy().to_string(),
			trashed: TrashStatus::NotTrashed,
			is_live: true,
			meta: FileMeta::from_fs_metadata(&meta),
		})
	}

	#[tokio::test]
	async fn signature_lands_in_store() {
		let cache_dir = TempDir::new().unwrap();
		let data_dir = TempDir::new().unwrap();
		let path = data_dir.path().join("a.bin");
		std::fs::write(&path, b"payload").unwrap();

		let calc = calculator(&cache_dir).await;
		calc.store.upsert(file_node(100, &path)).await.unwrap();

		assert!(calc.calc_and_store(Uid(100)).await.unwrap());
		let node = calc.store.get(Uid(100)).await.unwrap();
		assert!(node.md5().is_some());
	}

	#[tokio::test]
	async fn already_signed_nodes_are_skipped() {
		let cache_dir = TempDir::new().unwrap();
		let data_dir = TempDir::new().unwrap();
		let path = data_dir.path().join("b.bin");
		std::fs::write(&path, b"payload").unwrap();

		let calc = calculator(&cache_dir).await;
		let mut node = file_node(101, &path);
		if let Node::LocalFile(f) = &mut node {
			f.meta.md5 = Some("precomputed".into());
		}
		calc.store.upsert(node).await.unwrap();

		// Signature present and (size, modify_ts) unchanged: no recompute.
		assert!(!calc.calc_and_store(Uid(101)).await.unwrap());
		assert_eq!(calc.store.get(Uid(101)).await.unwrap().md5(), Some("precomputed"));
	}

	#[tokio::test]
	async fn vanished_file_is_not_an_error() {
		let cache_dir = TempDir::new().unwrap();
		let data_dir = TempDir::new().unwrap();
		let path = data_dir.path().join("gone.bin");
		std::fs::write(&path, b"payload").unwrap();

		let calc = calculator(&cache_dir).await;
		calc.store.upsert(file_node(102, &path)).await.unwrap();
		std::fs::remove_file(&path).unwrap();

		assert!(!calc.calc_and_store(Uid(102)).await.unwrap());
	}
}
