//! Local disk tree scanner.
//!
//! Walks a root breadth-first, diffs what it finds against the cached state
//! and produces upsert/remove events for the cache manager to apply. The
//! walk itself happens under `spawn_blocking`; UID assignment and cache
//! lookups are async.

use crate::domain::node::{FileMeta, LocalDirNode, LocalFileNode, Node, TrashStatus};
use crate::domain::uid::{Uid, UidAllocator, UidError, SUPER_ROOT_UID};
use crate::store::node_store::{NodeStore, StoreError};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace};

#[derive(Error, Debug)]
pub enum ScanError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("store error: {0}")]
	Store(#[from] StoreError),

	#[error("uid error: {0}")]
	Uid(#[from] UidError),

	#[error("scan cancelled")]
	Cancelled,
}

/// One observation from a scan, in emission order.
#[derive(Debug, Clone)]
pub enum ScanEvent {
	Upsert(Node),
	Remove(Node),
	/// The root itself is gone. Cached children are preserved until the user
	/// acknowledges; no removals follow this event.
	RootGone,
}

/// One entry read from disk: path, metadata, and whether to descend.
struct RawEntry {
	path: PathBuf,
	meta: std::fs::Metadata,
	is_dir: bool,
}

/// Breadth-first scanner for one subtree of a local device.
pub struct LocalDiskScanner {
	device_uid: Uid,
	root_path: PathBuf,
	seconds_precision_enough: bool,
}

impl LocalDiskScanner {
	pub fn new(device_uid: Uid, root_path: impl Into<PathBuf>, seconds_precision_enough: bool) -> Self {
		Self {
			device_uid,
			root_path: root_path.into(),
			seconds_precision_enough,
		}
	}

	/// Walk the subtree and diff against the store.
	///
	/// Emits `Upsert` for new or modified nodes (size, mtime or ctime
	/// differs), `Remove` for cached nodes absent on disk (children before
	/// parents), or a single `RootGone` when the root is missing.
	pub async fn scan(
		&self,
		store: &Arc<NodeStore>,
		allocator: &Arc<UidAllocator>,
		cancel: &watch::Receiver<bool>,
	) -> Result<Vec<ScanEvent>, ScanError> {
		let root_meta = {
			let root = self.root_path.clone();
			tokio::task::spawn_blocking(move || std::fs::symlink_metadata(&root))
				.await
				.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
		};
		let root_meta = match root_meta {
			Ok(meta) if meta.is_dir() => meta,
			_ => {
				info!("Scan root {:?} is gone", self.root_path);
				return Ok(vec![ScanEvent::RootGone]);
			}
		};

		let mut events = Vec::new();
		let mut seen: HashSet<Uid> = HashSet::new();

		let root_path_str = path_str(&self.root_path);
		let root_uid = store
			.get_or_assign_uid_for_path(&root_path_str, allocator)
			.await?;
		self.visit_dir(store, &root_path_str, root_uid, SUPER_ROOT_UID, &root_meta, &mut events, &mut seen)
			.await?;

		// BFS over directories.
		let mut dir_queue: VecDeque<(PathBuf, Uid)> = VecDeque::from([(self.root_path.clone(), root_uid)]);
		while let Some((dir_path, dir_uid)) = dir_queue.pop_front() {
			if *cancel.borrow() {
				return Err(ScanError::Cancelled);
			}

			let entries = {
				let dir_path = dir_path.clone();
				tokio::task::spawn_blocking(move || read_dir_entries(&dir_path))
					.await
					.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??
			};

			for entry in entries {
				let full_path = path_str(&entry.path);
				let uid = store.get_or_assign_uid_for_path(&full_path, allocator).await?;
				if entry.is_dir {
					self.visit_dir(store, &full_path, uid, dir_uid, &entry.meta, &mut events, &mut seen)
						.await?;
					dir_queue.push_back((entry.path, uid));
				} else {
					self.visit_file(store, &full_path, uid, dir_uid, &entry.meta, &mut events, &mut seen)
						.await?;
				}
			}
		}

		// Cached nodes we did not see are gone from disk. Children must be
		// removed before their parents, so order by path depth, deepest
		// first.
		let mut missing: Vec<Node> = store
			.subtree_nodes(root_uid)
			.await
			.into_iter()
			.filter(|node| node.is_live() && !seen.contains(&node.uid()))
			.collect();
		missing.sort_by_key(|node| {
			std::cmp::Reverse(node.cached_path().map(|p| p.matches('/').count()).unwrap_or(0))
		});
		for node in missing {
			debug!("Scan: cached node vanished from disk: {:?}", node.cached_path());
			events.push(ScanEvent::Remove(node));
		}

		Ok(events)
	}

	#[allow(clippy::too_many_arguments)]
	async fn visit_dir(
		&self,
		store: &Arc<NodeStore>,
		full_path: &str,
		uid: Uid,
		parent_uid: Uid,
		meta: &std::fs::Metadata,
		events: &mut Vec<ScanEvent>,
		seen: &mut HashSet<Uid>,
	) -> Result<(), ScanError> {
		seen.insert(uid);
		let file_meta = FileMeta::from_fs_metadata(meta);
		let node = Node::LocalDir(LocalDirNode {
			device_uid: self.device_uid,
			uid,
			parent_uid,
			name: name_of(full_path),
			full_path: full_path.to_string(),
			trashed: TrashStatus::NotTrashed,
			is_live: true,
			all_children_fetched: true,
			dir_meta: None,
			modify_ts: file_meta.modify_ts,
			change_ts: file_meta.change_ts,
		});

		match store.get(uid).await {
			Some(cached) if cached.is_dir() && cached.is_live() => {
				trace!("Scan: dir unchanged: {full_path}");
			}
			_ => events.push(ScanEvent::Upsert(node)),
		}
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	async fn visit_file(
		&self,
		store: &Arc<NodeStore>,
		full_path: &str,
		uid: Uid,
		parent_uid: Uid,
		meta: &std::fs::Metadata,
		events: &mut Vec<ScanEvent>,
		seen: &mut HashSet<Uid>,
	) -> Result<(), ScanError> {
		seen.insert(uid);
		let mut file_meta = FileMeta::from_fs_metadata(meta);

		let cached = store.get(uid).await;
		if let Some(cached) = &cached {
			if cached.is_live() && Node::meta_matches(
				cached,
				&Node::LocalFile(LocalFileNode {
					device_uid: self.device_uid,
					uid,
					parent_uid,
					name: name_of(full_path),
					full_path: full_path.to_string(),
					trashed: TrashStatus::NotTrashed,
					is_live: true,
					meta: file_meta.clone(),
				}),
				self.seconds_precision_enough,
			) {
				trace!("Scan: file unchanged: {full_path}");
				return Ok(());
			}
			// Changed, but a signature computed at the same (size, mtime) is
			// still valid and must not be recomputed.
			if let Some(cached_meta) = cached.file_meta() {
				if file_meta.signature_is_current(cached_meta) {
					file_meta.md5 = cached_meta.md5.clone();
					file_meta.sha256 = cached_meta.sha256.clone();
				}
			}
		}

		events.push(ScanEvent::Upsert(Node::LocalFile(LocalFileNode {
			device_uid: self.device_uid,
			uid,
			parent_uid,
			name: name_of(full_path),
			full_path: full_path.to_string(),
			trashed: TrashStatus::NotTrashed,
			is_live: true,
			meta: file_meta,
		})));
		Ok(())
	}
}

/// Read one directory's entries. Symlinks are reported as files (their own
/// metadata, never followed into).
fn read_dir_entries(dir_path: &Path) -> std::io::Result<Vec<RawEntry>> {
	let mut out = Vec::new();
	for entry in std::fs::read_dir(dir_path)? {
		let entry = entry?;
		let path = entry.path();
		let meta = match std::fs::symlink_metadata(&path) {
			Ok(meta) => meta,
			// Raced with a concurrent delete; skip.
			Err(_) => continue,
		};
		let is_dir = meta.is_dir() && !meta.file_type().is_symlink();
		out.push(RawEntry { path, meta, is_dir });
	}
	Ok(out)
}

fn path_str(path: &Path) -> String {
	path.to_string_lossy().to_string()
}

fn name_of(full_path: &str) -> String {
	Path::new(full_path)
		.file_name()
		.map(|n| n.to_string_lossy().to_string())
		.unwrap_or_else(|| full_path.to_string())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	async fn fixture() -> (TempDir, TempDir, Arc<NodeStore>, Arc<UidAllocator>) {
		let cache_dir = TempDir::new().unwrap();
		let root = TempDir::new().unwrap();
		let allocator = Arc::new(UidAllocator::load(cache_dir.path(), 1000, true).unwrap());
		let store = Arc::new(NodeStore::open(cache_dir.path(), Uid(2), &allocator).await.unwrap());
		(cache_dir, root, store, allocator)
	}

	fn cancel_token() -> watch::Receiver<bool> {
		// Receiver keeps returning the last value after the sender drops.
		let (_tx, rx) = watch::channel(false);
		rx
	}

	async fn apply(store: &Arc<NodeStore>, events: Vec<ScanEvent>) {
		for event in events {
			match event {
				ScanEvent::Upsert(node) => {
					store.upsert(node).await.unwrap();
				}
				ScanEvent::Remove(node) => {
					store.remove_batch(vec![node.uid()]).await.unwrap();
				}
				ScanEvent::RootGone => {}
			}
		}
	}

	#[tokio::test]
	async fn insert_then_remove_round_trip() {
		let (_cache, root, store, allocator) = fixture().await;
		let scanner = LocalDiskScanner::new(Uid(2), root.path(), true);
		let cancel = cancel_token();

		// Nothing on disk yet but the root itself.
		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();
		apply(&store, events).await;

		std::fs::write(root.path().join("hello.txt"), b"hi").unwrap();
		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();
		let upserts: Vec<_> = events
			.iter()
			.filter(|e| matches!(e, ScanEvent::Upsert(n) if n.is_file()))
			.collect();
		assert_eq!(upserts.len(), 1, "exactly one upsert for the new file");
		apply(&store, events).await;

		// Unchanged rescan emits nothing.
		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();
		assert!(events.is_empty(), "got {events:?}");

		std::fs::remove_file(root.path().join("hello.txt")).unwrap();
		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();
		let removes: Vec<_> = events
			.iter()
			.filter(|e| matches!(e, ScanEvent::Remove(_)))
			.collect();
		assert_eq!(removes.len(), 1, "exactly one remove for the deleted file");
	}

	#[tokio::test]
	async fn children_removed_before_parents() {
		let (_cache, root, store, allocator) = fixture().await;
		let scanner = LocalDiskScanner::new(Uid(2), root.path(), true);
		let cancel = cancel_token();

		std::fs::create_dir_all(root.path().join("a/b")).unwrap();
		std::fs::write(root.path().join("a/b/c.txt"), b"x").unwrap();
		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();
		apply(&store, events).await;

		std::fs::remove_dir_all(root.path().join("a")).unwrap();
		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();

		let removed_paths: Vec<String> = events
			.iter()
			.filter_map(|e| match e {
				ScanEvent::Remove(n) => n.cached_path().map(str::to_string),
				_ => None,
			})
			.collect();
		assert_eq!(removed_paths.len(), 3);
		let pos = |suffix: &str| {
			removed_paths
				.iter()
				.position(|p| p.ends_with(suffix))
				.unwrap()
		};
		assert!(pos("c.txt") < pos("a/b"));
		assert!(pos("a/b") < removed_paths.iter().position(|p| p.ends_with("/a")).unwrap());
	}

	#[tokio::test]
	async fn missing_root_emits_root_gone_only() {
		let (_cache, root, store, allocator) = fixture().await;
		let scanner = LocalDiskScanner::new(Uid(2), root.path(), true);
		let cancel = cancel_token();

		std::fs::write(root.path().join("keep.txt"), b"x").unwrap();
		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();
		apply(&store, events).await;
		let cached_before = store.node_count().await;

		let root_path = root.path().to_path_buf();
		drop(root);
		assert!(!root_path.exists());

		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();
		assert_eq!(events.len(), 1);
		assert!(matches!(events[0], ScanEvent::RootGone));
		// Cached children preserved.
		assert_eq!(store.node_count().await, cached_before);
	}

	#[tokio::test]
	async fn unchanged_file_keeps_cached_signature() {
		let (_cache, root, store, allocator) = fixture().await;
		let scanner = LocalDiskScanner::new(Uid(2), root.path(), true);
		let cancel = cancel_token();

		std::fs::write(root.path().join("sig.txt"), b"payload").unwrap();
		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();
		apply(&store, events).await;

		// Simulate the signature calculator filling in the hash.
		let uid = store
			.get_uid_for_path(&path_str(&root.path().join("sig.txt")))
			.await
			.unwrap();
		let mut node = store.get(uid).await.unwrap();
		if let Node::LocalFile(f) = &mut node {
			f.meta.md5 = Some("cafebabe".into());
		}
		store.upsert(node).await.unwrap();

		// Unchanged: no event at all, signature untouched.
		let events = scanner.scan(&store, &allocator, &cancel).await.unwrap();
		assert!(events.is_empty());
		assert_eq!(store.get(uid).await.unwrap().md5(), Some("cafebabe"));
	}
}
