//! Cloud-drive snapshot hydration and incremental change polling.
//!
//! Initial load walks the paginated full listing; afterwards a persisted
//! change-page cursor keeps the cache coherent. Multi-parent entries are
//! inserted once and linked to each parent. At most one poll per device is
//! in flight; 429s and 5xxs back off exponentially.

use crate::domain::node::{
	FileMeta, GDriveFileNode, GDriveFolderNode, GDriveIdentity, Node, TrashStatus,
};
use crate::domain::uid::{Uid, UidAllocator, UidError, SUPER_ROOT_UID};
use crate::infrastructure::database::kv_keys;
use crate::infrastructure::events::{Event, EventBus};
use crate::store::gdrive::{RemoteChange, RemoteEntry, RemoteError, RemoteFs};
use crate::store::node_store::{NodeStore, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_RETRIES: u32 = 5;
const UPSERT_CHUNK: usize = 512;

#[derive(Error, Debug)]
pub enum PollerError {
	#[error("remote error: {0}")]
	Remote(#[from] RemoteError),

	#[error("store error: {0}")]
	Store(#[from] StoreError),

	#[error("uid error: {0}")]
	Uid(#[from] UidError),
}

/// Change poller for one cloud device.
pub struct GDrivePoller {
	device_uid: Uid,
	client: Arc<dyn RemoteFs>,
	store: Arc<NodeStore>,
	allocator: Arc<UidAllocator>,
	events: Arc<EventBus>,
	in_flight: Mutex<()>,
}

impl GDrivePoller {
	pub fn new(
		device_uid: Uid,
		client: Arc<dyn RemoteFs>,
		store: Arc<NodeStore>,
		allocator: Arc<UidAllocator>,
		events: Arc<EventBus>,
	) -> Self {
		Self {
			device_uid,
			client,
			store,
			allocator,
			events,
			in_flight: Mutex::new(()),
		}
	}

	/// Full snapshot fetch. A no-op when a change cursor is already
	/// persisted (the incremental path owns coherence from then on).
	pub async fn hydrate(&self) -> Result<usize, PollerError> {
		if self.store.kv_get(kv_keys::CHANGE_CURSOR).await?.is_some() {
			debug!("Device {} already hydrated; skipping full listing", self.device_uid);
			return Ok(0);
		}
		let _guard = self.in_flight.lock().await;

		let root_goog_id = with_backoff(|| self.client.root_goog_id()).await?;

		let mut entries: Vec<RemoteEntry> = Vec::new();
		let mut page_token = None;
		loop {
			let (page, next) = {
				let token = page_token.clone();
				with_backoff(|| self.client.list_page(token.clone())).await?
			};
			entries.extend(page);
			match next {
				Some(next) => page_token = Some(next),
				None => break,
			}
		}
		info!(
			"Full listing for device {}: {} entries",
			self.device_uid,
			entries.len()
		);

		// Pass 1: pin a UID per goog_id so parent links can resolve
		// regardless of listing order.
		let mut goog_to_uid: HashMap<String, Uid> = HashMap::new();
		goog_to_uid.insert(root_goog_id.clone(), self.uid_for_goog_id(&root_goog_id).await?);
		for entry in &entries {
			let uid = self.uid_for_goog_id(&entry.goog_id).await?;
			goog_to_uid.insert(entry.goog_id.clone(), uid);
		}

		// Root node first so children have something to hang from.
		let root_uid = goog_to_uid[&root_goog_id];
		let root = Node::GDriveFolder(GDriveFolderNode {
			device_uid: self.device_uid,
			uid: root_uid,
			name: "My Drive".to_string(),
			identity: GDriveIdentity {
				goog_id: Some(root_goog_id.clone()),
				owner_uid: None,
				drive_id: None,
				parent_uids: vec![SUPER_ROOT_UID],
			},
			trashed: TrashStatus::NotTrashed,
			is_live: true,
			all_children_fetched: true,
			dir_meta: None,
			create_ts: None,
			modify_ts: None,
		});
		self.store.upsert(root.clone()).await?;

		// Pass 2: build and upsert nodes in chunks, folders before files so
		// the name-uniqueness hook sees parents first.
		let mut nodes = Vec::with_capacity(entries.len());
		for entry in &entries {
			nodes.push(self.entry_to_node(entry, Some(&goog_to_uid)).await?);
		}
		nodes.sort_by_key(|n| if n.is_dir() { 0 } else { 1 });

		let total = nodes.len();
		for chunk in nodes.chunks(UPSERT_CHUNK) {
			let applied = self.store.upsert_batch(chunk.to_vec()).await?;
			self.events.emit(Event::SubtreeNodesChanged {
				subtree_root: root.node_identifier(),
				upserted: applied,
				removed: Vec::new(),
			});
		}

		let cursor = with_backoff(|| self.client.start_cursor()).await?;
		self.store.kv_put(kv_keys::CHANGE_CURSOR, &cursor).await?;
		Ok(total)
	}

	/// Apply all pending change pages. Returns the number of changes
	/// applied, or 0 immediately when a poll is already in flight.
	pub async fn poll_once(&self) -> Result<usize, PollerError> {
		let Ok(_guard) = self.in_flight.try_lock() else {
			debug!("Poll already in flight for device {}; skipping", self.device_uid);
			return Ok(0);
		};

		let Some(mut cursor) = self.store.kv_get(kv_keys::CHANGE_CURSOR).await? else {
			drop(_guard);
			return self.hydrate().await;
		};

		let mut applied = 0usize;
		loop {
			let page = {
				let cursor = cursor.clone();
				with_backoff(|| self.client.changes_page(&cursor)).await?
			};
			for change in &page.changes {
				applied += self.apply_change(change).await?;
			}
			// Cursor is persisted only after the page it covers is applied.
			self.store.kv_put(kv_keys::CHANGE_CURSOR, &page.next_cursor).await?;
			cursor = page.next_cursor;
			if !page.has_more {
				break;
			}
		}
		if applied > 0 {
			info!("Applied {} cloud changes for device {}", applied, self.device_uid);
		}
		Ok(applied)
	}

	/// Run `poll_once` forever on an interval. Interval zero disables
	/// polling entirely (the default).
	pub fn spawn(self: Arc<Self>, poll_interval_sec: u64, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
		if poll_interval_sec == 0 {
			return None;
		}
		Some(tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(poll_interval_sec));
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = shutdown.changed() => {
						if *shutdown.borrow() {
							break;
						}
					}
					_ = interval.tick() => {
						if let Err(e) = self.poll_once().await {
							warn!("Cloud poll failed for device {}: {e}", self.device_uid);
						}
					}
				}
			}
		}))
	}

	async fn apply_change(&self, change: &RemoteChange) -> Result<usize, PollerError> {
		match change {
			RemoteChange::Upsert(entry) => {
				let node = self.entry_to_node(entry, None).await?;
				let node = self.store.upsert(node).await?;
				self.events.emit(Event::NodeUpserted { node });
				Ok(1)
			}
			RemoteChange::Remove { goog_id } => {
				let Some(node) = self.store.get_by_goog_id(goog_id).await else {
					return Ok(0);
				};
				self.store.remove_batch(vec![node.uid()]).await?;
				self.events.emit(Event::NodeRemoved { node });
				Ok(1)
			}
		}
	}

	async fn uid_for_goog_id(&self, goog_id: &str) -> Result<Uid, PollerError> {
		if let Some(node) = self.store.get_by_goog_id(goog_id).await {
			return Ok(node.uid());
		}
		// Bind through the path map so the goog_id keeps its UID across
		// removal and re-sight, like any other path.
		Ok(self
			.store
			.get_or_assign_uid_for_path(&format!("goog://{goog_id}"), &self.allocator)
			.await?)
	}

	/// Normalise a vendor entry into a node, resolving parent links through
	/// `goog_to_uid` (initial load) or the store (incremental).
	async fn entry_to_node(
		&self,
		entry: &RemoteEntry,
		goog_to_uid: Option<&HashMap<String, Uid>>,
	) -> Result<Node, PollerError> {
		let uid = match goog_to_uid.and_then(|m| m.get(&entry.goog_id)) {
			Some(uid) => *uid,
			None => self.uid_for_goog_id(&entry.goog_id).await?,
		};

		let mut parent_uids = Vec::with_capacity(entry.parent_goog_ids.len());
		for parent_goog_id in &entry.parent_goog_ids {
			let resolved = match goog_to_uid.and_then(|m| m.get(parent_goog_id)) {
				Some(uid) => Some(*uid),
				None => self.store.get_by_goog_id(parent_goog_id).await.map(|n| n.uid()),
			};
			match resolved {
				Some(parent_uid) => parent_uids.push(parent_uid),
				None => debug!(
					"Dropping unresolved parent {} of {}",
					parent_goog_id, entry.goog_id
				),
			}
		}

		let trashed = if entry.explicitly_trashed {
			TrashStatus::ExplicitlyTrashed
		} else if parent_uids.is_empty() {
			// Unparented means trashed.
			TrashStatus::ImplicitlyTrashed
		} else {
			TrashStatus::NotTrashed
		};

		let identity = GDriveIdentity {
			goog_id: Some(entry.goog_id.clone()),
			owner_uid: None,
			drive_id: entry.drive_id.clone(),
			parent_uids,
		};

		let node = if entry.is_folder {
			Node::GDriveFolder(GDriveFolderNode {
				device_uid: self.device_uid,
				uid,
				name: entry.name.clone(),
				identity,
				trashed,
				is_live: true,
				all_children_fetched: false,
				dir_meta: None,
				create_ts: entry.create_ts,
				modify_ts: entry.modify_ts,
			})
		} else {
			let mime_type_uid = match &entry.mime_type {
				Some(mime) => Some(
					self.store
						.get_or_assign_uid_for_path(&format!("mime://{mime}"), &self.allocator)
						.await?,
				),
				None => None,
			};
			Node::GDriveFile(GDriveFileNode {
				device_uid: self.device_uid,
				uid,
				name: entry.name.clone(),
				identity,
				trashed,
				is_live: true,
				meta: FileMeta {
					size_bytes: entry.size_bytes,
					sync_ts: Some(crate::domain::node::now_millis()),
					modify_ts: entry.modify_ts,
					change_ts: entry.modify_ts,
					create_ts: entry.create_ts,
					md5: entry.md5.clone(),
					sha256: None,
				},
				version: entry.version,
				mime_type_uid,
			})
		};
		Ok(node)
	}
}

/// Retry a transient-failing remote call with exponential backoff:
/// 1s, 2s, 4s, 8s, 16s.
async fn with_backoff<T, F, Fut>(mut call: F) -> Result<T, RemoteError>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, RemoteError>>,
{
	let mut attempt = 0u32;
	loop {
		match call().await {
			Ok(value) => return Ok(value),
			Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
				let delay = Duration::from_secs(1u64 << attempt);
				warn!("Transient remote error ({e}); retrying in {delay:?}");
				tokio::time::sleep(delay).await;
				attempt += 1;
			}
			Err(e) => return Err(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex as StdMutex;
	use tempfile::TempDir;
	use uuid::Uuid as UuidValue;

	#[derive(Default)]
	struct FakeDrive {
		entries: StdMutex<Vec<RemoteEntry>>,
		pages: StdMutex<Vec<crate::store::gdrive::ChangePage>>,
	}

	#[async_trait::async_trait]
	impl RemoteFs for FakeDrive {
		async fn account_id(&self) -> Result<UuidValue, RemoteError> {
			Ok(UuidValue::nil())
		}

		async fn root_goog_id(&self) -> Result<String, RemoteError> {
			Ok("root".to_string())
		}

		async fn list_page(
			&self,
			_page_token: Option<String>,
		) -> Result<(Vec<RemoteEntry>, Option<String>), RemoteError> {
			Ok((self.entries.lock().unwrap().clone(), None))
		}

		async fn start_cursor(&self) -> Result<String, RemoteError> {
			Ok("cursor-0".to_string())
		}

		async fn changes_page(
			&self,
			_cursor: &str,
		) -> Result<crate::store::gdrive::ChangePage, RemoteError> {
			let mut pages = self.pages.lock().unwrap();
			if pages.is_empty() {
				Ok(crate::store::gdrive::ChangePage {
					changes: Vec::new(),
					next_cursor: "cursor-end".to_string(),
					has_more: false,
				})
			} else {
				Ok(pages.remove(0))
			}
		}

		async fn create_folder(&self, _: &str, _: &str) -> Result<RemoteEntry, RemoteError> {
			Err(RemoteError::Protocol("not scripted".into()))
		}

		async fn upload_file(
			&self,
			_: &std::path::Path,
			_: &str,
			_: &str,
		) -> Result<RemoteEntry, RemoteError> {
			Err(RemoteError::Protocol("not scripted".into()))
		}

		async fn copy_file(&self, _: &str, _: &str, _: &str) -> Result<RemoteEntry, RemoteError> {
			Err(RemoteError::Protocol("not scripted".into()))
		}

		async fn move_node(
			&self,
			_: &str,
			_: &str,
			_: &str,
			_: &str,
		) -> Result<RemoteEntry, RemoteError> {
			Err(RemoteError::Protocol("not scripted".into()))
		}

		async fn delete_node(&self, _: &str) -> Result<(), RemoteError> {
			Ok(())
		}

		async fn download_file(&self, _: &str, _: &std::path::Path) -> Result<(), RemoteError> {
			Ok(())
		}
	}

	fn folder(goog_id: &str, name: &str, parents: &[&str]) -> RemoteEntry {
		RemoteEntry {
			goog_id: goog_id.into(),
			name: name.into(),
			parent_goog_ids: parents.iter().map(|s| s.to_string()).collect(),
			is_folder: true,
			explicitly_trashed: false,
			size_bytes: None,
			md5: None,
			version: None,
			mime_type: None,
			drive_id: None,
			create_ts: None,
			modify_ts: None,
		}
	}

	fn file(goog_id: &str, name: &str, parents: &[&str]) -> RemoteEntry {
		RemoteEntry {
			is_folder: false,
			size_bytes: Some(42),
			md5: Some("aa".into()),
			mime_type: Some("text/plain".into()),
			..folder(goog_id, name, parents)
		}
	}

	async fn poller(cache_dir: &TempDir, drive: Arc<FakeDrive>) -> GDrivePoller {
		let allocator = Arc::new(UidAllocator::load(cache_dir.path(), 1000, true).unwrap());
		let store = Arc::new(
			NodeStore::open(cache_dir.path(), Uid(3), &allocator)
				.await
				.unwrap(),
		);
		GDrivePoller::new(Uid(3), drive, store, allocator, Arc::new(EventBus::default()))
	}

	#[tokio::test]
	async fn hydrate_links_multi_parent_entries_once() {
		let cache_dir = TempDir::new().unwrap();
		let drive = Arc::new(FakeDrive::default());
		drive.entries.lock().unwrap().extend([
			folder("d1", "docs", &["root"]),
			folder("d2", "shared", &["root"]),
			file("f1", "multi.txt", &["d1", "d2"]),
		]);

		let poller = poller(&cache_dir, drive).await;
		let loaded = poller.hydrate().await.unwrap();
		assert_eq!(loaded, 3);

		let node = poller.store.get_by_goog_id("f1").await.unwrap();
		assert_eq!(node.parent_uids().len(), 2, "inserted once, linked to each parent");

		// Second hydrate is a no-op (cursor persisted).
		assert_eq!(poller.hydrate().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn poll_applies_changes_and_advances_cursor() {
		let cache_dir = TempDir::new().unwrap();
		let drive = Arc::new(FakeDrive::default());
		drive
			.entries
			.lock()
			.unwrap()
			.extend([folder("d1", "docs", &["root"]), file("f1", "a.txt", &["d1"])]);

		let poller = poller(&cache_dir, drive.clone()).await;
		poller.hydrate().await.unwrap();

		drive.pages.lock().unwrap().push(crate::store::gdrive::ChangePage {
			changes: vec![
				RemoteChange::Upsert(file("f2", "b.txt", &["d1"])),
				RemoteChange::Remove {
					goog_id: "f1".to_string(),
				},
			],
			next_cursor: "cursor-1".to_string(),
			has_more: false,
		});

		let applied = poller.poll_once().await.unwrap();
		assert_eq!(applied, 2);
		assert!(poller.store.get_by_goog_id("f1").await.is_none());
		assert!(poller.store.get_by_goog_id("f2").await.is_some());
		assert_eq!(
			poller.store.kv_get(kv_keys::CHANGE_CURSOR).await.unwrap().as_deref(),
			Some("cursor-1")
		);
	}
}
