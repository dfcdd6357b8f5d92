//! Facade over the per-device stores, scanners, signature workers and cloud
//! pollers.
//!
//! Owns the tree-load state machine, multiplexes change events to the bus,
//! and is the single mutation path the executor uses. Directory aggregates
//! are recomputed from the in-memory indexes whenever served, so a stale
//! aggregate is never handed out.

use crate::cache::TreeLoadState;
use crate::config::AppConfig;
use crate::domain::device::{Device, DeviceError, DeviceRegistry, TreeType};
use crate::domain::identifier::NodeIdentifier;
use crate::domain::node::Node;
use crate::domain::uid::{Uid, UidAllocator, UidError, SUPER_ROOT_UID};
use crate::infrastructure::events::{Event, EventBus};
use crate::store::gdrive::{GDrivePoller, PollerError, RemoteFs};
use crate::store::local::{
	watcher, LocalDiskScanner, ScanError, ScanEvent, SigCalcConfig, SignatureCalculator,
};
use crate::store::node_store::{NodeStore, StoreError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const UPSERT_CHUNK: usize = 512;

#[derive(Error, Debug)]
pub enum CacheError {
	#[error("device error: {0}")]
	Device(#[from] DeviceError),

	#[error("store error: {0}")]
	Store(#[from] StoreError),

	#[error("scan error: {0}")]
	Scan(#[from] ScanError),

	#[error("cloud poller error: {0}")]
	Poller(#[from] PollerError),

	#[error("uid error: {0}")]
	Uid(#[from] UidError),

	#[error("no store attached for device {0}")]
	UnknownDevice(Uid),

	#[error("unknown display tree: {0}")]
	UnknownTree(String),

	#[error("node not found: {0}")]
	NodeNotFound(Uid),
}

/// A node paired with the identifier a client addresses it by -- what the
/// original wire surface calls an "SN".
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Sn {
	pub spid: NodeIdentifier,
	pub node: Node,
}

struct DisplayTreeMeta {
	root: NodeIdentifier,
	state: TreeLoadState,
}

struct DeviceRuntime {
	store: Arc<NodeStore>,
	remote: Option<Arc<dyn RemoteFs>>,
	poller: Option<Arc<GDrivePoller>>,
}

/// The unified cache over every attached device.
pub struct CacheManager {
	config: AppConfig,
	cache_dir: PathBuf,
	allocator: Arc<UidAllocator>,
	registry: Arc<DeviceRegistry>,
	events: Arc<EventBus>,
	devices: RwLock<HashMap<Uid, DeviceRuntime>>,
	trees: RwLock<HashMap<String, DisplayTreeMeta>>,
	worker_handles: Mutex<Vec<JoinHandle<()>>>,
	shutdown_tx: watch::Sender<bool>,
}

impl CacheManager {
	pub fn new(
		config: AppConfig,
		allocator: Arc<UidAllocator>,
		registry: Arc<DeviceRegistry>,
		events: Arc<EventBus>,
	) -> Self {
		let (shutdown_tx, _) = watch::channel(false);
		let cache_dir = config.cache_dir_path.clone();
		Self {
			config,
			cache_dir,
			allocator,
			registry,
			events,
			devices: RwLock::new(HashMap::new()),
			trees: RwLock::new(HashMap::new()),
			worker_handles: Mutex::new(Vec::new()),
			shutdown_tx,
		}
	}

	pub fn events(&self) -> &Arc<EventBus> {
		&self.events
	}

	pub fn registry(&self) -> &Arc<DeviceRegistry> {
		&self.registry
	}

	pub fn allocator(&self) -> &Arc<UidAllocator> {
		&self.allocator
	}

	pub fn seconds_precision_enough(&self) -> bool {
		self.config.is_seconds_precision_enough
	}

	// Device attachment

	/// Attach a local filesystem root: register the device, open its store,
	/// start its signature worker and (optionally) its live monitor.
	pub async fn attach_local_device(
		self: &Arc<Self>,
		root_path: &std::path::Path,
		friendly_name: &str,
	) -> Result<Device, CacheError> {
		let device = self.registry.get_or_register_local(root_path, friendly_name)?;
		if self.devices.read().await.contains_key(&device.device_uid) {
			return Ok(device);
		}

		let store = Arc::new(self.open_store(device.device_uid).await?);

		let sig_calc = SignatureCalculator::new(
			device.device_uid,
			store.clone(),
			self.events.clone(),
			SigCalcConfig {
				batch_interval_ms: self.config.signature_batch_interval_ms,
				bytes_per_batch_high_watermark: self.config.bytes_per_batch_high_watermark,
				large_file_threshold_bytes: self.config.large_file_size_threshold_bytes,
			},
		);
		let mut handles = vec![sig_calc.spawn(self.shutdown_tx.subscribe())];

		if self.config.enable_live_monitoring {
			match self.start_live_monitor(&device, root_path.to_path_buf()) {
				Ok(handle) => handles.push(handle),
				// Fall back to on-demand scanning; interface unchanged.
				Err(e) => warn!("Live monitoring unavailable for {:?}: {e}", root_path),
			}
		}
		self.worker_handles.lock().await.extend(handles);

		self.devices.write().await.insert(
			device.device_uid,
			DeviceRuntime {
				store,
				remote: None,
				poller: None,
			},
		);
		self.events.emit(Event::DeviceUpserted { device: device.clone() });
		Ok(device)
	}

	/// Attach a cloud-drive account behind a `RemoteFs` driver.
	pub async fn attach_gdrive_device(
		&self,
		client: Arc<dyn RemoteFs>,
		friendly_name: &str,
	) -> Result<Device, CacheError> {
		let account_id = client
			.account_id()
			.await
			.map_err(PollerError::Remote)?;
		let device = self.registry.get_or_register_gdrive(account_id, friendly_name)?;
		if self.devices.read().await.contains_key(&device.device_uid) {
			return Ok(device);
		}

		let store = Arc::new(self.open_store(device.device_uid).await?);
		let poller = Arc::new(GDrivePoller::new(
			device.device_uid,
			client.clone(),
			store.clone(),
			self.allocator.clone(),
			self.events.clone(),
		));
		if let Some(handle) = poller
			.clone()
			.spawn(self.config.gdrive_poll_interval_sec, self.shutdown_tx.subscribe())
		{
			self.worker_handles.lock().await.push(handle);
		}

		self.devices.write().await.insert(
			device.device_uid,
			DeviceRuntime {
				store,
				remote: Some(client),
				poller: Some(poller),
			},
		);
		self.events.emit(Event::DeviceUpserted { device: device.clone() });
		Ok(device)
	}

	/// Open a device store; a corrupt cache degrades to read-only instead of
	/// taking the whole agent down.
	async fn open_store(&self, device_uid: Uid) -> Result<NodeStore, CacheError> {
		match NodeStore::open(&self.cache_dir, device_uid, &self.allocator).await {
			Ok(store) => Ok(store),
			Err(StoreError::Corrupt(detail)) => {
				error!(
					"[E_STORE_CORRUPT] Device {device_uid} cache failed validation: {detail}; \
					 serving read-only"
				);
				Ok(NodeStore::open_degraded(&self.cache_dir, device_uid, &self.allocator).await?)
			}
			Err(e) => Err(e.into()),
		}
	}

	fn start_live_monitor(
		self: &Arc<Self>,
		device: &Device,
		root_path: PathBuf,
	) -> Result<JoinHandle<()>, notify::Error> {
		let (burst_tx, mut burst_rx) = mpsc::channel(64);
		let monitor_handle = watcher::start(
			root_path.clone(),
			self.config.local_change_batch_interval_ms,
			burst_tx,
			self.shutdown_tx.subscribe(),
		)?;

		// Each burst triggers a rescan of the whole root; racing bursts fold
		// into one. Weak handle: the task must not outlive the manager.
		let device_uid = device.device_uid;
		let manager = Arc::downgrade(self);
		Ok(tokio::spawn(async move {
			while let Some(burst) = burst_rx.recv().await {
				debug!("Live burst of {} paths on device {}", burst.len(), device_uid);
				let Some(manager) = manager.upgrade() else { break };
				if let Err(e) = manager.refresh_device_trees(device_uid).await {
					error!("Live refresh failed for device {device_uid}: {e}");
				}
			}
			let _ = monitor_handle.await;
		}))
	}

	pub async fn store_for(&self, device_uid: Uid) -> Result<Arc<NodeStore>, CacheError> {
		self.devices
			.read()
			.await
			.get(&device_uid)
			.map(|rt| rt.store.clone())
			.ok_or(CacheError::UnknownDevice(device_uid))
	}

	pub async fn remote_for(&self, device_uid: Uid) -> Result<Arc<dyn RemoteFs>, CacheError> {
		self.devices
			.read()
			.await
			.get(&device_uid)
			.and_then(|rt| rt.remote.clone())
			.ok_or(CacheError::UnknownDevice(device_uid))
	}

	pub async fn device(&self, device_uid: Uid) -> Result<Device, CacheError> {
		Ok(self.registry.get(device_uid)?)
	}

	pub async fn device_list(&self) -> Vec<Device> {
		self.registry.list()
	}

	// Tree lifecycle

	/// `NOT_LOADED -> LOADING -> LOADED | FAILED`, publishing each
	/// transition.
	pub async fn request_display_tree(
		&self,
		tree_id: &str,
		root: NodeIdentifier,
	) -> Result<TreeLoadState, CacheError> {
		{
			let mut trees = self.trees.write().await;
			let meta = trees.entry(tree_id.to_string()).or_insert(DisplayTreeMeta {
				root: root.clone(),
				state: TreeLoadState::NotLoaded,
			});
			meta.root = root;
		}
		self.start_subtree_load(tree_id).await
	}

	pub async fn start_subtree_load(&self, tree_id: &str) -> Result<TreeLoadState, CacheError> {
		let root = {
			let trees = self.trees.read().await;
			let meta = trees
				.get(tree_id)
				.ok_or_else(|| CacheError::UnknownTree(tree_id.to_string()))?;
			if matches!(meta.state, TreeLoadState::Loading | TreeLoadState::Refreshing) {
				return Ok(meta.state);
			}
			meta.root.clone()
		};

		self.set_tree_state(tree_id, TreeLoadState::Loading).await;
		match self.load_tree_root(&root).await {
			Ok(()) => {
				self.set_tree_state(tree_id, TreeLoadState::Loaded).await;
				self.emit_stats(tree_id, &root).await;
				Ok(TreeLoadState::Loaded)
			}
			Err(e) => {
				error!("Subtree load failed for {tree_id}: {e}");
				// One error surfaces; the tree stays subscribable.
				self.set_tree_state(tree_id, TreeLoadState::Failed).await;
				Err(e)
			}
		}
	}

	pub async fn refresh_subtree(&self, tree_id: &str) -> Result<TreeLoadState, CacheError> {
		let root = {
			let trees = self.trees.read().await;
			trees
				.get(tree_id)
				.ok_or_else(|| CacheError::UnknownTree(tree_id.to_string()))?
				.root
				.clone()
		};
		self.set_tree_state(tree_id, TreeLoadState::Refreshing).await;
		match self.sync_tree_root(&root).await {
			Ok(()) => {
				self.set_tree_state(tree_id, TreeLoadState::Loaded).await;
				self.emit_stats(tree_id, &root).await;
				Ok(TreeLoadState::Loaded)
			}
			Err(e) => {
				error!("Subtree refresh failed for {tree_id}: {e}");
				self.set_tree_state(tree_id, TreeLoadState::Failed).await;
				Err(e)
			}
		}
	}

	pub async fn tree_state(&self, tree_id: &str) -> Option<TreeLoadState> {
		self.trees.read().await.get(tree_id).map(|meta| meta.state)
	}

	pub async fn tree_root(&self, tree_id: &str) -> Option<NodeIdentifier> {
		self.trees.read().await.get(tree_id).map(|meta| meta.root.clone())
	}

	async fn set_tree_state(&self, tree_id: &str, state: TreeLoadState) {
		if let Some(meta) = self.trees.write().await.get_mut(tree_id) {
			meta.state = state;
		}
		self.events.emit(Event::TreeLoadStateUpdated {
			tree_id: tree_id.to_string(),
			state,
		});
	}

	/// Hydration (store already in memory) plus the policy-gated sync.
	async fn load_tree_root(&self, root: &NodeIdentifier) -> Result<(), CacheError> {
		let device = self.device(root.device_uid()).await?;
		match device.tree_type {
			TreeType::Local if self.config.sync_from_local_disk_on_cache_load => {
				self.sync_tree_root(root).await
			}
			TreeType::GDrive if self.config.sync_from_gdrive_on_cache_load => {
				self.sync_tree_root(root).await
			}
			_ => Ok(()),
		}
	}

	/// Authoritative sync of one root: disk scan or cloud poll.
	async fn sync_tree_root(&self, root: &NodeIdentifier) -> Result<(), CacheError> {
		let device = self.device(root.device_uid()).await?;
		match device.tree_type {
			TreeType::Local => {
				let path = root
					.first_path()
					.map(PathBuf::from)
					.or_else(|| device.root_path.clone())
					.ok_or(CacheError::UnknownDevice(device.device_uid))?;
				self.scan_local_subtree(device.device_uid, path).await
			}
			TreeType::GDrive => {
				let poller = self
					.devices
					.read()
					.await
					.get(&device.device_uid)
					.and_then(|rt| rt.poller.clone())
					.ok_or(CacheError::UnknownDevice(device.device_uid))?;
				poller.hydrate().await?;
				poller.poll_once().await?;
				Ok(())
			}
			TreeType::Mixed => Ok(()),
		}
	}

	/// Run the scanner over one local subtree and apply its events.
	pub async fn scan_local_subtree(
		&self,
		device_uid: Uid,
		root_path: PathBuf,
	) -> Result<(), CacheError> {
		let store = self.store_for(device_uid).await?;
		let scanner = LocalDiskScanner::new(
			device_uid,
			root_path.clone(),
			self.config.is_seconds_precision_enough,
		);
		let cancel = self.shutdown_tx.subscribe();
		let events = scanner.scan(&store, &self.allocator, &cancel).await?;
		self.apply_scan_events(device_uid, &root_path, events).await
	}

	async fn apply_scan_events(
		&self,
		device_uid: Uid,
		root_path: &std::path::Path,
		scan_events: Vec<ScanEvent>,
	) -> Result<(), CacheError> {
		let store = self.store_for(device_uid).await?;

		let mut upserts = Vec::new();
		let mut removes = Vec::new();
		for event in scan_events {
			match event {
				ScanEvent::Upsert(node) => upserts.push(node),
				ScanEvent::Remove(node) => removes.push(node),
				ScanEvent::RootGone => {
					// Policy: preserve cached children until the user
					// acknowledges; emit the single event and stop.
					self.events.emit(Event::RootGone {
						device_uid,
						root_path: root_path.to_string_lossy().to_string(),
					});
					return Ok(());
				}
			}
		}

		let mut applied_upserts = Vec::with_capacity(upserts.len());
		for chunk in upserts.chunks(UPSERT_CHUNK) {
			let applied = store.upsert_batch(chunk.to_vec()).await?;
			for node in &applied {
				self.events.emit(Event::NodeUpserted { node: node.clone() });
			}
			applied_upserts.extend(applied);
		}

		// Scanner emits removals children-first; removing and signalling one
		// at a time preserves that order on the bus.
		for node in &removes {
			store.remove_batch(vec![node.uid()]).await?;
			self.events.emit(Event::NodeRemoved { node: node.clone() });
		}

		if !applied_upserts.is_empty() || !removes.is_empty() {
			let root_uid = store
				.get_uid_for_path(&root_path.to_string_lossy())
				.await
				.unwrap_or(SUPER_ROOT_UID);
			self.events.emit(Event::SubtreeNodesChanged {
				subtree_root: NodeIdentifier::spid(
					device_uid,
					root_uid,
					root_path.to_string_lossy(),
				),
				upserted: applied_upserts,
				removed: removes,
			});
		}
		Ok(())
	}

	/// Refresh every display tree rooted on a device (live-monitor bursts).
	pub async fn refresh_device_trees(&self, device_uid: Uid) -> Result<(), CacheError> {
		let tree_ids: Vec<String> = {
			let trees = self.trees.read().await;
			trees
				.iter()
				.filter(|(_, meta)| meta.root.device_uid() == device_uid)
				.map(|(id, _)| id.clone())
				.collect()
		};
		if tree_ids.is_empty() {
			// No tree mounted; still keep the cache coherent.
			if let Ok(device) = self.device(device_uid).await {
				if let Some(path) = device.root_path {
					self.scan_local_subtree(device_uid, path).await?;
				}
			}
			return Ok(());
		}
		for tree_id in tree_ids {
			self.refresh_subtree(&tree_id).await?;
		}
		Ok(())
	}

	async fn emit_stats(&self, tree_id: &str, root: &NodeIdentifier) {
		if let Ok(store) = self.store_for(root.device_uid()).await {
			let stats = store.compute_dir_meta(root.node_uid()).await;
			self.events.emit(Event::StatsUpdated {
				tree_id: tree_id.to_string(),
				stats,
			});
		}
	}

	// Node reads

	pub async fn get_node_for_uid(&self, device_uid: Uid, uid: Uid) -> Result<Node, CacheError> {
		self.store_for(device_uid)
			.await?
			.get(uid)
			.await
			.ok_or(CacheError::NodeNotFound(uid))
	}

	pub async fn get_uid_for_local_path(
		&self,
		device_uid: Uid,
		full_path: &str,
	) -> Result<Uid, CacheError> {
		let store = self.store_for(device_uid).await?;
		Ok(store
			.get_or_assign_uid_for_path(full_path, &self.allocator)
			.await?)
	}

	/// Build the client-facing identifier for a node.
	pub async fn sn_for(&self, node: Node) -> Result<Sn, CacheError> {
		let spid = self.identifier_for(&node).await?;
		Ok(Sn { spid, node })
	}

	pub async fn identifier_for(&self, node: &Node) -> Result<NodeIdentifier, CacheError> {
		if let Some(path) = node.cached_path() {
			return Ok(NodeIdentifier::spid(node.device_uid(), node.uid(), path));
		}
		let store = self.store_for(node.device_uid()).await?;
		let paths = store.resolve_path_list(node.uid()).await;
		Ok(NodeIdentifier::mpid(node.device_uid(), node.uid(), paths))
	}

	pub async fn get_child_list(&self, parent: &NodeIdentifier) -> Result<Vec<Sn>, CacheError> {
		let store = self.store_for(parent.device_uid()).await?;
		let mut out = Vec::new();
		for child in store.get_children(parent.node_uid()).await {
			out.push(self.sn_for(child).await?);
		}
		Ok(out)
	}

	pub async fn get_ancestor_list(&self, spid: &NodeIdentifier) -> Result<Vec<Sn>, CacheError> {
		let store = self.store_for(spid.device_uid()).await?;
		let mut out = Vec::new();
		let mut cursor = store.get(spid.node_uid()).await;
		let mut hops = 0;
		while let Some(node) = cursor {
			let parents = node.parent_uids();
			let Some(&parent_uid) = parents.first() else {
				break;
			};
			if parent_uid == SUPER_ROOT_UID || parent_uid.is_null() {
				break;
			}
			cursor = store.get(parent_uid).await;
			if let Some(parent) = &cursor {
				out.push(self.sn_for(parent.clone()).await?);
			}
			hops += 1;
			if hops > 256 {
				warn!("Ancestor walk aborted at depth 256 for {}", spid.guid());
				break;
			}
		}
		Ok(out)
	}

	/// Resolve a path to a node on any device type: the path map for local
	/// devices, a name walk from the root for cloud devices.
	pub async fn resolve_path_to_node(
		&self,
		device_uid: Uid,
		full_path: &str,
	) -> Result<Option<Node>, CacheError> {
		let store = self.store_for(device_uid).await?;
		if let Some(uid) = store.get_uid_for_path(full_path).await {
			if let Some(node) = store.get(uid).await {
				return Ok(Some(node));
			}
		}

		// Cloud: walk children by name from the device root. The first
		// component names the root itself.
		let roots = store.get_children(SUPER_ROOT_UID).await;
		let Some(root) = roots.into_iter().next() else {
			return Ok(None);
		};
		let mut cursor = root;
		let mut components = full_path.split('/').filter(|c| !c.is_empty()).peekable();
		if components.peek() == Some(&cursor.name()) {
			components.next();
		}
		for component in components {
			match store.get_child_by_name(cursor.uid(), component).await {
				Some(next) => cursor = next,
				None => return Ok(None),
			}
		}
		Ok(Some(cursor))
	}

	// Mutations (executor and op manager only)

	pub async fn upsert_node(&self, node: Node) -> Result<Node, CacheError> {
		let store = self.store_for(node.device_uid()).await?;
		let node = store.upsert(node).await?;
		self.events.emit(Event::NodeUpserted { node: node.clone() });
		Ok(node)
	}

	pub async fn remove_node(&self, device_uid: Uid, uid: Uid) -> Result<Option<Node>, CacheError> {
		let store = self.store_for(device_uid).await?;
		let mut removed = store.remove_batch(vec![uid]).await?;
		let node = removed.pop();
		if let Some(node) = &node {
			self.events.emit(Event::NodeRemoved { node: node.clone() });
		}
		Ok(node)
	}

	/// Remove every planning node (is_live = false) on every device.
	pub async fn remove_all_planning_nodes(&self) -> Result<usize, CacheError> {
		let stores: Vec<Arc<NodeStore>> = self
			.devices
			.read()
			.await
			.values()
			.map(|rt| rt.store.clone())
			.collect();
		let mut removed_total = 0;
		for store in stores {
			let planning: Vec<Node> = store
				.subtree_nodes(SUPER_ROOT_UID)
				.await
				.into_iter()
				.filter(|node| !node.is_live())
				.collect();
			// Children before parents.
			let mut planning = planning;
			planning.sort_by_key(|node| {
				std::cmp::Reverse(
					node.cached_path().map(|p| p.matches('/').count()).unwrap_or(0),
				)
			});
			for node in planning {
				store.remove_batch(vec![node.uid()]).await?;
				self.events.emit(Event::NodeRemoved { node: node.clone() });
				removed_total += 1;
			}
		}
		Ok(removed_total)
	}

	pub async fn shutdown(&self) {
		info!("Cache manager shutting down");
		let _ = self.shutdown_tx.send(true);
		let mut handles = self.worker_handles.lock().await;
		for handle in handles.drain(..) {
			let _ = handle.await;
		}
	}
}

