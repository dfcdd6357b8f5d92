//! Per-device durable node cache.
//!
//! A `NodeStore` hydrates the whole device database into memory on open and
//! keeps three secondary indexes: children by `(parent_uid, name)`, cloud
//! `goog_id`s, and the path-to-UID map. Reads clone out of a short `RwLock`
//! read guard; mutations serialise on a per-device writer mutex and are
//! written through SQLite in a transaction before memory changes, so a crash
//! can lose at most the mutation in flight.

use crate::domain::node::{
	now_millis, DirMeta, FileMeta, GDriveFileNode, GDriveFolderNode, GDriveIdentity, LocalDirNode,
	LocalFileNode, Node, TrashStatus,
};
use crate::domain::op::{OpStatus, OpType, UserOp};
use crate::domain::uid::{Uid, UidAllocator, UidError, SUPER_ROOT_UID};
use crate::infrastructure::database::{device_db_path, entities, Database};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
	ActiveValue::Set, ColumnTrait, EntityTrait, QueryFilter, TransactionTrait,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum StoreError {
	#[error("store is corrupt: {0}")]
	Corrupt(String),

	#[error("store is in degraded read-only mode")]
	ReadOnly,

	#[error("a live child named {name:?} already exists under parent {parent}")]
	NameCollision { parent: Uid, name: String },

	#[error("parent cycle would be created through node {0}")]
	ParentCycle(Uid),

	#[error("unknown node: {0}")]
	UnknownNode(Uid),

	#[error("database error: {0}")]
	Db(#[from] sea_orm::DbErr),

	#[error("uid error: {0}")]
	Uid(#[from] UidError),

	#[error("serialization error: {0}")]
	Json(#[from] serde_json::Error),
}

#[derive(Default)]
struct StoreState {
	nodes: HashMap<Uid, Node>,
	/// parent uid -> child uids, insertion-ordered.
	children: HashMap<Uid, Vec<Uid>>,
	goog_ids: HashMap<String, Uid>,
	path_uids: HashMap<String, Uid>,
}

impl StoreState {
	fn unlink_from_parents(&mut self, node: &Node) {
		for parent in node.parent_uids() {
			if let Some(list) = self.children.get_mut(&parent) {
				list.retain(|&uid| uid != node.uid());
			}
		}
	}

	fn link_to_parents(&mut self, node: &Node) {
		for parent in node.parent_uids() {
			let list = self.children.entry(parent).or_default();
			if !list.contains(&node.uid()) {
				list.push(node.uid());
			}
		}
	}

	fn insert(&mut self, node: Node) {
		if let Some(old) = self.nodes.remove(&node.uid()) {
			self.unlink_from_parents(&old);
			if let Some(goog_id) = old.goog_id() {
				self.goog_ids.remove(goog_id);
			}
		}
		self.link_to_parents(&node);
		if let Some(goog_id) = node.goog_id() {
			self.goog_ids.insert(goog_id.to_string(), node.uid());
		}
		self.nodes.insert(node.uid(), node);
	}

	fn remove(&mut self, uid: Uid) -> Option<Node> {
		let node = self.nodes.remove(&uid)?;
		self.unlink_from_parents(&node);
		if let Some(goog_id) = node.goog_id() {
			self.goog_ids.remove(goog_id);
		}
		Some(node)
	}
}

/// Durable node cache for one device.
pub struct NodeStore {
	device_uid: Uid,
	db: Database,
	state: RwLock<StoreState>,
	/// Serialises all mutations; never held across anything but the DB
	/// write-through and the in-memory apply.
	writer: Mutex<()>,
	read_only: AtomicBool,
}

impl NodeStore {
	/// Open (creating if needed) the device database and hydrate it.
	///
	/// Every stored UID is validated against the allocator's persisted
	/// high-water mark: a UID above it can only mean the cache and the
	/// allocator state diverged, so the store refuses to serve writes.
	pub async fn open(
		cache_dir: &Path,
		device_uid: Uid,
		allocator: &Arc<UidAllocator>,
	) -> Result<Self, StoreError> {
		Self::open_inner(cache_dir, device_uid, allocator, true).await
	}

	/// Open without integrity enforcement, in permanent read-only mode.
	/// The degraded fallback after [`Self::open`] reports corruption.
	pub async fn open_degraded(
		cache_dir: &Path,
		device_uid: Uid,
		allocator: &Arc<UidAllocator>,
	) -> Result<Self, StoreError> {
		let store = Self::open_inner(cache_dir, device_uid, allocator, false).await?;
		store.set_read_only();
		Ok(store)
	}

	async fn open_inner(
		cache_dir: &Path,
		device_uid: Uid,
		allocator: &Arc<UidAllocator>,
		enforce_integrity: bool,
	) -> Result<Self, StoreError> {
		let db = Database::open(&device_db_path(cache_dir, device_uid)).await?;

		let mut state = StoreState::default();

		let parent_rows = entities::node_parent::Entity::find().all(db.conn()).await?;
		let mut parents_by_node: HashMap<i64, Vec<Uid>> = HashMap::new();
		for row in parent_rows {
			parents_by_node
				.entry(row.node_uid)
				.or_default()
				.push(Uid(row.parent_uid as u32));
		}

		let high_water = allocator.high_water_mark();
		let node_rows = entities::node::Entity::find().all(db.conn()).await?;
		let mut max_uid = Uid(0);
		for row in node_rows {
			let uid = Uid(row.uid as u32);
			if enforce_integrity && uid > high_water {
				return Err(StoreError::Corrupt(format!(
					"node uid {uid} exceeds allocator high-water mark {high_water}"
				)));
			}
			max_uid = max_uid.max(uid);
			let parents = parents_by_node.remove(&row.uid).unwrap_or_default();
			let node = row_to_node(device_uid, row, parents)?;
			state.insert(node);
		}

		for row in entities::path_uid::Entity::find().all(db.conn()).await? {
			let uid = Uid(row.uid as u32);
			if enforce_integrity && uid > high_water {
				return Err(StoreError::Corrupt(format!(
					"path uid {uid} exceeds allocator high-water mark {high_water}"
				)));
			}
			max_uid = max_uid.max(uid);
			state.path_uids.insert(row.full_path, uid);
		}

		// The allocator must never issue below anything hydrated here.
		allocator.ensure_next_uid_greater_than(max_uid)?;

		info!(
			"Hydrated store for device {}: {} nodes, {} mapped paths",
			device_uid,
			state.nodes.len(),
			state.path_uids.len()
		);

		Ok(Self {
			device_uid,
			db,
			state: RwLock::new(state),
			writer: Mutex::new(()),
			read_only: AtomicBool::new(false),
		})
	}

	pub fn device_uid(&self) -> Uid {
		self.device_uid
	}

	/// Corrupt-cache escape hatch: reads keep working, writes fail.
	pub fn set_read_only(&self) {
		warn!("Store for device {} entering read-only mode", self.device_uid);
		self.read_only.store(true, Ordering::SeqCst);
	}

	pub fn is_read_only(&self) -> bool {
		self.read_only.load(Ordering::SeqCst)
	}

	fn check_writable(&self) -> Result<(), StoreError> {
		if self.is_read_only() {
			return Err(StoreError::ReadOnly);
		}
		Ok(())
	}

	// Reads

	pub async fn get(&self, uid: Uid) -> Option<Node> {
		self.state.read().await.nodes.get(&uid).cloned()
	}

	pub async fn node_count(&self) -> usize {
		self.state.read().await.nodes.len()
	}

	pub async fn get_children(&self, parent_uid: Uid) -> Vec<Node> {
		let state = self.state.read().await;
		state
			.children
			.get(&parent_uid)
			.map(|uids| {
				uids.iter()
					.filter_map(|uid| state.nodes.get(uid).cloned())
					.collect()
			})
			.unwrap_or_default()
	}

	pub async fn get_child_by_name(&self, parent_uid: Uid, name: &str) -> Option<Node> {
		let state = self.state.read().await;
		state.children.get(&parent_uid).and_then(|uids| {
			uids.iter()
				.filter_map(|uid| state.nodes.get(uid))
				.find(|n| n.name() == name && n.is_live())
				.cloned()
		})
	}

	pub async fn get_by_goog_id(&self, goog_id: &str) -> Option<Node> {
		let state = self.state.read().await;
		state
			.goog_ids
			.get(goog_id)
			.and_then(|uid| state.nodes.get(uid))
			.cloned()
	}

	pub async fn get_uid_for_path(&self, full_path: &str) -> Option<Uid> {
		self.state.read().await.path_uids.get(full_path).copied()
	}

	/// All nodes under (and including) `root_uid`, breadth-first. Parents
	/// always precede their children in the returned order.
	pub async fn subtree_nodes(&self, root_uid: Uid) -> Vec<Node> {
		let state = self.state.read().await;
		let mut out = Vec::new();
		let mut queue = VecDeque::from([root_uid]);
		while let Some(uid) = queue.pop_front() {
			if let Some(node) = state.nodes.get(&uid) {
				out.push(node.clone());
			}
			if let Some(child_uids) = state.children.get(&uid) {
				queue.extend(child_uids.iter().copied());
			}
		}
		out
	}

	/// Recompute the directory aggregate for `root_uid` from its live
	/// children, depth-first.
	pub async fn compute_dir_meta(&self, root_uid: Uid) -> DirMeta {
		let state = self.state.read().await;
		fn walk(state: &StoreState, uid: Uid, meta: &mut DirMeta) {
			let Some(child_uids) = state.children.get(&uid) else {
				return;
			};
			for child_uid in child_uids {
				let Some(child) = state.nodes.get(child_uid) else {
					continue;
				};
				if !child.is_live() {
					continue;
				}
				let trashed = child.trashed().is_trashed();
				if child.is_file() {
					meta.add_file(child.size_bytes().unwrap_or(0), trashed);
				} else {
					meta.add_dir(trashed);
					walk(state, *child_uid, meta);
				}
			}
		}
		let mut meta = DirMeta::default();
		walk(&state, root_uid, &mut meta);
		meta
	}

	/// Every equivalent full path of a node. Local nodes carry theirs; cloud
	/// paths are assembled by walking parent links.
	pub async fn resolve_path_list(&self, uid: Uid) -> Vec<String> {
		let state = self.state.read().await;
		fn paths_of(state: &StoreState, uid: Uid, depth: usize) -> Vec<String> {
			if depth > 256 {
				return Vec::new();
			}
			let Some(node) = state.nodes.get(&uid) else {
				return Vec::new();
			};
			if let Some(path) = node.cached_path() {
				return vec![path.to_string()];
			}
			let parents = node.parent_uids();
			if parents.is_empty() {
				return vec![format!("/{}", node.name())];
			}
			let mut out = Vec::new();
			for parent in parents {
				if parent == SUPER_ROOT_UID || state.nodes.get(&parent).is_none() {
					out.push(format!("/{}", node.name()));
					continue;
				}
				for parent_path in paths_of(state, parent, depth + 1) {
					out.push(format!("{}/{}", parent_path.trim_end_matches('/'), node.name()));
				}
			}
			out
		}
		paths_of(&state, uid, 0)
	}

	// Writes

	/// Assign (or look up) the stable UID for a path. Path-to-UID bindings
	/// are never recycled: a recreated path resolves to its old UID.
	pub async fn get_or_assign_uid_for_path(
		&self,
		full_path: &str,
		allocator: &UidAllocator,
	) -> Result<Uid, StoreError> {
		if let Some(uid) = self.get_uid_for_path(full_path).await {
			return Ok(uid);
		}
		self.check_writable()?;
		let _writer = self.writer.lock().await;
		// Re-check under the writer lock.
		if let Some(uid) = self.state.read().await.path_uids.get(full_path) {
			return Ok(*uid);
		}
		let uid = allocator.next_uid()?;
		entities::path_uid::Entity::insert(entities::path_uid::ActiveModel {
			uid: Set(uid.0 as i64),
			full_path: Set(full_path.to_string()),
		})
		.on_conflict(
			OnConflict::column(entities::path_uid::Column::FullPath)
				.do_nothing()
				.to_owned(),
		)
		.exec_without_returning(self.db.conn())
		.await?;
		self.state
			.write()
			.await
			.path_uids
			.insert(full_path.to_string(), uid);
		Ok(uid)
	}

	/// Point a path binding at a specific node. Used when a move carries a
	/// node's identity to a new path.
	pub async fn rebind_path(&self, full_path: &str, uid: Uid) -> Result<(), StoreError> {
		self.check_writable()?;
		let _writer = self.writer.lock().await;
		// Both the path and the uid must be freed: each is unique in the
		// map.
		entities::path_uid::Entity::delete_many()
			.filter(entities::path_uid::Column::FullPath.eq(full_path))
			.exec(self.db.conn())
			.await?;
		entities::path_uid::Entity::delete_by_id(uid.0 as i64)
			.exec(self.db.conn())
			.await?;
		entities::path_uid::Entity::insert(entities::path_uid::ActiveModel {
			uid: Set(uid.0 as i64),
			full_path: Set(full_path.to_string()),
		})
		.exec_without_returning(self.db.conn())
		.await?;
		let mut state = self.state.write().await;
		state.path_uids.retain(|_, bound| *bound != uid);
		state.path_uids.insert(full_path.to_string(), uid);
		Ok(())
	}

	/// Drop a path binding so a future file at that path gets a fresh UID.
	/// The counterpart of [`Self::rebind_path`] for the vacated source path.
	pub async fn unbind_path(&self, full_path: &str) -> Result<(), StoreError> {
		self.check_writable()?;
		let _writer = self.writer.lock().await;
		entities::path_uid::Entity::delete_many()
			.filter(entities::path_uid::Column::FullPath.eq(full_path))
			.exec(self.db.conn())
			.await?;
		self.state.write().await.path_uids.remove(full_path);
		Ok(())
	}

	pub async fn upsert(&self, node: Node) -> Result<Node, StoreError> {
		Ok(self.upsert_batch(vec![node]).await?.pop().expect("one node in, one out"))
	}

	/// Transactionally upsert a batch of nodes.
	///
	/// Pre-commit hook: rejects live-child name collisions and parent cycles
	/// before anything is written. Cyclic parent relationships are prevented
	/// here, not by the datatypes.
	pub async fn upsert_batch(&self, nodes: Vec<Node>) -> Result<Vec<Node>, StoreError> {
		// Synthetic nodes (containers, categories) live only in display
		// trees and must never reach a device store.
		debug_assert!(nodes.iter().all(|n| n.is_local() || n.is_gdrive()));
		self.check_writable()?;
		let _writer = self.writer.lock().await;

		{
			let state = self.state.read().await;
			self.validate_batch(&state, &nodes)?;
		}

		let txn = self.db.conn().begin().await?;
		for node in &nodes {
			let uid = node.uid().0 as i64;
			entities::node::Entity::delete_by_id(uid).exec(&txn).await?;
			entities::node::Entity::insert(node_to_model(node))
				.exec_without_returning(&txn)
				.await?;
			entities::node_parent::Entity::delete_many()
				.filter(entities::node_parent::Column::NodeUid.eq(uid))
				.exec(&txn)
				.await?;
			if node.is_gdrive() {
				for parent in node.parent_uids() {
					entities::node_parent::Entity::insert(entities::node_parent::ActiveModel {
						id: sea_orm::ActiveValue::NotSet,
						node_uid: Set(uid),
						parent_uid: Set(parent.0 as i64),
					})
					.exec_without_returning(&txn)
					.await?;
				}
			}
		}
		txn.commit().await?;

		let mut state = self.state.write().await;
		for node in &nodes {
			state.insert(node.clone());
			if let Some(path) = node.cached_path() {
				state.path_uids.entry(path.to_string()).or_insert(node.uid());
			}
		}
		Ok(nodes)
	}

	/// Transactionally remove a batch of nodes; returns those that existed.
	/// Path-to-UID bindings are left behind on purpose.
	pub async fn remove_batch(&self, uids: Vec<Uid>) -> Result<Vec<Node>, StoreError> {
		self.check_writable()?;
		let _writer = self.writer.lock().await;

		let txn = self.db.conn().begin().await?;
		for uid in &uids {
			let raw = uid.0 as i64;
			entities::node::Entity::delete_by_id(raw).exec(&txn).await?;
			entities::node_parent::Entity::delete_many()
				.filter(entities::node_parent::Column::NodeUid.eq(raw))
				.exec(&txn)
				.await?;
		}
		txn.commit().await?;

		let mut state = self.state.write().await;
		let mut removed = Vec::new();
		for uid in uids {
			if let Some(node) = state.remove(uid) {
				removed.push(node);
			}
		}
		Ok(removed)
	}

	fn validate_batch(&self, state: &StoreState, nodes: &[Node]) -> Result<(), StoreError> {
		let batch_by_uid: HashMap<Uid, &Node> = nodes.iter().map(|n| (n.uid(), n)).collect();

		for node in nodes {
			// Live-child name uniqueness under every parent.
			if node.is_live() {
				for parent in node.parent_uids() {
					let collision = state
						.children
						.get(&parent)
						.into_iter()
						.flatten()
						.filter_map(|uid| {
							// A sibling also present in this batch is judged by
							// its incoming version.
							batch_by_uid.get(uid).copied().or_else(|| state.nodes.get(uid))
						})
						.any(|sibling| {
							sibling.uid() != node.uid()
								&& sibling.is_live()
								&& sibling.name() == node.name()
						});
					if collision {
						return Err(StoreError::NameCollision {
							parent,
							name: node.name().to_string(),
						});
					}
				}
			}

			// Parent-cycle prevention for dirs.
			if node.is_dir() {
				let mut cursor_uids = node.parent_uids();
				let mut hops = 0;
				while let Some(parent_uid) = cursor_uids.pop() {
					if parent_uid == node.uid() {
						return Err(StoreError::ParentCycle(node.uid()));
					}
					hops += 1;
					if hops > 4096 {
						return Err(StoreError::ParentCycle(node.uid()));
					}
					let parent = batch_by_uid
						.get(&parent_uid)
						.copied()
						.or_else(|| state.nodes.get(&parent_uid));
					if let Some(parent) = parent {
						cursor_uids.extend(parent.parent_uids());
					}
				}
			}
		}
		Ok(())
	}

	// Key-value helpers (change cursor and friends)

	pub async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
		Ok(entities::kv::Entity::find_by_id(key)
			.one(self.db.conn())
			.await?
			.map(|row| row.value))
	}

	pub async fn kv_put(&self, key: &str, value: &str) -> Result<(), StoreError> {
		self.check_writable()?;
		entities::kv::Entity::insert(entities::kv::ActiveModel {
			key: Set(key.to_string()),
			value: Set(value.to_string()),
		})
		.on_conflict(
			OnConflict::column(entities::kv::Column::Key)
				.update_column(entities::kv::Column::Value)
				.to_owned(),
		)
		.exec_without_returning(self.db.conn())
		.await?;
		Ok(())
	}

	// Op ledger rows (owned here because the store owns the device database)

	/// Load every non-terminal op persisted for this device.
	pub async fn load_active_ops(&self) -> Result<Vec<UserOp>, StoreError> {
		let rows = entities::op::Entity::find().all(self.db.conn()).await?;
		let mut ops = Vec::with_capacity(rows.len());
		for row in rows {
			ops.push(op_from_row(row)?);
		}
		ops.sort_by_key(|op| op.op_uid);
		Ok(ops)
	}

	/// Persist a batch of ops. Idempotent on replay by `op_uid`.
	pub async fn persist_ops(&self, ops: &[UserOp]) -> Result<(), StoreError> {
		self.check_writable()?;
		let txn = self.db.conn().begin().await?;
		for op in ops {
			entities::op::Entity::insert(op_to_model(op)?)
				.on_conflict(
					OnConflict::column(entities::op::Column::OpUid)
						.do_nothing()
						.to_owned(),
				)
				.exec_without_returning(&txn)
				.await?;
		}
		txn.commit().await?;
		Ok(())
	}

	pub async fn update_op_status(&self, op_uid: Uid, status: OpStatus) -> Result<(), StoreError> {
		self.check_writable()?;
		entities::op::Entity::update_many()
			.col_expr(
				entities::op::Column::Status,
				sea_orm::sea_query::Expr::value(status.to_i32()),
			)
			.filter(entities::op::Column::OpUid.eq(op_uid.0 as i64))
			.exec(self.db.conn())
			.await?;
		Ok(())
	}

	/// Move one terminal op from the live table to the archive.
	pub async fn archive_op(&self, op: &UserOp) -> Result<(), StoreError> {
		debug_assert!(op.status.is_terminal());
		self.check_writable()?;
		let txn = self.db.conn().begin().await?;
		entities::archived_op::Entity::insert(archived_model(op)?)
			.on_conflict(
				OnConflict::column(entities::archived_op::Column::OpUid)
					.do_nothing()
					.to_owned(),
			)
			.exec_without_returning(&txn)
			.await?;
		entities::op::Entity::delete_by_id(op.op_uid.0 as i64)
			.exec(&txn)
			.await?;
		txn.commit().await?;
		Ok(())
	}

	/// Archive the whole live op table (startup cancellation). Returns how
	/// many rows were moved.
	pub async fn archive_all_ops(&self) -> Result<usize, StoreError> {
		self.check_writable()?;
		let rows = entities::op::Entity::find().all(self.db.conn()).await?;
		let txn = self.db.conn().begin().await?;
		let count = rows.len();
		for row in rows {
			let mut op = op_from_row(row)?;
			op.status = OpStatus::Cancelled;
			entities::archived_op::Entity::insert(archived_model(&op)?)
				.on_conflict(
					OnConflict::column(entities::archived_op::Column::OpUid)
						.do_nothing()
						.to_owned(),
				)
				.exec_without_returning(&txn)
				.await?;
		}
		entities::op::Entity::delete_many().exec(&txn).await?;
		txn.commit().await?;
		if count > 0 {
			debug!("Archived {} live ops for device {}", count, self.device_uid);
		}
		Ok(count)
	}

	pub async fn count_archived_ops(&self) -> Result<u64, StoreError> {
		use sea_orm::PaginatorTrait;
		Ok(entities::archived_op::Entity::find()
			.count(self.db.conn())
			.await?)
	}
}

// Row conversion

const KIND_LOCAL_DIR: i32 = 1;
const KIND_LOCAL_FILE: i32 = 2;
const KIND_GDRIVE_FOLDER: i32 = 3;
const KIND_GDRIVE_FILE: i32 = 4;

fn trashed_to_i32(trashed: TrashStatus) -> i32 {
	match trashed {
		TrashStatus::NotTrashed => 0,
		TrashStatus::ImplicitlyTrashed => 1,
		TrashStatus::ExplicitlyTrashed => 2,
	}
}

fn trashed_from_i32(raw: i32) -> TrashStatus {
	match raw {
		1 => TrashStatus::ImplicitlyTrashed,
		2 => TrashStatus::ExplicitlyTrashed,
		_ => TrashStatus::NotTrashed,
	}
}

fn node_to_model(node: &Node) -> entities::node::ActiveModel {
	let mut model = entities::node::ActiveModel {
		uid: Set(node.uid().0 as i64),
		kind: Set(match node {
			Node::LocalDir(_) => KIND_LOCAL_DIR,
			Node::LocalFile(_) => KIND_LOCAL_FILE,
			Node::GDriveFolder(_) => KIND_GDRIVE_FOLDER,
			Node::GDriveFile(_) => KIND_GDRIVE_FILE,
			// Synthetic nodes are never persisted; the cache manager keeps
			// them out of upsert batches.
			_ => unreachable!("synthetic nodes are not persisted"),
		}),
		name: Set(node.name().to_string()),
		parent_uid: Set(None),
		full_path: Set(node.cached_path().map(str::to_string)),
		size_bytes: Set(None),
		sync_ts: Set(None),
		modify_ts: Set(None),
		change_ts: Set(None),
		create_ts: Set(None),
		md5: Set(None),
		sha256: Set(None),
		goog_id: Set(node.goog_id().map(str::to_string)),
		owner_uid: Set(None),
		drive_id: Set(None),
		version: Set(None),
		mime_type_uid: Set(None),
		trashed: Set(trashed_to_i32(node.trashed())),
		is_live: Set(node.is_live()),
		all_children_fetched: Set(false),
	};

	match node {
		Node::LocalDir(n) => {
			model.parent_uid = Set(Some(n.parent_uid.0 as i64));
			model.modify_ts = Set(n.modify_ts);
			model.change_ts = Set(n.change_ts);
			model.all_children_fetched = Set(n.all_children_fetched);
		}
		Node::LocalFile(n) => {
			model.parent_uid = Set(Some(n.parent_uid.0 as i64));
			model.size_bytes = Set(n.meta.size_bytes.map(|v| v as i64));
			model.sync_ts = Set(n.meta.sync_ts);
			model.modify_ts = Set(n.meta.modify_ts);
			model.change_ts = Set(n.meta.change_ts);
			model.create_ts = Set(n.meta.create_ts);
			model.md5 = Set(n.meta.md5.clone());
			model.sha256 = Set(n.meta.sha256.clone());
		}
		Node::GDriveFolder(n) => {
			model.owner_uid = Set(n.identity.owner_uid.map(|u| u.0 as i64));
			model.drive_id = Set(n.identity.drive_id.clone());
			model.create_ts = Set(n.create_ts);
			model.modify_ts = Set(n.modify_ts);
			model.all_children_fetched = Set(n.all_children_fetched);
		}
		Node::GDriveFile(n) => {
			model.owner_uid = Set(n.identity.owner_uid.map(|u| u.0 as i64));
			model.drive_id = Set(n.identity.drive_id.clone());
			model.size_bytes = Set(n.meta.size_bytes.map(|v| v as i64));
			model.sync_ts = Set(n.meta.sync_ts);
			model.modify_ts = Set(n.meta.modify_ts);
			model.change_ts = Set(n.meta.change_ts);
			model.create_ts = Set(n.meta.create_ts);
			model.md5 = Set(n.meta.md5.clone());
			model.sha256 = Set(n.meta.sha256.clone());
			model.version = Set(n.version);
			model.mime_type_uid = Set(n.mime_type_uid.map(|u| u.0 as i64));
		}
		_ => {}
	}
	model
}

fn row_to_node(
	device_uid: Uid,
	row: entities::node::Model,
	parents: Vec<Uid>,
) -> Result<Node, StoreError> {
	let uid = Uid(row.uid as u32);
	let trashed = trashed_from_i32(row.trashed);
	let meta = FileMeta {
		size_bytes: row.size_bytes.map(|v| v as u64),
		sync_ts: row.sync_ts,
		modify_ts: row.modify_ts,
		change_ts: row.change_ts,
		create_ts: row.create_ts,
		md5: row.md5.clone(),
		sha256: row.sha256.clone(),
	};
	let node = match row.kind {
		KIND_LOCAL_DIR => Node::LocalDir(LocalDirNode {
			device_uid,
			uid,
			parent_uid: Uid(row.parent_uid.unwrap_or(SUPER_ROOT_UID.0 as i64) as u32),
			name: row.name,
			full_path: row.full_path.unwrap_or_default(),
			trashed,
			is_live: row.is_live,
			all_children_fetched: row.all_children_fetched,
			dir_meta: None,
			modify_ts: row.modify_ts,
			change_ts: row.change_ts,
		}),
		KIND_LOCAL_FILE => Node::LocalFile(LocalFileNode {
			device_uid,
			uid,
			parent_uid: Uid(row.parent_uid.unwrap_or(SUPER_ROOT_UID.0 as i64) as u32),
			name: row.name,
			full_path: row.full_path.unwrap_or_default(),
			trashed,
			is_live: row.is_live,
			meta,
		}),
		KIND_GDRIVE_FOLDER => Node::GDriveFolder(GDriveFolderNode {
			device_uid,
			uid,
			name: row.name,
			identity: GDriveIdentity {
				goog_id: row.goog_id,
				owner_uid: row.owner_uid.map(|v| Uid(v as u32)),
				drive_id: row.drive_id,
				parent_uids: parents,
			},
			trashed,
			is_live: row.is_live,
			all_children_fetched: row.all_children_fetched,
			dir_meta: None,
			create_ts: row.create_ts,
			modify_ts: row.modify_ts,
		}),
		KIND_GDRIVE_FILE => Node::GDriveFile(GDriveFileNode {
			device_uid,
			uid,
			name: row.name,
			identity: GDriveIdentity {
				goog_id: row.goog_id,
				owner_uid: row.owner_uid.map(|v| Uid(v as u32)),
				drive_id: row.drive_id,
				parent_uids: parents,
			},
			trashed,
			is_live: row.is_live,
			meta,
			version: row.version,
			mime_type_uid: row.mime_type_uid.map(|v| Uid(v as u32)),
		}),
		other => {
			return Err(StoreError::Corrupt(format!("unknown node kind {other}")));
		}
	};
	Ok(node)
}

fn op_to_model(op: &UserOp) -> Result<entities::op::ActiveModel, StoreError> {
	Ok(entities::op::ActiveModel {
		op_uid: Set(op.op_uid.0 as i64),
		batch_uid: Set(op.batch_uid.0 as i64),
		op_type: Set(op.op_type.to_i32()),
		status: Set(op.status.to_i32()),
		src_json: Set(serde_json::to_string(&op.src)?),
		dst_json: Set(op.dst.as_ref().map(serde_json::to_string).transpose()?),
		create_ts: Set(op.create_ts),
	})
}

fn archived_model(op: &UserOp) -> Result<entities::archived_op::ActiveModel, StoreError> {
	Ok(entities::archived_op::ActiveModel {
		op_uid: Set(op.op_uid.0 as i64),
		batch_uid: Set(op.batch_uid.0 as i64),
		op_type: Set(op.op_type.to_i32()),
		status: Set(op.status.to_i32()),
		src_json: Set(serde_json::to_string(&op.src)?),
		dst_json: Set(op.dst.as_ref().map(serde_json::to_string).transpose()?),
		create_ts: Set(op.create_ts),
		archived_ts: Set(now_millis()),
	})
}

fn op_from_row(row: entities::op::Model) -> Result<UserOp, StoreError> {
	Ok(UserOp {
		op_uid: Uid(row.op_uid as u32),
		batch_uid: Uid(row.batch_uid as u32),
		op_type: OpType::from_i32(row.op_type)
			.ok_or_else(|| StoreError::Corrupt(format!("unknown op type {}", row.op_type)))?,
		status: OpStatus::from_i32(row.status)
			.ok_or_else(|| StoreError::Corrupt(format!("unknown op status {}", row.status)))?,
		src: serde_json::from_str(&row.src_json)?,
		dst: row.dst_json.as_deref().map(serde_json::from_str).transpose()?,
		create_ts: row.create_ts,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn local_file(uid: u32, parent: u32, name: &str) -> Node {
		Node::LocalFile(LocalFileNode {
			device_uid: Uid(2),
			uid: Uid(uid),
			parent_uid: Uid(parent),
			name: name.to_string(),
			full_path: format!("/root/{name}"),
			trashed: TrashStatus::NotTrashed,
			is_live: true,
			meta: FileMeta {
				size_bytes: Some(10),
				modify_ts: Some(1000),
				..Default::default()
			},
		})
	}

	fn local_dir(uid: u32, parent: u32, name: &str) -> Node {
		Node::LocalDir(LocalDirNode {
			device_uid: Uid(2),
			uid: Uid(uid),
			parent_uid: Uid(parent),
			name: name.to_string(),
			full_path: format!("/root/{name}"),
			trashed: TrashStatus::NotTrashed,
			is_live: true,
			all_children_fetched: true,
			dir_meta: None,
			modify_ts: None,
			change_ts: None,
		})
	}

	async fn open_store(dir: &TempDir) -> (NodeStore, Arc<UidAllocator>) {
		let allocator = Arc::new(UidAllocator::load(dir.path(), 1000, true).unwrap());
		// Reserve enough space that the fixed test uids stay below the mark.
		allocator.ensure_next_uid_greater_than(Uid(500)).unwrap();
		let store = NodeStore::open(dir.path(), Uid(2), &allocator).await.unwrap();
		(store, allocator)
	}

	#[tokio::test]
	async fn upsert_survives_reopen() {
		let dir = TempDir::new().unwrap();
		{
			let (store, _alloc) = open_store(&dir).await;
			store.upsert(local_file(100, 1, "a.txt")).await.unwrap();
		}
		let (store, _alloc) = open_store(&dir).await;
		let node = store.get(Uid(100)).await.unwrap();
		assert_eq!(node.name(), "a.txt");
	}

	#[tokio::test]
	async fn name_collision_is_rejected() {
		let dir = TempDir::new().unwrap();
		let (store, _alloc) = open_store(&dir).await;
		store.upsert(local_file(100, 1, "a.txt")).await.unwrap();
		let err = store.upsert(local_file(101, 1, "a.txt")).await.unwrap_err();
		assert!(matches!(err, StoreError::NameCollision { .. }));
	}

	#[tokio::test]
	async fn parent_cycle_is_rejected() {
		let dir = TempDir::new().unwrap();
		let (store, _alloc) = open_store(&dir).await;
		store.upsert(local_dir(100, 1, "a")).await.unwrap();
		store.upsert(local_dir(101, 100, "b")).await.unwrap();

		// Re-parent "a" under its own child.
		let mut reparented = local_dir(100, 101, "a");
		if let Node::LocalDir(dir_node) = &mut reparented {
			dir_node.parent_uid = Uid(101);
		}
		let err = store.upsert(reparented).await.unwrap_err();
		assert!(matches!(err, StoreError::ParentCycle(_)));
	}

	#[tokio::test]
	async fn path_uid_bindings_are_stable() {
		let dir = TempDir::new().unwrap();
		let (store, alloc) = open_store(&dir).await;
		let first = store
			.get_or_assign_uid_for_path("/root/x", &alloc)
			.await
			.unwrap();
		let second = store
			.get_or_assign_uid_for_path("/root/x", &alloc)
			.await
			.unwrap();
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn read_only_mode_blocks_writes() {
		let dir = TempDir::new().unwrap();
		let (store, _alloc) = open_store(&dir).await;
		store.set_read_only();
		let err = store.upsert(local_file(100, 1, "a.txt")).await.unwrap_err();
		assert!(matches!(err, StoreError::ReadOnly));
		// Reads still work.
		assert!(store.get(Uid(100)).await.is_none());
	}

	#[tokio::test]
	async fn op_rows_round_trip() {
		use crate::domain::identifier::NodeIdentifier;
		let dir = TempDir::new().unwrap();
		let (store, _alloc) = open_store(&dir).await;
		let op = UserOp::new(
			Uid(200),
			Uid(201),
			OpType::Rm,
			NodeIdentifier::spid(Uid(2), Uid(100), "/root/a.txt"),
			None,
		);
		store.persist_ops(std::slice::from_ref(&op)).await.unwrap();
		// Replay is idempotent.
		store.persist_ops(std::slice::from_ref(&op)).await.unwrap();
		let loaded = store.load_active_ops().await.unwrap();
		assert_eq!(loaded.len(), 1);
		assert_eq!(loaded[0].op_uid, op.op_uid);

		let mut done = op.clone();
		done.status = OpStatus::Completed;
		store.archive_op(&done).await.unwrap();
		assert!(store.load_active_ops().await.unwrap().is_empty());
		assert_eq!(store.count_archived_ops().await.unwrap(), 1);
	}
}
