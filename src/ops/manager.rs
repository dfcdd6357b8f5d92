//! Op intake, durability and startup recovery.
//!
//! Every lifecycle transition is persisted to the op tables before the
//! in-memory graph changes, so a crash at any point restarts into a state
//! equivalent to a prefix of the committed op log.

use crate::cache::manager::{CacheError, CacheManager};
use crate::domain::device::TreeType;
use crate::domain::node::{
	FileMeta, GDriveFileNode, GDriveFolderNode, GDriveIdentity, LocalDirNode, LocalFileNode, Node,
	TrashStatus,
};
use crate::domain::op::{Batch, ErrorHandlingStrategy, OpStatus, OpType, UserOp};
use crate::domain::uid::{Uid, UidAllocator, UidError, SUPER_ROOT_UID};
use crate::infrastructure::events::{Event, EventBus};
use crate::ops::graph::{OpGraph, OpGraphError};
use crate::store::node_store::StoreError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum OpManagerError {
	#[error("graph error: {0}")]
	Graph(#[from] OpGraphError),

	#[error("cache error: {0}")]
	Cache(#[from] CacheError),

	#[error("store error: {0}")]
	Store(#[from] StoreError),

	#[error("uid error: {0}")]
	Uid(#[from] UidError),

	#[error("invalid batch: {0}")]
	InvalidBatch(String),
}

/// What startup recovery did.
#[derive(Debug, Default, Clone, Copy)]
pub struct StartupReport {
	pub restored: usize,
	pub archived: usize,
	pub planning_nodes_removed: usize,
}

/// Owns the durable op ledger and the in-memory dependency graph.
pub struct OpManager {
	graph: Arc<OpGraph>,
	cache: Arc<CacheManager>,
	events: Arc<EventBus>,
	allocator: Arc<UidAllocator>,
	cancel_all_pending_ops_on_startup: bool,
}

impl OpManager {
	pub fn new(
		graph: Arc<OpGraph>,
		cache: Arc<CacheManager>,
		events: Arc<EventBus>,
		allocator: Arc<UidAllocator>,
		cancel_all_pending_ops_on_startup: bool,
	) -> Self {
		Self {
			graph,
			cache,
			events,
			allocator,
			cancel_all_pending_ops_on_startup,
		}
	}

	pub fn graph(&self) -> &Arc<OpGraph> {
		&self.graph
	}

	pub fn next_uid(&self) -> Result<Uid, OpManagerError> {
		Ok(self.allocator.next_uid()?)
	}

	/// Submit a batch: validate, persist atomically, insert planning nodes,
	/// then enqueue into the graph.
	pub async fn append_batch(&self, ops: Vec<UserOp>) -> Result<Batch, OpManagerError> {
		if ops.is_empty() {
			return Err(OpManagerError::InvalidBatch("empty batch".into()));
		}
		let batch_uid = ops[0].batch_uid;
		if ops.iter().any(|op| op.batch_uid != batch_uid) {
			return Err(OpManagerError::InvalidBatch(
				"ops do not share a batch_uid".into(),
			));
		}

		validate_batch_rules(&ops)?;
		self.graph.validate_batch(&ops)?;
		self.insert_planning_nodes(&ops).await?;

		// Persist atomically per src device, then enqueue.
		for (device_uid, device_ops) in group_by_src_device(&ops) {
			let store = self.cache.store_for(device_uid).await?;
			store.persist_ops(&device_ops).await?;
		}
		self.graph.insert_batch(&ops)?;

		info!("Accepted batch {} with {} ops", batch_uid, ops.len());
		Ok(Batch { batch_uid, ops })
	}

	/// Create the not-yet-live destination nodes a batch plans to bring
	/// into existence, so clients can render them immediately.
	async fn insert_planning_nodes(&self, ops: &[UserOp]) -> Result<(), OpManagerError> {
		for op in ops {
			let Some(target_uid) = op.created_node_uid() else {
				continue;
			};
			let target = op.primary_target();
			let device_uid = target.device_uid();
			let store = self.cache.store_for(device_uid).await?;
			if store.get(target_uid).await.is_some() {
				// Already exists: an *_ONTO overwrite target, or a replay.
				continue;
			}
			let Some(full_path) = target.first_path().map(str::to_string) else {
				continue;
			};

			let is_dir = matches!(
				op.op_type,
				OpType::Mkdir | OpType::StartDirCp | OpType::StartDirMv
			);
			let device = self.cache.device(device_uid).await?;
			let node = match device.tree_type {
				TreeType::Local => {
					let parent_path = parent_path_of(&full_path);
					let parent_uid = match parent_path {
						Some(parent_path) => {
							store
								.get_or_assign_uid_for_path(&parent_path, self.cache.allocator())
								.await?
						}
						None => SUPER_ROOT_UID,
					};
					build_local_planning_node(device_uid, target_uid, parent_uid, &full_path, is_dir)
				}
				TreeType::GDrive => {
					let parent_uids = match parent_path_of(&full_path) {
						Some(parent_path) => self
							.cache
							.resolve_path_to_node(device_uid, &parent_path)
							.await?
							.map(|n| vec![n.uid()])
							.unwrap_or_default(),
						None => vec![SUPER_ROOT_UID],
					};
					build_gdrive_planning_node(device_uid, target_uid, parent_uids, &full_path, is_dir)
				}
				TreeType::Mixed => continue,
			};
			debug!("Inserting planning node {} at {}", target_uid, full_path);
			self.cache.upsert_node(node).await?;
		}
		Ok(())
	}

	/// Rehydrate the graph from the op tables of every attached device --
	/// or, when `cancel_all_pending_ops_on_startup` is set, archive the
	/// whole live graph (dated) and clear the planning nodes.
	pub async fn startup_recovery(&self) -> Result<StartupReport, OpManagerError> {
		let mut report = StartupReport::default();

		if self.cancel_all_pending_ops_on_startup {
			for device in self.cache.device_list().await {
				if let Ok(store) = self.cache.store_for(device.device_uid).await {
					report.archived += store.archive_all_ops().await?;
				}
			}
			report.planning_nodes_removed = self.cache.remove_all_planning_nodes().await?;
			info!(
				"Startup cancel: archived {} ops, removed {} planning nodes",
				report.archived, report.planning_nodes_removed
			);
			return Ok(report);
		}

		// Union the op tables across devices, then rebuild batch by batch.
		let mut all_ops: Vec<UserOp> = Vec::new();
		for device in self.cache.device_list().await {
			if let Ok(store) = self.cache.store_for(device.device_uid).await {
				all_ops.extend(store.load_active_ops().await?);
			}
		}
		all_ops.sort_by_key(|op| op.op_uid);

		let mut by_batch: Vec<(Uid, Vec<UserOp>)> = Vec::new();
		for op in all_ops {
			match by_batch.iter_mut().find(|(uid, _)| *uid == op.batch_uid) {
				Some((_, ops)) => ops.push(op),
				None => by_batch.push((op.batch_uid, vec![op])),
			}
		}

		for (batch_uid, mut ops) in by_batch {
			// A batch with a failed op stays parked until the client picks
			// an error-handling strategy.
			if ops.iter().any(|op| op.status == OpStatus::Failed) {
				warn!("Batch {} has failed ops; not re-enqueued", batch_uid);
				continue;
			}
			let mut restorable = Vec::new();
			for op in ops.drain(..) {
				match op.status {
					OpStatus::Pending => restorable.push(op),
					// Best-effort retry: an op interrupted mid-flight is
					// re-run from scratch.
					OpStatus::InProgress => {
						let mut op = op;
						op.status = OpStatus::Pending;
						let store = self.cache.store_for(op.src.device_uid()).await?;
						store.update_op_status(op.op_uid, OpStatus::Pending).await?;
						restorable.push(op);
					}
					_ => {}
				}
			}
			if restorable.is_empty() {
				continue;
			}
			report.restored += restorable.len();
			self.graph.insert_batch(&restorable)?;
		}
		if report.restored > 0 {
			info!("Restored {} pending ops into the graph", report.restored);
		}
		Ok(report)
	}

	/// Durably mark an op in progress (the graph state already moved when
	/// the executor claimed it).
	pub async fn persist_in_progress(&self, op: &UserOp) -> Result<(), OpManagerError> {
		let store = self.cache.store_for(op.src.device_uid()).await?;
		store.update_op_status(op.op_uid, OpStatus::InProgress).await?;
		Ok(())
	}

	/// Complete an op: archive the row, then advance the graph.
	pub async fn complete_op(&self, op: &UserOp) -> Result<(), OpManagerError> {
		let mut done = op.clone();
		done.status = OpStatus::Completed;
		let store = self.cache.store_for(op.src.device_uid()).await?;
		store.archive_op(&done).await?;
		self.graph.mark_completed(op.op_uid)?;
		Ok(())
	}

	/// Cancel an in-progress op without side effects (conflict policy SKIP).
	/// Dependents are unblocked, not poisoned.
	pub async fn cancel_op(&self, op: &UserOp) -> Result<(), OpManagerError> {
		let mut cancelled = op.clone();
		cancelled.status = OpStatus::Cancelled;
		let store = self.cache.store_for(op.src.device_uid()).await?;
		store.archive_op(&cancelled).await?;
		self.remove_planning_nodes_for(std::slice::from_ref(op)).await?;
		self.graph.mark_completed(op.op_uid)?;
		Ok(())
	}

	/// Fail an op: persist, poison descendants, report the batch failure.
	pub async fn fail_op(
		&self,
		op: &UserOp,
		message: String,
		detail: String,
	) -> Result<(), OpManagerError> {
		let store = self.cache.store_for(op.src.device_uid()).await?;
		store.update_op_status(op.op_uid, OpStatus::Failed).await?;

		let (_failed, poisoned) = self.graph.mark_failed(op.op_uid)?;
		for blocked in &poisoned {
			let store = self.cache.store_for(blocked.src.device_uid()).await?;
			store
				.update_op_status(blocked.op_uid, OpStatus::BlockedByFailure)
				.await?;
		}
		warn!(
			"Op {} failed ({message}); {} descendants blocked",
			op.op_uid,
			poisoned.len()
		);
		self.events.emit(Event::BatchFailed {
			batch_uid: op.batch_uid,
			message,
			detail,
		});
		Ok(())
	}

	/// Apply the client's chosen strategy to a failed batch.
	pub async fn handle_batch_failed(
		&self,
		batch_uid: Uid,
		strategy: ErrorHandlingStrategy,
	) -> Result<(), OpManagerError> {
		let mut batch_ops: Vec<UserOp> = Vec::new();
		for device in self.cache.device_list().await {
			if let Ok(store) = self.cache.store_for(device.device_uid).await {
				batch_ops.extend(
					store
						.load_active_ops()
						.await?
						.into_iter()
						.filter(|op| op.batch_uid == batch_uid),
				);
			}
		}
		batch_ops.sort_by_key(|op| op.op_uid);

		match strategy {
			ErrorHandlingStrategy::Retry => {
				let mut retried = Vec::new();
				for op in batch_ops {
					if matches!(op.status, OpStatus::Failed | OpStatus::BlockedByFailure) {
						let store = self.cache.store_for(op.src.device_uid()).await?;
						store.update_op_status(op.op_uid, OpStatus::Pending).await?;
						let mut op = op;
						op.status = OpStatus::Pending;
						retried.push(op);
					}
				}
				info!("Retrying {} ops of batch {}", retried.len(), batch_uid);
				self.graph.insert_batch(&retried)?;
			}
			ErrorHandlingStrategy::Skip => {
				for op in batch_ops {
					if matches!(op.status, OpStatus::Failed | OpStatus::BlockedByFailure) {
						let mut cancelled = op.clone();
						cancelled.status = OpStatus::Cancelled;
						let store = self.cache.store_for(op.src.device_uid()).await?;
						store.archive_op(&cancelled).await?;
						self.remove_planning_nodes_for(std::slice::from_ref(&op)).await?;
					}
				}
			}
			ErrorHandlingStrategy::Abort => {
				self.graph.cancel_batch(batch_uid);
				for op in batch_ops {
					let mut cancelled = op.clone();
					cancelled.status = OpStatus::Cancelled;
					let store = self.cache.store_for(op.src.device_uid()).await?;
					store.archive_op(&cancelled).await?;
				}
				// Planning state of the aborted batch is abandoned.
				self.cache.remove_all_planning_nodes().await?;
			}
		}
		Ok(())
	}

	async fn remove_planning_nodes_for(&self, ops: &[UserOp]) -> Result<(), OpManagerError> {
		for op in ops {
			let Some(target_uid) = op.created_node_uid() else {
				continue;
			};
			let device_uid = op.primary_target().device_uid();
			if let Ok(store) = self.cache.store_for(device_uid).await {
				if let Some(node) = store.get(target_uid).await {
					if !node.is_live() {
						self.cache.remove_node(device_uid, target_uid).await?;
					}
				}
			}
		}
		Ok(())
	}

	pub fn get_last_pending_op_for_node(&self, device_uid: Uid, node_uid: Uid) -> Option<UserOp> {
		self.graph.get_last_pending_op_for_node(device_uid, node_uid)
	}

	pub fn pending_count(&self) -> usize {
		self.graph.pending_count()
	}
}

/// Batch-builder rules: within one batch a node appears at most once as a
/// source and at most once as a destination.
fn validate_batch_rules(ops: &[UserOp]) -> Result<(), OpManagerError> {
	let mut src_seen: HashSet<(Uid, Uid)> = HashSet::new();
	let mut dst_seen: HashSet<(Uid, Uid)> = HashSet::new();
	for op in ops {
		// Bracket ops share their dir node with the matching start/finish;
		// they are two phases of one logical op.
		if op.op_type.is_start_dir() || op.op_type.is_finish_dir() {
			continue;
		}
		let src_key = (op.src.device_uid(), op.src.node_uid());
		if !src_seen.insert(src_key) {
			return Err(OpManagerError::InvalidBatch(format!(
				"node {}:{} appears as src more than once",
				src_key.0, src_key.1
			)));
		}
		if let Some(dst) = &op.dst {
			let dst_key = (dst.device_uid(), dst.node_uid());
			if !dst_seen.insert(dst_key) {
				return Err(OpManagerError::InvalidBatch(format!(
					"node {}:{} appears as dst more than once",
					dst_key.0, dst_key.1
				)));
			}
		}
	}
	Ok(())
}

fn group_by_src_device(ops: &[UserOp]) -> HashMap<Uid, Vec<UserOp>> {
	let mut grouped: HashMap<Uid, Vec<UserOp>> = HashMap::new();
	for op in ops {
		grouped
			.entry(op.src.device_uid())
			.or_default()
			.push(op.clone());
	}
	grouped
}

fn parent_path_of(full_path: &str) -> Option<String> {
	let trimmed = full_path.trim_end_matches('/');
	let idx = trimmed.rfind('/')?;
	if idx == 0 {
		return Some("/".to_string());
	}
	Some(trimmed[..idx].to_string())
}

fn name_of(full_path: &str) -> String {
	full_path
		.trim_end_matches('/')
		.rsplit('/')
		.next()
		.unwrap_or(full_path)
		.to_string()
}

fn build_local_planning_node(
	device_uid: Uid,
	uid: Uid,
	parent_uid: Uid,
	full_path: &str,
	is_dir: bool,
) -> Node {
	if is_dir {
		Node::LocalDir(LocalDirNode {
			device_uid,
			uid,
			parent_uid,
			name: name_of(full_path),
			full_path: full_path.to_string(),
			trashed: TrashStatus::NotTrashed,
			is_live: false,
			all_children_fetched: true,
			dir_meta: None,
			modify_ts: None,
			change_ts: None,
		})
	} else {
		Node::LocalFile(LocalFileNode {
			device_uid,
			uid,
			parent_uid,
			name: name_of(full_path),
			full_path: full_path.to_string(),
			trashed: TrashStatus::NotTrashed,
			is_live: false,
			meta: FileMeta::default(),
		})
	}
}

fn build_gdrive_planning_node(
	device_uid: Uid,
	uid: Uid,
	parent_uids: Vec<Uid>,
	full_path: &str,
	is_dir: bool,
) -> Node {
	let identity = GDriveIdentity {
		goog_id: None,
		owner_uid: None,
		drive_id: None,
		parent_uids,
	};
	if is_dir {
		Node::GDriveFolder(GDriveFolderNode {
			device_uid,
			uid,
			name: name_of(full_path),
			identity,
			trashed: TrashStatus::NotTrashed,
			is_live: false,
			all_children_fetched: true,
			dir_meta: None,
			create_ts: None,
			modify_ts: None,
		})
	} else {
		Node::GDriveFile(GDriveFileNode {
			device_uid,
			uid,
			name: name_of(full_path),
			identity,
			trashed: TrashStatus::NotTrashed,
			is_live: false,
			meta: FileMeta::default(),
			version: None,
			mime_type_uid: None,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::identifier::NodeIdentifier;

	fn spid(device: u32, node: u32, path: &str) -> NodeIdentifier {
		NodeIdentifier::spid(Uid(device), Uid(node), path)
	}

	#[test]
	fn duplicate_src_is_rejected() {
		let ops = vec![
			UserOp::new(Uid(10), Uid(1), OpType::Rm, spid(2, 50, "/a/x"), None),
			UserOp::new(Uid(11), Uid(1), OpType::Rm, spid(2, 50, "/a/x"), None),
		];
		assert!(matches!(
			validate_batch_rules(&ops),
			Err(OpManagerError::InvalidBatch(_))
		));
	}

	#[test]
	fn duplicate_dst_is_rejected() {
		let ops = vec![
			UserOp::new(
				Uid(10),
				Uid(1),
				OpType::Cp,
				spid(2, 50, "/a/x"),
				Some(spid(2, 60, "/b/x")),
			),
			UserOp::new(
				Uid(11),
				Uid(1),
				OpType::Cp,
				spid(2, 51, "/a/y"),
				Some(spid(2, 60, "/b/x")),
			),
		];
		assert!(matches!(
			validate_batch_rules(&ops),
			Err(OpManagerError::InvalidBatch(_))
		));
	}

	#[test]
	fn bracket_pairs_share_their_node() {
		let ops = vec![
			UserOp::new(Uid(10), Uid(1), OpType::StartDirRm, spid(2, 40, "/d"), None),
			UserOp::new(Uid(11), Uid(1), OpType::Rm, spid(2, 41, "/d/x"), None),
			UserOp::new(Uid(12), Uid(1), OpType::FinishDirRm, spid(2, 40, "/d"), None),
		];
		assert!(validate_batch_rules(&ops).is_ok());
	}

	#[test]
	fn parent_paths() {
		assert_eq!(parent_path_of("/a/b/c"), Some("/a/b".to_string()));
		assert_eq!(parent_path_of("/a"), Some("/".to_string()));
		assert_eq!(parent_path_of("relative"), None);
		assert_eq!(name_of("/a/b/c.txt"), "c.txt");
	}
}
