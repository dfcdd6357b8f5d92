//! The op executor: one dispatcher per device.
//!
//! Pulls ready ops from the graph, performs the underlying filesystem or
//! cloud call, then mutates the cache through the manager and advances the
//! graph. Drivers perform their I/O first and only then take cache writes,
//! and they return tagged errors -- nothing throws across this boundary.

use crate::cache::manager::{CacheError, CacheManager};
use crate::domain::node::{now_millis, FileMeta, Node};
use crate::domain::op::{DirConflictPolicy, FileConflictPolicy, OpType, UserOp};
use crate::domain::uid::Uid;
use crate::infrastructure::events::{Event, EventBus};
use crate::ops::manager::OpManager;
use crate::store::gdrive::RemoteError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Classified driver errors; the policy table in the dispatcher keys off
/// these.
#[derive(Error, Debug)]
pub enum ExecError {
	/// Timeout, 429, 5xx: retry with backoff, then fail.
	#[error("transient: {0}")]
	Transient(String),

	/// Source vanished, destination collision: reclassified per conflict
	/// policy.
	#[error("precondition failed: {0}")]
	Precondition(String),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("insufficient space: {0}")]
	InsufficientSpace(String),

	#[error("{0}")]
	Fatal(String),
}

impl ExecError {
	/// Stable error code logged with every failure.
	pub fn code(&self) -> &'static str {
		match self {
			Self::Transient(_) => "E_TRANSIENT",
			Self::Precondition(_) => "E_PRECONDITION",
			Self::PermissionDenied(_) => "E_PERMISSION",
			Self::InsufficientSpace(_) => "E_NO_SPACE",
			Self::Fatal(_) => "E_FATAL",
		}
	}

	/// User message plus remediation where one exists.
	pub fn user_message(&self) -> String {
		match self {
			Self::InsufficientSpace(detail) => {
				format!("Not enough free space to complete the operation. Free up space and retry. ({detail})")
			}
			other => other.to_string(),
		}
	}
}

fn classify_io(e: &std::io::Error, ctx: &str) -> ExecError {
	use std::io::ErrorKind;
	// ENOSPC has no stable ErrorKind on this toolchain floor.
	if e.raw_os_error() == Some(28) {
		return ExecError::InsufficientSpace(format!("{ctx}: {e}"));
	}
	match e.kind() {
		ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => {
			ExecError::Transient(format!("{ctx}: {e}"))
		}
		ErrorKind::NotFound | ErrorKind::AlreadyExists => {
			ExecError::Precondition(format!("{ctx}: {e}"))
		}
		ErrorKind::PermissionDenied => ExecError::PermissionDenied(format!("{ctx}: {e}")),
		_ => ExecError::Fatal(format!("{ctx}: {e}")),
	}
}

fn classify_remote(e: RemoteError, ctx: &str) -> ExecError {
	match e {
		RemoteError::RateLimited | RemoteError::Server(_) | RemoteError::Network(_) => {
			ExecError::Transient(format!("{ctx}: {e}"))
		}
		RemoteError::NotFound(_) => ExecError::Precondition(format!("{ctx}: {e}")),
		RemoteError::PermissionDenied(_) => ExecError::PermissionDenied(format!("{ctx}: {e}")),
		RemoteError::InsufficientSpace => ExecError::InsufficientSpace(ctx.to_string()),
		RemoteError::Protocol(_) => ExecError::Fatal(format!("{ctx}: {e}")),
	}
}

fn cache_err(e: CacheError) -> ExecError {
	match e {
		CacheError::NodeNotFound(uid) => ExecError::Precondition(format!("node {uid} vanished")),
		other => ExecError::Fatal(other.to_string()),
	}
}

/// Conflict policies chosen when a batch was built.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchPolicies {
	pub file: FileConflictPolicy,
	pub dir: DirConflictPolicy,
}

/// Registry of per-batch policies, shared by every device executor.
#[derive(Default)]
pub struct PolicyRegistry {
	inner: StdMutex<HashMap<Uid, BatchPolicies>>,
}

impl PolicyRegistry {
	pub fn set(&self, batch_uid: Uid, policies: BatchPolicies) {
		self.inner.lock().expect("policy registry poisoned").insert(batch_uid, policies);
	}

	pub fn get(&self, batch_uid: Uid) -> BatchPolicies {
		self.inner
			.lock()
			.expect("policy registry poisoned")
			.get(&batch_uid)
			.copied()
			.unwrap_or_default()
	}
}

enum OpOutcome {
	Done,
	/// Conflict policy said skip; the op ends CANCELLED with no change.
	Skipped,
}

/// Dispatcher for ops whose primary target lives on one device.
pub struct OpExecutor {
	device_uid: Uid,
	manager: Arc<OpManager>,
	cache: Arc<CacheManager>,
	events: Arc<EventBus>,
	policies: Arc<PolicyRegistry>,
	staging_dir: PathBuf,
	update_meta_for_dst_nodes: bool,
	max_transient_retries: u32,
	play_rx: watch::Receiver<bool>,
}

impl OpExecutor {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		device_uid: Uid,
		manager: Arc<OpManager>,
		cache: Arc<CacheManager>,
		events: Arc<EventBus>,
		policies: Arc<PolicyRegistry>,
		staging_dir: PathBuf,
		update_meta_for_dst_nodes: bool,
		max_transient_retries: u32,
		play_rx: watch::Receiver<bool>,
	) -> Self {
		Self {
			device_uid,
			manager,
			cache,
			events,
			policies,
			staging_dir,
			update_meta_for_dst_nodes,
			max_transient_retries,
			play_rx,
		}
	}

	pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
		tokio::spawn(self.run(shutdown))
	}

	async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
		info!("Op executor for device {} started", self.device_uid);
			loop {
				// Honour pause. Cancellation is checked between ops only;
				// an in-flight op runs to completion.
				while !*self.play_rx.borrow() {
					tokio::select! {
						_ = self.play_rx.changed() => {}
						_ = shutdown.changed() => {
							if *shutdown.borrow() {
								return;
							}
						}
					}
				}

				let op = tokio::select! {
					op = Box::pin(self.manager.graph().next_ready_for_device(self.device_uid)) => {
						match op {
							Some(op) => op,
							None => return,
						}
					}
					_ = shutdown.changed() => {
						if *shutdown.borrow() {
							return;
						}
						continue;
					}
				};

				// A pause that landed while we waited on the ready set parks
				// the claimed op until resume.
				while !*self.play_rx.borrow() {
					tokio::select! {
						_ = self.play_rx.changed() => {}
						_ = shutdown.changed() => {
							if *shutdown.borrow() {
								return;
							}
						}
					}
				}

				debug!("Executing {}", op.tag());
				if let Err(e) = self.manager.persist_in_progress(&op).await {
					error!("Failed to persist op {} as in-progress: {e}", op.op_uid);
				}

				match Box::pin(self.run_with_retries(&op)).await {
					Ok(OpOutcome::Done) => {
						if let Err(e) = self.manager.complete_op(&op).await {
							error!("Failed to complete op {}: {e}", op.op_uid);
						}
					}
					Ok(OpOutcome::Skipped) => {
						info!("Op {} skipped by conflict policy", op.op_uid);
						if let Err(e) = self.manager.cancel_op(&op).await {
							error!("Failed to cancel op {}: {e}", op.op_uid);
						}
					}
					Err(e) => {
						error!("[{}] op {} failed: {}", e.code(), op.op_uid, e);
						let result = self
							.manager
							.fail_op(&op, e.user_message(), format!("{} {}", e.code(), op.tag()))
							.await;
						if let Err(e) = result {
							error!("Failed to record failure of op {}: {e}", op.op_uid);
						}
					}
				}
			}
	}

	async fn run_with_retries(&self, op: &UserOp) -> Result<OpOutcome, ExecError> {
		let mut attempt = 0u32;
		loop {
			match self.execute(op).await {
				Err(ExecError::Transient(msg)) if attempt < self.max_transient_retries => {
					let delay = Duration::from_secs(1u64 << attempt);
					warn!("Op {} hit transient error ({msg}); retrying in {delay:?}", op.op_uid);
					tokio::time::sleep(delay).await;
					attempt += 1;
				}
				other => return other,
			}
		}
	}

	async fn execute(&self, op: &UserOp) -> Result<OpOutcome, ExecError> {
		let policies = self.policies.get(op.batch_uid);
		match op.op_type {
			OpType::Mkdir | OpType::StartDirCp | OpType::StartDirMv => {
				self.exec_make_dir(op, policies).await
			}
			OpType::Cp | OpType::CpOnto => {
				self.exec_copy(op, op.op_type == OpType::CpOnto, policies).await
			}
			OpType::Mv | OpType::MvOnto => {
				self.exec_move(op, op.op_type == OpType::MvOnto, policies).await
			}
			OpType::Rm => self.exec_remove(op, false).await,
			OpType::StartDirRm => {
				// Validation phase only; children do the work.
				self.src_node(op).await.map(|_| OpOutcome::Done)
			}
			OpType::FinishDirRm => self.exec_remove(op, true).await,
			OpType::FinishDirCp => self.exec_finish_dir_copy(op).await,
			OpType::FinishDirMv => self.exec_finish_dir_move(op).await,
		}
	}

	async fn src_node(&self, op: &UserOp) -> Result<Node, ExecError> {
		self.cache
			.get_node_for_uid(op.src.device_uid(), op.src.node_uid())
			.await
			.map_err(cache_err)
	}

	async fn target_node(&self, op: &UserOp) -> Result<Node, ExecError> {
		let target = op.primary_target();
		self.cache
			.get_node_for_uid(target.device_uid(), target.node_uid())
			.await
			.map_err(cache_err)
	}

	// MKDIR / START_DIR_CP / START_DIR_MV: bring the destination dir into
	// existence. Idempotent: an existing dir is success.

	async fn exec_make_dir(&self, op: &UserOp, policies: BatchPolicies) -> Result<OpOutcome, ExecError> {
		let mut node = self.target_node(op).await?;
		let target = op.primary_target();
		let path = target
			.first_path()
			.ok_or_else(|| ExecError::Fatal("dir op without a path".into()))?
			.to_string();

		if node.is_local() {
			let fs_path = PathBuf::from(&path);
			match std::fs::create_dir(&fs_path) {
				Ok(()) => {}
				Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
					if !fs_path.is_dir() {
						// A file squats on the dir path.
						return match policies.dir {
							DirConflictPolicy::Skip => Ok(OpOutcome::Skipped),
							_ => Err(ExecError::Precondition(format!(
								"a file exists at {path}"
							))),
						};
					}
				}
				Err(e) => return Err(classify_io(&e, &format!("mkdir {path}"))),
			}
			if let Node::LocalDir(dir) = &mut node {
				dir.is_live = true;
				dir.modify_ts = Some(now_millis());
			}
		} else {
			// Cloud: an existing live folder with a goog_id is reused.
			if node.goog_id().is_some() && node.is_live() {
				return Ok(OpOutcome::Done);
			}
			let parent_goog_id = self.resolve_gdrive_parent(target.device_uid(), &path).await?;
			let remote = self
				.cache
				.remote_for(target.device_uid())
				.await
				.map_err(cache_err)?;
			let entry = remote
				.create_folder(node.name(), &parent_goog_id)
				.await
				.map_err(|e| classify_remote(e, &format!("create_folder {path}")))?;
			if let Node::GDriveFolder(folder) = &mut node {
				folder.identity.goog_id = Some(entry.goog_id);
				folder.is_live = true;
				folder.modify_ts = entry.modify_ts;
			}
		}
		self.cache.upsert_node(node).await.map_err(cache_err)?;
		Ok(OpOutcome::Done)
	}

	// CP / CP_ONTO

	async fn exec_copy(
		&self,
		op: &UserOp,
		overwrite: bool,
		policies: BatchPolicies,
	) -> Result<OpOutcome, ExecError> {
		let src = self.src_node(op).await?;
		let dst_id = op.dst.as_ref().ok_or_else(|| ExecError::Fatal("copy without dst".into()))?;
		let dst_device = self.cache.device(dst_id.device_uid()).await.map_err(cache_err)?;
		let mut dst_path = dst_id
			.first_path()
			.ok_or_else(|| ExecError::Fatal("copy without dst path".into()))?
			.to_string();

		if dst_device.tree_type == crate::domain::device::TreeType::Local {
			// Destination is local disk.
			if !overwrite && Path::new(&dst_path).exists() {
				match self.resolve_file_conflict(&src, dst_id, &dst_path, policies).await? {
					ConflictResolution::Proceed => {}
					ConflictResolution::ProceedAt(renamed) => dst_path = renamed,
					ConflictResolution::AlreadySatisfied => return Ok(OpOutcome::Done),
					ConflictResolution::Skip => return Ok(OpOutcome::Skipped),
				}
			}
			self.materialise_local_file(op, &src, dst_id, &dst_path).await?;
			Ok(OpOutcome::Done)
		} else {
			self.copy_to_gdrive(op, &src, dst_id, &dst_path, overwrite, policies).await
		}
	}

	/// Conflict table for an existing file destination.
	async fn resolve_file_conflict(
		&self,
		src: &Node,
		dst_id: &crate::domain::identifier::NodeIdentifier,
		dst_path: &str,
		policies: BatchPolicies,
	) -> Result<ConflictResolution, ExecError> {
		// Same content already in place is success, not a conflict.
		let cached_dst = self
			.cache
			.get_node_for_uid(dst_id.device_uid(), dst_id.node_uid())
			.await
			.ok();
		if let (Some(src_md5), Some(dst_md5)) = (
			src.md5(),
			cached_dst.as_ref().filter(|n| n.is_live()).and_then(|n| n.md5()),
		) {
			if src_md5 == dst_md5 {
				return Ok(ConflictResolution::AlreadySatisfied);
			}
		}
		match policies.file {
			FileConflictPolicy::Fail => Err(ExecError::Precondition(format!(
				"destination already exists: {dst_path}"
			))),
			FileConflictPolicy::Skip => Ok(ConflictResolution::Skip),
			FileConflictPolicy::Overwrite => Ok(ConflictResolution::Proceed),
			FileConflictPolicy::Rename => Ok(ConflictResolution::ProceedAt(free_name(dst_path))),
		}
	}

	/// Stage, fsync, rename a file into place on local disk, from either a
	/// local or a cloud source, then promote the cache record.
	async fn materialise_local_file(
		&self,
		op: &UserOp,
		src: &Node,
		dst_id: &crate::domain::identifier::NodeIdentifier,
		dst_path: &str,
	) -> Result<(), ExecError> {
		let staging_path = self.staging_dir.join(format!("op_{}.part", op.op_uid));

		if let Some(src_path) = src.cached_path() {
			let src_path = PathBuf::from(src_path);
			let staging = staging_path.clone();
			tokio::task::spawn_blocking(move || stage_copy(&src_path, &staging))
				.await
				.map_err(|e| ExecError::Fatal(e.to_string()))?
				.map_err(|e| classify_io(&e, "stage copy"))?;
		} else {
			// Cloud source: download into staging.
			let goog_id = src
				.goog_id()
				.ok_or_else(|| ExecError::Precondition("cloud source has no id yet".into()))?;
			let remote = self
				.cache
				.remote_for(src.device_uid())
				.await
				.map_err(cache_err)?;
			remote
				.download_file(goog_id, &staging_path)
				.await
				.map_err(|e| classify_remote(e, "download"))?;
		}
		let staging_record = staging_node(src, &staging_path);
		self.events.emit(Event::NodeUpserted {
			node: staging_record.clone(),
		});

		let staging = staging_path.clone();
		let dst = PathBuf::from(dst_path);
		tokio::task::spawn_blocking(move || promote_staged(&staging, &dst))
			.await
			.map_err(|e| ExecError::Fatal(e.to_string()))?
			.map_err(|e| classify_io(&e, "promote staged file"))?;
		self.events.emit(Event::NodeRemoved {
			node: staging_record,
		});

		// Build the live record: planning node uid, fresh fs metadata,
		// signature carried from the source (content is identical).
		let fs_meta = std::fs::metadata(dst_path).map_err(|e| classify_io(&e, "stat dst"))?;
		let mut meta = FileMeta::from_fs_metadata(&fs_meta);
		if let Some(src_meta) = src.file_meta() {
			meta.md5 = src_meta.md5.clone();
			meta.sha256 = src_meta.sha256.clone();
			if self.update_meta_for_dst_nodes {
				meta.create_ts = src_meta.create_ts;
			}
		}

		let store = self
			.cache
			.store_for(dst_id.device_uid())
			.await
			.map_err(cache_err)?;
		let parent_path = Path::new(dst_path)
			.parent()
			.map(|p| p.to_string_lossy().to_string())
			.unwrap_or_else(|| "/".to_string());
		let parent_uid = store
			.get_or_assign_uid_for_path(&parent_path, self.cache.allocator())
			.await
			.map_err(|e| ExecError::Fatal(e.to_string()))?;

		let node = Node::LocalFile(crate::domain::node::LocalFileNode {
			device_uid: dst_id.device_uid(),
			uid: dst_id.node_uid(),
			parent_uid,
			name: name_of(dst_path),
			full_path: dst_path.to_string(),
			trashed: crate::domain::node::TrashStatus::NotTrashed,
			is_live: true,
			meta,
		});
		self.cache.upsert_node(node).await.map_err(cache_err)?;
		Ok(())
	}

	async fn copy_to_gdrive(
		&self,
		op: &UserOp,
		src: &Node,
		dst_id: &crate::domain::identifier::NodeIdentifier,
		dst_path: &str,
		overwrite: bool,
		policies: BatchPolicies,
	) -> Result<OpOutcome, ExecError> {
		let device_uid = dst_id.device_uid();
		let remote = self.cache.remote_for(device_uid).await.map_err(cache_err)?;
		let parent_goog_id = self.resolve_gdrive_parent(device_uid, dst_path).await?;
		let mut dst_name = name_of(dst_path);

		// Conflict: a live sibling with the target name.
		let store = self.cache.store_for(device_uid).await.map_err(cache_err)?;
		let parent_node = self
			.cache
			.resolve_path_to_node(device_uid, &parent_path_str(dst_path))
			.await
			.map_err(cache_err)?;
		let existing = match &parent_node {
			Some(parent) => store.get_child_by_name(parent.uid(), &dst_name).await,
			None => None,
		};
		if let Some(existing) = existing.filter(|n| n.uid() != dst_id.node_uid()) {
			if !overwrite {
				match policies.file {
					FileConflictPolicy::Fail => {
						return Err(ExecError::Precondition(format!(
							"destination already exists: {dst_path}"
						)))
					}
					FileConflictPolicy::Skip => return Ok(OpOutcome::Skipped),
					FileConflictPolicy::Rename => dst_name = free_sibling_name(&dst_name),
					FileConflictPolicy::Overwrite => {
						if let Some(goog_id) = existing.goog_id() {
							remote
								.delete_node(goog_id)
								.await
								.map_err(|e| classify_remote(e, "replace dst"))?;
						}
						self.cache
							.remove_node(device_uid, existing.uid())
							.await
							.map_err(cache_err)?;
					}
				}
			}
		}

		let entry = if let Some(src_path) = src.cached_path() {
			// Uploads read from the staged copy, never the live file.
			let staging_path = self.staging_dir.join(format!("op_{}.part", op.op_uid));
			{
				let src_path = PathBuf::from(src_path);
				let staging = staging_path.clone();
				tokio::task::spawn_blocking(move || stage_copy(&src_path, &staging))
					.await
					.map_err(|e| ExecError::Fatal(e.to_string()))?
					.map_err(|e| classify_io(&e, "stage copy"))?;
			}
			let staging_record = staging_node(src, &staging_path);
			self.events.emit(Event::NodeUpserted {
				node: staging_record.clone(),
			});

			let entry = remote
				.upload_file(&staging_path, &dst_name, &parent_goog_id)
				.await
				.map_err(|e| classify_remote(e, "upload"))?;

			if let Err(e) = std::fs::remove_file(&staging_path) {
				warn!("Failed to clean staging file {:?}: {e}", staging_path);
			}
			self.events.emit(Event::NodeRemoved {
				node: staging_record,
			});
			entry
		} else {
			let goog_id = src
				.goog_id()
				.ok_or_else(|| ExecError::Precondition("cloud source has no id yet".into()))?;
			remote
				.copy_file(goog_id, &dst_name, &parent_goog_id)
				.await
				.map_err(|e| classify_remote(e, "remote copy"))?
		};

		// Promote the planning record with the vendor identity.
		let mut node = self.target_node(op).await?;
		if let Node::GDriveFile(file) = &mut node {
			file.identity.goog_id = Some(entry.goog_id.clone());
			file.name = dst_name;
			file.is_live = true;
			file.version = entry.version;
			file.meta.size_bytes = entry.size_bytes;
			file.meta.md5 = entry.md5.clone().or_else(|| src.md5().map(str::to_string));
			file.meta.modify_ts = entry.modify_ts;
			file.meta.sync_ts = Some(now_millis());
		}
		self.cache.upsert_node(node).await.map_err(cache_err)?;
		Ok(OpOutcome::Done)
	}

	// MV / MV_ONTO

	async fn exec_move(
		&self,
		op: &UserOp,
		overwrite: bool,
		policies: BatchPolicies,
	) -> Result<OpOutcome, ExecError> {
		let src = self.src_node(op).await?;
		let dst_id = op.dst.as_ref().ok_or_else(|| ExecError::Fatal("move without dst".into()))?;
		let same_device = src.device_uid() == dst_id.device_uid();

		if same_device && src.is_local() {
			return self.move_local(op, &src, dst_id, overwrite, policies).await;
		}
		if same_device && src.is_gdrive() {
			return self.move_gdrive(op, &src, dst_id).await;
		}

		// Cross-device move: copy then delete the source.
		let copied = self.exec_copy(op, overwrite, policies).await?;
		if matches!(copied, OpOutcome::Skipped) {
			return Ok(OpOutcome::Skipped);
		}
		self.delete_node_on_medium(&src).await?;
		self.cache
			.remove_node(src.device_uid(), src.uid())
			.await
			.map_err(cache_err)?;
		Ok(OpOutcome::Done)
	}

	/// Rename within a filesystem (copy+delete across), carrying the node's
	/// identity to the new path.
	async fn move_local(
		&self,
		op: &UserOp,
		src: &Node,
		dst_id: &crate::domain::identifier::NodeIdentifier,
		overwrite: bool,
		policies: BatchPolicies,
	) -> Result<OpOutcome, ExecError> {
		let src_path = src
			.cached_path()
			.ok_or_else(|| ExecError::Precondition("source has no path".into()))?
			.to_string();
		let mut dst_path = dst_id
			.first_path()
			.ok_or_else(|| ExecError::Fatal("move without dst path".into()))?
			.to_string();

		if !overwrite && Path::new(&dst_path).exists() {
			match self.resolve_file_conflict(src, dst_id, &dst_path, policies).await? {
				ConflictResolution::Proceed => {}
				ConflictResolution::ProceedAt(renamed) => dst_path = renamed,
				ConflictResolution::AlreadySatisfied | ConflictResolution::Skip => {
					return Ok(OpOutcome::Skipped)
				}
			}
		}

		let from = PathBuf::from(&src_path);
		let to = PathBuf::from(&dst_path);
		tokio::task::spawn_blocking(move || rename_or_copy(&from, &to))
			.await
			.map_err(|e| ExecError::Fatal(e.to_string()))?
			.map_err(|e| classify_io(&e, "rename"))?;

		let store = self
			.cache
			.store_for(src.device_uid())
			.await
			.map_err(cache_err)?;

		// The overwritten destination record (MV_ONTO) goes away first.
		if overwrite {
			if let Ok(dst_node) = self
				.cache
				.get_node_for_uid(dst_id.device_uid(), dst_id.node_uid())
				.await
			{
				if dst_node.is_live() && dst_node.uid() != src.uid() {
					self.cache
						.remove_node(dst_id.device_uid(), dst_node.uid())
						.await
						.map_err(cache_err)?;
				}
			}
		} else if dst_id.node_uid() != src.uid() {
			// Planning node for the dst path is superseded by the moved
			// node keeping its identity.
			if let Some(planning) = store.get(dst_id.node_uid()).await {
				if !planning.is_live() {
					self.cache
						.remove_node(dst_id.device_uid(), planning.uid())
						.await
						.map_err(cache_err)?;
				}
			}
		}

		// Identity follows the move: same uid, new parent and path.
		let parent_path = parent_path_str(&dst_path);
		let parent_uid = store
			.get_or_assign_uid_for_path(&parent_path, self.cache.allocator())
			.await
			.map_err(|e| ExecError::Fatal(e.to_string()))?;
		let mut moved = src.clone();
		match &mut moved {
			Node::LocalFile(file) => {
				file.parent_uid = parent_uid;
				file.name = name_of(&dst_path);
				file.full_path = dst_path.clone();
				file.meta.sync_ts = Some(now_millis());
			}
			Node::LocalDir(dir) => {
				dir.parent_uid = parent_uid;
				dir.name = name_of(&dst_path);
				dir.full_path = dst_path.clone();
			}
			_ => {}
		}
		store
			.rebind_path(&dst_path, src.uid())
			.await
			.map_err(|e| ExecError::Fatal(e.to_string()))?;
		store
			.unbind_path(&src_path)
			.await
			.map_err(|e| ExecError::Fatal(e.to_string()))?;
		self.cache.upsert_node(moved).await.map_err(cache_err)?;
		Ok(OpOutcome::Done)
	}

	async fn move_gdrive(
		&self,
		op: &UserOp,
		src: &Node,
		dst_id: &crate::domain::identifier::NodeIdentifier,
	) -> Result<OpOutcome, ExecError> {
		let device_uid = src.device_uid();
		let remote = self.cache.remote_for(device_uid).await.map_err(cache_err)?;
		let goog_id = src
			.goog_id()
			.ok_or_else(|| ExecError::Precondition("cloud source has no id yet".into()))?;
		let dst_path = dst_id
			.first_path()
			.ok_or_else(|| ExecError::Fatal("move without dst path".into()))?;

		let old_parent_goog_id = match src.parent_uids().first() {
			Some(&parent_uid) => self
				.cache
				.get_node_for_uid(device_uid, parent_uid)
				.await
				.ok()
				.and_then(|n| n.goog_id().map(str::to_string))
				.unwrap_or_default(),
			None => String::new(),
		};
		let new_parent_goog_id = self.resolve_gdrive_parent(device_uid, dst_path).await?;
		let new_name = name_of(dst_path);

		let entry = remote
			.move_node(goog_id, &new_name, &old_parent_goog_id, &new_parent_goog_id)
			.await
			.map_err(|e| classify_remote(e, "remote move"))?;

		// Planning node out, moved node (same uid) re-parented.
		if dst_id.node_uid() != src.uid() {
			let store = self.cache.store_for(device_uid).await.map_err(cache_err)?;
			if let Some(planning) = store.get(dst_id.node_uid()).await {
				if !planning.is_live() {
					self.cache
						.remove_node(device_uid, planning.uid())
						.await
						.map_err(cache_err)?;
				}
			}
		}
		let new_parent_uid = self
			.cache
			.resolve_path_to_node(device_uid, &parent_path_str(dst_path))
			.await
			.map_err(cache_err)?
			.map(|n| n.uid());
		let mut moved = src.clone();
		match &mut moved {
			Node::GDriveFile(file) => {
				file.name = new_name;
				file.identity.parent_uids = new_parent_uid.into_iter().collect();
				file.version = entry.version.or(file.version);
			}
			Node::GDriveFolder(folder) => {
				folder.name = new_name;
				folder.identity.parent_uids = new_parent_uid.into_iter().collect();
			}
			_ => {}
		}
		self.cache.upsert_node(moved).await.map_err(cache_err)?;
		Ok(OpOutcome::Done)
	}

	// RM / FINISH_DIR_RM

	async fn exec_remove(&self, op: &UserOp, is_dir: bool) -> Result<OpOutcome, ExecError> {
		let src = self.src_node(op).await?;
		self.delete_on_medium_inner(&src, is_dir).await?;
		self.cache
			.remove_node(src.device_uid(), src.uid())
			.await
			.map_err(cache_err)?;
		Ok(OpOutcome::Done)
	}

	async fn delete_node_on_medium(&self, node: &Node) -> Result<(), ExecError> {
		self.delete_on_medium_inner(node, node.is_dir()).await
	}

	async fn delete_on_medium_inner(&self, node: &Node, is_dir: bool) -> Result<(), ExecError> {
		if let Some(path) = node.cached_path() {
			let path = PathBuf::from(path);
			let result = tokio::task::spawn_blocking(move || {
				if is_dir {
					std::fs::remove_dir(&path)
				} else {
					std::fs::remove_file(&path)
				}
			})
			.await
			.map_err(|e| ExecError::Fatal(e.to_string()))?;
			match result {
				Ok(()) => Ok(()),
				// Already gone is the goal state.
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
				Err(e) => Err(classify_io(&e, "remove")),
			}
		} else if let Some(goog_id) = node.goog_id() {
			let remote = self
				.cache
				.remote_for(node.device_uid())
				.await
				.map_err(cache_err)?;
			match remote.delete_node(goog_id).await {
				Ok(()) => Ok(()),
				Err(RemoteError::NotFound(_)) => Ok(()),
				Err(e) => Err(classify_remote(e, "remote delete")),
			}
		} else {
			// Planning node never materialised; nothing on any medium.
			Ok(())
		}
	}

	// FINISH_DIR_CP / FINISH_DIR_MV

	/// Close out a dir copy: refresh the destination dir record, carrying
	/// source timestamps when configured.
	async fn exec_finish_dir_copy(&self, op: &UserOp) -> Result<OpOutcome, ExecError> {
		let src = self.src_node(op).await?;
		let mut dst = self.target_node(op).await?;
		if self.update_meta_for_dst_nodes {
			match (&mut dst, &src) {
				(Node::LocalDir(d), Node::LocalDir(s)) => {
					d.modify_ts = s.modify_ts;
					d.change_ts = s.change_ts;
				}
				(Node::GDriveFolder(d), Node::GDriveFolder(s)) => {
					d.modify_ts = s.modify_ts;
				}
				_ => {}
			}
		}
		dst.set_is_live(true);
		self.cache.upsert_node(dst).await.map_err(cache_err)?;
		Ok(OpOutcome::Done)
	}

	/// Close out a dir move: the children are gone, remove the emptied
	/// source dir.
	async fn exec_finish_dir_move(&self, op: &UserOp) -> Result<OpOutcome, ExecError> {
		let src = self.src_node(op).await?;
		self.delete_on_medium_inner(&src, true).await?;
		self.cache
			.remove_node(src.device_uid(), src.uid())
			.await
			.map_err(cache_err)?;
		let mut dst = self.target_node(op).await?;
		dst.set_is_live(true);
		self.cache.upsert_node(dst).await.map_err(cache_err)?;
		Ok(OpOutcome::Done)
	}

	// Helpers

	async fn resolve_gdrive_parent(
		&self,
		device_uid: Uid,
		dst_path: &str,
	) -> Result<String, ExecError> {
		let parent_path = parent_path_str(dst_path);
		let parent = self
			.cache
			.resolve_path_to_node(device_uid, &parent_path)
			.await
			.map_err(cache_err)?
			.ok_or_else(|| ExecError::Precondition(format!("no parent at {parent_path}")))?;
		parent
			.goog_id()
			.map(str::to_string)
			.ok_or_else(|| {
				ExecError::Precondition(format!("parent at {parent_path} not yet created remotely"))
			})
	}

}

/// Transient record for the staging copy, surfaced to subscribers but never
/// persisted.
fn staging_node(src: &Node, staging_path: &Path) -> Node {
	Node::LocalFile(crate::domain::node::LocalFileNode {
		device_uid: src.device_uid(),
		uid: src.uid(),
		parent_uid: crate::domain::uid::SUPER_ROOT_UID,
		name: name_of(&staging_path.to_string_lossy()),
		full_path: staging_path.to_string_lossy().to_string(),
		trashed: crate::domain::node::TrashStatus::NotTrashed,
		is_live: true,
		meta: src.file_meta().cloned().unwrap_or_default(),
	})
}

enum ConflictResolution {
	Proceed,
	ProceedAt(String),
	AlreadySatisfied,
	Skip,
}

/// Copy into the staging file and flush it to disk.
fn stage_copy(src: &Path, staging: &Path) -> std::io::Result<u64> {
	if let Some(parent) = staging.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let mut reader = std::fs::File::open(src)?;
	let mut writer = std::fs::File::create(staging)?;
	let copied = std::io::copy(&mut reader, &mut writer)?;
	writer.sync_all()?;
	Ok(copied)
}

/// Move the staged file into place. Falls back to copy+delete when staging
/// and destination sit on different filesystems.
fn promote_staged(staging: &Path, dst: &Path) -> std::io::Result<()> {
	match std::fs::rename(staging, dst) {
		Ok(()) => Ok(()),
		Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
			std::fs::copy(staging, dst)?;
			std::fs::File::open(dst)?.sync_all()?;
			std::fs::remove_file(staging)
		}
		Err(e) => Err(e),
	}
}

fn rename_or_copy(from: &Path, to: &Path) -> std::io::Result<()> {
	match std::fs::rename(from, to) {
		Ok(()) => Ok(()),
		Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
			std::fs::copy(from, to)?;
			std::fs::File::open(to)?.sync_all()?;
			std::fs::remove_file(from)
		}
		Err(e) => Err(e),
	}
}

const fn libc_exdev() -> i32 {
	// EXDEV is 18 on every unix the agent targets.
	18
}

fn parent_path_str(full_path: &str) -> String {
	Path::new(full_path)
		.parent()
		.map(|p| p.to_string_lossy().to_string())
		.filter(|p| !p.is_empty())
		.unwrap_or_else(|| "/".to_string())
}

fn name_of(full_path: &str) -> String {
	Path::new(full_path)
		.file_name()
		.map(|n| n.to_string_lossy().to_string())
		.unwrap_or_else(|| full_path.to_string())
}

/// First non-colliding "name (N)" variant of a full path.
fn free_name(dst_path: &str) -> String {
	for n in 1..1000 {
		let candidate = numbered_variant(dst_path, n);
		if !Path::new(&candidate).exists() {
			return candidate;
		}
	}
	numbered_variant(dst_path, 1000)
}

fn free_sibling_name(name: &str) -> String {
	numbered_variant(name, 1)
}

fn numbered_variant(path_or_name: &str, n: u32) -> String {
	match path_or_name.rsplit_once('.') {
		Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => {
			format!("{stem} ({n}).{ext}")
		}
		_ => format!("{path_or_name} ({n})"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn io_classification() {
		use std::io::{Error, ErrorKind};
		assert!(matches!(
			classify_io(&Error::new(ErrorKind::TimedOut, "t"), "x"),
			ExecError::Transient(_)
		));
		assert!(matches!(
			classify_io(&Error::new(ErrorKind::NotFound, "n"), "x"),
			ExecError::Precondition(_)
		));
		assert!(matches!(
			classify_io(&Error::new(ErrorKind::PermissionDenied, "p"), "x"),
			ExecError::PermissionDenied(_)
		));
		assert!(matches!(
			classify_io(&Error::from_raw_os_error(28), "x"),
			ExecError::InsufficientSpace(_)
		));
	}

	#[test]
	fn remote_classification() {
		assert!(matches!(
			classify_remote(RemoteError::RateLimited, "x"),
			ExecError::Transient(_)
		));
		assert!(matches!(
			classify_remote(RemoteError::NotFound("f".into()), "x"),
			ExecError::Precondition(_)
		));
		assert!(matches!(
			classify_remote(RemoteError::InsufficientSpace, "x"),
			ExecError::InsufficientSpace(_)
		));
	}

	#[test]
	fn numbered_variants() {
		assert_eq!(numbered_variant("/a/b/report.txt", 1), "/a/b/report (1).txt");
		assert_eq!(numbered_variant("/a/b/Makefile", 2), "/a/b/Makefile (2)");
	}

	#[test]
	fn insufficient_space_has_remediation() {
		let e = ExecError::InsufficientSpace("disk".into());
		assert!(e.user_message().contains("Free up space"));
		assert_eq!(e.code(), "E_NO_SPACE");
	}
}
