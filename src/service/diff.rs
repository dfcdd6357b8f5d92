//! Two-pane tree diffing and change-set construction.
//!
//! The diff is content-first: files are matched by signature before falling
//! back to relative path, so a move shows up as a move and not as an
//! add/delete pair. The change maker turns diff selections, drag-drops and
//! delete gestures into op batches.

use crate::cache::manager::{CacheError, CacheManager, Sn};
use crate::domain::identifier::NodeIdentifier;
use crate::domain::node::Node;
use crate::domain::op::{Batch, DragOperation, OpType, UserOp};
use crate::domain::uid::Uid;
use crate::ops::executor::{BatchPolicies, PolicyRegistry};
use crate::ops::manager::{OpManager, OpManagerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One side of a diff match: a node plus its path relative to the tree
/// root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffEntry {
	pub sn: Sn,
	pub rel_path: String,
}

/// Outcome of diffing two loaded subtrees.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffResult {
	pub left_tree_id: String,
	pub right_tree_id: String,
	/// Present on the left only.
	pub left_only: Vec<DiffEntry>,
	/// Present on the right only.
	pub right_only: Vec<DiffEntry>,
	/// Same relative path, differing content.
	pub updated: Vec<(DiffEntry, DiffEntry)>,
	/// Same content, different relative path.
	pub moved: Vec<(DiffEntry, DiffEntry)>,
}

impl DiffResult {
	pub fn is_clean(&self) -> bool {
		self.left_only.is_empty()
			&& self.right_only.is_empty()
			&& self.updated.is_empty()
			&& self.moved.is_empty()
	}
}

/// Builds diffs and op batches on behalf of the command surface.
pub struct ChangeMaker {
	cache: Arc<CacheManager>,
	manager: Arc<OpManager>,
	policies: Arc<PolicyRegistry>,
}

impl ChangeMaker {
	pub fn new(
		cache: Arc<CacheManager>,
		manager: Arc<OpManager>,
		policies: Arc<PolicyRegistry>,
	) -> Self {
		Self {
			cache,
			manager,
			policies,
		}
	}

	/// Content-first diff of two loaded trees.
	pub async fn diff_trees(
		&self,
		left_tree_id: &str,
		right_tree_id: &str,
	) -> Result<DiffResult, CacheError> {
		let left = self.collect_files(left_tree_id).await?;
		let right = self.collect_files(right_tree_id).await?;

		let mut result = DiffResult {
			left_tree_id: left_tree_id.to_string(),
			right_tree_id: right_tree_id.to_string(),
			..Default::default()
		};

		let right_by_rel: HashMap<&str, &DiffEntry> =
			right.iter().map(|e| (e.rel_path.as_str(), e)).collect();
		let right_by_md5: HashMap<&str, &DiffEntry> = right
			.iter()
			.filter_map(|e| e.sn.node.md5().map(|md5| (md5, e)))
			.collect();
		let left_by_rel: HashMap<&str, &DiffEntry> =
			left.iter().map(|e| (e.rel_path.as_str(), e)).collect();

		for entry in &left {
			match right_by_rel.get(entry.rel_path.as_str()) {
				Some(counterpart) => {
					if !same_content(&entry.sn.node, &counterpart.sn.node) {
						result
							.updated
							.push((entry.clone(), (*counterpart).clone()));
					}
				}
				None => {
					// Content-first: the same bytes elsewhere on the right
					// is a move, not an add.
					let relocated = entry
						.sn
						.node
						.md5()
						.and_then(|md5| right_by_md5.get(md5))
						.filter(|candidate| !left_by_rel.contains_key(candidate.rel_path.as_str()));
					match relocated {
						Some(candidate) => {
							result.moved.push((entry.clone(), (*candidate).clone()))
						}
						None => result.left_only.push(entry.clone()),
					}
				}
			}
		}

		let matched_right: Vec<&str> = result
			.updated
			.iter()
			.map(|(_, r)| r.rel_path.as_str())
			.chain(result.moved.iter().map(|(_, r)| r.rel_path.as_str()))
			.collect();
		for entry in &right {
			if !left_by_rel.contains_key(entry.rel_path.as_str())
				&& !matched_right.contains(&entry.rel_path.as_str())
			{
				result.right_only.push(entry.clone());
			}
		}

		info!(
			"Diff {left_tree_id} vs {right_tree_id}: {} left-only, {} right-only, {} updated, {} moved",
			result.left_only.len(),
			result.right_only.len(),
			result.updated.len(),
			result.moved.len()
		);
		Ok(result)
	}

	async fn collect_files(&self, tree_id: &str) -> Result<Vec<DiffEntry>, CacheError> {
		let root = self
			.cache
			.tree_root(tree_id)
			.await
			.ok_or_else(|| CacheError::UnknownTree(tree_id.to_string()))?;
		let root_path = root.first_path().unwrap_or("/").to_string();
		let store = self.cache.store_for(root.device_uid()).await?;

		let mut entries = Vec::new();
		for node in store.subtree_nodes(root.node_uid()).await {
			if !node.is_file() || !node.is_live() || node.trashed().is_trashed() {
				continue;
			}
			let sn = self.cache.sn_for(node).await?;
			let Some(full_path) = sn.spid.first_path() else {
				continue;
			};
			let rel_path = relative_to(&root_path, full_path);
			entries.push(DiffEntry { sn, rel_path });
		}
		Ok(entries)
	}

	/// Planned (not yet submitted) ops that would reconcile the two panes:
	/// adds copied over, updates overwritten left-to-right, moves replayed
	/// on the right.
	pub async fn generate_merge_ops(
		&self,
		diff: &DiffResult,
	) -> Result<Vec<UserOp>, OpManagerError> {
		let left_root = self
			.cache
			.tree_root(&diff.left_tree_id)
			.await
			.ok_or_else(|| CacheError::UnknownTree(diff.left_tree_id.clone()))
			.map_err(OpManagerError::Cache)?;
		let right_root = self
			.cache
			.tree_root(&diff.right_tree_id)
			.await
			.ok_or_else(|| CacheError::UnknownTree(diff.right_tree_id.clone()))
			.map_err(OpManagerError::Cache)?;
		let left_root_path = left_root.first_path().unwrap_or("/").to_string();
		let right_root_path = right_root.first_path().unwrap_or("/").to_string();

		let batch_uid = self.manager.next_uid()?;
		let mut ops = Vec::new();

		for entry in &diff.left_only {
			let dst_path = join_path(&right_root_path, &entry.rel_path);
			let dst = self
				.planned_identifier(right_root.device_uid(), &dst_path)
				.await?;
			ops.push(UserOp::new(
				self.manager.next_uid()?,
				batch_uid,
				OpType::Cp,
				entry.sn.spid.clone(),
				Some(dst),
			));
		}
		for entry in &diff.right_only {
			let dst_path = join_path(&left_root_path, &entry.rel_path);
			let dst = self
				.planned_identifier(left_root.device_uid(), &dst_path)
				.await?;
			ops.push(UserOp::new(
				self.manager.next_uid()?,
				batch_uid,
				OpType::Cp,
				entry.sn.spid.clone(),
				Some(dst),
			));
		}
		for (left_entry, right_entry) in &diff.updated {
			ops.push(UserOp::new(
				self.manager.next_uid()?,
				batch_uid,
				OpType::CpOnto,
				left_entry.sn.spid.clone(),
				Some(right_entry.sn.spid.clone()),
			));
		}
		for (left_entry, right_entry) in &diff.moved {
			// Replay the move on the right so the panes agree on layout.
			let dst_path = join_path(&right_root_path, &left_entry.rel_path);
			let dst = self
				.planned_identifier(right_root.device_uid(), &dst_path)
				.await?;
			ops.push(UserOp::new(
				self.manager.next_uid()?,
				batch_uid,
				OpType::Mv,
				right_entry.sn.spid.clone(),
				Some(dst),
			));
		}
		Ok(ops)
	}

	/// Turn a drag gesture into a batch and submit it.
	pub async fn drop_dragged_nodes(
		&self,
		src_nodes: Vec<Node>,
		dst_parent: Node,
		drag: DragOperation,
		policies: BatchPolicies,
	) -> Result<Batch, OpManagerError> {
		let batch_uid = self.manager.next_uid()?;
		let dst_device_uid = dst_parent.device_uid();
		let dst_parent_sn = self.cache.sn_for(dst_parent).await?;
		let dst_parent_path = dst_parent_sn
			.spid
			.first_path()
			.unwrap_or("/")
			.to_string();

		let mut ops = Vec::new();
		for src in src_nodes {
			self.push_transfer_ops(
				&mut ops,
				batch_uid,
				&src,
				dst_device_uid,
				&dst_parent_path,
				drag,
				policies,
			)
			.await?;
		}
		debug!("Drag batch {batch_uid}: {} ops", ops.len());
		self.policies.set(batch_uid, policies);
		self.manager.append_batch(ops).await
	}

	/// One source node (file or whole dir) into CP/MV ops mirroring its
	/// structure under `dst_parent_path`.
	#[allow(clippy::too_many_arguments)]
	async fn push_transfer_ops(
		&self,
		ops: &mut Vec<UserOp>,
		batch_uid: Uid,
		src: &Node,
		dst_device_uid: Uid,
		dst_parent_path: &str,
		drag: DragOperation,
		policies: BatchPolicies,
	) -> Result<(), OpManagerError> {
		let src_sn = self.cache.sn_for(src.clone()).await?;
		let src_path = src_sn.spid.first_path().unwrap_or("/").to_string();
		let dst_path = join_path(dst_parent_path, src.name());

		if src.is_file() {
			let (op_type, dst) = self
				.transfer_target(dst_device_uid, &dst_path, drag, policies)
				.await?;
			ops.push(UserOp::new(
				self.manager.next_uid()?,
				batch_uid,
				op_type,
				src_sn.spid,
				Some(dst),
			));
			return Ok(());
		}

		// Directory: bracket, mirror children, close bracket.
		let (start_type, finish_type) = match drag {
			DragOperation::Copy => (OpType::StartDirCp, OpType::FinishDirCp),
			DragOperation::Move => (OpType::StartDirMv, OpType::FinishDirMv),
		};
		let dst = self
			.planned_identifier(dst_device_uid, &dst_path)
			.await?;
		ops.push(UserOp::new(
			self.manager.next_uid()?,
			batch_uid,
			start_type,
			src_sn.spid.clone(),
			Some(dst.clone()),
		));

		let store = self.cache.store_for(src.device_uid()).await?;
		let subtree = store.subtree_nodes(src.uid()).await;
		let mut finish_stack: Vec<(NodeIdentifier, NodeIdentifier)> = Vec::new();
		for child in subtree.iter().filter(|n| n.uid() != src.uid()) {
			if !child.is_live() {
				continue;
			}
			let child_sn = self.cache.sn_for(child.clone()).await?;
			let Some(child_path) = child_sn.spid.first_path() else {
				continue;
			};
			let child_dst_path = join_path(&dst_path, &relative_to(&src_path, child_path));
			if child.is_dir() {
				let child_dst = self
					.planned_identifier(dst_device_uid, &child_dst_path)
					.await?;
				ops.push(UserOp::new(
					self.manager.next_uid()?,
					batch_uid,
					start_type,
					child_sn.spid.clone(),
					Some(child_dst.clone()),
				));
				finish_stack.push((child_sn.spid, child_dst));
			} else {
				let (op_type, child_dst) = self
					.transfer_target(dst_device_uid, &child_dst_path, drag, policies)
					.await?;
				ops.push(UserOp::new(
					self.manager.next_uid()?,
					batch_uid,
					op_type,
					child_sn.spid,
					Some(child_dst),
				));
			}
		}

		// Close inner brackets before the outer one; the graph enforces
		// this anyway, but emit them in their natural order.
		for (child_src, child_dst) in finish_stack.into_iter().rev() {
			ops.push(UserOp::new(
				self.manager.next_uid()?,
				batch_uid,
				finish_type,
				child_src,
				Some(child_dst),
			));
		}
		ops.push(UserOp::new(
			self.manager.next_uid()?,
			batch_uid,
			finish_type,
			src_sn.spid,
			Some(dst),
		));
		Ok(())
	}

	/// Pick plain vs ONTO and the dst identifier for one file transfer.
	/// ONTO (deliberate overwrite) is used only when the destination is
	/// occupied AND the batch policy says overwrite; any other collision is
	/// left for the executor to resolve against the policy.
	async fn transfer_target(
		&self,
		device_uid: Uid,
		dst_path: &str,
		drag: DragOperation,
		policies: BatchPolicies,
	) -> Result<(OpType, NodeIdentifier), OpManagerError> {
		use crate::domain::op::FileConflictPolicy;
		let existing = self
			.cache
			.resolve_path_to_node(device_uid, dst_path)
			.await?
			.filter(|n| n.is_live());
		let onto = existing.is_some() && policies.file == FileConflictPolicy::Overwrite;
		let op_type = match (drag, onto) {
			(DragOperation::Copy, false) => OpType::Cp,
			(DragOperation::Copy, true) => OpType::CpOnto,
			(DragOperation::Move, false) => OpType::Mv,
			(DragOperation::Move, true) => OpType::MvOnto,
		};
		let dst = match existing {
			Some(node) => self.cache.sn_for(node).await?.spid,
			None => self.planned_identifier(device_uid, dst_path).await?,
		};
		Ok((op_type, dst))
	}

	/// Identifier for a node that does not exist yet, bound through the
	/// path map so replays resolve to the same UID.
	async fn planned_identifier(
		&self,
		device_uid: Uid,
		full_path: &str,
	) -> Result<NodeIdentifier, OpManagerError> {
		let store = self.cache.store_for(device_uid).await?;
		let uid = store
			.get_or_assign_uid_for_path(full_path, self.cache.allocator())
			.await?;
		Ok(NodeIdentifier::spid(device_uid, uid, full_path))
	}

	/// Turn a delete gesture into a children-first RM batch and submit it.
	pub async fn delete_subtree(&self, roots: Vec<Node>) -> Result<Batch, OpManagerError> {
		let batch_uid = self.manager.next_uid()?;
		let mut ops = Vec::new();

		for root in roots {
			if root.is_file() {
				let sn = self.cache.sn_for(root).await?;
				ops.push(UserOp::new(
					self.manager.next_uid()?,
					batch_uid,
					OpType::Rm,
					sn.spid,
					None,
				));
				continue;
			}

			let store = self.cache.store_for(root.device_uid()).await?;
			// BFS gives parents before children; brackets open in that
			// order and close in reverse.
			let subtree = store.subtree_nodes(root.uid()).await;
			let mut finish_stack = Vec::new();
			for node in &subtree {
				if !node.is_live() {
					continue;
				}
				let sn = self.cache.sn_for(node.clone()).await?;
				if node.is_dir() {
					ops.push(UserOp::new(
						self.manager.next_uid()?,
						batch_uid,
						OpType::StartDirRm,
						sn.spid.clone(),
						None,
					));
					finish_stack.push(sn.spid);
				} else {
					ops.push(UserOp::new(
						self.manager.next_uid()?,
						batch_uid,
						OpType::Rm,
						sn.spid,
						None,
					));
				}
			}
			for spid in finish_stack.into_iter().rev() {
				ops.push(UserOp::new(
					self.manager.next_uid()?,
					batch_uid,
					OpType::FinishDirRm,
					spid,
					None,
				));
			}
		}
		self.manager.append_batch(ops).await
	}
}

fn same_content(a: &Node, b: &Node) -> bool {
	match (a.md5(), b.md5()) {
		(Some(a_md5), Some(b_md5)) => a_md5 == b_md5,
		// Without signatures fall back to size.
		_ => a.size_bytes() == b.size_bytes(),
	}
}

fn relative_to(root: &str, full_path: &str) -> String {
	full_path
		.strip_prefix(root)
		.map(|rest| rest.trim_start_matches('/').to_string())
		.unwrap_or_else(|| full_path.to_string())
}

fn join_path(base: &str, rel: &str) -> String {
	format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn relative_paths() {
		assert_eq!(relative_to("/root", "/root/a/b.txt"), "a/b.txt");
		assert_eq!(relative_to("/root/", "/root/a"), "a");
		assert_eq!(join_path("/dst", "a/b.txt"), "/dst/a/b.txt");
	}

	#[test]
	fn content_compare_prefers_md5() {
		use crate::domain::node::{FileMeta, LocalFileNode, TrashStatus};
		let file = |md5: Option<&str>, size: u64| {
			Node::LocalFile(LocalFileNode {
				device_uid: Uid(2),
				uid: Uid(10),
				parent_uid: Uid(1),
				name: "x".into(),
				full_path: "/x".into(),
				trashed: TrashStatus::NotTrashed,
				is_live: true,
				meta: FileMeta {
					size_bytes: Some(size),
					md5: md5.map(str::to_string),
					..Default::default()
				},
			})
		};
		assert!(same_content(&file(Some("aa"), 1), &file(Some("aa"), 2)));
		assert!(!same_content(&file(Some("aa"), 1), &file(Some("bb"), 1)));
		// No signatures: size decides.
		assert!(same_content(&file(None, 5), &file(None, 5)));
		assert!(!same_content(&file(None, 5), &file(None, 6)));
	}
}
