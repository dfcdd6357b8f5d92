//! The pending-op dependency graph.
//!
//! A directed acyclic multigraph over user ops. Edges are "must precede"
//! relations derived from three rules:
//!
//! 1. an op depends on every earlier pending op whose src or dst aliases one
//!    of its targets -- by `(device_uid, node_uid)`, or by path-ancestor
//!    relation (which is how a planned `Mkdir` ancestor gates a move into
//!    it);
//! 2. within a batch, `StartDir*` precedes every op nesting under its
//!    directory, and `FinishDir*` succeeds them, regardless of emission
//!    order;
//! 3. ops with no relation run independently.
//!
//! The ready set delivers ops FIFO within a batch and first-come-first-served
//! across batches. All of this is in-memory; durability belongs to the op
//! manager, which persists every transition before touching the graph.

use crate::domain::identifier::NodeIdentifier;
use crate::domain::op::{OpStatus, UserOp};
use crate::domain::uid::Uid;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum OpGraphError {
	/// The batch's internal dependencies contain a cycle; the batch is
	/// rejected wholesale.
	#[error("dependency cycle detected in batch {0}")]
	CycleDetected(Uid),

	#[error("unknown op: {0}")]
	UnknownOp(Uid),

	#[error("op {0} is not in progress")]
	NotInProgress(Uid),
}

#[derive(Default)]
struct GraphState {
	/// Every non-terminal op.
	ops: HashMap<Uid, UserOp>,
	/// op -> ops that must wait for it.
	dependents: HashMap<Uid, HashSet<Uid>>,
	/// op -> number of unfinished prerequisites.
	in_degree: HashMap<Uid, usize>,
	/// (device_uid, node_uid) -> pending ops touching that node, oldest
	/// first. The tail is what `get_last_pending_op_for_node` reports.
	node_queues: HashMap<(Uid, Uid), VecDeque<Uid>>,
	/// Ready ops ordered by (batch_uid, op_uid): FIFO within batch, FCFS
	/// across batches (batch uids are monotonic).
	ready: BTreeSet<(Uid, Uid)>,
	in_progress: HashSet<Uid>,
	/// Largest op uid ever inserted; replays at or below it are ignored.
	max_added_op_uid: Uid,
}

impl GraphState {
	fn remove_everywhere(&mut self, op_uid: Uid) -> Option<UserOp> {
		let op = self.ops.remove(&op_uid)?;
		self.in_degree.remove(&op_uid);
		self.in_progress.remove(&op_uid);
		self.ready.remove(&(op.batch_uid, op_uid));
		for target in op_targets(&op) {
			let key = (target.device_uid(), target.node_uid());
			if let Some(queue) = self.node_queues.get_mut(&key) {
				queue.retain(|&uid| uid != op_uid);
				if queue.is_empty() {
					self.node_queues.remove(&key);
				}
			}
		}
		Some(op)
	}
}

/// Shared op dependency DAG. A single mutex guards the state; critical
/// sections are short and never span I/O.
pub struct OpGraph {
	state: Mutex<GraphState>,
	ready_notify: Notify,
	shutdown: AtomicBool,
}

impl Default for OpGraph {
	fn default() -> Self {
		Self {
			state: Mutex::new(GraphState::default()),
			ready_notify: Notify::new(),
			shutdown: AtomicBool::new(false),
		}
	}
}

impl OpGraph {
	/// Check a batch for dependency cycles without touching the graph.
	/// The op manager runs this before persisting anything.
	pub fn validate_batch(&self, batch: &[UserOp]) -> Result<(), OpGraphError> {
		let state = self.state.lock().expect("op graph poisoned");
		let fresh: Vec<&UserOp> = batch
			.iter()
			.filter(|op| !state.ops.contains_key(&op.op_uid))
			.collect();
		drop(state);
		if fresh.is_empty() {
			return Ok(());
		}
		let batch_uid = fresh[0].batch_uid;
		let internal_edges = compute_internal_edges(&fresh);
		if has_cycle(&fresh, &internal_edges) {
			return Err(OpGraphError::CycleDetected(batch_uid));
		}
		Ok(())
	}

	/// Insert a batch. Validates acyclicity of the batch's internal edges
	/// first; on rejection the graph is untouched. Ops whose `op_uid` is
	/// already present (crash replay) are skipped.
	pub fn insert_batch(&self, batch: &[UserOp]) -> Result<(), OpGraphError> {
		let mut state = self.state.lock().expect("op graph poisoned");

		let fresh: Vec<&UserOp> = batch
			.iter()
			.filter(|op| !state.ops.contains_key(&op.op_uid))
			.collect();
		if fresh.is_empty() {
			return Ok(());
		}
		let batch_uid = fresh[0].batch_uid;

		let internal_edges = compute_internal_edges(&fresh);
		if has_cycle(&fresh, &internal_edges) {
			return Err(OpGraphError::CycleDetected(batch_uid));
		}

		// Cross-batch edges: every existing pending op with an aliasing
		// target precedes the new op. These always point old -> new, so
		// they cannot create a cycle.
		let mut all_edges: Vec<(Uid, Uid)> = internal_edges.into_iter().collect();
		for op in &fresh {
			for existing in state.ops.values() {
				if ops_alias(existing, op) {
					all_edges.push((existing.op_uid, op.op_uid));
				}
			}
		}

		for op in &fresh {
			trace!("Graph insert: {}", op.tag());
			state.ops.insert(op.op_uid, (*op).clone());
			state.in_degree.insert(op.op_uid, 0);
			state.max_added_op_uid = state.max_added_op_uid.max(op.op_uid);
			for target in op_targets(op) {
				state
					.node_queues
					.entry((target.device_uid(), target.node_uid()))
					.or_default()
					.push_back(op.op_uid);
			}
		}
		for (before, after) in all_edges {
			if state.dependents.entry(before).or_default().insert(after) {
				*state.in_degree.entry(after).or_default() += 1;
			}
		}

		let mut became_ready = false;
		for op in &fresh {
			if state.in_degree[&op.op_uid] == 0 {
				state.ready.insert((op.batch_uid, op.op_uid));
				became_ready = true;
			}
		}
		debug!(
			"Inserted batch {} ({} ops, {} immediately ready)",
			batch_uid,
			fresh.len(),
			state.ready.len()
		);
		drop(state);
		if became_ready {
			self.ready_notify.notify_waiters();
		}
		Ok(())
	}

	/// Wait for, claim and return the next ready op whose primary target
	/// lives on `device_uid`. Returns `None` after shutdown.
	pub async fn next_ready_for_device(&self, device_uid: Uid) -> Option<UserOp> {
		loop {
			// Register for wakeups before checking, so a notify between the
			// check and the await is not lost.
			let notified = self.ready_notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			{
				let mut state = self.state.lock().expect("op graph poisoned");
				if self.shutdown.load(Ordering::SeqCst) {
					return None;
				}
				let claimed = state
					.ready
					.iter()
					.copied()
					.find(|&(_, op_uid)| {
						state
							.ops
							.get(&op_uid)
							.map(|op| op.primary_target().device_uid() == device_uid)
							.unwrap_or(false)
					});
				if let Some(key) = claimed {
					state.ready.remove(&key);
					state.in_progress.insert(key.1);
					let op = state.ops.get_mut(&key.1).expect("ready op must exist");
					op.status = OpStatus::InProgress;
					return Some(op.clone());
				}
			}
			notified.await;
		}
	}

	/// Non-blocking variant of [`Self::next_ready_for_device`].
	pub fn try_next_ready_for_device(&self, device_uid: Uid) -> Option<UserOp> {
		let mut state = self.state.lock().expect("op graph poisoned");
		let claimed = state.ready.iter().copied().find(|&(_, op_uid)| {
			state
				.ops
				.get(&op_uid)
				.map(|op| op.primary_target().device_uid() == device_uid)
				.unwrap_or(false)
		})?;
		state.ready.remove(&claimed);
		state.in_progress.insert(claimed.1);
		let op = state.ops.get_mut(&claimed.1).expect("ready op must exist");
		op.status = OpStatus::InProgress;
		Some(op.clone())
	}

	/// Complete an in-progress op: drop its outbound edges and promote
	/// newly unblocked dependents into the ready set.
	pub fn mark_completed(&self, op_uid: Uid) -> Result<UserOp, OpGraphError> {
		let mut state = self.state.lock().expect("op graph poisoned");
		if !state.ops.contains_key(&op_uid) {
			return Err(OpGraphError::UnknownOp(op_uid));
		}
		if !state.in_progress.contains(&op_uid) {
			return Err(OpGraphError::NotInProgress(op_uid));
		}

		let mut op = state.remove_everywhere(op_uid).expect("checked above");
		op.status = OpStatus::Completed;

		let mut became_ready = false;
		if let Some(dependents) = state.dependents.remove(&op_uid) {
			for dependent in dependents {
				// A dependent may already be gone (cancelled batch).
				let Some(degree) = state.in_degree.get_mut(&dependent) else {
					continue;
				};
				*degree = degree.saturating_sub(1);
				if *degree == 0 {
					if let Some(batch_uid) = state.ops.get(&dependent).map(|dep_op| dep_op.batch_uid) {
						state.ready.insert((batch_uid, dependent));
						became_ready = true;
					}
				}
			}
		}
		drop(state);
		if became_ready {
			self.ready_notify.notify_waiters();
		}
		Ok(op)
	}

	/// Fail an in-progress op and poison every transitive dependent with
	/// `BlockedByFailure`. Returns the failed op and the poisoned set, all
	/// removed from the graph.
	pub fn mark_failed(&self, op_uid: Uid) -> Result<(UserOp, Vec<UserOp>), OpGraphError> {
		let mut state = self.state.lock().expect("op graph poisoned");
		if !state.ops.contains_key(&op_uid) {
			return Err(OpGraphError::UnknownOp(op_uid));
		}

		let mut failed = state.remove_everywhere(op_uid).expect("checked above");
		failed.status = OpStatus::Failed;

		// Transitive closure over dependents.
		let mut poisoned = Vec::new();
		let mut queue: VecDeque<Uid> = state
			.dependents
			.remove(&op_uid)
			.map(|set| set.into_iter().collect())
			.unwrap_or_default();
		while let Some(next_uid) = queue.pop_front() {
			let Some(mut op) = state.remove_everywhere(next_uid) else {
				continue;
			};
			op.status = OpStatus::BlockedByFailure;
			if let Some(more) = state.dependents.remove(&next_uid) {
				queue.extend(more);
			}
			poisoned.push(op);
		}
		Ok((failed, poisoned))
	}

	/// Cancel every not-yet-started op of a batch. In-progress ops are left
	/// alone. Returns the cancelled ops, removed from the graph.
	pub fn cancel_batch(&self, batch_uid: Uid) -> Vec<UserOp> {
		let mut state = self.state.lock().expect("op graph poisoned");
		let victims: Vec<Uid> = state
			.ops
			.values()
			.filter(|op| op.batch_uid == batch_uid && !state.in_progress.contains(&op.op_uid))
			.map(|op| op.op_uid)
			.collect();
		let mut cancelled = Vec::with_capacity(victims.len());
		for op_uid in victims {
			if let Some(mut op) = state.remove_everywhere(op_uid) {
				// Dependents of a cancelled op are unblocked, not poisoned;
				// they were cancelled too if they share the batch.
				if let Some(dependents) = state.dependents.remove(&op_uid) {
					for dependent in dependents {
						if let Some(degree) = state.in_degree.get_mut(&dependent) {
							*degree = degree.saturating_sub(1);
							if *degree == 0 {
								if let Some(batch_uid) = state.ops.get(&dependent).map(|dep_op| dep_op.batch_uid) {
									state.ready.insert((batch_uid, dependent));
								}
							}
						}
					}
				}
				op.status = OpStatus::Cancelled;
				cancelled.push(op);
			}
		}
		drop(state);
		self.ready_notify.notify_waiters();
		cancelled
	}

	/// The most recently queued pending op touching a node, if any. This is
	/// what drives the op badge a client renders on the node's row.
	pub fn get_last_pending_op_for_node(&self, device_uid: Uid, node_uid: Uid) -> Option<UserOp> {
		let state = self.state.lock().expect("op graph poisoned");
		let queue = state.node_queues.get(&(device_uid, node_uid))?;
		queue.back().and_then(|uid| state.ops.get(uid)).cloned()
	}

	pub fn pending_count(&self) -> usize {
		self.state.lock().expect("op graph poisoned").ops.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pending_count() == 0
	}

	/// Unblock any waiting consumers permanently.
	pub fn shutdown(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
		self.ready_notify.notify_waiters();
	}
}

/// Intra-batch edges, as (prerequisite, dependent) pairs.
fn compute_internal_edges(fresh: &[&UserOp]) -> HashSet<(Uid, Uid)> {
	let mut internal_edges: HashSet<(Uid, Uid)> = HashSet::new();
	for (i, op) in fresh.iter().enumerate() {
		// Rule 1 within the batch: earlier op with an aliasing target.
		// Pairs governed by a bracket relation are excluded here; rule 2
		// orders those regardless of emission order.
		for earlier in &fresh[..i] {
			if bracket_governed(earlier, op) {
				continue;
			}
			if ops_alias(earlier, op) {
				internal_edges.insert((earlier.op_uid, op.op_uid));
			}
		}
		// Rule 2, order-independent: StartDir gates everything nesting
		// under its dir; FinishDir waits for everything nesting under it;
		// a start precedes its matching finish.
		for other in fresh.iter() {
			if other.op_uid == op.op_uid {
				continue;
			}
			if op.op_type.is_start_dir() {
				if nests_under(other, op) {
					internal_edges.insert((op.op_uid, other.op_uid));
				}
				if other.op_type.is_finish_dir() && same_bracket_dir(op, other) {
					internal_edges.insert((op.op_uid, other.op_uid));
				}
			}
			if op.op_type.is_finish_dir() && nests_under(other, op) {
				internal_edges.insert((other.op_uid, op.op_uid));
			}
		}
	}
	internal_edges
}

/// All node identifiers an op touches.
fn op_targets(op: &UserOp) -> Vec<&NodeIdentifier> {
	let mut targets = vec![&op.src];
	if let Some(dst) = &op.dst {
		targets.push(dst);
	}
	targets
}

/// Rule 1 aliasing: same `(device, node)` target, or related paths on the
/// same device (equal, ancestor or descendant).
fn ops_alias(a: &UserOp, b: &UserOp) -> bool {
	for ta in op_targets(a) {
		for tb in op_targets(b) {
			if ta.device_uid() == tb.device_uid() && ta.node_uid() == tb.node_uid() {
				return true;
			}
			if ta.device_uid() == tb.device_uid() {
				for pa in ta.path_list() {
					for pb in tb.path_list() {
						if paths_alias(pa, pb) {
							return true;
						}
					}
				}
			}
		}
	}
	false
}

/// Whether the pair is ordered by the bracket rule rather than rule 1.
fn bracket_governed(a: &UserOp, b: &UserOp) -> bool {
	let a_bracket = a.op_type.is_start_dir() || a.op_type.is_finish_dir();
	let b_bracket = b.op_type.is_start_dir() || b.op_type.is_finish_dir();
	(a_bracket && nests_under(b, a))
		|| (b_bracket && nests_under(a, b))
		|| (a_bracket && b_bracket && same_bracket_dir(a, b))
}

fn same_bracket_dir(a: &UserOp, b: &UserOp) -> bool {
	a.src.first_path() == b.src.first_path()
}

/// Whether `inner`'s targets nest strictly under `bracket`'s directory (its
/// src path).
fn nests_under(inner: &UserOp, bracket: &UserOp) -> bool {
	let Some(dir_path) = bracket.src.first_path() else {
		return false;
	};
	let prefix = format!("{}/", dir_path.trim_end_matches('/'));
	op_targets(inner)
		.iter()
		.flat_map(|t| t.path_list())
		.any(|p| p.starts_with(&prefix))
}

fn paths_alias(a: &str, b: &str) -> bool {
	let a = a.trim_end_matches('/');
	let b = b.trim_end_matches('/');
	if a == b {
		return true;
	}
	a.strip_prefix(b).map(|rest| rest.starts_with('/')).unwrap_or(false)
		|| b.strip_prefix(a).map(|rest| rest.starts_with('/')).unwrap_or(false)
}

/// Kahn's algorithm over the batch-internal edges.
fn has_cycle(ops: &[&UserOp], edges: &HashSet<(Uid, Uid)>) -> bool {
	let mut in_degree: HashMap<Uid, usize> = ops.iter().map(|op| (op.op_uid, 0)).collect();
	let mut adjacency: HashMap<Uid, Vec<Uid>> = HashMap::new();
	for &(before, after) in edges {
		adjacency.entry(before).or_default().push(after);
		*in_degree.entry(after).or_default() += 1;
	}
	let mut queue: VecDeque<Uid> = in_degree
		.iter()
		.filter(|(_, &d)| d == 0)
		.map(|(&uid, _)| uid)
		.collect();
	let mut visited = 0usize;
	while let Some(uid) = queue.pop_front() {
		visited += 1;
		for &next in adjacency.get(&uid).into_iter().flatten() {
			let degree = in_degree.get_mut(&next).expect("edge endpoints are batch ops");
			*degree -= 1;
			if *degree == 0 {
				queue.push_back(next);
			}
		}
	}
	visited != ops.len()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::op::OpType;

	fn spid(device: u32, node: u32, path: &str) -> NodeIdentifier {
		NodeIdentifier::spid(Uid(device), Uid(node), path)
	}

	fn op(op_uid: u32, batch_uid: u32, op_type: OpType, src: NodeIdentifier, dst: Option<NodeIdentifier>) -> UserOp {
		UserOp::new(Uid(op_uid), Uid(batch_uid), op_type, src, dst)
	}

	fn drain_ready(graph: &OpGraph, device: u32) -> Vec<Uid> {
		let mut order = Vec::new();
		while let Some(ready) = graph.try_next_ready_for_device(Uid(device)) {
			order.push(ready.op_uid);
			graph.mark_completed(ready.op_uid).unwrap();
		}
		order
	}

	#[test]
	fn mkdir_gates_copy_into_new_dir() {
		let graph = OpGraph::default();
		let mkdir = op(10, 1, OpType::Mkdir, spid(2, 50, "/a/new"), None);
		let cp = op(
			11,
			1,
			OpType::Cp,
			spid(2, 7, "/src/x"),
			Some(spid(2, 51, "/a/new/x")),
		);
		graph.insert_batch(&[mkdir, cp]).unwrap();

		// Only the mkdir is ready; the copy waits on its planned ancestor.
		let first = graph.try_next_ready_for_device(Uid(2)).unwrap();
		assert_eq!(first.op_uid, Uid(10));
		assert!(graph.try_next_ready_for_device(Uid(2)).is_none());

		graph.mark_completed(Uid(10)).unwrap();
		let second = graph.try_next_ready_for_device(Uid(2)).unwrap();
		assert_eq!(second.op_uid, Uid(11));
	}

	#[test]
	fn unrelated_ops_run_independently() {
		let graph = OpGraph::default();
		graph
			.insert_batch(&[
				op(10, 1, OpType::Rm, spid(2, 50, "/a/x"), None),
				op(11, 1, OpType::Rm, spid(2, 51, "/b/y"), None),
			])
			.unwrap();
		let a = graph.try_next_ready_for_device(Uid(2)).unwrap();
		let b = graph.try_next_ready_for_device(Uid(2)).unwrap();
		assert_ne!(a.op_uid, b.op_uid);
	}

	#[test]
	fn dir_rm_brackets_regardless_of_emission_order() {
		let graph = OpGraph::default();
		// Finish emitted first, children in the middle, start last: rule 2
		// still sequences start -> children -> finish.
		graph
			.insert_batch(&[
				op(12, 1, OpType::FinishDirRm, spid(2, 40, "/d"), None),
				op(11, 1, OpType::Rm, spid(2, 41, "/d/child.txt"), None),
				op(10, 1, OpType::StartDirRm, spid(2, 40, "/d"), None),
			])
			.unwrap();

		let order = drain_ready(&graph, 2);
		assert_eq!(order, vec![Uid(10), Uid(11), Uid(12)]);
	}

	#[test]
	fn ready_set_is_fifo_within_batch_fcfs_across() {
		let graph = OpGraph::default();
		graph
			.insert_batch(&[
				op(20, 2, OpType::Rm, spid(2, 60, "/p/one"), None),
				op(21, 2, OpType::Rm, spid(2, 61, "/p/two"), None),
			])
			.unwrap();
		graph
			.insert_batch(&[op(30, 3, OpType::Rm, spid(2, 62, "/q/three"), None)])
			.unwrap();

		let order = drain_ready(&graph, 2);
		assert_eq!(order, vec![Uid(20), Uid(21), Uid(30)]);
	}

	#[test]
	fn failure_poisons_descendants() {
		let graph = OpGraph::default();
		let mkdir = op(10, 1, OpType::Mkdir, spid(2, 50, "/a/new"), None);
		let cp = op(
			11,
			1,
			OpType::Cp,
			spid(2, 7, "/src/x"),
			Some(spid(2, 51, "/a/new/x")),
		);
		let mv = op(
			12,
			1,
			OpType::Mv,
			spid(2, 51, "/a/new/x"),
			Some(spid(2, 52, "/a/new/y")),
		);
		graph.insert_batch(&[mkdir, cp, mv]).unwrap();

		let running = graph.try_next_ready_for_device(Uid(2)).unwrap();
		assert_eq!(running.op_uid, Uid(10));
		let (failed, poisoned) = graph.mark_failed(Uid(10)).unwrap();
		assert_eq!(failed.status, OpStatus::Failed);
		let mut poisoned_uids: Vec<Uid> = poisoned.iter().map(|op| op.op_uid).collect();
		poisoned_uids.sort();
		assert_eq!(poisoned_uids, vec![Uid(11), Uid(12)]);
		assert!(poisoned.iter().all(|op| op.status == OpStatus::BlockedByFailure));
		assert!(graph.is_empty());
	}

	#[test]
	fn replay_is_idempotent() {
		let graph = OpGraph::default();
		let rm = op(10, 1, OpType::Rm, spid(2, 50, "/a/x"), None);
		graph.insert_batch(std::slice::from_ref(&rm)).unwrap();
		graph.insert_batch(std::slice::from_ref(&rm)).unwrap();
		assert_eq!(graph.pending_count(), 1);
	}

	#[test]
	fn nested_brackets_order_inside_out() {
		let graph = OpGraph::default();
		graph
			.insert_batch(&[
				op(10, 1, OpType::FinishDirRm, spid(2, 40, "/d"), None),
				op(11, 1, OpType::StartDirRm, spid(2, 41, "/d/e"), None),
				op(12, 1, OpType::FinishDirRm, spid(2, 41, "/d/e"), None),
				op(13, 1, OpType::StartDirRm, spid(2, 40, "/d"), None),
				op(14, 1, OpType::Rm, spid(2, 42, "/d/e/f.txt"), None),
			])
			.unwrap();
		let order = drain_ready(&graph, 2);
		assert_eq!(order, vec![Uid(13), Uid(11), Uid(14), Uid(12), Uid(10)]);
	}

	#[test]
	fn crossing_dir_moves_are_a_cycle() {
		let graph = OpGraph::default();
		// Each dir moved into the other: the brackets demand both orders.
		let err = graph
			.insert_batch(&[
				op(10, 1, OpType::StartDirMv, spid(2, 40, "/a"), Some(spid(2, 45, "/b/c"))),
				op(11, 1, OpType::StartDirMv, spid(2, 41, "/b"), Some(spid(2, 46, "/a/c"))),
			])
			.map(|_| ());
		assert!(matches!(err, Err(OpGraphError::CycleDetected(_))));
	}

	#[test]
	fn last_pending_op_for_node_is_the_queue_tail() {
		let graph = OpGraph::default();
		let cp = op(
			10,
			1,
			OpType::Cp,
			spid(2, 7, "/src/x"),
			Some(spid(2, 51, "/dst/x")),
		);
		let rm = op(11, 1, OpType::Rm, spid(2, 51, "/dst/x"), None);
		graph.insert_batch(&[cp, rm]).unwrap();

		let last = graph.get_last_pending_op_for_node(Uid(2), Uid(51)).unwrap();
		assert_eq!(last.op_uid, Uid(11));
		assert!(graph.get_last_pending_op_for_node(Uid(2), Uid(99)).is_none());
	}

	#[test]
	fn cancel_batch_leaves_in_progress_alone() {
		let graph = OpGraph::default();
		graph
			.insert_batch(&[
				op(10, 1, OpType::Rm, spid(2, 50, "/a/x"), None),
				op(11, 1, OpType::Rm, spid(2, 51, "/b/y"), None),
			])
			.unwrap();
		let running = graph.try_next_ready_for_device(Uid(2)).unwrap();

		let cancelled = graph.cancel_batch(Uid(1));
		assert_eq!(cancelled.len(), 1);
		assert_ne!(cancelled[0].op_uid, running.op_uid);
		assert_eq!(graph.pending_count(), 1);
	}

	#[tokio::test]
	async fn waiting_consumer_wakes_on_insert() {
		use std::sync::Arc;
		let graph = Arc::new(OpGraph::default());
		let waiter = {
			let graph = graph.clone();
			tokio::spawn(async move { graph.next_ready_for_device(Uid(2)).await })
		};
		tokio::task::yield_now().await;
		graph
			.insert_batch(&[op(10, 1, OpType::Rm, spid(2, 50, "/a/x"), None)])
			.unwrap();
		let got = waiter.await.unwrap().unwrap();
		assert_eq!(got.op_uid, Uid(10));
	}

	#[tokio::test]
	async fn shutdown_releases_waiters() {
		use std::sync::Arc;
		let graph = Arc::new(OpGraph::default());
		let waiter = {
			let graph = graph.clone();
			tokio::spawn(async move { graph.next_ready_for_device(Uid(2)).await })
		};
		tokio::task::yield_now().await;
		graph.shutdown();
		assert!(waiter.await.unwrap().is_none());
	}
}
