//! User operations: the pending mutations the agent executes durably.

use crate::domain::identifier::NodeIdentifier;
use crate::domain::node::now_millis;
use crate::domain::uid::Uid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of a user operation. Directory transfers are bracketed by
/// `StartDir*`/`FinishDir*` pairs so child ops order between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum OpType {
	Mkdir = 1,
	Cp = 2,
	Mv = 3,
	Rm = 4,
	/// Copy onto an existing destination (overwrite).
	CpOnto = 5,
	/// Move onto an existing destination (overwrite).
	MvOnto = 6,
	StartDirCp = 7,
	StartDirMv = 8,
	StartDirRm = 9,
	FinishDirCp = 10,
	FinishDirMv = 11,
	FinishDirRm = 12,
}

impl OpType {
	/// Whether the op carries a separate destination node. `Mkdir` does not:
	/// its src IS the planning dir being created.
	pub fn has_dst(&self) -> bool {
		!matches!(self, Self::Mkdir | Self::Rm | Self::StartDirRm | Self::FinishDirRm)
	}

	pub fn is_start_dir(&self) -> bool {
		matches!(self, Self::StartDirCp | Self::StartDirMv | Self::StartDirRm)
	}

	pub fn is_finish_dir(&self) -> bool {
		matches!(self, Self::FinishDirCp | Self::FinishDirMv | Self::FinishDirRm)
	}

	/// Ops whose side effect brings a new node into existence (and so satisfy
	/// a dependency of ops nesting under that node).
	pub fn creates_node(&self) -> bool {
		matches!(
			self,
			Self::Mkdir | Self::Cp | Self::CpOnto | Self::Mv | Self::MvOnto | Self::StartDirCp | Self::StartDirMv
		)
	}

	pub fn removes_src(&self) -> bool {
		matches!(self, Self::Rm | Self::FinishDirRm | Self::Mv | Self::MvOnto | Self::FinishDirMv)
	}

	pub fn to_i32(self) -> i32 {
		self as i32
	}

	pub fn from_i32(value: i32) -> Option<Self> {
		Some(match value {
			1 => Self::Mkdir,
			2 => Self::Cp,
			3 => Self::Mv,
			4 => Self::Rm,
			5 => Self::CpOnto,
			6 => Self::MvOnto,
			7 => Self::StartDirCp,
			8 => Self::StartDirMv,
			9 => Self::StartDirRm,
			10 => Self::FinishDirCp,
			11 => Self::FinishDirMv,
			12 => Self::FinishDirRm,
			_ => return None,
		})
	}
}

impl fmt::Display for OpType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Mkdir => "MKDIR",
			Self::Cp => "CP",
			Self::Mv => "MV",
			Self::Rm => "RM",
			Self::CpOnto => "CP_ONTO",
			Self::MvOnto => "MV_ONTO",
			Self::StartDirCp => "START_DIR_CP",
			Self::StartDirMv => "START_DIR_MV",
			Self::StartDirRm => "START_DIR_RM",
			Self::FinishDirCp => "FINISH_DIR_CP",
			Self::FinishDirMv => "FINISH_DIR_MV",
			Self::FinishDirRm => "FINISH_DIR_RM",
		};
		write!(f, "{name}")
	}
}

/// Lifecycle state of a user op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum OpStatus {
	Pending = 1,
	InProgress = 2,
	Completed = 3,
	Failed = 4,
	Cancelled = 5,
	/// An upstream op in the same dependency chain failed.
	BlockedByFailure = 6,
}

impl OpStatus {
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			Self::Completed | Self::Failed | Self::Cancelled | Self::BlockedByFailure
		)
	}

	pub fn to_i32(self) -> i32 {
		self as i32
	}

	pub fn from_i32(value: i32) -> Option<Self> {
		Some(match value {
			1 => Self::Pending,
			2 => Self::InProgress,
			3 => Self::Completed,
			4 => Self::Failed,
			5 => Self::Cancelled,
			6 => Self::BlockedByFailure,
			_ => return None,
		})
	}
}

impl fmt::Display for OpStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::Pending => "Pending",
			Self::InProgress => "InProgress",
			Self::Completed => "Completed",
			Self::Failed => "Failed",
			Self::Cancelled => "Cancelled",
			Self::BlockedByFailure => "BlockedByFailure",
		};
		write!(f, "{name}")
	}
}

/// A single pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserOp {
	pub op_uid: Uid,
	pub batch_uid: Uid,
	pub op_type: OpType,
	pub src: NodeIdentifier,
	pub dst: Option<NodeIdentifier>,
	pub create_ts: i64,
	pub status: OpStatus,
}

impl UserOp {
	pub fn new(op_uid: Uid, batch_uid: Uid, op_type: OpType, src: NodeIdentifier, dst: Option<NodeIdentifier>) -> Self {
		debug_assert_eq!(op_type.has_dst(), dst.is_some());
		Self {
			op_uid,
			batch_uid,
			op_type,
			src,
			dst,
			create_ts: now_millis(),
			status: OpStatus::Pending,
		}
	}

	/// The node the op's side effect lands on: dst when present, else src
	/// (which for `Mkdir` is the dir being created).
	pub fn primary_target(&self) -> &NodeIdentifier {
		self.dst.as_ref().unwrap_or(&self.src)
	}

	/// The node this op brings into existence, if any.
	pub fn created_node_uid(&self) -> Option<Uid> {
		if !self.op_type.creates_node() {
			return None;
		}
		Some(self.primary_target().node_uid())
	}

	pub fn tag(&self) -> String {
		match &self.dst {
			Some(dst) => format!("{}:{} {} -> {}", self.op_uid, self.op_type, self.src.guid(), dst.guid()),
			None => format!("{}:{} {}", self.op_uid, self.op_type, self.src.guid()),
		}
	}
}

/// Atomic set of user ops sharing a `batch_uid`: the unit of submission and
/// failure reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
	pub batch_uid: Uid,
	pub ops: Vec<UserOp>,
}

/// What to do when a file op's destination already exists with different
/// content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileConflictPolicy {
	#[default]
	Fail,
	Skip,
	Overwrite,
	Rename,
}

/// What to do when a directory op's destination already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirConflictPolicy {
	#[default]
	Fail,
	Skip,
	Overwrite,
	Rename,
}

/// Client's answer to a `BatchFailed` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlingStrategy {
	Retry,
	Skip,
	Abort,
}

/// The gesture a drag-drop encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DragOperation {
	Copy,
	Move,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn op_type_i32_round_trip() {
		for raw in 1..=12 {
			let op_type = OpType::from_i32(raw).unwrap();
			assert_eq!(op_type.to_i32(), raw);
		}
		assert!(OpType::from_i32(0).is_none());
		assert!(OpType::from_i32(13).is_none());
	}

	#[test]
	fn rm_family_has_no_dst() {
		assert!(!OpType::Rm.has_dst());
		assert!(!OpType::StartDirRm.has_dst());
		assert!(!OpType::FinishDirRm.has_dst());
		assert!(!OpType::Mkdir.has_dst());
		assert!(OpType::Cp.has_dst());
	}

	#[test]
	fn terminal_statuses() {
		assert!(OpStatus::Completed.is_terminal());
		assert!(OpStatus::BlockedByFailure.is_terminal());
		assert!(!OpStatus::Pending.is_terminal());
		assert!(!OpStatus::InProgress.is_terminal());
	}
}
