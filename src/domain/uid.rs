//! Node identifiers and the persistent UID allocator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;

/// Process-wide 32-bit identifier for a node. Unique per device, never reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u32);

/// Placeholder for "no node".
pub const NULL_UID: Uid = Uid(0);

/// Parent of all device root nodes.
pub const SUPER_ROOT_UID: Uid = Uid(1);

/// First value the allocator will ever hand out. Everything below is reserved
/// for well-known nodes.
pub const FIRST_DYNAMIC_UID: u32 = 100;

/// Filename of the persisted high-water mark, relative to the agent dir.
pub const LAST_UID_FILENAME: &str = "transient.global.last_uid";

impl Uid {
	pub fn is_null(&self) -> bool {
		self.0 == 0
	}
}

impl fmt::Display for Uid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<u32> for Uid {
	fn from(value: u32) -> Self {
		Self(value)
	}
}

impl FromStr for Uid {
	type Err = std::num::ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

/// Errors from UID allocation.
#[derive(Error, Debug)]
pub enum UidError {
	/// The 32-bit space ran out. Effectively unreachable in practice, but the
	/// allocator refuses to wrap rather than reissue.
	#[error("UID space exhausted")]
	Exhausted,

	#[error("failed to persist UID high-water mark: {0}")]
	Io(#[from] std::io::Error),

	#[error("high-water mark file is malformed: {0}")]
	Malformed(String),
}

struct AllocatorState {
	/// Next value to hand out.
	next: u32,
	/// Largest value that has been reserved on disk. In-memory allocation
	/// never crosses this without first persisting a new block.
	high_water: u32,
}

/// Monotonic, single-writer UID source.
///
/// Reserves blocks of `block_size` values at a time by writing the new
/// high-water mark to disk before any value in the block is issued, so a
/// crash can skip numbers but never reissue one.
pub struct UidAllocator {
	state: Mutex<AllocatorState>,
	persist_path: Option<PathBuf>,
	block_size: u32,
}

impl UidAllocator {
	/// Open the allocator, reading the persisted high-water mark from
	/// `agent_dir` if present. With `persist` false (tests, throwaway
	/// sessions) nothing is ever written and restarts may reissue.
	pub fn load(agent_dir: &Path, block_size: u32, persist: bool) -> Result<Self, UidError> {
		let path = agent_dir.join(LAST_UID_FILENAME);
		let high_water = if persist && path.exists() {
			let raw = fs::read_to_string(&path)?;
			raw.trim()
				.parse::<u32>()
				.map_err(|_| UidError::Malformed(raw.trim().to_string()))?
		} else {
			FIRST_DYNAMIC_UID
		};

		Ok(Self {
			state: Mutex::new(AllocatorState {
				next: high_water.max(FIRST_DYNAMIC_UID),
				high_water,
			}),
			persist_path: persist.then_some(path),
			block_size: block_size.max(1),
		})
	}

	/// Issue the next UID, reserving a new block on disk first if this value
	/// would cross the persisted high-water mark.
	pub fn next_uid(&self) -> Result<Uid, UidError> {
		let mut state = self.state.lock().expect("uid allocator poisoned");
		let value = state.next;
		if value == u32::MAX {
			return Err(UidError::Exhausted);
		}
		self.reserve_through(&mut state, value)?;
		state.next = value + 1;
		Ok(Uid(value))
	}

	/// Bump the allocator past `uid`. Called while hydrating caches so that
	/// UIDs read back from disk are never reissued.
	pub fn ensure_next_uid_greater_than(&self, uid: Uid) -> Result<(), UidError> {
		let mut state = self.state.lock().expect("uid allocator poisoned");
		if uid.0 >= state.next {
			if uid.0 == u32::MAX {
				return Err(UidError::Exhausted);
			}
			self.reserve_through(&mut state, uid.0)?;
			state.next = uid.0 + 1;
		}
		Ok(())
	}

	/// Largest value reserved on disk. Stored UIDs above this indicate a
	/// corrupt cache.
	pub fn high_water_mark(&self) -> Uid {
		let state = self.state.lock().expect("uid allocator poisoned");
		Uid(state.high_water)
	}

	fn reserve_through(&self, state: &mut AllocatorState, value: u32) -> Result<(), UidError> {
		if value < state.high_water {
			return Ok(());
		}
		let new_mark = value.saturating_add(self.block_size);
		if let Some(path) = &self.persist_path {
			fs::write(path, format!("{new_mark}\n"))?;
		}
		state.high_water = new_mark;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn uids_are_monotonic() {
		let dir = TempDir::new().unwrap();
		let alloc = UidAllocator::load(dir.path(), 10, true).unwrap();
		let a = alloc.next_uid().unwrap();
		let b = alloc.next_uid().unwrap();
		assert!(b > a);
	}

	#[test]
	fn restart_never_reissues() {
		let dir = TempDir::new().unwrap();
		let last = {
			let alloc = UidAllocator::load(dir.path(), 10, true).unwrap();
			let mut last = NULL_UID;
			for _ in 0..25 {
				last = alloc.next_uid().unwrap();
			}
			last
		};

		let alloc = UidAllocator::load(dir.path(), 10, true).unwrap();
		let first_after_restart = alloc.next_uid().unwrap();
		assert!(first_after_restart > last);
	}

	#[test]
	fn ensure_greater_than_skips_forward() {
		let dir = TempDir::new().unwrap();
		let alloc = UidAllocator::load(dir.path(), 10, true).unwrap();
		alloc.ensure_next_uid_greater_than(Uid(5000)).unwrap();
		assert!(alloc.next_uid().unwrap() > Uid(5000));
	}

	#[test]
	fn high_water_mark_bounds_issued_uids() {
		let dir = TempDir::new().unwrap();
		let alloc = UidAllocator::load(dir.path(), 100, true).unwrap();
		let issued = alloc.next_uid().unwrap();
		assert!(issued <= alloc.high_water_mark());
	}
}
