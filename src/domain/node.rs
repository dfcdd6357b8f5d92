//! The unified node model.
//!
//! Nodes are tagged variants rather than a class hierarchy: the executor and
//! diff engine dispatch on `op_type` x node variant, and every cross-node
//! relation is a UID lookup so the cache can be snapshotted and reloaded
//! without pointer fix-up.
//!
//! Two nodes are equal iff their `(device_uid, node_uid)` match, regardless
//! of metadata.

use crate::domain::identifier::NodeIdentifier;
use crate::domain::uid::Uid;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// Trash state of a node. Cloud trash is explicit; children of a trashed
/// folder are implicitly trashed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrashStatus {
	#[default]
	NotTrashed,
	ImplicitlyTrashed,
	ExplicitlyTrashed,
}

impl TrashStatus {
	pub fn is_trashed(&self) -> bool {
		!matches!(self, Self::NotTrashed)
	}
}

/// Content metadata for file nodes. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
	pub size_bytes: Option<u64>,
	pub sync_ts: Option<i64>,
	pub modify_ts: Option<i64>,
	pub change_ts: Option<i64>,
	pub create_ts: Option<i64>,
	pub md5: Option<String>,
	pub sha256: Option<String>,
}

impl FileMeta {
	pub fn from_fs_metadata(meta: &std::fs::Metadata) -> Self {
		Self {
			size_bytes: Some(meta.len()),
			sync_ts: Some(now_millis()),
			modify_ts: meta.modified().ok().and_then(system_time_to_millis),
			change_ts: meta.modified().ok().and_then(system_time_to_millis),
			create_ts: meta.created().ok().and_then(system_time_to_millis),
			md5: None,
			sha256: None,
		}
	}

	/// True if size and timestamps match at the requested precision. When the
	/// filesystem only stores seconds, sub-second intent degrades silently.
	pub fn matches(&self, other: &FileMeta, seconds_precision_enough: bool) -> bool {
		self.size_bytes == other.size_bytes
			&& ts_eq(self.modify_ts, other.modify_ts, seconds_precision_enough)
			&& ts_eq(self.change_ts, other.change_ts, seconds_precision_enough)
	}

	/// Whether a cached signature computed against `cached` is still valid
	/// for this meta: `(size, modify_ts)` unchanged.
	pub fn signature_is_current(&self, cached: &FileMeta) -> bool {
		cached.md5.is_some()
			&& self.size_bytes == cached.size_bytes
			&& self.modify_ts == cached.modify_ts
	}

	pub fn has_signature(&self) -> bool {
		self.md5.is_some() || self.sha256.is_some()
	}
}

fn ts_eq(a: Option<i64>, b: Option<i64>, seconds_only: bool) -> bool {
	match (a, b) {
		(Some(a), Some(b)) if seconds_only => a / 1000 == b / 1000,
		(a, b) => a == b,
	}
}

/// Aggregate counts and sizes for a directory subtree, maintained lazily.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirMeta {
	pub file_count: u64,
	pub dir_count: u64,
	pub trashed_file_count: u64,
	pub trashed_dir_count: u64,
	pub size_bytes: u64,
	pub trashed_bytes: u64,
}

impl DirMeta {
	pub fn add(&mut self, other: &DirMeta) {
		self.file_count += other.file_count;
		self.dir_count += other.dir_count;
		self.trashed_file_count += other.trashed_file_count;
		self.trashed_dir_count += other.trashed_dir_count;
		self.size_bytes += other.size_bytes;
		self.trashed_bytes += other.trashed_bytes;
	}

	pub fn add_file(&mut self, size_bytes: u64, trashed: bool) {
		if trashed {
			self.trashed_file_count += 1;
			self.trashed_bytes += size_bytes;
		} else {
			self.file_count += 1;
			self.size_bytes += size_bytes;
		}
	}

	pub fn add_dir(&mut self, trashed: bool) {
		if trashed {
			self.trashed_dir_count += 1;
		} else {
			self.dir_count += 1;
		}
	}
}

/// Fields shared by cloud node variants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GDriveIdentity {
	/// Vendor-assigned opaque id; absent on planning nodes not yet created.
	pub goog_id: Option<String>,
	pub owner_uid: Option<Uid>,
	pub drive_id: Option<String>,
	/// Zero or more parents; unparented means trash.
	pub parent_uids: Vec<Uid>,
}

/// Category assigned to nodes in a diff result tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCategory {
	Added,
	Deleted,
	Updated,
	Moved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDirNode {
	pub device_uid: Uid,
	pub uid: Uid,
	pub parent_uid: Uid,
	pub name: String,
	pub full_path: String,
	pub trashed: TrashStatus,
	pub is_live: bool,
	pub all_children_fetched: bool,
	pub dir_meta: Option<DirMeta>,
	pub modify_ts: Option<i64>,
	pub change_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalFileNode {
	pub device_uid: Uid,
	pub uid: Uid,
	pub parent_uid: Uid,
	pub name: String,
	pub full_path: String,
	pub trashed: TrashStatus,
	pub is_live: bool,
	pub meta: FileMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GDriveFolderNode {
	pub device_uid: Uid,
	pub uid: Uid,
	pub name: String,
	pub identity: GDriveIdentity,
	pub trashed: TrashStatus,
	pub is_live: bool,
	pub all_children_fetched: bool,
	pub dir_meta: Option<DirMeta>,
	pub create_ts: Option<i64>,
	pub modify_ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GDriveFileNode {
	pub device_uid: Uid,
	pub uid: Uid,
	pub name: String,
	pub identity: GDriveIdentity,
	pub trashed: TrashStatus,
	pub is_live: bool,
	pub meta: FileMeta,
	pub version: Option<i64>,
	pub mime_type_uid: Option<Uid>,
}

/// Synthetic grouping node (e.g. the super-root of a merged view).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerNode {
	pub device_uid: Uid,
	pub uid: Uid,
	pub name: String,
	pub dir_meta: Option<DirMeta>,
}

/// Synthetic per-category parent in a diff result tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryNode {
	pub device_uid: Uid,
	pub uid: Uid,
	pub category: ChangeCategory,
	pub dir_meta: Option<DirMeta>,
}

/// Synthetic node standing in for a whole tree type in mixed views.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootTypeNode {
	pub device_uid: Uid,
	pub uid: Uid,
	pub name: String,
}

/// Placeholder for a directory that does not exist yet (e.g. the target of a
/// drag into a path with missing ancestors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonexistentDirNode {
	pub device_uid: Uid,
	pub uid: Uid,
	pub parent_uid: Uid,
	pub name: String,
	pub full_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum Node {
	LocalDir(LocalDirNode),
	LocalFile(LocalFileNode),
	GDriveFolder(GDriveFolderNode),
	GDriveFile(GDriveFileNode),
	Container(ContainerNode),
	Category(CategoryNode),
	RootType(RootTypeNode),
	NonexistentDir(NonexistentDirNode),
}

impl Node {
	pub fn device_uid(&self) -> Uid {
		match self {
			Self::LocalDir(n) => n.device_uid,
			Self::LocalFile(n) => n.device_uid,
			Self::GDriveFolder(n) => n.device_uid,
			Self::GDriveFile(n) => n.device_uid,
			Self::Container(n) => n.device_uid,
			Self::Category(n) => n.device_uid,
			Self::RootType(n) => n.device_uid,
			Self::NonexistentDir(n) => n.device_uid,
		}
	}

	pub fn uid(&self) -> Uid {
		match self {
			Self::LocalDir(n) => n.uid,
			Self::LocalFile(n) => n.uid,
			Self::GDriveFolder(n) => n.uid,
			Self::GDriveFile(n) => n.uid,
			Self::Container(n) => n.uid,
			Self::Category(n) => n.uid,
			Self::RootType(n) => n.uid,
			Self::NonexistentDir(n) => n.uid,
		}
	}

	pub fn name(&self) -> &str {
		match self {
			Self::LocalDir(n) => &n.name,
			Self::LocalFile(n) => &n.name,
			Self::GDriveFolder(n) => &n.name,
			Self::GDriveFile(n) => &n.name,
			Self::Container(n) => &n.name,
			Self::Category(n) => match n.category {
				ChangeCategory::Added => "Added",
				ChangeCategory::Deleted => "Deleted",
				ChangeCategory::Updated => "Updated",
				ChangeCategory::Moved => "Moved",
			},
			Self::RootType(n) => &n.name,
			Self::NonexistentDir(n) => &n.name,
		}
	}

	pub fn is_dir(&self) -> bool {
		matches!(
			self,
			Self::LocalDir(_)
				| Self::GDriveFolder(_)
				| Self::Container(_)
				| Self::Category(_)
				| Self::RootType(_)
				| Self::NonexistentDir(_)
		)
	}

	pub fn is_file(&self) -> bool {
		matches!(self, Self::LocalFile(_) | Self::GDriveFile(_))
	}

	pub fn is_local(&self) -> bool {
		matches!(self, Self::LocalDir(_) | Self::LocalFile(_))
	}

	pub fn is_gdrive(&self) -> bool {
		matches!(self, Self::GDriveFolder(_) | Self::GDriveFile(_))
	}

	/// Real nodes observed on disk or in the cloud are live; planning nodes
	/// inserted for pending ops are not.
	pub fn is_live(&self) -> bool {
		match self {
			Self::LocalDir(n) => n.is_live,
			Self::LocalFile(n) => n.is_live,
			Self::GDriveFolder(n) => n.is_live,
			Self::GDriveFile(n) => n.is_live,
			// Synthetic nodes only ever describe planned or derived state.
			Self::Container(_) | Self::Category(_) | Self::RootType(_) => false,
			Self::NonexistentDir(_) => false,
		}
	}

	pub fn set_is_live(&mut self, live: bool) {
		match self {
			Self::LocalDir(n) => n.is_live = live,
			Self::LocalFile(n) => n.is_live = live,
			Self::GDriveFolder(n) => n.is_live = live,
			Self::GDriveFile(n) => n.is_live = live,
			_ => {}
		}
	}

	pub fn trashed(&self) -> TrashStatus {
		match self {
			Self::LocalDir(n) => n.trashed,
			Self::LocalFile(n) => n.trashed,
			Self::GDriveFolder(n) => n.trashed,
			Self::GDriveFile(n) => n.trashed,
			_ => TrashStatus::NotTrashed,
		}
	}

	pub fn size_bytes(&self) -> Option<u64> {
		match self {
			Self::LocalFile(n) => n.meta.size_bytes,
			Self::GDriveFile(n) => n.meta.size_bytes,
			Self::LocalDir(n) => n.dir_meta.map(|m| m.size_bytes),
			Self::GDriveFolder(n) => n.dir_meta.map(|m| m.size_bytes),
			Self::Container(n) => n.dir_meta.map(|m| m.size_bytes),
			Self::Category(n) => n.dir_meta.map(|m| m.size_bytes),
			_ => None,
		}
	}

	pub fn file_meta(&self) -> Option<&FileMeta> {
		match self {
			Self::LocalFile(n) => Some(&n.meta),
			Self::GDriveFile(n) => Some(&n.meta),
			_ => None,
		}
	}

	pub fn md5(&self) -> Option<&str> {
		self.file_meta().and_then(|m| m.md5.as_deref())
	}

	/// All parents. Local nodes have exactly one; cloud nodes zero or more
	/// (zero means trash).
	pub fn parent_uids(&self) -> Vec<Uid> {
		match self {
			Self::LocalDir(n) => vec![n.parent_uid],
			Self::LocalFile(n) => vec![n.parent_uid],
			Self::GDriveFolder(n) => n.identity.parent_uids.clone(),
			Self::GDriveFile(n) => n.identity.parent_uids.clone(),
			Self::NonexistentDir(n) => vec![n.parent_uid],
			_ => Vec::new(),
		}
	}

	pub fn goog_id(&self) -> Option<&str> {
		match self {
			Self::GDriveFolder(n) => n.identity.goog_id.as_deref(),
			Self::GDriveFile(n) => n.identity.goog_id.as_deref(),
			_ => None,
		}
	}

	/// Path known without consulting the tree. Local variants store their
	/// full path; cloud paths are resolved by the store.
	pub fn cached_path(&self) -> Option<&str> {
		match self {
			Self::LocalDir(n) => Some(&n.full_path),
			Self::LocalFile(n) => Some(&n.full_path),
			Self::NonexistentDir(n) => Some(&n.full_path),
			_ => None,
		}
	}

	/// Identifier with whatever path information the node itself carries.
	/// Cloud identifiers come back with an empty path list; the store fills
	/// paths in when serving clients.
	pub fn node_identifier(&self) -> NodeIdentifier {
		match self.cached_path() {
			Some(path) => NodeIdentifier::spid(self.device_uid(), self.uid(), path),
			None => NodeIdentifier::mpid(self.device_uid(), self.uid(), Vec::new()),
		}
	}

	/// The scanner's "modified" test: size, mtime or ctime differs.
	pub fn meta_matches(&self, other: &Node, seconds_precision_enough: bool) -> bool {
		match (self.file_meta(), other.file_meta()) {
			(Some(a), Some(b)) => a.matches(b, seconds_precision_enough),
			_ => true,
		}
	}
}

// Identity equality: `(device_uid, node_uid)` only.
impl PartialEq for Node {
	fn eq(&self, other: &Self) -> bool {
		self.device_uid() == other.device_uid() && self.uid() == other.uid()
	}
}

impl Eq for Node {}

impl Hash for Node {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.device_uid().hash(state);
		self.uid().hash(state);
	}
}

pub fn system_time_to_millis(time: SystemTime) -> Option<i64> {
	time.duration_since(UNIX_EPOCH)
		.ok()
		.map(|d| d.as_millis() as i64)
}

pub fn now_millis() -> i64 {
	system_time_to_millis(SystemTime::now()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn file(device_uid: u32, uid: u32, name: &str) -> Node {
		Node::LocalFile(LocalFileNode {
			device_uid: Uid(device_uid),
			uid: Uid(uid),
			parent_uid: Uid(1),
			name: name.to_string(),
			full_path: format!("/tmp/{name}"),
			trashed: TrashStatus::NotTrashed,
			is_live: true,
			meta: FileMeta::default(),
		})
	}

	#[test]
	fn equality_is_by_identity() {
		let a = file(2, 10, "a.txt");
		let b = file(2, 10, "renamed.txt");
		let c = file(3, 10, "a.txt");
		assert_eq!(a, b);
		assert_ne!(a, c);
	}

	#[test]
	fn meta_match_at_seconds_precision() {
		let mut a = FileMeta {
			size_bytes: Some(100),
			modify_ts: Some(1_700_000_000_123),
			change_ts: Some(1_700_000_000_123),
			..Default::default()
		};
		let b = FileMeta {
			size_bytes: Some(100),
			modify_ts: Some(1_700_000_000_999),
			change_ts: Some(1_700_000_000_999),
			..Default::default()
		};
		assert!(a.matches(&b, true));
		assert!(!a.matches(&b, false));

		a.size_bytes = Some(101);
		assert!(!a.matches(&b, true));
	}

	#[test]
	fn signature_currency_follows_size_and_mtime() {
		let cached = FileMeta {
			size_bytes: Some(5),
			modify_ts: Some(1000),
			md5: Some("abc".into()),
			..Default::default()
		};
		let same = FileMeta {
			size_bytes: Some(5),
			modify_ts: Some(1000),
			..Default::default()
		};
		let touched = FileMeta {
			size_bytes: Some(5),
			modify_ts: Some(2000),
			..Default::default()
		};
		assert!(same.signature_is_current(&cached));
		assert!(!touched.signature_is_current(&cached));
	}

	#[test]
	fn dir_meta_sums() {
		let mut total = DirMeta::default();
		total.add_file(100, false);
		total.add_file(50, true);
		total.add_dir(false);
		let mut child = DirMeta::default();
		child.add_file(25, false);
		total.add(&child);

		assert_eq!(total.file_count, 2);
		assert_eq!(total.size_bytes, 125);
		assert_eq!(total.trashed_bytes, 50);
		assert_eq!(total.dir_count, 1);
	}
}
