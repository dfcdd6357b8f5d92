//! Cloud-drive driver interface.
//!
//! The vendor client (OAuth, REST plumbing) is a black box behind the
//! [`RemoteFs`] trait; everything above it works in terms of normalised
//! entries and tagged error values. Drivers never panic across this
//! boundary.

pub mod poller;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

pub use poller::{GDrivePoller, PollerError};

/// A vendor entry normalised into the fields the node model cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
	pub goog_id: String,
	pub name: String,
	/// Zero or more parents; empty means the entry sits in the trash.
	pub parent_goog_ids: Vec<String>,
	pub is_folder: bool,
	pub explicitly_trashed: bool,
	pub size_bytes: Option<u64>,
	pub md5: Option<String>,
	pub version: Option<i64>,
	pub mime_type: Option<String>,
	pub drive_id: Option<String>,
	pub create_ts: Option<i64>,
	pub modify_ts: Option<i64>,
}

/// One record from an incremental change page.
#[derive(Debug, Clone)]
pub enum RemoteChange {
	Upsert(RemoteEntry),
	Remove { goog_id: String },
}

/// A page of incremental changes plus the cursor to persist once applied.
#[derive(Debug, Clone)]
pub struct ChangePage {
	pub changes: Vec<RemoteChange>,
	pub next_cursor: String,
	pub has_more: bool,
}

/// Tagged errors a driver may return. The executor classifies on these.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
	/// 429: back off and retry.
	#[error("rate limited")]
	RateLimited,

	/// 5xx: transient server failure.
	#[error("server error: {0}")]
	Server(String),

	#[error("network error: {0}")]
	Network(String),

	#[error("remote node not found: {0}")]
	NotFound(String),

	#[error("permission denied: {0}")]
	PermissionDenied(String),

	#[error("insufficient storage quota")]
	InsufficientSpace,

	#[error("protocol error: {0}")]
	Protocol(String),
}

impl RemoteError {
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::RateLimited | Self::Server(_) | Self::Network(_))
	}
}

/// Black-box driver for one cloud-drive account.
#[async_trait]
pub trait RemoteFs: Send + Sync {
	/// Stable identity of the account, used to key the device registration.
	async fn account_id(&self) -> Result<Uuid, RemoteError>;

	async fn root_goog_id(&self) -> Result<String, RemoteError>;

	/// One page of the full listing. `None` page token starts from the
	/// beginning; a `None` next token ends the listing.
	async fn list_page(
		&self,
		page_token: Option<String>,
	) -> Result<(Vec<RemoteEntry>, Option<String>), RemoteError>;

	/// Cursor positioned at "now", for a device that just finished a full
	/// listing.
	async fn start_cursor(&self) -> Result<String, RemoteError>;

	async fn changes_page(&self, cursor: &str) -> Result<ChangePage, RemoteError>;

	async fn create_folder(
		&self,
		name: &str,
		parent_goog_id: &str,
	) -> Result<RemoteEntry, RemoteError>;

	async fn upload_file(
		&self,
		local_path: &Path,
		name: &str,
		parent_goog_id: &str,
	) -> Result<RemoteEntry, RemoteError>;

	async fn copy_file(
		&self,
		goog_id: &str,
		new_name: &str,
		dst_parent_goog_id: &str,
	) -> Result<RemoteEntry, RemoteError>;

	async fn move_node(
		&self,
		goog_id: &str,
		new_name: &str,
		old_parent_goog_id: &str,
		new_parent_goog_id: &str,
	) -> Result<RemoteEntry, RemoteError>;

	async fn delete_node(&self, goog_id: &str) -> Result<(), RemoteError>;

	async fn download_file(&self, goog_id: &str, dst_path: &Path) -> Result<(), RemoteError>;
}
