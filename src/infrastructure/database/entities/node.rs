//! Node row: one per cached node.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub uid: i64,
	/// 1=LocalDir 2=LocalFile 3=GDriveFolder 4=GDriveFile
	pub kind: i32,
	pub name: String,
	/// Single parent for local nodes; cloud parents live in `node_parents`.
	pub parent_uid: Option<i64>,
	pub full_path: Option<String>,
	pub size_bytes: Option<i64>,
	pub sync_ts: Option<i64>,
	pub modify_ts: Option<i64>,
	pub change_ts: Option<i64>,
	pub create_ts: Option<i64>,
	pub md5: Option<String>,
	pub sha256: Option<String>,
	#[sea_orm(indexed)]
	pub goog_id: Option<String>,
	pub owner_uid: Option<i64>,
	pub drive_id: Option<String>,
	pub version: Option<i64>,
	pub mime_type_uid: Option<i64>,
	pub trashed: i32,
	pub is_live: bool,
	pub all_children_fetched: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
