//! Pending user-op rows. Every lifecycle transition is written through here
//! before the in-memory graph changes.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "ops")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub op_uid: i64,
	#[sea_orm(indexed)]
	pub batch_uid: i64,
	pub op_type: i32,
	pub status: i32,
	/// Serialized `NodeIdentifier`.
	pub src_json: String,
	pub dst_json: Option<String>,
	pub create_ts: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
