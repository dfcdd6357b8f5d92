//! Path-to-UID map. A path keeps its UID for the life of the device cache,
//! even across node removal and recreation.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "path_uids")]
pub struct Model {
	#[sea_orm(primary_key, auto_increment = false)]
	pub uid: i64,
	#[sea_orm(unique)]
	pub full_path: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
