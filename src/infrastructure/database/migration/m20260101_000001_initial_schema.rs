//! Initial schema for a device database.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(Nodes::Table)
					.if_not_exists()
					.col(ColumnDef::new(Nodes::Uid).big_integer().not_null().primary_key())
					.col(ColumnDef::new(Nodes::Kind).integer().not_null())
					.col(ColumnDef::new(Nodes::Name).string().not_null())
					.col(ColumnDef::new(Nodes::ParentUid).big_integer())
					.col(ColumnDef::new(Nodes::FullPath).string())
					.col(ColumnDef::new(Nodes::SizeBytes).big_integer())
					.col(ColumnDef::new(Nodes::SyncTs).big_integer())
					.col(ColumnDef::new(Nodes::ModifyTs).big_integer())
					.col(ColumnDef::new(Nodes::ChangeTs).big_integer())
					.col(ColumnDef::new(Nodes::CreateTs).big_integer())
					.col(ColumnDef::new(Nodes::Md5).string())
					.col(ColumnDef::new(Nodes::Sha256).string())
					.col(ColumnDef::new(Nodes::GoogId).string())
					.col(ColumnDef::new(Nodes::OwnerUid).big_integer())
					.col(ColumnDef::new(Nodes::DriveId).string())
					.col(ColumnDef::new(Nodes::Version).big_integer())
					.col(ColumnDef::new(Nodes::MimeTypeUid).big_integer())
					.col(ColumnDef::new(Nodes::Trashed).integer().not_null().default(0))
					.col(ColumnDef::new(Nodes::IsLive).boolean().not_null().default(true))
					.col(
						ColumnDef::new(Nodes::AllChildrenFetched)
							.boolean()
							.not_null()
							.default(false),
					)
					.to_owned(),
			)
			.await?;

		// Child lookup by (parent, name)
		manager
			.create_index(
				Index::create()
					.name("idx_nodes_parent_name")
					.table(Nodes::Table)
					.col(Nodes::ParentUid)
					.col(Nodes::Name)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_nodes_goog_id")
					.table(Nodes::Table)
					.col(Nodes::GoogId)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(NodeParents::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(NodeParents::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(NodeParents::NodeUid).big_integer().not_null())
					.col(ColumnDef::new(NodeParents::ParentUid).big_integer().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_node_parents_node")
					.table(NodeParents::Table)
					.col(NodeParents::NodeUid)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(PathUids::Table)
					.if_not_exists()
					.col(ColumnDef::new(PathUids::Uid).big_integer().not_null().primary_key())
					.col(ColumnDef::new(PathUids::FullPath).string().not_null().unique_key())
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(Ops::Table)
					.if_not_exists()
					.col(ColumnDef::new(Ops::OpUid).big_integer().not_null().primary_key())
					.col(ColumnDef::new(Ops::BatchUid).big_integer().not_null())
					.col(ColumnDef::new(Ops::OpType).integer().not_null())
					.col(ColumnDef::new(Ops::Status).integer().not_null())
					.col(ColumnDef::new(Ops::SrcJson).text().not_null())
					.col(ColumnDef::new(Ops::DstJson).text())
					.col(ColumnDef::new(Ops::CreateTs).big_integer().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_ops_batch")
					.table(Ops::Table)
					.col(Ops::BatchUid)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(ArchivedOps::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(ArchivedOps::OpUid)
							.big_integer()
							.not_null()
							.primary_key(),
					)
					.col(ColumnDef::new(ArchivedOps::BatchUid).big_integer().not_null())
					.col(ColumnDef::new(ArchivedOps::OpType).integer().not_null())
					.col(ColumnDef::new(ArchivedOps::Status).integer().not_null())
					.col(ColumnDef::new(ArchivedOps::SrcJson).text().not_null())
					.col(ColumnDef::new(ArchivedOps::DstJson).text())
					.col(ColumnDef::new(ArchivedOps::CreateTs).big_integer().not_null())
					.col(ColumnDef::new(ArchivedOps::ArchivedTs).big_integer().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(Kv::Table)
					.if_not_exists()
					.col(ColumnDef::new(Kv::Key).string().not_null().primary_key())
					.col(ColumnDef::new(Kv::Value).text().not_null())
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(Kv::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(ArchivedOps::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Ops::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(PathUids::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(NodeParents::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Nodes::Table).to_owned())
			.await
	}
}

#[derive(DeriveIden)]
enum Nodes {
	Table,
	Uid,
	Kind,
	Name,
	ParentUid,
	FullPath,
	SizeBytes,
	SyncTs,
	ModifyTs,
	ChangeTs,
	CreateTs,
	Md5,
	Sha256,
	GoogId,
	OwnerUid,
	DriveId,
	Version,
	MimeTypeUid,
	Trashed,
	IsLive,
	AllChildrenFetched,
}

#[derive(DeriveIden)]
enum NodeParents {
	Table,
	Id,
	NodeUid,
	ParentUid,
}

#[derive(DeriveIden)]
enum PathUids {
	Table,
	Uid,
	FullPath,
}

#[derive(DeriveIden)]
enum Ops {
	Table,
	OpUid,
	BatchUid,
	OpType,
	Status,
	SrcJson,
	DstJson,
	CreateTs,
}

#[derive(DeriveIden)]
enum ArchivedOps {
	Table,
	OpUid,
	BatchUid,
	OpType,
	Status,
	SrcJson,
	DstJson,
	CreateTs,
	ArchivedTs,
}

#[derive(DeriveIden)]
enum Kv {
	Table,
	Key,
	Value,
}
