//! Database infrastructure using SeaORM.
//!
//! Each device gets its own SQLite file, `nodes_<device_uid>.db`, holding the
//! node cache, the path-to-UID map, the pending and archived op tables and a
//! small key-value table (change cursor and friends).

use crate::domain::uid::Uid;
use sea_orm::{ConnectOptions, Database as SeaDatabase, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub mod entities;
pub mod migration;

/// Well-known keys of the `kv` table.
pub mod kv_keys {
	/// Cloud change-page cursor persisted between polls.
	pub const CHANGE_CURSOR: &str = "gdrive.change_cursor";
}

pub fn device_db_path(cache_dir: &Path, device_uid: Uid) -> PathBuf {
	cache_dir.join(format!("nodes_{device_uid}.db"))
}

/// Connection to one device database.
pub struct Database {
	conn: DatabaseConnection,
}

impl Database {
	/// Open the device database, creating file and schema when absent.
	pub async fn open(path: &Path) -> Result<Self, DbErr> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| DbErr::Custom(format!("Failed to create directory: {e}")))?;
		}

		let db_url = format!("sqlite://{}?mode=rwc", path.display());

		let mut opt = ConnectOptions::new(db_url);
		opt.max_connections(8)
			.min_connections(1)
			.connect_timeout(Duration::from_secs(8))
			.idle_timeout(Duration::from_secs(8))
			.sqlx_logging(false);

		let conn = SeaDatabase::connect(opt).await?;
		migration::Migrator::up(&conn, None).await?;

		info!("Opened device database at {:?}", path);

		Ok(Self { conn })
	}

	pub fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}
}
