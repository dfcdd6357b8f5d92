//! Agent configuration.
//!
//! A single JSON file (`config.json` under the agent dir) loaded at startup
//! and served over the config RPC surface by dotted key. `$PROJECT_DIR` in
//! path values is interpolated from the environment, falling back to the
//! directory holding the config file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const CONFIG_FILENAME: &str = "config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("config file is malformed: {0}")]
	Malformed(#[from] serde_json::Error),

	#[error("unknown config key: {0}")]
	UnknownKey(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
	/// Where device databases live.
	pub cache_dir_path: PathBuf,
	/// Scratch space for copy staging.
	pub staging_dir_path: PathBuf,

	// UID allocation
	pub enable_uid_lastval_persistence: bool,
	pub uid_reservation_block_size: u32,

	// Cache load policy
	pub sync_from_local_disk_on_cache_load: bool,
	pub sync_from_gdrive_on_cache_load: bool,

	// Live monitoring
	pub enable_live_monitoring: bool,
	pub local_change_batch_interval_ms: u64,

	// Signature calculation
	pub signature_batch_interval_ms: u64,
	pub bytes_per_batch_high_watermark: u64,
	pub large_file_size_threshold_bytes: u64,

	// Cloud polling; zero disables.
	pub gdrive_poll_interval_sec: u64,

	// User ops
	pub cancel_all_pending_ops_on_startup: bool,
	pub update_meta_for_dst_nodes: bool,
	pub is_seconds_precision_enough: bool,
	pub max_transient_retries: u32,

	// RPC
	pub connection_timeout_sec: u64,
	pub zeroconf_discovery_timeout_sec: u64,

	/// Directory the config was loaded from; not persisted.
	#[serde(skip)]
	pub agent_dir: PathBuf,
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			cache_dir_path: PathBuf::from("$PROJECT_DIR/cache"),
			staging_dir_path: PathBuf::from("$PROJECT_DIR/staging"),
			enable_uid_lastval_persistence: true,
			uid_reservation_block_size: 1000,
			sync_from_local_disk_on_cache_load: true,
			sync_from_gdrive_on_cache_load: false,
			enable_live_monitoring: true,
			local_change_batch_interval_ms: 1000,
			signature_batch_interval_ms: 1000,
			bytes_per_batch_high_watermark: 100 * 1024 * 1024,
			large_file_size_threshold_bytes: 1024 * 1024 * 1024,
			gdrive_poll_interval_sec: 0,
			cancel_all_pending_ops_on_startup: false,
			update_meta_for_dst_nodes: true,
			is_seconds_precision_enough: true,
			max_transient_retries: 5,
			connection_timeout_sec: 60,
			zeroconf_discovery_timeout_sec: 5,
			agent_dir: PathBuf::new(),
		}
	}
}

impl AppConfig {
	/// Load the config from `agent_dir`, writing defaults on first run.
	pub fn load_or_create(agent_dir: &Path) -> Result<Self, ConfigError> {
		fs::create_dir_all(agent_dir)?;
		let path = agent_dir.join(CONFIG_FILENAME);
		let mut config: Self = if path.exists() {
			serde_json::from_str(&fs::read_to_string(&path)?)?
		} else {
			info!("No config found; writing defaults to {:?}", path);
			let config = Self::default();
			fs::write(&path, serde_json::to_string_pretty(&config)?)?;
			config
		};
		config.agent_dir = agent_dir.to_path_buf();
		config.interpolate_paths();
		Ok(config)
	}

	pub fn save(&self) -> Result<(), ConfigError> {
		let path = self.agent_dir.join(CONFIG_FILENAME);
		fs::write(&path, serde_json::to_string_pretty(self)?)?;
		Ok(())
	}

	pub fn ensure_directories(&self) -> Result<(), ConfigError> {
		fs::create_dir_all(&self.cache_dir_path)?;
		fs::create_dir_all(&self.staging_dir_path)?;
		Ok(())
	}

	/// Expand `$PROJECT_DIR` in path values: the environment variable when
	/// set, otherwise the agent dir itself.
	fn interpolate_paths(&mut self) {
		let project_dir = std::env::var("PROJECT_DIR")
			.map(PathBuf::from)
			.unwrap_or_else(|_| self.agent_dir.clone());
		let project_dir = project_dir.to_string_lossy().to_string();
		for path in [&mut self.cache_dir_path, &mut self.staging_dir_path] {
			let expanded = match path.to_str() {
				Some(raw) if raw.contains("$PROJECT_DIR") => {
					Some(PathBuf::from(raw.replace("$PROJECT_DIR", &project_dir)))
				}
				_ => None,
			};
			if let Some(expanded) = expanded {
				*path = expanded;
			}
		}
	}

	/// Read one config value by dotted key (`get_config`).
	pub fn get_key(&self, key: &str) -> Result<serde_json::Value, ConfigError> {
		let tree = serde_json::to_value(self).expect("config serializes");
		let pointer = format!("/{}", key.replace('.', "/"));
		tree.pointer(&pointer)
			.cloned()
			.ok_or_else(|| ConfigError::UnknownKey(key.to_string()))
	}

	/// Write one config value by dotted key and persist (`put_config`).
	pub fn put_key(&mut self, key: &str, value: serde_json::Value) -> Result<(), ConfigError> {
		let mut tree = serde_json::to_value(&*self).expect("config serializes");
		let pointer = format!("/{}", key.replace('.', "/"));
		match tree.pointer_mut(&pointer) {
			Some(slot) => *slot = value,
			None => return Err(ConfigError::UnknownKey(key.to_string())),
		}
		let agent_dir = self.agent_dir.clone();
		*self = serde_json::from_value(tree)?;
		self.agent_dir = agent_dir;
		self.interpolate_paths();
		self.save()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn defaults_round_trip() {
		let dir = TempDir::new().unwrap();
		let config = AppConfig::load_or_create(dir.path()).unwrap();
		assert!(config.enable_uid_lastval_persistence);
		assert_eq!(config.uid_reservation_block_size, 1000);

		// Second load reads the file written by the first.
		let again = AppConfig::load_or_create(dir.path()).unwrap();
		assert_eq!(again.uid_reservation_block_size, config.uid_reservation_block_size);
	}

	#[test]
	fn project_dir_is_interpolated() {
		let dir = TempDir::new().unwrap();
		let config = AppConfig::load_or_create(dir.path()).unwrap();
		assert!(!config.cache_dir_path.to_string_lossy().contains("$PROJECT_DIR"));
	}

	#[test]
	fn dotted_key_access() {
		let dir = TempDir::new().unwrap();
		let mut config = AppConfig::load_or_create(dir.path()).unwrap();

		let value = config.get_key("uid_reservation_block_size").unwrap();
		assert_eq!(value, serde_json::json!(1000));

		config
			.put_key("uid_reservation_block_size", serde_json::json!(50))
			.unwrap();
		assert_eq!(config.uid_reservation_block_size, 50);

		assert!(config.get_key("no.such.key").is_err());
	}
}
