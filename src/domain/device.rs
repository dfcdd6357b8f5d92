//! Device identity and the device registry.
//!
//! A device is the root of one tree: a local filesystem subtree or a
//! cloud-drive account. Devices are identified two ways: a small `device_uid`
//! assigned the first time the device is seen, and a stable `long_device_id`
//! UUID that survives cache deletion (for local devices it is persisted in a
//! marker file under the device root itself).

use crate::domain::uid::{Uid, UidAllocator, UidError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Marker filename written under a local device root.
pub const DEVICE_UUID_FILENAME: &str = "device_uuid.txt";

/// Registry filename under the agent dir.
const REGISTRY_FILENAME: &str = "devices.json";

/// The class of tree a device roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeType {
	Local,
	GDrive,
	/// Synthetic roots (category trees, merge previews) that span devices.
	Mixed,
}

/// Identity for one root tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
	pub device_uid: Uid,
	pub long_device_id: Uuid,
	pub tree_type: TreeType,
	pub friendly_name: String,
	/// Filesystem root for local devices; `None` for cloud devices.
	pub root_path: Option<PathBuf>,
}

#[derive(Error, Debug)]
pub enum DeviceError {
	#[error("device {0} is not registered")]
	NotFound(Uid),

	#[error("device root does not exist: {0}")]
	RootMissing(PathBuf),

	#[error("uid allocation failed: {0}")]
	Uid(#[from] UidError),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("registry file is malformed: {0}")]
	Malformed(#[from] serde_json::Error),
}

/// Known devices, persisted as `devices.json` under the agent dir.
pub struct DeviceRegistry {
	registry_path: PathBuf,
	allocator: Arc<UidAllocator>,
	devices: RwLock<Vec<Device>>,
}

impl DeviceRegistry {
	/// Load the registry, bumping the UID allocator past every stored
	/// `device_uid` so restarts never reissue one.
	pub fn load(agent_dir: &Path, allocator: Arc<UidAllocator>) -> Result<Self, DeviceError> {
		let registry_path = agent_dir.join(REGISTRY_FILENAME);
		let devices: Vec<Device> = if registry_path.exists() {
			serde_json::from_str(&fs::read_to_string(&registry_path)?)?
		} else {
			Vec::new()
		};

		for device in &devices {
			allocator.ensure_next_uid_greater_than(device.device_uid)?;
		}
		debug!("Loaded {} devices from registry", devices.len());

		Ok(Self {
			registry_path,
			allocator,
			devices: RwLock::new(devices),
		})
	}

	pub fn list(&self) -> Vec<Device> {
		self.devices.read().expect("registry poisoned").clone()
	}

	pub fn get(&self, device_uid: Uid) -> Result<Device, DeviceError> {
		self.devices
			.read()
			.expect("registry poisoned")
			.iter()
			.find(|d| d.device_uid == device_uid)
			.cloned()
			.ok_or(DeviceError::NotFound(device_uid))
	}

	/// Register a local filesystem root, or return the existing registration.
	///
	/// The stable identity lives in a `device_uuid.txt` marker inside the root
	/// itself, so re-adding the same directory (even after the agent's caches
	/// are wiped) resolves to the same device.
	pub fn get_or_register_local(
		&self,
		root_path: &Path,
		friendly_name: &str,
	) -> Result<Device, DeviceError> {
		if !root_path.is_dir() {
			return Err(DeviceError::RootMissing(root_path.to_path_buf()));
		}

		let long_device_id = read_or_create_device_uuid(root_path)?;

		{
			let devices = self.devices.read().expect("registry poisoned");
			if let Some(existing) = devices.iter().find(|d| d.long_device_id == long_device_id) {
				return Ok(existing.clone());
			}
		}

		let device = Device {
			device_uid: self.allocator.next_uid()?,
			long_device_id,
			tree_type: TreeType::Local,
			friendly_name: friendly_name.to_string(),
			root_path: Some(root_path.to_path_buf()),
		};
		info!(
			"Registered local device {} ({}) at {:?}",
			device.device_uid, device.friendly_name, root_path
		);
		self.insert(device.clone())?;
		Ok(device)
	}

	/// Register a cloud-drive account, keyed by the stable account UUID the
	/// driver reports.
	pub fn get_or_register_gdrive(
		&self,
		account_id: Uuid,
		friendly_name: &str,
	) -> Result<Device, DeviceError> {
		{
			let devices = self.devices.read().expect("registry poisoned");
			if let Some(existing) = devices.iter().find(|d| d.long_device_id == account_id) {
				return Ok(existing.clone());
			}
		}

		let device = Device {
			device_uid: self.allocator.next_uid()?,
			long_device_id: account_id,
			tree_type: TreeType::GDrive,
			friendly_name: friendly_name.to_string(),
			root_path: None,
		};
		info!(
			"Registered cloud device {} ({})",
			device.device_uid, device.friendly_name
		);
		self.insert(device.clone())?;
		Ok(device)
	}

	fn insert(&self, device: Device) -> Result<(), DeviceError> {
		let mut devices = self.devices.write().expect("registry poisoned");
		devices.push(device);
		let json = serde_json::to_string_pretty(&*devices)?;
		fs::write(&self.registry_path, json)?;
		Ok(())
	}
}

fn read_or_create_device_uuid(root_path: &Path) -> Result<Uuid, DeviceError> {
	let marker = root_path.join(DEVICE_UUID_FILENAME);
	if marker.exists() {
		let raw = fs::read_to_string(&marker)?;
		if let Ok(id) = raw.trim().parse::<Uuid>() {
			return Ok(id);
		}
		debug!("Marker file at {:?} unreadable; rewriting", marker);
	}
	let id = Uuid::new_v4();
	fs::write(&marker, format!("{id}\n"))?;
	Ok(id)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::uid::UidAllocator;
	use tempfile::TempDir;

	fn registry(agent_dir: &Path) -> DeviceRegistry {
		let allocator = Arc::new(UidAllocator::load(agent_dir, 100, true).unwrap());
		DeviceRegistry::load(agent_dir, allocator).unwrap()
	}

	#[test]
	fn local_device_identity_is_stable() {
		let agent_dir = TempDir::new().unwrap();
		let root = TempDir::new().unwrap();

		let first = registry(agent_dir.path())
			.get_or_register_local(root.path(), "pane-left")
			.unwrap();
		// Fresh registry, same root: marker file resolves to same identity.
		let second = registry(agent_dir.path())
			.get_or_register_local(root.path(), "pane-left")
			.unwrap();
		assert_eq!(first.long_device_id, second.long_device_id);
	}

	#[test]
	fn same_root_is_not_registered_twice() {
		let agent_dir = TempDir::new().unwrap();
		let root = TempDir::new().unwrap();
		let reg = registry(agent_dir.path());

		let a = reg.get_or_register_local(root.path(), "a").unwrap();
		let b = reg.get_or_register_local(root.path(), "b").unwrap();
		assert_eq!(a.device_uid, b.device_uid);
		assert_eq!(reg.list().len(), 1);
	}

	#[test]
	fn missing_root_is_an_error() {
		let agent_dir = TempDir::new().unwrap();
		let reg = registry(agent_dir.path());
		let err = reg
			.get_or_register_local(Path::new("/definitely/not/here"), "x")
			.unwrap_err();
		assert!(matches!(err, DeviceError::RootMissing(_)));
	}
}
