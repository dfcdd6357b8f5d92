//! Cross-device transfer: local file copied up to a cloud drive through a
//! scripted driver.

use async_trait::async_trait;
use duplex_core::config::AppConfig;
use duplex_core::domain::identifier::NodeIdentifier;
use duplex_core::domain::node::{GDriveFolderNode, GDriveIdentity, Node, TrashStatus};
use duplex_core::domain::op::DragOperation;
use duplex_core::domain::uid::{Uid, SUPER_ROOT_UID};
use duplex_core::infrastructure::events::Event;
use duplex_core::ops::executor::BatchPolicies;
use duplex_core::store::gdrive::{ChangePage, RemoteEntry, RemoteError, RemoteFs};
use duplex_core::Agent;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid as UuidValue;

#[derive(Default)]
struct ScriptedDrive {
	uploads: Mutex<Vec<(String, String)>>,
	upload_counter: AtomicU32,
}

#[async_trait]
impl RemoteFs for ScriptedDrive {
	async fn account_id(&self) -> Result<UuidValue, RemoteError> {
		Ok(UuidValue::from_u128(7))
	}

	async fn root_goog_id(&self) -> Result<String, RemoteError> {
		Ok("root".into())
	}

	async fn list_page(
		&self,
		_page_token: Option<String>,
	) -> Result<(Vec<RemoteEntry>, Option<String>), RemoteError> {
		Ok((Vec::new(), None))
	}

	async fn start_cursor(&self) -> Result<String, RemoteError> {
		Ok("cursor-0".into())
	}

	async fn changes_page(&self, _cursor: &str) -> Result<ChangePage, RemoteError> {
		Ok(ChangePage {
			changes: Vec::new(),
			next_cursor: "cursor-0".into(),
			has_more: false,
		})
	}

	async fn create_folder(&self, name: &str, _parent: &str) -> Result<RemoteEntry, RemoteError> {
		Ok(entry(&format!("folder-{name}"), name, true))
	}

	async fn upload_file(
		&self,
		local_path: &Path,
		name: &str,
		parent_goog_id: &str,
	) -> Result<RemoteEntry, RemoteError> {
		let n = self.upload_counter.fetch_add(1, Ordering::SeqCst) + 1;
		self.uploads
			.lock()
			.unwrap()
			.push((local_path.to_string_lossy().to_string(), parent_goog_id.to_string()));
		let mut e = entry(&format!("up-{n}"), name, false);
		e.size_bytes = std::fs::metadata(local_path).ok().map(|m| m.len());
		e.md5 = Some("d0d0caca".into());
		Ok(e)
	}

	async fn copy_file(&self, _: &str, name: &str, _: &str) -> Result<RemoteEntry, RemoteError> {
		Ok(entry("copy-1", name, false))
	}

	async fn move_node(
		&self,
		goog_id: &str,
		name: &str,
		_: &str,
		_: &str,
	) -> Result<RemoteEntry, RemoteError> {
		Ok(entry(goog_id, name, false))
	}

	async fn delete_node(&self, _: &str) -> Result<(), RemoteError> {
		Ok(())
	}

	async fn download_file(&self, _: &str, dst: &Path) -> Result<(), RemoteError> {
		std::fs::write(dst, b"downloaded").map_err(|e| RemoteError::Protocol(e.to_string()))
	}
}

fn entry(goog_id: &str, name: &str, is_folder: bool) -> RemoteEntry {
	RemoteEntry {
		goog_id: goog_id.into(),
		name: name.into(),
		parent_goog_ids: vec!["root".into()],
		is_folder,
		explicitly_trashed: false,
		size_bytes: None,
		md5: None,
		version: Some(1),
		mime_type: None,
		drive_id: None,
		create_ts: None,
		modify_ts: None,
	}
}

#[tokio::test]
async fn cross_device_copy_uploads_and_caches() {
	let agent_dir = TempDir::new().unwrap();
	let root = TempDir::new().unwrap();
	let config = AppConfig {
		cache_dir_path: agent_dir.path().join("cache"),
		staging_dir_path: agent_dir.path().join("staging"),
		enable_live_monitoring: false,
		..Default::default()
	};
	std::fs::write(
		agent_dir.path().join("config.json"),
		serde_json::to_string_pretty(&config).unwrap(),
	)
	.unwrap();
	std::fs::write(root.path().join("a.bin"), b"twelve bytes").unwrap();

	let agent = Agent::init(agent_dir.path()).await.unwrap();
	let local = agent.attach_local_device(root.path(), "left").await.unwrap();
	let drive = Arc::new(ScriptedDrive::default());
	let cloud = agent
		.attach_gdrive_device(drive.clone(), "right")
		.await
		.unwrap();
	agent.recover_pending_ops().await.unwrap();

	// Scan the local pane.
	let root_str = root.path().to_string_lossy().to_string();
	let root_uid = agent
		.service
		.get_uid_for_local_path(local.device_uid, &root_str)
		.await
		.unwrap();
	agent
		.service
		.request_display_tree("tree-left", NodeIdentifier::spid(local.device_uid, root_uid, root_str))
		.await
		.unwrap();

	// Seed the cloud root folder the way a hydration would.
	let cloud_store = agent.context.cache.store_for(cloud.device_uid).await.unwrap();
	let cloud_root_uid = agent.service.get_next_uid().unwrap();
	cloud_store
		.upsert(Node::GDriveFolder(GDriveFolderNode {
			device_uid: cloud.device_uid,
			uid: cloud_root_uid,
			name: "My Drive".into(),
			identity: GDriveIdentity {
				goog_id: Some("root".into()),
				owner_uid: None,
				drive_id: None,
				parent_uids: vec![SUPER_ROOT_UID],
			},
			trashed: TrashStatus::NotTrashed,
			is_live: true,
			all_children_fetched: true,
			dir_meta: None,
			create_ts: None,
			modify_ts: None,
		}))
		.await
		.unwrap();

	let src_uid = agent
		.service
		.get_uid_for_local_path(local.device_uid, &root.path().join("a.bin").to_string_lossy())
		.await
		.unwrap();

	let mut events_rx = agent.context.events.subscribe();
	agent
		.service
		.drop_dragged_nodes(
			vec![format!("{}:{}", local.device_uid, src_uid)],
			&format!("{}:{}", cloud.device_uid, cloud_root_uid),
			DragOperation::Copy,
			BatchPolicies::default(),
		)
		.await
		.unwrap();

	for _ in 0..200 {
		if agent.context.ops.pending_count() == 0 {
			break;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	assert_eq!(agent.context.ops.pending_count(), 0);
	tokio::time::sleep(Duration::from_millis(50)).await;

	// Exactly one upload, into the cloud root.
	let uploads = drive.uploads.lock().unwrap().clone();
	assert_eq!(uploads.len(), 1);
	assert_eq!(uploads[0].1, "root");

	// The source is untouched; the new cloud node is cached with the
	// driver-reported signature.
	assert!(root.path().join("a.bin").exists());
	let uploaded = cloud_store.get_by_goog_id("up-1").await.unwrap();
	assert!(uploaded.is_live());
	assert_eq!(uploaded.md5(), Some("d0d0caca"));
	assert_eq!(uploaded.parent_uids(), vec![cloud_root_uid]);

	// The transient staging copy surfaced as an upsert/remove pair.
	let mut staging_upsert = false;
	let mut staging_remove = false;
	while let Ok(event) = events_rx.try_recv() {
		match event {
			Event::NodeUpserted { node } => {
				if node.cached_path().map(|p| p.contains("staging")).unwrap_or(false) {
					staging_upsert = true;
				}
			}
			Event::NodeRemoved { node } => {
				if node.cached_path().map(|p| p.contains("staging")).unwrap_or(false) {
					staging_remove = true;
				}
			}
			_ => {}
		}
	}
	assert!(staging_upsert && staging_remove, "staging copy surfaced to subscribers");

	agent.shutdown().await;
}
