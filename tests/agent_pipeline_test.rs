//! End-to-end tests for the op pipeline on a local device: moves, conflict
//! policies, restart recovery and subtree deletes.

use duplex_core::config::AppConfig;
use duplex_core::domain::identifier::NodeIdentifier;
use duplex_core::domain::op::{DragOperation, FileConflictPolicy, OpType, UserOp};
use duplex_core::domain::uid::Uid;
use duplex_core::infrastructure::events::Event;
use duplex_core::ops::executor::BatchPolicies;
use duplex_core::Agent;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn write_test_config(agent_dir: &Path, cancel_on_startup: bool) {
	let config = AppConfig {
		cache_dir_path: agent_dir.join("cache"),
		staging_dir_path: agent_dir.join("staging"),
		enable_live_monitoring: false,
		signature_batch_interval_ms: 50,
		cancel_all_pending_ops_on_startup: cancel_on_startup,
		..Default::default()
	};
	std::fs::write(
		agent_dir.join("config.json"),
		serde_json::to_string_pretty(&config).unwrap(),
	)
	.unwrap();
}

async fn start_agent(agent_dir: &Path, root: &Path) -> (Arc<Agent>, duplex_core::domain::device::Device) {
	let agent = Agent::init(agent_dir).await.unwrap();
	let device = agent.attach_local_device(root, "pane").await.unwrap();
	(agent, device)
}

async fn load_tree(agent: &Agent, device_uid: Uid, root: &Path, tree_id: &str) -> NodeIdentifier {
	let root_str = root.to_string_lossy().to_string();
	let root_uid = agent
		.service
		.get_uid_for_local_path(device_uid, &root_str)
		.await
		.unwrap();
	let spid = NodeIdentifier::spid(device_uid, root_uid, root_str);
	agent
		.service
		.request_display_tree(tree_id, spid.clone())
		.await
		.unwrap();
	spid
}

async fn uid_for(agent: &Agent, device_uid: Uid, path: &Path) -> Uid {
	agent
		.service
		.get_uid_for_local_path(device_uid, &path.to_string_lossy())
		.await
		.unwrap()
}

async fn wait_idle(agent: &Agent) {
	for _ in 0..200 {
		if agent.context.ops.pending_count() == 0 {
			// Let the final completion settle.
			tokio::time::sleep(Duration::from_millis(50)).await;
			return;
		}
		tokio::time::sleep(Duration::from_millis(25)).await;
	}
	panic!(
		"ops never drained; {} still pending",
		agent.context.ops.pending_count()
	);
}

#[tokio::test]
async fn local_move_keeps_node_identity() {
	let agent_dir = TempDir::new().unwrap();
	let root = TempDir::new().unwrap();
	write_test_config(agent_dir.path(), false);
	std::fs::create_dir(root.path().join("a")).unwrap();
	std::fs::create_dir(root.path().join("b")).unwrap();
	std::fs::write(root.path().join("a/x.txt"), b"payload").unwrap();

	let (agent, device) = start_agent(agent_dir.path(), root.path()).await;
	agent.recover_pending_ops().await.unwrap();
	load_tree(&agent, device.device_uid, root.path(), "tree-left").await;

	let x_uid = uid_for(&agent, device.device_uid, &root.path().join("a/x.txt")).await;
	let b_uid = uid_for(&agent, device.device_uid, &root.path().join("b")).await;

	agent
		.service
		.drop_dragged_nodes(
			vec![format!("{}:{}", device.device_uid, x_uid)],
			&format!("{}:{}", device.device_uid, b_uid),
			DragOperation::Move,
			BatchPolicies::default(),
		)
		.await
		.unwrap();
	wait_idle(&agent).await;

	assert!(!root.path().join("a/x.txt").exists());
	assert_eq!(
		std::fs::read(root.path().join("b/x.txt")).unwrap(),
		b"payload"
	);

	// The node kept its UID; only its parent changed.
	let moved = agent
		.service
		.get_node_for_uid(device.device_uid, x_uid)
		.await
		.unwrap();
	assert!(moved.is_live());
	assert!(moved.cached_path().unwrap().ends_with("b/x.txt"));

	agent.shutdown().await;
}

#[tokio::test]
async fn planning_nodes_survive_restart() {
	let agent_dir = TempDir::new().unwrap();
	let root = TempDir::new().unwrap();
	write_test_config(agent_dir.path(), false);
	std::fs::create_dir(root.path().join("a")).unwrap();
	std::fs::write(root.path().join("a/x.txt"), b"data").unwrap();

	let new_dir_uid;
	let device_uid;
	{
		let (agent, device) = start_agent(agent_dir.path(), root.path()).await;
		device_uid = device.device_uid;
		// Paused: the batch must never start executing.
		agent.service.set_op_exec_play_state(false);
		agent.recover_pending_ops().await.unwrap();
		load_tree(&agent, device_uid, root.path(), "tree-left").await;

		let x_uid = uid_for(&agent, device_uid, &root.path().join("a/x.txt")).await;
		let new_dir_path = root.path().join("a/new");
		new_dir_uid = uid_for(&agent, device_uid, &new_dir_path).await;
		let dst_file_path = root.path().join("a/new/x.txt");
		let dst_file_uid = uid_for(&agent, device_uid, &dst_file_path).await;

		let batch_uid = agent.service.get_next_uid().unwrap();
		let mkdir = UserOp::new(
			agent.service.get_next_uid().unwrap(),
			batch_uid,
			OpType::Mkdir,
			NodeIdentifier::spid(device_uid, new_dir_uid, new_dir_path.to_string_lossy()),
			None,
		);
		let cp = UserOp::new(
			agent.service.get_next_uid().unwrap(),
			batch_uid,
			OpType::Cp,
			NodeIdentifier::spid(
				device_uid,
				x_uid,
				root.path().join("a/x.txt").to_string_lossy(),
			),
			Some(NodeIdentifier::spid(
				device_uid,
				dst_file_uid,
				dst_file_path.to_string_lossy(),
			)),
		);
		agent.context.ops.append_batch(vec![mkdir, cp]).await.unwrap();
		assert_eq!(agent.context.ops.pending_count(), 2);
		// Simulated kill: drop without shutdown.
	}

	let agent = Agent::init(agent_dir.path()).await.unwrap();
	agent.service.set_op_exec_play_state(false);
	agent.attach_local_device(root.path(), "pane").await.unwrap();
	let report = agent.recover_pending_ops().await.unwrap();

	assert_eq!(report.restored, 2, "both ops back in PENDING");
	assert_eq!(agent.context.ops.pending_count(), 2);

	let planning = agent
		.service
		.get_node_for_uid(device_uid, new_dir_uid)
		.await
		.unwrap();
	assert!(!planning.is_live(), "planning dir is present but not live");

	agent.shutdown().await;
}

#[tokio::test]
async fn startup_cancel_archives_the_graph() {
	let agent_dir = TempDir::new().unwrap();
	let root = TempDir::new().unwrap();
	write_test_config(agent_dir.path(), false);
	std::fs::create_dir(root.path().join("a")).unwrap();
	std::fs::write(root.path().join("a/x.txt"), b"data").unwrap();

	let new_dir_uid;
	let device_uid;
	{
		let (agent, device) = start_agent(agent_dir.path(), root.path()).await;
		device_uid = device.device_uid;
		agent.service.set_op_exec_play_state(false);
		agent.recover_pending_ops().await.unwrap();
		load_tree(&agent, device_uid, root.path(), "tree-left").await;

		let x_uid = uid_for(&agent, device_uid, &root.path().join("a/x.txt")).await;
		let new_dir_path = root.path().join("a/new");
		new_dir_uid = uid_for(&agent, device_uid, &new_dir_path).await;
		let dst_uid = uid_for(&agent, device_uid, &root.path().join("a/new/x.txt")).await;

		let batch_uid = agent.service.get_next_uid().unwrap();
		let ops = vec![
			UserOp::new(
				agent.service.get_next_uid().unwrap(),
				batch_uid,
				OpType::Mkdir,
				NodeIdentifier::spid(device_uid, new_dir_uid, new_dir_path.to_string_lossy()),
				None,
			),
			UserOp::new(
				agent.service.get_next_uid().unwrap(),
				batch_uid,
				OpType::Cp,
				NodeIdentifier::spid(
					device_uid,
					x_uid,
					root.path().join("a/x.txt").to_string_lossy(),
				),
				Some(NodeIdentifier::spid(
					device_uid,
					dst_uid,
					root.path().join("a/new/x.txt").to_string_lossy(),
				)),
			),
		];
		agent.context.ops.append_batch(ops).await.unwrap();
	}

	// Restart with the cancel-on-startup policy.
	write_test_config(agent_dir.path(), true);
	let agent = Agent::init(agent_dir.path()).await.unwrap();
	agent.attach_local_device(root.path(), "pane").await.unwrap();
	let report = agent.recover_pending_ops().await.unwrap();

	assert_eq!(report.archived, 2, "whole live graph archived");
	assert_eq!(agent.context.ops.pending_count(), 0);
	assert!(report.planning_nodes_removed >= 1);

	// Planning dir is gone; the archive holds the batch.
	assert!(agent
		.service
		.get_node_for_uid(device_uid, new_dir_uid)
		.await
		.is_err());
	let store = agent.context.cache.store_for(device_uid).await.unwrap();
	assert_eq!(store.count_archived_ops().await.unwrap(), 2);

	agent.shutdown().await;
}

#[tokio::test]
async fn conflict_policy_skip_then_overwrite() {
	let agent_dir = TempDir::new().unwrap();
	let root = TempDir::new().unwrap();
	write_test_config(agent_dir.path(), false);
	std::fs::create_dir(root.path().join("a")).unwrap();
	std::fs::create_dir(root.path().join("b")).unwrap();
	std::fs::write(root.path().join("a/y.txt"), b"new stuff").unwrap();
	std::fs::write(root.path().join("b/y.txt"), b"old").unwrap();

	let (agent, device) = start_agent(agent_dir.path(), root.path()).await;
	agent.recover_pending_ops().await.unwrap();
	load_tree(&agent, device.device_uid, root.path(), "tree-left").await;

	let src_uid = uid_for(&agent, device.device_uid, &root.path().join("a/y.txt")).await;
	let b_uid = uid_for(&agent, device.device_uid, &root.path().join("b")).await;
	let src_guid = format!("{}:{}", device.device_uid, src_uid);
	let b_guid = format!("{}:{}", device.device_uid, b_uid);

	// SKIP: the op is cancelled and nothing changes.
	agent
		.service
		.drop_dragged_nodes(
			vec![src_guid.clone()],
			&b_guid,
			DragOperation::Copy,
			BatchPolicies {
				file: FileConflictPolicy::Skip,
				..Default::default()
			},
		)
		.await
		.unwrap();
	wait_idle(&agent).await;
	assert_eq!(std::fs::read(root.path().join("b/y.txt")).unwrap(), b"old");
	let store = agent.context.cache.store_for(device.device_uid).await.unwrap();
	assert_eq!(store.count_archived_ops().await.unwrap(), 1);

	// OVERWRITE: the destination is replaced.
	agent
		.service
		.drop_dragged_nodes(
			vec![src_guid],
			&b_guid,
			DragOperation::Copy,
			BatchPolicies {
				file: FileConflictPolicy::Overwrite,
				..Default::default()
			},
		)
		.await
		.unwrap();
	wait_idle(&agent).await;
	assert_eq!(
		std::fs::read(root.path().join("b/y.txt")).unwrap(),
		b"new stuff"
	);

	agent.shutdown().await;
}

#[tokio::test]
async fn subtree_delete_removes_children_first() {
	let agent_dir = TempDir::new().unwrap();
	let root = TempDir::new().unwrap();
	write_test_config(agent_dir.path(), false);
	std::fs::create_dir_all(root.path().join("d1/d2")).unwrap();
	std::fs::write(root.path().join("d1/d2/f.txt"), b"x").unwrap();

	let (agent, device) = start_agent(agent_dir.path(), root.path()).await;
	agent.recover_pending_ops().await.unwrap();
	load_tree(&agent, device.device_uid, root.path(), "tree-left").await;

	let d1_uid = uid_for(&agent, device.device_uid, &root.path().join("d1")).await;
	let mut events_rx = agent.context.events.subscribe();

	agent
		.service
		.delete_subtree(vec![format!("{}:{}", device.device_uid, d1_uid)])
		.await
		.unwrap();
	wait_idle(&agent).await;

	assert!(!root.path().join("d1").exists());

	// Children-before-parent on the NODE_REMOVED stream.
	let mut removed_paths = Vec::new();
	while let Ok(event) = events_rx.try_recv() {
		if let Event::NodeRemoved { node } = event {
			if let Some(path) = node.cached_path() {
				removed_paths.push(path.to_string());
			}
		}
	}
	let pos = |suffix: &str| {
		removed_paths
			.iter()
			.position(|p| p.ends_with(suffix))
			.unwrap_or_else(|| panic!("no NODE_REMOVED for {suffix}; got {removed_paths:?}"))
	};
	assert!(pos("f.txt") < pos("d1/d2"));
	assert!(pos("d1/d2") < removed_paths.iter().position(|p| p.ends_with("/d1")).unwrap());

	agent.shutdown().await;
}
