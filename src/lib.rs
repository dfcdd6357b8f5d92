//! duplex-core
//!
//! Headless agent for two-pane file-tree reconciliation: a unified node
//! cache over local and cloud subtrees, a durable user-op graph with a
//! per-device executor, and the cache-coherence workers (disk scanning,
//! signature calculation, cloud change polling, live monitoring) that keep
//! it honest. A thin UI client drives it over a streaming RPC channel.

pub mod cache;
pub mod config;
pub mod context;
pub mod domain;
pub mod infrastructure;
pub mod ops;
pub mod service;
pub mod store;

use crate::cache::manager::{CacheError, CacheManager};
use crate::config::{AppConfig, ConfigError};
use crate::context::AgentContext;
use crate::domain::device::{Device, DeviceError, DeviceRegistry};
use crate::domain::uid::{Uid, UidAllocator, UidError};
use crate::infrastructure::events::{Event, EventBus};
use crate::ops::executor::{OpExecutor, PolicyRegistry};
use crate::ops::graph::OpGraph;
use crate::ops::manager::{OpManager, OpManagerError, StartupReport};
use crate::service::agent_service::AgentService;
use crate::service::signals::SignalHub;
use crate::store::gdrive::RemoteFs;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum AgentInitError {
	#[error("config error: {0}")]
	Config(#[from] ConfigError),

	#[error("uid allocator error: {0}")]
	Uid(#[from] UidError),

	#[error("device registry error: {0}")]
	Device(#[from] DeviceError),

	#[error("cache error: {0}")]
	Cache(#[from] CacheError),

	#[error("op recovery error: {0}")]
	Ops(#[from] OpManagerError),
}

/// The running agent: owns every subsystem and wires them together.
pub struct Agent {
	pub config: AppConfig,
	pub context: AgentContext,
	pub service: Arc<AgentService>,
	pub signals: Arc<SignalHub>,
	policies: Arc<PolicyRegistry>,
	play_tx: watch::Sender<bool>,
	shutdown_tx: watch::Sender<bool>,
	executor_handles: Mutex<Vec<JoinHandle<()>>>,
	executor_devices: Mutex<HashSet<Uid>>,
}

impl Agent {
	/// Bring the agent up under `agent_dir`. Devices are attached
	/// separately; call [`Agent::recover_pending_ops`] once they are.
	pub async fn init(agent_dir: &Path) -> Result<Arc<Self>, AgentInitError> {
		info!("Initializing agent at {:?}", agent_dir);

		// 1. Config, directories.
		let config = AppConfig::load_or_create(agent_dir)?;
		config.ensure_directories()?;

		// 2. UID allocator: nothing else may hand out identity.
		let allocator = Arc::new(UidAllocator::load(
			agent_dir,
			config.uid_reservation_block_size,
			config.enable_uid_lastval_persistence,
		)?);

		// 3. Device registry.
		let registry = Arc::new(DeviceRegistry::load(agent_dir, allocator.clone())?);

		// 4. Event bus, then the cache manager above the stores.
		let events = Arc::new(EventBus::default());
		let cache = Arc::new(CacheManager::new(
			config.clone(),
			allocator.clone(),
			registry.clone(),
			events.clone(),
		));

		// 5. The op pipeline.
		let graph = Arc::new(OpGraph::default());
		let ops = Arc::new(OpManager::new(
			graph,
			cache.clone(),
			events.clone(),
			allocator.clone(),
			config.cancel_all_pending_ops_on_startup,
		));

		// 6. Client surface.
		let policies = Arc::new(PolicyRegistry::default());
		let (play_tx, _) = watch::channel(true);
		let signals = SignalHub::start(events.clone());
		let service = Arc::new(AgentService::new(
			config.clone(),
			cache.clone(),
			ops.clone(),
			policies.clone(),
			signals.clone(),
			play_tx.clone(),
		));

		let (shutdown_tx, _) = watch::channel(false);
		let context = AgentContext {
			events: events.clone(),
			allocator,
			registry,
			cache,
			ops,
		};

		events.emit(Event::AgentStarted);
		Ok(Arc::new(Self {
			config,
			context,
			service,
			signals,
			policies,
			play_tx,
			shutdown_tx,
			executor_handles: Mutex::new(Vec::new()),
			executor_devices: Mutex::new(HashSet::new()),
		}))
	}

	/// Mount a local filesystem root and start its executor.
	pub async fn attach_local_device(
		&self,
		root_path: &Path,
		friendly_name: &str,
	) -> Result<Device, AgentInitError> {
		let device = self
			.context
			.cache
			.attach_local_device(root_path, friendly_name)
			.await?;
		self.start_executor_for(device.device_uid).await;
		Ok(device)
	}

	/// Mount a cloud-drive account and start its executor.
	pub async fn attach_gdrive_device(
		&self,
		client: Arc<dyn RemoteFs>,
		friendly_name: &str,
	) -> Result<Device, AgentInitError> {
		let device = self
			.context
			.cache
			.attach_gdrive_device(client, friendly_name)
			.await?;
		self.start_executor_for(device.device_uid).await;
		Ok(device)
	}

	async fn start_executor_for(&self, device_uid: Uid) {
		let mut devices = self.executor_devices.lock().await;
		if !devices.insert(device_uid) {
			return;
		}
		let executor = OpExecutor::new(
			device_uid,
			self.context.ops.clone(),
			self.context.cache.clone(),
			self.context.events.clone(),
			self.policies.clone(),
			self.config.staging_dir_path.clone(),
			self.config.update_meta_for_dst_nodes,
			self.config.max_transient_retries,
			self.play_tx.subscribe(),
		);
		self.executor_handles
			.lock()
			.await
			.push(executor.spawn(self.shutdown_tx.subscribe()));
	}

	/// Rehydrate (or archive, per config) the persisted op graph. Call
	/// after every expected device is attached.
	pub async fn recover_pending_ops(&self) -> Result<StartupReport, AgentInitError> {
		Ok(self.context.ops.startup_recovery().await?)
	}

	pub async fn shutdown(&self) {
		info!("Agent shutting down");
		self.context.ops.graph().shutdown();
		let _ = self.shutdown_tx.send(true);
		let mut handles = self.executor_handles.lock().await;
		for handle in handles.drain(..) {
			if let Err(e) = handle.await {
				error!("Executor task ended badly: {e}");
			}
		}
		self.context.cache.shutdown().await;
		self.context.events.emit(Event::AgentShutdown);
		info!("Agent shutdown complete");
	}
}
