//! The command facade the RPC surface calls into.
//!
//! One method per client command. The daemon binary exposes these as
//! JSON-lines over a socket; `handle_request` is the single dispatch point
//! so the wire layer stays a dumb pipe.

use crate::cache::manager::{CacheError, CacheManager, Sn};
use crate::cache::TreeLoadState;
use crate::config::{AppConfig, ConfigError};
use crate::domain::device::Device;
use crate::domain::identifier::{Guid, IdentifierError, NodeIdentifier};
use crate::domain::node::Node;
use crate::domain::op::{Batch, DragOperation, UserOp};
use crate::domain::uid::Uid;
use crate::infrastructure::events::{Event, SignalMsg};
use crate::ops::executor::{BatchPolicies, PolicyRegistry};
use crate::ops::manager::{OpManager, OpManagerError};
use crate::service::diff::{ChangeMaker, DiffResult};
use crate::service::signals::{SignalHub, Subscription};
use crate::store::gdrive::RemoteError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

pub const UI_STATE_FILENAME: &str = "ui-state.json";

#[derive(Error, Debug)]
pub enum AgentError {
	#[error("cache error: {0}")]
	Cache(#[from] CacheError),

	#[error("op error: {0}")]
	Ops(#[from] OpManagerError),

	#[error("config error: {0}")]
	Config(#[from] ConfigError),

	#[error("identifier error: {0}")]
	Identifier(#[from] IdentifierError),

	#[error("remote error: {0}")]
	Remote(#[from] RemoteError),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("bad request: {0}")]
	BadRequest(String),

	#[error("unknown method: {0}")]
	UnknownMethod(String),
}

impl From<serde_json::Error> for AgentError {
	fn from(e: serde_json::Error) -> Self {
		Self::BadRequest(e.to_string())
	}
}

/// Per-tree display filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCriteria {
	pub search_query: Option<String>,
	pub show_trashed: bool,
}

impl FilterCriteria {
	fn admits(&self, node: &Node) -> bool {
		if !self.show_trashed && node.trashed().is_trashed() {
			return false;
		}
		match &self.search_query {
			Some(query) if !query.is_empty() => node
				.name()
				.to_lowercase()
				.contains(&query.to_lowercase()),
			_ => true,
		}
	}
}

/// Expanded/selected rows and filter for one tree, persisted across
/// sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeUiState {
	pub expanded: Vec<String>,
	pub selected: Vec<String>,
	#[serde(default)]
	pub filter: FilterCriteria,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UiState {
	trees: HashMap<String, TreeUiState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMenuItem {
	pub label: String,
	pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeAction {
	pub action: String,
	pub tree_id: String,
	#[serde(default)]
	pub target_guids: Vec<String>,
}

/// The backend command surface.
pub struct AgentService {
	config: RwLock<AppConfig>,
	cache: Arc<CacheManager>,
	ops: Arc<OpManager>,
	change_maker: ChangeMaker,
	signals: Arc<SignalHub>,
	play_tx: watch::Sender<bool>,
	ui_state: Mutex<UiState>,
	ui_state_path: PathBuf,
	diffs: Mutex<HashMap<(String, String), DiffResult>>,
}

impl AgentService {
	pub fn new(
		config: AppConfig,
		cache: Arc<CacheManager>,
		ops: Arc<OpManager>,
		policies: Arc<PolicyRegistry>,
		signals: Arc<SignalHub>,
		play_tx: watch::Sender<bool>,
	) -> Self {
		let ui_state_path = config.agent_dir.join(UI_STATE_FILENAME);
		let ui_state = std::fs::read_to_string(&ui_state_path)
			.ok()
			.and_then(|raw| serde_json::from_str(&raw).ok())
			.unwrap_or_default();
		let change_maker = ChangeMaker::new(cache.clone(), ops.clone(), policies);
		Self {
			config: RwLock::new(config),
			cache,
			ops,
			change_maker,
			signals,
			play_tx,
			ui_state: Mutex::new(ui_state),
			ui_state_path,
			diffs: Mutex::new(HashMap::new()),
		}
	}

	// Signal group

	pub fn subscribe_to_signals(&self, tree_filter: Option<String>) -> Subscription {
		self.signals.subscribe(tree_filter)
	}

	/// Client-originated signal. Control signals act on the backend; all
	/// signals are re-fanned to the other subscribers.
	pub async fn send_signal(&self, msg: SignalMsg) -> Result<(), AgentError> {
		match &msg.event {
			Event::HandleBatchFailed { batch_uid, strategy } => {
				info!("Client chose {strategy:?} for failed batch {batch_uid}");
				self.ops.handle_batch_failed(*batch_uid, *strategy).await?;
			}
			Event::OpExecPlayStateChanged { playing } => {
				let _ = self.play_tx.send(*playing);
			}
			_ => {}
		}
		self.signals.publish(msg);
		Ok(())
	}

	// Config group

	pub async fn get_config(&self, key: &str) -> Result<Value, AgentError> {
		Ok(self.config.read().await.get_key(key)?)
	}

	pub async fn put_config(&self, key: &str, value: Value) -> Result<(), AgentError> {
		Ok(self.config.write().await.put_key(key, value)?)
	}

	/// Icon assets ship with the client; the agent only confirms the id.
	pub fn get_icon(&self, icon_id: i32) -> Option<Vec<u8>> {
		let _ = icon_id;
		None
	}

	pub async fn get_device_list(&self) -> Vec<Device> {
		self.cache.device_list().await
	}

	// Tree view group

	pub async fn get_child_list_for_spid(
		&self,
		spid: &NodeIdentifier,
		tree_id: Option<&str>,
	) -> Result<Vec<Sn>, AgentError> {
		let filter = match tree_id {
			Some(tree_id) => self.get_filter(tree_id).await,
			None => FilterCriteria::default(),
		};
		let children = self.cache.get_child_list(spid).await?;
		Ok(children
			.into_iter()
			.filter(|sn| filter.admits(&sn.node))
			.collect())
	}

	pub async fn get_ancestor_list_for_spid(
		&self,
		spid: &NodeIdentifier,
	) -> Result<Vec<Sn>, AgentError> {
		Ok(self.cache.get_ancestor_list(spid).await?)
	}

	pub async fn get_rows_of_interest(&self, tree_id: &str) -> TreeUiState {
		self.ui_state
			.lock()
			.await
			.trees
			.get(tree_id)
			.cloned()
			.unwrap_or_default()
	}

	pub async fn set_selected_row_set(
		&self,
		tree_id: &str,
		guids: Vec<String>,
	) -> Result<(), AgentError> {
		let selected: Result<Vec<Guid>, _> = guids.iter().map(|g| g.parse()).collect();
		let selected = selected?;
		{
			let mut state = self.ui_state.lock().await;
			state.trees.entry(tree_id.to_string()).or_default().selected = guids;
			self.save_ui_state(&state)?;
		}
		self.cache.events().emit(Event::SelectionChanged {
			tree_id: tree_id.to_string(),
			selected,
		});
		Ok(())
	}

	pub async fn remove_expanded_row(&self, tree_id: &str, guid: &str) -> Result<(), AgentError> {
		let mut state = self.ui_state.lock().await;
		if let Some(tree) = state.trees.get_mut(tree_id) {
			tree.expanded.retain(|g| g != guid);
			self.save_ui_state(&state)?;
		}
		Ok(())
	}

	pub async fn add_expanded_row(&self, tree_id: &str, guid: String) -> Result<(), AgentError> {
		let mut state = self.ui_state.lock().await;
		let tree = state.trees.entry(tree_id.to_string()).or_default();
		if !tree.expanded.contains(&guid) {
			tree.expanded.push(guid);
		}
		self.save_ui_state(&state)?;
		Ok(())
	}

	pub async fn get_filter(&self, tree_id: &str) -> FilterCriteria {
		self.ui_state
			.lock()
			.await
			.trees
			.get(tree_id)
			.map(|tree| tree.filter.clone())
			.unwrap_or_default()
	}

	pub async fn update_filter(
		&self,
		tree_id: &str,
		filter: FilterCriteria,
	) -> Result<(), AgentError> {
		let mut state = self.ui_state.lock().await;
		state.trees.entry(tree_id.to_string()).or_default().filter = filter;
		self.save_ui_state(&state)?;
		Ok(())
	}

	pub async fn get_context_menu(
		&self,
		tree_id: &str,
		guid: &str,
	) -> Result<Vec<ContextMenuItem>, AgentError> {
		let guid: Guid = guid.parse()?;
		let node = self.cache.get_node_for_uid(guid.device_uid, guid.node_uid).await?;
		let mut items = vec![ContextMenuItem {
			label: format!("Refresh {tree_id}"),
			action: "refresh_subtree".into(),
		}];
		if node.is_dir() {
			items.push(ContextMenuItem {
				label: "Expand".into(),
				action: "expand_row".into(),
			});
		}
		if node.is_live() {
			items.push(ContextMenuItem {
				label: "Delete".into(),
				action: "delete_subtree".into(),
			});
		}
		if node.is_gdrive() && node.is_file() {
			items.push(ContextMenuItem {
				label: "Download".into(),
				action: "download_from_gdrive".into(),
			});
		}
		Ok(items)
	}

	pub async fn execute_tree_action_list(
		&self,
		actions: Vec<TreeAction>,
	) -> Result<(), AgentError> {
		for action in actions {
			debug!("Tree action {} on {}", action.action, action.tree_id);
			match action.action.as_str() {
				"refresh_subtree" => {
					self.refresh_subtree(&action.tree_id).await?;
				}
				"delete_subtree" => {
					self.delete_subtree(action.target_guids.clone()).await?;
				}
				"expand_row" => {
					for guid in action.target_guids {
						self.add_expanded_row(&action.tree_id, guid).await?;
					}
				}
				"collapse_row" => {
					for guid in &action.target_guids {
						self.remove_expanded_row(&action.tree_id, guid).await?;
					}
				}
				other => {
					return Err(AgentError::BadRequest(format!("unknown tree action {other}")))
				}
			}
		}
		Ok(())
	}

	// Tree lifecycle group

	pub async fn request_display_tree(
		&self,
		tree_id: &str,
		root: NodeIdentifier,
	) -> Result<TreeLoadState, AgentError> {
		Ok(self.cache.request_display_tree(tree_id, root).await?)
	}

	pub async fn start_subtree_load(&self, tree_id: &str) -> Result<TreeLoadState, AgentError> {
		Ok(self.cache.start_subtree_load(tree_id).await?)
	}

	pub async fn refresh_subtree(&self, tree_id: &str) -> Result<TreeLoadState, AgentError> {
		Ok(self.cache.refresh_subtree(tree_id).await?)
	}

	// Identifier group

	pub fn get_next_uid(&self) -> Result<Uid, AgentError> {
		self.cache
			.allocator()
			.next_uid()
			.map_err(|e| AgentError::Ops(OpManagerError::Uid(e)))
	}

	pub async fn get_node_for_uid(&self, device_uid: Uid, uid: Uid) -> Result<Node, AgentError> {
		Ok(self.cache.get_node_for_uid(device_uid, uid).await?)
	}

	pub async fn get_uid_for_local_path(
		&self,
		device_uid: Uid,
		full_path: &str,
	) -> Result<Uid, AgentError> {
		Ok(self.cache.get_uid_for_local_path(device_uid, full_path).await?)
	}

	pub async fn get_sn_for(&self, device_uid: Uid, uid: Uid) -> Result<Sn, AgentError> {
		let node = self.cache.get_node_for_uid(device_uid, uid).await?;
		Ok(self.cache.sn_for(node).await?)
	}

	// Diff / merge group

	pub async fn start_diff_trees(
		&self,
		left_tree_id: &str,
		right_tree_id: &str,
	) -> Result<DiffResult, AgentError> {
		let result = self.change_maker.diff_trees(left_tree_id, right_tree_id).await?;
		self.diffs.lock().await.insert(
			(left_tree_id.to_string(), right_tree_id.to_string()),
			result.clone(),
		);
		Ok(result)
	}

	/// Planned merge ops for the most recent diff of the given pair.
	pub async fn generate_merge_tree(
		&self,
		left_tree_id: &str,
		right_tree_id: &str,
	) -> Result<Vec<UserOp>, AgentError> {
		let diff = self
			.diffs
			.lock()
			.await
			.get(&(left_tree_id.to_string(), right_tree_id.to_string()))
			.cloned()
			.ok_or_else(|| {
				AgentError::BadRequest(format!(
					"no diff computed for {left_tree_id} vs {right_tree_id}"
				))
			})?;
		Ok(self.change_maker.generate_merge_ops(&diff).await?)
	}

	pub async fn drop_dragged_nodes(
		&self,
		src_guids: Vec<String>,
		dst_guid: &str,
		drag: DragOperation,
		policies: BatchPolicies,
	) -> Result<Batch, AgentError> {
		let mut src_nodes = Vec::with_capacity(src_guids.len());
		for guid in &src_guids {
			src_nodes.push(self.node_for_guid(guid).await?);
		}
		let dst_parent = self.node_for_guid(dst_guid).await?;
		if !dst_parent.is_dir() {
			return Err(AgentError::BadRequest("drop target is not a directory".into()));
		}
		Ok(self
			.change_maker
			.drop_dragged_nodes(src_nodes, dst_parent, drag, policies)
			.await?)
	}

	pub async fn delete_subtree(&self, guids: Vec<String>) -> Result<Batch, AgentError> {
		let mut roots = Vec::with_capacity(guids.len());
		for guid in &guids {
			roots.push(self.node_for_guid(guid).await?);
		}
		Ok(self.change_maker.delete_subtree(roots).await?)
	}

	pub fn get_last_pending_op_for_node(&self, device_uid: Uid, node_uid: Uid) -> Option<UserOp> {
		self.ops.get_last_pending_op_for_node(device_uid, node_uid)
	}

	pub async fn download_file_from_gdrive(
		&self,
		device_uid: Uid,
		node_uid: Uid,
		dst_path: &str,
	) -> Result<(), AgentError> {
		let node = self.cache.get_node_for_uid(device_uid, node_uid).await?;
		let goog_id = node
			.goog_id()
			.ok_or_else(|| AgentError::BadRequest("node has no cloud identity".into()))?;
		let remote = self.cache.remote_for(device_uid).await?;
		remote
			.download_file(goog_id, std::path::Path::new(dst_path))
			.await?;
		Ok(())
	}

	pub fn get_op_exec_play_state(&self) -> bool {
		*self.play_tx.borrow()
	}

	pub fn set_op_exec_play_state(&self, playing: bool) {
		let _ = self.play_tx.send(playing);
		self.cache
			.events()
			.emit(Event::OpExecPlayStateChanged { playing });
	}

	async fn node_for_guid(&self, guid: &str) -> Result<Node, AgentError> {
		let guid: Guid = guid.parse()?;
		Ok(self.cache.get_node_for_uid(guid.device_uid, guid.node_uid).await?)
	}

	fn save_ui_state(&self, state: &UiState) -> Result<(), AgentError> {
		std::fs::write(&self.ui_state_path, serde_json::to_string_pretty(state)?)?;
		Ok(())
	}

	// Wire dispatch

	/// Dispatch one decoded request. The daemon's socket loop calls this
	/// with the method name and raw params.
	pub async fn handle_request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
		#[derive(Deserialize)]
		struct KeyParams {
			key: String,
			#[serde(default)]
			value: Option<Value>,
		}
		#[derive(Deserialize)]
		struct TreeParams {
			tree_id: String,
			#[serde(default)]
			root: Option<NodeIdentifier>,
		}
		#[derive(Deserialize)]
		struct SpidParams {
			spid: NodeIdentifier,
			#[serde(default)]
			tree_id: Option<String>,
		}
		#[derive(Deserialize)]
		struct UidParams {
			device_uid: Uid,
			#[serde(default)]
			uid: Option<Uid>,
			#[serde(default)]
			full_path: Option<String>,
		}
		#[derive(Deserialize)]
		struct RowsParams {
			tree_id: String,
			#[serde(default)]
			guids: Vec<String>,
			#[serde(default)]
			guid: Option<String>,
		}
		#[derive(Deserialize)]
		struct FilterParams {
			tree_id: String,
			#[serde(default)]
			filter: Option<FilterCriteria>,
		}
		#[derive(Deserialize)]
		struct DiffParams {
			left_tree_id: String,
			right_tree_id: String,
		}
		#[derive(Deserialize)]
		struct DragParams {
			src_guids: Vec<String>,
			dst_guid: String,
			drag_operation: DragOperation,
			#[serde(default)]
			file_conflict_policy: crate::domain::op::FileConflictPolicy,
			#[serde(default)]
			dir_conflict_policy: crate::domain::op::DirConflictPolicy,
		}
		#[derive(Deserialize)]
		struct DownloadParams {
			device_uid: Uid,
			node_uid: Uid,
			dst_path: String,
		}

		match method {
			"send_signal" => {
				let msg: SignalMsg = serde_json::from_value(params)?;
				self.send_signal(msg).await?;
				Ok(Value::Null)
			}
			"get_config" => {
				let p: KeyParams = serde_json::from_value(params)?;
				self.get_config(&p.key).await
			}
			"put_config" => {
				let p: KeyParams = serde_json::from_value(params)?;
				let value = p
					.value
					.ok_or_else(|| AgentError::BadRequest("put_config needs a value".into()))?;
				self.put_config(&p.key, value).await?;
				Ok(Value::Null)
			}
			"get_icon" => {
				#[derive(Deserialize)]
				struct IconParams {
					icon_id: i32,
				}
				let p: IconParams = serde_json::from_value(params)?;
				Ok(json!(self.get_icon(p.icon_id)))
			}
			"get_device_list" => Ok(serde_json::to_value(self.get_device_list().await)?),
			"get_child_list_for_spid" => {
				let p: SpidParams = serde_json::from_value(params)?;
				Ok(serde_json::to_value(
					self.get_child_list_for_spid(&p.spid, p.tree_id.as_deref()).await?,
				)?)
			}
			"get_ancestor_list_for_spid" => {
				let p: SpidParams = serde_json::from_value(params)?;
				Ok(serde_json::to_value(self.get_ancestor_list_for_spid(&p.spid).await?)?)
			}
			"get_rows_of_interest" => {
				let p: TreeParams = serde_json::from_value(params)?;
				Ok(serde_json::to_value(self.get_rows_of_interest(&p.tree_id).await)?)
			}
			"set_selected_row_set" => {
				let p: RowsParams = serde_json::from_value(params)?;
				self.set_selected_row_set(&p.tree_id, p.guids).await?;
				Ok(Value::Null)
			}
			"remove_expanded_row" => {
				let p: RowsParams = serde_json::from_value(params)?;
				let guid = p
					.guid
					.ok_or_else(|| AgentError::BadRequest("remove_expanded_row needs a guid".into()))?;
				self.remove_expanded_row(&p.tree_id, &guid).await?;
				Ok(Value::Null)
			}
			"get_filter" => {
				let p: FilterParams = serde_json::from_value(params)?;
				Ok(serde_json::to_value(self.get_filter(&p.tree_id).await)?)
			}
			"update_filter" => {
				let p: FilterParams = serde_json::from_value(params)?;
				let filter = p
					.filter
					.ok_or_else(|| AgentError::BadRequest("update_filter needs a filter".into()))?;
				self.update_filter(&p.tree_id, filter).await?;
				Ok(Value::Null)
			}
			"get_context_menu" => {
				let p: RowsParams = serde_json::from_value(params)?;
				let guid = p
					.guid
					.ok_or_else(|| AgentError::BadRequest("get_context_menu needs a guid".into()))?;
				Ok(serde_json::to_value(self.get_context_menu(&p.tree_id, &guid).await?)?)
			}
			"execute_tree_action_list" => {
				let actions: Vec<TreeAction> = serde_json::from_value(params)?;
				self.execute_tree_action_list(actions).await?;
				Ok(Value::Null)
			}
			"request_display_tree" => {
				let p: TreeParams = serde_json::from_value(params)?;
				let root = p
					.root
					.ok_or_else(|| AgentError::BadRequest("request_display_tree needs a root".into()))?;
				Ok(serde_json::to_value(self.request_display_tree(&p.tree_id, root).await?)?)
			}
			"start_subtree_load" => {
				let p: TreeParams = serde_json::from_value(params)?;
				Ok(serde_json::to_value(self.start_subtree_load(&p.tree_id).await?)?)
			}
			"refresh_subtree" => {
				let p: TreeParams = serde_json::from_value(params)?;
				Ok(serde_json::to_value(self.refresh_subtree(&p.tree_id).await?)?)
			}
			"get_next_uid" => Ok(serde_json::to_value(self.get_next_uid()?)?),
			"get_node_for_uid" => {
				let p: UidParams = serde_json::from_value(params)?;
				let uid = p
					.uid
					.ok_or_else(|| AgentError::BadRequest("get_node_for_uid needs a uid".into()))?;
				Ok(serde_json::to_value(self.get_node_for_uid(p.device_uid, uid).await?)?)
			}
			"get_uid_for_local_path" => {
				let p: UidParams = serde_json::from_value(params)?;
				let full_path = p.full_path.ok_or_else(|| {
					AgentError::BadRequest("get_uid_for_local_path needs a path".into())
				})?;
				Ok(serde_json::to_value(
					self.get_uid_for_local_path(p.device_uid, &full_path).await?,
				)?)
			}
			"get_sn_for" => {
				let p: UidParams = serde_json::from_value(params)?;
				let uid = p
					.uid
					.ok_or_else(|| AgentError::BadRequest("get_sn_for needs a uid".into()))?;
				Ok(serde_json::to_value(self.get_sn_for(p.device_uid, uid).await?)?)
			}
			"start_diff_trees" => {
				let p: DiffParams = serde_json::from_value(params)?;
				Ok(serde_json::to_value(
					self.start_diff_trees(&p.left_tree_id, &p.right_tree_id).await?,
				)?)
			}
			"generate_merge_tree" => {
				let p: DiffParams = serde_json::from_value(params)?;
				Ok(serde_json::to_value(
					self.generate_merge_tree(&p.left_tree_id, &p.right_tree_id).await?,
				)?)
			}
			"drop_dragged_nodes" => {
				let p: DragParams = serde_json::from_value(params)?;
				let batch = self
					.drop_dragged_nodes(
						p.src_guids,
						&p.dst_guid,
						p.drag_operation,
						BatchPolicies {
							file: p.file_conflict_policy,
							dir: p.dir_conflict_policy,
						},
					)
					.await?;
				Ok(serde_json::to_value(batch)?)
			}
			"delete_subtree" => {
				let p: RowsParams = serde_json::from_value(params)?;
				Ok(serde_json::to_value(self.delete_subtree(p.guids).await?)?)
			}
			"get_last_pending_op_for_node" => {
				let p: UidParams = serde_json::from_value(params)?;
				let uid = p.uid.ok_or_else(|| {
					AgentError::BadRequest("get_last_pending_op_for_node needs a uid".into())
				})?;
				Ok(serde_json::to_value(self.get_last_pending_op_for_node(p.device_uid, uid))?)
			}
			"download_file_from_gdrive" => {
				let p: DownloadParams = serde_json::from_value(params)?;
				self.download_file_from_gdrive(p.device_uid, p.node_uid, &p.dst_path)
					.await?;
				Ok(Value::Null)
			}
			"get_op_exec_play_state" => Ok(json!(self.get_op_exec_play_state())),
			other => Err(AgentError::UnknownMethod(other.to_string())),
		}
	}
}
