//! The headless agent daemon.
//!
//! Serves the command surface as JSON lines over TCP: one request object
//! per line, one response per request. A `subscribe_to_signals` request
//! upgrades the connection into a server-push signal stream.

use anyhow::{Context, Result};
use clap::Parser;
use duplex_core::infrastructure::events::SignalMsg;
use duplex_core::Agent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "duplexd", about = "Two-pane file-tree synchronisation agent")]
struct Args {
	/// Agent directory holding config.json, caches and logs.
	#[arg(long, default_value = ".duplex")]
	config: PathBuf,

	/// TCP port for the RPC surface.
	#[arg(long, default_value_t = 51771)]
	port: u16,

	/// Initialize the backend without serving RPC (maintenance runs).
	#[arg(long)]
	no_server_launch: bool,

	/// Local roots to mount as devices at startup.
	#[arg(long = "mount")]
	mounts: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Request {
	id: u64,
	method: String,
	#[serde(default)]
	params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
	id: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<String>,
}

fn init_tracing(agent_dir: &std::path::Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
	let log_dir = agent_dir.join("logs");
	std::fs::create_dir_all(&log_dir)?;
	// Log filename base comes from $EXE_NAME_ when the launcher sets it.
	let base = std::env::var("EXE_NAME_").unwrap_or_else(|_| "duplexd".to_string());
	let appender = tracing_appender::rolling::daily(log_dir, format!("{base}.log"));
	let (writer, guard) = tracing_appender::non_blocking(appender);

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(writer)
		.with_ansi(false)
		.init();
	Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();
	std::fs::create_dir_all(&args.config)?;
	let _log_guard = init_tracing(&args.config)?;

	let agent = Agent::init(&args.config)
		.await
		.context("failed to initialize agent")?;

	for mount in &args.mounts {
		let name = mount
			.file_name()
			.map(|n| n.to_string_lossy().to_string())
			.unwrap_or_else(|| mount.to_string_lossy().to_string());
		match agent.attach_local_device(mount, &name).await {
			Ok(device) => info!("Mounted {:?} as device {}", mount, device.device_uid),
			Err(e) => error!("Failed to mount {:?}: {e}", mount),
		}
	}

	let report = agent
		.recover_pending_ops()
		.await
		.context("op recovery failed")?;
	info!(
		"Op recovery: {} restored, {} archived, {} planning nodes removed",
		report.restored, report.archived, report.planning_nodes_removed
	);

	if args.no_server_launch {
		info!("--no-server-launch: backend initialized, exiting");
		agent.shutdown().await;
		return Ok(());
	}

	let listener = TcpListener::bind(("127.0.0.1", args.port))
		.await
		.with_context(|| format!("failed to bind port {}", args.port))?;
	info!("Serving RPC on 127.0.0.1:{}", args.port);

	loop {
		tokio::select! {
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						info!("Client connected from {peer}");
						let agent = agent.clone();
						tokio::spawn(async move {
							if let Err(e) = serve_connection(agent, stream).await {
								warn!("Connection from {peer} ended: {e}");
							}
						});
					}
					Err(e) => error!("Accept failed: {e}"),
				}
			}
			_ = tokio::signal::ctrl_c() => {
				info!("Interrupt received");
				break;
			}
		}
	}

	agent.shutdown().await;
	Ok(())
}

async fn serve_connection(agent: Arc<Agent>, stream: TcpStream) -> Result<()> {
	let (reader, mut writer) = stream.into_split();
	let mut lines = BufReader::new(reader).lines();

	while let Some(line) = lines.next_line().await? {
		if line.trim().is_empty() {
			continue;
		}
		let request: Request = match serde_json::from_str(&line) {
			Ok(request) => request,
			Err(e) => {
				let response = Response {
					id: 0,
					result: None,
					error: Some(format!("malformed request: {e}")),
				};
				writer
					.write_all(format!("{}\n", serde_json::to_string(&response)?).as_bytes())
					.await?;
				continue;
			}
		};

		// Subscription upgrades the connection into a push stream.
		if request.method == "subscribe_to_signals" {
			#[derive(Deserialize, Default)]
			struct SubscribeParams {
				#[serde(default)]
				tree_id: Option<String>,
			}
			let params: SubscribeParams =
				serde_json::from_value(request.params).unwrap_or_default();
			let mut subscription = agent.service.subscribe_to_signals(params.tree_id);

			let ack = Response {
				id: request.id,
				result: Some(serde_json::json!({ "subscribed": subscription.id })),
				error: None,
			};
			writer
				.write_all(format!("{}\n", serde_json::to_string(&ack)?).as_bytes())
				.await?;

			while let Some(msg) = subscription.rx.recv().await {
				let line = serde_json::to_string(&StreamFrame { signal: msg })?;
				writer.write_all(format!("{line}\n").as_bytes()).await?;
			}
			return Ok(());
		}

		let response = match agent.service.handle_request(&request.method, request.params).await {
			Ok(result) => Response {
				id: request.id,
				result: Some(result),
				error: None,
			},
			Err(e) => Response {
				id: request.id,
				result: None,
				error: Some(e.to_string()),
			},
		};
		writer
			.write_all(format!("{}\n", serde_json::to_string(&response)?).as_bytes())
			.await?;
	}
	Ok(())
}

#[derive(Serialize)]
struct StreamFrame {
	signal: SignalMsg,
}
