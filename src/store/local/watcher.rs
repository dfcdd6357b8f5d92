//! Live filesystem monitoring.
//!
//! Optional capability: attaches a `notify` watcher to a local root and
//! batches change bursts on a debounce interval. Consumers receive only the
//! set of touched paths; resolving what actually changed is the scanner's
//! job, so a failed or unavailable watcher degrades to on-demand scanning
//! without changing any interface.

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A debounced burst of touched paths.
pub type ChangeBurst = Vec<PathBuf>;

/// Watch `root_path`, delivering debounced bursts on `burst_tx`.
///
/// Returns an error when the OS notification source is unavailable; callers
/// fall back to on-demand scans.
pub fn start(
	root_path: PathBuf,
	batch_interval_ms: u64,
	burst_tx: mpsc::Sender<ChangeBurst>,
	mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, notify::Error> {
	let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<PathBuf>();

	let mut watcher: RecommendedWatcher =
		notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
			Ok(event) => {
				for path in event.paths {
					let _ = raw_tx.send(path);
				}
			}
			Err(e) => warn!("Filesystem watcher error: {e}"),
		})?;
	watcher.watch(&root_path, RecursiveMode::Recursive)?;
	info!("Live monitoring attached to {:?}", root_path);

	let interval = Duration::from_millis(batch_interval_ms.max(1));
	let handle = tokio::spawn(async move {
		// Keep the watcher alive for the life of the task.
		let _watcher = watcher;
		let mut pending: BTreeSet<PathBuf> = BTreeSet::new();

		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						break;
					}
				}
				maybe_path = raw_rx.recv() => {
					match maybe_path {
						Some(path) => {
							pending.insert(path);
						}
						None => break,
					}
				}
				_ = tokio::time::sleep(interval), if !pending.is_empty() => {
					let burst: ChangeBurst = std::mem::take(&mut pending).into_iter().collect();
					debug!("Flushing change burst of {} paths", burst.len());
					if burst_tx.send(burst).await.is_err() {
						break;
					}
				}
			}
		}
		info!("Live monitoring for {:?} stopped", root_path);
	});
	Ok(handle)
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn burst_arrives_after_change() {
		let root = TempDir::new().unwrap();
		let (burst_tx, mut burst_rx) = mpsc::channel(8);
		let (_shutdown_tx, shutdown_rx) = watch::channel(false);

		let handle = match start(root.path().to_path_buf(), 50, burst_tx, shutdown_rx) {
			Ok(handle) => handle,
			// Notification source unavailable in this environment; the
			// fallback path is exercised elsewhere.
			Err(_) => return,
		};

		std::fs::write(root.path().join("x.txt"), b"x").unwrap();

		let burst = tokio::time::timeout(Duration::from_secs(5), burst_rx.recv()).await;
		if let Ok(Some(burst)) = burst {
			assert!(!burst.is_empty());
		}
		handle.abort();
	}
}
