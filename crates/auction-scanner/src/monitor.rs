//! Polling block monitor.

use crate::{BlockSourceInterface, ScannerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// A change of the observed chain head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockObservation {
	pub height: u64,
	/// Previously observed height, `None` for the first observation.
	pub previous: Option<u64>,
}

impl BlockObservation {
	/// The head moved backwards.
	pub fn is_reorg(&self) -> bool {
		self.previous.is_some_and(|previous| self.height < previous)
	}
}

pub struct BlockMonitor {
	source: Arc<dyn BlockSourceInterface>,
	poll_interval: Duration,
	is_monitoring: Arc<AtomicBool>,
	stop_signal: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl BlockMonitor {
	pub fn new(source: Arc<dyn BlockSourceInterface>, poll_interval: Duration) -> Self {
		Self {
			source,
			poll_interval,
			is_monitoring: Arc::new(AtomicBool::new(false)),
			stop_signal: Arc::new(Mutex::new(None)),
		}
	}

	pub fn source(&self) -> &Arc<dyn BlockSourceInterface> {
		&self.source
	}

	/// Spawns the polling loop. Every height change is sent on `sender`.
	pub async fn start_monitoring(
		&self,
		sender: mpsc::UnboundedSender<BlockObservation>,
	) -> Result<(), ScannerError> {
		if self.is_monitoring.swap(true, Ordering::SeqCst) {
			return Err(ScannerError::AlreadyMonitoring);
		}

		let (stop_tx, stop_rx) = mpsc::channel(1);
		*self.stop_signal.lock().await = Some(stop_tx);

		let source = self.source.clone();
		let poll_interval = self.poll_interval;
		let is_monitoring = self.is_monitoring.clone();
		tokio::spawn(async move {
			Self::monitoring_loop(source, poll_interval, sender, stop_rx).await;
			is_monitoring.store(false, Ordering::SeqCst);
		});

		info!(?poll_interval, "block monitor started");
		Ok(())
	}

	pub async fn stop_monitoring(&self) -> Result<(), ScannerError> {
		if !self.is_monitoring.load(Ordering::SeqCst) {
			return Ok(());
		}
		if let Some(stop_tx) = self.stop_signal.lock().await.take() {
			let _ = stop_tx.send(()).await;
		}
		self.is_monitoring.store(false, Ordering::SeqCst);
		Ok(())
	}

	async fn monitoring_loop(
		source: Arc<dyn BlockSourceInterface>,
		poll_interval: Duration,
		sender: mpsc::UnboundedSender<BlockObservation>,
		mut stop_rx: mpsc::Receiver<()>,
	) {
		let mut interval = tokio::time::interval(poll_interval);
		let mut previous: Option<u64> = None;

		loop {
			tokio::select! {
				_ = interval.tick() => {
					let height = match source.current_block().await {
						Ok(height) => height,
						Err(e) => {
							error!(error = %e, "failed to read current block");
							continue;
						}
					};

					if previous == Some(height) {
						continue;
					}

					let observation = BlockObservation { height, previous };
					if observation.is_reorg() {
						warn!(height, previous = ?previous, "chain head moved backwards");
					} else {
						debug!(height, "new block observed");
					}
					previous = Some(height);

					if sender.send(observation).is_err() {
						debug!("block receiver dropped, stopping monitor");
						break;
					}
				}
				_ = stop_rx.recv() => {
					break;
				}
			}
		}
	}
}
