//! Per-job controller
//!
//! Sets up the coordination layout before any node starts and turns
//! store-level lease disappearance into framework-level recovery: a
//! vanished assigned-slot key is republished as free, and the
//! deployment layer is asked for a node when the fleet has no spare.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::error::{CascadeError, Result};
use crate::runtime::ShutdownSignal;
use crate::store::{CoordStore, JobPaths, StoreError, WatchAction};
use crate::task::TaskId;
use crate::DEFAULT_WATCH_BACKOFF_MAX_SECS;

/// Configuration for one job's controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub job_name: String,
    /// Number of task slots the job declares.
    pub task_count: u64,
    /// Cap for the failure detector's watch-restart backoff.
    pub watch_backoff_max: Duration,
}

impl ControllerConfig {
    pub fn new(job_name: impl Into<String>, task_count: u64) -> Self {
        Self {
            job_name: job_name.into(),
            task_count,
            watch_backoff_max: Duration::from_secs(DEFAULT_WATCH_BACKOFF_MAX_SECS),
        }
    }
}

/// Job-singleton controller: layout bootstrap plus failure detection.
pub struct Controller {
    config: ControllerConfig,
    store: Arc<dyn CoordStore>,
    paths: JobPaths,
    shutdown: ShutdownSignal,
    detector: Mutex<Option<JoinHandle<()>>>,
    node_requests_tx: mpsc::UnboundedSender<TaskId>,
    node_requests_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskId>>>,
}

impl Controller {
    pub fn new(store: Arc<dyn CoordStore>, config: ControllerConfig) -> Self {
        let paths = JobPaths::new(&config.job_name);
        let (node_requests_tx, node_requests_rx) = mpsc::unbounded_channel();
        Self {
            config,
            store,
            paths,
            shutdown: ShutdownSignal::new(),
            detector: Mutex::new(None),
            node_requests_tx,
            node_requests_rx: Mutex::new(Some(node_requests_rx)),
        }
    }

    /// The out-of-band "need node" channel: one task id per freed slot.
    /// The deployment layer consumes it; can be taken once.
    pub fn node_requests(&self) -> Option<mpsc::UnboundedReceiver<TaskId>> {
        self.node_requests_rx.lock().take()
    }

    /// Create the job layout: the epoch key at 0 and one free key per
    /// task slot. Finding any of them present aborts - the job is
    /// already running.
    pub async fn init_layout(&self) -> Result<()> {
        let already_running = |err: StoreError| match err {
            StoreError::AlreadyExists { .. } => CascadeError::JobAlreadyRunning {
                job: self.config.job_name.clone(),
            },
            other => other.into(),
        };

        self.store
            .create(&self.paths.epoch(), "0", None)
            .await
            .map_err(already_running)?;
        for id in 0..self.config.task_count {
            self.store
                .create(&self.paths.free_slot(id), "", None)
                .await
                .map_err(already_running)?;
        }
        info!(
            job = %self.config.job_name,
            task_count = self.config.task_count,
            "job layout initialized"
        );
        Ok(())
    }

    /// Initialize the layout and spawn the failure detector.
    pub async fn start(&self) -> Result<()> {
        self.init_layout().await?;
        let detector = tokio::spawn(run_failure_detection(
            self.store.clone(),
            self.paths.clone(),
            self.node_requests_tx.clone(),
            self.shutdown.clone(),
            self.config.watch_backoff_max,
        ));
        *self.detector.lock() = Some(detector);
        Ok(())
    }

    /// Stop the detector and tear the job prefix down. Idempotent.
    pub async fn stop(&self) {
        self.shutdown.signal();
        let detector = self.detector.lock().take();
        if let Some(detector) = detector {
            let _ = detector.await;
        }
        match self.store.delete(self.paths.root(), true).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => {}
            Err(err) => warn!(%err, "job prefix teardown failed"),
        }
        info!(job = %self.config.job_name, "controller stopped");
    }
}

/// Watch the assigned-slot prefix; a deleted or expired lease means the
/// owning node died, so the slot is republished as free and a
/// replacement node is requested.
async fn run_failure_detection(
    store: Arc<dyn CoordStore>,
    paths: JobPaths,
    node_requests: mpsc::UnboundedSender<TaskId>,
    shutdown: ShutdownSignal,
    backoff_max: Duration,
) {
    let prefix = paths.assigned_prefix();
    let mut listener = shutdown.subscribe();
    let mut backoff = Backoff::new(Duration::from_millis(100), backoff_max);

    // Slots claimed before this point are watched from here on; the TTL
    // guarantees their leases cannot have silently vanished earlier.
    let mut from_index = loop {
        match store.latest_index().await {
            Ok(index) => break index + 1,
            Err(err) => {
                warn!(%err, "store index read failed, retrying");
                tokio::select! {
                    _ = listener.recv() => return,
                    _ = backoff.wait() => {}
                }
            }
        }
    };

    loop {
        let mut stream = match store.watch(&prefix, from_index).await {
            Ok(stream) => {
                backoff.reset();
                stream
            }
            Err(StoreError::IndexCompacted { oldest, .. }) => {
                from_index = oldest;
                continue;
            }
            Err(err) => {
                warn!(%err, "failure-detection watch failed, retrying");
                tokio::select! {
                    _ = listener.recv() => return,
                    _ = backoff.wait() => {}
                }
                continue;
            }
        };
        loop {
            let event = tokio::select! {
                _ = listener.recv() => return,
                event = stream.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            from_index = event.index + 1;
            if !matches!(event.action, WatchAction::Delete | WatchAction::Expire) {
                continue;
            }
            let Some(id) = JobPaths::slot_id(&event.key) else {
                continue;
            };
            // A vanished lease during teardown is not a failure.
            match store.get(&paths.epoch()).await {
                Ok(_) => {}
                Err(StoreError::NotFound { .. }) => {
                    info!("job torn down, failure detection ending");
                    return;
                }
                Err(err) => warn!(%err, "epoch probe failed, assuming job alive"),
            }
            warn!(task_id = id, "task lease vanished, freeing slot");
            match store.create(&paths.free_slot(id), "", None).await {
                Ok(_) | Err(StoreError::AlreadyExists { .. }) => {}
                Err(err) => {
                    warn!(task_id = id, %err, "slot republication failed");
                    continue;
                }
            }
            let _ = node_requests.send(id);
        }
    }
}
