//! Node runtime lifecycle.
//!
//! `new -> start -> stop`: binding the listener, claiming a free task
//! slot, wiring the watchers and the serialized task driver, keeping the
//! slot lease alive, and rejoining after losing it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::DataClient;
use super::driver::{Driver, TaskEvent};
use super::handle::Command;
use super::server::{self, ServerContext};
use super::{decode_meta, encode_meta, lease, FrameworkHandle, ShutdownSignal, TaskSlot};
use crate::backoff::Backoff;
use crate::error::{CascadeError, Result};
use crate::metrics;
use crate::store::{CoordStore, JobPaths, StoreError, WatchAction};
use crate::task::{Epoch, TaskBuilder, TaskId};
use crate::topology::Topology;
use crate::{
    DEFAULT_LEASE_TTL_SECS, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_WATCH_BACKOFF_MAX_SECS,
    EPOCH_UNCLAIMED,
};

const WATCH_RETRY_INITIAL: Duration = Duration::from_millis(100);

/// Configuration for one node runtime.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Job whose layout this node joins.
    pub job_name: String,
    /// Address the neighbor-data listener binds; port 0 picks a free one.
    pub listen_addr: String,
    /// TTL of the claimed slot key; renewed at a third of this.
    pub lease_ttl: Duration,
    /// Timeout of a single neighbor data request attempt.
    pub request_timeout: Duration,
    /// Cap for watch-reconnect and retry backoff.
    pub watch_backoff_max: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            job_name: "default-job".into(),
            listen_addr: "127.0.0.1:0".into(),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            watch_backoff_max: Duration::from_secs(DEFAULT_WATCH_BACKOFF_MAX_SECS),
        }
    }
}

/// Everything the background streams share.
struct Core {
    config: NodeConfig,
    paths: JobPaths,
    store: Arc<dyn CoordStore>,
    topology: Arc<dyn Topology>,
    builder: Arc<dyn TaskBuilder>,
    epoch: Arc<AtomicU64>,
    slot: TaskSlot,
    shutdown: ShutdownSignal,
}

/// Per-node framework runtime hosting one task.
pub struct NodeRuntime {
    core: Arc<Core>,
    task_id: RwLock<Option<TaskId>>,
    events: RwLock<Option<mpsc::UnboundedSender<TaskEvent>>>,
    streams: Mutex<Vec<JoinHandle<()>>>,
    finished: Arc<Notify>,
    done: Arc<AtomicBool>,
}

impl NodeRuntime {
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn CoordStore>,
        topology: Arc<dyn Topology>,
        builder: Arc<dyn TaskBuilder>,
    ) -> Self {
        let paths = JobPaths::new(&config.job_name);
        Self {
            core: Arc::new(Core {
                config,
                paths,
                store,
                topology,
                builder,
                epoch: Arc::new(AtomicU64::new(EPOCH_UNCLAIMED)),
                slot: Arc::new(RwLock::new(None)),
                shutdown: ShutdownSignal::new(),
            }),
            task_id: RwLock::new(None),
            events: RwLock::new(None),
            streams: Mutex::new(Vec::new()),
            finished: Arc::new(Notify::new()),
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The claimed task id, once bootstrap succeeded.
    pub fn task_id(&self) -> Option<TaskId> {
        *self.task_id.read()
    }

    /// Claim a slot and bring the hosted task up to the current epoch.
    ///
    /// Returns `SlotTaken` when every slot is already owned; no user task
    /// is constructed in that case and nothing keeps running.
    pub async fn start(&self) -> Result<()> {
        let core = self.core.clone();
        let listener = TcpListener::bind(&core.config.listen_addr)
            .await
            .map_err(|err| CascadeError::ListenerBind {
                addr: core.config.listen_addr.clone(),
                reason: err.to_string(),
            })?;
        let addr = listener
            .local_addr()
            .map_err(|err| CascadeError::ListenerBind {
                addr: core.config.listen_addr.clone(),
                reason: err.to_string(),
            })?
            .to_string();

        let task_id = claim_any_slot(&core, &addr).await?;
        *self.task_id.write() = Some(task_id);
        metrics::standard::SLOT_CLAIMS.inc();

        debug_assert!(
            crate::topology::verify_symmetry(core.topology.as_ref(), 0),
            "topology neighbor relation must be symmetric"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.events.write() = Some(event_tx.clone());

        let span =
            tracing::info_span!("task", job = %core.config.job_name, task_id);
        let handle = FrameworkHandle::new(task_id, core.epoch.clone(), command_tx, span);

        // Birth of the hosted task: build, init, then enter the epoch the
        // store currently holds.
        *core.slot.write() = Some(core.builder.build(task_id));
        let (epoch0, epoch_index) = read_epoch(&core).await?;
        let _ = event_tx.send(TaskEvent::Init);
        let _ = event_tx.send(TaskEvent::SetEpoch(epoch0));
        info!(
            job = %core.config.job_name,
            task_id,
            %addr,
            epoch = epoch0,
            "task slot claimed"
        );

        let driver = Driver::new(
            task_id,
            core.slot.clone(),
            handle.clone(),
            core.epoch.clone(),
            core.shutdown.clone(),
        );
        let done = self.done.clone();
        let finished = self.finished.clone();
        self.track(tokio::spawn(async move {
            driver.run(event_rx).await;
            done.store(true, Ordering::SeqCst);
            finished.notify_waiters();
        }));

        let ctx = ServerContext {
            task_id,
            epoch: core.epoch.clone(),
            slot: core.slot.clone(),
            topology: core.topology.clone(),
        };
        self.track(tokio::spawn(server::serve(
            listener,
            ctx,
            core.shutdown.clone(),
        )));

        let client = DataClient::new(
            core.store.clone(),
            core.paths.clone(),
            core.config.request_timeout,
            core.config.watch_backoff_max,
            core.shutdown.clone(),
        )?;
        self.track(tokio::spawn(run_commands(
            core.clone(),
            task_id,
            client,
            command_rx,
            event_tx.clone(),
        )));

        self.track(tokio::spawn(run_epoch_watch(
            core.clone(),
            event_tx.clone(),
            epoch_index + 1,
        )));

        for parent in core.topology.parents(task_id, epoch0) {
            self.track(tokio::spawn(run_meta_watch(
                core.clone(),
                core.paths.meta_to_child(parent),
                parent,
                MetaChannel::FromParent,
                event_tx.clone(),
            )));
        }
        for child in core.topology.children(task_id, epoch0) {
            self.track(tokio::spawn(run_meta_watch(
                core.clone(),
                core.paths.meta_to_parent(child),
                child,
                MetaChannel::FromChild,
                event_tx.clone(),
            )));
        }

        self.track(tokio::spawn(run_lease(core, task_id, addr, event_tx)));
        Ok(())
    }

    /// Tear down the whole job; every peer (including this node) will
    /// observe the prefix deletion, run `exit`, and stop.
    pub async fn shutdown_job(&self) {
        teardown_job(&self.core).await;
    }

    /// Gracefully stop this node only: the hosted task exits, the slot
    /// lease is left to expire, and the job keeps running elsewhere.
    pub async fn stop(&self) {
        let events = self.events.read().clone();
        match events {
            Some(tx) => {
                let _ = tx.send(TaskEvent::Exit);
            }
            None => {
                // never started (or no slot); nothing to drive down
                self.core.shutdown.signal();
                self.done.store(true, Ordering::SeqCst);
                self.finished.notify_waiters();
            }
        }
        self.wait().await;
    }

    /// Abort everything immediately without touching the store: the
    /// crash path. The task gets no `exit`; the lease expires on its own
    /// and the failure detector republishes the slot.
    pub fn kill(&self) {
        self.core.shutdown.signal();
        for stream in self.streams.lock().drain(..) {
            stream.abort();
        }
        *self.core.slot.write() = None;
        self.done.store(true, Ordering::SeqCst);
        self.finished.notify_waiters();
    }

    /// Wait until the hosted task has exited and the driver stopped.
    pub async fn wait(&self) {
        loop {
            let notified = self.finished.notified();
            if self.done.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.streams.lock().push(handle);
    }
}

/// Try free slots in id order until one claim wins.
async fn claim_any_slot(core: &Arc<Core>, addr: &str) -> Result<TaskId> {
    let mut backoff = Backoff::new(WATCH_RETRY_INITIAL, core.config.watch_backoff_max);
    loop {
        let kvs = match core.store.list(&core.paths.free_prefix()).await {
            Ok(kvs) => kvs,
            Err(StoreError::Unavailable { message }) => {
                warn!(%message, "free-slot listing failed, retrying");
                backoff.wait().await;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let mut ids: Vec<TaskId> = kvs.iter().filter_map(|kv| JobPaths::slot_id(&kv.key)).collect();
        ids.sort_unstable();

        let mut retry = false;
        for id in ids {
            match claim_slot(core, id, addr).await {
                Ok(true) => return Ok(id),
                Ok(false) => {}
                Err(err) => {
                    warn!(id, %err, "slot claim hit unavailable store, retrying");
                    retry = true;
                    break;
                }
            }
        }
        if retry {
            backoff.wait().await;
            continue;
        }
        return Err(CascadeError::SlotTaken {
            job: core.config.job_name.clone(),
        });
    }
}

/// Atomically take one specific slot: creating the assigned key is the
/// claim; the free key removal is cleanup.
async fn claim_slot(core: &Arc<Core>, id: TaskId, addr: &str) -> std::result::Result<bool, StoreError> {
    match core
        .store
        .create(&core.paths.assigned_slot(id), addr, Some(core.config.lease_ttl))
        .await
    {
        Ok(_) => {
            match core.store.delete(&core.paths.free_slot(id), false).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => warn!(id, %err, "free-slot cleanup failed"),
            }
            Ok(true)
        }
        Err(StoreError::AlreadyExists { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Read the authoritative epoch; `NotFound` means the job is gone.
async fn read_epoch(core: &Arc<Core>) -> Result<(Epoch, u64)> {
    let mut backoff = Backoff::new(WATCH_RETRY_INITIAL, core.config.watch_backoff_max);
    loop {
        match core.store.get(&core.paths.epoch()).await {
            Ok(kv) => {
                let epoch = kv.value.parse().map_err(|_| CascadeError::Internal {
                    message: format!("malformed epoch value {:?}", kv.value),
                })?;
                return Ok((epoch, kv.index));
            }
            Err(StoreError::NotFound { .. }) => return Err(CascadeError::JobTerminated),
            Err(StoreError::Unavailable { message }) => {
                warn!(%message, "epoch read failed, retrying");
                backoff.wait().await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Handle commands the task enqueues through its handle.
async fn run_commands(
    core: Arc<Core>,
    task_id: TaskId,
    client: DataClient,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TaskEvent>,
) {
    let mut shutdown = core.shutdown.subscribe();
    loop {
        let command = tokio::select! {
            _ = shutdown.recv() => return,
            command = commands.recv() => match command {
                Some(command) => command,
                None => return,
            },
        };
        match command {
            Command::FlagMetaToParent { meta, epoch } => {
                flag_meta(&core, core.paths.meta_to_parent(task_id), &meta, epoch).await;
            }
            Command::FlagMetaToChild { meta, epoch } => {
                flag_meta(&core, core.paths.meta_to_child(task_id), &meta, epoch).await;
            }
            Command::DataRequest { to, req, epoch } => {
                if epoch == EPOCH_UNCLAIMED {
                    warn!(to, %req, "data request before first epoch, dropped");
                    continue;
                }
                if core.epoch.load(Ordering::SeqCst) != epoch {
                    // the epoch advanced since the task asked; purged
                    debug!(to, %req, epoch, "data request overtaken by epoch advance");
                    continue;
                }
                let to_child = core.topology.children(task_id, epoch).contains(&to);
                let to_parent = core.topology.parents(task_id, epoch).contains(&to);
                if !to_child && !to_parent {
                    warn!(to, %req, "data request to non-neighbor, dropped");
                    continue;
                }
                metrics::standard::DATA_REQUESTS_SENT.inc();
                let client = client.clone();
                let events = events.clone();
                let epoch_word = core.epoch.clone();
                tokio::spawn(async move {
                    let Some(resp) = client.fetch(task_id, to, epoch, &epoch_word, &req).await
                    else {
                        return;
                    };
                    let event = if to_child {
                        TaskEvent::ChildData {
                            from: to,
                            epoch,
                            req,
                            resp,
                        }
                    } else {
                        TaskEvent::ParentData {
                            from: to,
                            epoch,
                            req,
                            resp,
                        }
                    };
                    let _ = events.send(event);
                });
            }
            Command::IncEpoch { epoch } => {
                if epoch == EPOCH_UNCLAIMED {
                    continue;
                }
                let core = core.clone();
                tokio::spawn(async move { advance_epoch(&core, epoch).await });
            }
            Command::ShutdownJob => {
                let core = core.clone();
                tokio::spawn(async move { teardown_job(&core).await });
            }
        }
    }
}

/// Publish a meta flag tagged with the issuer's epoch. Flags are ordered
/// per writer, so retries happen inline on the command stream.
async fn flag_meta(core: &Arc<Core>, key: String, meta: &str, epoch: Epoch) {
    if epoch == EPOCH_UNCLAIMED {
        warn!(%key, "meta flagged before first epoch, dropped");
        return;
    }
    let value = encode_meta(epoch, meta);
    let mut shutdown = core.shutdown.subscribe();
    let mut backoff = Backoff::new(WATCH_RETRY_INITIAL, core.config.watch_backoff_max);
    loop {
        match core.store.set(&key, &value, None).await {
            Ok(_) => return,
            Err(StoreError::Unavailable { message }) => {
                warn!(%key, %message, "meta publish failed, retrying");
            }
            Err(err) => {
                warn!(%key, %err, "meta publish failed");
                return;
            }
        }
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = backoff.wait() => {}
        }
    }
}

/// CAS the epoch key forward by one. Task 0 is the sole advancer.
async fn advance_epoch(core: &Arc<Core>, current: Epoch) {
    let key = core.paths.epoch();
    let next = (current + 1).to_string();
    let prev = current.to_string();
    let mut backoff = Backoff::new(WATCH_RETRY_INITIAL, core.config.watch_backoff_max);
    loop {
        match core
            .store
            .compare_and_swap(&key, Some(&prev), &next, None)
            .await
        {
            Ok(_) => {
                info!(from = current, to = current + 1, "epoch advanced");
                return;
            }
            Err(StoreError::Conflict { .. }) => {
                warn!(current, "epoch key moved under the sole advancer");
                return;
            }
            Err(StoreError::NotFound { .. }) => return,
            Err(err) => {
                warn!(%err, "epoch advance failed, retrying");
                backoff.wait().await;
            }
        }
    }
}

/// Delete the job prefix; every runtime observes it and exits.
async fn teardown_job(core: &Arc<Core>) {
    let mut backoff = Backoff::new(WATCH_RETRY_INITIAL, core.config.watch_backoff_max);
    loop {
        match core.store.delete(core.paths.root(), true).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => {
                info!(job = %core.config.job_name, "job prefix deleted");
                return;
            }
            Err(err) => {
                warn!(%err, "job teardown failed, retrying");
                backoff.wait().await;
            }
        }
    }
}

/// Follow the epoch key; its deletion is the job-termination signal.
async fn run_epoch_watch(
    core: Arc<Core>,
    events: mpsc::UnboundedSender<TaskEvent>,
    mut from_index: u64,
) {
    let key = core.paths.epoch();
    let mut shutdown = core.shutdown.subscribe();
    let mut backoff = Backoff::new(WATCH_RETRY_INITIAL, core.config.watch_backoff_max);
    loop {
        let mut stream = match core.store.watch(&key, from_index).await {
            Ok(stream) => {
                backoff.reset();
                stream
            }
            Err(StoreError::IndexCompacted { oldest, .. }) => {
                from_index = oldest;
                continue;
            }
            Err(err) => {
                warn!(%err, "epoch watch failed, retrying");
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = backoff.wait() => {}
                }
                continue;
            }
        };
        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => return,
                event = stream.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            from_index = event.index + 1;
            match event.action {
                WatchAction::Create | WatchAction::Update => {
                    if let Some(value) = &event.new_value {
                        match value.parse() {
                            Ok(epoch) => {
                                let _ = events.send(TaskEvent::SetEpoch(epoch));
                            }
                            Err(_) => warn!(%value, "malformed epoch value, ignoring"),
                        }
                    }
                }
                WatchAction::Delete | WatchAction::Expire => {
                    info!("epoch key gone, job terminated");
                    let _ = events.send(TaskEvent::Exit);
                    return;
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum MetaChannel {
    FromParent,
    FromChild,
}

fn meta_event(channel: MetaChannel, from: TaskId, value: &str) -> Option<TaskEvent> {
    let Some((epoch, meta)) = decode_meta(value) else {
        warn!(from, value, "malformed meta value, ignoring");
        return None;
    };
    Some(match channel {
        MetaChannel::FromParent => TaskEvent::ParentMeta {
            from,
            epoch,
            meta: meta.to_string(),
        },
        MetaChannel::FromChild => TaskEvent::ChildMeta {
            from,
            epoch,
            meta: meta.to_string(),
        },
    })
}

/// Follow one neighbor's meta key: deliver the value already published
/// (so a rejoining node sees current-epoch metas), then stream updates.
async fn run_meta_watch(
    core: Arc<Core>,
    key: String,
    from: TaskId,
    channel: MetaChannel,
    events: mpsc::UnboundedSender<TaskEvent>,
) {
    let mut shutdown = core.shutdown.subscribe();
    let mut backoff = Backoff::new(WATCH_RETRY_INITIAL, core.config.watch_backoff_max);

    let mut from_index = loop {
        // Index first, then read: a write racing the NotFound below lands
        // in the watch replay.
        let latest = match core.store.latest_index().await {
            Ok(index) => index,
            Err(err) => {
                warn!(%err, "store index read failed, retrying");
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = backoff.wait() => {}
                }
                continue;
            }
        };
        match core.store.get(&key).await {
            Ok(kv) => {
                if let Some(event) = meta_event(channel, from, &kv.value) {
                    let _ = events.send(event);
                }
                break kv.index + 1;
            }
            Err(StoreError::NotFound { .. }) => break latest + 1,
            Err(err) => {
                warn!(%err, "meta read failed, retrying");
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = backoff.wait() => {}
                }
            }
        }
    };

    loop {
        let mut stream = match core.store.watch(&key, from_index).await {
            Ok(stream) => {
                backoff.reset();
                stream
            }
            Err(StoreError::IndexCompacted { oldest, .. }) => {
                from_index = oldest;
                continue;
            }
            Err(err) => {
                warn!(%err, "meta watch failed, retrying");
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = backoff.wait() => {}
                }
                continue;
            }
        };
        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => return,
                event = stream.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            from_index = event.index + 1;
            if matches!(event.action, WatchAction::Create | WatchAction::Update) {
                if let Some(value) = &event.new_value {
                    if let Some(event) = meta_event(channel, from, value) {
                        let _ = events.send(event);
                    }
                }
            }
            // meta keys are only deleted at job teardown, which the epoch
            // watcher turns into the exit path
        }
    }
}

/// Keep the slot lease fresh; on loss, reclaim the same id or go idle.
async fn run_lease(
    core: Arc<Core>,
    task_id: TaskId,
    addr: String,
    events: mpsc::UnboundedSender<TaskEvent>,
) {
    let key = core.paths.assigned_slot(task_id);
    let mut backoff = Backoff::new(WATCH_RETRY_INITIAL, core.config.watch_backoff_max);
    loop {
        let outcome = lease::keep(
            core.store.clone(),
            &key,
            &addr,
            core.config.lease_ttl,
            core.shutdown.subscribe(),
        )
        .await;
        if outcome == lease::LeaseOutcome::Shutdown {
            return;
        }

        warn!(task_id, "slot lease lost, attempting to rejoin");
        metrics::standard::SLOT_REJOINS.inc();
        backoff.reset();
        loop {
            // never resurrect a torn-down job
            match core.store.get(&core.paths.epoch()).await {
                Ok(_) => {}
                Err(StoreError::NotFound { .. }) => {
                    let _ = events.send(TaskEvent::Exit);
                    return;
                }
                Err(err) => {
                    debug!(%err, "epoch probe failed during rejoin");
                    backoff.wait().await;
                    continue;
                }
            }
            match claim_slot(&core, task_id, &addr).await {
                Ok(true) => break,
                Ok(false) => {
                    info!(task_id, "slot claimed by another node, going idle");
                    *core.slot.write() = None;
                    let _ = events.send(TaskEvent::Exit);
                    return;
                }
                Err(err) => {
                    warn!(%err, "slot reclaim failed, retrying");
                    backoff.wait().await;
                }
            }
        }

        info!(task_id, "slot reclaimed, rebuilding task");
        *core.slot.write() = Some(core.builder.build(task_id));
        let _ = events.send(TaskEvent::Init);
        let epoch = match read_epoch(&core).await {
            Ok((epoch, _)) => epoch,
            Err(_) => {
                let _ = events.send(TaskEvent::Exit);
                return;
            }
        };
        let _ = events.send(TaskEvent::SetEpoch(epoch));
        redeliver_metas(&core, task_id, epoch, &events).await;
    }
}

/// Re-read neighbor meta keys for a freshly rebuilt task; metas already
/// published at its join epoch are delivered as initial watch results.
async fn redeliver_metas(
    core: &Arc<Core>,
    task_id: TaskId,
    epoch: Epoch,
    events: &mpsc::UnboundedSender<TaskEvent>,
) {
    for parent in core.topology.parents(task_id, epoch) {
        if let Ok(kv) = core.store.get(&core.paths.meta_to_child(parent)).await {
            if let Some(event) = meta_event(MetaChannel::FromParent, parent, &kv.value) {
                let _ = events.send(event);
            }
        }
    }
    for child in core.topology.children(task_id, epoch) {
        if let Ok(kv) = core.store.get(&core.paths.meta_to_parent(child)).await {
            if let Some(event) = meta_event(MetaChannel::FromChild, child, &kv.value) {
                let _ = events.send(event);
            }
        }
    }
}
