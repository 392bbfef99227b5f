//! Shared fixtures: an echo task that mirrors every callback into
//! channels, and the tree-sum job used by the recovery tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use cascade_core::store::CoordStore;
use cascade_core::topology::Topology;
use cascade_core::{Epoch, FrameworkHandle, NodeConfig, NodeRuntime, Task, TaskBuilder, TaskId};

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Node config with timings suited to in-process tests.
pub fn test_node_config(job: &str) -> NodeConfig {
    NodeConfig {
        job_name: job.into(),
        listen_addr: "127.0.0.1:0".into(),
        lease_ttl: Duration::from_millis(800),
        request_timeout: Duration::from_secs(5),
        watch_backoff_max: Duration::from_secs(1),
    }
}

/// Start a runtime on its own task; slot-exhausted starts are fine.
pub fn spawn_node(
    config: NodeConfig,
    store: Arc<dyn CoordStore>,
    topology: Arc<dyn Topology>,
    builder: Arc<dyn TaskBuilder>,
) -> Arc<NodeRuntime> {
    let node = Arc::new(NodeRuntime::new(config, store, topology, builder));
    let running = node.clone();
    tokio::spawn(async move {
        if let Err(err) = running.start().await {
            tracing::info!(%err, "node did not join");
        }
    });
    node
}

/// What an echo task observed, mirrored back to the test body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    ParentMeta { from: TaskId, meta: String },
    ChildMeta { from: TaskId, meta: String },
    Served { from: TaskId, req: String },
    ParentData { from: TaskId, req: String, resp: Vec<u8> },
    ChildData { from: TaskId, req: String, resp: Vec<u8> },
}

/// Builder for [`EchoTask`]s; one observation channel per task id.
pub struct EchoBuilder {
    pub data_map: HashMap<String, Vec<u8>>,
    pub observations: HashMap<TaskId, mpsc::UnboundedSender<Observed>>,
    pub ready: mpsc::UnboundedSender<(TaskId, FrameworkHandle)>,
    pub exited: mpsc::UnboundedSender<TaskId>,
}

impl TaskBuilder for EchoBuilder {
    fn build(&self, task_id: TaskId) -> Arc<dyn Task> {
        Arc::new(EchoTask {
            data_map: self.data_map.clone(),
            out: self.observations[&task_id].clone(),
            ready: self.ready.clone(),
            exited: self.exited.clone(),
            handle: Mutex::new(None),
        })
    }
}

/// Mirrors every framework callback into its observation channel and
/// serves data requests from a fixed map.
pub struct EchoTask {
    data_map: HashMap<String, Vec<u8>>,
    out: mpsc::UnboundedSender<Observed>,
    ready: mpsc::UnboundedSender<(TaskId, FrameworkHandle)>,
    exited: mpsc::UnboundedSender<TaskId>,
    handle: Mutex<Option<(TaskId, FrameworkHandle)>>,
}

impl Task for EchoTask {
    fn init(&self, task_id: TaskId, handle: FrameworkHandle) {
        *self.handle.lock() = Some((task_id, handle));
    }

    // readiness is announced here, not in init: only now will the
    // runtime accept traffic tagged with the current epoch
    fn set_epoch(&self, _epoch: Epoch) {
        if let Some((task_id, handle)) = self.handle.lock().take() {
            let _ = self.ready.send((task_id, handle));
        }
    }

    fn parent_meta_ready(&self, from: TaskId, meta: &str) {
        let _ = self.out.send(Observed::ParentMeta {
            from,
            meta: meta.to_string(),
        });
    }

    fn child_meta_ready(&self, from: TaskId, meta: &str) {
        let _ = self.out.send(Observed::ChildMeta {
            from,
            meta: meta.to_string(),
        });
    }

    fn serve_as_parent(&self, from: TaskId, req: &str) -> Option<Vec<u8>> {
        let _ = self.out.send(Observed::Served {
            from,
            req: req.to_string(),
        });
        self.data_map.get(req).cloned()
    }

    fn serve_as_child(&self, from: TaskId, req: &str) -> Option<Vec<u8>> {
        self.serve_as_parent(from, req)
    }

    fn parent_data_ready(&self, from: TaskId, req: &str, resp: &[u8]) {
        let _ = self.out.send(Observed::ParentData {
            from,
            req: req.to_string(),
            resp: resp.to_vec(),
        });
    }

    fn child_data_ready(&self, from: TaskId, req: &str, resp: &[u8]) {
        let _ = self.out.send(Observed::ChildData {
            from,
            req: req.to_string(),
            resp: resp.to_vec(),
        });
    }

    fn exit(&self) {
        // the task id is not stored; exits are matched by count
        let _ = self.exited.send(0);
    }
}

/// Which callback a [`CrashPlan`] sabotages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    SetEpoch,
    ChildDataReady,
}

/// One-shot crash injection: the chosen task goes silent inside the
/// chosen callback at the chosen epoch and reports itself so the test
/// can kill its host node.
pub struct CrashPlan {
    pub point: CrashPoint,
    pub task: TaskId,
    pub epoch: Epoch,
    fired: AtomicBool,
}

impl CrashPlan {
    pub fn new(point: CrashPoint, task: TaskId, epoch: Epoch) -> Self {
        Self {
            point,
            task,
            epoch,
            fired: AtomicBool::new(false),
        }
    }

    fn triggers(&self, point: CrashPoint, task: TaskId, epoch: Epoch) -> bool {
        self.point == point
            && self.task == task
            && self.epoch == epoch
            && !self.fired.swap(true, Ordering::SeqCst)
    }
}

/// Builder for the tree-sum job: at epoch `e` task `t` contributes
/// `t * e`; sums roll up the tree and the root reports the total.
pub struct TreeSumBuilder {
    pub topology: Arc<dyn Topology>,
    pub iterations: u64,
    pub root_out: mpsc::UnboundedSender<i64>,
    pub crashed: mpsc::UnboundedSender<TaskId>,
    pub exited: mpsc::UnboundedSender<TaskId>,
    pub crash: Option<CrashPlan>,
}

/// Newtype wrapper so [`TaskBuilder`] can be implemented for an
/// `Arc<TreeSumBuilder>` without running afoul of the orphan rule.
pub struct TreeSumBuilderHandle(pub Arc<TreeSumBuilder>);

impl TaskBuilder for TreeSumBuilderHandle {
    fn build(&self, task_id: TaskId) -> Arc<dyn Task> {
        Arc::new(TreeSumTask {
            id: task_id,
            children: self.0.topology.children(task_id, 0),
            iterations: self.0.iterations,
            builder: self.0.clone(),
            handle: Mutex::new(None),
            state: Mutex::new(SumState::default()),
            dead: AtomicBool::new(false),
        })
    }
}

#[derive(Default)]
struct SumState {
    epoch: Epoch,
    pending: HashSet<TaskId>,
    sum: i64,
    complete: bool,
}

pub struct TreeSumTask {
    id: TaskId,
    children: Vec<TaskId>,
    iterations: u64,
    builder: Arc<TreeSumBuilder>,
    handle: Mutex<Option<FrameworkHandle>>,
    state: Mutex<SumState>,
    dead: AtomicBool,
}

impl TreeSumTask {
    fn handle(&self) -> FrameworkHandle {
        self.handle.lock().clone().expect("init ran first")
    }

    fn crash(&self, point: CrashPoint, epoch: Epoch) -> bool {
        let Some(plan) = &self.builder.crash else {
            return false;
        };
        if plan.triggers(point, self.id, epoch) {
            self.dead.store(true, Ordering::SeqCst);
            let _ = self.builder.crashed.send(self.id);
            return true;
        }
        self.dead.load(Ordering::SeqCst)
    }

    /// The subtree sum is in; report upwards or drive the next epoch.
    fn on_complete(&self, epoch: Epoch, sum: i64) {
        if self.id == 0 {
            let _ = self.builder.root_out.send(sum);
            if epoch >= self.iterations {
                self.handle().shutdown_job();
            } else {
                self.handle().inc_epoch();
            }
        } else {
            self.handle().flag_meta_to_parent("ready");
        }
    }
}

impl Task for TreeSumTask {
    fn init(&self, _task_id: TaskId, handle: FrameworkHandle) {
        *self.handle.lock() = Some(handle);
    }

    fn set_epoch(&self, epoch: Epoch) {
        if self.crash(CrashPoint::SetEpoch, epoch) {
            return;
        }
        let complete = {
            let mut state = self.state.lock();
            state.epoch = epoch;
            state.sum = (self.id * epoch) as i64;
            state.pending = self.children.iter().copied().collect();
            state.complete = state.pending.is_empty();
            state.complete
        };
        if complete {
            self.on_complete(epoch, (self.id * epoch) as i64);
        }
    }

    fn parent_meta_ready(&self, _from: TaskId, _meta: &str) {}

    fn child_meta_ready(&self, from: TaskId, _meta: &str) {
        if self.dead.load(Ordering::SeqCst) {
            return;
        }
        self.handle().data_request(from, "sum");
    }

    fn serve_as_parent(&self, _from: TaskId, _req: &str) -> Option<Vec<u8>> {
        None
    }

    fn serve_as_child(&self, _from: TaskId, req: &str) -> Option<Vec<u8>> {
        if req != "sum" {
            return None;
        }
        let state = self.state.lock();
        // not answerable until the subtree finished this epoch
        state.complete.then(|| state.sum.to_le_bytes().to_vec())
    }

    fn parent_data_ready(&self, _from: TaskId, _req: &str, _resp: &[u8]) {}

    fn child_data_ready(&self, from: TaskId, req: &str, resp: &[u8]) {
        let current = self.state.lock().epoch;
        if self.crash(CrashPoint::ChildDataReady, current) {
            return;
        }
        if resp.is_empty() {
            // the child rejoined and is still re-aggregating; ask again
            self.handle().data_request(from, req);
            return;
        }
        let completed = {
            let mut state = self.state.lock();
            if !state.pending.remove(&from) {
                return; // duplicate response, already counted
            }
            let bytes: [u8; 8] = resp.try_into().expect("sum is eight bytes");
            state.sum += i64::from_le_bytes(bytes);
            state.complete = state.pending.is_empty();
            state.complete.then_some((state.epoch, state.sum))
        };
        if let Some((epoch, sum)) = completed {
            self.on_complete(epoch, sum);
        }
    }

    fn exit(&self) {
        let _ = self.builder.exited.send(self.id);
    }
}
