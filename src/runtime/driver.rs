//! Serialized user-task event driver.
//!
//! One driver task per runtime consumes a single event channel, which is
//! what makes `init`, `set_epoch`, the meta/data notifications, and
//! `exit` mutually exclusive from the task author's point of view.
//!
//! The driver also enforces the epoch contract: events tagged with a
//! future epoch are held (at most one pending meta per peer and
//! direction, since the writer overwrites its meta key every epoch),
//! stale events are dropped, and `set_epoch` is strictly monotone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{FrameworkHandle, ShutdownSignal, TaskSlot};
use crate::metrics;
use crate::task::{Epoch, Task, TaskId};
use crate::EPOCH_UNCLAIMED;

/// Events flowing into the driver from watchers, the data client, and
/// the bootstrap/rejoin paths.
#[derive(Debug)]
pub(crate) enum TaskEvent {
    /// A (re)built task occupies the slot; run `init` and reset gating state.
    Init,
    SetEpoch(Epoch),
    ParentMeta {
        from: TaskId,
        epoch: Epoch,
        meta: String,
    },
    ChildMeta {
        from: TaskId,
        epoch: Epoch,
        meta: String,
    },
    ParentData {
        from: TaskId,
        epoch: Epoch,
        req: String,
        resp: Vec<u8>,
    },
    ChildData {
        from: TaskId,
        epoch: Epoch,
        req: String,
        resp: Vec<u8>,
    },
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MetaDirection {
    FromParent,
    FromChild,
}

pub(crate) struct Driver {
    task_id: TaskId,
    slot: TaskSlot,
    handle: FrameworkHandle,
    epoch: Arc<AtomicU64>,
    shutdown: ShutdownSignal,
    pending_meta: HashMap<(TaskId, MetaDirection), (Epoch, String)>,
    delivered_meta: HashMap<(TaskId, MetaDirection), (Epoch, String)>,
}

impl Driver {
    pub(crate) fn new(
        task_id: TaskId,
        slot: TaskSlot,
        handle: FrameworkHandle,
        epoch: Arc<AtomicU64>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            task_id,
            slot,
            handle,
            epoch,
            shutdown,
            pending_meta: HashMap::new(),
            delivered_meta: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<TaskEvent>) {
        while let Some(event) = events.recv().await {
            if self.dispatch(event) {
                return;
            }
        }
    }

    fn current_task(&self) -> Option<Arc<dyn Task>> {
        self.slot.read().clone()
    }

    /// Handle one event; returns true when the driver is done.
    fn dispatch(&mut self, event: TaskEvent) -> bool {
        match event {
            TaskEvent::Init => {
                self.epoch.store(EPOCH_UNCLAIMED, Ordering::SeqCst);
                self.pending_meta.clear();
                self.delivered_meta.clear();
                if let Some(task) = self.current_task() {
                    task.init(self.task_id, self.handle.clone());
                }
            }
            TaskEvent::SetEpoch(epoch) => self.enter_epoch(epoch),
            TaskEvent::ParentMeta { from, epoch, meta } => {
                self.on_meta(from, epoch, meta, MetaDirection::FromParent)
            }
            TaskEvent::ChildMeta { from, epoch, meta } => {
                self.on_meta(from, epoch, meta, MetaDirection::FromChild)
            }
            TaskEvent::ParentData {
                from,
                epoch,
                req,
                resp,
            } => {
                if epoch == self.epoch.load(Ordering::SeqCst) {
                    if let Some(task) = self.current_task() {
                        task.parent_data_ready(from, &req, &resp);
                    }
                } else {
                    debug!(from, epoch, %req, "dropping cross-epoch parent data");
                }
            }
            TaskEvent::ChildData {
                from,
                epoch,
                req,
                resp,
            } => {
                if epoch == self.epoch.load(Ordering::SeqCst) {
                    if let Some(task) = self.current_task() {
                        task.child_data_ready(from, &req, &resp);
                    }
                } else {
                    debug!(from, epoch, %req, "dropping cross-epoch child data");
                }
            }
            TaskEvent::Exit => {
                let task = self.slot.write().take();
                self.epoch.store(EPOCH_UNCLAIMED, Ordering::SeqCst);
                if let Some(task) = task {
                    info!(task_id = self.task_id, "task exiting");
                    task.exit();
                }
                self.shutdown.signal();
                return true;
            }
        }
        false
    }

    fn enter_epoch(&mut self, epoch: Epoch) {
        let current = self.epoch.load(Ordering::SeqCst);
        if current != EPOCH_UNCLAIMED && epoch <= current {
            debug!(epoch, current, "ignoring non-advancing epoch");
            return;
        }
        self.epoch.store(epoch, Ordering::SeqCst);
        metrics::standard::CURRENT_EPOCH.set(epoch as i64);
        let Some(task) = self.current_task() else {
            return;
        };
        info!(task_id = self.task_id, epoch, "entering epoch");
        task.set_epoch(epoch);

        // Release metas that were waiting for this epoch; anything older
        // was superseded by its writer and is dropped.
        let ready: Vec<(TaskId, MetaDirection, String)> = self
            .pending_meta
            .iter()
            .filter(|(_, (e, _))| *e == epoch)
            .map(|((from, dir), (_, meta))| (*from, *dir, meta.clone()))
            .collect();
        self.pending_meta.retain(|_, (e, _)| *e > epoch);
        for (from, direction, meta) in ready {
            self.deliver_meta(from, direction, epoch, meta);
        }
    }

    fn on_meta(&mut self, from: TaskId, tagged: Epoch, meta: String, direction: MetaDirection) {
        let current = self.epoch.load(Ordering::SeqCst);
        if current == EPOCH_UNCLAIMED || tagged > current {
            // Held until the receiver reaches the writer's epoch; the key
            // is overwritten per epoch, so one slot per peer suffices.
            self.pending_meta.insert((from, direction), (tagged, meta));
        } else if tagged == current {
            self.deliver_meta(from, direction, tagged, meta);
        } else {
            debug!(from, tagged, current, "dropping stale meta");
        }
    }

    fn deliver_meta(&mut self, from: TaskId, direction: MetaDirection, epoch: Epoch, meta: String) {
        // The store watch and the rejoin re-read may both surface the same
        // value; notify once per distinct (peer, direction, value).
        if self
            .delivered_meta
            .get(&(from, direction))
            .is_some_and(|seen| seen.0 == epoch && seen.1 == meta)
        {
            debug!(from, epoch, "suppressing duplicate meta");
            return;
        }
        let Some(task) = self.current_task() else {
            return;
        };
        match direction {
            MetaDirection::FromParent => task.parent_meta_ready(from, &meta),
            MetaDirection::FromChild => task.child_meta_ready(from, &meta),
        }
        self.delivered_meta.insert((from, direction), (epoch, meta));
    }
}
