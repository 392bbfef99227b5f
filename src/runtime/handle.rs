//! Framework handle passed to user tasks.
//!
//! Every operation is a non-blocking enqueue onto the runtime's command
//! loop, so tasks may call them from inside any callback without
//! deadlocking the driver stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::task::{Epoch, TaskId};
use crate::EPOCH_UNCLAIMED;

/// Commands the handle enqueues for the runtime. Each carries the epoch
/// observed at call time, which pins the caller's causal context even if
/// the driver advances before the command loop catches up.
#[derive(Debug)]
pub(crate) enum Command {
    FlagMetaToParent { meta: String, epoch: Epoch },
    FlagMetaToChild { meta: String, epoch: Epoch },
    DataRequest { to: TaskId, req: String, epoch: Epoch },
    IncEpoch { epoch: Epoch },
    ShutdownJob,
}

/// The task's face of the framework.
///
/// Cloneable and cheap; a task typically stores the handle it receives
/// in [`Task::init`](crate::task::Task::init).
#[derive(Clone)]
pub struct FrameworkHandle {
    task_id: TaskId,
    epoch: Arc<AtomicU64>,
    commands: mpsc::UnboundedSender<Command>,
    span: tracing::Span,
}

impl FrameworkHandle {
    pub(crate) fn new(
        task_id: TaskId,
        epoch: Arc<AtomicU64>,
        commands: mpsc::UnboundedSender<Command>,
        span: tracing::Span,
    ) -> Self {
        Self {
            task_id,
            epoch,
            commands,
            span,
        }
    }

    /// The task id this runtime claimed.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The runtime's current epoch, or [`crate::EPOCH_UNCLAIMED`] before
    /// the first `set_epoch`.
    pub fn epoch(&self) -> Epoch {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Span carrying the job and task id fields; tasks instrument their
    /// own logging with it.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Publish `meta` towards this task's parent. Non-blocking; the
    /// parent's `child_meta_ready` fires once per distinct value.
    pub fn flag_meta_to_parent(&self, meta: &str) {
        let _ = self.commands.send(Command::FlagMetaToParent {
            meta: meta.to_string(),
            epoch: self.epoch(),
        });
    }

    /// Publish `meta` towards this task's children.
    pub fn flag_meta_to_child(&self, meta: &str) {
        let _ = self.commands.send(Command::FlagMetaToChild {
            meta: meta.to_string(),
            epoch: self.epoch(),
        });
    }

    /// Request `req` from neighbor `to`. The response arrives later as
    /// `child_data_ready` or `parent_data_ready`; a request overtaken by
    /// an epoch advance is dropped without any callback.
    pub fn data_request(&self, to: TaskId, req: &str) {
        let _ = self.commands.send(Command::DataRequest {
            to,
            req: req.to_string(),
            epoch: self.epoch(),
        });
    }

    /// Advance the job to the next epoch.
    ///
    /// Contract: only task 0 calls this. The advance is a single
    /// compare-and-swap on the epoch key; every runtime observes it and
    /// runs `set_epoch` before accepting traffic tagged with the new epoch.
    pub fn inc_epoch(&self) {
        debug_assert_eq!(self.task_id, 0, "only task 0 advances the epoch");
        let _ = self.commands.send(Command::IncEpoch {
            epoch: self.epoch(),
        });
    }

    /// Tear the whole job down: deletes the job prefix, upon which every
    /// runtime calls `exit` on its task and stops.
    pub fn shutdown_job(&self) {
        let _ = self.commands.send(Command::ShutdownJob);
    }

    /// True once the runtime has entered its first epoch.
    pub fn is_running(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) != EPOCH_UNCLAIMED
    }
}
