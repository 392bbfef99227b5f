//! Task and task-builder contracts
//!
//! A task is one logical unit of the distributed computation. The runtime
//! drives it through a single-threaded event stream: `init`, `set_epoch`,
//! the meta/data notifications, and `exit` are never invoked concurrently.
//! Only `serve_as_parent` and `serve_as_child` may run in parallel with the
//! stream (and with each other); they are expected to read stable per-epoch
//! state, which is why the whole contract takes `&self` and implementations
//! keep their mutable state behind interior mutability.

use std::sync::Arc;

use crate::runtime::FrameworkHandle;

/// Stable identifier of a logical task within a job, in `[0, task_count)`
pub type TaskId = u64;

/// Globally monotonic iteration counter, advanced only by task 0
pub type Epoch = u64;

/// User-implemented task logic hosted by a node runtime.
///
/// The runtime constructs a task when its slot is claimed, calls `init`
/// exactly once, then `set_epoch` once per epoch in strictly increasing
/// order. After a node crash the replacement task starts over with `init`
/// followed by `set_epoch(current)` - earlier epochs are never replayed,
/// so per-epoch work must be idempotent.
pub trait Task: Send + Sync + 'static {
    /// Called once after the slot is claimed, before any other callback.
    fn init(&self, task_id: TaskId, handle: FrameworkHandle);

    /// Called when the job enters `epoch`, before any event tagged with it.
    fn set_epoch(&self, epoch: Epoch);

    /// A parent flagged meta towards its children.
    fn parent_meta_ready(&self, from: TaskId, meta: &str);

    /// A child flagged meta towards its parent.
    fn child_meta_ready(&self, from: TaskId, meta: &str);

    /// Serve a data request issued by one of this task's children.
    ///
    /// May run concurrently with the event stream. `None` means the request
    /// key is not recognized; the requester sees an empty response.
    fn serve_as_parent(&self, from: TaskId, req: &str) -> Option<Vec<u8>>;

    /// Serve a data request issued by this task's parent.
    ///
    /// Same concurrency and `None` semantics as [`Task::serve_as_parent`].
    fn serve_as_child(&self, from: TaskId, req: &str) -> Option<Vec<u8>>;

    /// A data request towards a parent completed.
    fn parent_data_ready(&self, from: TaskId, req: &str, resp: &[u8]);

    /// A data request towards a child completed.
    fn child_data_ready(&self, from: TaskId, req: &str, resp: &[u8]);

    /// Called exactly once on graceful job shutdown. Not called after a crash.
    fn exit(&self);
}

/// Factory producing a fresh task object for a claimed slot.
///
/// The same builder is reused when a node rejoins after losing its lease,
/// so it must not assume it is called once per task id.
pub trait TaskBuilder: Send + Sync + 'static {
    /// Build the task playing `task_id`.
    fn build(&self, task_id: TaskId) -> Arc<dyn Task>;
}
