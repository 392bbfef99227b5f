//! Topology abstraction
//!
//! The declarative parent/child relation among task ids at a given epoch.
//! Pure functions, no I/O; the runtime treats implementations as opaque
//! and only relies on the neighbor relation being symmetric.

pub mod tree;

pub use tree::TreeTopology;

use crate::task::{Epoch, TaskId};

/// Parent/child neighbor sets for each task id at each epoch.
pub trait Topology: Send + Sync + 'static {
    /// Number of task slots the job declares.
    fn task_count(&self) -> u64;

    /// Ordered parents of `task` at `epoch`.
    fn parents(&self, task: TaskId, epoch: Epoch) -> Vec<TaskId>;

    /// Ordered children of `task` at `epoch`.
    fn children(&self, task: TaskId, epoch: Epoch) -> Vec<TaskId>;
}

/// Check `u in parents(v) <=> v in children(u)` over every pair at `epoch`.
///
/// Quadratic; meant for debug builds and topology unit tests.
pub fn verify_symmetry(topology: &dyn Topology, epoch: Epoch) -> bool {
    let n = topology.task_count();
    for u in 0..n {
        for v in topology.children(u, epoch) {
            if !topology.parents(v, epoch).contains(&u) {
                return false;
            }
        }
        for p in topology.parents(u, epoch) {
            if !topology.children(p, epoch).contains(&u) {
                return false;
            }
        }
    }
    true
}
