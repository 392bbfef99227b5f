//! k-ary tree topology
//!
//! Task 0 is the root; task `t > 0` hangs under `(t - 1) / k`. The shape
//! is the same at every epoch.

use super::Topology;
use crate::task::{Epoch, TaskId};

/// Complete k-ary tree over `[0, task_count)`.
#[derive(Debug, Clone)]
pub struct TreeTopology {
    fanout: u64,
    task_count: u64,
}

impl TreeTopology {
    /// Create a tree with the given fan-out. `fanout` must be at least 1.
    pub fn new(fanout: u64, task_count: u64) -> Self {
        assert!(fanout >= 1, "tree fanout must be at least 1");
        Self { fanout, task_count }
    }
}

impl Topology for TreeTopology {
    fn task_count(&self) -> u64 {
        self.task_count
    }

    fn parents(&self, task: TaskId, _epoch: Epoch) -> Vec<TaskId> {
        if task == 0 || task >= self.task_count {
            return Vec::new();
        }
        vec![(task - 1) / self.fanout]
    }

    fn children(&self, task: TaskId, _epoch: Epoch) -> Vec<TaskId> {
        let first = self.fanout * task + 1;
        (first..first + self.fanout)
            .filter(|&c| c < self.task_count)
            .collect()
    }
}
