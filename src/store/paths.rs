//! Typed path schema under the job-scoped store prefix.
//!
//! Layout:
//!
//! ```text
//! /{job}/epoch                     current epoch, integer-as-string
//! /{job}/tasks/free/{id}           presence means the slot is free
//! /{job}/tasks/assigned/{id}       TTL lease, value = owner's host:port
//! /{job}/tasks/{id}/meta/parent    meta flagged by {id} towards its parent
//! /{job}/tasks/{id}/meta/child     meta flagged by {id} towards its children
//! ```

use crate::task::TaskId;

/// Path builder for one job's keys.
#[derive(Debug, Clone)]
pub struct JobPaths {
    root: String,
}

impl JobPaths {
    pub fn new(job: &str) -> Self {
        Self {
            root: format!("/{job}"),
        }
    }

    /// The job prefix itself; deleting it recursively tears the job down.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn epoch(&self) -> String {
        format!("{}/epoch", self.root)
    }

    pub fn free_prefix(&self) -> String {
        format!("{}/tasks/free", self.root)
    }

    pub fn free_slot(&self, id: TaskId) -> String {
        format!("{}/tasks/free/{id}", self.root)
    }

    pub fn assigned_prefix(&self) -> String {
        format!("{}/tasks/assigned", self.root)
    }

    pub fn assigned_slot(&self, id: TaskId) -> String {
        format!("{}/tasks/assigned/{id}", self.root)
    }

    /// Key a task writes when flagging meta towards its parent.
    pub fn meta_to_parent(&self, id: TaskId) -> String {
        format!("{}/tasks/{id}/meta/parent", self.root)
    }

    /// Key a task writes when flagging meta towards its children.
    pub fn meta_to_child(&self, id: TaskId) -> String {
        format!("{}/tasks/{id}/meta/child", self.root)
    }

    /// Parse the task id out of a slot key (free or assigned).
    pub fn slot_id(key: &str) -> Option<TaskId> {
        key.rsplit('/').next()?.parse().ok()
    }
}
