//! Per-node framework runtime
//!
//! Hosts one task: claims a slot, drives the task through the epoch
//! lifecycle, serves and issues neighbor data exchanges, and rejoins the
//! job after losing its lease.

pub mod node;

mod client;
mod driver;
mod handle;
mod lease;
mod server;
mod shutdown;

pub use handle::FrameworkHandle;
pub use node::{NodeConfig, NodeRuntime};

pub(crate) use shutdown::ShutdownSignal;

use std::sync::Arc;

use crate::task::{Epoch, Task};

/// The task currently hosted by a runtime. Swapped out on rejoin, taken
/// on exit; the data server reads it concurrently with the driver.
pub(crate) type TaskSlot = Arc<parking_lot::RwLock<Option<Arc<dyn Task>>>>;

/// Meta values are stored epoch-tagged so consumers can gate them.
pub(crate) fn encode_meta(epoch: Epoch, meta: &str) -> String {
    format!("{epoch}-{meta}")
}

pub(crate) fn decode_meta(value: &str) -> Option<(Epoch, &str)> {
    let (epoch, meta) = value.split_once('-')?;
    Some((epoch.parse().ok()?, meta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_codec_round_trip() {
        assert_eq!(decode_meta(&encode_meta(3, "ready")), Some((3, "ready")));
        // meta payload may itself contain the separator
        assert_eq!(decode_meta(&encode_meta(0, "a-b-c")), Some((0, "a-b-c")));
        assert_eq!(decode_meta("not-tagged"), None);
        assert_eq!(decode_meta(""), None);
    }
}
