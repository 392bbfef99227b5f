//! Slot-lease renewal.
//!
//! The claimed slot key carries a short TTL; the owning node refreshes
//! it at a third of the TTL so that a paused or dead process loses the
//! slot within one TTL and the failure detector can republish it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::warn;

use super::shutdown::ShutdownListener;
use crate::store::{CoordStore, StoreError};

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LeaseOutcome {
    /// The lease could not be refreshed; the slot must be reclaimed.
    Lost,
    /// The runtime is shutting down; stop renewing.
    Shutdown,
}

pub(crate) async fn keep(
    store: Arc<dyn CoordStore>,
    key: &str,
    addr: &str,
    ttl: Duration,
    mut shutdown: ShutdownListener,
) -> LeaseOutcome {
    let mut ticker = tokio::time::interval(ttl / 3);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately, refreshing the just-created lease
    loop {
        tokio::select! {
            _ = shutdown.recv() => return LeaseOutcome::Shutdown,
            _ = ticker.tick() => {
                match store.compare_and_swap(key, Some(addr), addr, Some(ttl)).await {
                    Ok(_) => {}
                    Err(StoreError::Unavailable { message }) => {
                        // keep trying on the same cadence; the TTL is the judge
                        warn!(key, %message, "lease refresh hit unavailable store");
                    }
                    Err(err) => {
                        warn!(key, %err, "slot lease lost");
                        return LeaseOutcome::Lost;
                    }
                }
            }
        }
    }
}
