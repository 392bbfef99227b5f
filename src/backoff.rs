//! Capped exponential backoff for store and transport retries.

use std::time::Duration;

pub(crate) struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial,
            max,
        }
    }

    /// Sleep for the current delay, then double it up to the cap.
    pub(crate) async fn wait(&mut self) {
        tokio::time::sleep(self.current).await;
        self.current = (self.current * 2).min(self.max);
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}
