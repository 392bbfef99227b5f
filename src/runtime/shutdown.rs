//! Runtime-local shutdown signalling.
//!
//! One signal per runtime fans out to the data server, the lease keeper,
//! the watchers, and in-flight data requests. Signalling is sticky: a
//! receiver subscribed after the signal fired still observes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

#[derive(Clone)]
pub(crate) struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn signal(&self) {
        self.fired.store(true, Ordering::SeqCst);
        let _ = self.sender.send(());
    }

    pub(crate) fn is_signalled(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// A receiver that resolves on the (possibly past) signal.
    pub(crate) fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            receiver: self.sender.subscribe(),
            fired: self.fired.clone(),
        }
    }
}

pub(crate) struct ShutdownListener {
    receiver: broadcast::Receiver<()>,
    fired: Arc<AtomicBool>,
}

impl ShutdownListener {
    /// Wait for the signal. Returns immediately if it already fired.
    pub(crate) async fn recv(&mut self) {
        if self.fired.load(Ordering::SeqCst) {
            return;
        }
        // Any outcome of the broadcast (value or closed lag) means we are
        // done waiting; the sticky flag disambiguates spurious wakeups.
        let _ = self.receiver.recv().await;
    }
}
