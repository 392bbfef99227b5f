//! Neighbor-data HTTP client.
//!
//! Resolves the target's advertised address through the store, issues
//! the request, and retries transport failures with capped exponential
//! backoff. When the peer's address key disappears (the peer failed),
//! the client blocks on a watch until a replacement publishes a new
//! address. A request overtaken by an epoch advance is abandoned
//! without surfacing anything to the user task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use super::server::DATA_PATH;
use super::ShutdownSignal;
use crate::backoff::Backoff;
use crate::error::CascadeError;
use crate::metrics;
use crate::store::{CoordStore, JobPaths, StoreError, WatchAction};
use crate::task::{Epoch, TaskId};

const RETRY_INITIAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub(crate) struct DataClient {
    http: reqwest::Client,
    store: Arc<dyn CoordStore>,
    paths: JobPaths,
    backoff_max: Duration,
    shutdown: ShutdownSignal,
}

impl DataClient {
    pub(crate) fn new(
        store: Arc<dyn CoordStore>,
        paths: JobPaths,
        request_timeout: Duration,
        backoff_max: Duration,
        shutdown: ShutdownSignal,
    ) -> Result<Self, CascadeError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| CascadeError::Internal {
                message: format!("http client construction failed: {err}"),
            })?;
        Ok(Self {
            http,
            store,
            paths,
            backoff_max,
            shutdown,
        })
    }

    /// Fetch `req` from task `to` on behalf of `from` at `epoch`.
    ///
    /// `Some(bytes)` is the successful response (empty when the peer did
    /// not recognize the request key); `None` means the request was
    /// dropped - epoch advanced, epoch mismatch at the peer, or shutdown.
    pub(crate) async fn fetch(
        &self,
        from: TaskId,
        to: TaskId,
        epoch: Epoch,
        epoch_word: &AtomicU64,
        req: &str,
    ) -> Option<Vec<u8>> {
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = Backoff::new(RETRY_INITIAL, self.backoff_max);
        loop {
            if epoch_word.load(Ordering::SeqCst) != epoch || self.shutdown.is_signalled() {
                return None;
            }
            let addr = self.resolve_address(to, epoch, epoch_word).await?;
            let url = format!("http://{addr}{DATA_PATH}");
            let request = self.http.get(&url).query(&[
                ("from", from.to_string()),
                ("epoch", epoch.to_string()),
                ("req", req.to_string()),
            ]);

            let outcome = tokio::select! {
                _ = shutdown.recv() => return None,
                resp = request.send() => resp,
            };
            match outcome {
                Ok(resp) if resp.status() == StatusCode::OK => match resp.bytes().await {
                    Ok(body) => return Some(body.to_vec()),
                    Err(err) => debug!(to, %err, "response body read failed, retrying"),
                },
                Ok(resp) if resp.status() == StatusCode::NOT_ACCEPTABLE => {
                    metrics::standard::EPOCH_MISMATCHES.inc();
                    debug!(to, epoch, "peer rejected epoch, dropping request");
                    return None;
                }
                // The peer does not recognize the request key; surfaced to
                // the user as an empty response.
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => return Some(Vec::new()),
                Ok(resp) => debug!(to, status = %resp.status(), "unexpected status, retrying"),
                Err(err) => debug!(to, %err, "peer unreachable, retrying"),
            }
            tokio::select! {
                _ = shutdown.recv() => return None,
                _ = backoff.wait() => {}
            }
        }
    }

    /// Look up the peer's advertised address, blocking on a watch while
    /// the peer is down and its slot key is absent.
    async fn resolve_address(
        &self,
        to: TaskId,
        epoch: Epoch,
        epoch_word: &AtomicU64,
    ) -> Option<String> {
        let key = self.paths.assigned_slot(to);
        let mut backoff = Backoff::new(RETRY_INITIAL, self.backoff_max);
        loop {
            if epoch_word.load(Ordering::SeqCst) != epoch || self.shutdown.is_signalled() {
                return None;
            }
            // Index first, then read: a publish racing the NotFound below
            // lands in the watch replay.
            let from_index = match self.store.latest_index().await {
                Ok(index) => index + 1,
                Err(err) => {
                    debug!(%err, "store index read failed, retrying");
                    backoff.wait().await;
                    continue;
                }
            };
            match self.store.get(&key).await {
                Ok(kv) => return Some(kv.value),
                Err(StoreError::NotFound { .. }) => {
                    warn!(to, "peer address missing, waiting for republication");
                    if let Some(addr) = self.await_address(&key, from_index, epoch, epoch_word).await {
                        return Some(addr);
                    }
                    // watch lost or epoch moved on; re-evaluate
                }
                Err(err) => {
                    debug!(%err, "peer address lookup failed, retrying");
                    backoff.wait().await;
                }
            }
        }
    }

    async fn await_address(
        &self,
        key: &str,
        from_index: u64,
        epoch: Epoch,
        epoch_word: &AtomicU64,
    ) -> Option<String> {
        let mut shutdown = self.shutdown.subscribe();
        let mut stream = match self.store.watch(key, from_index).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(%err, "address watch failed");
                return None;
            }
        };
        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => return None,
                event = stream.recv() => event?,
                _ = tokio::time::sleep(Duration::from_millis(250)) => {
                    if epoch_word.load(Ordering::SeqCst) != epoch {
                        return None;
                    }
                    continue;
                }
            };
            if matches!(event.action, WatchAction::Create | WatchAction::Update) {
                if let Some(addr) = event.new_value {
                    return Some(addr);
                }
            }
        }
    }
}
