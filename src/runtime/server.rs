//! Neighbor-data HTTP server.
//!
//! One listener per runtime serves the synchronous half of the neighbor
//! exchange: `GET /cascade/data?from=&epoch=&req=`. Requests carrying a
//! different epoch than the local one are rejected with 406 so the
//! requester can drop them silently; everything else is routed to the
//! task's serve callbacks, which are parallel-safe by contract.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error};

use super::{ShutdownSignal, TaskSlot};
use crate::metrics;
use crate::task::TaskId;
use crate::topology::Topology;
use crate::EPOCH_UNCLAIMED;

pub(crate) const DATA_PATH: &str = "/cascade/data";
pub(crate) const EPOCH_MISMATCH_BODY: &str = "epoch mismatch";

#[derive(Debug, Deserialize)]
struct DataQuery {
    from: TaskId,
    epoch: u64,
    req: String,
}

#[derive(Clone)]
pub(crate) struct ServerContext {
    pub(crate) task_id: TaskId,
    pub(crate) epoch: Arc<AtomicU64>,
    pub(crate) slot: TaskSlot,
    pub(crate) topology: Arc<dyn Topology>,
}

pub(crate) fn router(ctx: ServerContext) -> Router {
    Router::new().route(DATA_PATH, get(serve_data)).with_state(ctx)
}

async fn serve_data(State(ctx): State<ServerContext>, Query(query): Query<DataQuery>) -> Response {
    let local = ctx.epoch.load(Ordering::SeqCst);
    if local == EPOCH_UNCLAIMED || query.epoch != local {
        metrics::standard::EPOCH_MISMATCHES.inc();
        debug!(
            from = query.from,
            carried = query.epoch,
            local,
            "rejecting cross-epoch data request"
        );
        return (StatusCode::NOT_ACCEPTABLE, EPOCH_MISMATCH_BODY).into_response();
    }

    let Some(task) = ctx.slot.read().clone() else {
        return (StatusCode::NOT_ACCEPTABLE, EPOCH_MISMATCH_BODY).into_response();
    };

    // Route by the requester's position in the current topology.
    let body = if ctx.topology.children(ctx.task_id, local).contains(&query.from) {
        task.serve_as_parent(query.from, &query.req)
    } else if ctx.topology.parents(ctx.task_id, local).contains(&query.from) {
        task.serve_as_child(query.from, &query.req)
    } else {
        debug!(from = query.from, "data request from non-neighbor");
        None
    };

    match body {
        Some(bytes) => {
            metrics::standard::DATA_REQUESTS_SERVED.inc();
            (StatusCode::OK, bytes).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serve until the runtime's shutdown signal fires; the listener closes
/// with the graceful shutdown.
pub(crate) async fn serve(listener: TcpListener, ctx: ServerContext, shutdown: ShutdownSignal) {
    let mut listener_shutdown = shutdown.subscribe();
    let result = axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move {
            listener_shutdown.recv().await;
        })
        .await;
    if let Err(err) = result {
        error!(%err, "neighbor-data server failed");
    }
}
