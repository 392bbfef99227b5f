//! Two-node exchanges over a live store: meta flags, data requests,
//! cross-epoch rejection, and graceful job shutdown.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use cascade_core::controller::{Controller, ControllerConfig};
use cascade_core::store::{CoordStore, MemoryStore};
use cascade_core::topology::TreeTopology;
use cascade_core::{FrameworkHandle, TaskId};

use common::{init_tracing, spawn_node, test_node_config, EchoBuilder, Observed};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

struct Exchange {
    store: Arc<MemoryStore>,
    handles: HashMap<TaskId, FrameworkHandle>,
    observed: HashMap<TaskId, mpsc::UnboundedReceiver<Observed>>,
    exited: mpsc::UnboundedReceiver<TaskId>,
    nodes: Vec<Arc<cascade_core::NodeRuntime>>,
}

/// Bring up a two-task job (0 the parent, 1 its child) on two runtimes.
async fn two_node_exchange(job: &str, data_map: HashMap<String, Vec<u8>>) -> Exchange {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let controller = Controller::new(
        store.clone() as Arc<dyn CoordStore>,
        ControllerConfig::new(job, 2),
    );
    controller.init_layout().await.unwrap();

    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let mut observed = HashMap::new();
    let mut observations = HashMap::new();
    for id in 0..2 {
        let (tx, rx) = mpsc::unbounded_channel();
        observations.insert(id, tx);
        observed.insert(id, rx);
    }
    let builder = Arc::new(EchoBuilder {
        data_map,
        observations,
        ready: ready_tx,
        exited: exit_tx,
    });
    let topology = Arc::new(TreeTopology::new(2, 2));

    let mut nodes = Vec::new();
    for _ in 0..2 {
        nodes.push(spawn_node(
            test_node_config(job),
            store.clone(),
            topology.clone(),
            builder.clone(),
        ));
    }

    let mut handles = HashMap::new();
    for _ in 0..2 {
        let (id, handle) = timeout(RECV_TIMEOUT, ready_rx.recv())
            .await
            .expect("task init")
            .unwrap();
        handles.insert(id, handle);
    }

    Exchange {
        store,
        handles,
        observed,
        exited: exit_rx,
        nodes,
    }
}

async fn next_observed(
    exchange: &mut Exchange,
    id: TaskId,
) -> Observed {
    timeout(RECV_TIMEOUT, exchange.observed.get_mut(&id).unwrap().recv())
        .await
        .expect("observation")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn meta_flags_reach_neighbors_unmodified() {
    let mut exchange = two_node_exchange("meta-exchange", HashMap::new()).await;

    let rounds = [("parent", "child"), ("ParamReady", "GradientReady")];
    for (to_child, to_parent) in rounds {
        exchange.handles[&0].flag_meta_to_child(to_child);
        assert_eq!(
            next_observed(&mut exchange, 1).await,
            Observed::ParentMeta {
                from: 0,
                meta: to_child.to_string()
            }
        );

        exchange.handles[&1].flag_meta_to_parent(to_parent);
        assert_eq!(
            next_observed(&mut exchange, 0).await,
            Observed::ChildMeta {
                from: 1,
                meta: to_parent.to_string()
            }
        );
    }

    exchange.handles[&0].shutdown_job();
    for node in &exchange.nodes {
        node.wait().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn data_requests_round_trip_both_directions() {
    let rounds: Vec<(&str, Vec<u8>)> = vec![
        ("request", b"response".to_vec()),
        ("parameters", vec![1, 2, 3]),
        ("gradient", vec![4, 5, 6]),
    ];
    let data_map: HashMap<String, Vec<u8>> = rounds
        .iter()
        .map(|(req, resp)| (req.to_string(), resp.clone()))
        .collect();
    let mut exchange = two_node_exchange("data-exchange", data_map).await;

    for (req, resp) in rounds {
        // parent pulls from child: served as child, ready as child data
        exchange.handles[&0].data_request(1, req);
        assert_eq!(
            next_observed(&mut exchange, 1).await,
            Observed::Served {
                from: 0,
                req: req.to_string()
            }
        );
        assert_eq!(
            next_observed(&mut exchange, 0).await,
            Observed::ChildData {
                from: 1,
                req: req.to_string(),
                resp: resp.clone()
            }
        );

        // child pulls from parent: mirror-opposite directions
        exchange.handles[&1].data_request(0, req);
        assert_eq!(
            next_observed(&mut exchange, 0).await,
            Observed::Served {
                from: 1,
                req: req.to_string()
            }
        );
        assert_eq!(
            next_observed(&mut exchange, 1).await,
            Observed::ParentData {
                from: 0,
                req: req.to_string(),
                resp
            }
        );
    }

    exchange.handles[&0].shutdown_job();
    for node in &exchange.nodes {
        node.wait().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_epoch_request_is_rejected() {
    init_tracing();
    let job = "epoch-mismatch";
    let store = Arc::new(MemoryStore::new());
    let controller = Controller::new(
        store.clone() as Arc<dyn CoordStore>,
        ControllerConfig::new(job, 1),
    );
    controller.init_layout().await.unwrap();

    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
    let (obs_tx, mut obs_rx) = mpsc::unbounded_channel();
    let builder = Arc::new(EchoBuilder {
        data_map: HashMap::from([("req".to_string(), b"payload".to_vec())]),
        observations: HashMap::from([(0, obs_tx)]),
        ready: ready_tx,
        exited: exit_tx,
    });
    let node = spawn_node(
        test_node_config(job),
        store.clone(),
        Arc::new(TreeTopology::new(1, 1)),
        builder,
    );
    timeout(RECV_TIMEOUT, ready_rx.recv())
        .await
        .expect("task init")
        .unwrap();

    // hit the listener directly with a stale epoch
    let addr = store
        .get(&format!("/{job}/tasks/assigned/0"))
        .await
        .unwrap()
        .value;
    let resp = reqwest::get(format!(
        "http://{addr}/cascade/data?from=0&epoch=10&req=req"
    ))
    .await
    .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_ACCEPTABLE);
    assert_eq!(resp.text().await.unwrap(), "epoch mismatch");

    // no serve callback fired on the task
    assert!(obs_rx.try_recv().is_err());

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_job_exits_every_peer_and_empties_store() {
    let mut exchange = two_node_exchange("graceful-shutdown", HashMap::new()).await;

    exchange.handles[&1].shutdown_job();
    for _ in 0..2 {
        timeout(RECV_TIMEOUT, exchange.exited.recv())
            .await
            .expect("task exit")
            .unwrap();
    }
    for node in &exchange.nodes {
        node.wait().await;
    }

    assert!(exchange
        .store
        .list("/graceful-shutdown")
        .await
        .unwrap()
        .is_empty());
    assert!(exchange.exited.try_recv().is_err());
}
