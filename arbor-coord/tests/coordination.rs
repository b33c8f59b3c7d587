//! End-to-end coordination scenarios on an in-process overlay tree.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use arbor_coord::executor::mock::{MockExecutor, MockSpawns, MockTask};
use arbor_coord::{topic, Config, Coordinator, Errno, Payload, Rank, RunError};
use arbor_overlay::{ResponseStream, Topology, TreeNet};

const SIGTERM: i32 = 15;

struct Node {
    spawns: MockSpawns,
    _handle: JoinHandle<Result<(), RunError>>,
}

fn spawn_node(net: &mut TreeNet, rank: Rank) -> Node {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (executor, spawns) = MockExecutor::new(events_tx);
    let coordinator = Coordinator::new(net.overlay(rank), executor, events_rx, Config::default());
    Node {
        spawns,
        _handle: tokio::spawn(coordinator.run()),
    }
}

async fn next_reply(stream: &mut ResponseStream) -> Payload {
    timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("timed out waiting for a reply")
        .expect("response stream is open")
        .expect("reply is not an error")
}

async fn next_task(node: &mut Node) -> MockTask {
    timeout(Duration::from_secs(5), node.spawns.next())
        .await
        .expect("timed out waiting for a task spawn")
        .expect("executor is alive")
}

async fn assert_silent(stream: &mut ResponseStream) {
    let extra = timeout(Duration::from_millis(100), stream.recv()).await;
    assert!(extra.is_err(), "unexpected extra reply: {:?}", extra);
}

async fn released(task: &mut MockTask) {
    let line = timeout(Duration::from_secs(5), task.protocol_line())
        .await
        .expect("timed out waiting for barrier release")
        .expect("protocol channel is open");
    assert_eq!(line, "exit=0\n");
}

#[tokio::test]
async fn single_rank_start_runs_to_finish() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::solo(0));
    let mut root = spawn_node(&mut net, 0);
    let client = net.client(0);

    let mut replies = client
        .request(topic::START, json!({ "id": 1, "userid": 42, "ranks": "0" }))
        .expect("request goes out");

    let task = next_task(&mut root).await;
    assert_eq!(task.spec.job, 1);
    assert_eq!(task.spec.args, vec!["1".to_string()]);
    assert_eq!(task.spec.namespace, "job-1");
    assert!(!task.spec.protocol_channel, "single-rank jobs have no barrier channel");

    task.running();
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["type"], "start");

    task.exit(0);
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["type"], "finish");
    assert_eq!(reply["data"]["status"], 0);

    assert_silent(&mut replies).await;
}

#[tokio::test]
async fn start_fans_out_and_aggregates_once() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::kary(3, 2));
    let mut root = spawn_node(&mut net, 0);
    let mut child1 = spawn_node(&mut net, 1);
    let mut child2 = spawn_node(&mut net, 2);
    let client = net.client(0);

    let mut replies = client
        .request(topic::START, json!({ "id": 7, "userid": 42, "ranks": "1-2" }))
        .expect("request goes out");

    let t1 = next_task(&mut child1).await;
    let t2 = next_task(&mut child2).await;
    assert_eq!(t1.spec.job, 7);
    assert!(t1.spec.protocol_channel, "multi-rank jobs get the barrier channel");

    t1.running();
    t2.running();
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["type"], "start");

    t1.exit(0);
    t2.exit(0);
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["type"], "finish");
    assert_eq!(reply["data"]["status"], 0);

    // start and finish each fire exactly once
    assert_silent(&mut replies).await;

    // the root does not host the job
    let spare = timeout(Duration::from_millis(100), root.spawns.next()).await;
    assert!(spare.is_err(), "rank 0 must not launch a task");
}

#[tokio::test]
async fn barrier_releases_every_participant() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::kary(3, 2));
    let mut root = spawn_node(&mut net, 0);
    let mut child1 = spawn_node(&mut net, 1);
    let mut child2 = spawn_node(&mut net, 2);
    let client = net.client(0);

    let mut replies = client
        .request(topic::START, json!({ "id": 3, "userid": 42, "ranks": "0-2" }))
        .expect("request goes out");

    let mut t0 = next_task(&mut root).await;
    let mut t1 = next_task(&mut child1).await;
    let mut t2 = next_task(&mut child2).await;
    t0.running();
    t1.running();
    t2.running();
    assert_eq!(next_reply(&mut replies).await["type"], "start");

    // every task enters; the root is the job's lowest common ancestor
    t1.enter_barrier();
    t2.enter_barrier();
    t0.enter_barrier();
    released(&mut t0).await;
    released(&mut t1).await;
    released(&mut t2).await;

    // the next invocation works the same way under the bumped sequence
    t2.enter_barrier();
    t0.enter_barrier();
    t1.enter_barrier();
    released(&mut t0).await;
    released(&mut t1).await;
    released(&mut t2).await;

    t0.exit(0);
    t1.exit(0);
    t2.exit(0);
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["type"], "finish");
    assert_eq!(reply["data"]["status"], 0);
}

#[tokio::test]
async fn late_child_is_flushed_on_hello() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::kary(3, 2));
    let _root = spawn_node(&mut net, 0);
    let mut child2 = spawn_node(&mut net, 2);
    let client = net.client(0);

    // start before child 1 has said hello
    let mut replies = client
        .request(topic::START, json!({ "id": 4, "userid": 42, "ranks": "1-2" }))
        .expect("request goes out");

    let t2 = next_task(&mut child2).await;
    t2.running();

    // let the responder flush while child 1 is still away, so the update
    // sits in its pending queue
    tokio::time::sleep(Duration::from_millis(60)).await;

    let mut child1 = spawn_node(&mut net, 1);
    let t1 = next_task(&mut child1).await;
    assert_eq!(t1.spec.job, 4);
    t1.running();

    assert_eq!(next_reply(&mut replies).await["type"], "start");

    t1.exit(0);
    t2.exit(0);
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["type"], "finish");
    assert_eq!(reply["data"]["status"], 0);
}

#[tokio::test]
async fn kill_signals_every_hosting_rank() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::kary(3, 2));
    let _root = spawn_node(&mut net, 0);
    let mut child1 = spawn_node(&mut net, 1);
    let mut child2 = spawn_node(&mut net, 2);
    let client = net.client(0);

    let mut replies = client
        .request(topic::START, json!({ "id": 5, "userid": 42, "ranks": "1-2" }))
        .expect("request goes out");

    let mut t1 = next_task(&mut child1).await;
    let mut t2 = next_task(&mut child2).await;
    t1.running();
    t2.running();
    assert_eq!(next_reply(&mut replies).await["type"], "start");

    client
        .send(topic::KILL, json!({ "id": 5, "signal": SIGTERM, "ranks": "1-2" }))
        .expect("kill goes out");

    assert_eq!(t1.signal().await, Some(SIGTERM));
    assert_eq!(t2.signal().await, Some(SIGTERM));

    t1.exit(128 + SIGTERM);
    t2.exit(128 + SIGTERM);
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["type"], "finish");
    assert_eq!(reply["data"]["status"], 128 + SIGTERM);
    assert_silent(&mut replies).await;
}

#[tokio::test]
async fn severity_zero_exception_tears_the_job_down() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::kary(3, 2));
    let _root = spawn_node(&mut net, 0);
    let mut child1 = spawn_node(&mut net, 1);
    let mut child2 = spawn_node(&mut net, 2);
    let client = net.client(0);

    let mut replies = client
        .request(topic::START, json!({ "id": 6, "userid": 42, "ranks": "1-2" }))
        .expect("request goes out");

    let mut t1 = next_task(&mut child1).await;
    let mut t2 = next_task(&mut child2).await;
    t1.running();
    t2.running();
    assert_eq!(next_reply(&mut replies).await["type"], "start");

    // rank 1 raises an exception; it relays through the tree to the root
    net.client(1)
        .send(
            topic::NOTIFY,
            json!({
                "type": "exception",
                "data": { "id": 6, "severity": 0, "type": "exec", "note": "task wedged" },
            }),
        )
        .expect("exception goes out");

    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["type"], "exception");
    assert_eq!(reply["data"]["severity"], 0);
    assert_eq!(reply["data"]["note"], "task wedged");

    // the TERM sweep reaches both hosting ranks
    assert_eq!(t1.signal().await, Some(SIGTERM));
    assert_eq!(t2.signal().await, Some(SIGTERM));

    t1.exit(128 + SIGTERM);
    t2.exit(128 + SIGTERM);
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["type"], "finish");
    assert_eq!(reply["data"]["status"], 128 + SIGTERM);
    assert_silent(&mut replies).await;
}

#[tokio::test]
async fn duplicate_start_fails_eexist_without_disturbing_the_job() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::solo(0));
    let mut root = spawn_node(&mut net, 0);
    let client = net.client(0);

    let mut replies = client
        .request(topic::START, json!({ "id": 9, "userid": 42, "ranks": "0" }))
        .expect("request goes out");
    let task = next_task(&mut root).await;
    task.running();
    assert_eq!(next_reply(&mut replies).await["type"], "start");

    let replay = client
        .request(topic::START, json!({ "id": 9, "userid": 42, "ranks": "0" }))
        .expect("request goes out");
    let err = replay.into_reply().await.expect_err("duplicate is rejected");
    assert_eq!(err.errno, Errno::Exist);

    // the original job is untouched and completes normally
    task.exit(0);
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["type"], "finish");
    assert_eq!(reply["data"]["status"], 0);
}

#[tokio::test]
async fn malformed_start_fails_eproto() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::solo(0));
    let _root = spawn_node(&mut net, 0);
    let client = net.client(0);

    let stream = client
        .request(topic::START, json!({ "id": "one", "ranks": 17 }))
        .expect("request goes out");
    let err = stream.into_reply().await.expect_err("malformed is rejected");
    assert_eq!(err.errno, Errno::Proto);
}

#[tokio::test]
async fn ping_aggregates_across_a_deep_tree() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::kary(7, 2));
    let mut nodes = Vec::new();
    for rank in 0..7 {
        nodes.push(spawn_node(&mut net, rank));
    }
    let client = net.client(0);

    let mut replies = client
        .request(topic::PING, json!({ "ranks": "0-6", "data": {} }))
        .expect("request goes out");
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["ranks"], "0-6");
}

#[tokio::test]
async fn ping_outside_the_subtree_fails_enoent() {
    arbor_test::init();

    let mut net = TreeNet::new(Topology::kary(7, 2));
    let mut nodes = Vec::new();
    for rank in 0..7 {
        nodes.push(spawn_node(&mut net, rank));
    }

    // rank 2's subtree is {2, 5, 6}; rank 3 lives elsewhere
    let stream = net
        .client(2)
        .request(topic::PING, json!({ "ranks": "3", "data": {} }))
        .expect("request goes out");
    let err = stream.into_reply().await.expect_err("out of subtree");
    assert_eq!(err.errno, Errno::NoEnt);

    // a ping within the subtree still works
    let mut replies = net
        .client(2)
        .request(topic::PING, json!({ "ranks": "2,5-6", "data": {} }))
        .expect("request goes out");
    let reply = next_reply(&mut replies).await;
    assert_eq!(reply["ranks"], "2,5-6");
}
