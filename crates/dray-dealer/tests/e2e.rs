//! End-to-end scenarios: a dealer talking to stub workers discovered
//! through a stub node.

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dray_dealer::{
    code, Dealer, MessagePath, MessagePolicy, Response, ResponseCode, ResponseSink,
};
use dray_testkit::{CollectingSink, NodeSpec, ReplyScript, StubNode, StubWorker};
use tempfile::TempDir;

const APP: &str = "app_a";
const SERVICE: &str = "svc";
const HANDLE: &str = "h";

struct Fixture {
    dir: TempDir,
    node: StubNode,
    config_path: PathBuf,
}

impl Fixture {
    fn new(spec: NodeSpec, cache_kind: &str) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let node = StubNode::spawn(spec);

        let hosts_path = dir.path().join("hosts");
        std::fs::write(&hosts_path, format!("{}\n", node.address())).expect("hosts file");

        let config_path = dir.path().join("dealer.json");
        write_config(&config_path, &hosts_path, dir.path(), cache_kind);

        Fixture {
            dir,
            node,
            config_path,
        }
    }

    fn dealer(&self) -> Dealer {
        Dealer::new(&self.config_path).expect("dealer")
    }
}

fn write_config(config_path: &Path, hosts_path: &Path, root: &Path, cache_kind: &str) {
    let config = serde_json::json!({
        "version": 1,
        "message_cache": { "type": cache_kind },
        "persistent_storage": {
            "eblob_path": root.join("blobs"),
            "eblob_sync_interval": 1
        },
        "services": {
            SERVICE: {
                "description": "end to end test service",
                "app": APP,
                "autodiscovery": { "source": hosts_path, "type": "FILE" }
            }
        }
    });
    std::fs::write(config_path, serde_json::to_string_pretty(&config).unwrap())
        .expect("config file");
}

fn path() -> MessagePath {
    MessagePath::new(SERVICE, HANDLE)
}

fn policy(timeout_ms: u64, deadline_ms: u64, retries: u32) -> MessagePolicy {
    MessagePolicy {
        timeout: Duration::from_millis(timeout_ms),
        deadline: Duration::from_millis(deadline_ms),
        max_timeout_retries: retries,
        ..Default::default()
    }
}

// The dealer only holds the sink weakly; the caller keeps the returned Arc
// alive for as long as it wants callbacks.
fn send(
    dealer: &Dealer,
    payload: &[u8],
    policy: MessagePolicy,
) -> (String, Receiver<Response>, Arc<dyn ResponseSink>) {
    let message = dealer
        .create_message(path(), policy, Bytes::copy_from_slice(payload))
        .expect("create message");
    let (sink, rx) = CollectingSink::channel();
    let sink: Arc<dyn ResponseSink> = sink;
    let uuid = dealer.send_message(message, &sink).expect("send message");
    (uuid, rx, sink)
}

fn wait_until(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < timeout, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn recv_event(rx: &Receiver<Response>, timeout: Duration) -> Response {
    rx.recv_timeout(timeout).expect("response event")
}

#[test]
fn happy_chunk_then_choke() {
    let worker = StubWorker::spawn("node-a/h", ReplyScript::EchoReversed, 0);
    let fixture = Fixture::new(
        NodeSpec::single_app(APP, &[(HANDLE, worker.address(), worker.route())]),
        "RAM_ONLY",
    );
    let dealer = fixture.dealer();

    let (uuid, rx, _sink) = send(&dealer, b"hello", policy(1000, 5000, 0));

    let event = recv_event(&rx, Duration::from_secs(10));
    assert_eq!(event.uuid, uuid);
    assert_eq!(event.code, ResponseCode::Chunk);
    assert_eq!(event.payload.as_ref(), b"olleh");

    let event = recv_event(&rx, Duration::from_secs(5));
    assert_eq!(event.code, ResponseCode::Choke);

    wait_until("cache to drain", Duration::from_secs(2), || {
        dealer.queue_counts(&path()) == Some((0, 0))
    });
}

#[test]
fn retry_then_request_error() {
    let worker = StubWorker::spawn("node-a/h", ReplyScript::Silent, 0);
    let fixture = Fixture::new(
        NodeSpec::single_app(APP, &[(HANDLE, worker.address(), worker.route())]),
        "RAM_ONLY",
    );
    let dealer = fixture.dealer();

    let (uuid, rx, _sink) = send(&dealer, b"ping", policy(100, 0, 2));

    let event = recv_event(&rx, Duration::from_secs(10));
    assert_eq!(event.uuid, uuid);
    assert_eq!(event.code, ResponseCode::Error);
    let (error_code, error_message) = event.error.expect("error payload");
    assert_eq!(error_code, code::REQUEST);
    assert_eq!(error_message, "server did not reply with ack in time");

    // The original attempt plus two retries reached the worker.
    assert_eq!(worker.received_count(), 3);
}

#[test]
fn deadline_beats_retries() {
    let worker = StubWorker::spawn("node-a/h", ReplyScript::Silent, 0);
    let fixture = Fixture::new(
        NodeSpec::single_app(APP, &[(HANDLE, worker.address(), worker.route())]),
        "RAM_ONLY",
    );
    let dealer = fixture.dealer();

    let (uuid, rx, _sink) = send(&dealer, b"ping", policy(10_000, 200, 10));

    let event = recv_event(&rx, Duration::from_secs(10));
    assert_eq!(event.uuid, uuid);
    assert_eq!(event.code, ResponseCode::Error);
    assert_eq!(event.error.expect("error payload").0, code::DEADLINE);

    wait_until("cache to drain", Duration::from_secs(2), || {
        dealer.queue_counts(&path()) == Some((0, 0))
    });
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn endpoint_swap_requeues_and_completes() {
    let silent = StubWorker::spawn("node-a/h1", ReplyScript::Silent, 0);
    let echo = StubWorker::spawn("node-b/h1", ReplyScript::EchoReversed, 0);

    let fixture = Fixture::new(
        NodeSpec::single_app(APP, &[(HANDLE, silent.address(), silent.route())]),
        "RAM_ONLY",
    );
    let dealer = fixture.dealer();

    let (uuid, rx, _sink) = send(&dealer, b"hello", policy(30_000, 0, 0));

    wait_until("first endpoint to see the message", Duration::from_secs(10), || {
        silent.received_count() == 1
    });

    // The heartbeat now reports only the second endpoint; the socket is
    // rebuilt and the in-flight message is requeued and resent.
    fixture.node.set_spec(NodeSpec::single_app(
        APP,
        &[(HANDLE, echo.address(), echo.route())],
    ));

    let event = recv_event(&rx, Duration::from_secs(10));
    assert_eq!(event.uuid, uuid);
    assert_eq!(event.code, ResponseCode::Chunk);
    assert_eq!(event.payload.as_ref(), b"olleh");
    assert_eq!(recv_event(&rx, Duration::from_secs(5)).code, ResponseCode::Choke);
}

#[test]
fn round_robin_across_two_endpoints() {
    let first = StubWorker::spawn("node-a/h", ReplyScript::EchoReversed, 0);
    let second = StubWorker::spawn("node-b/h", ReplyScript::EchoReversed, 0);

    // Two nodes, each exposing the same handle through its own worker.
    let node_a = StubNode::spawn(NodeSpec::single_app(
        APP,
        &[(HANDLE, first.address(), first.route())],
    ));
    let node_b = StubNode::spawn(NodeSpec::single_app(
        APP,
        &[(HANDLE, second.address(), second.route())],
    ));

    let dir = tempfile::tempdir().expect("tempdir");
    let hosts_path = dir.path().join("hosts");
    std::fs::write(
        &hosts_path,
        format!("{}\n{}\n", node_a.address(), node_b.address()),
    )
    .expect("hosts file");
    let config_path = dir.path().join("dealer.json");
    write_config(&config_path, &hosts_path, dir.path(), "RAM_ONLY");
    let dealer = Dealer::new(&config_path).expect("dealer");

    wait_until("the handle to appear", Duration::from_secs(10), || {
        dealer.has_handle(&path())
    });

    let (_, rx_one, _sink_one) = send(&dealer, b"one", policy(5000, 0, 0));
    let (_, rx_two, _sink_two) = send(&dealer, b"two", policy(5000, 0, 0));

    // Both complete, and the two endpoints got one message each.
    assert_eq!(recv_event(&rx_one, Duration::from_secs(10)).code, ResponseCode::Chunk);
    assert_eq!(recv_event(&rx_two, Duration::from_secs(10)).code, ResponseCode::Chunk);
    wait_until("both workers to see traffic", Duration::from_secs(5), || {
        first.received_count() == 1 && second.received_count() == 1
    });
}

#[test]
fn orphans_splice_in_order() {
    let worker = StubWorker::spawn("node-a/h", ReplyScript::EchoReversed, 0);
    // The app is up but reports no tasks yet.
    let fixture = Fixture::new(NodeSpec::single_app(APP, &[]), "RAM_ONLY");
    let dealer = fixture.dealer();

    let (first_uuid, first_rx, _first_sink) = send(&dealer, b"one", policy(1000, 0, 0));
    let (second_uuid, second_rx, _second_sink) = send(&dealer, b"two", policy(1000, 0, 0));

    wait_until("orphan queue", Duration::from_secs(2), || {
        dealer.orphan_count(&path()) == 2
    });
    assert!(!dealer.has_handle(&path()));

    fixture.node.set_spec(NodeSpec::single_app(
        APP,
        &[(HANDLE, worker.address(), worker.route())],
    ));

    wait_until("both messages to dispatch", Duration::from_secs(10), || {
        worker.received_count() == 2
    });
    assert_eq!(worker.received(), vec![first_uuid, second_uuid]);

    assert_eq!(
        recv_event(&first_rx, Duration::from_secs(5)).code,
        ResponseCode::Chunk
    );
    assert_eq!(
        recv_event(&second_rx, Duration::from_secs(5)).code,
        ResponseCode::Chunk
    );
}

#[test]
fn persistent_restart_redispatches() {
    let fixture = Fixture::new(NodeSpec::single_app(APP, &[]), "PERSISTENT");

    let mut sent = Vec::new();
    {
        let dealer = fixture.dealer();
        for payload in [b"a".as_ref(), b"b", b"c"] {
            let (uuid, _rx, _sink) = send(&dealer, payload, policy(1000, 0, 0));
            sent.push(uuid);
        }
        wait_until("orphans to queue", Duration::from_secs(2), || {
            dealer.orphan_count(&path()) == 3
        });
        // Killed before any endpoint ever showed up.
        dealer.shutdown();
    }

    // A worker appears, and a fresh dealer starts over the same config.
    let worker = StubWorker::spawn("node-a/h", ReplyScript::EchoReversed, 0);
    fixture.node.set_spec(NodeSpec::single_app(
        APP,
        &[(HANDLE, worker.address(), worker.route())],
    ));

    let dealer = fixture.dealer();
    wait_until("restored messages to dispatch", Duration::from_secs(10), || {
        worker.received_count() == 3
    });

    let mut received = worker.received();
    received.sort();
    sent.sort();
    assert_eq!(received, sent);

    // Everything completed, so the store drains back to empty.
    let blob_dir = fixture.dir.path().join("blobs").join(SERVICE);
    wait_until("blob store to drain", Duration::from_secs(10), || {
        std::fs::read_dir(&blob_dir)
            .map(|entries| entries.filter_map(Result::ok).count() == 0)
            .unwrap_or(true)
    });
    drop(dealer);
}

#[test]
fn vanished_app_times_out_inflight_work() {
    let worker = StubWorker::spawn("node-a/h", ReplyScript::AckOnly, 0);
    let fixture = Fixture::new(
        NodeSpec::single_app(APP, &[(HANDLE, worker.address(), worker.route())]),
        "RAM_ONLY",
    );
    let dealer = fixture.dealer();

    let (uuid, rx, _sink) = send(&dealer, b"stuck", policy(30_000, 3_000, 0));
    wait_until("message to go in flight", Duration::from_secs(10), || {
        worker.received_count() == 1
    });

    // The heartbeat stops reporting any apps: the handle is retired and
    // queued work falls back to the orphan queue until it times out.
    fixture.node.set_spec(NodeSpec::default());
    wait_until("handle retirement", Duration::from_secs(10), || {
        !dealer.has_handle(&path())
    });

    let event = recv_event(&rx, Duration::from_secs(10));
    assert_eq!(event.uuid, uuid);
    assert_eq!(event.code, ResponseCode::Error);
    assert_eq!(event.error.expect("error payload").0, code::DEADLINE);
}
