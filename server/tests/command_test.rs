use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use gateway_emulator::{telemetry, CommandResponder};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wsn_common::{
    Action, FlashState, Frame, FrameBuffer, GatewayNodeResult, NodeOperationRequest, NodeReport,
    NodeStatus, ResponseBuffer, SlotRequest, SlotWindow, TokenRequest,
};
use wsn_server::test_util::{test_config, Push, TestContext};
use wsn_server::CommandServer;

const USER: &str = "alice@example.com";
const READ_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(ctx: &TestContext) -> (SocketAddr, CancellationToken) {
    let server = CommandServer::bind("127.0.0.1:0", ctx.state.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));
    (addr, cancel)
}

async fn start_gateway(fail_nodes: &[&str]) -> (u16, CancellationToken) {
    let responder = CommandResponder::bind(
        "127.0.0.1:0",
        fail_nodes.iter().map(|s| s.to_string()),
        Duration::ZERO,
    )
    .await
    .unwrap();
    let port = responder.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    tokio::spawn(responder.run(cancel.clone()));
    (port, cancel)
}

/// Gateway that answers its first request with a fixed frame.
async fn start_scripted_gateway(reply: Frame) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frames = FrameBuffer::new();
        while frames.next_frame().is_none() {
            if stream.read_buf(frames.buffer_mut()).await.unwrap() == 0 {
                return;
            }
        }
        stream.write_all(&reply.encode().unwrap()).await.unwrap();
        // Hold the connection until the server closes it.
        let _ = stream.read_buf(frames.buffer_mut()).await;
    });
    port
}

fn node_result(action: Action, local_id: &str, status: NodeStatus) -> Frame {
    let result = GatewayNodeResult {
        nodes: vec![NodeReport {
            node_id: local_id.to_string(),
            status,
        }],
    };
    Frame::json(action, &result).unwrap()
}

/// Poll `check` every 50ms for up to five seconds.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// A slot covering the current instant.
fn open_slot(ctx: &TestContext) -> String {
    let now = Utc::now();
    let window = SlotWindow {
        start: now - chrono::Duration::hours(1),
        end: now + chrono::Duration::hours(1),
    };
    ctx.state.store.insert_slot(USER, &window).unwrap().uid
}

struct Client {
    stream: TcpStream,
    responses: ResponseBuffer,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            responses: ResponseBuffer::new(),
        }
    }

    async fn send<T: serde::Serialize>(&mut self, action: Action, body: &T) {
        let bytes = Frame::json(action, body).unwrap().encode().unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Next JSON response, or `None` when the server closed the connection.
    async fn recv(&mut self) -> Option<Value> {
        loop {
            if let Some(payload) = self.responses.next_response() {
                return Some(serde_json::from_slice(&payload).unwrap());
            }
            let n = tokio::time::timeout(
                READ_TIMEOUT,
                self.stream.read_buf(self.responses.buffer_mut()),
            )
            .await
            .expect("response timed out")
            .unwrap();
            if n == 0 {
                return None;
            }
        }
    }

    /// True when nothing arrives within `wait`.
    async fn is_quiet(&mut self, wait: Duration) -> bool {
        if self.responses.next_response().is_some() {
            return false;
        }
        tokio::time::timeout(wait, self.stream.read_buf(self.responses.buffer_mut()))
            .await
            .is_err()
    }
}

#[tokio::test]
async fn test_flash_fans_out_and_aggregates_one_reply() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::new(dir.path());
    let (port_a, _gw_a) = start_gateway(&["2"]).await;
    let (port_b, _gw_b) = start_gateway(&[]).await;
    let nodes_a = ctx.seed_gateway("gwA", port_a, &["1", "2"]);
    let nodes_b = ctx.seed_gateway("gwB", port_b, &["1"]);
    let slot_id = open_slot(&ctx);
    ctx.state
        .images
        .save(USER, "UNO", "blink.hex", ":00000001FF")
        .unwrap();
    let (addr, cancel) = start_server(&ctx).await;

    let uids: Vec<String> = nodes_a
        .iter()
        .chain(nodes_b.iter())
        .map(|n| n.uid.clone())
        .collect();
    let mut client = Client::connect(addr).await;
    client
        .send(
            Action::NodesFlash,
            &NodeOperationRequest {
                token: ctx.token(USER),
                slot_id,
                node_uids: uids.clone(),
                image_name: Some("blink.hex".to_string()),
            },
        )
        .await;

    let reply = client.recv().await.unwrap();
    assert_eq!(reply["status"], 200);
    let data = reply["data"].as_array().unwrap();
    assert_eq!(data.len(), 3);
    for outcome in data {
        let expected = if outcome["_id"] == json!(nodes_a[1].uid) {
            "ERROR"
        } else {
            "FLASHED"
        };
        assert_eq!(outcome["status"], expected);
    }
    assert!(client.is_quiet(Duration::from_millis(200)).await);

    let store = &ctx.state.store;
    let flashed = store.node(&nodes_a[0].uid).unwrap().unwrap();
    assert_eq!(flashed.flash_state, FlashState::Finished);
    assert_eq!(flashed.image_name.as_deref(), Some("blink.hex"));
    let failed = store.node(&nodes_a[1].uid).unwrap().unwrap();
    assert_eq!(failed.flash_state, FlashState::NotStarted);
    assert_eq!(
        store.node(&nodes_b[0].uid).unwrap().unwrap().flash_state,
        FlashState::Finished
    );

    let image_pushes = ctx
        .transfer
        .pushes()
        .into_iter()
        .filter(|p| matches!(p, Push::Image { name, nodetype_id, .. } if name == "blink.hex" && nodetype_id == "UNO"))
        .count();
    assert_eq!(image_pushes, 2);
    cancel.cancel();
}

#[tokio::test]
async fn test_unreachable_gateway_gets_immediate_empty_reply() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::new(dir.path());
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let nodes = ctx.seed_gateway("gwA", closed_port, &["1"]);
    let slot_id = open_slot(&ctx);
    let (addr, cancel) = start_server(&ctx).await;

    let mut client = Client::connect(addr).await;
    client
        .send(
            Action::NodesReset,
            &NodeOperationRequest {
                token: ctx.token(USER),
                slot_id,
                node_uids: vec![nodes[0].uid.clone()],
                image_name: None,
            },
        )
        .await;

    let reply = client.recv().await.unwrap();
    assert_eq!(reply, json!({ "data": [], "status": 200 }));
    cancel.cancel();
}

#[tokio::test]
async fn test_node_operation_without_valid_token_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::new(dir.path());
    let slot_id = open_slot(&ctx);
    let (addr, cancel) = start_server(&ctx).await;

    let mut client = Client::connect(addr).await;
    client
        .send(
            Action::NodesErase,
            &NodeOperationRequest {
                token: "not-a-token".to_string(),
                slot_id,
                node_uids: Vec::new(),
                image_name: None,
            },
        )
        .await;

    let reply = client.recv().await.unwrap();
    assert_eq!(reply["status"], 401);

    // The connection stays usable after a rejection.
    client
        .send(
            Action::NodesGet,
            &TokenRequest {
                token: ctx.token(USER),
            },
        )
        .await;
    let reply = client.recv().await.unwrap();
    assert_eq!(reply["status"], 200);
    cancel.cancel();
}

#[tokio::test]
async fn test_unrecognised_gateway_status_is_relayed_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::new(dir.path());
    let port = start_scripted_gateway(node_result(
        Action::GatewayNodesReset,
        "1",
        NodeStatus::Other("TIMEOUT".to_string()),
    ))
    .await;
    let nodes = ctx.seed_gateway("gwA", port, &["1"]);
    let slot_id = open_slot(&ctx);
    let (addr, cancel) = start_server(&ctx).await;

    let mut client = Client::connect(addr).await;
    client
        .send(
            Action::NodesReset,
            &NodeOperationRequest {
                token: ctx.token(USER),
                slot_id,
                node_uids: vec![nodes[0].uid.clone()],
                image_name: None,
            },
        )
        .await;

    let reply = client.recv().await.unwrap();
    assert_eq!(
        reply,
        json!({ "data": [{ "_id": nodes[0].uid, "status": "TIMEOUT" }], "status": 200 })
    );
    cancel.cancel();
}

#[tokio::test]
async fn test_mismatched_gateway_result_abandons_member() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::new(dir.path());
    // A flash result in answer to an erase.
    let port = start_scripted_gateway(node_result(
        Action::GatewayNodesFlash,
        "1",
        NodeStatus::Flashed,
    ))
    .await;
    let nodes = ctx.seed_gateway("gwA", port, &["1"]);
    let store = &ctx.state.store;
    store
        .update_flash_state(&nodes[0].uid, FlashState::Finished, Some("blink.hex"))
        .unwrap();
    let slot_id = open_slot(&ctx);
    let (addr, cancel) = start_server(&ctx).await;

    let mut client = Client::connect(addr).await;
    client
        .send(
            Action::NodesErase,
            &NodeOperationRequest {
                token: ctx.token(USER),
                slot_id,
                node_uids: vec![nodes[0].uid.clone()],
                image_name: None,
            },
        )
        .await;

    let reply = client.recv().await.unwrap();
    assert_eq!(reply, json!({ "data": [], "status": 200 }));
    let node = store.node(&nodes[0].uid).unwrap().unwrap();
    assert_eq!(node.flash_state, FlashState::Finished);
    assert_eq!(node.image_name.as_deref(), Some("blink.hex"));
    cancel.cancel();
}

#[tokio::test]
async fn test_started_slot_logs_telemetry_until_debug_end() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.timers.slots_start_poll = 2;
    config.timers.slots_end_poll = 3600;
    let ctx = TestContext::with_config(config);
    let slot_id = open_slot(&ctx);
    let log_path = ctx.state.logs.path(USER, &slot_id).unwrap();
    let (addr, cancel) = start_server(&ctx).await;
    let request = SlotRequest {
        token: ctx.token(USER),
        slot_id,
    };

    let mut observer = Client::connect(addr).await;
    observer.send(Action::DebugStart, &request).await;
    assert_eq!(observer.recv().await.unwrap()["status"], 200);

    // Before the slot starts telemetry is relayed but not logged.
    let before = telemetry::reading("3", json!("before"));
    telemetry::send(&addr.to_string(), &[before]).await.unwrap();
    observer.recv().await.unwrap();
    assert!(!log_path.exists());

    eventually("experiment log", || log_path.exists()).await;

    let line = telemetry::reading("3", json!("temp=21"));
    telemetry::send(&addr.to_string(), &[line]).await.unwrap();
    observer.recv().await.unwrap();
    let contents = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("| 3 "));
    assert!(lines[0].ends_with(" | temp=21"));

    let mut control = Client::connect(addr).await;
    control.send(Action::DebugEnd, &request).await;
    assert_eq!(control.recv().await.unwrap(), json!({ "status": 204 }));

    let after = telemetry::reading("3", json!("after"));
    telemetry::send(&addr.to_string(), &[after]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(!contents.contains("after"));
    assert_eq!(contents.lines().count(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn test_ended_slot_is_deleted_and_nodes_erased() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.timers.slots_start_poll = 3600;
    config.timers.slots_end_poll = 1;
    let ctx = TestContext::with_config(config);

    let responder = CommandResponder::bind("127.0.0.1:0", Vec::new(), Duration::ZERO)
        .await
        .unwrap();
    let port = responder.local_addr().unwrap().port();
    let received = responder.received();
    let gateway_cancel = CancellationToken::new();
    tokio::spawn(responder.run(gateway_cancel.clone()));

    let nodes = ctx.seed_gateway("gwA", port, &["1", "2"]);
    let store = &ctx.state.store;
    for node in &nodes {
        store
            .update_flash_state(&node.uid, FlashState::Finished, Some("blink.hex"))
            .unwrap();
    }
    let now = Utc::now();
    let window = SlotWindow {
        start: now - chrono::Duration::hours(1),
        end: now + chrono::Duration::seconds(30),
    };
    let slot_id = store.insert_slot(USER, &window).unwrap().uid;
    let (_addr, cancel) = start_server(&ctx).await;

    eventually("mass erase", || {
        store.slot(&slot_id).unwrap().is_none()
            && nodes.iter().all(|n| {
                let node = store.node(&n.uid).unwrap().unwrap();
                node.flash_state == FlashState::NotStarted && node.image_name.is_none()
            })
    })
    .await;

    let log = received.lock().unwrap().clone();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, Action::NodesErase);
    let mut erased = log[0].request.node_ids.clone();
    erased.sort();
    assert_eq!(erased, vec!["1", "2"]);
    cancel.cancel();
    gateway_cancel.cancel();
}

#[tokio::test]
async fn test_second_debug_observer_evicts_first() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::new(dir.path());
    let slot_id = open_slot(&ctx);
    let (addr, cancel) = start_server(&ctx).await;
    let request = SlotRequest {
        token: ctx.token(USER),
        slot_id,
    };

    let mut first = Client::connect(addr).await;
    first.send(Action::DebugStart, &request).await;
    assert_eq!(first.recv().await.unwrap()["status"], 200);

    let mut second = Client::connect(addr).await;
    second.send(Action::DebugStart, &request).await;
    assert_eq!(second.recv().await.unwrap()["status"], 200);

    // The evicted observer is closed without further messages.
    assert!(first.recv().await.is_none());

    let line = telemetry::reading("3", json!("temp=21"));
    telemetry::send(&addr.to_string(), std::slice::from_ref(&line))
        .await
        .unwrap();
    let relayed = second.recv().await.unwrap();
    assert_eq!(relayed["data"], json!([line.0, "3", "temp=21"]));
    cancel.cancel();
}

#[tokio::test]
async fn test_debug_end_sends_banner_and_closes_observer() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = TestContext::new(dir.path());
    let slot_id = open_slot(&ctx);
    let (addr, cancel) = start_server(&ctx).await;
    let request = SlotRequest {
        token: ctx.token(USER),
        slot_id,
    };

    let mut observer = Client::connect(addr).await;
    observer.send(Action::DebugStart, &request).await;
    observer.recv().await.unwrap();

    let mut control = Client::connect(addr).await;
    control.send(Action::DebugEnd, &request).await;
    assert_eq!(control.recv().await.unwrap(), json!({ "status": 204 }));

    let banner = observer.recv().await.unwrap();
    assert_eq!(banner["message"], "STOP DEBUG");
    assert!(observer.recv().await.is_none());
    cancel.cancel();
}
