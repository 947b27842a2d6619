use std::{net::SocketAddr, path::Path, time::Duration};

use botlink::{
    config::Config,
    gateway::Gateway,
    shutdown::Shutdown,
    worker::run_worker,
};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

const LINE_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.ipc.command_socket = dir.join("cmd.sock");
    config.ipc.callback_socket = dir.join("cb.sock");
    config.worker.storage_dir = dir.join("projects");
    config.worker.execution_budget_ms = 2_000;
    config.worker.stop_grace_ms = 500;
    config.gateway.listen = SocketAddr::from(([127, 0, 0, 1], 0));
    config.gateway.reconnect_window_ms = 3_000;
    config
}

/// Worker and gateway running in-process, gateway on an ephemeral port.
struct Stack {
    addr: SocketAddr,
    shutdown: Shutdown,
    _dir: tempfile::TempDir,
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

async fn start_stack() -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let shutdown = Shutdown::new();

    let worker_config = config.clone();
    let worker_shutdown = shutdown.clone();
    tokio::spawn(async move { run_worker(&worker_config, worker_shutdown).await });

    let gateway = Gateway::bind(&config, shutdown.clone()).await.unwrap();
    let addr = gateway.local_addr().unwrap();
    tokio::spawn(gateway.run());

    Stack {
        addr,
        shutdown,
        _dir: dir,
    }
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr, subject: &str, permissions: &[&str]) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut client = Self {
            lines: BufReader::new(reader).lines(),
            writer,
        };
        client
            .send(json!({ "hello": { "subject": subject, "permissions": permissions } }))
            .await;
        client
    }

    async fn send(&mut self, value: Value) {
        let mut line = serde_json::to_vec(&value).unwrap();
        line.push(b'\n');
        self.writer.write_all(&line).await.unwrap();
    }

    /// Next line, or `None` once the gateway closed the connection.
    async fn next(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(LINE_TIMEOUT, self.lines.next_line())
            .await
            .expect("line in time")
            .unwrap()?;
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Skip events until the reply for `id`.
    async fn reply(&mut self, id: i64) -> Value {
        loop {
            let line = self.next().await.expect("connection open");
            if line["id"] == id {
                return line["reply"].clone();
            }
        }
    }

    async fn event(&mut self, name: &str) -> Value {
        loop {
            let line = self.next().await.expect("connection open");
            if line["event"] == name {
                return line["data"].clone();
            }
        }
    }
}

async fn admitted(addr: SocketAddr, subject: &str) -> TestClient {
    let mut client = TestClient::connect(addr, subject, &["*"]).await;
    let hello = client.next().await.unwrap();
    assert_eq!(hello["event"], "connected", "{hello}");
    assert_eq!(hello["data"]["subject"], subject);
    client
}

#[tokio::test]
async fn test_second_client_is_rejected_until_first_leaves() {
    let stack = start_stack().await;
    let mut alice = admitted(stack.addr, "alice").await;

    let mut bob = TestClient::connect(stack.addr, "bob", &["*"]).await;
    let rejected = bob.next().await.unwrap();
    assert_eq!(rejected["event"], "error");
    assert_eq!(rejected["data"]["code"], "00001");
    assert!(bob.next().await.is_none());

    // alice is unaffected
    alice
        .send(json!({ "id": 1, "action": "process", "params": { "object": "robot_controller", "method": "prepare_mode" } }))
        .await;
    let reply = alice.reply(1).await;
    assert_eq!(reply["status"], "success", "{reply}");
    assert_eq!(reply["data"]["mode"], "prepare");

    drop(alice);

    // the slot frees once the worker has cleaned up
    let mut bob = None;
    for _ in 0..50 {
        let mut candidate = TestClient::connect(stack.addr, "bob", &["*"]).await;
        let first = candidate.next().await.unwrap();
        if first["event"] == "connected" {
            bob = Some(candidate);
            break;
        }
        assert_eq!(first["data"]["code"], "00001");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let mut bob = bob.expect("bob admitted after alice left");

    // loaded objects and their state survived the handover
    bob.send(json!({ "id": 2, "action": "process", "params": { "object": "robot_controller", "method": "get_status" } }))
        .await;
    let reply = bob.reply(2).await;
    assert_eq!(reply["data"]["current_mode"], "prepare");
}

#[tokio::test]
async fn test_requests_are_validated_and_authorized() {
    let stack = start_stack().await;
    let mut client = TestClient::connect(stack.addr, "viewer", &["robot:control"]).await;
    assert_eq!(client.next().await.unwrap()["event"], "connected");

    client.send(json!({ "id": 1, "action": "update", "data": "UEsFBgAAAAAAAAAAAAAAAAAAAAAAAA==" })).await;
    let reply = client.reply(1).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["error_code"], "00020");

    client.send(json!({ "id": 2, "action": "reboot" })).await;
    assert_eq!(client.reply(2).await["error_code"], "01003");

    client.send(json!({ "id": 3, "action": "ping" })).await;
    assert_eq!(client.reply(3).await["error_code"], "01003");

    client.send(json!({ "id": 4, "action": "process", "params": { "object": "robot_controller" } })).await;
    assert_eq!(client.reply(4).await["error_code"], "01002");

    client.writer.write_all(b"{oops\n").await.unwrap();
    let line = client.next().await.unwrap();
    assert_eq!(line["id"], Value::Null);
    assert_eq!(line["reply"]["error_code"], "01001");

    client.send(json!({ "id": 5, "action": "start" })).await;
    let reply = client.reply(5).await;
    assert_eq!(reply["status"], "success", "{reply}");
    assert_eq!(reply["data"]["objects"], json!(["robot_controller"]));
}

#[tokio::test]
async fn test_pushed_events_reach_the_client() {
    let stack = start_stack().await;
    let mut client = admitted(stack.addr, "operator").await;

    client.send(json!({ "id": 1, "action": "start" })).await;
    assert_eq!(client.reply(1).await["status"], "success");
    // give the relay time to subscribe to the freshly started worker
    tokio::time::sleep(Duration::from_millis(500)).await;

    client
        .send(json!({
            "id": 2,
            "action": "process",
            "params": {
                "object": "robot_controller",
                "method": "start_recognition",
                "args": { "interval_ms": 20 }
            }
        }))
        .await;
    let reply = client.reply(2).await;
    assert_eq!(reply["status"], "success", "{reply}");
    let task_id = reply["data"]["task_id"].clone();

    let frame = client.event("recognition_result").await;
    assert!(frame["count"].as_i64().unwrap() >= 1);
    assert!(frame["object"].is_string());

    client
        .send(json!({ "id": 3, "action": "process", "params": { "object": "robot_controller", "method": "stop_recognition" } }))
        .await;
    // the outcome may overtake the reply that caused it
    let (mut stopped, mut outcome) = (None, None);
    while stopped.is_none() || outcome.is_none() {
        let line = client.next().await.expect("connection open");
        if line["id"] == 3 {
            stopped = Some(line["reply"].clone());
        } else if line["event"] == "callback" {
            outcome = Some(line["data"].clone());
        }
    }
    assert_eq!(stopped.unwrap()["status"], "success");
    let outcome = outcome.unwrap();
    assert_eq!(outcome["task_id"], task_id);
    assert_eq!(outcome["status"], "cancelled");
    assert_eq!(outcome["object"], "robot_controller");
}
