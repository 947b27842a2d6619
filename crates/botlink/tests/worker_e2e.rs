use std::{
    fs,
    io::{Cursor, Write},
    path::Path,
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use botlink::{
    config::Config,
    shutdown::Shutdown,
    store::BUNDLED_DEFAULT_ENTRY,
    worker::{WorkerExit, WorkerError, run_worker},
};
use botlink_ipc::{
    CallbackMessage, CommandMessage, ErrorCode, Reply, callback::CallbackSubscriber,
    command::CommandClient,
};
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use zip::{ZipWriter, write::SimpleFileOptions};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Config with every path under `dir`.
fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.ipc.command_socket = dir.join("cmd.sock");
    config.ipc.callback_socket = dir.join("cb.sock");
    config.worker.storage_dir = dir.join("projects");
    config.worker.execution_budget_ms = 2_000;
    config.worker.stop_grace_ms = 500;
    config.gateway.reconnect_window_ms = 3_000;
    config
}

fn spawn_worker(
    config: &Config,
    shutdown: &Shutdown,
) -> JoinHandle<Result<WorkerExit, WorkerError>> {
    let (config, shutdown) = (config.clone(), shutdown.clone());
    tokio::spawn(async move { run_worker(&config, shutdown).await })
}

/// Subscribe to the worker's callbacks, waiting for the socket to appear.
async fn subscribe(config: &Config) -> CallbackSubscriber {
    for _ in 0..100 {
        if let Ok(sub) = CallbackSubscriber::connect(&config.ipc.callback_socket).await {
            return sub;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("callback channel never came up");
}

async fn next_event(sub: &mut CallbackSubscriber) -> CallbackMessage {
    tokio::time::timeout(Duration::from_secs(3), sub.recv())
        .await
        .expect("event in time")
        .expect("worker alive")
}

fn client(config: &Config) -> CommandClient {
    CommandClient::new(&config.ipc.command_socket, config.gateway.reconnect_window())
}

async fn process(client: &mut CommandClient, object: &str, method: &str, args: Value) -> Reply {
    let Value::Object(args) = args else {
        panic!("args must be an object");
    };
    client
        .send_command(&CommandMessage::process(object, method, args), REPLY_TIMEOUT)
        .await
        .unwrap()
}

fn archive(entries: &[(&str, &str)]) -> String {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(contents.as_bytes()).unwrap();
    }
    BASE64.encode(zip.finish().unwrap().into_inner())
}

#[tokio::test]
async fn test_start_and_process_against_default_project() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let shutdown = Shutdown::new();
    let worker = spawn_worker(&config, &shutdown);
    let mut client = client(&config);

    let pong = client.send_command(&CommandMessage::ping(), REPLY_TIMEOUT).await.unwrap();
    assert!(pong.is_success());
    // bootstrapped on startup, loaded on first use
    assert_eq!(pong.data.unwrap()["state"], "empty");

    let started = client.send_command(&CommandMessage::start(), REPLY_TIMEOUT).await.unwrap();
    assert_eq!(started.message, "project started");
    assert_eq!(started.data.unwrap()["objects"], json!(["robot_controller"]));
    let again = client.send_command(&CommandMessage::start(), REPLY_TIMEOUT).await.unwrap();
    assert_eq!(again.message, "already started");

    let reply = process(&mut client, "robot_controller", "walk_mode", json!({})).await;
    assert!(reply.is_success(), "{reply:?}");
    assert_eq!(reply.data.unwrap()["mode"], "walk");

    let reply = process(&mut client, "vacuum", "start", json!({})).await;
    assert_eq!(reply.error_code, Some(ErrorCode::ObjectNotFound));
    let reply = process(&mut client, "robot_controller", "fly", json!({})).await;
    assert_eq!(reply.error_code, Some(ErrorCode::MethodNotFound));

    shutdown.trigger();
    assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Clean);
}

#[tokio::test]
async fn test_events_follow_the_reply_and_cleanup_cancels() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let shutdown = Shutdown::new();
    let worker = spawn_worker(&config, &shutdown);
    let mut client = client(&config);
    client.send_command(&CommandMessage::ping(), REPLY_TIMEOUT).await.unwrap();
    let mut events = subscribe(&config).await;

    let reply = process(
        &mut client,
        "robot_controller",
        "start_recognition",
        json!({ "interval_ms": 20 }),
    )
    .await;
    assert!(reply.is_success(), "{reply:?}");
    let task_id = reply.data.unwrap()["task_id"].clone();

    let first = next_event(&mut events).await;
    assert_eq!(first.event, "recognition_result");
    assert_eq!(first.data["count"], 1);

    let cleanup = client.send_command(&CommandMessage::cleanup(), REPLY_TIMEOUT).await.unwrap();
    assert!(cleanup.is_success());
    let report = cleanup.data.unwrap();
    assert_eq!(report["tasks_still_running"], 0);
    // the object's stop and the module stop
    assert_eq!(report["stop_hooks_run"], 2);

    let outcome = loop {
        let msg = next_event(&mut events).await;
        if msg.event == CallbackMessage::TASK_OUTCOME {
            break msg;
        }
    };
    assert_eq!(outcome.data["task_id"], task_id);
    assert_eq!(outcome.data["status"], "cancelled");

    // objects survive cleanup
    let status = process(&mut client, "robot_controller", "get_status", json!({})).await;
    assert_eq!(status.data.unwrap()["recognition_running"], false);

    shutdown.trigger();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_updates_leave_current_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let shutdown = Shutdown::new();
    let worker = spawn_worker(&config, &shutdown);
    let mut client = client(&config);
    client.send_command(&CommandMessage::start(), REPLY_TIMEOUT).await.unwrap();

    let cases = [
        (
            archive(&[("main.rhai", "let o = #{ m: || 1 };"), ("../escape.rhai", "")]),
            ErrorCode::SecurityViolation,
        ),
        (
            archive(&[("main.rhai", "let o = #{ m: || 1 };"), ("tool.sh", "rm -rf /")]),
            ErrorCode::SecurityViolation,
        ),
        (archive(&[("readme.md", "no entry")]), ErrorCode::InvalidProject),
        ("not base64!".to_string(), ErrorCode::InvalidParams),
    ];
    for (data, code) in cases {
        let reply = client
            .send_command(&CommandMessage::update(data), REPLY_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply.error_code, Some(code), "{reply:?}");
    }

    let entry = config.worker.storage_dir.join("current").join("main.rhai");
    assert_eq!(fs::read_to_string(entry).unwrap(), BUNDLED_DEFAULT_ENTRY);
    // still serving the old project
    let reply = process(&mut client, "robot_controller", "cheer", json!({})).await;
    assert!(reply.is_success());

    shutdown.trigger();
    assert_eq!(worker.await.unwrap().unwrap(), WorkerExit::Clean);
}

#[tokio::test]
async fn test_update_exits_for_reload_and_next_worker_runs_new_project() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let shutdown = Shutdown::new();
    let worker = spawn_worker(&config, &shutdown);
    let mut client = client(&config);

    let project = archive(&[
        ("project.toml", "[project]\nname = \"greeter\"\n"),
        ("main.rhai", r#"let greeter = #{ hello: |name| `hello ${name}` };"#),
    ]);
    let reply = client
        .send_command(&CommandMessage::update(project), REPLY_TIMEOUT)
        .await
        .unwrap();
    assert!(reply.is_success(), "{reply:?}");
    assert_eq!(reply.data.unwrap()["worker_will_restart"], true);

    let exit = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(exit, WorkerExit::Reload);

    // let the old connection and socket go before the next worker binds
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!config.ipc.command_socket.exists());

    // what the supervisor does next
    let worker = spawn_worker(&config, &shutdown);
    let mut args = Map::new();
    args.insert("name".into(), json!("robot"));
    let reply = client
        .send_command(&CommandMessage::process("greeter", "hello", args), REPLY_TIMEOUT)
        .await
        .unwrap();
    assert!(reply.is_success(), "{reply:?}");
    assert_eq!(reply.data, Some(json!("hello robot")));

    let reply = process(&mut client, "robot_controller", "get_status", json!({})).await;
    assert_eq!(reply.error_code, Some(ErrorCode::ObjectNotFound));

    shutdown.trigger();
    worker.await.unwrap().unwrap();
}
