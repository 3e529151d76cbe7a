//! Machine-control client against an in-process stub on a Unix socket.

mod common;

use dosprobe::error::Error;
use dosprobe::qemu::qmp::QmpClient;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn handshake_verifies_greeting_and_enables_capabilities() {
    let dir = tempfile::tempdir().unwrap();
    let commands = Arc::new(Mutex::new(Vec::<String>::new()));
    let seen = commands.clone();
    let path = common::run_qmp_stub(dir.path(), common::default_greeting(), move |cmd, _| {
        seen.lock().unwrap().push(cmd.to_string());
        vec![json!({ "return": {} })]
    })
    .await;

    let (_client, _events) = QmpClient::connect(&path).await.unwrap();
    assert_eq!(commands.lock().unwrap().as_slice(), ["qmp_capabilities"]);
}

#[tokio::test]
async fn missing_protocol_token_fails_the_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::run_qmp_stub(dir.path(), json!({ "hello": 1 }), |_, _| {
        vec![json!({ "return": {} })]
    })
    .await;

    assert!(matches!(
        QmpClient::connect(&path).await.unwrap_err(),
        Error::BadGreeting
    ));
}

#[tokio::test]
async fn error_responses_carry_class_and_description() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::run_qmp_stub(dir.path(), common::default_greeting(), |cmd, _| {
        if cmd == "qmp_capabilities" {
            vec![json!({ "return": {} })]
        } else {
            vec![json!({
                "error": { "class": "CommandNotFound", "desc": "The command bogus has not been found" }
            })]
        }
    })
    .await;

    let (mut client, _events) = QmpClient::connect(&path).await.unwrap();
    match client.execute("bogus", None).await.unwrap_err() {
        Error::Protocol { class, desc } => {
            assert_eq!(class, "CommandNotFound");
            assert!(desc.contains("bogus"));
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn interleaved_events_go_out_of_band() {
    let dir = tempfile::tempdir().unwrap();
    let path = common::run_qmp_stub(dir.path(), common::default_greeting(), |cmd, _| {
        if cmd == "qmp_capabilities" {
            vec![json!({ "return": {} })]
        } else {
            vec![
                json!({ "event": "STOP", "timestamp": { "seconds": 1, "microseconds": 0 } }),
                json!({ "return": { "ok": true } }),
            ]
        }
    })
    .await;

    let (mut client, mut events) = QmpClient::connect(&path).await.unwrap();
    let ret = client.execute("query-status", None).await.unwrap();
    assert_eq!(ret["ok"], Value::Bool(true));

    let event = events.recv().await.unwrap();
    assert_eq!(event["event"], "STOP");
}

#[tokio::test]
async fn save_snapshot_wraps_savevm_then_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let monitor = seen.clone();
    let commands = Arc::new(Mutex::new(Vec::<String>::new()));
    let all = commands.clone();
    let path = common::run_qmp_stub(dir.path(), common::default_greeting(), move |cmd, args| {
        all.lock().unwrap().push(cmd.to_string());
        common::scripted_monitor(monitor.clone())(cmd, args)
    })
    .await;

    let (mut client, _events) = QmpClient::connect(&path).await.unwrap();
    client.save_snapshot("s1").await.unwrap();

    assert_eq!(seen.lock().unwrap().as_slice(), ["savevm s1"]);
    // savevm pauses the virtual CPUs, so a `cont` follows
    assert_eq!(
        commands.lock().unwrap().as_slice(),
        ["qmp_capabilities", "human-monitor-command", "cont"]
    );
}

#[tokio::test]
async fn send_key_passes_qcode_and_hold_time() {
    let dir = tempfile::tempdir().unwrap();
    let captured = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = captured.clone();
    let path = common::run_qmp_stub(dir.path(), common::default_greeting(), move |cmd, args| {
        if cmd == "send-key" {
            sink.lock().unwrap().push(args.cloned().unwrap_or_default());
        }
        vec![json!({ "return": {} })]
    })
    .await;

    let (mut client, _events) = QmpClient::connect(&path).await.unwrap();
    client.send_key("ret", 150).await.unwrap();

    let captured = captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0]["keys"][0]["type"], "qcode");
    assert_eq!(captured[0]["keys"][0]["data"], "ret");
    assert_eq!(captured[0]["hold-time"], 150);
}
