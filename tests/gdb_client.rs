//! Remote-debug client against an in-process protocol stub.

mod common;

use dosprobe::error::Error;
use dosprobe::qemu::gdb::GdbClient;
use dosprobe::register::Register;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CONNECT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn register_dump_decodes_in_wire_order() {
    let addr = common::run_gdb_stub(common::scripted_guest()).await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();

    let registers = client.read_registers().await.unwrap();
    assert_eq!(registers.get(Register::Eax), Some(0x1234));
    assert_eq!(registers.get(Register::Eip), Some(0x100));
    assert_eq!(registers.get(Register::Cs), Some(0xA000));
    assert_eq!(registers.len(), 16);
}

#[tokio::test]
async fn memory_read_is_chunked_and_concatenated_in_order() {
    let requests = Arc::new(AtomicUsize::new(0));
    let seen = requests.clone();
    let mut guest = common::scripted_guest();
    let addr = common::run_gdb_stub(move |payload| {
        if payload.starts_with('m') {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        guest(payload)
    })
    .await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();

    let n = 4096 * 2 + 100;
    let bytes = client.read_memory(0xA0000, n).await.unwrap();
    assert_eq!(bytes.len(), n);
    // the stub's pattern is position-based, so chunk seams are detectable
    for (i, byte) in bytes.iter().enumerate() {
        assert_eq!(*byte, (0xA0000usize + i) as u8, "mismatch at offset {i}");
    }
    assert_eq!(requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn zero_length_read_makes_no_wire_request() {
    let requests = Arc::new(AtomicUsize::new(0));
    let seen = requests.clone();
    let mut guest = common::scripted_guest();
    let addr = common::run_gdb_stub(move |payload| {
        seen.fetch_add(1, Ordering::SeqCst);
        guest(payload)
    })
    .await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();

    let bytes = client.read_memory(0xA0000, 0).await.unwrap();
    assert!(bytes.is_empty());
    assert_eq!(requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn error_reply_names_the_address() {
    let addr = common::run_gdb_stub(|payload| {
        if payload.starts_with('m') {
            Some("E14".to_string())
        } else {
            Some("OK".to_string())
        }
    })
    .await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();

    let err = client.read_memory(0xB8000, 16).await.unwrap_err();
    match err {
        Error::Protocol { desc, .. } => {
            assert!(desc.contains("0xb8000"), "got: {desc}");
            assert!(desc.contains("E14"));
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn write_and_breakpoints_round_trip() {
    let addr = common::run_gdb_stub(common::scripted_guest()).await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();

    client.write_memory(0x1000, b"\xCD\x21").await.unwrap();
    client.set_breakpoint(0x1234).await.unwrap();
    client.remove_breakpoint(0x1234).await.unwrap();
}

#[tokio::test]
async fn breakpoint_rejection_is_a_protocol_error() {
    let addr = common::run_gdb_stub(|payload| {
        if payload.starts_with("Z0") {
            Some("E22".to_string())
        } else {
            Some("OK".to_string())
        }
    })
    .await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();

    assert!(matches!(
        client.set_breakpoint(0x1234).await.unwrap_err(),
        Error::Protocol { .. }
    ));
}

#[tokio::test]
async fn silent_stub_raises_timeout_and_keeps_the_transport() {
    let addr = common::run_gdb_stub(|payload| {
        if payload == "g" {
            None // never answer
        } else {
            Some("OK".to_string())
        }
    })
    .await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();
    client.set_recv_timeout(Duration::from_millis(200));

    let err = client.read_registers().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err:?}");

    // the transport survives a timeout; the next request still works
    client.write_memory(0x1000, b"\x90").await.unwrap();
}

#[tokio::test]
async fn step_returns_the_stop_packet() {
    let addr = common::run_gdb_stub(common::scripted_guest()).await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();

    let stop = client.step().await.unwrap();
    assert!(stop.starts_with("T05"));
}

#[tokio::test]
async fn break_byte_yields_a_stop_notification() {
    let addr = common::run_gdb_stub(common::scripted_guest()).await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();

    client.cont().await.unwrap();
    client.stop().await.unwrap();
    let stop = client.wait_stop(Duration::from_secs(2)).await.unwrap();
    assert!(stop.starts_with("T02"));
}

#[tokio::test]
async fn close_is_idempotent() {
    let addr = common::run_gdb_stub(common::scripted_guest()).await;
    let mut client = GdbClient::connect(addr, CONNECT).await.unwrap();
    client.close().await;
    client.close().await;
    assert!(!client.is_connected());
    assert!(matches!(
        client.read_registers().await.unwrap_err(),
        Error::NotConnected
    ));
}
