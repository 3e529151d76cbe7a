//! In-process fake emulator endpoints for integration tests: a remote-debug
//! stub on TCP and a machine-control stub on a Unix socket.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};

fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

pub fn frame(payload: &str) -> Vec<u8> {
    format!("${payload}#{:02x}", checksum(payload.as_bytes())).into_bytes()
}

/// Marker payload handed to the handler when the break byte arrives.
pub const BREAK_MARKER: &str = "<break>";

/// Serve the remote-debug protocol on an ephemeral TCP port. `handler` maps
/// each inbound packet payload (or [`BREAK_MARKER`]) to an optional reply
/// payload; `None` sends nothing (fire-and-forget commands, timeouts).
pub async fn run_gdb_stub<F>(mut handler: F) -> SocketAddr
where
    F: FnMut(&str) -> Option<String> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let mut chunk = [0u8; 4096];
            let n = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);

            loop {
                // drop client acks
                while buf.first().is_some_and(|b| *b == b'+' || *b == b'-') {
                    buf.remove(0);
                }
                if buf.first() == Some(&0x03) {
                    buf.remove(0);
                    if let Some(reply) = handler(BREAK_MARKER) {
                        let _ = socket.write_all(&frame(&reply)).await;
                    }
                    continue;
                }
                let Some(start) = buf.iter().position(|b| *b == b'$') else {
                    break;
                };
                let Some(hash) = buf[start..].iter().position(|b| *b == b'#') else {
                    break;
                };
                let hash = start + hash;
                if buf.len() < hash + 3 {
                    break;
                }
                let payload = String::from_utf8(buf[start + 1..hash].to_vec()).unwrap();
                buf.drain(..hash + 3);

                let _ = socket.write_all(b"+").await;
                if let Some(reply) = handler(&payload) {
                    let _ = socket.write_all(&frame(&reply)).await;
                }
            }
        }
    });

    addr
}

/// A remote-debug stub emulating a small guest: memory reads return a
/// deterministic pattern, writes and breakpoints answer OK, `g` returns a
/// fixed register dump.
pub fn scripted_guest() -> impl FnMut(&str) -> Option<String> + Send + 'static {
    move |payload: &str| {
        if let Some(rest) = payload.strip_prefix('m') {
            let (addr, len) = rest.split_once(',').unwrap();
            let addr = u64::from_str_radix(addr, 16).unwrap();
            let len = usize::from_str_radix(len, 16).unwrap();
            let bytes: Vec<u8> = (0..len).map(|i| (addr as usize + i) as u8).collect();
            return Some(hex::encode(bytes));
        }
        if payload.starts_with('M') {
            return Some("OK".to_string());
        }
        if payload == "g" {
            let mut words = [0u32; 16];
            words[0] = 0x0000_1234; // eax
            words[8] = 0x0000_0100; // eip
            words[10] = 0x0000_A000; // cs
            let mut dump = Vec::new();
            for word in words {
                dump.extend_from_slice(&word.to_le_bytes());
            }
            return Some(hex::encode(dump));
        }
        if payload.starts_with("Z0") || payload.starts_with("z0") {
            return Some("OK".to_string());
        }
        if payload == "c" {
            return None;
        }
        if payload == "s" {
            return Some("T05thread:01;".to_string());
        }
        if payload == BREAK_MARKER {
            return Some("T02thread:01;".to_string());
        }
        Some(String::new())
    }
}

/// Serve the machine-control protocol on a Unix socket under `dir`.
/// `handler` maps (command, arguments) to the objects to write: events
/// first, the response last.
pub async fn run_qmp_stub<F>(dir: &Path, greeting: Value, mut handler: F) -> PathBuf
where
    F: FnMut(&str, Option<&Value>) -> Vec<Value> + Send + 'static,
{
    let path = dir.join("qmp.sock");
    let listener = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);

        let mut line = greeting.to_string();
        line.push('\n');
        let _ = write.write_all(line.as_bytes()).await;

        loop {
            let mut request = String::new();
            match reader.read_line(&mut request).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            let Ok(request) = serde_json::from_str::<Value>(request.trim()) else {
                continue;
            };
            let command = request
                .get("execute")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            for object in handler(&command, request.get("arguments")) {
                let mut line = object.to_string();
                line.push('\n');
                if write.write_all(line.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });

    path
}

/// A machine-control stub that acknowledges everything and records the
/// human-monitor command lines it sees.
pub fn scripted_monitor(
    seen: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
) -> impl FnMut(&str, Option<&Value>) -> Vec<Value> + Send + 'static {
    move |command: &str, args: Option<&Value>| {
        if command == "human-monitor-command" {
            let line = args
                .and_then(|a| a.get("command-line"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            seen.lock().unwrap().push(line.clone());
            if line == "info snapshots" {
                return vec![json!({
                    "return": "List of snapshots present on all disks:\n\
                               ID        TAG                 VM SIZE\n\
                               1         boot                 12.3M\n"
                })];
            }
            return vec![json!({ "return": "" })];
        }
        vec![json!({ "return": {} })]
    }
}

pub fn default_greeting() -> Value {
    json!({ "QMP": { "version": { "qemu": { "major": 8, "minor": 2, "micro": 0 } }, "capabilities": [] } })
}
