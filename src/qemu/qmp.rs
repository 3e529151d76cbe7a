//! Machine-control client: newline-delimited JSON request/response over the
//! emulator's local control socket, with a greeting handshake, capability
//! negotiation and an out-of-band event stream.

use crate::error::{Error, Result};
use log::{debug, trace};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, timeout};

/// Bound on the greeting exchange; afterwards responses are bounded only by
/// request latency (the control plane answers in request order).
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// Default key hold time in milliseconds.
pub const DEFAULT_HOLD_MS: u64 = 100;

#[derive(Debug)]
pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    events: UnboundedSender<Value>,
}

impl QmpClient {
    /// Connect to the control socket, verify the greeting and negotiate
    /// capabilities. Asynchronous events arrive on the returned receiver.
    pub async fn connect(path: &Path) -> Result<(Self, UnboundedReceiver<Value>)> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| Error::connection(format!("control socket {}: {e}", path.display())))?;
        let (read, writer) = stream.into_split();
        let (events, events_rx) = mpsc::unbounded_channel();
        let mut client = QmpClient {
            reader: BufReader::new(read),
            writer,
            events,
        };

        let greeting = timeout(GREETING_TIMEOUT, client.read_object())
            .await
            .map_err(|_| Error::Timeout(GREETING_TIMEOUT))??;
        if greeting.get("QMP").is_none() {
            return Err(Error::BadGreeting);
        }
        debug!(target: "qmp", "greeting received: {greeting}");

        // Until capabilities are enabled the control plane rejects commands.
        client.execute("qmp_capabilities", None).await?;
        Ok((client, events_rx))
    }

    /// Read the next JSON object from the stream. Objects are one per line;
    /// the terminal message (e.g. the `quit` reply) may omit the newline, in
    /// which case the whole remaining buffer is parsed as one object.
    async fn read_object(&mut self) -> Result<Value> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(Error::connection("control socket closed"));
        }
        let trimmed = line.trim();
        serde_json::from_str(trimmed).map_err(Error::from)
    }

    /// Issue a command and wait for its response. Event objects that arrive
    /// in between are forwarded on the event channel.
    pub async fn execute(&mut self, command: &str, args: Option<Value>) -> Result<Value> {
        let mut request = json!({ "execute": command });
        if let Some(args) = args {
            request["arguments"] = args;
        }
        trace!(target: "qmp", "-> {request}");
        let mut payload = request.to_string();
        payload.push('\n');
        self.writer.write_all(payload.as_bytes()).await?;

        loop {
            let obj = self.read_object().await?;
            trace!(target: "qmp", "<- {obj}");
            if let Some(ret) = obj.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = obj.get("error") {
                return Err(Error::protocol(
                    err.get("class").and_then(Value::as_str).unwrap_or("GenericError"),
                    err.get("desc").and_then(Value::as_str).unwrap_or("unknown error"),
                ));
            }
            // neither `return` nor `error`: an asynchronous event
            let _ = self.events.send(obj);
        }
    }

    /// Run a human-monitor command and return its textual output.
    pub async fn human_monitor(&mut self, command_line: &str) -> Result<String> {
        let ret = self
            .execute(
                "human-monitor-command",
                Some(json!({ "command-line": command_line })),
            )
            .await?;
        Ok(ret.as_str().unwrap_or_default().to_string())
    }

    /// Inject one key press by qcode name, held for `hold_ms` milliseconds.
    pub async fn send_key(&mut self, key: &str, hold_ms: u64) -> Result<()> {
        self.execute(
            "send-key",
            Some(json!({
                "keys": [{ "type": "qcode", "data": key }],
                "hold-time": hold_ms,
            })),
        )
        .await?;
        Ok(())
    }

    /// Inject a key sequence with an inter-key pause.
    pub async fn send_keys_sequence(&mut self, keys: &[String], delay_ms: u64) -> Result<()> {
        for key in keys {
            self.send_key(key, DEFAULT_HOLD_MS).await?;
            sleep(Duration::from_millis(delay_ms)).await;
        }
        Ok(())
    }

    /// Dump the emulated screen to `path` (PPM).
    pub async fn screendump(&mut self, path: &Path) -> Result<()> {
        self.execute(
            "screendump",
            Some(json!({ "filename": path.to_string_lossy() })),
        )
        .await?;
        Ok(())
    }

    /// Save the guest state under `name`. The underlying `savevm` pauses the
    /// virtual CPUs, so execution is resumed right after.
    pub async fn save_snapshot(&mut self, name: &str) -> Result<()> {
        self.human_monitor(&format!("savevm {name}")).await?;
        self.execute("cont", None).await?;
        Ok(())
    }

    /// Restore the guest state saved under `name`.
    pub async fn load_snapshot(&mut self, name: &str) -> Result<()> {
        self.human_monitor(&format!("loadvm {name}")).await?;
        Ok(())
    }

    /// Write `size` bytes of guest physical memory at `addr` to `path`.
    pub async fn pmem_save(&mut self, addr: u64, size: u64, path: &Path) -> Result<()> {
        self.execute(
            "pmemsave",
            Some(json!({
                "val": addr,
                "size": size,
                "filename": path.to_string_lossy(),
            })),
        )
        .await?;
        Ok(())
    }

    /// Ask the emulator to exit. The reply (or the socket) may disappear mid
    /// exchange; that is not an error here.
    pub async fn quit(&mut self) -> Result<()> {
        match self.execute("quit", None).await {
            Ok(_) => Ok(()),
            Err(Error::Connection(_)) | Err(Error::IO(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
