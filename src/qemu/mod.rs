//! Socket-based backend: composes the process launcher with the
//! machine-control and remote-debug clients behind the common contract.
//! Every primitive runs through a single fair lock, so operations complete
//! in submission order and neither protocol client ever sees interleaved
//! requests.

pub mod gdb;
pub mod launcher;
pub mod qmp;

use crate::address::Address;
use crate::backend::{
    BackendEvent, BackendInfo, BackendKind, BackendStatus, Breakpoint, BreakpointKind,
    BreakpointRequest, ImageFormat, SnapshotHandle,
};
use crate::error::{Error, Result};
use crate::register::RegisterFile;
use crate::weak_error;
use gdb::GdbClient;
use itertools::Itertools;
use launcher::LaunchConfig;
use log::{debug, info, warn};
use qmp::QmpClient;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;

/// Poll-connect budget after launching a child.
const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default inter-key pause for injected sequences.
const DEFAULT_KEY_DELAY_MS: u64 = 100;

const EVENT_CAPACITY: usize = 64;

struct Inner {
    status: BackendStatus,
    config: LaunchConfig,
    qmp: Option<QmpClient>,
    gdb: Option<GdbClient>,
    /// Child process, present only when this backend launched it.
    child: Option<Child>,
    breakpoints: HashMap<u32, Breakpoint>,
    next_breakpoint_id: u32,
}

pub struct QemuBackend {
    inner: Mutex<Inner>,
    events: broadcast::Sender<BackendEvent>,
}

impl QemuBackend {
    pub fn new(config: LaunchConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        QemuBackend {
            inner: Mutex::new(Inner {
                status: BackendStatus::Disconnected,
                config,
                qmp: None,
                gdb: None,
                child: None,
                breakpoints: HashMap::new(),
                next_breakpoint_id: 1,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    fn info_locked(inner: &Inner) -> BackendInfo {
        BackendInfo {
            backend: BackendKind::Qemu,
            status: inner.status,
            pid: inner.child.as_ref().and_then(Child::id),
            qmp_connected: Some(inner.qmp.is_some()),
            gdb_connected: Some(inner.gdb.as_ref().is_some_and(GdbClient::is_connected)),
        }
    }

    fn set_status(&self, inner: &mut Inner, status: BackendStatus) {
        if inner.status != status {
            inner.status = status;
            let _ = self.events.send(BackendEvent::Status(Self::info_locked(inner)));
        }
    }

    pub async fn info(&self) -> BackendInfo {
        Self::info_locked(&*self.inner.lock().await)
    }

    fn gdb_addr(config: &LaunchConfig) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.gdb_port)
    }

    /// Open both protocol clients against the configured endpoints. Either
    /// both come up or neither does.
    async fn open_clients(config: &LaunchConfig) -> Result<(QmpClient, GdbClient)> {
        let qmp_path = config
            .qmp_socket
            .as_deref()
            .ok_or_else(|| Error::Argument("machine-control socket path not configured".into()))?;

        let (qmp, mut qmp_events) = QmpClient::connect(qmp_path).await?;
        let gdb = match GdbClient::connect(Self::gdb_addr(config), CONNECT_TIMEOUT).await {
            Ok(gdb) => gdb,
            Err(e) => {
                // half-open is worse than closed
                drop(qmp);
                return Err(e);
            }
        };

        tokio::spawn(async move {
            while let Some(event) = qmp_events.recv().await {
                debug!(target: "qmp", "event: {event}");
            }
        });

        Ok((qmp, gdb))
    }

    /// Attach to an emulator that is already running; the child is not ours.
    pub async fn connect_to_running(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let opened = Self::open_clients(&inner.config).await;
        match opened {
            Ok((qmp, gdb)) => {
                inner.qmp = Some(qmp);
                inner.gdb = Some(gdb);
                self.set_status(&mut inner, BackendStatus::Running);
                Ok(())
            }
            Err(e) => {
                self.set_status(&mut inner, BackendStatus::Error);
                Err(e)
            }
        }
    }

    /// Spawn a child and poll-connect both clients with bounded retries.
    /// Status becomes `running` only when both are up.
    pub async fn launch(&self, config: LaunchConfig) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.config = config;
        self.set_status(&mut inner, BackendStatus::Launching);

        let spawned = inner.config.spawn().await;
        let child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.set_status(&mut inner, BackendStatus::Disconnected);
                return Err(e);
            }
        };
        inner.child = Some(child);

        for attempt in 1..=CONNECT_ATTEMPTS {
            let opened = Self::open_clients(&inner.config).await;
            match opened {
                Ok((qmp, gdb)) => {
                    inner.qmp = Some(qmp);
                    inner.gdb = Some(gdb);
                    self.set_status(&mut inner, BackendStatus::Running);
                    info!(target: "backend", "emulator up after {attempt} connect attempts");
                    return Ok(());
                }
                Err(e) => {
                    debug!(target: "backend", "connect attempt {attempt}/{CONNECT_ATTEMPTS}: {e}");
                    sleep(CONNECT_INTERVAL).await;
                }
            }
        }

        if let Some(mut child) = inner.child.take() {
            weak_error!(child.kill().await, "kill unreachable child:");
        }
        self.set_status(&mut inner, BackendStatus::Disconnected);
        Err(Error::ConnectRetriesExhausted {
            attempts: CONNECT_ATTEMPTS,
        })
    }

    /// Close both clients but leave the child alive.
    pub async fn disconnect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut gdb) = inner.gdb.take() {
            gdb.close().await;
        }
        inner.qmp = None;
        self.set_status(&mut inner, BackendStatus::Disconnected);
        Ok(())
    }

    /// Quit via machine control (best-effort), disconnect, then kill an
    /// owned child.
    pub async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut qmp) = inner.qmp.take() {
            weak_error!(qmp.quit().await, "quit request:");
        }
        if let Some(mut gdb) = inner.gdb.take() {
            gdb.close().await;
        }
        if let Some(mut child) = inner.child.take() {
            weak_error!(child.kill().await, "kill emulator child:");
        }
        inner.breakpoints.clear();
        self.set_status(&mut inner, BackendStatus::Disconnected);
        Ok(())
    }

    pub async fn read_memory(&self, addr: Address, size: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        let gdb = inner.gdb.as_mut().ok_or(Error::NotConnected)?;
        gdb.read_memory(addr.linear(), size).await
    }

    pub async fn write_memory(&self, addr: Address, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let gdb = inner.gdb.as_mut().ok_or(Error::NotConnected)?;
        gdb.write_memory(addr.linear(), data).await
    }

    pub async fn read_registers(&self) -> Result<RegisterFile> {
        let mut inner = self.inner.lock().await;
        let gdb = inner.gdb.as_mut().ok_or(Error::NotConnected)?;
        gdb.read_registers().await
    }

    pub async fn send_keys(&self, keys: &[String], delay_ms: Option<u64>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let qmp = inner.qmp.as_mut().ok_or(Error::NotConnected)?;
        qmp.send_keys_sequence(keys, delay_ms.unwrap_or(DEFAULT_KEY_DELAY_MS))
            .await
    }

    /// Screendump to a scratch file, read back as PPM bytes.
    pub async fn screenshot(&self) -> Result<(Vec<u8>, ImageFormat)> {
        let mut inner = self.inner.lock().await;
        let qmp = inner.qmp.as_mut().ok_or(Error::NotConnected)?;
        let scratch = tempfile::Builder::new()
            .prefix("dosprobe-screen")
            .suffix(".ppm")
            .tempfile()?;
        qmp.screendump(scratch.path()).await?;
        let bytes = tokio::fs::read(scratch.path()).await?;
        Ok((bytes, ImageFormat::Ppm))
    }

    pub async fn set_breakpoint(&self, request: BreakpointRequest) -> Result<Breakpoint> {
        if request.kind != BreakpointKind::Execution {
            return Err(Error::NotSupported("non-execution breakpoints", "qemu"));
        }
        let address = request
            .address
            .ok_or_else(|| Error::Argument("breakpoint address required".into()))?;

        let mut inner = self.inner.lock().await;
        let gdb = inner.gdb.as_mut().ok_or(Error::NotConnected)?;
        gdb.set_breakpoint(address.linear()).await?;

        let id = inner.next_breakpoint_id;
        inner.next_breakpoint_id += 1;
        let breakpoint = Breakpoint {
            id,
            kind: BreakpointKind::Execution,
            address: Some(address),
            int_num: None,
            ah: None,
            enabled: true,
        };
        inner.breakpoints.insert(id, breakpoint.clone());
        Ok(breakpoint)
    }

    pub async fn remove_breakpoint(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let breakpoint = inner
            .breakpoints
            .remove(&id)
            .ok_or_else(|| Error::Argument(format!("no breakpoint with id {id}")))?;
        if let Some(address) = breakpoint.address {
            let gdb = inner.gdb.as_mut().ok_or(Error::NotConnected)?;
            gdb.remove_breakpoint(address.linear()).await?;
        }
        Ok(())
    }

    pub async fn list_breakpoints(&self) -> Vec<Breakpoint> {
        let inner = self.inner.lock().await;
        inner
            .breakpoints
            .values()
            .cloned()
            .sorted_by_key(|bp| bp.id)
            .collect()
    }

    /// Interrupt the guest, consume the stop notification and return the
    /// register file at the stop point.
    pub async fn pause(&self) -> Result<RegisterFile> {
        let mut inner = self.inner.lock().await;
        let gdb = inner.gdb.as_mut().ok_or(Error::NotConnected)?;
        gdb.stop().await?;
        let stop = gdb.wait_stop(gdb::RECV_TIMEOUT).await?;
        debug!(target: "gdb", "paused: {stop}");
        let registers = gdb.read_registers().await?;
        self.set_status(&mut inner, BackendStatus::Paused);
        Ok(registers)
    }

    pub async fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let gdb = inner.gdb.as_mut().ok_or(Error::NotConnected)?;
        gdb.cont().await?;
        self.set_status(&mut inner, BackendStatus::Running);
        Ok(())
    }

    /// Single-step one instruction and return the fresh register file.
    pub async fn step(&self) -> Result<RegisterFile> {
        let mut inner = self.inner.lock().await;
        let gdb = inner.gdb.as_mut().ok_or(Error::NotConnected)?;
        let stop = gdb.step().await?;
        debug!(target: "gdb", "step stop: {stop}");
        let registers = gdb.read_registers().await?;
        self.set_status(&mut inner, BackendStatus::Paused);
        let _ = self.events.send(BackendEvent::StepComplete {
            registers: registers.clone(),
        });
        Ok(registers)
    }

    /// Wait for the guest to stop (breakpoint hit or break byte). Emits a
    /// `breakpoint:hit` event carrying the registers at the stop point.
    pub async fn wait_stop(&self, bound: Duration) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let gdb = inner.gdb.as_mut().ok_or(Error::NotConnected)?;
        let payload = gdb.wait_stop(bound).await?;
        let registers = gdb.read_registers().await?;
        self.set_status(&mut inner, BackendStatus::Paused);
        let _ = self.events.send(BackendEvent::BreakpointHit { registers });
        Ok(payload)
    }

    pub async fn save_snapshot(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let qmp = inner.qmp.as_mut().ok_or(Error::NotConnected)?;
        qmp.save_snapshot(name).await
    }

    /// Restore a named snapshot. Emits `snapshot:loading` strictly before
    /// the machine-control request and `snapshot:loaded` / `load-failed`
    /// strictly after; breakpoints do not survive the restored memory image
    /// so the table (and the stub) are cleared first. A failed load leaves
    /// the guest in an indeterminate state, surfaced as `error`.
    pub async fn load_snapshot(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.qmp.is_none() {
            return Err(Error::NotConnected);
        }

        let _ = self.events.send(BackendEvent::SnapshotLoading {
            name: name.to_string(),
        });
        self.set_status(&mut inner, BackendStatus::Paused);

        let stale: Vec<_> = inner.breakpoints.drain().map(|(_, bp)| bp).collect();
        if let Some(gdb) = inner.gdb.as_mut() {
            for bp in stale {
                if let Some(address) = bp.address {
                    weak_error!(
                        gdb.remove_breakpoint(address.linear()).await,
                        "clear breakpoint before snapshot load:"
                    );
                }
            }
        }

        let result = inner
            .qmp
            .as_mut()
            .expect("checked above")
            .load_snapshot(name)
            .await;

        match result {
            Ok(()) => {
                let _ = self.events.send(BackendEvent::SnapshotLoaded {
                    name: name.to_string(),
                });
                self.set_status(&mut inner, BackendStatus::Running);
                Ok(())
            }
            Err(e) => {
                warn!(target: "backend", "snapshot load `{name}` failed: {e}");
                let _ = self.events.send(BackendEvent::SnapshotLoadFailed {
                    name: name.to_string(),
                    error: e.to_string(),
                });
                self.set_status(&mut inner, BackendStatus::Error);
                Err(e)
            }
        }
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>> {
        let mut inner = self.inner.lock().await;
        let qmp = inner.qmp.as_mut().ok_or(Error::NotConnected)?;
        let listing = qmp.human_monitor("info snapshots").await?;
        Ok(parse_snapshot_list(&listing)
            .into_iter()
            .map(|name| SnapshotHandle {
                name,
                backend: BackendKind::Qemu,
                size: None,
                modified: None,
                path: None,
            })
            .collect())
    }
}

/// Pull snapshot names out of the human-monitor `info snapshots` listing.
/// The exact layout varies between emulator versions; banner and header
/// lines are skipped and the leading identifier of each remaining line is
/// taken (the tag column when the id column is a placeholder).
fn parse_snapshot_list(listing: &str) -> Vec<String> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.starts_with("List of snapshots"))
        .filter(|line| !line.starts_with("There is no snapshot"))
        .filter(|line| {
            let mut cols = line.split_whitespace();
            !matches!(cols.next(), Some("ID") | Some("Tag") | Some("TAG"))
        })
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            match cols.next() {
                Some("--") => cols.next().map(str::to_string),
                Some(id) => Some(id.to_string()),
                None => None,
            }
        })
        .collect()
}
