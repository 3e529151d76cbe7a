//! The uniform backend contract: the long-lived socket-driven integration
//! and the process-per-request one sit behind the same surface for memory,
//! registers, breakpoints, execution control, snapshots, input injection
//! and screenshots.

pub mod holder;

pub use holder::BackendHolder;

use crate::address::Address;
use crate::dosbox::{DosboxBackend, DosboxConfig};
use crate::error::{Error, Result};
use crate::qemu::launcher::LaunchConfig;
use crate::qemu::QemuBackend;
use crate::register::RegisterFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Qemu,
    Dosbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Disconnected,
    Launching,
    Running,
    Paused,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub backend: BackendKind,
    pub status: BackendStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qmp_connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gdb_connected: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BreakpointKind {
    #[default]
    Execution,
    Memory,
    Interrupt,
}

/// A breakpoint as requested by a client; the backend issues the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointRequest {
    #[serde(default)]
    pub kind: BreakpointKind,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub int_num: Option<u8>,
    #[serde(default)]
    pub ah: Option<u8>,
}

impl BreakpointRequest {
    pub fn execution(address: Address) -> Self {
        BreakpointRequest {
            kind: BreakpointKind::Execution,
            address: Some(address),
            int_num: None,
            ah: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub id: u32,
    pub kind: BreakpointKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub int_num: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ah: Option<u8>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotHandle {
    pub name: String,
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Native image format of a screenshot, by producing backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Ppm,
    Bmp,
    Png,
}

impl ImageFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ImageFormat::Ppm => "image/x-portable-pixmap",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Png => "image/png",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Ppm => "ppm",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Png => "png",
        }
    }
}

/// Emulator-originated events, fanned out to the broker over a broadcast
/// channel.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    Status(BackendInfo),
    SnapshotLoading { name: String },
    SnapshotLoaded { name: String },
    SnapshotLoadFailed { name: String, error: String },
    BreakpointHit { registers: RegisterFile },
    StepComplete { registers: RegisterFile },
}

/// The currently selected backend. Runtime polymorphism is an enum rather
/// than a trait object so the async contract stays object-safe without
/// boxing every future.
pub enum Backend {
    Qemu(QemuBackend),
    Dosbox(DosboxBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Qemu(_) => BackendKind::Qemu,
            Backend::Dosbox(_) => BackendKind::Dosbox,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        match self {
            Backend::Qemu(b) => b.subscribe(),
            Backend::Dosbox(b) => b.subscribe(),
        }
    }

    pub async fn info(&self) -> BackendInfo {
        match self {
            Backend::Qemu(b) => b.info().await,
            Backend::Dosbox(b) => b.info(),
        }
    }

    pub async fn status(&self) -> BackendStatus {
        self.info().await.status
    }

    /// Spawn an emulator child and connect to it.
    pub async fn launch(&self, config: LaunchConfig) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.launch(config).await,
            Backend::Dosbox(_) => Err(Error::NotSupported("launch", "dosbox")),
        }
    }

    /// Attach to an already running emulator without owning it.
    pub async fn connect_to_running(&self) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.connect_to_running().await,
            Backend::Dosbox(_) => Err(Error::NotSupported("connect", "dosbox")),
        }
    }

    /// Close connections, leaving any child alive.
    pub async fn disconnect(&self) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.disconnect().await,
            Backend::Dosbox(_) => Ok(()),
        }
    }

    /// Tear everything down, killing an owned child.
    pub async fn shutdown(&self) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.shutdown().await,
            Backend::Dosbox(_) => Ok(()),
        }
    }

    pub async fn read_memory(&self, addr: Address, size: usize) -> Result<Vec<u8>> {
        match self {
            Backend::Qemu(b) => b.read_memory(addr, size).await,
            Backend::Dosbox(b) => b.read_memory(addr, size).await,
        }
    }

    pub async fn write_memory(&self, addr: Address, data: &[u8]) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.write_memory(addr, data).await,
            Backend::Dosbox(_) => Err(Error::NotSupported("writeMemory", "dosbox")),
        }
    }

    pub async fn read_registers(&self) -> Result<RegisterFile> {
        match self {
            Backend::Qemu(b) => b.read_registers().await,
            Backend::Dosbox(b) => b.read_registers().await,
        }
    }

    pub async fn send_keys(&self, keys: &[String], delay_ms: Option<u64>) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.send_keys(keys, delay_ms).await,
            Backend::Dosbox(b) => b.send_keys(keys, delay_ms).await,
        }
    }

    pub async fn screenshot(&self) -> Result<(Vec<u8>, ImageFormat)> {
        match self {
            Backend::Qemu(b) => b.screenshot().await,
            Backend::Dosbox(_) => Err(Error::NotSupported("screenshot", "dosbox")),
        }
    }

    pub async fn set_breakpoint(&self, request: BreakpointRequest) -> Result<Breakpoint> {
        match self {
            Backend::Qemu(b) => b.set_breakpoint(request).await,
            Backend::Dosbox(_) => Err(Error::NotSupported("breakpoints", "dosbox")),
        }
    }

    pub async fn remove_breakpoint(&self, id: u32) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.remove_breakpoint(id).await,
            Backend::Dosbox(_) => Err(Error::NotSupported("breakpoints", "dosbox")),
        }
    }

    pub async fn list_breakpoints(&self) -> Result<Vec<Breakpoint>> {
        match self {
            Backend::Qemu(b) => Ok(b.list_breakpoints().await),
            Backend::Dosbox(_) => Err(Error::NotSupported("breakpoints", "dosbox")),
        }
    }

    /// Stop execution; returns the register file at the stop point.
    pub async fn pause(&self) -> Result<RegisterFile> {
        match self {
            Backend::Qemu(b) => b.pause().await,
            Backend::Dosbox(_) => Err(Error::NotSupported("pause", "dosbox")),
        }
    }

    pub async fn resume(&self) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.resume().await,
            Backend::Dosbox(_) => Err(Error::NotSupported("resume", "dosbox")),
        }
    }

    /// Execute one instruction; returns the register file afterwards.
    pub async fn step(&self) -> Result<RegisterFile> {
        match self {
            Backend::Qemu(b) => b.step().await,
            Backend::Dosbox(_) => Err(Error::NotSupported("step", "dosbox")),
        }
    }

    pub async fn save_snapshot(&self, name: &str) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.save_snapshot(name).await,
            Backend::Dosbox(_) => Err(Error::NotSupported("saveSnapshot", "dosbox")),
        }
    }

    pub async fn load_snapshot(&self, name: &str) -> Result<()> {
        match self {
            Backend::Qemu(b) => b.load_snapshot(name).await,
            Backend::Dosbox(_) => Err(Error::NotSupported("loadSnapshot", "dosbox")),
        }
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>> {
        match self {
            Backend::Qemu(b) => b.list_snapshots().await,
            Backend::Dosbox(b) => b.list_snapshots().await,
        }
    }

    /// Capability sniff for the capture pipeline: does this backend expose a
    /// live stop-event to wait on after resuming into a breakpoint?
    pub fn supports_stop_wait(&self) -> bool {
        matches!(self, Backend::Qemu(_))
    }

    /// Wait for the next stop notification. Only meaningful on backends for
    /// which [`Backend::supports_stop_wait`] holds.
    pub async fn wait_stop(&self, bound: Duration) -> Result<String> {
        match self {
            Backend::Qemu(b) => b.wait_stop(bound).await,
            Backend::Dosbox(_) => Err(Error::NotSupported("waitStop", "dosbox")),
        }
    }
}

/// Creates disconnected backends from resolved host paths. Held by the
/// broker and invoked on `backend/select`.
#[derive(Clone)]
pub struct BackendFactory {
    pub qemu_launch: LaunchConfig,
    pub dosbox: DosboxConfig,
}

impl BackendFactory {
    pub fn create(&self, kind: BackendKind) -> Backend {
        match kind {
            BackendKind::Qemu => Backend::Qemu(QemuBackend::new(self.qemu_launch.clone())),
            BackendKind::Dosbox => Backend::Dosbox(DosboxBackend::new(self.dosbox.clone())),
        }
    }
}
