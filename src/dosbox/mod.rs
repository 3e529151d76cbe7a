//! Session-based backend: every operation launches a dedicated emulator
//! process with a synthesized configuration and debugger script, waits for
//! it to exit, and harvests the produced artifacts. The backend object
//! itself is a stateless factory for such sessions.

pub mod config;
pub mod logparse;

use crate::address::Address;
use crate::backend::{BackendEvent, BackendInfo, BackendKind, BackendStatus, SnapshotHandle};
use crate::capture::CaptureRequest;
use crate::error::{Error, Result};
use crate::register::RegisterFile;
use chrono::{DateTime, Utc};
use config::{DebugScript, DosboxConf};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Default bound on one emulator session.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default AUTOTYPE pre-wait (seconds) and per-key period (seconds).
const DEFAULT_AUTOTYPE_WAIT_S: f64 = 3.0;
const DEFAULT_KEY_PERIOD_S: f64 = 0.15;

const EVENT_CAPACITY: usize = 16;

/// Resolved host-side inputs of the session backend.
#[derive(Debug, Clone)]
pub struct DosboxConfig {
    /// Emulator binary.
    pub binary: PathBuf,
    /// Host directory mounted as the DOS C: drive.
    pub drive_c: PathBuf,
    /// Where synthesized conf files go.
    pub conf_dir: PathBuf,
    /// Where session logs, debug scripts and dumps go.
    pub captures_dir: PathBuf,
    /// Save-state directory (`*.dsx`).
    pub states_dir: PathBuf,
    /// Game executable started from autoexec, if any.
    pub game_exe: Option<String>,
    /// Game ISO mounted as D:, if any.
    pub game_iso: Option<PathBuf>,
    /// Existing conf file to seed session configs from. Its sections
    /// survive; the log file and autoexec are rebuilt per session.
    pub conf_template: Option<PathBuf>,
    pub session_timeout: Duration,
}

/// Artifacts harvested from a single capture session.
pub struct SessionHarvest {
    pub framebuffer: Option<Vec<u8>>,
    pub registers: RegisterFile,
    pub extra: BTreeMap<String, Vec<u8>>,
}

pub struct DosboxBackend {
    config: DosboxConfig,
    events: broadcast::Sender<BackendEvent>,
}

impl DosboxBackend {
    pub fn new(config: DosboxConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        DosboxBackend { config, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }

    /// The session backend has no long-lived connection; its status is
    /// always `disconnected` and an operation failure changes nothing.
    pub fn info(&self) -> BackendInfo {
        BackendInfo {
            backend: BackendKind::Dosbox,
            status: BackendStatus::Disconnected,
            pid: None,
            qmp_connected: None,
            gdb_connected: None,
        }
    }

    fn log_path(&self, tag: &str) -> PathBuf {
        self.config.captures_dir.join(format!("_session_{tag}.log"))
    }

    /// Baseline conf for one session: the template file when one is
    /// configured (its sections kept, log and autoexec rebuilt), defaults
    /// otherwise, with the configured game environment appended to autoexec.
    fn session_conf(&self, tag: &str, autotype: Option<String>) -> Result<DosboxConf> {
        let log_path = self.log_path(tag);
        let mut conf = match &self.config.conf_template {
            Some(template) if template.exists() => {
                let mut conf = DosboxConf::from_file(template)?;
                conf.set("log", "logfile", log_path.to_string_lossy());
                conf.set_autoexec([
                    format!("MOUNT C \"{}\"", self.config.drive_c.display()),
                    "C:".to_string(),
                ]);
                conf
            }
            _ => DosboxConf::defaults(&self.config.drive_c, &log_path),
        };
        if let Some(iso) = &self.config.game_iso {
            conf.push_autoexec(DosboxConf::imgmount_line(iso));
        }
        if let Some(line) = autotype {
            conf.push_autoexec(line);
        }
        if let Some(exe) = &self.config.game_exe {
            conf.push_autoexec("CD \\GAME");
            conf.push_autoexec(exe.clone());
        }
        Ok(conf)
    }

    /// Write the session inputs and run the emulator to completion, killing
    /// it when the bound expires.
    async fn run_session(
        &self,
        tag: &str,
        mut conf: DosboxConf,
        script: Option<&DebugScript>,
        bound: Duration,
    ) -> Result<()> {
        let conf_path = self.config.conf_dir.join(format!("_session_{tag}.conf"));
        let mut args: Vec<String> = Vec::new();

        if let Some(script) = script {
            let script_path = self.config.captures_dir.join(format!("_session_{tag}.cmd"));
            script.write(&script_path).await?;
            conf.set("debugger", "debugrunfile", script_path.to_string_lossy());
            args.push("-startdebugger".to_string());
        }
        conf.write(&conf_path).await?;

        debug!(
            target: "backend",
            "session `{tag}`: {} -conf {} {}",
            self.config.binary.display(),
            conf_path.display(),
            args.join(" ")
        );

        let mut child = Command::new(&self.config.binary)
            .arg("-conf")
            .arg(&conf_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        match timeout(bound, child.wait()).await {
            Ok(status) => {
                debug!(target: "backend", "session `{tag}` exited: {:?}", status?);
                Ok(())
            }
            Err(_) => {
                warn!(target: "backend", "session `{tag}` timed out after {bound:?}, killing");
                let _ = child.kill().await;
                Ok(())
            }
        }
    }

    async fn harvest(&self, path: &PathBuf) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .map_err(|_| Error::MissingArtifact(path.clone()))
    }

    /// Dump guest memory by scripting the built-in debugger. The bytes
    /// reflect the guest at the moment the scripted dump command runs,
    /// i.e. after the script's `continue` has passed the session's startup
    /// (and the optional breakpoint).
    pub async fn read_memory(&self, addr: Address, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let out = self.config.captures_dir.join("_session_memdump.bin");
        let _ = tokio::fs::remove_file(&out).await;

        let mut script = DebugScript::new();
        script
            .continue_exec()
            .memdump_bin(addr.seg_off(), size as u32, &out)
            .show_registers();

        let conf = self.session_conf("memdump", None)?;
        self.run_session("memdump", conf, Some(&script), self.config.session_timeout)
            .await?;
        self.harvest(&out).await
    }

    /// Capture the register file by scripting a `show registers` and parsing
    /// the session log.
    pub async fn read_registers(&self) -> Result<RegisterFile> {
        let mut script = DebugScript::new();
        script.continue_exec().show_registers();

        let conf = self.session_conf("registers", None)?;
        self.run_session("registers", conf, Some(&script), self.config.session_timeout)
            .await?;
        Ok(logparse::parse_log(&self.log_path("registers")).await)
    }

    /// Inject keystrokes via an auto-type autoexec line.
    pub async fn send_keys(&self, keys: &[String], delay_ms: Option<u64>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let period = delay_ms
            .map(|ms| ms as f64 / 1000.0)
            .unwrap_or(DEFAULT_KEY_PERIOD_S);
        let autotype = DosboxConf::autotype_line(keys, DEFAULT_AUTOTYPE_WAIT_S, period);
        let conf = self.session_conf("keys", Some(autotype))?;
        self.run_session("keys", conf, None, self.config.session_timeout)
            .await
    }

    /// One session doing the whole capture: optional breakpoint, key
    /// injection, framebuffer and extra-range dumps, register dump.
    pub async fn capture_session(&self, request: &CaptureRequest) -> Result<SessionHarvest> {
        let tag = format!("{}_capture", request.prefix);
        let bound = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.session_timeout);

        let mut script = DebugScript::new();
        if let Some(bp) = request.breakpoint {
            script.breakpoint(bp.seg_off());
        }
        script.continue_exec();

        let fb_path = self
            .config
            .captures_dir
            .join(format!("{}_framebuffer.bin", request.prefix));
        if !request.skip_framebuffer {
            let _ = tokio::fs::remove_file(&fb_path).await;
            script.memdump_bin(
                crate::capture::FRAMEBUFFER_ADDRESS.seg_off(),
                crate::capture::FRAMEBUFFER_SIZE as u32,
                &fb_path,
            );
        }

        let mut extra_paths = Vec::new();
        for range in &request.extra_ranges {
            let path = self.config.captures_dir.join(&range.file);
            let _ = tokio::fs::remove_file(&path).await;
            script.memdump_bin(range.address.seg_off(), range.size as u32, &path);
            extra_paths.push((range.file.clone(), path));
        }
        script.show_registers();

        let autotype = request.keys.as_deref().filter(|k| !k.is_empty()).map(|keys| {
            let period = request
                .key_delay_ms
                .map(|ms| ms as f64 / 1000.0)
                .unwrap_or(DEFAULT_KEY_PERIOD_S);
            let wait = request
                .wait_time_ms
                .map(|ms| ms as f64 / 1000.0)
                .unwrap_or(DEFAULT_AUTOTYPE_WAIT_S);
            DosboxConf::autotype_line(keys, wait, period)
        });

        let conf = self.session_conf(&tag, autotype)?;
        self.run_session(&tag, conf, Some(&script), bound).await?;

        let framebuffer = if request.skip_framebuffer {
            None
        } else {
            Some(self.harvest(&fb_path).await?)
        };

        let mut extra = BTreeMap::new();
        for (name, path) in extra_paths {
            extra.insert(name, self.harvest(&path).await?);
        }

        let registers = logparse::parse_log(&self.log_path(&tag)).await;
        Ok(SessionHarvest {
            framebuffer,
            registers,
            extra,
        })
    }

    /// Enumerate named save states (`*.dsx` files in the states directory).
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotHandle>> {
        let mut handles = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config.states_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(handles),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("dsx") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let meta = entry.metadata().await?;
            handles.push(SnapshotHandle {
                name: name.to_string(),
                backend: BackendKind::Dosbox,
                size: Some(meta.len()),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                path: Some(path.clone()),
            });
        }
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(handles)
    }
}
