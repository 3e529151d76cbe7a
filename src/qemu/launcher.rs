//! Builds the emulator command line from a typed launch configuration and
//! spawns the child, surfacing early exits as typed errors.

use crate::error::{Error, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::sleep;

/// Grace period after spawn before declaring the child alive.
const START_GRACE: Duration = Duration::from_millis(500);

/// Default TCP port of the remote-debug stub.
pub const DEFAULT_GDB_PORT: u16 = 1234;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Interactive,
    Record,
    Replay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    /// Emulator binary to execute.
    pub program: PathBuf,
    /// Primary hard disk image. Exactly one hard disk is always attached.
    pub disk_image: PathBuf,
    /// Shared utilities ISO; takes the secondary optical slot when a game
    /// ISO is present, the primary one otherwise.
    pub shared_iso: Option<PathBuf>,
    /// Game ISO; always the primary optical slot.
    pub game_iso: Option<PathBuf>,
    pub mode: RunMode,
    /// No local display surface; null audio backend.
    pub headless: bool,
    /// Expose a VNC server on this TCP port (display index `port - 5900`).
    pub vnc_port: Option<u16>,
    /// Windowed display backend when neither headless nor VNC.
    pub display: String,
    pub memory_mb: u32,
    pub gdb_port: u16,
    /// Machine-control socket path, when machine control is wanted.
    pub qmp_socket: Option<PathBuf>,
    /// Deterministic record/replay journal, required for those modes.
    pub replay_file: Option<PathBuf>,
    /// Snapshot to restore at startup.
    pub initial_snapshot: Option<String>,
    /// Whether the child is spawned with an interactive stdio.
    pub interactive: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        LaunchConfig {
            program: PathBuf::from("qemu-system-i386"),
            disk_image: PathBuf::new(),
            shared_iso: None,
            game_iso: None,
            mode: RunMode::Interactive,
            headless: false,
            vnc_port: None,
            display: "sdl".to_string(),
            memory_mb: 32,
            gdb_port: DEFAULT_GDB_PORT,
            qmp_socket: None,
            replay_file: None,
            initial_snapshot: None,
            interactive: false,
        }
    }
}

#[cfg(target_os = "macos")]
fn host_audio_backend() -> &'static str {
    "coreaudio"
}

#[cfg(target_os = "linux")]
fn host_audio_backend() -> &'static str {
    "pa"
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn host_audio_backend() -> &'static str {
    "sdl"
}

impl LaunchConfig {
    fn is_deterministic(&self) -> bool {
        matches!(self.mode, RunMode::Record | RunMode::Replay)
    }

    /// Assemble the child's argument vector.
    pub fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec!["-m".into(), self.memory_mb.to_string()];

        // One hard disk, always. Record/replay runs discard writes so the
        // journal stays replayable against a pristine image.
        let mut hd = format!(
            "file={},media=disk,format=raw",
            self.disk_image.display()
        );
        if self.is_deterministic() {
            hd.push_str(",snapshot=on");
        }
        args.push("-drive".into());
        args.push(hd);

        // Optical topology: the game owns the primary slot whenever both
        // images are present.
        match (&self.game_iso, &self.shared_iso) {
            (Some(game), Some(shared)) => {
                args.push("-drive".into());
                args.push(format!("file={},media=cdrom,index=2", game.display()));
                args.push("-drive".into());
                args.push(format!("file={},media=cdrom,index=3", shared.display()));
            }
            (Some(single), None) | (None, Some(single)) => {
                args.push("-drive".into());
                args.push(format!("file={},media=cdrom,index=2", single.display()));
            }
            (None, None) => {}
        }

        if self.headless {
            args.push("-display".into());
            args.push("none".into());
        }
        if let Some(port) = self.vnc_port {
            args.push("-vnc".into());
            args.push(format!(":{}", port.saturating_sub(5900)));
        } else if !self.headless {
            args.push("-display".into());
            args.push(self.display.clone());
        }

        let audio = if self.headless {
            "none"
        } else {
            host_audio_backend()
        };
        args.push("-audiodev".into());
        args.push(format!("{audio},id=snd0"));
        args.push("-device".into());
        args.push("sb16,audiodev=snd0".into());

        args.push("-gdb".into());
        args.push(format!("tcp::{}", self.gdb_port));

        if let Some(qmp) = &self.qmp_socket {
            args.push("-qmp".into());
            args.push(format!("unix:{},server,nowait", qmp.display()));
        }

        if self.interactive && matches!(self.mode, RunMode::Interactive | RunMode::Record) {
            args.push("-monitor".into());
            args.push("stdio".into());
        }

        if let Some(journal) = &self.replay_file {
            let rr = match self.mode {
                RunMode::Record => Some("record"),
                RunMode::Replay => Some("replay"),
                RunMode::Interactive => None,
            };
            if let Some(rr) = rr {
                args.push("-icount".into());
                args.push(format!("shift=auto,rr={rr},rrfile={}", journal.display()));
            }
        }

        if let Some(snapshot) = &self.initial_snapshot {
            args.push("-loadvm".into());
            args.push(snapshot.clone());
        }

        args
    }

    /// Spawn the emulator. Waits a short grace period and, if the child has
    /// already exited, raises [`Error::EarlyExit`] with the captured stderr.
    pub async fn spawn(&self) -> Result<Child> {
        let args = self.to_args();
        debug!(target: "backend", "spawning {} {}", self.program.display(), args.join(" "));

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.interactive {
            command.stdin(Stdio::inherit());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn()?;
        sleep(START_GRACE).await;

        if child.try_wait()?.is_some() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            return Err(Error::EarlyExit {
                stderr: (!stderr.is_empty()).then_some(stderr),
            });
        }

        info!(target: "backend", "emulator started (pid {:?})", child.id());
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> LaunchConfig {
        LaunchConfig {
            disk_image: PathBuf::from("/images/hd.img"),
            ..LaunchConfig::default()
        }
    }

    fn joined(config: &LaunchConfig) -> String {
        config.to_args().join(" ")
    }

    #[test]
    fn game_iso_takes_primary_optical_slot() {
        let mut config = base();
        config.game_iso = Some(PathBuf::from("/images/game.iso"));
        config.shared_iso = Some(PathBuf::from("/images/shared.iso"));
        let args = joined(&config);
        assert!(args.contains("file=/images/game.iso,media=cdrom,index=2"));
        assert!(args.contains("file=/images/shared.iso,media=cdrom,index=3"));
    }

    #[test]
    fn lone_shared_iso_goes_primary() {
        let mut config = base();
        config.shared_iso = Some(PathBuf::from("/images/shared.iso"));
        let args = joined(&config);
        assert!(args.contains("file=/images/shared.iso,media=cdrom,index=2"));
        assert!(!args.contains("index=3"));
    }

    #[test]
    fn headless_disables_display_and_audio() {
        let mut config = base();
        config.headless = true;
        let args = joined(&config);
        assert!(args.contains("-display none"));
        assert!(args.contains("-audiodev none,id=snd0"));
        assert!(args.contains("sb16,audiodev=snd0"));
    }

    #[test]
    fn vnc_display_index_is_port_minus_5900() {
        let mut config = base();
        config.headless = true;
        config.vnc_port = Some(5905);
        assert!(joined(&config).contains("-vnc :5"));
    }

    #[test]
    fn monitor_only_for_interactive_spawn() {
        let mut config = base();
        config.mode = RunMode::Record;
        config.replay_file = Some(PathBuf::from("/tmp/run.rr"));
        assert!(!joined(&config).contains("-monitor"));

        config.interactive = true;
        let args = joined(&config);
        assert!(args.contains("-monitor stdio"));
        assert!(args.contains("shift=auto,rr=record,rrfile=/tmp/run.rr"));
        assert!(args.contains("snapshot=on"));
    }

    #[test]
    fn gdb_stub_always_on() {
        assert!(joined(&base()).contains("-gdb tcp::1234"));
    }

    #[test]
    fn initial_snapshot_appends_loadvm() {
        let mut config = base();
        config.initial_snapshot = Some("boot".into());
        assert!(joined(&config).contains("-loadvm boot"));
    }
}
