//! Broker binary: resolves host paths from the command line, builds the
//! backend factory, and serves the HTTP/WebSocket control API.

use anyhow::Context;
use clap::Parser;
use dosprobe::backend::{BackendFactory, BackendKind};
use dosprobe::dosbox::{DosboxConfig, DEFAULT_SESSION_TIMEOUT};
use dosprobe::qemu::launcher::{LaunchConfig, DEFAULT_GDB_PORT};
use dosprobe::server::{router, AppState, CaptureDirs};
use log::{info, LevelFilter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dosprobe", version, about = "DOS emulator control plane and live-debug broker")]
struct Args {
    /// Address to serve the control API on.
    #[arg(long, default_value = "127.0.0.1:8090")]
    listen: SocketAddr,

    /// Emulator binary for the socket-based backend.
    #[arg(long, default_value = "qemu-system-i386")]
    qemu: PathBuf,

    /// Primary hard disk image.
    #[arg(long, default_value = "images/dos.img")]
    disk_image: PathBuf,

    /// Shared utilities ISO.
    #[arg(long)]
    shared_iso: Option<PathBuf>,

    /// Game ISO.
    #[arg(long)]
    game_iso: Option<PathBuf>,

    /// TCP port of the remote-debug stub.
    #[arg(long, default_value_t = DEFAULT_GDB_PORT)]
    gdb_port: u16,

    /// Machine-control socket path.
    #[arg(long, default_value = "/tmp/dosprobe-qmp.sock")]
    qmp_socket: PathBuf,

    /// Run the emulator without a local display surface.
    #[arg(long)]
    headless: bool,

    /// Expose a VNC server on this port.
    #[arg(long)]
    vnc_port: Option<u16>,

    /// Emulator binary for the session-based backend.
    #[arg(long, default_value = "dosbox-x")]
    dosbox: PathBuf,

    /// Host directory mounted as the DOS C: drive.
    #[arg(long, default_value = "drive_c")]
    drive_c: PathBuf,

    /// Game executable started from autoexec in session runs.
    #[arg(long)]
    game_exe: Option<String>,

    /// Existing conf file to seed session configs from.
    #[arg(long)]
    dosbox_conf: Option<PathBuf>,

    /// Where synthesized session conf files go.
    #[arg(long, default_value = "conf")]
    conf_dir: PathBuf,

    /// Where capture artifacts and session logs go.
    #[arg(long, default_value = "captures")]
    captures_dir: PathBuf,

    /// Golden artifact directory.
    #[arg(long, default_value = "golden")]
    golden_dir: PathBuf,

    /// Save-state directory of the session backend.
    #[arg(long, default_value = "states")]
    states_dir: PathBuf,

    /// Backend to select at startup (qemu | dosbox).
    #[arg(long)]
    backend: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        // info on every subsystem target unless the environment says otherwise
        for target in dosprobe::log::TARGETS {
            builder.filter(Some(target), LevelFilter::Info);
        }
    }
    let logger = builder.build();
    let filter = logger.filter();
    dosprobe::log::LOGGER_SWITCHER.switch(logger, filter);

    let args = Args::parse();

    let qemu_launch = LaunchConfig {
        program: args.qemu,
        disk_image: args.disk_image,
        shared_iso: args.shared_iso,
        game_iso: args.game_iso.clone(),
        headless: args.headless,
        vnc_port: args.vnc_port,
        gdb_port: args.gdb_port,
        qmp_socket: Some(args.qmp_socket),
        ..LaunchConfig::default()
    };

    let dosbox = DosboxConfig {
        binary: args.dosbox,
        drive_c: args.drive_c,
        conf_dir: args.conf_dir,
        captures_dir: args.captures_dir.clone(),
        states_dir: args.states_dir,
        game_exe: args.game_exe,
        game_iso: args.game_iso,
        conf_template: args.dosbox_conf,
        session_timeout: DEFAULT_SESSION_TIMEOUT,
    };

    let factory = BackendFactory {
        qemu_launch,
        dosbox,
    };
    let dirs = CaptureDirs {
        captures: args.captures_dir,
        golden: args.golden_dir,
    };
    let state = AppState::new(Some(factory), dirs);

    if let Some(name) = args.backend {
        let kind = BackendKind::from_str(&name)
            .map_err(|_| anyhow::anyhow!("unknown backend `{name}`"))?;
        let factory = state.factory.as_ref().expect("factory configured above");
        state.holder.replace(Arc::new(factory.create(kind))).await;
        info!(target: "broker", "{kind} backend selected");
    }

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!(target: "broker", "dosprobe listening on {}", args.listen);

    axum::serve(listener, router(state))
        .await
        .context("serve control API")?;
    Ok(())
}
