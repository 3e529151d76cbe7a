//! Session-backend behavior that does not require the emulator binary.

use dosprobe::backend::{Backend, BackendStatus};
use dosprobe::dosbox::{DosboxBackend, DosboxConfig};
use dosprobe::error::Error;
use std::path::Path;
use std::time::Duration;

fn config(tmp: &Path) -> DosboxConfig {
    DosboxConfig {
        binary: "dosbox-x".into(),
        drive_c: tmp.join("drive_c"),
        conf_dir: tmp.join("conf"),
        captures_dir: tmp.join("captures"),
        states_dir: tmp.join("states"),
        game_exe: Some("GAME.EXE".to_string()),
        game_iso: None,
        conf_template: None,
        session_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn status_is_always_disconnected() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Backend::Dosbox(DosboxBackend::new(config(tmp.path())));
    assert_eq!(backend.status().await, BackendStatus::Disconnected);
}

#[tokio::test]
async fn live_operations_report_not_supported() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Backend::Dosbox(DosboxBackend::new(config(tmp.path())));

    assert!(matches!(
        backend.screenshot().await.unwrap_err(),
        Error::NotSupported("screenshot", "dosbox")
    ));
    assert!(matches!(
        backend.write_memory(0xA0000u32.into(), b"x").await.unwrap_err(),
        Error::NotSupported(..)
    ));
    assert!(matches!(
        backend.pause().await.unwrap_err(),
        Error::NotSupported(..)
    ));
    assert!(matches!(
        backend.save_snapshot("s1").await.unwrap_err(),
        Error::NotSupported(..)
    ));
    assert!(matches!(
        backend.list_breakpoints().await.unwrap_err(),
        Error::NotSupported(..)
    ));

    // a failed primitive changes nothing
    assert_eq!(backend.status().await, BackendStatus::Disconnected);
}

#[tokio::test]
async fn zero_size_read_spawns_no_session() {
    let tmp = tempfile::tempdir().unwrap();
    // binary name that cannot exist; a spawn attempt would error loudly
    let mut cfg = config(tmp.path());
    cfg.binary = tmp.path().join("no-such-emulator");
    let backend = Backend::Dosbox(DosboxBackend::new(cfg));

    let bytes = backend.read_memory(0xA0000u32.into(), 0).await.unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn empty_key_sequence_is_a_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    cfg.binary = tmp.path().join("no-such-emulator");
    let backend = Backend::Dosbox(DosboxBackend::new(cfg));

    backend.send_keys(&[], None).await.unwrap();
}

#[tokio::test]
async fn list_snapshots_enumerates_dsx_states() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path());
    std::fs::create_dir_all(&cfg.states_dir).unwrap();
    std::fs::write(cfg.states_dir.join("boot.dsx"), vec![0u8; 128]).unwrap();
    std::fs::write(cfg.states_dir.join("level1.dsx"), vec![0u8; 256]).unwrap();
    std::fs::write(cfg.states_dir.join("notes.txt"), b"ignored").unwrap();

    let backend = Backend::Dosbox(DosboxBackend::new(cfg));
    let snapshots = backend.list_snapshots().await.unwrap();

    let names: Vec<_> = snapshots.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["boot", "level1"]);
    assert_eq!(snapshots[0].size, Some(128));
    assert!(snapshots[0].modified.is_some());
    assert!(snapshots[0]
        .path
        .as_ref()
        .unwrap()
        .ends_with("boot.dsx"));
}

#[tokio::test]
async fn conf_template_seeds_the_session_config() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = config(tmp.path());
    // the session conf is written before the spawn attempt, so a missing
    // binary still lets us inspect it
    cfg.binary = tmp.path().join("no-such-emulator");
    let template = tmp.path().join("base.conf");
    std::fs::write(
        &template,
        "[dosbox]\nmemsize=32\n\n[mixer]\nrate=22050\n\n[autoexec]\nECHO stale\n",
    )
    .unwrap();
    cfg.conf_template = Some(template);
    let conf_path = cfg.conf_dir.join("_session_keys.conf");
    let backend = Backend::Dosbox(DosboxBackend::new(cfg));

    backend
        .send_keys(&["enter".to_string()], None)
        .await
        .unwrap_err();

    let written = std::fs::read_to_string(conf_path).unwrap();
    assert!(written.contains("rate=22050"));
    assert!(written.contains("memsize=32"));
    // the per-session log and autoexec replace the template's
    assert!(written.contains("logfile="));
    assert!(written.contains("_session_keys.log"));
    assert!(!written.contains("ECHO stale"));
    assert!(written.contains("MOUNT C"));
    assert!(written.contains("AUTOTYPE"));
}

#[tokio::test]
async fn missing_states_directory_yields_an_empty_list() {
    let tmp = tempfile::tempdir().unwrap();
    let backend = Backend::Dosbox(DosboxBackend::new(config(tmp.path())));
    assert!(backend.list_snapshots().await.unwrap().is_empty());
}
