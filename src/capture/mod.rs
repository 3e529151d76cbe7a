//! Composes backend primitives into a repeatable, checksummed artifact
//! bundle, and compares bundles against golden artifacts byte-exactly.

use crate::address::Address;
use crate::backend::{Backend, BreakpointRequest, ImageFormat};
use crate::error::{Error, Result};
use crate::register::RegisterFile;
use crate::weak_error;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;

/// Mode 13h framebuffer: 320×200, one byte per pixel.
pub const FRAMEBUFFER_ADDRESS: Address = Address::Linear(0xA0000);
pub const FRAMEBUFFER_SIZE: usize = 64_000;

/// Settle time after restoring a snapshot.
const SNAPSHOT_SETTLE: Duration = Duration::from_millis(1000);
/// Default wait after an injected key sequence.
const DEFAULT_KEYS_WAIT: Duration = Duration::from_secs(2);
/// Default bound on waiting for a breakpoint hit.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraRange {
    pub address: Address,
    pub size: usize,
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureRequest {
    /// Artifact name prefix.
    pub prefix: String,
    /// Snapshot to restore before observing.
    pub snapshot: Option<String>,
    /// Execution breakpoint to run to before observing.
    pub breakpoint: Option<Address>,
    /// Key sequence to inject first.
    pub keys: Option<Vec<String>>,
    /// Per-key delay for the injected sequence.
    pub key_delay_ms: Option<u64>,
    /// Wait after the sequence before observing.
    pub wait_time_ms: Option<u64>,
    pub extra_ranges: Vec<ExtraRange>,
    pub skip_framebuffer: bool,
    pub skip_registers: bool,
    pub skip_screenshot: bool,
    /// Overall bound on the breakpoint wait (socket backend) or the whole
    /// session (session backend).
    pub timeout_ms: Option<u64>,
}

impl Default for CaptureRequest {
    fn default() -> Self {
        CaptureRequest {
            prefix: "capture".to_string(),
            snapshot: None,
            breakpoint: None,
            keys: None,
            key_delay_ms: None,
            wait_time_ms: None,
            extra_ranges: Vec::new(),
            skip_framebuffer: false,
            skip_registers: false,
            skip_screenshot: false,
            timeout_ms: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub prefix: String,
    #[serde(skip)]
    pub framebuffer: Option<Vec<u8>>,
    #[serde(skip)]
    pub screenshot: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_format: Option<ImageFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registers: Option<RegisterFile>,
    #[serde(skip)]
    pub extra: BTreeMap<String, Vec<u8>>,
    /// Artifact name → sha256 of the exact bytes written to disk.
    pub checksums: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn write_artifact(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(name);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

/// Run a capture against `backend`, writing artifacts into `out_dir`.
///
/// The socket backend is driven through live primitives in a fixed order
/// (snapshot, keys, breakpoint-or-pause, observe, resume); the session
/// backend performs the whole observation inside one scripted emulator run.
pub async fn run_capture(
    backend: &Backend,
    request: &CaptureRequest,
    out_dir: &Path,
) -> Result<CaptureResult> {
    info!(target: "capture", "capture `{}` starting", request.prefix);
    let mut result = CaptureResult {
        prefix: request.prefix.clone(),
        framebuffer: None,
        screenshot: None,
        screenshot_format: None,
        registers: None,
        extra: BTreeMap::new(),
        checksums: BTreeMap::new(),
        created_at: Utc::now(),
    };

    match backend {
        Backend::Dosbox(dosbox) => {
            let harvest = dosbox.capture_session(request).await?;
            result.framebuffer = harvest.framebuffer;
            if !request.skip_registers {
                result.registers = Some(harvest.registers);
            }
            result.extra = harvest.extra;
            if !request.skip_screenshot {
                warn!(target: "capture", "screenshot skipped: not supported by this backend");
            }
        }
        Backend::Qemu(_) => {
            run_live_observation(backend, request, &mut result).await?;
        }
    }

    // Artifacts are written here, and hashes are computed over the exact
    // bytes that went to disk.
    if let Some(fb) = &result.framebuffer {
        write_artifact(out_dir, &format!("{}_framebuffer.bin", request.prefix), fb).await?;
        result
            .checksums
            .insert("framebuffer".to_string(), sha256_hex(fb));
    }
    if let (Some(shot), Some(format)) = (&result.screenshot, result.screenshot_format) {
        let name = format!("{}_screenshot.{}", request.prefix, format.extension());
        write_artifact(out_dir, &name, shot).await?;
        result
            .checksums
            .insert("screenshot".to_string(), sha256_hex(shot));
    }
    if let Some(registers) = &result.registers {
        let json = serde_json::to_vec_pretty(registers)?;
        write_artifact(out_dir, &format!("{}_registers.json", request.prefix), &json).await?;
    }
    for (name, bytes) in &result.extra {
        write_artifact(out_dir, name, bytes).await?;
        result.checksums.insert(name.clone(), sha256_hex(bytes));
    }

    let manifest = serde_json::to_vec_pretty(&result.checksums)?;
    write_artifact(
        out_dir,
        &format!("{}_checksums.json", request.prefix),
        &manifest,
    )
    .await?;

    info!(
        target: "capture",
        "capture `{}` complete ({} artifacts)",
        request.prefix,
        result.checksums.len()
    );
    Ok(result)
}

/// Live observation over backend primitives (socket backend).
async fn run_live_observation(
    backend: &Backend,
    request: &CaptureRequest,
    result: &mut CaptureResult,
) -> Result<()> {
    if let Some(snapshot) = &request.snapshot {
        debug!(target: "capture", "restoring snapshot `{snapshot}`");
        backend.load_snapshot(snapshot).await?;
        sleep(SNAPSHOT_SETTLE).await;
    }

    if let Some(keys) = request.keys.as_deref().filter(|k| !k.is_empty()) {
        debug!(target: "capture", "injecting {} keys", keys.len());
        backend.send_keys(keys, request.key_delay_ms).await?;
        let wait = request
            .wait_time_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_KEYS_WAIT);
        sleep(wait).await;
    }

    let bound = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_STOP_TIMEOUT);

    if let Some(address) = request.breakpoint {
        let breakpoint = backend
            .set_breakpoint(BreakpointRequest::execution(address))
            .await?;
        backend.resume().await?;
        if backend.supports_stop_wait() {
            backend.wait_stop(bound).await?;
        } else {
            // last resort: no live stop event to wait on
            warn!(target: "capture", "backend has no stop event, sleeping {bound:?}");
            sleep(bound).await;
        }
        weak_error!(
            backend.remove_breakpoint(breakpoint.id).await,
            "remove capture breakpoint:"
        );
    } else {
        backend.pause().await?;
    }

    if !request.skip_framebuffer {
        result.framebuffer = Some(
            backend
                .read_memory(FRAMEBUFFER_ADDRESS, FRAMEBUFFER_SIZE)
                .await?,
        );
    }
    if !request.skip_screenshot {
        match backend.screenshot().await {
            Ok((bytes, format)) => {
                result.screenshot = Some(bytes);
                result.screenshot_format = Some(format);
            }
            Err(Error::NotSupported(..)) => {
                warn!(target: "capture", "screenshot skipped: not supported by this backend");
            }
            Err(e) => return Err(e),
        }
    }
    if !request.skip_registers {
        result.registers = Some(backend.read_registers().await?);
    }
    for range in &request.extra_ranges {
        let bytes = backend.read_memory(range.address, range.size).await?;
        result.extra.insert(range.file.clone(), bytes);
    }

    weak_error!(backend.resume().await, "resume after capture:");
    Ok(())
}

// ---------------------------------- golden files ------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactComparison {
    pub name: String,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_diff_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_byte: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_byte: Option<u8>,
    /// Empty when the golden artifact is missing.
    pub golden_checksum: String,
    pub actual_checksum: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoldenReport {
    pub test_name: String,
    pub all_match: bool,
    pub artifacts: Vec<ArtifactComparison>,
}

/// Byte-exact comparison with a first-difference report. Equal lengths get
/// the differing offset and byte pair; unequal lengths report the shorter
/// length as the first difference.
pub fn compare_bytes(name: &str, golden: Option<&[u8]>, actual: &[u8]) -> ArtifactComparison {
    let actual_checksum = sha256_hex(actual);
    let Some(golden) = golden else {
        return ArtifactComparison {
            name: name.to_string(),
            matched: false,
            first_diff_offset: None,
            expected_byte: None,
            actual_byte: None,
            golden_checksum: String::new(),
            actual_checksum,
        };
    };

    let golden_checksum = sha256_hex(golden);
    if golden == actual {
        return ArtifactComparison {
            name: name.to_string(),
            matched: true,
            first_diff_offset: None,
            expected_byte: None,
            actual_byte: None,
            golden_checksum,
            actual_checksum,
        };
    }

    let (offset, pair) = if golden.len() == actual.len() {
        let at = golden
            .iter()
            .zip(actual)
            .position(|(g, a)| g != a)
            .expect("contents differ");
        (at as u64, Some((golden[at], actual[at])))
    } else {
        (golden.len().min(actual.len()) as u64, None)
    };

    ArtifactComparison {
        name: name.to_string(),
        matched: false,
        first_diff_offset: Some(offset),
        expected_byte: pair.map(|(g, _)| g),
        actual_byte: pair.map(|(_, a)| a),
        golden_checksum,
        actual_checksum,
    }
}

/// Produce the golden bundle for `request` (capture straight into the
/// golden directory).
pub async fn generate_golden(
    backend: &Backend,
    request: &CaptureRequest,
    golden_dir: &Path,
) -> Result<CaptureResult> {
    run_capture(backend, request, golden_dir).await
}

/// Capture with prefix `test_name` into `scratch_dir` and compare every
/// binary artifact against the bundle in `golden_dir`.
pub async fn compare_golden(
    backend: &Backend,
    request: &CaptureRequest,
    golden_dir: &Path,
    scratch_dir: &Path,
) -> Result<GoldenReport> {
    let result = run_capture(backend, request, scratch_dir).await?;

    let mut artifacts = Vec::new();
    let mut pairs: Vec<(String, String, &[u8])> = Vec::new();
    if let Some(fb) = &result.framebuffer {
        pairs.push((
            "framebuffer".to_string(),
            format!("{}_framebuffer.bin", request.prefix),
            fb.as_slice(),
        ));
    }
    if let (Some(shot), Some(format)) = (&result.screenshot, result.screenshot_format) {
        pairs.push((
            "screenshot".to_string(),
            format!("{}_screenshot.{}", request.prefix, format.extension()),
            shot.as_slice(),
        ));
    }
    for (name, bytes) in &result.extra {
        pairs.push((name.clone(), name.clone(), bytes.as_slice()));
    }

    for (artifact, file_name, actual) in pairs {
        let golden = tokio::fs::read(golden_dir.join(&file_name)).await.ok();
        artifacts.push(compare_bytes(&artifact, golden.as_deref(), actual));
    }

    let all_match = !artifacts.is_empty() && artifacts.iter().all(|a| a.matched);
    Ok(GoldenReport {
        test_name: request.prefix.clone(),
        all_match,
        artifacts,
    })
}

// ---------------------------------- capture inventory -------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureFile {
    pub name: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

const ARTIFACT_SUFFIXES: [&str; 5] = [
    "_framebuffer.bin",
    "_registers.json",
    "_checksums.json",
    "_screenshot.ppm",
    "_screenshot.bmp",
];

fn prefix_of(name: &str) -> Option<String> {
    for suffix in ARTIFACT_SUFFIXES {
        if let Some(prefix) = name.strip_suffix(suffix) {
            return Some(prefix.to_string());
        }
    }
    // caller-named extra dumps group on the text before the last underscore
    name.rsplit_once('_').map(|(prefix, _)| prefix.to_string())
}

/// Group the capture directory's files by capture prefix. Session scratch
/// files (leading underscore) are ignored.
pub async fn inventory(dir: &Path) -> Result<BTreeMap<String, Vec<CaptureFile>>> {
    let mut groups: BTreeMap<String, Vec<CaptureFile>> = BTreeMap::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return Ok(groups),
    };
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('_') {
            continue;
        }
        let Some(prefix) = prefix_of(&name) else {
            continue;
        };
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        groups.entry(prefix).or_default().push(CaptureFile {
            name,
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    for files in groups.values_mut() {
        files.sort_by(|a, b| a.name.cmp(&b.name));
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_match() {
        let cmp = compare_bytes("framebuffer", Some(b"abcd"), b"abcd");
        assert!(cmp.matched);
        assert_eq!(cmp.golden_checksum, cmp.actual_checksum);
        assert!(cmp.first_diff_offset.is_none());
    }

    #[test]
    fn equal_length_difference_reports_offset_and_bytes() {
        let cmp = compare_bytes("framebuffer", Some(b"abcd"), b"abXd");
        assert!(!cmp.matched);
        assert_eq!(cmp.first_diff_offset, Some(2));
        assert_eq!(cmp.expected_byte, Some(b'c'));
        assert_eq!(cmp.actual_byte, Some(b'X'));
    }

    #[test]
    fn length_mismatch_reports_shorter_length() {
        let cmp = compare_bytes("dump", Some(b"abcdef"), b"abc");
        assert!(!cmp.matched);
        assert_eq!(cmp.first_diff_offset, Some(3));
        assert!(cmp.expected_byte.is_none());
    }

    #[test]
    fn missing_golden_is_mismatch_with_empty_checksum() {
        let cmp = compare_bytes("dump", None, b"abc");
        assert!(!cmp.matched);
        assert!(cmp.golden_checksum.is_empty());
        assert_eq!(cmp.actual_checksum, sha256_hex(b"abc"));
    }

    #[test]
    fn sha256_hex_is_lowercase_sha256() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn inventory_prefix_extraction() {
        assert_eq!(prefix_of("t1_framebuffer.bin").unwrap(), "t1");
        assert_eq!(prefix_of("t1_screenshot.ppm").unwrap(), "t1");
        assert_eq!(prefix_of("level1_palette.bin").unwrap(), "level1");
        assert!(prefix_of("README").is_none());
    }
}
