//! Extracts the last register dump from a session debug log. The debugger
//! writes blocks like:
//!
//! ```text
//! EAX:00001234 EBX:00005678 ECX:00000000 EDX:00000000
//! DS:0070 ES:0070 FS:0000 GS:0000 SS:0070 CS:0070
//! EIP:00000100
//! ```

use crate::register::{Register, RegisterFile};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

const WIDE_REGS: [(Register, &str); 10] = [
    (Register::Eax, "EAX"),
    (Register::Ebx, "EBX"),
    (Register::Ecx, "ECX"),
    (Register::Edx, "EDX"),
    (Register::Esi, "ESI"),
    (Register::Edi, "EDI"),
    (Register::Ebp, "EBP"),
    (Register::Esp, "ESP"),
    (Register::Eip, "EIP"),
    (Register::Eflags, "EFLAGS"),
];

const SEG_REGS: [(Register, &str); 6] = [
    (Register::Cs, "CS"),
    (Register::Ds, "DS"),
    (Register::Es, "ES"),
    (Register::Ss, "SS"),
    (Register::Fs, "FS"),
    (Register::Gs, "GS"),
];

static BLOCK_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"EAX[=:][0-9A-Fa-f]{8}").expect("must compile"));

static WIDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(EFLAGS|EAX|EBX|ECX|EDX|ESI|EDI|EBP|ESP|EIP)[=:]([0-9A-Fa-f]{8})")
        .expect("must compile")
});

static SEG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(CS|DS|ES|SS|FS|GS)[=:]([0-9A-Fa-f]{4})").expect("must compile"));

fn register_by_name(name: &str) -> Option<Register> {
    WIDE_REGS
        .iter()
        .chain(SEG_REGS.iter())
        .find(|(_, n)| *n == name)
        .map(|(reg, _)| *reg)
}

fn capture_into(file: &mut RegisterFile, block: &str) {
    for caps in WIDE_RE.captures_iter(block).chain(SEG_RE.captures_iter(block)) {
        let Some(reg) = register_by_name(&caps[1]) else {
            continue;
        };
        // first occurrence within the block wins
        if file.get(reg).is_none() {
            if let Ok(value) = u32::from_str_radix(&caps[2], 16) {
                file.set(reg, value);
            }
        }
    }
}

/// Parse the most recent register dump out of the log text. When no dump
/// block is present at all, the whole text is scanned as a fallback; absent
/// matches yield an empty file, never an error.
pub fn parse_last_registers(text: &str) -> RegisterFile {
    let mut file = RegisterFile::new();
    let block = match BLOCK_START.find_iter(text).last() {
        Some(m) => &text[m.start()..],
        None => text,
    };
    capture_into(&mut file, block);
    file
}

/// Read and parse a log file. A missing file yields an empty register file.
pub async fn parse_log(path: &Path) -> RegisterFile {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_last_registers(&text),
        Err(_) => RegisterFile::new(),
    }
}
