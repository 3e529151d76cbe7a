//! Synthesizes the two on-disk inputs of a one-shot emulator session: the
//! sectioned key-value configuration (with its distinguished `[autoexec]`
//! section) and the debugger command script injected via `debugrunfile`.

use crate::address::SegOff;
use crate::error::Result;
use std::fmt::Write as _;
use std::path::Path;

/// Sectioned emulator configuration. Section order is preserved;
/// `[autoexec]` is always rendered last.
#[derive(Debug, Clone, Default)]
pub struct DosboxConf {
    sections: Vec<(String, Vec<(String, String)>)>,
    autoexec: Vec<String>,
}

impl DosboxConf {
    /// Baseline configuration: SVGA machine, 16 MB, auto CPU at max cycles,
    /// Sound Blaster 16 at the canonical resources, session log file, and an
    /// autoexec preamble that mounts the host directory as drive C and
    /// enters it.
    pub fn defaults(drive_c: &Path, log_file: &Path) -> Self {
        let mut conf = DosboxConf::default();
        conf.set("sdl", "output", "opengl");
        conf.set("sdl", "windowresolution", "640x400");
        conf.set("sdl", "autolock", "false");
        conf.set("dosbox", "memsize", "16");
        conf.set("dosbox", "machine", "svga_s3");
        conf.set("cpu", "cputype", "auto");
        conf.set("cpu", "cycles", "max");
        conf.set("sblaster", "sbtype", "sb16");
        conf.set("sblaster", "sbbase", "220");
        conf.set("sblaster", "irq", "5");
        conf.set("sblaster", "dma", "1");
        conf.set("sblaster", "hdma", "5");
        conf.set("log", "logfile", log_file.to_string_lossy());
        conf.autoexec = vec![format!("MOUNT C \"{}\"", drive_c.display()), "C:".to_string()];
        conf
    }

    /// Seed a configuration from an existing conf file, keeping its sections
    /// and autoexec lines.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut conf = DosboxConf::default();
        let mut current: Option<String> = None;
        let mut in_autoexec = false;

        for raw in text.lines() {
            let line = raw.trim();
            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].to_lowercase();
                in_autoexec = name == "autoexec";
                if !in_autoexec && !conf.sections.iter().any(|(s, _)| *s == name) {
                    conf.sections.push((name.clone(), Vec::new()));
                }
                current = Some(name);
            } else if in_autoexec {
                conf.autoexec.push(raw.to_string());
            } else if let (Some(section), false) = (&current, line.starts_with('#')) {
                if let Some((key, value)) = line.split_once('=') {
                    conf.set(section.clone(), key.trim(), value.trim());
                }
            }
        }
        Ok(conf)
    }

    pub fn set(
        &mut self,
        section: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) {
        let section = section.into().to_lowercase();
        let key = key.into();
        let value = value.into();
        let idx = match self.sections.iter().position(|(s, _)| *s == section) {
            Some(idx) => idx,
            None => {
                self.sections.push((section, Vec::new()));
                self.sections.len() - 1
            }
        };
        let entries = &mut self.sections[idx].1;
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => entries.push((key, value)),
        }
    }

    pub fn set_autoexec(&mut self, lines: impl IntoIterator<Item = String>) {
        self.autoexec = lines.into_iter().collect();
    }

    pub fn push_autoexec(&mut self, line: impl Into<String>) {
        self.autoexec.push(line.into());
    }

    /// `AUTOTYPE` line: wait `wait_s` seconds after boot, then type the keys
    /// with `period_s` seconds between them.
    pub fn autotype_line(keys: &[String], wait_s: f64, period_s: f64) -> String {
        format!("AUTOTYPE -w {wait_s:.1} -p {period_s:.2} {}", keys.join(" "))
    }

    /// `IMGMOUNT` line mounting an ISO as the D: CD-ROM drive.
    pub fn imgmount_line(iso: &Path) -> String {
        format!("IMGMOUNT D \"{}\" -t cdrom", iso.display())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (section, entries) in &self.sections {
            let _ = writeln!(out, "[{section}]");
            for (key, value) in entries {
                let _ = writeln!(out, "{key}={value}");
            }
            out.push('\n');
        }
        out.push_str("[autoexec]\n");
        for line in &self.autoexec {
            let _ = writeln!(out, "{line}");
        }
        out
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.render()).await?;
        Ok(())
    }
}

/// Builder for a debugger command script (one command per line). The
/// commands mirror the emulator's built-in debugger vocabulary.
#[derive(Debug, Clone, Default)]
pub struct DebugScript {
    commands: Vec<String>,
}

impl DebugScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execution breakpoint at segment:offset.
    pub fn breakpoint(&mut self, at: SegOff) -> &mut Self {
        self.commands.push(format!("BP {at}"));
        self
    }

    /// Break on an interrupt, optionally gated on the AH sub-function.
    pub fn interrupt_breakpoint(&mut self, int_num: u8, ah: Option<u8>) -> &mut Self {
        match ah {
            Some(ah) => self.commands.push(format!("BPINT {int_num:02X} {ah:02X}")),
            None => self.commands.push(format!("BPINT {int_num:02X}")),
        }
        self
    }

    /// Memory-write breakpoint.
    pub fn memory_breakpoint(&mut self, at: SegOff) -> &mut Self {
        self.commands.push(format!("BPM {at}"));
        self
    }

    pub fn continue_exec(&mut self) -> &mut Self {
        self.commands.push("C".to_string());
        self
    }

    /// Step `count` instructions.
    pub fn step(&mut self, count: u32) -> &mut Self {
        self.commands.push(format!("T {count}"));
        self
    }

    /// Dump all CPU registers to the log.
    pub fn show_registers(&mut self) -> &mut Self {
        self.commands.push("SR".to_string());
        self
    }

    /// Hex dump to the debug log.
    pub fn memdump_hex(&mut self, at: SegOff, len: u32) -> &mut Self {
        self.commands.push(format!("MEMDUMP {at} {len:X}"));
        self
    }

    /// Binary dump to a file.
    pub fn memdump_bin(&mut self, at: SegOff, len: u32, file: &Path) -> &mut Self {
        self.commands
            .push(format!("MEMDUMPBIN {at} {len:X} {}", file.display()));
        self
    }

    /// Log the next `count` executed instructions.
    pub fn trace_log(&mut self, count: u32) -> &mut Self {
        self.commands.push(format!("LOG {count}"));
        self
    }

    /// Raw escape hatch for commands without a dedicated builder.
    pub fn raw(&mut self, command: impl Into<String>) -> &mut Self {
        self.commands.push(command.into());
        self
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for command in &self.commands {
            out.push_str(command);
            out.push('\n');
        }
        out
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.render()).await?;
        Ok(())
    }
}
