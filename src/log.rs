//! Logging for the broker. The library side stays silent: protocol clients
//! and backends log through the `log` facade under per-subsystem targets,
//! and nothing reaches the outside until the broker binary mounts a sink
//! after its flags are parsed. Tests never mount one.

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::sync::{Arc, RwLock};

/// Log targets used across the crate, one per subsystem. Wire-level
/// protocol traffic logs at trace under `qmp` and `gdb`.
pub const TARGETS: [&str; 6] = ["broker", "backend", "qmp", "gdb", "ws", "capture"];

/// Process-wide logger that forwards to whatever sink is currently
/// mounted; no sink means silence.
#[derive(Clone)]
pub struct LogSwitch {
    sink: Arc<RwLock<Option<Box<dyn Log>>>>,
}

/// Installs itself as the global logger on first touch.
pub static LOGGER_SWITCHER: Lazy<LogSwitch> = Lazy::new(|| {
    let switch = LogSwitch {
        sink: Arc::new(RwLock::new(None)),
    };

    log::set_boxed_logger(Box::new(switch.clone())).expect("infallible");
    log::set_max_level(log::LevelFilter::Debug);

    switch
});

impl LogSwitch {
    /// Mount a sink and reset the global maximum log level.
    pub fn switch<L: Log + 'static>(&self, sink: L, level_filter: LevelFilter) {
        *self.sink.write().unwrap() = Some(Box::new(sink));
        log::set_max_level(level_filter);
    }
}

impl Log for LogSwitch {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sink
            .read()
            .unwrap()
            .as_ref()
            .is_some_and(|sink| sink.enabled(metadata))
    }

    fn log(&self, record: &Record) {
        if let Some(sink) = self.sink.read().unwrap().as_ref() {
            sink.log(record);
        }
    }

    fn flush(&self) {
        if let Some(sink) = self.sink.read().unwrap().as_ref() {
            sink.flush();
        }
    }
}
