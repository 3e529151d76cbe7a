use std::path::PathBuf;
use std::string::FromUtf8Error;
use std::time::Duration;

/// Unified error for every layer: protocol clients, backends, the capture
/// pipeline and the broker. Variants keep the caller-facing taxonomy
/// (connection / protocol / timeout / not-supported / argument) so the wire
/// layers can map them without string sniffing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- transport errors ------------------------------------------
    #[error("connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("protocol error ({class}): {desc}")]
    Protocol { class: String, desc: String },
    #[error("unexpected greeting from machine-control socket")]
    BadGreeting,
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error("checksum mismatch (got {got:02x}, want {want:02x})")]
    ChecksumMismatch { got: u8, want: u8 },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    FromUtf8(#[from] FromUtf8Error),

    // --------------------------------- backend errors --------------------------------------------
    #[error("operation `{0}` is not supported by the {1} backend")]
    NotSupported(&'static str, &'static str),
    #[error("no backend attached")]
    NoBackend,
    #[error("no backend factory configured")]
    NoFactory,
    #[error("unknown backend `{0}`")]
    UnknownBackend(String),
    #[error("backend is not connected")]
    NotConnected,

    // --------------------------------- launch errors ---------------------------------------------
    #[error("emulator exited during startup{}", stderr_excerpt(.stderr))]
    EarlyExit { stderr: Option<String> },
    #[error("could not connect to emulator after {attempts} attempts")]
    ConnectRetriesExhausted { attempts: u32 },

    // --------------------------------- session errors --------------------------------------------
    #[error("session produced no artifact at {}", .0.display())]
    MissingArtifact(PathBuf),

    // --------------------------------- argument errors -------------------------------------------
    #[error("bad address literal `{0}`")]
    BadAddress(String),
    #[error("{0}")]
    Argument(String),
}

fn stderr_excerpt(stderr: &Option<String>) -> String {
    match stderr {
        Some(s) if !s.trim().is_empty() => format!(": {}", s.trim()),
        _ => String::new(),
    }
}

impl Error {
    pub fn protocol(class: impl Into<String>, desc: impl Into<String>) -> Self {
        Error::Protocol {
            class: class.into(),
            desc: desc.into(),
        }
    }

    pub fn connection(desc: impl Into<String>) -> Self {
        Error::Connection(desc.into())
    }

    /// HTTP status code this error surfaces as.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::BadAddress(_) | Error::Argument(_) | Error::UnknownBackend(_) => 400,
            Error::NoBackend | Error::NoFactory => 503,
            Error::Timeout(_) => 504,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "backend", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "backend", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
