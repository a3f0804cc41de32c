use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PmacError {
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Timed out after {:.2} s", .elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },
    #[error("Interpreter error: {0}")]
    Interpreter(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error(
        "Motors in coordinate system {coord} differ: expected {expected:?}, got {actual:?}"
    )]
    Verification {
        coord: u32,
        expected: Vec<(u32, String)>,
        actual: Vec<(u32, String)>,
    },
    #[error("Gather server error {code}")]
    Gather { code: u32 },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Interrupted")]
    Interrupted,
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[cfg(feature = "ssh")]
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),
}

impl From<std::io::Error> for PmacError {
    fn from(source: std::io::Error) -> Self {
        PmacError::Io {
            source,
            context: "I/O".to_string(),
        }
    }
}

impl PmacError {
    /// Errors a per-item callback may absorb when sampling many variables
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PmacError::Interpreter(_) | PmacError::Timeout { .. })
    }
}
