//! Interactive sessions with a Power PMAC controller

pub mod comm;
pub mod gpascii;
pub mod shell;
#[cfg(feature = "ssh")]
pub mod ssh;
pub mod transport;
pub mod wait;

pub use comm::{Comm, Connector, FileTransfer};
pub use gpascii::{
    CoordinateSnapshot, Gpascii, MonitorOptions, RunOptions, SessionState, SharedGpascii,
    VariableChange,
};
pub use shell::ShellChannel;
#[cfg(feature = "ssh")]
pub use ssh::{SshChannel, SshConnector};
pub use transport::{ByteChannel, LineTransport, ReadTimeout};
pub use wait::{LineClass, PPMAC_MESSAGES, WaitMatch, WaitPattern, is_error_line, wait_for};
