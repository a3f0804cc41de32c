pub mod config;
pub mod error;
pub mod fast_gather;
pub mod gather;
pub mod pmac;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{AppConfig, ConnectionConfig, GatherPaths, SessionConfig, load_config};
pub use error::PmacError;
pub use fast_gather::{GatherClient, GatherClientBuilder, GatherData, GatherType};
pub use gather::{GatherConfig, GatherLength, GatherOutcome, GatherSettings, gather};
pub use pmac::{
    ByteChannel, Comm, Connector, CoordinateSnapshot, FileTransfer, Gpascii, LineTransport,
    ReadTimeout, SessionState, ShellChannel, SharedGpascii, WaitMatch, WaitPattern,
};
#[cfg(feature = "ssh")]
pub use pmac::{SshChannel, SshConnector};
pub use types::{
    CoordMap, CoordOptions, MotorAssignment, ProgramAction, ProgramOutcome, Undefine,
};
pub use utils::{Clock, ManualClock, SystemClock};
