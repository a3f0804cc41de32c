//! Connection owner: interpreter sessions, shell commands and file transfer

use super::gpascii::{Gpascii, SharedGpascii};
use super::shell::ShellChannel;
use super::transport::ByteChannel;
use super::wait::{is_error_line, is_ppmac_message};
use crate::config::{AppConfig, ConnectionConfig, SessionConfig};
use crate::error::PmacError;
use crate::fast_gather::GatherClient;
use crate::utils::{Clock, system_clock};
use log::{debug, error, info};
use std::sync::Arc;

/// Opens channels on the controller
pub trait Connector {
    type Channel: ByteChannel + 'static;

    /// A new interactive shell
    fn open_shell(&self) -> Result<Self::Channel, PmacError>;

    /// Run a single command to completion, returning stdout then stderr lines
    fn exec(&self, command: &str) -> Result<Vec<String>, PmacError>;
}

/// Remote file access
pub trait FileTransfer {
    fn read_file(&self, path: &str) -> Result<Vec<String>, PmacError>;
    fn write_file(&self, path: &str, contents: &str) -> Result<(), PmacError>;
    fn file_exists(&self, path: &str) -> Result<bool, PmacError>;
    fn remove_file(&self, path: &str) -> Result<(), PmacError>;
    fn make_directory(&self, path: &str) -> Result<(), PmacError>;
    fn list_dir(&self, path: &str) -> Result<Vec<String>, PmacError>;
}

enum FastGather {
    Untried,
    Connected(GatherClient),
    Disabled,
}

/// Everything needed to talk to one controller
///
/// Owns the primary interpreter session (shared, see [`SharedGpascii`]) and
/// a lazily connected fast gather client.
pub struct Comm<K: Connector + FileTransfer> {
    connector: K,
    connection: ConnectionConfig,
    session: SessionConfig,
    clock: Arc<dyn Clock>,
    gpascii: SharedGpascii<K::Channel>,
    fast_gather: FastGather,
}

impl<K: Connector + FileTransfer> Comm<K> {
    pub fn new(connector: K, config: &AppConfig) -> Result<Self, PmacError> {
        Self::with_clock(connector, config, system_clock())
    }

    pub fn with_clock(
        connector: K,
        config: &AppConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PmacError> {
        let channel = connector.open_shell()?;
        let gpascii = Gpascii::open_with_clock(
            channel,
            &config.connection.username,
            config.session.clone(),
            clock.clone(),
        )?;

        info!(
            "Connected to {}@{}:{}",
            config.connection.username, config.connection.host, config.connection.port
        );

        Ok(Self {
            connector,
            connection: config.connection.clone(),
            session: config.session.clone(),
            clock,
            gpascii: gpascii.into_shared(),
            fast_gather: if config.connection.fast_gather {
                FastGather::Untried
            } else {
                FastGather::Disabled
            },
        })
    }

    /// The primary interpreter session
    pub fn gpascii(&self) -> SharedGpascii<K::Channel> {
        self.gpascii.clone()
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// An additional, independent interpreter session
    pub fn gpascii_channel(&self) -> Result<Gpascii<K::Channel>, PmacError> {
        let channel = self.connector.open_shell()?;
        Gpascii::open_with_clock(
            channel,
            &self.connection.username,
            self.session.clone(),
            self.clock.clone(),
        )
    }

    pub fn shell_channel(&self) -> Result<ShellChannel<K::Channel>, PmacError> {
        let channel = self.connector.open_shell()?;
        ShellChannel::open(
            channel,
            &self.connection.username,
            self.session.clone(),
            self.clock.clone(),
        )
    }

    /// Run a shell command, dropping interpreter chatter from its output
    pub fn shell_command(&self, command: &str) -> Result<Vec<String>, PmacError> {
        debug!("shell: {}", command);
        let lines = self.connector.exec(command)?;
        Ok(lines
            .into_iter()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !is_ppmac_message(line))
            .collect())
    }

    /// Run a script file through the interpreter, failing on any error line
    pub fn gpascii_file(&self, path: &str) -> Result<Vec<String>, PmacError> {
        let lines = self.shell_command(&format!("gpascii -i\"{path}\" 2>&1"))?;
        if let Some(line) = lines.iter().find(|line| is_error_line(line)) {
            return Err(PmacError::Interpreter(line.clone()));
        }
        Ok(lines)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<String>, PmacError> {
        self.connector.read_file(path)
    }

    pub fn write_file(&self, path: &str, contents: &str) -> Result<(), PmacError> {
        debug!("Writing {} bytes to {}", contents.len(), path);
        self.connector.write_file(path, contents)
    }

    pub fn file_exists(&self, path: &str) -> Result<bool, PmacError> {
        self.connector.file_exists(path)
    }

    pub fn remove_file(&self, path: &str) -> Result<(), PmacError> {
        self.connector.remove_file(path)
    }

    pub fn make_directory(&self, path: &str) -> Result<(), PmacError> {
        self.connector.make_directory(path)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, PmacError> {
        self.connector.list_dir(path)
    }

    /// The binary gather client, connecting on first use
    ///
    /// A failed connection disables fast gather for the lifetime of this
    /// `Comm`; callers then fall back to the text gather path.
    pub fn fast_gather(&mut self) -> Option<&mut GatherClient> {
        if matches!(self.fast_gather, FastGather::Untried) {
            self.fast_gather = match self.connect_fast_gather() {
                Ok(client) => FastGather::Connected(client),
                Err(e) => {
                    error!("Fast gather client disabled: {}", e);
                    FastGather::Disabled
                }
            };
        }

        match &mut self.fast_gather {
            FastGather::Connected(client) => Some(client),
            _ => None,
        }
    }

    fn connect_fast_gather(&self) -> Result<GatherClient, PmacError> {
        let mut client = GatherClient::builder()
            .address(&self.connection.host)
            .port(self.connection.fast_gather_port)
            .connect_timeout(self.connection.connect_timeout())
            .build()?;
        client.set_servo_mode()?;
        Ok(client)
    }
}
