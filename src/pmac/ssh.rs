//! SSH transport for the controller
//!
//! Every interactive shell and one-shot command gets its own SSH session in
//! non-blocking mode so that [`ByteChannel::try_recv`] can poll it. SFTP goes
//! over a blocking session owned by the connector.

use super::comm::{Connector, FileTransfer};
use super::transport::{ByteChannel, drain_to_end};
use crate::config::ConnectionConfig;
use crate::error::PmacError;
use crate::utils::SystemClock;
use log::{debug, info};
use parking_lot::Mutex;
use ssh2::{Channel, Session, Sftp};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

const WRITE_RETRY: Duration = Duration::from_millis(1);

fn connect_session(config: &ConnectionConfig) -> Result<Session, PmacError> {
    let address = format!("{}:{}", config.host, config.port);
    let socket_addr = address
        .to_socket_addrs()
        .map_err(|_| PmacError::InvalidAddress(address.clone()))?
        .next()
        .ok_or_else(|| PmacError::InvalidAddress(address.clone()))?;

    debug!("Connecting to {}", address);
    let tcp = TcpStream::connect_timeout(&socket_addr, config.connect_timeout()).map_err(
        |source| PmacError::Io {
            source,
            context: format!("Failed to connect to {address}"),
        },
    )?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_password(&config.username, &config.password)?;
    if !session.authenticated() {
        return Err(PmacError::Protocol(format!(
            "authentication failed for {}",
            config.username
        )));
    }

    Ok(session)
}

/// Password-authenticated SSH access to one controller
pub struct SshConnector {
    config: ConnectionConfig,
    session: Session,
    sftp: Mutex<Option<Sftp>>,
}

impl SshConnector {
    pub fn connect(config: &ConnectionConfig) -> Result<Self, PmacError> {
        let session = connect_session(config)?;
        info!("SSH session established with {}", config.host);
        Ok(Self {
            config: config.clone(),
            session,
            sftp: Mutex::new(None),
        })
    }

    fn with_sftp<T>(&self, f: impl FnOnce(&Sftp) -> Result<T, PmacError>) -> Result<T, PmacError> {
        let mut sftp = self.sftp.lock();
        if sftp.is_none() {
            *sftp = Some(self.session.sftp()?);
        }
        match sftp.as_ref() {
            Some(sftp) => f(sftp),
            None => Err(PmacError::ChannelClosed),
        }
    }
}

fn io_context(context: &str) -> impl FnOnce(io::Error) -> PmacError + '_ {
    move |source| PmacError::Io {
        source,
        context: context.to_string(),
    }
}

impl Connector for SshConnector {
    type Channel = SshChannel;

    fn open_shell(&self) -> Result<SshChannel, PmacError> {
        let session = connect_session(&self.config)?;
        let mut channel = session.channel_session()?;
        channel.request_pty("vt100", None, None)?;
        channel.shell()?;
        session.set_blocking(false);
        Ok(SshChannel { session, channel })
    }

    fn exec(&self, command: &str) -> Result<Vec<String>, PmacError> {
        let session = connect_session(&self.config)?;
        let mut channel = session.channel_session()?;
        channel.exec(command)?;
        session.set_blocking(false);

        let mut channel = SshChannel { session, channel };
        let (stdout, stderr) = drain_to_end(&mut channel, &SystemClock)
            .map_err(io_context("Reading command output"))?;
        channel.session.set_blocking(true);
        channel.channel.wait_close()?;
        match channel.channel.exit_status() {
            Ok(0) => {}
            Ok(status) => debug!("{:?} exited with status {}", command, status),
            Err(e) => debug!("No exit status for {:?}: {}", command, e),
        }

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);
        Ok(stdout
            .lines()
            .chain(stderr.lines())
            .map(str::to_string)
            .collect())
    }
}

impl FileTransfer for SshConnector {
    fn read_file(&self, path: &str) -> Result<Vec<String>, PmacError> {
        self.with_sftp(|sftp| {
            let mut file = sftp.open(Path::new(path))?;
            let mut contents = String::new();
            file.read_to_string(&mut contents)
                .map_err(io_context("Reading remote file"))?;
            Ok(contents.lines().map(str::to_string).collect())
        })
    }

    fn write_file(&self, path: &str, contents: &str) -> Result<(), PmacError> {
        self.with_sftp(|sftp| {
            let mut file = sftp.create(Path::new(path))?;
            file.write_all(contents.as_bytes())
                .map_err(io_context("Writing remote file"))
        })
    }

    fn file_exists(&self, path: &str) -> Result<bool, PmacError> {
        self.with_sftp(|sftp| Ok(sftp.stat(Path::new(path)).is_ok()))
    }

    fn remove_file(&self, path: &str) -> Result<(), PmacError> {
        self.with_sftp(|sftp| Ok(sftp.unlink(Path::new(path))?))
    }

    fn make_directory(&self, path: &str) -> Result<(), PmacError> {
        self.with_sftp(|sftp| Ok(sftp.mkdir(Path::new(path), 0o755)?))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, PmacError> {
        self.with_sftp(|sftp| {
            Ok(sftp
                .readdir(Path::new(path))?
                .into_iter()
                .filter_map(|(entry, _)| {
                    entry
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string())
                })
                .collect())
        })
    }
}

/// Interactive shell over its own non-blocking SSH session
pub struct SshChannel {
    session: Session,
    channel: Channel,
}

fn poll_read(result: io::Result<usize>, eof: bool) -> io::Result<Option<usize>> {
    match result {
        Ok(0) if eof => Ok(Some(0)),
        Ok(0) => Ok(None),
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

impl ByteChannel for SshChannel {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let result = self.channel.read(buf);
        poll_read(result, self.channel.eof())
    }

    fn try_recv_stderr(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let result = self.channel.stderr().read(buf);
        match poll_read(result, false)? {
            Some(0) => Ok(None),
            other => Ok(other),
        }
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.channel.write(&data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "SSH channel accepted no data",
                    ));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(WRITE_RETRY),
                Err(e) => return Err(e),
            }
        }

        loop {
            match self.channel.flush() {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(WRITE_RETRY),
                Err(e) => return Err(e),
            }
        }
    }
}
