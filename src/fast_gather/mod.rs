//! Client for the `fast_gather` TCP server running on the controller
//!
//! The server hands out the raw gather buffer in a compact binary form, which
//! is far quicker than having the controller's `gather` tool write a text file
//! and parsing that.

use crate::error::PmacError;
use log::{debug, warn};
use ndarray::Array2;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub mod protocol;
pub mod types;

pub use protocol::{FrameCode, MAX_FRAME_SIZE, Request};
pub use types::{GatherType, decode_columns};

/// Builder for [`GatherClient`]
///
/// ```no_run
/// use std::time::Duration;
/// use rusty_pmac::GatherClient;
///
/// let mut client = GatherClient::builder()
///     .address("10.3.2.115")
///     .port(2332)
///     .read_timeout(Duration::from_secs(30))
///     .build()?;
/// client.set_servo_mode()?;
/// let rows = client.get_rows()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct GatherClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl Default for GatherClientBuilder {
    fn default() -> Self {
        Self {
            address: None,
            port: None,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl GatherClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<GatherClient, PmacError> {
        let address = self
            .address
            .ok_or_else(|| PmacError::InvalidCommand("Address must be specified".to_string()))?;
        let port = self
            .port
            .ok_or_else(|| PmacError::InvalidCommand("Port must be specified".to_string()))?;

        let candidates: Vec<SocketAddr> = (address.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| PmacError::InvalidAddress(address.clone()))?
            .collect();
        if candidates.is_empty() {
            return Err(PmacError::InvalidAddress(address));
        }

        let mut last_error = None;
        let mut connected = None;
        for socket_addr in candidates {
            debug!("Connecting to fast gather server at {socket_addr}");
            match TcpStream::connect_timeout(&socket_addr, self.connect_timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => {
                    warn!("Failed to connect to {socket_addr}: {e}");
                    last_error = Some((socket_addr, e));
                }
            }
        }

        let stream = match (connected, last_error) {
            (Some(stream), _) => stream,
            (None, Some((_, e))) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(PmacError::Timeout {
                    elapsed: self.connect_timeout,
                });
            }
            (None, Some((socket_addr, e))) => {
                return Err(PmacError::Io {
                    source: e,
                    context: format!("Failed to connect to {socket_addr}"),
                });
            }
            (None, None) => return Err(PmacError::InvalidAddress(address)),
        };

        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.write_timeout))?;
        stream.set_nodelay(true)?;

        Ok(GatherClient::from_stream(stream))
    }
}

/// Decoded contents of the gather buffer
#[derive(Debug, Clone, PartialEq)]
pub struct GatherData {
    pub types: Vec<GatherType>,
    /// Sample count reported by the server
    pub samples: u32,
    /// One row per gathered address
    pub columns: Array2<f64>,
}

pub struct GatherClient<S = TcpStream> {
    stream: S,
}

impl GatherClient<TcpStream> {
    pub fn builder() -> GatherClientBuilder {
        GatherClientBuilder::default()
    }
}

impl<S: Read + Write> GatherClient<S> {
    pub fn from_stream(stream: S) -> Self {
        Self { stream }
    }

    fn request(&mut self, request: Request, expected: FrameCode) -> Result<Vec<u8>, PmacError> {
        protocol::write_request(&mut self.stream, request)?;
        protocol::read_frame(&mut self.stream, expected)
    }

    /// Return servo-rate gather data from now on
    pub fn set_servo_mode(&mut self) -> Result<(), PmacError> {
        self.request(Request::Servo, FrameCode::Ack).map(|_| ())
    }

    /// Return phase-rate gather data from now on
    pub fn set_phase_mode(&mut self) -> Result<(), PmacError> {
        self.request(Request::Phase, FrameCode::Ack).map(|_| ())
    }

    /// Raw type code of each gathered address
    pub fn query_types(&mut self) -> Result<Vec<u16>, PmacError> {
        let payload = self.request(Request::Types, FrameCode::Types)?;
        protocol::parse_types(&payload)
    }

    /// Sample count and packed sample bytes
    pub fn query_raw_data(&mut self) -> Result<(u32, Vec<u8>), PmacError> {
        let payload = self.request(Request::Data, FrameCode::Data)?;
        let (samples, raw) = protocol::parse_data(&payload)?;
        Ok((samples, raw.to_vec()))
    }

    /// Types and data in one round trip
    ///
    /// When the server reports no addresses it sends no data frame.
    pub fn query_types_and_raw_data(&mut self) -> Result<(Vec<u16>, u32, Vec<u8>), PmacError> {
        let payload = self.request(Request::All, FrameCode::Types)?;
        let types = protocol::parse_types(&payload)?;
        if types.is_empty() {
            return Ok((types, 0, Vec::new()));
        }

        let payload = protocol::read_frame(&mut self.stream, FrameCode::Data)?;
        let (samples, raw) = protocol::parse_data(&payload)?;
        Ok((types, samples, raw.to_vec()))
    }

    /// Fetch and decode the whole gather buffer
    pub fn query_all(&mut self) -> Result<GatherData, PmacError> {
        let (codes, samples, raw) = self.query_types_and_raw_data()?;
        let types: Vec<GatherType> = codes.into_iter().map(GatherType::from_code).collect();

        let columns = if samples == 0 {
            Array2::zeros((types.len(), 0))
        } else {
            decode_columns(&types, &raw)
        };

        if columns.ncols() != samples as usize {
            debug!(
                "Server reported {} samples, decoded {} lines",
                samples,
                columns.ncols()
            );
        }

        Ok(GatherData {
            types,
            samples,
            columns,
        })
    }

    /// One row per address: `[[addr0[0], addr0[1], ...], [addr1[0], ...], ...]`
    pub fn get_columns(&mut self) -> Result<Array2<f64>, PmacError> {
        Ok(self.query_all()?.columns)
    }

    /// One row per sample: `[[addr0[0], addr1[0], ...], [addr0[1], ...], ...]`
    pub fn get_rows(&mut self) -> Result<Array2<f64>, PmacError> {
        Ok(self.get_columns()?.reversed_axes())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
