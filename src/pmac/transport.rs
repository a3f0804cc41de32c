//! Line-oriented framing over a duplex byte channel
//!
//! [`LineTransport`] owns a [`ByteChannel`] (an SSH shell, or a fake in tests),
//! accumulates whatever bytes arrive, and hands out complete lines regardless
//! of how the remote side fragments them. Reads are bounded by a
//! [`ReadTimeout`]; running out of time is reported as
//! [`PmacError::Timeout`] rather than an empty result because almost every
//! caller needs a definite answer from the controller.

use crate::error::PmacError;
use crate::utils::Clock;
use log::{debug, warn};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

const RECV_CHUNK: usize = 1024;
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// A duplex byte stream that can be polled without blocking
pub trait ByteChannel: Send {
    /// Read whatever is available right now
    ///
    /// Returns `Ok(None)` when nothing is pending and `Ok(Some(0))` once the
    /// peer has closed the channel.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Same as [`ByteChannel::try_recv`] for the stderr side channel
    fn try_recv_stderr(&mut self, _buf: &mut [u8]) -> io::Result<Option<usize>> {
        Ok(None)
    }

    /// Write all of `data`
    fn send(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Time budget for a line read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTimeout {
    /// Keep waiting for lines forever
    Indefinite,
    /// Only return lines that are already buffered or pending, then stop quietly
    Opportunistic,
    /// Stop once this much time has passed with nothing pending, then signal
    /// [`PmacError::Timeout`]
    Bounded(Duration),
}

pub struct LineTransport<C: ByteChannel> {
    channel: C,
    clock: Arc<dyn Clock>,
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    closed: bool,
}

impl<C: ByteChannel> LineTransport<C> {
    pub fn new(channel: C, clock: Arc<dyn Clock>) -> Self {
        Self::with_delimiter(channel, clock, "\r\n")
    }

    pub fn with_delimiter(channel: C, clock: Arc<dyn Clock>, delimiter: &str) -> Self {
        Self {
            channel,
            clock,
            delimiter: delimiter.as_bytes().to_vec(),
            buffer: Vec::with_capacity(RECV_CHUNK),
            pending: VecDeque::new(),
            closed: false,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes received after the last complete line
    pub fn partial(&self) -> &[u8] {
        &self.buffer
    }

    /// Lazily read lines within `timeout`
    ///
    /// The iterator yields `Ok(line)` for every complete line (trailing
    /// whitespace removed). A bounded read that runs out of time yields a
    /// single `Err(PmacError::Timeout)` and then ends.
    pub fn read_lines(&mut self, timeout: ReadTimeout) -> LineReader<'_, C> {
        let started = self.clock.now();
        LineReader {
            transport: self,
            timeout,
            started,
            finished: false,
        }
    }

    /// Write `text` followed by `delim` as one send
    pub fn send_line_with(&mut self, text: &str, delim: &str) -> Result<(), PmacError> {
        if self.closed {
            return Err(PmacError::ChannelClosed);
        }
        debug!("-> {}", text);
        let mut packet = Vec::with_capacity(text.len() + delim.len());
        packet.extend_from_slice(text.as_bytes());
        packet.extend_from_slice(delim.as_bytes());
        self.send_raw(&packet)
    }

    pub fn send_line(&mut self, text: &str) -> Result<(), PmacError> {
        self.send_line_with(text, "\n")
    }

    pub fn send_raw(&mut self, data: &[u8]) -> Result<(), PmacError> {
        if self.closed {
            return Err(PmacError::ChannelClosed);
        }
        self.channel.send(data).map_err(|source| PmacError::Io {
            source,
            context: "Writing to channel".to_string(),
        })
    }

    /// Pull one chunk from the channel; `Ok(false)` when nothing was pending
    fn fill(&mut self) -> Result<bool, PmacError> {
        if self.closed {
            return Err(PmacError::ChannelClosed);
        }

        let mut chunk = [0u8; RECV_CHUNK];
        let received = self
            .channel
            .try_recv(&mut chunk)
            .map_err(|source| PmacError::Io {
                source,
                context: "Reading from channel".to_string(),
            })?;

        match received {
            None => Ok(false),
            Some(0) => {
                debug!("Channel closed by peer");
                self.closed = true;
                Err(PmacError::ChannelClosed)
            }
            Some(n) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                self.split_lines();
                Ok(true)
            }
        }
    }

    fn split_lines(&mut self) {
        let delim_len = self.delimiter.len();
        while let Some(pos) = find_subslice(&self.buffer, &self.delimiter) {
            let line: Vec<u8> = self.buffer.drain(..pos + delim_len).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim_end().to_string();
            debug!("<- {}", text);
            self.pending.push_back(text);
        }
    }

    /// Log anything waiting on the stderr side channel
    fn drain_stderr(&mut self) {
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            match self.channel.try_recv_stderr(&mut chunk) {
                Ok(Some(n)) if n > 0 => {
                    warn!("<stderr- {}", String::from_utf8_lossy(&chunk[..n]).trim_end());
                }
                Ok(_) => break,
                Err(e) => {
                    debug!("stderr read failed: {}", e);
                    break;
                }
            }
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Iterator returned by [`LineTransport::read_lines`]
pub struct LineReader<'a, C: ByteChannel> {
    transport: &'a mut LineTransport<C>,
    timeout: ReadTimeout,
    started: std::time::Instant,
    finished: bool,
}

impl<C: ByteChannel> LineReader<'_, C> {
    fn within_budget(&self) -> bool {
        match self.timeout {
            ReadTimeout::Indefinite => true,
            ReadTimeout::Opportunistic => false,
            ReadTimeout::Bounded(limit) => self.elapsed() <= limit,
        }
    }

    fn elapsed(&self) -> Duration {
        self.transport.clock.now().duration_since(self.started)
    }
}

impl<C: ByteChannel> Iterator for LineReader<'_, C> {
    type Item = Result<String, PmacError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.transport.pending.pop_front() {
                return Some(Ok(line));
            }

            if self.finished {
                return None;
            }

            match self.transport.fill() {
                Ok(true) => {}
                Ok(false) => {
                    self.transport.drain_stderr();

                    if self.within_budget() {
                        self.transport.clock.sleep(IDLE_SLEEP);
                        continue;
                    }

                    self.finished = true;
                    return match self.timeout {
                        ReadTimeout::Bounded(_) => Some(Err(PmacError::Timeout {
                            elapsed: self.elapsed(),
                        })),
                        _ => None,
                    };
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Read both streams of `channel` until the peer closes it
///
/// Stdout and stderr are polled in turn, so a peer that stops writing stdout
/// until its stderr has been consumed is still drained. Returns
/// `(stdout, stderr)`.
pub fn drain_to_end<C: ByteChannel>(
    channel: &mut C,
    clock: &dyn Clock,
) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut chunk = [0u8; RECV_CHUNK];
    let mut stdout_closed = false;

    loop {
        let mut progressed = false;
        if !stdout_closed {
            match channel.try_recv(&mut chunk)? {
                Some(0) => stdout_closed = true,
                Some(n) => {
                    stdout.extend_from_slice(&chunk[..n]);
                    progressed = true;
                }
                None => {}
            }
        }
        if let Some(n) = channel.try_recv_stderr(&mut chunk)? {
            if n > 0 {
                stderr.extend_from_slice(&chunk[..n]);
                progressed = true;
            }
        }

        if !progressed {
            if stdout_closed {
                return Ok((stdout, stderr));
            }
            clock.sleep(IDLE_SLEEP);
        }
    }
}
