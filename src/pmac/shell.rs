//! Interactive shell sessions on the controller

use super::transport::{ByteChannel, LineReader, LineTransport, ReadTimeout};
use super::wait::{WaitMatch, WaitPattern, is_error_line, wait_for};
use crate::config::SessionConfig;
use crate::error::PmacError;
use crate::utils::Clock;
use log::{debug, info};
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static SENTINEL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A login shell with echo disabled and a known prompt
pub struct ShellChannel<C: ByteChannel> {
    transport: LineTransport<C>,
    session: SessionConfig,
    prompt: Regex,
}

impl<C: ByteChannel> ShellChannel<C> {
    /// Prepare a freshly opened shell channel
    ///
    /// Disables terminal echo, installs the `user@host:cwd$ ` prompt and waits
    /// for it to appear.
    pub fn open(
        channel: C,
        username: &str,
        session: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PmacError> {
        let transport = LineTransport::with_delimiter(channel, clock, &session.line_delimiter);
        let prompt = Regex::new(&format!(r"^{}@[^$#]*[$#] ?", regex::escape(username)))
            .map_err(|e| PmacError::InvalidCommand(format!("Bad user name {username:?}: {e}")))?;

        let mut shell = Self {
            transport,
            session,
            prompt,
        };

        shell.send_line("stty -echo")?;
        shell.send_line(r#"export PS1="\u@\h:\w\$ ""#)?;

        let ready = WaitPattern::new(&format!("{}@.*", regex::escape(username)))?;
        let timeout = shell.session.startup_timeout();
        if shell.wait_for(&ready, timeout)?.is_none() {
            return Err(PmacError::Protocol(format!(
                "shell prompt for {username} not observed"
            )));
        }

        info!("Shell ready for {}", username);
        Ok(shell)
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.transport.clock()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn send_line(&mut self, line: &str) -> Result<(), PmacError> {
        self.transport.send_line(line)
    }

    pub fn send_raw(&mut self, data: &[u8]) -> Result<(), PmacError> {
        self.transport.send_raw(data)
    }

    pub fn read_lines(&mut self, timeout: ReadTimeout) -> LineReader<'_, C> {
        self.transport.read_lines(timeout)
    }

    /// Wait up to `timeout` for a line matching `pattern`
    pub fn wait_for(
        &mut self,
        pattern: &WaitPattern,
        timeout: Duration,
    ) -> Result<Option<WaitMatch>, PmacError> {
        wait_for(self.transport.read_lines(ReadTimeout::Bounded(timeout)), pattern)
    }

    /// Drain pending output
    ///
    /// Returns the drained lines, or `PmacError::Interpreter` at the first line
    /// that reports an error.
    pub fn sync(&mut self) -> Result<Vec<String>, PmacError> {
        let timeout = ReadTimeout::Bounded(self.session.sync_timeout());
        let mut drained = Vec::new();

        for item in self.transport.read_lines(timeout) {
            match item {
                Ok(line) if is_error_line(&line) => return Err(PmacError::Interpreter(line)),
                Ok(line) => drained.push(line),
                Err(PmacError::Timeout { .. }) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(drained)
    }

    /// Run `command` and collect its output
    ///
    /// Completion is detected by echoing a unique marker after the command.
    /// Prompt prefixes are stripped from the returned lines.
    pub fn run(&mut self, command: &str, timeout: Duration) -> Result<Vec<String>, PmacError> {
        let id = SENTINEL_COUNTER.fetch_add(1, Ordering::Relaxed);
        let sentinel = format!("__rusty_pmac_done_{}_{}", std::process::id(), id);

        self.send_line(command)?;
        self.send_line(&format!("echo {sentinel}"))?;

        let pattern = WaitPattern::new(&format!(".*{}$", regex::escape(&sentinel)))?;
        let started = self.clock().now();
        match self.wait_for(&pattern, timeout)? {
            Some(found) => Ok(found
                .lines
                .into_iter()
                .map(|line| self.prompt.replace(&line, "").to_string())
                .collect()),
            None => {
                debug!("No completion marker for {:?}", command);
                Err(PmacError::Timeout {
                    elapsed: self.clock().now().duration_since(started),
                })
            }
        }
    }

    pub(crate) fn into_transport(self) -> LineTransport<C> {
        self.transport
    }
}
