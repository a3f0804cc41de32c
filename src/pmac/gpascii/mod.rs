//! The gpascii command interpreter session
//!
//! [`Gpascii`] launches the controller's ASCII interpreter on top of a
//! [`ShellChannel`] and exchanges commands and `name=value` echoes with it.
//! Every exchange borrows the session mutably, so a session shared between
//! threads through [`SharedGpascii`] serialises whole exchanges (and any
//! longer sequence a caller performs while holding the lock).

use super::shell::ShellChannel;
use super::transport::{ByteChannel, LineReader, LineTransport, ReadTimeout};
use super::wait::{WaitMatch, WaitPattern, is_error_line, wait_for};
use crate::config::SessionConfig;
use crate::error::PmacError;
use crate::utils::{Clock, system_clock};
use log::{debug, info, warn};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

mod coords;
mod program;

pub use coords::CoordinateSnapshot;
pub use program::{MonitorOptions, RunOptions, VariableChange};

pub const GPASCII_COMMAND: &str = "gpascii -2 2>&1";
pub const STARTUP_BANNER: &str = r".*(STDIN Open for ASCII Input)$";
const EOT: &[u8] = b"\x04";

/// Interpreter session shared between threads
pub type SharedGpascii<C> = Arc<Mutex<Gpascii<C>>>;

/// Lifecycle of a [`Gpascii`] session
///
/// There is no value for a session that never connected: `open` returns
/// either an open session or an error. Waiting for a command's reply happens
/// inside a single `&mut self` call, so it is reported as `InterpreterOpen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Shell prompt seen, interpreter not yet confirmed
    ShellReady,
    InterpreterOpen,
    /// The controller closed the channel under an open session
    Disconnected,
    Closed,
}

pub struct Gpascii<C: ByteChannel> {
    transport: LineTransport<C>,
    session: SessionConfig,
    state: SessionState,
    coord_errors: BTreeMap<i64, String>,
    coord_reply: Regex,
}

impl<C: ByteChannel> Gpascii<C> {
    pub fn open(channel: C, username: &str, session: SessionConfig) -> Result<Self, PmacError> {
        Self::open_with_clock(channel, username, session, system_clock())
    }

    /// Start the interpreter on a fresh shell channel
    ///
    /// Fails with `PmacError::Protocol` if the interpreter banner does not
    /// appear within the startup timeout.
    pub fn open_with_clock(
        channel: C,
        username: &str,
        session: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PmacError> {
        let mut shell = ShellChannel::open(channel, username, session.clone(), clock)?;
        shell.send_line(GPASCII_COMMAND)?;

        let mut gpascii = Self {
            transport: shell.into_transport(),
            session,
            state: SessionState::ShellReady,
            coord_errors: BTreeMap::from([(0, "no error".to_string())]),
            coord_reply: Regex::new(coords::COORD_REPLY)
                .map_err(|e| PmacError::Parse(format!("Coordinate reply pattern: {e}")))?,
        };

        let banner = WaitPattern::new(STARTUP_BANNER)?;
        let timeout = gpascii.session.startup_timeout();
        if gpascii.wait_for(&banner, timeout)?.is_none() {
            gpascii.state = SessionState::Closed;
            return Err(PmacError::Protocol("startup banner not observed".to_string()));
        }

        gpascii.state = SessionState::InterpreterOpen;
        info!("gpascii session open");
        Ok(gpascii)
    }

    pub fn into_shared(self) -> SharedGpascii<C> {
        Arc::new(Mutex::new(self))
    }

    pub fn state(&self) -> SessionState {
        if self.state != SessionState::Closed && self.transport.is_closed() {
            SessionState::Disconnected
        } else {
            self.state
        }
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.transport.clock()
    }

    fn ensure_open(&self) -> Result<(), PmacError> {
        if self.state == SessionState::Closed || self.transport.is_closed() {
            Err(PmacError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    pub fn send_line(&mut self, line: &str) -> Result<(), PmacError> {
        self.ensure_open()?;
        self.transport.send_line(line)
    }

    /// Send `line`, then drain the response and check it for errors
    pub fn send_line_sync(&mut self, line: &str) -> Result<Vec<String>, PmacError> {
        self.send_line(line)?;
        self.sync()
    }

    pub fn read_lines(&mut self, timeout: ReadTimeout) -> LineReader<'_, C> {
        self.transport.read_lines(timeout)
    }

    pub fn wait_for(
        &mut self,
        pattern: &WaitPattern,
        timeout: Duration,
    ) -> Result<Option<WaitMatch>, PmacError> {
        wait_for(self.transport.read_lines(ReadTimeout::Bounded(timeout)), pattern)
    }

    /// Drain pending output, failing on the first error line
    pub fn sync(&mut self) -> Result<Vec<String>, PmacError> {
        self.ensure_open()?;
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

    /// Read a variable's value exactly as the interpreter echoes it
    ///
    /// Lines echoing some other variable are skipped. Any line containing
    /// `error` aborts the read with `PmacError::Interpreter`.
    pub fn get_variable_raw(&mut self, name: &str) -> Result<String, PmacError> {
        let timeout = self.session.variable_timeout();
        self.get_variable_raw_within(name, timeout)
    }

    pub fn get_variable_raw_within(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<String, PmacError> {
        let name = name.to_lowercase();
        self.send_line(&name)?;

        let started = self.clock().now();
        for item in self.transport.read_lines(ReadTimeout::Bounded(timeout)) {
            let line = item?;
            if is_error_line(&line) {
                return Err(PmacError::Interpreter(line));
            }
            if let Some((echoed, value)) = line.split_once('=') {
                if echoed.trim().eq_ignore_ascii_case(&name) {
                    return Ok(value.trim().to_string());
                }
            }
        }

        Err(PmacError::Timeout {
            elapsed: self.clock().now().duration_since(started),
        })
    }

    /// Read a variable and convert it, treating `$` prefixed values as hex
    pub fn get_variable<T: FromStr>(&mut self, name: &str) -> Result<T, PmacError> {
        let raw = self.get_variable_raw(name)?;
        parse_value(name, &raw)
    }

    /// [`Gpascii::get_variable`] with its own reply timeout
    pub fn get_variable_within<T: FromStr>(
        &mut self,
        name: &str,
        timeout: Duration,
    ) -> Result<T, PmacError> {
        let raw = self.get_variable_raw_within(name, timeout)?;
        parse_value(name, &raw)
    }

    /// Write a variable
    ///
    /// With `check`, the variable is read back and the controller's value is
    /// returned, which differs from `value` when the firmware clamps it.
    pub fn set_variable(
        &mut self,
        name: &str,
        value: impl Display,
        check: bool,
    ) -> Result<Option<String>, PmacError> {
        let name = name.to_lowercase();
        self.send_line(&format!("{name}={value}"))?;
        if check {
            self.get_variable_raw(&name).map(Some)
        } else {
            self.sync()?;
            Ok(None)
        }
    }

    /// Read several variables, formatting per-item failures as `Error: <message>`
    pub fn get_variables<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Vec<String>, PmacError> {
        self.get_variables_with(names, |_, e| format!("Error: {e}"))
    }

    /// Read several variables, turning interpreter errors and timeouts into
    /// values with `on_error`
    ///
    /// Any other failure (a closed channel, for instance) stops the whole read.
    pub fn get_variables_with<S, F>(
        &mut self,
        names: &[S],
        mut on_error: F,
    ) -> Result<Vec<String>, PmacError>
    where
        S: AsRef<str>,
        F: FnMut(&str, &PmacError) -> String,
    {
        let mut values = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            match self.get_variable_raw(name) {
                Ok(value) => values.push(value),
                Err(e) if e.is_recoverable() => {
                    debug!("{} unavailable: {}", name, e);
                    values.push(on_error(name, &e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(values)
    }

    pub fn kill_motor(&mut self, motor: u32) -> Result<(), PmacError> {
        self.send_line(&format!("#{motor}k"))
    }

    /// Kill several motors with one command
    ///
    /// The interpreter expects the motor list sorted and free of duplicates.
    pub fn kill_motors(&mut self, motors: &[u32]) -> Result<(), PmacError> {
        let mut motors = motors.to_vec();
        motors.sort_unstable();
        motors.dedup();
        if motors.is_empty() {
            return Ok(());
        }

        let list = motors
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.send_line(&format!("#{list}k"))
    }

    /// Servo period in seconds
    pub fn servo_period(&mut self) -> Result<f64, PmacError> {
        let period_ms: f64 = self.get_variable("Sys.ServoPeriod")?;
        Ok(period_ms * 1e-3)
    }

    /// Servo frequency in Hz
    pub fn servo_frequency(&mut self) -> Result<f64, PmacError> {
        Ok(1.0 / self.servo_period()?)
    }

    /// Add or replace a `Coord[n].ErrorStatus` description
    pub fn register_coord_error(&mut self, code: i64, description: &str) {
        self.coord_errors.insert(code, description.to_string());
    }

    pub fn coord_error_description(&self, code: i64) -> Option<&str> {
        self.coord_errors.get(&code).map(String::as_str)
    }

    /// Leave the interpreter
    ///
    /// Drains pending output and sends end-of-transmission. Closing twice is
    /// a no-op.
    pub fn close(&mut self) -> Result<(), PmacError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        if !self.transport.is_closed() {
            if let Err(e) = self.sync() {
                warn!("Error while draining before close: {}", e);
            }
            self.transport.send_raw(EOT)?;
        }

        self.state = SessionState::Closed;
        info!("gpascii session closed");
        Ok(())
    }
}

impl<C: ByteChannel> Drop for Gpascii<C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Close on drop failed: {}", e);
        }
    }
}

/// Convert an echoed value, decoding `$`-prefixed hexadecimal integers
pub fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, PmacError> {
    let raw = raw.trim();
    let text = match raw.strip_prefix('$') {
        Some(hex) => u64::from_str_radix(hex, 16)
            .map_err(|e| PmacError::Parse(format!("{name}: bad hex value {raw:?}: {e}")))?
            .to_string(),
        None => raw.to_string(),
    };

    text.parse::<T>()
        .map_err(|_| PmacError::Parse(format!("{name}: cannot convert {raw:?}")))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::{FakeChannel, FakeHandle, SimulatedPmac};
    use crate::utils::ManualClock;

    pub(crate) fn open_sim(sim: &SimulatedPmac) -> (Gpascii<FakeChannel>, FakeHandle) {
        let (channel, handle) = sim.channel();
        let gpascii = Gpascii::open_with_clock(
            channel,
            "root",
            SessionConfig::default(),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        handle.clear_sent();
        (gpascii, handle)
    }

    #[test]
    fn test_open_launches_interpreter() {
        let sim = SimulatedPmac::new();
        let (channel, handle) = sim.channel();
        let gpascii = Gpascii::open_with_clock(
            channel,
            "root",
            SessionConfig::default(),
            Arc::new(ManualClock::new()),
        )
        .unwrap();

        assert_eq!(gpascii.state(), SessionState::InterpreterOpen);
        assert_eq!(handle.sent().last().unwrap(), GPASCII_COMMAND);
    }

    #[test]
    fn test_missing_banner_is_protocol_error() {
        let (channel, handle) = FakeChannel::with_responder(|line| {
            if line.starts_with("export PS1") {
                vec!["root@ppmac:/$".to_string()]
            } else {
                vec![]
            }
        });
        let clock = Arc::new(ManualClock::new());
        let result = Gpascii::open_with_clock(channel, "root", SessionConfig::default(), clock);

        match result {
            Err(PmacError::Protocol(msg)) => assert_eq!(msg, "startup banner not observed"),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("session opened without banner"),
        }
        assert_eq!(handle.sent().last().unwrap(), GPASCII_COMMAND);
    }

    pub(crate) fn controller_chatter() -> Vec<String> {
        vec![
            "UnlinkGatherThread: gather thread unlinked".to_string(),
            "// *** EOF".to_string(),
            "motion.c:// *** exit".to_string(),
        ]
    }

    #[test]
    fn test_session_tolerates_controller_chatter() {
        let sim = SimulatedPmac::new();
        sim.set("Motor[1].JogSpeed", "32");
        sim.state.lock().chatter = controller_chatter();

        let (mut gpascii, _handle) = open_sim(&sim);
        assert_eq!(gpascii.state(), SessionState::InterpreterOpen);

        let speed: f64 = gpascii.get_variable("Motor[1].JogSpeed").unwrap();
        assert_eq!(speed, 32.0);
        let read_back = gpascii.set_variable("Motor[1].JogSpeed", 40, true).unwrap();
        assert_eq!(read_back.as_deref(), Some("40"));
        assert!(gpascii.send_line_sync("Motor[1].JogSpeed=41").is_ok());
        assert_eq!(sim.get("Motor[1].JogSpeed").as_deref(), Some("41"));
    }

    #[test]
    fn test_get_variable_within_uses_given_timeout() {
        let sim = SimulatedPmac::new();
        sim.set("Sys.MaxMotors", "$20");
        let (mut gpascii, _handle) = open_sim(&sim);

        let motors: u32 = gpascii
            .get_variable_within("Sys.MaxMotors", Duration::from_millis(50))
            .unwrap();
        assert_eq!(motors, 32);

        let result = gpascii.get_variable_within::<f64>("Unknown.Thing", Duration::from_millis(50));
        assert!(matches!(result, Err(PmacError::Interpreter(_))));
    }

    #[test]
    fn test_peer_close_reports_disconnected() {
        let sim = SimulatedPmac::new();
        let (mut gpascii, handle) = open_sim(&sim);

        handle.close();
        assert!(matches!(gpascii.sync(), Err(PmacError::ChannelClosed)));
        assert_eq!(gpascii.state(), SessionState::Disconnected);
        assert!(matches!(
            gpascii.send_line("Sys.Time"),
            Err(PmacError::ChannelClosed)
        ));

        gpascii.close().unwrap();
        assert_eq!(gpascii.state(), SessionState::Closed);
    }

    #[test]
    fn test_get_variable_is_case_insensitive() {
        let sim = SimulatedPmac::new();
        sim.set("Motor[3].ActPos", "12.5");
        let (mut gpascii, handle) = open_sim(&sim);

        let pos: f64 = gpascii.get_variable("Motor[3].ActPos").unwrap();
        assert_eq!(pos, 12.5);
        assert_eq!(handle.sent(), vec!["motor[3].actpos"]);
    }

    #[test]
    fn test_get_variable_ignores_unrelated_echo() {
        let (channel, handle) = FakeChannel::new();
        handle.push_line("root@ppmac:/$");
        handle.push_line("STDIN Open for ASCII Input");
        let mut gpascii = Gpascii::open_with_clock(
            channel,
            "root",
            SessionConfig::default(),
            Arc::new(ManualClock::new()),
        )
        .unwrap();

        handle.push_line("Sys.MaxCoords=8");
        handle.push_line("foo=bar");
        assert_eq!(gpascii.get_variable_raw("Foo").unwrap(), "bar");
    }

    #[test]
    fn test_get_variable_hex_and_errors() {
        let sim = SimulatedPmac::new();
        sim.set("Sys.WpKey", "$AAAAAAAA");
        let (mut gpascii, _handle) = open_sim(&sim);

        let key: u64 = gpascii.get_variable("Sys.WpKey").unwrap();
        assert_eq!(key, 0xAAAA_AAAA);

        let err = gpascii.get_variable_raw("Nonsense[1].Thing").unwrap_err();
        assert!(matches!(err, PmacError::Interpreter(ref line) if line.contains("ILLEGAL CMD")));

        let err = gpascii.get_variable::<i32>("Sys.ServoPeriod").unwrap_err();
        assert!(matches!(err, PmacError::Parse(_)));
    }

    #[test]
    fn test_get_variable_times_out() {
        let (channel, handle) = FakeChannel::new();
        handle.push_line("root@ppmac:/$");
        handle.push_line("STDIN Open for ASCII Input");
        let clock = Arc::new(ManualClock::new());
        let mut gpascii =
            Gpascii::open_with_clock(channel, "root", SessionConfig::default(), clock.clone())
                .unwrap();

        let before = clock.elapsed();
        let err = gpascii.get_variable_raw("Sys.MaxMotors").unwrap_err();
        assert!(matches!(err, PmacError::Timeout { .. }));
        assert!(clock.elapsed() - before >= Duration::from_secs(1));
    }

    #[test]
    fn test_set_variable_returns_read_back() {
        let sim = SimulatedPmac::new();
        sim.set("Motor[1].JogSpeed", "10");
        sim.clamp("Motor[1].JogSpeed", 50.0);
        let (mut gpascii, handle) = open_sim(&sim);

        let value = gpascii.set_variable("Motor[1].JogSpeed", 100, true).unwrap();
        assert_eq!(value.as_deref(), Some("50"));
        assert_eq!(handle.sent(), vec!["motor[1].jogspeed=100", "motor[1].jogspeed"]);

        assert_eq!(gpascii.set_variable("Motor[1].JogSpeed", 20, false).unwrap(), None);
        assert_eq!(sim.get("motor[1].jogspeed").as_deref(), Some("20"));
    }

    #[test]
    fn test_get_variables_formats_failures() {
        let sim = SimulatedPmac::new();
        sim.set("P1", "3");
        let (mut gpascii, _handle) = open_sim(&sim);

        let values = gpascii.get_variables(&["P1", "Bogus"]).unwrap();
        assert_eq!(values[0], "3");
        assert!(values[1].starts_with("Error: Interpreter error"));

        let values = gpascii
            .get_variables_with(&["Bogus", "P1"], |name, _| format!("{name}?"))
            .unwrap();
        assert_eq!(values, vec!["Bogus?", "3"]);
    }

    #[test]
    fn test_kill_motors_sorted_and_deduplicated() {
        let sim = SimulatedPmac::new();
        let (mut gpascii, handle) = open_sim(&sim);

        gpascii.kill_motors(&[3, 1, 2, 3]).unwrap();
        gpascii.kill_motors(&[]).unwrap();
        gpascii.kill_motor(7).unwrap();
        assert_eq!(handle.sent(), vec!["#1,2,3k", "#7k"]);
    }

    #[test]
    fn test_servo_timing() {
        let sim = SimulatedPmac::new();
        let (mut gpascii, _handle) = open_sim(&sim);

        let period = gpascii.servo_period().unwrap();
        assert!((period - 0.000442673749446657994).abs() < 1e-15);
        assert!((gpascii.servo_frequency().unwrap() - 2259.0).abs() < 1.0);
    }

    #[test]
    fn test_close_sends_eot_once() {
        let sim = SimulatedPmac::new();
        let (mut gpascii, handle) = open_sim(&sim);

        gpascii.close().unwrap();
        gpascii.close().unwrap();
        assert_eq!(gpascii.state(), SessionState::Closed);
        assert_eq!(handle.unterminated(), b"\x04");
        assert!(matches!(gpascii.send_line("P1"), Err(PmacError::ChannelClosed)));
    }

    #[test]
    fn test_shared_session_serialises_access() {
        let sim = SimulatedPmac::new();
        sim.set("P1", "1");
        let (gpascii, _handle) = open_sim(&sim);
        let shared = gpascii.into_shared();

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.lock().get_variable::<i32>("P1"))
        };
        assert_eq!(worker.join().unwrap().unwrap(), 1);
        assert_eq!(shared.lock().get_variable::<i32>("P1").unwrap(), 1);
    }
}
