//! In-memory stand-ins for the controller used by unit tests

use crate::pmac::transport::ByteChannel;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::Arc;

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

struct FakeState {
    inbox: VecDeque<u8>,
    stderr: VecDeque<u8>,
    outgoing: Vec<u8>,
    sent: Vec<String>,
    chunk_size: usize,
    closed: bool,
    responder: Option<Responder>,
}

/// Byte channel whose far end is a closure answering each sent line
pub struct FakeChannel {
    state: Arc<Mutex<FakeState>>,
}

/// Test-side view of a [`FakeChannel`]
#[derive(Clone)]
pub struct FakeHandle {
    state: Arc<Mutex<FakeState>>,
}

impl FakeChannel {
    pub fn new() -> (Self, FakeHandle) {
        let state = Arc::new(Mutex::new(FakeState {
            inbox: VecDeque::new(),
            stderr: VecDeque::new(),
            outgoing: Vec::new(),
            sent: Vec::new(),
            chunk_size: 1024,
            closed: false,
            responder: None,
        }));
        (
            Self {
                state: state.clone(),
            },
            FakeHandle { state },
        )
    }

    pub fn with_responder<F>(responder: F) -> (Self, FakeHandle)
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        let (channel, handle) = Self::new();
        channel.state.lock().responder = Some(Box::new(responder));
        (channel, handle)
    }
}

impl FakeHandle {
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state.lock().inbox.extend(bytes.iter().copied());
    }

    pub fn push_line(&self, line: &str) {
        self.push_bytes(format!("{line}\r\n").as_bytes());
    }

    pub fn push_stderr(&self, bytes: &[u8]) {
        self.state.lock().stderr.extend(bytes.iter().copied());
    }

    pub fn set_chunk_size(&self, size: usize) {
        self.state.lock().chunk_size = size.max(1);
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Every complete line written so far
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// Bytes written after the last newline
    pub fn unterminated(&self) -> Vec<u8> {
        self.state.lock().outgoing.clone()
    }
}

impl ByteChannel for FakeChannel {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut state = self.state.lock();
        if state.inbox.is_empty() {
            return Ok(if state.closed { Some(0) } else { None });
        }
        let n = buf.len().min(state.chunk_size).min(state.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(Some(n))
    }

    fn try_recv_stderr(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut state = self.state.lock();
        if state.stderr.is_empty() {
            return Ok(None);
        }
        let n = buf.len().min(state.stderr.len());
        for (slot, byte) in buf.iter_mut().zip(state.stderr.drain(..n)) {
            *slot = byte;
        }
        Ok(Some(n))
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "fake channel closed"));
        }
        state.outgoing.extend_from_slice(data);

        while let Some(pos) = state.outgoing.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = state.outgoing.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).to_string();
            state.sent.push(line.clone());

            let replies = match state.responder.as_mut() {
                Some(responder) => responder(&line),
                None => Vec::new(),
            };
            for reply in replies {
                state.inbox.extend(reply.as_bytes().iter().copied());
                state.inbox.extend(b"\r\n".iter().copied());
            }
        }
        Ok(())
    }
}

/// Minimal model of a controller shell running the gpascii interpreter
///
/// Keeps variables (case-insensitive), motor bindings and a countdown for the
/// running motion program, and refuses to bind a motor still claimed by
/// another coordinate system.
pub struct SimState {
    pub variables: HashMap<String, (String, String)>,
    /// motor → (coord, axis)
    pub motors: BTreeMap<u32, (u32, String)>,
    /// lowercase name → maximum accepted value
    pub clamps: HashMap<String, f64>,
    /// Remaining `ProgActive` polls that report 1
    pub active_polls: u32,
    /// Extra lines emitted before each reply
    pub chatter: Vec<String>,
    /// Lines returned for the next unrecognised command
    pub scripted: VecDeque<Vec<String>>,
    pub started_programs: Vec<String>,
    /// Variable (lowercase) that increments every time it is read
    pub counter: Option<String>,
}

#[derive(Clone)]
pub struct SimulatedPmac {
    pub state: Arc<Mutex<SimState>>,
}

impl SimulatedPmac {
    pub fn new() -> Self {
        let sim = Self {
            state: Arc::new(Mutex::new(SimState {
                variables: HashMap::new(),
                motors: BTreeMap::new(),
                clamps: HashMap::new(),
                active_polls: 0,
                chatter: Vec::new(),
                scripted: VecDeque::new(),
                started_programs: Vec::new(),
                counter: None,
            })),
        };
        sim.set("Sys.MaxMotors", "8");
        sim.set("Sys.MaxCoords", "4");
        sim.set("Sys.ServoPeriod", "0.442673749446657994");
        sim
    }

    pub fn set(&self, name: &str, value: &str) {
        self.state
            .lock()
            .variables
            .insert(name.to_lowercase(), (name.to_string(), value.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .variables
            .get(&name.to_lowercase())
            .map(|(_, v)| v.clone())
    }

    pub fn bind(&self, coord: u32, motor: u32, axis: &str) {
        self.state
            .lock()
            .motors
            .insert(motor, (coord, axis.to_string()));
    }

    pub fn clamp(&self, name: &str, max: f64) {
        self.state.lock().clamps.insert(name.to_lowercase(), max);
    }

    /// Channel wired to this simulator
    pub fn channel(&self) -> (FakeChannel, FakeHandle) {
        let sim = self.clone();
        FakeChannel::with_responder(move |line| sim.respond(line))
    }

    pub fn respond(&self, line: &str) -> Vec<String> {
        let mut state = self.state.lock();
        let mut out = state.chatter.clone();
        out.extend(state.handle(line));
        out
    }
}

static QUERY_RE: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"^&0#(\d+)->$").unwrap());
static BIND_RE: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"^&(\d+)#(\d+)->(\w+)$").unwrap());
static PROGRAM_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"^&([\d,]+)begin(\d+)(\.\d+)?(r|abort)?$").unwrap()
});

impl SimState {
    fn handle(&mut self, line: &str) -> Vec<String> {
        let line = line.trim();

        if line == "stty -echo" || line.is_empty() {
            return vec![];
        }
        if line.starts_with("export PS1") {
            return vec!["root@ppmac:/$".to_string()];
        }
        if line.starts_with("gpascii") {
            return vec!["STDIN Open for ASCII Input".to_string()];
        }
        if let Some(sentinel) = line.strip_prefix("echo ") {
            return vec![format!("root@ppmac:/$ {sentinel}")];
        }
        if line == "undefine all" {
            self.motors.clear();
            return vec![];
        }
        if let Some(coord) = line
            .strip_prefix('&')
            .and_then(|rest| rest.strip_suffix("undefine"))
            .and_then(|c| c.parse::<u32>().ok())
        {
            self.motors.retain(|_, (c, _)| *c != coord);
            return vec![];
        }
        if line.starts_with('&') && line.ends_with("abort") && !line.contains("begin") {
            return vec![];
        }
        if let Some(caps) = QUERY_RE.captures(line) {
            let motor: u32 = caps[1].parse().unwrap();
            return vec![match self.motors.get(&motor) {
                Some((coord, axis)) => format!("&{coord}#{motor}->{axis}"),
                None => format!("#{motor}->0"),
            }];
        }
        if let Some(caps) = BIND_RE.captures(line) {
            let coord: u32 = caps[1].parse().unwrap();
            let motor: u32 = caps[2].parse().unwrap();
            let axis = caps[3].to_string();
            if axis == "0" {
                if matches!(self.motors.get(&motor), Some((c, _)) if *c == coord) {
                    self.motors.remove(&motor);
                }
                return vec![];
            }
            if let Some((other, _)) = self.motors.get(&motor) {
                if *other != coord {
                    return vec![format!(
                        "stdin:1:1: error #39: MOTOR {motor} ALREADY ASSIGNED IN &{other}"
                    )];
                }
            }
            self.motors.insert(motor, (coord, axis));
            return vec![];
        }
        if let Some(caps) = PROGRAM_RE.captures(line) {
            self.started_programs.push(line.to_string());
            if caps.get(4).is_some_and(|m| m.as_str() == "abort") {
                self.active_polls = 0;
            }
            return vec![];
        }
        if line.starts_with('#') {
            return vec![];
        }
        if let Some((name, value)) = line.split_once('=') {
            let key = name.to_lowercase();
            let mut value = value.to_string();
            if let (Some(max), Ok(v)) = (self.clamps.get(&key), value.parse::<f64>()) {
                if v > *max {
                    value = max.to_string();
                }
            }
            let display = self
                .variables
                .get(&key)
                .map(|(d, _)| d.clone())
                .unwrap_or_else(|| name.to_string());
            self.variables.insert(key, (display, value));
            return vec![];
        }
        if line.to_lowercase().ends_with("].progactive") {
            let active = if self.active_polls > 0 {
                self.active_polls -= 1;
                1
            } else {
                0
            };
            return vec![format!("{line}={active}")];
        }
        let key = line.to_lowercase();
        if self.counter.as_deref() == Some(key.as_str()) {
            if let Some((_, value)) = self.variables.get_mut(&key) {
                let next = value.parse::<i64>().unwrap_or(0) + 1;
                *value = next.to_string();
            }
        }
        if let Some((display, value)) = self.variables.get(&key) {
            return vec![format!("{display}={value}")];
        }
        if let Some(reply) = self.scripted.pop_front() {
            return reply;
        }
        vec!["stdin:1:1: error #20: ILLEGAL CMD".to_string()]
    }
}

/// Connector whose shells talk to a [`SimulatedPmac`] and whose files live in memory
pub struct FakeConnector {
    pub sim: SimulatedPmac,
    files: Mutex<BTreeMap<String, String>>,
    exec_replies: Mutex<HashMap<String, Vec<String>>>,
    pub executed: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new(sim: SimulatedPmac) -> Self {
        Self {
            sim,
            files: Mutex::new(BTreeMap::new()),
            exec_replies: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn script_exec(&self, command: &str, output: Vec<&str>) {
        self.exec_replies.lock().insert(
            command.to_string(),
            output.into_iter().map(str::to_string).collect(),
        );
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().get(path).cloned()
    }
}

impl crate::pmac::Connector for FakeConnector {
    type Channel = FakeChannel;

    fn open_shell(&self) -> Result<FakeChannel, crate::PmacError> {
        Ok(self.sim.channel().0)
    }

    fn exec(&self, command: &str) -> Result<Vec<String>, crate::PmacError> {
        self.executed.lock().push(command.to_string());

        if let Some(path) = command
            .strip_prefix("gpascii -i\"")
            .and_then(|rest| rest.split_once('"'))
            .map(|(path, _)| path.to_string())
        {
            let script = self.file(&path).unwrap_or_default();
            return Ok(script
                .lines()
                .flat_map(|line| self.sim.respond(line))
                .collect());
        }

        Ok(self
            .exec_replies
            .lock()
            .get(command)
            .cloned()
            .unwrap_or_default())
    }
}

impl crate::pmac::FileTransfer for FakeConnector {
    fn read_file(&self, path: &str) -> Result<Vec<String>, crate::PmacError> {
        self.file(path)
            .map(|contents| contents.lines().map(str::to_string).collect())
            .ok_or_else(|| {
                crate::PmacError::Io {
                    source: io::Error::new(io::ErrorKind::NotFound, path.to_string()),
                    context: "Reading remote file".to_string(),
                }
            })
    }

    fn write_file(&self, path: &str, contents: &str) -> Result<(), crate::PmacError> {
        self.files.lock().insert(path.to_string(), contents.to_string());
        Ok(())
    }

    fn file_exists(&self, path: &str) -> Result<bool, crate::PmacError> {
        Ok(self.files.lock().contains_key(path))
    }

    fn remove_file(&self, path: &str) -> Result<(), crate::PmacError> {
        self.files.lock().remove(path);
        Ok(())
    }

    fn make_directory(&self, _path: &str) -> Result<(), crate::PmacError> {
        Ok(())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, crate::PmacError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(self
            .files
            .lock()
            .keys()
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }
}
