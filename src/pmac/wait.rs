//! Pattern matching over a stream of interpreter lines
//!
//! The interpreter mixes asynchronous chatter into the same stream as command
//! responses. [`wait_for`] consumes lines until one matches the target
//! pattern, silently dropping lines that only match a noise pattern.

use crate::error::PmacError;
use log::trace;
use regex::Regex;
use std::sync::LazyLock;

/// Chatter the interpreter emits on its own schedule
pub const PPMAC_MESSAGES: [&str; 3] = [
    r".*// \*\*\* exit",
    r"^UnlinkGatherThread:.*",
    r"^// \*\*\* EOF",
];

static DEFAULT_NOISE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    PPMAC_MESSAGES
        .iter()
        .filter_map(|pattern| anchored(pattern).ok())
        .collect()
});

/// The interpreter has no structured error channel: any line containing
/// `error` is a failure report, even when it is actually data.
pub fn is_error_line(line: &str) -> bool {
    line.contains("error")
}

/// True for lines matching one of the built-in interpreter chatter patterns
pub fn is_ppmac_message(line: &str) -> bool {
    DEFAULT_NOISE.iter().any(|regex| regex.is_match(line))
}

fn anchored(pattern: &str) -> Result<Regex, PmacError> {
    Regex::new(&format!("^(?:{pattern})"))
        .map_err(|e| PmacError::InvalidCommand(format!("Bad pattern {pattern:?}: {e}")))
}

/// Target pattern plus the noise to discard while waiting for it
#[derive(Debug, Clone)]
pub struct WaitPattern {
    literal: String,
    target: Regex,
    noise: Vec<Regex>,
}

/// How a single line relates to a [`WaitPattern`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    /// Target matched, with its capture groups (empty for a literal match)
    Match(Vec<Option<String>>),
    Noise,
    Data,
}

impl WaitPattern {
    /// Pattern matched at the start of each line, with the default chatter filters
    pub fn new(pattern: &str) -> Result<Self, PmacError> {
        Ok(Self {
            literal: pattern.to_string(),
            target: anchored(pattern)?,
            noise: DEFAULT_NOISE.clone(),
        })
    }

    /// Pattern that matches `text` verbatim
    pub fn literal(text: &str) -> Result<Self, PmacError> {
        Ok(Self {
            literal: text.to_string(),
            target: anchored(&format!("{}$", regex::escape(text)))?,
            noise: DEFAULT_NOISE.clone(),
        })
    }

    /// Add a noise pattern, matched at the start of each line
    pub fn with_noise(mut self, pattern: &str) -> Result<Self, PmacError> {
        self.noise.push(anchored(pattern)?);
        Ok(self)
    }

    /// Drop the built-in interpreter chatter filters
    pub fn without_default_noise(mut self) -> Self {
        self.noise.clear();
        self
    }

    pub fn as_str(&self) -> &str {
        &self.literal
    }

    /// Target first, noise second: a line matching both is a match
    pub fn classify(&self, line: &str) -> LineClass {
        if line == self.literal {
            return LineClass::Match(Vec::new());
        }

        if let Some(captures) = self.target.captures(line) {
            let groups = captures
                .iter()
                .skip(1)
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect();
            return LineClass::Match(groups);
        }

        if self.noise.iter().any(|regex| regex.is_match(line)) {
            LineClass::Noise
        } else {
            LineClass::Data
        }
    }
}

/// Successful [`wait_for`] result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitMatch {
    /// Non-noise lines seen before the match
    pub lines: Vec<String>,
    /// The matching line
    pub line: String,
    pub groups: Vec<Option<String>>,
}

impl WaitMatch {
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }
}

/// Consume `source` until a line matches `pattern`
///
/// Returns `Ok(None)` when the source is exhausted first, including when it
/// ends with a timeout. Any other error from the source is propagated.
pub fn wait_for<I>(source: I, pattern: &WaitPattern) -> Result<Option<WaitMatch>, PmacError>
where
    I: IntoIterator<Item = Result<String, PmacError>>,
{
    let mut lines = Vec::new();

    for item in source {
        let line = match item {
            Ok(line) => line,
            Err(PmacError::Timeout { elapsed }) => {
                trace!(
                    "Gave up on {:?} after {:.2} s",
                    pattern.as_str(),
                    elapsed.as_secs_f64()
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let line = line.trim_end().to_string();

        match pattern.classify(&line) {
            LineClass::Match(groups) => {
                return Ok(Some(WaitMatch {
                    lines,
                    line,
                    groups,
                }));
            }
            LineClass::Noise => trace!("Dropped chatter: {}", line),
            LineClass::Data => lines.push(line),
        }
    }

    Ok(None)
}
