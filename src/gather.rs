//! Gather staging on the controller
//!
//! A gather is configured by writing a settings file that the interpreter runs,
//! enabled, polled until the requested sample count is reached and then read
//! back, either through the fast gather server or the `gather` tool's text dump.

use crate::config::GatherPaths;
use crate::error::PmacError;
use crate::pmac::{Comm, Connector, FileTransfer};
use crate::utils::{PollError, poll_until};
use log::{debug, info, warn};
use ndarray::{Array2, s};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

pub const GATHER_SETTINGS_FILE: &str = "/var/ftp/gather/GatherSetting.txt";
pub const GATHER_OUTPUT_FILE: &str = "/var/ftp/gather/GatherFile.txt";
pub const MAX_SAMPLES: u64 = 0x7FFF_FFFF;

/// Servo cycle counter, used as the time base when gathered
pub const SERVO_COUNT_ADDRESS: &str = "Sys.ServoCount.a";

const SAMPLE_POLL: Duration = Duration::from_millis(100);

/// Samples needed to cover `duration` seconds
pub fn sample_count(servo_period: f64, gather_period: u32, duration: f64) -> u64 {
    (duration / (servo_period * gather_period as f64)) as u64
}

/// Seconds covered by `samples` samples
pub fn gather_duration(servo_period: f64, gather_period: u32, samples: u64) -> f64 {
    samples as f64 * servo_period * gather_period as f64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GatherLength {
    /// Seconds of data
    Duration(f64),
    Samples(u64),
}

#[derive(Debug, Clone)]
pub struct GatherConfig {
    pub addresses: Vec<String>,
    /// Servo cycles per sample
    pub period: u32,
    pub length: GatherLength,
    pub paths: GatherPaths,
}

impl GatherConfig {
    pub fn new<S: Into<String>>(
        addresses: impl IntoIterator<Item = S>,
        period: u32,
        duration: f64,
    ) -> Self {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            period,
            length: GatherLength::Duration(duration),
            paths: GatherPaths::default(),
        }
    }

    pub fn with_samples(mut self, samples: u64) -> Self {
        self.length = GatherLength::Samples(samples);
        self
    }

    pub fn with_paths(mut self, paths: GatherPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn validate(&self) -> Result<(), PmacError> {
        if self.addresses.is_empty() {
            return Err(PmacError::InvalidCommand(
                "gather needs at least one address".to_string(),
            ));
        }
        if self.period == 0 {
            return Err(PmacError::InvalidCommand(
                "gather period must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sample_count(&self, servo_period: f64) -> u64 {
        match self.length {
            GatherLength::Duration(duration) => sample_count(servo_period, self.period, duration),
            GatherLength::Samples(samples) => samples,
        }
        .min(MAX_SAMPLES)
    }

    pub fn duration(&self, servo_period: f64) -> f64 {
        match self.length {
            GatherLength::Duration(duration) => duration,
            GatherLength::Samples(samples) => gather_duration(servo_period, self.period, samples),
        }
    }

    /// Lines of the settings file run by the interpreter
    pub fn settings(&self, servo_period: f64) -> Vec<String> {
        let mut lines = vec!["gather.enable=0".to_string()];
        lines.extend(
            self.addresses
                .iter()
                .enumerate()
                .map(|(i, addr)| format!("gather.addr[{i}]={addr}")),
        );
        lines.push(format!("gather.items={}", self.addresses.len()));
        lines.push(format!("gather.Period={}", self.period));
        lines.push("gather.enable=1".to_string());
        lines.push("gather.enable=0".to_string());
        lines.push(format!("gather.MaxSamples={}", self.sample_count(servo_period)));
        lines
    }
}

/// A settings file read back from the controller
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GatherSettings {
    /// `gather.addr[i]` entries in index order
    pub addresses: Vec<String>,
    /// Other indexed entries, keyed by lowercase base name
    pub indexed: BTreeMap<String, BTreeMap<usize, String>>,
    /// Plain `gather.*` entries, keyed by lowercase name
    pub values: BTreeMap<String, String>,
}

impl GatherSettings {
    pub fn items(&self) -> Option<usize> {
        self.values.get("gather.items")?.parse().ok()
    }

    pub fn period(&self) -> Option<u32> {
        self.values.get("gather.period")?.parse().ok()
    }

    pub fn max_samples(&self) -> Option<u64> {
        self.values.get("gather.maxsamples")?.parse().ok()
    }
}

fn split_index(name: &str) -> Option<(&str, usize)> {
    let (base, rest) = name.split_once('[')?;
    let index = rest.strip_suffix(']')?.parse().ok()?;
    Some((base, index))
}

/// Read a settings file back into a [`GatherSettings`]
///
/// Lines that do not assign a `gather` variable are ignored. Later
/// assignments overwrite earlier ones.
pub fn parse_settings<S: AsRef<str>>(lines: &[S]) -> GatherSettings {
    let mut settings = GatherSettings::default();
    let mut addresses = BTreeMap::new();

    for line in lines {
        let line = line.as_ref().trim();
        let Some((name, value)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim().to_lowercase();
        if !name.starts_with("gather") {
            continue;
        }
        let value = value.trim().to_string();

        match split_index(&name) {
            Some(("gather.addr", index)) => {
                addresses.insert(index, value);
            }
            Some((base, index)) => {
                settings
                    .indexed
                    .entry(base.to_string())
                    .or_default()
                    .insert(index, value);
            }
            None => {
                settings.values.insert(name, value);
            }
        }
    }

    settings.addresses = addresses.into_values().collect();
    settings
}

/// Parse the `gather -u` text dump
///
/// Rows are single-space separated. Rows whose width differs from the
/// address count are dropped silently, rows with unparseable fields with a
/// warning.
pub fn parse_gather_text<S: AsRef<str>>(columns: usize, lines: &[S]) -> Array2<f64> {
    let mut values = Vec::new();
    let mut rows = 0;

    for line in lines {
        let line = line.as_ref().trim();
        if columns == 0 || line.matches(' ').count() != columns - 1 {
            continue;
        }

        match line
            .split(' ')
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(row) => {
                values.extend(row);
                rows += 1;
            }
            Err(e) => warn!("Skipping gather row {:?}: {}", line, e),
        }
    }

    Array2::from_shape_vec((rows, columns), values)
        .unwrap_or_else(|_| Array2::zeros((0, columns)))
}

/// Replace the servo counter column with sample times in seconds
///
/// If the counter column contains a zero the buffer wrapped: rows from the
/// first zero on are dropped and times are taken from the row index.
pub fn apply_time_base<S: AsRef<str>>(
    addresses: &[S],
    rows: Array2<f64>,
    servo_period: f64,
    gather_period: u32,
) -> Array2<f64> {
    let Some(idx) = addresses
        .iter()
        .position(|addr| addr.as_ref().eq_ignore_ascii_case(SERVO_COUNT_ADDRESS))
    else {
        return rows;
    };
    if idx >= rows.ncols() {
        return rows;
    }

    let sample_time = servo_period * gather_period as f64;
    let first_zero = rows.column(idx).iter().position(|&count| count == 0.0);

    let mut rows = match first_zero {
        Some(end) => {
            warn!(
                "Servo counter is zero at row {} of {}, truncating gather data",
                end,
                rows.nrows()
            );
            let mut rows = rows.slice(s![..end, ..]).to_owned();
            for (i, t) in rows.column_mut(idx).iter_mut().enumerate() {
                *t = i as f64;
            }
            rows
        }
        None => rows,
    };

    rows.column_mut(idx).mapv_inplace(|count| count * sample_time);
    rows
}

/// Write gathered rows as delimited text with an address header line
pub fn write_delimited<S: AsRef<str>>(
    out: &mut dyn Write,
    addresses: &[S],
    rows: &Array2<f64>,
    delimiter: &str,
) -> std::io::Result<()> {
    let header: Vec<&str> = addresses.iter().map(AsRef::as_ref).collect();
    writeln!(out, "{}", header.join(delimiter))?;
    for row in rows.rows() {
        let fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(out, "{}", fields.join(delimiter))?;
    }
    Ok(())
}

/// Result of [`gather`]
#[derive(Debug, Clone)]
pub struct GatherOutcome {
    pub addresses: Vec<String>,
    /// One row per sample, one column per address
    pub rows: Array2<f64>,
    pub servo_period: f64,
    /// Sample count after clamping to the controller's buffer
    pub samples: u64,
}

/// Run a gather and return its data
///
/// Raising `cancel` while waiting for samples stops the gather on the
/// controller and returns [`PmacError::Interrupted`].
pub fn gather<K: Connector + FileTransfer>(
    comm: &mut Comm<K>,
    config: &GatherConfig,
    cancel: Option<&AtomicBool>,
) -> Result<GatherOutcome, PmacError> {
    config.validate()?;

    let shared = comm.gpascii();
    let servo_period = shared.lock().servo_period()?;
    let mut total = config.sample_count(servo_period);

    let settings = config.settings(servo_period).join("\n");
    comm.write_file(&config.paths.settings_file, &settings)?;
    info!(
        "Gathering {} addresses for {:.3} s ({} samples)",
        config.addresses.len(),
        config.duration(servo_period),
        total
    );
    comm.gpascii_file(&config.paths.settings_file)?;

    {
        let mut gp = shared.lock();
        let max_lines: u64 = gp.get_variable("gather.maxlines")?;
        if max_lines < total {
            total = max_lines;
            warn!(
                "Gather buffer holds {} lines, shortening gather to {:.3} s",
                max_lines,
                gather_duration(servo_period, config.period, total)
            );
            gp.set_variable("gather.maxsamples", total, false)?;
        }

        gp.set_variable("gather.enable", 2, false)?;

        let clock = gp.clock().clone();
        let polled = poll_until(
            clock.as_ref(),
            cancel,
            || {
                let samples: u64 = gp.get_variable("gather.samples")?;
                debug!("Gathered {}/{} samples", samples, total);
                Ok::<_, PmacError>(samples >= total)
            },
            None,
            SAMPLE_POLL,
        );

        match polled {
            Ok(()) => {}
            Err(PollError::Cancelled) => {
                info!("Gather interrupted, disabling");
                gp.set_variable("gather.enable", 0, false)?;
                return Err(PmacError::Interrupted);
            }
            Err(PollError::Timeout) => return Err(PmacError::Timeout { elapsed: Duration::ZERO }),
            Err(PollError::ConditionError(e)) => {
                if let Err(disable) = gp.set_variable("gather.enable", 0, false) {
                    warn!("Failed to disable gather: {}", disable);
                }
                return Err(e);
            }
        }

        gp.set_variable("gather.enable", 0, false)?;
    }

    let rows = fetch_rows(comm, config)?;
    let rows = apply_time_base(&config.addresses, rows, servo_period, config.period);
    info!("Gathered {} rows", rows.nrows());

    Ok(GatherOutcome {
        addresses: config.addresses.clone(),
        rows,
        servo_period,
        samples: total,
    })
}

fn fetch_rows<K: Connector + FileTransfer>(
    comm: &mut Comm<K>,
    config: &GatherConfig,
) -> Result<Array2<f64>, PmacError> {
    if let Some(client) = comm.fast_gather() {
        return client.get_rows();
    }

    let output = &config.paths.output_file;
    comm.shell_command(&format!("gather {output} -u"))?;
    let lines = comm.read_file(output)?;
    Ok(parse_gather_text(config.addresses.len(), &lines))
}
