//! Motion programs, variable monitoring and motor helpers

use super::Gpascii;
use crate::error::PmacError;
use crate::pmac::transport::ByteChannel;
use crate::types::{ProgramAction, ProgramOutcome};
use crate::utils::is_cancelled;
use log::{debug, error, info, warn};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Consecutive inactive polls required before a program counts as finished
const ACTIVE_WINDOW: usize = 3;

/// A monitored variable whose value moved between two samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableChange<'a> {
    pub name: &'a str,
    pub previous: &'a str,
    pub value: &'a str,
}

#[derive(Debug, Default)]
pub struct RunOptions<'a> {
    /// Variables sampled on every poll while the program runs
    pub variables: Vec<String>,
    /// Raised by the caller to abort the program
    pub cancel: Option<&'a AtomicBool>,
    /// Poll interval override, never below the session's floor
    pub poll_interval: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct MonitorOptions<'a> {
    pub cancel: Option<&'a AtomicBool>,
    /// Stop after this many samples, if set
    pub max_samples: Option<usize>,
    pub interval: Option<Duration>,
}

enum RunState {
    Starting,
    Polling { window: VecDeque<bool>, last_active: bool },
    Aborting { active: bool },
    Finished,
}

impl<C: ByteChannel> Gpascii<C> {
    /// Select, start or abort a motion program in one or more coordinate systems
    ///
    /// Produces commands such as `&1,2begin5.10r`.
    pub fn program(
        &mut self,
        coords: &[u32],
        program: u32,
        action: ProgramAction,
        line_label: Option<u32>,
    ) -> Result<(), PmacError> {
        if coords.is_empty() {
            return Err(PmacError::InvalidCommand(
                "No coordinate system given for program".to_string(),
            ));
        }

        let coords = coords
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut command = format!("&{coords}begin{program}");
        if let Some(label) = line_label {
            command.push_str(&format!(".{label}"));
        }
        match action {
            ProgramAction::Select => {}
            ProgramAction::Run => command.push('r'),
            ProgramAction::Abort => command.push_str("abort"),
        }

        self.send_line_sync(&command)?;
        Ok(())
    }

    /// Run a motion program and wait for it to finish
    ///
    /// Polls `Coord[n].ProgActive` until it reads inactive three times in a
    /// row, sampling `options.variables` on every poll and passing each change
    /// to `on_change`. Raising `options.cancel` aborts the program (if it is
    /// still active) and returns `PmacError::Interrupted`.
    pub fn run_and_wait<F>(
        &mut self,
        coord: u32,
        program: u32,
        options: &RunOptions<'_>,
        mut on_change: F,
    ) -> Result<ProgramOutcome, PmacError>
    where
        F: FnMut(&VariableChange<'_>),
    {
        let active_var = format!("Coord[{coord}].ProgActive");
        let interval = options
            .poll_interval
            .unwrap_or_else(|| self.session.poll_interval())
            .max(self.session.poll_interval());
        let mut last_values: Vec<String> = Vec::new();

        let mut state = RunState::Starting;
        loop {
            state = match state {
                RunState::Starting => {
                    self.program(&[coord], program, ProgramAction::Run, None)?;
                    info!("Coord {} program {} started", coord, program);
                    last_values = self.get_variables(&options.variables)?;
                    RunState::Polling {
                        window: VecDeque::from([true; ACTIVE_WINDOW]),
                        last_active: true,
                    }
                }
                RunState::Polling {
                    mut window,
                    last_active,
                } => {
                    if is_cancelled(options.cancel) {
                        RunState::Aborting {
                            active: last_active,
                        }
                    } else {
                        let active = self.get_variable::<i64>(&active_var)? != 0;
                        window.pop_front();
                        window.push_back(active);

                        if !options.variables.is_empty() {
                            let values = self.get_variables(&options.variables)?;
                            report_changes(&options.variables, &last_values, &values, &mut on_change);
                            last_values = values;
                        }

                        if window.iter().any(|a| *a) {
                            self.clock().sleep(interval);
                            RunState::Polling {
                                window,
                                last_active: active,
                            }
                        } else {
                            RunState::Finished
                        }
                    }
                }
                RunState::Aborting { active } => {
                    if active {
                        warn!("Aborting coord {} program {}", coord, program);
                        self.program(&[coord], program, ProgramAction::Abort, None)?;
                    }
                    return Err(PmacError::Interrupted);
                }
                RunState::Finished => break,
            };
        }

        let error_status: i64 = self.get_variable(&format!("Coord[{coord}].ErrorStatus"))?;
        let description = self.coord_error_description(error_status).map(str::to_string);
        match &description {
            Some(text) if error_status != 0 => error!("Coord {} error: {}", coord, text),
            None if error_status != 0 => warn!("Coord {} error status {}", coord, error_status),
            _ => debug!("Coord {} program {} done", coord, program),
        }

        Ok(ProgramOutcome {
            error_status,
            description,
        })
    }

    /// Sample `names` until cancelled, reporting each change
    ///
    /// Returns the set of variables that changed at least once. Read failures
    /// are reported in place of the value (see [`Gpascii::get_variables`]).
    pub fn monitor_variables<S, F>(
        &mut self,
        names: &[S],
        options: &MonitorOptions<'_>,
        mut on_change: F,
    ) -> Result<BTreeSet<String>, PmacError>
    where
        S: AsRef<str>,
        F: FnMut(&VariableChange<'_>),
    {
        let interval = options
            .interval
            .unwrap_or_else(|| self.session.poll_interval());
        let names: Vec<String> = names.iter().map(|n| n.as_ref().to_string()).collect();
        let mut changed = BTreeSet::new();
        let mut last_values = self.get_variables(&names)?;
        let mut samples = 1;

        while !is_cancelled(options.cancel)
            && options.max_samples.is_none_or(|max| samples < max)
        {
            self.clock().sleep(interval);
            let values = self.get_variables(&names)?;
            report_changes(&names, &last_values, &values, &mut |change: &VariableChange<'_>| {
                changed.insert(change.name.to_string());
                on_change(change);
            });
            last_values = values;
            samples += 1;
        }

        Ok(changed)
    }

    /// Jog a motor to an absolute position, or by a relative distance
    pub fn jog(&mut self, motor: u32, position: f64, relative: bool) -> Result<(), PmacError> {
        let op = if relative { '^' } else { '=' };
        self.send_line_sync(&format!("#{motor}jog{op}{position:.8}"))?;
        Ok(())
    }

    /// Stop a motor where it is
    pub fn hold_position(&mut self, motor: u32) -> Result<(), PmacError> {
        self.send_line_sync(&format!("#{motor}jog/"))?;
        Ok(())
    }

    pub fn servo_control(&mut self, motor: u32) -> Result<bool, PmacError> {
        Ok(self.get_variable::<i64>(&format!("Motor[{motor}].ServoCtrl"))? == 1)
    }

    /// Enable or disable servo control, returning the state read back
    pub fn set_servo_control(&mut self, motor: u32, enabled: bool) -> Result<bool, PmacError> {
        self.set_variable(
            &format!("Motor[{motor}].ServoCtrl"),
            u8::from(enabled),
            false,
        )?;
        self.servo_control(motor)
    }

    /// Run `f`, then write back the value `name` had before
    pub fn with_saved_variable<T, F>(&mut self, name: &str, f: F) -> Result<T, PmacError>
    where
        F: FnOnce(&mut Self) -> Result<T, PmacError>,
    {
        let saved = self.get_variable_raw(name)?;
        let result = f(self);
        let restored = self.set_variable(name, &saved, false);
        finish_restore(result, restored.map(|_| ()), name)
    }

    /// Run `f` with the system write-protect key unlocked
    pub fn with_write_protect_unlocked<T, F>(&mut self, f: F) -> Result<T, PmacError>
    where
        F: FnOnce(&mut Self) -> Result<T, PmacError>,
    {
        let key: u64 = self.get_variable("Sys.WpKey")?;
        self.set_variable("Sys.WpKey", "$AAAAAAAA", false)?;
        let result = f(self);
        let restored = self.set_variable("Sys.WpKey", format!("${key:X}"), false);
        finish_restore(result, restored.map(|_| ()), "Sys.WpKey")
    }
}

fn report_changes<F>(names: &[String], previous: &[String], current: &[String], on_change: &mut F)
where
    F: FnMut(&VariableChange<'_>),
{
    for ((name, old), new) in names.iter().zip(previous).zip(current) {
        if old != new {
            debug!("{} = {}", name, new);
            on_change(&VariableChange {
                name,
                previous: old,
                value: new,
            });
        }
    }
}

fn finish_restore<T>(
    result: Result<T, PmacError>,
    restored: Result<(), PmacError>,
    name: &str,
) -> Result<T, PmacError> {
    match (result, restored) {
        (Err(e), Err(restore_err)) => {
            warn!("Restoring {} failed: {}", name, restore_err);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(restore_err)) => Err(restore_err),
        (Ok(value), Ok(())) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::open_sim;
    use super::*;
    use crate::testing::SimulatedPmac;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_program_command_forms() {
        let sim = SimulatedPmac::new();
        let (mut gpascii, handle) = open_sim(&sim);

        gpascii.program(&[1, 2], 5, ProgramAction::Run, Some(10)).unwrap();
        gpascii.program(&[3], 7, ProgramAction::Abort, None).unwrap();
        gpascii.program(&[1], 2, ProgramAction::Select, None).unwrap();
        assert_eq!(handle.sent(), vec!["&1,2begin5.10r", "&3begin7abort", "&1begin2"]);

        assert!(matches!(
            gpascii.program(&[], 1, ProgramAction::Run, None),
            Err(PmacError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_run_and_wait_needs_three_inactive_polls() {
        let sim = SimulatedPmac::new();
        sim.set("Coord[1].ErrorStatus", "0");
        sim.state.lock().active_polls = 2;
        let (mut gpascii, handle) = open_sim(&sim);

        let outcome = gpascii
            .run_and_wait(1, 4, &RunOptions::default(), |_| {})
            .unwrap();

        assert!(outcome.is_ok());
        assert_eq!(outcome.description.as_deref(), Some("no error"));
        let polls = handle
            .sent()
            .iter()
            .filter(|l| *l == "coord[1].progactive")
            .count();
        assert_eq!(polls, 5);
        assert_eq!(sim.state.lock().started_programs, vec!["&1begin4r"]);
    }

    #[test]
    fn test_run_and_wait_reports_changes() {
        let sim = SimulatedPmac::new();
        sim.set("Coord[2].ErrorStatus", "7");
        sim.set("Motor[1].ActPos", "0");
        {
            let mut state = sim.state.lock();
            state.active_polls = 2;
            state.counter = Some("motor[1].actpos".to_string());
        }
        let (mut gpascii, _handle) = open_sim(&sim);
        gpascii.register_coord_error(7, "soft limit");

        let options = RunOptions {
            variables: vec!["Motor[1].ActPos".to_string()],
            ..Default::default()
        };
        let mut changes = Vec::new();
        let outcome = gpascii
            .run_and_wait(2, 1, &options, |change| {
                changes.push((change.previous.to_string(), change.value.to_string()));
            })
            .unwrap();

        assert_eq!(outcome.error_status, 7);
        assert_eq!(outcome.description.as_deref(), Some("soft limit"));
        assert_eq!(changes.len(), 5);
        assert_eq!(changes[0], ("1".to_string(), "2".to_string()));
    }

    #[test]
    fn test_run_and_wait_unknown_status_passes_through() {
        let sim = SimulatedPmac::new();
        sim.set("Coord[1].ErrorStatus", "42");
        let (mut gpascii, _handle) = open_sim(&sim);

        let outcome = gpascii
            .run_and_wait(1, 1, &RunOptions::default(), |_| {})
            .unwrap();
        assert_eq!(outcome.error_status, 42);
        assert_eq!(outcome.description, None);
    }

    #[test]
    fn test_run_and_wait_cancel_aborts_active_program() {
        let sim = SimulatedPmac::new();
        sim.set("Motor[1].ActPos", "0");
        {
            let mut state = sim.state.lock();
            state.active_polls = 100;
            state.counter = Some("motor[1].actpos".to_string());
        }
        let (mut gpascii, _handle) = open_sim(&sim);

        let cancel = AtomicBool::new(false);
        let options = RunOptions {
            variables: vec!["Motor[1].ActPos".to_string()],
            cancel: Some(&cancel),
            ..Default::default()
        };

        let result = gpascii.run_and_wait(1, 3, &options, |change| {
            if change.value == "3" {
                cancel.store(true, Ordering::SeqCst);
            }
        });

        assert!(matches!(result, Err(PmacError::Interrupted)));
        assert_eq!(
            sim.state.lock().started_programs,
            vec!["&1begin3r", "&1begin3abort"]
        );
    }

    #[test]
    fn test_monitor_variables_collects_changed_set() {
        let sim = SimulatedPmac::new();
        sim.set("Motor[1].ActPos", "0");
        sim.set("P1", "5");
        sim.state.lock().counter = Some("motor[1].actpos".to_string());
        let (mut gpascii, _handle) = open_sim(&sim);

        let options = MonitorOptions {
            max_samples: Some(4),
            ..Default::default()
        };
        let mut reported = 0;
        let changed = gpascii
            .monitor_variables(&["Motor[1].ActPos", "P1"], &options, |_| reported += 1)
            .unwrap();

        assert_eq!(reported, 3);
        assert_eq!(changed, BTreeSet::from(["Motor[1].ActPos".to_string()]));
    }

    #[test]
    fn test_motion_helpers() {
        let sim = SimulatedPmac::new();
        sim.set("Motor[2].ServoCtrl", "0");
        let (mut gpascii, handle) = open_sim(&sim);

        gpascii.jog(2, 1.5, false).unwrap();
        gpascii.jog(2, -0.25, true).unwrap();
        gpascii.hold_position(2).unwrap();
        assert_eq!(
            handle.sent(),
            vec!["#2jog=1.50000000", "#2jog^-0.25000000", "#2jog/"]
        );

        assert!(!gpascii.servo_control(2).unwrap());
        assert!(gpascii.set_servo_control(2, true).unwrap());
        assert!(!gpascii.set_servo_control(2, false).unwrap());
    }

    #[test]
    fn test_saved_variable_restored_after_failure() {
        let sim = SimulatedPmac::new();
        sim.set("Motor[1].JogSpeed", "10");
        let (mut gpascii, _handle) = open_sim(&sim);

        let result: Result<(), PmacError> = gpascii.with_saved_variable("Motor[1].JogSpeed", |gp| {
            gp.set_variable("Motor[1].JogSpeed", 99, false)?;
            Err(PmacError::Interrupted)
        });

        assert!(matches!(result, Err(PmacError::Interrupted)));
        assert_eq!(sim.get("Motor[1].JogSpeed").as_deref(), Some("10"));
    }

    #[test]
    fn test_write_protect_unlocked_and_restored() {
        let sim = SimulatedPmac::new();
        sim.set("Sys.WpKey", "$0");
        let (mut gpascii, _handle) = open_sim(&sim);

        let inside = gpascii
            .with_write_protect_unlocked(|gp| gp.get_variable_raw("Sys.WpKey"))
            .unwrap();

        assert_eq!(inside, "$AAAAAAAA");
        assert_eq!(sim.get("Sys.WpKey").as_deref(), Some("$0"));
    }
}
