//! Coordinate system queries and reassignment

use super::Gpascii;
use crate::error::PmacError;
use crate::pmac::transport::{ByteChannel, ReadTimeout};
use crate::pmac::wait::is_error_line;
use crate::types::{CoordMap, CoordOptions, MotorAssignment, Undefine};
use log::{debug, info, warn};
use std::collections::BTreeMap;

// <- &2#1->x
// <- #3->0
pub(super) const COORD_REPLY: &str = r"(&(\d+))?#(\d+)->([a-zA-Z0-9]+)";

impl<C: ByteChannel> Gpascii<C> {
    /// Which coordinate system and axis `motor` is bound to
    pub fn get_coord(&mut self, motor: u32) -> Result<MotorAssignment, PmacError> {
        self.send_line(&format!("&0#{motor}->"))?;

        let timeout = ReadTimeout::Bounded(self.session.wait_timeout());
        let started = self.clock().now();
        for item in self.transport.read_lines(timeout) {
            let line = item?;
            if is_error_line(&line) {
                return Err(PmacError::Interpreter(line));
            }

            let Some(caps) = self.coord_reply.captures(&line) else {
                continue;
            };
            if caps[3].parse::<u32>().ok() != Some(motor) {
                continue;
            }

            let coord = match caps.get(2) {
                Some(c) => c
                    .as_str()
                    .parse()
                    .map_err(|_| PmacError::Parse(format!("Bad coordinate system in {line:?}")))?,
                None => 0,
            };
            let axis = match &caps[4] {
                "0" => None,
                axis => Some(axis.to_string()),
            };
            return Ok(MotorAssignment { coord, axis });
        }

        Err(PmacError::Timeout {
            elapsed: self.clock().now().duration_since(started),
        })
    }

    /// Current coordinate system setup for every motor up to `Sys.MaxMotors`
    pub fn get_coords(&mut self) -> Result<CoordMap, PmacError> {
        let max_motors: u32 = self.get_variable("Sys.MaxMotors")?;
        let mut coords = CoordMap::new();

        for motor in 0..max_motors {
            let assignment = self.get_coord(motor)?;
            if let Some(axis) = assignment.axis {
                coords.assign(assignment.coord, motor, &axis);
            }
        }

        Ok(coords)
    }

    /// Motor → coordinate system, for bound motors only
    pub fn get_motor_coords(&mut self) -> Result<BTreeMap<u32, u32>, PmacError> {
        Ok(self.get_coords()?.motor_coords())
    }

    /// Apply a coordinate system setup
    ///
    /// Aborts programs in every coordinate system in `coords`, optionally
    /// undefines existing systems, unbinds motors that are claimed by a
    /// different coordinate system, then binds each motor. With
    /// `options.verify`, the setup is read back and compared per coordinate
    /// system. A failure part-way leaves the bindings applied so far in place;
    /// take a [`CoordinateSnapshot`](super::CoordinateSnapshot) first when a
    /// rollback is needed.
    pub fn set_coords(&mut self, coords: &CoordMap, options: CoordOptions) -> Result<(), PmacError> {
        let Some(max_coord) = coords.max_coord() else {
            return Ok(());
        };
        coords.validate()?;

        let max_coords: u32 = self.get_variable("Sys.MaxCoords")?;
        if max_coord >= max_coords {
            info!("Increasing Sys.MaxCoords to {}", max_coord + 1);
            self.set_variable("Sys.MaxCoords", max_coord + 1, false)?;
        }

        for coord in coords.coords() {
            self.send_line_sync(&format!("&{coord}abort"))?;
        }

        match options.undefine {
            Undefine::None => {}
            Undefine::Touched => {
                for coord in coords.coords() {
                    self.send_line_sync(&format!("&{coord}undefine"))?;
                }
            }
            Undefine::All => {
                self.send_line_sync("undefine all")?;
            }
        }

        let current = self.get_motor_coords()?;
        for (coord, motor, _) in coords.assignments() {
            match current.get(&motor) {
                Some(&bound) if bound != coord => {
                    debug!("Unbinding motor {} from coordinate system {}", motor, bound);
                    self.send_line_sync(&format!("&{bound}#{motor}->0"))?;
                }
                _ => {}
            }
        }

        for (coord, motor, axis) in coords.assignments() {
            debug!("Coordinate system {}: motor {} is {}", coord, motor, axis);
            self.send_line_sync(&format!("&{coord}#{motor}->{axis}"))
                .map_err(|e| {
                    PmacError::Interpreter(format!(
                        "Failed to set coord[{coord}] motor {motor}: {e}"
                    ))
                })?;
        }

        if options.verify {
            let actual = self.get_coords()?;
            for coord in coords.coords() {
                let expected = coords.axis_set(coord);
                let found = actual.axis_set(coord);
                if expected != found {
                    warn!(
                        "Coordinate system {} mismatch: expected {:?}, got {:?}",
                        coord, expected, found
                    );
                    return Err(PmacError::Verification {
                        coord,
                        expected: expected.into_iter().collect(),
                        actual: found.into_iter().collect(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Run `f`, then restore the coordinate setup that was active before it
    ///
    /// The restore happens whether or not `f` succeeds. An error from `f`
    /// takes precedence over an error from the restore.
    pub fn with_saved_coords<T, F>(&mut self, f: F) -> Result<T, PmacError>
    where
        F: FnOnce(&mut Self) -> Result<T, PmacError>,
    {
        let snapshot = CoordinateSnapshot::capture(self)?;
        let result = f(self);
        let restored = snapshot.restore(self);

        match (result, restored) {
            (Err(e), Err(restore_err)) => {
                warn!("Coordinate restore failed: {}", restore_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(restore_err)) => Err(restore_err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}

/// Saved coordinate system setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinateSnapshot {
    coords: CoordMap,
}

impl CoordinateSnapshot {
    pub fn capture<C: ByteChannel>(gpascii: &mut Gpascii<C>) -> Result<Self, PmacError> {
        Ok(Self {
            coords: gpascii.get_coords()?,
        })
    }

    pub fn coords(&self) -> &CoordMap {
        &self.coords
    }

    /// Reapply the saved setup, clearing everything defined since
    pub fn restore<C: ByteChannel>(&self, gpascii: &mut Gpascii<C>) -> Result<(), PmacError> {
        if self.coords.is_empty() {
            gpascii.send_line_sync("undefine all")?;
            return Ok(());
        }
        gpascii.set_coords(
            &self.coords,
            CoordOptions {
                undefine: Undefine::All,
                verify: true,
            },
        )
    }
}
