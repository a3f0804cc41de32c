use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::PmacError;

/// Coordinate system setup: coordinate system id → (motor number → axis)
///
/// ```
/// use rusty_pmac::CoordMap;
///
/// // coordinate system 1: motor 11 is X
/// // coordinate system 2: motor 1 is X, motor 12 is Y
/// let coords = CoordMap::new()
///     .with(1, 11, "x")
///     .with(2, 1, "x")
///     .with(2, 12, "y");
///
/// assert_eq!(coords.coord_of(12), Some(2));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CoordMap(BTreeMap<u32, BTreeMap<u32, String>>);

impl CoordMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`CoordMap::assign`]
    pub fn with(mut self, coord: u32, motor: u32, axis: &str) -> Self {
        self.assign(coord, motor, axis);
        self
    }

    pub fn assign(&mut self, coord: u32, motor: u32, axis: &str) {
        self.0
            .entry(coord)
            .or_default()
            .insert(motor, axis.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn coords(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.keys().copied()
    }

    pub fn max_coord(&self) -> Option<u32> {
        self.0.keys().next_back().copied()
    }

    pub fn motors(&self, coord: u32) -> Option<&BTreeMap<u32, String>> {
        self.0.get(&coord)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &BTreeMap<u32, String>)> + '_ {
        self.0.iter().map(|(coord, motors)| (*coord, motors))
    }

    /// Every (coord, motor, axis) triple, ordered by coordinate system then motor
    pub fn assignments(&self) -> impl Iterator<Item = (u32, u32, &str)> + '_ {
        self.0.iter().flat_map(|(coord, motors)| {
            motors
                .iter()
                .map(move |(motor, axis)| (*coord, *motor, axis.as_str()))
        })
    }

    /// Coordinate system currently holding `motor`
    pub fn coord_of(&self, motor: u32) -> Option<u32> {
        self.assignments()
            .find(|(_, m, _)| *m == motor)
            .map(|(coord, _, _)| coord)
    }

    /// Motor → coordinate system lookup
    pub fn motor_coords(&self) -> BTreeMap<u32, u32> {
        self.assignments()
            .map(|(coord, motor, _)| (motor, coord))
            .collect()
    }

    /// Axis assignments of one coordinate system, normalised for comparison
    pub fn axis_set(&self, coord: u32) -> BTreeSet<(u32, String)> {
        self.0
            .get(&coord)
            .map(|motors| {
                motors
                    .iter()
                    .map(|(motor, axis)| (*motor, axis.to_lowercase()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Check that no motor is claimed by more than one coordinate system
    pub fn validate(&self) -> Result<(), PmacError> {
        let mut seen: BTreeMap<u32, u32> = BTreeMap::new();
        for (coord, motor, _) in self.assignments() {
            if let Some(other) = seen.insert(motor, coord) {
                return Err(PmacError::InvalidCommand(format!(
                    "Motor {motor} assigned to both coordinate systems {other} and {coord}"
                )));
            }
        }
        Ok(())
    }
}

impl From<BTreeMap<u32, BTreeMap<u32, String>>> for CoordMap {
    fn from(map: BTreeMap<u32, BTreeMap<u32, String>>) -> Self {
        CoordMap(map)
    }
}

impl<'a> FromIterator<(u32, u32, &'a str)> for CoordMap {
    fn from_iter<I: IntoIterator<Item = (u32, u32, &'a str)>>(iter: I) -> Self {
        let mut map = CoordMap::new();
        for (coord, motor, axis) in iter {
            map.assign(coord, motor, axis);
        }
        map
    }
}

/// Where a single motor is bound, as reported by `&0#n->`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotorAssignment {
    pub coord: u32,
    /// `None` when the controller answers `->0`
    pub axis: Option<String>,
}

/// How much of the existing setup to clear before applying a new coordinate map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Undefine {
    /// Keep existing definitions; only conflicting motors are unbound
    #[default]
    None,
    /// `&nundefine` for every coordinate system in the new map
    Touched,
    /// `undefine all`
    All,
}

/// Options for a coordinate-system transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordOptions {
    pub undefine: Undefine,
    /// Re-read the setup afterwards and compare per coordinate system
    pub verify: bool,
}

impl Default for CoordOptions {
    fn default() -> Self {
        Self {
            undefine: Undefine::None,
            verify: true,
        }
    }
}

/// Motion program control suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramAction {
    /// Point the coordinate systems at the program without running it
    Select,
    /// `r`
    Run,
    /// `abort`
    Abort,
}

/// Result of a completed motion program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramOutcome {
    /// Raw `Coord[n].ErrorStatus`
    pub error_status: i64,
    /// Description when the status is a known code
    pub description: Option<String>,
}

impl ProgramOutcome {
    pub fn is_ok(&self) -> bool {
        self.error_status == 0
    }
}
