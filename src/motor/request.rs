// Motor keys, selections and move requests accepted by the controller

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::robot::RobotError;

/// A motor named by bus ID or by configured alias
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MotorKey {
    Id(u8),
    Alias(String),
}

impl FromStr for MotorKey {
    type Err = std::convert::Infallible;

    /// Digits name an ID, anything else an alias
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().parse::<u8>() {
            Ok(id) => MotorKey::Id(id),
            Err(_) => MotorKey::Alias(s.trim().to_string()),
        })
    }
}

impl From<u8> for MotorKey {
    fn from(id: u8) -> Self {
        MotorKey::Id(id)
    }
}

impl From<&str> for MotorKey {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(key) => key,
            Err(never) => match never {},
        }
    }
}

impl From<String> for MotorKey {
    fn from(s: String) -> Self {
        MotorKey::from(s.as_str())
    }
}

impl fmt::Display for MotorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotorKey::Id(id) => write!(f, "{}", id),
            MotorKey::Alias(alias) => write!(f, "{}", alias),
        }
    }
}

impl Serialize for MotorKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MotorKey::Id(id) => serializer.serialize_u8(*id),
            MotorKey::Alias(alias) => serializer.serialize_str(alias),
        }
    }
}

struct MotorKeyVisitor;

impl Visitor<'_> for MotorKeyVisitor {
    type Value = MotorKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a motor ID (0-253) or alias")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<MotorKey, E> {
        u8::try_from(v)
            .map(MotorKey::Id)
            .map_err(|_| E::custom(format!("motor ID {} out of range", v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<MotorKey, E> {
        u8::try_from(v)
            .map(MotorKey::Id)
            .map_err(|_| E::custom(format!("motor ID {} out of range", v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<MotorKey, E> {
        Ok(MotorKey::from(v))
    }
}

impl<'de> Deserialize<'de> for MotorKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MotorKeyVisitor)
    }
}

/// Which motors a status or diagnostic call covers
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    All,
    Motors(Vec<MotorKey>),
}

impl Selection {
    /// Parse command-style arguments: either exactly `["all"]` or a list of keys
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self, RobotError> {
        if args.is_empty() {
            return Err(RobotError::InvalidSelection("no motors given".to_string()));
        }
        let has_all = args.iter().any(|a| a.as_ref() == "all");
        if has_all && args.len() != 1 {
            return Err(RobotError::InvalidSelection(
                "'all' cannot be combined with other motors".to_string(),
            ));
        }
        if has_all {
            return Ok(Selection::All);
        }
        Ok(Selection::Motors(
            args.iter().map(|a| MotorKey::from(a.as_ref())).collect(),
        ))
    }
}

/// Units of the target values in a move request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Units {
    #[default]
    Degrees,
    Native,
}

/// Targets plus optional per-motor timing for one move
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRequest {
    pub targets: Vec<(MotorKey, f64)>,
    /// Desired move duration in milliseconds
    pub durations: Vec<(MotorKey, u32)>,
    /// Explicit profile velocity in native units
    pub velocities: Vec<(MotorKey, u32)>,
    pub units: Units,
    /// Clamp targets into the configured angle limits
    pub check_range: bool,
}

impl Default for MoveRequest {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            durations: Vec::new(),
            velocities: Vec::new(),
            units: Units::Degrees,
            check_range: true,
        }
    }
}

impl MoveRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every target shares one duration
    pub fn pose<K: Into<MotorKey> + Clone>(targets: &[(K, f64)], duration_ms: u32) -> Self {
        targets
            .iter()
            .fold(Self::new(), |req, (key, value)| {
                req.target(key.clone(), *value)
                    .duration(key.clone(), duration_ms)
            })
    }

    pub fn target(mut self, key: impl Into<MotorKey>, value: f64) -> Self {
        self.targets.push((key.into(), value));
        self
    }

    pub fn duration(mut self, key: impl Into<MotorKey>, duration_ms: u32) -> Self {
        self.durations.push((key.into(), duration_ms));
        self
    }

    pub fn velocity(mut self, key: impl Into<MotorKey>, velocity: u32) -> Self {
        self.velocities.push((key.into(), velocity));
        self
    }

    pub fn units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    pub fn check_range(mut self, check: bool) -> Self {
        self.check_range = check;
        self
    }

    pub fn longest_duration(&self) -> Option<u32> {
        self.durations.iter().map(|(_, ms)| *ms).max()
    }
}
