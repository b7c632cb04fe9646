// Robot configuration: bus settings, motion defaults and motor definitions
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::model::ModelType;

// Configuration used when none is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "config/robot_330_lab.json";

// HTTP trigger bind address
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:5002";

// Interval between moving-flag polls in blocking mode
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

// Shortest move duration accepted when deriving profile velocities
pub const MIN_MOVE_DURATION_MS: u32 = 50;

// Wait after a non-blocking move with no duration
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(50);

// Attempts for grouped reads that are retried
pub const READ_ATTEMPTS: u32 = 3;

const SUPPORTED_PROTOCOL: f32 = 2.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Full robot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotConfig {
    pub controllers: ControllerConfig,
    pub motors: BTreeMap<String, MotorConfig>,
}

/// Bus connection and controller behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub port: String,
    pub protocol: f32,
    pub baudrate: u32,
    /// Wait for motion to finish before a move call returns
    pub blocking: bool,
    /// Drive mode register value (bit 0x04 selects time-based profiles)
    #[serde(default)]
    pub drivemode: u8,
    /// Longest a blocking move may take before it is reported as stalled
    #[serde(default = "default_move_timeout_ms")]
    pub move_timeout_ms: u64,
    #[serde(default)]
    pub motion: MotionDefaults,
}

fn default_move_timeout_ms() -> u64 {
    10_000
}

/// Motion parameters written to every motor at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionDefaults {
    // X-series profile registers
    pub acceleration: u32,
    pub velocity: u32,
    pub moving_threshold: u32,
    // XL-320 registers
    pub moving_speed: u32,
    pub torque_limit: u32,
    pub p_gain: u32,
}

impl Default for MotionDefaults {
    fn default() -> Self {
        Self {
            acceleration: 100,
            velocity: 200,
            moving_threshold: 1,
            moving_speed: 100,
            torque_limit: 512,
            p_gain: 32,
        }
    }
}

/// One motor on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotorConfig {
    pub id: u8,
    /// Model number, as reported by ping
    #[serde(rename = "type")]
    pub model: u16,
    /// [lower, upper] in degrees
    pub angle_limit: [f64; 2],
}

impl RobotConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn move_timeout(&self) -> Duration {
        Duration::from_millis(self.controllers.move_timeout_ms)
    }

    /// Motors ordered by bus ID
    pub fn motors_by_id(&self) -> Vec<(&str, &MotorConfig)> {
        let mut motors: Vec<(&str, &MotorConfig)> = self
            .motors
            .iter()
            .map(|(alias, motor)| (alias.as_str(), motor))
            .collect();
        motors.sort_by_key(|(_, motor)| motor.id);
        motors
    }

    /// Check the configuration and return the single model type it uses
    pub fn validate(&self) -> Result<ModelType, ConfigError> {
        if self.controllers.protocol != SUPPORTED_PROTOCOL {
            return Err(ConfigError::Invalid(format!(
                "Unsupported protocol version {}",
                self.controllers.protocol
            )));
        }

        if self.motors.is_empty() {
            return Err(ConfigError::Invalid("No motors configured".to_string()));
        }

        let codes: HashSet<u16> = self.motors.values().map(|m| m.model).collect();
        if codes.len() > 1 {
            let mut codes: Vec<u16> = codes.into_iter().collect();
            codes.sort_unstable();
            return Err(ConfigError::Invalid(format!(
                "Cannot combine motors of different types: {:?}",
                codes
            )));
        }
        let code = self.motors.values().map(|m| m.model).next().unwrap_or_default();
        let model = ModelType::from_code(code).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "Unsupported model type {} (expected XL-320, XL-330 or XC-330)",
                code
            ))
        })?;

        let mut ids = HashSet::new();
        let (deg_lo, deg_hi) = model.degree_range();
        for (alias, motor) in &self.motors {
            if alias == "all" || alias.parse::<u8>().is_ok() {
                return Err(ConfigError::Invalid(format!(
                    "Motor alias '{}' is reserved or numeric",
                    alias
                )));
            }
            if !ids.insert(motor.id) {
                return Err(ConfigError::Invalid(format!("Duplicate motor ID {}", motor.id)));
            }
            let [lower, upper] = motor.angle_limit;
            if lower > upper {
                return Err(ConfigError::Invalid(format!(
                    "Motor '{}' has inverted angle limit [{}, {}]",
                    alias, lower, upper
                )));
            }
            if lower < deg_lo || upper > deg_hi {
                return Err(ConfigError::Invalid(format!(
                    "Motor '{}' angle limit [{}, {}] outside {} range [{}, {}]",
                    alias,
                    lower,
                    upper,
                    model.name(),
                    deg_lo,
                    deg_hi
                )));
            }
        }

        Ok(model)
    }
}
