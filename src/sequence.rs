// Sequence player
//
// A sequence is an ordered list of named poses stored as JSON. Each step is
// sent with one synchronized move, then the player waits for the step's pause.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::motor::model::ModelType;
use crate::motor::request::{MotorKey, MoveRequest, Units};
use crate::motor::robot::{Robot, RobotError};
use crate::motor::transport::Transport;

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("Failed to read sequence: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse sequence: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid sequence: {0}")]
    Invalid(String),

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: RobotError,
    },
}

/// Per-step timing: one value for every target or one per motor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timing {
    All(u32),
    PerMotor(BTreeMap<MotorKey, u32>),
}

impl Timing {
    fn expand(&self, targets: &BTreeMap<MotorKey, f64>) -> Vec<(MotorKey, u32)> {
        match self {
            Timing::All(value) => targets.keys().map(|k| (k.clone(), *value)).collect(),
            Timing::PerMotor(map) => map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub targets: BTreeMap<MotorKey, f64>,
    /// Move duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Timing>,
    /// Explicit profile velocity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<Timing>,
    /// Wait after the move completes
    #[serde(default)]
    pub pause_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Servo model the native values were authored for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<u16>,
    #[serde(default)]
    pub units: Units,
    pub steps: Vec<Step>,
}

impl Sequence {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SequenceError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, SequenceError> {
        let sequence: Sequence = serde_json::from_str(text)?;
        sequence.validate()?;
        Ok(sequence)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SequenceError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    fn source_model(&self) -> Result<Option<ModelType>, SequenceError> {
        match (self.units, self.model) {
            (Units::Degrees, _) => Ok(None),
            (Units::Native, None) => Err(SequenceError::Invalid(
                "native units need a model type".to_string(),
            )),
            (Units::Native, Some(code)) => ModelType::from_code(code)
                .map(Some)
                .ok_or_else(|| SequenceError::Invalid(format!("unsupported model type {}", code))),
        }
    }

    fn validate(&self) -> Result<(), SequenceError> {
        self.source_model()?;
        for step in &self.steps {
            if step.targets.is_empty() {
                return Err(SequenceError::Invalid(format!(
                    "step '{}' has no targets",
                    step.name
                )));
            }
        }
        Ok(())
    }

    /// Move request for a step, with targets converted to degrees
    pub fn request(&self, step: &Step) -> Result<MoveRequest, SequenceError> {
        let model = self.source_model()?;
        let mut request = MoveRequest::new();
        for (key, value) in &step.targets {
            let degrees = match model {
                Some(model) => model.native_to_degree(value.round() as i32),
                None => *value,
            };
            request = request.target(key.clone(), degrees);
        }
        if let Some(duration) = &step.duration {
            request.durations = duration.expand(&step.targets);
        }
        if let Some(velocity) = &step.velocity {
            request.velocities = velocity.expand(&step.targets);
        }
        Ok(request)
    }

    /// Log every step
    pub fn describe(&self) {
        info!(
            "Sequence with {} steps ({:?}, model {:?})",
            self.steps.len(),
            self.units,
            self.model
        );
        for (index, step) in self.steps.iter().enumerate() {
            info!(
                "Step {} '{}': targets {:?}, duration {:?}, velocity {:?}, pause {}ms",
                index, step.name, step.targets, step.duration, step.velocity, step.pause_ms
            );
        }
    }

    /// Play every step in file order
    pub fn play<T: Transport>(&self, robot: &mut Robot<T>) -> Result<(), SequenceError> {
        for step in &self.steps {
            info!("Playing step '{}'", step.name);
            let request = self.request(step)?;
            robot
                .move_sync(&request)
                .map_err(|source| SequenceError::Step {
                    step: step.name.clone(),
                    source,
                })?;
            if step.pause_ms > 0 {
                robot.pause(Duration::from_millis(step.pause_ms));
            }
        }
        info!("Sequence complete");
        Ok(())
    }
}
