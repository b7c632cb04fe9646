// Teach-and-replay demonstrations
//
// Records motor angles while the robot is moved by hand, and replays them by
// interpolating between samples against the controller clock.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::motor::request::{MotorKey, MoveRequest};
use crate::motor::robot::{Robot, RobotError};
use crate::motor::transport::Transport;

/// Profile acceleration and velocity used while replaying
pub const REPLAY_SPEED: (u32, u32) = (30, 300);

/// Duration given to every interpolated move
pub const REPLAY_STEP_MS: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum DemonstrationError {
    #[error("Failed to access demonstration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse demonstration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid demonstration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Robot(#[from] RobotError),
}

/// Time series of `[seconds, angle_1, angle_2, ...]` rows, one angle per motor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demonstration {
    pub motors: Vec<MotorKey>,
    pub samples: Vec<Vec<f64>>,
}

impl Demonstration {
    pub fn new(motors: Vec<MotorKey>, samples: Vec<Vec<f64>>) -> Result<Self, DemonstrationError> {
        let demonstration = Self { motors, samples };
        demonstration.validate()?;
        Ok(demonstration)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DemonstrationError> {
        let text = std::fs::read_to_string(path)?;
        let demonstration: Demonstration = serde_json::from_str(&text)?;
        demonstration.validate()?;
        Ok(demonstration)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DemonstrationError> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), DemonstrationError> {
        if self.motors.is_empty() {
            return Err(DemonstrationError::Invalid("no motors".to_string()));
        }
        if self.samples.is_empty() {
            return Err(DemonstrationError::Invalid("no samples".to_string()));
        }
        let columns = self.motors.len() + 1;
        for (index, row) in self.samples.iter().enumerate() {
            if row.len() != columns {
                return Err(DemonstrationError::Invalid(format!(
                    "sample {} has {} columns, expected {}",
                    index,
                    row.len(),
                    columns
                )));
            }
        }
        if self.samples.windows(2).any(|pair| pair[1][0] <= pair[0][0]) {
            return Err(DemonstrationError::Invalid(
                "timestamps must be strictly increasing".to_string(),
            ));
        }
        Ok(())
    }

    /// Timestamp of the last sample in seconds
    pub fn duration(&self) -> f64 {
        self.samples.last().map_or(0.0, |row| row[0])
    }

    /// Angles at `t` seconds, linear between samples and held at the ends
    pub fn interpolate(&self, t: f64) -> Vec<f64> {
        let (Some(first), Some(last)) = (self.samples.first(), self.samples.last()) else {
            return Vec::new();
        };
        if t <= first[0] {
            return first[1..].to_vec();
        }
        if t >= last[0] {
            return last[1..].to_vec();
        }

        // First sample strictly after t; the one before it is at or before t
        let upper = self.samples.partition_point(|row| row[0] <= t);
        let (a, b) = (&self.samples[upper - 1], &self.samples[upper]);
        let fraction = (t - a[0]) / (b[0] - a[0]);
        a[1..]
            .iter()
            .zip(&b[1..])
            .map(|(from, to)| from + (to - from) * fraction)
            .collect()
    }
}

/// Sample the angles of `motors` every `interval` for `duration`
pub fn record<T: Transport>(
    robot: &mut Robot<T>,
    motors: &[MotorKey],
    duration: Duration,
    interval: Duration,
) -> Result<Demonstration, DemonstrationError> {
    if interval.is_zero() {
        return Err(DemonstrationError::Invalid(
            "sample interval must be positive".to_string(),
        ));
    }

    info!("Recording demonstration for {:?}... Move the robot manually.", duration);
    let clock = robot.clock().clone();
    let start = clock.now();
    let mut samples = Vec::new();

    while clock.now().saturating_sub(start) < duration {
        let angles = robot.get_motor_angles(motors)?;
        let timestamp = clock.now().saturating_sub(start).as_secs_f64();
        let mut row = Vec::with_capacity(angles.len() + 1);
        row.push(timestamp);
        row.extend(angles);
        samples.push(row);
        clock.sleep(interval);
    }

    info!("Recorded {} samples", samples.len());
    Demonstration::new(motors.to_vec(), samples)
}

/// Drive the motors through the demonstration in real time
pub fn replay<T: Transport>(
    robot: &mut Robot<T>,
    demonstration: &Demonstration,
) -> Result<(), DemonstrationError> {
    robot.enable_torque()?;
    robot.set_speed(REPLAY_SPEED.0, REPLAY_SPEED.1)?;

    info!("Replaying demonstration with interpolation...");
    let clock = robot.clock().clone();
    let start = clock.now();
    let end = demonstration.duration();
    let mut moves = 0;

    loop {
        let now = clock.now().saturating_sub(start).as_secs_f64();
        if now > end {
            break;
        }
        let angles = demonstration.interpolate(now);
        let request = demonstration
            .motors
            .iter()
            .zip(angles)
            .fold(MoveRequest::new(), |req, (key, angle)| {
                req.target(key.clone(), angle)
                    .duration(key.clone(), REPLAY_STEP_MS)
            });
        robot.move_sync(&request)?;
        moves += 1;
    }

    debug!("Replay issued {} moves", moves);
    info!("Replay complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Demonstration {
        Demonstration::new(
            vec![MotorKey::Id(5), MotorKey::Id(6)],
            vec![
                vec![0.0, 60.0, 40.0],
                vec![0.5, 70.0, 45.0],
                vec![1.0, 60.0, 40.0],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_interpolate_between_samples() {
        assert_eq!(sample().interpolate(0.25), vec![65.0, 42.5]);
        assert_eq!(sample().interpolate(0.5), vec![70.0, 45.0]);
        assert_eq!(sample().interpolate(0.75), vec![65.0, 42.5]);
    }

    #[test]
    fn test_interpolate_holds_ends() {
        assert_eq!(sample().interpolate(-1.0), vec![60.0, 40.0]);
        assert_eq!(sample().interpolate(3.0), vec![60.0, 40.0]);
    }

    #[test]
    fn test_rejects_malformed() {
        let motors = vec![MotorKey::Id(5)];
        assert!(Demonstration::new(motors.clone(), vec![]).is_err());
        assert!(Demonstration::new(motors.clone(), vec![vec![0.0, 1.0, 2.0]]).is_err());
        assert!(
            Demonstration::new(motors, vec![vec![0.5, 1.0], vec![0.5, 2.0]]).is_err()
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.json");
        sample().save(&path).unwrap();
        assert_eq!(Demonstration::load(&path).unwrap(), sample());
    }
}
