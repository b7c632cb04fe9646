// Emotion gestures for the six-motor lab robot
//
// Each gesture is a hand-tuned series of poses on motors 1-6 (neck pitch, left
// and right head roll, head yaw, shoulder, arm). Angles are in degrees and
// durations in milliseconds.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::motor::request::{MoveRequest, Selection};
use crate::motor::robot::{Robot, RobotError};
use crate::motor::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown emotion: {0}")]
pub struct UnknownEmotion(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Emotion {
    Happiness,
    Sadness,
    Anger,
    Attention,
    Gratitude,
    Calming,
}

impl Emotion {
    pub const ALL: [Emotion; 6] = [
        Emotion::Happiness,
        Emotion::Sadness,
        Emotion::Anger,
        Emotion::Attention,
        Emotion::Gratitude,
        Emotion::Calming,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Emotion::Happiness => "happiness",
            Emotion::Sadness => "sadness",
            Emotion::Anger => "anger",
            Emotion::Attention => "attention",
            Emotion::Gratitude => "gratitude",
            Emotion::Calming => "calming",
        }
    }

    pub fn choreography(self) -> Choreography {
        match self {
            Emotion::Happiness => happiness(),
            Emotion::Sadness => sadness(),
            Emotion::Anger => anger(),
            Emotion::Attention => attention(),
            Emotion::Gratitude => gratitude(),
            Emotion::Calming => calming(),
        }
    }
}

impl FromStr for Emotion {
    type Err = UnknownEmotion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "happiness" => Ok(Emotion::Happiness),
            "sadness" => Ok(Emotion::Sadness),
            "anger" | "angry" => Ok(Emotion::Anger),
            "attention" => Ok(Emotion::Attention),
            "gratitude" => Ok(Emotion::Gratitude),
            "calming" => Ok(Emotion::Calming),
            _ => Err(UnknownEmotion(s.to_string())),
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One synchronized move followed by a pause
#[derive(Debug, Clone, PartialEq)]
pub struct Beat {
    pub label: &'static str,
    pub targets: &'static [(u8, f64)],
    pub duration_ms: u32,
    pub pause: Duration,
    /// Log every motor's position once the move is done
    pub check_status: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Choreography {
    /// Profile acceleration and velocity for the whole gesture
    pub speed: (u32, u32),
    pub beats: Vec<Beat>,
}

impl Choreography {
    /// Sum of every move duration and pause
    pub fn nominal_duration(&self) -> Duration {
        self.beats
            .iter()
            .map(|b| Duration::from_millis(u64::from(b.duration_ms)) + b.pause)
            .sum()
    }
}

fn beat(
    label: &'static str,
    targets: &'static [(u8, f64)],
    duration_ms: u32,
    pause_ms: u64,
) -> Beat {
    Beat {
        label,
        targets,
        duration_ms,
        pause: Duration::from_millis(pause_ms),
        check_status: true,
    }
}

fn quiet(beat: Beat) -> Beat {
    Beat {
        check_status: false,
        ..beat
    }
}

const NEUTRAL: &[(u8, f64)] = &[(1, 0.0), (2, 0.0), (3, 0.0), (4, 0.0), (5, 0.0), (6, 150.0)];

fn happiness() -> Choreography {
    let mut beats = vec![beat("Moved to neutral", NEUTRAL, 500, 500)];
    for _ in 0..2 {
        beats.push(beat(
            "Headshake left",
            &[(1, -15.0), (2, -30.0), (3, 0.0), (4, 0.0), (5, 50.0), (6, 130.0)],
            200,
            0,
        ));
        beats.push(beat(
            "Headshake right",
            &[(1, -15.0), (2, 0.0), (3, -30.0), (4, 0.0), (5, 50.0), (6, 130.0)],
            200,
            0,
        ));
        beats.push(beat(
            "Nod forward",
            &[(1, 10.0), (2, 0.0), (3, 0.0), (4, 0.0), (5, 30.0), (6, 120.0)],
            300,
            0,
        ));
    }
    beats.push(beat("Returned to neutral", NEUTRAL, 500, 0));
    Choreography {
        speed: (15, 20),
        beats,
    }
}

fn sadness() -> Choreography {
    Choreography {
        speed: (2, 5),
        beats: vec![
            beat("Moved to neutral", NEUTRAL, 500, 2000),
            beat(
                "Head and hands droop",
                &[(1, -60.0), (2, -20.0), (3, -10.0), (4, 0.0), (5, 60.0), (6, 130.0)],
                800,
                2000,
            ),
            beat(
                "Shifted posture",
                &[(1, -70.0), (2, -10.0), (3, -20.0), (4, 0.0), (5, 60.0), (6, 130.0)],
                800,
                2000,
            ),
            beat("Returned to neutral", NEUTRAL, 1000, 1000),
        ],
    }
}

fn anger() -> Choreography {
    Choreography {
        speed: (2, 5),
        beats: vec![
            beat("Moved to neutral", NEUTRAL, 500, 2000),
            beat(
                "Head down, arm raised",
                &[(1, -60.0), (2, -20.0), (3, -10.0), (4, 0.0), (5, 60.0), (6, 60.0)],
                800,
                2000,
            ),
            beat(
                "Shifted posture",
                &[(1, -70.0), (2, -10.0), (3, -20.0), (4, 0.0), (5, 60.0), (6, 60.0)],
                800,
                2000,
            ),
            beat("Returned to neutral", NEUTRAL, 1000, 1000),
        ],
    }
}

fn attention() -> Choreography {
    Choreography {
        speed: (25, 180),
        beats: vec![
            quiet(beat(
                "Starting from relaxed pose",
                &[(1, -60.0), (2, -40.0), (3, -40.0), (4, 0.0), (5, 30.0), (6, 150.0)],
                500,
                1000,
            )),
            quiet(beat(
                "Lifted to attentive posture",
                &[(1, -20.0), (2, 0.0), (3, 0.0)],
                600,
                700,
            )),
            quiet(beat("Shoulder up", &[(5, 90.0)], 400, 400)),
            // Hold the attentive pose after lowering the shoulder
            quiet(beat("Shoulder down", &[(5, 30.0)], 400, 1400)),
            quiet(beat(
                "Returned to neutral",
                &[(1, 0.0), (2, 0.0), (3, 0.0), (5, 30.0), (6, 150.0)],
                500,
                1000,
            )),
        ],
    }
}

fn gratitude() -> Choreography {
    Choreography {
        speed: (15, 12),
        beats: vec![
            beat(
                "Moved to neutral",
                &[(1, 0.0), (2, 0.0), (3, 0.0), (4, 0.0), (5, 30.0), (6, 130.0)],
                500,
                1000,
            ),
            beat(
                "Gratitude pose held",
                &[(1, -50.0), (2, -15.0), (3, -10.0), (4, 15.0), (5, 60.0), (6, 120.0)],
                700,
                2000,
            ),
            quiet(beat("Nod down", &[(1, -60.0)], 400, 400)),
            quiet(beat("Nod up", &[(1, -50.0)], 400, 400)),
            beat(
                "Returned to neutral",
                &[(1, 0.0), (2, 0.0), (3, 0.0), (4, 0.0), (5, 30.0), (6, 150.0)],
                800,
                1000,
            ),
        ],
    }
}

fn calming() -> Choreography {
    const CALM_NEUTRAL: &[(u8, f64)] =
        &[(1, -20.0), (2, 0.0), (3, 0.0), (4, 0.0), (5, 30.0), (6, 150.0)];

    let mut beats = vec![beat("Moved to calming neutral", CALM_NEUTRAL, 600, 1500)];
    for _ in 0..2 {
        beats.push(quiet(beat(
            "Left calming sway",
            &[(2, -20.0), (3, 0.0), (5, 60.0), (6, 130.0)],
            800,
            1000,
        )));
        beats.push(quiet(beat(
            "Right calming sway",
            &[(2, 0.0), (3, -20.0), (5, 60.0), (6, 150.0)],
            800,
            1000,
        )));
    }
    beats.push(quiet(beat("Returned to calming neutral", CALM_NEUTRAL, 800, 1500)));
    Choreography {
        speed: (5, 10),
        beats,
    }
}

/// Run a gesture. The caller owns the controller and shuts it down.
pub fn perform<T: Transport>(emotion: Emotion, robot: &mut Robot<T>) -> Result<(), RobotError> {
    let choreography = emotion.choreography();
    let (acceleration, velocity) = choreography.speed;

    info!("Starting {} gesture", emotion);
    robot.set_speed(acceleration, velocity)?;
    robot.check_motor_status(&Selection::All)?;
    robot.enable_torque()?;

    for beat in &choreography.beats {
        robot.move_sync(&MoveRequest::pose(beat.targets, beat.duration_ms))?;
        info!("{}", beat.label);
        if beat.check_status {
            robot.check_motor_status(&Selection::All)?;
        }
        if !beat.pause.is_zero() {
            robot.pause(beat.pause);
        }
    }

    info!("{} gesture ended", emotion);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RobotConfig;

    #[test]
    fn test_parse_names() {
        for emotion in Emotion::ALL {
            assert_eq!(emotion.name().parse::<Emotion>().unwrap(), emotion);
        }
        assert_eq!("angry".parse::<Emotion>().unwrap(), Emotion::Anger);
        assert_eq!("Calming".parse::<Emotion>().unwrap(), Emotion::Calming);
        assert_eq!(
            "boredom".parse::<Emotion>().unwrap_err(),
            UnknownEmotion("boredom".to_string())
        );
    }

    #[test]
    fn test_choreographies_stay_inside_lab_limits() {
        let config = RobotConfig::from_json(include_str!("../config/robot_330_lab.json")).unwrap();
        let limits: Vec<(u8, [f64; 2])> = config
            .motors
            .values()
            .map(|m| (m.id, m.angle_limit))
            .collect();

        for emotion in Emotion::ALL {
            for beat in emotion.choreography().beats {
                for (id, angle) in beat.targets {
                    let (_, [lower, upper]) = limits
                        .iter()
                        .find(|(motor, _)| motor == id)
                        .unwrap_or_else(|| panic!("{}: motor {} not configured", emotion, id));
                    assert!(
                        lower <= angle && angle <= upper,
                        "{} '{}': motor {} at {} outside [{}, {}]",
                        emotion,
                        beat.label,
                        id,
                        angle,
                        lower,
                        upper
                    );
                }
            }
        }
    }

    #[test]
    fn test_nominal_duration() {
        assert_eq!(
            Emotion::Sadness.choreography().nominal_duration(),
            Duration::from_millis(10_100)
        );
        assert_eq!(Emotion::Happiness.choreography().beats.len(), 8);
    }
}
