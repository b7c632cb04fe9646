// Servo model descriptors for the supported Dynamixel families
//
// Each model carries its control table (register address + width), its native
// position range and the degree range that range maps onto. The controller picks
// one descriptor at construction and never branches on the model code again.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// A control-table register: start address and width in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub address: u16,
    pub width: u16,
}

impl Register {
    const fn new(address: u16, width: u16) -> Self {
        Self { address, width }
    }

    /// Encode a value little-endian into exactly `width` bytes
    pub fn encode(&self, value: u32) -> Vec<u8> {
        value.to_le_bytes()[..self.width as usize].to_vec()
    }

    /// Decode a little-endian value of this register's width
    pub fn decode(&self, data: &[u8]) -> Option<u32> {
        if data.len() < self.width as usize {
            return None;
        }
        let mut raw = [0u8; 4];
        raw[..self.width as usize].copy_from_slice(&data[..self.width as usize]);
        Some(u32::from_le_bytes(raw))
    }
}

/// Registers used to shape motion, which differ between the two generations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionRegisters {
    /// XL-320: fixed moving speed, torque limit and P gain
    Speed {
        moving_speed: Register,
        torque_limit: Register,
        p_gain: Register,
    },
    /// X-series: drive mode selects velocity- or time-based trapezoidal profiles
    Profile {
        drive_mode: Register,
        profile_acceleration: Register,
        profile_velocity: Register,
        moving_threshold: Register,
    },
}

/// Control-table addresses the controller needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTable {
    pub torque_enable: Register,
    pub goal_position: Register,
    pub present_position: Register,
    pub moving: Register,
    pub hardware_error_status: Register,
    /// Min position limit (X-series) or CW angle limit (XL-320)
    pub lower_limit: Register,
    /// Max position limit (X-series) or CCW angle limit (XL-320)
    pub upper_limit: Register,
    pub motion: MotionRegisters,
}

const XL320_TABLE: ControlTable = ControlTable {
    torque_enable: Register::new(24, 1),
    goal_position: Register::new(30, 2),
    present_position: Register::new(37, 2),
    moving: Register::new(49, 1),
    hardware_error_status: Register::new(50, 1),
    lower_limit: Register::new(6, 2),
    upper_limit: Register::new(8, 2),
    motion: MotionRegisters::Speed {
        moving_speed: Register::new(32, 2),
        torque_limit: Register::new(35, 2),
        p_gain: Register::new(29, 1),
    },
};

// XL-330 and XC-330 share the X-series layout
const X330_TABLE: ControlTable = ControlTable {
    torque_enable: Register::new(64, 1),
    goal_position: Register::new(116, 4),
    present_position: Register::new(132, 4),
    moving: Register::new(122, 1),
    hardware_error_status: Register::new(70, 1),
    lower_limit: Register::new(52, 4),
    upper_limit: Register::new(48, 4),
    motion: MotionRegisters::Profile {
        drive_mode: Register::new(10, 1),
        profile_acceleration: Register::new(108, 4),
        profile_velocity: Register::new(112, 4),
        moving_threshold: Register::new(24, 4),
    },
};

pub const TORQUE_ENABLE: u8 = 1;
pub const TORQUE_DISABLE: u8 = 0;

/// Drive mode bit selecting time-based profiles (profile velocity becomes a duration)
pub const DRIVE_MODE_TIME: u8 = 0x04;

/// Supported servo families, keyed by the model number the servo reports on ping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum ModelType {
    Xl320,
    Xl330,
    Xc330,
}

impl ModelType {
    pub const ALL: [ModelType; 3] = [ModelType::Xl320, ModelType::Xl330, ModelType::Xc330];

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            350 => Some(ModelType::Xl320),
            1200 => Some(ModelType::Xl330),
            1230 => Some(ModelType::Xc330),
            _ => None,
        }
    }

    /// Model number as reported by ping
    pub fn code(self) -> u16 {
        match self {
            ModelType::Xl320 => 350,
            ModelType::Xl330 => 1200,
            ModelType::Xc330 => 1230,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelType::Xl320 => "XL-320",
            ModelType::Xl330 => "XL-330",
            ModelType::Xc330 => "XC-330-M181-T",
        }
    }

    pub fn control_table(self) -> &'static ControlTable {
        match self {
            ModelType::Xl320 => &XL320_TABLE,
            ModelType::Xl330 | ModelType::Xc330 => &X330_TABLE,
        }
    }

    /// Valid native position range (inclusive)
    pub fn native_range(self) -> (i32, i32) {
        match self {
            ModelType::Xl320 => (0, 1023),
            ModelType::Xl330 | ModelType::Xc330 => (341, 3755),
        }
    }

    /// Degree range mapped onto the native range (inclusive)
    pub fn degree_range(self) -> (f64, f64) {
        match self {
            ModelType::Xl320 => (-150.0, 150.0),
            ModelType::Xl330 | ModelType::Xc330 => (-180.0, 180.0),
        }
    }

    /// Native value for 0 degrees
    pub fn center(self) -> i32 {
        self.degree_to_native(0.0)
    }

    /// Whether the model has profile registers (drive mode, profile velocity)
    pub fn has_profiles(self) -> bool {
        matches!(self.control_table().motion, MotionRegisters::Profile { .. })
    }

    fn native_per_degree(self) -> f64 {
        let (n_lo, n_hi) = self.native_range();
        let (d_lo, d_hi) = self.degree_range();
        f64::from(n_hi - n_lo) / (d_hi - d_lo)
    }

    /// Convert degrees to native position units
    ///
    /// The mapping is linear and not clamped: values outside the degree range
    /// land outside the native range, and the controller clamps them against
    /// the configured limits.
    pub fn degree_to_native(self, degrees: f64) -> i32 {
        let (n_lo, _) = self.native_range();
        let (d_lo, _) = self.degree_range();
        (f64::from(n_lo) + (degrees - d_lo) * self.native_per_degree()).round() as i32
    }

    /// Convert native position units to degrees
    pub fn native_to_degree(self, native: i32) -> f64 {
        let (n_lo, _) = self.native_range();
        let (d_lo, _) = self.degree_range();
        d_lo + f64::from(native - n_lo) / self.native_per_degree()
    }

    /// Decode the hardware error status byte into common flags
    pub fn decode_hardware_error(self, raw: u8) -> HardwareError {
        match self {
            // XL-320: bit 0 overload, bit 1 overheating, bit 2 input voltage
            ModelType::Xl320 => {
                let mut flags = HardwareError::empty();
                if raw & 0x01 != 0 {
                    flags |= HardwareError::OVERLOAD;
                }
                if raw & 0x02 != 0 {
                    flags |= HardwareError::OVERHEATING;
                }
                if raw & 0x04 != 0 {
                    flags |= HardwareError::INPUT_VOLTAGE;
                }
                flags
            }
            ModelType::Xl330 | ModelType::Xc330 => HardwareError::from_bits_truncate(raw),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

impl TryFrom<u16> for ModelType {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        ModelType::from_code(code).ok_or_else(|| format!("unsupported model type {}", code))
    }
}

impl From<ModelType> for u16 {
    fn from(model: ModelType) -> Self {
        model.code()
    }
}

bitflags! {
    /// Hardware error status, in X-series bit layout
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HardwareError: u8 {
        const INPUT_VOLTAGE = 0x01;
        const OVERHEATING = 0x04;
        const MOTOR_ENCODER = 0x08;
        const ELECTRICAL_SHOCK = 0x10;
        const OVERLOAD = 0x20;
    }
}
