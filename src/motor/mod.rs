// Dynamixel servo control
//
// Provides:
// - Servo model descriptors, control tables and unit conversion
// - Bus transport trait with a Protocol 2.0 serial implementation and a simulator
// - High-level controller that validates, clamps and synchronizes moves

pub mod clock;
pub mod group;
pub mod model;
pub mod protocol;
pub mod request;
pub mod robot;
pub mod sim;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use model::{HardwareError, ModelType};
pub use protocol::SerialBus;
pub use request::{MotorKey, MoveRequest, Selection, Units};
pub use robot::{Diagnostic, MotorStatus, Robot, RobotError, RobotState};
pub use sim::SimulatedBus;
pub use transport::{BoxedTransport, BusError, Transport};
