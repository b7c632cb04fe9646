// Motor controller for a chain of Dynamixel servos
//
// Turns keyed target angles into clamped, bus-synchronized goal writes and
// reports motor state. Construction validates the configuration and the
// hardware; after that every call reports failure through its Result and the
// controller stays usable.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::group::GroupSyncWrite;
use super::model::{
    ControlTable, DRIVE_MODE_TIME, HardwareError, ModelType, MotionRegisters, Register,
    TORQUE_DISABLE, TORQUE_ENABLE,
};
use super::request::{MotorKey, MoveRequest, Selection, Units};
use super::transport::{BusError, Transport};
use crate::config::{
    ConfigError, DEFAULT_SETTLE, MIN_MOVE_DURATION_MS, MotionDefaults, POLL_INTERVAL,
    READ_ATTEMPTS, RobotConfig,
};

/// Native units per second represented by one profile-velocity step, scaled by 1000
const PROFILE_VELOCITY_UNIT: f64 = 11.2;

#[derive(Debug, thiserror::Error)]
pub enum RobotError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open port {port}: {source}")]
    PortOpen {
        port: String,
        #[source]
        source: BusError,
    },

    #[error("Failed to set baud rate {baud_rate}: {source}")]
    BaudRate {
        baud_rate: u32,
        #[source]
        source: BusError,
    },

    #[error("Motor type in config {expected} incompatible with detected type {found} on motor {id}")]
    ModelMismatch { id: u8, expected: u16, found: u16 },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("{0} is not a valid motor name/id")]
    UnknownMotor(MotorKey),

    #[error("Invalid motor selection: {0}")]
    InvalidSelection(String),

    #[error("Invalid move request: {0}")]
    InvalidRequest(String),

    #[error("Motors {ids:?} still moving after {timeout:?}")]
    Stalled { ids: Vec<u8>, timeout: Duration },

    #[error("Controller has been shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, RobotError>;

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotState {
    Idle,
    Moving,
    Shutdown,
}

/// Present position of one motor
#[derive(Debug, Clone, PartialEq)]
pub struct MotorStatus {
    pub id: u8,
    pub alias: String,
    pub position: i32,
    pub degrees: f64,
}

/// Hardware error status of one motor
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub id: u8,
    pub alias: String,
    pub raw: u8,
    pub errors: HardwareError,
}

#[derive(Debug, Clone)]
struct Motor {
    alias: String,
    id: u8,
    /// Angle limit in native units
    limit: (i32, i32),
}

/// Profile velocity that covers `distance` native units in `duration_ms`
///
/// Durations under 50 ms are raised to 50 ms; the result is never below 1.
pub fn profile_velocity_for(distance: u32, duration_ms: u32) -> u32 {
    let duration_ms = duration_ms.max(MIN_MOVE_DURATION_MS);
    let units_per_ms = f64::from(distance) / f64::from(duration_ms);
    let velocity = (units_per_ms * 1000.0 / PROFILE_VELOCITY_UNIT).round() as u32;
    velocity.max(1)
}

/// High-level controller for all motors on one bus
pub struct Robot<T: Transport> {
    transport: T,
    port: String,
    baud_rate: u32,
    model: ModelType,
    table: &'static ControlTable,
    motors: BTreeMap<u8, Motor>,
    blocking: bool,
    drive_mode: u8,
    motion: MotionDefaults,
    move_timeout: Duration,
    clock: Arc<dyn Clock>,
    state: RobotState,
}

impl<T: Transport> Robot<T> {
    /// Connect to and configure every motor in `config`
    pub fn new(config: RobotConfig, transport: T) -> Result<Self> {
        Self::with_clock(config, transport, Arc::new(SystemClock::new()))
    }

    /// Same as `new`, with an explicit time source for waits and polling
    pub fn with_clock(config: RobotConfig, mut transport: T, clock: Arc<dyn Clock>) -> Result<Self> {
        let controllers = &config.controllers;

        transport.open().map_err(|source| {
            error!("Failed to open port: {}", controllers.port);
            RobotError::PortOpen {
                port: controllers.port.clone(),
                source,
            }
        })?;
        info!("Successfully opened port: {}", controllers.port);

        if let Err(source) = transport.set_baud_rate(controllers.baudrate) {
            error!("Failed to set baud rate: {}", controllers.baudrate);
            transport.close();
            return Err(RobotError::BaudRate {
                baud_rate: controllers.baudrate,
                source,
            });
        }
        info!("Successfully set baud rate: {}", controllers.baudrate);

        let model = match config.validate() {
            Ok(model) => model,
            Err(e) => {
                error!("{}", e);
                transport.close();
                return Err(e.into());
            }
        };
        let entries = config.motors_by_id();
        let ids: Vec<u8> = entries.iter().map(|(_, m)| m.id).collect();
        info!("Motors with ids {:?} found in config", ids);

        // Check that every motor answers and reports the configured model
        for &id in &ids {
            let found = match transport.ping(id) {
                Ok(found) => found,
                Err(e) => {
                    error!("Motor {} did not answer ping: {}", id, e);
                    transport.close();
                    return Err(e.into());
                }
            };
            if found != model.code() {
                error!(
                    "Motor type in config {} incompatible with detected type {} on motor {}",
                    model.code(),
                    found,
                    id
                );
                transport.close();
                return Err(RobotError::ModelMismatch {
                    id,
                    expected: model.code(),
                    found,
                });
            }
            debug!("Motor {} responding", id);
        }
        info!("Successfully confirmed model type {}", model);

        let motors = entries
            .iter()
            .map(|(alias, m)| {
                let motor = Motor {
                    alias: alias.to_string(),
                    id: m.id,
                    limit: (
                        model.degree_to_native(m.angle_limit[0]),
                        model.degree_to_native(m.angle_limit[1]),
                    ),
                };
                (m.id, motor)
            })
            .collect();

        let mut robot = Self {
            transport,
            port: controllers.port.clone(),
            baud_rate: controllers.baudrate,
            model,
            table: model.control_table(),
            motors,
            blocking: controllers.blocking,
            drive_mode: controllers.drivemode,
            motion: controllers.motion.clone(),
            move_timeout: config.move_timeout(),
            clock,
            state: RobotState::Idle,
        };

        // Limit and mode registers live in EEPROM, which is only writable with torque off
        robot.disable_torque()?;
        robot.configure_motion()?;
        robot.enforce_angle_limits()?;

        Ok(robot)
    }

    fn configure_motion(&mut self) -> Result<()> {
        let defaults = self.motion.clone();
        let ids = self.motor_ids();
        match self.table.motion {
            MotionRegisters::Profile {
                drive_mode,
                profile_acceleration,
                profile_velocity,
                moving_threshold,
            } => {
                for id in ids {
                    self.write_register(id, drive_mode, u32::from(self.drive_mode))?;
                    self.write_register(id, profile_acceleration, defaults.acceleration)?;
                    self.write_register(id, profile_velocity, defaults.velocity)?;
                    self.write_register(id, moving_threshold, defaults.moving_threshold)?;
                    info!(
                        "Set profile acceleration ({}) and velocity ({}) for motor {}",
                        defaults.acceleration, defaults.velocity, id
                    );
                }
            }
            MotionRegisters::Speed {
                moving_speed,
                torque_limit,
                p_gain,
            } => {
                for id in ids {
                    self.write_register(id, moving_speed, defaults.moving_speed)?;
                    self.write_register(id, torque_limit, defaults.torque_limit)?;
                    self.write_register(id, p_gain, defaults.p_gain)?;
                    info!(
                        "Set moving speed ({}), torque limit ({}) and P gain ({}) for motor {}",
                        defaults.moving_speed, defaults.torque_limit, defaults.p_gain, id
                    );
                }
            }
        }
        Ok(())
    }

    fn enforce_angle_limits(&mut self) -> Result<()> {
        let limits: Vec<(u8, (i32, i32))> =
            self.motors.values().map(|m| (m.id, m.limit)).collect();
        for (id, (lower, upper)) in limits {
            self.write_register(id, self.table.lower_limit, lower as u32)?;
            self.write_register(id, self.table.upper_limit, upper as u32)?;
            info!("Set position limits [{}, {}] for motor {}", lower, upper, id);
        }
        Ok(())
    }

    // === Accessors ===

    pub fn model(&self) -> ModelType {
        self.model
    }

    pub fn motor_ids(&self) -> Vec<u8> {
        self.motors.keys().copied().collect()
    }

    pub fn state(&self) -> RobotState {
        self.state
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Angle limit of a motor in native units
    pub fn limit(&self, key: &MotorKey) -> Result<(i32, i32)> {
        let id = self.resolve(key)?;
        Ok(self.motor(id)?.limit)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sleep on the controller's clock
    pub fn pause(&self, duration: Duration) {
        self.clock.sleep(duration);
    }

    /// Log every configuration attribute
    pub fn describe(&self) {
        info!("Device name = {}", self.port);
        info!("Baud rate = {}", self.baud_rate);
        info!("Model type = {}", self.model);
        for motor in self.motors.values() {
            info!(
                "Motor {} '{}': limit [{}, {}]",
                motor.id, motor.alias, motor.limit.0, motor.limit.1
            );
        }
        info!("Blocking moves = {}", self.blocking);
        info!("Drive mode = {}", self.drive_mode);
        info!("Motion defaults = {:?}", self.motion);
        info!("Move timeout = {:?}", self.move_timeout);
    }

    // === Helpers ===

    fn ensure_active(&self) -> Result<()> {
        if self.state == RobotState::Shutdown {
            return Err(RobotError::Shutdown);
        }
        Ok(())
    }

    fn motor(&self, id: u8) -> Result<&Motor> {
        self.motors
            .get(&id)
            .ok_or_else(|| RobotError::UnknownMotor(MotorKey::Id(id)))
    }

    fn resolve(&self, key: &MotorKey) -> Result<u8> {
        let found = match key {
            MotorKey::Id(id) => self.motors.get(id),
            MotorKey::Alias(alias) => self.motors.values().find(|m| &m.alias == alias),
        };
        found.map(|m| m.id).ok_or_else(|| {
            error!("{} not a valid motor name/id", key);
            RobotError::UnknownMotor(key.clone())
        })
    }

    fn select(&self, selection: &Selection) -> Result<Vec<u8>> {
        match selection {
            Selection::All => Ok(self.motor_ids()),
            Selection::Motors(keys) => keys.iter().map(|k| self.resolve(k)).collect(),
        }
    }

    fn write_register(&mut self, id: u8, register: Register, value: u32) -> Result<()> {
        self.transport
            .write(id, register.address, &register.encode(value))?;
        Ok(())
    }

    fn read_register(&mut self, id: u8, register: Register) -> Result<u32> {
        let data = self.transport.read(id, register.address, register.width)?;
        register.decode(&data).ok_or_else(|| {
            RobotError::Bus(BusError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", register.width, data.len()),
            })
        })
    }

    /// Run a bus operation up to `READ_ATTEMPTS` times
    fn with_retries<R>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let mut attempt = 1;
        loop {
            match op(self) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < READ_ATTEMPTS => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, READ_ATTEMPTS, e);
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} failed after {} attempts: {}", what, READ_ATTEMPTS, e);
                    return Err(e);
                }
            }
        }
    }

    fn time_based_profiles(&self) -> bool {
        self.model.has_profiles() && self.drive_mode & DRIVE_MODE_TIME != 0
    }

    fn profile_velocity_register(&self) -> Option<Register> {
        match self.table.motion {
            MotionRegisters::Profile {
                profile_velocity, ..
            } => Some(profile_velocity),
            MotionRegisters::Speed { .. } => None,
        }
    }

    /// Resolve keys, convert units and clamp into the configured limits
    fn prepare_targets(&self, request: &MoveRequest) -> Result<BTreeMap<u8, i32>> {
        if request.targets.is_empty() {
            return Err(RobotError::InvalidRequest("no targets given".to_string()));
        }

        let mut targets = BTreeMap::new();
        for (key, value) in &request.targets {
            let id = self.resolve(key)?;
            let mut native = match request.units {
                Units::Degrees => self.model.degree_to_native(*value),
                Units::Native => value.round() as i32,
            };

            if request.check_range {
                let (lower, upper) = self.motor(id)?.limit;
                if native < lower || native > upper {
                    let clamped = native.clamp(lower, upper);
                    warn!(
                        "Invalid movement target {} for motor {}. Valid range = [{}, {}]. Changed to {}",
                        native, id, lower, upper, clamped
                    );
                    native = clamped;
                }
            }

            // Goal registers are unsigned and only accept the model's native range
            let (min, max) = self.model.native_range();
            if native < min || native > max {
                let clamped = native.clamp(min, max);
                warn!(
                    "Movement target {} for motor {} outside model range [{}, {}]. Changed to {}",
                    native, id, min, max, clamped
                );
                native = clamped;
            }

            if targets.insert(id, native).is_some() {
                return Err(RobotError::InvalidRequest(format!(
                    "motor {} targeted more than once",
                    id
                )));
            }
        }
        Ok(targets)
    }

    /// Resolve per-motor timing entries; every motor must also be a target
    fn prepare_timing(
        &self,
        what: &str,
        entries: &[(MotorKey, u32)],
        targets: &BTreeMap<u8, i32>,
    ) -> Result<BTreeMap<u8, u32>> {
        let mut resolved = BTreeMap::new();
        for (key, value) in entries {
            let id = self.resolve(key)?;
            if !targets.contains_key(&id) {
                error!("Invalid motor provided in {}: {}", what, key);
                return Err(RobotError::InvalidRequest(format!(
                    "{} given for motor {} without a target",
                    what, key
                )));
            }
            resolved.insert(id, *value);
        }
        Ok(resolved)
    }

    /// Current position, or the model centre when the read fails
    fn current_position_or_center(&mut self, id: u8) -> i32 {
        match self.read_register(id, self.table.present_position) {
            Ok(0) | Err(_) => {
                warn!("Could not read present position of motor {}, assuming centre", id);
                self.model.center()
            }
            Ok(position) => position as i32,
        }
    }

    /// Send a group, logging and clearing it on failure
    fn send_group(&mut self, group: &mut GroupSyncWrite, what: &str) -> Result<()> {
        if let Err(e) = group.transmit(&mut self.transport) {
            error!("{} sync write failed: {}", what, e);
            group.clear();
            return Err(e.into());
        }
        info!("{} sync write succeeded", what);
        Ok(())
    }

    fn queue(group: &mut GroupSyncWrite, id: u8, value: u32, what: &str) -> Result<()> {
        if let Err(e) = group.add_value(id, value) {
            error!("[ID:{}] {} add param failed: {}", id, what, e);
            group.clear();
            return Err(e.into());
        }
        Ok(())
    }

    fn finish_move(&mut self, ids: &[u8], settle: Option<Duration>) -> Result<()> {
        self.state = RobotState::Moving;
        let result = if self.blocking {
            self.wait_for_motion(ids)
        } else {
            let settle = settle.unwrap_or(DEFAULT_SETTLE);
            debug!("Non-blocking mode: sleeping for {:?} to allow move completion", settle);
            self.clock.sleep(settle);
            Ok(())
        };
        self.state = RobotState::Idle;
        result?;

        match self.get_positions() {
            Ok(positions) => debug!("Positions after move: {:?}", positions),
            Err(e) => warn!("Could not read positions after move: {}", e),
        }
        Ok(())
    }

    /// Poll the moving flag of `ids` until all have stopped or the timeout passes
    fn wait_for_motion(&mut self, ids: &[u8]) -> Result<()> {
        let moving = self.table.moving;
        let start = self.clock.now();
        let mut pending = ids.to_vec();

        loop {
            self.clock.sleep(POLL_INTERVAL);

            match self.transport.sync_read(moving.address, moving.width, ids) {
                Ok(data) => {
                    pending = ids
                        .iter()
                        .copied()
                        .filter(|id| match data.get(id).and_then(|d| moving.decode(d)) {
                            Some(flag) => flag != 0,
                            None => {
                                error!("[ID:{:03}] moving status missing from sync read", id);
                                true
                            }
                        })
                        .collect();
                    if pending.is_empty() {
                        return Ok(());
                    }
                }
                Err(e) => error!("Moving status read failed: {}", e),
            }

            if self.clock.now().saturating_sub(start) >= self.move_timeout {
                error!(
                    "Motors {:?} still moving after {:?}, giving up",
                    pending, self.move_timeout
                );
                return Err(RobotError::Stalled {
                    ids: pending,
                    timeout: self.move_timeout,
                });
            }
        }
    }

    // === Commands ===

    /// Enable torque. Motors only move with torque enabled.
    pub fn enable_torque(&mut self) -> Result<()> {
        self.ensure_active()?;
        for id in self.motor_ids() {
            self.write_register(id, self.table.torque_enable, u32::from(TORQUE_ENABLE))?;
            info!("Torque enabled for motor {}", id);
        }
        Ok(())
    }

    /// Disable torque on every motor, attempting all even if some fail
    pub fn disable_torque(&mut self) -> Result<()> {
        self.ensure_active()?;
        let mut first_error = None;
        for id in self.motor_ids() {
            match self.write_register(id, self.table.torque_enable, u32::from(TORQUE_DISABLE)) {
                Ok(()) => info!("Torque disabled for motor {}", id),
                Err(e) => {
                    warn!("Failed to disable torque on motor {}: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Rewrite profile acceleration and velocity (moving speed on XL-320)
    pub fn set_speed(&mut self, acceleration: u32, velocity: u32) -> Result<()> {
        self.ensure_active()?;
        let ids = self.motor_ids();
        match self.table.motion {
            MotionRegisters::Profile {
                profile_acceleration,
                profile_velocity,
                ..
            } => {
                for &id in &ids {
                    self.write_register(id, profile_acceleration, acceleration)?;
                    self.write_register(id, profile_velocity, velocity)?;
                }
                self.motion.acceleration = acceleration;
                self.motion.velocity = velocity;
            }
            MotionRegisters::Speed { moving_speed, .. } => {
                for &id in &ids {
                    self.write_register(id, moving_speed, velocity)?;
                }
                self.motion.moving_speed = velocity;
            }
        }
        info!("Set acceleration {} and velocity {} on motors {:?}", acceleration, velocity, ids);
        Ok(())
    }

    /// Move motors one bus transaction at a time
    ///
    /// Durations are written per motor as profile times when the drive mode is
    /// time-based.
    pub fn move_single(&mut self, request: &MoveRequest) -> Result<()> {
        self.ensure_active()?;
        let targets = self.prepare_targets(request)?;
        let durations = self.prepare_timing("duration", &request.durations, &targets)?;

        if !durations.is_empty() {
            match self.profile_velocity_register() {
                Some(register) if self.time_based_profiles() => {
                    for (&id, &ms) in &durations {
                        self.write_register(id, register, ms)?;
                    }
                }
                _ => debug!("Drive mode is not time-based, ignoring durations"),
            }
        }

        for (&id, &goal) in &targets {
            self.write_register(id, self.table.goal_position, goal as u32)?;
            info!("Motor {} model {} moved to position {}", id, self.model.code(), goal);
        }

        let ids: Vec<u8> = targets.keys().copied().collect();
        self.finish_move(&ids, None)
    }

    /// Move motors together with one grouped write for timing and one for goals
    ///
    /// With `durations`, each motor's profile velocity is derived from the
    /// distance it has to cover. Explicit `velocities` take precedence.
    pub fn move_sync(&mut self, request: &MoveRequest) -> Result<()> {
        self.ensure_active()?;
        let targets = self.prepare_targets(request)?;
        let durations = self.prepare_timing("duration", &request.durations, &targets)?;
        let velocities = self.prepare_timing("velocity", &request.velocities, &targets)?;

        let profile_register = self
            .profile_velocity_register()
            .filter(|_| self.time_based_profiles());

        match profile_register {
            Some(register) if !velocities.is_empty() => {
                let mut group = GroupSyncWrite::new(register);
                for (&id, &velocity) in &velocities {
                    let velocity = velocity.max(1);
                    debug!("Motor {}: user profile velocity = {}", id, velocity);
                    Self::queue(&mut group, id, velocity, "Profile velocity")?;
                }
                self.send_group(&mut group, "Profile velocity")?;
            }
            Some(register) if !durations.is_empty() => {
                let mut group = GroupSyncWrite::new(register);
                for (&id, &ms) in &durations {
                    let goal = targets[&id];
                    let current = self.current_position_or_center(id);
                    let distance = goal.abs_diff(current);
                    if ms < MIN_MOVE_DURATION_MS {
                        warn!(
                            "Capping too-short duration ({}ms) to {}ms for motor {}",
                            ms, MIN_MOVE_DURATION_MS, id
                        );
                    }
                    let velocity = profile_velocity_for(distance, ms);
                    debug!(
                        "Motor {}: dist={}, time={}ms, profile_vel={}",
                        id, distance, ms, velocity
                    );
                    Self::queue(&mut group, id, velocity, "Profile velocity")?;
                }
                self.send_group(&mut group, "Profile velocity")?;
            }
            _ => {}
        }

        let mut goals = GroupSyncWrite::new(self.table.goal_position);
        for (&id, &goal) in &targets {
            debug!("Moving ID {} to position {}", id, goal);
            Self::queue(&mut goals, id, goal as u32, "Goal position")?;
        }
        self.send_group(&mut goals, "Goal position")?;

        let settle = request
            .longest_duration()
            .map(|ms| Duration::from_millis(u64::from(ms.max(MIN_MOVE_DURATION_MS))));
        let ids: Vec<u8> = targets.keys().copied().collect();
        self.finish_move(&ids, settle)
    }

    /// Move every motor to 0 degrees, or as close as its limit allows
    pub fn reset(&mut self) -> Result<()> {
        let request = self
            .motor_ids()
            .into_iter()
            .fold(MoveRequest::new(), |req, id| req.target(id, 0.0));
        self.move_sync(&request)
    }

    // === Queries ===

    /// Present position of every motor in native units, via one grouped read
    pub fn get_positions(&mut self) -> Result<BTreeMap<u8, i32>> {
        self.ensure_active()?;
        let register = self.table.present_position;
        let ids = self.motor_ids();
        self.with_retries("Present position sync read", |robot| {
            let data = robot
                .transport
                .sync_read(register.address, register.width, &ids)?;
            ids.iter()
                .map(|&id| {
                    data.get(&id)
                        .and_then(|d| register.decode(d))
                        .map(|value| (id, value as i32))
                        .ok_or_else(|| {
                            RobotError::Bus(BusError::InvalidResponse {
                                id,
                                reason: "position missing from sync read".to_string(),
                            })
                        })
                })
                .collect()
        })
    }

    /// Present angle in degrees of each requested motor, in request order
    pub fn get_motor_angles(&mut self, keys: &[MotorKey]) -> Result<Vec<f64>> {
        let ids = keys
            .iter()
            .map(|k| self.resolve(k))
            .collect::<Result<Vec<u8>>>()?;
        let positions = self.get_positions()?;
        Ok(ids
            .iter()
            .map(|id| self.model.native_to_degree(positions[id]))
            .collect())
    }

    /// Read and log the present position of the selected motors
    pub fn check_motor_status(&mut self, selection: &Selection) -> Result<Vec<MotorStatus>> {
        self.ensure_active()?;
        let ids = self.select(selection)?;
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            let position = self.read_register(id, self.table.present_position)? as i32;
            info!(
                "Status check: motor {} model {} position {}",
                id,
                self.model.code(),
                position
            );
            statuses.push(MotorStatus {
                id,
                alias: self.motor(id)?.alias.clone(),
                position,
                degrees: self.model.native_to_degree(position),
            });
        }
        Ok(statuses)
    }

    /// Read and log the hardware error status of the selected motors
    pub fn get_diagnostic(&mut self, selection: &Selection) -> Result<Vec<Diagnostic>> {
        self.ensure_active()?;
        let ids = self.select(selection)?;
        let mut diagnostics = Vec::with_capacity(ids.len());
        for id in ids {
            let raw = self.read_register(id, self.table.hardware_error_status)? as u8;
            let errors = self.model.decode_hardware_error(raw);
            if errors.is_empty() {
                info!("Diagnostic: motor {} error status {:#010b}", id, raw);
            } else {
                warn!("Diagnostic: motor {} error status {:#010b} ({:?})", id, raw, errors);
            }
            diagnostics.push(Diagnostic {
                id,
                alias: self.motor(id)?.alias.clone(),
                raw,
                errors,
            });
        }
        Ok(diagnostics)
    }

    /// Disable torque and close the port. Safe to call more than once.
    pub fn clean_shutdown(&mut self) -> Result<()> {
        if self.state == RobotState::Shutdown {
            debug!("Shutdown already complete");
            return Ok(());
        }
        info!("Initiating shutdown...");
        let result = self.disable_torque();
        self.transport.close();
        self.state = RobotState::Shutdown;
        info!("Shutdown complete");
        result
    }
}

impl<T: Transport> Drop for Robot<T> {
    fn drop(&mut self) {
        // Leave the motors limp if the caller never shut down
        if self.state != RobotState::Shutdown {
            if let Err(e) = self.clean_shutdown() {
                warn!("Failed to shut down motors on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::clock::ManualClock;
    use crate::motor::sim::{SimulatedBus, Transaction};

    fn config(blocking: bool, drivemode: u8) -> RobotConfig {
        RobotConfig::from_json(&format!(
            r#"{{
                "controllers": {{"port": "sim", "protocol": 2.0, "baudrate": 57600,
                                 "blocking": {}, "drivemode": {}, "move_timeout_ms": 1000}},
                "motors": {{
                    "shoulder": {{"id": 5, "type": 1200, "angle_limit": [-90, 90]}},
                    "arm": {{"id": 6, "type": 1200, "angle_limit": [0, 170]}}
                }}
            }}"#,
            blocking, drivemode
        ))
        .unwrap()
    }

    fn bus() -> SimulatedBus {
        SimulatedBus::new()
            .with_motor(5, ModelType::Xl330)
            .with_motor(6, ModelType::Xl330)
    }

    fn robot(blocking: bool, drivemode: u8, bus: SimulatedBus) -> (Robot<SimulatedBus>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let robot = Robot::with_clock(config(blocking, drivemode), bus, clock.clone()).unwrap();
        (robot, clock)
    }

    #[test]
    fn test_profile_velocity_formula() {
        // 285 units in 1000 ms -> 285 / 1000 * 1000 / 11.2 = 25.4
        assert_eq!(profile_velocity_for(285, 1000), 25);
        assert_eq!(profile_velocity_for(0, 1000), 1);
        assert_eq!(profile_velocity_for(1, 60_000), 1);
        // Below 50 ms behaves like 50 ms
        assert_eq!(profile_velocity_for(560, 10), profile_velocity_for(560, 50));
        assert_eq!(profile_velocity_for(560, 50), 1000);
    }

    #[test]
    fn test_construction_configures_motors() {
        let (robot, _) = robot(false, DRIVE_MODE_TIME, bus());
        let table = ModelType::Xl330.control_table();
        let sim = robot.transport();

        assert!(sim.is_open());
        assert_eq!(sim.baud_rate(), Some(57600));
        assert_eq!(sim.register(5, table.lower_limit), Some(ModelType::Xl330.degree_to_native(-90.0) as u32));
        assert_eq!(sim.register(6, table.upper_limit), Some(ModelType::Xl330.degree_to_native(170.0) as u32));
        if let MotionRegisters::Profile {
            drive_mode,
            profile_acceleration,
            profile_velocity,
            ..
        } = table.motion
        {
            assert_eq!(sim.register(5, drive_mode), Some(4));
            assert_eq!(sim.register(6, profile_acceleration), Some(100));
            assert_eq!(sim.register(6, profile_velocity), Some(200));
        }
        assert_eq!(robot.motor_ids(), vec![5, 6]);
        assert_eq!(robot.state(), RobotState::Idle);
    }

    #[test]
    fn test_construction_fails_on_invalid_config() {
        let mut config = config(false, 0);
        config.motors.get_mut("arm").unwrap().model = 350;
        let err = Robot::new(config, bus()).err().unwrap();
        assert!(matches!(err, RobotError::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_construction_fails_on_port_open() {
        let err = Robot::new(config(false, 0), bus().with_failing_open()).err().unwrap();
        assert!(matches!(err, RobotError::PortOpen { .. }));
    }

    #[test]
    fn test_construction_fails_on_baud_rate() {
        let err = Robot::new(config(false, 0), bus().with_failing_baud_rate()).err().unwrap();
        assert!(matches!(err, RobotError::BaudRate { baud_rate: 57600, .. }));
    }

    #[test]
    fn test_construction_fails_on_missing_motor() {
        let sim = SimulatedBus::new().with_motor(5, ModelType::Xl330);
        let err = Robot::new(config(false, 0), sim).err().unwrap();
        assert!(matches!(err, RobotError::Bus(BusError::Timeout { id: 6 })));
    }

    #[test]
    fn test_construction_fails_on_model_mismatch() {
        let sim = bus().with_reported_model(6, 350);
        let err = Robot::new(config(false, 0), sim).err().unwrap();
        assert!(matches!(
            err,
            RobotError::ModelMismatch { id: 6, expected: 1200, found: 350 }
        ));
    }

    #[test]
    fn test_out_of_range_target_is_clamped() {
        let (mut robot, _) = robot(false, 0, bus());
        let table = ModelType::Xl330.control_table();

        robot
            .move_sync(&MoveRequest::new().target(5u8, 200.0).target(6u8, 200.0))
            .unwrap();

        let upper_5 = ModelType::Xl330.degree_to_native(90.0) as u32;
        let upper_6 = ModelType::Xl330.degree_to_native(170.0) as u32;
        assert_eq!(robot.transport().register(5, table.goal_position), Some(upper_5));
        assert_eq!(robot.transport().register(6, table.goal_position), Some(upper_6));
    }

    #[test]
    fn test_aliases_resolve() {
        let (mut robot, _) = robot(false, 0, bus());
        let table = ModelType::Xl330.control_table();
        robot
            .move_single(&MoveRequest::new().target("arm", 45.0))
            .unwrap();
        assert_eq!(
            robot.transport().register(6, table.goal_position),
            Some(ModelType::Xl330.degree_to_native(45.0) as u32)
        );
    }

    #[test]
    fn test_unknown_motor_is_rejected_and_robot_stays_usable() {
        let (mut robot, _) = robot(false, 0, bus());
        let err = robot
            .move_sync(&MoveRequest::new().target(9u8, 10.0))
            .unwrap_err();
        assert!(matches!(err, RobotError::UnknownMotor(MotorKey::Id(9))));
        robot.move_sync(&MoveRequest::new().target(5u8, 10.0)).unwrap();
    }

    #[test]
    fn test_duration_for_untargeted_motor_is_rejected() {
        let (mut robot, _) = robot(false, DRIVE_MODE_TIME, bus());
        let request = MoveRequest::new().target(5u8, 10.0).duration(6u8, 500);
        assert!(matches!(
            robot.move_sync(&request),
            Err(RobotError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_single_move_writes_durations_per_motor() {
        let (mut robot, _) = robot(false, DRIVE_MODE_TIME, bus());
        robot.transport_mut().clear_transactions();

        let request = MoveRequest::new()
            .target(5u8, 30.0)
            .duration(5u8, 700)
            .target("arm", 40.0)
            .duration("arm", 300);
        robot.move_single(&request).unwrap();

        let MotionRegisters::Profile {
            profile_velocity, ..
        } = ModelType::Xl330.control_table().motion
        else {
            unreachable!()
        };
        let transactions = robot.transport().transactions();
        for (id, ms) in [(5, 700), (6, 300)] {
            assert!(transactions.contains(&Transaction::Write {
                id,
                address: profile_velocity.address,
                data: profile_velocity.encode(ms),
            }));
        }
        assert!(robot.transport().sync_writes_to(profile_velocity.address).is_empty());
        assert_eq!(robot.transport().register(6, profile_velocity), Some(300));
    }

    #[test]
    fn test_single_move_ignores_durations_in_velocity_mode() {
        let (mut robot, _) = robot(false, 0, bus());
        robot.transport_mut().clear_transactions();

        let request = MoveRequest::new().target(5u8, 30.0).duration(5u8, 700);
        robot.move_single(&request).unwrap();

        let table = ModelType::Xl330.control_table();
        let MotionRegisters::Profile {
            profile_velocity, ..
        } = table.motion
        else {
            unreachable!()
        };
        let transactions = robot.transport().transactions();
        assert!(!transactions.iter().any(|t| matches!(
            t,
            Transaction::Write { address, .. } if *address == profile_velocity.address
        )));
        assert_eq!(
            robot.transport().register(5, table.goal_position),
            Some(ModelType::Xl330.degree_to_native(30.0) as u32)
        );
    }

    #[test]
    fn test_motor_lookup_never_falls_back() {
        let (robot, _) = robot(false, 0, bus());
        assert!(matches!(
            robot.motor(9),
            Err(RobotError::UnknownMotor(MotorKey::Id(9)))
        ));
        assert!(robot.limit(&MotorKey::Id(9)).is_err());
        assert_eq!(robot.motor(6).unwrap().alias, "arm");
        assert_eq!(
            robot.limit(&MotorKey::from("arm")).unwrap(),
            (
                ModelType::Xl330.degree_to_native(0.0),
                ModelType::Xl330.degree_to_native(170.0)
            )
        );
    }

    #[test]
    fn test_unchecked_targets_stay_in_model_range() {
        let (mut robot, _) = robot(false, 0, bus());
        robot
            .move_sync(
                &MoveRequest::new()
                    .target(5u8, -200.0)
                    .target(6u8, 5000.0)
                    .units(Units::Native)
                    .check_range(false),
            )
            .unwrap();

        let table = ModelType::Xl330.control_table();
        assert_eq!(robot.transport().register(5, table.goal_position), Some(341));
        assert_eq!(robot.transport().register(6, table.goal_position), Some(3755));
    }

    #[test]
    fn test_sync_move_writes_derived_profile_velocity() {
        let (mut robot, _) = robot(false, DRIVE_MODE_TIME, bus());
        robot.transport_mut().clear_transactions();

        let request = MoveRequest::new()
            .target(5u8, 30.0)
            .duration(5u8, 1000)
            .target(6u8, 150.0)
            .duration(6u8, 20);
        robot.move_sync(&request).unwrap();

        let table = ModelType::Xl330.control_table();
        let MotionRegisters::Profile {
            profile_velocity, ..
        } = table.motion
        else {
            unreachable!()
        };
        let writes = robot.transport().sync_writes_to(profile_velocity.address);
        assert_eq!(writes.len(), 1);

        let goal_5 = ModelType::Xl330.degree_to_native(30.0);
        let goal_6 = ModelType::Xl330.degree_to_native(150.0);
        let expected_5 = profile_velocity_for(goal_5.abs_diff(2048), 1000);
        let expected_6 = profile_velocity_for(goal_6.abs_diff(2048), 50);
        assert_eq!(
            writes[0],
            &[
                (5, profile_velocity.encode(expected_5)),
                (6, profile_velocity.encode(expected_6)),
            ][..]
        );
        assert!(expected_5 >= 1 && expected_6 >= 1);
    }

    #[test]
    fn test_explicit_velocity_takes_precedence() {
        let (mut robot, _) = robot(false, DRIVE_MODE_TIME, bus());
        let request = MoveRequest::new()
            .target(5u8, 30.0)
            .velocity(5u8, 0)
            .target(6u8, 30.0)
            .velocity(6u8, 77)
            .duration(6u8, 500);
        robot.move_sync(&request).unwrap();

        let MotionRegisters::Profile {
            profile_velocity, ..
        } = ModelType::Xl330.control_table().motion
        else {
            unreachable!()
        };
        assert_eq!(robot.transport().register(5, profile_velocity), Some(1));
        assert_eq!(robot.transport().register(6, profile_velocity), Some(77));
    }

    #[test]
    fn test_velocity_mode_skips_profile_writes() {
        let (mut robot, _) = robot(false, 0, bus());
        robot.transport_mut().clear_transactions();
        robot
            .move_sync(&MoveRequest::pose(&[(5u8, 10.0)], 500))
            .unwrap();
        let syncs = robot
            .transport()
            .transactions()
            .iter()
            .filter(|t| matches!(t, Transaction::SyncWrite { .. }))
            .count();
        assert_eq!(syncs, 1);
    }

    #[test]
    fn test_non_blocking_sleeps_for_longest_duration() {
        let (mut robot, clock) = robot(false, DRIVE_MODE_TIME, bus());
        let request = MoveRequest::new()
            .target(5u8, 30.0)
            .duration(5u8, 1000)
            .target(6u8, 150.0)
            .duration(6u8, 500);
        robot.move_sync(&request).unwrap();
        assert!(clock.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn test_non_blocking_short_duration_sleeps_minimum() {
        let (mut robot, clock) = robot(false, DRIVE_MODE_TIME, bus());
        robot
            .move_sync(&MoveRequest::pose(&[(5u8, 0.0)], 10))
            .unwrap();
        assert_eq!(clock.elapsed(), Duration::from_millis(50));
    }

    #[test]
    fn test_failed_goal_write_reports_failure() {
        let (mut robot, _) = robot(false, 0, bus());
        robot.transport_mut().fail_sync_writes(1);
        let err = robot
            .move_sync(&MoveRequest::new().target(5u8, 10.0))
            .unwrap_err();
        assert!(matches!(err, RobotError::Bus(BusError::TxFailed(_))));
        assert_eq!(robot.state(), RobotState::Idle);
        robot.move_sync(&MoveRequest::new().target(5u8, 10.0)).unwrap();
    }

    #[test]
    fn test_blocking_move_polls_until_stopped() {
        let (mut robot, clock) = robot(true, 0, bus().with_motion_polls(3));
        robot.move_sync(&MoveRequest::new().target(5u8, 45.0)).unwrap();
        assert_eq!(clock.elapsed(), POLL_INTERVAL * 3);

        let table = ModelType::Xl330.control_table();
        assert_eq!(
            robot.transport().register(5, table.present_position),
            Some(ModelType::Xl330.degree_to_native(45.0) as u32)
        );
    }

    #[test]
    fn test_blocking_move_survives_failed_poll() {
        let (mut robot, clock) = robot(true, 0, bus().with_motion_polls(1));
        robot.transport_mut().fail_sync_reads(1);
        robot.move_single(&MoveRequest::new().target(6u8, 45.0)).unwrap();
        assert_eq!(clock.elapsed(), POLL_INTERVAL * 2);
    }

    #[test]
    fn test_blocking_move_reports_stall() {
        let (mut robot, _) = robot(true, 0, bus().with_stuck_motor(6));
        let err = robot
            .move_sync(&MoveRequest::new().target(5u8, 10.0).target(6u8, 10.0))
            .unwrap_err();
        match err {
            RobotError::Stalled { ids, timeout } => {
                assert_eq!(ids, vec![6]);
                assert_eq!(timeout, Duration::from_millis(1000));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(robot.state(), RobotState::Idle);
    }

    #[test]
    fn test_status_rejects_all_mixed_without_bus_traffic() {
        let (mut robot, _) = robot(false, 0, bus());
        robot.transport_mut().clear_transactions();

        let result = Selection::parse(&["all", "extra"])
            .and_then(|selection| robot.check_motor_status(&selection));
        assert!(matches!(result, Err(RobotError::InvalidSelection(_))));

        let unknown = Selection::Motors(vec![MotorKey::from("extra")]);
        assert!(robot.check_motor_status(&unknown).is_err());
        assert!(robot.transport().transactions().is_empty());
    }

    #[test]
    fn test_status_and_diagnostic() {
        let (mut robot, _) = robot(false, 0, bus());
        let table = ModelType::Xl330.control_table();
        robot.transport_mut().set_register(6, table.hardware_error_status, 0x20);

        let statuses = robot.check_motor_status(&Selection::All).unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].position, 2048);
        assert!(statuses[0].degrees.abs() < 1e-9);

        let diagnostics = robot
            .get_diagnostic(&Selection::Motors(vec![MotorKey::from("arm")]))
            .unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].id, 6);
        assert_eq!(diagnostics[0].errors, HardwareError::OVERLOAD);
    }

    #[test]
    fn test_get_positions_retries() {
        let (mut robot, _) = robot(false, 0, bus());
        robot.transport_mut().fail_sync_reads(2);
        let positions = robot.get_positions().unwrap();
        assert_eq!(positions[&5], 2048);

        robot.transport_mut().fail_sync_reads(3);
        assert!(robot.get_positions().is_err());
    }

    #[test]
    fn test_reset_moves_to_zero_within_limits() {
        let (mut robot, _) = robot(false, 0, bus());
        robot.move_sync(&MoveRequest::new().target(5u8, 45.0)).unwrap();
        robot.reset().unwrap();

        let table = ModelType::Xl330.control_table();
        assert_eq!(robot.transport().register(5, table.goal_position), Some(2048));
        assert_eq!(robot.transport().register(6, table.goal_position), Some(2048));
    }

    #[test]
    fn test_set_speed() {
        let (mut robot, _) = robot(false, 0, bus());
        robot.set_speed(15, 20).unwrap();
        let MotionRegisters::Profile {
            profile_acceleration,
            profile_velocity,
            ..
        } = ModelType::Xl330.control_table().motion
        else {
            unreachable!()
        };
        assert_eq!(robot.transport().register(5, profile_acceleration), Some(15));
        assert_eq!(robot.transport().register(6, profile_velocity), Some(20));
    }

    #[test]
    fn test_shutdown_is_idempotent_and_terminal() {
        let (mut robot, _) = robot(false, 0, bus());
        robot.enable_torque().unwrap();
        robot.clean_shutdown().unwrap();
        robot.clean_shutdown().unwrap();

        let table = ModelType::Xl330.control_table();
        assert_eq!(robot.transport().register(5, table.torque_enable), Some(0));
        assert!(!robot.transport().is_open());
        assert_eq!(robot.state(), RobotState::Shutdown);
        assert!(matches!(robot.reset(), Err(RobotError::Shutdown)));
        assert!(matches!(robot.get_positions(), Err(RobotError::Shutdown)));
    }

    #[test]
    fn test_xl320_uses_two_byte_registers() {
        let config = RobotConfig::from_json(
            r#"{
                "controllers": {"port": "sim", "protocol": 2.0, "baudrate": 1000000, "blocking": false},
                "motors": {"head": {"id": 1, "type": 350, "angle_limit": [-100, 100]}}
            }"#,
        )
        .unwrap();
        let sim = SimulatedBus::new().with_motor(1, ModelType::Xl320);
        let mut robot = Robot::with_clock(config, sim, Arc::new(ManualClock::new())).unwrap();
        robot
            .move_sync(&MoveRequest::pose(&[(1u8, 120.0)], 500))
            .unwrap();

        let table = ModelType::Xl320.control_table();
        assert_eq!(
            robot.transport().register(1, table.goal_position),
            Some(ModelType::Xl320.degree_to_native(100.0) as u32)
        );

        // Negative native goals must not wrap when range checks are off
        robot
            .move_single(
                &MoveRequest::new()
                    .target(1u8, -5.0)
                    .units(Units::Native)
                    .check_range(false),
            )
            .unwrap();
        assert_eq!(robot.transport().register(1, table.goal_position), Some(0));
        let MotionRegisters::Speed { moving_speed, .. } = table.motion else {
            unreachable!()
        };
        assert_eq!(robot.transport().register(1, moving_speed), Some(100));
    }
}
