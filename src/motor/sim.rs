// In-memory servo bus
//
// Keeps a control table per motor, records every transaction and can be told
// to fail specific operations. Goal-position writes complete after a
// configurable number of moving-flag polls.

use std::collections::BTreeMap;

use tracing::debug;

use super::model::{ControlTable, ModelType, Register};
use super::transport::{BusError, Result, Transport};
use crate::config::RobotConfig;

const MEMORY_SIZE: usize = 256;

/// One recorded bus transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Transaction {
    Open,
    SetBaudRate(u32),
    Ping { id: u8 },
    Read { id: u8, address: u16, length: u16 },
    Write { id: u8, address: u16, data: Vec<u8> },
    SyncRead { address: u16, length: u16, ids: Vec<u8> },
    SyncWrite { address: u16, length: u16, data: Vec<(u8, Vec<u8>)> },
    Close,
}

#[derive(Debug)]
struct SimMotor {
    reported_model: u16,
    table: &'static ControlTable,
    memory: Vec<u8>,
    polls_until_stopped: u32,
    stuck: bool,
}

impl SimMotor {
    fn load(&self, register: Register) -> u32 {
        let start = register.address as usize;
        register
            .decode(&self.memory[start..start + register.width as usize])
            .unwrap_or(0)
    }

    fn store(&mut self, register: Register, value: u32) {
        let start = register.address as usize;
        let bytes = register.encode(value);
        self.memory[start..start + bytes.len()].copy_from_slice(&bytes);
    }

    fn finish_motion(&mut self) {
        let goal = self.load(self.table.goal_position);
        self.store(self.table.present_position, goal);
        self.store(self.table.moving, 0);
    }

    /// Called whenever the moving flag is polled
    fn tick(&mut self) {
        if self.stuck || self.load(self.table.moving) == 0 {
            return;
        }
        if self.polls_until_stopped <= 1 {
            self.polls_until_stopped = 0;
            self.finish_motion();
        } else {
            self.polls_until_stopped -= 1;
        }
    }
}

/// Simulated Dynamixel bus
#[derive(Debug, Default)]
pub struct SimulatedBus {
    motors: BTreeMap<u8, SimMotor>,
    open: bool,
    baud_rate: Option<u32>,
    motion_polls: u32,
    log: Vec<Transaction>,
    fail_open: bool,
    fail_baud_rate: bool,
    failing_sync_writes: u32,
    failing_sync_reads: u32,
    failing_reads: u32,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated bus holding every motor named in a configuration.
    /// Motors with an unsupported model code are left off the bus.
    pub fn from_config(config: &RobotConfig) -> Self {
        config.motors.values().fold(Self::new(), |bus, motor| {
            match ModelType::from_code(motor.model) {
                Some(model) => bus.with_motor(motor.id, model),
                None => bus,
            }
        })
    }

    /// Add a motor of the given model, resting at 0 degrees
    pub fn with_motor(mut self, id: u8, model: ModelType) -> Self {
        let table = model.control_table();
        let mut motor = SimMotor {
            reported_model: model.code(),
            table,
            memory: vec![0; MEMORY_SIZE],
            polls_until_stopped: 0,
            stuck: false,
        };
        let center = model.center() as u32;
        motor.store(table.goal_position, center);
        motor.store(table.present_position, center);
        self.motors.insert(id, motor);
        self
    }

    /// Make a motor report a different model number on ping
    pub fn with_reported_model(mut self, id: u8, model_number: u16) -> Self {
        if let Some(motor) = self.motors.get_mut(&id) {
            motor.reported_model = model_number;
        }
        self
    }

    /// Number of moving-flag polls a move takes before the motor stops
    pub fn with_motion_polls(mut self, polls: u32) -> Self {
        self.motion_polls = polls;
        self
    }

    /// The motor never reports that it stopped
    pub fn with_stuck_motor(mut self, id: u8) -> Self {
        if let Some(motor) = self.motors.get_mut(&id) {
            motor.stuck = true;
        }
        self
    }

    pub fn with_failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn with_failing_baud_rate(mut self) -> Self {
        self.fail_baud_rate = true;
        self
    }

    /// Fail the next `count` sync writes
    pub fn fail_sync_writes(&mut self, count: u32) {
        self.failing_sync_writes = count;
    }

    /// Fail the next `count` sync reads
    pub fn fail_sync_reads(&mut self, count: u32) {
        self.failing_sync_reads = count;
    }

    /// Fail the next `count` single-motor reads
    pub fn fail_reads(&mut self, count: u32) {
        self.failing_reads = count;
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.log
    }

    pub fn clear_transactions(&mut self) {
        self.log.clear();
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn baud_rate(&self) -> Option<u32> {
        self.baud_rate
    }

    /// Current value of a register
    pub fn register(&self, id: u8, register: Register) -> Option<u32> {
        self.motors.get(&id).map(|m| m.load(register))
    }

    /// Overwrite a register, e.g. to simulate a motor moved by hand
    pub fn set_register(&mut self, id: u8, register: Register, value: u32) {
        if let Some(motor) = self.motors.get_mut(&id) {
            motor.store(register, value);
        }
    }

    /// All sync writes sent to a register address, oldest first
    pub fn sync_writes_to(&self, address: u16) -> Vec<&[(u8, Vec<u8>)]> {
        self.log
            .iter()
            .filter_map(|t| match t {
                Transaction::SyncWrite { address: a, data, .. } if *a == address => {
                    Some(data.as_slice())
                }
                _ => None,
            })
            .collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open { Ok(()) } else { Err(BusError::NotOpen) }
    }

    fn motor_mut(&mut self, id: u8) -> Result<&mut SimMotor> {
        self.motors.get_mut(&id).ok_or(BusError::Timeout { id })
    }

    fn check_range(id: u8, address: u16, length: usize) -> Result<()> {
        if address as usize + length > MEMORY_SIZE {
            return Err(BusError::InvalidResponse {
                id,
                reason: format!("address {} + {} out of range", address, length),
            });
        }
        Ok(())
    }

    fn apply_write(&mut self, id: u8, address: u16, data: &[u8]) -> Result<()> {
        Self::check_range(id, address, data.len())?;
        let motion_polls = self.motion_polls;
        let motor = self.motor_mut(id)?;
        let start = address as usize;
        motor.memory[start..start + data.len()].copy_from_slice(data);

        if address == motor.table.goal_position.address {
            if motion_polls == 0 && !motor.stuck {
                motor.finish_motion();
            } else {
                motor.polls_until_stopped = motion_polls;
                motor.store(motor.table.moving, 1);
            }
        }
        Ok(())
    }

    fn read_memory(&mut self, id: u8, address: u16, length: u16) -> Result<Vec<u8>> {
        Self::check_range(id, address, length as usize)?;
        let motor = self.motor_mut(id)?;
        if address == motor.table.moving.address {
            motor.tick();
        }
        let start = address as usize;
        Ok(motor.memory[start..start + length as usize].to_vec())
    }
}

impl Transport for SimulatedBus {
    fn open(&mut self) -> Result<()> {
        self.log.push(Transaction::Open);
        if self.fail_open {
            return Err(BusError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "simulated port unavailable",
            )));
        }
        self.open = true;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.ensure_open()?;
        self.log.push(Transaction::SetBaudRate(baud_rate));
        if self.fail_baud_rate {
            return Err(BusError::TxFailed(format!("baud rate {} rejected", baud_rate)));
        }
        self.baud_rate = Some(baud_rate);
        Ok(())
    }

    fn ping(&mut self, id: u8) -> Result<u16> {
        self.ensure_open()?;
        self.log.push(Transaction::Ping { id });
        Ok(self.motor_mut(id)?.reported_model)
    }

    fn read(&mut self, id: u8, address: u16, length: u16) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.log.push(Transaction::Read { id, address, length });
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(BusError::Timeout { id });
        }
        self.read_memory(id, address, length)
    }

    fn write(&mut self, id: u8, address: u16, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.log.push(Transaction::Write {
            id,
            address,
            data: data.to_vec(),
        });
        self.apply_write(id, address, data)
    }

    fn sync_read(&mut self, address: u16, length: u16, ids: &[u8]) -> Result<BTreeMap<u8, Vec<u8>>> {
        self.ensure_open()?;
        self.log.push(Transaction::SyncRead {
            address,
            length,
            ids: ids.to_vec(),
        });
        if self.failing_sync_reads > 0 {
            self.failing_sync_reads -= 1;
            return Err(BusError::TxFailed("simulated sync read failure".to_string()));
        }
        ids.iter()
            .map(|&id| -> Result<(u8, Vec<u8>)> { Ok((id, self.read_memory(id, address, length)?)) })
            .collect()
    }

    fn sync_write(&mut self, address: u16, length: u16, data: &[(u8, Vec<u8>)]) -> Result<()> {
        self.ensure_open()?;
        self.log.push(Transaction::SyncWrite {
            address,
            length,
            data: data.to_vec(),
        });
        if self.failing_sync_writes > 0 {
            self.failing_sync_writes -= 1;
            return Err(BusError::TxFailed("simulated sync write failure".to_string()));
        }
        for (id, bytes) in data {
            self.apply_write(*id, address, bytes)?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.log.push(Transaction::Close);
        if self.open {
            debug!("Simulated bus closed");
        }
        self.open = false;
    }
}
