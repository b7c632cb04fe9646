// Grouped sync-write builder
//
// Collects one parameter block per motor for a single register range and sends
// them in one bus transaction.

use std::collections::BTreeMap;

use tracing::debug;

use super::model::Register;
use super::transport::{BusError, Result, Transport};

#[derive(Debug)]
pub struct GroupSyncWrite {
    register: Register,
    params: BTreeMap<u8, Vec<u8>>,
}

impl GroupSyncWrite {
    pub fn new(register: Register) -> Self {
        Self {
            register,
            params: BTreeMap::new(),
        }
    }

    /// Queue a value for a motor, encoded at the register's width
    pub fn add_value(&mut self, id: u8, value: u32) -> Result<()> {
        let data = self.register.encode(value);
        self.add_param(id, data)
    }

    /// Queue raw bytes for a motor. Each motor may appear once.
    pub fn add_param(&mut self, id: u8, data: Vec<u8>) -> Result<()> {
        if data.len() != self.register.width as usize {
            return Err(BusError::GroupParam {
                id,
                reason: format!(
                    "expected {} bytes, got {}",
                    self.register.width,
                    data.len()
                ),
            });
        }
        if self.params.contains_key(&id) {
            return Err(BusError::GroupParam {
                id,
                reason: "motor already queued".to_string(),
            });
        }
        self.params.insert(id, data);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn clear(&mut self) {
        self.params.clear();
    }

    /// Transmit every queued parameter. The queue is cleared whether or not the
    /// transmission succeeds.
    pub fn transmit<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<()> {
        if self.params.is_empty() {
            return Ok(());
        }
        let data: Vec<(u8, Vec<u8>)> = std::mem::take(&mut self.params).into_iter().collect();
        debug!(
            "Sync write to {} motors: addr={}, width={}",
            data.len(),
            self.register.address,
            self.register.width
        );
        transport.sync_write(self.register.address, self.register.width, &data)
    }
}
