// Bus transport interface
//
// The controller only talks to the servos through this trait, so the serial
// implementation can be swapped for the simulator in tests.

use std::collections::BTreeMap;

/// Error types for bus communication
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Port is not open")]
    NotOpen,

    #[error("Invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("CRC mismatch for motor {id}")]
    CrcMismatch { id: u8 },

    #[error("Motor {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },

    #[error("Transmit failed: {0}")]
    TxFailed(String),

    #[error("Group parameter rejected for motor {id}: {reason}")]
    GroupParam { id: u8, reason: String },
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Request/response access to a servo bus
pub trait Transport {
    /// Open the underlying port
    fn open(&mut self) -> Result<()>;

    /// Change the baud rate of an open port
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Ping a motor, returning the model number it reports
    fn ping(&mut self, id: u8) -> Result<u16>;

    /// Read `length` bytes starting at `address`
    fn read(&mut self, id: u8, address: u16, length: u16) -> Result<Vec<u8>>;

    /// Write `data` starting at `address` and wait for the status reply
    fn write(&mut self, id: u8, address: u16, data: &[u8]) -> Result<()>;

    /// Read the same register range from several motors in one transaction
    fn sync_read(&mut self, address: u16, length: u16, ids: &[u8]) -> Result<BTreeMap<u8, Vec<u8>>>;

    /// Write per-motor data to the same register range in one transaction
    fn sync_write(&mut self, address: u16, length: u16, data: &[(u8, Vec<u8>)]) -> Result<()>;

    /// Close the port. Further calls fail with `BusError::NotOpen`.
    fn close(&mut self);
}

/// Transport picked at runtime (serial or simulated)
pub type BoxedTransport = Box<dyn Transport + Send>;

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        (**self).set_baud_rate(baud_rate)
    }

    fn ping(&mut self, id: u8) -> Result<u16> {
        (**self).ping(id)
    }

    fn read(&mut self, id: u8, address: u16, length: u16) -> Result<Vec<u8>> {
        (**self).read(id, address, length)
    }

    fn write(&mut self, id: u8, address: u16, data: &[u8]) -> Result<()> {
        (**self).write(id, address, data)
    }

    fn sync_read(&mut self, address: u16, length: u16, ids: &[u8]) -> Result<BTreeMap<u8, Vec<u8>>> {
        (**self).sync_read(address, length, ids)
    }

    fn sync_write(&mut self, address: u16, length: u16, data: &[(u8, Vec<u8>)]) -> Result<()> {
        (**self).sync_write(address, length, data)
    }

    fn close(&mut self) {
        (**self).close()
    }
}
