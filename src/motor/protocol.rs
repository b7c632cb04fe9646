// Dynamixel Protocol 2.0 over a serial port
//
// Instruction packet: [0xFF, 0xFF, 0xFD, 0x00, ID, LEN_L, LEN_H, Instruction, Params..., CRC_L, CRC_H]
// Status packet:      [0xFF, 0xFF, 0xFD, 0x00, ID, LEN_L, LEN_H, 0x55, Error, Params..., CRC_L, CRC_H]
// LEN counts everything after itself (instruction, params, CRC).

use serialport::{self, SerialPort};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

use super::transport::{BusError, Result, Transport};

/// Default serial configuration for Dynamixel motors
pub const DEFAULT_BAUDRATE: u32 = 57_600;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Broadcast ID, used by sync instructions
pub const BROADCAST_ID: u8 = 0xFE;

/// Packet header bytes
const HEADER: [u8; 4] = [0xFF, 0xFF, 0xFD, 0x00];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    Status = 0x55,
    SyncRead = 0x82,
    SyncWrite = 0x83,
}

/// CRC16 lookup table (polynomial 0x8005)
static CRC_TABLE: [u16; 256] = [
    0x0000, 0x8005, 0x800F, 0x000A, 0x801B, 0x001E, 0x0014, 0x8011, 0x8033, 0x0036, 0x003C, 0x8039,
    0x0028, 0x802D, 0x8027, 0x0022, 0x8063, 0x0066, 0x006C, 0x8069, 0x0078, 0x807D, 0x8077, 0x0072,
    0x0050, 0x8055, 0x805F, 0x005A, 0x804B, 0x004E, 0x0044, 0x8041, 0x80C3, 0x00C6, 0x00CC, 0x80C9,
    0x00D8, 0x80DD, 0x80D7, 0x00D2, 0x00F0, 0x80F5, 0x80FF, 0x00FA, 0x80EB, 0x00EE, 0x00E4, 0x80E1,
    0x00A0, 0x80A5, 0x80AF, 0x00AA, 0x80BB, 0x00BE, 0x00B4, 0x80B1, 0x8093, 0x0096, 0x009C, 0x8099,
    0x0088, 0x808D, 0x8087, 0x0082, 0x8183, 0x0186, 0x018C, 0x8189, 0x0198, 0x819D, 0x8197, 0x0192,
    0x01B0, 0x81B5, 0x81BF, 0x01BA, 0x81AB, 0x01AE, 0x01A4, 0x81A1, 0x01E0, 0x81E5, 0x81EF, 0x01EA,
    0x81FB, 0x01FE, 0x01F4, 0x81F1, 0x81D3, 0x01D6, 0x01DC, 0x81D9, 0x01C8, 0x81CD, 0x81C7, 0x01C2,
    0x0140, 0x8145, 0x814F, 0x014A, 0x815B, 0x015E, 0x0154, 0x8151, 0x8173, 0x0176, 0x017C, 0x8179,
    0x0168, 0x816D, 0x8167, 0x0162, 0x8123, 0x0126, 0x012C, 0x8129, 0x0138, 0x813D, 0x8137, 0x0132,
    0x0110, 0x8115, 0x811F, 0x011A, 0x810B, 0x010E, 0x0104, 0x8101, 0x8303, 0x0306, 0x030C, 0x8309,
    0x0318, 0x831D, 0x8317, 0x0312, 0x0330, 0x8335, 0x833F, 0x033A, 0x832B, 0x032E, 0x0324, 0x8321,
    0x0360, 0x8365, 0x836F, 0x036A, 0x837B, 0x037E, 0x0374, 0x8371, 0x8353, 0x0356, 0x035C, 0x8359,
    0x0348, 0x834D, 0x8347, 0x0342, 0x03C0, 0x83C5, 0x83CF, 0x03CA, 0x83DB, 0x03DE, 0x03D4, 0x83D1,
    0x83F3, 0x03F6, 0x03FC, 0x83F9, 0x03E8, 0x83ED, 0x83E7, 0x03E2, 0x83A3, 0x03A6, 0x03AC, 0x83A9,
    0x03B8, 0x83BD, 0x83B7, 0x03B2, 0x0390, 0x8395, 0x839F, 0x039A, 0x838B, 0x038E, 0x0384, 0x8381,
    0x0280, 0x8285, 0x828F, 0x028A, 0x829B, 0x029E, 0x0294, 0x8291, 0x82B3, 0x02B6, 0x02BC, 0x82B9,
    0x02A8, 0x82AD, 0x82A7, 0x02A2, 0x82E3, 0x02E6, 0x02EC, 0x82E9, 0x02F8, 0x82FD, 0x82F7, 0x02F2,
    0x02D0, 0x82D5, 0x82DF, 0x02DA, 0x82CB, 0x02CE, 0x02C4, 0x82C1, 0x8243, 0x0246, 0x024C, 0x8249,
    0x0258, 0x825D, 0x8257, 0x0252, 0x0270, 0x8275, 0x827F, 0x027A, 0x826B, 0x026E, 0x0264, 0x8261,
    0x0220, 0x8225, 0x822F, 0x022A, 0x823B, 0x023E, 0x0234, 0x8231, 0x8213, 0x0216, 0x021C, 0x8219,
    0x0208, 0x820D, 0x8207, 0x0202,
];

/// Calculate CRC16 over a packet (header included, CRC excluded)
fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let idx = ((crc >> 8) ^ byte as u16) as u8;
        (crc << 8) ^ CRC_TABLE[idx as usize]
    })
}

/// Insert 0xFD after every 0xFF 0xFF 0xFD so the body never mimics a header
fn stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 4);
    for &byte in body {
        out.push(byte);
        let n = out.len();
        if n >= 3 && out[n - 3..] == [0xFF, 0xFF, 0xFD] {
            out.push(0xFD);
        }
    }
    out
}

/// Reverse of `stuff`
fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        out.push(body[i]);
        let n = out.len();
        if n >= 3 && out[n - 3..] == [0xFF, 0xFF, 0xFD] && body.get(i + 1) == Some(&0xFD) {
            i += 1; // drop the stuffing byte
        }
        i += 1;
    }
    out
}

/// Build a packet with header, length and CRC
pub fn encode_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(params.len() + 1);
    body.push(instruction as u8);
    body.extend_from_slice(params);
    let body = stuff(&body);

    let length = (body.len() + 2) as u16; // body + crc
    let mut packet = Vec::with_capacity(7 + body.len() + 2);
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.extend_from_slice(&length.to_le_bytes());
    packet.extend_from_slice(&body);

    let crc = crc16(&packet);
    packet.extend_from_slice(&crc.to_le_bytes());
    packet
}

/// Parsed status packet
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPacket {
    pub id: u8,
    /// Raw error byte. Bit 7 is the hardware alert flag.
    pub error: u8,
    pub params: Vec<u8>,
}

/// Parse and verify a complete status packet
pub fn decode_status(packet: &[u8], expected_id: u8) -> Result<StatusPacket> {
    if packet.len() < 11 || packet[..4] != HEADER {
        return Err(BusError::InvalidResponse {
            id: expected_id,
            reason: format!("Invalid header: {:02X?}", &packet[..packet.len().min(4)]),
        });
    }

    let id = packet[4];
    let length = u16::from_le_bytes([packet[5], packet[6]]) as usize;
    if packet.len() != 7 + length {
        return Err(BusError::InvalidResponse {
            id,
            reason: format!("Length field {} does not match {} bytes", length, packet.len()),
        });
    }

    let crc_at = packet.len() - 2;
    let expected_crc = crc16(&packet[..crc_at]);
    let received_crc = u16::from_le_bytes([packet[crc_at], packet[crc_at + 1]]);
    if expected_crc != received_crc {
        return Err(BusError::CrcMismatch { id });
    }

    if id != expected_id {
        return Err(BusError::InvalidResponse {
            id: expected_id,
            reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
        });
    }

    if packet[7] != Instruction::Status as u8 {
        return Err(BusError::InvalidResponse {
            id,
            reason: format!("Expected status instruction, got 0x{:02X}", packet[7]),
        });
    }

    let error = packet[8];
    if error & 0x7F != 0 {
        return Err(BusError::MotorError { id, status: error });
    }

    Ok(StatusPacket {
        id,
        error,
        params: unstuff(&packet[9..crc_at]),
    })
}

/// Dynamixel bus on a serial port
pub struct SerialBus {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialBus {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: DEFAULT_BAUDRATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            port: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(BusError::NotOpen)
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        let port = self.port()?;
        // Drop stale bytes from an earlier timed-out exchange
        port.clear(serialport::ClearBuffer::Input)?;
        port.write_all(packet)?;
        port.flush()?;
        Ok(())
    }

    fn read_status(&mut self, expected_id: u8) -> Result<StatusPacket> {
        let port = self.port()?;

        let mut head = [0u8; 7];
        port.read_exact(&mut head).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                BusError::Timeout { id: expected_id }
            } else {
                BusError::Io(e)
            }
        })?;

        let length = u16::from_le_bytes([head[5], head[6]]) as usize;
        let mut packet = head.to_vec();
        packet.resize(7 + length, 0);
        port.read_exact(&mut packet[7..]).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                BusError::Timeout { id: expected_id }
            } else {
                BusError::Io(e)
            }
        })?;

        decode_status(&packet, expected_id)
    }

    fn transact(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<StatusPacket> {
        let packet = encode_packet(id, instruction, params);
        self.send_packet(&packet)?;
        self.read_status(id)
    }
}

impl Transport for SerialBus {
    fn open(&mut self) -> Result<()> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(self.timeout)
            .open()?;
        self.port = Some(port);
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.port()?.set_baud_rate(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn ping(&mut self, id: u8) -> Result<u16> {
        let status = self.transact(id, Instruction::Ping, &[])?;
        if status.params.len() < 2 {
            return Err(BusError::InvalidResponse {
                id,
                reason: format!("Ping reply too short: {} bytes", status.params.len()),
            });
        }
        Ok(u16::from_le_bytes([status.params[0], status.params[1]]))
    }

    fn read(&mut self, id: u8, address: u16, length: u16) -> Result<Vec<u8>> {
        let mut params = Vec::with_capacity(4);
        params.extend_from_slice(&address.to_le_bytes());
        params.extend_from_slice(&length.to_le_bytes());
        let status = self.transact(id, Instruction::Read, &params)?;
        if status.params.len() < length as usize {
            return Err(BusError::InvalidResponse {
                id,
                reason: format!("Expected {} bytes, got {}", length, status.params.len()),
            });
        }
        Ok(status.params)
    }

    fn write(&mut self, id: u8, address: u16, data: &[u8]) -> Result<()> {
        let mut params = Vec::with_capacity(2 + data.len());
        params.extend_from_slice(&address.to_le_bytes());
        params.extend_from_slice(data);
        debug!("Write to motor {}: addr={}, data={:02X?}", id, address, data);
        self.transact(id, Instruction::Write, &params)?;
        Ok(())
    }

    fn sync_read(&mut self, address: u16, length: u16, ids: &[u8]) -> Result<BTreeMap<u8, Vec<u8>>> {
        let mut params = Vec::with_capacity(4 + ids.len());
        params.extend_from_slice(&address.to_le_bytes());
        params.extend_from_slice(&length.to_le_bytes());
        params.extend_from_slice(ids);
        let packet = encode_packet(BROADCAST_ID, Instruction::SyncRead, &params);
        self.send_packet(&packet)?;

        // Motors answer one after another, in request order
        let mut results = BTreeMap::new();
        for &id in ids {
            let status = self.read_status(id)?;
            results.insert(id, status.params);
        }
        Ok(results)
    }

    fn sync_write(&mut self, address: u16, length: u16, data: &[(u8, Vec<u8>)]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut params = Vec::with_capacity(4 + data.len() * (1 + length as usize));
        params.extend_from_slice(&address.to_le_bytes());
        params.extend_from_slice(&length.to_le_bytes());
        for (id, bytes) in data {
            if bytes.len() != length as usize {
                return Err(BusError::GroupParam {
                    id: *id,
                    reason: format!("expected {} bytes, got {}", length, bytes.len()),
                });
            }
            params.push(*id);
            params.extend_from_slice(bytes);
        }

        let packet = encode_packet(BROADCAST_ID, Instruction::SyncWrite, &params);
        debug!("Sync write to {} motors: addr={}", data.len(), address);
        // Broadcast instructions get no status reply
        self.send_packet(&packet)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.port_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_packet() {
        // Reference ping for ID 1
        let packet = encode_packet(1, Instruction::Ping, &[]);
        assert_eq!(
            packet,
            vec![0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E]
        );
    }

    #[test]
    fn test_crc_changes_with_payload() {
        let a = encode_packet(1, Instruction::Read, &[132, 0, 4, 0]);
        let b = encode_packet(1, Instruction::Read, &[132, 0, 2, 0]);
        assert_ne!(a[a.len() - 2..], b[b.len() - 2..]);
    }

    #[test]
    fn test_byte_stuffing() {
        assert_eq!(
            stuff(&[0x03, 0xFF, 0xFF, 0xFD, 0x01]),
            vec![0x03, 0xFF, 0xFF, 0xFD, 0xFD, 0x01]
        );
        assert_eq!(
            unstuff(&[0x03, 0xFF, 0xFF, 0xFD, 0xFD, 0x01]),
            vec![0x03, 0xFF, 0xFF, 0xFD, 0x01]
        );
    }

    fn status_packet(id: u8, error: u8, params: &[u8]) -> Vec<u8> {
        let mut body = vec![error];
        body.extend_from_slice(params);
        encode_packet(id, Instruction::Status, &body)
    }

    #[test]
    fn test_decode_status() {
        let packet = status_packet(5, 0x00, &[0xB0, 0x04, 0x2E]);
        let status = decode_status(&packet, 5).unwrap();
        assert_eq!(status.params, vec![0xB0, 0x04, 0x2E]);
        assert_eq!(u16::from_le_bytes([status.params[0], status.params[1]]), 1200);
    }

    #[test]
    fn test_decode_status_alert_is_not_an_error() {
        let packet = status_packet(5, 0x80, &[1]);
        assert!(decode_status(&packet, 5).is_ok());
    }

    #[test]
    fn test_decode_status_errors() {
        let packet = status_packet(5, 0x02, &[]);
        assert!(matches!(
            decode_status(&packet, 5),
            Err(BusError::MotorError { id: 5, status: 0x02 })
        ));

        let packet = status_packet(6, 0x00, &[]);
        assert!(matches!(
            decode_status(&packet, 5),
            Err(BusError::InvalidResponse { id: 5, .. })
        ));

        let mut corrupted = status_packet(5, 0x00, &[1, 2]);
        corrupted[9] ^= 0xFF;
        assert!(matches!(
            decode_status(&corrupted, 5),
            Err(BusError::CrcMismatch { id: 5 })
        ));
    }

    #[test]
    fn test_closed_bus_reports_not_open() {
        let mut bus = SerialBus::new("/dev/null-servo");
        assert!(matches!(bus.ping(1), Err(BusError::NotOpen)));
    }
}
