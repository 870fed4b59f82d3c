// Feetech STS3215 serial protocol implementation
//
// Protocol is similar to Dynamixel Protocol 1.0:
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Default serial configuration for Feetech motors
pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 100;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFF];

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Register addresses for STS3215
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    // RAM area (volatile)
    OperatingMode = 33,    // 1 byte: 0=position, 1=velocity, 2=PWM, 3=step
    TorqueEnable = 40,     // 1 byte: 0=off, 1=on
    GoalPosition = 42,     // 2 bytes
    GoalVelocity = 46,     // 2 bytes (signed in velocity mode, speed limit in position mode)
    Lock = 55,             // 1 byte: 0=unlocked, 1=locked
    PresentPosition = 56,  // 2 bytes, read-only
    PresentVelocity = 58,  // 2 bytes, read-only (signed)
    PresentLoad = 60,      // 2 bytes, read-only (bit 10 = direction)
    PresentVoltage = 62,   // 1 byte, read-only, 0.1V units
    Status = 65,           // 1 byte, read-only, fault bits
    Moving = 66,           // 1 byte, read-only
    PresentCurrent = 69,   // 2 bytes, read-only, 6.5mA units
}

/// Operating modes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatingMode {
    Position = 0,
    Velocity = 1,
    Pwm = 2,
    Step = 3,
}

/// Fault bit raised in the status register when the load limit is exceeded
pub const STATUS_OVERLOAD: u8 = 0x20;

/// Error types for Feetech communication
#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from motor {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for motor {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Motor {id} returned error status: 0x{status:02X}")]
    MotorError { id: u8, status: u8 },

    #[error("Timeout waiting for response from motor {id}")]
    Timeout { id: u8 },
}

impl FeetechError {
    /// The bus or the motor did not answer at all
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            FeetechError::Serial(_) | FeetechError::Io(_) | FeetechError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Feetech motor bus - handles serial communication with motors
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

impl FeetechBus {
    /// Open a new connection to the motor bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self { port })
    }

    /// Calculate checksum for a packet (excluding header)
    fn checksum(data: &[u8]) -> u8 {
        let sum: u16 = data.iter().map(|&b| b as u16).sum();
        (!sum & 0xFF) as u8
    }

    /// Build a packet with header and checksum
    fn build_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
        let length = (params.len() + 2) as u8; // params + instruction + checksum
        let mut packet = Vec::with_capacity(6 + params.len());

        packet.extend_from_slice(&HEADER);
        packet.push(id);
        packet.push(length);
        packet.push(instruction as u8);
        packet.extend_from_slice(params);

        let checksum_data = &packet[2..]; // skip header
        packet.push(Self::checksum(checksum_data));

        packet
    }

    fn send_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.port.write_all(packet)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read a status packet and return its parameters
    fn read_response(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut header = [0u8; 2];
        self.port.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id: expected_id }
            } else {
                FeetechError::Io(e)
            }
        })?;

        if header != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", header),
            });
        }

        let mut id_length = [0u8; 2];
        self.port.read_exact(&mut id_length)?;
        let id = id_length[0];
        let length = id_length[1] as usize;

        if id != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: expected {}, got {}", expected_id, id),
            });
        }
        if length < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Length {} too short for a status packet", length),
            });
        }

        // error + params + checksum = length bytes
        let mut remaining = vec![0u8; length];
        self.port.read_exact(&mut remaining)?;
        parse_status(id, length as u8, &remaining)
    }

    /// Ping a motor to check if it's connected
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        let packet = Self::build_packet(id, Instruction::Ping, &[]);
        self.send_packet(&packet)?;

        match self.read_response(id) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        let params = [register as u8, value];
        let packet = Self::build_packet(id, Instruction::Write, &params);
        debug!("Write u8 to motor {}: reg={:?}, value={}", id, register, value);
        self.send_packet(&packet)?;

        let _ = self.read_response(id)?;
        Ok(())
    }

    /// Write two bytes (little-endian) to a register
    pub fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        let params = [register as u8, (value & 0xFF) as u8, (value >> 8) as u8];
        let packet = Self::build_packet(id, Instruction::Write, &params);
        debug!("Write u16 to motor {}: reg={:?}, value={}", id, register, value);
        self.send_packet(&packet)?;

        let _ = self.read_response(id)?;
        Ok(())
    }

    /// Write a signed 16-bit value (for velocity)
    pub fn write_i16(&mut self, id: u8, register: Register, value: i16) -> Result<()> {
        self.write_u16(id, register, encode_sign_magnitude(value, 15))
    }

    pub fn read_u8(&mut self, id: u8, register: Register) -> Result<u8> {
        let params = [register as u8, 1]; // address, length
        let packet = Self::build_packet(id, Instruction::Read, &params);
        self.send_packet(&packet)?;

        let response = self.read_response(id)?;
        response
            .first()
            .copied()
            .ok_or_else(|| FeetechError::InvalidResponse {
                id,
                reason: "Empty response".to_string(),
            })
    }

    /// Read two bytes (little-endian) from a register
    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let params = [register as u8, 2]; // address, length
        let packet = Self::build_packet(id, Instruction::Read, &params);
        self.send_packet(&packet)?;

        let response = self.read_response(id)?;
        if response.len() < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected 2 bytes, got {}", response.len()),
            });
        }
        Ok(u16::from_le_bytes([response[0], response[1]]))
    }

    // === High-level convenience methods ===

    pub fn enable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 1)?;
        self.write_u8(id, Register::Lock, 1)
    }

    /// Disable torque on a motor (joint spins freely)
    pub fn disable_torque(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 0)?;
        self.write_u8(id, Register::Lock, 0)
    }

    /// Set operating mode (must disable torque first)
    pub fn set_operating_mode(&mut self, id: u8, mode: OperatingMode) -> Result<()> {
        self.write_u8(id, Register::OperatingMode, mode as u8)
    }

    /// Set goal velocity for a motor (must be in velocity mode)
    pub fn set_velocity(&mut self, id: u8, velocity: i16) -> Result<()> {
        self.write_i16(id, Register::GoalVelocity, velocity)
    }

    /// Move `steps` away from the present position (must be in step mode).
    /// A zero-length step holds where the motor is.
    pub fn set_step_goal(&mut self, id: u8, steps: i16, speed: u16) -> Result<()> {
        self.write_u16(id, Register::GoalVelocity, speed)?;
        self.write_i16(id, Register::GoalPosition, steps)
    }

    /// Raw encoder reading, 0..4095
    pub fn get_position(&mut self, id: u8) -> Result<u16> {
        Ok(self.read_u16(id, Register::PresentPosition)? & 0x0FFF)
    }

    pub fn get_velocity(&mut self, id: u8) -> Result<i16> {
        let raw = self.read_u16(id, Register::PresentVelocity)?;
        Ok(decode_sign_magnitude(raw, 15))
    }

    /// Present load in per mille of stall torque (signed by direction)
    pub fn get_load(&mut self, id: u8) -> Result<i16> {
        let raw = self.read_u16(id, Register::PresentLoad)?;
        Ok(decode_sign_magnitude(raw, 10))
    }

    pub fn is_moving(&mut self, id: u8) -> Result<bool> {
        Ok(self.read_u8(id, Register::Moving)? != 0)
    }

    pub fn get_status(&mut self, id: u8) -> Result<u8> {
        self.read_u8(id, Register::Status)
    }

    /// Supply voltage in volts
    pub fn get_voltage(&mut self, id: u8) -> Result<f32> {
        Ok(self.read_u8(id, Register::PresentVoltage)? as f32 / 10.0)
    }

    /// Motor current in amps
    pub fn get_current(&mut self, id: u8) -> Result<f32> {
        let raw = self.read_u16(id, Register::PresentCurrent)?;
        Ok(decode_sign_magnitude(raw, 15).unsigned_abs() as f32 * 0.0065)
    }
}

/// Validate a status packet body (error, params..., checksum) and return the params
fn parse_status(id: u8, length: u8, body: &[u8]) -> Result<Vec<u8>> {
    let Some((&received_checksum, rest)) = body.split_last() else {
        return Err(FeetechError::InvalidResponse {
            id,
            reason: "Empty status packet".to_string(),
        });
    };

    let mut checksum_data = vec![id, length];
    checksum_data.extend_from_slice(rest);
    if FeetechBus::checksum(&checksum_data) != received_checksum {
        return Err(FeetechError::ChecksumMismatch { id });
    }

    match rest.split_first() {
        Some((&0, params)) => Ok(params.to_vec()),
        Some((&status, _)) => Err(FeetechError::MotorError { id, status }),
        None => Err(FeetechError::InvalidResponse {
            id,
            reason: "Missing error byte".to_string(),
        }),
    }
}

/// Encode a signed value to sign-magnitude format with the sign at `sign_bit`
fn encode_sign_magnitude(value: i16, sign_bit: u32) -> u16 {
    let mask = (1u16 << sign_bit) - 1;
    let magnitude = value.unsigned_abs() & mask;
    if value >= 0 {
        magnitude
    } else {
        (1 << sign_bit) | magnitude
    }
}

/// Decode sign-magnitude format with the sign at `sign_bit`
fn decode_sign_magnitude(raw: u16, sign_bit: u32) -> i16 {
    let magnitude = (raw & ((1u16 << sign_bit) - 1)) as i16;
    if raw & (1 << sign_bit) != 0 {
        -magnitude
    } else {
        magnitude
    }
}
