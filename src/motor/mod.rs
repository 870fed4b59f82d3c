// Motor access for the arm joints
//
// Provides:
// - `Motor`: the capability interface shared by raw handles and calibrated wrappers
// - Feetech STS serial protocol and a servo handle on top of it
// - Remote handles reached through the zenoh joint bridge
// - A simulated axis for running without hardware

pub mod feetech;
#[cfg(test)]
pub(crate) mod mock;
pub mod remote;
mod servo;
pub mod sim;

pub use feetech::{FeetechBus, FeetechError};
pub use remote::{RemoteLink, RemoteMotor, RemotePower, RemoteSensor};
pub use servo::{ServoMotor, SharedBus};
pub use sim::{SimAxis, SimColorSensor, SimMotor, SimTouchSensor};

use serde::{Deserialize, Serialize};

/// Commanded speeds are a percentage of the motor's maximum speed
pub const MAX_SPEED_PERCENT: i32 = 100;

/// What a motor does when told to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    /// Actively hold the current position
    #[default]
    Brake,
    /// Release torque and let the joint spin freely
    Coast,
}

/// Live status of a motor, as used by stall-based calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MotorStatus {
    pub running: bool,
    pub stalled: bool,
    pub overloaded: bool,
}

impl MotorStatus {
    /// Mechanical end of travel reached
    pub fn is_blocked(&self) -> bool {
        self.stalled || self.overloaded
    }
}

/// Errors surfaced by any motor or sensor handle
///
/// Serializable so that failures on the bridge host reach the controller unchanged.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MotorError {
    #[error("Device {port} unavailable: {reason}")]
    DeviceUnavailable { port: String, reason: String },

    #[error("Protocol error on {port}: {reason}")]
    Protocol { port: String, reason: String },

    #[error("{port} does not support {operation}")]
    NotSupported { port: String, operation: String },

    #[error("Target position {target} outside range [{min}, {max}]")]
    InvalidRange { target: i32, min: i32, max: i32 },

    #[error("Timeout waiting for {port} to finish its motion")]
    Timeout { port: String },
}

impl MotorError {
    /// Transport or hardware is gone; the joint must not be commanded again
    pub fn is_unavailable(&self) -> bool {
        matches!(self, MotorError::DeviceUnavailable { .. })
    }

    pub fn unavailable(port: &str, reason: impl ToString) -> Self {
        MotorError::DeviceUnavailable {
            port: port.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(port: &str, reason: impl ToString) -> Self {
        MotorError::Protocol {
            port: port.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn not_supported(port: &str, operation: &str) -> Self {
        MotorError::NotSupported {
            port: port.to_string(),
            operation: operation.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MotorError>;

/// Capability interface of a physical (or simulated, or remote) motor.
///
/// Implemented both by raw handles and by `CalibratedMotor`, which forwards
/// the same operations to the handle(s) it wraps.
pub trait Motor: Send {
    /// Port (or joint) name used in logs and errors
    fn port(&self) -> &str;

    /// Continuous rotation; sign is direction, magnitude a percentage of max speed
    fn on(&mut self, speed: i32) -> Result<()>;

    /// Bounded motion to an absolute tick position
    fn on_to_position(&mut self, speed: i32, ticks: i32, brake: bool, wait: bool) -> Result<()>;

    /// Halt, applying the configured stop action
    fn stop(&mut self) -> Result<()>;

    /// Redefine the current physical position as tick 0
    fn reset(&mut self) -> Result<()>;

    /// Current position in ticks
    fn position(&mut self) -> Result<i32>;

    /// Whether a commanded motion is currently executing
    fn is_running(&mut self) -> Result<bool>;

    fn status(&mut self) -> Result<MotorStatus>;

    fn set_stop_action(&mut self, action: StopAction) -> Result<()>;
}

/// Color sensor used to find a joint's zero point
pub trait ColorSensor: Send {
    fn color(&mut self) -> Result<i32>;
}

/// Touch sensor used to find a joint's zero point
pub trait TouchSensor: Send {
    fn is_pressed(&mut self) -> Result<bool>;
}

/// Clamp a signed speed percentage to a safe ceiling
pub fn clamp_speed(speed: i32, ceiling: i32) -> i32 {
    let ceiling = ceiling.clamp(0, MAX_SPEED_PERCENT);
    speed.clamp(-ceiling, ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_speed() {
        assert_eq!(clamp_speed(50, 80), 50);
        assert_eq!(clamp_speed(120, 80), 80);
        assert_eq!(clamp_speed(-120, 80), -80);
        // Ceiling itself never exceeds 100%
        assert_eq!(clamp_speed(150, 200), 100);
    }

    #[test]
    fn test_blocked_status() {
        assert!(!MotorStatus::default().is_blocked());
        let stalled = MotorStatus {
            running: true,
            stalled: true,
            overloaded: false,
        };
        assert!(stalled.is_blocked());
    }

    #[test]
    fn test_error_roundtrips_as_json() {
        let err = MotorError::unavailable("A", "link down");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("device_unavailable"));
        let back: MotorError = serde_json::from_str(&json).unwrap();
        assert!(back.is_unavailable());
    }
}
