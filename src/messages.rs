// Message types exchanged over zenoh:
// - gamepad events from a remote input device -> runtime
// - remote-joint bridge requests/replies between the two controllers
// - health published by the runtime

use serde::{Deserialize, Serialize};

use crate::motor::{MotorError, MotorStatus, StopAction};

/// Kind of a raw gamepad event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Stick,
    Button,
}

/// One raw gamepad event (evdev code and value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEvent {
    pub kind: EventKind,
    pub code: u16,
    pub value: i32,
}

impl InputEvent {
    pub fn stick(code: u16, value: i32) -> Self {
        Self {
            kind: EventKind::Stick,
            code,
            value,
        }
    }

    pub fn button(code: u16, pressed: bool) -> Self {
        Self {
            kind: EventKind::Button,
            code,
            value: pressed as i32,
        }
    }
}

/// Request sent to the bridge host, addressed to one of its ports by key expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeRequest {
    Probe,
    On {
        speed: i32,
    },
    OnToPosition {
        speed: i32,
        ticks: i32,
        brake: bool,
        wait: bool,
    },
    Stop,
    Reset,
    Position,
    IsRunning,
    Status,
    SetStopAction {
        action: StopAction,
    },
    Color,
    IsPressed,
    Power,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "value", rename_all = "snake_case")]
pub enum BridgeReply {
    Done,
    Position(i32),
    Running(bool),
    Status(MotorStatus),
    Color(i32),
    Pressed(bool),
    Power(PowerReading),
}

/// What actually travels back over the bridge
pub type BridgeOutcome = Result<BridgeReply, MotorError>;

/// Battery snapshot of one controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub volts: f32,
    pub amps: f32,
}

/// Health status published by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmHealth {
    Starting,
    Calibrating,
    Running,
    JointFault { joint: String },
    CalibrationFailed,
    Stopped,
}
