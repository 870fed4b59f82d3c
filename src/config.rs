// Timeouts, topics, speeds and the joint layout of the arm
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::calibration::CalibrationParams;
use crate::control::Policy;
use crate::joints::JointId;
use crate::motor::StopAction;

// Speeds, percent of the motor's max speed
pub const SPEED_FULL: i32 = 100;
pub const SPEED_FAST: i32 = 75;
pub const SPEED_NORMAL: i32 = 50;
pub const SPEED_SLOW: i32 = 25;
pub const SPEED_VERY_SLOW: i32 = 10;

// Calibration timing
pub const CALIBRATION_POLL: Duration = Duration::from_millis(50);
pub const STALL_TIMEOUT: Duration = Duration::from_secs(10);
pub const SENSOR_TIMEOUT: Duration = Duration::from_secs(20);
pub const SET_SETTLE: Duration = Duration::from_secs(1);
pub const SAFETY_MARGIN: i32 = 5; // ticks kept clear of the upper hard stop

// Gamepad sticks report 0..255
pub const STICK_DEADZONE: i32 = 10;
pub const STICK_SCALE_TO: i32 = 80;

// Zenoh key expressions
pub const KEY_BRIDGE: &str = "arm/bridge"; // remote joints, queried per port
pub const TOPIC_HEALTH: &str = "arm/state/health"; // health status
pub const TOPIC_GAMEPAD: &str = "arm/input/gamepad"; // remote gamepad events

// No answer from the bridge within this is a dead link
pub const REMOTE_TIMEOUT: Duration = Duration::from_millis(500);

// Serial port for the Feetech bus carrying the local joints
pub const MOTOR_PORT: &str = "/dev/ttyACM0";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Joint {joint}: {reason}")]
    InvalidJoint { joint: JointId, reason: String },
}

/// How a joint's motors are reached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Wiring {
    /// Servo ids on the local Feetech bus
    Local { ids: Vec<u8> },
    /// Port names on the bridge host
    Remote { ports: Vec<String> },
}

impl Wiring {
    pub fn len(&self) -> usize {
        match self {
            Wiring::Local { ids } => ids.len(),
            Wiring::Remote { ports } => ports.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationKind {
    Limited,
    /// Several motors on one joint; `reference` indexes the member watched for the stall
    LimitedSet { reference: usize },
    /// No calibration, `nominal_range` is split around the start position
    Static,
    /// Zero where the color sensor on bridge port `sensor` reads `target`
    Color { sensor: String, target: i32 },
    /// Zero where the touch sensor on bridge port `sensor` is pressed, range `[0, max]`
    Touch { sensor: String, max: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointConfig {
    pub wiring: Wiring,
    pub calibration: CalibrationKind,
    /// Calibration speed
    pub speed: i32,
    #[serde(default)]
    pub stop_action: StopAction,
    pub policy: Policy,
    /// Range assumed before calibration, and the full range of a static joint
    pub nominal_range: i32,
    /// Run without this joint if its motor can't be reached
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_true")]
    pub center_after_calibration: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JointsConfig {
    pub waist: Option<JointConfig>,
    pub shoulder: Option<JointConfig>,
    pub elbow: Option<JointConfig>,
    pub roll: Option<JointConfig>,
    pub pitch: Option<JointConfig>,
    pub spin: Option<JointConfig>,
    pub grabber: Option<JointConfig>,
}

impl JointsConfig {
    pub fn get(&self, id: JointId) -> Option<&JointConfig> {
        match id {
            JointId::Waist => self.waist.as_ref(),
            JointId::Shoulder => self.shoulder.as_ref(),
            JointId::Elbow => self.elbow.as_ref(),
            JointId::Roll => self.roll.as_ref(),
            JointId::Pitch => self.pitch.as_ref(),
            JointId::Spin => self.spin.as_ref(),
            JointId::Grabber => self.grabber.as_ref(),
        }
    }
}

impl Default for JointsConfig {
    /// Waist, shoulder pair and elbow on the local bus; wrist and grabber on the bridge host.
    /// The waist zeroes where it starts: a servo bus carries no alignment sensor.
    fn default() -> Self {
        let local = |ids: &[u8]| Wiring::Local { ids: ids.to_vec() };
        let remote = |port: &str| Wiring::Remote {
            ports: vec![port.to_string()],
        };
        Self {
            waist: Some(JointConfig {
                wiring: local(&[1]),
                calibration: CalibrationKind::Static,
                speed: 40,
                stop_action: StopAction::Brake,
                policy: Policy::Continuous { speed: SPEED_SLOW },
                nominal_range: 2000,
                optional: false,
                center_after_calibration: true,
            }),
            shoulder: Some(JointConfig {
                wiring: local(&[2, 3]),
                calibration: CalibrationKind::LimitedSet { reference: 1 },
                speed: 30,
                stop_action: StopAction::Brake,
                policy: Policy::Proportional,
                nominal_range: 1000,
                optional: false,
                center_after_calibration: true,
            }),
            elbow: Some(JointConfig {
                wiring: local(&[4]),
                calibration: CalibrationKind::Limited,
                speed: 30,
                stop_action: StopAction::Brake,
                policy: Policy::Proportional,
                nominal_range: 1000,
                optional: false,
                center_after_calibration: true,
            }),
            roll: Some(JointConfig {
                wiring: remote("outA"),
                calibration: CalibrationKind::Limited,
                speed: 30,
                stop_action: StopAction::Brake,
                policy: Policy::ToLimit { speed: SPEED_SLOW },
                nominal_range: 600,
                optional: false,
                center_after_calibration: true,
            }),
            pitch: Some(JointConfig {
                wiring: remote("outB"),
                calibration: CalibrationKind::Limited,
                speed: 10,
                stop_action: StopAction::Coast,
                policy: Policy::Continuous {
                    speed: SPEED_VERY_SLOW,
                },
                nominal_range: 400,
                optional: false,
                center_after_calibration: true,
            }),
            spin: Some(JointConfig {
                wiring: remote("outC"),
                calibration: CalibrationKind::Static,
                speed: 20,
                stop_action: StopAction::Brake,
                policy: Policy::ToLimit { speed: SPEED_SLOW },
                nominal_range: 14 * 360,
                optional: false,
                center_after_calibration: true,
            }),
            grabber: Some(JointConfig {
                wiring: remote("outD"),
                calibration: CalibrationKind::Limited,
                speed: 20,
                stop_action: StopAction::Coast,
                policy: Policy::Continuous {
                    speed: SPEED_NORMAL,
                },
                nominal_range: 600,
                optional: true,
                // Stays open at its maximum
                center_after_calibration: false,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub poll_interval_ms: u64,
    pub stall_timeout_ms: u64,
    pub sensor_timeout_ms: u64,
    pub settle_ms: u64,
    pub safety_margin: i32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: CALIBRATION_POLL.as_millis() as u64,
            stall_timeout_ms: STALL_TIMEOUT.as_millis() as u64,
            sensor_timeout_ms: SENSOR_TIMEOUT.as_millis() as u64,
            settle_ms: SET_SETTLE.as_millis() as u64,
            safety_margin: SAFETY_MARGIN,
        }
    }
}

impl CalibrationConfig {
    pub fn params(&self) -> CalibrationParams {
        CalibrationParams {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stall_timeout: Duration::from_millis(self.stall_timeout_ms),
            sensor_timeout: Duration::from_millis(self.sensor_timeout_ms),
            settle: Duration::from_millis(self.settle_ms),
            safety_margin: self.safety_margin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StickConfig {
    pub deadzone: i32,
    pub scale_to: i32,
}

impl Default for StickConfig {
    fn default() -> Self {
        Self {
            deadzone: STICK_DEADZONE,
            scale_to: STICK_SCALE_TO,
        }
    }
}

/// A motor served by the bridge host: its port name and servo id on the host's bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgePort {
    pub name: String,
    pub id: u8,
}

/// Ports the bridge host serves
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub motors: Vec<BridgePort>,
    pub color_sensors: Vec<String>,
    pub touch_sensors: Vec<String>,
    /// Travel of each simulated motor
    pub sim_travel: i32,
    /// Color simulated sensors report
    pub sim_color: i32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let motors = ["outA", "outB", "outC", "outD"]
            .iter()
            .zip(1..)
            .map(|(name, id)| BridgePort {
                name: name.to_string(),
                id,
            })
            .collect();
        Self {
            motors,
            color_sensors: Vec::new(),
            touch_sensors: Vec::new(),
            sim_travel: 600,
            sim_color: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArmConfig {
    pub serial_port: String,
    /// Control loop rate; 0 polls as fast as the motors answer
    pub loop_hz: u32,
    pub remote_timeout_ms: u64,
    /// Include roll in the calibration sequence, right after the shoulder
    pub calibrate_roll: bool,
    pub calibration: CalibrationConfig,
    pub stick: StickConfig,
    pub joints: JointsConfig,
    pub bridge: BridgeConfig,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            serial_port: MOTOR_PORT.to_string(),
            loop_hz: 0,
            remote_timeout_ms: REMOTE_TIMEOUT.as_millis() as u64,
            calibrate_roll: false,
            calibration: CalibrationConfig::default(),
            stick: StickConfig::default(),
            joints: JointsConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl ArmConfig {
    /// Read a JSON config; missing fields fall back to the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: ArmConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Time between control loop ticks, if any
    pub fn loop_period(&self) -> Option<Duration> {
        (self.loop_hz > 0).then(|| Duration::from_micros(1_000_000 / self.loop_hz as u64))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for id in JointId::ALL {
            let Some(joint) = self.joints.get(id) else {
                continue;
            };
            let invalid = |reason: &str| ConfigError::InvalidJoint {
                joint: id,
                reason: reason.to_string(),
            };

            if joint.wiring.is_empty() {
                return Err(invalid("no motors wired"));
            }
            let proportional = matches!(joint.policy, Policy::Proportional);
            if proportional && !id.has_stick() {
                return Err(invalid("only stick-driven joints can be proportional"));
            }
            if !proportional && id.has_stick() {
                return Err(invalid("stick-driven joints must be proportional"));
            }
            match &joint.calibration {
                CalibrationKind::LimitedSet { reference } if *reference >= joint.wiring.len() => {
                    return Err(invalid("reference member out of range"));
                }
                CalibrationKind::LimitedSet { .. } => {}
                _ if joint.wiring.len() > 1 => {
                    return Err(invalid("several motors need a limited_set calibration"));
                }
                CalibrationKind::Touch { max, .. } if *max <= 0 => {
                    return Err(invalid("touch range must be positive"));
                }
                _ => {}
            }
            if joint.nominal_range <= 0 {
                return Err(invalid("nominal range must be positive"));
            }
        }
        Ok(())
    }
}
