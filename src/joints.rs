// The arm's logical joints and the operations that span all of them:
// ordered calibration, recentering, reset, and the shutdown stop sweep
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::AtomicBool;
use tracing::{error, info, warn};

use crate::calibration::{CalibratedMotor, CalibrationError, CalibrationParams};
use crate::config::{SPEED_FAST, SPEED_NORMAL, SPEED_SLOW};
use crate::control::Policy;
use crate::motor::{Motor, MotorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JointId {
    Waist,
    Shoulder,
    Elbow,
    Roll,
    Pitch,
    Spin,
    Grabber,
}

impl JointId {
    /// Order in which the control loop visits joints
    pub const ALL: [JointId; 7] = [
        JointId::Waist,
        JointId::Shoulder,
        JointId::Elbow,
        JointId::Roll,
        JointId::Pitch,
        JointId::Spin,
        JointId::Grabber,
    ];

    /// Base outward, so an outer joint never swings at unknown range
    pub const CALIBRATION_ORDER: [JointId; 5] = [
        JointId::Shoulder,
        JointId::Elbow,
        JointId::Waist,
        JointId::Pitch,
        JointId::Grabber,
    ];

    pub const STOP_ORDER: [JointId; 7] = [
        JointId::Waist,
        JointId::Shoulder,
        JointId::Elbow,
        JointId::Pitch,
        JointId::Roll,
        JointId::Spin,
        JointId::Grabber,
    ];

    pub fn name(self) -> &'static str {
        match self {
            JointId::Waist => "waist",
            JointId::Shoulder => "shoulder",
            JointId::Elbow => "elbow",
            JointId::Roll => "roll",
            JointId::Pitch => "pitch",
            JointId::Spin => "spin",
            JointId::Grabber => "grabber",
        }
    }

    /// Driven by a gamepad stick rather than a button pair
    pub fn has_stick(self) -> bool {
        matches!(self, JointId::Shoulder | JointId::Elbow)
    }

    /// Calibration sequence, with roll slotted in after the shoulder when asked for
    pub fn calibration_order(include_roll: bool) -> Vec<JointId> {
        let mut order = Vec::with_capacity(6);
        for id in Self::CALIBRATION_ORDER {
            order.push(id);
            if include_roll && id == JointId::Shoulder {
                order.push(JointId::Roll);
            }
        }
        order
    }
}

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a joint goes when the arm is recentered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Home {
    Center,
    Zero,
}

// Proximal joints first and awaited, the wrist in parallel, the waist last
const RECENTER_PLAN: [(JointId, i32, Home, bool); 7] = [
    (JointId::Shoulder, SPEED_SLOW, Home::Center, true),
    (JointId::Elbow, SPEED_SLOW, Home::Center, true),
    (JointId::Roll, SPEED_NORMAL, Home::Center, false),
    (JointId::Pitch, SPEED_NORMAL, Home::Zero, false),
    (JointId::Spin, SPEED_NORMAL, Home::Center, false),
    (JointId::Grabber, SPEED_NORMAL, Home::Center, true),
    (JointId::Waist, SPEED_FAST, Home::Center, true),
];

#[derive(Debug, thiserror::Error)]
#[error("Calibration of {joint} failed: {source}")]
pub struct JointCalibrationError {
    pub joint: JointId,
    #[source]
    pub source: CalibrationError,
}

pub struct Joint {
    pub id: JointId,
    pub motor: CalibratedMotor,
    pub policy: Policy,
    enabled: bool,
}

impl Joint {
    pub fn new(id: JointId, motor: CalibratedMotor, policy: Policy) -> Self {
        Self {
            id,
            motor,
            policy,
            enabled: true,
        }
    }

    /// False once the joint has faulted; it receives no further commands except the final stop
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Joints present on this arm, kept in control order
#[derive(Default)]
pub struct JointSet {
    joints: Vec<Joint>,
}

impl JointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a joint, replacing any joint with the same id
    pub fn insert(&mut self, joint: Joint) {
        self.joints.retain(|j| j.id != joint.id);
        self.joints.push(joint);
        self.joints
            .sort_by_key(|j| JointId::ALL.iter().position(|id| *id == j.id));
    }

    pub fn contains(&self, id: JointId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: JointId) -> Option<&Joint> {
        self.joints.iter().find(|j| j.id == id)
    }

    pub fn get_mut(&mut self, id: JointId) -> Option<&mut Joint> {
        self.joints.iter_mut().find(|j| j.id == id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Joint> {
        self.joints.iter_mut()
    }

    pub fn ids(&self) -> Vec<JointId> {
        self.joints.iter().map(|j| j.id).collect()
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn disable(&mut self, id: JointId) {
        if let Some(joint) = self.get_mut(id) {
            joint.enabled = false;
        }
    }

    /// Zero every motor at its current position
    pub fn reset_all(&mut self) -> Vec<(JointId, MotorError)> {
        info!("Resetting motors...");
        let mut failures = Vec::new();
        for joint in self.joints.iter_mut() {
            if let Err(e) = joint.motor.reset() {
                warn!("Failed to reset {}: {}", joint.id, e);
                failures.push((joint.id, e));
            }
        }
        failures
    }

    /// Calibrate joints in the given order, skipping absent, disabled and fixed-range ones.
    ///
    /// The first failure stops every joint and aborts the rest of the sequence.
    pub fn calibrate(
        &mut self,
        order: &[JointId],
        params: &CalibrationParams,
        keep_going: &AtomicBool,
    ) -> Result<(), JointCalibrationError> {
        for &id in order {
            let Some(joint) = self.get_mut(id) else {
                continue;
            };
            if !joint.enabled || joint.motor.is_fixed_range() {
                continue;
            }
            if let Err(source) = joint.motor.calibrate(params, keep_going) {
                error!("Calibration of {} failed, stopping all joints", id);
                self.stop_all();
                return Err(JointCalibrationError { joint: id, source });
            }
        }
        info!("Calibration done");
        Ok(())
    }

    /// Move every enabled joint to its home position
    pub fn recenter(&mut self) -> Vec<(JointId, MotorError)> {
        info!("Moving motors to center...");
        let mut failures = Vec::new();
        for (id, speed, home, wait) in RECENTER_PLAN {
            let Some(joint) = self.get_mut(id) else {
                continue;
            };
            if !joint.enabled {
                continue;
            }
            let target = match home {
                Home::Center => joint.motor.center_ticks(),
                Home::Zero => 0,
            };
            if let Err(e) = joint.motor.on_to_position(speed, target, true, wait) {
                warn!("Failed to center {}: {}", id, e);
                failures.push((id, e));
            }
        }
        failures
    }

    /// Stop every joint exactly once, faulted ones included.
    ///
    /// A failing joint doesn't keep the others from being stopped.
    pub fn stop_all(&mut self) -> Vec<(JointId, MotorError)> {
        let mut failures = Vec::new();
        for id in JointId::STOP_ORDER {
            let Some(joint) = self.get_mut(id) else {
                continue;
            };
            info!("{}..", id);
            if let Err(e) = joint.motor.stop() {
                warn!("Failed to stop {}: {}", id, e);
                failures.push((id, e));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::mock::{Command, MockMotor};
    use std::time::Duration;

    fn joint(id: JointId, mock: &MockMotor, range: i32) -> Joint {
        let motor = CalibratedMotor::limited(id.name(), Box::new(mock.clone()), 30, range);
        let policy = if id.has_stick() {
            Policy::Proportional
        } else {
            Policy::ToLimit { speed: 25 }
        };
        Joint::new(id, motor, policy)
    }

    fn params() -> CalibrationParams {
        CalibrationParams {
            poll_interval: Duration::from_millis(1),
            stall_timeout: Duration::from_millis(100),
            sensor_timeout: Duration::from_millis(100),
            settle: Duration::from_millis(1),
            safety_margin: 5,
        }
    }

    #[test]
    fn test_calibration_order() {
        assert_eq!(
            JointId::calibration_order(false),
            vec![
                JointId::Shoulder,
                JointId::Elbow,
                JointId::Waist,
                JointId::Pitch,
                JointId::Grabber
            ]
        );
        let with_roll = JointId::calibration_order(true);
        assert_eq!(with_roll[1], JointId::Roll);
        assert_eq!(with_roll.len(), 6);
    }

    #[test]
    fn test_joints_kept_in_control_order() {
        let mut set = JointSet::new();
        for id in [JointId::Grabber, JointId::Waist, JointId::Elbow] {
            set.insert(joint(id, &MockMotor::new(id.name()), 400));
        }
        assert_eq!(
            set.ids(),
            vec![JointId::Waist, JointId::Elbow, JointId::Grabber]
        );
    }

    #[test]
    fn test_stop_sweep_survives_unavailable_joint() {
        let mocks: Vec<MockMotor> = JointId::ALL
            .iter()
            .map(|id| MockMotor::new(id.name()))
            .collect();
        let mut set = JointSet::new();
        for (id, mock) in JointId::ALL.iter().zip(&mocks) {
            set.insert(joint(*id, mock, 400));
        }
        // Elbow's link is gone and it was disabled by the loop
        mocks[2].disconnect();
        set.disable(JointId::Elbow);

        let failures = set.stop_all();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, JointId::Elbow);
        assert!(failures[0].1.is_unavailable());
        for mock in &mocks {
            assert_eq!(mock.commands(), vec![Command::Stop]);
        }
    }

    #[test]
    fn test_calibration_runs_in_order_and_skips_static() {
        let shoulder = MockMotor::with_stops("shoulder", -300, 300);
        let elbow = MockMotor::with_stops("elbow", -300, 300);
        let spin = MockMotor::new("spin");
        let mut set = JointSet::new();
        set.insert(joint(JointId::Shoulder, &shoulder, 400));
        set.insert(joint(JointId::Elbow, &elbow, 400));
        set.insert(Joint::new(
            JointId::Spin,
            CalibratedMotor::static_range("spin", Box::new(spin.clone()), 20, 5040),
            Policy::ToLimit { speed: 25 },
        ));

        set.calibrate(&JointId::calibration_order(false), &params(), &AtomicBool::new(true))
            .unwrap();

        assert_eq!(set.get(JointId::Elbow).unwrap().motor.max_pos(), 595);
        assert!(spin.commands().is_empty());
    }

    #[test]
    fn test_calibration_failure_aborts_and_stops_all() {
        // Shoulder never stalls, so elbow must not even start
        let shoulder = MockMotor::new("shoulder");
        let elbow = MockMotor::with_stops("elbow", -300, 300);
        let mut set = JointSet::new();
        set.insert(joint(JointId::Shoulder, &shoulder, 400));
        set.insert(joint(JointId::Elbow, &elbow, 400));

        let err = set
            .calibrate(&JointId::calibration_order(false), &params(), &AtomicBool::new(true))
            .unwrap_err();

        assert_eq!(err.joint, JointId::Shoulder);
        assert!(matches!(err.source, CalibrationError::Timeout { .. }));
        assert_eq!(elbow.commands(), vec![Command::Stop]);
    }

    #[test]
    fn test_recenter_follows_plan() {
        let elbow = MockMotor::new("elbow");
        let pitch = MockMotor::new("pitch");
        let waist = MockMotor::new("waist");
        let mut set = JointSet::new();
        set.insert(joint(JointId::Elbow, &elbow, 400));
        set.insert(joint(JointId::Pitch, &pitch, 400));
        set.insert(joint(JointId::Waist, &waist, 400));
        set.disable(JointId::Waist);

        assert!(set.recenter().is_empty());

        assert_eq!(
            elbow.commands(),
            vec![Command::OnToPosition {
                speed: SPEED_SLOW,
                ticks: 0,
                brake: true,
                wait: true
            }]
        );
        assert_eq!(
            pitch.commands(),
            vec![Command::OnToPosition {
                speed: SPEED_NORMAL,
                ticks: 0,
                brake: true,
                wait: false
            }]
        );
        assert!(waist.commands().is_empty());
    }

    #[test]
    fn test_reset_all_reports_failures() {
        let roll = MockMotor::new("roll");
        let spin = MockMotor::new("spin");
        roll.disconnect();
        let mut set = JointSet::new();
        set.insert(joint(JointId::Roll, &roll, 400));
        set.insert(joint(JointId::Spin, &spin, 400));

        let failures = set.reset_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(spin.commands(), vec![Command::Reset]);
    }
}
