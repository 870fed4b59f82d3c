// Motor backends and construction of the joint set from config
//
// - SimHardware: every port is a simulated axis with hard stops
// - LiveHardware: local ports are Feetech servos on a serial bus, remote ports
//   and all sensors are reached through the zenoh bridge

use std::collections::HashMap;
use tracing::{info, warn};

use crate::calibration::CalibratedMotor;
use crate::config::{ArmConfig, CalibrationKind, JointConfig, Wiring};
use crate::joints::{Joint, JointId, JointSet};
use crate::motor::{
    self, ColorSensor, FeetechBus, MAX_SPEED_PERCENT, Motor, MotorError, RemoteLink, RemoteMotor,
    RemotePower, RemoteSensor, ServoMotor, SharedBus, SimAxis, SimColorSensor, SimMotor,
    SimTouchSensor, TouchSensor,
};
use crate::telemetry::{PowerMonitor, ServoBusPower, SimPower};

/// Half-width of the simulated color mark, in ticks
const SIM_MARK_WINDOW: i32 = 15;

/// Address of one motor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRef {
    Local(u8),
    Remote(String),
}

impl PortRef {
    pub fn from_wiring(wiring: &Wiring) -> Vec<PortRef> {
        match wiring {
            Wiring::Local { ids } => ids.iter().map(|id| PortRef::Local(*id)).collect(),
            Wiring::Remote { ports } => ports.iter().map(|p| PortRef::Remote(p.clone())).collect(),
        }
    }

    pub fn key(&self) -> String {
        match self {
            PortRef::Local(id) => format!("servo-{}", id),
            PortRef::Remote(port) => port.clone(),
        }
    }
}

/// Source of motor, sensor and power handles
pub trait Hardware {
    /// Bind a motor; `travel` is the joint's nominal range in ticks
    fn motor(&mut self, port: &PortRef, travel: i32) -> motor::Result<Box<dyn Motor>>;

    /// Color sensor used to align the joint driven by `aligned_with`; `target` is
    /// the color it aligns to
    fn color_sensor(
        &mut self,
        port: &str,
        aligned_with: &PortRef,
        target: i32,
    ) -> motor::Result<Box<dyn ColorSensor>>;

    fn touch_sensor(&mut self, port: &str, aligned_with: &PortRef)
    -> motor::Result<Box<dyn TouchSensor>>;

    fn power_monitors(&mut self) -> Vec<Box<dyn PowerMonitor>>;
}

#[derive(Default)]
pub struct SimHardware {
    axes: HashMap<String, SimAxis>,
}

impl SimHardware {
    pub fn new() -> Self {
        Self::default()
    }

    fn axis(&self, port: &PortRef) -> motor::Result<SimAxis> {
        self.axes
            .get(&port.key())
            .cloned()
            .ok_or_else(|| MotorError::unavailable(&port.key(), "no simulated axis"))
    }
}

impl Hardware for SimHardware {
    fn motor(&mut self, port: &PortRef, travel: i32) -> motor::Result<Box<dyn Motor>> {
        let half = travel.abs() / 2;
        let axis = SimAxis::new(-half, half, 0);
        self.axes.insert(port.key(), axis.clone());
        Ok(Box::new(SimMotor::new(&port.key(), axis, MAX_SPEED_PERCENT)))
    }

    fn color_sensor(
        &mut self,
        _port: &str,
        aligned_with: &PortRef,
        target: i32,
    ) -> motor::Result<Box<dyn ColorSensor>> {
        let axis = self.axis(aligned_with)?;
        let (lower, upper) = axis.bounds();
        // Mark sits a little below the start position
        let mark = ((upper - lower) / 8.0) as i32;
        Ok(Box::new(SimColorSensor::new(axis, -mark, SIM_MARK_WINDOW, target)))
    }

    fn touch_sensor(
        &mut self,
        _port: &str,
        aligned_with: &PortRef,
    ) -> motor::Result<Box<dyn TouchSensor>> {
        Ok(Box::new(SimTouchSensor::new(self.axis(aligned_with)?)))
    }

    fn power_monitors(&mut self) -> Vec<Box<dyn PowerMonitor>> {
        vec![
            Box::new(SimPower::new("Local", 8.1, 0.35)),
            Box::new(SimPower::new("Remote", 7.9, 0.2)),
        ]
    }
}

pub struct LiveHardware {
    serial_port: String,
    bus: Option<SharedBus>,
    first_servo: Option<u8>,
    link: Option<RemoteLink>,
}

impl LiveHardware {
    /// `link` is `None` when no bridge host is expected
    pub fn new(serial_port: &str, link: Option<RemoteLink>) -> Self {
        Self {
            serial_port: serial_port.to_string(),
            bus: None,
            first_servo: None,
            link,
        }
    }

    /// The serial bus is opened on first use
    fn bus(&mut self) -> motor::Result<SharedBus> {
        if let Some(bus) = &self.bus {
            return Ok(bus.clone());
        }
        info!("Opening Feetech bus on {}...", self.serial_port);
        let bus = FeetechBus::open(&self.serial_port)
            .map_err(|e| MotorError::unavailable(&self.serial_port, e))?;
        let bus = SharedBus::new(std::sync::Mutex::new(bus));
        self.bus = Some(bus.clone());
        Ok(bus)
    }

    fn link(&self, port: &str) -> motor::Result<RemoteLink> {
        self.link
            .clone()
            .ok_or_else(|| MotorError::unavailable(port, "no bridge link"))
    }
}

impl Hardware for LiveHardware {
    fn motor(&mut self, port: &PortRef, _travel: i32) -> motor::Result<Box<dyn Motor>> {
        match port {
            PortRef::Local(id) => {
                let servo = ServoMotor::connect(self.bus()?, *id, MAX_SPEED_PERCENT)?;
                self.first_servo.get_or_insert(*id);
                Ok(Box::new(servo))
            }
            PortRef::Remote(name) => {
                let link = self.link(name)?;
                Ok(Box::new(RemoteMotor::connect(link, name)?))
            }
        }
    }

    fn color_sensor(
        &mut self,
        port: &str,
        _aligned_with: &PortRef,
        _target: i32,
    ) -> motor::Result<Box<dyn ColorSensor>> {
        Ok(Box::new(RemoteSensor::connect_color(self.link(port)?, port)?))
    }

    fn touch_sensor(
        &mut self,
        port: &str,
        _aligned_with: &PortRef,
    ) -> motor::Result<Box<dyn TouchSensor>> {
        Ok(Box::new(RemoteSensor::connect_touch(self.link(port)?, port)?))
    }

    fn power_monitors(&mut self) -> Vec<Box<dyn PowerMonitor>> {
        let mut monitors: Vec<Box<dyn PowerMonitor>> = Vec::new();
        if let (Some(bus), Some(id)) = (&self.bus, self.first_servo) {
            monitors.push(Box::new(ServoBusPower::new(bus.clone(), id)));
        }
        if let Some(link) = &self.link {
            monitors.push(Box::new(RemotePower::new(link.clone())));
        }
        monitors
    }
}

fn build_joint(
    id: JointId,
    config: &JointConfig,
    hardware: &mut dyn Hardware,
) -> motor::Result<Joint> {
    let ports = PortRef::from_wiring(&config.wiring);
    let mut motors = Vec::with_capacity(ports.len());
    for port in &ports {
        let mut motor = hardware.motor(port, config.nominal_range)?;
        motor.set_stop_action(config.stop_action)?;
        motors.push(motor);
    }

    let name = id.name();
    let first = ports
        .first()
        .ok_or_else(|| MotorError::unavailable(name, "no motor wired"))?;
    let single = |motors: Vec<Box<dyn Motor>>| {
        motors
            .into_iter()
            .next()
            .ok_or_else(|| MotorError::unavailable(name, "no motor wired"))
    };

    let motor = match &config.calibration {
        CalibrationKind::Limited => {
            CalibratedMotor::limited(name, single(motors)?, config.speed, config.nominal_range)
        }
        CalibrationKind::LimitedSet { reference } => CalibratedMotor::limited_set(
            name,
            motors,
            *reference,
            config.speed,
            config.nominal_range,
        ),
        CalibrationKind::Static => {
            CalibratedMotor::static_range(name, single(motors)?, config.speed, config.nominal_range)
        }
        CalibrationKind::Color { sensor, target } => {
            let sensor = hardware.color_sensor(sensor, first, *target)?;
            CalibratedMotor::sensor_aligned(
                name,
                single(motors)?,
                config.speed,
                sensor,
                *target,
                config.nominal_range,
            )
        }
        CalibrationKind::Touch { sensor, max } => {
            let sensor = hardware.touch_sensor(sensor, first)?;
            CalibratedMotor::touch_aligned(name, single(motors)?, config.speed, sensor, *max)
        }
    };
    let motor = if config.center_after_calibration {
        motor
    } else {
        motor.without_centering()
    };
    Ok(Joint::new(id, motor, config.policy))
}

/// Bind every configured joint. An optional joint whose motor can't be
/// reached is left out; any other failure is fatal.
pub fn build_joint_set(config: &ArmConfig, hardware: &mut dyn Hardware) -> motor::Result<JointSet> {
    let mut joints = JointSet::new();
    for id in JointId::ALL {
        let Some(joint_config) = config.joints.get(id) else {
            continue;
        };
        match build_joint(id, joint_config, hardware) {
            Ok(joint) => joints.insert(joint),
            Err(e) if joint_config.optional && e.is_unavailable() => {
                warn!("{} motor not detected - running without it... ({})", id, e);
            }
            Err(e) => return Err(e),
        }
    }
    info!("Joints ready: {:?}", joints.ids());
    Ok(joints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationParams;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Sim backend where chosen ports are missing
    struct Flaky {
        sim: SimHardware,
        missing: Vec<String>,
    }

    impl Hardware for Flaky {
        fn motor(&mut self, port: &PortRef, travel: i32) -> motor::Result<Box<dyn Motor>> {
            if self.missing.contains(&port.key()) {
                return Err(MotorError::unavailable(&port.key(), "not detected"));
            }
            self.sim.motor(port, travel)
        }

        fn color_sensor(
            &mut self,
            port: &str,
            aligned_with: &PortRef,
            target: i32,
        ) -> motor::Result<Box<dyn ColorSensor>> {
            self.sim.color_sensor(port, aligned_with, target)
        }

        fn touch_sensor(
            &mut self,
            port: &str,
            aligned_with: &PortRef,
        ) -> motor::Result<Box<dyn TouchSensor>> {
            self.sim.touch_sensor(port, aligned_with)
        }

        fn power_monitors(&mut self) -> Vec<Box<dyn PowerMonitor>> {
            self.sim.power_monitors()
        }
    }

    #[test]
    fn test_default_arm_builds_in_sim() {
        let config = ArmConfig::default();
        let joints = build_joint_set(&config, &mut SimHardware::new()).unwrap();
        assert_eq!(joints.ids(), JointId::ALL.to_vec());
        let spin = joints.get(JointId::Spin).unwrap();
        assert!(spin.motor.is_fixed_range());
        assert_eq!(spin.motor.max_pos(), 14 * 360 / 2);
    }

    #[test]
    fn test_missing_optional_grabber_is_skipped() {
        let mut hardware = Flaky {
            sim: SimHardware::new(),
            missing: vec!["outD".to_string()],
        };
        let joints = build_joint_set(&ArmConfig::default(), &mut hardware).unwrap();
        assert!(!joints.contains(JointId::Grabber));
        assert_eq!(joints.len(), 6);
    }

    #[test]
    fn test_missing_required_joint_fails() {
        let mut hardware = Flaky {
            sim: SimHardware::new(),
            missing: vec!["servo-4".to_string()],
        };
        match build_joint_set(&ArmConfig::default(), &mut hardware) {
            Err(e) => assert!(e.is_unavailable()),
            Ok(_) => panic!("elbow is required"),
        }
    }

    /// Sim motors, but no alignment sensors anywhere
    struct NoSensors(SimHardware);

    impl Hardware for NoSensors {
        fn motor(&mut self, port: &PortRef, travel: i32) -> motor::Result<Box<dyn Motor>> {
            self.0.motor(port, travel)
        }

        fn color_sensor(
            &mut self,
            port: &str,
            _aligned_with: &PortRef,
            _target: i32,
        ) -> motor::Result<Box<dyn ColorSensor>> {
            Err(MotorError::unavailable(port, "no color sensor on this port"))
        }

        fn touch_sensor(
            &mut self,
            port: &str,
            _aligned_with: &PortRef,
        ) -> motor::Result<Box<dyn TouchSensor>> {
            Err(MotorError::unavailable(port, "no touch sensor on this port"))
        }

        fn power_monitors(&mut self) -> Vec<Box<dyn PowerMonitor>> {
            Vec::new()
        }
    }

    fn color_waist(config: &mut ArmConfig) {
        if let Some(waist) = config.joints.waist.as_mut() {
            waist.calibration = CalibrationKind::Color {
                sensor: "in1".to_string(),
                target: 5,
            };
        }
    }

    #[test]
    fn test_default_arm_needs_no_sensors() {
        let mut hardware = NoSensors(SimHardware::new());
        let joints = build_joint_set(&ArmConfig::default(), &mut hardware).unwrap();
        assert_eq!(joints.len(), JointId::ALL.len());
        // Zeroed where it starts, so calibration passes it by
        let waist = joints.get(JointId::Waist).unwrap();
        assert!(waist.motor.is_fixed_range());
        assert_eq!(waist.motor.min_pos(), -1000);
    }

    #[test]
    fn test_missing_alignment_sensor_fails_at_build() {
        let mut config = ArmConfig::default();
        color_waist(&mut config);
        match build_joint_set(&config, &mut NoSensors(SimHardware::new())) {
            Err(e) => assert!(e.is_unavailable()),
            Ok(_) => panic!("waist has no sensor to align with"),
        }
    }

    #[test]
    fn test_sim_waist_aligns_to_its_mark() {
        let mut config = ArmConfig::default();
        color_waist(&mut config);
        config.joints.shoulder = None;
        config.joints.elbow = None;
        config.joints.roll = None;
        config.joints.pitch = None;
        config.joints.spin = None;
        config.joints.grabber = None;
        let mut joints = build_joint_set(&config, &mut SimHardware::new()).unwrap();
        let params = CalibrationParams {
            poll_interval: Duration::from_millis(5),
            ..CalibrationParams::default()
        };

        joints
            .calibrate(&[JointId::Waist], &params, &AtomicBool::new(true))
            .unwrap();
        let waist = joints.get(JointId::Waist).unwrap();
        assert_eq!(waist.motor.center_pos(), 0.0);
    }
}
