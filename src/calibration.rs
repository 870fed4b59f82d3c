// Range discovery and limit tracking for a joint
//
// A `CalibratedMotor` wraps one motor handle (or a synchronized group of them)
// and adds min/max/center tracking. How the range is found depends on its
// `RangeKind`:
// - LimitedRange: drive into both hard stops, zero at the low one
// - LimitedRangeSet: same, fanned out to every member, stall watched on one
// - StaticRange: fixed range around the start position, no calibration
// - SensorAligned: zero where a color sensor sees its target color
// - TouchAligned: zero where a touch sensor is pressed, fixed span above it

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{CALIBRATION_POLL, SAFETY_MARGIN, SENSOR_TIMEOUT, SET_SETTLE, STALL_TIMEOUT};
use crate::motor::{self, ColorSensor, Motor, MotorError, MotorStatus, StopAction, TouchSensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Uncalibrated,
    FindingMinimum,
    FindingMaximum,
    Centering,
    Calibrated,
}

/// Timing and margins used by every calibration
#[derive(Debug, Clone)]
pub struct CalibrationParams {
    pub poll_interval: Duration,
    /// Bound on each hard-stop search
    pub stall_timeout: Duration,
    /// Bound on a sensor search
    pub sensor_timeout: Duration,
    /// Wait after centering a motor group, whose arrival can't be awaited
    pub settle: Duration,
    /// Subtracted from the discovered maximum
    pub safety_margin: i32,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            poll_interval: CALIBRATION_POLL,
            stall_timeout: STALL_TIMEOUT,
            sensor_timeout: SENSOR_TIMEOUT,
            settle: SET_SETTLE,
            safety_margin: SAFETY_MARGIN,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("Calibration of {joint} timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        joint: String,
        waiting_for: &'static str,
        elapsed: Duration,
    },

    #[error("{0} has a fixed range and cannot be calibrated")]
    NotSupported(String),

    #[error("Calibration of {0} interrupted")]
    Interrupted(String),

    #[error("{joint} found no usable travel ({travel} ticks)")]
    NoTravel { joint: String, travel: i32 },

    #[error(transparent)]
    Motor(#[from] MotorError),
}

/// How a joint discovers its range
pub enum RangeKind {
    LimitedRange,
    LimitedRangeSet {
        /// Member whose status and position stand for the whole group
        reference: usize,
    },
    StaticRange,
    SensorAligned {
        sensor: Box<dyn ColorSensor>,
        target: i32,
    },
    TouchAligned {
        sensor: Box<dyn TouchSensor>,
        max: i32,
    },
}

impl RangeKind {
    fn label(&self) -> &'static str {
        match self {
            RangeKind::LimitedRange => "limited",
            RangeKind::LimitedRangeSet { .. } => "limited set",
            RangeKind::StaticRange => "static",
            RangeKind::SensorAligned { .. } => "sensor aligned",
            RangeKind::TouchAligned { .. } => "touch aligned",
        }
    }
}

pub struct CalibratedMotor {
    name: String,
    motors: Vec<Box<dyn Motor>>,
    reference: usize,
    speed: i32,
    kind: RangeKind,
    state: CalibrationState,
    center_after: bool,
    min_pos: i32,
    max_pos: i32,
}

impl CalibratedMotor {
    fn build(
        name: &str,
        motors: Vec<Box<dyn Motor>>,
        reference: usize,
        speed: i32,
        kind: RangeKind,
        nominal_range: i32,
    ) -> Self {
        // Until calibrated, assume we start centered in the nominal range
        let half = nominal_range.abs() / 2;
        Self {
            name: name.to_string(),
            motors,
            reference,
            speed: speed.abs(),
            kind,
            state: CalibrationState::Uncalibrated,
            center_after: true,
            min_pos: -half,
            max_pos: half,
        }
    }

    /// Single motor with two hard stops
    pub fn limited(name: &str, motor: Box<dyn Motor>, speed: i32, nominal_range: i32) -> Self {
        Self::build(name, vec![motor], 0, speed, RangeKind::LimitedRange, nominal_range)
    }

    /// Synchronized motors driving one joint; `reference` watches for the stall
    pub fn limited_set(
        name: &str,
        motors: Vec<Box<dyn Motor>>,
        reference: usize,
        speed: i32,
        nominal_range: i32,
    ) -> Self {
        let reference = reference.min(motors.len().saturating_sub(1));
        Self::build(
            name,
            motors,
            reference,
            speed,
            RangeKind::LimitedRangeSet { reference },
            nominal_range,
        )
    }

    /// Continuously rotating joint; `range` is split evenly around the start position
    pub fn static_range(name: &str, motor: Box<dyn Motor>, speed: i32, range: i32) -> Self {
        Self::build(name, vec![motor], 0, speed, RangeKind::StaticRange, range)
    }

    pub fn sensor_aligned(
        name: &str,
        motor: Box<dyn Motor>,
        speed: i32,
        sensor: Box<dyn ColorSensor>,
        target: i32,
        nominal_range: i32,
    ) -> Self {
        Self::build(
            name,
            vec![motor],
            0,
            speed,
            RangeKind::SensorAligned { sensor, target },
            nominal_range,
        )
    }

    pub fn touch_aligned(
        name: &str,
        motor: Box<dyn Motor>,
        speed: i32,
        sensor: Box<dyn TouchSensor>,
        max: i32,
    ) -> Self {
        Self::build(
            name,
            vec![motor],
            0,
            speed,
            RangeKind::TouchAligned { sensor, max },
            max,
        )
    }

    /// Stay at the maximum after calibrating instead of returning to center
    pub fn without_centering(mut self) -> Self {
        self.center_after = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn kind(&self) -> &RangeKind {
        &self.kind
    }

    pub fn is_fixed_range(&self) -> bool {
        matches!(self.kind, RangeKind::StaticRange)
    }

    pub fn min_pos(&self) -> i32 {
        self.min_pos
    }

    pub fn max_pos(&self) -> i32 {
        self.max_pos
    }

    /// Midpoint of the range. Calibration zeroes the low end, which makes
    /// this `(max - min) / 2`. Static and sensor-aligned ranges are symmetric
    /// about the zero, so those joints center at 0.
    pub fn center_pos(&self) -> f64 {
        self.min_pos as f64 + (self.max_pos - self.min_pos) as f64 / 2.0
    }

    /// Center rounded to a commandable tick
    pub fn center_ticks(&self) -> i32 {
        self.center_pos().round() as i32
    }

    /// Run the full calibration sequence.
    ///
    /// Blocks until done. `keep_going` is checked on every poll; clearing it
    /// aborts with `Interrupted`. On any failure the motors are stopped and the
    /// joint is left `Uncalibrated` with its previous range.
    pub fn calibrate(
        &mut self,
        params: &CalibrationParams,
        keep_going: &AtomicBool,
    ) -> Result<(), CalibrationError> {
        if self.is_fixed_range() {
            return Err(CalibrationError::NotSupported(self.name.clone()));
        }
        info!("Calibrating {} ({})...", self.name, self.kind.label());

        let previous = (self.min_pos, self.max_pos);
        let result = match self.kind {
            RangeKind::LimitedRange | RangeKind::LimitedRangeSet { .. } => {
                self.find_hard_stops(params, keep_going)
            }
            RangeKind::SensorAligned { .. } | RangeKind::TouchAligned { .. } => {
                self.align_to_sensor(params, keep_going)
            }
            RangeKind::StaticRange => Err(CalibrationError::NotSupported(self.name.clone())),
        };

        match result {
            Ok(()) => {
                self.state = CalibrationState::Calibrated;
                info!(
                    "Motor {} found max {} (range [{}, {}], center {})",
                    self.name,
                    self.max_pos,
                    self.min_pos,
                    self.max_pos,
                    self.center_pos()
                );
                Ok(())
            }
            Err(e) => {
                warn!("Calibration of {} failed: {}", self.name, e);
                if let Err(stop_err) = self.fan_out(|m| m.stop()) {
                    warn!("Failed to stop {} after calibration error: {}", self.name, stop_err);
                }
                self.state = CalibrationState::Uncalibrated;
                (self.min_pos, self.max_pos) = previous;
                Err(e)
            }
        }
    }

    fn find_hard_stops(
        &mut self,
        params: &CalibrationParams,
        keep_going: &AtomicBool,
    ) -> Result<(), CalibrationError> {
        let speed = self.speed;

        self.state = CalibrationState::FindingMinimum;
        debug!("{}: finding minimum", self.name);
        self.fan_out(|m| m.on(-speed))?;
        self.wait_for_stall(params, keep_going)?;
        self.fan_out(|m| m.reset())?;
        self.min_pos = 0;

        self.state = CalibrationState::FindingMaximum;
        debug!("{}: finding maximum", self.name);
        self.fan_out(|m| m.on(speed))?;
        self.wait_for_stall(params, keep_going)?;
        self.fan_out(|m| m.stop())?;

        let travel = self.motors[self.reference].position()?;
        let max_pos = travel - params.safety_margin;
        if max_pos <= self.min_pos {
            return Err(CalibrationError::NoTravel {
                joint: self.name.clone(),
                travel,
            });
        }
        self.max_pos = max_pos;

        if self.center_after {
            self.state = CalibrationState::Centering;
            let center = self.center_ticks();
            if self.motors.len() == 1 {
                self.motors[0].on_to_position(speed, center, true, true)?;
            } else {
                // Members can't be awaited individually; give them time to get there
                self.fan_out(|m| m.on_to_position(speed, center, true, false))?;
                sleep(params.settle);
            }
        }
        Ok(())
    }

    fn align_to_sensor(
        &mut self,
        params: &CalibrationParams,
        keep_going: &AtomicBool,
    ) -> Result<(), CalibrationError> {
        let speed = self.speed;
        let name = self.name.clone();
        let motor = &mut self.motors[0];

        self.state = CalibrationState::FindingMinimum;
        match &mut self.kind {
            RangeKind::SensorAligned { sensor, target } => {
                let target = *target;
                if sensor.color()? != target {
                    motor.on(-speed)?;
                    poll_until(
                        &name,
                        "sensor target",
                        params.poll_interval,
                        params.sensor_timeout,
                        keep_going,
                        || Ok(sensor.color()? == target),
                    )?;
                }
                motor.stop()?;
                motor.reset()?;
                // Zero is the center for a sensor-aligned joint
                let half = (self.max_pos - self.min_pos) / 2;
                self.min_pos = -half;
                self.max_pos = half;
            }
            RangeKind::TouchAligned { sensor, max } => {
                let max = *max;
                if !sensor.is_pressed()? {
                    motor.on(-speed)?;
                    poll_until(
                        &name,
                        "touch sensor",
                        params.poll_interval,
                        params.sensor_timeout,
                        keep_going,
                        || Ok(sensor.is_pressed()?),
                    )?;
                }
                motor.stop()?;
                motor.reset()?;
                self.min_pos = 0;
                self.max_pos = max;
            }
            _ => return Err(CalibrationError::NotSupported(name)),
        }
        Ok(())
    }

    fn wait_for_stall(
        &mut self,
        params: &CalibrationParams,
        keep_going: &AtomicBool,
    ) -> Result<(), CalibrationError> {
        let name = self.name.clone();
        let reference = &mut self.motors[self.reference];
        poll_until(
            &name,
            "stall",
            params.poll_interval,
            params.stall_timeout,
            keep_going,
            || {
                let status: MotorStatus = reference.status()?;
                Ok(status.is_blocked())
            },
        )
    }

    /// Apply an operation to every member, attempting all even if one fails
    fn fan_out(
        &mut self,
        mut op: impl FnMut(&mut dyn Motor) -> motor::Result<()>,
    ) -> motor::Result<()> {
        let mut first_err = None;
        for motor in self.motors.iter_mut() {
            if let Err(e) = op(motor.as_mut()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn check_range(&self, ticks: i32) -> motor::Result<()> {
        if ticks < self.min_pos || ticks > self.max_pos {
            return Err(MotorError::InvalidRange {
                target: ticks,
                min: self.min_pos,
                max: self.max_pos,
            });
        }
        Ok(())
    }
}

/// Poll `condition` until it holds, bounded by `timeout` and by `keep_going`
fn poll_until(
    joint: &str,
    waiting_for: &'static str,
    interval: Duration,
    timeout: Duration,
    keep_going: &AtomicBool,
    mut condition: impl FnMut() -> motor::Result<bool>,
) -> Result<(), CalibrationError> {
    let started = Instant::now();
    loop {
        if !keep_going.load(Ordering::SeqCst) {
            return Err(CalibrationError::Interrupted(joint.to_string()));
        }
        if condition()? {
            return Ok(());
        }
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(CalibrationError::Timeout {
                joint: joint.to_string(),
                waiting_for,
                elapsed,
            });
        }
        sleep(interval);
    }
}

impl Motor for CalibratedMotor {
    fn port(&self) -> &str {
        &self.name
    }

    fn on(&mut self, speed: i32) -> motor::Result<()> {
        self.fan_out(|m| m.on(speed))
    }

    /// Rejects targets outside the known range
    fn on_to_position(
        &mut self,
        speed: i32,
        ticks: i32,
        brake: bool,
        wait: bool,
    ) -> motor::Result<()> {
        self.check_range(ticks)?;
        if self.motors.len() == 1 {
            return self.motors[0].on_to_position(speed, ticks, brake, wait);
        }
        // Members of a set are never awaited individually
        self.fan_out(|m| m.on_to_position(speed, ticks, brake, false))
    }

    fn stop(&mut self) -> motor::Result<()> {
        self.fan_out(|m| m.stop())
    }

    fn reset(&mut self) -> motor::Result<()> {
        self.fan_out(|m| m.reset())
    }

    fn position(&mut self) -> motor::Result<i32> {
        self.motors[self.reference].position()
    }

    fn is_running(&mut self) -> motor::Result<bool> {
        self.motors[self.reference].is_running()
    }

    fn status(&mut self) -> motor::Result<MotorStatus> {
        self.motors[self.reference].status()
    }

    fn set_stop_action(&mut self, action: StopAction) -> motor::Result<()> {
        self.fan_out(|m| m.set_stop_action(action))
    }
}
