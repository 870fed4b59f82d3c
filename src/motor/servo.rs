// Motor handle for a single Feetech servo on a shared serial bus
//
// Tracks a multi-turn position in software (the encoder only reports one turn),
// keeps a software zero for `reset()`, and derives stall detection from the
// moving flag and present load. Positioning runs in step mode: the goal is a
// signed offset from where the motor is, so a target may lie any number of
// turns away from the encoder's own zero.
//
// Tracking needs a reading at least every half turn while the motor moves.
// A step move that finishes between two readings is resolved against its goal.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::feetech::{FeetechBus, FeetechError, OperatingMode, STATUS_OVERLOAD};
use super::{Motor, MotorError, MotorStatus, Result, StopAction, clamp_speed};

/// One serial bus is shared by every servo attached to it
pub type SharedBus = Arc<Mutex<FeetechBus>>;

/// Encoder steps per revolution
const TICKS_PER_REV: i32 = 4096;

/// Raw goal velocity corresponding to 100% speed (safety limit)
const MAX_RAW_SPEED: i32 = 3000;

/// Longest step a single positioning command can make
const MAX_STEP: i32 = i16::MAX as i32;

/// Load (per mille of stall torque) above which a motor that isn't moving is stalled
const STALL_LOAD: i16 = 500;

const WAIT_POLL: Duration = Duration::from_millis(10);
const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServoMotor {
    bus: SharedBus,
    id: u8,
    port: String,
    mode: Option<OperatingMode>,
    torque: bool,
    stop_action: StopAction,
    speed_ceiling: i32,
    last_raw: Option<u16>,
    absolute: i32, // unwrapped encoder position
    zero: i32,
    driving: bool,
    step_goal: Option<i32>, // absolute goal of the last step move
}

impl ServoMotor {
    /// Bind a handle to a servo id, failing if the servo doesn't answer a ping
    pub fn connect(bus: SharedBus, id: u8, speed_ceiling: i32) -> Result<Self> {
        let port = format!("servo-{}", id);
        {
            let mut guard = lock(&bus, &port)?;
            match guard.ping(id) {
                Ok(true) => debug!("Motor {} responding", id),
                Ok(false) => return Err(MotorError::unavailable(&port, "no answer to ping")),
                Err(e) => return Err(map_err(&port, e)),
            }
        }
        info!("Servo {} bound to {}", id, port);

        Ok(Self {
            bus,
            id,
            port,
            mode: None,
            torque: false,
            stop_action: StopAction::Brake,
            speed_ceiling,
            last_raw: None,
            absolute: 0,
            zero: 0,
            driving: false,
            step_goal: None,
        })
    }

    /// Switch operating mode; requires torque off while changing
    fn ensure_mode(&mut self, bus: &mut FeetechBus, mode: OperatingMode) -> Result<()> {
        if self.mode == Some(mode) && self.torque {
            return Ok(());
        }
        if self.mode != Some(mode) {
            bus.disable_torque(self.id).map_err(|e| map_err(&self.port, e))?;
            bus.set_operating_mode(self.id, mode)
                .map_err(|e| map_err(&self.port, e))?;
            self.mode = Some(mode);
        }
        bus.enable_torque(self.id).map_err(|e| map_err(&self.port, e))?;
        self.torque = true;
        Ok(())
    }

    /// Read the encoder and fold it into the multi-turn position
    fn read_absolute(&mut self, bus: &mut FeetechBus) -> Result<i32> {
        let moving = match self.step_goal {
            Some(_) => bus.is_moving(self.id).map_err(|e| map_err(&self.port, e))?,
            None => true,
        };
        self.track(bus, moving)
    }

    fn track(&mut self, bus: &mut FeetechBus, moving: bool) -> Result<i32> {
        let raw = bus.get_position(self.id).map_err(|e| map_err(&self.port, e))?;
        self.absolute = resolve_position(self.last_raw, raw, self.absolute, self.step_goal, moving);
        self.last_raw = Some(raw);
        if !moving {
            self.step_goal = None;
        }
        Ok(self.absolute)
    }

    fn is_moving(&mut self, bus: &mut FeetechBus) -> Result<bool> {
        if !self.driving {
            return Ok(false);
        }
        if self.mode == Some(OperatingMode::Velocity) {
            // Velocity mode keeps running until told otherwise, even when blocked
            return Ok(true);
        }
        let moving = bus.is_moving(self.id).map_err(|e| map_err(&self.port, e))?;
        if self.step_goal.is_some() {
            self.track(bus, moving)?;
        }
        if !moving {
            self.driving = false;
        }
        Ok(moving)
    }
}

impl Motor for ServoMotor {
    fn port(&self) -> &str {
        &self.port
    }

    fn on(&mut self, speed: i32) -> Result<()> {
        let speed = clamp_speed(speed, self.speed_ceiling);
        let bus = Arc::clone(&self.bus);
        let mut bus = lock(&bus, &self.port)?;

        self.ensure_mode(&mut bus, OperatingMode::Velocity)?;
        let raw = (speed * MAX_RAW_SPEED / 100) as i16;
        bus.set_velocity(self.id, raw)
            .map_err(|e| map_err(&self.port, e))?;
        self.driving = speed != 0;
        Ok(())
    }

    fn on_to_position(&mut self, speed: i32, ticks: i32, brake: bool, wait: bool) -> Result<()> {
        let speed = clamp_speed(speed, self.speed_ceiling).abs();
        let bus = Arc::clone(&self.bus);
        let mut bus = lock(&bus, &self.port)?;

        let absolute = self.read_absolute(&mut bus)?;
        let Some(steps) = step_offset(ticks, self.zero, absolute) else {
            let here = absolute - self.zero;
            return Err(MotorError::InvalidRange {
                target: ticks,
                min: here - MAX_STEP,
                max: here + MAX_STEP,
            });
        };

        self.ensure_mode(&mut bus, OperatingMode::Step)?;
        let raw_speed = (speed * MAX_RAW_SPEED / 100) as u16;
        bus.set_step_goal(self.id, steps, raw_speed)
            .map_err(|e| map_err(&self.port, e))?;
        self.step_goal = Some(absolute + steps as i32);
        self.driving = true;

        if !wait {
            return Ok(());
        }

        let started = Instant::now();
        while self.is_moving(&mut bus)? {
            if started.elapsed() > WAIT_TIMEOUT {
                return Err(MotorError::Timeout {
                    port: self.port.clone(),
                });
            }
            sleep(WAIT_POLL);
        }
        if !brake {
            bus.disable_torque(self.id)
                .map_err(|e| map_err(&self.port, e))?;
            self.torque = false;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let bus = Arc::clone(&self.bus);
        let mut bus = lock(&bus, &self.port)?;
        if self.step_goal.is_some() {
            self.read_absolute(&mut bus)?;
            self.step_goal = None;
        }
        self.driving = false;

        match (self.stop_action, self.mode) {
            (StopAction::Coast, _) => {
                bus.disable_torque(self.id)
                    .map_err(|e| map_err(&self.port, e))?;
                self.torque = false;
            }
            (StopAction::Brake, Some(OperatingMode::Step)) => {
                bus.set_step_goal(self.id, 0, 0)
                    .map_err(|e| map_err(&self.port, e))?;
            }
            (StopAction::Brake, _) => {
                bus.set_velocity(self.id, 0)
                    .map_err(|e| map_err(&self.port, e))?;
            }
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.stop()?;
        let bus = Arc::clone(&self.bus);
        let mut bus = lock(&bus, &self.port)?;
        self.zero = self.read_absolute(&mut bus)?;
        debug!("{} zero set at raw {}", self.port, self.zero);
        Ok(())
    }

    fn position(&mut self) -> Result<i32> {
        let bus = Arc::clone(&self.bus);
        let mut bus = lock(&bus, &self.port)?;
        Ok(self.read_absolute(&mut bus)? - self.zero)
    }

    fn is_running(&mut self) -> Result<bool> {
        let bus = Arc::clone(&self.bus);
        let mut bus = lock(&bus, &self.port)?;
        self.is_moving(&mut bus)
    }

    fn status(&mut self) -> Result<MotorStatus> {
        let bus = Arc::clone(&self.bus);
        let mut bus = lock(&bus, &self.port)?;

        let overloaded = match bus.get_status(self.id) {
            Ok(bits) => bits & STATUS_OVERLOAD != 0,
            // An overloaded servo flags every reply with its fault bits
            Err(FeetechError::MotorError { status, .. }) if status & STATUS_OVERLOAD != 0 => {
                return Ok(MotorStatus {
                    running: self.driving,
                    stalled: false,
                    overloaded: true,
                });
            }
            Err(e) => return Err(map_err(&self.port, e)),
        };

        let moving = bus.is_moving(self.id).map_err(|e| map_err(&self.port, e))?;
        let load = bus.get_load(self.id).map_err(|e| map_err(&self.port, e))?;
        let stalled = self.driving && !moving && load.abs() >= STALL_LOAD;

        Ok(MotorStatus {
            running: self.driving,
            stalled,
            overloaded,
        })
    }

    fn set_stop_action(&mut self, action: StopAction) -> Result<()> {
        self.stop_action = action;
        Ok(())
    }
}

fn lock<'a>(bus: &'a SharedBus, port: &str) -> Result<MutexGuard<'a, FeetechBus>> {
    bus.lock()
        .map_err(|_| MotorError::protocol(port, "bus lock poisoned"))
}

/// Link failures make the device unavailable; anything else is a protocol problem
fn map_err(port: &str, err: FeetechError) -> MotorError {
    if err.is_link_failure() {
        MotorError::unavailable(port, err)
    } else {
        MotorError::protocol(port, err)
    }
}

/// Signed step from `absolute` to the target, or `None` when it is too long
/// for one command
fn step_offset(ticks: i32, zero: i32, absolute: i32) -> Option<i16> {
    let offset = ticks + zero - absolute;
    if (-MAX_STEP..=MAX_STEP).contains(&offset) {
        Some(offset as i16)
    } else {
        None
    }
}

/// Multi-turn position for a reading. A step move that has finished lands on
/// the turn nearest its goal; otherwise the reading is unwrapped from the last.
fn resolve_position(
    last_raw: Option<u16>,
    raw: u16,
    absolute: i32,
    step_goal: Option<i32>,
    moving: bool,
) -> i32 {
    match step_goal {
        Some(goal) if !moving => nearest_turn(raw, goal),
        _ => unwrap_position(last_raw, raw, absolute),
    }
}

/// The position reading `raw` on the turn closest to `near`
fn nearest_turn(raw: u16, near: i32) -> i32 {
    let delta = (raw as i32 - near).rem_euclid(TICKS_PER_REV);
    if delta > TICKS_PER_REV / 2 {
        near + delta - TICKS_PER_REV
    } else {
        near + delta
    }
}

/// Fold a new single-turn reading into a multi-turn position.
/// Assumes less than half a turn between two readings.
fn unwrap_position(last_raw: Option<u16>, raw: u16, absolute: i32) -> i32 {
    let Some(last) = last_raw else {
        return raw as i32;
    };
    let mut delta = raw as i32 - last as i32;
    if delta > TICKS_PER_REV / 2 {
        delta -= TICKS_PER_REV;
    } else if delta < -TICKS_PER_REV / 2 {
        delta += TICKS_PER_REV;
    }
    absolute + delta
}
