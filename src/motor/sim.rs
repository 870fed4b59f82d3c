// Simulated joint axis for running without hardware
//
// An axis moves at a speed proportional to the commanded percentage, stops at
// two hard stops and reports a stall while pushed against one. Sensors can be
// attached to an axis to emulate the color mark or touch switch used to align it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use super::{ColorSensor, Motor, MotorStatus, Result, StopAction, TouchSensor, clamp_speed};

/// Ticks per second at 100% speed
const FULL_SPEED_TICKS_PER_SEC: f64 = 1000.0;

/// Distance from a target at which a positioning move counts as arrived
const ARRIVAL_WINDOW: f64 = 1.0;

struct AxisState {
    position: f64,
    lower: f64,
    upper: f64,
    velocity: f64, // ticks per second
    target: Option<f64>,
    zero: f64,
    updated: Instant,
}

impl AxisState {
    /// Integrate motion since the last update
    fn advance(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.updated).as_secs_f64();
        self.updated = now;

        if self.velocity == 0.0 {
            return;
        }
        let mut next = self.position + self.velocity * dt;
        if let Some(target) = self.target {
            let passed = (self.velocity > 0.0 && next >= target - ARRIVAL_WINDOW)
                || (self.velocity < 0.0 && next <= target + ARRIVAL_WINDOW);
            if passed {
                next = target;
                self.velocity = 0.0;
                self.target = None;
            }
        }
        self.position = next.clamp(self.lower, self.upper);
    }

    fn blocked(&self) -> bool {
        (self.velocity < 0.0 && self.position <= self.lower)
            || (self.velocity > 0.0 && self.position >= self.upper)
    }
}

/// Shared state of one simulated joint
#[derive(Clone)]
pub struct SimAxis {
    state: Arc<Mutex<AxisState>>,
}

impl SimAxis {
    /// Axis with hard stops at `lower` and `upper`, starting at `start`
    pub fn new(lower: i32, upper: i32, start: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(AxisState {
                position: start as f64,
                lower: lower as f64,
                upper: upper as f64,
                velocity: 0.0,
                target: None,
                zero: 0.0,
                updated: Instant::now(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AxisState> {
        // A panic while holding the lock leaves plain numbers behind; keep using them
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.advance();
        state
    }

    /// Physical position, ignoring any reset
    pub fn physical_position(&self) -> f64 {
        self.lock().position
    }

    pub fn bounds(&self) -> (f64, f64) {
        let state = self.lock();
        (state.lower, state.upper)
    }
}

pub struct SimMotor {
    port: String,
    axis: SimAxis,
    speed_ceiling: i32,
}

impl SimMotor {
    pub fn new(port: &str, axis: SimAxis, speed_ceiling: i32) -> Self {
        Self {
            port: port.to_string(),
            axis,
            speed_ceiling,
        }
    }

    pub fn axis(&self) -> &SimAxis {
        &self.axis
    }
}

impl Motor for SimMotor {
    fn port(&self) -> &str {
        &self.port
    }

    fn on(&mut self, speed: i32) -> Result<()> {
        let speed = clamp_speed(speed, self.speed_ceiling);
        let mut state = self.axis.lock();
        state.velocity = speed as f64 / 100.0 * FULL_SPEED_TICKS_PER_SEC;
        state.target = None;
        Ok(())
    }

    fn on_to_position(&mut self, speed: i32, ticks: i32, _brake: bool, wait: bool) -> Result<()> {
        let magnitude = clamp_speed(speed, self.speed_ceiling).abs() as f64 / 100.0;
        let mut state = self.axis.lock();
        let target = (ticks as f64 + state.zero).clamp(state.lower, state.upper);
        let direction = (target - state.position).signum();

        if wait || (target - state.position).abs() <= ARRIVAL_WINDOW {
            // Arrive immediately; the simulation has no reason to block
            state.position = target;
            state.velocity = 0.0;
            state.target = None;
        } else {
            state.velocity = direction * magnitude * FULL_SPEED_TICKS_PER_SEC;
            state.target = Some(target);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.axis.lock();
        state.velocity = 0.0;
        state.target = None;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let mut state = self.axis.lock();
        state.velocity = 0.0;
        state.target = None;
        state.zero = state.position;
        Ok(())
    }

    fn position(&mut self) -> Result<i32> {
        let state = self.axis.lock();
        Ok((state.position - state.zero).round() as i32)
    }

    fn is_running(&mut self) -> Result<bool> {
        Ok(self.axis.lock().velocity != 0.0)
    }

    fn status(&mut self) -> Result<MotorStatus> {
        let state = self.axis.lock();
        Ok(MotorStatus {
            running: state.velocity != 0.0,
            stalled: state.blocked(),
            overloaded: false,
        })
    }

    // Brake and coast look the same without inertia
    fn set_stop_action(&mut self, _action: StopAction) -> Result<()> {
        Ok(())
    }
}

/// Reports `color` while the axis is within `window` ticks of `mark`
pub struct SimColorSensor {
    axis: SimAxis,
    mark: f64,
    window: f64,
    color: i32,
}

impl SimColorSensor {
    pub fn new(axis: SimAxis, mark: i32, window: i32, color: i32) -> Self {
        Self {
            axis,
            mark: mark as f64,
            window: window as f64,
            color,
        }
    }
}

impl ColorSensor for SimColorSensor {
    fn color(&mut self) -> Result<i32> {
        if (self.axis.physical_position() - self.mark).abs() <= self.window {
            Ok(self.color)
        } else {
            Ok(0)
        }
    }
}

/// Pressed while the axis rests on its lower hard stop
pub struct SimTouchSensor {
    axis: SimAxis,
}

impl SimTouchSensor {
    pub fn new(axis: SimAxis) -> Self {
        Self { axis }
    }
}

impl TouchSensor for SimTouchSensor {
    fn is_pressed(&mut self) -> Result<bool> {
        let (lower, _) = self.axis.bounds();
        Ok(self.axis.physical_position() <= lower)
    }
}
