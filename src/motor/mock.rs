// Scripted motor and sensors for unit tests
//
// Every command is recorded. Hard stops are given in readout ticks before any
// reset; continuous motion toward a stop reports "stalled" after a few status polls.

use std::sync::{Arc, Mutex};

use super::{ColorSensor, Motor, MotorError, MotorStatus, Result, StopAction, TouchSensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    On(i32),
    OnToPosition {
        speed: i32,
        ticks: i32,
        brake: bool,
        wait: bool,
    },
    Stop,
    Reset,
    SetStopAction(StopAction),
}

/// Status polls of continuous motion before a hard stop reports a stall
const POLLS_TO_STALL: u32 = 2;

#[derive(Default)]
struct MockState {
    log: Vec<Command>,
    physical: i32,
    zero: i32,
    running: bool,
    velocity: i32,
    polls: u32,
    lower_stop: Option<i32>,
    upper_stop: Option<i32>,
    unavailable: bool,
    failing_queries: u32,
}

#[derive(Clone, Default)]
pub(crate) struct MockMotor {
    port: String,
    state: Arc<Mutex<MockState>>,
}

impl MockMotor {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            state: Arc::default(),
        }
    }

    pub fn with_stops(port: &str, lower: i32, upper: i32) -> Self {
        let motor = Self::new(port);
        {
            let mut state = motor.state.lock().unwrap();
            state.lower_stop = Some(lower);
            state.upper_stop = Some(upper);
        }
        motor
    }

    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// Simulate the motor finishing (or starting) a motion on its own
    pub fn set_running(&self, running: bool) {
        self.state.lock().unwrap().running = running;
    }

    /// From now on every call fails as if the link went down
    pub fn disconnect(&self) {
        self.state.lock().unwrap().unavailable = true;
    }

    /// The next `count` running queries fail with a protocol error
    pub fn fail_queries(&self, count: u32) {
        self.state.lock().unwrap().failing_queries = count;
    }

    fn record(&self, command: Command) -> std::sync::MutexGuard<'_, MockState> {
        let mut state = self.state.lock().unwrap();
        state.log.push(command);
        state
    }

    fn check(&self, state: &MockState) -> Result<()> {
        if state.unavailable {
            Err(MotorError::unavailable(&self.port, "link down"))
        } else {
            Ok(())
        }
    }
}

impl Motor for MockMotor {
    fn port(&self) -> &str {
        &self.port
    }

    fn on(&mut self, speed: i32) -> Result<()> {
        let mut state = self.record(Command::On(speed));
        self.check(&state)?;
        state.velocity = speed;
        state.running = speed != 0;
        state.polls = 0;
        Ok(())
    }

    fn on_to_position(&mut self, speed: i32, ticks: i32, brake: bool, wait: bool) -> Result<()> {
        let mut state = self.record(Command::OnToPosition {
            speed,
            ticks,
            brake,
            wait,
        });
        self.check(&state)?;
        state.physical = ticks + state.zero;
        state.velocity = 0;
        state.running = !wait;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.record(Command::Stop);
        self.check(&state)?;
        state.running = false;
        state.velocity = 0;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let mut state = self.record(Command::Reset);
        self.check(&state)?;
        state.zero = state.physical;
        state.running = false;
        state.velocity = 0;
        Ok(())
    }

    fn position(&mut self) -> Result<i32> {
        let state = self.state.lock().unwrap();
        self.check(&state)?;
        Ok(state.physical - state.zero)
    }

    fn is_running(&mut self) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(MotorError::protocol(&self.port, "garbled reply"));
        }
        Ok(state.running)
    }

    fn status(&mut self) -> Result<MotorStatus> {
        let mut state = self.state.lock().unwrap();
        self.check(&state)?;

        let stop = match state.velocity {
            v if v < 0 => state.lower_stop,
            v if v > 0 => state.upper_stop,
            _ => None,
        };
        let mut stalled = false;
        if let Some(stop) = stop {
            state.polls += 1;
            if state.polls >= POLLS_TO_STALL {
                state.physical = stop;
                stalled = true;
            }
        }

        Ok(MotorStatus {
            running: state.running,
            stalled,
            overloaded: false,
        })
    }

    fn set_stop_action(&mut self, action: StopAction) -> Result<()> {
        let state = self.record(Command::SetStopAction(action));
        self.check(&state)
    }
}

/// Reports `color` after `reads_until_match` reads, 0 before
pub(crate) struct MockColorSensor {
    pub color: i32,
    pub reads_until_match: u32,
    reads: u32,
}

impl MockColorSensor {
    pub fn new(color: i32, reads_until_match: u32) -> Self {
        Self {
            color,
            reads_until_match,
            reads: 0,
        }
    }
}

impl ColorSensor for MockColorSensor {
    fn color(&mut self) -> Result<i32> {
        self.reads += 1;
        if self.reads > self.reads_until_match {
            Ok(self.color)
        } else {
            Ok(0)
        }
    }
}

/// Pressed after `reads_until_pressed` reads; never pressed when `None`
pub(crate) struct MockTouchSensor {
    reads_until_pressed: Option<u32>,
    reads: u32,
}

impl MockTouchSensor {
    pub fn new(reads_until_pressed: Option<u32>) -> Self {
        Self {
            reads_until_pressed,
            reads: 0,
        }
    }
}

impl TouchSensor for MockTouchSensor {
    fn is_pressed(&mut self) -> Result<bool> {
        self.reads += 1;
        Ok(self
            .reads_until_pressed
            .is_some_and(|limit| self.reads > limit))
    }
}
