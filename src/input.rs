// Gamepad input: raw stick/button events -> shared intent state
//
// The input thread is the only writer of the intent state; the control loop
// only reads it. Each opposing button pair is stored as one direction value,
// so both directions of a pair can never be set at the same time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::Subscriber;
use zenoh::sample::Sample;

use crate::config::StickConfig;
use crate::joints::JointId;
use crate::messages::{EventKind, InputEvent};

// PS4 controller codes
pub const STICK_LEFT_X: u16 = 0;
pub const STICK_RIGHT_X: u16 = 3;
pub const BTN_X: u16 = 304;
pub const BTN_CIRCLE: u16 = 305;
pub const BTN_TRIANGLE: u16 = 307;
pub const BTN_SQUARE: u16 = 308;
pub const BTN_L1: u16 = 310;
pub const BTN_R1: u16 = 311;
pub const BTN_L2: u16 = 312;
pub const BTN_R2: u16 = 313;
pub const BTN_SHARE: u16 = 314;
pub const BTN_OPTIONS: u16 = 315;
pub const BTN_PS: u16 = 316;
pub const BTN_L3: u16 = 317;
pub const BTN_R3: u16 = 318;

/// Name the gamepad registers under
pub const GAMEPAD_NAME: &str = "Wireless Controller";

/// Stick-driven joints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Shoulder,
    Elbow,
}

impl Axis {
    pub fn of(joint: JointId) -> Option<Axis> {
        match joint {
            JointId::Shoulder => Some(Axis::Shoulder),
            JointId::Elbow => Some(Axis::Elbow),
            _ => None,
        }
    }
}

/// Button-driven joints, each with an opposing pair of buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pair {
    Waist,
    Roll,
    Pitch,
    Spin,
    Grabber,
}

impl Pair {
    pub const ALL: [Pair; 5] = [Pair::Waist, Pair::Roll, Pair::Pitch, Pair::Spin, Pair::Grabber];

    pub fn of(joint: JointId) -> Option<Pair> {
        match joint {
            JointId::Waist => Some(Pair::Waist),
            JointId::Roll => Some(Pair::Roll),
            JointId::Pitch => Some(Pair::Pitch),
            JointId::Spin => Some(Pair::Spin),
            JointId::Grabber => Some(Pair::Grabber),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Requested direction of a button-driven joint.
///
/// Negative is toward `min_pos` (or reverse rotation), Positive toward `max_pos`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Direction {
    #[default]
    Idle = 0,
    Negative = 1,
    Positive = 2,
}

impl Direction {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Direction::Negative,
            2 => Direction::Positive,
            _ => Direction::Idle,
        }
    }
}

/// What the operator currently asks of the arm
#[derive(Debug, Default)]
pub struct IntentState {
    shoulder: AtomicI32,
    elbow: AtomicI32,
    pairs: [AtomicU8; 5],
}

impl IntentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn speed(&self, axis: Axis) -> i32 {
        self.axis(axis).load(Ordering::SeqCst)
    }

    pub fn set_speed(&self, axis: Axis, speed: i32) {
        self.axis(axis).store(speed, Ordering::SeqCst);
    }

    pub fn direction(&self, pair: Pair) -> Direction {
        Direction::from_u8(self.pairs[pair.index()].load(Ordering::SeqCst))
    }

    /// Button down: this direction replaces the opposing one in a single step
    pub fn press(&self, pair: Pair, direction: Direction) {
        self.pairs[pair.index()].store(direction as u8, Ordering::SeqCst);
    }

    /// Button up: clears the direction only if it is still the active one
    pub fn release(&self, pair: Pair, direction: Direction) {
        let _ = self.pairs[pair.index()].compare_exchange(
            direction as u8,
            Direction::Idle as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// The pair as two flags: (negative, positive)
    pub fn flags(&self, pair: Pair) -> (bool, bool) {
        match self.direction(pair) {
            Direction::Idle => (false, false),
            Direction::Negative => (true, false),
            Direction::Positive => (false, true),
        }
    }

    /// Back to all zero / all idle
    pub fn reset(&self) {
        self.shoulder.store(0, Ordering::SeqCst);
        self.elbow.store(0, Ordering::SeqCst);
        for pair in &self.pairs {
            pair.store(Direction::Idle as u8, Ordering::SeqCst);
        }
    }

    fn axis(&self, axis: Axis) -> &AtomicI32 {
        match axis {
            Axis::Shoulder => &self.shoulder,
            Axis::Elbow => &self.elbow,
        }
    }
}

/// Map a raw 0..255 stick value linearly onto `[-scale_to, scale_to]`,
/// with readings inside the deadzone forced to 0
pub fn scale_stick(value: i32, deadzone: i32, scale_to: i32, invert: bool) -> i32 {
    let value = value.clamp(0, 255) as f64;
    let scaled = value / 255.0 * (2 * scale_to) as f64 - scale_to as f64;
    let scaled = scaled.round() as i32;
    if scaled.abs() < deadzone {
        return 0;
    }
    if invert { -scaled } else { scaled }
}

/// Side effects of an event beyond the intent state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    None,
    /// Log battery power
    Telemetry,
    /// Send every joint back home
    Recenter,
    /// Stop the control loop
    Shutdown,
}

/// Button code -> (pair, direction)
const BUTTONS: [(u16, Pair, Direction); 10] = [
    (BTN_L1, Pair::Waist, Direction::Negative),
    (BTN_R1, Pair::Waist, Direction::Positive),
    (BTN_SQUARE, Pair::Roll, Direction::Negative),
    (BTN_CIRCLE, Pair::Roll, Direction::Positive),
    (BTN_TRIANGLE, Pair::Pitch, Direction::Positive),
    (BTN_X, Pair::Pitch, Direction::Negative),
    (BTN_L2, Pair::Spin, Direction::Negative),
    (BTN_R2, Pair::Spin, Direction::Positive),
    (BTN_L3, Pair::Grabber, Direction::Positive),
    (BTN_R3, Pair::Grabber, Direction::Negative),
];

pub struct InputMapper {
    stick: StickConfig,
}

impl InputMapper {
    pub fn new(stick: StickConfig) -> Self {
        Self { stick }
    }

    /// Apply one event to the intent state
    pub fn apply(&self, event: &InputEvent, intent: &IntentState) -> InputAction {
        match event.kind {
            EventKind::Stick => {
                let (axis, invert) = match event.code {
                    STICK_LEFT_X => (Axis::Shoulder, true),
                    STICK_RIGHT_X => (Axis::Elbow, false),
                    _ => return InputAction::None,
                };
                let speed = scale_stick(event.value, self.stick.deadzone, self.stick.scale_to, invert);
                intent.set_speed(axis, speed);
                InputAction::None
            }
            EventKind::Button => self.apply_button(event.code, event.value, intent),
        }
    }

    fn apply_button(&self, code: u16, value: i32, intent: &IntentState) -> InputAction {
        if let Some(&(_, pair, direction)) = BUTTONS.iter().find(|(c, _, _)| *c == code) {
            match value {
                1 => intent.press(pair, direction),
                0 => intent.release(pair, direction),
                _ => {} // autorepeat
            }
            return InputAction::None;
        }

        if value != 1 {
            return InputAction::None;
        }
        match code {
            BTN_SHARE => InputAction::Telemetry,
            BTN_OPTIONS => InputAction::Recenter,
            BTN_PS => InputAction::Shutdown,
            _ => {
                debug!("Unmapped button {}", code);
                InputAction::None
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No gamepad named \"{0}\" found")]
    NotFound(String),

    #[error("Input stream closed")]
    Closed,
}

/// Blocking source of gamepad events
pub trait InputSource: Send {
    /// Wait up to `timeout` for events; an empty batch means nothing arrived
    fn next_events(&mut self, timeout: Duration) -> Result<Vec<InputEvent>, InputError>;
}

/// Gamepad read straight from its evdev node
pub struct EvdevSource {
    device: evdev::Device,
}

impl EvdevSource {
    pub fn open(path: &Path) -> Result<Self, InputError> {
        let device = evdev::Device::open(path)?;
        info!(
            "Gamepad {} opened at {}",
            device.name().unwrap_or("(unnamed)"),
            path.display()
        );
        Ok(Self { device })
    }

    /// First input device registered under `name`
    pub fn find(name: &str) -> Result<Self, InputError> {
        let path: PathBuf = evdev::enumerate()
            .find(|(_, device)| device.name() == Some(name))
            .map(|(path, _)| path)
            .ok_or_else(|| InputError::NotFound(name.to_string()))?;
        Self::open(&path)
    }
}

impl InputSource for EvdevSource {
    // Blocks until the device reports; a gamepad that goes quiet is still alive
    fn next_events(&mut self, _timeout: Duration) -> Result<Vec<InputEvent>, InputError> {
        let events = self
            .device
            .fetch_events()?
            .filter_map(|event| {
                let kind = match event.event_type() {
                    evdev::EventType::ABSOLUTE => EventKind::Stick,
                    evdev::EventType::KEY => EventKind::Button,
                    _ => return None,
                };
                Some(InputEvent {
                    kind,
                    code: event.code(),
                    value: event.value(),
                })
            })
            .collect();
        Ok(events)
    }
}

/// Gamepad events published as JSON by another machine
pub struct ZenohSource {
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
}

impl ZenohSource {
    pub fn new(subscriber: Subscriber<FifoChannelHandler<Sample>>) -> Self {
        Self { subscriber }
    }
}

impl InputSource for ZenohSource {
    fn next_events(&mut self, timeout: Duration) -> Result<Vec<InputEvent>, InputError> {
        let first = match self.subscriber.recv_timeout(timeout) {
            Ok(Some(sample)) => sample,
            Ok(None) => return Ok(Vec::new()),
            Err(_) => return Err(InputError::Closed),
        };

        let mut events = Vec::new();
        let mut sample = Some(first);
        while let Some(s) = sample {
            let payload = s.payload().to_bytes();
            match serde_json::from_slice::<InputEvent>(&payload) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Failed to parse gamepad event: {}", e),
            }
            // Drain whatever else is pending
            sample = match self.subscriber.try_recv() {
                Ok(next) => next,
                Err(_) => None,
            };
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> InputMapper {
        InputMapper::new(StickConfig::default())
    }

    #[test]
    fn test_scale_stick() {
        assert_eq!(scale_stick(0, 10, 80, false), -80);
        assert_eq!(scale_stick(255, 10, 80, false), 80);
        assert_eq!(scale_stick(255, 10, 80, true), -80);
        // Resting stick sits near 128
        assert_eq!(scale_stick(128, 10, 80, false), 0);
        assert_eq!(scale_stick(134, 10, 80, false), 0);
        assert_eq!(scale_stick(150, 10, 80, false), 14);
        // Out of range readings are clamped
        assert_eq!(scale_stick(300, 10, 80, false), 80);
    }

    #[test]
    fn test_sticks_set_speeds() {
        let intent = IntentState::new();
        let mapper = mapper();
        mapper.apply(&InputEvent::stick(STICK_LEFT_X, 255), &intent);
        mapper.apply(&InputEvent::stick(STICK_RIGHT_X, 255), &intent);
        assert_eq!(intent.speed(Axis::Shoulder), -80);
        assert_eq!(intent.speed(Axis::Elbow), 80);

        // Other axes are ignored
        mapper.apply(&InputEvent::stick(1, 0), &intent);
        assert_eq!(intent.speed(Axis::Elbow), 80);
    }

    #[test]
    fn test_opposing_press_replaces_direction() {
        let intent = IntentState::new();
        let mapper = mapper();
        mapper.apply(&InputEvent::button(BTN_L1, true), &intent);
        assert_eq!(intent.flags(Pair::Waist), (true, false));
        mapper.apply(&InputEvent::button(BTN_R1, true), &intent);
        assert_eq!(intent.flags(Pair::Waist), (false, true));

        // Releasing the button that is no longer active changes nothing
        mapper.apply(&InputEvent::button(BTN_L1, false), &intent);
        assert_eq!(intent.flags(Pair::Waist), (false, true));
        mapper.apply(&InputEvent::button(BTN_R1, false), &intent);
        assert_eq!(intent.flags(Pair::Waist), (false, false));
    }

    #[test]
    fn test_pairs_never_have_both_flags() {
        let intent = IntentState::new();
        let mapper = mapper();
        // Every interleaving of press/release over all paired buttons
        let mut seed: u32 = 0x2545_f491;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let (code, _, _) = BUTTONS[(seed % BUTTONS.len() as u32) as usize];
            let pressed = (seed >> 8) % 2 == 0;
            mapper.apply(&InputEvent::button(code, pressed), &intent);
            for pair in Pair::ALL {
                let (negative, positive) = intent.flags(pair);
                assert!(!(negative && positive));
            }
        }
    }

    #[test]
    fn test_button_mapping() {
        let intent = IntentState::new();
        let mapper = mapper();
        for (code, pair, direction) in [
            (BTN_SQUARE, Pair::Roll, Direction::Negative),
            (BTN_TRIANGLE, Pair::Pitch, Direction::Positive),
            (BTN_R2, Pair::Spin, Direction::Positive),
            (BTN_L3, Pair::Grabber, Direction::Positive),
        ] {
            mapper.apply(&InputEvent::button(code, true), &intent);
            assert_eq!(intent.direction(pair), direction);
        }
    }

    #[test]
    fn test_action_buttons() {
        let intent = IntentState::new();
        let mapper = mapper();
        let press = |code| mapper.apply(&InputEvent::button(code, true), &intent);
        assert_eq!(press(BTN_SHARE), InputAction::Telemetry);
        assert_eq!(press(BTN_OPTIONS), InputAction::Recenter);
        assert_eq!(press(BTN_PS), InputAction::Shutdown);
        // Release of an action button does nothing
        assert_eq!(
            mapper.apply(&InputEvent::button(BTN_PS, false), &intent),
            InputAction::None
        );
    }

    #[test]
    fn test_reset_clears_everything() {
        let intent = IntentState::new();
        intent.set_speed(Axis::Elbow, 40);
        intent.press(Pair::Spin, Direction::Negative);
        intent.reset();
        assert_eq!(intent.speed(Axis::Elbow), 0);
        assert_eq!(intent.direction(Pair::Spin), Direction::Idle);
    }
}
