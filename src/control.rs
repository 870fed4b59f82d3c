// Control loop: reconciles operator intent with the joints
//
// Commands are edge-triggered. A joint gets a new command only when what the
// intent asks of it changes, and a single stop when the intent goes idle while
// the joint is still moving. Nothing is re-sent every tick.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::feedback::{FeedbackSink, Lifecycle};
use crate::input::{Axis, Direction, IntentState, Pair};
use crate::joints::{Joint, JointId, JointSet};
use crate::motor::{self, Motor};
use crate::runtime::ArmContext;

/// How intent turns into motion for one joint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Policy {
    /// Stick speed drives toward a limit: positive toward `min_pos`, negative toward `max_pos`
    Proportional,
    /// Buttons drive toward `min_pos`/`max_pos` at a fixed speed
    ToLimit { speed: i32 },
    /// Buttons rotate at a fixed speed with no target
    Continuous { speed: i32 },
}

/// Last motion command sent to a joint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Issued {
    ToPosition { speed: i32, target: i32 },
    Rotate { speed: i32 },
}

/// Command the intent currently asks of a joint, `None` when idle
fn wanted(joint: &Joint, intent: &IntentState) -> Option<Issued> {
    let motor = &joint.motor;
    match joint.policy {
        Policy::Proportional => {
            let speed = intent.speed(Axis::of(joint.id)?);
            match speed {
                0 => None,
                s if s > 0 => Some(Issued::ToPosition {
                    speed,
                    target: motor.min_pos(),
                }),
                _ => Some(Issued::ToPosition {
                    speed,
                    target: motor.max_pos(),
                }),
            }
        }
        Policy::ToLimit { speed } => match intent.direction(Pair::of(joint.id)?) {
            Direction::Idle => None,
            Direction::Negative => Some(Issued::ToPosition {
                speed,
                target: motor.min_pos(),
            }),
            Direction::Positive => Some(Issued::ToPosition {
                speed,
                target: motor.max_pos(),
            }),
        },
        Policy::Continuous { speed } => match intent.direction(Pair::of(joint.id)?) {
            Direction::Idle => None,
            Direction::Negative => Some(Issued::Rotate { speed: -speed }),
            Direction::Positive => Some(Issued::Rotate { speed }),
        },
    }
}

pub struct ControlLoop {
    issued: HashMap<JointId, Issued>,
    period: Option<Duration>,
}

impl ControlLoop {
    /// `period` of `None` polls as fast as the motors answer
    pub fn new(period: Option<Duration>) -> Self {
        Self {
            issued: HashMap::new(),
            period,
        }
    }

    /// One pass over every enabled joint, in control order.
    ///
    /// Returns joints that became unavailable during this pass; they are
    /// disabled and get no further commands.
    pub fn tick(&mut self, joints: &mut JointSet, intent: &IntentState) -> Vec<JointId> {
        let mut faulted = Vec::new();
        for joint in joints.iter_mut() {
            if !joint.is_enabled() {
                continue;
            }
            match self.step(joint, intent) {
                Ok(()) => {}
                Err(e) if e.is_unavailable() => {
                    error!("{} unavailable, disabling it: {}", joint.id, e);
                    faulted.push(joint.id);
                }
                Err(e) => warn!("{} command failed: {}", joint.id, e),
            }
        }
        for id in &faulted {
            joints.disable(*id);
            self.issued.remove(id);
        }
        faulted
    }

    fn step(&mut self, joint: &mut Joint, intent: &IntentState) -> motor::Result<()> {
        let last = self.issued.get(&joint.id).copied();
        match wanted(joint, intent) {
            Some(command) if last == Some(command) => Ok(()),
            Some(command) => {
                // Recorded before sending so a failing command isn't retried every tick
                self.issued.insert(joint.id, command);
                match command {
                    Issued::ToPosition { speed, target } => {
                        joint.motor.on_to_position(speed, target, true, false)
                    }
                    Issued::Rotate { speed } => joint.motor.on(speed),
                }
            }
            None if !self.issued.contains_key(&joint.id) => Ok(()),
            None => {
                // Forgotten only once the joint is known to be still, so a
                // failed stop is retried next tick
                if joint.motor.is_running()? {
                    joint.motor.stop()?;
                }
                self.issued.remove(&joint.id);
                Ok(())
            }
        }
    }

    /// Send every joint home; the loop forgets what it last commanded.
    ///
    /// Returns joints found unavailable on the way, now disabled.
    pub fn recenter(&mut self, joints: &mut JointSet) -> Vec<JointId> {
        self.issued.clear();
        let mut faulted = Vec::new();
        for (id, e) in joints.recenter() {
            if e.is_unavailable() {
                joints.disable(id);
                faulted.push(id);
            }
        }
        faulted
    }

    /// Run until the context's running flag drops, then stop every joint
    pub fn run(&mut self, ctx: &ArmContext, feedback: &mut dyn FeedbackSink) {
        info!("Starting main loop...");
        feedback.notify(&Lifecycle::EngineStarted);

        while ctx.is_running() {
            if ctx.take_recenter() {
                feedback.notify(&Lifecycle::Recentering);
                let faulted = self.recenter(&mut ctx.joints());
                for id in faulted {
                    feedback.notify(&Lifecycle::JointFault(id));
                }
            }

            let faulted = self.tick(&mut ctx.joints(), ctx.intent());
            for id in faulted {
                feedback.notify(&Lifecycle::JointFault(id));
            }

            match self.period {
                Some(period) => thread::sleep(period),
                None => thread::yield_now(),
            }
        }

        info!("Engine stopping!");
        feedback.notify(&Lifecycle::ShuttingDown);
        let failures = ctx.joints().stop_all();
        if !failures.is_empty() {
            warn!("{} joint(s) failed to stop", failures.len());
        }
        feedback.notify(&Lifecycle::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibratedMotor;
    use crate::feedback::RecordingFeedback;
    use crate::motor::mock::{Command, MockMotor};
    use std::sync::Arc;

    fn joint(id: JointId, mock: &MockMotor, policy: Policy) -> Joint {
        // Uncalibrated range of 1000 ticks: [-500, 500]
        let motor = CalibratedMotor::limited(id.name(), Box::new(mock.clone()), 30, 1000);
        Joint::new(id, motor, policy)
    }

    fn single(id: JointId, mock: &MockMotor, policy: Policy) -> JointSet {
        let mut set = JointSet::new();
        set.insert(joint(id, mock, policy));
        set
    }

    #[test]
    fn test_proportional_elbow_scenario() {
        let elbow = MockMotor::new("elbow");
        let mut joints = single(JointId::Elbow, &elbow, Policy::Proportional);
        let intent = IntentState::new();
        let mut control = ControlLoop::new(None);

        let mut per_tick = Vec::new();
        for speed in [50, 50, 0, -30] {
            intent.set_speed(Axis::Elbow, speed);
            elbow.clear();
            control.tick(&mut joints, &intent);
            per_tick.push(elbow.commands());
        }

        assert_eq!(
            per_tick,
            vec![
                vec![Command::OnToPosition {
                    speed: 50,
                    ticks: -500,
                    brake: true,
                    wait: false
                }],
                vec![],
                vec![Command::Stop],
                vec![Command::OnToPosition {
                    speed: -30,
                    ticks: 500,
                    brake: true,
                    wait: false
                }],
            ]
        );
    }

    #[test]
    fn test_proportional_idle_stopped_joint_gets_nothing() {
        let shoulder = MockMotor::new("shoulder");
        let mut joints = single(JointId::Shoulder, &shoulder, Policy::Proportional);
        let intent = IntentState::new();
        let mut control = ControlLoop::new(None);

        for _ in 0..5 {
            control.tick(&mut joints, &intent);
        }
        assert!(shoulder.commands().is_empty());
    }

    #[test]
    fn test_proportional_speed_change_reissues() {
        let elbow = MockMotor::new("elbow");
        let mut joints = single(JointId::Elbow, &elbow, Policy::Proportional);
        let intent = IntentState::new();
        let mut control = ControlLoop::new(None);

        intent.set_speed(Axis::Elbow, 20);
        control.tick(&mut joints, &intent);
        intent.set_speed(Axis::Elbow, 60);
        control.tick(&mut joints, &intent);

        let speeds: Vec<i32> = elbow
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::OnToPosition { speed, .. } => Some(*speed),
                _ => None,
            })
            .collect();
        assert_eq!(speeds, vec![20, 60]);
    }

    #[test]
    fn test_bang_bang_single_stop_per_release() {
        let roll = MockMotor::new("roll");
        let mut joints = single(JointId::Roll, &roll, Policy::ToLimit { speed: 25 });
        let intent = IntentState::new();
        let mut control = ControlLoop::new(None);

        intent.press(Pair::Roll, Direction::Negative);
        for _ in 0..3 {
            control.tick(&mut joints, &intent);
        }
        intent.release(Pair::Roll, Direction::Negative);
        for _ in 0..3 {
            control.tick(&mut joints, &intent);
        }

        assert_eq!(
            roll.commands(),
            vec![
                Command::OnToPosition {
                    speed: 25,
                    ticks: -500,
                    brake: true,
                    wait: false
                },
                Command::Stop
            ]
        );
    }

    #[test]
    fn test_bang_bang_no_stop_when_already_arrived() {
        let spin = MockMotor::new("spin");
        let mut joints = single(JointId::Spin, &spin, Policy::ToLimit { speed: 25 });
        let intent = IntentState::new();
        let mut control = ControlLoop::new(None);

        intent.press(Pair::Spin, Direction::Positive);
        control.tick(&mut joints, &intent);
        // Reached its limit on its own
        spin.set_running(false);
        intent.release(Pair::Spin, Direction::Positive);
        control.tick(&mut joints, &intent);

        assert!(!spin.commands().contains(&Command::Stop));
    }

    #[test]
    fn test_failed_stop_is_retried() {
        let pitch = MockMotor::new("pitch");
        let mut joints = single(JointId::Pitch, &pitch, Policy::Continuous { speed: 10 });
        let intent = IntentState::new();
        let mut control = ControlLoop::new(None);

        intent.press(Pair::Pitch, Direction::Positive);
        control.tick(&mut joints, &intent);
        intent.release(Pair::Pitch, Direction::Positive);
        pitch.fail_queries(1);
        for _ in 0..5 {
            control.tick(&mut joints, &intent);
        }

        assert_eq!(pitch.commands(), vec![Command::On(10), Command::Stop]);
        assert!(joints.get(JointId::Pitch).unwrap().is_enabled());
    }

    #[test]
    fn test_recenter_reports_unavailable_joints() {
        let elbow = MockMotor::new("elbow");
        let waist = MockMotor::new("waist");
        let mut joints = JointSet::new();
        joints.insert(joint(JointId::Elbow, &elbow, Policy::Proportional));
        joints.insert(joint(JointId::Waist, &waist, Policy::Continuous { speed: 25 }));
        waist.disconnect();

        let faulted = ControlLoop::new(None).recenter(&mut joints);
        assert_eq!(faulted, vec![JointId::Waist]);
        assert!(!joints.get(JointId::Waist).unwrap().is_enabled());
        assert!(joints.get(JointId::Elbow).unwrap().is_enabled());
    }

    #[test]
    fn test_continuous_direction_switch() {
        let waist = MockMotor::new("waist");
        let mut joints = single(JointId::Waist, &waist, Policy::Continuous { speed: 25 });
        let intent = IntentState::new();
        let mut control = ControlLoop::new(None);

        intent.press(Pair::Waist, Direction::Negative);
        control.tick(&mut joints, &intent);
        intent.press(Pair::Waist, Direction::Positive);
        control.tick(&mut joints, &intent);
        control.tick(&mut joints, &intent);
        intent.release(Pair::Waist, Direction::Positive);
        control.tick(&mut joints, &intent);

        assert_eq!(
            waist.commands(),
            vec![Command::On(-25), Command::On(25), Command::Stop]
        );
    }

    #[test]
    fn test_unavailable_joint_is_disabled() {
        let elbow = MockMotor::new("elbow");
        let waist = MockMotor::new("waist");
        let mut joints = JointSet::new();
        joints.insert(joint(JointId::Elbow, &elbow, Policy::Proportional));
        joints.insert(joint(JointId::Waist, &waist, Policy::Continuous { speed: 25 }));
        let intent = IntentState::new();
        let mut control = ControlLoop::new(None);
        elbow.disconnect();

        intent.set_speed(Axis::Elbow, 40);
        intent.press(Pair::Waist, Direction::Positive);
        let faulted = control.tick(&mut joints, &intent);
        assert_eq!(faulted, vec![JointId::Elbow]);
        assert!(!joints.get(JointId::Elbow).unwrap().is_enabled());

        // Other joints keep working, the dead one gets nothing more
        intent.set_speed(Axis::Elbow, -40);
        control.tick(&mut joints, &intent);
        assert_eq!(elbow.commands().len(), 1);
        assert_eq!(waist.commands(), vec![Command::On(25)]);
    }

    #[test]
    fn test_run_stops_every_joint_on_exit() {
        let mocks: Vec<MockMotor> = JointId::ALL
            .iter()
            .map(|id| MockMotor::new(id.name()))
            .collect();
        let mut joints = JointSet::new();
        for (id, mock) in JointId::ALL.iter().zip(&mocks) {
            let policy = if id.has_stick() {
                Policy::Proportional
            } else {
                Policy::Continuous { speed: 10 }
            };
            joints.insert(joint(*id, mock, policy));
        }
        mocks[3].disconnect();

        let ctx = Arc::new(ArmContext::new(joints, Vec::new()));
        let (mut feedback, events) = RecordingFeedback::new();
        let handle = {
            let ctx = ctx.clone();
            thread::spawn(move || ControlLoop::new(None).run(&ctx, &mut feedback))
        };
        thread::sleep(Duration::from_millis(20));
        ctx.request_stop();
        handle.join().unwrap();

        for mock in &mocks {
            let stops = mock
                .commands()
                .iter()
                .filter(|c| **c == Command::Stop)
                .count();
            assert_eq!(stops, 1);
        }
        let events = events.lock().unwrap();
        assert_eq!(events.first(), Some(&Lifecycle::EngineStarted));
        assert_eq!(events.last(), Some(&Lifecycle::Stopped));
    }

    #[test]
    fn test_recenter_request_is_served() {
        let elbow = MockMotor::new("elbow");
        let ctx = Arc::new(ArmContext::new(
            single(JointId::Elbow, &elbow, Policy::Proportional),
            Vec::new(),
        ));
        ctx.request_recenter();
        let (mut feedback, events) = RecordingFeedback::new();
        let handle = {
            let ctx = ctx.clone();
            thread::spawn(move || ControlLoop::new(Some(Duration::from_millis(1))).run(&ctx, &mut feedback))
        };
        thread::sleep(Duration::from_millis(20));
        ctx.request_stop();
        handle.join().unwrap();

        assert_eq!(
            elbow.commands()[0],
            Command::OnToPosition {
                speed: crate::config::SPEED_SLOW,
                ticks: 0,
                brake: true,
                wait: true
            }
        );
        assert!(events.lock().unwrap().contains(&Lifecycle::Recentering));
    }
}
