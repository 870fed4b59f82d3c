// Operator feedback on lifecycle transitions
//
// Fire-and-forget: a sink that fails logs it and carries on, nothing in the
// control path depends on feedback being delivered.

use tracing::{info, warn};
use zenoh::Wait;
use zenoh::pubsub::Publisher;

use crate::joints::JointId;
use crate::messages::ArmHealth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    EngineStarted,
    Calibrating,
    Calibrated,
    CalibrationFailed,
    Recentering,
    ShuttingDown,
    Stopped,
    JointFault(JointId),
}

impl Lifecycle {
    /// Health to publish for this transition, if it changes it
    pub fn health(&self) -> Option<ArmHealth> {
        match self {
            Lifecycle::EngineStarted => Some(ArmHealth::Running),
            Lifecycle::Calibrating => Some(ArmHealth::Calibrating),
            Lifecycle::CalibrationFailed => Some(ArmHealth::CalibrationFailed),
            Lifecycle::Stopped => Some(ArmHealth::Stopped),
            Lifecycle::JointFault(joint) => Some(ArmHealth::JointFault {
                joint: joint.to_string(),
            }),
            Lifecycle::Calibrated | Lifecycle::Recentering | Lifecycle::ShuttingDown => None,
        }
    }
}

pub trait FeedbackSink: Send {
    fn notify(&mut self, event: &Lifecycle);
}

/// Lifecycle transitions as log lines
pub struct LogFeedback;

impl FeedbackSink for LogFeedback {
    fn notify(&mut self, event: &Lifecycle) {
        match event {
            Lifecycle::EngineStarted => info!("Engine running!"),
            Lifecycle::Calibrating => info!("Calibrating motors..."),
            Lifecycle::Calibrated => info!("Motors calibrated"),
            Lifecycle::CalibrationFailed => warn!("Calibration failed, arm stopped"),
            Lifecycle::Recentering => info!("Recentering arm"),
            Lifecycle::ShuttingDown => info!("Shutting down..."),
            Lifecycle::Stopped => info!("All motors stopped"),
            Lifecycle::JointFault(joint) => warn!("Joint {} faulted and was disabled", joint),
        }
    }
}

/// Publishes `ArmHealth` JSON for remote observers
pub struct HealthPublisher {
    publisher: Publisher<'static>,
}

impl HealthPublisher {
    pub fn new(publisher: Publisher<'static>) -> Self {
        let mut health = Self { publisher };
        health.publish(&ArmHealth::Starting);
        health
    }

    fn publish(&mut self, health: &ArmHealth) {
        let json = match serde_json::to_string(health) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode health: {}", e);
                return;
            }
        };
        if let Err(e) = self.publisher.put(json).wait() {
            warn!("Failed to publish health: {}", e);
        }
    }
}

impl FeedbackSink for HealthPublisher {
    fn notify(&mut self, event: &Lifecycle) {
        if let Some(health) = event.health() {
            self.publish(&health);
        }
    }
}

/// Forwards every event to each of its sinks
#[derive(Default)]
pub struct Feedback {
    sinks: Vec<Box<dyn FeedbackSink>>,
}

impl Feedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl FeedbackSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl FeedbackSink for Feedback {
    fn notify(&mut self, event: &Lifecycle) {
        for sink in self.sinks.iter_mut() {
            sink.notify(event);
        }
    }
}

/// Keeps every event for inspection by tests
#[cfg(test)]
pub(crate) struct RecordingFeedback {
    events: std::sync::Arc<std::sync::Mutex<Vec<Lifecycle>>>,
}

#[cfg(test)]
impl RecordingFeedback {
    pub fn new() -> (Self, std::sync::Arc<std::sync::Mutex<Vec<Lifecycle>>>) {
        let events = std::sync::Arc::default();
        let sink = Self {
            events: std::sync::Arc::clone(&events),
        };
        (sink, events)
    }
}

#[cfg(test)]
impl FeedbackSink for RecordingFeedback {
    fn notify(&mut self, event: &Lifecycle) {
        if let Ok(mut events) = self.events.lock() {
            events.push(*event);
        }
    }
}
