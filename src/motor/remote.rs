// Motors and sensors hosted on the second controller, reached through the zenoh bridge
//
// Each operation is one synchronous query/reply. A query that gets no answer
// within the link timeout surfaces as `DeviceUnavailable`, never as a hang.

use std::time::Duration;
use tracing::debug;
use zenoh::{Session, Wait};

use super::{ColorSensor, Motor, MotorError, MotorStatus, Result, StopAction, TouchSensor};
use crate::messages::{BridgeOutcome, BridgeReply, BridgeRequest, PowerReading};
use crate::telemetry::PowerMonitor;

/// Target name used for power queries on the bridge host
pub const POWER_TARGET: &str = "power";

/// Request/response link to the bridge host
#[derive(Clone)]
pub struct RemoteLink {
    session: Session,
    prefix: String,
    timeout: Duration,
}

impl RemoteLink {
    pub fn new(session: Session, prefix: &str, timeout: Duration) -> Self {
        Self {
            session,
            prefix: prefix.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Send one request to `target` on the bridge host and wait for its reply
    pub fn call(&self, target: &str, request: &BridgeRequest) -> Result<BridgeReply> {
        let key = format!("{}/{}", self.prefix, target);
        let payload =
            serde_json::to_string(request).map_err(|e| MotorError::protocol(target, e))?;
        debug!("Bridge call {}: {}", key, payload);

        let replies = self
            .session
            .get(key.as_str())
            .payload(payload)
            .timeout(self.timeout)
            .wait()
            .map_err(|e| MotorError::unavailable(target, e))?;

        let reply = replies
            .recv()
            .map_err(|_| MotorError::unavailable(target, "no reply from bridge"))?;
        let sample = reply.result().map_err(|err| {
            MotorError::protocol(
                target,
                format!(
                    "bridge error: {}",
                    String::from_utf8_lossy(&err.payload().to_bytes())
                ),
            )
        })?;

        let outcome: BridgeOutcome = serde_json::from_slice(&sample.payload().to_bytes())
            .map_err(|e| MotorError::protocol(target, e))?;
        outcome
    }
}

fn unexpected(port: &str, reply: BridgeReply) -> MotorError {
    MotorError::protocol(port, format!("unexpected reply {:?}", reply))
}

/// Motor handle on a port of the bridge host
pub struct RemoteMotor {
    link: RemoteLink,
    port: String,
}

impl RemoteMotor {
    /// Bind to a remote port, failing if the bridge host doesn't know it
    pub fn connect(link: RemoteLink, port: &str) -> Result<Self> {
        let mut motor = Self {
            link,
            port: port.to_string(),
        };
        motor.command(BridgeRequest::Probe)?;
        Ok(motor)
    }

    fn command(&mut self, request: BridgeRequest) -> Result<()> {
        match self.link.call(&self.port, &request)? {
            BridgeReply::Done => Ok(()),
            other => Err(unexpected(&self.port, other)),
        }
    }
}

impl Motor for RemoteMotor {
    fn port(&self) -> &str {
        &self.port
    }

    fn on(&mut self, speed: i32) -> Result<()> {
        self.command(BridgeRequest::On { speed })
    }

    fn on_to_position(&mut self, speed: i32, ticks: i32, brake: bool, wait: bool) -> Result<()> {
        self.command(BridgeRequest::OnToPosition {
            speed,
            ticks,
            brake,
            wait,
        })
    }

    fn stop(&mut self) -> Result<()> {
        self.command(BridgeRequest::Stop)
    }

    fn reset(&mut self) -> Result<()> {
        self.command(BridgeRequest::Reset)
    }

    fn position(&mut self) -> Result<i32> {
        match self.link.call(&self.port, &BridgeRequest::Position)? {
            BridgeReply::Position(ticks) => Ok(ticks),
            other => Err(unexpected(&self.port, other)),
        }
    }

    fn is_running(&mut self) -> Result<bool> {
        match self.link.call(&self.port, &BridgeRequest::IsRunning)? {
            BridgeReply::Running(running) => Ok(running),
            other => Err(unexpected(&self.port, other)),
        }
    }

    fn status(&mut self) -> Result<MotorStatus> {
        match self.link.call(&self.port, &BridgeRequest::Status)? {
            BridgeReply::Status(status) => Ok(status),
            other => Err(unexpected(&self.port, other)),
        }
    }

    fn set_stop_action(&mut self, action: StopAction) -> Result<()> {
        self.command(BridgeRequest::SetStopAction { action })
    }
}

/// Color or touch sensor on the bridge host
pub struct RemoteSensor {
    link: RemoteLink,
    port: String,
}

impl RemoteSensor {
    pub fn new(link: RemoteLink, port: &str) -> Self {
        Self {
            link,
            port: port.to_string(),
        }
    }

    /// Bind to a color sensor, failing if the bridge host doesn't serve one on `port`
    pub fn connect_color(link: RemoteLink, port: &str) -> Result<Self> {
        let mut sensor = Self::new(link, port);
        sensor.color()?;
        Ok(sensor)
    }

    /// Bind to a touch sensor, failing if the bridge host doesn't serve one on `port`
    pub fn connect_touch(link: RemoteLink, port: &str) -> Result<Self> {
        let mut sensor = Self::new(link, port);
        sensor.is_pressed()?;
        Ok(sensor)
    }
}

impl ColorSensor for RemoteSensor {
    fn color(&mut self) -> Result<i32> {
        match self.link.call(&self.port, &BridgeRequest::Color)? {
            BridgeReply::Color(color) => Ok(color),
            other => Err(unexpected(&self.port, other)),
        }
    }
}

impl TouchSensor for RemoteSensor {
    fn is_pressed(&mut self) -> Result<bool> {
        match self.link.call(&self.port, &BridgeRequest::IsPressed)? {
            BridgeReply::Pressed(pressed) => Ok(pressed),
            other => Err(unexpected(&self.port, other)),
        }
    }
}

/// Battery of the bridge host
pub struct RemotePower {
    link: RemoteLink,
}

impl RemotePower {
    pub fn new(link: RemoteLink) -> Self {
        Self { link }
    }
}

impl PowerMonitor for RemotePower {
    fn label(&self) -> &str {
        "Remote"
    }

    fn read(&mut self) -> Result<PowerReading> {
        match self.link.call(POWER_TARGET, &BridgeRequest::Power)? {
            BridgeReply::Power(reading) => Ok(reading),
            other => Err(unexpected(POWER_TARGET, other)),
        }
    }
}
