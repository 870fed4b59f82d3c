// Bridge host: serves this controller's motors and sensors to the arm runtime
//
// Every port is a key under the bridge prefix (`arm/bridge/outA`, ...). A query
// carries one JSON `BridgeRequest` and gets one JSON `BridgeOutcome` back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use zenoh::{Session, Wait};

use crate::config::BridgeConfig;
use crate::messages::{BridgeOutcome, BridgeReply, BridgeRequest};
use crate::motor::remote::POWER_TARGET;
use crate::motor::{
    ColorSensor, FeetechBus, MAX_SPEED_PERCENT, Motor, MotorError, ServoMotor, SimAxis,
    SimColorSensor, SimMotor, SimTouchSensor, TouchSensor,
};
use crate::telemetry::{PowerMonitor, ServoBusPower, SimPower};

/// How long the serve loop waits for a query before checking the running flag
const QUERY_POLL: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct BridgeEndpoint {
    motors: HashMap<String, Box<dyn Motor>>,
    color_sensors: HashMap<String, Box<dyn ColorSensor>>,
    touch_sensors: HashMap<String, Box<dyn TouchSensor>>,
    power: Option<Box<dyn PowerMonitor>>,
}

impl BridgeEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_motor(mut self, port: &str, motor: Box<dyn Motor>) -> Self {
        self.motors.insert(port.to_string(), motor);
        self
    }

    pub fn with_color_sensor(mut self, port: &str, sensor: Box<dyn ColorSensor>) -> Self {
        self.color_sensors.insert(port.to_string(), sensor);
        self
    }

    pub fn with_touch_sensor(mut self, port: &str, sensor: Box<dyn TouchSensor>) -> Self {
        self.touch_sensors.insert(port.to_string(), sensor);
        self
    }

    pub fn with_power(mut self, power: Box<dyn PowerMonitor>) -> Self {
        self.power = Some(power);
        self
    }

    /// Every configured port simulated. Sensors always read as aligned.
    pub fn sim(config: &BridgeConfig) -> Self {
        let half = config.sim_travel.abs() / 2;
        let mut endpoint = Self::new().with_power(Box::new(SimPower::new("Remote", 7.9, 0.2)));
        for port in &config.motors {
            let axis = SimAxis::new(-half, half, 0);
            endpoint = endpoint.with_motor(
                &port.name,
                Box::new(SimMotor::new(&port.name, axis, MAX_SPEED_PERCENT)),
            );
        }
        for port in &config.color_sensors {
            let fixed = SimAxis::new(0, 0, 0);
            let sensor = SimColorSensor::new(fixed, 0, 0, config.sim_color);
            endpoint = endpoint.with_color_sensor(port, Box::new(sensor));
        }
        for port in &config.touch_sensors {
            let sensor = SimTouchSensor::new(SimAxis::new(0, 0, 0));
            endpoint = endpoint.with_touch_sensor(port, Box::new(sensor));
        }
        endpoint
    }

    /// Servos on the host's own Feetech bus. Servos that don't answer are left
    /// out, so probing their port reports them unavailable.
    pub fn live(config: &BridgeConfig, serial_port: &str) -> Result<Self, MotorError> {
        let bus = FeetechBus::open(serial_port).map_err(|e| MotorError::unavailable(serial_port, e))?;
        let bus = Arc::new(Mutex::new(bus));

        let mut endpoint = Self::new();
        for port in &config.motors {
            match ServoMotor::connect(bus.clone(), port.id, MAX_SPEED_PERCENT) {
                Ok(servo) => {
                    if endpoint.power.is_none() {
                        endpoint.power = Some(Box::new(ServoBusPower::new(bus.clone(), port.id)));
                    }
                    endpoint = endpoint.with_motor(&port.name, Box::new(servo));
                }
                Err(e) => warn!("Port {} not served: {}", port.name, e),
            }
        }
        for port in config.color_sensors.iter().chain(&config.touch_sensors) {
            warn!("Sensor {} has no driver on a servo bus, not served", port);
        }
        Ok(endpoint)
    }

    pub fn ports(&self) -> Vec<&str> {
        let mut ports: Vec<&str> = self
            .motors
            .keys()
            .chain(self.color_sensors.keys())
            .chain(self.touch_sensors.keys())
            .map(String::as_str)
            .collect();
        ports.sort();
        ports
    }

    /// Execute one request against `target`
    pub fn handle(&mut self, target: &str, request: &BridgeRequest) -> BridgeOutcome {
        debug!("Bridge {} <- {:?}", target, request);
        match request {
            BridgeRequest::Power => {
                let power = self
                    .power
                    .as_mut()
                    .ok_or_else(|| MotorError::not_supported(POWER_TARGET, "power readings"))?;
                return power.read().map(BridgeReply::Power);
            }
            BridgeRequest::Color => {
                let sensor = self
                    .color_sensors
                    .get_mut(target)
                    .ok_or_else(|| MotorError::unavailable(target, "no color sensor on this port"))?;
                return sensor.color().map(BridgeReply::Color);
            }
            BridgeRequest::IsPressed => {
                let sensor = self
                    .touch_sensors
                    .get_mut(target)
                    .ok_or_else(|| MotorError::unavailable(target, "no touch sensor on this port"))?;
                return sensor.is_pressed().map(BridgeReply::Pressed);
            }
            _ => {}
        }

        let motor = self
            .motors
            .get_mut(target)
            .ok_or_else(|| MotorError::unavailable(target, "no motor on this port"))?;
        match *request {
            BridgeRequest::Probe => Ok(BridgeReply::Done),
            BridgeRequest::On { speed } => motor.on(speed).map(|_| BridgeReply::Done),
            BridgeRequest::OnToPosition {
                speed,
                ticks,
                brake,
                wait,
            } => motor
                .on_to_position(speed, ticks, brake, wait)
                .map(|_| BridgeReply::Done),
            BridgeRequest::Stop => motor.stop().map(|_| BridgeReply::Done),
            BridgeRequest::Reset => motor.reset().map(|_| BridgeReply::Done),
            BridgeRequest::Position => motor.position().map(BridgeReply::Position),
            BridgeRequest::IsRunning => motor.is_running().map(BridgeReply::Running),
            BridgeRequest::Status => motor.status().map(BridgeReply::Status),
            BridgeRequest::SetStopAction { action } => {
                motor.set_stop_action(action).map(|_| BridgeReply::Done)
            }
            BridgeRequest::Color | BridgeRequest::IsPressed | BridgeRequest::Power => {
                Err(MotorError::not_supported(target, "sensor request on a motor"))
            }
        }
    }

    /// Decode a raw request payload, run it, and encode the outcome
    pub fn handle_payload(&mut self, target: &str, payload: &[u8]) -> String {
        let outcome = match serde_json::from_slice::<BridgeRequest>(payload) {
            Ok(request) => self.handle(target, &request),
            Err(e) => Err(MotorError::protocol(target, e)),
        };
        match serde_json::to_string(&outcome) {
            Ok(json) => json,
            // An outcome is plain data; fall back to a protocol error string
            Err(e) => format!(
                r#"{{"Err":{{"kind":"protocol","port":"{}","reason":"{}"}}}}"#,
                target, e
            ),
        }
    }

    pub fn stop_all(&mut self) {
        for (port, motor) in self.motors.iter_mut() {
            if let Err(e) = motor.stop() {
                warn!("Failed to stop {}: {}", port, e);
            }
        }
    }
}

/// Answer bridge queries until `running` drops, then stop every served motor
pub fn serve(
    session: &Session,
    prefix: &str,
    endpoint: &mut BridgeEndpoint,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let prefix = prefix.trim_end_matches('/');
    let queryable = session.declare_queryable(format!("{}/**", prefix)).wait()?;
    info!("Bridge serving {:?} under {}/", endpoint.ports(), prefix);

    let result = serve_queries(&queryable, prefix, endpoint, running);
    info!("Bridge stopping, halting motors");
    endpoint.stop_all();
    result
}

fn serve_queries(
    queryable: &zenoh::query::Queryable<zenoh::handlers::FifoChannelHandler<zenoh::query::Query>>,
    prefix: &str,
    endpoint: &mut BridgeEndpoint,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    while running.load(Ordering::SeqCst) {
        let query = match queryable.recv_timeout(QUERY_POLL) {
            Ok(Some(query)) => query,
            Ok(None) => continue,
            Err(_) => break, // session closed
        };
        let key = query.key_expr().as_str().to_string();
        let target = key
            .strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(key.as_str());
        let payload = query
            .payload()
            .map(|p| p.to_bytes().into_owned())
            .unwrap_or_default();

        let json = endpoint.handle_payload(target, &payload);
        query.reply(query.key_expr().clone(), json).wait()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgePort;
    use crate::motor::mock::{Command, MockMotor};
    use crate::motor::StopAction;

    #[test]
    fn test_motor_requests_reach_the_motor() {
        let mock = MockMotor::new("outA");
        let mut endpoint = BridgeEndpoint::new().with_motor("outA", Box::new(mock.clone()));

        assert_eq!(
            endpoint.handle("outA", &BridgeRequest::Probe),
            Ok(BridgeReply::Done)
        );
        endpoint
            .handle("outA", &BridgeRequest::On { speed: 25 })
            .unwrap();
        endpoint
            .handle(
                "outA",
                &BridgeRequest::SetStopAction {
                    action: StopAction::Coast,
                },
            )
            .unwrap();
        assert_eq!(
            endpoint.handle("outA", &BridgeRequest::IsRunning),
            Ok(BridgeReply::Running(true))
        );
        assert_eq!(
            mock.commands(),
            vec![Command::On(25), Command::SetStopAction(StopAction::Coast)]
        );
    }

    #[test]
    fn test_unknown_port_is_unavailable() {
        let mut endpoint = BridgeEndpoint::new();
        let err = endpoint.handle("outD", &BridgeRequest::Probe).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_motor_errors_travel_back() {
        let mock = MockMotor::new("outB");
        mock.disconnect();
        let mut endpoint = BridgeEndpoint::new().with_motor("outB", Box::new(mock));

        let json = endpoint.handle_payload("outB", br#"{"op":"stop"}"#);
        let outcome: BridgeOutcome = serde_json::from_str(&json).unwrap();
        assert!(outcome.unwrap_err().is_unavailable());
    }

    #[test]
    fn test_malformed_request_is_protocol_error() {
        let mut endpoint = BridgeEndpoint::new();
        let json = endpoint.handle_payload("outA", b"not json");
        let outcome: BridgeOutcome = serde_json::from_str(&json).unwrap();
        assert!(matches!(outcome, Err(MotorError::Protocol { .. })));
    }

    #[test]
    fn test_sim_endpoint_serves_config() {
        let config = BridgeConfig {
            motors: vec![BridgePort {
                name: "outC".to_string(),
                id: 3,
            }],
            color_sensors: vec!["in1".to_string()],
            touch_sensors: vec!["in2".to_string()],
            sim_travel: 600,
            sim_color: 5,
        };
        let mut endpoint = BridgeEndpoint::sim(&config);

        assert_eq!(endpoint.ports(), vec!["in1", "in2", "outC"]);
        assert_eq!(
            endpoint.handle("in1", &BridgeRequest::Color),
            Ok(BridgeReply::Color(5))
        );
        assert_eq!(
            endpoint.handle("in2", &BridgeRequest::IsPressed),
            Ok(BridgeReply::Pressed(true))
        );
        assert!(matches!(
            endpoint.handle(POWER_TARGET, &BridgeRequest::Power),
            Ok(BridgeReply::Power(_))
        ));
        // A sensor request to a motor port is not a sensor
        assert!(endpoint.handle("outC", &BridgeRequest::Color).is_err());
    }

    #[test]
    fn test_stop_all_continues_past_failures() {
        let dead = MockMotor::new("outA");
        dead.disconnect();
        let alive = MockMotor::new("outB");
        let mut endpoint = BridgeEndpoint::new()
            .with_motor("outA", Box::new(dead))
            .with_motor("outB", Box::new(alive.clone()));

        endpoint.stop_all();
        assert_eq!(alive.commands(), vec![Command::Stop]);
    }
}
