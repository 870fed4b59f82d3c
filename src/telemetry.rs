// Battery telemetry for the local and remote controllers

use tracing::{info, warn};

use crate::messages::PowerReading;
use crate::motor::{MotorError, SharedBus};

pub trait PowerMonitor: Send {
    /// "Local" or "Remote", as printed in the power log line
    fn label(&self) -> &str;

    fn read(&mut self) -> Result<PowerReading, MotorError>;
}

/// Supply voltage and current as measured by one servo on the bus
pub struct ServoBusPower {
    bus: SharedBus,
    id: u8,
}

impl ServoBusPower {
    pub fn new(bus: SharedBus, id: u8) -> Self {
        Self { bus, id }
    }
}

impl PowerMonitor for ServoBusPower {
    fn label(&self) -> &str {
        "Local"
    }

    fn read(&mut self) -> Result<PowerReading, MotorError> {
        let port = format!("servo-{}", self.id);
        let mut bus = self
            .bus
            .lock()
            .map_err(|_| MotorError::protocol(&port, "bus lock poisoned"))?;
        let volts = bus
            .get_voltage(self.id)
            .map_err(|e| MotorError::unavailable(&port, e))?;
        let amps = bus
            .get_current(self.id)
            .map_err(|e| MotorError::unavailable(&port, e))?;
        Ok(PowerReading { volts, amps })
    }
}

/// Constant readings for the simulation backend
pub struct SimPower {
    label: String,
    reading: PowerReading,
}

impl SimPower {
    pub fn new(label: &str, volts: f32, amps: f32) -> Self {
        Self {
            label: label.to_string(),
            reading: PowerReading { volts, amps },
        }
    }
}

impl PowerMonitor for SimPower {
    fn label(&self) -> &str {
        &self.label
    }

    fn read(&mut self) -> Result<PowerReading, MotorError> {
        Ok(self.reading)
    }
}

/// Log one line per monitor; a failing monitor doesn't hide the others
pub fn log_power_info(monitors: &mut [Box<dyn PowerMonitor>]) {
    for monitor in monitors.iter_mut() {
        match monitor.read() {
            Ok(reading) => info!(
                "{} battery power: {:.2}V / {:.2}A",
                monitor.label(),
                reading.volts,
                reading.amps
            ),
            Err(e) => warn!("{} battery power unavailable: {}", monitor.label(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dead;

    impl PowerMonitor for Dead {
        fn label(&self) -> &str {
            "Remote"
        }

        fn read(&mut self) -> Result<PowerReading, MotorError> {
            Err(MotorError::unavailable("power", "link down"))
        }
    }

    #[test]
    fn test_sim_power_reading() {
        let mut power = SimPower::new("Local", 8.1, 0.25);
        let reading = power.read().unwrap();
        assert_eq!(reading.volts, 8.1);
        assert_eq!(power.label(), "Local");
    }

    #[test]
    fn test_failing_monitor_does_not_stop_logging() {
        let mut monitors: Vec<Box<dyn PowerMonitor>> =
            vec![Box::new(Dead), Box::new(SimPower::new("Local", 8.0, 0.1))];
        // Must not panic or short-circuit
        log_power_info(&mut monitors);
    }
}
