pub mod bridge;
pub mod calibration;
pub mod config;
pub mod control;
pub mod feedback;
pub mod hardware;
pub mod input;
pub mod joints;
pub mod messages;
pub mod motor;
pub mod runtime;
pub mod telemetry;
