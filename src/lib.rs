//! MotorLink - UDP command and telemetry link for multi-motor controllers
//!
//! An operator console sends fixed-size command frames to up to seven motor
//! nodes and receives telemetry frames back on a local port.

pub mod config;
pub mod console;
pub mod network;
pub mod protocol;
pub mod simulator;
