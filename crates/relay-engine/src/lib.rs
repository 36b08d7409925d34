//! Relay scheduling engine
//!
//! Drives a small bank of binary actuators from time-of-day schedules and
//! sensor-threshold conditions, and records every transition for audit.

pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod memory;
pub mod model;
pub mod persistence;
pub mod ports;
pub mod trigger;

pub use config::EngineConfig;
pub use engine::{EngineEvent, SchedulerService};
pub use error::EngineError;
pub use model::*;
pub use ports::{ActuatorPort, Clock, RuleStore, SensorPort, SystemClock};
