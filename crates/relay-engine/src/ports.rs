//! Boundaries between the engine and the outside world
//!
//! The engine drives relays through [`ActuatorPort`], reads the environment through
//! [`SensorPort`], and keeps rules and its audit trail in a [`RuleStore`]. Port calls are
//! bounded and never retried by the engine.

use crate::error::EngineError;
use crate::model::{ActuatorId, Condition, LogLevel, Schedule, SensorSample};
use chrono::{Local, NaiveDateTime};
use std::future::Future;

/// Binary outputs (relays)
pub trait ActuatorPort: Send + Sync {
    /// Drive an actuator to a level
    fn set_output(&self, actuator_id: ActuatorId, level: bool) -> Result<(), EngineError>;

    /// Read back the current level of an actuator
    fn get_output(&self, actuator_id: ActuatorId) -> Result<bool, EngineError>;
}

/// Environmental sensor
pub trait SensorPort: Send + Sync {
    /// Take one sample of every metric; an error means no usable sample this cycle
    fn sample(&self) -> Result<SensorSample, EngineError>;
}

/// Rule storage and audit log
pub trait RuleStore: Send + Sync + 'static {
    /// Load all schedules in stored order
    fn load_schedules(&self) -> impl Future<Output = Result<Vec<Schedule>, EngineError>> + Send;

    /// Load all conditions in stored order
    fn load_conditions(&self)
        -> impl Future<Output = Result<Vec<Condition>, EngineError>> + Send;

    /// Insert or replace a schedule by id
    fn save_schedule(
        &self,
        schedule: Schedule,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Delete a schedule, returning whether it existed
    fn delete_schedule(&self, id: &str) -> impl Future<Output = Result<bool, EngineError>> + Send;

    /// Insert or replace a condition by id
    fn save_condition(
        &self,
        condition: Condition,
    ) -> impl Future<Output = Result<(), EngineError>> + Send;

    /// Delete a condition, returning whether it existed
    fn delete_condition(&self, id: &str)
        -> impl Future<Output = Result<bool, EngineError>> + Send;

    /// Append an audit record (fire-and-forget from the engine's point of view)
    fn append_log(&self, level: LogLevel, message: &str, source: &str) -> Result<(), EngineError>;
}

/// Local wall clock used for schedule arithmetic and timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// Clock backed by the system's local time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}
