//! Data models for the relay engine

use crate::error::EngineError;
use chrono::{NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Actuator channel number, 1-based (relay 1..=N)
pub type ActuatorId = u8;

/// Metric name reported by the temperature sensor (°C)
pub const TEMPERATURE: &str = "temperature";
/// Metric name reported by the humidity sensor (%)
pub const HUMIDITY: &str = "humidity";

/// A recurring time-of-day ON interval for one actuator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Unique identifier
    pub id: String,
    /// Actuator switched by this schedule
    pub actuator_id: ActuatorId,
    /// Days of week (0=Sunday, 1=Monday, ..., 6=Saturday)
    pub days: Vec<u8>,
    /// Start time in HH:MM format (24-hour)
    pub start_time: String,
    /// End time in HH:MM format; at or before `start_time` wraps past midnight
    pub end_time: String,
    /// Whether the schedule is active
    pub enabled: bool,
    /// Creation timestamp (ISO 8601)
    pub created_at: String,
    /// Last modification timestamp
    pub updated_at: String,
}

/// Comparison applied between a sensor value and a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterOrEqual => ">=",
            Self::LessOrEqual => "<=",
            Self::Equal => "==",
        };
        f.write_str(symbol)
    }
}

/// What a condition does to its actuator when it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionAction {
    Activate,
    Deactivate,
}

/// A sensor-threshold rule for one actuator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Unique identifier
    pub id: String,
    /// Actuator switched by this condition
    pub actuator_id: ActuatorId,
    /// Sensor metric name (e.g. "temperature")
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    pub action: ConditionAction,
    /// Seconds to keep the actuator ON after activation (0 = indefinite)
    #[serde(default)]
    pub hold_seconds: u64,
    /// Whether the condition is active
    pub enabled: bool,
    /// Creation timestamp (ISO 8601)
    pub created_at: String,
    /// Last modification timestamp
    pub updated_at: String,
}

/// Request to create or fully replace a schedule
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub actuator_id: ActuatorId,
    pub days: Vec<u8>,
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Request to create or fully replace a condition
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionRequest {
    pub actuator_id: ActuatorId,
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    pub action: ConditionAction,
    #[serde(default)]
    pub hold_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Schedule {
    /// Create a new schedule from a request
    pub fn from_request(request: ScheduleRequest) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actuator_id: request.actuator_id,
            days: request.days,
            start_time: request.start_time,
            end_time: request.end_time,
            enabled: request.enabled,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Replace every editable field, keeping id and creation time
    pub fn replace(&mut self, request: ScheduleRequest) {
        self.actuator_id = request.actuator_id;
        self.days = request.days;
        self.start_time = request.start_time;
        self.end_time = request.end_time;
        self.enabled = request.enabled;
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }

    /// Parsed start and end times
    pub fn window(&self) -> Result<(NaiveTime, NaiveTime), EngineError> {
        Ok((
            parse_clock_time(&self.start_time)?,
            parse_clock_time(&self.end_time)?,
        ))
    }
}

impl Condition {
    /// Create a new condition from a request
    pub fn from_request(request: ConditionRequest) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actuator_id: request.actuator_id,
            metric: request.metric,
            operator: request.operator,
            threshold: request.threshold,
            action: request.action,
            hold_seconds: request.hold_seconds,
            enabled: request.enabled,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Replace every editable field, keeping id and creation time
    pub fn replace(&mut self, request: ConditionRequest) {
        self.actuator_id = request.actuator_id;
        self.metric = request.metric;
        self.operator = request.operator;
        self.threshold = request.threshold;
        self.action = request.action;
        self.hold_seconds = request.hold_seconds;
        self.enabled = request.enabled;
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

/// Last confirmed output of an actuator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorState {
    pub actuator_id: ActuatorId,
    pub level: bool,
    pub last_changed_at: NaiveDateTime,
    pub last_reason: String,
}

/// An armed future OFF command
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingDeactivation {
    pub actuator_id: ActuatorId,
    pub due_at: NaiveDateTime,
    pub origin_rule_id: String,
}

/// Audit record of one actuator transition attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionLogEntry {
    pub actuator_id: ActuatorId,
    pub level: bool,
    pub reason: String,
    pub timestamp: NaiveDateTime,
    /// Set when the actuator write failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl fmt::Display for TransitionLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = if self.level { "ON" } else { "OFF" };
        match &self.error {
            None => write!(f, "Actuator {} {} ({})", self.actuator_id, level, self.reason),
            Some(error) => write!(
                f,
                "Actuator {} {} failed ({}): {}",
                self.actuator_id, level, self.reason, error
            ),
        }
    }
}

/// Log levels for audit records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// One `append_log` call as kept by a rule store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub level: LogLevel,
    pub message: String,
    pub source: String,
}

/// One sensor reading, keyed by metric name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    values: HashMap<String, f64>,
}

impl SensorSample {
    /// Create an empty sample
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metric value
    #[must_use]
    pub fn with(mut self, metric: &str, value: f64) -> Self {
        self.values.insert(metric.to_string(), value);
        self
    }

    /// Value for a metric, if present
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied()
    }
}

/// Lifecycle state of the scheduler service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Initializing,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Read-only snapshot of the scheduler service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    pub state: ServiceState,
    pub running: bool,
    /// Schedules loaded at the last init, including disabled and rejected ones
    pub schedule_count: usize,
    /// Conditions loaded at the last init, including disabled and rejected ones
    pub condition_count: usize,
    /// Live schedule-day triggers; only these can fire
    pub trigger_count: usize,
    pub pending_timer_count: usize,
}

/// Parse a time string in HH:MM format
pub fn parse_clock_time(s: &str) -> Result<NaiveTime, EngineError> {
    let (hour, minute) = s
        .split_once(':')
        .ok_or_else(|| EngineError::Configuration(format!("time '{s}' is not HH:MM")))?;
    let hour: u32 = hour
        .trim()
        .parse()
        .map_err(|_| EngineError::Configuration(format!("time '{s}' has a non-numeric hour")))?;
    let minute: u32 = minute
        .trim()
        .parse()
        .map_err(|_| EngineError::Configuration(format!("time '{s}' has a non-numeric minute")))?;

    if hour > 23 {
        return Err(EngineError::Configuration(format!(
            "hour {hour} out of range 0-23 in '{s}'"
        )));
    }
    if minute > 59 {
        return Err(EngineError::Configuration(format!(
            "minute {minute} out of range 0-59 in '{s}'"
        )));
    }

    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| EngineError::Configuration(format!("invalid time '{s}'")))
}

/// Map a 0=Sunday day number to a chrono weekday
pub fn weekday_from_sunday(day: u8) -> Option<Weekday> {
    match day {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

/// Reject actuator ids outside 1..=count
pub fn check_actuator(actuator_id: ActuatorId, count: u8) -> Result<(), EngineError> {
    if actuator_id == 0 || actuator_id > count {
        return Err(EngineError::Configuration(format!(
            "actuator {actuator_id} out of range 1-{count}"
        )));
    }
    Ok(())
}
