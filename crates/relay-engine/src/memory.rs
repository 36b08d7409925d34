//! In-memory ports for simulation and tests

use crate::error::EngineError;
use crate::model::{ActuatorId, Condition, LogLevel, LogRecord, Schedule};
use crate::ports::{ActuatorPort, RuleStore};
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

/// A bank of simulated relays
#[derive(Debug)]
pub struct MemoryActuators {
    count: u8,
    outputs: DashMap<ActuatorId, bool>,
    faulty: DashSet<ActuatorId>,
    writes: AtomicUsize,
}

impl MemoryActuators {
    /// Create a bank with channels 1..=count, all OFF
    pub fn new(count: u8) -> Self {
        Self {
            count,
            outputs: (1..=count).map(|id| (id, false)).collect(),
            faulty: DashSet::new(),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make writes to an actuator fail (or succeed again)
    pub fn set_faulty(&self, actuator_id: ActuatorId, faulty: bool) {
        if faulty {
            self.faulty.insert(actuator_id);
        } else {
            self.faulty.remove(&actuator_id);
        }
    }

    /// Current level of a channel
    pub fn level(&self, actuator_id: ActuatorId) -> Option<bool> {
        self.outputs.get(&actuator_id).map(|level| *level)
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl ActuatorPort for MemoryActuators {
    fn set_output(&self, actuator_id: ActuatorId, level: bool) -> Result<(), EngineError> {
        if actuator_id == 0 || actuator_id > self.count {
            return Err(EngineError::Actuation {
                actuator_id,
                reason: "no such channel".to_string(),
            });
        }
        if self.faulty.contains(&actuator_id) {
            return Err(EngineError::Actuation {
                actuator_id,
                reason: "channel not responding".to_string(),
            });
        }
        self.outputs.insert(actuator_id, level);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get_output(&self, actuator_id: ActuatorId) -> Result<bool, EngineError> {
        self.level(actuator_id)
            .ok_or_else(|| EngineError::Actuation {
                actuator_id,
                reason: "no such channel".to_string(),
            })
    }
}

/// Rule store kept entirely in memory
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    schedules: RwLock<Vec<Schedule>>,
    conditions: RwLock<Vec<Condition>>,
    logs: Mutex<Vec<LogRecord>>,
    unavailable: AtomicBool,
    log_failing: AtomicBool,
}

impl MemoryRuleStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store preloaded with rules
    pub fn with_rules(schedules: Vec<Schedule>, conditions: Vec<Condition>) -> Self {
        Self {
            schedules: RwLock::new(schedules),
            conditions: RwLock::new(conditions),
            ..Self::default()
        }
    }

    /// Make rule loads and writes fail, as if the backing database were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `append_log` fail
    pub fn set_log_failing(&self, failing: bool) {
        self.log_failing.store(failing, Ordering::SeqCst);
    }

    /// Every record appended so far
    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_available(&self) -> Result<(), EngineError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::Persistence("rule store unreachable".to_string()));
        }
        Ok(())
    }
}

impl RuleStore for MemoryRuleStore {
    async fn load_schedules(&self) -> Result<Vec<Schedule>, EngineError> {
        self.check_available()?;
        Ok(self
            .schedules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn load_conditions(&self) -> Result<Vec<Condition>, EngineError> {
        self.check_available()?;
        Ok(self
            .conditions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn save_schedule(&self, schedule: Schedule) -> Result<(), EngineError> {
        self.check_available()?;
        let mut schedules = self.schedules.write().unwrap_or_else(PoisonError::into_inner);
        match schedules.iter_mut().find(|s| s.id == schedule.id) {
            Some(existing) => *existing = schedule,
            None => schedules.push(schedule),
        }
        Ok(())
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool, EngineError> {
        self.check_available()?;
        let mut schedules = self.schedules.write().unwrap_or_else(PoisonError::into_inner);
        let before = schedules.len();
        schedules.retain(|s| s.id != id);
        Ok(schedules.len() != before)
    }

    async fn save_condition(&self, condition: Condition) -> Result<(), EngineError> {
        self.check_available()?;
        let mut conditions = self.conditions.write().unwrap_or_else(PoisonError::into_inner);
        match conditions.iter_mut().find(|c| c.id == condition.id) {
            Some(existing) => *existing = condition,
            None => conditions.push(condition),
        }
        Ok(())
    }

    async fn delete_condition(&self, id: &str) -> Result<bool, EngineError> {
        self.check_available()?;
        let mut conditions = self.conditions.write().unwrap_or_else(PoisonError::into_inner);
        let before = conditions.len();
        conditions.retain(|c| c.id != id);
        Ok(conditions.len() != before)
    }

    fn append_log(&self, level: LogLevel, message: &str, source: &str) -> Result<(), EngineError> {
        if self.log_failing.load(Ordering::SeqCst) {
            return Err(EngineError::Persistence("log table locked".to_string()));
        }
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogRecord {
                timestamp: chrono::Local::now().naive_local(),
                level,
                message: message.to_string(),
                source: source.to_string(),
            });
        Ok(())
    }
}
