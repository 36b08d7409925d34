#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use relay_engine::memory::{MemoryActuators, MemoryRuleStore};
use relay_engine::{
    Clock, Condition, ConditionAction, ConditionRequest, EngineConfig, EngineError, Operator,
    Schedule, ScheduleRequest, SchedulerService, SensorPort, SensorSample, TEMPERATURE,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wall clock that advances with tokio's (paused) time
pub struct TestClock {
    base: NaiveDateTime,
    origin: tokio::time::Instant,
}

impl TestClock {
    pub fn starting_at(base: NaiveDateTime) -> Arc<Self> {
        Arc::new(Self {
            base,
            origin: tokio::time::Instant::now(),
        })
    }
}

impl Clock for TestClock {
    fn now(&self) -> NaiveDateTime {
        self.base + chrono::Duration::from_std(self.origin.elapsed()).unwrap()
    }
}

/// Sensor that replays a script, then repeats a fallback reading
pub struct ScriptedSensor {
    script: Mutex<VecDeque<Option<SensorSample>>>,
    fallback: Option<SensorSample>,
    calls: Mutex<usize>,
}

impl ScriptedSensor {
    pub fn new(script: Vec<Option<SensorSample>>, fallback: Option<SensorSample>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl SensorPort for ScriptedSensor {
    fn sample(&self) -> Result<SensorSample, EngineError> {
        *self.calls.lock().unwrap() += 1;
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        next.ok_or_else(|| EngineError::Sensing("sensor not responding".to_string()))
    }
}

pub fn temperature(value: f64) -> Option<SensorSample> {
    Some(SensorSample::new().with(TEMPERATURE, value))
}

/// 2024-01-01 is a Monday
pub fn monday(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

pub fn schedule(actuator_id: u8, days: Vec<u8>, start: &str, end: &str) -> Schedule {
    Schedule::from_request(ScheduleRequest {
        actuator_id,
        days,
        start_time: start.to_string(),
        end_time: end.to_string(),
        enabled: true,
    })
}

pub fn condition(
    actuator_id: u8,
    metric: &str,
    operator: Operator,
    threshold: f64,
    action: ConditionAction,
    hold_seconds: u64,
) -> Condition {
    Condition::from_request(ConditionRequest {
        actuator_id,
        metric: metric.to_string(),
        operator,
        threshold,
        action,
        hold_seconds,
        enabled: true,
    })
}

pub struct Fixture {
    pub service: SchedulerService<MemoryRuleStore>,
    pub actuators: Arc<MemoryActuators>,
    pub store: Arc<MemoryRuleStore>,
    pub sensor: Arc<ScriptedSensor>,
}

impl Fixture {
    pub fn new(
        start: NaiveDateTime,
        schedules: Vec<Schedule>,
        conditions: Vec<Condition>,
        sensor: Arc<ScriptedSensor>,
    ) -> Self {
        let actuators = Arc::new(MemoryActuators::new(4));
        let store = Arc::new(MemoryRuleStore::with_rules(schedules, conditions));
        let config = EngineConfig {
            poll_interval_secs: 5,
            ..Default::default()
        };
        let service =
            SchedulerService::new(config, actuators.clone(), sensor.clone(), store.clone())
                .with_clock(TestClock::starting_at(start));

        Self {
            service,
            actuators,
            store,
            sensor,
        }
    }

    pub fn with_schedules(start: NaiveDateTime, schedules: Vec<Schedule>) -> Self {
        let sensor = ScriptedSensor::new(Vec::new(), None);
        Self::new(start, schedules, Vec::new(), sensor)
    }

    /// Let paused time run forward, then wait for the executor to drain its queue
    pub async fn advance(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
        self.service.flush().await;
    }
}
