//! Trigger engine for time-of-day schedules

use crate::error::EngineError;
use crate::executor::ExecutorHandle;
use crate::model::{check_actuator, weekday_from_sunday, Schedule};
use crate::ports::Clock;
use chrono::{Datelike, NaiveDateTime, NaiveTime, Weekday};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Validate a schedule for registration, returning its start time and distinct weekdays
pub fn validate_schedule(
    schedule: &Schedule,
    actuator_count: u8,
) -> Result<(NaiveTime, Vec<Weekday>), EngineError> {
    check_actuator(schedule.actuator_id, actuator_count)?;
    let (start, _end) = schedule.window()?;

    if schedule.days.is_empty() {
        return Err(EngineError::Configuration(format!(
            "schedule {} has no days",
            schedule.id
        )));
    }

    let mut days = BTreeSet::new();
    for &day in &schedule.days {
        if weekday_from_sunday(day).is_none() {
            return Err(EngineError::Configuration(format!(
                "day {day} out of range 0-6"
            )));
        }
        days.insert(day);
    }

    Ok((start, days.into_iter().filter_map(weekday_from_sunday).collect()))
}

/// First occurrence of `weekday` at `at` strictly after `after`
pub fn next_fire(after: NaiveDateTime, weekday: Weekday, at: NaiveTime) -> NaiveDateTime {
    let date = after.date();
    let ahead = (7 + weekday.num_days_from_sunday() - date.weekday().num_days_from_sunday()) % 7;
    let candidate = (date + chrono::Duration::days(i64::from(ahead))).and_time(at);

    if candidate > after {
        candidate
    } else {
        candidate + chrono::Duration::days(7)
    }
}

/// Recurring wall-clock triggers, one per schedule-day
pub struct TriggerEngine {
    /// Active timer handles (keyed by "<schedule id>@<day>")
    timers: DashMap<String, JoinHandle<()>>,
    executor: ExecutorHandle,
    clock: Arc<dyn Clock>,
}

impl TriggerEngine {
    /// Create a trigger engine feeding the given executor
    pub fn new(executor: ExecutorHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            timers: DashMap::new(),
            executor,
            clock,
        }
    }

    /// Register a schedule, returning how many day triggers it produced
    pub fn register(&self, schedule: &Schedule, actuator_count: u8) -> Result<usize, EngineError> {
        let (start, weekdays) = validate_schedule(schedule, actuator_count)?;

        for &weekday in &weekdays {
            self.schedule_day(schedule, weekday, start);
        }

        tracing::info!(
            "Scheduled {} ({}-{}, days {:?}) on actuator {}",
            schedule.id,
            schedule.start_time,
            schedule.end_time,
            weekdays,
            schedule.actuator_id
        );
        Ok(weekdays.len())
    }

    fn schedule_day(&self, schedule: &Schedule, weekday: Weekday, start: NaiveTime) {
        let key = format!("{}@{}", schedule.id, weekday.num_days_from_sunday());
        let schedule = schedule.clone();
        let executor = self.executor.clone();
        let clock = Arc::clone(&self.clock);

        let handle = tokio::spawn(async move {
            let mut last_fired: Option<NaiveDateTime> = None;
            loop {
                let now = clock.now();
                // Never fire the same wall-clock moment twice, even if the clock lags the timer
                let reference = last_fired.map_or(now, |fired| fired.max(now));
                let target = next_fire(reference, weekday, start);
                let wait = (target - now).to_std().unwrap_or(Duration::ZERO);

                tracing::debug!(
                    "Next trigger for schedule {} at {} (in {:?})",
                    schedule.id,
                    target,
                    wait
                );

                tokio::time::sleep(wait).await;

                tracing::debug!("Trigger fired for schedule {}", schedule.id);
                executor.run_schedule(schedule.clone());
                last_fired = Some(target);
            }
        });

        if let Some(previous) = self.timers.insert(key, handle) {
            previous.abort();
        }
    }

    /// Number of live triggers
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every trigger and wait until none can fire
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.timers.iter().map(|entry| entry.key().clone()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.timers.remove(&key) {
                handle.abort();
                handles.push(handle);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Drop for TriggerEngine {
    fn drop(&mut self) {
        // Abort all timer tasks
        for entry in self.timers.iter() {
            entry.value().abort();
        }
    }
}
