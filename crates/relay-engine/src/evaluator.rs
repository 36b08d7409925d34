//! Condition evaluator: polls the sensor and checks thresholds

use crate::error::EngineError;
use crate::executor::ExecutorHandle;
use crate::model::{check_actuator, Condition, Operator};
use crate::ports::SensorPort;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Half-width of the `==` band, so readings jittering around a threshold don't thrash
pub const EQUALITY_TOLERANCE: f64 = 0.5;

/// Apply an operator to a sensor value and a threshold
pub fn compare(operator: Operator, value: f64, threshold: f64) -> bool {
    match operator {
        Operator::GreaterThan => value > threshold,
        Operator::LessThan => value < threshold,
        Operator::GreaterOrEqual => value >= threshold,
        Operator::LessOrEqual => value <= threshold,
        Operator::Equal => (value - threshold).abs() < EQUALITY_TOLERANCE,
    }
}

/// Validate a condition for registration
pub fn validate_condition(condition: &Condition, actuator_count: u8) -> Result<(), EngineError> {
    check_actuator(condition.actuator_id, actuator_count)?;
    if condition.metric.trim().is_empty() {
        return Err(EngineError::Configuration(format!(
            "condition {} has no metric",
            condition.id
        )));
    }
    if !condition.threshold.is_finite() {
        return Err(EngineError::Configuration(format!(
            "condition {} has a non-finite threshold",
            condition.id
        )));
    }
    Ok(())
}

/// Evaluator for sensor-threshold conditions
pub struct ConditionEvaluator {
    sensor: Arc<dyn SensorPort>,
    executor: ExecutorHandle,
    conditions: Vec<Condition>,
    /// Set while sampling keeps failing, to avoid repeating the same warning every tick
    sensor_failing: bool,
}

impl ConditionEvaluator {
    /// Create a new condition evaluator
    pub fn new(sensor: Arc<dyn SensorPort>, executor: ExecutorHandle) -> Self {
        Self {
            sensor,
            executor,
            conditions: Vec::new(),
            sensor_failing: false,
        }
    }

    /// Add a condition to the evaluation set
    pub fn register(
        &mut self,
        condition: Condition,
        actuator_count: u8,
    ) -> Result<(), EngineError> {
        validate_condition(&condition, actuator_count)?;
        tracing::info!(
            "Watching condition {} ({} {} {}) on actuator {}",
            condition.id,
            condition.metric,
            condition.operator,
            condition.threshold,
            condition.actuator_id
        );
        self.conditions.push(condition);
        Ok(())
    }

    /// Number of registered conditions
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Sample once and evaluate every condition against that sample.
    /// Returns how many conditions held.
    pub fn evaluate_cycle(&mut self) -> usize {
        let sample = match self.sensor.sample() {
            Ok(sample) => {
                if self.sensor_failing {
                    tracing::info!("Sensor sampling recovered");
                    self.sensor_failing = false;
                }
                sample
            }
            Err(e) => {
                if self.sensor_failing {
                    tracing::debug!("Skipping condition cycle: {}", e);
                } else {
                    tracing::warn!("Skipping condition cycle: {}", e);
                    self.sensor_failing = true;
                }
                return 0;
            }
        };

        let mut held = 0;
        for condition in &self.conditions {
            let Some(value) = sample.get(&condition.metric).filter(|v| v.is_finite()) else {
                tracing::warn!(
                    "Condition {} skipped: no usable '{}' in sample",
                    condition.id,
                    condition.metric
                );
                continue;
            };

            if compare(condition.operator, value, condition.threshold) {
                tracing::debug!(
                    "Condition {} holds ({} = {:.2})",
                    condition.id,
                    condition.metric,
                    value
                );
                self.executor.run_condition(condition.clone(), value);
                held += 1;
            }
        }
        held
    }

    /// Run the polling loop; the first cycle runs immediately
    pub fn spawn(mut self, poll_interval: Duration) -> JoinHandle<()> {
        tracing::info!(
            "Polling sensor every {:?} for {} conditions",
            poll_interval,
            self.conditions.len()
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.evaluate_cycle();
            }
        })
    }
}
