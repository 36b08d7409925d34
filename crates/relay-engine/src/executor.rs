//! Activation executor: the only writer of actuator state
//!
//! Triggers, the condition evaluator, and deactivation timers never touch actuators
//! themselves. They post [`Command`]s through an [`ExecutorHandle`] into one queue that a
//! single task drains, so transitions for the same actuator can never interleave.

use crate::engine::EngineEvent;
use crate::error::EngineError;
use crate::model::{
    ActuatorId, ActuatorState, Condition, ConditionAction, LogLevel, PendingDeactivation,
    Schedule, TransitionLogEntry,
};
use crate::ports::{ActuatorPort, Clock, RuleStore};
use chrono::{NaiveDateTime, NaiveTime, Timelike};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const DAY_SECS: u64 = 24 * 60 * 60;

/// How long a schedule keeps its actuator ON; `end <= start` wraps past midnight
pub fn on_duration(start: NaiveTime, end: NaiveTime) -> Duration {
    let start = u64::from(start.num_seconds_from_midnight());
    let end = u64::from(end.num_seconds_from_midnight());
    let secs = if end > start {
        end - start
    } else {
        DAY_SECS - start + end
    };
    Duration::from_secs(secs)
}

/// Work items accepted by the executor task
#[derive(Debug)]
enum Command {
    RunSchedule(Schedule),
    RunCondition {
        condition: Condition,
        value: f64,
    },
    Manual {
        actuator_id: ActuatorId,
        level: bool,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Expire {
        actuator_id: ActuatorId,
        token: u64,
    },
    Flush(oneshot::Sender<()>),
}

/// Cloneable sender side of the executor queue
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ExecutorHandle {
    /// Turn the schedule's actuator ON and arm its end-of-interval deactivation
    pub fn run_schedule(&self, schedule: Schedule) {
        self.send(Command::RunSchedule(schedule));
    }

    /// Apply a condition that evaluated true against `value`
    pub fn run_condition(&self, condition: Condition, value: f64) {
        self.send(Command::RunCondition { condition, value });
    }

    /// Operator override; resolves once the write has been attempted
    pub async fn set_manual(
        &self,
        actuator_id: ActuatorId,
        level: bool,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Manual {
                actuator_id,
                level,
                reply,
            })
            .map_err(|_| EngineError::NotRunning)?;
        rx.await.map_err(|_| EngineError::NotRunning)?
    }

    /// Wait until every command queued before this call has been applied
    pub async fn flush(&self) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::debug!("Executor stopped, dropping command");
        }
    }
}

/// State the executor publishes for readers outside its task
#[derive(Clone)]
pub(crate) struct ExecutorShared {
    pub states: Arc<DashMap<ActuatorId, ActuatorState>>,
    pub pending: Arc<DashMap<ActuatorId, PendingDeactivation>>,
    pub events: broadcast::Sender<EngineEvent>,
}

/// Running executor task
pub(crate) struct ExecutorTask {
    handle: JoinHandle<()>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl ExecutorTask {
    /// Stop the task ahead of any queued commands and wait for it to exit
    pub async fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            if !e.is_cancelled() {
                tracing::warn!("Activation executor ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ExecutorTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct ArmedTimer {
    token: u64,
    reason: String,
    handle: JoinHandle<()>,
}

/// Single consumer of the command queue
pub(crate) struct ActivationExecutor<S> {
    actuators: Arc<dyn ActuatorPort>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    shared: ExecutorShared,
    log_source: String,
    /// Deactivation timer tasks, at most one per actuator
    timers: HashMap<ActuatorId, ArmedTimer>,
    next_token: u64,
    /// Lets timer tasks post expiries back into the queue
    tx: mpsc::UnboundedSender<Command>,
}

impl<S: RuleStore> ActivationExecutor<S> {
    /// Start the executor task
    pub fn spawn(
        actuators: Arc<dyn ActuatorPort>,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        shared: ExecutorShared,
        log_source: String,
    ) -> (ExecutorHandle, ExecutorTask) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let executor = Self {
            actuators,
            store,
            clock,
            shared,
            log_source,
            timers: HashMap::new(),
            next_token: 0,
            tx: tx.clone(),
        };
        let handle = tokio::spawn(executor.run(rx, shutdown_rx));

        (
            ExecutorHandle { tx },
            ExecutorTask {
                handle,
                shutdown: Some(shutdown_tx),
            },
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        tracing::debug!("Activation executor started");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }
        tracing::debug!("Activation executor stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RunSchedule(schedule) => self.run_schedule(&schedule),
            Command::RunCondition { condition, value } => self.run_condition(&condition, value),
            Command::Manual {
                actuator_id,
                level,
                reply,
            } => {
                let _ = reply.send(self.run_manual(actuator_id, level));
            }
            Command::Expire { actuator_id, token } => self.expire(actuator_id, token),
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    fn run_schedule(&mut self, schedule: &Schedule) {
        let duration = match schedule.window() {
            Ok((start, end)) => on_duration(start, end),
            Err(e) => {
                tracing::error!("Schedule {} has an unusable window: {}", schedule.id, e);
                return;
            }
        };

        let reason = format!("schedule {} start", schedule.id);
        if let Ok(switched) = self.transition(schedule.actuator_id, true, &reason) {
            self.arm_after_on(
                schedule.actuator_id,
                switched,
                duration,
                &schedule.id,
                &reason,
                format!("schedule {} end", schedule.id),
            );
        }
    }

    fn run_condition(&mut self, condition: &Condition, value: f64) {
        let reason = format!(
            "condition {} {} {} {} (value {:.2})",
            condition.id, condition.metric, condition.operator, condition.threshold, value
        );

        match condition.action {
            ConditionAction::Activate => {
                match self.transition(condition.actuator_id, true, &reason) {
                    Ok(switched) if condition.hold_seconds > 0 => self.arm_after_on(
                        condition.actuator_id,
                        switched,
                        Duration::from_secs(condition.hold_seconds),
                        &condition.id,
                        &reason,
                        format!("condition {} hold expired", condition.id),
                    ),
                    _ => {}
                }
            }
            ConditionAction::Deactivate => {
                // Deactivate wins over any armed auto-off, even if the write fails
                self.disarm(condition.actuator_id);
                let _ = self.transition(condition.actuator_id, false, &reason);
            }
        }
    }

    fn run_manual(&mut self, actuator_id: ActuatorId, level: bool) -> Result<(), EngineError> {
        if !level {
            self.disarm(actuator_id);
        }
        self.transition(actuator_id, level, "manual").map(|_| ())
    }

    fn expire(&mut self, actuator_id: ActuatorId, token: u64) {
        if !self
            .timers
            .get(&actuator_id)
            .is_some_and(|timer| timer.token == token)
        {
            tracing::debug!("Ignoring superseded deactivation for actuator {}", actuator_id);
            return;
        }

        if let Some(timer) = self.timers.remove(&actuator_id) {
            self.shared.pending.remove(&actuator_id);
            let _ = self.transition(actuator_id, false, &timer.reason);
        }
    }

    /// Arm the deactivation that follows an ON request.
    ///
    /// When the actuator was already ON and its auto-off belonged to another rule (or to
    /// nobody), the handover is audited so the log names the rule now in control.
    fn arm_after_on(
        &mut self,
        actuator_id: ActuatorId,
        switched: bool,
        after: Duration,
        origin_rule_id: &str,
        reason: &str,
        expiry_reason: String,
    ) {
        let previous_origin = self
            .shared
            .pending
            .get(&actuator_id)
            .map(|pending| pending.origin_rule_id.clone());
        let pending = self.arm(actuator_id, after, origin_rule_id, expiry_reason);

        if !switched && previous_origin.as_deref() != Some(origin_rule_id) {
            self.record_takeover(&pending, reason);
        }
    }

    /// Arm the actuator's deactivation, superseding any previous one
    fn arm(
        &mut self,
        actuator_id: ActuatorId,
        after: Duration,
        origin_rule_id: &str,
        reason: String,
    ) -> PendingDeactivation {
        if self.disarm(actuator_id) {
            tracing::debug!(
                "Deactivation for actuator {} superseded by rule {}",
                actuator_id,
                origin_rule_id
            );
        }

        self.next_token += 1;
        let token = self.next_token;
        let due_at = chrono::Duration::from_std(after)
            .ok()
            .and_then(|delta| self.clock.now().checked_add_signed(delta))
            .unwrap_or(NaiveDateTime::MAX);

        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Command::Expire { actuator_id, token });
        });

        let pending = PendingDeactivation {
            actuator_id,
            due_at,
            origin_rule_id: origin_rule_id.to_string(),
        };
        self.shared.pending.insert(actuator_id, pending.clone());
        self.timers.insert(
            actuator_id,
            ArmedTimer {
                token,
                reason,
                handle,
            },
        );

        tracing::debug!(
            "Armed deactivation for actuator {} at {} (in {:?})",
            actuator_id,
            due_at,
            after
        );
        pending
    }

    /// Cancel the actuator's deactivation; returns whether one was armed
    fn disarm(&mut self, actuator_id: ActuatorId) -> bool {
        self.shared.pending.remove(&actuator_id);
        match self.timers.remove(&actuator_id) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drive an actuator and record the attempt. A request for the level the actuator is
    /// already confirmed at is not a transition; returns whether a write happened.
    fn transition(
        &mut self,
        actuator_id: ActuatorId,
        level: bool,
        reason: &str,
    ) -> Result<bool, EngineError> {
        if self
            .shared
            .states
            .get(&actuator_id)
            .is_some_and(|state| state.level == level)
        {
            tracing::debug!(
                "Actuator {} already {}, no write ({})",
                actuator_id,
                if level { "ON" } else { "OFF" },
                reason
            );
            return Ok(false);
        }

        let timestamp = self.clock.now();
        let result = self.actuators.set_output(actuator_id, level);

        let error = match &result {
            Ok(()) => {
                self.shared.states.insert(
                    actuator_id,
                    ActuatorState {
                        actuator_id,
                        level,
                        last_changed_at: timestamp,
                        last_reason: reason.to_string(),
                    },
                );
                None
            }
            Err(e) => Some(e.to_string()),
        };

        self.record(TransitionLogEntry {
            actuator_id,
            level,
            reason: reason.to_string(),
            timestamp,
            error,
        });
        result.map(|()| true)
    }

    /// Audit a rule taking control of an actuator that was already ON
    fn record_takeover(&self, pending: &PendingDeactivation, reason: &str) {
        if let Some(mut state) = self.shared.states.get_mut(&pending.actuator_id) {
            state.last_reason = reason.to_string();
        }

        let message = format!(
            "Actuator {} already ON ({}), auto-off re-armed for {}",
            pending.actuator_id, reason, pending.due_at
        );
        tracing::info!("{}", message);
        if let Err(e) = self
            .store
            .append_log(LogLevel::Info, &message, &self.log_source)
        {
            tracing::warn!("Failed to append takeover log: {}", e);
        }

        let _ = self.shared.events.send(EngineEvent::DeactivationRearmed(pending.clone()));
    }

    fn record(&self, entry: TransitionLogEntry) {
        let level = if entry.error.is_some() {
            tracing::error!("{}", entry);
            LogLevel::Error
        } else {
            tracing::info!("{}", entry);
            LogLevel::Info
        };

        if let Err(e) = self
            .store
            .append_log(level, &entry.to_string(), &self.log_source)
        {
            tracing::warn!("Failed to append transition log: {}", e);
        }

        let _ = self.shared.events.send(EngineEvent::Transition(entry));
    }
}

impl<S> Drop for ActivationExecutor<S> {
    fn drop(&mut self) {
        for (actuator_id, timer) in self.timers.drain() {
            timer.handle.abort();
            self.shared.pending.remove(&actuator_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryActuators, MemoryRuleStore};
    use crate::model::{ConditionRequest, Operator, ScheduleRequest, TEMPERATURE};
    use chrono::NaiveDate;

    /// Wall clock that follows tokio's (pausable) time from a fixed base
    struct PausedClock {
        base: NaiveDateTime,
        origin: tokio::time::Instant,
    }

    impl Clock for PausedClock {
        fn now(&self) -> NaiveDateTime {
            self.base + chrono::Duration::from_std(self.origin.elapsed()).unwrap()
        }
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    struct Harness {
        handle: ExecutorHandle,
        task: ExecutorTask,
        actuators: Arc<MemoryActuators>,
        store: Arc<MemoryRuleStore>,
        shared: ExecutorShared,
    }

    fn harness() -> Harness {
        let actuators = Arc::new(MemoryActuators::new(4));
        let store = Arc::new(MemoryRuleStore::new());
        let (events, _) = broadcast::channel(16);
        let shared = ExecutorShared {
            states: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            events,
        };
        let clock = Arc::new(PausedClock {
            base: base(),
            origin: tokio::time::Instant::now(),
        });
        let (handle, task) = ActivationExecutor::spawn(
            actuators.clone(),
            store.clone(),
            clock,
            shared.clone(),
            "test".to_string(),
        );
        Harness {
            handle,
            task,
            actuators,
            store,
            shared,
        }
    }

    fn hold_condition(actuator_id: ActuatorId, hold_seconds: u64) -> Condition {
        Condition::from_request(ConditionRequest {
            actuator_id,
            metric: TEMPERATURE.to_string(),
            operator: Operator::GreaterThan,
            threshold: 30.0,
            action: ConditionAction::Activate,
            hold_seconds,
            enabled: true,
        })
    }

    #[test]
    fn test_on_duration_same_day() {
        assert_eq!(
            on_duration(time(8, 0), time(18, 0)),
            Duration::from_secs(10 * 3600)
        );
        assert_eq!(on_duration(time(0, 0), time(0, 1)), Duration::from_secs(60));
    }

    #[test]
    fn test_on_duration_wraps_midnight() {
        assert_eq!(
            on_duration(time(22, 0), time(6, 0)),
            Duration::from_secs(8 * 3600)
        );
        assert_eq!(
            on_duration(time(23, 30), time(0, 15)),
            Duration::from_secs(45 * 60)
        );
    }

    #[test]
    fn test_on_duration_equal_times_is_full_day() {
        assert_eq!(on_duration(time(7, 0), time(7, 0)), Duration::from_secs(DAY_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_keeps_single_pending_with_later_due() {
        let h = harness();
        let condition = hold_condition(2, 900);

        h.handle.run_condition(condition.clone(), 31.2);
        h.handle.flush().await;
        let first_due = h.shared.pending.get(&2).unwrap().due_at;

        tokio::time::sleep(Duration::from_secs(5)).await;
        h.handle.run_condition(condition.clone(), 31.5);
        h.handle.flush().await;

        assert_eq!(h.shared.pending.len(), 1);
        let second_due = h.shared.pending.get(&2).unwrap().due_at;
        assert!(second_due > first_due);
        // Second activation found the actuator already ON
        assert_eq!(h.store.logs().len(), 1);
        assert_eq!(h.actuators.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_rule_supersedes_pending_deactivation() {
        let h = harness();
        let schedule = Schedule::from_request(ScheduleRequest {
            actuator_id: 1,
            days: vec![1],
            start_time: "12:00".into(),
            end_time: "13:00".into(),
            enabled: true,
        });

        h.handle.run_schedule(schedule.clone());
        h.handle.run_condition(hold_condition(1, 60), 35.0);
        h.handle.flush().await;

        let pending = h.shared.pending.get(&1).unwrap().clone();
        assert_ne!(pending.origin_rule_id, schedule.id);

        // The handover is audited even though no write happened
        assert_eq!(h.actuators.write_count(), 1);
        let logs = h.store.logs();
        assert_eq!(logs.len(), 2);
        assert!(logs[1].message.contains("already ON"));
        assert!(logs[1].message.contains(&pending.origin_rule_id));
        let state = h.shared.states.get(&1).unwrap().clone();
        assert!(state.last_reason.contains(&pending.origin_rule_id));

        // The condition's shorter hold wins; the schedule's end never fires
        tokio::time::sleep(Duration::from_secs(61)).await;
        h.handle.flush().await;
        assert_eq!(h.actuators.level(1), Some(false));
        assert!(h.shared.pending.is_empty());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        h.handle.flush().await;
        assert_eq!(h.store.logs().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_does_not_advance_state() {
        let h = harness();
        h.actuators.set_faulty(3, true);

        let result = h.handle.set_manual(3, true).await;
        assert!(matches!(result, Err(EngineError::Actuation { actuator_id: 3, .. })));
        assert!(h.shared.states.get(&3).is_none());

        let logs = h.store.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_deactivations() {
        let mut h = harness();
        h.handle.run_condition(hold_condition(4, 30), 40.0);
        h.handle.flush().await;
        assert_eq!(h.shared.pending.len(), 1);

        h.task.shutdown().await;
        assert!(h.shared.pending.is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.actuators.level(4), Some(true));
        assert!(h.handle.set_manual(4, false).await.is_err());
    }
}
