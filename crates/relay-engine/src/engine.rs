//! Scheduler service: lifecycle, rule set, and wiring

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::evaluator::{validate_condition, ConditionEvaluator};
use crate::executor::{ActivationExecutor, ExecutorHandle, ExecutorShared, ExecutorTask};
use crate::model::{
    check_actuator, ActuatorId, ActuatorState, Condition, ConditionRequest, EngineStatus,
    LogLevel, PendingDeactivation, Schedule, ScheduleRequest, ServiceState, TransitionLogEntry,
};
use crate::ports::{ActuatorPort, Clock, RuleStore, SensorPort, SystemClock};
use crate::trigger::{validate_schedule, TriggerEngine};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

/// Events emitted by the scheduler service
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Lifecycle state changed
    StateChanged { state: ServiceState },
    /// Rules were (re)loaded and registered
    RulesLoaded {
        schedules: usize,
        conditions: usize,
        triggers: usize,
    },
    /// A rule failed validation and was not registered
    RuleRejected { rule_id: String, error: String },
    /// An actuator transition was attempted
    Transition(TransitionLogEntry),
    /// A rule took over the auto-off of an actuator that was already ON
    DeactivationRearmed(PendingDeactivation),
}

/// Rules currently loaded into the engine
#[derive(Debug, Default)]
struct RuleSet {
    schedules: Vec<Schedule>,
    conditions: Vec<Condition>,
}

/// Everything that lives between `init()` and `stop()`
struct Session {
    executor: ExecutorHandle,
    executor_task: ExecutorTask,
    triggers: TriggerEngine,
    evaluator_task: Option<JoinHandle<()>>,
}

impl Session {
    async fn shutdown(&mut self) {
        // Producers first, so nothing posts into the queue while the executor winds down
        self.triggers.shutdown().await;
        if let Some(task) = self.evaluator_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.executor_task.shutdown().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = &self.evaluator_task {
            task.abort();
        }
    }
}

/// The scheduling and condition-evaluation engine
pub struct SchedulerService<S: RuleStore> {
    config: EngineConfig,
    actuators: Arc<dyn ActuatorPort>,
    sensor: Arc<dyn SensorPort>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    /// Actuator states and pending deactivations, written only by the executor
    shared: ExecutorShared,
    state: watch::Sender<ServiceState>,
    rules: RwLock<RuleSet>,
    trigger_count: AtomicUsize,
    /// Serializes init/stop/restart
    session: Mutex<Option<Session>>,
}

impl<S: RuleStore> SchedulerService<S> {
    /// Create a stopped scheduler service
    pub fn new(
        config: EngineConfig,
        actuators: Arc<dyn ActuatorPort>,
        sensor: Arc<dyn SensorPort>,
        store: Arc<S>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (state, _) = watch::channel(ServiceState::Stopped);

        Self {
            config,
            actuators,
            sensor,
            store,
            clock: Arc::new(SystemClock),
            shared: ExecutorShared {
                states: Arc::new(DashMap::new()),
                pending: Arc::new(DashMap::new()),
                events,
            },
            state,
            rules: RwLock::new(RuleSet::default()),
            trigger_count: AtomicUsize::new(0),
            session: Mutex::new(None),
        }
    }

    /// Replace the wall clock (tests, simulations)
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Load rules and start all triggers and the polling loop
    pub async fn init(&self) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        self.init_locked(&mut session).await
    }

    /// Alias of [`init`](Self::init) for the outer control surface
    pub async fn start(&self) -> Result<(), EngineError> {
        self.init().await
    }

    /// Cancel every trigger and pending deactivation. Actuators keep their last level.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        self.stop_locked(&mut session).await;
        Ok(())
    }

    /// Stop and re-init under one lock, so old and new timer sets never overlap
    pub async fn restart(&self) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        tracing::info!("Restarting scheduler");
        self.stop_locked(&mut session).await;
        self.init_locked(&mut session).await
    }

    async fn init_locked(&self, session: &mut Option<Session>) -> Result<(), EngineError> {
        if session.is_some() {
            return Err(EngineError::AlreadyRunning);
        }
        self.set_state(ServiceState::Initializing);

        let (schedules, conditions) = match self.load_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                tracing::error!("Failed to load rules: {}", e);
                self.set_state(ServiceState::Stopped);
                return Err(e);
            }
        };

        let (executor, executor_task) = ActivationExecutor::spawn(
            Arc::clone(&self.actuators),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.shared.clone(),
            self.config.log_source.clone(),
        );

        let triggers = TriggerEngine::new(executor.clone(), Arc::clone(&self.clock));
        for schedule in schedules.iter().filter(|s| s.enabled) {
            if let Err(e) = triggers.register(schedule, self.config.actuator_count) {
                self.reject("schedule", &schedule.id, &e);
            }
        }

        let mut evaluator = ConditionEvaluator::new(Arc::clone(&self.sensor), executor.clone());
        for condition in conditions.iter().filter(|c| c.enabled) {
            if let Err(e) = evaluator.register(condition.clone(), self.config.actuator_count) {
                self.reject("condition", &condition.id, &e);
            }
        }
        let evaluator_task = if evaluator.is_empty() {
            None
        } else {
            Some(evaluator.spawn(self.config.poll_interval()))
        };

        let _ = self.shared.events.send(EngineEvent::RulesLoaded {
            schedules: schedules.len(),
            conditions: conditions.len(),
            triggers: triggers.active_count(),
        });
        tracing::info!(
            "Scheduler running: {} schedules ({} triggers), {} conditions",
            schedules.len(),
            triggers.active_count(),
            conditions.len()
        );

        self.trigger_count
            .store(triggers.active_count(), Ordering::SeqCst);
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = RuleSet {
            schedules,
            conditions,
        };
        *session = Some(Session {
            executor,
            executor_task,
            triggers,
            evaluator_task,
        });
        self.set_state(ServiceState::Running);
        Ok(())
    }

    async fn stop_locked(&self, session: &mut Option<Session>) {
        let Some(mut active) = session.take() else {
            return;
        };
        self.set_state(ServiceState::Stopping);
        active.shutdown().await;
        self.trigger_count.store(0, Ordering::SeqCst);
        self.set_state(ServiceState::Stopped);
        tracing::info!("Scheduler stopped");
    }

    async fn load_rules(&self) -> Result<(Vec<Schedule>, Vec<Condition>), EngineError> {
        let schedules = self.store.load_schedules().await?;
        let conditions = self.store.load_conditions().await?;
        Ok((schedules, conditions))
    }

    fn reject(&self, kind: &str, rule_id: &str, error: &EngineError) {
        let message = format!("Rejected {kind} {rule_id}: {error}");
        tracing::warn!("{}", message);
        if let Err(e) = self
            .store
            .append_log(LogLevel::Warn, &message, &self.config.log_source)
        {
            tracing::warn!("Failed to append rejection log: {}", e);
        }
        let _ = self.shared.events.send(EngineEvent::RuleRejected {
            rule_id: rule_id.to_string(),
            error: error.to_string(),
        });
    }

    fn set_state(&self, state: ServiceState) {
        self.state.send_replace(state);
        let _ = self.shared.events.send(EngineEvent::StateChanged { state });
    }

    /// Read-only status snapshot.
    ///
    /// Rule counts cover everything loaded from the store; `trigger_count` is what is live.
    pub fn get_status(&self) -> EngineStatus {
        let state = self.state();
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        EngineStatus {
            state,
            running: state == ServiceState::Running,
            schedule_count: rules.schedules.len(),
            condition_count: rules.conditions.len(),
            trigger_count: self.trigger_count.load(Ordering::SeqCst),
            pending_timer_count: self.shared.pending.len(),
        }
    }

    /// Last confirmed state of every actuator the engine has driven
    pub fn actuator_states(&self) -> Vec<ActuatorState> {
        let mut states: Vec<ActuatorState> = self
            .shared
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        states.sort_by_key(|s| s.actuator_id);
        states
    }

    /// Armed deactivations, one per actuator at most
    pub fn pending_deactivations(&self) -> Vec<PendingDeactivation> {
        let mut pending: Vec<PendingDeactivation> = self
            .shared
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|p| p.actuator_id);
        pending
    }

    /// Read an actuator's level straight from the port
    pub fn actuator_level(&self, actuator_id: ActuatorId) -> Result<bool, EngineError> {
        check_actuator(actuator_id, self.config.actuator_count)?;
        self.actuators.get_output(actuator_id)
    }

    /// Manually drive an actuator through the executor
    pub async fn set_actuator(
        &self,
        actuator_id: ActuatorId,
        level: bool,
    ) -> Result<(), EngineError> {
        check_actuator(actuator_id, self.config.actuator_count)?;
        let executor = self.executor().await?;
        executor.set_manual(actuator_id, level).await
    }

    /// Wait until every command queued so far has been applied
    pub async fn flush(&self) {
        if let Ok(executor) = self.executor().await {
            executor.flush().await;
        }
    }

    async fn executor(&self) -> Result<ExecutorHandle, EngineError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.executor.clone())
            .ok_or(EngineError::NotRunning)
    }

    /// Apply a stored rule change; only a full restart touches a running engine
    async fn apply_rule_change(&self) -> Result<(), EngineError> {
        if self.state() == ServiceState::Stopped {
            return Ok(());
        }
        self.restart().await
    }

    /// All schedules in the store
    pub async fn list_schedules(&self) -> Result<Vec<Schedule>, EngineError> {
        self.store.load_schedules().await
    }

    /// Get a schedule by ID
    pub async fn get_schedule(&self, id: &str) -> Result<Schedule, EngineError> {
        self.list_schedules()
            .await?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Create a new schedule
    pub async fn create_schedule(&self, request: ScheduleRequest) -> Result<Schedule, EngineError> {
        let schedule = Schedule::from_request(request);
        validate_schedule(&schedule, self.config.actuator_count)?;

        self.store.save_schedule(schedule.clone()).await?;
        tracing::info!("Created schedule {}", schedule.id);
        self.apply_rule_change().await?;
        Ok(schedule)
    }

    /// Replace a schedule
    pub async fn update_schedule(
        &self,
        id: &str,
        request: ScheduleRequest,
    ) -> Result<Schedule, EngineError> {
        let mut schedule = self.get_schedule(id).await?;
        schedule.replace(request);
        validate_schedule(&schedule, self.config.actuator_count)?;

        self.store.save_schedule(schedule.clone()).await?;
        tracing::info!("Updated schedule {}", id);
        self.apply_rule_change().await?;
        Ok(schedule)
    }

    /// Delete a schedule
    pub async fn delete_schedule(&self, id: &str) -> Result<(), EngineError> {
        if !self.store.delete_schedule(id).await? {
            return Err(EngineError::NotFound(id.to_string()));
        }
        tracing::info!("Deleted schedule {}", id);
        self.apply_rule_change().await
    }

    /// Enable or disable a schedule
    pub async fn set_schedule_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<Schedule, EngineError> {
        let mut schedule = self.get_schedule(id).await?;
        schedule.enabled = enabled;
        schedule.updated_at = chrono::Utc::now().to_rfc3339();

        self.store.save_schedule(schedule.clone()).await?;
        tracing::info!(
            "{} schedule {}",
            if enabled { "Enabled" } else { "Disabled" },
            id
        );
        self.apply_rule_change().await?;
        Ok(schedule)
    }

    /// All conditions in the store
    pub async fn list_conditions(&self) -> Result<Vec<Condition>, EngineError> {
        self.store.load_conditions().await
    }

    /// Get a condition by ID
    pub async fn get_condition(&self, id: &str) -> Result<Condition, EngineError> {
        self.list_conditions()
            .await?
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Create a new condition
    pub async fn create_condition(
        &self,
        request: ConditionRequest,
    ) -> Result<Condition, EngineError> {
        let condition = Condition::from_request(request);
        validate_condition(&condition, self.config.actuator_count)?;

        self.store.save_condition(condition.clone()).await?;
        tracing::info!("Created condition {}", condition.id);
        self.apply_rule_change().await?;
        Ok(condition)
    }

    /// Replace a condition
    pub async fn update_condition(
        &self,
        id: &str,
        request: ConditionRequest,
    ) -> Result<Condition, EngineError> {
        let mut condition = self.get_condition(id).await?;
        condition.replace(request);
        validate_condition(&condition, self.config.actuator_count)?;

        self.store.save_condition(condition.clone()).await?;
        tracing::info!("Updated condition {}", id);
        self.apply_rule_change().await?;
        Ok(condition)
    }

    /// Delete a condition
    pub async fn delete_condition(&self, id: &str) -> Result<(), EngineError> {
        if !self.store.delete_condition(id).await? {
            return Err(EngineError::NotFound(id.to_string()));
        }
        tracing::info!("Deleted condition {}", id);
        self.apply_rule_change().await
    }

    /// Enable or disable a condition
    pub async fn set_condition_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<Condition, EngineError> {
        let mut condition = self.get_condition(id).await?;
        condition.enabled = enabled;
        condition.updated_at = chrono::Utc::now().to_rfc3339();

        self.store.save_condition(condition.clone()).await?;
        tracing::info!(
            "{} condition {}",
            if enabled { "Enabled" } else { "Disabled" },
            id
        );
        self.apply_rule_change().await?;
        Ok(condition)
    }
}
