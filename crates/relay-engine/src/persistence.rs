//! Rule persistence using JSON file storage

use crate::error::EngineError;
use crate::model::{Condition, LogLevel, LogRecord, Schedule};
use crate::ports::RuleStore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::fs;

/// How many audit records the store keeps in memory
pub const LOG_CAPACITY: usize = 500;

/// On-disk layout of the rules file
#[derive(Debug, Default, Serialize, Deserialize)]
struct RuleDocument {
    #[serde(default)]
    schedules: Vec<Schedule>,
    #[serde(default)]
    conditions: Vec<Condition>,
}

/// Rule store backed by a single JSON document
pub struct JsonRuleStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles on the rules file
    write_lock: tokio::sync::Mutex<()>,
    logs: Mutex<VecDeque<LogRecord>>,
}

impl JsonRuleStore {
    /// Store rules in `<data_dir>/rules.json`
    pub fn new(data_dir: &Path) -> Self {
        Self::at_path(data_dir.join("rules.json"))
    }

    /// Store rules in an explicit file
    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: tokio::sync::Mutex::new(()),
            logs: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
        }
    }

    /// Path of the rules file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Most recent audit records, newest last
    pub fn recent_logs(&self, limit: usize) -> Vec<LogRecord> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = logs.len().saturating_sub(limit);
        logs.iter().skip(skip).cloned().collect()
    }

    async fn read_document(&self) -> Result<RuleDocument, EngineError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let document: RuleDocument = serde_json::from_str(&contents)?;
                tracing::debug!(
                    "Loaded {} schedules and {} conditions from {:?}",
                    document.schedules.len(),
                    document.conditions.len(),
                    self.path
                );
                Ok(document)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No rules file found at {:?}, starting fresh", self.path);
                Ok(RuleDocument::default())
            }
            Err(e) => Err(EngineError::Persistence(format!(
                "failed to read {:?}: {e}",
                self.path
            ))),
        }
    }

    /// Write the document atomically: write to temp file, then rename
    async fn write_document(&self, document: &RuleDocument) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(document)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &json).await?;
        fs::rename(&tmp_path, &self.path).await?;

        tracing::debug!(
            "Saved {} schedules and {} conditions to {:?}",
            document.schedules.len(),
            document.conditions.len(),
            self.path
        );
        Ok(())
    }
}

impl RuleStore for JsonRuleStore {
    async fn load_schedules(&self) -> Result<Vec<Schedule>, EngineError> {
        Ok(self.read_document().await?.schedules)
    }

    async fn load_conditions(&self) -> Result<Vec<Condition>, EngineError> {
        Ok(self.read_document().await?.conditions)
    }

    async fn save_schedule(&self, schedule: Schedule) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        match document.schedules.iter_mut().find(|s| s.id == schedule.id) {
            Some(existing) => *existing = schedule,
            None => document.schedules.push(schedule),
        }
        self.write_document(&document).await
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool, EngineError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        let before = document.schedules.len();
        document.schedules.retain(|s| s.id != id);
        if document.schedules.len() == before {
            return Ok(false);
        }
        self.write_document(&document).await?;
        Ok(true)
    }

    async fn save_condition(&self, condition: Condition) -> Result<(), EngineError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        match document.conditions.iter_mut().find(|c| c.id == condition.id) {
            Some(existing) => *existing = condition,
            None => document.conditions.push(condition),
        }
        self.write_document(&document).await
    }

    async fn delete_condition(&self, id: &str) -> Result<bool, EngineError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        let before = document.conditions.len();
        document.conditions.retain(|c| c.id != id);
        if document.conditions.len() == before {
            return Ok(false);
        }
        self.write_document(&document).await?;
        Ok(true)
    }

    fn append_log(&self, level: LogLevel, message: &str, source: &str) -> Result<(), EngineError> {
        match level {
            LogLevel::Debug => tracing::debug!(target: "audit", source, "{}", message),
            LogLevel::Info => tracing::info!(target: "audit", source, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "audit", source, "{}", message),
            LogLevel::Error => tracing::error!(target: "audit", source, "{}", message),
        }

        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        if logs.len() == LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(LogRecord {
            timestamp: chrono::Local::now().naive_local(),
            level,
            message: message.to_string(),
            source: source.to_string(),
        });
        Ok(())
    }
}
