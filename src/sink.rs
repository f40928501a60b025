use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex, time::sleep};
use tracing::{debug, error, info, warn};

use crate::config::{Backoff, Config};
use crate::db::{DocumentStore, StoreError, UpsertOutcome};
use crate::models::{CanonicalRecord, ValidationError};
use crate::stats::PipelineStats;

/// Terminal outcome of one `persist` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistResult {
    Stored,
    /// Natural key already present; the store was not modified.
    Duplicate,
    /// Failed required-field validation; never written.
    Rejected(ValidationError),
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub dead_letter_path: Option<PathBuf>,
}

impl From<&Config> for SinkSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.persist_max_attempts,
            backoff: cfg.persist_backoff,
            dead_letter_path: Some(cfg.dead_letter_path.clone()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeadLetter<'a> {
    failed_at: String,
    attempts: u32,
    error: String,
    record: &'a CanonicalRecord,
}

/// Appends records that could not be stored to a JSON-lines file.
struct DeadLetterFile {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl DeadLetterFile {
    async fn append(&self, letter: &DeadLetter<'_>) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(letter)?;
        line.push(b'\n');
        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

/// Idempotent, retrying writer in front of a [`DocumentStore`].
/// Cheap to share across tasks behind an `Arc`.
pub struct PersistenceSink {
    store: Arc<dyn DocumentStore>,
    settings: SinkSettings,
    dead_letters: DeadLetterFile,
    stats: Arc<PipelineStats>,
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn DocumentStore>, settings: SinkSettings, stats: Arc<PipelineStats>) -> Self {
        let dead_letters = DeadLetterFile {
            path: settings.dead_letter_path.clone(),
            lock: Mutex::new(()),
        };
        Self {
            store,
            settings,
            dead_letters,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub async fn prepare(&self) -> Result<(), StoreError> {
        self.store.prepare().await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.store.close().await
    }

    pub async fn persist(&self, record: &CanonicalRecord) -> PersistResult {
        if let Err(invalid) = record.validate() {
            warn!(key = %record.natural_key, "Dropping invalid record: {}", invalid);
            self.stats.record_rejected();
            return PersistResult::Rejected(invalid);
        }

        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.upsert(record).await {
                Ok(UpsertOutcome::Inserted) => {
                    info!(
                        key = %record.natural_key,
                        kind = %record.kind(),
                        block = record.block_number,
                        "Stored record"
                    );
                    self.stats.record_stored();
                    return PersistResult::Stored;
                }
                Ok(UpsertOutcome::AlreadyPresent) => {
                    debug!(key = %record.natural_key, "Record already stored, skipping duplicate");
                    self.stats.duplicate();
                    return PersistResult::Duplicate;
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.settings.backoff.delay(attempt);
                    warn!(
                        key = %record.natural_key,
                        attempt,
                        max_attempts,
                        "Persist failed: {}. Retrying in {:?}",
                        e,
                        delay
                    );
                    self.stats.persist_retry();
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.dead_letter(record, attempt, &e.to_string()).await;
                    return PersistResult::DeadLettered { attempts: attempt };
                }
            }
        }
    }

    /// Sets aside a record whose write was cut off before it finished.
    pub async fn abandon(&self, record: &CanonicalRecord, reason: &str) -> PersistResult {
        self.dead_letter(record, 0, reason).await;
        PersistResult::DeadLettered { attempts: 0 }
    }

    async fn dead_letter(&self, record: &CanonicalRecord, attempts: u32, reason: &str) {
        self.stats.record_dead_lettered();
        let letter = DeadLetter {
            failed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            attempts,
            error: reason.to_string(),
            record,
        };
        error!(
            key = %record.natural_key,
            attempts,
            record = %serde_json::to_string(record).unwrap_or_default(),
            "Dead-lettered record: {}",
            reason
        );
        if let Err(io) = self.dead_letters.append(&letter).await {
            error!(key = %record.natural_key, "Failed to write dead letter: {}", io);
        }
    }
}
