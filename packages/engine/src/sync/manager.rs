use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_timer::Delay;
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::{DbError, SyncFailureKind};
use crate::journal::DirtyRow;

use super::{ApplyReport, RemoteRow};

/// One table's worth of server rows from a pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub table: String,
    pub rows: Vec<RemoteRow>,
}

/// Transport seam. Implementations talk to the server; the manager owns
/// retries, journal acknowledgement, and remote application.
#[async_trait(?Send)]
pub trait SyncTransport {
    /// Uploads a batch of dirty rows. Returning `Ok` acknowledges the whole
    /// batch. Failures use the sync taxonomy: `Transport` errors are
    /// retried, `PermanentRejection` is not.
    async fn push(&self, batch: &[DirtyRow]) -> Result<(), DbError>;

    /// Fetches remote changes since the server-side cursor.
    async fn pull(&self) -> Result<Vec<RemoteBatch>, DbError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given zero-based attempt, capped at
    /// `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEventKind {
    Push,
    Pull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub kind: SyncEventKind,
    pub success: bool,
    pub rows: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncManagerConfig {
    pub policy: RetryPolicy,
    /// Bounded status history length.
    pub history_limit: usize,
    /// Drop permanently rejected batches from the journal instead of
    /// keeping them pending forever.
    pub discard_on_rejection: bool,
}

impl Default for SyncManagerConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            history_limit: 64,
            discard_on_rejection: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub pushed: usize,
    pub pulled: usize,
}

/// Synchronization façade: one-shot `sync_now`, a cooperative auto loop,
/// and a bounded event history.
pub struct SyncManager {
    database: Arc<Database>,
    transport: Box<dyn SyncTransport>,
    config: SyncManagerConfig,
    history: Mutex<VecDeque<SyncEvent>>,
    running: AtomicBool,
}

impl SyncManager {
    pub fn new(
        database: Arc<Database>,
        transport: Box<dyn SyncTransport>,
        config: SyncManagerConfig,
    ) -> Self {
        Self {
            database,
            transport,
            config,
            history: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Pushes pending dirty rows (with retry/backoff), then pulls and
    /// applies remote changes.
    pub async fn sync_now(&self) -> Result<SyncSummary, DbError> {
        let pushed = self.push_pending().await?;
        let pulled = self.pull_remote().await?;
        Ok(SyncSummary { pushed, pulled })
    }

    /// Cooperative auto-sync loop; drive the returned future on the task
    /// runner of your choice and call [`SyncManager::stop_auto`] to end it.
    pub async fn start_auto(&self, interval: Duration) {
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.sync_now().await {
                tracing::warn!(error = %err, "auto sync pass failed");
            }
            Delay::new(interval).await;
        }
    }

    pub fn stop_auto(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn history(&self) -> Vec<SyncEvent> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    async fn push_pending(&self) -> Result<usize, DbError> {
        let batch = self.database.dirty_rows().await?;
        if batch.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = batch.iter().map(|entry| entry.id.clone()).collect();

        let mut attempt = 0;
        loop {
            match self.transport.push(&batch).await {
                Ok(()) => {
                    self.database.mark_synced(&ids).await?;
                    self.record(SyncEvent {
                        kind: SyncEventKind::Push,
                        success: true,
                        rows: batch.len(),
                        error: None,
                    });
                    tracing::info!(rows = batch.len(), "pushed dirty rows");
                    return Ok(batch.len());
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.config.policy.max_attempts => {
                    let delay = self.config.policy.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "push failed, backing off"
                    );
                    Delay::new(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    let permanent = matches!(
                        err,
                        DbError::Sync {
                            kind: SyncFailureKind::PermanentRejection,
                            ..
                        }
                    );
                    if permanent && self.config.discard_on_rejection {
                        self.database.discard(&ids).await?;
                        tracing::warn!(rows = batch.len(), "discarded rejected batch");
                    }
                    self.record(SyncEvent {
                        kind: SyncEventKind::Push,
                        success: false,
                        rows: batch.len(),
                        error: Some(err.to_string()),
                    });
                    return Err(err);
                }
            }
        }
    }

    async fn pull_remote(&self) -> Result<usize, DbError> {
        let batches = match self.transport.pull().await {
            Ok(batches) => batches,
            Err(err) => {
                self.record(SyncEvent {
                    kind: SyncEventKind::Pull,
                    success: false,
                    rows: 0,
                    error: Some(err.to_string()),
                });
                return Err(err);
            }
        };

        let mut applied = ApplyReport::default();
        for batch in &batches {
            let report = self.database.apply_remote(&batch.table, &batch.rows).await?;
            applied.inserted += report.inserted;
            applied.updated += report.updated;
            applied.unchanged += report.unchanged;
        }

        let rows = applied.inserted + applied.updated;
        self.record(SyncEvent {
            kind: SyncEventKind::Pull,
            success: true,
            rows,
            error: None,
        });
        Ok(rows)
    }

    fn record(&self, event: SyncEvent) {
        let mut history = self.history.lock().unwrap();
        history.push_back(event);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(8), Duration::from_millis(500));
    }
}
