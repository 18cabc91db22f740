//! Per-work-item checkpoint persistence for resume-after-crash.
//!
//! Every mutation of the active work item's history passes through this
//! store: the checkpoint processor is the last step of the history pipeline
//! and writes under the work item bound by [`with_checkpoint_scope`]. With
//! no scope bound the processor is a pass-through, which keeps the pipeline
//! safe for offline history reshaping.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use autopoiesis_protocol::Message;
use autopoiesis_protocol::Role;
use autopoiesis_protocol::history_to_json;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;
use tracing::warn;

use crate::error::Result;
use crate::util::utc_now_epoch;

/// Rows written by older code are treated as absent.
pub const CHECKPOINT_VERSION: i64 = 2;

pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                work_item_id TEXT PRIMARY KEY,
                checkpoint_version INTEGER NOT NULL,
                history_json TEXT NOT NULL,
                round_count INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Upsert the single checkpoint row for `work_item_id`.
    pub fn save(&self, work_item_id: &str, history_json: &str, round_count: i64) -> Result<()> {
        self.lock_conn().execute(
            "INSERT INTO checkpoints (
                work_item_id, checkpoint_version, history_json, round_count, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(work_item_id) DO UPDATE SET
                checkpoint_version = excluded.checkpoint_version,
                history_json = excluded.history_json,
                round_count = excluded.round_count,
                updated_at = excluded.updated_at",
            params![
                work_item_id,
                CHECKPOINT_VERSION,
                history_json,
                round_count,
                utc_now_epoch(),
            ],
        )?;
        Ok(())
    }

    /// Latest history for `work_item_id`, or `None` when absent or written
    /// by an incompatible version.
    pub fn load(&self, work_item_id: &str) -> Result<Option<String>> {
        let row: Option<(i64, String)> = self
            .lock_conn()
            .query_row(
                "SELECT checkpoint_version, history_json
                 FROM checkpoints WHERE work_item_id = ?1",
                params![work_item_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(version, history)| (version == CHECKPOINT_VERSION).then_some(history)))
    }

    pub fn clear(&self, work_item_id: &str) -> Result<()> {
        self.lock_conn().execute(
            "DELETE FROM checkpoints WHERE work_item_id = ?1",
            params![work_item_id],
        )?;
        Ok(())
    }

    /// Delete rows not updated within `max_age_hours`. Returns rows removed.
    pub fn cleanup_stale(&self, max_age_hours: i64) -> Result<usize> {
        let cutoff = utc_now_epoch() - max_age_hours * 3600;
        let removed = self.lock_conn().execute(
            "DELETE FROM checkpoints WHERE updated_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    // Poisoned mutex means a panic mid-statement; propagate it.
    #[allow(clippy::unwrap_used)]
    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

/// Checkpoint target for the currently executing work item.
#[derive(Clone)]
pub struct CheckpointScope {
    pub store: Arc<CheckpointStore>,
    pub work_item_id: String,
}

tokio::task_local! {
    static ACTIVE_CHECKPOINT: CheckpointScope;
}

/// Run `fut` with checkpoint persistence bound to `scope`. The binding is
/// released on all exit paths, including panics and cancellation.
pub async fn with_checkpoint_scope<F>(scope: CheckpointScope, fut: F) -> F::Output
where
    F: std::future::Future,
{
    ACTIVE_CHECKPOINT.scope(scope, fut).await
}

/// Completed model rounds in a history: the number of assistant messages,
/// falling back to the message count when none exist yet.
pub fn count_history_rounds(messages: &[Message]) -> i64 {
    let responses = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count();
    if responses > 0 {
        responses as i64
    } else {
        messages.len() as i64
    }
}

/// Pipeline step: persist an in-flight checkpoint whenever the active work
/// item's history is rewritten. No-op outside a checkpoint scope; write
/// failures are logged, never fatal to the turn.
pub fn checkpoint_processor(messages: Vec<Message>) -> Vec<Message> {
    let scope = match ACTIVE_CHECKPOINT.try_with(|s| s.clone()) {
        Ok(scope) => scope,
        Err(_) => return messages,
    };
    match history_to_json(&messages) {
        Ok(history_json) => {
            if let Err(err) = scope.store.save(
                &scope.work_item_id,
                &history_json,
                count_history_rounds(&messages),
            ) {
                warn!(
                    work_item_id = %scope.work_item_id,
                    "failed to persist checkpoint: {err}"
                );
            }
        }
        Err(err) => {
            warn!(
                work_item_id = %scope.work_item_id,
                "failed to serialise checkpoint history: {err}"
            );
        }
    }
    messages
}
