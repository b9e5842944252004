//! Durable, idempotent execution of queued work.
//!
//! The engine wraps the store's fenced claim/dequeue contracts with retry
//! accounting, dependency gating, cascading rollup to unified tasks, and the
//! sweepers that keep the queue live across crashes. The execution id is the
//! fencing token that makes at-least-once delivery safe under multi-worker
//! recovery; it is set atomically on claim and verified on every mutation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mx_core::types::{Mission, MissionStatus};
use mx_store::{ClaimOutcome, DequeueError, Store, StoreError};
use rand::Rng;
use uuid::Uuid;

mod sweeper;

pub use sweeper::{Sweeper, SweeperConfig};

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Base retry delay (10 s).
pub const RETRY_BASE_SECS: i64 = 10;
/// Retry delay ceiling (5 min).
pub const RETRY_MAX_SECS: i64 = 300;
/// Jitter bound (2 s, exclusive).
pub const RETRY_JITTER_MS: i64 = 2_000;

/// `min(base · 2^retry_count, max) + jitter`, jitter ∈ [0, 2 s).
pub fn retry_delay(retry_count: i64) -> ChronoDuration {
    let exp = retry_count.clamp(0, 30) as u32;
    let backoff_secs = RETRY_BASE_SECS
        .saturating_mul(1i64 << exp.min(20))
        .min(RETRY_MAX_SECS);
    let jitter_ms = rand::thread_rng().gen_range(0..RETRY_JITTER_MS);
    ChronoDuration::seconds(backoff_secs) + ChronoDuration::milliseconds(jitter_ms)
}

/// Absolute next-retry timestamp for a row failing its `retry_count`-th time.
pub fn next_retry_at(retry_count: i64) -> DateTime<Utc> {
    Utc::now() + retry_delay(retry_count)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("mission {0} not found")]
    NotFound(String),
    #[error("not the fence holder for mission {0}")]
    NotHolder(String),
    #[error("dequeue: {0}")]
    Dequeue(#[from] DequeueError),
}

// ---------------------------------------------------------------------------
// TaskEngine
// ---------------------------------------------------------------------------

/// Mission lifecycle driver. Cheap to clone (shares the store handle).
#[derive(Clone)]
pub struct TaskEngine {
    store: Store,
}

impl TaskEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Mint an execution id for a claim attempt.
    pub fn mint_execution_id() -> String {
        format!("exec-{}", Uuid::new_v4())
    }

    /// Create a mission and move it into the queue (or `blocked` when its
    /// dependencies are not yet complete).
    pub async fn enqueue(&self, mission: &Mission) -> Result<MissionStatus, TaskError> {
        self.store.create_mission(mission).await?;
        let status = self.store.queue_mission(&mission.id).await?;
        tracing::info!(mission_id = %mission.id, status = %status, "mission enqueued");
        Ok(status)
    }

    /// Fenced claim (`queued → processing`). Idempotent per execution id.
    pub async fn claim(
        &self,
        task_id: &str,
        agent_id: i64,
        execution_id: &str,
    ) -> Result<ClaimOutcome, TaskError> {
        let outcome = self.store.claim_task(task_id, agent_id, execution_id).await?;
        if outcome.claimed {
            tracing::debug!(task_id, agent_id, execution_id, "mission claimed");
        }
        Ok(outcome)
    }

    /// `queued → running` for missions, erroring instead of classifying.
    pub async fn dequeue(
        &self,
        mission_id: &str,
        agent_id: i64,
        execution_id: &str,
    ) -> Result<Mission, TaskError> {
        match self
            .store
            .atomic_dequeue_mission(mission_id, agent_id, execution_id)
            .await?
        {
            Ok(mission) => Ok(mission),
            Err(e) => Err(e.into()),
        }
    }

    /// Give the mission back to the queue (crash recovery, voluntary yield).
    pub async fn release(&self, mission_id: &str, execution_id: &str) -> Result<(), TaskError> {
        if self.store.release_mission(mission_id, execution_id).await? {
            tracing::info!(mission_id, "mission released back to queue");
            Ok(())
        } else {
            Err(TaskError::NotHolder(mission_id.to_string()))
        }
    }

    /// Terminal success. Unblocks dependents, credits the agent, and rolls
    /// the completion up into the referenced unified task.
    pub async fn complete(&self, mission_id: &str, execution_id: &str) -> Result<(), TaskError> {
        let mission = self
            .store
            .get_mission(mission_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(mission_id.to_string()))?;

        if !self.store.complete_mission(mission_id, execution_id).await? {
            return Err(TaskError::NotHolder(mission_id.to_string()));
        }
        tracing::info!(mission_id, "mission completed");

        let unblocked = self.store.unblock_ready_missions().await?;
        if unblocked > 0 {
            tracing::debug!(count = unblocked, "dependent missions unblocked");
        }

        if let Some(unified_id) = mission.unified_task_id {
            if self.store.rollup_unified(unified_id).await? {
                tracing::info!(unified_id, "unified task rolled up to done");
            }
        }
        Ok(())
    }

    /// Record a failure. With retry budget left the mission parks in
    /// `retrying` behind an exponential-backoff timestamp; otherwise it
    /// terminates in `failed` (and still rolls up).
    pub async fn fail(
        &self,
        mission_id: &str,
        execution_id: &str,
        error: &str,
    ) -> Result<MissionStatus, TaskError> {
        let mission = self
            .store
            .get_mission(mission_id)
            .await?
            .ok_or_else(|| TaskError::NotFound(mission_id.to_string()))?;

        let retries_left = mission.retry_count < mission.max_retries;
        let retry_at = retries_left.then(|| Utc::now() + retry_delay(mission.retry_count));

        if !self
            .store
            .fail_mission(mission_id, execution_id, error, retry_at)
            .await?
        {
            return Err(TaskError::NotHolder(mission_id.to_string()));
        }

        let status = if retries_left {
            tracing::warn!(mission_id, error, retry_at = ?retry_at, "mission failed, will retry");
            MissionStatus::Retrying
        } else {
            tracing::error!(mission_id, error, "mission failed terminally");
            if let Some(unified_id) = mission.unified_task_id {
                self.store.rollup_unified(unified_id).await?;
            }
            MissionStatus::Failed
        };
        Ok(status)
    }

    /// Cancel a non-terminal mission.
    pub async fn cancel(&self, mission_id: &str) -> Result<bool, TaskError> {
        let cancelled = self.store.cancel_mission(mission_id).await?;
        if cancelled {
            tracing::info!(mission_id, "mission cancelled");
            let mission = self.store.get_mission(mission_id).await?;
            if let Some(unified_id) = mission.and_then(|m| m.unified_task_id) {
                self.store.rollup_unified(unified_id).await?;
            }
        }
        Ok(cancelled)
    }

    /// One pass of the retry sweep: re-queue due `pending|retrying` rows.
    /// Returns how many rows moved to `queued`.
    pub async fn sweep_retries(&self, batch: usize) -> Result<usize, TaskError> {
        let due = self.store.due_mission_retries(batch).await?;
        let mut requeued = 0;
        for id in due {
            match self.store.requeue_mission(&id).await? {
                MissionStatus::Queued => requeued += 1,
                MissionStatus::Failed => {
                    tracing::error!(mission_id = %id, "retry budget exhausted");
                }
                _ => {}
            }
        }
        Ok(requeued)
    }

    /// One pass of stuck-task recovery: release in-flight rows whose
    /// `started_at` is older than their own `timeout_ms`. At-least-once:
    /// handlers must be idempotent on the content side.
    pub async fn recover_stuck(&self) -> Result<usize, TaskError> {
        let now = Utc::now();
        let mut recovered = 0;
        for mission in self.store.inflight_missions().await? {
            let Some(started) = mission.started_at else {
                continue;
            };
            let deadline = started + ChronoDuration::milliseconds(mission.timeout_ms);
            if deadline > now {
                continue;
            }
            let Some(execution_id) = mission.execution_id.as_deref() else {
                continue;
            };
            if self.store.release_mission(&mission.id, execution_id).await? {
                tracing::warn!(
                    mission_id = %mission.id,
                    timeout_ms = mission.timeout_ms,
                    "stuck mission released"
                );
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_bounded() {
        for count in 0..12 {
            let delay = retry_delay(count);
            let secs = delay.num_seconds();
            assert!(secs >= RETRY_BASE_SECS.min(10), "count {count}: {secs}s");
            assert!(
                secs <= RETRY_MAX_SECS + 2,
                "count {count}: {secs}s exceeds cap + jitter"
            );
        }
    }

    #[test]
    fn retry_delay_grows_exponentially_until_cap() {
        // Deterministic part: strip jitter by comparing lower bounds.
        let lower = |count: i64| RETRY_BASE_SECS.saturating_mul(1 << count).min(RETRY_MAX_SECS);
        assert_eq!(lower(0), 10);
        assert_eq!(lower(1), 20);
        assert_eq!(lower(2), 40);
        assert_eq!(lower(5), 300); // capped
        assert_eq!(lower(10), 300);
    }

    #[test]
    fn mint_execution_id_is_unique() {
        assert_ne!(TaskEngine::mint_execution_id(), TaskEngine::mint_execution_id());
    }
}
