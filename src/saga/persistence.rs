//! Durable checkpoint/resume/cleanup of saga state

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, instrument};

use crate::error::{Result, SyndicateError};
use crate::saga::{SagaState, SagaStatus};
use crate::store::{timestamp_value, DocumentStore, DocumentStoreExt, Query, SortOrder};

const SAGAS: &str = "sagas";

/// Saga documents in a [`DocumentStore`]
#[derive(Clone)]
pub struct SagaStore {
    store: Arc<dyn DocumentStore>,
}

impl SagaStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Full-document upsert of the cumulative state.
    ///
    /// Fails with `SagaConflict` when the stored document carries a newer
    /// version than `state`; otherwise bumps `state.version` and stamps
    /// `last_checkpoint_at`.
    #[instrument(skip(self, state), fields(saga_id = %state.id, version = state.version))]
    pub async fn checkpoint_saga(&self, state: &mut SagaState) -> Result<()> {
        if let Some(stored) = self.load_saga_state(&state.id).await? {
            if stored.version > state.version {
                return Err(SyndicateError::SagaConflict {
                    id: state.id.clone(),
                    held: state.version,
                    stored: stored.version,
                });
            }
        }

        state.version += 1;
        state.last_checkpoint_at = Utc::now();
        self.store.put_doc(SAGAS, &state.id, &*state).await?;
        debug!(step = state.current_step_index, status = ?state.status, "Saga checkpointed");
        Ok(())
    }

    /// `None` when no saga with that id exists
    pub async fn load_saga_state(&self, id: &str) -> Result<Option<SagaState>> {
        self.store.get_doc(SAGAS, id).await
    }

    /// Sagas still IN_PROGRESS or COMPENSATING, oldest first
    pub async fn find_incomplete_sagas(&self) -> Result<Vec<SagaState>> {
        let query = Query::new()
            .any_of(
                "status",
                [SagaStatus::InProgress.as_str(), SagaStatus::Compensating.as_str()],
            )
            .order_by("started_at", SortOrder::Asc);
        self.store.query_docs(SAGAS, &query).await
    }

    /// Move a saga to a terminal status.
    ///
    /// Repeating the same terminal status is a no-op; any other change to a
    /// terminal saga is rejected. `error` is kept only for FAILED.
    #[instrument(skip(self, error))]
    pub async fn complete_saga(&self, id: &str, status: SagaStatus, error: Option<String>) -> Result<SagaState> {
        if !status.is_terminal() {
            return Err(SyndicateError::InvalidTransition(format!(
                "{} is not a terminal saga status",
                status.as_str()
            )));
        }

        let mut state = self
            .load_saga_state(id)
            .await?
            .ok_or_else(|| SyndicateError::SagaNotFound(id.to_string()))?;

        if state.status.is_terminal() {
            if state.status == status {
                return Ok(state);
            }
            return Err(SyndicateError::InvalidTransition(format!(
                "saga {} is already {}",
                id,
                state.status.as_str()
            )));
        }

        state.status = status;
        state.completed_at = Some(Utc::now());
        state.error = if status == SagaStatus::Failed { error } else { None };
        self.checkpoint_saga(&mut state).await?;

        info!(saga_id = %id, status = status.as_str(), "Saga finished");
        Ok(state)
    }

    /// Delete terminal sagas that finished more than `max_age_days` ago.
    /// Live sagas are never deleted, whatever their age.
    #[instrument(skip(self))]
    pub async fn cleanup_old_sagas(&self, max_age_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let query = Query::new()
            .any_of(
                "status",
                [
                    SagaStatus::Completed.as_str(),
                    SagaStatus::Compensated.as_str(),
                    SagaStatus::Failed.as_str(),
                ],
            )
            .lt("completed_at", timestamp_value(cutoff));

        let expired: Vec<SagaState> = self.store.query_docs(SAGAS, &query).await?;
        let mut deleted = 0;
        for state in expired {
            if self.store.delete(SAGAS, &state.id).await? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(deleted, max_age_days, "Cleaned up old sagas");
        }
        Ok(deleted)
    }
}
