//! Compaction & prune coordinator (C6). At-most-one instance per partition,
//! debounced, with a single in-flight run de-duplicating concurrent
//! triggers — the maintenance-loop counterpart of the teacher's
//! `retriable_worker`/index-flusher coordinators in `crates/database`.

use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::Mutex;
use tracing::instrument;

use crate::{
    clock::now_millis,
    persistence::Persistence,
};

#[derive(Debug, Clone, Copy)]
pub struct CompactionConfig {
    /// Commits older than this are eligible to have their per-row history
    /// collapsed to just the latest change.
    pub full_history_window: Duration,
    /// A client whose cursor hasn't moved within this window no longer
    /// holds retention back.
    pub active_window: Duration,
    /// Hard retention cap regardless of how far behind an active client is.
    pub fallback_max_age: Duration,
    /// Soft floor: never prune the newest `keep_newest` commits.
    pub keep_newest: u32,
    /// Minimum time between maintenance runs.
    pub min_interval: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            full_history_window: Duration::from_secs(14 * 24 * 3600),
            active_window: Duration::from_secs(14 * 24 * 3600),
            fallback_max_age: Duration::from_secs(30 * 24 * 3600),
            keep_newest: 1_000,
            min_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub changes_compacted: u64,
    pub commits_pruned: u64,
    pub watermark: u64,
}

pub struct MaintenanceCoordinator<P> {
    persistence: Arc<P>,
    config: CompactionConfig,
    last_run: Mutex<Option<Instant>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl<P> MaintenanceCoordinator<P>
where
    P: Persistence,
{
    pub fn new(persistence: Arc<P>, config: CompactionConfig) -> Self {
        Self {
            persistence,
            config,
            last_run: Mutex::new(None),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Run compaction and prune if the debounce interval has elapsed and no
    /// other run is in flight. Returns `None` when the call was a no-op
    /// (debounced or already running) rather than erroring, since "someone
    /// else is already doing this" isn't a failure.
    #[instrument(skip(self))]
    pub async fn run_if_due(&self) -> anyhow::Result<Option<MaintenanceReport>> {
        {
            let last = self.last_run.lock();
            if let Some(prev) = *last {
                if prev.elapsed() < self.config.min_interval {
                    return Ok(None);
                }
            }
        }
        let Ok(_guard) = self.in_flight.try_lock() else {
            return Ok(None);
        };
        *self.last_run.lock() = Some(Instant::now());

        let changes_compacted = self.compact().await?;
        let (commits_pruned, watermark) = self.prune().await?;
        Ok(Some(MaintenanceReport {
            changes_compacted,
            commits_pruned,
            watermark,
        }))
    }

    async fn compact(&self) -> anyhow::Result<u64> {
        let cutoff_millis = now_millis() - self.config.full_history_window.as_millis() as i64;
        self.persistence.compact_before(cutoff_millis).await
    }

    async fn prune(&self) -> anyhow::Result<(u64, u64)> {
        let active_since_millis = now_millis() - self.config.active_window.as_millis() as i64;
        let active = self.persistence.active_client_cursors(active_since_millis).await?;
        // No active clients holding retention back: the client-floor term
        // contributes nothing, so it must not artificially inflate the
        // watermark past what age alone would justify.
        let min_active_cursor = active.iter().map(|c| c.cursor).min().unwrap_or(0);

        let age_cutoff_millis = now_millis() - self.config.fallback_max_age.as_millis() as i64;
        let age_based_cutoff = self.persistence.commit_seq_before(age_cutoff_millis).await?;

        let watermark = min_active_cursor.max(age_based_cutoff);
        let pruned = self
            .persistence
            .prune_up_to(watermark, self.config.keep_newest)
            .await?;
        Ok((pruned, watermark))
    }
}

#[cfg(test)]
mod tests {
    use dgsync_types::{
        Operation,
        PushRequest,
    };
    use serde_json::json;

    use super::*;
    use crate::{
        persistence::{
            ClientCursorRecord,
            MemoryPersistence,
        },
        push::PushHandler,
        scope_resolver::OwnerScopedResolver,
    };

    async fn seed_commits(persistence: &Arc<MemoryPersistence>, n: u32) {
        let push = PushHandler::new(
            persistence.clone(),
            Arc::new(OwnerScopedResolver::new("user_id")),
            vec!["user_id".to_string()],
        );
        for i in 0..n {
            push.push(
                &"u1".to_string(),
                &"c1".to_string(),
                &"p1".to_string(),
                PushRequest {
                    client_commit_id: format!("cc{i}"),
                    schema_version: 1,
                    operations: vec![Operation::Upsert {
                        table: "tasks".into(),
                        row_id: format!("t{i}"),
                        payload: json!({"title": i, "user_id": "u1"}),
                        base_version: None,
                    }],
                },
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn debounce_skips_a_second_call_within_min_interval() {
        let persistence = Arc::new(MemoryPersistence::new());
        seed_commits(&persistence, 1).await;
        let coordinator = MaintenanceCoordinator::new(
            persistence,
            CompactionConfig {
                min_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        let first = coordinator.run_if_due().await.unwrap();
        let second = coordinator.run_if_due().await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn prune_respects_keep_newest_floor() {
        let persistence = Arc::new(MemoryPersistence::new());
        seed_commits(&persistence, 10).await;
        persistence
            .upsert_client_cursor(ClientCursorRecord {
                client_id: "c1".into(),
                actor_id: "u1".into(),
                cursor: 10,
                updated_at_millis: now_millis(),
            })
            .await
            .unwrap();
        let coordinator = MaintenanceCoordinator::new(
            persistence.clone(),
            CompactionConfig {
                keep_newest: 5,
                min_interval: Duration::from_secs(0),
                ..Default::default()
            },
        );
        coordinator.run_if_due().await.unwrap();
        assert_eq!(persistence.min_retained_commit_seq().await.unwrap(), 5);
        let remaining = persistence.commits_after(0, 100).await.unwrap();
        assert_eq!(remaining.len(), 5);
    }
}
