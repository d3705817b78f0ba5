//! Single-threaded cooperative sync loop, generalizing the teacher's
//! `SyncState` (`crates/sync/src/state.rs`): exactly one push cycle and one
//! pull cycle in flight per `state_id` at a time (§5), with exponential
//! backoff on transport failure.

use std::{
    sync::Arc,
    time::Duration,
};

use dgsync_errors::ErrorMetadata;
use dgsync_types::{
    ActorId,
    PullOutcome,
    PullRequest,
    PushResponse,
    SubscriptionRequest,
};
use parking_lot::Mutex as SyncMutex;
use rand::thread_rng;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::{
    applicator::PullApplicator,
    backoff::Backoff,
    bootstrap_client::BootstrapClient,
    conflict::ConflictRecord,
    outbox::Outbox,
    plugin::PluginPipeline,
    store::LocalStore,
    subscription::SubscriptionStateMachine,
    transport::Transport,
};

#[derive(Debug, Clone, Copy)]
pub struct SyncLoopConfig {
    pub poll_interval: Duration,
    pub push_retry_initial_backoff: Duration,
    pub push_retry_max_backoff: Duration,
}

impl Default for SyncLoopConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            push_retry_initial_backoff: Duration::from_millis(200),
            push_retry_max_backoff: Duration::from_secs(30),
        }
    }
}

/// One `state_id`'s worth of outbox draining, pull polling and bootstrap
/// continuation. Two in-process mutexes enforce §5's "exactly one push cycle
/// and one pull cycle in flight" rule; a shared `Backoff` tracks consecutive
/// transport failures across both cycles.
pub struct SyncLoop<S, T> {
    state_id: String,
    actor_id: ActorId,
    store: Arc<S>,
    transport: Arc<T>,
    outbox: Outbox<S>,
    subscriptions: SubscriptionStateMachine<S>,
    applicator: PullApplicator<S>,
    bootstrap: BootstrapClient<S, T>,
    push_lock: AsyncMutex<()>,
    pull_lock: AsyncMutex<()>,
    backoff: SyncMutex<Backoff>,
}

impl<S, T> SyncLoop<S, T>
where
    S: LocalStore,
    T: Transport,
{
    pub fn new(
        state_id: impl Into<String>,
        actor_id: ActorId,
        store: Arc<S>,
        transport: Arc<T>,
        plugins: PluginPipeline,
        config: SyncLoopConfig,
    ) -> Self {
        Self {
            state_id: state_id.into(),
            actor_id,
            outbox: Outbox::new(store.clone()),
            subscriptions: SubscriptionStateMachine::new(store.clone()),
            applicator: PullApplicator::new(store.clone(), plugins),
            bootstrap: BootstrapClient::new(store.clone(), transport.clone()),
            store,
            transport,
            push_lock: AsyncMutex::new(()),
            pull_lock: AsyncMutex::new(()),
            backoff: SyncMutex::new(Backoff::new(
                config.push_retry_initial_backoff,
                config.push_retry_max_backoff,
            )),
        }
    }

    /// Drain every pending outbox entry, pushing each until the outbox is
    /// empty or a transport failure leaves an entry `sending` for the next
    /// drain. Returns early (without erroring) if another drain is already
    /// running for this `state_id`.
    #[instrument(skip(self))]
    pub async fn drain_outbox(&self) -> anyhow::Result<()> {
        let Ok(_guard) = self.push_lock.try_lock() else {
            return Ok(());
        };
        loop {
            let Some(entry) = self.outbox.next_pending().await? else {
                break;
            };
            self.outbox.mark_sending(&entry).await?;

            let request = dgsync_types::PushRequest {
                client_commit_id: entry.client_commit_id.clone(),
                schema_version: entry.schema_version,
                operations: entry.operations.clone(),
            };
            let response = match self.transport.push(request).await {
                Ok(r) => r,
                Err(e) => {
                    // Left `sending`: the next drain resends with the same
                    // client_commit_id, so this is safe to retry.
                    let delay = self.backoff.lock().fail(&mut thread_rng());
                    tracing::debug!(?delay, "push transport failure, backing off");
                    tokio::time::sleep(delay).await;
                    return Err(e.context(ErrorMetadata::transport_failure("push transport failure")));
                },
            };
            self.backoff.lock().reset();

            match response {
                PushResponse::Applied { commit_seq } | PushResponse::Cached { commit_seq } => {
                    self.outbox.mark_applied(&entry, commit_seq).await?;
                },
                PushResponse::Rejected { rejections } => {
                    for rejection in &rejections {
                        let result_status = if rejection.code == "RowMissing" {
                            "reset_required"
                        } else {
                            "conflict"
                        };
                        let table = entry
                            .operations
                            .iter()
                            .find(|op| op.row_id() == &rejection.row_id)
                            .map(|op| op.table().clone())
                            .unwrap_or_else(|| "unknown".to_string());
                        self.store
                            .insert_conflict(ConflictRecord {
                                state_id: self.state_id.clone(),
                                table,
                                row_id: rejection.row_id.clone(),
                                client_commit_id: entry.client_commit_id.clone(),
                                code: rejection.code.clone(),
                                message: rejection.message.clone(),
                                server_version: rejection.server_version,
                                server_row: rejection.server_row.clone(),
                                result_status: result_status.to_string(),
                                created_at_millis: crate::clock::now_millis(),
                            })
                            .await?;
                    }
                    let meta = ErrorMetadata::row_conflict(format!(
                        "push {} rejected: {} row(s)",
                        entry.client_commit_id,
                        rejections.len()
                    ));
                    self.outbox.mark_failed(&entry, &meta).await?;
                },
            }
        }
        Ok(())
    }

    /// Run one pull cycle for every subscription registered under this
    /// `state_id`, applying active outcomes, revoking/clearing as directed,
    /// and continuing any in-progress bootstrap.
    #[instrument(skip(self))]
    pub async fn pull_once(&self) -> anyhow::Result<()> {
        let Ok(_guard) = self.pull_lock.try_lock() else {
            return Ok(());
        };
        let states = self.subscriptions.list(&self.state_id).await?;
        if states.is_empty() {
            return Ok(());
        }

        let requests: Vec<SubscriptionRequest> = states
            .iter()
            .map(|s| SubscriptionRequest {
                id: s.subscription_id.clone(),
                table: s.table.clone(),
                scopes: s.scopes.clone(),
                params: s.params.clone(),
                cursor: s.cursor,
            })
            .collect();
        let response = match self
            .transport
            .pull(PullRequest {
                subscriptions: requests,
                limit_commits: 500,
                limit_snapshot_rows: None,
                max_snapshot_pages: None,
                dedupe_rows: true,
            })
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let delay = self.backoff.lock().fail(&mut thread_rng());
                tracing::debug!(?delay, "pull transport failure, backing off");
                tokio::time::sleep(delay).await;
                return Err(e.context(ErrorMetadata::transport_failure("pull transport failure")));
            },
        };
        self.backoff.lock().reset();

        for result in response.subscriptions {
            let Some(current) = states.iter().find(|s| s.subscription_id == result.id) else {
                continue;
            };
            match &result.outcome {
                PullOutcome::Active { commits, next_cursor } => {
                    self.applicator
                        .apply_active(&current.subscription_id, &current.table, commits.clone(), *next_cursor)
                        .await?;
                    self.subscriptions.handle_outcome(current, &result.outcome).await?;
                },
                PullOutcome::Revoked => {
                    self.subscriptions.handle_outcome(current, &result.outcome).await?;
                },
                PullOutcome::ForcedBootstrap { bootstrap } => {
                    let updated = self.subscriptions.handle_outcome(current, &result.outcome).await?;
                    self.bootstrap.consume_page(&updated, bootstrap).await?;
                },
            }
        }
        Ok(())
    }

    pub async fn enqueue(&self, schema_version: dgsync_types::SchemaVersion, operations: Vec<dgsync_types::Operation>) -> anyhow::Result<u64> {
        self.outbox.enqueue(schema_version, operations).await
    }

    pub async fn subscribe(&self, request: &SubscriptionRequest) -> anyhow::Result<()> {
        self.subscriptions.register(&self.state_id, request).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, subscription_id: &dgsync_types::SubscriptionId) -> anyhow::Result<()> {
        self.subscriptions.remove(&self.state_id, subscription_id).await
    }

    pub async fn conflicts(&self) -> anyhow::Result<Vec<ConflictRecord>> {
        self.store.list_conflicts(&self.state_id).await
    }

    /// Fetches and applies the next bootstrap page for a subscription still
    /// `Bootstrapping`, used when a pull response hasn't arrived yet but the
    /// caller wants to drive bootstrap progress directly (e.g. initial load).
    pub async fn continue_bootstrap(&self, subscription_id: &dgsync_types::SubscriptionId) -> anyhow::Result<()> {
        let Some(current) = self.subscriptions.get(&self.state_id, subscription_id).await? else {
            return Ok(());
        };
        if current.status != crate::store::SubscriptionStatus::Bootstrapping {
            return Ok(());
        }
        let response = self
            .transport
            .pull(PullRequest {
                subscriptions: vec![SubscriptionRequest {
                    id: current.subscription_id.clone(),
                    table: current.table.clone(),
                    scopes: current.scopes.clone(),
                    params: current.params.clone(),
                    cursor: current.cursor,
                }],
                limit_commits: 0,
                limit_snapshot_rows: None,
                max_snapshot_pages: None,
                dedupe_rows: true,
            })
            .await?;
        let Some(result) = response.subscriptions.into_iter().next() else {
            return Ok(());
        };
        if let PullOutcome::ForcedBootstrap { bootstrap } = result.outcome {
            self.bootstrap.consume_page(&current, &bootstrap).await?;
        }
        Ok(())
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use dgsync_server::{
        BootstrapEngine,
        MemoryPersistence,
        OwnerScopedResolver,
        PullEngine,
        PushHandler,
    };
    use dgsync_types::{
        Operation,
        PullRequest,
        PullResponse,
        PushRequest,
        PushResponse,
    };
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    /// Bridges the client `Transport` directly to an in-process server core,
    /// for exercising the full push/pull/bootstrap path without a real
    /// network hop.
    struct InProcessTransport {
        actor_id: ActorId,
        client_id: String,
        push: PushHandler<MemoryPersistence, OwnerScopedResolver>,
        pull: PullEngine<MemoryPersistence, OwnerScopedResolver>,
        bootstrap: Arc<BootstrapEngine<MemoryPersistence>>,
    }

    #[async_trait]
    impl Transport for InProcessTransport {
        async fn push(&self, request: PushRequest) -> anyhow::Result<PushResponse> {
            self.push.push(&self.actor_id, &self.client_id, &"p1".to_string(), request).await
        }

        async fn pull(&self, request: PullRequest) -> anyhow::Result<PullResponse> {
            self.pull.pull(&self.actor_id, request).await
        }

        async fn fetch_chunk(&self, chunk_id: &str) -> anyhow::Result<Vec<u8>> {
            self.bootstrap
                .fetch_chunk(chunk_id)
                .ok_or_else(|| anyhow::anyhow!("unknown chunk {chunk_id}"))
        }
    }

    #[tokio::test]
    async fn end_to_end_push_then_bootstrap() {
        let persistence = Arc::new(MemoryPersistence::new());
        let resolver = Arc::new(OwnerScopedResolver::new("user_id"));
        let push = PushHandler::new(persistence.clone(), resolver.clone(), vec!["user_id".to_string()]);
        let bootstrap = Arc::new(BootstrapEngine::new(persistence.clone()));
        let pull = PullEngine::new(persistence, resolver, bootstrap.clone());

        let transport = Arc::new(InProcessTransport {
            actor_id: "u1".to_string(),
            client_id: "writer".to_string(),
            push,
            pull,
            bootstrap,
        });

        // Client A pushes a row.
        let store_a = Arc::new(MemoryStore::new());
        let loop_a = SyncLoop::new(
            "state_a",
            "u1".to_string(),
            store_a,
            transport.clone(),
            PluginPipeline::default(),
            SyncLoopConfig::default(),
        );
        loop_a
            .enqueue(
                1,
                vec![Operation::Upsert {
                    table: "tasks".into(),
                    row_id: "t1".into(),
                    payload: json!({"title": "Hello", "user_id": "u1"}),
                    base_version: None,
                }],
            )
            .await
            .unwrap();
        loop_a.drain_outbox().await.unwrap();

        // Client B bootstraps and should see the pushed row.
        let store_b = Arc::new(MemoryStore::new());
        let loop_b = SyncLoop::new(
            "state_b",
            "u1".to_string(),
            store_b.clone(),
            transport,
            PluginPipeline::default(),
            SyncLoopConfig::default(),
        );
        loop_b
            .subscribe(&SubscriptionRequest {
                id: "sub1".into(),
                table: "tasks".into(),
                scopes: [("user_id".to_string(), json!("u1"))].into_iter().collect(),
                params: None,
                cursor: 0,
            })
            .await
            .unwrap();
        loop_b.pull_once().await.unwrap();

        let rows = store_b.all_rows(&"tasks".to_string()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "t1");
        assert_eq!(rows[0].1["title"], "Hello");
    }
}
