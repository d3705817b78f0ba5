//! Subscription state machine (C8): tracks each `(state_id, subscription_id)`
//! pair through bootstrapping/active/revoked, deleting local rows whenever a
//! transition narrows or removes what the subscription can see.

use std::sync::Arc;

use dgsync_types::{
    PullOutcome,
    ScopeMap,
    SubscriptionId,
    SubscriptionRequest,
};
use tracing::instrument;

use crate::store::{
    LocalStore,
    SubscriptionState,
    SubscriptionStatus,
};

pub struct SubscriptionStateMachine<S> {
    store: Arc<S>,
}

impl<S> SubscriptionStateMachine<S>
where
    S: LocalStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// `∅ -> bootstrapping` for a subscription the client hasn't seen
    /// before. Idempotent: an existing subscription with the same id is
    /// returned unchanged.
    #[instrument(skip(self, request))]
    pub async fn register(&self, state_id: &str, request: &SubscriptionRequest) -> anyhow::Result<SubscriptionState> {
        if let Some(existing) = self.store.get_subscription(state_id, &request.id).await? {
            return Ok(existing);
        }
        let state = SubscriptionState {
            state_id: state_id.to_string(),
            subscription_id: request.id.clone(),
            table: request.table.clone(),
            scopes: request.scopes.clone(),
            params: request.params.clone(),
            cursor: request.cursor,
            status: SubscriptionStatus::Bootstrapping,
            bootstrap_page_token: None,
        };
        self.store.upsert_subscription(state.clone()).await?;
        Ok(state)
    }

    /// Apply a pull outcome's subscription-level transition. Row application
    /// for the `Active` case is the pull applicator's (C9) job; this only
    /// handles status changes and the local-row cleanup a revoke requires.
    #[instrument(skip(self, current, outcome))]
    pub async fn handle_outcome(
        &self,
        current: &SubscriptionState,
        outcome: &PullOutcome,
    ) -> anyhow::Result<SubscriptionState> {
        let updated = match outcome {
            PullOutcome::Revoked => {
                let keep_scopes = self.sibling_scopes(current).await?;
                self.store
                    .delete_rows_not_covered_by_other_scopes(&current.table, &current.scopes, &keep_scopes)
                    .await?;
                SubscriptionState {
                    status: SubscriptionStatus::Revoked,
                    ..current.clone()
                }
            },
            PullOutcome::ForcedBootstrap { bootstrap } => SubscriptionState {
                status: SubscriptionStatus::Bootstrapping,
                bootstrap_page_token: bootstrap.page_token.clone(),
                ..current.clone()
            },
            PullOutcome::Active { next_cursor, .. } => SubscriptionState {
                status: SubscriptionStatus::Active,
                cursor: *next_cursor,
                bootstrap_page_token: None,
                ..current.clone()
            },
        };
        self.store.upsert_subscription(updated.clone()).await?;
        Ok(updated)
    }

    /// `bootstrapping -> active` once snapshot pages exhaust.
    pub async fn complete_bootstrap(
        &self,
        current: &SubscriptionState,
        snapshot_commit_seq: u64,
    ) -> anyhow::Result<SubscriptionState> {
        let updated = SubscriptionState {
            status: SubscriptionStatus::Active,
            cursor: snapshot_commit_seq,
            bootstrap_page_token: None,
            ..current.clone()
        };
        self.store.upsert_subscription(updated.clone()).await?;
        Ok(updated)
    }

    /// The subscription is being dropped from the requested set: delete any
    /// local row it alone was making visible.
    pub async fn remove(&self, state_id: &str, subscription_id: &SubscriptionId) -> anyhow::Result<()> {
        if let Some(current) = self.store.get_subscription(state_id, subscription_id).await? {
            let keep_scopes = self.sibling_scopes(&current).await?;
            self.store
                .delete_rows_not_covered_by_other_scopes(&current.table, &current.scopes, &keep_scopes)
                .await?;
        }
        self.store.delete_subscription(state_id, subscription_id).await
    }

    /// Scopes of every other still-visible subscription on `current`'s
    /// table, i.e. the scopes a row must keep matching at least one of to
    /// stay locally visible once `current` is gone (§4.8).
    async fn sibling_scopes(&self, current: &SubscriptionState) -> anyhow::Result<Vec<ScopeMap>> {
        let siblings = self.store.list_subscriptions(&current.state_id).await?;
        Ok(siblings
            .into_iter()
            .filter(|s| {
                s.subscription_id != current.subscription_id
                    && s.table == current.table
                    && s.status != SubscriptionStatus::Revoked
            })
            .map(|s| s.scopes)
            .collect())
    }

    /// The subscription's requested scope narrowed: rows no longer covered
    /// by the new scope are removed, and the state's recorded scope updates.
    pub async fn narrow(
        &self,
        current: &SubscriptionState,
        new_scopes: ScopeMap,
    ) -> anyhow::Result<SubscriptionState> {
        self.store
            .delete_rows_outside_narrowed_scope(&current.table, &current.scopes, &new_scopes)
            .await?;
        let updated = SubscriptionState {
            scopes: new_scopes,
            ..current.clone()
        };
        self.store.upsert_subscription(updated.clone()).await?;
        Ok(updated)
    }

    pub async fn get(&self, state_id: &str, subscription_id: &SubscriptionId) -> anyhow::Result<Option<SubscriptionState>> {
        self.store.get_subscription(state_id, subscription_id).await
    }

    pub async fn list(&self, state_id: &str) -> anyhow::Result<Vec<SubscriptionState>> {
        self.store.list_subscriptions(state_id).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    fn sub_request() -> SubscriptionRequest {
        SubscriptionRequest {
            id: "sub1".into(),
            table: "tasks".into(),
            scopes: [("user_id".to_string(), json!("u1"))].into_iter().collect(),
            params: None,
            cursor: 0,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let machine = SubscriptionStateMachine::new(Arc::new(MemoryStore::new()));
        let request = sub_request();
        let first = machine.register("s1", &request).await.unwrap();
        let second = machine.register("s1", &request).await.unwrap();
        assert_eq!(first.status, SubscriptionStatus::Bootstrapping);
        assert_eq!(second.cursor, first.cursor);
    }

    #[tokio::test]
    async fn revoke_deletes_rows_in_the_lost_scope() {
        let store = Arc::new(MemoryStore::new());
        let machine = SubscriptionStateMachine::new(store.clone());
        let request = sub_request();
        let current = machine.register("s1", &request).await.unwrap();
        store
            .apply_bootstrap_frames(
                &"tasks".to_string(),
                vec![dgsync_types::ChunkFrame {
                    row_id: "t1".into(),
                    row_json: json!({"user_id": "u1"}),
                    server_version: 1,
                }],
            )
            .await
            .unwrap();

        let updated = machine.handle_outcome(&current, &PullOutcome::Revoked).await.unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Revoked);
        let rows = store.all_rows(&"tasks".to_string()).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn revoke_keeps_rows_still_visible_through_a_sibling_subscription() {
        let store = Arc::new(MemoryStore::new());
        let machine = SubscriptionStateMachine::new(store.clone());
        let sub_a = machine.register("s1", &sub_request()).await.unwrap();
        machine
            .register(
                "s1",
                &SubscriptionRequest {
                    id: "sub2".into(),
                    table: "tasks".into(),
                    scopes: [("project_id".to_string(), json!("p1"))].into_iter().collect(),
                    params: None,
                    cursor: 0,
                },
            )
            .await
            .unwrap();
        store
            .apply_bootstrap_frames(
                &"tasks".to_string(),
                vec![dgsync_types::ChunkFrame {
                    row_id: "t1".into(),
                    row_json: json!({"user_id": "u1", "project_id": "p1"}),
                    server_version: 1,
                }],
            )
            .await
            .unwrap();

        machine.handle_outcome(&sub_a, &PullOutcome::Revoked).await.unwrap();
        let rows = store.all_rows(&"tasks".to_string()).await.unwrap();
        assert_eq!(rows.len(), 1, "sub2's scope still covers t1, so revoking sub1 must not delete it");

        machine.remove("s1", &"sub2".to_string()).await.unwrap();
        let rows = store.all_rows(&"tasks".to_string()).await.unwrap();
        assert!(rows.is_empty(), "no remaining subscription covers t1 once sub2 is also gone");
    }
}
