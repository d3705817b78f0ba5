use std::collections::BTreeMap;

use async_trait::async_trait;
use dgsync_types::{
    ChangeOp,
    ChunkFrame,
    CommitSeq,
    RowId,
    ScopeMap,
    ScopeVerdict,
    SubscriptionId,
    TableName,
};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use super::{
    LocalStore,
    NewOutboxEntry,
    OutboxEntry,
    OutboxStatus,
    SubscriptionState,
};
use crate::conflict::ConflictRecord;

#[derive(Default)]
struct Inner {
    next_local_seq: u64,
    outbox: BTreeMap<u64, OutboxEntry>,
    subscriptions: BTreeMap<(String, SubscriptionId), SubscriptionState>,
    rows: BTreeMap<(TableName, RowId), (JsonValue, CommitSeq)>,
    conflicts: Vec<ConflictRecord>,
}

/// An in-memory `LocalStore`, used by tests and the end-to-end scenario
/// suite. Counterpart of `dgsync_server::persistence::MemoryPersistence`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn enqueue_outbox(&self, entry: NewOutboxEntry) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let local_seq = inner.next_local_seq + 1;
        inner.next_local_seq = local_seq;
        inner.outbox.insert(
            local_seq,
            OutboxEntry {
                local_seq,
                client_commit_id: entry.client_commit_id,
                schema_version: entry.schema_version,
                operations: entry.operations,
                status: OutboxStatus::Pending,
                created_at_millis: entry.created_at_millis,
            },
        );
        Ok(local_seq)
    }

    async fn next_pending_outbox(&self) -> anyhow::Result<Option<OutboxEntry>> {
        let inner = self.inner.lock();
        Ok(inner
            .outbox
            .values()
            .find(|e| matches!(e.status, OutboxStatus::Pending | OutboxStatus::Sending))
            .cloned())
    }

    async fn mark_outbox_sending(&self, local_seq: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.outbox.get_mut(&local_seq) {
            entry.status = OutboxStatus::Sending;
        }
        Ok(())
    }

    async fn mark_outbox_applied(&self, local_seq: u64, commit_seq: CommitSeq) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.outbox.get_mut(&local_seq) {
            entry.status = OutboxStatus::Applied { commit_seq };
        }
        Ok(())
    }

    async fn mark_outbox_failed(&self, local_seq: u64, code: String, message: String) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.outbox.get_mut(&local_seq) {
            entry.status = OutboxStatus::Failed { code, message };
        }
        Ok(())
    }

    async fn get_subscription(
        &self,
        state_id: &str,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<Option<SubscriptionState>> {
        Ok(self
            .inner
            .lock()
            .subscriptions
            .get(&(state_id.to_string(), subscription_id.clone()))
            .cloned())
    }

    async fn list_subscriptions(&self, state_id: &str) -> anyhow::Result<Vec<SubscriptionState>> {
        Ok(self
            .inner
            .lock()
            .subscriptions
            .iter()
            .filter(|((sid, _), _)| sid == state_id)
            .map(|(_, state)| state.clone())
            .collect())
    }

    async fn upsert_subscription(&self, state: SubscriptionState) -> anyhow::Result<()> {
        let key = (state.state_id.clone(), state.subscription_id.clone());
        self.inner.lock().subscriptions.insert(key, state);
        Ok(())
    }

    async fn delete_subscription(&self, state_id: &str, subscription_id: &SubscriptionId) -> anyhow::Result<()> {
        self.inner
            .lock()
            .subscriptions
            .remove(&(state_id.to_string(), subscription_id.clone()));
        Ok(())
    }

    async fn current_row(&self, table: &TableName, row_id: &RowId) -> anyhow::Result<Option<(JsonValue, CommitSeq)>> {
        Ok(self.inner.lock().rows.get(&(table.clone(), row_id.clone())).cloned())
    }

    async fn apply_commit(
        &self,
        subscription_id: &SubscriptionId,
        table: &TableName,
        changes: Vec<dgsync_types::Change>,
        cursor: CommitSeq,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        for change in changes {
            let key = (change.table.clone(), change.row_id.clone());
            match change.op {
                ChangeOp::Upsert { row_json, server_version } => {
                    inner.rows.insert(key, (row_json, server_version));
                },
                ChangeOp::Delete => {
                    inner.rows.remove(&key);
                },
            }
        }
        for state in inner.subscriptions.values_mut() {
            if &state.subscription_id == subscription_id && &state.table == table {
                state.cursor = cursor;
            }
        }
        Ok(())
    }

    async fn advance_cursor(&self, subscription_id: &SubscriptionId, cursor: CommitSeq) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        for state in inner.subscriptions.values_mut() {
            if &state.subscription_id == subscription_id {
                state.cursor = cursor;
            }
        }
        Ok(())
    }

    async fn apply_bootstrap_frames(&self, table: &TableName, frames: Vec<ChunkFrame>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        for frame in frames {
            inner
                .rows
                .insert((table.clone(), frame.row_id), (frame.row_json, frame.server_version));
        }
        Ok(())
    }

    async fn delete_rows_matching_scope(&self, table: &TableName, scope: &ScopeMap) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let verdict = ScopeVerdict::Active {
            effective: scope.clone(),
        };
        let to_remove: Vec<_> = inner
            .rows
            .iter()
            .filter(|((t, _), (row_json, _))| t == table && verdict.matches_json(row_json))
            .map(|(key, _)| key.clone())
            .collect();
        let count = to_remove.len() as u64;
        for key in to_remove {
            inner.rows.remove(&key);
        }
        Ok(count)
    }

    async fn delete_rows_outside_narrowed_scope(
        &self,
        table: &TableName,
        old_scope: &ScopeMap,
        new_scope: &ScopeMap,
    ) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let old_verdict = ScopeVerdict::Active {
            effective: old_scope.clone(),
        };
        let new_verdict = ScopeVerdict::Active {
            effective: new_scope.clone(),
        };
        let to_remove: Vec<_> = inner
            .rows
            .iter()
            .filter(|((t, _), (row_json, _))| {
                t == table && old_verdict.matches_json(row_json) && !new_verdict.matches_json(row_json)
            })
            .map(|(key, _)| key.clone())
            .collect();
        let count = to_remove.len() as u64;
        for key in to_remove {
            inner.rows.remove(&key);
        }
        Ok(count)
    }

    async fn delete_rows_not_covered_by_other_scopes(
        &self,
        table: &TableName,
        scope: &ScopeMap,
        keep_scopes: &[ScopeMap],
    ) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let verdict = ScopeVerdict::Active {
            effective: scope.clone(),
        };
        let keep_verdicts: Vec<ScopeVerdict> = keep_scopes
            .iter()
            .map(|s| ScopeVerdict::Active { effective: s.clone() })
            .collect();
        let to_remove: Vec<_> = inner
            .rows
            .iter()
            .filter(|((t, _), (row_json, _))| {
                t == table
                    && verdict.matches_json(row_json)
                    && !keep_verdicts.iter().any(|kv| kv.matches_json(row_json))
            })
            .map(|(key, _)| key.clone())
            .collect();
        let count = to_remove.len() as u64;
        for key in to_remove {
            inner.rows.remove(&key);
        }
        Ok(count)
    }

    async fn insert_conflict(&self, record: ConflictRecord) -> anyhow::Result<()> {
        self.inner.lock().conflicts.push(record);
        Ok(())
    }

    async fn list_conflicts(&self, state_id: &str) -> anyhow::Result<Vec<ConflictRecord>> {
        Ok(self
            .inner
            .lock()
            .conflicts
            .iter()
            .filter(|c| c.state_id == state_id)
            .cloned()
            .collect())
    }

    async fn all_rows(&self, table: &TableName) -> anyhow::Result<Vec<(RowId, JsonValue, CommitSeq)>> {
        Ok(self
            .inner
            .lock()
            .rows
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|((_, row_id), (row_json, version))| (row_id.clone(), row_json.clone(), *version))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::NewOutboxEntry;

    #[tokio::test]
    async fn enqueue_then_mark_applied_round_trips() {
        let store = MemoryStore::new();
        let local_seq = store
            .enqueue_outbox(NewOutboxEntry {
                client_commit_id: "cc1".into(),
                schema_version: 1,
                operations: vec![],
                created_at_millis: 0,
            })
            .await
            .unwrap();
        let pending = store.next_pending_outbox().await.unwrap().unwrap();
        assert_eq!(pending.local_seq, local_seq);
        store.mark_outbox_applied(local_seq, 7).await.unwrap();
        assert!(store.next_pending_outbox().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_rows_matching_scope_only_removes_matches() {
        let store = MemoryStore::new();
        store
            .apply_bootstrap_frames(
                &"tasks".to_string(),
                vec![
                    ChunkFrame {
                        row_id: "t1".into(),
                        row_json: json!({"user_id": "u1"}),
                        server_version: 1,
                    },
                    ChunkFrame {
                        row_id: "t2".into(),
                        row_json: json!({"user_id": "u2"}),
                        server_version: 1,
                    },
                ],
            )
            .await
            .unwrap();
        let scope: ScopeMap = [("user_id".to_string(), json!("u1"))].into_iter().collect();
        let removed = store.delete_rows_matching_scope(&"tasks".to_string(), &scope).await.unwrap();
        assert_eq!(removed, 1);
        let remaining = store.all_rows(&"tasks".to_string()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, "t2");
    }
}
