//! Outbox (C7): durable local queue of not-yet-confirmed pushes.

use std::sync::Arc;

use dgsync_errors::ErrorMetadata;
use dgsync_types::{
    CommitSeq,
    Operation,
    SchemaVersion,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    clock::now_millis,
    store::{
        LocalStore,
        NewOutboxEntry,
        OutboxEntry,
    },
};

pub struct Outbox<S> {
    store: Arc<S>,
}

impl<S> Outbox<S>
where
    S: LocalStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Persists the entry before returning, per §4.7's durability contract.
    /// `client_commit_id` is generated here and stays stable across every
    /// retry of this entry, giving exactly-once semantics end to end.
    #[instrument(skip(self, operations))]
    pub async fn enqueue(&self, schema_version: SchemaVersion, operations: Vec<Operation>) -> anyhow::Result<u64> {
        let client_commit_id = Uuid::new_v4().to_string();
        self.store
            .enqueue_outbox(NewOutboxEntry {
                client_commit_id,
                schema_version,
                operations,
                created_at_millis: now_millis(),
            })
            .await
    }

    /// The next entry to drain: `pending`, or `sending` left over from a
    /// crash (retried with the same `client_commit_id`).
    pub async fn next_pending(&self) -> anyhow::Result<Option<OutboxEntry>> {
        self.store.next_pending_outbox().await
    }

    pub async fn mark_sending(&self, entry: &OutboxEntry) -> anyhow::Result<()> {
        self.store.mark_outbox_sending(entry.local_seq).await
    }

    pub async fn mark_applied(&self, entry: &OutboxEntry, commit_seq: CommitSeq) -> anyhow::Result<()> {
        self.store.mark_outbox_applied(entry.local_seq, commit_seq).await
    }

    pub async fn mark_failed(&self, entry: &OutboxEntry, meta: &ErrorMetadata) -> anyhow::Result<()> {
        self.store
            .mark_outbox_failed(entry.local_seq, meta.short_msg.to_string(), meta.msg.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use dgsync_types::Operation;
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn enqueue_assigns_a_stable_client_commit_id() {
        let outbox = Outbox::new(Arc::new(MemoryStore::new()));
        let local_seq = outbox
            .enqueue(
                1,
                vec![Operation::Upsert {
                    table: "tasks".into(),
                    row_id: "t1".into(),
                    payload: json!({"title": "hi"}),
                    base_version: None,
                }],
            )
            .await
            .unwrap();
        let entry = outbox.next_pending().await.unwrap().unwrap();
        assert_eq!(entry.local_seq, local_seq);
        assert!(!entry.client_commit_id.is_empty());

        outbox.mark_sending(&entry).await.unwrap();
        // A crash recovery read after mark_sending must still surface the
        // same entry with the same client_commit_id for a safe retry.
        let resent = outbox.next_pending().await.unwrap().unwrap();
        assert_eq!(resent.client_commit_id, entry.client_commit_id);
    }
}
