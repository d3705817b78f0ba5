//! The client's local storage seam. Mirrors `dgsync_server::persistence`'s
//! shape: one narrow trait, an in-memory backend for tests, a rusqlite
//! backend for a real client deployment.

mod memory;
mod sqlite;

use async_trait::async_trait;
use dgsync_types::{
    ChunkFrame,
    ClientCommitId,
    Commit,
    CommitSeq,
    Operation,
    RowId,
    ScopeMap,
    SchemaVersion,
    SubscriptionId,
    TableName,
};
pub use memory::MemoryStore;
use serde_json::Value as JsonValue;
pub use sqlite::SqliteStore;

use crate::conflict::ConflictRecord;

#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub client_commit_id: ClientCommitId,
    pub schema_version: SchemaVersion,
    pub operations: Vec<Operation>,
    pub created_at_millis: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboxStatus {
    Pending,
    Sending,
    Applied { commit_seq: CommitSeq },
    Failed { code: String, message: String },
}

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub local_seq: u64,
    pub client_commit_id: ClientCommitId,
    pub schema_version: SchemaVersion,
    pub operations: Vec<Operation>,
    pub status: OutboxStatus,
    pub created_at_millis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Bootstrapping,
    Active,
    Revoked,
}

#[derive(Debug, Clone)]
pub struct SubscriptionState {
    pub state_id: String,
    pub subscription_id: SubscriptionId,
    pub table: TableName,
    pub scopes: ScopeMap,
    pub params: Option<JsonValue>,
    pub cursor: CommitSeq,
    pub status: SubscriptionStatus,
    /// Opaque resume token for an in-progress bootstrap; `None` once active.
    pub bootstrap_page_token: Option<String>,
}

/// The client-owned counterpart of `dgsync_server::Persistence`: outbox,
/// subscription state, conflicts and application row storage, all
/// transactional per the guarantees in spec §4.7-§4.9 and §5.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Durably persisted before `enqueue` returns (§4.7).
    async fn enqueue_outbox(&self, entry: NewOutboxEntry) -> anyhow::Result<u64>;

    /// The oldest entry still `pending`, or `sending` from a prior run that
    /// never received a response (crash recovery treats `sending` as
    /// "retry on next drain").
    async fn next_pending_outbox(&self) -> anyhow::Result<Option<OutboxEntry>>;

    async fn mark_outbox_sending(&self, local_seq: u64) -> anyhow::Result<()>;
    async fn mark_outbox_applied(&self, local_seq: u64, commit_seq: CommitSeq) -> anyhow::Result<()>;
    async fn mark_outbox_failed(&self, local_seq: u64, code: String, message: String) -> anyhow::Result<()>;

    async fn get_subscription(
        &self,
        state_id: &str,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<Option<SubscriptionState>>;
    async fn list_subscriptions(&self, state_id: &str) -> anyhow::Result<Vec<SubscriptionState>>;
    async fn upsert_subscription(&self, state: SubscriptionState) -> anyhow::Result<()>;
    async fn delete_subscription(&self, state_id: &str, subscription_id: &SubscriptionId) -> anyhow::Result<()>;

    async fn current_row(&self, table: &TableName, row_id: &RowId) -> anyhow::Result<Option<(JsonValue, CommitSeq)>>;

    /// Apply one commit's worth of already-plugin-transformed changes and
    /// advance `subscription_id`'s cursor to `cursor`, atomically (§4.9
    /// step 1-2). Called once per commit so a mid-stream failure leaves
    /// earlier commits durably applied and the cursor at the last success.
    async fn apply_commit(
        &self,
        subscription_id: &SubscriptionId,
        table: &TableName,
        changes: Vec<dgsync_types::Change>,
        cursor: CommitSeq,
    ) -> anyhow::Result<()>;

    /// Advance a subscription's cursor without touching rows, used when a
    /// pull outcome carries a `next_cursor` past the last change-bearing
    /// commit (commits emptied by compaction, §4.4 step 4 / §4.6).
    async fn advance_cursor(&self, subscription_id: &SubscriptionId, cursor: CommitSeq) -> anyhow::Result<()>;

    /// Apply one bootstrap chunk's rows as upserts, without touching the
    /// subscription's cursor (set separately once the snapshot completes).
    async fn apply_bootstrap_frames(&self, table: &TableName, frames: Vec<ChunkFrame>) -> anyhow::Result<()>;

    /// Delete every row in `table` matching `scope`, used on full
    /// revocation (§4.8 `active -> revoked`).
    async fn delete_rows_matching_scope(&self, table: &TableName, scope: &ScopeMap) -> anyhow::Result<u64>;

    /// Delete rows in `table` matching `old_scope` but not `new_scope`,
    /// used when a subscription narrows (§4.8).
    async fn delete_rows_outside_narrowed_scope(
        &self,
        table: &TableName,
        old_scope: &ScopeMap,
        new_scope: &ScopeMap,
    ) -> anyhow::Result<u64>;

    /// Delete rows in `table` matching `scope` that aren't also covered by
    /// any scope in `keep_scopes`, used when a subscription is revoked or
    /// removed so a row another still-active subscription on the same
    /// table can see is never deleted out from under it (§4.8).
    async fn delete_rows_not_covered_by_other_scopes(
        &self,
        table: &TableName,
        scope: &ScopeMap,
        keep_scopes: &[ScopeMap],
    ) -> anyhow::Result<u64>;

    async fn insert_conflict(&self, record: ConflictRecord) -> anyhow::Result<()>;
    async fn list_conflicts(&self, state_id: &str) -> anyhow::Result<Vec<ConflictRecord>>;

    /// Every row currently stored for `table`, used by tests asserting
    /// convergence against the server's row set.
    async fn all_rows(&self, table: &TableName) -> anyhow::Result<Vec<(RowId, JsonValue, CommitSeq)>>;
}
