//! The commit log's storage seam (C1). Modeled on the teacher's
//! `database::Persistence` trait: one narrow interface, several backends
//! (`memory` for tests, `sqlite` for a real single-node deployment), with
//! the transactional append as the single write path every backend must get
//! right.

mod memory;
mod sqlite;

use async_trait::async_trait;
use dgsync_types::{
    ActorId,
    Change,
    ClientCommitId,
    ClientId,
    Commit,
    CommitSeq,
    PartitionId,
    RowId,
    TableName,
};
pub use memory::MemoryPersistence;
use serde_json::Value as JsonValue;
pub use sqlite::SqlitePersistence;

/// A row-level effect that hasn't been assigned a `commit_seq` yet. Distinct
/// from `dgsync_types::Change`, which always carries a concrete
/// `server_version` — that version can only be known once the store has
/// atomically allocated the commit's sequence number.
#[derive(Debug, Clone)]
pub enum PendingOp {
    Upsert { row_json: JsonValue },
    Delete,
}

#[derive(Debug, Clone)]
pub struct PendingChange {
    pub table: TableName,
    pub row_id: RowId,
    pub op: PendingOp,
    pub previous_row_json: Option<JsonValue>,
}

/// A commit as accepted by the store: the assigned `commit_seq` plus the
/// bookkeeping fields that aren't part of the wire `Commit` type.
#[derive(Debug, Clone)]
pub struct NewCommit {
    pub actor_id: ActorId,
    pub client_id: ClientId,
    pub client_commit_id: ClientCommitId,
    pub partition_id: PartitionId,
    pub changes: Vec<PendingChange>,
    pub created_at_millis: i64,
}

#[derive(Debug, Clone)]
pub struct StoredCommit {
    pub commit_seq: CommitSeq,
    pub created_at_millis: i64,
    pub changes: Vec<Change>,
}

impl StoredCommit {
    pub fn into_wire(self) -> Commit {
        Commit {
            commit_seq: self.commit_seq,
            changes: self.changes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CurrentRow {
    pub row_json: JsonValue,
    pub server_version: CommitSeq,
}

#[derive(Debug, Clone, Default)]
pub struct RowPage {
    pub rows: Vec<(RowId, JsonValue, CommitSeq)>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientCursorRecord {
    pub client_id: ClientId,
    pub actor_id: ActorId,
    pub cursor: CommitSeq,
    pub updated_at_millis: i64,
}

/// The append-only commit log plus the application tables it versions.
/// Every method that mutates state must be atomic: `append_commit` either
/// writes the commit row and every one of its changes (updating current row
/// state) or writes nothing.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Idempotency lookup for push's exactly-once guarantee (§4.3 step 1).
    async fn find_commit_by_client_commit_id(
        &self,
        client_id: &ClientId,
        client_commit_id: &ClientCommitId,
    ) -> anyhow::Result<Option<CommitSeq>>;

    /// Current row state, used for base-version checks on push.
    async fn current_row(
        &self,
        table: &TableName,
        row_id: &RowId,
    ) -> anyhow::Result<Option<CurrentRow>>;

    /// Atomically assign the next `commit_seq`, persist the commit and its
    /// changes, and apply each change to the corresponding application
    /// table's current row state.
    async fn append_commit(&self, commit: NewCommit) -> anyhow::Result<CommitSeq>;

    /// Commits strictly after `cursor`, in ascending order, capped at
    /// `limit`. Scope filtering happens above this layer (C4): this just
    /// streams the log.
    async fn commits_after(&self, cursor: CommitSeq, limit: u32) -> anyhow::Result<Vec<StoredCommit>>;

    async fn max_commit_seq(&self) -> anyhow::Result<CommitSeq>;

    /// The highest `commit_seq` whose `created_at_millis < millis`. Used to
    /// compute the prune watermark's `age_based_cutoff` (§4.6).
    async fn commit_seq_before(&self, millis: i64) -> anyhow::Result<CommitSeq>;

    /// The oldest `commit_seq` still retained. A cursor below this value can
    /// no longer be served incrementally.
    async fn min_retained_commit_seq(&self) -> anyhow::Result<CommitSeq>;

    /// One page of current rows for a table, ordered by `row_id` for a
    /// stable page token, used by the bootstrap engine (C5).
    async fn latest_rows_page(
        &self,
        table: &TableName,
        page_token: Option<String>,
        limit: u32,
    ) -> anyhow::Result<RowPage>;

    async fn upsert_client_cursor(&self, record: ClientCursorRecord) -> anyhow::Result<()>;

    /// Cursors for clients considered active as of `active_since_millis`,
    /// used to compute the prune watermark's `min_active_client_cursor`.
    async fn active_client_cursors(
        &self,
        active_since_millis: i64,
    ) -> anyhow::Result<Vec<ClientCursorRecord>>;

    /// Collapse per-row history for commits with `created_at_millis <
    /// cutoff_millis`: for each `(table, row_id)` touched only within that
    /// window, keep the latest change and discard the rest. Commit rows
    /// survive, possibly with zero remaining changes. Returns the number of
    /// changes discarded.
    async fn compact_before(&self, cutoff_millis: i64) -> anyhow::Result<u64>;

    /// Delete every commit (and its changes) with `commit_seq <= watermark`,
    /// never touching the newest `keep_newest` commits regardless of
    /// `watermark`. Returns the number of commits deleted.
    async fn prune_up_to(&self, watermark: CommitSeq, keep_newest: u32) -> anyhow::Result<u64>;
}
