use dgsync_types::{
    ClientCommitId,
    CommitSeq,
    RowId,
    TableName,
};
use serde_json::Value as JsonValue;

/// A row in `sync_conflicts`: the client-visible record of a push rejected
/// with `ROW_CONFLICT` or `ROW_MISSING`, per §7's propagation policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    pub state_id: String,
    pub table: TableName,
    pub row_id: RowId,
    pub client_commit_id: ClientCommitId,
    pub code: String,
    pub message: String,
    pub server_version: Option<CommitSeq>,
    pub server_row: Option<JsonValue>,
    pub result_status: String,
    pub created_at_millis: i64,
}
