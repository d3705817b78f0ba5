use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    ClientCommitId,
    CommitSeq,
    Operation,
    RowId,
    SchemaVersion,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub client_commit_id: ClientCommitId,
    pub schema_version: SchemaVersion,
    pub operations: Vec<Operation>,
}

/// A single rejected row within an all-or-nothing rejected commit. The
/// commit as a whole still fails atomically (§9's open question resolution:
/// per-row detail is surfaced, but application remains all-or-nothing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub row_id: RowId,
    /// `ErrorCode::short_msg` of the `dgsync_errors::ErrorCode` that caused
    /// this row to fail, e.g. `"RowConflict"`.
    pub code: String,
    pub message: String,
    pub server_version: Option<CommitSeq>,
    pub server_row: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PushResponse {
    Applied { commit_seq: CommitSeq },
    Cached { commit_seq: CommitSeq },
    Rejected { rejections: Vec<Rejection> },
}

impl PushResponse {
    pub fn commit_seq(&self) -> Option<CommitSeq> {
        match self {
            PushResponse::Applied { commit_seq } | PushResponse::Cached { commit_seq } => {
                Some(*commit_seq)
            },
            PushResponse::Rejected { .. } => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, PushResponse::Rejected { .. })
    }
}
