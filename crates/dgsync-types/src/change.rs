use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    CommitSeq,
    RowId,
    TableName,
};

/// Single-row effect within a commit, as delivered to a puller. Unlike
/// [`crate::Operation`], a `Change` always carries the server-assigned
/// version: there's no optimistic check left to do once a change has landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ChangeOp {
    Upsert {
        row_json: JsonValue,
        server_version: CommitSeq,
    },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub table: TableName,
    pub row_id: RowId,
    #[serde(flatten)]
    pub op: ChangeOp,
    /// The row's payload immediately before this change, when known. Used
    /// server-side to resolve which scope a deleted row belonged to (a
    /// delete's `op` carries no payload to check scope columns against).
    /// Never sent to clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_row_json: Option<JsonValue>,
}

impl Change {
    pub fn upsert(table: impl Into<TableName>, row_id: impl Into<RowId>, row_json: JsonValue, server_version: CommitSeq) -> Self {
        Self {
            table: table.into(),
            row_id: row_id.into(),
            op: ChangeOp::Upsert {
                row_json,
                server_version,
            },
            previous_row_json: None,
        }
    }

    pub fn delete(table: impl Into<TableName>, row_id: impl Into<RowId>) -> Self {
        Self {
            table: table.into(),
            row_id: row_id.into(),
            op: ChangeOp::Delete,
            previous_row_json: None,
        }
    }

    pub fn with_previous_row_json(mut self, previous: Option<JsonValue>) -> Self {
        self.previous_row_json = previous;
        self
    }

    /// The row's scope-relevant payload: the new payload for an upsert, the
    /// prior payload for a delete (there is no new one).
    pub fn scope_payload(&self) -> Option<&JsonValue> {
        match &self.op {
            ChangeOp::Upsert { row_json, .. } => Some(row_json),
            ChangeOp::Delete => self.previous_row_json.as_ref(),
        }
    }

    /// The version this change establishes for `(table, row_id)`, used by
    /// dedupe (§4.4 step 4) to decide which of several changes to the same
    /// row within a window is "latest".
    pub fn server_version(&self) -> Option<CommitSeq> {
        match &self.op {
            ChangeOp::Upsert { server_version, .. } => Some(*server_version),
            ChangeOp::Delete => None,
        }
    }
}

/// A server-assigned, ordered group of changes produced by one push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub commit_seq: CommitSeq,
    pub changes: Vec<Change>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn upsert_change_round_trips() {
        let change = Change::upsert("tasks", "t1", json!({"title": "Hello"}), 7);
        let wire = serde_json::to_value(&change).unwrap();
        assert_eq!(wire["op"], "upsert");
        assert_eq!(wire["server_version"], 7);
        let back: Change = serde_json::from_value(wire).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn delete_change_has_no_server_version() {
        let change = Change::delete("tasks", "t1");
        assert_eq!(change.server_version(), None);
    }
}
