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

/// One row-level effect requested in a push. `base_version = None` means
/// "no optimistic check" for either op, per the open-question resolution in
/// `DESIGN.md`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Operation {
    Upsert {
        table: TableName,
        row_id: RowId,
        payload: JsonValue,
        base_version: Option<CommitSeq>,
    },
    Delete {
        table: TableName,
        row_id: RowId,
        base_version: Option<CommitSeq>,
    },
}

impl Operation {
    pub fn table(&self) -> &TableName {
        match self {
            Operation::Upsert { table, .. } | Operation::Delete { table, .. } => table,
        }
    }

    pub fn row_id(&self) -> &RowId {
        match self {
            Operation::Upsert { row_id, .. } | Operation::Delete { row_id, .. } => row_id,
        }
    }

    pub fn base_version(&self) -> Option<CommitSeq> {
        match self {
            Operation::Upsert { base_version, .. } | Operation::Delete { base_version, .. } => {
                *base_version
            },
        }
    }
}
