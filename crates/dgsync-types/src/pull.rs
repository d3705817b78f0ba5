use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    ChunkRef,
    Commit,
    CommitSeq,
    ScopeMap,
    SubscriptionId,
    TableName,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub id: SubscriptionId,
    pub table: TableName,
    pub scopes: ScopeMap,
    #[serde(default)]
    pub params: Option<JsonValue>,
    pub cursor: CommitSeq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub subscriptions: Vec<SubscriptionRequest>,
    pub limit_commits: u32,
    #[serde(default)]
    pub limit_snapshot_rows: Option<u32>,
    #[serde(default)]
    pub max_snapshot_pages: Option<u32>,
    #[serde(default)]
    pub dedupe_rows: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapInfo {
    pub chunks: Vec<ChunkRef>,
    #[serde(default)]
    pub page_token: Option<String>,
    pub snapshot_commit_seq: CommitSeq,
}

/// Per-subscription pull outcome, as a tagged union rather than the "status
/// string plus optional sibling fields" shape a loosely-typed transport
/// would use. `ForcedBootstrap` folds §4.4 steps 2-3 (cursor ahead of the
/// log, or below the prune watermark) into a single client-visible case:
/// either way the client's only correct move is to bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PullOutcome {
    Active {
        commits: Vec<Commit>,
        next_cursor: CommitSeq,
    },
    Revoked,
    ForcedBootstrap {
        bootstrap: BootstrapInfo,
    },
}

impl PullOutcome {
    pub fn next_cursor(&self) -> Option<CommitSeq> {
        match self {
            PullOutcome::Active { next_cursor, .. } => Some(*next_cursor),
            PullOutcome::ForcedBootstrap { bootstrap } => Some(bootstrap.snapshot_commit_seq),
            PullOutcome::Revoked => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionPullResult {
    pub id: SubscriptionId,
    #[serde(flatten)]
    pub outcome: PullOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub subscriptions: Vec<SubscriptionPullResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_outcome_round_trips() {
        let outcome = PullOutcome::Active {
            commits: vec![],
            next_cursor: 42,
        };
        let wire = serde_json::to_value(&outcome).unwrap();
        assert_eq!(wire["status"], "active");
        assert_eq!(wire["next_cursor"], 42);
        let back: PullOutcome = serde_json::from_value(wire).unwrap();
        assert_eq!(back, outcome);
    }

    #[test]
    fn revoked_outcome_has_no_extra_fields() {
        let wire = serde_json::to_value(&PullOutcome::Revoked).unwrap();
        assert_eq!(wire, serde_json::json!({"status": "revoked"}));
    }
}
