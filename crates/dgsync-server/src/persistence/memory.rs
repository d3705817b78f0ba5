use std::{
    collections::BTreeMap,
    ops::Bound,
};

use async_trait::async_trait;
use dgsync_types::{
    ActorId,
    Change,
    ClientCommitId,
    ClientId,
    CommitSeq,
    RowId,
    TableName,
};
use parking_lot::Mutex;

use super::{
    ClientCursorRecord,
    CurrentRow,
    NewCommit,
    PendingOp,
    Persistence,
    RowPage,
    StoredCommit,
};

#[derive(Default)]
struct Inner {
    next_commit_seq: CommitSeq,
    min_retained: CommitSeq,
    commits: BTreeMap<CommitSeq, StoredCommitRow>,
    idempotency: BTreeMap<(ClientId, ClientCommitId), CommitSeq>,
    rows: BTreeMap<(TableName, RowId), CurrentRow>,
    cursors: BTreeMap<ClientId, ClientCursorRecord>,
}

struct StoredCommitRow {
    created_at_millis: i64,
    changes: Vec<Change>,
}

/// An in-memory `Persistence` backend, used by tests and by the end-to-end
/// scenario suite. Mirrors the teacher's pattern of an in-memory
/// `Persistence` implementation for fast, deterministic tests
/// (`crates/database`'s in-memory backend plays the same role there).
pub struct MemoryPersistence {
    inner: Mutex<Inner>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn find_commit_by_client_commit_id(
        &self,
        client_id: &ClientId,
        client_commit_id: &ClientCommitId,
    ) -> anyhow::Result<Option<CommitSeq>> {
        let inner = self.inner.lock();
        Ok(inner
            .idempotency
            .get(&(client_id.clone(), client_commit_id.clone()))
            .copied())
    }

    async fn current_row(
        &self,
        table: &TableName,
        row_id: &RowId,
    ) -> anyhow::Result<Option<CurrentRow>> {
        let inner = self.inner.lock();
        Ok(inner.rows.get(&(table.clone(), row_id.clone())).cloned())
    }

    async fn append_commit(&self, commit: NewCommit) -> anyhow::Result<CommitSeq> {
        let mut inner = self.inner.lock();
        let key = (commit.client_id.clone(), commit.client_commit_id.clone());
        if let Some(existing) = inner.idempotency.get(&key) {
            return Ok(*existing);
        }
        let commit_seq = inner.next_commit_seq + 1;
        inner.next_commit_seq = commit_seq;

        let mut changes = Vec::with_capacity(commit.changes.len());
        for pending in commit.changes {
            let row_key = (pending.table.clone(), pending.row_id.clone());
            let change = match pending.op {
                PendingOp::Upsert { mut row_json } => {
                    if let Some(obj) = row_json.as_object_mut() {
                        obj.insert(
                            "server_version".to_string(),
                            serde_json::Value::from(commit_seq),
                        );
                    }
                    inner.rows.insert(
                        row_key,
                        CurrentRow {
                            row_json: row_json.clone(),
                            server_version: commit_seq,
                        },
                    );
                    Change::upsert(pending.table, pending.row_id, row_json, commit_seq)
                },
                PendingOp::Delete => {
                    inner.rows.remove(&row_key);
                    Change::delete(pending.table, pending.row_id)
                },
            }
            .with_previous_row_json(pending.previous_row_json);
            changes.push(change);
        }

        inner.commits.insert(
            commit_seq,
            StoredCommitRow {
                created_at_millis: commit.created_at_millis,
                changes,
            },
        );
        inner.idempotency.insert(key, commit_seq);
        Ok(commit_seq)
    }

    async fn commits_after(&self, cursor: CommitSeq, limit: u32) -> anyhow::Result<Vec<StoredCommit>> {
        let inner = self.inner.lock();
        Ok(inner
            .commits
            .range((cursor + 1)..)
            .take(limit as usize)
            .map(|(&commit_seq, row)| StoredCommit {
                commit_seq,
                created_at_millis: row.created_at_millis,
                changes: row.changes.clone(),
            })
            .collect())
    }

    async fn max_commit_seq(&self) -> anyhow::Result<CommitSeq> {
        Ok(self.inner.lock().next_commit_seq)
    }

    async fn commit_seq_before(&self, millis: i64) -> anyhow::Result<CommitSeq> {
        let inner = self.inner.lock();
        Ok(inner
            .commits
            .iter()
            .filter(|(_, row)| row.created_at_millis < millis)
            .map(|(&seq, _)| seq)
            .max()
            .unwrap_or(0))
    }

    async fn min_retained_commit_seq(&self) -> anyhow::Result<CommitSeq> {
        Ok(self.inner.lock().min_retained)
    }

    async fn latest_rows_page(
        &self,
        table: &TableName,
        page_token: Option<String>,
        limit: u32,
    ) -> anyhow::Result<RowPage> {
        let inner = self.inner.lock();
        let lower = match page_token {
            Some(after) => Bound::Excluded((table.clone(), after)),
            None => Bound::Included((table.clone(), String::new())),
        };
        let mut rows = Vec::new();
        let mut next_page_token = None;
        let iter = inner
            .rows
            .range((lower, Bound::Unbounded))
            .take_while(|((t, _), _)| t == table);
        for ((_, row_id), row) in iter {
            if rows.len() as u32 == limit {
                // There's at least one more row; resume after the last one we kept.
                next_page_token = rows.last().map(|(id, ..): &(RowId, _, _)| id.clone());
                break;
            }
            rows.push((row_id.clone(), row.row_json.clone(), row.server_version));
        }
        Ok(RowPage {
            rows,
            next_page_token,
        })
    }

    async fn upsert_client_cursor(&self, record: ClientCursorRecord) -> anyhow::Result<()> {
        self.inner
            .lock()
            .cursors
            .insert(record.client_id.clone(), record);
        Ok(())
    }

    async fn active_client_cursors(
        &self,
        active_since_millis: i64,
    ) -> anyhow::Result<Vec<ClientCursorRecord>> {
        Ok(self
            .inner
            .lock()
            .cursors
            .values()
            .filter(|c| c.updated_at_millis >= active_since_millis)
            .cloned()
            .collect())
    }

    async fn compact_before(&self, cutoff_millis: i64) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let mut latest_per_row: BTreeMap<(TableName, RowId), CommitSeq> = BTreeMap::new();
        for (&commit_seq, row) in inner.commits.range(..) {
            if row.created_at_millis >= cutoff_millis {
                continue;
            }
            for change in &row.changes {
                latest_per_row.insert((change.table.clone(), change.row_id.clone()), commit_seq);
            }
        }
        let mut discarded = 0u64;
        for (&commit_seq, row) in inner.commits.iter_mut() {
            if row.created_at_millis >= cutoff_millis {
                continue;
            }
            let before = row.changes.len();
            row.changes.retain(|change| {
                latest_per_row.get(&(change.table.clone(), change.row_id.clone()))
                    == Some(&commit_seq)
            });
            discarded += (before - row.changes.len()) as u64;
        }
        Ok(discarded)
    }

    async fn prune_up_to(&self, watermark: CommitSeq, keep_newest: u32) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let max_seq = inner.next_commit_seq;
        let floor = max_seq.saturating_sub(keep_newest as u64);
        let prune_up_to = watermark.min(floor);
        let to_remove: Vec<CommitSeq> = inner
            .commits
            .range(..=prune_up_to)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in &to_remove {
            inner.commits.remove(seq);
        }
        if prune_up_to > inner.min_retained {
            inner.min_retained = prune_up_to;
        }
        Ok(to_remove.len() as u64)
    }
}
