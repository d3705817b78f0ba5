//! Rusqlite-backed `Persistence`. Mirrors `crates/sqlite`'s shape in the
//! teacher repo: a single-writer connection guarded by a `parking_lot`
//! mutex, synchronous rusqlite calls moved onto `tokio::task::spawn_blocking`
//! so the async trait doesn't block the executor.

use std::sync::Arc;

use async_trait::async_trait;
use dgsync_types::{
    ChangeOp,
    ClientCommitId,
    ClientId,
    CommitSeq,
    RowId,
    TableName,
};
use parking_lot::Mutex;
use rusqlite::{
    params,
    Connection,
    OptionalExtension,
};
use serde_json::Value as JsonValue;

use super::{
    ClientCursorRecord,
    CurrentRow,
    NewCommit,
    PendingOp,
    Persistence,
    RowPage,
    StoredCommit,
};

pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_commits (
                commit_seq INTEGER PRIMARY KEY,
                actor_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                client_commit_id TEXT NOT NULL,
                partition_id TEXT NOT NULL,
                created_at_millis INTEGER NOT NULL,
                UNIQUE(client_id, client_commit_id)
            );
            CREATE TABLE IF NOT EXISTS sync_changes (
                commit_seq INTEGER NOT NULL,
                ord INTEGER NOT NULL,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                op TEXT NOT NULL,
                row_json TEXT,
                previous_row_json TEXT,
                PRIMARY KEY (commit_seq, ord)
            );
            CREATE INDEX IF NOT EXISTS sync_table_commits
                ON sync_changes(table_name, commit_seq);
            CREATE TABLE IF NOT EXISTS sync_rows (
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                row_json TEXT NOT NULL,
                server_version INTEGER NOT NULL,
                PRIMARY KEY (table_name, row_id)
            );
            CREATE TABLE IF NOT EXISTS sync_client_cursors (
                client_id TEXT PRIMARY KEY,
                actor_id TEXT NOT NULL,
                cursor INTEGER NOT NULL,
                updated_at_millis INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            ",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO sync_meta(key, value) VALUES ('min_retained', 0)",
            [],
        )?;
        Ok(())
    }

    async fn run<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn find_commit_by_client_commit_id(
        &self,
        client_id: &ClientId,
        client_commit_id: &ClientCommitId,
    ) -> anyhow::Result<Option<CommitSeq>> {
        let client_id = client_id.clone();
        let client_commit_id = client_commit_id.clone();
        self.run(move |conn| {
            let seq = conn
                .query_row(
                    "SELECT commit_seq FROM sync_commits WHERE client_id = ?1 AND client_commit_id = ?2",
                    params![client_id, client_commit_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(seq.map(|s| s as CommitSeq))
        })
        .await
    }

    async fn current_row(
        &self,
        table: &TableName,
        row_id: &RowId,
    ) -> anyhow::Result<Option<CurrentRow>> {
        let table = table.clone();
        let row_id = row_id.clone();
        self.run(move |conn| {
            let row = conn
                .query_row(
                    "SELECT row_json, server_version FROM sync_rows WHERE table_name = ?1 AND row_id = ?2",
                    params![table, row_id],
                    |row| {
                        let json: String = row.get(0)?;
                        let version: i64 = row.get(1)?;
                        Ok((json, version))
                    },
                )
                .optional()?;
            Ok(row
                .map(|(json, version)| -> anyhow::Result<CurrentRow> {
                    Ok(CurrentRow {
                        row_json: serde_json::from_str(&json)?,
                        server_version: version as CommitSeq,
                    })
                })
                .transpose()?)
        })
        .await
    }

    async fn append_commit(&self, commit: NewCommit) -> anyhow::Result<CommitSeq> {
        self.run(move |conn| {
            if let Some(existing) = conn
                .query_row(
                    "SELECT commit_seq FROM sync_commits WHERE client_id = ?1 AND client_commit_id = ?2",
                    params![commit.client_id, commit.client_commit_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
            {
                return Ok(existing as CommitSeq);
            }

            let tx = conn.unchecked_transaction()?;
            let next_seq: i64 = tx
                .query_row("SELECT COALESCE(MAX(commit_seq), 0) + 1 FROM sync_commits", [], |r| {
                    r.get(0)
                })?;
            tx.execute(
                "INSERT INTO sync_commits (commit_seq, actor_id, client_id, client_commit_id, partition_id, created_at_millis)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    next_seq,
                    commit.actor_id,
                    commit.client_id,
                    commit.client_commit_id,
                    commit.partition_id,
                    commit.created_at_millis
                ],
            )?;

            for (ord, pending) in commit.changes.into_iter().enumerate() {
                let previous_json = pending
                    .previous_row_json
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                match pending.op {
                    PendingOp::Upsert { mut row_json } => {
                        if let Some(obj) = row_json.as_object_mut() {
                            obj.insert("server_version".to_string(), JsonValue::from(next_seq));
                        }
                        let json_text = serde_json::to_string(&row_json)?;
                        tx.execute(
                            "INSERT INTO sync_changes (commit_seq, ord, table_name, row_id, op, row_json, previous_row_json)
                             VALUES (?1, ?2, ?3, ?4, 'upsert', ?5, ?6)",
                            params![next_seq, ord as i64, pending.table, pending.row_id, json_text, previous_json],
                        )?;
                        tx.execute(
                            "INSERT INTO sync_rows (table_name, row_id, row_json, server_version)
                             VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT(table_name, row_id) DO UPDATE SET row_json = excluded.row_json, server_version = excluded.server_version",
                            params![pending.table, pending.row_id, json_text, next_seq],
                        )?;
                    },
                    PendingOp::Delete => {
                        tx.execute(
                            "INSERT INTO sync_changes (commit_seq, ord, table_name, row_id, op, row_json, previous_row_json)
                             VALUES (?1, ?2, ?3, ?4, 'delete', NULL, ?5)",
                            params![next_seq, ord as i64, pending.table, pending.row_id, previous_json],
                        )?;
                        tx.execute(
                            "DELETE FROM sync_rows WHERE table_name = ?1 AND row_id = ?2",
                            params![pending.table, pending.row_id],
                        )?;
                    },
                }
            }
            tx.commit()?;
            Ok(next_seq as CommitSeq)
        })
        .await
    }

    async fn commits_after(&self, cursor: CommitSeq, limit: u32) -> anyhow::Result<Vec<StoredCommit>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT commit_seq, created_at_millis FROM sync_commits
                 WHERE commit_seq > ?1 ORDER BY commit_seq ASC LIMIT ?2",
            )?;
            let commit_rows: Vec<(i64, i64)> = stmt
                .query_map(params![cursor as i64, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<_, _>>()?;
            drop(stmt);

            let mut result = Vec::with_capacity(commit_rows.len());
            let mut change_stmt = conn.prepare(
                "SELECT table_name, row_id, op, row_json, previous_row_json
                 FROM sync_changes WHERE commit_seq = ?1 ORDER BY ord ASC",
            )?;
            for (commit_seq, created_at_millis) in commit_rows {
                let changes = change_stmt
                    .query_map(params![commit_seq], |row| {
                        let table: String = row.get(0)?;
                        let row_id: String = row.get(1)?;
                        let op: String = row.get(2)?;
                        let row_json: Option<String> = row.get(3)?;
                        let previous_row_json: Option<String> = row.get(4)?;
                        Ok((table, row_id, op, row_json, previous_row_json))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut out_changes = Vec::with_capacity(changes.len());
                for (table, row_id, op, row_json, previous_row_json) in changes {
                    let previous = previous_row_json
                        .map(|s| serde_json::from_str(&s))
                        .transpose()?;
                    let change = if op == "upsert" {
                        let json: JsonValue = serde_json::from_str(&row_json.unwrap_or_default())?;
                        let version = json
                            .get("server_version")
                            .and_then(JsonValue::as_u64)
                            .unwrap_or(commit_seq as u64);
                        dgsync_types::Change {
                            table,
                            row_id,
                            op: ChangeOp::Upsert {
                                row_json: json,
                                server_version: version,
                            },
                            previous_row_json: previous,
                        }
                    } else {
                        dgsync_types::Change {
                            table,
                            row_id,
                            op: ChangeOp::Delete,
                            previous_row_json: previous,
                        }
                    };
                    out_changes.push(change);
                }
                result.push(StoredCommit {
                    commit_seq: commit_seq as CommitSeq,
                    created_at_millis,
                    changes: out_changes,
                });
            }
            Ok(result)
        })
        .await
    }

    async fn max_commit_seq(&self) -> anyhow::Result<CommitSeq> {
        self.run(|conn| {
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(commit_seq), 0) FROM sync_commits",
                [],
                |r| r.get(0),
            )?;
            Ok(seq as CommitSeq)
        })
        .await
    }

    async fn commit_seq_before(&self, millis: i64) -> anyhow::Result<CommitSeq> {
        self.run(move |conn| {
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(commit_seq), 0) FROM sync_commits WHERE created_at_millis < ?1",
                params![millis],
                |r| r.get(0),
            )?;
            Ok(seq as CommitSeq)
        })
        .await
    }

    async fn min_retained_commit_seq(&self) -> anyhow::Result<CommitSeq> {
        self.run(|conn| {
            let seq: i64 = conn.query_row(
                "SELECT value FROM sync_meta WHERE key = 'min_retained'",
                [],
                |r| r.get(0),
            )?;
            Ok(seq as CommitSeq)
        })
        .await
    }

    async fn latest_rows_page(
        &self,
        table: &TableName,
        page_token: Option<String>,
        limit: u32,
    ) -> anyhow::Result<RowPage> {
        let table = table.clone();
        self.run(move |conn| {
            let after = page_token.unwrap_or_default();
            let mut stmt = conn.prepare(
                "SELECT row_id, row_json, server_version FROM sync_rows
                 WHERE table_name = ?1 AND row_id > ?2 ORDER BY row_id ASC LIMIT ?3",
            )?;
            let rows: Vec<(String, String, i64)> = stmt
                .query_map(params![table, after, (limit + 1) as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<Result<_, _>>()?;
            let mut next_page_token = None;
            let mut out = Vec::new();
            for (i, (row_id, row_json, version)) in rows.into_iter().enumerate() {
                if i as u32 == limit {
                    next_page_token = out.last().map(|(id, ..): &(RowId, _, _)| id.clone());
                    break;
                }
                out.push((row_id, serde_json::from_str(&row_json)?, version as CommitSeq));
            }
            Ok(RowPage {
                rows: out,
                next_page_token,
            })
        })
        .await
    }

    async fn upsert_client_cursor(&self, record: ClientCursorRecord) -> anyhow::Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO sync_client_cursors (client_id, actor_id, cursor, updated_at_millis)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(client_id) DO UPDATE SET
                    actor_id = excluded.actor_id,
                    cursor = excluded.cursor,
                    updated_at_millis = excluded.updated_at_millis",
                params![
                    record.client_id,
                    record.actor_id,
                    record.cursor as i64,
                    record.updated_at_millis
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn active_client_cursors(
        &self,
        active_since_millis: i64,
    ) -> anyhow::Result<Vec<ClientCursorRecord>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT client_id, actor_id, cursor, updated_at_millis FROM sync_client_cursors
                 WHERE updated_at_millis >= ?1",
            )?;
            let rows = stmt
                .query_map(params![active_since_millis], |row| {
                    Ok(ClientCursorRecord {
                        client_id: row.get(0)?,
                        actor_id: row.get(1)?,
                        cursor: row.get::<_, i64>(2)? as CommitSeq,
                        updated_at_millis: row.get(3)?,
                    })
                })?
                .collect::<Result<_, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn compact_before(&self, cutoff_millis: i64) -> anyhow::Result<u64> {
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let deleted = tx.execute(
                "DELETE FROM sync_changes
                 WHERE commit_seq IN (SELECT commit_seq FROM sync_commits WHERE created_at_millis < ?1)
                   AND rowid NOT IN (
                       SELECT MAX(c2.rowid)
                       FROM sync_changes c2
                       JOIN sync_commits sc ON sc.commit_seq = c2.commit_seq
                       WHERE sc.created_at_millis < ?1
                       GROUP BY c2.table_name, c2.row_id
                   )",
                params![cutoff_millis],
            )?;
            tx.commit()?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn prune_up_to(&self, watermark: CommitSeq, keep_newest: u32) -> anyhow::Result<u64> {
        self.run(move |conn| {
            let max_seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(commit_seq), 0) FROM sync_commits",
                [],
                |r| r.get(0),
            )?;
            let floor = (max_seq - keep_newest as i64).max(0);
            let prune_up_to = (watermark as i64).min(floor);
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM sync_changes WHERE commit_seq <= ?1",
                params![prune_up_to],
            )?;
            let deleted = tx.execute(
                "DELETE FROM sync_commits WHERE commit_seq <= ?1",
                params![prune_up_to],
            )?;
            if prune_up_to > 0 {
                tx.execute(
                    "UPDATE sync_meta SET value = MAX(value, ?1) WHERE key = 'min_retained'",
                    params![prune_up_to],
                )?;
            }
            tx.commit()?;
            Ok(deleted as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::persistence::PendingChange;

    #[tokio::test]
    async fn append_and_read_back_round_trip() {
        let store = SqlitePersistence::open_in_memory().unwrap();
        let commit = NewCommit {
            actor_id: "u1".into(),
            client_id: "c1".into(),
            client_commit_id: "cc1".into(),
            partition_id: "p1".into(),
            changes: vec![PendingChange {
                table: "tasks".into(),
                row_id: "t1".into(),
                op: PendingOp::Upsert {
                    row_json: json!({"title": "hi"}),
                },
                previous_row_json: None,
            }],
            created_at_millis: 100,
        };
        let seq = store.append_commit(commit).await.unwrap();
        assert_eq!(seq, 1);
        let row = store
            .current_row(&"tasks".to_string(), &"t1".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.row_json["title"], "hi");
        assert_eq!(row.server_version, 1);

        let commits = store.commits_after(0, 10).await.unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].commit_seq, 1);
    }
}
