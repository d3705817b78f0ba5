//! Rusqlite-backed `LocalStore`. Same shape as
//! `dgsync_server::persistence::SqlitePersistence`: a single-writer
//! connection guarded by a `parking_lot` mutex, synchronous calls moved onto
//! `tokio::task::spawn_blocking`.

use std::sync::Arc;

use async_trait::async_trait;
use dgsync_types::{
    ChangeOp,
    ChunkFrame,
    CommitSeq,
    RowId,
    ScopeMap,
    ScopeVerdict,
    SubscriptionId,
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
    LocalStore,
    NewOutboxEntry,
    OutboxEntry,
    OutboxStatus,
    SubscriptionState,
};
use crate::conflict::ConflictRecord;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
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
            CREATE TABLE IF NOT EXISTS sync_outbox_commits (
                local_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                client_commit_id TEXT NOT NULL UNIQUE,
                schema_version INTEGER NOT NULL,
                operations_json TEXT NOT NULL,
                status TEXT NOT NULL,
                commit_seq INTEGER,
                failure_code TEXT,
                failure_message TEXT,
                created_at_millis INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_subscription_state (
                state_id TEXT NOT NULL,
                subscription_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                scopes_json TEXT NOT NULL,
                params_json TEXT,
                cursor INTEGER NOT NULL,
                status TEXT NOT NULL,
                bootstrap_page_token TEXT,
                PRIMARY KEY (state_id, subscription_id)
            );
            CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                state_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                client_commit_id TEXT NOT NULL,
                code TEXT NOT NULL,
                message TEXT NOT NULL,
                server_version INTEGER,
                server_row_json TEXT,
                result_status TEXT NOT NULL,
                created_at_millis INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_client_cursors (
                subscription_id TEXT PRIMARY KEY,
                cursor INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sync_rows (
                table_name TEXT NOT NULL,
                row_id TEXT NOT NULL,
                row_json TEXT NOT NULL,
                server_version INTEGER NOT NULL,
                PRIMARY KEY (table_name, row_id)
            );
            ",
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

fn status_to_text(status: &OutboxStatus) -> (&'static str, Option<i64>, Option<String>, Option<String>) {
    match status {
        OutboxStatus::Pending => ("pending", None, None, None),
        OutboxStatus::Sending => ("sending", None, None, None),
        OutboxStatus::Applied { commit_seq } => ("applied", Some(*commit_seq as i64), None, None),
        OutboxStatus::Failed { code, message } => ("failed", None, Some(code.clone()), Some(message.clone())),
    }
}

fn row_to_outbox_entry(
    local_seq: i64,
    client_commit_id: String,
    schema_version: i64,
    operations_json: String,
    status: String,
    commit_seq: Option<i64>,
    failure_code: Option<String>,
    failure_message: Option<String>,
    created_at_millis: i64,
) -> anyhow::Result<OutboxEntry> {
    let operations = serde_json::from_str(&operations_json)?;
    let status = match status.as_str() {
        "pending" => OutboxStatus::Pending,
        "sending" => OutboxStatus::Sending,
        "applied" => OutboxStatus::Applied {
            commit_seq: commit_seq.unwrap_or_default() as CommitSeq,
        },
        "failed" => OutboxStatus::Failed {
            code: failure_code.unwrap_or_default(),
            message: failure_message.unwrap_or_default(),
        },
        other => anyhow::bail!("unknown outbox status {other}"),
    };
    Ok(OutboxEntry {
        local_seq: local_seq as u64,
        client_commit_id,
        schema_version: schema_version as u32,
        operations,
        status,
        created_at_millis,
    })
}

fn subscription_status_to_text(status: super::SubscriptionStatus) -> &'static str {
    match status {
        super::SubscriptionStatus::Bootstrapping => "bootstrapping",
        super::SubscriptionStatus::Active => "active",
        super::SubscriptionStatus::Revoked => "revoked",
    }
}

fn subscription_status_from_text(text: &str) -> anyhow::Result<super::SubscriptionStatus> {
    Ok(match text {
        "bootstrapping" => super::SubscriptionStatus::Bootstrapping,
        "active" => super::SubscriptionStatus::Active,
        "revoked" => super::SubscriptionStatus::Revoked,
        other => anyhow::bail!("unknown subscription status {other}"),
    })
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn enqueue_outbox(&self, entry: NewOutboxEntry) -> anyhow::Result<u64> {
        self.run(move |conn| {
            let operations_json = serde_json::to_string(&entry.operations)?;
            conn.execute(
                "INSERT INTO sync_outbox_commits
                    (client_commit_id, schema_version, operations_json, status, created_at_millis)
                 VALUES (?1, ?2, ?3, 'pending', ?4)",
                params![entry.client_commit_id, entry.schema_version, operations_json, entry.created_at_millis],
            )?;
            Ok(conn.last_insert_rowid() as u64)
        })
        .await
    }

    async fn next_pending_outbox(&self) -> anyhow::Result<Option<OutboxEntry>> {
        self.run(|conn| {
            conn.query_row(
                "SELECT local_seq, client_commit_id, schema_version, operations_json, status,
                        commit_seq, failure_code, failure_message, created_at_millis
                 FROM sync_outbox_commits
                 WHERE status IN ('pending', 'sending')
                 ORDER BY local_seq ASC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )
            .optional()?
            .map(|(local_seq, client_commit_id, schema_version, operations_json, status, commit_seq, failure_code, failure_message, created_at_millis)| {
                row_to_outbox_entry(
                    local_seq,
                    client_commit_id,
                    schema_version,
                    operations_json,
                    status,
                    commit_seq,
                    failure_code,
                    failure_message,
                    created_at_millis,
                )
            })
            .transpose()
        })
        .await
    }

    async fn mark_outbox_sending(&self, local_seq: u64) -> anyhow::Result<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE sync_outbox_commits SET status = 'sending' WHERE local_seq = ?1",
                params![local_seq as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_outbox_applied(&self, local_seq: u64, commit_seq: CommitSeq) -> anyhow::Result<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE sync_outbox_commits SET status = 'applied', commit_seq = ?1 WHERE local_seq = ?2",
                params![commit_seq as i64, local_seq as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_outbox_failed(&self, local_seq: u64, code: String, message: String) -> anyhow::Result<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE sync_outbox_commits SET status = 'failed', failure_code = ?1, failure_message = ?2 WHERE local_seq = ?3",
                params![code, message, local_seq as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_subscription(
        &self,
        state_id: &str,
        subscription_id: &SubscriptionId,
    ) -> anyhow::Result<Option<SubscriptionState>> {
        let state_id = state_id.to_string();
        let subscription_id = subscription_id.clone();
        self.run(move |conn| {
            conn.query_row(
                "SELECT table_name, scopes_json, params_json, cursor, status, bootstrap_page_token
                 FROM sync_subscription_state WHERE state_id = ?1 AND subscription_id = ?2",
                params![state_id, subscription_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?
            .map(|(table, scopes_json, params_json, cursor, status, bootstrap_page_token)| {
                anyhow::Ok(SubscriptionState {
                    state_id: state_id.clone(),
                    subscription_id: subscription_id.clone(),
                    table,
                    scopes: serde_json::from_str(&scopes_json)?,
                    params: params_json.map(|s| serde_json::from_str(&s)).transpose()?,
                    cursor: cursor as CommitSeq,
                    status: subscription_status_from_text(&status)?,
                    bootstrap_page_token,
                })
            })
            .transpose()
        })
        .await
    }

    async fn list_subscriptions(&self, state_id: &str) -> anyhow::Result<Vec<SubscriptionState>> {
        let state_id = state_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT subscription_id, table_name, scopes_json, params_json, cursor, status, bootstrap_page_token
                 FROM sync_subscription_state WHERE state_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![state_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let mut out = Vec::with_capacity(rows.len());
            for (subscription_id, table, scopes_json, params_json, cursor, status, bootstrap_page_token) in rows {
                out.push(SubscriptionState {
                    state_id: state_id.clone(),
                    subscription_id,
                    table,
                    scopes: serde_json::from_str(&scopes_json)?,
                    params: params_json.map(|s| serde_json::from_str(&s)).transpose()?,
                    cursor: cursor as CommitSeq,
                    status: subscription_status_from_text(&status)?,
                    bootstrap_page_token,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn upsert_subscription(&self, state: SubscriptionState) -> anyhow::Result<()> {
        self.run(move |conn| {
            let scopes_json = serde_json::to_string(&state.scopes)?;
            let params_json = state.params.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "INSERT INTO sync_subscription_state
                    (state_id, subscription_id, table_name, scopes_json, params_json, cursor, status, bootstrap_page_token)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(state_id, subscription_id) DO UPDATE SET
                    table_name = excluded.table_name,
                    scopes_json = excluded.scopes_json,
                    params_json = excluded.params_json,
                    cursor = excluded.cursor,
                    status = excluded.status,
                    bootstrap_page_token = excluded.bootstrap_page_token",
                params![
                    state.state_id,
                    state.subscription_id,
                    state.table,
                    scopes_json,
                    params_json,
                    state.cursor as i64,
                    subscription_status_to_text(state.status),
                    state.bootstrap_page_token,
                ],
            )?;
            conn.execute(
                "INSERT INTO sync_client_cursors (subscription_id, cursor) VALUES (?1, ?2)
                 ON CONFLICT(subscription_id) DO UPDATE SET cursor = excluded.cursor",
                params![state.subscription_id, state.cursor as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_subscription(&self, state_id: &str, subscription_id: &SubscriptionId) -> anyhow::Result<()> {
        let state_id = state_id.to_string();
        let subscription_id = subscription_id.clone();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM sync_subscription_state WHERE state_id = ?1 AND subscription_id = ?2",
                params![state_id, subscription_id],
            )?;
            conn.execute(
                "DELETE FROM sync_client_cursors WHERE subscription_id = ?1",
                params![subscription_id],
            )?;
            Ok(())
        })
        .await
    }

    async fn current_row(&self, table: &TableName, row_id: &RowId) -> anyhow::Result<Option<(JsonValue, CommitSeq)>> {
        let table = table.clone();
        let row_id = row_id.clone();
        self.run(move |conn| {
            conn.query_row(
                "SELECT row_json, server_version FROM sync_rows WHERE table_name = ?1 AND row_id = ?2",
                params![table, row_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?
            .map(|(json, version)| anyhow::Ok((serde_json::from_str(&json)?, version as CommitSeq)))
            .transpose()
        })
        .await
    }

    async fn apply_commit(
        &self,
        subscription_id: &SubscriptionId,
        table: &TableName,
        changes: Vec<dgsync_types::Change>,
        cursor: CommitSeq,
    ) -> anyhow::Result<()> {
        let subscription_id = subscription_id.clone();
        let table = table.clone();
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for change in changes {
                match change.op {
                    ChangeOp::Upsert { row_json, server_version } => {
                        let json_text = serde_json::to_string(&row_json)?;
                        tx.execute(
                            "INSERT INTO sync_rows (table_name, row_id, row_json, server_version)
                             VALUES (?1, ?2, ?3, ?4)
                             ON CONFLICT(table_name, row_id) DO UPDATE SET row_json = excluded.row_json, server_version = excluded.server_version",
                            params![change.table, change.row_id, json_text, server_version as i64],
                        )?;
                    },
                    ChangeOp::Delete => {
                        tx.execute(
                            "DELETE FROM sync_rows WHERE table_name = ?1 AND row_id = ?2",
                            params![change.table, change.row_id],
                        )?;
                    },
                }
            }
            tx.execute(
                "UPDATE sync_subscription_state SET cursor = ?1 WHERE subscription_id = ?2 AND table_name = ?3",
                params![cursor as i64, subscription_id, table],
            )?;
            tx.execute(
                "INSERT INTO sync_client_cursors (subscription_id, cursor) VALUES (?1, ?2)
                 ON CONFLICT(subscription_id) DO UPDATE SET cursor = excluded.cursor",
                params![subscription_id, cursor as i64],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn advance_cursor(&self, subscription_id: &SubscriptionId, cursor: CommitSeq) -> anyhow::Result<()> {
        let subscription_id = subscription_id.clone();
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE sync_subscription_state SET cursor = ?1 WHERE subscription_id = ?2",
                params![cursor as i64, subscription_id],
            )?;
            tx.execute(
                "INSERT INTO sync_client_cursors (subscription_id, cursor) VALUES (?1, ?2)
                 ON CONFLICT(subscription_id) DO UPDATE SET cursor = excluded.cursor",
                params![subscription_id, cursor as i64],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn apply_bootstrap_frames(&self, table: &TableName, frames: Vec<ChunkFrame>) -> anyhow::Result<()> {
        let table = table.clone();
        self.run(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for frame in frames {
                let json_text = serde_json::to_string(&frame.row_json)?;
                tx.execute(
                    "INSERT INTO sync_rows (table_name, row_id, row_json, server_version)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(table_name, row_id) DO UPDATE SET row_json = excluded.row_json, server_version = excluded.server_version",
                    params![table, frame.row_id, json_text, frame.server_version as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_rows_matching_scope(&self, table: &TableName, scope: &ScopeMap) -> anyhow::Result<u64> {
        let table = table.clone();
        let scope = scope.clone();
        self.run(move |conn| {
            let verdict = ScopeVerdict::Active { effective: scope };
            let mut stmt = conn.prepare("SELECT row_id, row_json FROM sync_rows WHERE table_name = ?1")?;
            let rows: Vec<(String, String)> = stmt
                .query_map(params![table], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            drop(stmt);
            let tx = conn.unchecked_transaction()?;
            let mut removed = 0u64;
            for (row_id, row_json) in rows {
                let parsed: JsonValue = serde_json::from_str(&row_json)?;
                if verdict.matches_json(&parsed) {
                    tx.execute(
                        "DELETE FROM sync_rows WHERE table_name = ?1 AND row_id = ?2",
                        params![table, row_id],
                    )?;
                    removed += 1;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn delete_rows_outside_narrowed_scope(
        &self,
        table: &TableName,
        old_scope: &ScopeMap,
        new_scope: &ScopeMap,
    ) -> anyhow::Result<u64> {
        let table = table.clone();
        let old_scope = old_scope.clone();
        let new_scope = new_scope.clone();
        self.run(move |conn| {
            let old_verdict = ScopeVerdict::Active { effective: old_scope };
            let new_verdict = ScopeVerdict::Active { effective: new_scope };
            let mut stmt = conn.prepare("SELECT row_id, row_json FROM sync_rows WHERE table_name = ?1")?;
            let rows: Vec<(String, String)> = stmt
                .query_map(params![table], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            drop(stmt);
            let tx = conn.unchecked_transaction()?;
            let mut removed = 0u64;
            for (row_id, row_json) in rows {
                let parsed: JsonValue = serde_json::from_str(&row_json)?;
                if old_verdict.matches_json(&parsed) && !new_verdict.matches_json(&parsed) {
                    tx.execute(
                        "DELETE FROM sync_rows WHERE table_name = ?1 AND row_id = ?2",
                        params![table, row_id],
                    )?;
                    removed += 1;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn delete_rows_not_covered_by_other_scopes(
        &self,
        table: &TableName,
        scope: &ScopeMap,
        keep_scopes: &[ScopeMap],
    ) -> anyhow::Result<u64> {
        let table = table.clone();
        let scope = scope.clone();
        let keep_scopes = keep_scopes.to_vec();
        self.run(move |conn| {
            let verdict = ScopeVerdict::Active { effective: scope };
            let keep_verdicts: Vec<ScopeVerdict> = keep_scopes
                .into_iter()
                .map(|s| ScopeVerdict::Active { effective: s })
                .collect();
            let mut stmt = conn.prepare("SELECT row_id, row_json FROM sync_rows WHERE table_name = ?1")?;
            let rows: Vec<(String, String)> = stmt
                .query_map(params![table], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            drop(stmt);
            let tx = conn.unchecked_transaction()?;
            let mut removed = 0u64;
            for (row_id, row_json) in rows {
                let parsed: JsonValue = serde_json::from_str(&row_json)?;
                let covered = keep_verdicts.iter().any(|kv| kv.matches_json(&parsed));
                if verdict.matches_json(&parsed) && !covered {
                    tx.execute(
                        "DELETE FROM sync_rows WHERE table_name = ?1 AND row_id = ?2",
                        params![table, row_id],
                    )?;
                    removed += 1;
                }
            }
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn insert_conflict(&self, record: ConflictRecord) -> anyhow::Result<()> {
        self.run(move |conn| {
            let server_row_json = record.server_row.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "INSERT INTO sync_conflicts
                    (state_id, table_name, row_id, client_commit_id, code, message,
                     server_version, server_row_json, result_status, created_at_millis)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.state_id,
                    record.table,
                    record.row_id,
                    record.client_commit_id,
                    record.code,
                    record.message,
                    record.server_version.map(|v| v as i64),
                    server_row_json,
                    record.result_status,
                    record.created_at_millis,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_conflicts(&self, state_id: &str) -> anyhow::Result<Vec<ConflictRecord>> {
        let state_id = state_id.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT table_name, row_id, client_commit_id, code, message,
                        server_version, server_row_json, result_status, created_at_millis
                 FROM sync_conflicts WHERE state_id = ?1",
            )?;
            let rows = stmt.query_map(params![state_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (table, row_id, client_commit_id, code, message, server_version, server_row_json, result_status, created_at_millis) = row?;
                out.push(ConflictRecord {
                    state_id: state_id.clone(),
                    table,
                    row_id,
                    client_commit_id,
                    code,
                    message,
                    server_version: server_version.map(|v| v as CommitSeq),
                    server_row: server_row_json.map(|s| serde_json::from_str(&s)).transpose()?,
                    result_status,
                    created_at_millis,
                });
            }
            Ok(out)
        })
        .await
    }

    async fn all_rows(&self, table: &TableName) -> anyhow::Result<Vec<(RowId, JsonValue, CommitSeq)>> {
        let table = table.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare("SELECT row_id, row_json, server_version FROM sync_rows WHERE table_name = ?1")?;
            let rows = stmt.query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (row_id, row_json, version) = row?;
                out.push((row_id, serde_json::from_str(&row_json)?, version as CommitSeq));
            }
            Ok(out)
        })
        .await
    }
}
