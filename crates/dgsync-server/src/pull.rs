//! Pull engine (C4): stream incremental changes filtered by effective
//! scopes, or hand off to the bootstrap engine (C5) when the cursor can't be
//! served incrementally.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use dgsync_types::{
    ActorId,
    Change,
    Commit,
    CommitSeq,
    PullOutcome,
    PullRequest,
    PullResponse,
    RowId,
    SubscriptionPullResult,
    SubscriptionRequest,
    TableName,
};
use tracing::instrument;

use crate::{
    bootstrap::BootstrapEngine,
    persistence::Persistence,
    scope_resolver::ScopeResolver,
};

pub struct PullEngine<P, S> {
    persistence: Arc<P>,
    scope_resolver: Arc<S>,
    bootstrap: Arc<BootstrapEngine<P>>,
}

impl<P, S> PullEngine<P, S>
where
    P: Persistence,
    S: ScopeResolver,
{
    pub fn new(
        persistence: Arc<P>,
        scope_resolver: Arc<S>,
        bootstrap: Arc<BootstrapEngine<P>>,
    ) -> Self {
        Self {
            persistence,
            scope_resolver,
            bootstrap,
        }
    }

    #[instrument(skip(self, request))]
    pub async fn pull(&self, actor_id: &ActorId, request: PullRequest) -> anyhow::Result<PullResponse> {
        let mut subscriptions = Vec::with_capacity(request.subscriptions.len());
        for sub in &request.subscriptions {
            let outcome = self
                .pull_one(actor_id, sub, request.limit_commits, request.dedupe_rows)
                .await?;
            subscriptions.push(SubscriptionPullResult {
                id: sub.id.clone(),
                outcome,
            });
        }
        Ok(PullResponse { subscriptions })
    }

    async fn pull_one(
        &self,
        actor_id: &ActorId,
        sub: &SubscriptionRequest,
        limit_commits: u32,
        dedupe_rows: bool,
    ) -> anyhow::Result<PullOutcome> {
        let verdict = self.scope_resolver.resolve(actor_id, &sub.scopes);
        if verdict.is_revoked() {
            return Ok(PullOutcome::Revoked);
        }

        let effective = verdict
            .effective()
            .expect("non-revoked verdict has an effective scope")
            .clone();

        let max_seq = self.persistence.max_commit_seq().await?;
        if sub.cursor > max_seq {
            // Cursor ahead of the log: a server restore or clock rollback.
            // The only safe move is a fresh snapshot.
            return self.bootstrap.start(sub, &effective).await;
        }

        // A cursor of 0 means "never synced": if the log has already been
        // pruned past its start, incremental pull would silently skip every
        // row whose only create commit was pruned away, so it must
        // bootstrap too, not just cursors strictly past 0.
        let min_retained = self.persistence.min_retained_commit_seq().await?;
        if sub.cursor < min_retained {
            return self.bootstrap.start(sub, &effective).await;
        }

        let stored = self.persistence.commits_after(sub.cursor, limit_commits).await?;
        let next_cursor = stored.last().map(|c| c.commit_seq).unwrap_or(sub.cursor);

        let mut filtered: Vec<(CommitSeq, Change)> = Vec::new();
        for stored_commit in &stored {
            for change in &stored_commit.changes {
                if change.table != sub.table {
                    continue;
                }
                let visible = change
                    .scope_payload()
                    .map(|payload| verdict.matches_json(payload))
                    .unwrap_or(false);
                if visible {
                    filtered.push((stored_commit.commit_seq, change.clone()));
                }
            }
        }

        let commits = if dedupe_rows {
            dedupe_by_row(filtered)
        } else {
            group_by_commit(filtered)
        };

        Ok(PullOutcome::Active {
            commits,
            next_cursor,
        })
    }
}

fn group_by_commit(changes: Vec<(CommitSeq, Change)>) -> Vec<Commit> {
    let mut by_commit: BTreeMap<CommitSeq, Vec<Change>> = BTreeMap::new();
    for (commit_seq, change) in changes {
        by_commit.entry(commit_seq).or_default().push(change);
    }
    by_commit
        .into_iter()
        .map(|(commit_seq, changes)| Commit {
            commit_seq,
            changes,
        })
        .collect()
}

/// Keep only the latest change per `(table, row_id)` within the window,
/// reported under the commit_seq in which that row last appeared (§4.4 step
/// 4). Insertion order within the surviving commit is preserved by the
/// ascending scan order above.
fn dedupe_by_row(changes: Vec<(CommitSeq, Change)>) -> Vec<Commit> {
    let mut latest: BTreeMap<(TableName, RowId), (CommitSeq, Change)> = BTreeMap::new();
    for (commit_seq, change) in changes {
        latest.insert((change.table.clone(), change.row_id.clone()), (commit_seq, change));
    }
    group_by_commit(latest.into_values().collect())
}
