//! Pull applicator (C9): applies an `Active` pull outcome's commits to local
//! rows, running the plugin pipeline on each commit's changes first.

use std::sync::Arc;

use dgsync_types::{
    Commit,
    CommitSeq,
    SubscriptionId,
    TableName,
};
use tracing::instrument;

use crate::{
    plugin::PluginPipeline,
    store::LocalStore,
};

pub struct PullApplicator<S> {
    store: Arc<S>,
    plugins: PluginPipeline,
}

impl<S> PullApplicator<S>
where
    S: LocalStore,
{
    pub fn new(store: Arc<S>, plugins: PluginPipeline) -> Self {
        Self { store, plugins }
    }

    /// Applies one pull window's commits in order, one transaction per
    /// commit (§4.9). A plugin failure on any commit aborts the remaining
    /// commits in this window: earlier commits are already durably applied,
    /// the cursor sits at the last success, and the caller retries the pull.
    #[instrument(skip(self, commits))]
    pub async fn apply_active(
        &self,
        subscription_id: &SubscriptionId,
        table: &TableName,
        commits: Vec<Commit>,
        next_cursor: CommitSeq,
    ) -> anyhow::Result<()> {
        let mut last_applied_cursor = None;
        for commit in commits {
            let mut changes = commit.changes;
            self.plugins.after_pull(&mut changes).await?;
            self.store
                .apply_commit(subscription_id, table, changes, commit.commit_seq)
                .await?;
            last_applied_cursor = Some(commit.commit_seq);
        }
        // next_cursor can be ahead of the last change-bearing commit when
        // trailing commits were emptied by compaction (§4.4 step 4); the
        // cursor must still advance past them.
        if last_applied_cursor != Some(next_cursor) {
            self.store.advance_cursor(subscription_id, next_cursor).await?;
        }
        Ok(())
    }
}
