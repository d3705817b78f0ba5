//! Client-side counterpart of `dgsync_server::bootstrap`: fetches snapshot
//! chunks, verifies their content hash before decoding, applies their rows,
//! and pages through a snapshot until it's consumed.

use std::sync::Arc;

use dgsync_errors::ErrorMetadata;
use dgsync_types::BootstrapInfo;
use tracing::instrument;

use crate::{
    store::{
        LocalStore,
        SubscriptionState,
    },
    subscription::SubscriptionStateMachine,
    transport::Transport,
};

pub struct BootstrapClient<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    subscriptions: SubscriptionStateMachine<S>,
}

impl<S, T> BootstrapClient<S, T>
where
    S: LocalStore,
    T: Transport,
{
    pub fn new(store: Arc<S>, transport: Arc<T>) -> Self {
        Self {
            subscriptions: SubscriptionStateMachine::new(store.clone()),
            store,
            transport,
        }
    }

    /// Fetch and apply every chunk named by `bootstrap`, then (if
    /// `page_token` is exhausted) complete the subscription. Returns the
    /// subscription's new state so the caller can decide whether to request
    /// another page.
    #[instrument(skip(self, current, bootstrap))]
    pub async fn consume_page(
        &self,
        current: &SubscriptionState,
        bootstrap: &BootstrapInfo,
    ) -> anyhow::Result<SubscriptionState> {
        for chunk_ref in &bootstrap.chunks {
            let body = self.transport.fetch_chunk(&chunk_ref.chunk_id).await?;
            let actual_hash = dgsync_types::chunk_codec::hash_chunk(&body);
            if actual_hash != chunk_ref.hash {
                let err = anyhow::anyhow!("chunk hash mismatch for {}", chunk_ref.chunk_id).context(
                    ErrorMetadata::integrity_failure(format!(
                        "chunk {} expected hash {} got {}",
                        chunk_ref.chunk_id, chunk_ref.hash, actual_hash
                    )),
                );
                return Err(err);
            }
            let frames = dgsync_types::chunk_codec::decode_chunk(&body)
                .map_err(|e| e.context(ErrorMetadata::integrity_failure("malformed chunk frame")))?;
            self.store.apply_bootstrap_frames(&current.table, frames).await?;
        }

        if bootstrap.page_token.is_none() {
            self.subscriptions.complete_bootstrap(current, bootstrap.snapshot_commit_seq).await
        } else {
            let updated = SubscriptionState {
                bootstrap_page_token: bootstrap.page_token.clone(),
                ..current.clone()
            };
            self.store.upsert_subscription(updated.clone()).await?;
            Ok(updated)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use dgsync_types::{
        ChunkFrame,
        ChunkRef,
        PullRequest,
        PullResponse,
        PushRequest,
        PushResponse,
    };
    use serde_json::json;

    use super::*;
    use crate::store::{
        MemoryStore,
        SubscriptionStatus,
    };

    struct ChunkOnlyTransport {
        body: Vec<u8>,
    }

    #[async_trait]
    impl Transport for ChunkOnlyTransport {
        async fn push(&self, _request: PushRequest) -> anyhow::Result<PushResponse> {
            unreachable!("not exercised by this test")
        }

        async fn pull(&self, _request: PullRequest) -> anyhow::Result<PullResponse> {
            unreachable!("not exercised by this test")
        }

        async fn fetch_chunk(&self, _chunk_id: &str) -> anyhow::Result<Vec<u8>> {
            Ok(self.body.clone())
        }
    }

    #[tokio::test]
    async fn consume_single_page_completes_bootstrap() {
        let frames = vec![ChunkFrame {
            row_id: "t1".into(),
            row_json: json!({"title": "hi"}),
            server_version: 1,
        }];
        let body = dgsync_types::chunk_codec::encode_chunk(&frames).unwrap();
        let hash = dgsync_types::chunk_codec::hash_chunk(&body);

        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ChunkOnlyTransport { body });
        let client = BootstrapClient::new(store.clone(), transport);
        let current = SubscriptionState {
            state_id: "s1".into(),
            subscription_id: "sub1".into(),
            table: "tasks".into(),
            scopes: Default::default(),
            params: None,
            cursor: 0,
            status: SubscriptionStatus::Bootstrapping,
            bootstrap_page_token: None,
        };

        let updated = client
            .consume_page(
                &current,
                &BootstrapInfo {
                    chunks: vec![ChunkRef {
                        chunk_id: "chunk1".into(),
                        hash,
                        row_count: 1,
                    }],
                    page_token: None,
                    snapshot_commit_seq: 5,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, SubscriptionStatus::Active);
        assert_eq!(updated.cursor, 5);
        let rows = store.all_rows(&"tasks".to_string()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn hash_mismatch_is_tagged_integrity_failure() {
        let body = b"not the right bytes".to_vec();
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ChunkOnlyTransport { body });
        let client = BootstrapClient::new(store, transport);
        let current = SubscriptionState {
            state_id: "s1".into(),
            subscription_id: "sub1".into(),
            table: "tasks".into(),
            scopes: Default::default(),
            params: None,
            cursor: 0,
            status: SubscriptionStatus::Bootstrapping,
            bootstrap_page_token: None,
        };
        let err = client
            .consume_page(
                &current,
                &BootstrapInfo {
                    chunks: vec![ChunkRef {
                        chunk_id: "chunk1".into(),
                        hash: "deadbeef".into(),
                        row_count: 0,
                    }],
                    page_token: None,
                    snapshot_commit_seq: 1,
                },
            )
            .await
            .unwrap_err();
        let meta = dgsync_errors::find_error_metadata(&err).unwrap();
        assert_eq!(meta.code(), dgsync_errors::ErrorCode::IntegrityFailure);
    }
}
