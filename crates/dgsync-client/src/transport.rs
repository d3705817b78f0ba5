//! The client's network seam. Deliberately narrow — framing the sync
//! endpoint named in spec §6 as an HTTP request is a Non-goal of this core;
//! a binary embedding it supplies the `Transport` and owns the wire framing.

use async_trait::async_trait;
use dgsync_types::{
    PullRequest,
    PullResponse,
    PushRequest,
    PushResponse,
};

#[async_trait]
pub trait Transport: Send + Sync {
    async fn push(&self, request: PushRequest) -> anyhow::Result<PushResponse>;
    async fn pull(&self, request: PullRequest) -> anyhow::Result<PullResponse>;
    async fn fetch_chunk(&self, chunk_id: &str) -> anyhow::Result<Vec<u8>>;
}
