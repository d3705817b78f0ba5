use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::{
    CommitSeq,
    RowId,
};

/// Reference to a bootstrap snapshot chunk, returned inline in the pull
/// response's `bootstrap` field. The body itself is fetched separately from
/// `snapshot_chunks/<chunk_id>` and checked against `hash` before any row in
/// it is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    /// Hex-encoded content hash of the chunk body (sha256).
    pub hash: String,
    pub row_count: u32,
}

/// One framed row inside a decoded chunk body. The wire body is a
/// self-delimiting sequence of these, gzip-wrapped; see
/// `dgsync_server::bootstrap` for the encoder and `dgsync_client::store` for
/// the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkFrame {
    pub row_id: RowId,
    pub row_json: JsonValue,
    pub server_version: CommitSeq,
}
