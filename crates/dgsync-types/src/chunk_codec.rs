//! Wire format for a bootstrap chunk body: newline-delimited JSON frames,
//! gzip-wrapped. Shared between the server (encodes) and the client
//! (decodes) so the two can never drift on framing. Per §6, implementations
//! may choose any self-delimiting, checksummable container; this is the
//! reference one.

use std::io::{
    Read,
    Write,
};

use flate2::{
    read::GzDecoder,
    write::GzEncoder,
    Compression,
};
use sha2::{
    Digest,
    Sha256,
};

use crate::ChunkFrame;

pub fn encode_chunk(frames: &[ChunkFrame]) -> anyhow::Result<Vec<u8>> {
    let mut raw = Vec::new();
    for frame in frames {
        serde_json::to_writer(&mut raw, frame)?;
        raw.push(b'\n');
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

pub fn decode_chunk(body: &[u8]) -> anyhow::Result<Vec<ChunkFrame>> {
    let mut decoder = GzDecoder::new(body);
    let mut raw = String::new();
    decoder.read_to_string(&mut raw)?;
    raw.lines()
        .filter(|line| !line.is_empty())
        .map(|line| Ok(serde_json::from_str::<ChunkFrame>(line)?))
        .collect()
}

/// Hex-encoded sha256 of the chunk body exactly as served over the wire
/// (i.e. of the compressed bytes, so a truncated transfer is caught before
/// decompression is even attempted).
pub fn hash_chunk(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    proptest! {
        #[test]
        fn hash_chunk_is_deterministic(body in any::<Vec<u8>>()) {
            let digest = hash_chunk(&body);
            prop_assert_eq!(hash_chunk(&body), digest);
        }

        #[test]
        fn hash_chunk_differs_for_distinct_bodies(a in any::<Vec<u8>>(), b in any::<Vec<u8>>()) {
            if a != b {
                prop_assert_ne!(hash_chunk(&a), hash_chunk(&b));
            }
        }
    }

    #[test]
    fn round_trips_frames_through_encode_decode() {
        let frames = vec![
            ChunkFrame {
                row_id: "t1".into(),
                row_json: json!({"title": "a"}),
                server_version: 1,
            },
            ChunkFrame {
                row_id: "t2".into(),
                row_json: json!({"title": "b"}),
                server_version: 2,
            },
        ];
        let body = encode_chunk(&frames).unwrap();
        let decoded = decode_chunk(&body).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn hash_changes_when_body_is_truncated() {
        let frames = vec![ChunkFrame {
            row_id: "t1".into(),
            row_json: json!({"title": "a"}),
            server_version: 1,
        }];
        let body = encode_chunk(&frames).unwrap();
        let full_hash = hash_chunk(&body);
        let truncated_hash = hash_chunk(&body[..body.len() - 1]);
        assert_ne!(full_hash, truncated_hash);
    }
}
