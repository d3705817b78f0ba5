//! Field-encryption sentinel passthrough, proving the plugin seam rather
//! than implementing real cryptography (§1 excludes encryption internals).
//!
//! `before_push` wraps configured fields with the `dgsync:e2ee:1:` marker if
//! they aren't already wrapped; `after_pull` unwraps it. The core never
//! inspects the wrapped bytes, so a real implementation only needs to swap
//! the wrap/unwrap functions for genuine encrypt/decrypt calls.

use async_trait::async_trait;
use dgsync_client::plugin::Plugin;
use dgsync_types::{
    Change,
    ChangeOp,
    Operation,
};
use serde_json::Value as JsonValue;

const SENTINEL: &str = "dgsync:e2ee:1:";

fn wrap(value: &JsonValue) -> Option<JsonValue> {
    let s = value.as_str()?;
    if s.starts_with(SENTINEL) {
        return None;
    }
    Some(JsonValue::String(format!("{SENTINEL}{}", base64_encode(s.as_bytes()))))
}

fn unwrap(value: &JsonValue) -> Option<JsonValue> {
    let s = value.as_str()?;
    let encoded = s.strip_prefix(SENTINEL)?;
    let bytes = base64_decode(encoded)?;
    let plain = String::from_utf8(bytes).ok()?;
    Some(JsonValue::String(plain))
}

/// Minimal base64 codec so this crate doesn't need a dedicated dependency
/// for a passthrough plugin; a real field-encryption plugin would replace
/// this wholesale with its cipher's own framing.
fn base64_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 {
            ALPHABET[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 { ALPHABET[(b2 & 0x3f) as usize] as char } else { '=' });
    }
    out
}

fn base64_decode(s: &str) -> Option<Vec<u8>> {
    fn index(c: u8) -> Option<u8> {
        match c {
            b'A'..=b'Z' => Some(c - b'A'),
            b'a'..=b'z' => Some(c - b'a' + 26),
            b'0'..=b'9' => Some(c - b'0' + 52),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let s = s.trim_end_matches('=');
    let mut out = Vec::with_capacity(s.len() * 3 / 4);
    let bytes: Vec<u8> = s.bytes().collect();
    for chunk in bytes.chunks(4) {
        let vals: Vec<u8> = chunk.iter().map(|&c| index(c)).collect::<Option<_>>()?;
        out.push((vals[0] << 2) | (vals.get(1).copied().unwrap_or(0) >> 4));
        if vals.len() > 2 {
            out.push((vals[1] << 4) | (vals[2] >> 2));
        }
        if vals.len() > 3 {
            out.push((vals[2] << 6) | vals[3]);
        }
    }
    Some(out)
}

pub struct FieldSentinelPlugin {
    fields: Vec<String>,
}

impl FieldSentinelPlugin {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl Plugin for FieldSentinelPlugin {
    fn name(&self) -> &str {
        "field_sentinel_e2ee"
    }

    async fn before_push(&self, operations: &mut [Operation]) -> anyhow::Result<()> {
        for op in operations {
            if let Operation::Upsert { payload, .. } = op {
                if let Some(obj) = payload.as_object_mut() {
                    for field in &self.fields {
                        if let Some(value) = obj.get(field) {
                            if let Some(wrapped) = wrap(value) {
                                obj.insert(field.clone(), wrapped);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn after_pull(&self, changes: &mut [Change]) -> anyhow::Result<()> {
        for change in changes {
            if let ChangeOp::Upsert { row_json, .. } = &mut change.op {
                if let Some(obj) = row_json.as_object_mut() {
                    for field in &self.fields {
                        if let Some(value) = obj.get(field) {
                            if let Some(unwrapped) = unwrap(value) {
                                obj.insert(field.clone(), unwrapped);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn before_push_wraps_configured_field_only() {
        let plugin = FieldSentinelPlugin::new(vec!["ssn".to_string()]);
        let mut ops = vec![Operation::Upsert {
            table: "people".into(),
            row_id: "p1".into(),
            payload: json!({"ssn": "123-45-6789", "name": "Ada"}),
            base_version: None,
        }];
        plugin.before_push(&mut ops).await.unwrap();
        let Operation::Upsert { payload, .. } = &ops[0] else {
            panic!("expected upsert");
        };
        assert!(payload["ssn"].as_str().unwrap().starts_with(SENTINEL));
        assert_eq!(payload["name"], "Ada");
    }

    #[tokio::test]
    async fn push_then_pull_round_trips_byte_exact() {
        let plugin = FieldSentinelPlugin::new(vec!["ssn".to_string()]);
        let mut ops = vec![Operation::Upsert {
            table: "people".into(),
            row_id: "p1".into(),
            payload: json!({"ssn": "123-45-6789"}),
            base_version: None,
        }];
        plugin.before_push(&mut ops).await.unwrap();
        let Operation::Upsert { payload, .. } = ops.into_iter().next().unwrap() else {
            unreachable!()
        };

        let mut changes = vec![Change::upsert("people", "p1", payload, 1)];
        plugin.after_pull(&mut changes).await.unwrap();
        let ChangeOp::Upsert { row_json, .. } = &changes[0].op else {
            panic!("expected upsert");
        };
        assert_eq!(row_json["ssn"], "123-45-6789");
    }
}
