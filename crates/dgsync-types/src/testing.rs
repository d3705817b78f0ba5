//! Property-test helpers for downstream crates, ported from the teacher's
//! `crates/convex/sync_types/src/testing.rs`. Gated behind the `testing`
//! feature so `proptest`/`proptest-derive` never leak into a normal build.

use proptest::prelude::*;
use serde_json::Value as JsonValue;

/// Arbitrary JSON values for fuzzing row payloads, scope maps and the like.
/// Bounded recursion depth/width keeps generated cases small enough to stay
/// fast under the default proptest case count.
pub fn arb_json() -> impl Strategy<Value = JsonValue> {
    let leaf = prop_oneof![
        Just(JsonValue::Null),
        any::<bool>().prop_map(JsonValue::Bool),
        any::<i64>().prop_map(|v| JsonValue::Number(v.into())),
        ".*".prop_map(JsonValue::String),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(JsonValue::Array),
            prop::collection::hash_map(".*", inner, 0..8).prop_map(|m| JsonValue::Object(m.into_iter().collect())),
        ]
    })
}
