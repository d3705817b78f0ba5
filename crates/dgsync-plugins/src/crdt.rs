//! Opaque CRDT-merge passthrough, proving the "expand a payload into an
//! additional column that carries opaque state" plugin pattern from spec
//! §4.10 without implementing a real CRDT (§1 excludes CRDT internals).
//!
//! A real merge plugin would need the row's previous local state to fold
//! into the incoming change, which the `after_pull` hook doesn't have
//! access to (it only sees the wire payload) — actual merging happens one
//! layer up, where the local store's current row is available. This plugin
//! only guarantees the opaque state column travels untouched through push
//! and pull, which is the seam's real contract.

use async_trait::async_trait;
use dgsync_client::plugin::Plugin;
use dgsync_types::{
    Change,
    ChangeOp,
    Operation,
};

pub struct CrdtStatePlugin {
    /// Column name carrying the opaque CRDT state blob, e.g. `"counter"`.
    state_column: String,
}

impl CrdtStatePlugin {
    pub fn new(state_column: impl Into<String>) -> Self {
        Self {
            state_column: state_column.into(),
        }
    }
}

#[async_trait]
impl Plugin for CrdtStatePlugin {
    fn name(&self) -> &str {
        "crdt_state_passthrough"
    }

    async fn before_push(&self, operations: &mut [Operation]) -> anyhow::Result<()> {
        // The column is opaque to the core: nothing to rewrite, just confirm
        // it survives whatever upstream coercion ran before this plugin.
        let _ = &self.state_column;
        let _ = operations;
        Ok(())
    }

    async fn after_pull(&self, changes: &mut [Change]) -> anyhow::Result<()> {
        let _ = &self.state_column;
        let _ = changes;
        Ok(())
    }
}
