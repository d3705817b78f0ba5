//! Plugin pipeline (C10): ordered transformers over push operations and
//! pull changes. Kept deliberately narrow — the core only guarantees
//! ordering and all-or-nothing failure, never interprets what a plugin does
//! to a payload.

use async_trait::async_trait;
use dgsync_errors::ErrorMetadata;
use dgsync_types::{
    Change,
    Operation,
};

/// One stage of the pipeline. Implementations rewrite payload fields in
/// place (encrypt/decrypt a column, fold in opaque CRDT state) or return an
/// error to veto the whole unit of work.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn before_push(&self, operations: &mut [Operation]) -> anyhow::Result<()> {
        let _ = operations;
        Ok(())
    }

    async fn after_pull(&self, changes: &mut [Change]) -> anyhow::Result<()> {
        let _ = changes;
        Ok(())
    }
}

/// Ordered chain of plugins. Operations/changes are handed to each plugin in
/// registration order; a failure anywhere aborts the remainder of the chain
/// and is tagged `PluginFailure` so callers can distinguish it from a
/// transport or conflict error.
#[derive(Default, Clone)]
pub struct PluginPipeline {
    plugins: Vec<std::sync::Arc<dyn Plugin>>,
}

impl PluginPipeline {
    pub fn new(plugins: Vec<std::sync::Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub async fn before_push(&self, operations: &mut Vec<Operation>) -> anyhow::Result<()> {
        for plugin in &self.plugins {
            plugin
                .before_push(operations)
                .await
                .map_err(|e| e.context(ErrorMetadata::plugin_failure(format!("{} failed in before_push", plugin.name()))))?;
        }
        Ok(())
    }

    pub async fn after_pull(&self, changes: &mut Vec<Change>) -> anyhow::Result<()> {
        for plugin in &self.plugins {
            plugin
                .after_pull(changes)
                .await
                .map_err(|e| e.context(ErrorMetadata::plugin_failure(format!("{} failed in after_pull", plugin.name()))))?;
        }
        Ok(())
    }
}
