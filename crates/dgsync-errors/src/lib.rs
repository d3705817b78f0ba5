//! Error classification shared across the sync core.
//!
//! Internal functions propagate failures as plain `anyhow::Error`. When a
//! failure needs to cross a boundary that some caller (a transport, a test,
//! a UI) must react to by *kind* rather than by message, it is tagged with
//! an [`ErrorMetadata`] via `anyhow::Context::context`. The `code` field is
//! the stable thing to match on; `short_msg` is a ScreamingCamelCase tag
//! usable in tests and logs; `msg` is the human-facing detail.

use std::borrow::Cow;

use serde::Serialize;

/// `ErrorMetadata` is attached to an `anyhow` error chain via
/// `.context(e /* ErrorMetadata */)`. Use `find_error_metadata` to recover
/// it from an error chain at the boundary that needs to classify the
/// failure.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq, Serialize)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, stable across copy changes to `msg`.
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

/// The error taxonomy from the sync spec (§7), plus the generic
/// request-boundary codes every component eventually needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    /// Push: base-version mismatch on an upsert/delete.
    RowConflict,
    /// Push: base-version supplied but the row is absent.
    RowMissing,
    /// Push: operation targeted a row outside the actor's effective scope
    /// in a way that could not be silently coerced.
    ScopeViolation,
    /// Pull: the scope resolver found no overlap for this subscription.
    SubscriptionRevoked,
    /// Pull: cursor is outside the retained range; client must bootstrap.
    ForceBootstrap,
    /// Network/timeout; caller should retry with backoff.
    TransportFailure,
    /// Snapshot chunk hash mismatch or malformed frame.
    IntegrityFailure,
    /// A plugin's `before_push`/`after_pull` hook failed or vetoed.
    PluginFailure,

    BadRequest,
    NotFound,
    Overloaded,
}

impl ErrorMetadata {
    fn new(
        code: ErrorCode,
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn row_conflict(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::RowConflict, "RowConflict", msg)
    }

    pub fn row_missing(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::RowMissing, "RowMissing", msg)
    }

    pub fn scope_violation(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ScopeViolation, "ScopeViolation", msg)
    }

    pub fn subscription_revoked(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::SubscriptionRevoked, "SubscriptionRevoked", msg)
    }

    pub fn force_bootstrap(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ForceBootstrap, "ForceBootstrap", msg)
    }

    pub fn transport_failure(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::TransportFailure, "TransportFailure", msg)
    }

    pub fn integrity_failure(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::IntegrityFailure, "IntegrityFailure", msg)
    }

    pub fn plugin_failure(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::PluginFailure, "PluginFailure", msg)
    }

    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(ErrorCode::BadRequest, short_msg, msg)
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::new(ErrorCode::NotFound, short_msg, msg)
    }

    pub fn overloaded(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Overloaded, "Overloaded", msg)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

/// Walk an `anyhow` error chain looking for `ErrorMetadata`. Boundaries
/// (the push/pull request handlers, the client's sync loop) use this to
/// decide how to respond rather than matching on error text.
pub fn find_error_metadata(err: &anyhow::Error) -> Option<&ErrorMetadata> {
    err.chain().find_map(|cause| cause.downcast_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_anyhow_context() {
        let err = anyhow::anyhow!("base version mismatch")
            .context(ErrorMetadata::row_conflict("base_version stale for t1"));
        let found = find_error_metadata(&err).expect("metadata should be recoverable");
        assert_eq!(found.code(), ErrorCode::RowConflict);
        assert_eq!(found.short_msg, "RowConflict");
    }

    #[test]
    fn missing_metadata_returns_none() {
        let err = anyhow::anyhow!("plain failure");
        assert!(find_error_metadata(&err).is_none());
    }
}
