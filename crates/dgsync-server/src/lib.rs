//! Server-side core of the sync engine: commit log persistence, push/pull
//! handling, bootstrap snapshots and background maintenance. Mirrors the
//! shape of the teacher's `crates/sync` worker: a handful of focused
//! components wired together by the embedding service, not a framework.

pub mod bootstrap;
pub mod clock;
pub mod compaction;
pub mod persistence;
pub mod pull;
pub mod push;
pub mod scope_resolver;

pub use bootstrap::BootstrapEngine;
pub use compaction::{
    CompactionConfig,
    MaintenanceCoordinator,
    MaintenanceReport,
};
pub use persistence::{
    MemoryPersistence,
    Persistence,
    SqlitePersistence,
};
pub use pull::PullEngine;
pub use push::PushHandler;
pub use scope_resolver::{
    OwnerScopedResolver,
    ScopeResolver,
};
