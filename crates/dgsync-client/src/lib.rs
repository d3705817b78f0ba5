//! Client-side core of the sync engine: durable outbox, subscription state
//! machine, pull applicator, bootstrap consumer and the sync loop that ties
//! them together. Mirrors `dgsync_server`'s shape: a handful of focused
//! components wired together by the embedding application, not a framework.

pub mod applicator;
pub mod backoff;
pub mod bootstrap_client;
pub mod clock;
pub mod conflict;
pub mod outbox;
pub mod plugin;
pub mod store;
pub mod subscription;
pub mod sync_loop;
pub mod transport;

pub use applicator::PullApplicator;
pub use backoff::Backoff;
pub use bootstrap_client::BootstrapClient;
pub use conflict::ConflictRecord;
pub use outbox::Outbox;
pub use plugin::{
    Plugin,
    PluginPipeline,
};
pub use store::{
    LocalStore,
    MemoryStore,
    SqliteStore,
    SubscriptionState,
    SubscriptionStatus,
};
pub use subscription::SubscriptionStateMachine;
pub use sync_loop::{
    SyncLoop,
    SyncLoopConfig,
};
pub use transport::Transport;
