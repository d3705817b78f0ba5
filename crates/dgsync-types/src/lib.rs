//! Wire protocol types for the dgsync push/pull/bootstrap/snapshot protocol.
//!
//! These are plain, transport-agnostic data types: no IO, no persistence.
//! Both `dgsync-server` and `dgsync-client` depend on this crate so the two
//! sides of the protocol cannot drift apart. Tagged unions are used in place
//! of ad hoc `status: String` fields wherever the original spec's JSON shape
//! allowed distinguishable cases, per the "tagged unions for operations and
//! responses" design note.

mod change;
mod chunk;
pub mod chunk_codec;
mod operation;
mod pull;
mod push;
mod scope;
#[cfg(feature = "testing")]
pub mod testing;

pub use change::{
    Change,
    ChangeOp,
    Commit,
};
pub use chunk::{
    ChunkFrame,
    ChunkRef,
};
pub use operation::Operation;
pub use pull::{
    BootstrapInfo,
    PullOutcome,
    PullRequest,
    PullResponse,
    SubscriptionPullResult,
    SubscriptionRequest,
};
pub use push::{
    PushRequest,
    PushResponse,
    Rejection,
};
pub use scope::{
    ScopeMap,
    ScopeVerdict,
};

/// Server-assigned, strictly increasing per-partition sequence number. Zero
/// is a valid value (the sequence before any commit has landed); cursors use
/// it as their "nothing pulled yet" initial value.
pub type CommitSeq = u64;

pub type ClientId = String;
pub type ClientCommitId = String;
pub type ActorId = String;
pub type PartitionId = String;
pub type TableName = String;
pub type RowId = String;
pub type SubscriptionId = String;

/// Schema version of the outbox entry's operations payload, carried so the
/// server (or a future version of it) can reject an operation set it no
/// longer knows how to interpret rather than silently misapplying it.
pub type SchemaVersion = u32;
