//! Reference plugins proving `dgsync-client`'s plugin seam (§4.10). Real
//! encryption and CRDT merge logic are explicit Non-goals (§1); these are
//! thin passthroughs that preserve the wire contract the core guarantees.

pub mod crdt;
pub mod e2ee;

pub use crdt::CrdtStatePlugin;
pub use e2ee::FieldSentinelPlugin;
