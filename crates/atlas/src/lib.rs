//! Coordination service client.
//!
//! A session-oriented, callback-driven client for the hierarchical
//! named-node coordination service: node handles, exclusive/shared locks
//! with fencing sequencers, extended attributes, and event notifications,
//! all under a lease kept alive by periodic datagrams. Lost contact moves
//! the session through jeopardy to expiry.
pub mod error;
pub mod protocol;
pub mod session;
pub mod types;

pub use error::AtlasError;
pub use session::{
    Session, SessionCallback, SessionConfig, SessionState, DEFAULT_GRACE_PERIOD_MS,
    DEFAULT_LEASE_MS, TIMER_INTERVAL_MS,
};
pub use types::{
    Attribute, DirEntry, DirEntryAttr, HandleCallback, LockMode, LockSequencer, LockStatus,
    NodeEvent, PathEntryAttr,
};
