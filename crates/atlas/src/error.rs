//! Coordination service errors.
use thiserror::Error;

use quartz_comm::CommError;

/// Service-level error codes carried in the leading i32 of every response
/// payload.
pub mod code {
    pub const OK: i32 = 0;
    pub const PROTOCOL_ERROR: i32 = 1;
    pub const BAD_PATHNAME: i32 = 2;
    pub const NO_SUCH_NODE: i32 = 3;
    pub const NODE_EXISTS: i32 = 4;
    pub const ATTR_NOT_FOUND: i32 = 5;
    pub const NOT_DIRECTORY: i32 = 6;
    pub const IS_DIRECTORY: i32 = 7;
    pub const LOCK_CONFLICT: i32 = 8;
    pub const MODE_RESTRICTION: i32 = 9;
    pub const SESSION_EXPIRED: i32 = 10;
    pub const NOT_MASTER: i32 = 11;
    pub const VERSION_MISMATCH: i32 = 12;
    pub const BAD_SEQUENCER: i32 = 13;
    pub const NODE_NOT_LOCKED: i32 = 14;
}

/// An error from the coordination client.
#[derive(Error, Debug, Clone)]
pub enum AtlasError {
    #[error("protocol error")]
    Protocol,
    #[error("bad pathname")]
    BadPathname,
    #[error("no such node")]
    NoSuchNode,
    #[error("node exists")]
    NodeExists,
    #[error("attribute not found")]
    AttrNotFound,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("lock conflict")]
    LockConflict,
    #[error("open mode restriction")]
    ModeRestriction,
    #[error("session expired")]
    SessionExpired,
    #[error("peer is no longer the master")]
    NotMaster,
    #[error("client/server version mismatch")]
    VersionMismatch,
    #[error("sequencer is no longer valid")]
    BadSequencer,
    #[error("node is not locked")]
    NodeNotLocked,
    /// An unrecognized service error code.
    #[error("service error {0}")]
    Service(i32),
    /// A transport-level failure.
    #[error(transparent)]
    Comm(#[from] CommError),
}

impl AtlasError {
    /// Map a wire error code to an error value. `code::OK` is not an error
    /// and must be handled by the caller.
    pub fn from_code(value: i32) -> Self {
        match value {
            code::PROTOCOL_ERROR => Self::Protocol,
            code::BAD_PATHNAME => Self::BadPathname,
            code::NO_SUCH_NODE => Self::NoSuchNode,
            code::NODE_EXISTS => Self::NodeExists,
            code::ATTR_NOT_FOUND => Self::AttrNotFound,
            code::NOT_DIRECTORY => Self::NotDirectory,
            code::IS_DIRECTORY => Self::IsDirectory,
            code::LOCK_CONFLICT => Self::LockConflict,
            code::MODE_RESTRICTION => Self::ModeRestriction,
            code::SESSION_EXPIRED => Self::SessionExpired,
            code::NOT_MASTER => Self::NotMaster,
            code::VERSION_MISMATCH => Self::VersionMismatch,
            code::BAD_SEQUENCER => Self::BadSequencer,
            code::NODE_NOT_LOCKED => Self::NodeNotLocked,
            other => Self::Service(other),
        }
    }

    /// The wire code for this error.
    pub fn to_code(&self) -> i32 {
        match self {
            Self::Protocol => code::PROTOCOL_ERROR,
            Self::BadPathname => code::BAD_PATHNAME,
            Self::NoSuchNode => code::NO_SUCH_NODE,
            Self::NodeExists => code::NODE_EXISTS,
            Self::AttrNotFound => code::ATTR_NOT_FOUND,
            Self::NotDirectory => code::NOT_DIRECTORY,
            Self::IsDirectory => code::IS_DIRECTORY,
            Self::LockConflict => code::LOCK_CONFLICT,
            Self::ModeRestriction => code::MODE_RESTRICTION,
            Self::SessionExpired => code::SESSION_EXPIRED,
            Self::NotMaster => code::NOT_MASTER,
            Self::VersionMismatch => code::VERSION_MISMATCH,
            Self::BadSequencer => code::BAD_SEQUENCER,
            Self::NodeNotLocked => code::NODE_NOT_LOCKED,
            Self::Service(value) => *value,
            Self::Comm(_) => code::PROTOCOL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for value in 1..=14 {
            assert_eq!(AtlasError::from_code(value).to_code(), value);
        }
        assert_eq!(AtlasError::from_code(99).to_code(), 99);
    }
}
