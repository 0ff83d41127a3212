//! Messaging substrate errors.
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// An error occurring in the messaging substrate.
///
/// Errors that travel inside [`crate::Event`] values cross thread boundaries,
/// so underlying I/O errors are shared behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum CommError {
    /// No connection is established to the requested address.
    #[error("not connected")]
    NotConnected,

    /// The connection dropped before the operation completed.
    #[error("broken connection")]
    BrokenConnection,

    /// A connection to this address is already installed.
    #[error("already connected")]
    AlreadyConnected,

    /// The proxy name could not be resolved to an endpoint.
    #[error("invalid proxy name: {0}")]
    InvalidProxy(String),

    /// Socket creation failed.
    #[error("socket error: {0}")]
    Socket(#[source] Arc<io::Error>),

    /// Binding the local address failed.
    #[error("bind error: {0}")]
    Bind(#[source] Arc<io::Error>),

    /// The connect attempt failed before a handler was installed.
    #[error("connect error: {0}")]
    Connect(#[source] Arc<io::Error>),

    /// Registering the descriptor with a reactor failed.
    #[error("poll registration error: {0}")]
    Poll(#[source] Arc<io::Error>),

    /// No response arrived within the request timeout.
    #[error("request timeout")]
    RequestTimeout,

    /// The peer closed the connection mid-frame.
    #[error("response truncated")]
    ResponseTruncated,

    /// The frame violated the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Sending on the socket failed.
    #[error("send error: {0}")]
    Send(#[source] Arc<io::Error>),

    /// The component is shutting down and no longer accepts work.
    #[error("shutting down")]
    Shutdown,
}

impl CommError {
    pub(crate) fn socket(err: io::Error) -> Self {
        Self::Socket(Arc::new(err))
    }

    pub(crate) fn bind(err: io::Error) -> Self {
        Self::Bind(Arc::new(err))
    }

    pub(crate) fn connect(err: io::Error) -> Self {
        Self::Connect(Arc::new(err))
    }

    pub(crate) fn send(err: io::Error) -> Self {
        Self::Send(Arc::new(err))
    }
}
