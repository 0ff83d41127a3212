//! Events delivered to dispatch handlers.
use std::fmt;
use std::net::SocketAddr;

use quartz_codec::Decoder;

use crate::error::CommError;
use crate::header::CommHeader;

/// Kind of event delivered to a dispatch handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A connection was established.
    ConnectionEstablished,
    /// A connection dropped. Delivered exactly once per connection.
    Disconnect,
    /// A complete message arrived, or a synthesized request failure.
    Message,
    /// A timer registered with the timer reactor expired.
    Timer,
    /// A socket-level error that is not tied to a connection lifecycle.
    Error,
}

/// An event delivered to a dispatch handler by a reactor thread.
///
/// Events are shared as `Arc<Event>`; the payload is owned by the event and
/// immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Peer address the event originated from.
    pub addr: Option<SocketAddr>,
    /// Local address of the socket involved.
    pub local_addr: Option<SocketAddr>,
    /// Error carried by the event; inspected before the payload.
    pub error: Option<CommError>,
    /// Decoded header for `Message` events.
    pub header: CommHeader,
    pub payload: Vec<u8>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            addr: None,
            local_addr: None,
            error: None,
            header: CommHeader::default(),
            payload: Vec::new(),
        }
    }

    pub fn connection_established(addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            addr: Some(addr),
            local_addr: Some(local_addr),
            ..Self::new(EventKind::ConnectionEstablished)
        }
    }

    pub fn disconnect(addr: SocketAddr, error: Option<CommError>) -> Self {
        Self {
            addr: Some(addr),
            error,
            ..Self::new(EventKind::Disconnect)
        }
    }

    pub fn message(
        addr: SocketAddr,
        local_addr: SocketAddr,
        header: CommHeader,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            addr: Some(addr),
            local_addr: Some(local_addr),
            header,
            payload,
            ..Self::new(EventKind::Message)
        }
    }

    /// A synthesized `Message` event standing in for a request that cannot
    /// complete (timeout, broken connection).
    pub fn request_failure(addr: SocketAddr, id: u32, error: CommError) -> Self {
        let mut header = CommHeader::default();
        header.id = id;
        Self {
            addr: Some(addr),
            error: Some(error),
            header,
            ..Self::new(EventKind::Message)
        }
    }

    pub fn timer() -> Self {
        Self::new(EventKind::Timer)
    }

    /// Service-level response code: the leading i32 of a response payload.
    ///
    /// Returns `Protocol` if the payload is too short to carry one.
    pub fn response_code(&self) -> Result<i32, CommError> {
        Decoder::new(&self.payload)
            .read_i32()
            .map_err(|_| CommError::Protocol("response payload missing error code".into()))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EventKind::ConnectionEstablished => write!(f, "Event: type=CONNECTION_ESTABLISHED")?,
            EventKind::Disconnect => write!(f, "Event: type=DISCONNECT")?,
            EventKind::Message => write!(
                f,
                "Event: type=MESSAGE id={} gid={} command={} total_len={}",
                self.header.id, self.header.gid, self.header.command, self.header.total_len
            )?,
            EventKind::Timer => write!(f, "Event: type=TIMER")?,
            EventKind::Error => write!(f, "Event: type=ERROR")?,
        }
        if let Some(addr) = self.addr {
            write!(f, " from={addr}")?;
        }
        if let Some(err) = &self.error {
            write!(f, " error=\"{err}\"")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_code_reads_leading_i32() {
        let mut event = Event::new(EventKind::Message);
        event.payload = vec![0, 0, 0, 0, 1, 2, 3];
        assert_eq!(event.response_code().unwrap(), 0);

        event.payload = 5i32.to_le_bytes().to_vec();
        assert_eq!(event.response_code().unwrap(), 5);

        event.payload = vec![1, 2];
        assert!(event.response_code().is_err());
    }

    #[test]
    fn display_includes_error() {
        let event = Event::disconnect(
            "127.0.0.1:4000".parse().unwrap(),
            Some(CommError::BrokenConnection),
        );
        let text = event.to_string();
        assert!(text.contains("DISCONNECT"));
        assert!(text.contains("broken connection"));
    }
}
