//! Outbound frame builder.
use quartz_codec as codec;

use crate::checksum::fletcher32;
use crate::header::{CommHeader, FLAGS_BIT_PAYLOAD_CHECKSUM, HEADER_LENGTH};

/// A two-phase outbound frame builder.
///
/// Callers construct the buffer with a header and expected payload capacity,
/// append payload fields through the typed `append_*` operations, and hand
/// the buffer to the sending path, which stamps `total_len` and the
/// checksums at encode time.
#[derive(Debug, Clone)]
pub struct CommBuf {
    pub header: CommHeader,
    payload: Vec<u8>,
}

impl CommBuf {
    /// Create a buffer for `header` with room for `capacity` payload bytes.
    pub fn new(header: CommHeader, capacity: usize) -> Self {
        Self {
            header,
            payload: Vec::with_capacity(capacity),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn append_u8(&mut self, v: u8) {
        codec::encode_u8(&mut self.payload, v);
    }

    pub fn append_bool(&mut self, v: bool) {
        codec::encode_bool(&mut self.payload, v);
    }

    pub fn append_u16(&mut self, v: u16) {
        codec::encode_u16(&mut self.payload, v);
    }

    pub fn append_i32(&mut self, v: i32) {
        codec::encode_i32(&mut self.payload, v);
    }

    pub fn append_u32(&mut self, v: u32) {
        codec::encode_u32(&mut self.payload, v);
    }

    pub fn append_i64(&mut self, v: i64) {
        codec::encode_i64(&mut self.payload, v);
    }

    pub fn append_u64(&mut self, v: u64) {
        codec::encode_u64(&mut self.payload, v);
    }

    pub fn append_vstr(&mut self, v: &str) {
        codec::encode_vstr(&mut self.payload, v);
    }

    pub fn append_vbytes(&mut self, v: &[u8]) {
        codec::encode_vbytes(&mut self.payload, v);
    }

    /// Append raw bytes with no length prefix.
    pub fn append_bytes(&mut self, v: &[u8]) {
        self.payload.extend_from_slice(v);
    }

    /// Finalize the frame: stamp `total_len`, the optional payload checksum
    /// and the header checksum, and return the wire bytes.
    pub fn encode(&mut self) -> Vec<u8> {
        self.header.total_len = (HEADER_LENGTH + self.payload.len()) as u32;
        self.header.payload_checksum = if self.header.flags & FLAGS_BIT_PAYLOAD_CHECKSUM != 0 {
            fletcher32(&self.payload)
        } else {
            0
        };

        let mut wire = Vec::with_capacity(HEADER_LENGTH + self.payload.len());
        self.header.encode(&mut wire);
        wire.extend_from_slice(&self.payload);
        wire
    }
}
