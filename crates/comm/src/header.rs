//! Fixed-size message header framing every frame on the wire.
use quartz_codec::{encode_u16, encode_u32, encode_u64, encode_u8, Decoder};

use crate::checksum::fletcher32;
use crate::error::CommError;

/// Wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Serialized header length in bytes.
pub const HEADER_LENGTH: usize = 38;

/// Byte offset of the `header_checksum` field within the encoded header.
const CHECKSUM_OFFSET: usize = 6;

/// Message is a request.
pub const FLAGS_BIT_REQUEST: u16 = 0x0001;
/// The sender does not want a response for this request.
pub const FLAGS_BIT_IGNORE_RESPONSE: u16 = 0x0002;
/// Request should bypass normal application-queue ordering.
pub const FLAGS_BIT_URGENT: u16 = 0x0004;
/// Out-of-band proxy map update.
pub const FLAGS_BIT_PROXY_MAP_UPDATE: u16 = 0x4000;
/// `payload_checksum` carries a fletcher32 of the payload.
pub const FLAGS_BIT_PAYLOAD_CHECKSUM: u16 = 0x8000;

/// Header for messages transmitted over the messaging substrate.
///
/// All fields are little-endian on the wire. `header_checksum` is computed
/// over the encoded header with the checksum field zeroed, and is verified
/// before any payload byte is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommHeader {
    /// Payload alignment hint for direct I/O. Zero when unused.
    pub alignment: u16,
    /// Flag bitset, see the `FLAGS_BIT_*` constants.
    pub flags: u16,
    /// Request id; responses echo the id of the request.
    pub id: u32,
    /// Group id for per-group serialization in the application queue.
    /// Zero means unordered.
    pub gid: u32,
    /// Header plus payload length in bytes. Stamped at encode time.
    pub total_len: u32,
    /// Request timeout as understood by the sender.
    pub timeout_ms: u32,
    /// Optional payload checksum; zero unless `FLAGS_BIT_PAYLOAD_CHECKSUM`.
    pub payload_checksum: u32,
    /// Operation code, defined per service.
    pub command: u64,
}

impl CommHeader {
    /// Construct a header for the given command.
    pub fn new(command: u64) -> Self {
        Self {
            command,
            ..Self::default()
        }
    }

    /// Construct a header for a command with a request timeout.
    pub fn with_timeout(command: u64, timeout_ms: u32) -> Self {
        Self {
            command,
            timeout_ms,
            ..Self::default()
        }
    }

    /// Initialize a response header from the request it answers.
    ///
    /// Copies flags, id, gid and command; the REQUEST bit is cleared.
    pub fn initialize_from_request(request: &CommHeader) -> Self {
        Self {
            flags: request.flags & !FLAGS_BIT_REQUEST,
            id: request.id,
            gid: request.gid,
            command: request.command,
            ..Self::default()
        }
    }

    pub fn is_request(&self) -> bool {
        self.flags & FLAGS_BIT_REQUEST != 0
    }

    pub fn is_urgent(&self) -> bool {
        self.flags & FLAGS_BIT_URGENT != 0
    }

    pub fn is_proxy_map_update(&self) -> bool {
        self.flags & FLAGS_BIT_PROXY_MAP_UPDATE != 0
    }

    /// Payload length implied by `total_len`.
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(HEADER_LENGTH)
    }

    /// Encode the header, stamping the header checksum.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let start = buf.len();

        encode_u8(buf, PROTOCOL_VERSION);
        encode_u8(buf, HEADER_LENGTH as u8);
        encode_u16(buf, self.alignment);
        encode_u16(buf, self.flags);
        encode_u32(buf, 0); // header_checksum, patched below
        encode_u32(buf, self.id);
        encode_u32(buf, self.gid);
        encode_u32(buf, self.total_len);
        encode_u32(buf, self.timeout_ms);
        encode_u32(buf, self.payload_checksum);
        encode_u64(buf, self.command);

        let checksum = fletcher32(&buf[start..start + HEADER_LENGTH]);
        buf[start + CHECKSUM_OFFSET..start + CHECKSUM_OFFSET + 4]
            .copy_from_slice(&checksum.to_le_bytes());
    }

    /// Decode and verify a header from the first [`HEADER_LENGTH`] bytes of
    /// `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, CommError> {
        if buf.len() < HEADER_LENGTH {
            return Err(CommError::ResponseTruncated);
        }

        let mut dec = Decoder::new(&buf[..HEADER_LENGTH]);
        let version = dec.read_u8().expect("fixed-size header");
        let header_len = dec.read_u8().expect("fixed-size header");
        let alignment = dec.read_u16().expect("fixed-size header");
        let flags = dec.read_u16().expect("fixed-size header");
        let header_checksum = dec.read_u32().expect("fixed-size header");
        let id = dec.read_u32().expect("fixed-size header");
        let gid = dec.read_u32().expect("fixed-size header");
        let total_len = dec.read_u32().expect("fixed-size header");
        let timeout_ms = dec.read_u32().expect("fixed-size header");
        let payload_checksum = dec.read_u32().expect("fixed-size header");
        let command = dec.read_u64().expect("fixed-size header");

        if version != PROTOCOL_VERSION {
            return Err(CommError::Protocol(format!(
                "unsupported protocol version {version}"
            )));
        }
        if header_len as usize != HEADER_LENGTH {
            return Err(CommError::Protocol(format!(
                "bad header length {header_len}"
            )));
        }

        let mut zeroed = [0u8; HEADER_LENGTH];
        zeroed.copy_from_slice(&buf[..HEADER_LENGTH]);
        zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        let expected = fletcher32(&zeroed);
        if expected != header_checksum {
            return Err(CommError::Protocol(format!(
                "header checksum mismatch: expected {expected:#010x}, got {header_checksum:#010x}"
            )));
        }
        if (total_len as usize) < HEADER_LENGTH {
            return Err(CommError::Protocol(format!(
                "total length {total_len} shorter than header"
            )));
        }

        Ok(Self {
            alignment,
            flags,
            id,
            gid,
            total_len,
            timeout_ms,
            payload_checksum,
            command,
        })
    }
}
