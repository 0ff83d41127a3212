//! Request message builders for the coordination service protocol.
//!
//! Every request is a [`CommBuf`] whose header command is one of the
//! `COMMAND_*` opcodes. Handle-addressed requests set the header group id
//! to the XOR of the handle's halves so that operations against one handle
//! serialize in the server's application queue; path-addressed requests
//! hash the path instead.
use quartz_codec::vstr_len;
use quartz_comm::header::FLAGS_BIT_URGENT;
use quartz_comm::{fletcher32, CommBuf, CommHeader};

use crate::types::{Attribute, LockMode, LockSequencer};

/// Client/server protocol version, negotiated in `open`.
pub const VERSION: u32 = 0xf000_0002;

pub const COMMAND_KEEPALIVE: u64 = 0;
pub const COMMAND_HANDSHAKE: u64 = 1;
pub const COMMAND_OPEN: u64 = 2;
pub const COMMAND_STAT: u64 = 3;
pub const COMMAND_CANCEL: u64 = 4;
pub const COMMAND_CLOSE: u64 = 5;
pub const COMMAND_POISON: u64 = 6;
pub const COMMAND_MKDIR: u64 = 7;
pub const COMMAND_ATTRSET: u64 = 8;
pub const COMMAND_ATTRGET: u64 = 9;
pub const COMMAND_ATTRDEL: u64 = 10;
pub const COMMAND_ATTREXISTS: u64 = 11;
pub const COMMAND_ATTRLIST: u64 = 12;
pub const COMMAND_EXISTS: u64 = 13;
pub const COMMAND_DELETE: u64 = 14;
pub const COMMAND_READDIR: u64 = 15;
pub const COMMAND_LOCK: u64 = 16;
pub const COMMAND_RELEASE: u64 = 17;
pub const COMMAND_CHECKSEQUENCER: u64 = 18;
pub const COMMAND_STATUS: u64 = 19;
pub const COMMAND_REDIRECT: u64 = 20;
pub const COMMAND_READDIRATTR: u64 = 21;
pub const COMMAND_ATTRINCR: u64 = 22;
pub const COMMAND_READPATHATTR: u64 = 23;
pub const COMMAND_SHUTDOWN: u64 = 24;
pub const COMMAND_MAX: u64 = 25;

const COMMAND_STRS: [&str; COMMAND_MAX as usize] = [
    "keepalive",
    "handshake",
    "open",
    "stat",
    "cancel",
    "close",
    "poison",
    "mkdir",
    "attrset",
    "attrget",
    "attrdel",
    "attrexists",
    "attrlist",
    "exists",
    "delete",
    "readdir",
    "lock",
    "release",
    "checksequencer",
    "status",
    "redirect",
    "readdirattr",
    "attrincr",
    "readpathattr",
    "shutdown",
];

/// Human-readable opcode name for log messages.
pub fn command_text(command: u64) -> &'static str {
    COMMAND_STRS
        .get(command as usize)
        .copied()
        .unwrap_or("UNKNOWN")
}

/// Group id for a handle-addressed request: XOR of the handle's halves.
pub fn handle_to_gid(handle: u64) -> u32 {
    (handle ^ (handle >> 32)) as u32
}

/// Group id for a path-addressed request.
pub fn path_to_gid(path: &str) -> u32 {
    fletcher32(path.as_bytes())
}

fn handle_request(command: u64, handle: u64, capacity: usize) -> CommBuf {
    let mut header = CommHeader::new(command);
    header.gid = handle_to_gid(handle);
    let mut cbuf = CommBuf::new(header, 8 + capacity);
    cbuf.append_u64(handle);
    cbuf
}

/// Handshake request. Encoding: {u64 session_id, vstr executable_name}.
/// Session id zero means first contact.
pub fn create_handshake_request(session_id: u64, exe_name: &str) -> CommBuf {
    let mut header = CommHeader::new(COMMAND_HANDSHAKE);
    header.flags |= FLAGS_BIT_URGENT;
    let mut cbuf = CommBuf::new(header, 8 + vstr_len(exe_name.len()));
    cbuf.append_u64(session_id);
    cbuf.append_vstr(exe_name);
    cbuf
}

/// Client keep-alive datagram. Encoding: {u64 session_id,
/// u64 last_delivered_event_id, bool destroy_session}.
pub fn create_keepalive_request(
    session_id: u64,
    last_delivered_event: u64,
    destroy_session: bool,
) -> CommBuf {
    let mut header = CommHeader::new(COMMAND_KEEPALIVE);
    header.flags |= FLAGS_BIT_URGENT;
    let mut cbuf = CommBuf::new(header, 17);
    cbuf.append_u64(session_id);
    cbuf.append_u64(last_delivered_event);
    cbuf.append_bool(destroy_session);
    cbuf
}

/// Open request. Encoding: {u32 version, u32 flags, u32 event_mask,
/// vstr name, u32 attr_count, attr_count * {vstr name, vbytes value}}.
pub fn create_open_request(
    name: &str,
    flags: u32,
    event_mask: u32,
    init_attrs: &[Attribute],
) -> CommBuf {
    let mut header = CommHeader::new(COMMAND_OPEN);
    header.gid = path_to_gid(name);

    let mut len = 16 + vstr_len(name.len());
    for attr in init_attrs {
        len += vstr_len(attr.name.len()) + vstr_len(attr.value.len());
    }

    let mut cbuf = CommBuf::new(header, len);
    cbuf.append_u32(VERSION);
    cbuf.append_u32(flags);
    cbuf.append_u32(event_mask);
    cbuf.append_vstr(name);
    cbuf.append_u32(init_attrs.len() as u32);
    for attr in init_attrs {
        cbuf.append_vstr(&attr.name);
        cbuf.append_vbytes(&attr.value);
    }
    cbuf
}

/// Close request. Encoding: {u64 handle}.
pub fn create_close_request(handle: u64) -> CommBuf {
    handle_request(COMMAND_CLOSE, handle, 0)
}

/// Mkdir request. Encoding: {vstr name, bool create_intermediate,
/// u32 attr_count, attrs}.
pub fn create_mkdir_request(
    name: &str,
    create_intermediate: bool,
    init_attrs: &[Attribute],
) -> CommBuf {
    let mut header = CommHeader::new(COMMAND_MKDIR);
    header.gid = path_to_gid(name);

    let mut len = vstr_len(name.len()) + 5;
    for attr in init_attrs {
        len += vstr_len(attr.name.len()) + vstr_len(attr.value.len());
    }

    let mut cbuf = CommBuf::new(header, len);
    cbuf.append_vstr(name);
    cbuf.append_bool(create_intermediate);
    cbuf.append_u32(init_attrs.len() as u32);
    for attr in init_attrs {
        cbuf.append_vstr(&attr.name);
        cbuf.append_vbytes(&attr.value);
    }
    cbuf
}

/// Delete request. Encoding: {vstr name}.
pub fn create_delete_request(name: &str) -> CommBuf {
    let mut header = CommHeader::new(COMMAND_DELETE);
    header.gid = path_to_gid(name);
    let mut cbuf = CommBuf::new(header, vstr_len(name.len()));
    cbuf.append_vstr(name);
    cbuf
}

/// Exists request. Encoding: {vstr name}.
pub fn create_exists_request(name: &str) -> CommBuf {
    let mut header = CommHeader::new(COMMAND_EXISTS);
    header.gid = path_to_gid(name);
    let mut cbuf = CommBuf::new(header, vstr_len(name.len()));
    cbuf.append_vstr(name);
    cbuf
}

/// Readdir request. Encoding: {u64 handle}.
pub fn create_readdir_request(handle: u64) -> CommBuf {
    handle_request(COMMAND_READDIR, handle, 0)
}

/// Readdir-attr request. Encoding: {u64 handle, vstr attr,
/// bool include_sub_entries}.
pub fn create_readdir_attr_request(handle: u64, attr: &str, include_sub_entries: bool) -> CommBuf {
    let mut cbuf = handle_request(COMMAND_READDIRATTR, handle, vstr_len(attr.len()) + 1);
    cbuf.append_vstr(attr);
    cbuf.append_bool(include_sub_entries);
    cbuf
}

/// Readpath-attr request. Encoding: {u64 handle, vstr attr}.
pub fn create_readpath_attr_request(handle: u64, attr: &str) -> CommBuf {
    let mut cbuf = handle_request(COMMAND_READPATHATTR, handle, vstr_len(attr.len()));
    cbuf.append_vstr(attr);
    cbuf
}

/// Attr-set request. Encoding: {u64 handle, u32 attr_count,
/// attr_count * {vstr name, vbytes value}}.
pub fn create_attr_set_request(handle: u64, attrs: &[Attribute]) -> CommBuf {
    let mut len = 4;
    for attr in attrs {
        len += vstr_len(attr.name.len()) + vstr_len(attr.value.len());
    }

    let mut cbuf = handle_request(COMMAND_ATTRSET, handle, len);
    cbuf.append_u32(attrs.len() as u32);
    for attr in attrs {
        cbuf.append_vstr(&attr.name);
        cbuf.append_vbytes(&attr.value);
    }
    cbuf
}

/// Attr-get request. Encoding: {u64 handle, vstr name}.
pub fn create_attr_get_request(handle: u64, name: &str) -> CommBuf {
    let mut cbuf = handle_request(COMMAND_ATTRGET, handle, vstr_len(name.len()));
    cbuf.append_vstr(name);
    cbuf
}

/// Attr-incr request. Encoding: {u64 handle, vstr name}.
pub fn create_attr_incr_request(handle: u64, name: &str) -> CommBuf {
    let mut cbuf = handle_request(COMMAND_ATTRINCR, handle, vstr_len(name.len()));
    cbuf.append_vstr(name);
    cbuf
}

/// Attr-del request. Encoding: {u64 handle, vstr name}.
pub fn create_attr_del_request(handle: u64, name: &str) -> CommBuf {
    let mut cbuf = handle_request(COMMAND_ATTRDEL, handle, vstr_len(name.len()));
    cbuf.append_vstr(name);
    cbuf
}

/// Attr-exists request. Encoding: {u64 handle, vstr name}.
pub fn create_attr_exists_request(handle: u64, name: &str) -> CommBuf {
    let mut cbuf = handle_request(COMMAND_ATTREXISTS, handle, vstr_len(name.len()));
    cbuf.append_vstr(name);
    cbuf
}

/// Attr-list request. Encoding: {u64 handle}.
pub fn create_attr_list_request(handle: u64) -> CommBuf {
    handle_request(COMMAND_ATTRLIST, handle, 0)
}

/// Lock request. Encoding: {u64 handle, u32 mode, bool try_lock}.
pub fn create_lock_request(handle: u64, mode: LockMode, try_lock: bool) -> CommBuf {
    let mut cbuf = handle_request(COMMAND_LOCK, handle, 5);
    cbuf.append_u32(mode as u32);
    cbuf.append_bool(try_lock);
    cbuf
}

/// Release request. Encoding: {u64 handle}.
pub fn create_release_request(handle: u64) -> CommBuf {
    handle_request(COMMAND_RELEASE, handle, 0)
}

/// Check-sequencer request. Encoding: {vstr name, u32 mode,
/// u64 generation}.
pub fn create_check_sequencer_request(sequencer: &LockSequencer) -> CommBuf {
    let mut header = CommHeader::new(COMMAND_CHECKSEQUENCER);
    header.gid = path_to_gid(&sequencer.name);
    let mut cbuf = CommBuf::new(header, vstr_len(sequencer.name.len()) + 12);
    cbuf.append_vstr(&sequencer.name);
    cbuf.append_u32(sequencer.mode as u32);
    cbuf.append_u64(sequencer.generation);
    cbuf
}

/// Status request. Empty payload.
pub fn create_status_request() -> CommBuf {
    let mut header = CommHeader::new(COMMAND_STATUS);
    header.flags |= FLAGS_BIT_URGENT;
    CommBuf::new(header, 0)
}

/// Server shutdown request. Empty payload.
pub fn create_shutdown_request() -> CommBuf {
    CommBuf::new(CommHeader::new(COMMAND_SHUTDOWN), 0)
}

#[cfg(test)]
mod tests {
    use quartz_codec::Decoder;
    use quartz_comm::header::HEADER_LENGTH;

    use super::*;

    fn payload(mut cbuf: CommBuf) -> (CommHeader, Vec<u8>) {
        let wire = cbuf.encode();
        let header = CommHeader::decode(&wire).unwrap();
        (header, wire[HEADER_LENGTH..].to_vec())
    }

    #[test]
    fn handshake_layout() {
        let (header, payload) = payload(create_handshake_request(0, "rangeserver"));
        assert_eq!(header.command, COMMAND_HANDSHAKE);
        assert!(header.is_urgent());

        let mut dec = Decoder::new(&payload);
        assert_eq!(dec.read_u64().unwrap(), 0);
        assert_eq!(dec.read_vstr().unwrap(), "rangeserver");
        assert!(dec.is_empty());
    }

    #[test]
    fn keepalive_layout() {
        let (header, payload) = payload(create_keepalive_request(9, 41, false));
        assert_eq!(header.command, COMMAND_KEEPALIVE);
        assert!(header.is_urgent());

        let mut dec = Decoder::new(&payload);
        assert_eq!(dec.read_u64().unwrap(), 9);
        assert_eq!(dec.read_u64().unwrap(), 41);
        assert!(!dec.read_bool().unwrap());
    }

    #[test]
    fn open_carries_version_and_attrs() {
        let attrs = vec![Attribute::new("schema", b"v1".to_vec())];
        let (header, payload) = payload(create_open_request(
            "/tables/users",
            open_flags_read_create(),
            0x3,
            &attrs,
        ));
        assert_eq!(header.command, COMMAND_OPEN);
        assert_eq!(header.gid, path_to_gid("/tables/users"));

        let mut dec = Decoder::new(&payload);
        assert_eq!(dec.read_u32().unwrap(), VERSION);
        assert_eq!(dec.read_u32().unwrap(), open_flags_read_create());
        assert_eq!(dec.read_u32().unwrap(), 0x3);
        assert_eq!(dec.read_vstr().unwrap(), "/tables/users");
        assert_eq!(dec.read_u32().unwrap(), 1);
        assert_eq!(dec.read_vstr().unwrap(), "schema");
        assert_eq!(dec.read_vbytes().unwrap(), b"v1");
    }

    fn open_flags_read_create() -> u32 {
        crate::types::open_flags::READ | crate::types::open_flags::CREATE
    }

    #[test]
    fn handle_requests_serialize_by_handle() {
        let handle = 0x1234_5678_9abc_def0u64;
        let (header, payload) = payload(create_lock_request(handle, LockMode::Exclusive, true));
        assert_eq!(header.gid, handle_to_gid(handle));
        assert_eq!(header.gid, ((handle >> 32) as u32) ^ (handle as u32));

        let mut dec = Decoder::new(&payload);
        assert_eq!(dec.read_u64().unwrap(), handle);
        assert_eq!(dec.read_u32().unwrap(), LockMode::Exclusive as u32);
        assert!(dec.read_bool().unwrap());
    }

    #[test]
    fn command_text_covers_all_opcodes() {
        assert_eq!(command_text(COMMAND_KEEPALIVE), "keepalive");
        assert_eq!(command_text(COMMAND_SHUTDOWN), "shutdown");
        assert_eq!(command_text(COMMAND_MAX), "UNKNOWN");
    }
}
