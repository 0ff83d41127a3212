//! Node, lock and event types shared by the client and the wire protocol.
use quartz_codec::{CodecError, Decoder};

/// Node open flags.
pub mod open_flags {
    pub const READ: u32 = 0x0001;
    pub const WRITE: u32 = 0x0002;
    pub const LOCK: u32 = 0x0004;
    pub const CREATE: u32 = 0x0008;
    pub const EXCL: u32 = 0x0010;
    /// Node is deleted when the opening session ends.
    pub const TEMP: u32 = 0x0020;
    pub const LOCK_SHARED: u32 = 0x0044;
    pub const LOCK_EXCLUSIVE: u32 = 0x0084;
}

/// Bits selecting which node events a handle callback receives.
pub mod event_mask {
    pub const ATTR_SET: u32 = 0x0001;
    pub const ATTR_DEL: u32 = 0x0002;
    pub const CHILD_NODE_ADDED: u32 = 0x0004;
    pub const CHILD_NODE_REMOVED: u32 = 0x0008;
    pub const LOCK_ACQUIRED: u32 = 0x0010;
    pub const LOCK_RELEASED: u32 = 0x0020;
}

/// Lock mode requested on a node handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockMode {
    Shared = 1,
    Exclusive = 2,
}

impl LockMode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Shared),
            2 => Some(Self::Exclusive),
            _ => None,
        }
    }
}

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LockStatus {
    Granted = 1,
    Busy = 2,
    Pending = 3,
    Cancelled = 4,
}

impl LockStatus {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Granted),
            2 => Some(Self::Busy),
            3 => Some(Self::Pending),
            4 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A fencing token returned from a lock acquisition.
///
/// Third parties validate a sequencer against the current lock generation
/// to fence stale writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSequencer {
    /// Node path the lock was taken on.
    pub name: String,
    pub mode: LockMode,
    pub generation: u64,
}

/// An extended attribute: name and value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// A directory listing entry bundled with one attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryAttr {
    pub name: String,
    pub is_dir: bool,
    pub has_attr: bool,
    pub attr: Vec<u8>,
}

/// One path component paired with an attribute value, as returned by
/// readpath_attr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntryAttr {
    pub name: String,
    pub attr: Vec<u8>,
}

/// A change notification on a node, delivered through the handle's
/// callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    AttrSet { name: String },
    AttrDel { name: String },
    ChildNodeAdded { name: String },
    ChildNodeRemoved { name: String },
    LockAcquired { mode: LockMode },
    LockReleased,
}

impl NodeEvent {
    /// The event-mask bit this event corresponds to.
    pub fn mask_bit(&self) -> u32 {
        match self {
            Self::AttrSet { .. } => event_mask::ATTR_SET,
            Self::AttrDel { .. } => event_mask::ATTR_DEL,
            Self::ChildNodeAdded { .. } => event_mask::CHILD_NODE_ADDED,
            Self::ChildNodeRemoved { .. } => event_mask::CHILD_NODE_REMOVED,
            Self::LockAcquired { .. } => event_mask::LOCK_ACQUIRED,
            Self::LockReleased => event_mask::LOCK_RELEASED,
        }
    }

    /// Encode as `{u32 type, body}`, with the mask bit as the type tag.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        quartz_codec::encode_u32(buf, self.mask_bit());
        match self {
            Self::AttrSet { name }
            | Self::AttrDel { name }
            | Self::ChildNodeAdded { name }
            | Self::ChildNodeRemoved { name } => quartz_codec::encode_vstr(buf, name),
            Self::LockAcquired { mode } => quartz_codec::encode_u32(buf, *mode as u32),
            Self::LockReleased => {}
        }
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let kind = dec.read_u32()?;
        Ok(match kind {
            event_mask::ATTR_SET => Self::AttrSet {
                name: dec.read_vstr()?,
            },
            event_mask::ATTR_DEL => Self::AttrDel {
                name: dec.read_vstr()?,
            },
            event_mask::CHILD_NODE_ADDED => Self::ChildNodeAdded {
                name: dec.read_vstr()?,
            },
            event_mask::CHILD_NODE_REMOVED => Self::ChildNodeRemoved {
                name: dec.read_vstr()?,
            },
            event_mask::LOCK_ACQUIRED => Self::LockAcquired {
                mode: LockMode::from_u32(dec.read_u32()?).ok_or(CodecError::InvalidValue)?,
            },
            event_mask::LOCK_RELEASED => Self::LockReleased,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

/// Callback invoked for matching events on an open node handle.
///
/// Called from the datagram reactor thread; implementations must not
/// block.
pub trait HandleCallback: Send + Sync {
    /// Events this callback wants delivered.
    fn event_mask(&self) -> u32;

    fn attr_set(&self, _name: &str) {}
    fn attr_del(&self, _name: &str) {}
    fn child_node_added(&self, _name: &str) {}
    fn child_node_removed(&self, _name: &str) {}
    fn lock_acquired(&self, _mode: LockMode) {}
    fn lock_released(&self) {}

    /// Deliver `event` through the matching typed method.
    fn deliver(&self, event: &NodeEvent) {
        match event {
            NodeEvent::AttrSet { name } => self.attr_set(name),
            NodeEvent::AttrDel { name } => self.attr_del(name),
            NodeEvent::ChildNodeAdded { name } => self.child_node_added(name),
            NodeEvent::ChildNodeRemoved { name } => self.child_node_removed(name),
            NodeEvent::LockAcquired { mode } => self.lock_acquired(*mode),
            NodeEvent::LockReleased => self.lock_released(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_events_round_trip() {
        let events = [
            NodeEvent::AttrSet { name: "schema".into() },
            NodeEvent::AttrDel { name: "schema".into() },
            NodeEvent::ChildNodeAdded { name: "rs1".into() },
            NodeEvent::ChildNodeRemoved { name: "rs1".into() },
            NodeEvent::LockAcquired { mode: LockMode::Exclusive },
            NodeEvent::LockReleased,
        ];

        for event in events {
            let mut buf = Vec::new();
            event.encode(&mut buf);
            let decoded = NodeEvent::decode(&mut Decoder::new(&buf)).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn combined_lock_flags_include_base_lock_bit() {
        assert_ne!(open_flags::LOCK_SHARED & open_flags::LOCK, 0);
        assert_ne!(open_flags::LOCK_EXCLUSIVE & open_flags::LOCK, 0);
    }
}
