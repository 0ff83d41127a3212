//! Process-wide index of I/O handlers, keyed by endpoint and proxy name.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::addr::CommAddress;
use crate::error::CommError;
use crate::handler::{ListenerHandler, TcpHandler, UdpHandler};

/// A reference to an installed I/O handler.
#[derive(Clone)]
pub(crate) enum HandlerEntry {
    Data(Arc<TcpHandler>),
    Listener(Arc<ListenerHandler>),
    Datagram(Arc<UdpHandler>),
}

impl HandlerEntry {
    fn same_handler(&self, other: &HandlerEntry) -> bool {
        match (self, other) {
            (Self::Data(a), Self::Data(b)) => Arc::ptr_eq(a, b),
            (Self::Listener(a), Self::Listener(b)) => Arc::ptr_eq(a, b),
            (Self::Datagram(a), Self::Datagram(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Address-to-handler index.
///
/// A single handler may be reachable through several keys: its concrete
/// endpoint, an alias endpoint, and a proxy name. Lookups take the read
/// lock; connect/accept/close take the write lock.
#[derive(Default)]
pub(crate) struct HandlerMap {
    inner: RwLock<HashMap<CommAddress, HandlerEntry>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler under `addr`. Fails if the key is taken.
    pub fn insert(&self, addr: CommAddress, entry: HandlerEntry) -> Result<(), CommError> {
        let mut map = self.inner.write().expect("handler map lock");
        if map.contains_key(&addr) {
            return Err(CommError::AlreadyConnected);
        }
        map.insert(addr, entry);
        Ok(())
    }

    /// Install `alias` as a second key for the handler at `addr`.
    pub fn insert_alias(&self, addr: &CommAddress, alias: CommAddress) -> Result<(), CommError> {
        let mut map = self.inner.write().expect("handler map lock");
        let entry = map.get(addr).cloned().ok_or(CommError::NotConnected)?;
        if map.contains_key(&alias) {
            return Err(CommError::AlreadyConnected);
        }
        map.insert(alias, entry);
        Ok(())
    }

    pub fn contains(&self, addr: &CommAddress) -> bool {
        self.inner.read().expect("handler map lock").contains_key(addr)
    }

    pub fn get(&self, addr: &CommAddress) -> Option<HandlerEntry> {
        self.inner.read().expect("handler map lock").get(addr).cloned()
    }

    pub fn get_data(&self, addr: &CommAddress) -> Option<Arc<TcpHandler>> {
        match self.get(addr) {
            Some(HandlerEntry::Data(handler)) => Some(handler),
            _ => None,
        }
    }

    pub fn get_datagram(&self, addr: &CommAddress) -> Option<Arc<UdpHandler>> {
        match self.get(addr) {
            Some(HandlerEntry::Datagram(handler)) => Some(handler),
            _ => None,
        }
    }

    /// Remove the handler reachable at `addr`, dropping every key that
    /// points at it. Returns the removed handler.
    pub fn remove(&self, addr: &CommAddress) -> Option<HandlerEntry> {
        let mut map = self.inner.write().expect("handler map lock");
        let entry = map.remove(addr)?;
        map.retain(|_, v| !v.same_handler(&entry));
        Some(entry)
    }

    /// Every installed TCP data handler; used for proxy map broadcast.
    pub fn data_handlers(&self) -> Vec<Arc<TcpHandler>> {
        let map = self.inner.read().expect("handler map lock");
        let mut seen: Vec<Arc<TcpHandler>> = Vec::new();
        for entry in map.values() {
            if let HandlerEntry::Data(handler) = entry {
                if !seen.iter().any(|h| Arc::ptr_eq(h, handler)) {
                    seen.push(handler.clone());
                }
            }
        }
        seen
    }

    pub fn clear(&self) {
        self.inner.write().expect("handler map lock").clear();
    }
}
