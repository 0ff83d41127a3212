//! Proxy name to endpoint mapping.
//!
//! The authoritative node broadcasts the full mapping in a frame flagged
//! `PROXY_MAP_UPDATE`; receivers replace their mapping wholesale and signal
//! observers waiting for the first load.
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use quartz_codec::{encode_u16, encode_vstr, Decoder};
use tracing::debug;

use crate::error::CommError;

/// A proxy binding: the remote hostname and its concrete endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEntry {
    pub hostname: String,
    pub addr: SocketAddr,
}

/// Process-wide proxy name index.
#[derive(Default)]
pub struct ProxyMap {
    entries: RwLock<HashMap<String, ProxyEntry>>,
    loaded: Mutex<bool>,
    loaded_cond: Condvar,
}

impl ProxyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a proxy name to its endpoint.
    pub fn resolve(&self, proxy: &str) -> Option<SocketAddr> {
        let entries = self.entries.read().expect("proxy map lock");
        entries.get(proxy).map(|e| e.addr)
    }

    /// Install or replace a single binding.
    pub fn insert(&self, proxy: &str, hostname: &str, addr: SocketAddr) {
        let mut entries = self.entries.write().expect("proxy map lock");
        entries.insert(
            proxy.to_owned(),
            ProxyEntry {
                hostname: hostname.to_owned(),
                addr,
            },
        );
    }

    /// Snapshot of the current mapping.
    pub fn snapshot(&self) -> HashMap<String, ProxyEntry> {
        self.entries.read().expect("proxy map lock").clone()
    }

    /// Apply a `PROXY_MAP_UPDATE` payload, replacing the mapping, and mark
    /// the map loaded.
    pub fn apply_update(&self, payload: &[u8]) -> Result<(), CommError> {
        let update = decode_mappings(payload)?;
        {
            let mut entries = self.entries.write().expect("proxy map lock");
            entries.clear();
            for (proxy, entry) in update {
                entries.insert(proxy, entry);
            }
            debug!(target: "comm", "proxy map updated, {} mapping(s)", entries.len());
        }

        let mut loaded = self.loaded.lock().expect("proxy map lock");
        *loaded = true;
        self.loaded_cond.notify_all();
        Ok(())
    }

    /// Block until a proxy map update has been received at least once, or
    /// until the timeout expires. Returns `false` on expiry, with no side
    /// effects.
    pub fn wait_for_load(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut loaded = self.loaded.lock().expect("proxy map lock");

        while !*loaded {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .loaded_cond
                .wait_timeout(loaded, remaining)
                .expect("proxy map lock");
            loaded = guard;
        }
        true
    }

    /// Encode the current mapping as a `PROXY_MAP_UPDATE` payload.
    pub fn encode_mappings(&self) -> Result<Vec<u8>, CommError> {
        let entries = self.entries.read().expect("proxy map lock");
        let mut payload = Vec::new();

        for (proxy, entry) in entries.iter() {
            let v4 = match entry.addr {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(_) => {
                    return Err(CommError::Protocol(format!(
                        "proxy {proxy} maps to a non-IPv4 endpoint"
                    )))
                }
            };
            encode_vstr(&mut payload, proxy);
            encode_vstr(&mut payload, &entry.hostname);
            payload.extend_from_slice(&v4.ip().octets());
            encode_u16(&mut payload, v4.port());
        }
        Ok(payload)
    }
}

/// Decode a proxy map payload: a sequence of (vstr proxy, vstr hostname,
/// 4-byte IPv4, u16 port) records running to the end of the payload.
fn decode_mappings(payload: &[u8]) -> Result<Vec<(String, ProxyEntry)>, CommError> {
    let mut dec = Decoder::new(payload);
    let mut out = Vec::new();

    while !dec.is_empty() {
        let proxy = dec.read_vstr().map_err(protocol_err)?;
        let hostname = dec.read_vstr().map_err(protocol_err)?;
        let a = dec.read_u8().map_err(protocol_err)?;
        let b = dec.read_u8().map_err(protocol_err)?;
        let c = dec.read_u8().map_err(protocol_err)?;
        let d = dec.read_u8().map_err(protocol_err)?;
        let port = dec.read_u16().map_err(protocol_err)?;
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port);

        out.push((proxy, ProxyEntry { hostname, addr }));
    }
    Ok(out)
}

fn protocol_err(err: quartz_codec::CodecError) -> CommError {
    CommError::Protocol(format!("malformed proxy map update: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_round_trip() {
        let map = ProxyMap::new();
        map.insert("rs1", "node1.example", "10.0.0.1:38060".parse().unwrap());
        map.insert("rs2", "node2.example", "10.0.0.2:38060".parse().unwrap());

        let payload = map.encode_mappings().unwrap();

        let other = ProxyMap::new();
        assert!(!other.wait_for_load(Duration::from_millis(10)));
        other.apply_update(&payload).unwrap();

        assert!(other.wait_for_load(Duration::from_millis(10)));
        assert_eq!(
            other.resolve("rs1"),
            Some("10.0.0.1:38060".parse().unwrap())
        );
        assert_eq!(other.snapshot().len(), 2);
    }

    #[test]
    fn update_replaces_previous_mapping() {
        let map = ProxyMap::new();
        map.insert("stale", "old.example", "10.0.0.9:1".parse().unwrap());

        let fresh = ProxyMap::new();
        fresh.insert("rs1", "node1.example", "10.0.0.1:38060".parse().unwrap());
        map.apply_update(&fresh.encode_mappings().unwrap()).unwrap();

        assert_eq!(map.resolve("stale"), None);
        assert!(map.resolve("rs1").is_some());
    }

    #[test]
    fn truncated_update_rejected() {
        let map = ProxyMap::new();
        assert!(map.apply_update(&[3, b'a']).is_err());
    }
}
