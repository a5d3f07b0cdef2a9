//! Flow identity and the sticky flow cache.
//!
//! A flow is its IPv4 5-tuple: source, destination, protocol, and the
//! protocol-specific discriminators (ports for TCP/UDP, type/code for
//! ICMP). The cache remembers which spine a flow was assigned so every
//! packet of the flow crosses the same spine while its rules are
//! alive; entries expire on the same idle timeout as the rules.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// IPv4 5-tuple flow identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub proto: u8,
    /// Source port, or ICMP type.
    pub src_key: u16,
    /// Destination port, or ICMP code.
    pub dst_key: u16,
}

impl FiveTuple {
    pub fn tcp(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            proto: PROTO_TCP,
            src_key: src_port,
            dst_key: dst_port,
        }
    }

    pub fn udp(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            proto: PROTO_UDP,
            src_key: src_port,
            dst_key: dst_port,
        }
    }

    pub fn icmp(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, icmp_type: u8, icmp_code: u8) -> Self {
        Self {
            src_ip,
            dst_ip,
            proto: PROTO_ICMP,
            src_key: icmp_type as u16,
            dst_key: icmp_code as u16,
        }
    }

    /// The mirror-image tuple matched by reverse rules.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            proto: self.proto,
            src_key: self.dst_key,
            dst_key: self.src_key,
        }
    }
}

#[derive(Debug, Clone)]
struct FlowEntry {
    /// Spine assigned to the flow; `None` for same-leaf flows.
    spine: Option<String>,
    last_seen: Instant,
}

/// Sticky flow cache with idle expiry.
pub struct FlowTable {
    entries: HashMap<FiveTuple, FlowEntry>,
    idle_timeout: Duration,
}

impl FlowTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            idle_timeout,
        }
    }

    /// Look up a live entry, refreshing its idle timer. Expired
    /// entries are treated as absent.
    pub fn get(&mut self, key: &FiveTuple, now: Instant) -> Option<Option<&str>> {
        let expired = {
            let entry = self.entries.get_mut(key)?;
            if now.duration_since(entry.last_seen) > self.idle_timeout {
                true
            } else {
                entry.last_seen = now;
                false
            }
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        Some(self.entries.get(key)?.spine.as_deref())
    }

    pub fn insert(&mut self, key: FiveTuple, spine: Option<String>, now: Instant) {
        self.entries.insert(
            key,
            FlowEntry {
                spine,
                last_seen: now,
            },
        );
    }

    /// Drop entries idle longer than the timeout.
    pub fn purge_expired(&mut self, now: Instant) {
        let timeout = self.idle_timeout;
        self.entries
            .retain(|_, e| now.duration_since(e.last_seen) <= timeout);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
