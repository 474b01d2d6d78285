use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use netflow_table_common::{FlowKey, Ipv4Header, TcpHeader};

/// Which key fields decide that a packet belongs to an existing record.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum MatchMode {
    /// Source and destination address, ports and protocol.
    #[default]
    FiveTuple,
    /// Legacy predicate: source and destination address only. Flows that
    /// differ only by port or protocol share one record.
    AddressPair,
}

impl MatchMode {
    pub fn matches(self, record: &FlowRecord, key: &FlowKey) -> bool {
        let addrs = record.src_addr == key.src_addr && record.dst_addr == key.dst_addr;
        match self {
            MatchMode::AddressPair => addrs,
            MatchMode::FiveTuple => {
                addrs
                    && record.src_port == key.src_port
                    && record.dst_port == key.dst_port
                    && record.proto == key.proto
            }
        }
    }
}

/// Running aggregate for one flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowRecord {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub vlan_id: u16,
    pub bytes_sent: u64,
    pub packets_sent: u64,
    /// Reverse direction. Reserved for bidirectional tracking, never filled by ingest.
    pub bytes_rcvd: u64,
    pub packets_rcvd: u64,
    pub tos: u8,
    pub tcp_flags: u8,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Set when the record is created and never cleared.
    pub live: bool,
}

impl FlowRecord {
    pub(crate) fn first_packet(
        key: &FlowKey,
        ip: &Ipv4Header,
        tcp: Option<&TcpHeader>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            src_addr: key.src_addr,
            dst_addr: key.dst_addr,
            src_port: key.src_port,
            dst_port: key.dst_port,
            proto: key.proto,
            vlan_id: key.vlan_id,
            bytes_sent: ip.total_length as u64,
            packets_sent: 1,
            bytes_rcvd: 0,
            packets_rcvd: 0,
            tos: ip.type_of_service,
            tcp_flags: tcp_flags(key, tcp),
            first_seen: now,
            last_seen: now,
            live: true,
        }
    }

    pub(crate) fn absorb(
        &mut self,
        key: &FlowKey,
        ip: &Ipv4Header,
        tcp: Option<&TcpHeader>,
        now: DateTime<Utc>,
    ) {
        self.tos |= ip.type_of_service;
        self.tcp_flags |= tcp_flags(key, tcp);
        self.bytes_sent = self.bytes_sent.wrapping_add(ip.total_length as u64);
        self.packets_sent = self.packets_sent.wrapping_add(1);
        self.last_seen = now;
    }

    pub fn key(&self) -> FlowKey {
        FlowKey::new(
            self.src_addr,
            self.dst_addr,
            self.src_port,
            self.dst_port,
            self.proto,
        )
        .with_vlan(self.vlan_id)
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr)
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr)
    }
}

// Flags only count for TCP, and only when the parser handed us the header.
fn tcp_flags(key: &FlowKey, tcp: Option<&TcpHeader>) -> u8 {
    match tcp {
        Some(tcp) if key.is_tcp() => tcp.tcp_flags,
        _ => 0,
    }
}

impl std::fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto:{} vlan:{} bytes_sent: {} packets_sent: {} bytes_rcvd: {} packets_rcvd: {} tos: {:#04x} flags: {:#04x} first_seen: {} last_seen: {}",
            self.src_ip(),
            self.src_port,
            self.dst_ip(),
            self.dst_port,
            self.proto,
            self.vlan_id,
            self.bytes_sent,
            self.packets_sent,
            self.bytes_rcvd,
            self.packets_rcvd,
            self.tos,
            self.tcp_flags,
            self.first_seen.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.last_seen.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        )
    }
}
