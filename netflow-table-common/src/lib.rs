#![no_std]

// Packet-level types handed from the capture side to the flow table.
// Keep this crate `no_std` friendly so a kernel-side parser can share it.

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

/// Identity of a flow as extracted by the packet parser.
///
/// Addresses are the 32-bit values read big-endian from the header, so
/// `core::net::Ipv4Addr::from(src_addr)` renders the dotted form.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct FlowKey {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub pad: u8,
    pub vlan_id: u16,
}

impl FlowKey {
    pub const fn new(
        src_addr: u32,
        dst_addr: u32,
        src_port: u16,
        dst_port: u16,
        proto: u8,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            proto,
            pad: 0,
            vlan_id: 0,
        }
    }

    pub const fn with_vlan(mut self, vlan_id: u16) -> Self {
        self.vlan_id = vlan_id;
        self
    }

    pub const fn is_tcp(&self) -> bool {
        self.proto == IPPROTO_TCP
    }
}

/// IPv4 header fields the flow table consumes.
///
/// `total_length` is the host-order value of the header's total-length field.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Ipv4Header {
    pub type_of_service: u8,
    pub total_length: u16,
}

impl Ipv4Header {
    pub const fn new(type_of_service: u8, total_length: u16) -> Self {
        Self {
            type_of_service,
            total_length,
        }
    }
}

/// TCP header fields the flow table consumes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TcpHeader {
    pub tcp_flags: u8,
}

impl TcpHeader {
    pub const fn new(tcp_flags: u8) -> Self {
        Self { tcp_flags }
    }
}
