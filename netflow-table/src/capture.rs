//! AF_PACKET capture driver feeding a shared [`FlowTable`].
//!
//! Each worker owns one TPACKET_V3 receive ring. With a fanout group the
//! kernel spreads flows across workers by hash; the table itself is shared.

use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    path::{Path, PathBuf},
    ptr, slice,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering, fence},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use netflow_table_common::{FlowKey, IPPROTO_TCP, IPPROTO_UDP, Ipv4Header, TcpHeader};
use tokio::io::{Interest, unix::AsyncFd};
use tokio::{signal, task, time};

use crate::export;
use crate::table::FlowTable;

const ETH_P_IPV4: u16 = 0x0800;
const ETH_P_8021Q: u16 = 0x8100;
const ETH_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_MIN_HEADER: usize = 20;
const TCP_MIN_HEADER: usize = 20;
const PORTS_LEN: usize = 4;
const IDLE_POLL: Duration = Duration::from_millis(250);

pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 20; // 1 MiB
pub const DEFAULT_BLOCK_COUNT: u32 = 64;
pub const DEFAULT_FRAME_SIZE: u32 = 2048;
pub const DEFAULT_BLOCK_TIMEOUT_MS: u32 = 100;

#[derive(Clone, Copy, Debug)]
pub struct RingConfig {
    pub block_size: u32,
    pub block_count: u32,
    pub frame_size: u32,
    pub block_timeout_ms: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            block_count: DEFAULT_BLOCK_COUNT,
            frame_size: DEFAULT_FRAME_SIZE,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
        }
    }
}

pub struct CaptureOptions {
    pub iface: String,
    pub workers: usize,
    pub fanout_group: Option<u16>,
    pub report_interval: Duration,
    pub ring: RingConfig,
    pub export_path: Option<PathBuf>,
}

/// Packet fields a frame contributes to its flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedPacket {
    pub key: FlowKey,
    pub ip: Ipv4Header,
    pub tcp: Option<TcpHeader>,
}

pub fn validate_ring_config(cfg: &RingConfig) -> Result<()> {
    if cfg.block_size == 0 || cfg.block_count == 0 || cfg.frame_size == 0 {
        return Err(anyhow!("ring parameters must be non-zero"));
    }
    if cfg.frame_size > cfg.block_size {
        return Err(anyhow!("frame size must be <= block size"));
    }
    if cfg.block_size % cfg.frame_size != 0 {
        return Err(anyhow!("block size must be a multiple of frame size"));
    }
    let alignment = libc::TPACKET_ALIGNMENT as u32;
    if cfg.block_size % alignment != 0 || cfg.frame_size % alignment != 0 {
        return Err(anyhow!("block and frame sizes must be aligned to {alignment} bytes"));
    }
    Ok(())
}

/// Runs capture workers and the periodic reporter until ctrl-c.
pub async fn run_capture(opts: CaptureOptions, table: Arc<FlowTable>) -> Result<()> {
    if opts.workers == 0 {
        return Err(anyhow!("workers must be at least 1"));
    }
    if opts.report_interval.is_zero() {
        return Err(anyhow!("report interval must be greater than zero"));
    }
    validate_ring_config(&opts.ring)?;

    let running = Arc::new(AtomicBool::new(true));
    let dropped = Arc::new(AtomicU64::new(0));

    let workers: Vec<_> = (0..opts.workers)
        .map(|worker_id| {
            let iface = opts.iface.clone();
            let fanout = opts.fanout_group;
            let ring_cfg = opts.ring;
            let table = table.clone();
            let running = running.clone();
            let dropped = dropped.clone();
            task::spawn(async move {
                worker_loop(worker_id, &iface, fanout, ring_cfg, running, table, dropped).await
            })
        })
        .collect();

    let reporter = {
        let table = table.clone();
        let running = running.clone();
        let dropped = dropped.clone();
        let export_path = opts.export_path.clone();
        let interval = opts.report_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                report(&table, export_path.as_deref(), dropped.load(Ordering::Relaxed));
            }
        })
    };

    signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;
    tracing::info!("received shutdown signal, draining");
    running.store(false, Ordering::Relaxed);

    for handle in workers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(err) => return Err(anyhow!("worker panicked: {err}")),
        }
    }

    reporter.abort();
    let _ = reporter.await;

    report(
        &table,
        opts.export_path.as_deref(),
        dropped.load(Ordering::Relaxed),
    );
    tracing::info!(packets = table.packet_count(), "total packets decoded");
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    iface: &str,
    fanout_group: Option<u16>,
    ring_cfg: RingConfig,
    running: Arc<AtomicBool>,
    table: Arc<FlowTable>,
    dropped: Arc<AtomicU64>,
) -> Result<()> {
    let mut socket = PacketSocket::bind(iface, fanout_group, ring_cfg)
        .with_context(|| format!("worker {worker_id}: failed to bind packet socket on {iface}"))?;
    tracing::info!(worker_id, iface, "capture worker started");
    socket.pump(&running, &table, &dropped).await
}

/// Logs table statistics and, when a path is set, refreshes the CSV export.
///
/// Export failures are logged; capture carries on.
pub fn report(table: &FlowTable, export_path: Option<&Path>, dropped: u64) {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let stats = export::stats(table);
    tracing::info!(
        %timestamp,
        flows = stats.flows,
        bytes = stats.bytes,
        packets = stats.packets,
        occupied_slots = stats.occupied_slots,
        longest_chain = stats.longest_chain,
        dropped,
        "flow table snapshot"
    );

    if tracing::enabled!(tracing::Level::TRACE) {
        for record in export::dump(table) {
            tracing::trace!(flow = %record, "flow record");
        }
    }

    if let Some(path) = export_path {
        match export::export_to_file(table, path) {
            Ok(summary) => tracing::info!(
                path = %path.display(),
                flows = summary.flows,
                bytes = summary.bytes_written,
                "flows exported"
            ),
            Err(err) => {
                tracing::error!(path = %path.display(), error = %err, "flow export failed")
            }
        }
    }
}

/// Folds one parsed packet into the table. Allocation failures drop the packet.
fn ingest(table: &FlowTable, packet: &ParsedPacket, dropped: &AtomicU64) {
    if let Err(err) = table.entry_add(&packet.key, &packet.ip, packet.tcp.as_ref()) {
        let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if total.is_power_of_two() {
            tracing::warn!(error = %err, dropped = total, "packet dropped by flow table");
        }
    }
}

struct PacketSocket {
    fd: AsyncFd<OwnedFd>,
    ring: PacketRing,
}

impl PacketSocket {
    /// Opens a TPACKET_V3 socket on `iface` and registers it with the runtime.
    ///
    /// Must run inside a tokio runtime.
    fn bind(iface: &str, fanout_group: Option<u16>, ring_cfg: RingConfig) -> Result<Self> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        check(raw, "failed to create packet socket")?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let version = libc::tpacket_versions::TPACKET_V3 as libc::c_int;
        set_option(&fd, libc::PACKET_VERSION, &version).context("failed to enable TPACKET_V3")?;
        bind_interface(&fd, iface, protocol)?;
        if let Some(group) = fanout_group {
            let val: u32 = (group as u32) | (libc::PACKET_FANOUT_HASH << 16);
            set_option(&fd, libc::PACKET_FANOUT, &val)
                .context("failed to configure PACKET_FANOUT")?;
        }

        let ring = PacketRing::new(&fd, ring_cfg)?;
        let fd = AsyncFd::with_interest(fd, Interest::READABLE)
            .context("failed to register packet socket")?;
        Ok(Self { fd, ring })
    }

    async fn pump(
        &mut self,
        running: &AtomicBool,
        table: &FlowTable,
        dropped: &AtomicU64,
    ) -> Result<()> {
        let sink = |packet: &ParsedPacket| ingest(table, packet, dropped);
        while running.load(Ordering::Relaxed) {
            let mut drained = 0usize;
            for _ in 0..self.ring.block_count() {
                drained += self.ring.drain_next_block(sink);
            }
            if drained > 0 {
                // let the reporter run while the ring stays busy
                task::yield_now().await;
            } else if let Ok(ready) = time::timeout(IDLE_POLL, self.wait_readable()).await {
                // bounded so an idle interface still notices shutdown
                ready?;
            }
        }
        Ok(())
    }

    async fn wait_readable(&self) -> Result<()> {
        let mut guard = self
            .fd
            .readable()
            .await
            .context("failed to wait for socket readability")?;
        // the ring, not a read(2), consumes the data
        guard.clear_ready();
        Ok(())
    }
}

fn check(rc: libc::c_int, what: &'static str) -> Result<()> {
    if rc < 0 {
        return Err(io::Error::last_os_error()).context(what);
    }
    Ok(())
}

fn set_option<T>(fd: &impl AsRawFd, name: libc::c_int, value: &T) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            name,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    check(rc, "setsockopt(SOL_PACKET) failed")
}

fn bind_interface(fd: &impl AsRawFd, iface: &str, protocol: u16) -> Result<()> {
    let name = CString::new(iface)?;
    let sll_ifindex = match unsafe { libc::if_nametoindex(name.as_ptr()) } {
        0 => return Err(anyhow!("no such interface: {iface}")),
        index => index as libc::c_int,
    };
    let addr = libc::sockaddr_ll {
        sll_family: libc::AF_PACKET as libc::c_ushort,
        sll_protocol: protocol,
        sll_ifindex,
        ..unsafe { mem::zeroed() }
    };
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&addr as *const libc::sockaddr_ll).cast(),
            mem::size_of_val(&addr) as libc::socklen_t,
        )
    };
    check(rc, "failed to bind packet socket")
}

struct PacketRing {
    base: *mut u8,
    len: usize,
    req: libc::tpacket_req3,
    next_block: u32,
}

// The ring is mapped by, and only touched through, the socket that owns it.
unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

impl PacketRing {
    fn new(fd: &impl AsRawFd, cfg: RingConfig) -> Result<Self> {
        let frame_nr = (cfg.block_size / cfg.frame_size)
            .checked_mul(cfg.block_count)
            .ok_or_else(|| anyhow!("ring frame count overflow"))?;
        let req = libc::tpacket_req3 {
            tp_block_size: cfg.block_size,
            tp_block_nr: cfg.block_count,
            tp_frame_size: cfg.frame_size,
            tp_frame_nr: frame_nr,
            tp_retire_blk_tov: cfg.block_timeout_ms,
            tp_sizeof_priv: 0,
            tp_feature_req_word: libc::TP_FT_REQ_FILL_RXHASH,
        };
        set_option(fd, libc::PACKET_RX_RING, &req).context("failed to configure PACKET_RX_RING")?;

        let len = (req.tp_block_size as usize)
            .checked_mul(req.tp_block_nr as usize)
            .ok_or_else(|| anyhow!("ring mmap length overflow"))?;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).context("failed to mmap PACKET_RX_RING");
        }

        Ok(Self {
            base: base.cast(),
            len,
            req,
            next_block: 0,
        })
    }

    fn block_count(&self) -> u32 {
        self.req.tp_block_nr
    }

    fn block_size(&self) -> usize {
        self.req.tp_block_size as usize
    }

    /// Hands every parsable frame of the next user-owned block to `sink`, then
    /// returns the block to the kernel. Returns the number of frames seen.
    fn drain_next_block<F>(&mut self, mut sink: F) -> usize
    where
        F: FnMut(&ParsedPacket),
    {
        let idx = self.next_block as usize;
        self.next_block = (self.next_block + 1) % self.block_count().max(1);

        let block_size = self.block_size();
        let block = unsafe { self.base.add(idx * block_size) };
        let desc = block as *mut libc::tpacket_block_desc;
        if unsafe { (*desc).hdr.bh1.block_status } & libc::TP_STATUS_USER == 0 {
            return 0;
        }
        fence(Ordering::Acquire);

        let mut seen = 0;
        unsafe {
            let hdr = &mut (*desc).hdr.bh1;
            let mut offset = hdr.offset_to_first_pkt as usize;
            for _ in 0..hdr.num_pkts {
                if offset >= block_size {
                    break;
                }
                let frame = &*(block.add(offset) as *const libc::tpacket3_hdr);
                let start = offset + frame.tp_mac as usize;
                let snaplen = frame.tp_snaplen as usize;
                if snaplen == 0 || start + snaplen > block_size {
                    break;
                }
                seen += 1;
                let bytes = slice::from_raw_parts(block.add(start), snaplen);
                if let Some(packet) = parse_frame(bytes) {
                    sink(&packet);
                }
                match frame.tp_next_offset as usize {
                    0 => break,
                    next => offset += next,
                }
            }
            hdr.block_status = libc::TP_STATUS_KERNEL;
        }
        fence(Ordering::Release);
        // An empty retired block still counts as progress.
        seen.max(1)
    }
}

impl Drop for PacketRing {
    fn drop(&mut self) {
        // `new` never hands out a ring whose mmap failed.
        unsafe { libc::munmap(self.base.cast(), self.len) };
    }
}

/// Extracts the flow key and header fields from an Ethernet frame.
///
/// Accepts one optional 802.1Q tag. Anything but IPv4 yields `None`; ports
/// are only read for TCP and UDP, and the TCP header only when present in full.
pub fn parse_frame(frame: &[u8]) -> Option<ParsedPacket> {
    if frame.len() < ETH_HEADER_LEN {
        return None;
    }
    let mut ether_type = u16::from_be_bytes([frame[12], frame[13]]);
    let mut l3 = ETH_HEADER_LEN;
    let mut vlan_id = 0;
    if ether_type == ETH_P_8021Q {
        let tag = frame.get(ETH_HEADER_LEN..ETH_HEADER_LEN + VLAN_TAG_LEN)?;
        vlan_id = u16::from_be_bytes([tag[0], tag[1]]) & 0x0fff;
        ether_type = u16::from_be_bytes([tag[2], tag[3]]);
        l3 += VLAN_TAG_LEN;
    }
    if ether_type != ETH_P_IPV4 {
        return None;
    }
    parse_ipv4(&frame[l3..]).map(|mut packet| {
        packet.key.vlan_id = vlan_id;
        packet
    })
}

fn parse_ipv4(payload: &[u8]) -> Option<ParsedPacket> {
    if payload.len() < IPV4_MIN_HEADER {
        return None;
    }
    let version_ihl = payload[0];
    if version_ihl >> 4 != 4 {
        return None;
    }
    let ihl = ((version_ihl & 0x0f) as usize) * 4;
    if ihl < IPV4_MIN_HEADER || payload.len() < ihl {
        return None;
    }

    let ip = Ipv4Header {
        type_of_service: payload[1],
        total_length: u16::from_be_bytes([payload[2], payload[3]]),
    };
    let proto = payload[9];
    let src = u32::from_be_bytes(payload[12..16].try_into().ok()?);
    let dst = u32::from_be_bytes(payload[16..20].try_into().ok()?);

    let l4 = &payload[ihl..];
    let (src_port, dst_port) = match proto {
        IPPROTO_TCP | IPPROTO_UDP if l4.len() >= PORTS_LEN => (
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
        ),
        _ => (0, 0),
    };
    let tcp = match proto {
        IPPROTO_TCP if l4.len() >= TCP_MIN_HEADER => Some(TcpHeader::new(l4[13])),
        _ => None,
    };

    Some(ParsedPacket {
        key: FlowKey::new(src, dst, src_port, dst_port, proto),
        ip,
        tcp,
    })
}
