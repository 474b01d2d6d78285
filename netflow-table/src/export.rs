//! Read passes over a live table: aggregate statistics, per-flow dumps and
//! the CSV export.
//!
//! Every pass walks slots in index order and holds one slot lock at a time,
//! so ingest on other slots keeps going. The result is therefore not a single
//! point-in-time view: slots read early may have moved on by the time the pass
//! finishes.

use std::fs::{self, File, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::Serialize;
use tempfile::Builder;

use crate::error::{FlowTableError, IoStage, Result};
use crate::record::FlowRecord;
use crate::table::FlowTable;

pub const EXPORT_BUF_INITIAL_SIZE: usize = 64 * 1024;

/// Mode of a freshly created export, before the umask applies.
pub const EXPORT_FILE_MODE: u32 = 0o644;

/// Widest line `src_ip,dst_ip,src_port,dst_port,proto,bytes,packets\n` can render to.
pub const MAX_CSV_LINE: usize = 15 + 1 + 15 + 1 + 5 + 1 + 5 + 1 + 3 + 1 + 20 + 1 + 20 + 1;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FlowStats {
    pub flows: u64,
    pub bytes: u64,
    pub packets: u64,
    pub occupied_slots: u64,
    pub longest_chain: u64,
}

impl std::fmt::Display for FlowStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total flows = {} total bytes = {} total pkts = {} occupied slots = {} longest chain = {}",
            self.flows, self.bytes, self.packets, self.occupied_slots, self.longest_chain
        )
    }
}

/// Sums bytes, packets and flows over the whole table.
pub fn stats(table: &FlowTable) -> FlowStats {
    let mut stats = FlowStats::default();
    table.for_each_chain(|_, chain| {
        if chain.is_empty() {
            return;
        }
        stats.occupied_slots += 1;
        stats.longest_chain = stats.longest_chain.max(chain.len() as u64);
        for rec in chain {
            stats.flows += 1;
            stats.bytes = stats.bytes.wrapping_add(rec.bytes_sent);
            stats.packets = stats.packets.wrapping_add(rec.packets_sent);
        }
    });
    stats
}

/// Copies every record out of the table, in slot then chain order.
pub fn dump(table: &FlowTable) -> Vec<FlowRecord> {
    let mut records = Vec::new();
    table.for_each_chain(|_, chain| records.extend(chain.iter().cloned()));
    records
}

/// Renders one CSV line per flow.
///
/// The buffer doubles whenever free space drops to one maximum-width line.
pub fn render_csv(table: &FlowTable) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    grow(&mut buf, EXPORT_BUF_INITIAL_SIZE)?;

    table.try_for_each_chain(|_, chain| -> Result<()> {
        for rec in chain {
            if buf.capacity() - buf.len() <= MAX_CSV_LINE {
                let additional = buf.capacity();
                grow(&mut buf, additional)?;
            }
            // Vec<u8> as io::Write only fails on allocation, which we reserved for.
            let _ = writeln!(
                buf,
                "{},{},{},{},{},{},{}",
                rec.src_ip(),
                rec.dst_ip(),
                rec.src_port,
                rec.dst_port,
                rec.proto,
                rec.bytes_sent,
                rec.packets_sent
            );
        }
        Ok(())
    })?;

    Ok(buf)
}

fn grow(buf: &mut Vec<u8>, additional: usize) -> Result<()> {
    buf.try_reserve_exact(additional)
        .map_err(|_| FlowTableError::OutOfMemory {
            what: "export buffer",
        })
}

/// Summary of a completed export.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExportSummary {
    pub flows: u64,
    pub bytes_written: usize,
}

/// Writes the table as CSV to `dest`, replacing it atomically.
///
/// On any failure `dest` keeps its previous contents.
pub fn export_to_file(table: &FlowTable, dest: &Path) -> Result<ExportSummary> {
    let buf = render_csv(table)?;
    let flows = buf.iter().filter(|b| **b == b'\n').count() as u64;
    persist_with(dest, &buf, |file, bytes| file.write(bytes))?;
    tracing::debug!(path = %dest.display(), flows, bytes = buf.len(), "flow table exported");
    Ok(ExportSummary {
        flows,
        bytes_written: buf.len(),
    })
}

/// Stages `buf` in a temporary file beside `dest` with one call to `write`,
/// then renames it over `dest`.
///
/// The replacement keeps the permission bits of an existing `dest`; a new one
/// gets [`EXPORT_FILE_MODE`] less the umask. A short write counts as failure.
/// The temporary file is removed on every error path.
pub(crate) fn persist_with<F>(dest: &Path, buf: &[u8], write: F) -> Result<()>
where
    F: FnOnce(&mut File, &[u8]) -> std::io::Result<usize>,
{
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let previous = fs::metadata(dest).ok().map(|meta| meta.permissions());
    let mode = Permissions::from_mode(EXPORT_FILE_MODE);
    let mut tmp = Builder::new()
        .prefix(".flows")
        .permissions(previous.clone().unwrap_or(mode))
        .tempfile_in(dir)
        .map_err(|e| FlowTableError::io(IoStage::Open, dir, e))?;
    if let Some(perm) = previous {
        // creation masked the mode with the umask; restore it exactly
        tmp.as_file()
            .set_permissions(perm)
            .map_err(|e| FlowTableError::io(IoStage::Open, tmp.path(), e))?;
    }

    let written = write(tmp.as_file_mut(), buf)
        .map_err(|e| FlowTableError::io(IoStage::Write, tmp.path(), e))?;
    if written != buf.len() {
        return Err(FlowTableError::io(
            IoStage::Write,
            tmp.path(),
            std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("wrote {written} of {} bytes", buf.len()),
            ),
        ));
    }

    tmp.as_file()
        .sync_all()
        .map_err(|e| FlowTableError::io(IoStage::Sync, tmp.path(), e))?;

    tmp.persist(dest)
        .map_err(|e| FlowTableError::io(IoStage::Rename, dest, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableConfig;
    use netflow_table_common::{FlowKey, IPPROTO_TCP, IPPROTO_UDP, Ipv4Header};
    use tempfile::tempdir;

    fn addr(a: u8, b: u8, c: u8, d: u8) -> u32 {
        u32::from_be_bytes([a, b, c, d])
    }

    fn filled_table() -> FlowTable {
        let t = FlowTable::create(TableConfig::with_entries(4), None, 0).unwrap();
        let flows = [
            ((10, 0, 0, 1), (10, 0, 0, 2), 1234, 80, IPPROTO_TCP, 3, 100),
            ((192, 168, 1, 5), (8, 8, 8, 8), 5353, 53, IPPROTO_UDP, 2, 70),
            ((172, 16, 0, 9), (172, 16, 0, 10), 22, 60000, IPPROTO_TCP, 5, 1500),
        ];
        for (src, dst, sport, dport, proto, count, len) in flows {
            let src = addr(src.0, src.1, src.2, src.3);
            let dst = addr(dst.0, dst.1, dst.2, dst.3);
            let key = FlowKey::new(src, dst, sport, dport, proto);
            for _ in 0..count {
                t.entry_add(&key, &Ipv4Header::new(0, len), None).unwrap();
            }
        }
        t
    }

    #[test]
    fn stats_totals_every_chain() {
        let t = filled_table();
        let s = stats(&t);
        assert_eq!(s.flows, 3);
        assert_eq!(s.packets, 10);
        assert_eq!(s.bytes, 300 + 140 + 7500);
        assert!(s.occupied_slots >= 1 && s.occupied_slots <= 3);
        assert!(s.longest_chain >= 1);
    }

    #[test]
    fn dump_returns_each_record_once() {
        let t = filled_table();
        let records = dump(&t);
        assert_eq!(records.len(), 3);
        assert_eq!(records.iter().map(|r| r.packets_sent).sum::<u64>(), 10);
    }

    #[test]
    fn csv_renders_one_dotted_line_per_flow() {
        let t = filled_table();
        let csv = String::from_utf8(render_csv(&t).unwrap()).unwrap();
        let mut lines: Vec<&str> = csv.lines().collect();
        lines.sort_unstable();
        assert_eq!(
            lines,
            vec![
                "10.0.0.1,10.0.0.2,1234,80,6,300,3",
                "172.16.0.9,172.16.0.10,22,60000,6,7500,5",
                "192.168.1.5,8.8.8.8,5353,53,17,140,2",
            ]
        );
        assert!(csv.ends_with('\n'));
    }

    #[test]
    fn csv_buffer_grows_past_initial_size() {
        let t = FlowTable::create(TableConfig::with_entries(1024), None, 0).unwrap();
        for src in 0..4000u32 {
            t.entry_add(
                &FlowKey::new(0xC0A8_0000 | src, 0x0A00_0001, 40000, 443, IPPROTO_TCP),
                &Ipv4Header::new(0, 1500),
                None,
            )
            .unwrap();
        }
        let buf = render_csv(&t).unwrap();
        assert!(buf.len() > EXPORT_BUF_INITIAL_SIZE);
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 4000);
    }

    #[test]
    fn export_writes_destination() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flows.csv");
        let t = filled_table();

        let summary = export_to_file(&t, &path).unwrap();
        assert_eq!(summary.flows, 3);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.len(), summary.bytes_written);
        assert!(content.contains("10.0.0.1,10.0.0.2,1234,80,6,300,3\n"));
        // only the destination is left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn export_keeps_destination_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flows.csv");
        let t = filled_table();

        for mode in [0o644, 0o664, 0o600] {
            fs::write(&path, b"previous,export\n").unwrap();
            fs::set_permissions(&path, Permissions::from_mode(mode)).unwrap();
            export_to_file(&t, &path).unwrap();
            assert_eq!(mode_of(&path), mode, "mode {mode:o}");
        }
    }

    #[test]
    fn new_export_uses_default_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flows.csv");
        export_to_file(&filled_table(), &path).unwrap();

        let mode = mode_of(&path);
        assert_eq!(mode & 0o600, 0o600);
        assert_eq!(mode & !EXPORT_FILE_MODE, 0, "mode {mode:o}");
    }

    #[test]
    fn short_write_keeps_previous_export() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flows.csv");
        fs::write(&path, b"previous,export\n").unwrap();

        let buf = render_csv(&filled_table()).unwrap();
        let half = |file: &mut File, bytes: &[u8]| file.write(&bytes[..bytes.len() / 2]);
        let err = persist_with(&path, &buf, half).unwrap_err();
        assert!(matches!(
            err,
            FlowTableError::IoFailure {
                stage: IoStage::Write,
                ..
            }
        ));
        assert_eq!(fs::read(&path).unwrap(), b"previous,export\n");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn failed_write_keeps_previous_export() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flows.csv");
        fs::write(&path, b"previous,export\n").unwrap();

        let err = persist_with(&path, b"new\n", |_, _| {
            Err(std::io::Error::other("disk full"))
        })
        .unwrap_err();
        assert!(matches!(err, FlowTableError::IoFailure { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"previous,export\n");
    }

    #[test]
    fn missing_directory_is_io_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("flows.csv");
        let err = export_to_file(&filled_table(), &path).unwrap_err();
        assert!(matches!(
            err,
            FlowTableError::IoFailure {
                stage: IoStage::Open,
                ..
            }
        ));
        assert!(!path.exists());
    }

    #[test]
    fn stats_display_reads_like_report() {
        let s = FlowStats {
            flows: 1,
            bytes: 2,
            packets: 3,
            occupied_slots: 1,
            longest_chain: 1,
        };
        assert!(s.to_string().starts_with("total flows = 1 total bytes = 2 total pkts = 3"));
        let json = serde_json::to_value(s).unwrap();
        assert_eq!(json["packets"], 3);
    }
}
