use chrono::{DateTime, Utc};
use netflow_table_common::{FlowKey, Ipv4Header, TcpHeader};

use crate::error::{FlowTableError, Result};
use crate::record::{FlowRecord, MatchMode};

/// Outcome of folding one packet into a chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Ingest {
    /// An existing record absorbed the packet.
    Updated,
    /// The packet opened a new record at the tail of the chain.
    Created,
}

/// Records that landed on the same slot, in arrival order.
///
/// Records are only ever appended; nothing is removed until the chain drops.
#[derive(Debug, Default)]
pub struct BucketChain {
    records: Vec<FlowRecord>,
}

impl BucketChain {
    pub const fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FlowRecord> {
        self.records.iter()
    }

    pub fn find(&self, mode: MatchMode, key: &FlowKey) -> Option<&FlowRecord> {
        self.records.iter().find(|rec| mode.matches(rec, key))
    }

    /// Updates the first matching record, or appends a new one at the tail.
    ///
    /// Also returns how many non-matching records were walked past. The chain
    /// is unchanged when growing it fails.
    pub fn upsert(
        &mut self,
        mode: MatchMode,
        key: &FlowKey,
        ip: &Ipv4Header,
        tcp: Option<&TcpHeader>,
        now: DateTime<Utc>,
    ) -> Result<(Ingest, usize)> {
        for (collisions, rec) in self.records.iter_mut().enumerate() {
            if mode.matches(rec, key) {
                rec.absorb(key, ip, tcp, now);
                return Ok((Ingest::Updated, collisions));
            }
        }

        self.records
            .try_reserve(1)
            .map_err(|_| FlowTableError::OutOfMemory {
                what: "flow record",
            })?;
        self.records
            .push(FlowRecord::first_packet(key, ip, tcp, now));
        Ok((Ingest::Created, self.records.len() - 1))
    }

    /// Releases every record, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let released = self.records.len();
        self.records = Vec::new();
        released
    }
}

impl<'a> IntoIterator for &'a BucketChain {
    type Item = &'a FlowRecord;
    type IntoIter = std::slice::Iter<'a, FlowRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
