use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use netflow_table_common::{FlowKey, Ipv4Header, TcpHeader};
use spin::Mutex;

use crate::chain::{BucketChain, Ingest};
use crate::error::{FlowTableError, Result};
use crate::hash::{HashFn, crc32c_u32, flow_hash};
use crate::record::{FlowRecord, MatchMode};

/// Largest slot count a table accepts; larger requests are clamped down to it.
pub const MAX_ENTRIES: u32 = 1 << 20;
pub const DEFAULT_ENTRIES: u32 = 1 << 16;

/// Creation parameters. Fixed for the lifetime of the table.
#[derive(Clone, Copy, Debug)]
pub struct TableConfig {
    pub entries: u32,
    pub hash: HashFn,
    /// Stored for the hash primitive's owner; slot placement always folds from zero.
    pub seed: u32,
    pub match_mode: MatchMode,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            entries: DEFAULT_ENTRIES,
            hash: crc32c_u32,
            seed: 0,
            match_mode: MatchMode::FiveTuple,
        }
    }
}

impl TableConfig {
    pub fn with_entries(entries: u32) -> Self {
        Self {
            entries,
            ..Self::default()
        }
    }
}

// One lock per slot, each on its own cache line so neighbouring slots don't
// bounce the same line between workers.
#[repr(align(64))]
struct Slot {
    chain: Mutex<BucketChain>,
}

impl Slot {
    const fn new() -> Self {
        Self {
            chain: Mutex::new(BucketChain::new()),
        }
    }
}

/// Fixed-size flow table striped into independently locked slots.
pub struct FlowTable {
    slots: Box<[Slot]>,
    mask: u32,
    record_size_hint: u32,
    numa_hint: Option<u32>,
    hash: HashFn,
    seed: u32,
    match_mode: MatchMode,
    // Relaxed and outside the slot locks: a running estimate, not a ledger.
    packets: AtomicU64,
}

impl FlowTable {
    /// Builds an empty table.
    ///
    /// The entry count is clamped to [`MAX_ENTRIES`] before it is checked, so
    /// an oversized request succeeds at the ceiling even if it is not itself a
    /// power of two.
    pub fn create(
        config: TableConfig,
        numa_hint: Option<u32>,
        record_size_hint: u32,
    ) -> Result<Self> {
        let mut entries = config.entries;
        if entries > MAX_ENTRIES {
            tracing::warn!(
                requested = entries,
                max = MAX_ENTRIES,
                "entry count larger than maximum, clamping"
            );
            entries = MAX_ENTRIES;
        }
        if entries == 0 {
            return Err(FlowTableError::InvalidConfiguration {
                reason: "entry count must be non-zero".to_string(),
            });
        }
        if !entries.is_power_of_two() {
            return Err(FlowTableError::InvalidConfiguration {
                reason: format!("entry count {entries} is not a power of two"),
            });
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(entries as usize)
            .map_err(|_| FlowTableError::OutOfMemory { what: "slot array" })?;
        slots.extend((0..entries).map(|_| Slot::new()));

        tracing::debug!(
            entries,
            record_size_hint,
            numa_hint = ?numa_hint,
            match_mode = ?config.match_mode,
            "flow table created"
        );

        Ok(Self {
            slots: slots.into_boxed_slice(),
            mask: entries - 1,
            record_size_hint,
            numa_hint,
            hash: config.hash,
            seed: config.seed,
            match_mode: config.match_mode,
            packets: AtomicU64::new(0),
        })
    }

    /// Tears a table down, releasing every record it holds.
    ///
    /// Returns the number of records released.
    pub fn destroy(table: Option<Self>) -> Result<usize> {
        let Some(table) = table else {
            tracing::error!("destroy called without a table");
            return Err(FlowTableError::InvalidArgument("table is absent"));
        };
        let released = table
            .slots
            .iter()
            .map(|slot| slot.chain.lock().clear())
            .sum();
        tracing::debug!(released, "flow table destroyed");
        Ok(released)
    }

    pub fn entries(&self) -> u32 {
        self.mask + 1
    }

    pub fn record_size_hint(&self) -> u32 {
        self.record_size_hint
    }

    pub fn numa_hint(&self) -> Option<u32> {
        self.numa_hint
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn match_mode(&self) -> MatchMode {
        self.match_mode
    }

    /// Packets ingested so far.
    ///
    /// Bumped with relaxed ordering after the slot lock is released, so it may
    /// briefly trail or lead the per-flow counters seen by a concurrent reader.
    pub fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn slot_index(&self, key: &FlowKey) -> usize {
        (flow_hash(self.hash, key) & self.mask) as usize
    }

    /// Folds one packet into its flow, creating the flow on first sight.
    ///
    /// Only the key's slot is locked. On `OutOfMemory` the table is untouched
    /// and the packet is not counted.
    pub fn entry_add(
        &self,
        key: &FlowKey,
        ip: &Ipv4Header,
        tcp: Option<&TcpHeader>,
    ) -> Result<Ingest> {
        let idx = self.slot_index(key);
        let (outcome, collisions) = {
            let mut chain = self.slots[idx].chain.lock();
            chain.upsert(self.match_mode, key, ip, tcp, Utc::now())?
        };
        self.packets.fetch_add(1, Ordering::Relaxed);
        if collisions > 0 {
            tracing::trace!(slot = idx, collisions, "bucket collision");
        }
        Ok(outcome)
    }

    /// Copy of the record `key` maps to, if any.
    pub fn lookup(&self, key: &FlowKey) -> Option<FlowRecord> {
        let chain = self.slots[self.slot_index(key)].chain.lock();
        chain.find(self.match_mode, key).cloned()
    }

    /// Visits every slot in index order, holding only that slot's lock while
    /// `f` runs. Stops at the first error.
    pub fn try_for_each_chain<E, F>(&self, mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(usize, &BucketChain) -> std::result::Result<(), E>,
    {
        for (idx, slot) in self.slots.iter().enumerate() {
            let chain = slot.chain.lock();
            f(idx, &chain)?;
        }
        Ok(())
    }

    pub fn for_each_chain<F>(&self, mut f: F)
    where
        F: FnMut(usize, &BucketChain),
    {
        let _ = self.try_for_each_chain::<std::convert::Infallible, _>(|idx, chain| {
            f(idx, chain);
            Ok(())
        });
    }
}

impl std::fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowTable")
            .field("entries", &self.entries())
            .field("record_size_hint", &self.record_size_hint)
            .field("numa_hint", &self.numa_hint)
            .field("seed", &self.seed)
            .field("match_mode", &self.match_mode)
            .field("packets", &self.packet_count())
            .finish()
    }
}
