//! Fixed-capacity flow cache with per-slot spin locks.
//!
//! Workers fold parsed packets into [`FlowTable`] through
//! [`FlowTable::entry_add`]; the [`export`] module reads the live table back
//! out as statistics or a CSV file.

pub mod capture;
pub mod chain;
pub mod error;
pub mod export;
pub mod hash;
pub mod record;
pub mod table;

pub use chain::{BucketChain, Ingest};
pub use error::{FlowTableError, IoStage, Result};
pub use export::{ExportSummary, FlowStats, dump, export_to_file, render_csv, stats};
pub use hash::{HashFn, crc32c_u32, flow_hash};
pub use netflow_table_common::{FlowKey, Ipv4Header, TcpHeader};
pub use record::{FlowRecord, MatchMode};
pub use table::{DEFAULT_ENTRIES, FlowTable, MAX_ENTRIES, TableConfig};
