//! prgate-ledger: persistence for job runs
//!
//! Every job executed by the gate is recorded as a run: an ordered stream of
//! stage events followed by a terminal summary. The gate can later re-derive
//! a verdict from the stored events alone.
//!
//! ## Key Components
//!
//! - `RunLedger`: backend-agnostic trait for run persistence
//! - `MemoryRunLedger`: in-memory fake used by tests
//! - `FsRunLedger`: directory-per-run backend used by the CLI

mod error;
pub mod fakes;
pub mod fs_ledger;
pub mod storage_traits;

pub use error::StorageError;
pub use fakes::MemoryRunLedger;
pub use fs_ledger::FsRunLedger;
pub use storage_traits::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageResult,
};
