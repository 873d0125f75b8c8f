//! L1: mini-transaction (MTR) — a short critical section that groups
//! page latches and redo records and commits them atomically (spec §2,
//! §9 "Exceptions / long-jumps for rollback").
//!
//! Page latches themselves are owned as RAII guards by the caller's
//! stack (see `page::XPage`/`SLatch`), matching spec §9's instruction
//! to replace raw pointers with guard objects; the `Mtr` here owns only
//! the redo-record buffer and the commit/rollback discipline. Rollback
//! is never modeled with unwinding — an `Mtr` dropped without `commit`
//! simply discards its buffered redo records, which is the status-quo
//! "no partial mutation escapes" rule from spec §4.1 "Failure semantics".

use crate::error::Result;
use crate::types::TrxId;

/// One physical change the mini-transaction will ask the (external)
/// redo log to durably record on commit. The log's own format is out
/// of scope (spec §1); this is the shape of what the core hands it.
#[derive(Debug, Clone)]
pub enum RedoRecord {
    LeafInsert { page: u32, at: usize },
    LeafDelete { page: u32, at: usize },
    LeafUpdate { page: u32, at: usize },
    SplitLeaf { left: u32, right: u32 },
    MergeLeaf { into: u32, from: u32 },
}

/// The collaborator interface consumed (spec §6: "log.reserve(n_bytes) /
/// log.write(record)").
pub trait RedoLog: Send + Sync {
    fn write(&self, trx: TrxId, records: &[RedoRecord]) -> Result<()>;
}

/// A redo log that discards everything — useful for tests and for
/// embedding this core where crash recovery is handled entirely by an
/// outer layer.
pub struct NullRedoLog;

impl RedoLog for NullRedoLog {
    fn write(&self, _trx: TrxId, _records: &[RedoRecord]) -> Result<()> {
        Ok(())
    }
}

pub struct Mtr<'a> {
    trx: TrxId,
    log: &'a dyn RedoLog,
    records: Vec<RedoRecord>,
    committed: bool,
}

impl<'a> Mtr<'a> {
    pub fn start(trx: TrxId, log: &'a dyn RedoLog) -> Mtr<'a> {
        Mtr { trx, log, records: Vec::new(), committed: false }
    }

    pub fn push(&mut self, record: RedoRecord) {
        self.records.push(record);
    }

    /// Commit the mini-transaction: flush buffered redo records
    /// atomically. On success every page latch the caller is still
    /// holding may now be released.
    pub fn commit(mut self) -> Result<()> {
        self.log.write(self.trx, &self.records)?;
        self.committed = true;
        Ok(())
    }
}

impl<'a> Drop for Mtr<'a> {
    fn drop(&mut self) {
        if !self.committed && !self.records.is_empty() {
            log::debug!(
                "mtr for {} dropped without commit, discarding {} redo record(s)",
                self.trx,
                self.records.len()
            );
        }
    }
}
