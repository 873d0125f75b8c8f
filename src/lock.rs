//! Lock manager collaborator boundary (spec §1: "the lock manager is
//! specified as an opaque service that grants row and table locks").
//! The real lock manager, its deadlock detector, and its hash-table
//! sharding are out of scope; this module gives the core something
//! real enough to test the FK checker and the writer's `LOCK_WAIT`
//! handling against.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::types::{PrimaryKey, TrxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    /// A gap lock on the absence of a key, used by the FK checker's
    /// parent-side probe (spec §4.3 "gap lock on absence").
    Gap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Wait,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct RowId {
    pub table: String,
    pub key: Vec<u8>, // flattened primary key, opaque to the lock manager
}

impl RowId {
    pub fn new(table: impl Into<String>, key: &PrimaryKey) -> RowId {
        let mut buf = Vec::new();
        for v in key {
            crate::record::encode_key_component(&mut buf, v);
        }
        RowId { table: table.into(), key: buf }
    }
}

/// spec §6 "lock_manager.acquire(kind, row_id, mode) → OK | WAIT".
pub trait LockManager: Send + Sync {
    fn acquire(&self, trx: TrxId, row: &RowId, mode: LockMode) -> Result<LockOutcome>;
    fn release_all(&self, trx: TrxId);
}

struct Held {
    mode: LockMode,
    holders: Vec<TrxId>,
}

/// A simple, non-deadlock-detecting in-memory lock table: multiple
/// shared holders coexist, a single exclusive holder excludes everyone
/// else. Real deadlock detection and lock-wait timeouts live in the
/// lock manager this core treats as external (spec §1).
#[derive(Default)]
pub struct InMemoryLockManager {
    table: Mutex<HashMap<RowId, Held>>,
}

impl InMemoryLockManager {
    pub fn new() -> InMemoryLockManager {
        Self::default()
    }
}

impl LockManager for InMemoryLockManager {
    fn acquire(&self, trx: TrxId, row: &RowId, mode: LockMode) -> Result<LockOutcome> {
        let mut table = self.table.lock();
        match table.get_mut(row) {
            None => {
                table.insert(row.clone(), Held { mode, holders: vec![trx] });
                Ok(LockOutcome::Granted)
            }
            Some(held) => {
                if held.holders.contains(&trx) {
                    return Ok(LockOutcome::Granted);
                }
                match (held.mode, mode) {
                    (LockMode::Shared, LockMode::Shared) => {
                        held.holders.push(trx);
                        Ok(LockOutcome::Granted)
                    }
                    _ => Ok(LockOutcome::Wait),
                }
            }
        }
    }

    fn release_all(&self, trx: TrxId) {
        let mut table = self.table.lock();
        table.retain(|_, held| {
            held.holders.retain(|h| *h != trx);
            !held.holders.is_empty()
        });
    }
}
