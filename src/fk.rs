//! L6: the synchronous foreign-key checker (spec §4.3).
//!
//! The checker never holds an index latch while waiting on the lock
//! manager or recursing into a cascade (spec §5 "index descent must
//! not wait on a lock while holding an index latch") — it only talks to
//! the `Dictionary` for constraint metadata, the `LockManager` for row
//! locks, and a `FkCatalog` callback for the actual parent/child
//! row probes and cascaded mutations, which `table.rs` implements so
//! this module never depends on the clustered-index/table layer above
//! it (spec §9 "Global mutable state" — services passed in, not an
//! ambient singleton).

use std::collections::HashSet;

use crate::dict::{CascadeAction, Dictionary, ForeignKey};
use crate::error::{Error, Result};
use crate::lock::{LockManager, LockMode, LockOutcome, RowId};
use crate::types::{ColumnValue, PrimaryKey, TrxId};

/// Collaborator the checker cascades through (spec §6 "clust.update" /
/// "clust.delete" exposed by the core, consumed here for the cascaded
/// side of a constraint).
pub trait FkCatalog: Send + Sync {
    fn probe_parent_exists(&self, parent_table: &str, parent_index: &str, key: &[ColumnValue]) -> Result<bool>;
    fn probe_children(&self, child_table: &str, child_fk: &str, key: &[ColumnValue]) -> Result<Vec<PrimaryKey>>;
    fn cascade_delete(&self, trx: TrxId, table: &str, pk: &PrimaryKey) -> Result<()>;
    fn cascade_set_null(&self, trx: TrxId, table: &str, pk: &PrimaryKey, columns: &[usize]) -> Result<()>;
    /// ON UPDATE CASCADE: re-point `columns` on the child row to the
    /// parent's new key values (spec §4.3 cascading — distinct from
    /// `cascade_set_null`, which SET NULLs rather than re-pointing).
    fn cascade_update_fk(&self, trx: TrxId, table: &str, pk: &PrimaryKey, columns: &[usize], values: &[ColumnValue]) -> Result<()>;
}

/// One cascaded write, recorded during the planning walk rather than
/// executed immediately (spec §9 Design Notes / P6): the whole cascade
/// graph is walked and every branch's depth checked *before* any of
/// these run, so a `FOREIGN_EXCEED_MAX_CASCADE` anywhere in the graph
/// leaves every table untouched.
enum PlannedMutation {
    Delete { table: String, pk: PrimaryKey },
    SetNull { table: String, pk: PrimaryKey, columns: Vec<usize> },
    UpdateFk { table: String, pk: PrimaryKey, columns: Vec<usize>, values: Vec<ColumnValue> },
}

pub struct ForeignKeyChecker<'a> {
    dict: &'a dyn Dictionary,
    locks: &'a dyn LockManager,
    catalog: &'a dyn FkCatalog,
    pub fk_checks_enabled: bool,
    pub max_cascade_depth: usize,
}

impl<'a> ForeignKeyChecker<'a> {
    pub fn new(dict: &'a dyn Dictionary, locks: &'a dyn LockManager, catalog: &'a dyn FkCatalog, max_cascade_depth: usize) -> ForeignKeyChecker<'a> {
        ForeignKeyChecker { dict, locks, catalog, fk_checks_enabled: true, max_cascade_depth }
    }

    fn fk_values_all_null(values: &[ColumnValue]) -> bool {
        // SQL MATCH SIMPLE: satisfied if *any* FK column is NULL.
        values.iter().any(ColumnValue::is_null)
    }

    /// Child-side check before an insert/update makes `values` the new
    /// FK column values for `table` (spec §4.3 contract, "child-side:
    /// parent row").
    pub fn check_child_write(&self, trx: TrxId, fk: &ForeignKey, values: &[ColumnValue]) -> Result<()> {
        if !self.fk_checks_enabled {
            return Ok(());
        }
        if Self::fk_values_all_null(values) {
            return Ok(());
        }

        let parent_row = RowId::new(&fk.parent_table, &values.to_vec());
        match self.locks.acquire(trx, &parent_row, LockMode::Shared)? {
            LockOutcome::Wait => return Err(Error::LockWait),
            LockOutcome::Granted => {}
        }

        let exists = self.catalog.probe_parent_exists(&fk.parent_table, &fk.parent_index, values)?;
        if !exists {
            return Err(Error::NoReferencedRow { table: fk.child_table.clone(), constraint: fk.name.clone() });
        }
        Ok(())
    }

    /// Parent-side check before a delete or an update that changes
    /// `old_values` on the parent row (spec §4.3 contract, "parent-side:
    /// gap lock on absence").
    ///
    /// The whole cascade graph is planned first (`plan_parent_mutation`,
    /// which performs every probe/lock/depth check but defers every
    /// write into `plan`) and only executed once planning succeeds for
    /// every branch — a `FOREIGN_EXCEED_MAX_CASCADE` discovered ten
    /// levels down must not leave the shallower nine already mutated
    /// (spec P6, scenario S3).
    pub fn check_parent_delete(&self, trx: TrxId, fk: &ForeignKey, old_values: &[ColumnValue]) -> Result<()> {
        let mut plan = Vec::new();
        self.plan_parent_mutation(trx, fk, old_values, None, &mut HashSet::new(), 0, &mut plan)?;
        self.execute_plan(trx, &plan)
    }

    /// `new_values` are the parent row's new key values after the
    /// update (spec §4.3: ON UPDATE CASCADE re-points the child's FK
    /// columns to them rather than nulling them).
    pub fn check_parent_update(&self, trx: TrxId, fk: &ForeignKey, old_values: &[ColumnValue], new_values: &[ColumnValue]) -> Result<()> {
        let mut plan = Vec::new();
        self.plan_parent_mutation(trx, fk, old_values, Some(new_values), &mut HashSet::new(), 0, &mut plan)?;
        self.execute_plan(trx, &plan)
    }

    fn execute_plan(&self, trx: TrxId, plan: &[PlannedMutation]) -> Result<()> {
        for m in plan {
            match m {
                PlannedMutation::Delete { table, pk } => self.catalog.cascade_delete(trx, table, pk)?,
                PlannedMutation::SetNull { table, pk, columns } => self.catalog.cascade_set_null(trx, table, pk, columns)?,
                PlannedMutation::UpdateFk { table, pk, columns, values } => {
                    self.catalog.cascade_update_fk(trx, table, pk, columns, values)?
                }
            }
        }
        Ok(())
    }

    /// Walks one level of the cascade graph, appending every write it
    /// would perform to `plan` instead of performing it, then recurses
    /// into grandchildren the same way. Locks are still acquired here
    /// (they are reservations, not mutations) so a concurrent cascade
    /// cannot interleave with this one once planning has touched a row.
    fn plan_parent_mutation(
        &self,
        trx: TrxId,
        fk: &ForeignKey,
        old_values: &[ColumnValue],
        new_values: Option<&[ColumnValue]>,
        updated_tables: &mut HashSet<String>,
        depth: usize,
        plan: &mut Vec<PlannedMutation>,
    ) -> Result<()> {
        let is_delete = new_values.is_none();
        if !self.fk_checks_enabled {
            return Ok(());
        }
        if Self::fk_values_all_null(old_values) {
            return Ok(());
        }

        let gap = RowId::new(&fk.child_table, &old_values.to_vec());
        match self.locks.acquire(trx, &gap, LockMode::Gap)? {
            LockOutcome::Wait => return Err(Error::LockWait),
            LockOutcome::Granted => {}
        }

        let children = self.catalog.probe_children(&fk.child_table, &fk.name, old_values)?;
        if children.is_empty() {
            return Ok(());
        }

        let action = if is_delete { fk.on_delete } else { fk.on_update };
        match action {
            CascadeAction::Restrict => {
                Err(Error::RowIsReferenced { table: fk.parent_table.clone(), constraint: fk.name.clone() })
            }
            CascadeAction::Cascade | CascadeAction::SetNull => {
                if depth + 1 > self.max_cascade_depth {
                    return Err(Error::ForeignExceedMaxCascade { constraint: fk.name.clone(), cap: self.max_cascade_depth });
                }
                if action == CascadeAction::SetNull {
                    let child_table = self.dict.table(&fk.child_table)?;
                    for col in &fk.child_columns {
                        if child_table.not_null_columns.contains(col) {
                            return Err(Error::RowIsReferenced {
                                table: fk.parent_table.clone(),
                                constraint: fk.name.clone(),
                            });
                        }
                    }
                }
                // spec §4.3 "Cascading": "a cascade ... that would ...
                // narrow a column's width below the current value
                // returns ROW_IS_REFERENCED". Only ON UPDATE CASCADE
                // writes a new value into the child column wide enough
                // to matter; a delete-cascade removes the row outright
                // and SET NULL's footprint is always 0.
                if action == CascadeAction::Cascade && !is_delete {
                    let child_table = self.dict.table(&fk.child_table)?;
                    let new_values = new_values.expect("update path always carries new_values");
                    for (&col, value) in fk.child_columns.iter().zip(new_values) {
                        if let Some(max_width) = child_table.column_width(col) {
                            if value.footprint() > max_width {
                                return Err(Error::RowIsReferenced {
                                    table: fk.parent_table.clone(),
                                    constraint: fk.name.clone(),
                                });
                            }
                        }
                    }
                }
                if !is_delete {
                    // spec §4.3: refuse a path where the same table
                    // would be *updated* twice in one cascade chain.
                    if !updated_tables.insert(fk.child_table.clone()) {
                        return Err(Error::ForeignExceedMaxCascade { constraint: fk.name.clone(), cap: self.max_cascade_depth });
                    }
                }

                for child_pk in &children {
                    match action {
                        CascadeAction::Cascade if is_delete => {
                            lock_exclusive(self.locks, trx, &fk.child_table, child_pk)?;
                            plan.push(PlannedMutation::Delete { table: fk.child_table.clone(), pk: child_pk.clone() });
                        }
                        CascadeAction::SetNull => {
                            lock_exclusive(self.locks, trx, &fk.child_table, child_pk)?;
                            plan.push(PlannedMutation::SetNull {
                                table: fk.child_table.clone(),
                                pk: child_pk.clone(),
                                columns: fk.child_columns.clone(),
                            });
                        }
                        CascadeAction::Cascade => {
                            // ON UPDATE CASCADE with a changed parent
                            // key: re-point the child's FK columns to
                            // the parent's new key values.
                            let new_values = new_values.expect("update path always carries new_values");
                            lock_exclusive(self.locks, trx, &fk.child_table, child_pk)?;
                            plan.push(PlannedMutation::UpdateFk {
                                table: fk.child_table.clone(),
                                pk: child_pk.clone(),
                                columns: fk.child_columns.clone(),
                                values: new_values.to_vec(),
                            });
                        }
                        CascadeAction::Restrict => unreachable!(),
                    }

                    // Recurse into any FK where this child table is
                    // itself a parent, in declaration order (spec §9
                    // Open Question: "document a deterministic order").
                    // The nested probe's key is `child_pk` projected
                    // through the nested constraint's own parent_columns
                    // — the child row just mutated is the grandchild's
                    // parent now. Cascading down mirrors whether this
                    // level was itself a delete or an update: the
                    // cascaded row's own primary key never changes, only
                    // its FK columns do, so the nested key is unchanged
                    // either way. Probing against the still-unmutated
                    // grandchild rows is correct because nothing in
                    // `plan` has been executed yet.
                    let grandchild_table = self.dict.table(&fk.child_table)?;
                    for nested in &grandchild_table.fks_as_parent {
                        let nested_key: Vec<ColumnValue> = nested.parent_columns.iter().map(|&c| child_pk.get(c).cloned().unwrap_or(ColumnValue::Null)).collect();
                        let nested_new = if is_delete { None } else { Some(nested_key.clone()) };
                        self.plan_parent_mutation(trx, nested, &nested_key, nested_new.as_deref(), updated_tables, depth + 1, plan)?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn lock_exclusive(locks: &dyn LockManager, trx: TrxId, table: &str, pk: &PrimaryKey) -> Result<()> {
    let row = RowId::new(table, pk);
    match locks.acquire(trx, &row, LockMode::Exclusive)? {
        LockOutcome::Granted => Ok(()),
        LockOutcome::Wait => Err(Error::LockWait),
    }
}
