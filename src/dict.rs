//! Dictionary (catalog) collaborator boundary (spec §5 "Dict latch:
//! one per catalog; freezes read-mostly, upgrades rarely"). The real
//! data dictionary — table/column metadata storage, DDL transactions —
//! is out of scope; this module gives the FK checker and the scrubber
//! enough of a catalog to resolve table/index identity and foreign-key
//! constraints.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeAction {
    Restrict,
    Cascade,
    SetNull,
}

#[derive(Debug, Clone)]
pub struct ForeignKey {
    pub name: String,
    pub child_table: String,
    pub child_columns: Vec<usize>,
    pub parent_table: String,
    pub parent_index: String,
    pub parent_columns: Vec<usize>,
    pub on_delete: CascadeAction,
    pub on_update: CascadeAction,
}

#[derive(Debug, Clone, Default)]
pub struct IndexDescriptor {
    pub name: String,
    pub table: String,
    pub index_id: u64,
    pub unique: bool,
    pub nulls_equal: bool,
    pub n_unique: usize,
}

#[derive(Debug, Clone, Default)]
pub struct TableDescriptor {
    pub name: String,
    pub not_null_columns: Vec<usize>,
    /// Declared max footprint (bytes) per column position, parallel to
    /// `not_null_columns`'s indexing convention; `None` means unbounded
    /// (e.g. an `Int` column, or a `Text`/`Bytes` column with no declared
    /// cap). Used by the FK cascade width-narrowing check (spec §4.3
    /// "Cascading": "or narrow a column's width below the current
    /// value").
    pub column_widths: Vec<Option<usize>>,
    pub fks_as_child: Vec<ForeignKey>, // constraints naming this table as child
    pub fks_as_parent: Vec<ForeignKey>, // constraints naming this table as parent
}

impl TableDescriptor {
    /// Declared max width for `col`, if any (`None` for an unbounded or
    /// undeclared column).
    pub fn column_width(&self, col: usize) -> Option<usize> {
        self.column_widths.get(col).copied().flatten()
    }
}

/// spec §6 "dict.open_table_by_index_id(index_id) → table | not-found"
/// plus the FK/table metadata lookups §4.3/§4.6 need.
pub trait Dictionary: Send + Sync {
    fn open_table_by_index_id(&self, index_id: u64) -> Result<TableDescriptor>;
    fn table(&self, name: &str) -> Result<TableDescriptor>;
    fn index(&self, name: &str) -> Result<IndexDescriptor>;
}

#[derive(Default)]
pub struct InMemoryDictionary {
    tables: RwLock<HashMap<String, TableDescriptor>>,
    indexes: RwLock<HashMap<String, IndexDescriptor>>,
    index_id_to_table: RwLock<HashMap<u64, String>>,
}

impl InMemoryDictionary {
    pub fn new() -> InMemoryDictionary {
        Self::default()
    }

    pub fn add_table(&self, table: TableDescriptor) {
        self.tables.write().insert(table.name.clone(), table);
    }

    pub fn add_index(&self, index: IndexDescriptor) {
        self.index_id_to_table.write().insert(index.index_id, index.table.clone());
        self.indexes.write().insert(index.name.clone(), index);
    }
}

impl Dictionary for InMemoryDictionary {
    fn open_table_by_index_id(&self, index_id: u64) -> Result<TableDescriptor> {
        let name = self
            .index_id_to_table
            .read()
            .get(&index_id)
            .cloned()
            .ok_or_else(|| Error::Corruption { index: index_id.to_string(), detail: "unknown index id".into() })?;
        self.table(&name)
    }

    fn table(&self, name: &str) -> Result<TableDescriptor> {
        self.tables.read().get(name).cloned().ok_or_else(|| Error::Corruption {
            index: name.to_string(),
            detail: "unknown table".into(),
        })
    }

    fn index(&self, name: &str) -> Result<IndexDescriptor> {
        self.indexes.read().get(name).cloned().ok_or_else(|| Error::Corruption {
            index: name.to_string(),
            detail: "unknown index".into(),
        })
    }
}
