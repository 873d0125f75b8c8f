//! Shared identity and value types (spec §3 "Essential attributes").
//!
//! The SQL type system itself is the parser/planner's concern (spec §1
//! Non-goals); `ColumnValue` only needs enough structure to order keys,
//! express NULL, and carry off-page payloads.

use std::cmp::Ordering;
use std::fmt;

/// Transaction identifier. Monotonically assigned by the (external)
/// transaction manager; the core only ever compares and stores these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrxId(pub u64);

impl TrxId {
    /// Sentinel used by the online-log normalization rule (spec §4.4):
    /// any trx_id predating the ALTER is reset to this value.
    pub const RESET: TrxId = TrxId(0);
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trx#{}", self.0)
    }
}

/// Per-mutation sequence number used for undo ordering and read views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Seqno(pub u64);

/// Opaque pointer into the undo stream (DB_ROLL_PTR). `NULL` terminates
/// a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RollPtr(pub u64);

impl RollPtr {
    pub const NULL: RollPtr = RollPtr(0);

    pub fn is_null(&self) -> bool {
        *self == RollPtr::NULL
    }
}

/// A single column value. Ordering follows a fixed type-tag rank, then
/// the native value ordering (the collation itself is a SQL-layer
/// concern; this is the concrete collation the core tests against).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Approximate on-page footprint, used by the leaf-fit computation
    /// in §4.1 step 4 ("If the leaf has no room").
    pub fn footprint(&self) -> usize {
        match self {
            ColumnValue::Null => 0,
            ColumnValue::Int(_) => 8,
            ColumnValue::Bytes(b) => b.len(),
            ColumnValue::Text(s) => s.len(),
        }
    }
}

impl PartialOrd for ColumnValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ColumnValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use ColumnValue::*;
        fn rank(v: &ColumnValue) -> u8 {
            match v {
                Null => 0,
                Int(_) => 1,
                Bytes(_) => 2,
                Text(_) => 3,
            }
        }
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Int(a), Int(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            _ => rank(self).cmp(&rank(other)),
        }
    }
}

/// Ordered tuple of primary-key column values (spec §3 "primary_key").
pub type PrimaryKey = Vec<ColumnValue>;

/// Ordered tuple of secondary-index ordering columns (spec §3
/// "Secondary index entry").
pub type IndexKey = Vec<ColumnValue>;

/// A 20-byte off-page ("extern") column reference (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternRef {
    pub space_id: u32,
    pub page_no: u32,
    pub offset: u32,
    pub length: u64, // high two bits of the on-disk byte are flags; see below
    pub owner: bool,     // bit7: this record owns the blob, may free on purge
    pub inherited: bool, // bit6: rollback must not free
}

impl ExternRef {
    pub const ENCODED_LEN: usize = 20;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.space_id.to_be_bytes());
        buf.extend_from_slice(&self.page_no.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
        let mut len_bytes = self.length.to_be_bytes();
        let mut flags: u8 = 0;
        if self.owner {
            flags |= 0x80;
        }
        if self.inherited {
            flags |= 0x40;
        }
        // the two high bits of the length's top byte carry the flags;
        // the remaining 62 bits hold the actual length.
        len_bytes[0] = (len_bytes[0] & 0x3F) | flags;
        buf.extend_from_slice(&len_bytes);
    }

    pub fn decode(buf: &[u8]) -> crate::error::Result<ExternRef> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(crate::error::Error::Corruption {
                index: "<extern-ref>".into(),
                detail: "short buffer".into(),
            });
        }
        let space_id = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let page_no = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let offset = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let mut len_bytes: [u8; 8] = buf[12..20].try_into().unwrap();
        let flags = len_bytes[0] & 0xC0;
        len_bytes[0] &= 0x3F;
        let length = u64::from_be_bytes(len_bytes);
        Ok(ExternRef {
            space_id,
            page_no,
            offset,
            length,
            owner: flags & 0x80 != 0,
            inherited: flags & 0x40 != 0,
        })
    }
}

/// A logical row (spec §3 "Row"): primary key implicit in `columns`'
/// ordering-column prefix, user columns, and the two trailing system
/// columns every clustered record carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub primary_key: PrimaryKey,
    pub columns: Vec<ColumnValue>,
    pub trx_id: TrxId,
    pub roll_ptr: RollPtr,
    pub delete_marked: bool,
    /// Carries the "instant-add metadata" marker (spec §3).
    pub info_bits: u8,
    pub externs: Vec<(usize, ExternRef)>, // (column index, pointer)
}

impl Row {
    pub fn new(primary_key: PrimaryKey, columns: Vec<ColumnValue>) -> Row {
        Row {
            primary_key,
            columns,
            trx_id: TrxId::RESET,
            roll_ptr: RollPtr::NULL,
            delete_marked: false,
            info_bits: 0,
            externs: Vec::new(),
        }
    }

    pub fn footprint(&self) -> usize {
        self.primary_key.iter().map(ColumnValue::footprint).sum::<usize>()
            + self.columns.iter().map(ColumnValue::footprint).sum::<usize>()
            + self.externs.len() * ExternRef::ENCODED_LEN
    }
}
