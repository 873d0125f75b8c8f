//! L2: record codec — encodes/decodes physical records (spec §6
//! "Record format on disk").
//!
//! The original distinguishes "compact" and "redundant" row formats;
//! this core only needs one, so the codec is a single dispatcher on
//! "has off-page columns" rather than a deep format hierarchy (spec §9
//! "Manually-tagged polymorphism" re-architecture note): every branch
//! produces one typed view, `DecodedRecord`.

use crate::error::{Error, Result};
use crate::types::{ColumnValue, ExternRef, PrimaryKey, RollPtr, Row, TrxId};

/// A byte-for-byte diff between two rows' user columns, used by
/// `ClusteredIndex::update_row` to decide update-in-place vs.
/// delete-mark+reinsert (spec §4.1 "Key algorithm for update").
#[derive(Debug, Clone)]
pub struct ColumnDiff {
    pub changed: Vec<(usize, ColumnValue, ColumnValue)>, // (col idx, old, new)
}

impl ColumnDiff {
    pub fn compute(old: &Row, new: &Row) -> ColumnDiff {
        let mut changed = Vec::new();
        for (i, (o, n)) in old.columns.iter().zip(new.columns.iter()).enumerate() {
            if o != n {
                changed.push((i, o.clone(), n.clone()));
            }
        }
        ColumnDiff { changed }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// Whether applying this diff changes the on-page footprint: a
    /// length-changing column was touched, or an off-page column was
    /// newly introduced (spec §4.1: "If no length-changing column is
    /// touched and no off-page column is introduced, do update-in-place").
    pub fn is_length_changing(&self) -> bool {
        self.changed.iter().any(|(_, o, n)| o.footprint() != n.footprint())
    }
}

/// Encode a row's fixed header: extra-size byte(s), null bitmap
/// (ceil(n_nullable/8) bytes), per-variable-length-field length bytes
/// (spec §6).
pub fn encode_row(row: &Row) -> Vec<u8> {
    let mut buf = Vec::new();

    let null_bitmap_len = (row.columns.len() + 7) / 8;
    let mut null_bitmap = vec![0u8; null_bitmap_len];
    for (i, c) in row.columns.iter().enumerate() {
        if c.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }

    // var-length field lengths, one byte per non-null variable field,
    // capped at 255 (mirrors the original's length-byte convention;
    // longer fields are the off-page / extern case).
    let mut var_lens = Vec::new();
    for c in &row.columns {
        match c {
            ColumnValue::Bytes(b) => var_lens.push(b.len().min(255) as u8),
            ColumnValue::Text(s) => var_lens.push(s.len().min(255) as u8),
            _ => {}
        }
    }

    let extra_size = null_bitmap.len() + var_lens.len();
    write_extra_size(&mut buf, extra_size);
    buf.extend_from_slice(&null_bitmap);
    buf.extend_from_slice(&var_lens);

    // PK, then user columns, then the trailing system columns
    // (spec §3: "trailing system columns are DB_TRX_ID and DB_ROLL_PTR").
    encode_tuple(&mut buf, &row.primary_key);
    for c in &row.columns {
        encode_value(&mut buf, c);
    }
    buf.extend_from_slice(&row.trx_id.0.to_be_bytes());
    buf.extend_from_slice(&row.roll_ptr.0.to_be_bytes());
    buf.push(row.info_bits | if row.delete_marked { 0x80 } else { 0 });

    buf.push(row.externs.len() as u8);
    for (col, ext) in &row.externs {
        buf.push(*col as u8);
        ext.encode(&mut buf);
    }

    buf
}

pub(crate) fn encode_tuple(buf: &mut Vec<u8>, tuple: &[ColumnValue]) {
    buf.push(tuple.len() as u8);
    for v in tuple {
        encode_value(buf, v);
    }
}

/// Encode one key component the same way the record codec does;
/// exposed for collaborators (e.g. the lock manager) that need an
/// opaque, comparably-ordered byte form of a key without depending on
/// the rest of the record shape.
pub fn encode_key_component(buf: &mut Vec<u8>, v: &ColumnValue) {
    encode_value(buf, v)
}

fn encode_value(buf: &mut Vec<u8>, v: &ColumnValue) {
    match v {
        ColumnValue::Null => buf.push(0),
        ColumnValue::Int(i) => {
            buf.push(1);
            buf.extend_from_slice(&i.to_be_bytes());
        }
        ColumnValue::Bytes(b) => {
            buf.push(2);
            buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
            buf.extend_from_slice(b);
        }
        ColumnValue::Text(s) => {
            buf.push(3);
            let bytes = s.as_bytes();
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(bytes);
        }
    }
}

fn decode_value(buf: &[u8], pos: &mut usize) -> Result<ColumnValue> {
    let tag = *buf.get(*pos).ok_or(short_buf())?;
    *pos += 1;
    match tag {
        0 => Ok(ColumnValue::Null),
        1 => {
            let bytes: [u8; 8] = buf.get(*pos..*pos + 8).ok_or(short_buf())?.try_into().unwrap();
            *pos += 8;
            Ok(ColumnValue::Int(i64::from_be_bytes(bytes)))
        }
        2 => {
            let len_bytes: [u8; 4] = buf.get(*pos..*pos + 4).ok_or(short_buf())?.try_into().unwrap();
            *pos += 4;
            let len = u32::from_be_bytes(len_bytes) as usize;
            let v = buf.get(*pos..*pos + len).ok_or(short_buf())?.to_vec();
            *pos += len;
            Ok(ColumnValue::Bytes(v))
        }
        3 => {
            let len_bytes: [u8; 4] = buf.get(*pos..*pos + 4).ok_or(short_buf())?.try_into().unwrap();
            *pos += 4;
            let len = u32::from_be_bytes(len_bytes) as usize;
            let v = buf.get(*pos..*pos + len).ok_or(short_buf())?.to_vec();
            *pos += len;
            Ok(ColumnValue::Text(String::from_utf8_lossy(&v).into_owned()))
        }
        _ => Err(Error::Corruption { index: "<record>".into(), detail: format!("bad type tag {tag}") }),
    }
}

pub(crate) fn decode_tuple(buf: &[u8], pos: &mut usize) -> Result<PrimaryKey> {
    let n = *buf.get(*pos).ok_or(short_buf())? as usize;
    *pos += 1;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(decode_value(buf, pos)?);
    }
    Ok(out)
}

fn short_buf() -> Error {
    Error::Corruption { index: "<record>".into(), detail: "short buffer".into() }
}

pub(crate) fn write_extra_size(buf: &mut Vec<u8>, n: usize) {
    // spec §6/§4.4: one byte if < 0x80, else a two-byte form with the
    // high bit of the first byte set.
    if n < 0x80 {
        buf.push(n as u8);
    } else {
        buf.push(0x80 | ((n >> 8) as u8 & 0x7F));
        buf.push((n & 0xFF) as u8);
    }
}

pub(crate) fn read_extra_size(buf: &[u8], pos: &mut usize) -> Result<usize> {
    let first = *buf.get(*pos).ok_or(short_buf())?;
    *pos += 1;
    if first & 0x80 == 0 {
        Ok(first as usize)
    } else {
        let second = *buf.get(*pos).ok_or(short_buf())?;
        *pos += 1;
        Ok((((first & 0x7F) as usize) << 8) | second as usize)
    }
}

pub fn decode_row(buf: &[u8]) -> Result<Row> {
    let mut pos = 0usize;
    let extra_size = read_extra_size(buf, &mut pos)?;
    pos += extra_size; // skip null bitmap + var-len bytes; re-derived from the tagged values below

    let primary_key = decode_tuple(buf, &mut pos)?;

    // user columns: we don't know the column count up front in this
    // generic codec, so columns are self-delimiting via their type tag
    // and the trailer is fixed-size; decode until the known trailer.
    let trailer_len = 8 + 8 + 1 + 1; // trx_id + roll_ptr + info_bits/delete + extern-count
    let mut columns = Vec::new();
    while buf.len() - pos > trailer_len {
        let save = pos;
        match decode_value(buf, &mut pos) {
            Ok(v) => columns.push(v),
            Err(_) => {
                pos = save;
                break;
            }
        }
    }

    let trx_id = TrxId(u64::from_be_bytes(buf.get(pos..pos + 8).ok_or(short_buf())?.try_into().unwrap()));
    pos += 8;
    let roll_ptr = RollPtr(u64::from_be_bytes(buf.get(pos..pos + 8).ok_or(short_buf())?.try_into().unwrap()));
    pos += 8;
    let info_byte = *buf.get(pos).ok_or(short_buf())?;
    pos += 1;
    let delete_marked = info_byte & 0x80 != 0;
    let info_bits = info_byte & 0x7F;

    let n_externs = *buf.get(pos).ok_or(short_buf())? as usize;
    pos += 1;
    let mut externs = Vec::with_capacity(n_externs);
    for _ in 0..n_externs {
        let col = *buf.get(pos).ok_or(short_buf())? as usize;
        pos += 1;
        let ext = ExternRef::decode(buf.get(pos..pos + ExternRef::ENCODED_LEN).ok_or(short_buf())?)?;
        pos += ExternRef::ENCODED_LEN;
        externs.push((col, ext));
    }

    Ok(Row { primary_key, columns, trx_id, roll_ptr, delete_marked, info_bits, externs })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_row_with_mixed_columns() {
        let mut row = Row::new(
            vec![ColumnValue::Int(7)],
            vec![ColumnValue::Text("hello".into()), ColumnValue::Null, ColumnValue::Bytes(vec![1, 2, 3])],
        );
        row.trx_id = TrxId(42);
        row.roll_ptr = RollPtr(9);
        row.delete_marked = true;
        row.externs.push((2, ExternRef { space_id: 1, page_no: 2, offset: 3, length: 500, owner: true, inherited: false }));

        let buf = encode_row(&row);
        let back = decode_row(&buf).unwrap();
        assert_eq!(back.primary_key, row.primary_key);
        assert_eq!(back.columns, row.columns);
        assert_eq!(back.trx_id, row.trx_id);
        assert_eq!(back.roll_ptr, row.roll_ptr);
        assert!(back.delete_marked);
        assert_eq!(back.externs, row.externs);
    }

    #[test]
    fn column_diff_detects_length_change() {
        let old = Row::new(vec![ColumnValue::Int(1)], vec![ColumnValue::Text("a".into())]);
        let new = Row::new(vec![ColumnValue::Int(1)], vec![ColumnValue::Text("much longer".into())]);
        let diff = ColumnDiff::compute(&old, &new);
        assert!(!diff.is_empty());
        assert!(diff.is_length_changing());
    }

    #[test]
    fn column_diff_in_place_when_same_length() {
        let old = Row::new(vec![ColumnValue::Int(1)], vec![ColumnValue::Int(5)]);
        let new = Row::new(vec![ColumnValue::Int(1)], vec![ColumnValue::Int(6)]);
        let diff = ColumnDiff::compute(&old, &new);
        assert!(!diff.is_empty());
        assert!(!diff.is_length_changing());
    }
}
