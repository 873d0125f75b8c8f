//! L7: the online rebuild log (spec §4.4, §6 "Online-log block layout").
//!
//! A per-index append-only journal of DML, replayed by a catch-up
//! applier while a concurrent ALTER TABLE builds or rebuilds an index.
//! Block/flush discipline follows a standard fixed-size-block WAL,
//! generalized from a single stream to the two DML alphabets spec
//! §4.4 names.

use std::io::{Read, Write};
use std::path::PathBuf;

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::error::{Error, Result};
use crate::latch::IndexLatch;
use crate::record::{decode_row, decode_tuple, encode_row, encode_tuple, read_extra_size, write_extra_size};
use crate::types::{IndexKey, PrimaryKey, Row, TrxId};

const OP_ROW_INSERT: u8 = 0x41;
const OP_ROW_UPDATE: u8 = 0x42;
const OP_ROW_DELETE: u8 = 0x43;
const OP_SEC_INSERT: u8 = 0x61;
const OP_SEC_DELETE: u8 = 0x62;
const OP_END_OF_LIST: u8 = 0x00;

/// spec §4.4 "Two sub-variants".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogVariant {
    SecondaryBuild,
    TableRebuild,
}

#[derive(Debug, Clone)]
pub enum OnlineOp {
    RowInsert { row: Row },
    RowUpdate { old_pk: Option<PrimaryKey>, row: Row },
    RowDelete { old_pk: Option<PrimaryKey> },
    SecInsert { entry: IndexKey, pk: PrimaryKey, trx_id: TrxId },
    SecDelete { entry: IndexKey, pk: PrimaryKey },
}

fn normalize_trx_id(trx_id: TrxId, alter_trx_id: TrxId) -> TrxId {
    // spec §4.4: "Any record whose trx_id predates the ALTER transaction's
    // id is normalized to a sentinel trx_id".
    if trx_id < alter_trx_id {
        TrxId::RESET
    } else {
        trx_id
    }
}

fn encode_op(op: &OnlineOp, same_pk: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    match op {
        OnlineOp::RowInsert { row } => {
            let body = encode_row(row);
            buf.push(OP_ROW_INSERT);
            write_extra_size(&mut buf, body.len());
            buf.extend_from_slice(&body);
        }
        OnlineOp::RowUpdate { old_pk, row } => {
            let mut payload = Vec::new();
            if !same_pk {
                encode_tuple(&mut payload, old_pk.as_deref().unwrap_or(&[]));
            }
            payload.extend_from_slice(&encode_row(row));
            buf.push(OP_ROW_UPDATE);
            write_extra_size(&mut buf, payload.len());
            buf.extend_from_slice(&payload);
        }
        OnlineOp::RowDelete { old_pk } => {
            let mut payload = Vec::new();
            if !same_pk {
                encode_tuple(&mut payload, old_pk.as_deref().unwrap_or(&[]));
            }
            buf.push(OP_ROW_DELETE);
            write_extra_size(&mut buf, payload.len());
            buf.extend_from_slice(&payload);
        }
        OnlineOp::SecInsert { entry, pk, trx_id } => {
            let mut payload = Vec::new();
            encode_tuple(&mut payload, entry);
            encode_tuple(&mut payload, pk);
            buf.push(OP_SEC_INSERT);
            write_extra_size(&mut buf, payload.len());
            let trx_bytes = trx_id.0.to_be_bytes();
            buf.extend_from_slice(&trx_bytes[2..8]); // low 6 bytes
            buf.extend_from_slice(&payload);
        }
        OnlineOp::SecDelete { entry, pk } => {
            let mut payload = Vec::new();
            encode_tuple(&mut payload, entry);
            encode_tuple(&mut payload, pk);
            buf.push(OP_SEC_DELETE);
            write_extra_size(&mut buf, payload.len());
            buf.extend_from_slice(&payload);
        }
    }
    buf
}

fn decode_op(buf: &[u8], pos: &mut usize, same_pk: bool) -> Result<Option<OnlineOp>> {
    if *pos >= buf.len() {
        return Ok(None);
    }
    let opcode = buf[*pos];
    if opcode == OP_END_OF_LIST {
        return Ok(None);
    }
    *pos += 1;
    let extra = read_extra_size(buf, pos)?;

    match opcode {
        OP_ROW_INSERT => {
            let body = buf.get(*pos..*pos + extra).ok_or_else(short)?;
            *pos += extra;
            Ok(Some(OnlineOp::RowInsert { row: decode_row(body)? }))
        }
        OP_ROW_UPDATE => {
            let payload = buf.get(*pos..*pos + extra).ok_or_else(short)?;
            *pos += extra;
            let mut p = 0usize;
            let old_pk = if !same_pk { Some(decode_tuple(payload, &mut p)?) } else { None };
            let row = decode_row(&payload[p..])?;
            Ok(Some(OnlineOp::RowUpdate { old_pk, row }))
        }
        OP_ROW_DELETE => {
            let payload = buf.get(*pos..*pos + extra).ok_or_else(short)?;
            *pos += extra;
            let mut p = 0usize;
            let old_pk = if !same_pk { Some(decode_tuple(payload, &mut p)?) } else { None };
            Ok(Some(OnlineOp::RowDelete { old_pk }))
        }
        OP_SEC_INSERT => {
            let trx_bytes = buf.get(*pos..*pos + 6).ok_or_else(short)?;
            *pos += 6;
            let mut full = [0u8; 8];
            full[2..8].copy_from_slice(trx_bytes);
            let trx_id = TrxId(u64::from_be_bytes(full));
            let payload_extra = extra - 6;
            let payload = buf.get(*pos..*pos + payload_extra).ok_or_else(short)?;
            *pos += payload_extra;
            let mut p = 0usize;
            let entry = decode_tuple(payload, &mut p)?;
            let pk = decode_tuple(payload, &mut p)?;
            Ok(Some(OnlineOp::SecInsert { entry, pk, trx_id }))
        }
        OP_SEC_DELETE => {
            let payload = buf.get(*pos..*pos + extra).ok_or_else(short)?;
            *pos += extra;
            let mut p = 0usize;
            let entry = decode_tuple(payload, &mut p)?;
            let pk = decode_tuple(payload, &mut p)?;
            Ok(Some(OnlineOp::SecDelete { entry, pk }))
        }
        other => Err(Error::Corruption { index: "<online-log>".into(), detail: format!("bad opcode 0x{other:02x}") }),
    }
}

fn short() -> Error {
    Error::Corruption { index: "<online-log>".into(), detail: "short online-log record".into() }
}

struct LogInner {
    head: Vec<u8>,
    head_used: usize,
    flushed: Vec<PathBuf>,
    next_block_no: u64,
    total_bytes: u64,
    applied_blocks: usize,
    applied_head_bytes: usize,
    aborted: bool,
}

/// One per index under construction (spec I6: "an index with
/// online-build status has an attached log; appending is serialized by
/// the index-specific log mutex, applying by an exclusive index
/// latch"). `index_latch` here stands in for the latch on the index
/// being built: appenders take it shared, the applier takes it
/// exclusive only for the in-memory tail block.
pub struct OnlineBuildLog {
    pub index_name: String,
    pub variant: LogVariant,
    pub same_pk: bool,
    pub alter_trx_id: TrxId,
    block_size: usize,
    cap_bytes: u64,
    index_latch: IndexLatch,
    inner: Mutex<LogInner>,
    scratch_dir: TempDir,
}

impl OnlineBuildLog {
    pub fn new(
        index_name: impl Into<String>,
        variant: LogVariant,
        same_pk: bool,
        alter_trx_id: TrxId,
        block_size: usize,
        cap_bytes: u64,
    ) -> Result<OnlineBuildLog> {
        let scratch_dir = tempfile::tempdir()?;
        Ok(OnlineBuildLog {
            index_name: index_name.into(),
            variant,
            same_pk,
            alter_trx_id,
            block_size,
            cap_bytes,
            index_latch: IndexLatch::new(),
            inner: Mutex::new(LogInner {
                head: vec![0u8; block_size],
                head_used: 0,
                flushed: Vec::new(),
                next_block_no: 0,
                total_bytes: 0,
                applied_blocks: 0,
                applied_head_bytes: 0,
                aborted: false,
            }),
            scratch_dir: scratch_dir,
        })
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    fn too_big(&self) -> Error {
        Error::OnlineLogTooBig { index: self.index_name.clone(), cap_bytes: self.cap_bytes }
    }

    /// Ordinary DML while the index is CREATING (spec §5 "Appenders
    /// hold an S-latch on the index and the log mutex, and write a
    /// single variable-length record").
    pub fn append(&self, op: OnlineOp) -> Result<()> {
        let mut op = op;
        if let OnlineOp::SecInsert { trx_id, .. } = &mut op {
            *trx_id = normalize_trx_id(*trx_id, self.alter_trx_id);
        }
        let bytes = encode_op(&op, self.same_pk);
        if bytes.len() + 1 > self.block_size {
            // +1 leaves room for the end-of-list sentinel.
            return Err(Error::TooBigRecord { index: self.index_name.clone(), size: bytes.len() });
        }

        let _s = self.index_latch.s_latch();
        let mut inner = self.inner.lock();
        if inner.aborted {
            return Err(self.too_big());
        }
        if inner.total_bytes + bytes.len() as u64 > self.cap_bytes {
            inner.aborted = true;
            return Err(self.too_big());
        }
        if inner.head_used + bytes.len() + 1 > self.block_size {
            self.flush_head(&mut inner)?;
        }
        let used = inner.head_used;
        inner.head[used..used + bytes.len()].copy_from_slice(&bytes);
        inner.head_used += bytes.len();
        inner.total_bytes += bytes.len() as u64;
        Ok(())
    }

    fn flush_head(&self, inner: &mut LogInner) -> Result<()> {
        let path = self.scratch_dir.path().join(format!("blk-{:08}", inner.next_block_no));
        let mut f = std::fs::File::create(&path)?;
        f.write_all(&inner.head)?;
        f.sync_data()?;
        inner.flushed.push(path);
        inner.next_block_no += 1;
        inner.head = vec![0u8; self.block_size];
        inner.head_used = 0;
        Ok(())
    }

    /// Drain every block (flushed plus the current in-memory tail),
    /// calling `apply_one` for each decoded op in order. The X-latch
    /// (simulated here by the log's own `index_latch`) is held only
    /// while decoding the tail block (spec §5).
    pub fn catch_up(&self, mut apply_one: impl FnMut(OnlineOp) -> Result<()>) -> Result<usize> {
        let mut applied = 0usize;

        loop {
            let (path, block_no) = {
                let inner = self.inner.lock();
                let idx = inner.applied_blocks;
                if idx >= inner.flushed.len() {
                    break;
                }
                (inner.flushed[idx].clone(), idx)
            };

            let mut buf = Vec::new();
            std::fs::File::open(&path)?.read_to_end(&mut buf)?;
            let mut pos = 0usize;
            while let Some(op) = decode_op(&buf, &mut pos, self.same_pk)? {
                apply_one(op)?;
                applied += 1;
            }

            let mut inner = self.inner.lock();
            if inner.applied_blocks == block_no {
                inner.applied_blocks += 1;
            }
        }

        // Final tail block: hold the exclusive latch across decode, but
        // never across apply_one's own I/O beyond what the caller does
        // under its own latching.
        let _x = self.index_latch.x_latch();
        let (buf, start) = {
            let inner = self.inner.lock();
            (inner.head[..inner.head_used].to_vec(), inner.applied_head_bytes)
        };
        let mut pos = start;
        while let Some(op) = decode_op(&buf, &mut pos, self.same_pk)? {
            apply_one(op)?;
            applied += 1;
        }
        self.inner.lock().applied_head_bytes = pos;

        Ok(applied)
    }

    /// spec: "the applier ... is finished when head-blocks equals
    /// tail-blocks and head-bytes equals tail-bytes."
    pub fn caught_up(&self) -> bool {
        let inner = self.inner.lock();
        inner.applied_blocks == inner.flushed.len() && inner.applied_head_bytes == inner.head_used
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnValue;

    fn row(pk: i64) -> Row {
        Row::new(vec![ColumnValue::Int(pk)], vec![ColumnValue::Text("v".into())])
    }

    #[test]
    fn appends_and_catches_up_in_order() {
        let log = OnlineBuildLog::new("ix1", LogVariant::TableRebuild, true, TrxId(0), 4096, 1024 * 1024).unwrap();
        log.append(OnlineOp::RowInsert { row: row(1) }).unwrap();
        log.append(OnlineOp::RowInsert { row: row(2) }).unwrap();
        log.append(OnlineOp::RowDelete { old_pk: None }).unwrap();

        let mut seen = Vec::new();
        let applied = log.catch_up(|op| {
            seen.push(op);
            Ok(())
        }).unwrap();
        assert_eq!(applied, 3);
        assert!(matches!(seen[0], OnlineOp::RowInsert { .. }));
        assert!(matches!(seen[2], OnlineOp::RowDelete { .. }));
        assert!(log.caught_up());
    }

    #[test]
    fn spills_across_block_boundary() {
        let log = OnlineBuildLog::new("ix2", LogVariant::TableRebuild, true, TrxId(0), 64, 1024 * 1024).unwrap();
        for i in 0..20 {
            log.append(OnlineOp::RowDelete { old_pk: None }).ok();
            let _ = i;
        }
        let mut count = 0;
        log.catch_up(|_op| {
            count += 1;
            Ok(())
        }).unwrap();
        assert!(count > 0);
        assert!(log.caught_up());
    }

    #[test]
    fn overflow_aborts_with_online_log_too_big_s6() {
        let log = OnlineBuildLog::new("ix3", LogVariant::TableRebuild, true, TrxId(0), 4096, 200).unwrap();
        let mut hit_cap = false;
        for i in 0..50 {
            match log.append(OnlineOp::RowInsert { row: row(i) }) {
                Ok(()) => {}
                Err(Error::OnlineLogTooBig { .. }) => {
                    hit_cap = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert!(hit_cap);
        assert!(log.is_aborted());
    }

    #[test]
    fn trx_id_predating_alter_is_normalized() {
        let log = OnlineBuildLog::new("ix4", LogVariant::SecondaryBuild, true, TrxId(100), 4096, 1024 * 1024).unwrap();
        log.append(OnlineOp::SecInsert {
            entry: vec![ColumnValue::Int(1)],
            pk: vec![ColumnValue::Int(1)],
            trx_id: TrxId(5),
        }).unwrap();
        let mut seen_trx = None;
        log.catch_up(|op| {
            if let OnlineOp::SecInsert { trx_id, .. } = op {
                seen_trx = Some(trx_id);
            }
            Ok(())
        }).unwrap();
        assert_eq!(seen_trx, Some(TrxId::RESET));
    }
}
