//! Error taxonomy shared by every layer (spec §7). One tagged enum,
//! mapped implementation-neutral names to a real `std::error::Error`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every variant names the table/index/constraint it concerns where the
/// spec calls that out as user-visible (§7 "User-visible behavior").
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("duplicate key in index {index}")]
    DuplicateKey { index: String },

    #[error("record not found")]
    RecordNotFound,

    #[error("lock wait")]
    LockWait,

    #[error("lock wait timed out after {0:?}")]
    LockWaitTimeout(std::time::Duration),

    #[error("deadlock detected, victim trx {victim}")]
    Deadlock { victim: u64 },

    #[error("out of file space for index {index}")]
    OutOfFileSpace { index: String },

    #[error("out of memory while {context}")]
    OutOfMemory { context: String },

    #[error("corruption detected in index {index}: {detail}")]
    Corruption { index: String, detail: String },

    #[error("operation interrupted")]
    Interrupted,

    #[error("NOT NULL constraint violated for column {column} in table {table}")]
    InvalidNull { table: String, column: String },

    #[error("virtual column compute failed for column {column}")]
    ComputeValueFailed { column: String },

    #[error("page overflow")]
    Overflow,

    #[error("page underflow")]
    Underflow,

    #[error("no referenced row for constraint {constraint} on table {table}")]
    NoReferencedRow { table: String, constraint: String },

    #[error("row is referenced by constraint {constraint} on table {table}")]
    RowIsReferenced { table: String, constraint: String },

    #[error("cascade chain for constraint {constraint} exceeded the configured cap of {cap}")]
    ForeignExceedMaxCascade { constraint: String, cap: usize },

    #[error("online log for index {index} exceeded its configured size cap of {cap_bytes} bytes")]
    OnlineLogTooBig { index: String, cap_bytes: u64 },

    #[error("decryption failed for online-log block of index {index}")]
    DecryptionFailed { index: String },

    #[error("failed to write temporary file: {0}")]
    TempFileWriteFail(String),

    #[error("record too big for index {index}: {size} bytes")]
    TooBigRecord { index: String, size: usize },

    #[error("undo history required by the open read view is missing")]
    MissingHistory,

    #[error("retry the same operation in pessimistic mode")]
    RetryPessimistic,

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(e.to_string())
    }
}
