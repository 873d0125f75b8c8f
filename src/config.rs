//! Engine-wide tunables. Parsing these from a config file is explicitly
//! out of scope (spec §1 Non-goals name "configuration parsing" as an
//! external concern); this struct is the in-process ambient concern
//! that survives that exclusion.

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Online-log block size (spec §4.4, §6). Default 1 MiB.
    pub online_log_block_size: usize,
    /// Online-log total size cap; exceeding it aborts the ALTER with
    /// `ONLINE_LOG_TOO_BIG` (spec §4.4).
    pub online_log_max_bytes: u64,
    /// FK cascade depth cap (spec §4.3, reference design: 15).
    pub fk_max_cascade_depth: usize,
    /// Bulk-builder in-memory sort-buffer bound (spec §4.5).
    pub bulk_sort_buffer_bytes: usize,
    /// Fraction [0.0, 1.0] of a leaf page the bulk loader fills before
    /// starting a new leaf (spec §4.5 "fills leaf pages to a configured
    /// fraction").
    pub bulk_leaf_fill_factor: f64,
    /// Nominal page size used by leaf-fit computations throughout L4/L8.
    pub page_size_bytes: usize,
    /// Scrubber dictionary-latch busy-wait slice (spec §5 "yields in 250
    /// ms slices").
    pub scrub_dict_wait_slice_ms: u64,
    /// Scrubber dictionary-latch diagnostic threshold (spec §4.6: "30
    /// second diagnostic").
    pub scrub_dict_diagnostic_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            online_log_block_size: 1024 * 1024,
            online_log_max_bytes: 128 * 1024 * 1024,
            fk_max_cascade_depth: 15,
            bulk_sort_buffer_bytes: 16 * 1024 * 1024,
            bulk_leaf_fill_factor: 0.93,
            page_size_bytes: 16 * 1024,
            scrub_dict_wait_slice_ms: 250,
            scrub_dict_diagnostic_secs: 30,
        }
    }
}
