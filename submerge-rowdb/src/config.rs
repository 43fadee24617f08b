//! Tunables for the row-access layer (§4.7's `BIG_THRESHOLD` and external
//! sort batch size, plus a couple of knobs the expanded ambient-stack
//! section calls for).

/// Configuration for one [`crate::table::Table`]/store instance. Built
/// with defaults and overridden field-by-field, matching the teacher
/// crates' small config-struct-with-`Default` convention rather than a
/// builder type, since there is nothing here that needs validation.
#[derive(Debug, Clone)]
pub struct RowStoreConfig {
    /// Below this many rows, [`crate::sorted::SortedScanner`] sorts
    /// in-memory; at or above it, it spills through an external sorter
    /// (§4.7 "small" vs "big" mode).
    pub big_threshold: usize,
    /// Row batch size fed to the external sorter's transcoder between
    /// merge passes.
    pub sort_batch_size: usize,
}

impl Default for RowStoreConfig {
    fn default() -> Self {
        RowStoreConfig { big_threshold: 1_000_000, sort_batch_size: 100 }
    }
}
