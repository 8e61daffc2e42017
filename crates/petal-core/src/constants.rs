//! Protocol and pool constants. All amounts are in the smallest unit (groth).

/// Smallest units per coin.
pub const COIN: u64 = 100_000_000;

/// Default bytes added to every measured transaction size.
///
/// Covers the variability of signature and range-proof encodings so that
/// two otherwise identical transactions rank the same.
pub const DEFAULT_SIZE_CORRECTION: u32 = 64;

/// Default lower bound of the randomized stem embargo, in milliseconds.
pub const DEFAULT_STEM_TIMEOUT_MIN_MS: u64 = 20_000;

/// Default upper bound of the randomized stem embargo, in milliseconds.
pub const DEFAULT_STEM_TIMEOUT_MAX_MS: u64 = 50_000;

/// Default time a fresh stem transaction waits for aggregation partners.
pub const DEFAULT_AGGREGATION_TIME_MS: u64 = 10_000;

/// Default number of outputs after which an aggregating element stops
/// looking for merge partners.
pub const DEFAULT_AGGREGATION_OUTPUTS: usize = 5;

/// Default probability (out of `u16::MAX`) that a stem hop fluffs instead of
/// forwarding. `0x1999` is roughly 10%.
pub const DEFAULT_FLUFF_PROBABILITY: u16 = 0x1999;

/// Default number of blocks an outdated transaction is retained for, so a
/// short reorg can bring it back.
pub const DEFAULT_OUTDATED_RETENTION: u64 = 60;

/// Default serialized-size budget for block candidate selection (1 MiB).
pub const DEFAULT_BLOCK_SIZE_BUDGET: u32 = 1024 * 1024;

/// Default maximum size of a transaction produced by stem aggregation.
pub const DEFAULT_MAX_MERGED_SIZE: u32 = 128 * 1024;

/// Default maximum depth of a speculative dependent chain.
pub const DEFAULT_DEPENDENT_MAX_DEPTH: u32 = 32;

/// Default cap on cumulative serialized size along a dependent chain.
pub const DEFAULT_DEPENDENT_MAX_SIZE: u32 = 512 * 1024;

/// Default cap on cumulative BVM charge along a dependent chain.
pub const DEFAULT_DEPENDENT_MAX_BVM_CHARGE: u32 = 10_000_000;
