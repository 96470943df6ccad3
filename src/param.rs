//! Static sizing of a volume's in-RAM working set.
//!
//! Nothing here is heap-allocated; every table in the crate is bounded by
//! one of these constants. Hosts with more RAM can raise them, smaller
//! targets can shrink them, and the rest of the code follows.

/// Files per volume (directory capacity).
pub const NFILE: usize = 16;

/// Open handles per volume.
pub const NHANDLE: usize = 8;

/// Records per transaction, including the records an implicit
/// single-operation transaction writes on the caller's behalf.
pub const NTXREC: usize = 32;

/// Blocks per volume (block-table capacity). Volumes with more blocks than
/// this fail to mount with `BadFormat`.
pub const NBLOCK: usize = 64;

/// Maximum file name length in bytes.
pub const NAMELEN: usize = 15;

/// Erased bytes the allocator keeps back from appends so head-advance and
/// transaction records can always be placed. Without the slack, a medium
/// filled to the last byte could never be reclaimed again.
pub const RESERVE_BYTES: usize = 128;

/// Smallest supported block size exponent (`block_size = 2^offset_bits`).
pub const MIN_OFFSET_BITS: u32 = 8;

/// Largest supported block size exponent.
pub const MAX_OFFSET_BITS: u32 = 16;
