//! The block-device adapter seam.
//!
//! A volume drives its medium exclusively through [`BlockDevice`]. Concrete
//! drivers (NOR/NAND flash, EEPROM, a RAM buffer, a host file) live with
//! the integration, not here; the trait pins down exactly the contract the
//! log relies on for crash safety.

use crate::error::Result;

/// Raw access to an erase-block medium.
///
/// # Contract
///
/// * The medium is `block_count` blocks of `2^offset_bits` bytes each, all
///   addressing 32-bit.
/// * `erase` sets every bit of a block to 1. A subsequent `write` may only
///   clear bits (1 -> 0); the caller guarantees each written byte permits
///   that transition. Media with inverted polarity apply their XOR below
///   this interface.
/// * Writes become persistent in submission order. Batching is fine,
///   reordering is not: after a crash the medium reflects some prefix of
///   the submitted writes, and no byte is ever torn.
/// * `flush` returns only once all previously submitted writes are
///   persistent.
pub trait BlockDevice {
    /// Block size exponent; `block_size == 1 << offset_bits`.
    fn offset_bits(&self) -> u32;

    /// Number of blocks on the medium.
    fn block_count(&self) -> u32;

    /// Reads `buf.len()` bytes at `offset`. The range must not cross a
    /// block boundary.
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;

    /// Programs `buf.len()` bytes at `offset`, clearing bits only. The
    /// range must not cross a block boundary.
    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<()>;

    /// Erases one block back to all-ones.
    fn erase(&mut self, block: u32) -> Result<()>;

    /// Durable barrier for everything submitted so far.
    fn flush(&mut self) -> Result<()>;

    /// Block size in bytes.
    #[inline]
    fn block_size(&self) -> u32 {
        1 << self.offset_bits()
    }
}
