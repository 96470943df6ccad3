//! The superblock: first record of block 0, describing volume geometry.
//!
//! Block 0 is never erased after format, so the superblock cannot be lost
//! to a crash between an erase and a rewrite; the rest of block 0 holds
//! ordinary records whose bytes simply stop being reclaimable.

use core::mem;

use byteorder::LittleEndian;
use zerocopy::{
    byteorder::{U16, U32},
    AsBytes, FromBytes, LayoutVerified, Unaligned,
};

use crate::{
    dev::BlockDevice,
    error::{Error, Result},
    param::{MAX_OFFSET_BITS, MIN_OFFSET_BITS, NBLOCK},
    record::{self, Header, State, Tag, LIVE},
};

type Le16 = U16<LittleEndian>;
type Le32 = U32<LittleEndian>;

const MAGIC: u32 = 0x544F_4653; // "TOFS"
const VERSION: u16 = 1;

/// On-medium superblock payload. The format epoch lives in the record
/// header's `pos` field.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
struct SbPayload {
    magic: Le32,
    version: Le16,
    offset_bits: u8,
    _reserved: u8,
    block_count: Le32,
}

/// Validated volume geometry, held in RAM while mounted.
#[derive(Clone, Copy)]
pub struct Superblock {
    pub offset_bits: u32,
    pub block_count: u32,
    /// Incremented on every format.
    pub epoch: u32,
}

impl Superblock {
    pub fn block_size(&self) -> u32 {
        1 << self.offset_bits
    }

    /// First log address in block 0, just past the superblock record.
    pub fn log_start(&self) -> u32 {
        (record::HEADER_SIZE + mem::size_of::<SbPayload>()) as u32
    }
}

/// Checks that the adapter's geometry is one this build can manage.
pub fn check_geometry<D: BlockDevice>(dev: &D) -> Result<()> {
    let bits = dev.offset_bits();
    let blocks = dev.block_count();
    if bits < MIN_OFFSET_BITS || bits > MAX_OFFSET_BITS {
        return Err(Error::BadFormat);
    }
    if blocks == 0 || blocks as usize > NBLOCK {
        return Err(Error::BadFormat);
    }
    // 32-bit addressing: the whole volume must fit.
    if (blocks as u64) << bits > (1u64 << 32) {
        return Err(Error::BadFormat);
    }
    Ok(())
}

/// Parses and validates the superblock record against the live device.
pub fn load<D: BlockDevice>(dev: &mut D) -> Result<Superblock> {
    check_geometry(dev)?;
    let hdr = record::read_header(dev, 0)?;
    if hdr.tag() != Some(Tag::Superblock)
        || hdr.state() != State::Live
        || hdr.len() as usize != mem::size_of::<SbPayload>()
    {
        return Err(Error::BadFormat);
    }
    if !record::verify(dev, 0, &hdr)? {
        return Err(Error::BadFormat);
    }

    let mut buf = [0; mem::size_of::<SbPayload>()];
    record::read_payload(dev, 0, 0, &mut buf)?;
    let lv = LayoutVerified::<_, SbPayload>::new_unaligned(&buf[..]).ok_or(Error::BadFormat)?;
    let payload = *lv;

    if payload.magic.get() != MAGIC || payload.version.get() != VERSION {
        return Err(Error::BadFormat);
    }
    if u32::from(payload.offset_bits) != dev.offset_bits()
        || payload.block_count.get() != dev.block_count()
    {
        // The medium was formatted with a different geometry.
        return Err(Error::BadFormat);
    }
    Ok(Superblock {
        offset_bits: dev.offset_bits(),
        block_count: dev.block_count(),
        epoch: hdr.pos(),
    })
}

/// Erases the whole medium and writes a fresh superblock. The format epoch
/// continues from the previous superblock when one is still readable.
pub fn format<D: BlockDevice>(dev: &mut D) -> Result<Superblock> {
    check_geometry(dev)?;
    let epoch = match load(dev) {
        Ok(sb) => sb.epoch.wrapping_add(1),
        Err(_) => 0,
    };

    for block in 0..dev.block_count() {
        dev.erase(block)?;
    }

    let payload = SbPayload {
        magic: Le32::new(MAGIC),
        version: Le16::new(VERSION),
        offset_bits: dev.offset_bits() as u8,
        _reserved: 0,
        block_count: Le32::new(dev.block_count()),
    };
    let hdr = Header::compose(Tag::Superblock, LIVE, record::NO_FILE, epoch, payload.as_bytes());
    record::write_record(dev, 0, &hdr, payload.as_bytes())?;
    dev.flush()?;

    log::info!(
        "formatted: {} blocks of {} bytes, epoch {}",
        dev.block_count(),
        dev.block_size(),
        epoch
    );
    Ok(Superblock {
        offset_bits: dev.offset_bits(),
        block_count: dev.block_count(),
        epoch,
    })
}
