//! The record codec.
//!
//! Everything the store persists is a tagged, self-delimiting record
//! confined to a single block:
//!
//! ```text
//! offset len field
//! 0      1   tag    - never 0xFF in a written record
//! 1      1   state  - TENTATIVE 0xFF -> LIVE 0xFE -> DEAD 0x00
//! 2      2   len    - payload length
//! 4      2   crc    - low 16 bits of CRC-32 over tag, len, file, pos, payload
//! 6      2   file   - owning file id, or NO_FILE
//! 8      4   pos    - tag-specific (see Tag)
//! 12     4   link   - next Append of the same file; NIL when none
//! 16     ..  payload
//! ```
//!
//! All fields are little-endian. The state marker and the chain link are
//! excluded from the checksum: both are rewritten in place after the record
//! is first programmed, and both transitions only ever clear bits, which
//! the medium permits without an erase. An all-ones header decodes as "end
//! of log in this block".

use core::mem;

use byteorder::LittleEndian;
use static_assertions::const_assert_eq;
use zerocopy::{
    byteorder::{U16, U32},
    AsBytes, FromBytes, LayoutVerified, Unaligned,
};

use crate::{
    dev::BlockDevice,
    error::{Error, Result},
};

type Le16 = U16<LittleEndian>;
type Le32 = U32<LittleEndian>;

/// Sentinel address: "no record".
pub const NIL: u32 = u32::MAX;

/// File id used by records that do not belong to a file.
pub const NO_FILE: u16 = u16::MAX;

/// Header bytes preceding every payload.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();
const_assert_eq!(HEADER_SIZE, 16);

/// Byte offset of the state marker within a record.
const STATE_OFFSET: u32 = 1;

/// Byte offset of the chain link within a record.
const LINK_OFFSET: u32 = 12;

/// State marker values. The only legal transitions clear bits, so they can
/// be applied to previously written records without an erase, and
/// re-applying one is a no-op on readback.
pub const TENTATIVE: u8 = 0xFF;
pub const LIVE: u8 = 0xFE;
pub const DEAD: u8 = 0x00;

/// A record's state as read back from the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Written but not yet committed.
    Tentative,
    /// Committed and valid.
    Live,
    /// Rolled back or superseded. Unrecognized marker bytes also classify
    /// here: a marker that is neither erased nor a known value can only be
    /// the result of corruption or an interrupted transition.
    Dead,
}

impl State {
    pub fn of(marker: u8) -> State {
        match marker {
            TENTATIVE => State::Tentative,
            LIVE => State::Live,
            _ => State::Dead,
        }
    }
}

/// Record kind. The `pos` header field is tag-specific:
/// logical start offset for `Append`, new head offset for `Truncate`,
/// flags generation for `FileCreate`/`SetFlags`, transaction id for the
/// `Txn*` markers, and format epoch for `Superblock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Superblock = 1,
    FileCreate = 2,
    Append = 3,
    Truncate = 4,
    Delete = 5,
    SetFlags = 6,
    TxnBegin = 7,
    TxnCommit = 8,
    TxnAbort = 9,
    Padding = 10,
}

impl Tag {
    pub fn from_u8(value: u8) -> Option<Tag> {
        match value {
            1 => Some(Tag::Superblock),
            2 => Some(Tag::FileCreate),
            3 => Some(Tag::Append),
            4 => Some(Tag::Truncate),
            5 => Some(Tag::Delete),
            6 => Some(Tag::SetFlags),
            7 => Some(Tag::TxnBegin),
            8 => Some(Tag::TxnCommit),
            9 => Some(Tag::TxnAbort),
            10 => Some(Tag::Padding),
            _ => None,
        }
    }

    /// Per-file metadata records pin their block: a block holding one is
    /// reclaimed only when the record dies, never by priority eviction.
    pub fn is_file_meta(self) -> bool {
        matches!(self, Tag::FileCreate | Tag::Truncate | Tag::SetFlags)
    }
}

/// The on-medium record header.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
pub struct Header {
    tag: u8,
    state: u8,
    len: Le16,
    crc: Le16,
    file: Le16,
    pos: Le32,
    link: Le32,
}

impl Header {
    /// Builds a header for a new record. The caller picks the initial
    /// state: `TENTATIVE` for transactional records, `LIVE` for records
    /// that are valid the moment they hit the medium (superblock, padding,
    /// transaction markers).
    pub fn compose(tag: Tag, state: u8, file: u16, pos: u32, payload: &[u8]) -> Header {
        let len = payload.len() as u16;
        Header {
            tag: tag as u8,
            state,
            len: Le16::new(len),
            crc: Le16::new(checksum(tag as u8, len, file, pos, payload)),
            file: Le16::new(file),
            pos: Le32::new(pos),
            link: Le32::new(NIL),
        }
    }

    /// Builds a LIVE padding record sealing `fill` bytes of erased block
    /// tail. The payload region is left unprogrammed (all ones), and the
    /// checksum is computed to match.
    pub fn compose_padding(fill: u32) -> Header {
        let len = fill as u16;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[Tag::Padding as u8]);
        hasher.update(&len.to_le_bytes());
        hasher.update(&NO_FILE.to_le_bytes());
        hasher.update(&0_u32.to_le_bytes());
        let chunk = [0xFF; 32];
        let mut rest = fill;
        while rest > 0 {
            let n = rest.min(chunk.len() as u32) as usize;
            hasher.update(&chunk[..n]);
            rest -= n as u32;
        }
        Header {
            tag: Tag::Padding as u8,
            state: LIVE,
            len: Le16::new(len),
            crc: Le16::new((hasher.finalize() & 0xFFFF) as u16),
            file: Le16::new(NO_FILE),
            pos: Le32::new(0),
            link: Le32::new(NIL),
        }
    }

    pub fn tag(&self) -> Option<Tag> {
        Tag::from_u8(self.tag)
    }

    pub fn state(&self) -> State {
        State::of(self.state)
    }

    pub fn len(&self) -> u32 {
        u32::from(self.len.get())
    }

    pub fn file(&self) -> u16 {
        self.file.get()
    }

    pub fn pos(&self) -> u32 {
        self.pos.get()
    }

    pub fn link(&self) -> u32 {
        self.link.get()
    }

    /// Total on-medium size of the record this header describes.
    pub fn total(&self) -> u32 {
        HEADER_SIZE as u32 + self.len()
    }

    /// For `Append` records: one past the last logical byte.
    pub fn end(&self) -> u32 {
        self.pos() + self.len()
    }
}

/// Checksum over the immutable parts of a record. `state` and `link` are
/// rewritten in place later and must not participate.
fn checksum(tag: u8, len: u16, file: u16, pos: u32, payload: &[u8]) -> u16 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&len.to_le_bytes());
    hasher.update(&file.to_le_bytes());
    hasher.update(&pos.to_le_bytes());
    hasher.update(payload);
    (hasher.finalize() & 0xFFFF) as u16
}

/// Outcome of decoding one log slot.
pub enum Parsed {
    /// Erased medium: end of log in this block.
    End,
    /// A header that cannot be trusted (unknown tag, or a length that
    /// escapes the block). The rest of the block is unparseable.
    Junk,
    /// A record; `next` is the address one past its payload.
    Rec { hdr: Header, next: u32 },
}

/// Reads the record header at `addr`.
pub fn read_header<D: BlockDevice>(dev: &mut D, addr: u32) -> Result<Header> {
    let mut buf = [0; HEADER_SIZE];
    dev.read(addr, &mut buf)?;
    let lv = LayoutVerified::<_, Header>::new_unaligned(&buf[..]).ok_or(Error::Corruption)?;
    Ok(*lv)
}

/// Decodes the log slot at `addr`, bounded by the end of its block.
pub fn decode_at<D: BlockDevice>(dev: &mut D, addr: u32, block_end: u32) -> Result<Parsed> {
    if block_end - addr < HEADER_SIZE as u32 {
        // A tail smaller than a header can never hold a record.
        return Ok(Parsed::End);
    }
    let mut buf = [0; HEADER_SIZE];
    dev.read(addr, &mut buf)?;
    if buf.iter().all(|b| *b == 0xFF) {
        return Ok(Parsed::End);
    }
    let lv = LayoutVerified::<_, Header>::new_unaligned(&buf[..]).ok_or(Error::Corruption)?;
    let hdr = *lv;
    if hdr.tag().is_none() || addr + hdr.total() > block_end {
        return Ok(Parsed::Junk);
    }
    Ok(Parsed::Rec {
        hdr,
        next: addr + hdr.total(),
    })
}

/// Programs a whole record at `addr`: header first, then payload. Both
/// lie inside one block by the allocator's placement contract. A crash
/// between the two writes leaves a TENTATIVE record with a failing
/// checksum, which recovery kills like any other uncommitted record.
pub fn write_record<D: BlockDevice>(
    dev: &mut D,
    addr: u32,
    hdr: &Header,
    payload: &[u8],
) -> Result<()> {
    dev.write(addr, hdr.as_bytes())?;
    if !payload.is_empty() {
        dev.write(addr + HEADER_SIZE as u32, payload)?;
    }
    Ok(())
}

/// Flips the record at `addr` to LIVE. Idempotent.
pub fn mark_live<D: BlockDevice>(dev: &mut D, addr: u32) -> Result<()> {
    dev.write(addr + STATE_OFFSET, &[LIVE])
}

/// Flips the record at `addr` to DEAD. Idempotent, and legal from any
/// prior state since the dead marker is all-zero.
pub fn mark_dead<D: BlockDevice>(dev: &mut D, addr: u32) -> Result<()> {
    dev.write(addr + STATE_OFFSET, &[DEAD])
}

/// Patches the chain link of the record at `addr`. The field was left
/// erased when the record was programmed, so this is a one-time overlay
/// write that only clears bits.
pub fn patch_link<D: BlockDevice>(dev: &mut D, addr: u32, to: u32) -> Result<()> {
    dev.write(addr + LINK_OFFSET, &to.to_le_bytes())
}

/// Reads `buf.len()` payload bytes of the record at `addr`, starting
/// `offset` bytes into the payload.
pub fn read_payload<D: BlockDevice>(
    dev: &mut D,
    addr: u32,
    offset: u32,
    buf: &mut [u8],
) -> Result<()> {
    dev.read(addr + HEADER_SIZE as u32 + offset, buf)
}

/// Re-computes the payload checksum of the record at `addr` and compares
/// it with the stored one. Streams in small chunks; the working set stays
/// on the stack.
pub fn verify<D: BlockDevice>(dev: &mut D, addr: u32, hdr: &Header) -> Result<bool> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[hdr.tag]);
    hasher.update(&hdr.len.get().to_le_bytes());
    hasher.update(&hdr.file.get().to_le_bytes());
    hasher.update(&hdr.pos.get().to_le_bytes());

    let mut chunk = [0; 32];
    let mut done = 0;
    while done < hdr.len() {
        let n = (hdr.len() - done).min(chunk.len() as u32) as usize;
        dev.read(addr + HEADER_SIZE as u32 + done, &mut chunk[..n])?;
        hasher.update(&chunk[..n]);
        done += n as u32;
    }
    Ok((hasher.finalize() & 0xFFFF) as u16 == hdr.crc.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal AND-semantics RAM medium for codec tests.
    struct RawMem {
        mem: Vec<u8>,
    }

    impl RawMem {
        fn new() -> RawMem {
            RawMem {
                mem: vec![0xFF; 1024],
            }
        }
    }

    impl BlockDevice for RawMem {
        fn offset_bits(&self) -> u32 {
            10
        }
        fn block_count(&self) -> u32 {
            1
        }
        fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
            let off = offset as usize;
            buf.copy_from_slice(&self.mem[off..off + buf.len()]);
            Ok(())
        }
        fn write(&mut self, offset: u32, buf: &[u8]) -> Result<()> {
            for (i, b) in buf.iter().enumerate() {
                let cell = &mut self.mem[offset as usize + i];
                assert_eq!(*cell & b, *b, "write would set a cleared bit");
                *cell &= b;
            }
            Ok(())
        }
        fn erase(&mut self, _block: u32) -> Result<()> {
            for b in &mut self.mem {
                *b = 0xFF;
            }
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn round_trip_and_states() {
        let mut dev = RawMem::new();
        let payload = b"hello, log";
        let hdr = Header::compose(Tag::Append, TENTATIVE, 3, 100, payload);
        write_record(&mut dev, 0, &hdr, payload).unwrap();

        let back = read_header(&mut dev, 0).unwrap();
        assert_eq!(back.tag(), Some(Tag::Append));
        assert_eq!(back.state(), State::Tentative);
        assert_eq!(back.len(), payload.len() as u32);
        assert_eq!(back.file(), 3);
        assert_eq!(back.pos(), 100);
        assert_eq!(back.link(), NIL);
        assert!(verify(&mut dev, 0, &back).unwrap());

        // TENTATIVE -> LIVE -> DEAD, each idempotent.
        mark_live(&mut dev, 0).unwrap();
        mark_live(&mut dev, 0).unwrap();
        assert_eq!(read_header(&mut dev, 0).unwrap().state(), State::Live);
        mark_dead(&mut dev, 0).unwrap();
        mark_dead(&mut dev, 0).unwrap();
        assert_eq!(read_header(&mut dev, 0).unwrap().state(), State::Dead);
    }

    #[test]
    fn link_patch_is_single_shot() {
        let mut dev = RawMem::new();
        let hdr = Header::compose(Tag::Append, TENTATIVE, 1, 0, b"x");
        write_record(&mut dev, 0, &hdr, b"x").unwrap();
        patch_link(&mut dev, 0, 0x123).unwrap();
        let back = read_header(&mut dev, 0).unwrap();
        assert_eq!(back.link(), 0x123);
        // The link is not part of the checksum.
        assert!(verify(&mut dev, 0, &back).unwrap());
    }

    #[test]
    fn erased_slot_decodes_as_end() {
        let mut dev = RawMem::new();
        match decode_at(&mut dev, 0, 1024).unwrap() {
            Parsed::End => {}
            _ => panic!("erased medium must read as end of log"),
        }
        // A tail shorter than a header is also the end.
        match decode_at(&mut dev, 1024 - 8, 1024).unwrap() {
            Parsed::End => {}
            _ => panic!("short tail must read as end of log"),
        }
    }

    #[test]
    fn bad_tag_or_length_is_junk() {
        let mut dev = RawMem::new();
        // Unknown tag.
        dev.write(0, &[0x7C, 0xFE, 0, 0, 0, 0, 0, 0]).unwrap();
        match decode_at(&mut dev, 0, 1024).unwrap() {
            Parsed::Junk => {}
            _ => panic!("unknown tag must decode as junk"),
        }
        // Length escaping the block.
        let mut dev = RawMem::new();
        let hdr = Header::compose(Tag::Append, TENTATIVE, 1, 0, &[0xAA; 32]);
        dev.write(1000, &hdr.as_bytes()[..8]).unwrap();
        match decode_at(&mut dev, 1000, 1024).unwrap() {
            Parsed::Junk | Parsed::End => {}
            _ => panic!("overlong record must not decode"),
        }
    }

    #[test]
    fn corrupt_payload_fails_verify() {
        let mut dev = RawMem::new();
        let payload = [0xFF_u8; 8];
        let hdr = Header::compose(Tag::Append, TENTATIVE, 1, 0, &payload);
        write_record(&mut dev, 0, &hdr, &payload).unwrap();
        // Clear a payload bit behind the codec's back.
        dev.write(HEADER_SIZE as u32, &[0x7F]).unwrap();
        let back = read_header(&mut dev, 0).unwrap();
        assert!(!verify(&mut dev, 0, &back).unwrap());
    }
}
