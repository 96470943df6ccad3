//! The space allocator and garbage collector.
//!
//! The allocator owns the per-block RAM metadata and the write cursor.
//! Placement for a record of priority p tries, in order:
//!
//! 1. the current block, while the record still fits;
//! 2. a block with usable erased tail space, lowest address first;
//! 3. a fully erased block, lowest address first;
//! 4. a garbage block (no live content left), erased on the spot;
//! 5. priority eviction: sacrifice a block whose every live record is an
//!    `Append` of a file with priority strictly below p;
//! 6. `NoSpace`.
//!
//! Eviction never writes records (it runs when the medium is full). It
//! kills the victims' records in ascending logical order, so a crash at
//! any prefix reads back as an ordinary head-truncation, then erases the
//! block. Blocks holding live per-file metadata records are never
//! evicted, and block 0 is never erased after format so the superblock
//! cannot be lost.

use arrayvec::ArrayVec;

use crate::{
    dev::BlockDevice,
    dir::{Directory, FileMeta, Priority},
    error::{Error, Result},
    param::{NBLOCK, NFILE, RESERVE_BYTES},
    record::{self, Header, Parsed, State, Tag, HEADER_SIZE, NIL},
    superblock::Superblock,
};

/// Priority hint value meaning "no content yet".
const PRIO_NONE: u8 = 0xFF;

/// Per-block metadata, derived from the log at mount and kept current by
/// every record write and kill.
#[derive(Clone, Copy)]
struct BlockInfo {
    /// Bytes of live (or still-tentative) content records.
    live: u32,
    /// Live per-file metadata records (`FileCreate`/`Truncate`/`SetFlags`);
    /// a nonzero count pins the block.
    meta: u16,
    /// Next free offset within the block; `block_size` once sealed.
    tail: u32,
    /// Lowest priority among content seen in this block. A hint for
    /// eviction candidate ordering only; the victim scan re-reads the
    /// block's records before anything is sacrificed.
    prio: u8,
}

impl BlockInfo {
    const EMPTY: BlockInfo = BlockInfo {
        live: 0,
        meta: 0,
        tail: 0,
        prio: PRIO_NONE,
    };
}

/// Free/used byte accounting for a volume.
#[derive(Clone, Copy, Debug)]
pub struct SpaceInfo {
    /// Total medium size in bytes.
    pub total: u32,
    /// Bytes held by live content records, headers included.
    pub live: u32,
    /// Erased bytes immediately writable, plus garbage blocks that one
    /// erase would reclaim.
    pub free: u32,
    /// Blocks reclaimable by erase right now.
    pub reclaimable_blocks: u32,
}

/// Does a record of this tag count toward a block's live content?
/// Transaction markers, padding and the superblock never do.
fn accounted(tag: Tag) -> bool {
    matches!(
        tag,
        Tag::Append | Tag::FileCreate | Tag::Truncate | Tag::SetFlags | Tag::Delete
    )
}

pub struct Allocator {
    blocks: ArrayVec<BlockInfo, NBLOCK>,
    offset_bits: u32,
    block_count: u32,
    /// First log offset of block 0 (past the superblock record).
    log_start: u32,
    /// Block currently receiving the log, if any.
    cursor: Option<u32>,
}

impl Allocator {
    pub fn new(sb: &Superblock) -> Allocator {
        let mut blocks = ArrayVec::new();
        for _ in 0..sb.block_count {
            blocks.push(BlockInfo::EMPTY);
        }
        Allocator {
            blocks,
            offset_bits: sb.offset_bits,
            block_count: sb.block_count,
            log_start: sb.log_start(),
            cursor: None,
        }
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        1 << self.offset_bits
    }

    #[inline]
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    #[inline]
    pub fn block_of(&self, addr: u32) -> u32 {
        addr >> self.offset_bits
    }

    #[inline]
    pub fn block_start(&self, block: u32) -> u32 {
        block << self.offset_bits
    }

    #[inline]
    pub fn block_end(&self, block: u32) -> u32 {
        self.block_start(block) + self.block_size()
    }

    /// First log offset within `block` (only block 0 is special).
    pub fn log_base(&self, block: u32) -> u32 {
        if block == 0 {
            self.log_start
        } else {
            0
        }
    }

    /// Scanner hand-off: the offset where `block`'s erased region begins,
    /// relative to the block start (`block_size` when sealed).
    pub fn set_tail(&mut self, block: u32, tail: u32) {
        self.blocks[block as usize].tail = tail;
    }

    /// Accounts a content record at `addr`. Used both by the scanner and
    /// by the write path. Tentative records are counted too: their bytes
    /// stay unreclaimable until the transaction resolves.
    pub fn account(&mut self, addr: u32, total: u32, tag: Tag, prio: Option<Priority>) {
        if !accounted(tag) {
            return;
        }
        let block = self.block_of(addr) as usize;
        let b = &mut self.blocks[block];
        b.live += total;
        if tag.is_file_meta() {
            b.meta += 1;
        }
        if let Some(p) = prio {
            if (p as u8) < b.prio {
                b.prio = p as u8;
            }
        }
    }

    fn deaccount(&mut self, addr: u32, total: u32, tag: Tag) {
        if !accounted(tag) {
            return;
        }
        let block = self.block_of(addr) as usize;
        let b = &mut self.blocks[block];
        debug_assert!(b.live >= total);
        b.live = b.live.saturating_sub(total);
        if tag.is_file_meta() {
            debug_assert!(b.meta > 0);
            b.meta = b.meta.saturating_sub(1);
        }
    }

    /// Marks the record at `addr` dead and releases its accounting.
    pub fn kill<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        addr: u32,
        total: u32,
        tag: Tag,
    ) -> Result<()> {
        record::mark_dead(dev, addr)?;
        self.deaccount(addr, total, tag);
        Ok(())
    }

    /// Reserves `need` bytes for a record of priority `prio` and returns
    /// their address. `need` includes the header and must not exceed the
    /// block size. May seal the current block with padding, erase a
    /// garbage block, or evict lower-priority content.
    pub fn place<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dir: &mut Directory,
        need: u32,
        tag: Tag,
        prio: Priority,
    ) -> Result<u32> {
        debug_assert!(need <= self.block_size());

        // Appends keep slack in reserve so head-advance and transaction
        // records can always be placed; without it a medium filled to the
        // last byte could never be reclaimed again.
        let reserve = if tag == Tag::Append {
            RESERVE_BYTES as u32
        } else {
            0
        };
        while self.space().free < need + reserve {
            let victim = self.evict(dev, dir, prio)?;
            self.erase_block(dev, victim)?;
        }

        if let Some(cur) = self.cursor {
            if self.room(cur) >= need {
                return Ok(self.take(cur, need));
            }
        }

        // Secure the new target before sealing the old cursor: a failed
        // hunt must leave the remaining tail usable for smaller records.
        let target = if let Some(b) = self.find_partial(need) {
            b
        } else if let Some(b) = self.find_erased() {
            b
        } else if let Some(b) = self.find_garbage() {
            self.erase_block(dev, b)?;
            b
        } else {
            let victim = self.evict(dev, dir, prio)?;
            self.erase_block(dev, victim)?;
            victim
        };
        if let Some(cur) = self.cursor.take() {
            self.seal(dev, cur)?;
        }
        self.cursor = Some(target);
        Ok(self.take(target, need))
    }

    /// Seals the write cursor so nothing is placed after a failed record
    /// write: an erased gap in the middle of a block would end the log
    /// walk early at next mount. Best effort, since the medium may already
    /// be refusing writes.
    pub fn seal_current<D: BlockDevice>(&mut self, dev: &mut D) {
        if let Some(cur) = self.cursor.take() {
            let _ = self.seal(dev, cur);
        }
    }

    fn room(&self, block: u32) -> u32 {
        self.block_size() - self.blocks[block as usize].tail
    }

    fn take(&mut self, block: u32, need: u32) -> u32 {
        let addr = self.block_start(block) + self.blocks[block as usize].tail;
        self.blocks[block as usize].tail += need;
        if self.room(block) < HEADER_SIZE as u32 {
            // A sub-header tail can never hold a record, and the decoder
            // reads it as end-of-block; retire it now.
            self.blocks[block as usize].tail = self.block_size();
            if self.cursor == Some(block) {
                self.cursor = None;
            }
        }
        addr
    }

    /// Fills the remainder of `block` with a padding record. A tail
    /// smaller than one header is left erased; the decoder treats it as
    /// the end of the block's log either way.
    fn seal<D: BlockDevice>(&mut self, dev: &mut D, block: u32) -> Result<()> {
        let rest = self.room(block);
        if rest >= HEADER_SIZE as u32 {
            let addr = self.block_start(block) + self.blocks[block as usize].tail;
            let hdr = Header::compose_padding(rest - HEADER_SIZE as u32);
            record::write_record(dev, addr, &hdr, &[])?;
        }
        self.blocks[block as usize].tail = self.block_size();
        Ok(())
    }

    fn find_partial(&self, need: u32) -> Option<u32> {
        (0..self.block_count).find(|&b| {
            self.blocks[b as usize].tail > self.log_base(b) && self.room(b) >= need
        })
    }

    fn find_erased(&self) -> Option<u32> {
        (0..self.block_count).find(|&b| {
            let info = &self.blocks[b as usize];
            info.tail == self.log_base(b) && info.live == 0 && info.meta == 0
        })
    }

    fn find_garbage(&self) -> Option<u32> {
        (1..self.block_count).find(|&b| {
            let info = &self.blocks[b as usize];
            info.tail > 0 && info.live == 0 && info.meta == 0
        })
    }

    fn erase_block<D: BlockDevice>(&mut self, dev: &mut D, block: u32) -> Result<()> {
        debug_assert_ne!(block, 0, "block 0 is never erased after format");
        dev.erase(block)?;
        self.blocks[block as usize] = BlockInfo::EMPTY;
        Ok(())
    }

    /// Selects and clears an eviction victim for a write of priority
    /// `prio`. On success the victim holds no live records and may be
    /// erased.
    fn evict<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dir: &mut Directory,
        prio: Priority,
    ) -> Result<u32> {
        // Candidates, best first: lowest priority hint, then fewest live
        // bytes, then lowest address. Block 0 and pinned blocks are out.
        let mut candidates: ArrayVec<u32, NBLOCK> = ArrayVec::new();
        for b in 1..self.block_count {
            let info = &self.blocks[b as usize];
            if info.live > 0 && info.meta == 0 && info.prio < prio as u8 {
                candidates.push(b);
            }
        }
        candidates.sort_unstable_by_key(|&b| {
            let info = &self.blocks[b as usize];
            (info.prio, info.live, b)
        });

        for i in 0..candidates.len() {
            let victim = candidates[i];
            if let Some(plan) = self.scan_victim(dev, dir, victim, prio)? {
                log::debug!("evicting block {} for a {:?} priority write", victim, prio);
                self.apply_eviction(dev, dir, &plan)?;
                return Ok(victim);
            }
        }
        Err(Error::NoSpace)
    }

    /// Walks the victim's records on the medium and decides eligibility:
    /// every record must be dead or structural, or a LIVE `Append` of a
    /// file with priority strictly below `prio`. Returns the per-file
    /// head advance the eviction implies, refreshing the block's priority
    /// hint as a side effect.
    fn scan_victim<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dir: &Directory,
        block: u32,
        prio: Priority,
    ) -> Result<Option<ArrayVec<(u16, u32), NFILE>>> {
        let mut plan: ArrayVec<(u16, u32), NFILE> = ArrayVec::new();
        let mut min_prio = PRIO_NONE;
        let end = self.block_end(block);
        let mut addr = self.block_start(block) + self.log_base(block);

        while addr < end {
            let (hdr, next) = match record::decode_at(dev, addr, end)? {
                Parsed::End | Parsed::Junk => break,
                Parsed::Rec { hdr, next } => (hdr, next),
            };
            match hdr.state() {
                State::Dead => {}
                // An open transaction still owns bytes in this block.
                State::Tentative => return Ok(None),
                State::Live => match hdr.tag() {
                    Some(Tag::Append) => {
                        let p = match dir.by_id(hdr.file()) {
                            Some(meta) => meta.priority(),
                            // A live append of an unknown file is stale
                            // state the scanner would have killed; leave
                            // the block alone.
                            None => return Ok(None),
                        };
                        if (p as u8) < min_prio {
                            min_prio = p as u8;
                        }
                        if p >= prio {
                            self.blocks[block as usize].prio = min_prio;
                            return Ok(None);
                        }
                        match plan.iter_mut().find(|(id, _)| *id == hdr.file()) {
                            Some((_, head)) => *head = (*head).max(hdr.end()),
                            None => plan
                                .try_push((hdr.file(), hdr.end()))
                                .map_err(|_| Error::Exhausted)?,
                        }
                    }
                    // Live metadata (or an unapplied delete) pins the
                    // block; padding, markers and the superblock do not.
                    Some(t) if accounted(t) => return Ok(None),
                    _ => {}
                },
            }
            addr = next;
        }
        self.blocks[block as usize].prio = min_prio;
        Ok(Some(plan))
    }

    /// Applies an eviction plan: each affected file's head advances to the
    /// end of its evicted content, killing records in ascending logical
    /// order so any crash prefix reads back as a head-truncation.
    fn apply_eviction<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        dir: &mut Directory,
        plan: &ArrayVec<(u16, u32), NFILE>,
    ) -> Result<()> {
        for &(id, new_head) in plan {
            if let Some(meta) = dir.by_id_mut(id) {
                self.advance_head(dev, meta, new_head)?;
            }
        }
        Ok(())
    }

    /// Advances `meta.head` to `new_head`, killing every fully consumed
    /// LIVE `Append` in ascending logical order along the chain. Shared by
    /// bookmark commits, eviction, and scanner crash completion.
    pub fn advance_head<D: BlockDevice>(
        &mut self,
        dev: &mut D,
        meta: &mut FileMeta,
        new_head: u32,
    ) -> Result<()> {
        let new_head = new_head.min(meta.tail);
        if new_head <= meta.head {
            return Ok(());
        }
        let mut addr = meta.first_addr;
        while addr != NIL {
            let hdr = record::read_header(dev, addr)?;
            let live_append =
                hdr.state() == State::Live && hdr.tag() == Some(Tag::Append);
            if live_append && hdr.end() > new_head {
                break;
            }
            if live_append {
                self.kill(dev, addr, hdr.total(), Tag::Append)?;
            }
            // Dead links are walked through: a crash may have left them in
            // the chain, and an erased target reads as all-ones, whose
            // link field is NIL and ends the walk.
            addr = hdr.link();
        }
        meta.first_addr = addr;
        meta.head = new_head;
        Ok(())
    }

    /// Current free/used accounting.
    pub fn space(&self) -> SpaceInfo {
        let mut live = 0;
        let mut free = 0;
        let mut reclaimable = 0;
        for b in 0..self.block_count {
            let info = &self.blocks[b as usize];
            live += info.live;
            free += self.block_size() - info.tail;
            if b != 0 && info.tail > 0 && info.live == 0 && info.meta == 0 {
                free += info.tail;
                reclaimable += 1;
            }
        }
        SpaceInfo {
            total: self.block_count << self.offset_bits,
            live,
            free,
            reclaimable_blocks: reclaimable,
        }
    }
}
