//! The transaction engine.
//!
//! One transaction per volume at a time. `begin` nests by refcount; only
//! the outermost `commit` commits. Every mutating operation outside an
//! explicit transaction runs through the same engine as an implicit
//! single-operation transaction.
//!
//! Commit ordering, on which crash recovery depends:
//!
//! 1. flush, so every payload record is durable while still TENTATIVE;
//! 2. flip each record TENTATIVE -> LIVE in submission order;
//! 3. patch append chain links and apply directory effects (head
//!    advances, superseded-record kills, deletes) in submission order;
//! 4. flush, making the commit durable;
//! 5. write the `TxnCommit` marker (explicit transactions only - a
//!    single flipped record needs no separate commit point).
//!
//! A crash anywhere in this sequence is recoverable: records still
//! TENTATIVE die at next mount, LIVE records stay, and the scanner
//! completes any half-applied supersession or delete.

use arrayvec::ArrayVec;

use crate::{
    alloc::Allocator,
    dev::BlockDevice,
    dir::{Directory, Priority},
    error::{Error, Result},
    record::{self, Header, Tag, HEADER_SIZE, LIVE, NIL, NO_FILE},
    param::NTXREC,
};

/// One record written under the open transaction.
#[derive(Clone, Copy)]
pub struct Pending {
    pub addr: u32,
    pub tag: Tag,
    pub file: u16,
    pub pos: u32,
    /// Record size on medium, header included.
    pub total: u32,
    /// Tag-specific argument (the flags byte for `SetFlags`).
    pub arg: u8,
}

/// Per-volume transaction state.
pub struct TxState {
    depth: u8,
    aborted: bool,
    explicit: bool,
    id: u32,
    next_id: u32,
    recs: ArrayVec<Pending, NTXREC>,
}

impl TxState {
    pub const fn new() -> TxState {
        TxState {
            depth: 0,
            aborted: false,
            explicit: false,
            id: 0,
            next_id: 1,
            recs: ArrayVec::new_const(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.depth > 0
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Opens or nests a transaction. Returns true when this call opened
    /// the outermost level.
    pub fn begin(&mut self, explicit: bool) -> Result<bool> {
        if self.aborted {
            return Err(Error::TxnAborted);
        }
        self.depth = self.depth.checked_add(1).ok_or(Error::Exhausted)?;
        if self.depth == 1 {
            self.id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            self.explicit = explicit;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Records a write belonging to the open transaction.
    pub fn push(&mut self, rec: Pending) -> Result<()> {
        debug_assert!(self.depth > 0);
        self.recs.try_push(rec).map_err(|_| Error::Exhausted)
    }

    /// The id the next outermost `begin` will use (its marker is written
    /// before the state transitions).
    pub fn upcoming_id(&self) -> u32 {
        self.next_id
    }

    /// Closes one nesting level; true when the outermost level closed and
    /// the real commit or rollback must run.
    pub fn unnest(&mut self) -> bool {
        debug_assert!(self.depth > 0);
        self.depth -= 1;
        self.depth == 0
    }

    /// Forces the aborted state (an adapter failure mid-transaction, or
    /// an inner nested abort).
    pub fn poison(&mut self) {
        if self.depth > 0 {
            self.aborted = true;
        }
    }

    /// Sum of payload bytes of pending appends for `file`; the next
    /// append's logical offset is the directory tail plus this.
    pub fn pending_append_len(&self, file: u16) -> u32 {
        self.recs
            .iter()
            .filter(|p| p.tag == Tag::Append && p.file == file)
            .map(|p| p.total - HEADER_SIZE as u32)
            .sum()
    }

    /// Address of the most recently pushed record.
    pub fn last_addr(&self) -> Option<u32> {
        self.recs.last().map(|p| p.addr)
    }

    /// Number of records pushed so far; a mark for per-operation
    /// rollback.
    pub fn mark(&self) -> usize {
        self.recs.len()
    }

    fn reset(&mut self) {
        self.depth = 0;
        self.aborted = false;
        self.explicit = false;
        self.recs.clear();
    }
}

/// Patches the chain link reaching from `from` onto `to`. The chain tail
/// usually has an erased link and takes the patch directly; when dead
/// records linger at the tail (a clamped file), the walk continues
/// through them to the first erased link, which readers likewise walk
/// through.
fn patch_chain<D: BlockDevice>(dev: &mut D, from: u32, to: u32) -> Result<()> {
    let mut addr = from;
    loop {
        let hdr = record::read_header(dev, addr)?;
        if hdr.link() == NIL {
            return record::patch_link(dev, addr, to);
        }
        addr = hdr.link();
    }
}

/// Writes a LIVE transaction marker record. Markers carry no content and
/// are never accounted, so a reclaimed block simply erases them. Placed at
/// `Low` priority: a marker must never evict anyone's data.
fn write_marker<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    tag: Tag,
    id: u32,
) -> Result<()> {
    let addr = alloc.place(dev, dir, HEADER_SIZE as u32, tag, Priority::Low)?;
    let hdr = Header::compose(tag, LIVE, NO_FILE, id, &[]);
    record::write_record(dev, addr, &hdr, &[])
}

/// Marks the start of an explicit transaction on the medium.
pub fn begin_marker<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    id: u32,
) -> Result<()> {
    write_marker(dev, dir, alloc, Tag::TxnBegin, id)
}

/// Commits the outermost transaction level. See the module docs for the
/// ordering contract. An adapter failure here can leave the transaction
/// partially committed in RAM; the caller surfaces `Io` and the host's
/// remedy is a remount, which replays the on-medium state.
pub fn commit<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    tx: &mut TxState,
) -> Result<()> {
    let result = commit_inner(dev, dir, alloc, tx);
    // The transaction slot frees either way; after a mid-commit adapter
    // failure the on-medium state is authoritative and a remount replays
    // it.
    tx.reset();
    result
}

fn commit_inner<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    tx: &mut TxState,
) -> Result<()> {
    // 1. Payload durability.
    dev.flush()?;

    // 2. Flip TENTATIVE -> LIVE in submission order.
    for i in 0..tx.recs.len() {
        record::mark_live(dev, tx.recs[i].addr)?;
    }

    // 3. Chain links and directory effects, in submission order.
    for i in 0..tx.recs.len() {
        let p = tx.recs[i];
        match p.tag {
            Tag::Append => {
                if let Some(meta) = dir.by_id_mut(p.file) {
                    if meta.last_addr != NIL {
                        patch_chain(dev, meta.last_addr, p.addr)?;
                    }
                    if meta.first_addr == NIL {
                        meta.first_addr = p.addr;
                    }
                    meta.last_addr = p.addr;
                    meta.tail = p.pos + (p.total - HEADER_SIZE as u32);
                }
            }
            Tag::Truncate => {
                let old = match dir.by_id_mut(p.file) {
                    Some(meta) => {
                        let old = meta.trunc_addr;
                        meta.trunc_addr = p.addr;
                        old
                    }
                    None => continue,
                };
                if old != NIL {
                    // The new head record supersedes the previous one.
                    alloc.kill(dev, old, HEADER_SIZE as u32, Tag::Truncate)?;
                }
                if let Some(meta) = dir.by_id_mut(p.file) {
                    alloc.advance_head(dev, meta, p.pos)?;
                }
            }
            Tag::SetFlags => {
                if let Some(meta) = dir.by_id_mut(p.file) {
                    let old = meta.flags_addr;
                    meta.flags_addr = p.addr;
                    meta.flag_gen = p.pos;
                    meta.flags = p.arg;
                    if old != NIL {
                        alloc.kill(dev, old, HEADER_SIZE as u32 + 1, Tag::SetFlags)?;
                    }
                }
            }
            Tag::Delete => {
                apply_delete(dev, dir, alloc, p.file, p.addr, p.total)?;
            }
            // The directory entry was made when the record was written.
            Tag::FileCreate => {}
            _ => {}
        }
    }

    // 4. The commit barrier.
    dev.flush()?;

    // 5. The commit marker. Best effort: the records above are already
    // durable and LIVE, so a full medium must not fail the commit.
    if tx.explicit {
        match write_marker(dev, dir, alloc, Tag::TxnCommit, tx.id) {
            Ok(()) => {
                let _ = dev.flush();
            }
            Err(e) => log::debug!("commit marker skipped: {}", e),
        }
    }

    Ok(())
}

/// Rolls back the whole transaction: every pending record is flipped DEAD
/// in submission order and files created under the transaction leave the
/// directory. Kills are attempted even past a failure; recovery finishes
/// the job at next mount if the medium is failing.
pub fn abort<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    tx: &mut TxState,
) -> Result<()> {
    let mut first_err = None;
    for i in 0..tx.recs.len() {
        let p = tx.recs[i];
        if let Err(e) = alloc.kill(dev, p.addr, p.total, p.tag) {
            first_err.get_or_insert(e);
        }
        if p.tag == Tag::FileCreate {
            dir.remove_id(p.file);
        }
    }
    if tx.explicit {
        if let Err(e) = write_marker(dev, dir, alloc, Tag::TxnAbort, tx.id) {
            log::debug!("abort marker skipped: {}", e);
        }
    }
    if let Err(e) = dev.flush() {
        first_err.get_or_insert(e);
    }
    tx.reset();
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Rolls back every record pushed after `mark`, keeping the transaction
/// open. This is how a failed operation inside an explicit transaction
/// stays atomic on its own without dooming the batch around it.
pub fn rollback_to<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    tx: &mut TxState,
    mark: usize,
) {
    while tx.recs.len() > mark {
        if let Some(p) = tx.recs.pop() {
            let _ = alloc.kill(dev, p.addr, p.total, p.tag);
            if p.tag == Tag::FileCreate {
                dir.remove_id(p.file);
            }
        }
    }
}

/// Executes a committed delete: the file's appends die head-first, then
/// its metadata records, then the delete record itself, and the entry
/// leaves the directory. The scanner runs the same sequence when it finds
/// a LIVE delete after a crash.
pub fn apply_delete<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    file: u16,
    delete_addr: u32,
    delete_total: u32,
) -> Result<()> {
    let (create_addr, create_total, trunc_addr, flags_addr) = {
        let meta = match dir.by_id_mut(file) {
            Some(m) => m,
            None => return Ok(()),
        };
        let tail = meta.tail;
        alloc.advance_head(dev, meta, tail)?;
        let create_total = HEADER_SIZE as u32 + 1 + meta.name.as_bytes().len() as u32;
        (meta.create_addr, create_total, meta.trunc_addr, meta.flags_addr)
    };
    alloc.kill(dev, create_addr, create_total, Tag::FileCreate)?;
    if trunc_addr != NIL {
        alloc.kill(dev, trunc_addr, HEADER_SIZE as u32, Tag::Truncate)?;
    }
    if flags_addr != NIL {
        alloc.kill(dev, flags_addr, HEADER_SIZE as u32 + 1, Tag::SetFlags)?;
    }
    alloc.kill(dev, delete_addr, delete_total, Tag::Delete)?;
    dir.remove_id(file);
    Ok(())
}
