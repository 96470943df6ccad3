//! The mount-time volume scanner.
//!
//! Replays the log to rebuild every piece of RAM state and to complete
//! whatever a crash interrupted. The walk is streaming: per-file
//! aggregates are bounded by the directory capacity, never by the number
//! of records.
//!
//! Pass 1 walks every block in address order, killing TENTATIVE records
//! (uncommitted by definition: commits flip their records LIVE before the
//! commit point) and collecting per-file metadata: creates, deletes, and
//! the newest truncate/flags records, killing superseded duplicates.
//!
//! Pass 2 walks again for `Append` records: appends of deleted or unknown
//! files die, appends wholly below the head die (completing an
//! interrupted bookmark or eviction), and survivors are accounted and
//! aggregated into head/tail and chain endpoints.
//!
//! Pass 3 walks each file's chain and re-patches links a crash left
//! unpatched; a genuine gap (a record lost to corruption) clamps the file
//! at the last reachable byte.

use arrayvec::ArrayVec;

use crate::{
    alloc::Allocator,
    dev::BlockDevice,
    dir::{Directory, FileMeta},
    error::{Error, Result},
    name::{FileName, NameBuf},
    param::{NAMELEN, NFILE},
    record::{self, Header, Parsed, State, Tag, HEADER_SIZE, NIL, NO_FILE},
    superblock::Superblock,
};

/// Per-file metadata gathered in pass 1, before we know whether the file
/// survives (its create may be missing, or a delete may be pending).
struct Scratch {
    id: u16,
    create: Option<Create>,
    delete_addr: u32,
    trunc: Option<(u32, u32)>,         // (addr, head pos)
    flags_rec: Option<(u32, u32, u8)>, // (addr, generation, flags byte)
}

struct Create {
    addr: u32,
    total: u32,
    flags: u8,
    name: NameBuf,
}

impl Scratch {
    fn new(id: u16) -> Scratch {
        Scratch {
            id,
            create: None,
            delete_addr: NIL,
            trunc: None,
            flags_rec: None,
        }
    }
}

/// Chain endpoints gathered in pass 2.
#[derive(Clone, Copy)]
struct ChainAgg {
    id: u16,
    first_pos: u32,
    first_addr: u32,
    last_end: u32,
    last_addr: u32,
}

/// Rebuilds directory and allocator state from the log.
pub fn mount<D: BlockDevice>(dev: &mut D, sb: &Superblock) -> Result<(Directory, Allocator)> {
    let mut dir = Directory::new();
    let mut alloc = Allocator::new(sb);
    let mut scratch: ArrayVec<Scratch, NFILE> = ArrayVec::new();
    let mut killed = 0u32;

    pass1(dev, &mut alloc, &mut scratch, &mut killed)?;
    resolve_files(dev, &mut dir, &mut alloc, &mut scratch, &mut killed)?;

    let mut chains: ArrayVec<ChainAgg, NFILE> = ArrayVec::new();
    pass2(dev, &dir, &mut alloc, &mut chains, &mut killed)?;
    finish_files(&mut dir, &chains);
    finish_deletes(dev, &scratch)?;

    let ids: ArrayVec<u16, NFILE> = dir.iter().map(|m| m.id).collect();
    for id in ids {
        repair_chain(dev, &mut dir, &mut alloc, id)?;
    }

    dev.flush()?;
    log::info!(
        "mounted: {} blocks, {} files, {} records recovered",
        sb.block_count,
        dir.len(),
        killed
    );
    Ok((dir, alloc))
}

fn scratch_for<'s>(
    table: &'s mut ArrayVec<Scratch, NFILE>,
    id: u16,
) -> Result<&'s mut Scratch> {
    if let Some(i) = table.iter().position(|s| s.id == id) {
        return Ok(&mut table[i]);
    }
    table
        .try_push(Scratch::new(id))
        .map_err(|_| Error::Exhausted)?;
    let last = table.len() - 1;
    Ok(&mut table[last])
}

fn pass1<D: BlockDevice>(
    dev: &mut D,
    alloc: &mut Allocator,
    scratch: &mut ArrayVec<Scratch, NFILE>,
    killed: &mut u32,
) -> Result<()> {
    for block in 0..alloc.block_count() {
        let base = alloc.block_start(block);
        let end = alloc.block_end(block);
        let mut addr = base + alloc.log_base(block);
        loop {
            let (hdr, next) = match record::decode_at(dev, addr, end)? {
                Parsed::End => {
                    alloc.set_tail(block, addr - base);
                    break;
                }
                Parsed::Junk => {
                    log::warn!("unparseable record at {:#x}; sealing block {}", addr, block);
                    let _ = record::mark_dead(dev, addr);
                    alloc.set_tail(block, alloc.block_size());
                    break;
                }
                Parsed::Rec { hdr, next } => (hdr, next),
            };

            match hdr.state() {
                State::Tentative => {
                    // No commit point reached: the record dies.
                    record::mark_dead(dev, addr)?;
                    *killed += 1;
                }
                State::Dead => {}
                State::Live => pass1_live(dev, scratch, addr, &hdr, killed)?,
            }

            addr = next;
            if addr >= end {
                alloc.set_tail(block, alloc.block_size());
                break;
            }
        }
    }
    Ok(())
}

fn pass1_live<D: BlockDevice>(
    dev: &mut D,
    scratch: &mut ArrayVec<Scratch, NFILE>,
    addr: u32,
    hdr: &Header,
    killed: &mut u32,
) -> Result<()> {
    let tag = match hdr.tag() {
        Some(t) => t,
        None => return Ok(()),
    };
    match tag {
        // Appends are pass 2's business; padding and transaction markers
        // carry no state worth collecting.
        Tag::Append | Tag::Padding | Tag::TxnBegin | Tag::TxnCommit | Tag::TxnAbort => {}
        // The real superblock sits before the log base and is never
        // walked; a superblock tag inside the log is stale.
        Tag::Superblock => {
            record::mark_dead(dev, addr)?;
            *killed += 1;
        }
        Tag::FileCreate => {
            if hdr.file() == NO_FILE
                || hdr.len() < 2
                || hdr.len() > 1 + NAMELEN as u32
                || !record::verify(dev, addr, hdr)?
            {
                log::warn!("bad create record at {:#x}", addr);
                record::mark_dead(dev, addr)?;
                *killed += 1;
                return Ok(());
            }
            let mut payload = [0u8; 1 + NAMELEN];
            record::read_payload(dev, addr, 0, &mut payload[..hdr.len() as usize])?;
            let name = match FileName::new(&payload[1..hdr.len() as usize]) {
                Ok(n) => NameBuf::from_name(n),
                Err(_) => {
                    record::mark_dead(dev, addr)?;
                    *killed += 1;
                    return Ok(());
                }
            };
            let entry = scratch_for(scratch, hdr.file())?;
            if entry.create.is_some() {
                // Two live creates for one id can only be corruption;
                // keep the first.
                record::mark_dead(dev, addr)?;
                *killed += 1;
            } else {
                entry.create = Some(Create {
                    addr,
                    total: hdr.total(),
                    flags: payload[0],
                    name,
                });
            }
        }
        Tag::Truncate => {
            if !record::verify(dev, addr, hdr)? {
                record::mark_dead(dev, addr)?;
                *killed += 1;
                return Ok(());
            }
            let entry = scratch_for(scratch, hdr.file())?;
            match entry.trunc {
                // The higher head offset wins; the loser was superseded
                // but its kill did not land before the crash.
                Some((old_addr, old_pos)) if hdr.pos() > old_pos => {
                    record::mark_dead(dev, old_addr)?;
                    *killed += 1;
                    entry.trunc = Some((addr, hdr.pos()));
                }
                Some(_) => {
                    record::mark_dead(dev, addr)?;
                    *killed += 1;
                }
                None => entry.trunc = Some((addr, hdr.pos())),
            }
        }
        Tag::SetFlags => {
            if hdr.len() != 1 || !record::verify(dev, addr, hdr)? {
                record::mark_dead(dev, addr)?;
                *killed += 1;
                return Ok(());
            }
            let mut val = [0u8; 1];
            record::read_payload(dev, addr, 0, &mut val)?;
            let entry = scratch_for(scratch, hdr.file())?;
            match entry.flags_rec {
                // The higher generation wins.
                Some((old_addr, old_gen, _)) if hdr.pos() > old_gen => {
                    record::mark_dead(dev, old_addr)?;
                    *killed += 1;
                    entry.flags_rec = Some((addr, hdr.pos(), val[0]));
                }
                Some(_) => {
                    record::mark_dead(dev, addr)?;
                    *killed += 1;
                }
                None => entry.flags_rec = Some((addr, hdr.pos(), val[0])),
            }
        }
        Tag::Delete => {
            if !record::verify(dev, addr, hdr)? {
                record::mark_dead(dev, addr)?;
                *killed += 1;
                return Ok(());
            }
            let entry = scratch_for(scratch, hdr.file())?;
            if entry.delete_addr != NIL {
                record::mark_dead(dev, addr)?;
                *killed += 1;
            } else {
                entry.delete_addr = addr;
            }
        }
    }
    Ok(())
}

/// Turns pass-1 scratch into directory entries. Orphan metadata (no
/// create record) dies here; files with a pending delete stay out of the
/// directory and are finished after pass 2.
fn resolve_files<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    scratch: &mut ArrayVec<Scratch, NFILE>,
    killed: &mut u32,
) -> Result<()> {
    for entry in scratch.iter_mut() {
        let create = match &entry.create {
            Some(c) => c,
            None => {
                // Metadata for a file that does not exist.
                let stray = [
                    entry.delete_addr,
                    entry.trunc.map(|(a, _)| a).unwrap_or(NIL),
                    entry.flags_rec.map(|(a, _, _)| a).unwrap_or(NIL),
                ];
                for addr in stray.iter().copied().filter(|a| *a != NIL) {
                    record::mark_dead(dev, addr)?;
                    *killed += 1;
                }
                continue;
            }
        };
        if entry.delete_addr != NIL {
            continue;
        }
        if dir
            .lookup(FileName::new(create.name.as_bytes())?)
            .is_some()
        {
            // Duplicate name: corruption; keep the earlier file.
            record::mark_dead(dev, create.addr)?;
            *killed += 1;
            entry.create = None;
            continue;
        }
        let mut meta = FileMeta::new(create.name, entry.id, create.flags, create.addr);
        if let Some((addr, gen, val)) = entry.flags_rec {
            meta.flags = val;
            meta.flag_gen = gen;
            meta.flags_addr = addr;
        }
        if let Some((addr, pos)) = entry.trunc {
            meta.head = pos;
            meta.tail = pos;
            meta.trunc_addr = addr;
        }
        alloc.account(
            create.addr,
            create.total,
            Tag::FileCreate,
            Some(meta.priority()),
        );
        if let Some((addr, _)) = entry.trunc {
            alloc.account(addr, HEADER_SIZE as u32, Tag::Truncate, None);
        }
        if let Some((addr, _, _)) = entry.flags_rec {
            alloc.account(addr, HEADER_SIZE as u32 + 1, Tag::SetFlags, None);
        }
        dir.insert(meta)?;
    }
    Ok(())
}

fn pass2<D: BlockDevice>(
    dev: &mut D,
    dir: &Directory,
    alloc: &mut Allocator,
    chains: &mut ArrayVec<ChainAgg, NFILE>,
    killed: &mut u32,
) -> Result<()> {
    for block in 0..alloc.block_count() {
        let base = alloc.block_start(block);
        let end = alloc.block_end(block);
        let mut addr = base + alloc.log_base(block);
        while addr < end {
            let (hdr, next) = match record::decode_at(dev, addr, end)? {
                Parsed::End | Parsed::Junk => break,
                Parsed::Rec { hdr, next } => (hdr, next),
            };
            if hdr.state() == State::Live && hdr.tag() == Some(Tag::Append) {
                pass2_append(dev, dir, alloc, chains, addr, &hdr, killed)?;
            }
            addr = next;
        }
    }
    Ok(())
}

fn pass2_append<D: BlockDevice>(
    dev: &mut D,
    dir: &Directory,
    alloc: &mut Allocator,
    chains: &mut ArrayVec<ChainAgg, NFILE>,
    addr: u32,
    hdr: &Header,
    killed: &mut u32,
) -> Result<()> {
    let meta = match dir.by_id(hdr.file()) {
        Some(m) => m,
        None => {
            // Deleted or unknown file: finish the job.
            record::mark_dead(dev, addr)?;
            *killed += 1;
            return Ok(());
        }
    };
    if !record::verify(dev, addr, hdr)? {
        log::warn!("corrupt append at {:#x}; skipping", addr);
        record::mark_dead(dev, addr)?;
        *killed += 1;
        return Ok(());
    }
    if hdr.end() <= meta.head {
        // Wholly below the head: an interrupted bookmark or eviction.
        record::mark_dead(dev, addr)?;
        *killed += 1;
        return Ok(());
    }
    let prio = meta.priority();
    alloc.account(addr, hdr.total(), Tag::Append, Some(prio));

    match chains.iter_mut().find(|c| c.id == hdr.file()) {
        Some(agg) => {
            if hdr.pos() < agg.first_pos {
                agg.first_pos = hdr.pos();
                agg.first_addr = addr;
            }
            if hdr.end() > agg.last_end {
                agg.last_end = hdr.end();
                agg.last_addr = addr;
            }
        }
        None => chains
            .try_push(ChainAgg {
                id: hdr.file(),
                first_pos: hdr.pos(),
                first_addr: addr,
                last_end: hdr.end(),
                last_addr: addr,
            })
            .map_err(|_| Error::Exhausted)?,
    }
    Ok(())
}

/// Folds the chain aggregates into the directory.
fn finish_files(dir: &mut Directory, chains: &ArrayVec<ChainAgg, NFILE>) {
    for agg in chains {
        if let Some(meta) = dir.by_id_mut(agg.id) {
            // A surviving chain that starts past the recorded head means
            // reclamation advanced the file without a head record; the
            // suffix is authoritative.
            meta.head = meta.head.max(agg.first_pos);
            meta.tail = meta.tail.max(agg.last_end);
            meta.first_addr = agg.first_addr;
            meta.last_addr = agg.last_addr;
        }
    }
}

/// Completes interrupted deletes: the appends died in pass 2, so only the
/// metadata records and the delete record itself remain. None of them
/// were accounted (the file never entered the directory).
fn finish_deletes<D: BlockDevice>(
    dev: &mut D,
    scratch: &ArrayVec<Scratch, NFILE>,
) -> Result<()> {
    for entry in scratch {
        if entry.delete_addr == NIL || entry.create.is_none() {
            continue;
        }
        if let Some(create) = &entry.create {
            record::mark_dead(dev, create.addr)?;
        }
        if let Some((addr, _)) = entry.trunc {
            record::mark_dead(dev, addr)?;
        }
        if let Some((addr, _, _)) = entry.flags_rec {
            record::mark_dead(dev, addr)?;
        }
        record::mark_dead(dev, entry.delete_addr)?;
    }
    Ok(())
}

/// Pass 3: walks one file's chain, re-patching links a crash left
/// unpatched. A genuine gap clamps the file at the last reachable byte.
fn repair_chain<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    id: u16,
) -> Result<()> {
    let (mut cur, tail) = match dir.by_id(id) {
        Some(m) if m.first_addr != NIL => (m.first_addr, m.tail),
        _ => return Ok(()),
    };
    // Positions increase strictly along a well-formed chain, so more
    // steps than the medium can hold records means a link cycle.
    let mut steps = alloc.block_count() * (alloc.block_size() / HEADER_SIZE as u32) + 1;

    loop {
        steps = steps.checked_sub(1).ok_or(Error::Corruption)?;
        let hdr = record::read_header(dev, cur)?;
        let end = hdr.end();
        if end >= tail {
            break;
        }
        // Chase links to the next live append, walking through dead
        // nodes left in the chain.
        let mut next = hdr.link();
        let mut found = NIL;
        while next != NIL {
            steps = steps.checked_sub(1).ok_or(Error::Corruption)?;
            let nh = record::read_header(dev, next)?;
            if nh.state() == State::Live && nh.tag() == Some(Tag::Append) && nh.file() == id {
                if nh.pos() == end {
                    found = next;
                }
                break;
            }
            next = nh.link();
        }
        if found == NIL && hdr.link() == NIL {
            // The crash hit between flipping records live and patching
            // their links; the successor exists somewhere in the log.
            if let Some(n) = find_append(dev, alloc, id, end)? {
                record::patch_link(dev, cur, n)?;
                found = n;
            }
        }
        if found == NIL {
            // A record in the middle of the file is gone (a corruption
            // kill); nothing past this point is reachable.
            log::warn!("file {} loses its tail past offset {}", id, end);
            clamp_tail(dev, dir, alloc, id, end, cur)?;
            return Ok(());
        }
        cur = found;
    }
    Ok(())
}

/// Finds the LIVE append of `id` starting at logical offset `pos` by
/// walking the whole log.
fn find_append<D: BlockDevice>(
    dev: &mut D,
    alloc: &Allocator,
    id: u16,
    pos: u32,
) -> Result<Option<u32>> {
    for block in 0..alloc.block_count() {
        let base = alloc.block_start(block);
        let end = alloc.block_end(block);
        let mut addr = base + alloc.log_base(block);
        while addr < end {
            let (hdr, next) = match record::decode_at(dev, addr, end)? {
                Parsed::End | Parsed::Junk => break,
                Parsed::Rec { hdr, next } => (hdr, next),
            };
            if hdr.state() == State::Live
                && hdr.tag() == Some(Tag::Append)
                && hdr.file() == id
                && hdr.pos() == pos
            {
                return Ok(Some(addr));
            }
            addr = next;
        }
    }
    Ok(None)
}

/// Kills every live append of `id` at or past `new_tail` and clamps the
/// file there.
fn clamp_tail<D: BlockDevice>(
    dev: &mut D,
    dir: &mut Directory,
    alloc: &mut Allocator,
    id: u16,
    new_tail: u32,
    last_addr: u32,
) -> Result<()> {
    for block in 0..alloc.block_count() {
        let base = alloc.block_start(block);
        let end = alloc.block_end(block);
        let mut addr = base + alloc.log_base(block);
        while addr < end {
            let (hdr, next) = match record::decode_at(dev, addr, end)? {
                Parsed::End | Parsed::Junk => break,
                Parsed::Rec { hdr, next } => (hdr, next),
            };
            if hdr.state() == State::Live
                && hdr.tag() == Some(Tag::Append)
                && hdr.file() == id
                && hdr.pos() >= new_tail
            {
                alloc.kill(dev, addr, hdr.total(), Tag::Append)?;
            }
            addr = next;
        }
    }
    if let Some(meta) = dir.by_id_mut(id) {
        meta.tail = new_tail;
        meta.head = meta.head.min(new_tail);
        meta.last_addr = last_addr;
    }
    Ok(())
}
