//! The volume: one value owning every piece of per-volume state, with the
//! whole public operation surface as methods. No ambient state anywhere;
//! the caller serializes access (there are no internal locks, matching
//! the single-threaded embedded model).

use bitflags::bitflags;

use crate::{
    alloc::{Allocator, SpaceInfo},
    dev::BlockDevice,
    dir::{Directory, FileInfo, FileMeta, Priority},
    error::{Error, Result},
    file::{self, Fd, Handle, HandleTable, Mode},
    name::{FileName, NameBuf},
    param::NAMELEN,
    record::{self, Header, Tag, HEADER_SIZE, NIL, TENTATIVE},
    scan,
    superblock::{self, Superblock},
    tx::{self, Pending, TxState},
};

bitflags! {
    /// Flags accepted by [`Volume::open`]. Exactly one of `READ`,
    /// `APPEND`, `QUEUE` selects the mode; at most one `PRIO_*` flag sets
    /// or updates the file's priority (omitting them keeps the existing
    /// flags, with `Normal` for newly created files).
    pub struct OpenFlags: u8 {
        /// Sequential read cursor starting at the file's head.
        const READ = 0b0000_0001;
        /// Write cursor at the file's tail.
        const APPEND = 0b0000_0010;
        /// Sequential read plus the bookmark capability.
        const QUEUE = 0b0000_0100;
        /// Fail with `NotFound` instead of creating the file.
        const DONT_CREATE = 0b0000_1000;
        const PRIO_LOW = 0b0001_0000;
        const PRIO_NORMAL = 0b0010_0000;
        const PRIO_HIGH = 0b0100_0000;
    }
}

impl OpenFlags {
    fn mode(self) -> Result<Mode> {
        let mode_bits = self & (OpenFlags::READ | OpenFlags::APPEND | OpenFlags::QUEUE);
        match mode_bits {
            x if x == OpenFlags::READ => Ok(Mode::Read),
            x if x == OpenFlags::APPEND => Ok(Mode::Append),
            x if x == OpenFlags::QUEUE => Ok(Mode::Queue),
            _ => Err(Error::InvalidFlags),
        }
    }

    fn priority(self) -> Result<Option<Priority>> {
        let prio_bits =
            self & (OpenFlags::PRIO_LOW | OpenFlags::PRIO_NORMAL | OpenFlags::PRIO_HIGH);
        match prio_bits {
            x if x.is_empty() => Ok(None),
            x if x == OpenFlags::PRIO_LOW => Ok(Some(Priority::Low)),
            x if x == OpenFlags::PRIO_NORMAL => Ok(Some(Priority::Normal)),
            x if x == OpenFlags::PRIO_HIGH => Ok(Some(Priority::High)),
            _ => Err(Error::InvalidFlags),
        }
    }
}

/// Everything that exists only while mounted.
struct Mounted {
    sb: Superblock,
    dir: Directory,
    alloc: Allocator,
    tx: TxState,
    handles: HandleTable,
}

/// A transactional, log-structured file store over one block device.
pub struct Volume<D: BlockDevice> {
    dev: D,
    state: Option<Mounted>,
}

impl<D: BlockDevice> Volume<D> {
    /// Wraps a device; nothing touches the medium until `mount`.
    pub fn new(dev: D) -> Volume<D> {
        Volume { dev, state: None }
    }

    /// Releases the device.
    pub fn into_inner(self) -> D {
        self.dev
    }

    pub fn is_mounted(&self) -> bool {
        self.state.is_some()
    }

    /// Scans the medium and rebuilds RAM state. With `auto_format`, a
    /// medium without a valid superblock is formatted first. Idempotent
    /// while mounted.
    pub fn mount(&mut self, auto_format: bool) -> Result<()> {
        if self.state.is_some() {
            return Ok(());
        }
        let sb = match superblock::load(&mut self.dev) {
            Ok(sb) => sb,
            Err(Error::Io) => return Err(Error::Io),
            Err(e) => {
                if !auto_format {
                    return Err(e);
                }
                superblock::format(&mut self.dev)?
            }
        };
        let (dir, alloc) = scan::mount(&mut self.dev, &sb)?;
        self.state = Some(Mounted {
            sb,
            dir,
            alloc,
            tx: TxState::new(),
            handles: HandleTable::new(),
        });
        Ok(())
    }

    /// Drops all RAM state. Refused while a transaction is open (commit
    /// or abort it first); open handles simply cease to exist.
    pub fn unmount(&mut self) -> Result<()> {
        let m = self.state.as_ref().ok_or(Error::NotMounted)?;
        if m.tx.is_open() {
            return Err(Error::Busy);
        }
        self.state = None;
        Ok(())
    }

    /// Erases the medium and writes a fresh superblock. Only legal on an
    /// unmounted volume.
    pub fn format(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::AlreadyMounted);
        }
        superblock::format(&mut self.dev)?;
        Ok(())
    }

    /// Opens (and unless `DONT_CREATE`, creates on demand) a file.
    pub fn open(&mut self, name: &[u8], flags: OpenFlags) -> Result<Fd> {
        let dev = &mut self.dev;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        let name = FileName::new(name)?;
        let mode = flags.mode()?;
        let prio = flags.priority()?;
        if !m.handles.has_free() {
            return Err(Error::Exhausted);
        }

        if let Some(meta) = m.dir.lookup(name) {
            let id = meta.id;
            let cur_prio = meta.priority();
            let flags_byte = meta.flags;
            let gen = meta.flag_gen;
            if mode == Mode::Append && m.handles.has_append(id) {
                return Err(Error::Busy);
            }
            if let Some(p) = prio {
                if p != cur_prio {
                    // Priority updates persist as a flags record.
                    let new_flags = p.apply_to(flags_byte);
                    with_txn(dev, m, |dev, m| {
                        write_setflags(dev, m, id, new_flags, gen + 1)
                    })?;
                }
            }
            let meta = m.dir.by_id(id).ok_or(Error::Corruption)?;
            let handle = match mode {
                Mode::Append => Handle {
                    file: id,
                    mode,
                    addr: NIL,
                    off: meta.tail,
                },
                Mode::Read | Mode::Queue => Handle {
                    file: id,
                    mode,
                    addr: meta.first_addr,
                    off: meta.head,
                },
            };
            return m.handles.open(handle);
        }

        if flags.contains(OpenFlags::DONT_CREATE) {
            return Err(Error::NotFound);
        }
        let id = m.dir.alloc_id();
        let flags_byte = prio.unwrap_or(Priority::Normal).apply_to(0);
        with_txn(dev, m, |dev, m| {
            write_create(dev, m, id, name, flags_byte)
        })?;
        let handle = Handle {
            file: id,
            mode,
            addr: NIL,
            off: 0,
        };
        m.handles.open(handle)
    }

    /// Releases a handle. Writes issued through it were each committed by
    /// their enclosing transaction already; nothing is pending here.
    pub fn close(&mut self, fd: Fd) -> Result<()> {
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        m.handles.close(fd)
    }

    /// Appends `buf` as one record (split only if it exceeds what a block
    /// can hold). Atomic within the enclosing transaction.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<()> {
        let dev = &mut self.dev;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        let h = *m.handles.get(fd)?;
        if h.mode != Mode::Append {
            return Err(Error::BadHandle);
        }
        if buf.is_empty() {
            return Ok(());
        }
        let max_payload = m.alloc.block_size() as usize - HEADER_SIZE;
        with_txn(dev, m, |dev, m| {
            for chunk in buf.chunks(max_payload) {
                write_append(dev, m, h.file, chunk)?;
            }
            Ok(())
        })
    }

    /// Consumes the next record into `buf`, returning the copied length;
    /// with no buffer, returns the next record's size without consuming
    /// it (the size-peek API). `Ok(0)` means end of file. A buffer
    /// shorter than the record receives a truncated copy and the record
    /// is still consumed.
    pub fn read(&mut self, fd: Fd, buf: Option<&mut [u8]>) -> Result<usize> {
        let dev = &mut self.dev;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        let mut h = *m.handles.get(fd)?;
        if h.mode == Mode::Append {
            return Err(Error::BadHandle);
        }
        let meta = m.dir.by_id(h.file).ok_or(Error::BadHandle)?;

        let next = file::next_record(dev, meta, &mut h);
        // Cursor repairs stick even when the read itself fails.
        *m.handles.get_mut(fd)? = h;
        let (addr, hdr) = match next? {
            Some(x) => x,
            None => return Ok(0),
        };

        match buf {
            None => Ok(hdr.len() as usize),
            Some(out) => {
                let n = (hdr.len() as usize).min(out.len());
                record::read_payload(dev, addr, 0, &mut out[..n])?;
                let h = m.handles.get_mut(fd)?;
                h.off = hdr.end();
                h.addr = hdr.link();
                Ok(n)
            }
        }
    }

    /// Records a head-advance to the handle's read cursor: everything
    /// already consumed becomes reclaimable. Queue handles only.
    pub fn bookmark(&mut self, fd: Fd) -> Result<()> {
        let dev = &mut self.dev;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        let h = *m.handles.get(fd)?;
        if h.mode != Mode::Queue {
            return Err(Error::BadHandle);
        }
        let meta = m.dir.by_id(h.file).ok_or(Error::BadHandle)?;
        if h.off <= meta.head {
            return Ok(());
        }
        let id = h.file;
        let new_head = h.off;
        with_txn(dev, m, |dev, m| write_truncate(dev, m, id, new_head))
    }

    /// Opens an explicit transaction; nested calls stack and only the
    /// outermost `commit` commits.
    pub fn transaction(&mut self) -> Result<()> {
        let dev = &mut self.dev;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        if m.tx.is_aborted() {
            return Err(Error::TxnAborted);
        }
        if !m.tx.is_open() {
            // The begin marker hits the medium before any state changes;
            // if it cannot be placed the transaction never opened.
            let id = m.tx.upcoming_id();
            tx::begin_marker(dev, &mut m.dir, &mut m.alloc, id)?;
        }
        m.tx.begin(true)?;
        Ok(())
    }

    /// Commits the current transaction. When `commit` returns, a crash
    /// cannot undo the committed records.
    pub fn commit(&mut self) -> Result<()> {
        let dev = &mut self.dev;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        if !m.tx.is_open() {
            return Err(Error::Busy);
        }
        if m.tx.is_aborted() {
            return Err(Error::TxnAborted);
        }
        if !m.tx.unnest() {
            return Ok(());
        }
        tx::commit(dev, &mut m.dir, &mut m.alloc, &mut m.tx)
    }

    /// Rolls back the current transaction; every record it wrote is
    /// flipped dead and files it created disappear.
    pub fn abort(&mut self) -> Result<()> {
        let dev = &mut self.dev;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        if !m.tx.is_open() {
            return Err(Error::Busy);
        }
        if !m.tx.unnest() {
            // An inner abort dooms the whole flattened transaction.
            m.tx.poison();
            return Ok(());
        }
        let result = tx::abort(dev, &mut m.dir, &mut m.alloc, &mut m.tx);
        m.handles.sweep(&m.dir);
        result
    }

    /// Deletes a file. Refused while any handle is open on it.
    pub fn delete(&mut self, name: &[u8]) -> Result<()> {
        let dev = &mut self.dev;
        let m = self.state.as_mut().ok_or(Error::NotMounted)?;
        let name = FileName::new(name)?;
        let id = match m.dir.lookup(name) {
            Some(meta) => meta.id,
            None => return Err(Error::NotFound),
        };
        if m.handles.has_any(id) {
            return Err(Error::Busy);
        }
        with_txn(dev, m, |dev, m| write_delete(dev, m, id))
    }

    /// Enumerates files into `out`, returning how many were written.
    /// Order is unspecified but stable within a mount.
    pub fn list_into(&self, out: &mut [FileInfo]) -> Result<usize> {
        let m = self.state.as_ref().ok_or(Error::NotMounted)?;
        let mut n = 0;
        for meta in m.dir.iter() {
            if n == out.len() {
                break;
            }
            out[n] = FileInfo::of(meta);
            n += 1;
        }
        Ok(n)
    }

    /// Enumerates files through a callback.
    pub fn list<F: FnMut(&FileInfo)>(&self, mut f: F) -> Result<()> {
        let m = self.state.as_ref().ok_or(Error::NotMounted)?;
        for meta in m.dir.iter() {
            f(&FileInfo::of(meta));
        }
        Ok(())
    }

    /// Metadata for one file without opening it.
    pub fn stat(&self, name: &[u8]) -> Result<FileInfo> {
        let m = self.state.as_ref().ok_or(Error::NotMounted)?;
        let name = FileName::new(name)?;
        m.dir.lookup(name).map(FileInfo::of).ok_or(Error::NotFound)
    }

    /// Free/used accounting derived from the block table.
    pub fn space(&self) -> Result<SpaceInfo> {
        let m = self.state.as_ref().ok_or(Error::NotMounted)?;
        Ok(m.alloc.space())
    }

    /// Volume geometry as recorded in the superblock.
    pub fn superblock(&self) -> Result<Superblock> {
        let m = self.state.as_ref().ok_or(Error::NotMounted)?;
        Ok(m.sb)
    }
}

/// Runs `f` under the open transaction, or wraps it in an implicit
/// single-operation transaction when none is open. Implicit transactions
/// follow the same engine but skip the begin/commit markers: a single
/// flipped record is its own commit point.
fn with_txn<D, F>(dev: &mut D, m: &mut Mounted, f: F) -> Result<()>
where
    D: BlockDevice,
    F: FnOnce(&mut D, &mut Mounted) -> Result<()>,
{
    if m.tx.is_aborted() {
        return Err(Error::TxnAborted);
    }
    let implicit = !m.tx.is_open();
    if implicit {
        m.tx.begin(false)?;
    }
    let mark = m.tx.mark();
    match f(dev, m) {
        Ok(()) => {
            if implicit {
                tx::commit(dev, &mut m.dir, &mut m.alloc, &mut m.tx)
            } else {
                Ok(())
            }
        }
        Err(e) => {
            if implicit {
                let _ = tx::abort(dev, &mut m.dir, &mut m.alloc, &mut m.tx);
            } else {
                // The operation stays atomic on its own: records it
                // already placed roll back, the batch around it stands.
                tx::rollback_to(dev, &mut m.dir, &mut m.alloc, &mut m.tx, mark);
                if e == Error::Io {
                    // The adapter failed mid-transaction; only abort may
                    // follow.
                    m.tx.poison();
                }
            }
            m.handles.sweep(&m.dir);
            Err(e)
        }
    }
}

/// Places and programs one TENTATIVE record under the open transaction.
fn write_tx_record<D: BlockDevice>(
    dev: &mut D,
    m: &mut Mounted,
    tag: Tag,
    id: u16,
    pos: u32,
    payload: &[u8],
    prio: Priority,
    arg: u8,
) -> Result<()> {
    let total = (HEADER_SIZE + payload.len()) as u32;
    let addr = m.alloc.place(dev, &mut m.dir, total, tag, prio)?;
    let hdr = Header::compose(tag, TENTATIVE, id, pos, payload);
    if let Err(e) = record::write_record(dev, addr, &hdr, payload) {
        // Never leave an erased gap mid-block: it would end the log walk
        // early at next mount.
        m.alloc.seal_current(dev);
        return Err(e);
    }
    m.alloc.account(addr, total, tag, Some(prio));
    let pending = Pending {
        addr,
        tag,
        file: id,
        pos,
        total,
        arg,
    };
    if let Err(e) = m.tx.push(pending) {
        // Untracked tentative records would leak until the next mount.
        let _ = m.alloc.kill(dev, addr, total, tag);
        return Err(e);
    }
    Ok(())
}

fn write_append<D: BlockDevice>(
    dev: &mut D,
    m: &mut Mounted,
    id: u16,
    chunk: &[u8],
) -> Result<()> {
    let (pos, prio) = {
        let meta = m.dir.by_id(id).ok_or(Error::BadHandle)?;
        (meta.tail + m.tx.pending_append_len(id), meta.priority())
    };
    write_tx_record(dev, m, Tag::Append, id, pos, chunk, prio, 0)
}

fn write_truncate<D: BlockDevice>(
    dev: &mut D,
    m: &mut Mounted,
    id: u16,
    new_head: u32,
) -> Result<()> {
    let prio = m.dir.by_id(id).ok_or(Error::BadHandle)?.priority();
    write_tx_record(dev, m, Tag::Truncate, id, new_head, &[], prio, 0)
}

fn write_delete<D: BlockDevice>(dev: &mut D, m: &mut Mounted, id: u16) -> Result<()> {
    let prio = m.dir.by_id(id).ok_or(Error::NotFound)?.priority();
    write_tx_record(dev, m, Tag::Delete, id, 0, &[], prio, 0)
}

fn write_setflags<D: BlockDevice>(
    dev: &mut D,
    m: &mut Mounted,
    id: u16,
    new_flags: u8,
    gen: u32,
) -> Result<()> {
    let prio = Priority::from_flags(new_flags);
    write_tx_record(dev, m, Tag::SetFlags, id, gen, &[new_flags], prio, new_flags)
}

/// Writes the create record and installs the directory entry. The entry
/// appears immediately so the creator can use it inside the transaction;
/// a rollback removes it again.
fn write_create<D: BlockDevice>(
    dev: &mut D,
    m: &mut Mounted,
    id: u16,
    name: &FileName,
    flags: u8,
) -> Result<()> {
    if m.dir.len() == crate::param::NFILE {
        return Err(Error::Exhausted);
    }
    let mut payload = [0u8; 1 + NAMELEN];
    payload[0] = flags;
    payload[1..1 + name.as_bytes().len()].copy_from_slice(name.as_bytes());
    let len = 1 + name.as_bytes().len();
    let prio = Priority::from_flags(flags);
    write_tx_record(dev, m, Tag::FileCreate, id, 0, &payload[..len], prio, 0)?;

    // The record address is the last one pushed.
    let create_addr = m.tx.last_addr().unwrap_or(NIL);
    let meta = FileMeta::new(NameBuf::from_name(name), id, flags, create_addr);
    m.dir.insert(meta)
}
