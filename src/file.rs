//! Open handles: per-open cursor state over a file's append chain.

use crate::{
    dev::BlockDevice,
    dir::{Directory, FileMeta},
    error::{Error, Result},
    param::NHANDLE,
    record::{self, Header, State, Tag, NIL},
};

/// An open handle id, as returned by `Volume::open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(pub(crate) u8);

/// How a handle was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Write cursor at the file's tail.
    Append,
    /// Sequential read cursor.
    Read,
    /// Sequential read cursor plus the bookmark capability.
    Queue,
}

/// Per-open state. Append handles only need the file id (the tail lives
/// in the directory); read handles carry a record-address cursor and the
/// logical offset it must agree with.
#[derive(Clone, Copy)]
pub struct Handle {
    pub file: u16,
    pub mode: Mode,
    /// Address of the next unconsumed record; NIL at the chain end or
    /// when the cursor must be re-resolved.
    pub addr: u32,
    /// Logical offset of the next unconsumed byte.
    pub off: u32,
}

/// Fixed table of open handles.
pub struct HandleTable {
    slots: [Option<Handle>; NHANDLE],
}

impl HandleTable {
    pub const fn new() -> HandleTable {
        HandleTable {
            slots: [None; NHANDLE],
        }
    }

    pub fn clear(&mut self) {
        self.slots = [None; NHANDLE];
    }

    pub fn has_free(&self) -> bool {
        self.slots.iter().any(|s| s.is_none())
    }

    pub fn open(&mut self, handle: Handle) -> Result<Fd> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(Fd(i as u8));
            }
        }
        Err(Error::Exhausted)
    }

    pub fn get(&self, fd: Fd) -> Result<&Handle> {
        self.slots
            .get(fd.0 as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::BadHandle)
    }

    pub fn get_mut(&mut self, fd: Fd) -> Result<&mut Handle> {
        self.slots
            .get_mut(fd.0 as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Error::BadHandle)
    }

    pub fn close(&mut self, fd: Fd) -> Result<()> {
        let slot = self.slots.get_mut(fd.0 as usize).ok_or(Error::BadHandle)?;
        if slot.is_none() {
            return Err(Error::BadHandle);
        }
        *slot = None;
        Ok(())
    }

    /// Is there an append handle open on `file`? A file admits exactly
    /// one.
    pub fn has_append(&self, file: u16) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|h| h.file == file && h.mode == Mode::Append)
    }

    /// Is any handle open on `file`?
    pub fn has_any(&self, file: u16) -> bool {
        self.slots.iter().flatten().any(|h| h.file == file)
    }

    /// Drops handles whose file no longer exists (after an aborted
    /// transaction rolled back the create, or a recovery sweep).
    pub fn sweep(&mut self, dir: &Directory) {
        for slot in &mut self.slots {
            if let Some(h) = slot {
                if dir.by_id(h.file).is_none() {
                    *slot = None;
                }
            }
        }
    }
}

/// Resolves the next unconsumed record under `h`, repairing the cursor
/// when reclamation moved the file's head past it or the chain grew since
/// the last call. Returns `None` at end of file.
pub fn next_record<D: BlockDevice>(
    dev: &mut D,
    meta: &FileMeta,
    h: &mut Handle,
) -> Result<Option<(u32, Header)>> {
    // Content before the head is gone; a stale cursor jumps forward.
    if h.off < meta.head {
        h.off = meta.head;
        h.addr = meta.first_addr;
    }
    if h.off >= meta.tail {
        return Ok(None);
    }
    if let Some(found) = probe(dev, h.addr, meta.id, h.off)? {
        return Ok(Some((h.addr, found)));
    }
    // The cursor address is stale (chain grew past a NIL link we cached,
    // or the record moved out from under us). Chase the chain.
    let mut addr = meta.first_addr;
    while addr != NIL {
        let hdr = record::read_header(dev, addr)?;
        if hdr.state() == State::Live
            && hdr.tag() == Some(Tag::Append)
            && hdr.file() == meta.id
        {
            if hdr.pos() == h.off {
                h.addr = addr;
                return Ok(Some((addr, hdr)));
            }
            if hdr.pos() > h.off {
                break;
            }
        }
        addr = hdr.link();
    }
    // The offset lies inside the file but no record starts there.
    Err(Error::Corruption)
}

/// Checks whether `addr` holds the LIVE append of `file` starting at
/// logical offset `off`.
fn probe<D: BlockDevice>(
    dev: &mut D,
    addr: u32,
    file: u16,
    off: u32,
) -> Result<Option<Header>> {
    if addr == NIL {
        return Ok(None);
    }
    let hdr = record::read_header(dev, addr)?;
    if hdr.state() == State::Live
        && hdr.tag() == Some(Tag::Append)
        && hdr.file() == file
        && hdr.pos() == off
    {
        Ok(Some(hdr))
    } else {
        Ok(None)
    }
}
