//! A RAM-backed block device for the tests.
//!
//! Enforces the medium contract the store relies on: writes may only
//! clear bits, accesses never cross a block boundary, and persistence is
//! modeled as a snapshot taken at each `flush`. `crash` rewinds to the
//! last snapshot, losing everything submitted after the last durable
//! barrier.

use std::cell::RefCell;
use std::rc::Rc;

use tofs::{BlockDevice, Error, Result};

struct Inner {
    offset_bits: u32,
    block_count: u32,
    /// State as of the last durable barrier.
    flushed: Vec<u8>,
    /// State including all submitted writes.
    view: Vec<u8>,
    fail_writes: bool,
}

#[derive(Clone)]
pub struct MemDisk {
    inner: Rc<RefCell<Inner>>,
}

impl MemDisk {
    pub fn new(block_count: u32, offset_bits: u32) -> MemDisk {
        let size = (block_count as usize) << offset_bits;
        MemDisk {
            inner: Rc::new(RefCell::new(Inner {
                offset_bits,
                block_count,
                flushed: vec![0xFF; size],
                view: vec![0xFF; size],
                fail_writes: false,
            })),
        }
    }

    /// Simulated power loss: un-flushed writes vanish.
    pub fn crash(&self) {
        let mut inner = self.inner.borrow_mut();
        let snapshot = inner.flushed.clone();
        inner.view = snapshot;
    }

    /// Makes every subsequent write fail until turned off again.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.borrow_mut().fail_writes = fail;
    }

    fn check_span(inner: &Inner, offset: u32, len: usize) {
        assert!(len > 0);
        let first = offset >> inner.offset_bits;
        let last = (offset as usize + len - 1) >> inner.offset_bits;
        assert_eq!(first as usize, last, "access crosses a block boundary");
    }
}

impl BlockDevice for MemDisk {
    fn offset_bits(&self) -> u32 {
        self.inner.borrow().offset_bits
    }

    fn block_count(&self) -> u32 {
        self.inner.borrow().block_count
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.borrow();
        Self::check_span(&inner, offset, buf.len());
        let off = offset as usize;
        buf.copy_from_slice(&inner.view[off..off + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u32, buf: &[u8]) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_writes {
            return Err(Error::Io);
        }
        Self::check_span(&inner, offset, buf.len());
        for (i, b) in buf.iter().enumerate() {
            let cell = &mut inner.view[offset as usize + i];
            assert_eq!(
                *cell & *b,
                *b,
                "write would set an erased bit at {:#x}",
                offset as usize + i
            );
            *cell &= *b;
        }
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        assert!(block < inner.block_count);
        let size = 1usize << inner.offset_bits;
        let start = (block as usize) << inner.offset_bits;
        for cell in &mut inner.view[start..start + size] {
            *cell = 0xFF;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let snapshot = inner.view.clone();
        inner.flushed = snapshot;
        Ok(())
    }
}
