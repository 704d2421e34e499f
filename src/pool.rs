//! Per-connection receive pool.
//!
//! Delivery copies each message record into a slice of the receiver's
//! pool. A slice starts out private to the bus; a peek flushes it so the
//! owner may read it in place, a full receive publishes it, transferring
//! the obligation to free it to the owner. Userspace maps the pool
//! read-only; this model enforces the same one-way visibility through the
//! slice states.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    limits,
    util::align8,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SliceState {
    /// Owned by the bus, invisible to the pool's owner.
    Private,
    /// Still owned by the bus, but readable (peeked).
    Readable,
    /// Owned by the pool's owner, who must free it.
    Public,
}

#[derive(Debug)]
struct Slice {
    data: Vec<u8>,
    state: SliceState,
}

#[derive(Debug, Default)]
struct PoolInner {
    /// Slices keyed by offset; gaps between them are free space.
    slices: BTreeMap<u64, Slice>,
}

/// A connection's receive buffer, carved into message slices.
#[derive(Debug)]
pub struct Pool {
    size: u64,
    inner: Mutex<PoolInner>,
}

impl Pool {
    pub fn new(size: u64) -> Result<Self> {
        if size == 0 || size > limits::POOL_MAX_SIZE {
            return Err(Error::InvalidArgument("bad pool size"));
        }
        Ok(Self {
            size,
            inner: Mutex::new(PoolInner::default()),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Allocate a private slice holding `data`, returning its offset.
    pub(crate) fn alloc(&self, data: Vec<u8>) -> Result<u64> {
        let len = align8(data.len().max(1) as u64);
        let mut inner = self.inner.lock();

        let mut prev_end = 0;
        let mut offset = None;
        for (&off, slice) in inner.slices.iter() {
            if off - prev_end >= len {
                offset = Some(prev_end);
                break;
            }
            prev_end = off + align8(slice.data.len().max(1) as u64);
        }
        let offset = match offset {
            Some(off) => off,
            None if self.size - prev_end >= len => prev_end,
            None => return Err(Error::NoBufferSpace),
        };
        inner.slices.insert(
            offset,
            Slice {
                data,
                state: SliceState::Private,
            },
        );
        Ok(offset)
    }

    /// Make a private slice readable in place without releasing it.
    pub(crate) fn flush(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let slice = inner.slices.get_mut(&offset).ok_or(Error::NotFound)?;
        if slice.state == SliceState::Private {
            slice.state = SliceState::Readable;
        }
        Ok(())
    }

    /// Hand a slice over to the pool's owner.
    pub(crate) fn publish(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let slice = inner.slices.get_mut(&offset).ok_or(Error::NotFound)?;
        slice.state = SliceState::Public;
        Ok(())
    }

    /// Read a slice. Only flushed or published slices are visible.
    pub fn read(&self, offset: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let slice = inner.slices.get(&offset).ok_or(Error::NotFound)?;
        if slice.state == SliceState::Private {
            return Err(Error::InvalidArgument("slice is not visible yet"));
        }
        Ok(slice.data.clone())
    }

    /// Free a published slice; the owner-facing half of the free command.
    pub(crate) fn free_public(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.slices.get(&offset).map(|s| s.state) {
            Some(SliceState::Public) => {
                inner.slices.remove(&offset);
                Ok(())
            }
            Some(_) => Err(Error::InvalidArgument("slice is not published")),
            None => Err(Error::NotFound),
        }
    }

    /// Free a slice regardless of its state.
    pub(crate) fn free_any(&self, offset: u64) {
        self.inner.lock().slices.remove(&offset);
    }

    /// Move a slice between pools, preserving its contents. The slice is
    /// private again in the destination.
    pub(crate) fn move_slice(dst: &Pool, src: &Pool, offset: u64) -> Result<u64> {
        let slice = src
            .inner
            .lock()
            .slices
            .remove(&offset)
            .ok_or(Error::NotFound)?;
        dst.alloc(slice.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_are_invisible_until_flushed() {
        let pool = Pool::new(4096).unwrap();
        let off = pool.alloc(b"secret".to_vec()).unwrap();
        assert!(matches!(pool.read(off), Err(Error::InvalidArgument(_))));
        pool.flush(off).unwrap();
        assert_eq!(pool.read(off).unwrap(), b"secret");
    }

    #[test]
    fn free_requires_publication() {
        let pool = Pool::new(4096).unwrap();
        let off = pool.alloc(vec![1, 2, 3]).unwrap();
        assert!(pool.free_public(off).is_err());
        pool.publish(off).unwrap();
        pool.free_public(off).unwrap();
        assert_eq!(pool.free_public(off).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn exhaustion_reports_no_buffer_space() {
        let pool = Pool::new(16).unwrap();
        let _a = pool.alloc(vec![0; 8]).unwrap();
        let _b = pool.alloc(vec![0; 8]).unwrap();
        assert_eq!(pool.alloc(vec![0; 8]).unwrap_err(), Error::NoBufferSpace);
    }

    #[test]
    fn freed_space_is_reused() {
        let pool = Pool::new(32).unwrap();
        let a = pool.alloc(vec![0; 16]).unwrap();
        let _b = pool.alloc(vec![0; 16]).unwrap();
        pool.free_any(a);
        let c = pool.alloc(vec![0; 16]).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn moved_slice_lands_private() {
        let src = Pool::new(64).unwrap();
        let dst = Pool::new(64).unwrap();
        let off = src.alloc(b"migrate".to_vec()).unwrap();
        src.flush(off).unwrap();
        let moved = Pool::move_slice(&dst, &src, off).unwrap();
        assert!(matches!(src.read(off), Err(Error::NotFound)));
        assert!(matches!(dst.read(moved), Err(Error::InvalidArgument(_))));
        dst.flush(moved).unwrap();
        assert_eq!(dst.read(moved).unwrap(), b"migrate");
    }
}
