use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("access of {len} bytes at offset {offset} is out of bounds for a buffer of {capacity} bytes")]
pub struct OutOfBounds {
    pub offset: usize,
    pub len: usize,
    pub capacity: usize,
}

/// Accounts for the bytes handed out by a bounded provider; buffers return their share when
/// dropped.
struct Accounting {
    used: Mutex<usize>,
    released: Condvar,
}

struct Lease {
    accounting: Arc<Accounting>,
    size: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut used = self.accounting.used.lock();
        *used -= self.size;
        self.accounting.released.notify_all();
    }
}

/// A fixed-size, zero-initialized block of memory. All accessors are bounds-checked.
pub struct Buffer {
    data: BytesMut,
    _lease: Option<Lease>,
}

impl Buffer {
    /// An unaccounted buffer, owned by nobody but the caller.
    pub fn zeroed(size: usize) -> Self {
        Self {
            data: BytesMut::zeroed(size),
            _lease: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), OutOfBounds> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(OutOfBounds {
                offset,
                len,
                capacity: self.data.len(),
            }),
        }
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8], OutOfBounds> {
        self.check(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], OutOfBounds> {
        self.check(offset, len)?;
        Ok(&mut self.data[offset..offset + len])
    }

    pub fn write_bytes(&mut self, offset: usize, src: &[u8]) -> Result<(), OutOfBounds> {
        self.bytes_mut(offset, src.len())?.copy_from_slice(src);
        Ok(())
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, OutOfBounds> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(offset, 8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<(), OutOfBounds> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn fill_zero(&mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer").field("len", &self.len()).finish()
    }
}

/// The capability through which all slice and cache memory is obtained.
pub trait BufferProvider: Send + Sync {
    /// Size of the buffers returned by [`BufferProvider::get_buffer_blocking`].
    fn buffer_size(&self) -> usize;

    /// Allocates a buffer of exactly `size` bytes, or `None` if the memory is not available.
    fn get_unpooled_buffer(&self, size: usize) -> Option<Buffer>;

    /// Returns a buffer of [`BufferProvider::buffer_size`] bytes, waiting until one is free.
    fn get_buffer_blocking(&self) -> Buffer;
}

/// Allocates from the heap, optionally capped at a total number of live bytes.
pub struct HeapBufferProvider {
    buffer_size: usize,
    limit: Option<usize>,
    accounting: Arc<Accounting>,
}

impl HeapBufferProvider {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            limit: None,
            accounting: Arc::new(Accounting {
                used: Mutex::new(0),
                released: Condvar::new(),
            }),
        }
    }

    pub fn with_limit(buffer_size: usize, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(buffer_size)
        }
    }

    pub fn used_bytes(&self) -> usize {
        *self.accounting.used.lock()
    }

    fn lease(&self, size: usize) -> Buffer {
        Buffer {
            data: BytesMut::zeroed(size),
            _lease: Some(Lease {
                accounting: self.accounting.clone(),
                size,
            }),
        }
    }
}

impl BufferProvider for HeapBufferProvider {
    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn get_unpooled_buffer(&self, size: usize) -> Option<Buffer> {
        let mut used = self.accounting.used.lock();
        if let Some(limit) = self.limit {
            if *used + size > limit {
                return None;
            }
        }
        *used += size;
        drop(used);
        Some(self.lease(size))
    }

    fn get_buffer_blocking(&self) -> Buffer {
        let mut used = self.accounting.used.lock();
        if let Some(limit) = self.limit {
            // a request larger than the whole limit can never be satisfied; hand it out once
            // everything else has been returned
            let needed = self.buffer_size.min(limit);
            while *used + needed > limit {
                self.accounting.released.wait(&mut used);
            }
        }
        *used += self.buffer_size;
        drop(used);
        self.lease(self.buffer_size)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_bounds_checked_access() {
        let mut buffer = Buffer::zeroed(16);
        buffer.write_u64(8, 42).unwrap();
        assert_eq!(buffer.read_u64(8).unwrap(), 42);
        assert_eq!(buffer.read_u64(0).unwrap(), 0);
        assert_eq!(
            buffer.read_u64(9),
            Err(OutOfBounds {
                offset: 9,
                len: 8,
                capacity: 16
            })
        );
        assert!(buffer.write_bytes(usize::MAX, &[1]).is_err());
    }

    #[test]
    fn test_limited_provider() {
        let provider = HeapBufferProvider::with_limit(64, 128);
        let a = provider.get_unpooled_buffer(100).unwrap();
        assert!(provider.get_unpooled_buffer(64).is_none());
        assert_eq!(provider.used_bytes(), 100);
        drop(a);
        assert_eq!(provider.used_bytes(), 0);
        assert!(provider.get_unpooled_buffer(128).is_some());
    }

    #[test]
    fn test_blocking_waits_for_release() {
        let provider = Arc::new(HeapBufferProvider::with_limit(64, 64));
        let held = provider.get_buffer_blocking();

        let p = provider.clone();
        let waiter = thread::spawn(move || p.get_buffer_blocking().len());

        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap(), 64);
    }
}
