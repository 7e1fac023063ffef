//! 🔄 RingBuffer: a fixed-size byte loop with two cursors and one sacrificial slot.
//!
//! The buffer only does cursor arithmetic. Callers copy bytes into
//! `storage_mut()[write_offset()..]` first and then call [`RingBuffer::write`] to publish them,
//! and the read side mirrors that. When the free (or filled) region wraps past the end of the
//! backing array the caller does the copy in two segments. There is no contiguous-span guarantee.
//!
//! One byte always stays empty, so `write_offset == read_offset` unambiguously means "empty"
//! and a capacity of `C` holds at most `C - 1` bytes.
//!
//! Single producer, single consumer. `&mut self` on every mutator enforces that by construction.

use crate::error::{BridgeError, BridgeResult};

/// 📦 Fixed-capacity byte ring. See the module docs for the copy-then-advance contract.
pub struct RingBuffer {
    storage: Box<[u8]>,
    write_offset: usize,
    read_offset: usize,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 nobody wants 8 MiB of bytes in their debug output
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("write_offset", &self.write_offset)
            .field("read_offset", &self.read_offset)
            .field("available_read", &self.available_read())
            .finish()
    }
}

impl RingBuffer {
    /// 🏗️ Allocate a ring of `capacity` bytes. A capacity of 0 is bumped to 1, which yields a
    /// buffer that can hold nothing at all. Technically correct.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            write_offset: 0,
            read_offset: 0,
        }
    }

    /// 📏 Total backing size, including the slot that is never used.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// 📥 Bytes currently readable.
    pub fn available_read(&self) -> usize {
        if self.write_offset >= self.read_offset {
            self.write_offset - self.read_offset
        } else {
            self.capacity() - self.read_offset + self.write_offset
        }
    }

    /// 📤 Bytes currently writable: capacity minus used minus the sacrificial one.
    pub fn available_write(&self) -> usize {
        self.capacity() - self.available_read() - 1
    }

    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    /// 🔓 Backing storage for the read side. Index it starting at [`read_offset`](Self::read_offset).
    pub fn storage(&self) -> &[u8] {
        &self.storage
    }

    /// 🔓 Backing storage for the write side. Index it starting at [`write_offset`](Self::write_offset).
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// ➕ Publish `n` bytes the caller already copied in at the write cursor.
    pub fn write(&mut self, n: usize) -> BridgeResult<()> {
        let max = self.available_write();
        if n > max {
            return Err(BridgeError::BufferOverflow { requested: n, max });
        }
        self.write_offset = (self.write_offset + n) % self.capacity();
        Ok(())
    }

    /// ➖ Release `n` bytes the caller already copied out from the read cursor.
    pub fn read(&mut self, n: usize) -> BridgeResult<()> {
        let max = self.available_read();
        if n > max {
            return Err(BridgeError::BufferUnderflow { requested: n, max });
        }
        self.read_offset = (self.read_offset + n) % self.capacity();
        Ok(())
    }

    /// 🧹 Drop everything. Both cursors go home.
    pub fn clear(&mut self) {
        self.write_offset = 0;
        self.read_offset = 0;
    }
}
