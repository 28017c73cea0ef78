//! Size-classed buffer reuse for the I/O hot path.
//!
//! Every class keeps its own free list. Buffers come back truncated to the
//! class length, so a borrower never sees a stale length left by the
//! previous owner.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

/// Buffers kept per class before returned ones are simply dropped.
const MAX_CACHED_PER_CLASS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// Control-plane headers.
    Small,
    /// Bulk stream I/O.
    Large,
    /// UDP-style packets.
    Datagram,
}

impl SizeClass {
    pub const ALL: [SizeClass; 3] = [SizeClass::Small, SizeClass::Large, SizeClass::Datagram];

    pub const fn nominal(self) -> usize {
        match self {
            SizeClass::Small => 512,
            SizeClass::Large => 32 * 1024,
            SizeClass::Datagram => 64 * 1024,
        }
    }

    /// The smallest class able to hold `len` bytes.
    pub fn fitting(len: usize) -> Option<SizeClass> {
        Self::ALL.into_iter().find(|class| len <= class.nominal())
    }

    const fn index(self) -> usize {
        match self {
            SizeClass::Small => 0,
            SizeClass::Large => 1,
            SizeClass::Datagram => 2,
        }
    }
}

struct FreeList {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }
}

pub struct BufferPool {
    classes: [FreeList; 3],
}

static GLOBAL: BufferPool = BufferPool::new();

impl BufferPool {
    pub const fn new() -> Self {
        Self {
            classes: [FreeList::new(), FreeList::new(), FreeList::new()],
        }
    }

    /// The process-wide pool shared by all connections.
    pub fn global() -> &'static BufferPool {
        &GLOBAL
    }

    /// Borrows a buffer whose length is exactly `class.nominal()`.
    pub fn get(&self, class: SizeClass) -> Vec<u8> {
        let reused = self.classes[class.index()].buffers.lock().pop();
        reused.unwrap_or_else(|| vec![0u8; class.nominal()])
    }

    /// Returns a buffer to `class`. Buffers whose capacity fell below the
    /// class size are dropped instead of pooled; larger ones are shrunk to it.
    pub fn put(&self, class: SizeClass, mut buf: Vec<u8>) {
        let nominal = class.nominal();
        if buf.capacity() < nominal {
            return;
        }
        buf.resize(nominal, 0);
        buf.shrink_to(nominal);

        let mut free = self.classes[class.index()].buffers.lock();
        if free.len() < MAX_CACHED_PER_CLASS {
            free.push(buf);
        }
    }

    /// Borrows a buffer that goes back to the pool when dropped.
    pub fn checkout(&self, class: SizeClass) -> PooledBuffer<'_> {
        PooledBuffer {
            pool: self,
            class,
            buf: self.get(class),
        }
    }

    /// Number of idle buffers currently held for `class`.
    pub fn cached(&self, class: SizeClass) -> usize {
        self.classes[class.index()].buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A pooled buffer on loan. Derefs to the full nominal-length slice.
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    class: SizeClass,
    buf: Vec<u8>,
}

impl PooledBuffer<'_> {
    pub fn class(&self) -> SizeClass {
        self.class
    }
}

impl Deref for PooledBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(self.class, buf);
    }
}
