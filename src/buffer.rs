//! Buffer pool (§4.B): a slab allocator producing co-located byte slices with shared
//! lifetime, split into an `app_buffers` queue (user-code requests) and an
//! `int_buffers` queue (internally produced buffers such as encoded substream
//! translations).
//!
//! Slab mutation is guarded by a single `parking_lot::Mutex`, matching the reactor-lock
//! model (§5.1): in production all pool access already happens under the engine's
//! reactor lock, so this inner lock is never contended, only ever a fast-path
//! acquire/release.

use crate::error::TunnelError;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Which queue a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    App,
    Int,
}

struct Slab {
    cursor: usize,
    outstanding: usize,
}

impl Slab {
    fn new() -> Self {
        Slab { cursor: 0, outstanding: 0 }
    }

    fn remaining(&self, capacity: usize) -> usize {
        capacity - self.cursor
    }
}

struct SlabTable {
    capacity: usize,
    slabs: Vec<Slab>,
    free_list: VecDeque<usize>,
    current_app: Option<usize>,
    current_int: Option<usize>,
    app_outstanding: usize,
    app_buffer_limit: usize,
    high_water_slabs: usize,
}

impl SlabTable {
    fn alloc_slab(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop_front() {
            self.slabs[idx] = Slab::new();
            idx
        } else {
            self.slabs.push(Slab::new());
            self.high_water_slabs = self.high_water_slabs.max(self.slabs.len());
            self.slabs.len() - 1
        }
    }

    fn current_for(&self, kind: BufferKind) -> Option<usize> {
        match kind {
            BufferKind::App => self.current_app,
            BufferKind::Int => self.current_int,
        }
    }

    fn set_current(&mut self, kind: BufferKind, idx: usize) {
        match kind {
            BufferKind::App => self.current_app = Some(idx),
            BufferKind::Int => self.current_int = Some(idx),
        }
    }

    fn release_if_unused(&mut self, idx: usize) {
        let is_current = self.current_app == Some(idx) || self.current_int == Some(idx);
        if self.slabs[idx].outstanding == 0 && !is_current {
            self.free_list.push_back(idx);
        }
    }
}

/// A carved buffer handle. Must be returned via [`BufferPool::release`].
pub struct PooledBuffer {
    slab_id: usize,
    kind: BufferKind,
    offset: usize,
    pub(crate) data: Vec<u8>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub slab_count: usize,
    pub high_water_slabs: usize,
    pub app_outstanding: usize,
    pub free_slabs: usize,
}

/// Slab allocator shared across tunnel instances on the same channel.
pub struct BufferPool {
    max_fragment_size: usize,
    table: Mutex<SlabTable>,
}

impl BufferPool {
    pub fn new(max_fragment_size: usize, app_buffer_limit: usize) -> Self {
        BufferPool {
            max_fragment_size,
            table: Mutex::new(SlabTable {
                capacity: max_fragment_size,
                slabs: Vec::new(),
                free_list: VecDeque::new(),
                current_app: None,
                current_int: None,
                app_outstanding: 0,
                app_buffer_limit,
                high_water_slabs: 0,
            }),
        }
    }

    pub fn max_fragment_size(&self) -> usize {
        self.max_fragment_size
    }

    pub fn get_buffer(&self, size: usize, kind: BufferKind) -> Result<PooledBuffer, TunnelError> {
        if size > self.max_fragment_size {
            return Err(TunnelError::InvalidArgument(format!(
                "requested buffer size {size} exceeds max_fragment_size {}",
                self.max_fragment_size
            )));
        }
        let mut table = self.table.lock();
        if kind == BufferKind::App && table.app_outstanding >= table.app_buffer_limit {
            return Err(TunnelError::BufferNoBuffers);
        }

        let capacity = table.capacity;
        let idx = match table.current_for(kind) {
            Some(idx) if table.slabs[idx].remaining(capacity) >= size => idx,
            _ => {
                let idx = table.alloc_slab();
                table.set_current(kind, idx);
                idx
            }
        };

        let offset = table.slabs[idx].cursor;
        table.slabs[idx].cursor += size;
        table.slabs[idx].outstanding += 1;
        if kind == BufferKind::App {
            table.app_outstanding += 1;
        }

        tracing::trace!(slab = idx, offset, size, ?kind, "buffer carved");

        Ok(PooledBuffer { slab_id: idx, kind, offset, data: vec![0u8; size] })
    }

    pub fn release(&self, buf: PooledBuffer) {
        let mut table = self.table.lock();
        let idx = buf.slab_id;
        if idx < table.slabs.len() {
            table.slabs[idx].outstanding = table.slabs[idx].outstanding.saturating_sub(1);
            if buf.kind == BufferKind::App {
                table.app_outstanding = table.app_outstanding.saturating_sub(1);
            }
            table.release_if_unused(idx);
        }
        tracing::trace!(slab = idx, "buffer released");
    }

    /// Shrinks `buf` so the slab's cursor reclaims the unused tail. Only valid when
    /// `buf` is the most recently carved buffer from its slab.
    pub fn trim_unused_length(&self, buf: &mut PooledBuffer, new_len: usize) -> Result<(), TunnelError> {
        if new_len > buf.data.len() {
            return Err(TunnelError::InvalidArgument(
                "trim_unused_length cannot grow a buffer".into(),
            ));
        }
        let mut table = self.table.lock();
        let idx = buf.slab_id;
        let slab_cursor = table.slabs[idx].cursor;
        if buf.offset + buf.data.len() == slab_cursor {
            table.slabs[idx].cursor = buf.offset + new_len;
        }
        buf.data.truncate(new_len);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let table = self.table.lock();
        PoolStats {
            slab_count: table.slabs.len(),
            high_water_slabs: table.high_water_slabs,
            app_outstanding: table.app_outstanding,
            free_slabs: table.free_list.len(),
        }
    }
}
