// SPDX-License-Identifier: MPL-2.0

use super::{FetchNode, MemoryBundle};
use crate::{phys::VmContext, prelude::*};

/// Anonymous memory, allocated lazily in physically contiguous chunks.
///
/// Every chunk slot starts out empty; the first fetch touching a chunk
/// allocates a `chunk_align`-aligned region of `chunk_size` bytes and
/// zero-fills it. Shrinking is not supported.
pub struct AllocatedMemory {
    ctx: Arc<VmContext>,
    chunk_size: usize,
    chunk_align: usize,
    chunks: Mutex<Vec<Option<Paddr>>>,
}

impl AllocatedMemory {
    pub fn new(ctx: Arc<VmContext>, length: usize) -> Arc<Self> {
        Self::with_chunks(ctx, length, PAGE_SIZE, PAGE_SIZE)
    }

    pub fn with_chunks(
        ctx: Arc<VmContext>,
        length: usize,
        chunk_size: usize,
        chunk_align: usize,
    ) -> Arc<Self> {
        assert!(chunk_size.is_power_of_two() && chunk_size >= PAGE_SIZE);
        assert!(chunk_align.is_power_of_two());
        assert_eq!(length % chunk_size, 0);
        Arc::new(Self {
            ctx,
            chunk_size,
            chunk_align,
            chunks: Mutex::new(vec![None; length / chunk_size]),
        })
    }
}

impl MemoryBundle for AllocatedMemory {
    fn length(&self) -> usize {
        self.chunks.lock().len() * self.chunk_size
    }

    fn peek_range(&self, offset: usize) -> Option<Paddr> {
        let chunks = self.chunks.lock();
        let chunk = *chunks.get(offset / self.chunk_size)?;
        chunk.map(|base| base + (offset % self.chunk_size) as Paddr)
    }

    fn fetch_range(&self, offset: usize, node: &Arc<FetchNode>) -> Result<bool> {
        let mut chunks = self.chunks.lock();
        let index = offset / self.chunk_size;
        if index >= chunks.len() {
            return_errno_with_msg!(Errno::BadAddress, "offset outside allocated memory");
        }
        let base = match chunks[index] {
            Some(base) => base,
            None => {
                let base = self
                    .ctx
                    .allocator()
                    .alloc_contiguous(self.chunk_size, self.chunk_align)?;
                self.ctx.allocator().zero(base, self.chunk_size);
                chunks[index] = Some(base);
                trace!("allocated chunk {} at {:#x}", index, base);
                base
            }
        };
        let in_off = offset % self.chunk_size;
        node.complete_sync(Ok((base + in_off as Paddr, self.chunk_size - in_off)));
        Ok(true)
    }

    fn resize(&self, new_length: usize) -> Result<()> {
        if new_length % self.chunk_size != 0 {
            return_errno_with_msg!(Errno::BadAddress, "resize length not chunk-aligned");
        }
        let mut chunks = self.chunks.lock();
        if new_length < chunks.len() * self.chunk_size {
            return_errno_with_msg!(Errno::Fault, "allocated memory cannot shrink");
        }
        chunks.resize(new_length / self.chunk_size, None);
        Ok(())
    }
}

impl Drop for AllocatedMemory {
    fn drop(&mut self) {
        let chunks = self.chunks.lock();
        for chunk in chunks.iter().flatten() {
            self.ctx.allocator().free(*chunk, self.chunk_size);
        }
    }
}
