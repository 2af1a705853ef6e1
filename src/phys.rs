// SPDX-License-Identifier: MPL-2.0

//! Physical memory contracts.
//!
//! The physical page allocator is an external collaborator. The core only
//! ever holds opaque physical addresses; byte access goes through the
//! allocator's direct window (the kernel's linear map of physical memory).

use crate::{prelude::*, work::WorkQueue};

/// A physical address. Page-aligned when it names a whole page.
pub type Paddr = u64;

/// A virtual address inside a client address space.
pub type Vaddr = usize;

/// The architecture page size.
pub const PAGE_SIZE: usize = 4096;

/// The physical page allocator the core allocates from.
///
/// `read`/`write`/`zero` access physical memory through the direct window;
/// the core uses them for zero-filling, copy-on-write duplication, and
/// foreign-space I/O.
pub trait PhysAllocator: Send + Sync {
    /// Allocates one page. May fail with `OutOfMemory`.
    fn alloc_page(&self) -> Result<Paddr>;

    /// Allocates a physically contiguous, `align`-aligned region.
    fn alloc_contiguous(&self, size: usize, align: usize) -> Result<Paddr>;

    /// Releases a region previously returned by one of the allocators.
    fn free(&self, paddr: Paddr, size: usize);

    fn read(&self, paddr: Paddr, buf: &mut [u8]);

    fn write(&self, paddr: Paddr, buf: &[u8]);

    fn zero(&self, paddr: Paddr, len: usize);
}

/// Copies `len` bytes between physical regions through the direct window.
pub(crate) fn copy_phys(alloc: &dyn PhysAllocator, dst: Paddr, src: Paddr, len: usize) {
    let mut buf = [0u8; 512];
    let mut done = 0;
    while done < len {
        let chunk = (len - done).min(buf.len());
        alloc.read(src + done as Paddr, &mut buf[..chunk]);
        alloc.write(dst + done as Paddr, &buf[..chunk]);
        done += chunk;
    }
}

/// Process-wide services, passed explicitly into every constructor instead
/// of living behind ambient globals.
pub struct VmContext {
    allocator: Arc<dyn PhysAllocator>,
    work_queue: Arc<dyn WorkQueue>,
}

impl VmContext {
    pub fn new(allocator: Arc<dyn PhysAllocator>, work_queue: Arc<dyn WorkQueue>) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            work_queue,
        })
    }

    pub fn allocator(&self) -> &Arc<dyn PhysAllocator> {
        &self.allocator
    }

    pub fn work_queue(&self) -> &Arc<dyn WorkQueue> {
        &self.work_queue
    }
}
