// SPDX-License-Identifier: MPL-2.0

//! The machine page table contract.
//!
//! Each address space owns a `ClientPageSpace` supplied by the architecture
//! layer. PTE updates are synchronous (the page table carries its own
//! internal locking); TLB invalidation is a separate asynchronous step
//! acknowledged through a [`ShootNode`].

use crate::{prelude::*, work::Worklet};

bitflags! {
    /// Protection bits of an installed page.
    pub struct PageFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Completion record of a TLB shootdown over `[address, address + size)`.
///
/// The page-table layer calls [`ShootNode::complete`] once every CPU has
/// acknowledged the invalidation. It must do so from a posted worklet, never
/// inline from `shootdown` — the continuation retakes the space lock.
pub struct ShootNode {
    address: Vaddr,
    size: usize,
    shot: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ShootNode {
    pub fn new<F>(address: Vaddr, size: usize, shot: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new(Self {
            address,
            size,
            shot: Mutex::new(Some(Box::new(shot))),
        })
    }

    pub fn address(&self) -> Vaddr {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Delivers the completion. Second and later calls are ignored.
    pub fn complete(&self) {
        let shot = self.shot.lock().take();
        if let Some(shot) = shot {
            shot();
        }
    }

    /// Wraps the completion in a worklet for queue-based delivery.
    pub fn into_worklet(this: &Arc<Self>) -> Worklet {
        let node = this.clone();
        Worklet::new(move || node.complete())
    }
}

/// The per-space machine page table.
pub trait ClientPageSpace: Send + Sync {
    /// Installs or overwrites the translation for one page.
    fn map(&self, va: Vaddr, pa: Paddr, flags: PageFlags);

    /// Clears the translations covering `[va, va + len)`. Does not flush
    /// remote TLBs; pair with [`ClientPageSpace::shootdown`].
    fn unmap(&self, va: Vaddr, len: usize);

    /// Rewrites the protection of one installed page. Returns whether the
    /// page was present.
    fn protect(&self, va: Vaddr, flags: PageFlags) -> bool;

    fn is_mapped(&self, va: Vaddr) -> bool;

    /// Walks the page table to translate a virtual address.
    fn translate(&self, va: Vaddr) -> Option<Paddr>;

    /// Broadcasts invalidation of the node's range and completes the node
    /// once all CPUs have acknowledged.
    fn shootdown(&self, node: &Arc<ShootNode>);

    /// Switches the current CPU to this page table.
    fn activate(&self);
}
