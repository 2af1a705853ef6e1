// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, Ordering};

use super::{AddressSpace, FaultNode};
use crate::{
    bundle::{CowBundle, FetchNode, MemoryBundle},
    page_space::PageFlags,
    prelude::*,
    view::{ExteriorBundleView, VirtualView},
};

bitflags! {
    /// Per-mapping policy: protection, fork disposition, backing demands.
    pub struct MappingFlags: u32 {
        const DROP_AT_FORK          = 0x01;
        const SHARE_AT_FORK         = 0x02;
        const COPY_ON_WRITE_AT_FORK = 0x04;

        const PROT_READ             = 0x10;
        const PROT_WRITE            = 0x20;
        const PROT_EXECUTE          = 0x40;

        const DONT_REQUIRE_BACKING  = 0x100;
    }
}

impl MappingFlags {
    pub(crate) fn page_flags(self) -> PageFlags {
        let mut flags = PageFlags::empty();
        if self.contains(MappingFlags::PROT_READ) {
            flags |= PageFlags::READ;
        }
        if self.contains(MappingFlags::PROT_WRITE) {
            flags |= PageFlags::WRITE;
        }
        if self.contains(MappingFlags::PROT_EXECUTE) {
            flags |= PageFlags::EXECUTE;
        }
        flags
    }
}

/// State every mapping variant shares.
///
/// The owner link is weak: the address space outlives its mappings by
/// construction, and the strong edges run space -> mapping -> bundle.
pub(crate) struct MappingCommon {
    owner: Weak<AddressSpace>,
    address: Vaddr,
    length: usize,
    flags: MappingFlags,
    /// Set once the mapping leaves service; late fetch completions check it
    /// before touching the page table.
    retired: AtomicBool,
}

impl MappingCommon {
    fn new(owner: Weak<AddressSpace>, address: Vaddr, length: usize, flags: MappingFlags) -> Self {
        Self {
            owner,
            address,
            length,
            flags,
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) fn address(&self) -> Vaddr {
        self.address
    }

    pub(crate) fn length(&self) -> usize {
        self.length
    }

    pub(crate) fn flags(&self) -> MappingFlags {
        self.flags
    }

    pub(crate) fn owner(&self) -> Option<Arc<AddressSpace>> {
        self.owner.upgrade()
    }

    /// Returns whether this call performed the retirement.
    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// Result of duplicating one mapping into a forked space.
pub(crate) struct CowForkPair {
    /// Replaces the source mapping when the fork bumps it to CoW.
    pub(crate) replace_source: Option<Arc<dyn Mapping>>,
    pub(crate) dest_mapping: Arc<dyn Mapping>,
}

/// An installed region of an address space.
pub(crate) trait Mapping: Send + Sync {
    fn common(&self) -> &Arc<MappingCommon>;

    /// Resolves a mapping-relative range to backing memory.
    fn resolve_range(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<(Arc<dyn MemoryBundle>, usize, usize)>;

    /// Clones this mapping into `dest` with shared semantics.
    fn share(&self, dest: &Arc<AddressSpace>) -> Arc<dyn Mapping>;

    /// Duplicates this mapping into `dest` with copy-on-write semantics.
    fn fork_cow(&self, dest: &Arc<AddressSpace>) -> Result<CowForkPair>;

    /// Puts the mapping in service. Page tables stay untouched; pages
    /// arrive through faults.
    fn install(&self, overwrite: bool) {
        let c = self.common();
        trace!(
            "install mapping {:#x}..{:#x} overwrite={}",
            c.address(),
            c.address() + c.length(),
            overwrite
        );
    }

    /// Takes the mapping out of service; with `clear`, tears down every
    /// present PTE. TLB invalidation is the caller's responsibility.
    fn uninstall(&self, clear: bool) {
        let c = self.common();
        c.retire();
        if !clear {
            return;
        }
        let Some(space) = c.owner() else {
            return;
        };
        let page_space = space.page_space();
        let mut va = c.address();
        while va < c.address() + c.length() {
            if page_space.is_mapped(va) {
                page_space.unmap(va, PAGE_SIZE);
            }
            va += PAGE_SIZE;
        }
    }

    /// Resolves the faulting page, fetches it and installs the PTE.
    ///
    /// Returns `Ok(true)` when the fault resolved synchronously; otherwise
    /// the node completes through the work queue. A mapping retired while
    /// the fetch was in flight resolves the fault without touching the page
    /// table.
    fn handle_fault(&self, node: &Arc<FaultNode>) -> Result<bool> {
        let common = self.common().clone();
        let Some(space) = common.owner() else {
            return_errno_with_msg!(Errno::Fault, "fault on an orphaned mapping");
        };
        let page_space = space.page_space().clone();
        let queue = space.ctx().work_queue().clone();

        let va = node.address().align_down(PAGE_SIZE);
        let offset = va - common.address();
        let (bundle, bundle_off, _usable) = self.resolve_range(offset, PAGE_SIZE)?;
        let prot = common.flags().page_flags();

        let chained_common = common.clone();
        let chained_ps = page_space.clone();
        let chained_queue = queue.clone();
        let fault = node.clone();
        let fetch = FetchNode::new(move |f| match f.result() {
            Ok((phys, _run)) => {
                if !chained_common.is_retired() {
                    chained_ps.map(va, phys, prot);
                }
                FaultNode::complete_post(&fault, &chained_queue, true, None);
            }
            Err(e) => FaultNode::complete_post(&fault, &chained_queue, false, Some(e)),
        });

        if bundle.fetch_range(bundle_off, &fetch)? {
            let (phys, _run) = fetch.result()?;
            if !common.is_retired() {
                page_space.map(va, phys, prot);
            }
            node.complete_sync(true, None);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// A mapping that reads straight through a view.
pub(crate) struct NormalMapping {
    common: Arc<MappingCommon>,
    view: Arc<dyn VirtualView>,
    offset: usize,
}

impl NormalMapping {
    pub(crate) fn create(
        owner: Weak<AddressSpace>,
        address: Vaddr,
        length: usize,
        flags: MappingFlags,
        view: Arc<dyn VirtualView>,
        offset: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            common: Arc::new(MappingCommon::new(owner, address, length, flags)),
            view,
            offset,
        })
    }
}

impl Mapping for NormalMapping {
    fn common(&self) -> &Arc<MappingCommon> {
        &self.common
    }

    fn resolve_range(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<(Arc<dyn MemoryBundle>, usize, usize)> {
        self.view.resolve_range(self.offset + offset, size)
    }

    fn share(&self, dest: &Arc<AddressSpace>) -> Arc<dyn Mapping> {
        NormalMapping::create(
            Arc::downgrade(dest),
            self.common.address(),
            self.common.length(),
            self.common.flags(),
            self.view.clone(),
            self.offset,
        )
    }

    /// Bumps both sides to copy-on-write: each space gets a private overlay
    /// over the shared view, so the next write on either side copies.
    fn fork_cow(&self, dest: &Arc<AddressSpace>) -> Result<CowForkPair> {
        let Some(src) = self.common.owner() else {
            return_errno_with_msg!(Errno::Fault, "fork of an orphaned mapping");
        };
        let (address, length, flags) = (
            self.common.address(),
            self.common.length(),
            self.common.flags(),
        );

        let overlay = |space: &Arc<AddressSpace>| -> Arc<dyn Mapping> {
            let bundle =
                CowBundle::new_root(space.ctx().clone(), self.view.clone(), self.offset, length);
            let view = ExteriorBundleView::new(bundle, 0, length);
            NormalMapping::create(Arc::downgrade(space), address, length, flags, view, 0)
        };
        Ok(CowForkPair {
            replace_source: Some(overlay(&src)),
            dest_mapping: overlay(dest),
        })
    }
}

/// A mapping over a copy-on-write chain. Faulted pages are mapped with the
/// mapping's full protection; the first touch copies, later writes do not
/// trap again.
pub(crate) struct CowMapping {
    common: Arc<MappingCommon>,
    bundle: Arc<CowBundle>,
}

impl CowMapping {
    pub(crate) fn create(
        owner: Weak<AddressSpace>,
        address: Vaddr,
        length: usize,
        flags: MappingFlags,
        bundle: Arc<CowBundle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            common: Arc::new(MappingCommon::new(owner, address, length, flags)),
            bundle,
        })
    }
}

impl Mapping for CowMapping {
    fn common(&self) -> &Arc<MappingCommon> {
        &self.common
    }

    fn resolve_range(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<(Arc<dyn MemoryBundle>, usize, usize)> {
        if offset >= self.common.length() {
            return_errno_with_msg!(Errno::BadAddress, "offset outside mapping");
        }
        let usable = size.min(self.common.length() - offset);
        let bundle: Arc<dyn MemoryBundle> = self.bundle.clone();
        Ok((bundle, offset, usable))
    }

    /// Sharing a CoW mapping promotes it: both spaces write through the
    /// same chain.
    fn share(&self, dest: &Arc<AddressSpace>) -> Arc<dyn Mapping> {
        CowMapping::create(
            Arc::downgrade(dest),
            self.common.address(),
            self.common.length(),
            self.common.flags(),
            self.bundle.clone(),
        )
    }

    /// Only the destination is wrapped; this mapping keeps its chain.
    fn fork_cow(&self, dest: &Arc<AddressSpace>) -> Result<CowForkPair> {
        let length = self.common.length();
        let child = CowBundle::new_chained(dest.ctx().clone(), self.bundle.clone(), 0, length);
        let dest_mapping = CowMapping::create(
            Arc::downgrade(dest),
            self.common.address(),
            length,
            self.common.flags(),
            child,
        );
        Ok(CowForkPair {
            replace_source: None,
            dest_mapping,
        })
    }
}
