// SPDX-License-Identifier: MPL-2.0

//! Address spaces.
//!
//! An address space owns two trees that partition the user range exactly:
//! holes (unused intervals, in an augmented red-black tree for best-fit
//! allocation) and mappings (installed regions, keyed by base address). It
//! also owns the machine page table and a futex table. Structural
//! operations serialize on the space lock; faults take it only to look up
//! the mapping and run their fetches outside it.

mod accessor;
mod futex;
mod hole_tree;
mod mapping;

pub use self::{
    accessor::{AcquireNode, ForeignSpaceAccessor},
    futex::{FutexNode, FutexSpace},
    mapping::MappingFlags,
};

use self::{
    hole_tree::HoleTree,
    mapping::{CowMapping, Mapping, NormalMapping},
};
use crate::{
    bundle::CowBundle,
    page_space::{ClientPageSpace, PageFlags, ShootNode},
    phys::VmContext,
    prelude::*,
    view::VirtualView,
    work::{WorkQueue, Worklet},
};

bitflags! {
    /// Options of [`AddressSpace::map`].
    pub struct MapFlags: u32 {
        const FIXED                 = 0x01;
        const PREFER_BOTTOM         = 0x02;
        const PREFER_TOP            = 0x04;
        const PROT_READ             = 0x08;
        const PROT_WRITE            = 0x10;
        const PROT_EXECUTE          = 0x20;
        const DROP_AT_FORK          = 0x40;
        const SHARE_AT_FORK         = 0x80;
        const COPY_ON_WRITE_AT_FORK = 0x100;
        /// Run the fault handler over the whole range after installing.
        const POPULATE              = 0x200;
        const DONT_REQUIRE_BACKING  = 0x400;
        /// Map through a fresh copy-on-write overlay from the start.
        const COPY_ON_WRITE         = 0x800;
    }
}

bitflags! {
    /// What the faulting access attempted.
    pub struct FaultFlags: u32 {
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl MapFlags {
    fn mapping_flags(self) -> MappingFlags {
        let mut flags = MappingFlags::empty();
        if self.contains(MapFlags::PROT_READ) {
            flags |= MappingFlags::PROT_READ;
        }
        if self.contains(MapFlags::PROT_WRITE) {
            flags |= MappingFlags::PROT_WRITE;
        }
        if self.contains(MapFlags::PROT_EXECUTE) {
            flags |= MappingFlags::PROT_EXECUTE;
        }
        if self.contains(MapFlags::DROP_AT_FORK) {
            flags |= MappingFlags::DROP_AT_FORK;
        }
        if self.contains(MapFlags::SHARE_AT_FORK) {
            flags |= MappingFlags::SHARE_AT_FORK;
        }
        if self.contains(MapFlags::COPY_ON_WRITE_AT_FORK) {
            flags |= MappingFlags::COPY_ON_WRITE_AT_FORK;
        }
        if self.contains(MapFlags::DONT_REQUIRE_BACKING) {
            flags |= MappingFlags::DONT_REQUIRE_BACKING;
        }
        flags
    }
}

/// Completion record of one page fault.
pub struct FaultNode {
    address: Vaddr,
    flags: FaultFlags,
    inner: Mutex<FaultInner>,
}

struct FaultInner {
    resolved: bool,
    error: Option<Error>,
    handled: Option<Box<dyn FnOnce(&FaultNode) + Send>>,
}

impl FaultNode {
    pub fn new<F>(address: Vaddr, flags: FaultFlags, handled: F) -> Arc<Self>
    where
        F: FnOnce(&FaultNode) + Send + 'static,
    {
        Arc::new(Self {
            address,
            flags,
            inner: Mutex::new(FaultInner {
                resolved: false,
                error: None,
                handled: Some(Box::new(handled)),
            }),
        })
    }

    pub fn address(&self) -> Vaddr {
        self.address
    }

    pub fn flags(&self) -> FaultFlags {
        self.flags
    }

    pub fn resolved(&self) -> bool {
        self.inner.lock().resolved
    }

    pub fn error(&self) -> Option<Error> {
        self.inner.lock().error
    }

    pub(crate) fn complete_sync(&self, resolved: bool, error: Option<Error>) {
        let mut inner = self.inner.lock();
        inner.resolved = resolved;
        inner.error = error;
    }

    pub(crate) fn complete_post(
        this: &Arc<Self>,
        queue: &Arc<dyn WorkQueue>,
        resolved: bool,
        error: Option<Error>,
    ) {
        let handled = {
            let mut inner = this.inner.lock();
            inner.resolved = resolved;
            inner.error = error;
            inner.handled.take()
        };
        if let Some(handled) = handled {
            let node = this.clone();
            queue.post(Worklet::new(move || handled(&node)));
        }
    }
}

/// Completion record of an `unmap` or `teardown`; posted only after the
/// TLB shootdown acknowledged and the region returned to the hole tree.
pub struct UnmapNode {
    inner: Mutex<UnmapInner>,
}

struct UnmapInner {
    complete: bool,
    unmapped: Option<Box<dyn FnOnce(&UnmapNode) + Send>>,
}

impl UnmapNode {
    pub fn new<F>(unmapped: F) -> Arc<Self>
    where
        F: FnOnce(&UnmapNode) + Send + 'static,
    {
        Arc::new(Self {
            inner: Mutex::new(UnmapInner {
                complete: false,
                unmapped: Some(Box::new(unmapped)),
            }),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    fn complete_post(this: &Arc<Self>, queue: &Arc<dyn WorkQueue>) {
        let unmapped = {
            let mut inner = this.inner.lock();
            inner.complete = true;
            inner.unmapped.take()
        };
        if let Some(unmapped) = unmapped {
            let node = this.clone();
            queue.post(Worklet::new(move || unmapped(&node)));
        }
    }
}

/// Completion record of a fork.
pub struct ForkNode {
    inner: Mutex<ForkInner>,
}

struct ForkInner {
    forked: Option<Arc<AddressSpace>>,
    done: Option<Box<dyn FnOnce(&ForkNode) + Send>>,
}

impl ForkNode {
    pub fn new<F>(done: F) -> Arc<Self>
    where
        F: FnOnce(&ForkNode) + Send + 'static,
    {
        Arc::new(Self {
            inner: Mutex::new(ForkInner {
                forked: None,
                done: Some(Box::new(done)),
            }),
        })
    }

    /// The forked space. Valid once the fork completed.
    pub fn forked_space(&self) -> Option<Arc<AddressSpace>> {
        self.inner.lock().forked.clone()
    }

    fn set_forked(&self, space: Arc<AddressSpace>) {
        self.inner.lock().forked = Some(space);
    }

    fn complete_post(this: &Arc<Self>, queue: &Arc<dyn WorkQueue>) {
        let done = this.inner.lock().done.take();
        if let Some(done) = done {
            let node = this.clone();
            queue.post(Worklet::new(move || done(&node)));
        }
    }
}

struct SpaceInner {
    holes: HoleTree,
    mappings: BTreeMap<Vaddr, Arc<dyn Mapping>>,
}

/// Foreign accessors attached to a space, and any teardown parked on them.
struct AccessorGate {
    count: usize,
    pending_teardowns: Vec<Arc<UnmapNode>>,
}

/// A per-process virtual address space.
pub struct AddressSpace {
    this: Weak<AddressSpace>,
    ctx: Arc<VmContext>,
    page_space: Arc<dyn ClientPageSpace>,
    user_range: Range<Vaddr>,
    inner: Mutex<SpaceInner>,
    accessors: Mutex<AccessorGate>,
    futex: FutexSpace,
}

impl AddressSpace {
    /// Creates an empty space: one maximal hole spanning the user range.
    pub fn new(
        ctx: Arc<VmContext>,
        page_space: Arc<dyn ClientPageSpace>,
        user_range: Range<Vaddr>,
    ) -> Arc<Self> {
        assert_eq!(user_range.start % PAGE_SIZE, 0);
        assert_eq!(user_range.end % PAGE_SIZE, 0);
        assert!(user_range.start < user_range.end);
        let mut holes = HoleTree::new();
        holes.insert(user_range.start, user_range.end - user_range.start);
        let futex = FutexSpace::new(ctx.clone());
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ctx,
            page_space,
            user_range,
            inner: Mutex::new(SpaceInner {
                holes,
                mappings: BTreeMap::new(),
            }),
            accessors: Mutex::new(AccessorGate {
                count: 0,
                pending_teardowns: Vec::new(),
            }),
            futex,
        })
    }

    fn arc(&self) -> Arc<AddressSpace> {
        self.this.upgrade().unwrap()
    }

    pub fn user_range(&self) -> Range<Vaddr> {
        self.user_range.clone()
    }

    pub fn futex(&self) -> &FutexSpace {
        &self.futex
    }

    pub fn page_space(&self) -> &Arc<dyn ClientPageSpace> {
        &self.page_space
    }

    pub(crate) fn ctx(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    pub(crate) fn accessor_attached(&self) {
        self.accessors.lock().count += 1;
    }

    /// Drops one accessor reference. The last release performs any teardown
    /// that parked while accessors were outstanding.
    pub(crate) fn accessor_released(&self) {
        let pending = {
            let mut gate = self.accessors.lock();
            gate.count -= 1;
            if gate.count == 0 {
                core::mem::take(&mut gate.pending_teardowns)
            } else {
                Vec::new()
            }
        };
        for node in pending {
            self.teardown_now(&node);
        }
    }

    /// Switches the CPU to this space's page table.
    pub fn activate(&self) {
        self.page_space.activate();
    }

    fn lookup_mapping(inner: &SpaceInner, address: Vaddr) -> Option<Arc<dyn Mapping>> {
        let (_, mapping) = inner.mappings.range(..=address).next_back()?;
        let common = mapping.common();
        if address < common.address() + common.length() {
            Some(mapping.clone())
        } else {
            None
        }
    }

    /// Installs a view into this space and returns the chosen address.
    ///
    /// Placement is fixed (`FIXED` + `address_hint`) or best-fit from the
    /// preferred end of the space. Exactly one fork disposition must be
    /// given. With `COPY_ON_WRITE` the mapping starts out as a private
    /// overlay over the view.
    pub fn map(
        &self,
        view: Arc<dyn VirtualView>,
        address_hint: Vaddr,
        offset: usize,
        length: usize,
        flags: MapFlags,
    ) -> Result<Vaddr> {
        if length == 0 || length % PAGE_SIZE != 0 || offset % PAGE_SIZE != 0 {
            return_errno_with_msg!(Errno::BadAddress, "unaligned mapping request");
        }
        let fork_bits = flags
            & (MapFlags::DROP_AT_FORK | MapFlags::SHARE_AT_FORK | MapFlags::COPY_ON_WRITE_AT_FORK);
        if fork_bits.bits().count_ones() != 1 {
            return_errno_with_msg!(Errno::BadAddress, "exactly one fork disposition required");
        }

        let mapping: Arc<dyn Mapping>;
        let address;
        {
            let mut inner = self.inner.lock();
            address = if flags.contains(MapFlags::FIXED) {
                if address_hint % PAGE_SIZE != 0 {
                    return_errno_with_msg!(Errno::BadAddress, "unaligned fixed address");
                }
                if !inner.holes.allocate_fixed(address_hint, length) {
                    return_errno_with_msg!(Errno::BadAddress, "fixed range is not free");
                }
                address_hint
            } else {
                let prefer_top = flags.contains(MapFlags::PREFER_TOP);
                match inner.holes.allocate(length, prefer_top) {
                    Some(address) => address,
                    None => {
                        return_errno_with_msg!(Errno::OutOfMemory, "no hole fits the mapping")
                    }
                }
            };

            let owner = self.this.clone();
            mapping = if flags.contains(MapFlags::COPY_ON_WRITE) {
                let bundle = CowBundle::new_root(self.ctx.clone(), view, offset, length);
                CowMapping::create(owner, address, length, flags.mapping_flags(), bundle)
            } else {
                NormalMapping::create(
                    owner,
                    address,
                    length,
                    flags.mapping_flags(),
                    view,
                    offset,
                )
            };
            inner.mappings.insert(address, mapping.clone());
        }

        debug!(
            "map {:#x}..{:#x} flags {:?}",
            address,
            address + length,
            flags
        );
        mapping.install(flags.contains(MapFlags::FIXED));

        if flags.contains(MapFlags::POPULATE) {
            let mut va = address;
            while va < address + length {
                let node = FaultNode::new(va, FaultFlags::empty(), |_| {});
                self.handle_fault(&node);
                va += PAGE_SIZE;
            }
        }
        Ok(address)
    }

    /// Removes the mapping exactly covering `[address, address + length)`.
    ///
    /// Partial unmap is rejected with `BadAddress`. The region rejoins the
    /// hole tree and the node completes only after the TLB shootdown
    /// acknowledged, so the address cannot be reused while stale
    /// translations may exist.
    pub fn unmap(
        &self,
        address: Vaddr,
        length: usize,
        node: &Arc<UnmapNode>,
    ) -> Result<()> {
        let mapping = {
            let inner = self.inner.lock();
            inner.mappings.get(&address).cloned()
        };
        let Some(mapping) = mapping else {
            return_errno_with_msg!(Errno::BadAddress, "no mapping starts at this address");
        };
        if mapping.common().length() != length {
            return_errno_with_msg!(Errno::BadAddress, "unmap must cover a whole mapping");
        }
        if !mapping.common().retire() {
            return_errno_with_msg!(Errno::BadAddress, "mapping is already going away");
        }
        mapping.uninstall(true);
        debug!("unmap {:#x}..{:#x}", address, address + length);

        let space = self.arc();
        let unmap_node = node.clone();
        let shoot = ShootNode::new(address, length, move || {
            {
                let mut inner = space.inner.lock();
                inner.mappings.remove(&address);
                inner.holes.free_range(address, length);
            }
            debug_assert!(space.check_partition());
            UnmapNode::complete_post(&unmap_node, space.ctx.work_queue());
        });
        self.page_space.shootdown(&shoot);
        Ok(())
    }

    /// Resolves one page fault, described by the node.
    ///
    /// Returns `true` if the fault resolved (or failed) synchronously;
    /// otherwise the node completes through the work queue. Faults that no
    /// mapping covers or that the mapping's protection forbids complete
    /// unresolved rather than failing the call.
    pub fn handle_fault(&self, node: &Arc<FaultNode>) -> bool {
        let address = node.address();
        trace!("fault at {:#x} flags {:?}", address, node.flags());
        if !self.user_range.contains(&address) {
            node.complete_sync(
                false,
                Some(Error::with_msg(Errno::BadAddress, "fault outside user range")),
            );
            return true;
        }
        let mapping = {
            let inner = self.inner.lock();
            Self::lookup_mapping(&inner, address)
        };
        let Some(mapping) = mapping.filter(|m| !m.common().is_retired()) else {
            node.complete_sync(
                false,
                Some(Error::with_msg(Errno::BadAddress, "no mapping covers fault")),
            );
            return true;
        };

        let prot = mapping.common().flags();
        if node.flags().contains(FaultFlags::WRITE) && !prot.contains(MappingFlags::PROT_WRITE) {
            node.complete_sync(
                false,
                Some(Error::with_msg(Errno::AccessDenied, "write to read-only mapping")),
            );
            return true;
        }
        if node.flags().contains(FaultFlags::EXECUTE) && !prot.contains(MappingFlags::PROT_EXECUTE)
        {
            node.complete_sync(
                false,
                Some(Error::with_msg(Errno::AccessDenied, "execute of non-executable mapping")),
            );
            return true;
        }

        match mapping.handle_fault(node) {
            Ok(sync) => sync,
            Err(e) => {
                node.complete_sync(false, Some(e));
                true
            }
        }
    }

    /// Duplicates this space according to each mapping's fork disposition.
    ///
    /// Every page currently present in a mapping that turned copy-on-write
    /// is downgraded to read-only on both sides; the node completes once
    /// the matching shootdowns acknowledged. Returns `Ok(true)` when no
    /// downgrades were needed and the fork finished synchronously.
    pub fn fork(
        &self,
        child_page_space: Arc<dyn ClientPageSpace>,
        node: &Arc<ForkNode>,
    ) -> Result<bool> {
        let child = AddressSpace::new(
            self.ctx.clone(),
            child_page_space,
            self.user_range.clone(),
        );

        let mut cow_ranges: Vec<(Vaddr, usize)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut child_inner = child.inner.lock();
            let mut replacements: Vec<(Vaddr, Arc<dyn Mapping>)> = Vec::new();

            for (&address, mapping) in inner.mappings.iter() {
                let flags = mapping.common().flags();
                let length = mapping.common().length();
                if flags.contains(MappingFlags::DROP_AT_FORK) {
                    continue;
                }
                let carved = child_inner.holes.allocate_fixed(address, length);
                debug_assert!(carved);
                if flags.contains(MappingFlags::SHARE_AT_FORK) {
                    child_inner.mappings.insert(address, mapping.share(&child));
                } else {
                    let pair = mapping.fork_cow(&child)?;
                    child_inner.mappings.insert(address, pair.dest_mapping);
                    if let Some(replacement) = pair.replace_source {
                        replacements.push((address, replacement));
                    }
                    cow_ranges.push((address, length));
                }
            }

            for (address, replacement) in replacements {
                if let Some(old) = inner.mappings.insert(address, replacement) {
                    old.common().retire();
                }
            }

            // Freeze present pages: read-only on both sides, same frame.
            for &(address, length) in &cow_ranges {
                let mapping = Self::lookup_mapping(&inner, address).unwrap();
                let frozen = mapping.common().flags().page_flags() - PageFlags::WRITE;
                let mut va = address;
                while va < address + length {
                    if let Some(phys) = self.page_space.translate(va) {
                        self.page_space.protect(va, frozen);
                        child.page_space.map(va, phys, frozen);
                    }
                    va += PAGE_SIZE;
                }
            }
        }

        debug!(
            "fork: {} copy-on-write ranges to invalidate",
            cow_ranges.len()
        );
        node.set_forked(child);
        if cow_ranges.is_empty() {
            return Ok(true);
        }
        Self::continue_fork(self.arc(), node.clone(), Arc::new(cow_ranges), 0);
        Ok(false)
    }

    fn continue_fork(
        space: Arc<AddressSpace>,
        node: Arc<ForkNode>,
        ranges: Arc<Vec<(Vaddr, usize)>>,
        index: usize,
    ) {
        if index == ranges.len() {
            ForkNode::complete_post(&node, space.ctx.work_queue());
            return;
        }
        let (address, length) = ranges[index];
        let chained = space.clone();
        let shoot = ShootNode::new(address, length, move || {
            Self::continue_fork(chained, node, ranges, index + 1)
        });
        space.page_space.shootdown(&shoot);
    }

    /// Uninstalls every mapping ahead of dropping the space.
    ///
    /// A teardown requested while foreign accessors are outstanding parks
    /// until the last accessor is released; the node completes only then,
    /// once the final shootdown acknowledged. In-flight nodes drain through
    /// their usual completion paths. Callers must not attach new accessors
    /// to a space they are tearing down.
    pub fn teardown(&self, node: &Arc<UnmapNode>) {
        {
            let mut gate = self.accessors.lock();
            if gate.count > 0 {
                debug!("teardown parked behind {} accessors", gate.count);
                gate.pending_teardowns.push(node.clone());
                return;
            }
        }
        self.teardown_now(node);
    }

    fn teardown_now(&self, node: &Arc<UnmapNode>) {
        let mappings: Vec<Arc<dyn Mapping>> = {
            let inner = self.inner.lock();
            inner.mappings.values().cloned().collect()
        };
        for mapping in &mappings {
            if mapping.common().retire() {
                mapping.uninstall(true);
            }
        }
        let space = self.arc();
        let unmap_node = node.clone();
        let (start, size) = (self.user_range.start, self.user_range.len());
        let shoot = ShootNode::new(start, size, move || {
            {
                let mut inner = space.inner.lock();
                inner.mappings.clear();
                inner.holes = HoleTree::new();
                inner.holes.insert(start, size);
            }
            UnmapNode::complete_post(&unmap_node, space.ctx.work_queue());
        });
        self.page_space.shootdown(&shoot);
    }

    /// Holes and mappings must tile the user range exactly.
    pub(crate) fn check_partition(&self) -> bool {
        let inner = self.inner.lock();
        let mut intervals: Vec<(Vaddr, usize)> = Vec::new();
        inner.holes.for_each(|address, length| intervals.push((address, length)));
        for (&address, mapping) in inner.mappings.iter() {
            intervals.push((address, mapping.common().length()));
        }
        intervals.sort_unstable();
        let mut cursor = self.user_range.start;
        for (address, length) in intervals {
            if address != cursor {
                return false;
            }
            cursor = address + length;
        }
        cursor == self.user_range.end && inner.holes.check_invariant()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bundle::{
            AllocatedMemory, BackingMemory, FrontalMemory, ManageNode, ManagedSpace, MemoryBundle,
        },
        test_util::{test_ctx, TestPageSpace, TestPhys},
        view::ExteriorBundleView,
    };

    const USER_RANGE: Range<Vaddr> = 0x1000..0x10000;

    fn anon_view(ctx: &Arc<VmContext>, length: usize) -> Arc<ExteriorBundleView> {
        ExteriorBundleView::new(AllocatedMemory::new(ctx.clone(), length), 0, length)
    }

    fn rw_flags() -> MapFlags {
        MapFlags::PROT_READ | MapFlags::PROT_WRITE | MapFlags::SHARE_AT_FORK
    }

    fn fault_sync(space: &Arc<AddressSpace>, address: Vaddr, flags: FaultFlags) -> Arc<FaultNode> {
        let node = FaultNode::new(address, flags, |_| {});
        assert!(space.handle_fault(&node));
        node
    }

    fn write_user(phys: &Arc<TestPhys>, page_space: &Arc<TestPageSpace>, va: Vaddr, bytes: &[u8]) {
        let pa = page_space.translate(va).unwrap();
        phys.write(pa, bytes);
    }

    fn read_user(phys: &Arc<TestPhys>, page_space: &Arc<TestPageSpace>, va: Vaddr) -> u8 {
        let mut byte = [0u8; 1];
        phys.read(page_space.translate(va).unwrap(), &mut byte);
        byte[0]
    }

    #[test]
    fn test_best_fit_picks_lowest_fitting_hole() {
        let (ctx, _phys, _queue) = test_ctx();
        let page_space = TestPageSpace::new(crate::test_util::ManualQueue::new());
        let space = AddressSpace::new(ctx.clone(), page_space, USER_RANGE);

        let view = anon_view(&ctx, 0x2000);
        space
            .map(view.clone(), 0x2000, 0, 0x1000, rw_flags() | MapFlags::FIXED)
            .unwrap();
        space
            .map(view.clone(), 0x5000, 0, 0x1000, rw_flags() | MapFlags::FIXED)
            .unwrap();

        let address = space.map(view, 0, 0, 0x2000, rw_flags()).unwrap();
        assert_eq!(address, 0x3000);
        assert!(space.check_partition());
    }

    #[test]
    fn test_fixed_conflicts_and_alignment() {
        let (ctx, _phys, queue) = test_ctx();
        let page_space = TestPageSpace::new(queue.clone());
        let space = AddressSpace::new(ctx.clone(), page_space, USER_RANGE);
        let view = anon_view(&ctx, 0x4000);

        space
            .map(view.clone(), 0x2000, 0, 0x2000, rw_flags() | MapFlags::FIXED)
            .unwrap();
        let overlapping = space
            .map(view.clone(), 0x3000, 0, 0x1000, rw_flags() | MapFlags::FIXED)
            .unwrap_err();
        assert_eq!(overlapping.errno(), Errno::BadAddress);

        let unaligned = space
            .map(view.clone(), 0, 0, 0x1234, rw_flags())
            .unwrap_err();
        assert_eq!(unaligned.errno(), Errno::BadAddress);

        let no_disposition = space
            .map(view, 0, 0, 0x1000, MapFlags::PROT_READ)
            .unwrap_err();
        assert_eq!(no_disposition.errno(), Errno::BadAddress);
    }

    #[test]
    fn test_exhaustion_fails_with_out_of_memory() {
        let (ctx, _phys, queue) = test_ctx();
        let page_space = TestPageSpace::new(queue);
        let space = AddressSpace::new(ctx.clone(), page_space, 0x1000..0x4000);
        let view = anon_view(&ctx, 0x4000);

        space.map(view.clone(), 0, 0, 0x2000, rw_flags()).unwrap();
        let err = space.map(view, 0, 0, 0x2000, rw_flags()).unwrap_err();
        assert_eq!(err.errno(), Errno::OutOfMemory);
    }

    #[test]
    fn test_fault_installs_pte_and_populate() {
        let (ctx, _phys, queue) = test_ctx();
        let page_space = TestPageSpace::new(queue.clone());
        let space = AddressSpace::new(ctx.clone(), page_space.clone(), USER_RANGE);
        let view = anon_view(&ctx, 0x2000);

        let address = space.map(view.clone(), 0, 0, 0x2000, rw_flags()).unwrap();
        assert!(!page_space.is_mapped(address));

        let node = fault_sync(&space, address + 0x1004, FaultFlags::WRITE);
        assert!(node.resolved());
        assert!(page_space.is_mapped(address + 0x1000));
        let (_, flags) = page_space.entry(address + 0x1000).unwrap();
        assert_eq!(flags, PageFlags::READ | PageFlags::WRITE);

        let populated = space
            .map(view, 0, 0, 0x2000, rw_flags() | MapFlags::POPULATE)
            .unwrap();
        assert!(page_space.is_mapped(populated));
        assert!(page_space.is_mapped(populated + 0x1000));
    }

    #[test]
    fn test_denied_faults_complete_unresolved() {
        let (ctx, _phys, queue) = test_ctx();
        let page_space = TestPageSpace::new(queue);
        let space = AddressSpace::new(ctx.clone(), page_space, USER_RANGE);
        let view = anon_view(&ctx, 0x1000);

        let address = space
            .map(
                view,
                0,
                0,
                0x1000,
                MapFlags::PROT_READ | MapFlags::SHARE_AT_FORK,
            )
            .unwrap();

        let write = fault_sync(&space, address, FaultFlags::WRITE);
        assert!(!write.resolved());
        assert_eq!(write.error().unwrap().errno(), Errno::AccessDenied);

        let stray = fault_sync(&space, 0x8000, FaultFlags::empty());
        assert!(!stray.resolved());
        assert_eq!(stray.error().unwrap().errno(), Errno::BadAddress);
    }

    #[test]
    fn test_fault_out_of_memory_is_unresolved() {
        let (ctx, phys, queue) = test_ctx();
        let page_space = TestPageSpace::new(queue);
        let space = AddressSpace::new(ctx.clone(), page_space, USER_RANGE);
        let view = anon_view(&ctx, 0x1000);
        let address = space.map(view, 0, 0, 0x1000, rw_flags()).unwrap();

        phys.set_limit(0);
        let node = fault_sync(&space, address, FaultFlags::empty());
        assert!(!node.resolved());
        assert_eq!(node.error().unwrap().errno(), Errno::OutOfMemory);
    }

    #[test]
    fn test_unmap_returns_region_after_shootdown() {
        let (ctx, _phys, queue) = test_ctx();
        let page_space = TestPageSpace::new(queue.clone());
        let space = AddressSpace::new(ctx.clone(), page_space.clone(), USER_RANGE);
        let view = anon_view(&ctx, 0x2000);

        let address = space
            .map(view, 0, 0, 0x2000, rw_flags() | MapFlags::POPULATE)
            .unwrap();
        assert!(page_space.is_mapped(address));

        let node = UnmapNode::new(|_| {});
        space.unmap(address, 0x2000, &node).unwrap();
        assert!(!page_space.is_mapped(address));
        // Until the shootdown acks, the mapping stays in the tree and the
        // region cannot be reused; the partition invariant never breaks.
        assert!(!node.is_complete());
        assert!(space.check_partition());
        let blocked = space
            .map(anon_view(&ctx, 0x1000), address, 0, 0x1000, rw_flags() | MapFlags::FIXED)
            .unwrap_err();
        assert_eq!(blocked.errno(), Errno::BadAddress);

        queue.drain();
        assert!(node.is_complete());
        assert!(space.check_partition());
        space
            .map(anon_view(&ctx, 0x1000), address, 0, 0x1000, rw_flags() | MapFlags::FIXED)
            .unwrap();

        // Unmap must cover exactly one whole mapping.
        let partial = UnmapNode::new(|_| {});
        let err = space.unmap(address, 0x2000, &partial).unwrap_err();
        assert_eq!(err.errno(), Errno::BadAddress);
    }

    #[test]
    fn test_pager_backed_fault_completes_after_load() {
        let (ctx, phys, queue) = test_ctx();
        let page_space = TestPageSpace::new(queue.clone());
        let space = AddressSpace::new(ctx.clone(), page_space.clone(), USER_RANGE);

        let managed = ManagedSpace::new(ctx.clone(), 0x1000);
        let backing = BackingMemory::new(managed.clone());
        let frontal = FrontalMemory::new(managed);
        let view = ExteriorBundleView::new(frontal, 0, 0x1000);
        let address = space.map(view, 0, 0, 0x1000, rw_flags()).unwrap();

        let node = FaultNode::new(address, FaultFlags::WRITE, |_| {});
        assert!(!space.handle_fault(&node));
        queue.drain();
        assert!(!node.resolved());
        assert!(!page_space.is_mapped(address));

        let manage = ManageNode::new(|_| {});
        backing.submit_manage(&manage);
        queue.drain();
        let fetch = crate::bundle::FetchNode::new(|_| unreachable!());
        assert!(backing.fetch_range(manage.offset(), &fetch).unwrap());
        phys.write(fetch.result().unwrap().0, &[0x42; 4]);
        backing.complete_load(manage.offset(), manage.size());
        queue.drain();

        assert!(node.resolved());
        assert!(page_space.is_mapped(address));
        assert_eq!(read_user(&phys, &page_space, address), 0x42);
    }

    #[test]
    fn test_unmap_races_in_flight_fault() {
        let (ctx, _phys, queue) = test_ctx();
        let page_space = TestPageSpace::new(queue.clone());
        let space = AddressSpace::new(ctx.clone(), page_space.clone(), USER_RANGE);

        let managed = ManagedSpace::new(ctx.clone(), 0x1000);
        let backing = BackingMemory::new(managed.clone());
        let frontal = FrontalMemory::new(managed);
        let view = ExteriorBundleView::new(frontal, 0, 0x1000);
        let address = space.map(view, 0, 0, 0x1000, rw_flags()).unwrap();

        let fault = FaultNode::new(address, FaultFlags::WRITE, |_| {});
        assert!(!space.handle_fault(&fault));

        let unmap = UnmapNode::new(|_| {});
        space.unmap(address, 0x1000, &unmap).unwrap();
        queue.drain();
        assert!(unmap.is_complete());
        assert!(space.check_partition());

        // The pager answers after the mapping died; the fault resolves
        // harmlessly and no translation reappears.
        let manage = ManageNode::new(|_| {});
        backing.submit_manage(&manage);
        backing.complete_load(0, 0x1000);
        queue.drain();
        assert!(fault.resolved());
        assert!(!page_space.is_mapped(address));
        assert!(space.check_partition());
    }

    #[test]
    fn test_fork_share_resolves_same_frame() {
        let (ctx, _phys, queue) = test_ctx();
        let parent_ps = TestPageSpace::new(queue.clone());
        let space = AddressSpace::new(ctx.clone(), parent_ps.clone(), USER_RANGE);
        let view = anon_view(&ctx, 0x1000);
        let address = space.map(view, 0, 0, 0x1000, rw_flags()).unwrap();

        let child_ps = TestPageSpace::new(queue.clone());
        let node = ForkNode::new(|_| {});
        assert!(space.fork(child_ps.clone(), &node).unwrap());
        let child = node.forked_space().unwrap();
        assert!(child.check_partition());

        fault_sync(&space, address, FaultFlags::WRITE);
        fault_sync(&child, address, FaultFlags::WRITE);
        assert_eq!(
            parent_ps.translate(address).unwrap(),
            child_ps.translate(address).unwrap()
        );
    }

    #[test]
    fn test_fork_copy_on_write_isolates_writes() {
        let (ctx, phys, queue) = test_ctx();
        let parent_ps = TestPageSpace::new(queue.clone());
        let space = AddressSpace::new(ctx.clone(), parent_ps.clone(), USER_RANGE);

        let view = anon_view(&ctx, 0x1000);
        let flags =
            MapFlags::PROT_READ | MapFlags::PROT_WRITE | MapFlags::COPY_ON_WRITE_AT_FORK;
        let address = space.map(view, 0, 0, 0x1000, flags).unwrap();

        // Parent touches the page and stores 0xAA before forking.
        fault_sync(&space, address, FaultFlags::WRITE);
        write_user(&phys, &parent_ps, address, &[0xAA]);

        let child_ps = TestPageSpace::new(queue.clone());
        let node = ForkNode::new(|_| {});
        assert!(!space.fork(child_ps.clone(), &node).unwrap());
        queue.drain();
        let child = node.forked_space().unwrap();

        // Both sides see the frozen frame read-only.
        let (parent_pa, parent_flags) = parent_ps.entry(address).unwrap();
        let (child_pa, child_flags) = child_ps.entry(address).unwrap();
        assert_eq!(parent_pa, child_pa);
        assert_eq!(parent_flags, PageFlags::READ);
        assert_eq!(child_flags, PageFlags::READ);

        // Child writes 0xBB: the write fault copies privately.
        let fault = FaultNode::new(address, FaultFlags::WRITE, |_| {});
        child.handle_fault(&fault);
        queue.drain();
        assert!(fault.resolved());
        write_user(&phys, &child_ps, address, &[0xBB]);

        assert_eq!(read_user(&phys, &parent_ps, address), 0xAA);
        assert_eq!(read_user(&phys, &child_ps, address), 0xBB);

        // Parent's next write copies its own page; the child keeps 0xBB.
        let fault = FaultNode::new(address, FaultFlags::WRITE, |_| {});
        space.handle_fault(&fault);
        queue.drain();
        assert!(fault.resolved());
        write_user(&phys, &parent_ps, address, &[0xCC]);
        assert_eq!(read_user(&phys, &child_ps, address), 0xBB);
        assert_ne!(
            parent_ps.translate(address).unwrap(),
            child_ps.translate(address).unwrap()
        );
    }

    #[test]
    fn test_fork_drop_leaves_hole_in_child() {
        let (ctx, _phys, queue) = test_ctx();
        let parent_ps = TestPageSpace::new(queue.clone());
        let space = AddressSpace::new(ctx.clone(), parent_ps, USER_RANGE);
        let view = anon_view(&ctx, 0x1000);
        let dropped = MapFlags::PROT_READ | MapFlags::DROP_AT_FORK;
        let address = space.map(view.clone(), 0, 0, 0x1000, dropped).unwrap();
        space.map(view, 0, 0, 0x1000, rw_flags()).unwrap();

        let child_ps = TestPageSpace::new(queue.clone());
        let node = ForkNode::new(|_| {});
        space.fork(child_ps, &node).unwrap();
        let child = node.forked_space().unwrap();
        assert!(child.check_partition());

        let stray = fault_sync(&child, address, FaultFlags::empty());
        assert!(!stray.resolved());
    }

    #[test]
    fn test_teardown_clears_everything() {
        let (ctx, _phys, queue) = test_ctx();
        let page_space = TestPageSpace::new(queue.clone());
        let space = AddressSpace::new(ctx.clone(), page_space.clone(), USER_RANGE);
        let view = anon_view(&ctx, 0x2000);
        space
            .map(view.clone(), 0, 0, 0x2000, rw_flags() | MapFlags::POPULATE)
            .unwrap();
        space
            .map(view, 0, 0, 0x1000, rw_flags() | MapFlags::POPULATE)
            .unwrap();
        assert!(page_space.mapped_count() > 0);

        let node = UnmapNode::new(|_| {});
        space.teardown(&node);
        queue.drain();
        assert!(node.is_complete());
        assert_eq!(page_space.mapped_count(), 0);
        assert!(space.check_partition());

        space.activate();
        assert!(page_space.is_active());
    }
}
