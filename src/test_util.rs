// SPDX-License-Identifier: MPL-2.0

//! Host-side doubles for the external collaborators: a map-backed physical
//! allocator, a drain-by-hand work queue, and a page space whose shootdowns
//! acknowledge through the queue. Draining the queue by hand makes every
//! asynchronous completion order deterministic.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    page_space::{ClientPageSpace, PageFlags, ShootNode},
    phys::{PhysAllocator, VmContext},
    prelude::*,
    work::{WorkQueue, Worklet},
};

pub(crate) struct TestPhys {
    inner: Mutex<PhysInner>,
}

struct PhysInner {
    next: Paddr,
    blocks: BTreeMap<Paddr, Vec<u8>>,
    limit: Option<usize>,
}

impl TestPhys {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PhysInner {
                next: 0x10_0000,
                blocks: BTreeMap::new(),
                limit: None,
            }),
        })
    }

    /// Caps the number of live blocks; later allocations fail.
    pub(crate) fn set_limit(&self, blocks: usize) {
        self.inner.lock().limit = Some(blocks);
    }

    pub(crate) fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub(crate) fn read(&self, paddr: Paddr, buf: &mut [u8]) {
        PhysAllocator::read(self, paddr, buf)
    }

    pub(crate) fn write(&self, paddr: Paddr, buf: &[u8]) {
        PhysAllocator::write(self, paddr, buf)
    }

    fn alloc_block(&self, size: usize, align: usize) -> Result<Paddr> {
        let mut inner = self.inner.lock();
        if let Some(limit) = inner.limit {
            if inner.blocks.len() >= limit {
                return_errno_with_msg!(Errno::OutOfMemory, "test allocator exhausted");
            }
        }
        let align = align as Paddr;
        let base = (inner.next + align - 1) & !(align - 1);
        inner.next = base + size as Paddr;
        // Poisoned, not zeroed: callers own initialization.
        inner.blocks.insert(base, vec![0xCD; size]);
        Ok(base)
    }

    fn with_block<R>(&self, paddr: Paddr, f: impl FnOnce(&mut [u8], usize) -> R) -> R {
        let mut inner = self.inner.lock();
        let (&base, block) = inner
            .blocks
            .range_mut(..=paddr)
            .next_back()
            .expect("access to unallocated physical memory");
        let offset = (paddr - base) as usize;
        assert!(offset < block.len());
        f(block, offset)
    }
}

impl PhysAllocator for TestPhys {
    fn alloc_page(&self) -> Result<Paddr> {
        self.alloc_block(PAGE_SIZE, PAGE_SIZE)
    }

    fn alloc_contiguous(&self, size: usize, align: usize) -> Result<Paddr> {
        self.alloc_block(size, align)
    }

    fn free(&self, paddr: Paddr, size: usize) {
        let mut inner = self.inner.lock();
        let block = inner.blocks.remove(&paddr).expect("double free");
        assert_eq!(block.len(), size);
    }

    fn read(&self, paddr: Paddr, buf: &mut [u8]) {
        self.with_block(paddr, |block, offset| {
            buf.copy_from_slice(&block[offset..offset + buf.len()]);
        })
    }

    fn write(&self, paddr: Paddr, buf: &[u8]) {
        self.with_block(paddr, |block, offset| {
            block[offset..offset + buf.len()].copy_from_slice(buf);
        })
    }

    fn zero(&self, paddr: Paddr, len: usize) {
        self.with_block(paddr, |block, offset| {
            block[offset..offset + len].fill(0);
        })
    }
}

pub(crate) struct ManualQueue {
    queue: Mutex<VecDeque<Worklet>>,
}

impl ManualQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Runs posted worklets, including those they post, until quiescent.
    pub(crate) fn drain(&self) {
        loop {
            let Some(worklet) = self.queue.lock().pop_front() else {
                break;
            };
            worklet.run();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl WorkQueue for ManualQueue {
    fn post(&self, worklet: Worklet) {
        self.queue.lock().push_back(worklet);
    }
}

pub(crate) struct TestPageSpace {
    queue: Arc<ManualQueue>,
    entries: Mutex<BTreeMap<Vaddr, (Paddr, PageFlags)>>,
    active: AtomicBool,
}

impl TestPageSpace {
    pub(crate) fn new(queue: Arc<ManualQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            entries: Mutex::new(BTreeMap::new()),
            active: AtomicBool::new(false),
        })
    }

    pub(crate) fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn entry(&self, va: Vaddr) -> Option<(Paddr, PageFlags)> {
        self.entries.lock().get(&va.align_down(PAGE_SIZE)).copied()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl ClientPageSpace for TestPageSpace {
    fn map(&self, va: Vaddr, pa: Paddr, flags: PageFlags) {
        self.entries
            .lock()
            .insert(va.align_down(PAGE_SIZE), (pa, flags));
    }

    fn unmap(&self, va: Vaddr, len: usize) {
        let mut entries = self.entries.lock();
        let start = va.align_down(PAGE_SIZE);
        let keys: Vec<Vaddr> = entries
            .range(start..start + len)
            .map(|(&k, _)| k)
            .collect();
        for key in keys {
            entries.remove(&key);
        }
    }

    fn protect(&self, va: Vaddr, flags: PageFlags) -> bool {
        match self.entries.lock().get_mut(&va.align_down(PAGE_SIZE)) {
            Some(entry) => {
                entry.1 = flags;
                true
            }
            None => false,
        }
    }

    fn is_mapped(&self, va: Vaddr) -> bool {
        self.entries
            .lock()
            .contains_key(&va.align_down(PAGE_SIZE))
    }

    fn translate(&self, va: Vaddr) -> Option<Paddr> {
        let entries = self.entries.lock();
        let (pa, _) = entries.get(&va.align_down(PAGE_SIZE))?;
        Some(pa + (va % PAGE_SIZE) as Paddr)
    }

    fn shootdown(&self, node: &Arc<ShootNode>) {
        self.queue.post(ShootNode::into_worklet(node));
    }

    fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn test_ctx() -> (Arc<VmContext>, Arc<TestPhys>, Arc<ManualQueue>) {
    let phys = TestPhys::new();
    let queue = ManualQueue::new();
    let ctx = VmContext::new(phys.clone(), queue.clone());
    (ctx, phys, queue)
}
