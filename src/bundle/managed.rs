// SPDX-License-Identifier: MPL-2.0

//! Externally paged memory.
//!
//! A [`ManagedSpace`] couples a kernel-side client to a user-space pager
//! through two bundle faces: [`FrontalMemory`] (the client side, which
//! initiates loads) and [`BackingMemory`] (the pager side, which accepts
//! manage requests and reports load completions). Both faces share one
//! physical page vector and one per-page load state machine:
//!
//! ```text
//! Missing --(manage node paired, page allocated)--> Loading
//! Loading --(complete_load)--> Loaded
//! ```

use super::{FetchNode, MemoryBundle};
use crate::{
    phys::VmContext,
    prelude::*,
    work::{WorkQueue, Worklet},
};

/// Per-page load state of a managed space.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoadState {
    Missing,
    Loading,
    Loaded,
}

/// A client request that a range of a managed space become loaded.
///
/// Completes with `Ok` once every page of the range is `Loaded`, or with
/// `PagerGone` if the pager disappears first. Completions preserve
/// submission order among initiators that become ready.
pub struct InitiateNode {
    offset: usize,
    length: usize,
    inner: Mutex<NodeInner>,
}

struct NodeInner {
    result: Option<Result<()>>,
    done: Option<Box<dyn FnOnce(&InitiateNode) + Send>>,
}

impl InitiateNode {
    pub fn new<F>(offset: usize, length: usize, done: F) -> Arc<Self>
    where
        F: FnOnce(&InitiateNode) + Send + 'static,
    {
        Arc::new(Self {
            offset,
            length,
            inner: Mutex::new(NodeInner {
                result: None,
                done: Some(Box::new(done)),
            }),
        })
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn result(&self) -> Result<()> {
        self.inner
            .lock()
            .result
            .unwrap_or(Err(Error::with_msg(Errno::Fault, "load not completed")))
    }

    fn finish(this: &Arc<Self>, queue: &Arc<dyn WorkQueue>, result: Result<()>) {
        let done = {
            let mut inner = this.inner.lock();
            inner.result = Some(result);
            inner.done.take()
        };
        if let Some(done) = done {
            let node = this.clone();
            queue.post(Worklet::new(move || done(&node)));
        }
    }

    fn pages(&self) -> Range<usize> {
        self.offset / PAGE_SIZE..(self.offset + self.length + PAGE_SIZE - 1) / PAGE_SIZE
    }
}

/// A pager's offer to service one load.
///
/// When the offer is paired with a missing page, the page's physical memory
/// is allocated, the node's `(offset, size)` names the page the pager must
/// fill, and the node completes. The pager writes the data and then calls
/// [`BackingMemory::complete_load`].
pub struct ManageNode {
    inner: Mutex<ManageInner>,
}

struct ManageInner {
    result: Option<Result<()>>,
    offset: usize,
    size: usize,
    done: Option<Box<dyn FnOnce(&ManageNode) + Send>>,
}

impl ManageNode {
    pub fn new<F>(done: F) -> Arc<Self>
    where
        F: FnOnce(&ManageNode) + Send + 'static,
    {
        Arc::new(Self {
            inner: Mutex::new(ManageInner {
                result: None,
                offset: 0,
                size: 0,
                done: Some(Box::new(done)),
            }),
        })
    }

    /// The range to service. Valid once the node has completed.
    pub fn offset(&self) -> usize {
        self.inner.lock().offset
    }

    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn result(&self) -> Result<()> {
        self.inner
            .lock()
            .result
            .unwrap_or(Err(Error::with_msg(Errno::Fault, "manage not completed")))
    }

    fn set_range(&self, offset: usize, size: usize) {
        let mut inner = self.inner.lock();
        inner.offset = offset;
        inner.size = size;
    }

    fn finish(this: &Arc<Self>, queue: &Arc<dyn WorkQueue>, result: Result<()>) {
        let done = {
            let mut inner = this.inner.lock();
            inner.result = Some(result);
            inner.done.take()
        };
        if let Some(done) = done {
            let node = this.clone();
            queue.post(Worklet::new(move || done(&node)));
        }
    }
}

/// The shared state behind a Backing/Frontal pair.
pub struct ManagedSpace {
    ctx: Arc<VmContext>,
    length: usize,
    inner: Mutex<ManagedInner>,
}

struct ManagedInner {
    pages: Vec<Option<Paddr>>,
    state: Vec<LoadState>,
    /// Initiators not yet fully handed to the pager, in submission order.
    initiate_queue: VecDeque<Arc<InitiateNode>>,
    /// Initiators whose every page has been handed out, awaiting loads.
    pending_queue: VecDeque<Arc<InitiateNode>>,
    submitted_manage: VecDeque<Arc<ManageNode>>,
    pager_gone: bool,
}

impl ManagedSpace {
    pub fn new(ctx: Arc<VmContext>, length: usize) -> Arc<Self> {
        assert_eq!(length % PAGE_SIZE, 0);
        let npages = length / PAGE_SIZE;
        Arc::new(Self {
            ctx,
            length,
            inner: Mutex::new(ManagedInner {
                pages: vec![None; npages],
                state: vec![LoadState::Missing; npages],
                initiate_queue: VecDeque::new(),
                pending_queue: VecDeque::new(),
                submitted_manage: VecDeque::new(),
                pager_gone: false,
            }),
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn load_state(&self, page_index: usize) -> LoadState {
        self.inner.lock().state[page_index]
    }

    /// Matches pending missing pages against queued manage offers, then
    /// retires initiators whose ranges are fully loaded. FIFO in both
    /// directions; never reorders.
    fn progress(&self, inner: &mut ManagedInner) {
        let queue = self.ctx.work_queue();

        while !inner.submitted_manage.is_empty() {
            let Some(head) = inner.initiate_queue.front().cloned() else {
                break;
            };
            match head.pages().find(|&i| inner.state[i] == LoadState::Missing) {
                Some(index) => {
                    let manage = inner.submitted_manage.pop_front().unwrap();
                    match self.ctx.allocator().alloc_page() {
                        Ok(phys) => {
                            inner.state[index] = LoadState::Loading;
                            inner.pages[index] = Some(phys);
                            manage.set_range(index * PAGE_SIZE, PAGE_SIZE);
                            ManageNode::finish(&manage, queue, Ok(()));
                        }
                        Err(e) => {
                            warn!("manage pairing failed: {:?}", e);
                            ManageNode::finish(&manage, queue, Err(e));
                        }
                    }
                }
                None => {
                    let head = inner.initiate_queue.pop_front().unwrap();
                    inner.pending_queue.push_back(head);
                }
            }
        }

        // Heads may become fully handed out without consuming an offer.
        while let Some(head) = inner.initiate_queue.front() {
            if head.pages().any(|i| inner.state[i] == LoadState::Missing) {
                break;
            }
            let head = inner.initiate_queue.pop_front().unwrap();
            inner.pending_queue.push_back(head);
        }

        let mut index = 0;
        while index < inner.pending_queue.len() {
            let ready = inner.pending_queue[index]
                .pages()
                .all(|i| inner.state[i] == LoadState::Loaded);
            if ready {
                let node = inner.pending_queue.remove(index).unwrap();
                InitiateNode::finish(&node, queue, Ok(()));
            } else {
                index += 1;
            }
        }
    }

    fn submit_initiate(&self, node: &Arc<InitiateNode>) {
        let mut inner = self.inner.lock();
        if node.offset + node.length > self.length {
            InitiateNode::finish(
                node,
                self.ctx.work_queue(),
                Err(Error::with_msg(Errno::BadAddress, "load outside managed space")),
            );
            return;
        }
        if inner.pager_gone {
            InitiateNode::finish(node, self.ctx.work_queue(), Err(Error::new(Errno::PagerGone)));
            return;
        }
        inner.initiate_queue.push_back(node.clone());
        self.progress(&mut inner);
    }

    fn submit_manage(&self, node: &Arc<ManageNode>) {
        let mut inner = self.inner.lock();
        inner.submitted_manage.push_back(node.clone());
        self.progress(&mut inner);
    }

    fn complete_load(&self, offset: usize, length: usize) {
        let mut inner = self.inner.lock();
        let end = ((offset + length + PAGE_SIZE - 1) / PAGE_SIZE).min(inner.state.len());
        for index in offset / PAGE_SIZE..end {
            if inner.state[index] == LoadState::Loading {
                inner.state[index] = LoadState::Loaded;
            }
        }
        self.progress(&mut inner);
    }

    /// The pager is gone. Outstanding initiators fail `PagerGone`; pages
    /// already loaded stay usable.
    fn retire_pager(&self) {
        let mut inner = self.inner.lock();
        inner.pager_gone = true;
        let queue = self.ctx.work_queue();
        let outstanding =
            inner.initiate_queue.len() + inner.pending_queue.len() + inner.submitted_manage.len();
        if outstanding > 0 {
            warn!("pager detached with {} nodes outstanding", outstanding);
        }
        while let Some(node) = inner.initiate_queue.pop_front() {
            InitiateNode::finish(&node, queue, Err(Error::new(Errno::PagerGone)));
        }
        while let Some(node) = inner.pending_queue.pop_front() {
            InitiateNode::finish(&node, queue, Err(Error::new(Errno::PagerGone)));
        }
        while let Some(node) = inner.submitted_manage.pop_front() {
            ManageNode::finish(&node, queue, Err(Error::new(Errno::PagerGone)));
        }
    }
}

impl Drop for ManagedSpace {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        for page in inner.pages.iter().flatten() {
            self.ctx.allocator().free(*page, PAGE_SIZE);
        }
    }
}

/// The pager-side face of a managed space.
pub struct BackingMemory {
    managed: Arc<ManagedSpace>,
}

impl BackingMemory {
    pub fn new(managed: Arc<ManagedSpace>) -> Arc<Self> {
        Arc::new(Self { managed })
    }

    pub fn submit_manage(&self, node: &Arc<ManageNode>) {
        self.managed.submit_manage(node);
    }

    pub fn complete_load(&self, offset: usize, length: usize) {
        self.managed.complete_load(offset, length);
    }
}

impl MemoryBundle for BackingMemory {
    fn length(&self) -> usize {
        self.managed.length()
    }

    fn peek_range(&self, offset: usize) -> Option<Paddr> {
        let inner = self.managed.inner.lock();
        let index = offset / PAGE_SIZE;
        if index >= inner.pages.len() || inner.state[index] == LoadState::Missing {
            return None;
        }
        inner.pages[index].map(|base| base + (offset % PAGE_SIZE) as Paddr)
    }

    fn fetch_range(&self, offset: usize, node: &Arc<FetchNode>) -> Result<bool> {
        let inner = self.managed.inner.lock();
        let index = offset / PAGE_SIZE;
        if offset >= self.managed.length {
            return_errno_with_msg!(Errno::BadAddress, "offset outside managed space");
        }
        // The pager owns every page it has been handed (Loading included);
        // only pages it never asked for are off limits.
        if inner.state[index] == LoadState::Missing {
            return_errno_with_msg!(Errno::Fault, "backing fetch of a missing page");
        }
        let base = inner.pages[index].unwrap();
        let in_off = offset % PAGE_SIZE;
        node.complete_sync(Ok((base + in_off as Paddr, PAGE_SIZE - in_off)));
        Ok(true)
    }
}

impl Drop for BackingMemory {
    fn drop(&mut self) {
        self.managed.retire_pager();
    }
}

/// The client-side face of a managed space.
pub struct FrontalMemory {
    managed: Arc<ManagedSpace>,
}

impl FrontalMemory {
    pub fn new(managed: Arc<ManagedSpace>) -> Arc<Self> {
        Arc::new(Self { managed })
    }

    pub fn submit_initiate_load(&self, node: &Arc<InitiateNode>) {
        self.managed.submit_initiate(node);
    }

    pub fn managed(&self) -> &Arc<ManagedSpace> {
        &self.managed
    }
}

impl MemoryBundle for FrontalMemory {
    fn length(&self) -> usize {
        self.managed.length()
    }

    fn peek_range(&self, offset: usize) -> Option<Paddr> {
        let inner = self.managed.inner.lock();
        let index = offset / PAGE_SIZE;
        if index >= inner.pages.len() || inner.state[index] != LoadState::Loaded {
            return None;
        }
        inner.pages[index].map(|base| base + (offset % PAGE_SIZE) as Paddr)
    }

    fn fetch_range(&self, offset: usize, node: &Arc<FetchNode>) -> Result<bool> {
        if offset >= self.managed.length {
            return_errno_with_msg!(Errno::BadAddress, "offset outside managed space");
        }
        let index = offset / PAGE_SIZE;
        let in_off = offset % PAGE_SIZE;
        let mut inner = self.managed.inner.lock();
        if inner.state[index] == LoadState::Loaded {
            let base = inner.pages[index].unwrap();
            node.complete_sync(Ok((base + in_off as Paddr, PAGE_SIZE - in_off)));
            return Ok(true);
        }
        if inner.pager_gone {
            return_errno_with_msg!(Errno::PagerGone, "pager detached before load");
        }

        // Ride an internal single-page initiator and complete the fetch
        // once the page is loaded.
        let managed = self.managed.clone();
        let fetch = node.clone();
        let queue = self.managed.ctx.work_queue().clone();
        let initiate = InitiateNode::new(index * PAGE_SIZE, PAGE_SIZE, move |n| {
            match n.result() {
                Ok(()) => {
                    let base = managed.inner.lock().pages[index].unwrap();
                    FetchNode::complete_post(&fetch, &queue, Ok((base + in_off as Paddr, PAGE_SIZE - in_off)));
                }
                Err(e) => FetchNode::complete_post(&fetch, &queue, Err(e)),
            }
        });
        inner.initiate_queue.push_back(initiate);
        self.managed.progress(&mut inner);
        Ok(false)
    }
}
