// SPDX-License-Identifier: MPL-2.0

//! Memory bundles.
//!
//! A bundle turns logical offsets into physical pages. Pages are provided
//! lazily: `fetch_range` either completes synchronously or arranges for the
//! node's continuation to be posted once the page becomes present. The core
//! never evicts a page that a mapping still references, so results stay
//! stable for the bundle's lifetime.

mod allocated;
mod cow;
mod hardware;
mod managed;

pub use self::{
    allocated::AllocatedMemory,
    cow::CowBundle,
    hardware::HardwareMemory,
    managed::{BackingMemory, FrontalMemory, InitiateNode, LoadState, ManageNode, ManagedSpace},
};

use crate::{
    phys::VmContext,
    prelude::*,
    work::{WorkQueue, Worklet},
};

/// A caller-allocated completion record for one `fetch_range` operation.
///
/// Fetches are not cancellable; the node must outlive the fetch.
pub struct FetchNode {
    inner: Mutex<FetchInner>,
}

struct FetchInner {
    fetched: Option<Box<dyn FnOnce(&FetchNode) + Send>>,
    result: Option<Result<(Paddr, usize)>>,
}

impl FetchNode {
    /// Creates a node whose continuation runs only if the fetch goes
    /// asynchronous (the operation returned `false`).
    pub fn new<F>(fetched: F) -> Arc<Self>
    where
        F: FnOnce(&FetchNode) + Send + 'static,
    {
        Arc::new(Self {
            inner: Mutex::new(FetchInner {
                fetched: Some(Box::new(fetched)),
                result: None,
            }),
        })
    }

    /// The fetched `(physical, contiguous run)` pair, or the chain's error.
    ///
    /// Valid once the fetch completed (synchronously or through the
    /// continuation).
    pub fn result(&self) -> Result<(Paddr, usize)> {
        self.inner
            .lock()
            .result
            .unwrap_or(Err(Error::with_msg(Errno::Fault, "fetch not completed")))
    }

    /// Fills the node on the synchronous path. The continuation is not run.
    pub(crate) fn complete_sync(&self, result: Result<(Paddr, usize)>) {
        self.inner.lock().result = Some(result);
    }

    /// Fills the node and posts its continuation to the work queue.
    pub(crate) fn complete_post(
        this: &Arc<Self>,
        queue: &Arc<dyn WorkQueue>,
        result: Result<(Paddr, usize)>,
    ) {
        let fetched = {
            let mut inner = this.inner.lock();
            inner.result = Some(result);
            inner.fetched.take()
        };
        if let Some(fetched) = fetched {
            let node = this.clone();
            queue.post(Worklet::new(move || fetched(&node)));
        }
    }
}

/// The uniform asynchronous interface of every memory bundle.
pub trait MemoryBundle: Send + Sync {
    /// The bundle's length in bytes.
    fn length(&self) -> usize;

    /// Optimistically returns the physical memory backing `offset`, if it
    /// happens to be present. Never initiates work.
    fn peek_range(&self, offset: usize) -> Option<Paddr>;

    /// Ensures the range starting at `offset` is backed.
    ///
    /// Returns `Ok(true)` if the page was already present; the node carries
    /// `(physical, size)` where `size` is the largest contiguous physical
    /// run from `offset` (callers must not assume a whole page). Returns
    /// `Ok(false)` if the node's continuation will be posted later.
    fn fetch_range(&self, offset: usize, node: &Arc<FetchNode>) -> Result<bool>;

    /// Grows the bundle. Most bundles reject this.
    fn resize(&self, _new_length: usize) -> Result<()> {
        return_errno_with_msg!(Errno::Fault, "bundle does not support resize");
    }
}

impl fmt::Debug for dyn MemoryBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBundle")
            .field("length", &self.length())
            .finish()
    }
}

struct CopyToState {
    ctx: Arc<VmContext>,
    bundle: Arc<dyn MemoryBundle>,
    offset: usize,
    bytes: Vec<u8>,
    progress: usize,
    done: Option<Box<dyn FnOnce(Result<()>) + Send>>,
}

/// Copies a kernel buffer into a bundle, fetching pages as needed.
///
/// The completion is always delivered through the work queue, even when
/// every fetch was synchronous.
pub fn copy_to_bundle<F>(
    ctx: &Arc<VmContext>,
    bundle: Arc<dyn MemoryBundle>,
    offset: usize,
    bytes: Vec<u8>,
    done: F,
) where
    F: FnOnce(Result<()>) + Send + 'static,
{
    let state = Arc::new(Mutex::new(CopyToState {
        ctx: ctx.clone(),
        bundle,
        offset,
        bytes,
        progress: 0,
        done: Some(Box::new(done)),
    }));
    drive_copy_to(state);
}

fn finish_copy_to(state: &Arc<Mutex<CopyToState>>, result: Result<()>) {
    let (queue, done) = {
        let mut st = state.lock();
        (st.ctx.work_queue().clone(), st.done.take())
    };
    if let Some(done) = done {
        queue.post(Worklet::new(move || done(result)));
    }
}

fn drive_copy_to(state: Arc<Mutex<CopyToState>>) {
    loop {
        let (bundle, fetch_off) = {
            let st = state.lock();
            if st.progress == st.bytes.len() {
                drop(st);
                finish_copy_to(&state, Ok(()));
                return;
            }
            (st.bundle.clone(), st.offset + st.progress)
        };
        let chained = state.clone();
        let node = FetchNode::new(move |n| match n.result() {
            Ok(range) => {
                apply_copy_to(&chained, range);
                drive_copy_to(chained);
            }
            Err(e) => finish_copy_to(&chained, Err(e)),
        });
        match bundle.fetch_range(fetch_off, &node) {
            Ok(true) => match node.result() {
                Ok(range) => apply_copy_to(&state, range),
                Err(e) => {
                    finish_copy_to(&state, Err(e));
                    return;
                }
            },
            Ok(false) => return,
            Err(e) => {
                finish_copy_to(&state, Err(e));
                return;
            }
        }
    }
}

fn apply_copy_to(state: &Arc<Mutex<CopyToState>>, (phys, run): (Paddr, usize)) {
    let mut st = state.lock();
    let chunk = run.min(st.bytes.len() - st.progress);
    let from = st.progress;
    st.ctx
        .allocator()
        .write(phys, &st.bytes[from..from + chunk]);
    st.progress += chunk;
}

struct CopyFromState {
    ctx: Arc<VmContext>,
    bundle: Arc<dyn MemoryBundle>,
    offset: usize,
    bytes: Vec<u8>,
    length: usize,
    done: Option<Box<dyn FnOnce(Result<Vec<u8>>) + Send>>,
}

/// Copies out of a bundle into a fresh kernel buffer.
///
/// Completion delivery matches [`copy_to_bundle`].
pub fn copy_from_bundle<F>(
    ctx: &Arc<VmContext>,
    bundle: Arc<dyn MemoryBundle>,
    offset: usize,
    length: usize,
    done: F,
) where
    F: FnOnce(Result<Vec<u8>>) + Send + 'static,
{
    let state = Arc::new(Mutex::new(CopyFromState {
        ctx: ctx.clone(),
        bundle,
        offset,
        bytes: Vec::new(),
        length,
        done: Some(Box::new(done)),
    }));
    drive_copy_from(state);
}

fn finish_copy_from(state: &Arc<Mutex<CopyFromState>>, result: Result<Vec<u8>>) {
    let (queue, done) = {
        let mut st = state.lock();
        (st.ctx.work_queue().clone(), st.done.take())
    };
    if let Some(done) = done {
        queue.post(Worklet::new(move || done(result)));
    }
}

fn drive_copy_from(state: Arc<Mutex<CopyFromState>>) {
    loop {
        let (bundle, fetch_off) = {
            let st = state.lock();
            if st.bytes.len() == st.length {
                let out = st.bytes.clone();
                drop(st);
                finish_copy_from(&state, Ok(out));
                return;
            }
            (st.bundle.clone(), st.offset + st.bytes.len())
        };
        let chained = state.clone();
        let node = FetchNode::new(move |n| match n.result() {
            Ok(range) => {
                apply_copy_from(&chained, range);
                drive_copy_from(chained);
            }
            Err(e) => finish_copy_from(&chained, Err(e)),
        });
        match bundle.fetch_range(fetch_off, &node) {
            Ok(true) => match node.result() {
                Ok(range) => apply_copy_from(&state, range),
                Err(e) => {
                    finish_copy_from(&state, Err(e));
                    return;
                }
            },
            Ok(false) => return,
            Err(e) => {
                finish_copy_from(&state, Err(e));
                return;
            }
        }
    }
}

fn apply_copy_from(state: &Arc<Mutex<CopyFromState>>, (phys, run): (Paddr, usize)) {
    let mut st = state.lock();
    let chunk = run.min(st.length - st.bytes.len());
    let at = st.bytes.len();
    let allocator = st.ctx.allocator().clone();
    st.bytes.resize(at + chunk, 0);
    allocator.read(phys, &mut st.bytes[at..at + chunk]);
}
