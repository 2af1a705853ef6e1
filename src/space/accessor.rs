// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicBool, Ordering};

use super::{AddressSpace, FaultFlags, FaultNode};
use crate::{
    prelude::*,
    work::{WorkQueue, Worklet},
};

/// Completion record of [`ForeignSpaceAccessor::acquire`].
pub struct AcquireNode {
    inner: Mutex<AcquireInner>,
}

struct AcquireInner {
    result: Option<Result<()>>,
    acquired: Option<Box<dyn FnOnce(&AcquireNode) + Send>>,
}

impl AcquireNode {
    pub fn new<F>(acquired: F) -> Arc<Self>
    where
        F: FnOnce(&AcquireNode) + Send + 'static,
    {
        Arc::new(Self {
            inner: Mutex::new(AcquireInner {
                result: None,
                acquired: Some(Box::new(acquired)),
            }),
        })
    }

    pub fn result(&self) -> Result<()> {
        self.inner
            .lock()
            .result
            .unwrap_or(Err(Error::with_msg(Errno::Fault, "acquire not completed")))
    }

    fn complete_sync(&self, result: Result<()>) {
        self.inner.lock().result = Some(result);
    }

    fn complete_post(this: &Arc<Self>, queue: &Arc<dyn WorkQueue>, result: Result<()>) {
        let acquired = {
            let mut inner = this.inner.lock();
            inner.result = Some(result);
            inner.acquired.take()
        };
        if let Some(acquired) = acquired {
            let node = this.clone();
            queue.post(Worklet::new(move || acquired(&node)));
        }
    }
}

/// Bulk access into another address space without mapping it locally.
///
/// `acquire` pre-faults every page of the window, chaining across
/// suspensions and surfacing the first error. The accessor holds a strong
/// reference to the target space and registers itself with it: a teardown
/// of the target parks until the last accessor is released. After a
/// successful acquire, the data paths translate through the target page
/// table and never block.
pub struct ForeignSpaceAccessor {
    this: Weak<Self>,
    space: Arc<AddressSpace>,
    address: Vaddr,
    length: usize,
    acquired: AtomicBool,
}

impl ForeignSpaceAccessor {
    pub fn new(space: Arc<AddressSpace>, address: Vaddr, length: usize) -> Arc<Self> {
        space.accessor_attached();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            space,
            address,
            length,
            acquired: AtomicBool::new(false),
        })
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn address(&self) -> Vaddr {
        self.address
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Faults in `[address, address + length)` in the target space.
    ///
    /// Returns `true` if the whole window was acquired (or refused)
    /// synchronously; otherwise the node completes through the work queue.
    pub fn acquire(&self, node: &Arc<AcquireNode>) -> bool {
        Self::process_acquire(self.this.upgrade().unwrap(), node.clone(), 0, false)
    }

    fn page_count(&self) -> usize {
        let start = self.address.align_down(PAGE_SIZE);
        let end = (self.address + self.length).align_up(PAGE_SIZE);
        (end - start) / PAGE_SIZE
    }

    fn process_acquire(
        this: Arc<Self>,
        node: Arc<AcquireNode>,
        mut progress: usize,
        from_async: bool,
    ) -> bool {
        let queue = this.space.ctx().work_queue().clone();
        loop {
            if progress == this.page_count() {
                this.acquired.store(true, Ordering::Release);
                if from_async {
                    AcquireNode::complete_post(&node, &queue, Ok(()));
                } else {
                    node.complete_sync(Ok(()));
                }
                return true;
            }
            let va = this.address.align_down(PAGE_SIZE) + progress * PAGE_SIZE;

            let chained_this = this.clone();
            let chained_node = node.clone();
            let chained_queue = queue.clone();
            let fault = FaultNode::new(va, FaultFlags::empty(), move |f| {
                if f.resolved() {
                    Self::process_acquire(chained_this, chained_node, progress + 1, true);
                } else {
                    let error = f
                        .error()
                        .unwrap_or(Error::with_msg(Errno::BadAddress, "fault unresolved"));
                    AcquireNode::complete_post(&chained_node, &chained_queue, Err(error));
                }
            });

            if !this.space.handle_fault(&fault) {
                return false;
            }
            if !fault.resolved() {
                let error = fault
                    .error()
                    .unwrap_or(Error::with_msg(Errno::BadAddress, "fault unresolved"));
                if from_async {
                    AcquireNode::complete_post(&node, &queue, Err(error));
                } else {
                    node.complete_sync(Err(error));
                }
                return true;
            }
            progress += 1;
        }
    }

    /// Translates a window offset to its physical address.
    pub fn get_physical(&self, offset: usize) -> Result<Paddr> {
        if offset >= self.length {
            return_errno_with_msg!(Errno::BufferTooSmall, "offset outside accessor window");
        }
        self.space
            .page_space()
            .translate(self.address + offset)
            .ok_or(Error::with_msg(Errno::BadAddress, "page not acquired"))
    }

    /// Reads out of the acquired window, crossing page boundaries through
    /// per-page translation.
    pub fn load(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() > self.length {
            return_errno_with_msg!(Errno::BufferTooSmall, "load exceeds accessor window");
        }
        let allocator = self.space.ctx().allocator().clone();
        let mut done = 0;
        while done < buf.len() {
            let va = self.address + offset + done;
            let chunk = (PAGE_SIZE - va % PAGE_SIZE).min(buf.len() - done);
            let Some(pa) = self.space.page_space().translate(va) else {
                return_errno_with_msg!(Errno::BadAddress, "page not acquired");
            };
            allocator.read(pa, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Writes into the acquired window.
    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<()> {
        if offset + buf.len() > self.length {
            return_errno_with_msg!(Errno::BufferTooSmall, "write exceeds accessor window");
        }
        let allocator = self.space.ctx().allocator().clone();
        let mut done = 0;
        while done < buf.len() {
            let va = self.address + offset + done;
            let chunk = (PAGE_SIZE - va % PAGE_SIZE).min(buf.len() - done);
            let Some(pa) = self.space.page_space().translate(va) else {
                return_errno_with_msg!(Errno::BadAddress, "page not acquired");
            };
            allocator.write(pa, &buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }
}

impl Drop for ForeignSpaceAccessor {
    fn drop(&mut self) {
        self.space.accessor_released();
    }
}
