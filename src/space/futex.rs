// SPDX-License-Identifier: MPL-2.0

use crate::{phys::VmContext, prelude::*, work::Worklet};

/// A waiter parked on a futex address.
pub struct FutexNode {
    woken: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FutexNode {
    pub fn new<F>(woken: F) -> Arc<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        Arc::new(Self {
            woken: Mutex::new(Some(Box::new(woken))),
        })
    }

    fn into_worklet(this: &Arc<Self>) -> Option<Worklet> {
        let woken = this.woken.lock().take()?;
        Some(Worklet::new(woken))
    }
}

/// Per-address FIFO wait queues for userspace synchronization.
///
/// The expected-value check happens in the caller under its own locking;
/// this table only parks and wakes.
pub struct FutexSpace {
    ctx: Arc<VmContext>,
    slots: Mutex<BTreeMap<Vaddr, VecDeque<Arc<FutexNode>>>>,
}

impl FutexSpace {
    pub(crate) fn new(ctx: Arc<VmContext>) -> Self {
        Self {
            ctx,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn submit_wait(&self, address: Vaddr, node: &Arc<FutexNode>) {
        let mut slots = self.slots.lock();
        slots.entry(address).or_default().push_back(node.clone());
    }

    /// Wakes up to `count` waiters in FIFO order; returns how many.
    pub fn wake(&self, address: Vaddr, count: usize) -> usize {
        let mut woken = 0;
        let mut slots = self.slots.lock();
        if let Some(queue) = slots.get_mut(&address) {
            while woken < count {
                let Some(node) = queue.pop_front() else {
                    break;
                };
                if let Some(worklet) = FutexNode::into_worklet(&node) {
                    self.ctx.work_queue().post(worklet);
                    woken += 1;
                }
            }
            if queue.is_empty() {
                slots.remove(&address);
            }
        }
        woken
    }
}
