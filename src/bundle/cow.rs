// SPDX-License-Identifier: MPL-2.0

use super::{FetchNode, MemoryBundle};
use crate::{
    phys::{copy_phys, VmContext},
    prelude::*,
    view::VirtualView,
};

enum CowParent {
    /// The bottom of the chain: a window onto a view.
    Root(Arc<dyn VirtualView>),
    /// A layer over another copy-on-write bundle.
    Chain(Arc<CowBundle>),
}

enum CowPage {
    /// A parent fetch is in flight; the nodes (with their in-page offsets)
    /// all await the one copy.
    Copying(Vec<(usize, Arc<FetchNode>)>),
    Present(Paddr),
}

/// A chained copy-on-write overlay.
///
/// Fetching a page that has no local copy fetches it from the parent,
/// duplicates it into a freshly allocated page and publishes the copy;
/// exactly one copy is ever made per page, no matter how many fetches race.
/// The parent page is never written. `peek_range` sees only local copies.
pub struct CowBundle {
    this: Weak<CowBundle>,
    ctx: Arc<VmContext>,
    parent: CowParent,
    super_offset: usize,
    length: usize,
    pages: Mutex<BTreeMap<usize, CowPage>>,
}

impl CowBundle {
    pub fn new_root(
        ctx: Arc<VmContext>,
        view: Arc<dyn VirtualView>,
        offset: usize,
        length: usize,
    ) -> Arc<Self> {
        Self::build(ctx, CowParent::Root(view), offset, length)
    }

    pub fn new_chained(
        ctx: Arc<VmContext>,
        parent: Arc<CowBundle>,
        offset: usize,
        length: usize,
    ) -> Arc<Self> {
        Self::build(ctx, CowParent::Chain(parent), offset, length)
    }

    fn build(ctx: Arc<VmContext>, parent: CowParent, offset: usize, length: usize) -> Arc<Self> {
        assert_eq!(offset % PAGE_SIZE, 0);
        assert_eq!(length % PAGE_SIZE, 0);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ctx,
            parent,
            super_offset: offset,
            length,
            pages: Mutex::new(BTreeMap::new()),
        })
    }

    /// Copies the parent page and publishes it, or fails every waiter.
    fn finish_copy(&self, index: usize, parent_result: Result<(Paddr, usize)>) {
        let copied = parent_result.and_then(|(parent_pa, _run)| {
            let page = self.ctx.allocator().alloc_page()?;
            copy_phys(self.ctx.allocator().as_ref(), page, parent_pa, PAGE_SIZE);
            Ok(page)
        });

        let waiters = {
            let mut pages = self.pages.lock();
            let Some(CowPage::Copying(waiters)) = pages.remove(&index) else {
                return;
            };
            if let Ok(page) = copied {
                pages.insert(index, CowPage::Present(page));
            }
            waiters
        };

        let queue = self.ctx.work_queue();
        for (in_off, node) in waiters {
            let result = copied.map(|page| (page + in_off as Paddr, PAGE_SIZE - in_off));
            FetchNode::complete_post(&node, queue, result);
        }
    }

    fn fetch_parent(&self, index: usize) -> Result<()> {
        let this = self.this.upgrade().unwrap();
        let node = FetchNode::new(move |n| this.finish_copy(index, n.result()));
        let parent_off = self.super_offset + index * PAGE_SIZE;
        let sync = match &self.parent {
            CowParent::Root(view) => {
                let (bundle, bundle_off, _usable) = view.resolve_range(parent_off, PAGE_SIZE)?;
                bundle.fetch_range(bundle_off, &node)?
            }
            CowParent::Chain(parent) => parent.fetch_range(parent_off, &node)?,
        };
        if sync {
            self.finish_copy(index, node.result());
        }
        Ok(())
    }
}

impl MemoryBundle for CowBundle {
    fn length(&self) -> usize {
        self.length
    }

    fn peek_range(&self, offset: usize) -> Option<Paddr> {
        let pages = self.pages.lock();
        match pages.get(&(offset / PAGE_SIZE)) {
            Some(CowPage::Present(page)) => Some(page + (offset % PAGE_SIZE) as Paddr),
            _ => None,
        }
    }

    fn fetch_range(&self, offset: usize, node: &Arc<FetchNode>) -> Result<bool> {
        if offset >= self.length {
            return_errno_with_msg!(Errno::BadAddress, "offset outside copy-on-write window");
        }
        let index = offset / PAGE_SIZE;
        let in_off = offset % PAGE_SIZE;

        let start_copy = {
            let mut pages = self.pages.lock();
            match pages.get_mut(&index) {
                Some(CowPage::Present(page)) => {
                    node.complete_sync(Ok((*page + in_off as Paddr, PAGE_SIZE - in_off)));
                    return Ok(true);
                }
                Some(CowPage::Copying(waiters)) => {
                    waiters.push((in_off, node.clone()));
                    false
                }
                None => {
                    pages.insert(index, CowPage::Copying(vec![(in_off, node.clone())]));
                    true
                }
            }
        };

        if start_copy {
            if let Err(e) = self.fetch_parent(index) {
                // Fails every waiter (including this node) through the
                // queue and clears the entry so a later fetch may retry.
                self.finish_copy(index, Err(e));
            }
        }
        Ok(false)
    }
}

impl Drop for CowBundle {
    fn drop(&mut self) {
        let pages = self.pages.lock();
        for page in pages.values() {
            if let CowPage::Present(page) = page {
                self.ctx.allocator().free(*page, PAGE_SIZE);
            }
        }
    }
}
