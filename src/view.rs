// SPDX-License-Identifier: MPL-2.0

//! Virtual views.
//!
//! A view is an immutable, shared, windowed projection of a bundle. Mappings
//! reach their backing memory exclusively through a view, so one bundle can
//! appear at several window offsets in several address spaces.

use crate::{bundle::MemoryBundle, prelude::*};

/// Resolves view-relative ranges to a bundle and bundle-relative offsets.
pub trait VirtualView: Send + Sync {
    /// Returns `(bundle, bundle_offset, usable_size)` for the given range.
    ///
    /// `usable_size` is positive and at most `size`; callers iterate for
    /// ranges crossing the window end. Out-of-window offsets fail
    /// `BadAddress`.
    fn resolve_range(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<(Arc<dyn MemoryBundle>, usize, usize)>;
}

/// The standard view: a `(bundle, offset, size)` window.
pub struct ExteriorBundleView {
    bundle: Arc<dyn MemoryBundle>,
    view_offset: usize,
    view_size: usize,
}

impl ExteriorBundleView {
    pub fn new(bundle: Arc<dyn MemoryBundle>, view_offset: usize, view_size: usize) -> Arc<Self> {
        Arc::new(Self {
            bundle,
            view_offset,
            view_size,
        })
    }
}

impl VirtualView for ExteriorBundleView {
    fn resolve_range(
        &self,
        offset: usize,
        size: usize,
    ) -> Result<(Arc<dyn MemoryBundle>, usize, usize)> {
        if offset >= self.view_size || size == 0 {
            return_errno_with_msg!(Errno::BadAddress, "range outside view window");
        }
        let usable = size.min(self.view_size - offset);
        Ok((self.bundle.clone(), self.view_offset + offset, usable))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{bundle::AllocatedMemory, test_util::test_ctx};

    #[test]
    fn test_resolve_window() {
        let (ctx, _phys, _queue) = test_ctx();
        let mem = AllocatedMemory::new(ctx, 4 * PAGE_SIZE);
        let view = ExteriorBundleView::new(mem, PAGE_SIZE, 2 * PAGE_SIZE);

        let (_, off, usable) = view.resolve_range(0, PAGE_SIZE).unwrap();
        assert_eq!((off, usable), (PAGE_SIZE, PAGE_SIZE));

        // Clamped at the window end.
        let (_, off, usable) = view.resolve_range(PAGE_SIZE, 4 * PAGE_SIZE).unwrap();
        assert_eq!((off, usable), (2 * PAGE_SIZE, PAGE_SIZE));

        assert_eq!(
            view.resolve_range(2 * PAGE_SIZE, 1).unwrap_err().errno(),
            Errno::BadAddress
        );
    }
}
