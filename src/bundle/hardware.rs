// SPDX-License-Identifier: MPL-2.0

use super::{FetchNode, MemoryBundle};
use crate::prelude::*;

/// A bundle backed by a fixed, contiguous physical window.
///
/// Offsets translate one-to-one onto `[base, base + length)`; nothing is
/// ever allocated or released, and both operations complete synchronously.
pub struct HardwareMemory {
    base: Paddr,
    length: usize,
}

impl HardwareMemory {
    pub fn new(base: Paddr, length: usize) -> Arc<Self> {
        assert_eq!(base as usize % PAGE_SIZE, 0);
        assert_eq!(length % PAGE_SIZE, 0);
        Arc::new(Self { base, length })
    }
}

impl MemoryBundle for HardwareMemory {
    fn length(&self) -> usize {
        self.length
    }

    fn peek_range(&self, offset: usize) -> Option<Paddr> {
        if offset >= self.length {
            return None;
        }
        Some(self.base + offset as Paddr)
    }

    fn fetch_range(&self, offset: usize, node: &Arc<FetchNode>) -> Result<bool> {
        if offset >= self.length {
            return_errno_with_msg!(Errno::BadAddress, "offset outside hardware window");
        }
        node.complete_sync(Ok((self.base + offset as Paddr, self.length - offset)));
        Ok(true)
    }
}
