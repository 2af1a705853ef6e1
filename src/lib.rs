// SPDX-License-Identifier: MPL-2.0

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

//! User-space virtual memory for the Corvus microkernel.
//!
//! The crate owns per-process address spaces and everything they map:
//!
//!  * **Memory bundles** provide physical pages for ranges of offsets —
//!    fixed hardware windows, lazily allocated anonymous memory, externally
//!    paged managed spaces and chained copy-on-write overlays — behind one
//!    asynchronous fetch interface.
//!  * **Views** project a window of a bundle into address-space
//!    coordinates.
//!  * **Address spaces** keep holes and mappings in trees that partition
//!    the user range, resolve page faults by fetching from bundles, fork
//!    with per-mapping dispositions and grant cross-space access through
//!    accessors.
//!
//! Nothing here blocks: operations either complete synchronously or
//! complete a caller-allocated node through the work queue. The physical
//! allocator, machine page table and work queue are external collaborators
//! passed in as typed interfaces.

extern crate alloc;

mod error;
mod prelude;
#[cfg(test)]
mod test_util;

pub mod bundle;
pub mod page_space;
pub mod phys;
pub mod space;
pub mod util;
pub mod view;
pub mod work;

pub use self::{
    error::{Errno, Error},
    phys::{Paddr, Vaddr, PAGE_SIZE},
};

/// A specialized [`Result`] type for this crate.
///
/// [`Result`]: core::result::Result
pub type Result<T> = core::result::Result<T, Error>;
