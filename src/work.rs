// SPDX-License-Identifier: MPL-2.0

//! Deferred completion delivery.
//!
//! All asynchrony in this crate is expressed through caller-allocated work
//! nodes whose continuations are posted as [`Worklet`]s. No operation blocks
//! the calling thread, and no completion runs while a core lock is held.

use crate::prelude::*;

/// A single-shot unit of deferred work.
pub struct Worklet(Box<dyn FnOnce() + Send>);

impl Worklet {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    /// Runs the worklet. Invoked by the work queue implementation.
    pub fn run(self) {
        (self.0)()
    }
}

impl Debug for Worklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Worklet")
    }
}

/// The work queue the core posts completions to.
///
/// Implementations deliver each worklet exactly once, on the calling or
/// another CPU, after the posting call has returned.
pub trait WorkQueue: Send + Sync {
    fn post(&self, worklet: Worklet);
}
