// SPDX-License-Identifier: MPL-2.0

use core::fmt;

/// The error kinds surfaced by the virtual memory subsystem.
///
/// Errors surface only at the completion of a top-level work node; failures
/// inside an asynchronous chain short-circuit the chain and land here.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// A caller-provided region is too small for the requested operation.
    BufferTooSmall,
    /// A virtual address is not covered by any mapping, is unaligned, or
    /// falls outside a view's window.
    BadAddress,
    /// The physical or virtual allocator is exhausted.
    OutOfMemory,
    /// Fault flags are incompatible with the mapping's protection.
    AccessDenied,
    /// An unrecoverable internal violation.
    Fault,
    /// The user-space pager of a managed space is unreachable.
    PagerGone,
}

/// An error type with an error kind and an optional static message.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates a new error with the given kind and no message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Creates a new error with the given kind and message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    /// Returns the error kind.
    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return core::result::Result::Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno: expr, $msg: expr) => {
        return core::result::Result::Err($crate::Error::with_msg($errno, $msg))
    };
}
