// SPDX-License-Identifier: MPL-2.0

#![allow(unused)]

pub(crate) use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};
pub(crate) use core::fmt::{self, Debug};
pub(crate) use core::ops::Range;

pub(crate) use align_ext::AlignExt;
pub(crate) use bitflags::bitflags;
pub(crate) use log::{debug, trace, warn};

pub(crate) use crate::{
    error::{Errno, Error},
    phys::{Paddr, Vaddr, PAGE_SIZE},
    return_errno, return_errno_with_msg,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

pub(crate) type Mutex<T> = spin::mutex::TicketMutex<T>;
