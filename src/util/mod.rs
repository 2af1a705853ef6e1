// SPDX-License-Identifier: MPL-2.0

mod checksum;

pub use checksum::Checksum;
