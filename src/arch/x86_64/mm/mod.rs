// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod paging;
pub mod physicalmem;

pub use x86_64::{PhysAddr, VirtAddr};

/// Base of the higher-half window through which the loader exposes
/// physical memory one-to-one.
pub const PHYS_OFFSET: u64 = 0xFFFF_8000_0000_0000;

/// Bottom of the kernel heap's virtual range.
pub const HEAP_START: u64 = 0xFFFF_9000_0000_0000;

#[inline]
pub fn phys_to_virt(address: PhysAddr) -> VirtAddr {
	VirtAddr::new(address.as_u64() + PHYS_OFFSET)
}
