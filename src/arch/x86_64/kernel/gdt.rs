// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::boxed::Box;
use core::ptr;

use x86_64::VirtAddr;
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::{CS, DS, ES, SS, Segment};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

use super::core_local::CoreLocal;
use crate::config::{IST_STACK_SIZE, KERNEL_STACK_SIZE};

/// Selector values produced by the fixed descriptor order below.
pub const KERNEL_CODE: u64 = 0x08;
pub const KERNEL_DATA: u64 = 0x10;
pub const USER_DATA: u64 = 0x18 | 3;
pub const USER_CODE: u64 = 0x20 | 3;

/// Allocate the guarded stacks a CPU needs: the main kernel stack and
/// the two IST stacks for page fault and double fault.
pub fn allocate_cpu_stacks(core: &CoreLocal) {
	let stack = crate::mm::allocate_guarded(KERNEL_STACK_SIZE, 16);
	core.kernel_stack_top
		.set((stack as u64 + KERNEL_STACK_SIZE as u64) & !0xF);

	let page_fault = crate::mm::allocate_guarded(IST_STACK_SIZE, 16);
	core.page_fault_stack_top
		.set((page_fault as u64 + IST_STACK_SIZE as u64) & !0xF);

	let double_fault = crate::mm::allocate_guarded(IST_STACK_SIZE, 16);
	core.double_fault_stack_top
		.set((double_fault as u64 + IST_STACK_SIZE as u64) & !0xF);
}

/// Build this CPU's GDT and TSS, load them and reload the segment
/// registers. Every CPU gets its own pair; the descriptor order is what
/// pins the selector constants above.
pub fn add_current_core(core: &CoreLocal) {
	let mut tss = Box::new(TaskStateSegment::new());
	tss.privilege_stack_table[0] = VirtAddr::new(core.kernel_stack_top.get());
	tss.interrupt_stack_table[0] = VirtAddr::new(core.page_fault_stack_top.get());
	tss.interrupt_stack_table[1] = VirtAddr::new(core.double_fault_stack_top.get());
	let tss = Box::leak(tss);
	core.tss.set(ptr::from_mut(tss));

	let mut gdt = Box::new(GlobalDescriptorTable::new());
	let kernel_code = gdt.append(Descriptor::kernel_code_segment());
	let kernel_data = gdt.append(Descriptor::kernel_data_segment());
	let user_data = gdt.append(Descriptor::user_data_segment());
	let user_code = gdt.append(Descriptor::user_code_segment());
	let tss_selector = gdt.append(Descriptor::tss_segment(tss));
	let gdt = Box::leak(gdt);
	core.gdt.set(ptr::from_mut(gdt));

	debug_assert_eq!(u64::from(kernel_code.0), KERNEL_CODE);
	debug_assert_eq!(u64::from(kernel_data.0), KERNEL_DATA);
	debug_assert_eq!(u64::from(user_data.0), USER_DATA);
	debug_assert_eq!(u64::from(user_code.0), USER_CODE);

	gdt.load();
	unsafe {
		CS::set_reg(kernel_code);
		SS::set_reg(kernel_data);
		DS::set_reg(kernel_data);
		ES::set_reg(kernel_data);
		load_tss(tss_selector);
	}
}
