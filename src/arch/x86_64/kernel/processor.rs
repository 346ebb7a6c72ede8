// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin wrappers around the CPU instructions the rest of the kernel needs.

#![allow(dead_code)]

use core::arch::asm;
use core::sync::atomic::{Ordering, compiler_fence};

use raw_cpuid::CpuId;
use x86_64::VirtAddr;
use x86_64::instructions::interrupts;
use x86_64::instructions::tlb;
use x86_64::registers::control::{Cr2, Cr3};
use x86_64::registers::model_specific::Msr;

#[inline]
pub fn pause() {
	core::hint::spin_loop();
}

#[inline]
pub fn halt() {
	if cfg!(target_os = "none") {
		x86_64::instructions::hlt();
	}
}

/// Disable interrupts forever and stop this CPU.
pub fn shutdown() -> ! {
	loop {
		if cfg!(target_os = "none") {
			interrupts::disable();
			x86_64::instructions::hlt();
		}
		pause();
	}
}

#[inline]
pub fn enable_interrupts() {
	if cfg!(target_os = "none") {
		interrupts::enable();
	}
}

#[inline]
pub fn disable_interrupts() {
	if cfg!(target_os = "none") {
		interrupts::disable();
	}
}

/// Disable interrupts and report whether they were enabled before.
#[inline]
pub fn disable_interrupts_save() -> bool {
	if cfg!(target_os = "none") {
		let enabled = interrupts::are_enabled();
		interrupts::disable();
		enabled
	} else {
		false
	}
}

/// Restore the interrupt flag saved by [`disable_interrupts_save`].
#[inline]
pub fn restore_interrupts(was_enabled: bool) {
	if was_enabled {
		enable_interrupts();
	}
}

/// Write the task-priority register.
///
/// CR8 holds the upper four bits of the lowest interrupt vector class that
/// is still delivered to this CPU.
#[inline]
pub unsafe fn write_task_priority(tpr: u64) {
	if cfg!(target_os = "none") {
		unsafe {
			asm!("mov cr8, {}", in(reg) tpr, options(nomem, nostack, preserves_flags));
		}
	}
}

#[inline]
pub fn read_page_fault_address() -> VirtAddr {
	Cr2::read().unwrap_or(VirtAddr::zero())
}

/// Physical base address of the root page table of this CPU.
#[inline]
pub fn root_page_table() -> u64 {
	let (frame, _flags) = Cr3::read();
	frame.start_address().as_u64()
}

/// Reload CR3 with its current value, invalidating all non-global TLB
/// entries of this CPU.
#[inline]
pub fn flush_tlb_all() {
	if cfg!(target_os = "none") {
		tlb::flush_all();
	}
}

/// Invalidate the TLB entry for a single virtual address on this CPU.
#[inline]
pub fn invalidate_tlb_entry(address: VirtAddr) {
	if cfg!(target_os = "none") {
		tlb::flush(address);
	}
}

/// Order all prior stores before any later store, visible to other CPUs.
#[inline]
pub fn store_fence() {
	compiler_fence(Ordering::SeqCst);
	if cfg!(target_os = "none") {
		unsafe {
			asm!("sfence", options(nostack, preserves_flags));
		}
	}
}

#[inline]
pub unsafe fn rdmsr(msr: u32) -> u64 {
	unsafe { Msr::new(msr).read() }
}

#[inline]
pub unsafe fn wrmsr(msr: u32, value: u64) {
	unsafe {
		Msr::new(msr).write(value);
	}
}

pub fn supports_x2apic() -> bool {
	CpuId::new()
		.get_feature_info()
		.is_some_and(|f| f.has_x2apic())
}

pub fn supports_tsc_deadline() -> bool {
	CpuId::new()
		.get_feature_info()
		.is_some_and(|f| f.has_tsc_deadline())
}

/// Busy-wait for the given number of milliseconds using the PIT.
pub fn mdelay(milliseconds: u64) {
	super::pit::wait(milliseconds);
}
