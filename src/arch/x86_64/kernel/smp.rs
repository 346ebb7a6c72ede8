// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Application processor bringup.
//!
//! APs wake up in 16-bit real mode at a fixed low page. The trampoline
//! below is assembled into the kernel image and copied there at boot;
//! three quadword slots at fixed offsets are patched with the 64-bit
//! entry point, the stack for the AP being booted, and the kernel PML4.
//! The boot processor then walks the firmware CPU list and pulls each AP
//! up with INIT - SIPI - SIPI, waiting for it to come online before
//! booting the next one.

use core::arch::global_asm;
#[cfg(target_os = "none")]
use core::ptr;
#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicPtr, Ordering};

#[cfg(target_os = "none")]
use super::core_local::{CPU_ONLINE, CoreLocal, record_function};
#[cfg(target_os = "none")]
use super::{acpi, apic, gdt, processor};
#[cfg(target_os = "none")]
use crate::arch::mm::physicalmem::FRAME_SIZE;
#[cfg(target_os = "none")]
use crate::arch::mm::{PhysAddr, paging, phys_to_virt};

/// Physical page the trampoline is copied to. The SIPI vector is this
/// address shifted down by 12.
pub const TRAMPOLINE_PHYSICAL: u64 = 0x8000;

const TRAMPOLINE_ENTRY_OFFSET: usize = 0x08;
const TRAMPOLINE_STACK_OFFSET: usize = 0x10;
const TRAMPOLINE_PML4_OFFSET: usize = 0x18;

// The real-mode payload. Written position-dependent for its one load
// address: every absolute reference is `label - start + 0x8000`.
global_asm!(
	r#"
	.section .text
	.global ap_trampoline_start
	.global ap_trampoline_end
ap_trampoline_start:
	.code16
	cli
	cld
	// Short jump to 4f at 0x20, encoded by hand so the patch slots
	// below stay at their fixed offsets.
	.byte 0xEB, 0x1C
	.space 4
	// Patched slots: entry point, stack top, PML4 physical base.
	.quad 0
	.quad 0
	.quad 0
4:
	movw %cs, %ax
	movw %ax, %ds
	movw %ax, %ss

	// Physical address extension on, kernel page tables in, long mode
	// armed, then paging and protection in one store.
	movl %cr4, %eax
	orl $(1 << 5), %eax
	movl %eax, %cr4

	movl (0x18), %edx
	movl %edx, %cr3

	movl $0xC0000080, %ecx
	rdmsr
	orl $(1 << 8), %eax
	wrmsr

	lgdtl (6f - ap_trampoline_start)

	movl %cr0, %eax
	orl $0x80000001, %eax
	movl %eax, %cr0

	ljmpl $0x08, $(2f - ap_trampoline_start + 0x8000)

	.code64
2:
	movw $0x10, %ax
	movw %ax, %ds
	movw %ax, %es
	movw %ax, %ss

	movq (0x8000 + 0x10), %rsp
	movq (0x8000 + 0x08), %rax
	callq *%rax
3:
	hlt
	jmp 3b

	.balign 8
6:
	.short 23
	.long (7f - ap_trampoline_start + 0x8000)
7:
	.quad 0
	.quad 0x00209A0000000000
	.quad 0x0000920000000000
ap_trampoline_end:
	"#,
	options(att_syntax)
);

unsafe extern "C" {
	static ap_trampoline_start: u8;
	static ap_trampoline_end: u8;
}

/// The CPU record of the AP currently being booted; the bringup is
/// strictly serial, so one slot suffices.
#[cfg(target_os = "none")]
static BOOTING_CORE: AtomicPtr<CoreLocal> = AtomicPtr::new(ptr::null_mut());

/// First Rust code on an AP, entered from the trampoline with paging
/// live and a fresh kernel stack.
#[cfg(target_os = "none")]
extern "C" fn ap_main() -> ! {
	let core = unsafe { &*BOOTING_CORE.load(Ordering::Acquire) };
	crate::arch::kernel::application_processor_init(core);
	crate::scheduler::schedule()
}

#[cfg(target_os = "none")]
fn install_trampoline() {
	record_function("install_trampoline");

	let (start, end) = unsafe {
		(
			&raw const ap_trampoline_start,
			&raw const ap_trampoline_end,
		)
	};
	let length = end as usize - start as usize;
	assert!(length <= FRAME_SIZE, "AP trampoline larger than a page");
	debug!("AP trampoline is {length} bytes long");

	// The AP runs at the trampoline's linear address once paging is on,
	// so the page must be identity-mapped in the kernel tables.
	if paging::translate(TRAMPOLINE_PHYSICAL) == PhysAddr::zero() {
		paging::ensure_kernel_tables(TRAMPOLINE_PHYSICAL)
			.expect("cannot build trampoline page tables");
		let mut flags = paging::PageTableEntryFlags::PRESENT;
		flags.writable();
		paging::map(TRAMPOLINE_PHYSICAL, PhysAddr::new(TRAMPOLINE_PHYSICAL), flags)
			.expect("trampoline page already mapped");
	}

	let destination = phys_to_virt(PhysAddr::new(TRAMPOLINE_PHYSICAL)).as_mut_ptr::<u8>();
	unsafe {
		ptr::copy_nonoverlapping(start, destination, length);
		destination
			.add(TRAMPOLINE_ENTRY_OFFSET)
			.cast::<u64>()
			.write_volatile(ap_main as usize as u64);
		destination
			.add(TRAMPOLINE_PML4_OFFSET)
			.cast::<u64>()
			.write_volatile(processor::root_page_table());
	}
}

/// Boot every application processor listed by the firmware tables.
#[cfg(target_os = "none")]
pub fn boot_application_processors() {
	record_function("boot_application_processors");

	let lapics = acpi::detect_lapic_ids();
	info!("firmware tables list {} CPUs", lapics.count);
	if lapics.count <= 1 {
		return;
	}

	install_trampoline();

	let bsp_lapic_id = CoreLocal::get().lapic_id.get();
	let mut next_core_id = 1;

	for &apic_id in &lapics.ids[..lapics.count] {
		if apic_id == bsp_lapic_id {
			continue;
		}

		let core = CoreLocal::prepare(next_core_id, apic_id);
		next_core_id += 1;
		gdt::allocate_cpu_stacks(core);

		let destination = phys_to_virt(PhysAddr::new(TRAMPOLINE_PHYSICAL)).as_mut_ptr::<u8>();
		unsafe {
			destination
				.add(TRAMPOLINE_STACK_OFFSET)
				.cast::<u64>()
				.write_volatile(core.kernel_stack_top.get());
		}
		BOOTING_CORE.store(ptr::from_ref(core).cast_mut(), Ordering::Release);
		processor::store_fence();

		debug!(
			"waking CPU {} with Local APIC ID {apic_id}",
			core.core_id()
		);
		let online_before = CPU_ONLINE.load(Ordering::Acquire);
		apic::send_init_sipi(apic_id, (TRAMPOLINE_PHYSICAL >> 12) as u8);

		// The AP announces itself by counting up the online CPUs.
		while CPU_ONLINE.load(Ordering::Acquire) == online_before {
			processor::pause();
		}
	}

	info!("{} CPUs online", CPU_ONLINE.load(Ordering::Acquire));
}
