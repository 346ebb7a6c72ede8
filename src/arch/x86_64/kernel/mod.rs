// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub mod acpi;
pub mod apic;
pub mod core_local;
pub mod gdt;
pub mod idt;
pub mod interrupts;
pub mod irql;
pub mod pic;
pub mod pit;
pub mod processor;
#[cfg(feature = "smp")]
pub mod smp;
pub mod switch;

#[cfg(any(target_os = "none", feature = "smp"))]
use core::sync::atomic::Ordering;

use hermit_sync::OnceCell;

#[cfg(any(target_os = "none", feature = "smp"))]
use self::core_local::{CPU_ONLINE, CoreLocal};

/// The structure the loader hands over at entry.
///
/// The memory map follows the firmware layout and is only interpreted as
/// far as [`MemoryDescriptor`] requires.
#[repr(C)]
#[derive(Debug)]
pub struct BootInfo {
	pub framebuffer_base: u64,
	pub framebuffer_width: u32,
	pub framebuffer_height: u32,
	pub pixels_per_scanline: u32,
	_reserved: u32,
	pub memory_map: u64,
	pub memory_map_size: u64,
	pub descriptor_size: u64,
	pub pml4_physical: u64,
	pub ahci_bars: [u64; 8],
}

/// A firmware memory-map descriptor.
///
/// Entries in the map are `descriptor_size` bytes apart, which may be
/// larger than this structure.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryDescriptor {
	pub kind: u32,
	_padding: u32,
	pub physical_start: u64,
	pub virtual_start: u64,
	pub page_count: u64,
	pub attribute: u64,
}

impl MemoryDescriptor {
	pub const CONVENTIONAL: u32 = 7;
	pub const LOADER_DATA: u32 = 2;

	pub fn is_conventional(&self) -> bool {
		self.kind == Self::CONVENTIONAL
	}
}

/// Iterator over the loader memory map, honoring the descriptor stride.
#[derive(Clone)]
pub struct MemoryMap {
	current: u64,
	end: u64,
	stride: u64,
}

impl MemoryMap {
	/// # Safety
	///
	/// `base` must point to `size` bytes of firmware memory descriptors
	/// with the given stride.
	pub unsafe fn new(base: u64, size: u64, stride: u64) -> Self {
		Self {
			current: base,
			end: base + size,
			stride,
		}
	}
}

impl Iterator for MemoryMap {
	type Item = &'static MemoryDescriptor;

	fn next(&mut self) -> Option<Self::Item> {
		if self.current + self.stride > self.end {
			return None;
		}
		let descriptor = unsafe { &*(self.current as *const MemoryDescriptor) };
		self.current += self.stride;
		Some(descriptor)
	}
}

static BOOT_INFO: OnceCell<&'static BootInfo> = OnceCell::new();

pub fn boot_info() -> &'static BootInfo {
	BOOT_INFO.get().expect("boot info not registered yet")
}

pub fn memory_map() -> MemoryMap {
	let info = boot_info();
	unsafe { MemoryMap::new(info.memory_map, info.memory_map_size, info.descriptor_size) }
}

pub fn get_processor_count() -> u32 {
	core_local::prepared_core_count()
}

/// Initialize the boot processor up to the point where the scheduler can
/// take over.
#[cfg(target_os = "none")]
pub fn boot_processor_init(boot_info: &'static BootInfo) {
	BOOT_INFO.set(boot_info).unwrap();

	crate::console::init();
	unsafe {
		crate::logging::init();
	}

	let core = CoreLocal::prepare(0, apic::boot_lapic_id());
	unsafe {
		core.install();
	}
	irql::set(irql::Irql::PASSIVE);

	crate::arch::mm::physicalmem::init();
	crate::arch::mm::paging::init();
	crate::mm::init();

	gdt::allocate_cpu_stacks(core);
	gdt::add_current_core(core);
	idt::install();
	interrupts::install_handlers();
	pic::init();

	apic::init();

	crate::scheduler::init_core(core);

	core.online.store(true, Ordering::Release);
	CPU_ONLINE.fetch_add(1, Ordering::AcqRel);
}

/// Entered by every application processor after the trampoline.
#[cfg(feature = "smp")]
pub fn application_processor_init(core: &'static CoreLocal) {
	unsafe {
		core.install();
	}
	irql::set(irql::Irql::PASSIVE);

	gdt::add_current_core(core);
	idt::install();
	processor::flush_tlb_all();

	apic::init_x2apic();
	apic::init_local_apic();
	crate::scheduler::init_core(core);

	core.online.store(true, Ordering::Release);
	CPU_ONLINE.fetch_add(1, Ordering::AcqRel);

	apic::start_timer();
	processor::enable_interrupts();
}
