// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The global kernel heap.
//!
//! One heap for the whole kernel, guarded by a single spinlock and grown
//! upward one frame at a time. Corruption detected on free is fatal;
//! exhaustion of physical memory while growing is fatal too.

pub(crate) mod allocator;

#[cfg(target_os = "none")]
use core::alloc::{GlobalAlloc, Layout};

use self::allocator::{BlockKind, FreedBlock, Heap, HeapError};
use crate::arch::kernel::core_local::record_function;
use crate::arch::mm::paging::{self, PageTableEntryFlags};
use crate::arch::mm::PhysAddr;
#[cfg(target_os = "none")]
use crate::arch::mm::HEAP_START;
use crate::arch::mm::physicalmem::{self, FRAME_SIZE};
use crate::bugcheck::{self, AdditionalInfo, StopCode, guard_registry};
use crate::synch::spinlock::Spinlock;

static KERNEL_HEAP: Spinlock<Heap> = Spinlock::new(Heap::empty());

/// Map the first heap frame and hand it to the allocator.
#[cfg(target_os = "none")]
pub fn init() {
	record_function("mm::init");

	let frame = physicalmem::allocate_frame();
	if frame == PhysAddr::zero() {
		bugcheck::bugcheck(StopCode::MemoryLimitReached, 0);
	}
	let mut flags = PageTableEntryFlags::PRESENT;
	flags.writable();
	paging::map(HEAP_START, frame, flags).expect("heap base already mapped");

	let mut heap = KERNEL_HEAP.lock();
	unsafe {
		heap.init(HEAP_START as usize, FRAME_SIZE);
	}
	info!("kernel heap at {HEAP_START:#x}");
}

/// Current extent of the heap, for diagnostic classification.
pub fn heap_range() -> (u64, u64) {
	let heap = KERNEL_HEAP.lock();
	(heap.start() as u64, heap.end() as u64)
}

/// Map one fresh frame at the current heap end. Fatal when physical
/// memory is exhausted, because the kernel cannot make progress.
fn grow_one_page(heap: &mut Heap) {
	let frame = physicalmem::allocate_frame();
	if frame == PhysAddr::zero() {
		bugcheck::bugcheck(StopCode::MemoryLimitReached, heap.end() as u64);
	}
	if paging::ensure_kernel_tables(heap.end() as u64).is_err() {
		bugcheck::bugcheck(StopCode::MemoryLimitReached, heap.end() as u64);
	}
	let mut flags = PageTableEntryFlags::PRESENT;
	flags.writable();
	if paging::map(heap.end() as u64, frame, flags).is_err() {
		bugcheck::bugcheck_ex(
			StopCode::BadPaging,
			&AdditionalInfo::with_message(format_args!(
				"heap growth collided with an existing mapping at {:#x}",
				heap.end()
			)),
		);
	}
	unsafe {
		heap.extend(FRAME_SIZE);
	}
}

/// Allocate `size` bytes with the given alignment from the kernel heap.
///
/// Never returns null for sane requests; the heap grows until the
/// request fits or physical memory runs out (which is fatal).
pub fn allocate(size: usize, align: usize) -> *mut u8 {
	record_function("mm::allocate");

	let mut heap = KERNEL_HEAP.lock();
	loop {
		match heap.allocate(size, align) {
			Ok(pointer) => return pointer,
			Err(HeapError::NoFit) => {
				let needed = (size + align + 64).div_ceil(FRAME_SIZE).max(1);
				for _ in 0..needed {
					grow_one_page(&mut heap);
				}
			}
			Err(_) => unreachable!(),
		}
	}
}

/// Allocate a dedicated page range mapped with the given entry flags
/// (e.g. cache-disable for device buffers). The range never enters the
/// free list and is unmapped as a whole on free.
pub fn allocate_ex(size: usize, align: usize, extra_flags: PageTableEntryFlags) -> *mut u8 {
	record_function("mm::allocate_ex");

	let total = size + size_of::<usize>() * 8 + align;
	let pages = total.div_ceil(FRAME_SIZE);

	let mut heap = KERNEL_HEAP.lock();
	let base = heap.reserve(pages * FRAME_SIZE);
	for page in 0..pages {
		let frame = physicalmem::allocate_frame();
		if frame == PhysAddr::zero() {
			bugcheck::bugcheck(StopCode::MemoryLimitReached, base as u64);
		}
		let va = (base + page * FRAME_SIZE) as u64;
		if paging::ensure_kernel_tables(va).is_err() {
			bugcheck::bugcheck(StopCode::MemoryLimitReached, va);
		}
		let mut flags = PageTableEntryFlags::PRESENT | extra_flags;
		flags.writable();
		paging::map(va, frame, flags)
			.expect("dedicated region collided with an existing mapping");
	}

	unsafe { heap.format_block(base, pages * FRAME_SIZE, BlockKind::Region, size, align) }
}

/// Allocate a page range bracketed by guard pages on both sides.
///
/// The guard pages stay unmapped but their ranges are registered, so a
/// touch is classified as a guard-page dereference instead of a stray
/// fault.
pub fn allocate_guarded(size: usize, align: usize) -> *mut u8 {
	record_function("mm::allocate_guarded");

	let total = size + size_of::<usize>() * 8 + align;
	let pages = total.div_ceil(FRAME_SIZE);

	let mut heap = KERNEL_HEAP.lock();
	let low_guard = heap.reserve(FRAME_SIZE);
	let base = heap.reserve(pages * FRAME_SIZE);
	let high_guard = heap.reserve(FRAME_SIZE);

	for page in 0..pages {
		let frame = physicalmem::allocate_frame();
		if frame == PhysAddr::zero() {
			bugcheck::bugcheck(StopCode::MemoryLimitReached, base as u64);
		}
		let va = (base + page * FRAME_SIZE) as u64;
		if paging::ensure_kernel_tables(va).is_err() {
			bugcheck::bugcheck(StopCode::MemoryLimitReached, va);
		}
		let mut flags = PageTableEntryFlags::PRESENT;
		flags.writable();
		paging::map(va, frame, flags)
			.expect("guarded region collided with an existing mapping");
	}

	guard_registry::register(low_guard as u64, FRAME_SIZE as u64);
	guard_registry::register(high_guard as u64, FRAME_SIZE as u64);

	unsafe { heap.format_block(base, pages * FRAME_SIZE, BlockKind::Guarded, size, align) }
}

/// Release a block obtained from any of the allocation entry points.
///
/// Validation failures are invariant violations and therefore fatal.
pub fn deallocate(pointer: *mut u8) {
	if pointer.is_null() {
		return;
	}
	record_function("mm::deallocate");

	let mut heap = KERNEL_HEAP.lock();
	let freed = unsafe { heap.deallocate(pointer) };
	match freed {
		Ok(FreedBlock::Normal) => {}
		Ok(FreedBlock::Region { base, size }) => {
			for page in (base..base + size).step_by(FRAME_SIZE) {
				paging::unmap(page as u64);
			}
		}
		Ok(FreedBlock::Guarded { base, size }) => {
			for page in (base..base + size).step_by(FRAME_SIZE) {
				paging::unmap(page as u64);
			}
			guard_registry::unregister(base as u64 - FRAME_SIZE as u64);
			guard_registry::unregister((base + size) as u64);
		}
		Err(error) => {
			let code = match error {
				HeapError::OutOfRange => StopCode::MemoryInvalidFree,
				HeapError::BadBackPointer | HeapError::CorruptHeader { .. } => {
					StopCode::MemoryCorruptHeader
				}
				HeapError::DoubleFree { .. } => StopCode::MemoryDoubleFree,
				HeapError::CorruptFooter { .. } => StopCode::MemoryCorruptFooter,
				HeapError::NoFit => unreachable!(),
			};
			bugcheck::bugcheck_ex(
				code,
				&AdditionalInfo::with_message(format_args!("{error}"))
					.pointer(error.header_address()),
			);
		}
	}
}

#[cfg(target_os = "none")]
struct KernelAllocator;

#[cfg(target_os = "none")]
unsafe impl GlobalAlloc for KernelAllocator {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		allocate(layout.size().max(1), layout.align())
	}

	unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
		deallocate(ptr);
	}
}

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;
