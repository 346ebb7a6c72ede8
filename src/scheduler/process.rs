// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process records and process creation.

use alloc::boxed::Box;
use alloc::string::String;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use super::task::{self, IdPool, Thread, ThreadQueue, ThreadState};
use crate::arch::kernel::core_local::{CoreLocal, record_function};
use crate::arch::kernel::irql::{self, Irql};
use crate::arch::mm::paging::{AddressSpace, PageTableEntryFlags, translate};
use crate::config::{DEFAULT_TIMESLICE_TICKS, USER_IMAGE_BASE, USER_STACK_AREA_TOP};
use crate::status::{Result, Status};
use crate::synch::spinlock::Spinlock;

pub type ProcessId = u32;

const PAGE_SIZE: usize = 4096;

bitflags! {
	/// Coarse process lifecycle bits.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ProcessState: u32 {
		const RUNNING = 1 << 0;
		const TERMINATING = 1 << 1;
		const ZOMBIE = 1 << 2;
	}
}

/// Fields that change after creation, under the process lock.
pub struct ProcessInner {
	pub address_space: AddressSpace,
	pub main_thread: *mut Thread,
	pub threads: ThreadQueue,
	pub thread_count: u32,
	/// Bump pointer for user stacks; grows downward, one guard page
	/// between neighbours.
	pub next_stack_top: u64,
}

unsafe impl Send for ProcessInner {}

pub struct Process {
	pub id: ProcessId,
	pub parent_id: ProcessId,
	pub name: String,
	state: AtomicU32,
	/// Tick count at creation.
	pub created_at: u64,
	pub image_base: u64,
	/// Kernel buffer holding the raw image file.
	pub file_buffer: *mut u8,
	pub file_size: usize,
	pub inner: Spinlock<ProcessInner>,
}

unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
	pub fn state(&self) -> ProcessState {
		ProcessState::from_bits_truncate(self.state.load(Ordering::Acquire))
	}

	pub fn set_state_bits(&self, bits: ProcessState) {
		self.state.fetch_or(bits.bits(), Ordering::AcqRel);
	}
}

static PID_POOL: Spinlock<IdPool<1024>> = Spinlock::new(IdPool::new(4, 4));

/// The process owning all pure kernel threads.
static SYSTEM_PROCESS: AtomicPtr<Process> = AtomicPtr::new(ptr::null_mut());

pub(crate) fn system_process() -> *const Process {
	SYSTEM_PROCESS.load(Ordering::Acquire)
}

/// Create the system process. Must run once before the first kernel
/// thread is spawned; its address space is the kernel's own.
#[cfg(target_os = "none")]
pub fn init_system_process() {
	record_function("init_system_process");

	let pid = PID_POOL.lock().allocate();
	let process = Box::new(Process {
		id: pid,
		parent_id: 0,
		name: String::from("system"),
		state: AtomicU32::new(ProcessState::RUNNING.bits()),
		created_at: crate::scheduler::tick_count(),
		image_base: 0,
		file_buffer: ptr::null_mut(),
		file_size: 0,
		inner: Spinlock::new(ProcessInner {
			address_space: AddressSpace::kernel(),
			main_thread: ptr::null_mut(),
			threads: ThreadQueue::new(),
			thread_count: 0,
			next_stack_top: USER_STACK_AREA_TOP,
		}),
	});
	SYSTEM_PROCESS.store(Box::into_raw(process), Ordering::Release);
}

/// Create a user process from an image file.
///
/// The image is read through the VFS into a kernel buffer, mapped
/// page by page at the fixed image base of a fresh address space, and
/// the main thread is created and enqueued here.
pub fn create_process(path: &str, name: &str) -> Result<*mut Process> {
	record_function("create_process");
	irql::enforce_max(Irql::DISPATCH);

	let pid = PID_POOL.lock().allocate();
	if pid == 0 {
		return Err(Status::NoResources);
	}

	let mut address_space = AddressSpace::new()?;

	let image = crate::fs::read(path)?;
	let file_size = image.len();
	// Page-aligned copy so whole pages can be handed to the user space.
	let file_buffer = crate::mm::allocate(file_size.next_multiple_of(PAGE_SIZE), PAGE_SIZE);
	unsafe {
		ptr::copy_nonoverlapping(image.as_ptr(), file_buffer, file_size);
	}
	drop(image);

	let mut flags = PageTableEntryFlags::PRESENT;
	flags.writable().user();
	for offset in (0..file_size.next_multiple_of(PAGE_SIZE)).step_by(PAGE_SIZE) {
		let phys = translate(file_buffer as u64 + offset as u64);
		address_space.map(USER_IMAGE_BASE + offset as u64, phys, flags)?;
	}

	let parent = task::current_thread();
	let parent_id = if parent.is_null() {
		0
	} else {
		unsafe { (*(*parent).process).id }
	};

	let process = Box::into_raw(Box::new(Process {
		id: pid,
		parent_id,
		name: String::from(name),
		state: AtomicU32::new(ProcessState::RUNNING.bits()),
		created_at: crate::scheduler::tick_count(),
		image_base: USER_IMAGE_BASE,
		file_buffer,
		file_size,
		inner: Spinlock::new(ProcessInner {
			address_space,
			main_thread: ptr::null_mut(),
			threads: ThreadQueue::new(),
			thread_count: 0,
			next_stack_top: USER_STACK_AREA_TOP,
		}),
	}));

	// The creator, not `create_thread`, puts the main thread on a ready
	// queue.
	let main = task::create_thread(process, USER_IMAGE_BASE, 0, DEFAULT_TIMESLICE_TICKS)?;
	unsafe {
		(*main).set_state(ThreadState::Ready);
	}
	CoreLocal::get().ready_queue.lock().enqueue(main);

	info!("created process {pid} ({name}) from {path}");
	Ok(process)
}
