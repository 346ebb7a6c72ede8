// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thread records, the intrusive thread queue and thread lifecycle.

use alloc::boxed::Box;
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use super::process::{self, Process};
use crate::arch::kernel::core_local::{CoreLocal, record_function};
use crate::arch::kernel::gdt;
use crate::arch::kernel::irql::{self, Irql};
use crate::arch::kernel::switch::{RFLAGS_IF, TaskFrame};
use crate::arch::mm::paging;
use crate::config::THREAD_STACK_SIZE;
use crate::status::{Result, Status};
use crate::synch::event::Event;
use crate::synch::spinlock::Spinlock;

pub type ThreadId = u32;

const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
	Running = 0,
	Ready = 1,
	Blocked = 2,
	Terminating = 3,
	Terminated = 4,
	Zombie = 5,
}

/// A thread control block.
///
/// The saved register frame sits first so the context-switch stubs can
/// treat a thread pointer as a frame pointer. A thread is always in
/// exactly one place: running on a CPU, on one ready queue, on one event
/// waiter queue, or parked as TERMINATED/ZOMBIE awaiting cleanup.
#[repr(C)]
pub struct Thread {
	pub registers: TaskFrame,
	state: AtomicU8,
	timeslice: AtomicU32,
	pub original_timeslice: u32,
	/// Queue linkage; owned by whichever queue holds the thread.
	next: Cell<*mut Thread>,
	pub id: ThreadId,
	/// Start of the kernel allocation backing the stack, for the free.
	pub stack_base: *mut u8,
	/// Top of the user stack, zero for pure kernel threads.
	pub user_stack_top: u64,
	/// The event this thread is blocked on, if any.
	pub waiting_on: Cell<*const Event>,
	/// Owning process; outlives the thread by construction.
	pub process: *const Process,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
	fn new(id: ThreadId, timeslice: u32) -> Self {
		Self {
			registers: TaskFrame::default(),
			state: AtomicU8::new(ThreadState::Ready as u8),
			timeslice: AtomicU32::new(timeslice),
			original_timeslice: timeslice,
			next: Cell::new(ptr::null_mut()),
			id,
			stack_base: ptr::null_mut(),
			user_stack_top: 0,
			waiting_on: Cell::new(ptr::null()),
			process: ptr::null(),
		}
	}

	pub fn state(&self) -> ThreadState {
		match self.state.load(Ordering::Acquire) {
			0 => ThreadState::Running,
			1 => ThreadState::Ready,
			2 => ThreadState::Blocked,
			3 => ThreadState::Terminating,
			4 => ThreadState::Terminated,
			_ => ThreadState::Zombie,
		}
	}

	pub fn set_state(&self, state: ThreadState) {
		self.state.store(state as u8, Ordering::Release);
	}

	/// Burn one tick; returns the remaining count.
	pub fn decrement_timeslice(&self) -> u32 {
		let remaining = self.timeslice.load(Ordering::Relaxed).saturating_sub(1);
		self.timeslice.store(remaining, Ordering::Relaxed);
		remaining
	}

	pub fn reset_timeslice(&self) {
		self.timeslice
			.store(self.original_timeslice, Ordering::Relaxed);
	}

	/// The per-CPU idle thread record; id 0 is reserved for it.
	pub(crate) fn idle() -> Self {
		Self::new(0, 1)
	}

	/// Bare record for queue-level tests.
	#[cfg(all(test, not(target_os = "none")))]
	pub(crate) fn fabricate(id: ThreadId) -> *mut Thread {
		Box::into_raw(Box::new(Self::new(id, 1)))
	}
}

/// Intrusive FIFO of threads, linked through [`Thread::next`].
///
/// Always lives under a lock ([`Spinlock`] in the CPU record, the event
/// lock for waiter queues).
pub(crate) struct ThreadQueue {
	head: *mut Thread,
	tail: *mut Thread,
	len: usize,
}

unsafe impl Send for ThreadQueue {}

impl ThreadQueue {
	pub const fn new() -> Self {
		Self {
			head: ptr::null_mut(),
			tail: ptr::null_mut(),
			len: 0,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.head.is_null()
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn enqueue(&mut self, thread: *mut Thread) {
		unsafe {
			(*thread).next.set(ptr::null_mut());
			if self.tail.is_null() {
				self.head = thread;
			} else {
				(*self.tail).next.set(thread);
			}
		}
		self.tail = thread;
		self.len += 1;
	}

	pub fn dequeue(&mut self) -> *mut Thread {
		let thread = self.head;
		if !thread.is_null() {
			unsafe {
				self.head = (*thread).next.get();
				(*thread).next.set(ptr::null_mut());
			}
			if self.head.is_null() {
				self.tail = ptr::null_mut();
			}
			self.len -= 1;
		}
		thread
	}
}

/// Allocator for sparse thread/process ids.
///
/// Hands out ids in `step` increments so neighbouring objects never have
/// neighbouring ids, and recycles up to `N` recently released ones,
/// most recent first. Exhaustion yields 0.
pub(crate) struct IdPool<const N: usize> {
	next: u32,
	step: u32,
	exhausted: bool,
	free: [u32; N],
	free_count: usize,
}

impl<const N: usize> IdPool<N> {
	pub const fn new(first: u32, step: u32) -> Self {
		Self {
			next: first,
			step,
			exhausted: false,
			free: [0; N],
			free_count: 0,
		}
	}

	pub fn allocate(&mut self) -> u32 {
		if self.free_count > 0 {
			self.free_count -= 1;
			return self.free[self.free_count];
		}
		if self.exhausted {
			return 0;
		}
		let id = self.next;
		match self.next.checked_add(self.step) {
			Some(next) => self.next = next,
			None => self.exhausted = true,
		}
		id
	}

	pub fn release(&mut self, id: u32) {
		if id != 0 && id % self.step == 0 && self.free_count < N {
			self.free[self.free_count] = id;
			self.free_count += 1;
		}
	}
}

const ID_RECYCLE_DEPTH: usize = 1024;

static TID_POOL: Spinlock<IdPool<ID_RECYCLE_DEPTH>> = Spinlock::new(IdPool::new(3, 3));

pub(crate) fn allocate_tid() -> ThreadId {
	TID_POOL.lock().allocate()
}

pub(crate) fn release_tid(id: ThreadId) {
	TID_POOL.lock().release(id);
}

/// First stop of every kernel thread: run the payload, then exit.
extern "C" fn thread_springboard(entry: extern "C" fn(usize), argument: usize, thread: *mut Thread) -> ! {
	entry(argument);
	thread_exit(thread)
}

/// Terminate the calling thread. The stack is still in use here, so the
/// actual teardown is deferred to a cleanup DPC scheduled by the next
/// `schedule` pass.
pub fn thread_exit(thread: *mut Thread) -> ! {
	record_function("thread_exit");
	unsafe {
		(*thread).set_state(ThreadState::Terminated);
		release_tid((*thread).id);
	}
	super::schedule()
}

/// Create a kernel thread and place it on the calling CPU's ready queue.
pub fn create_system_thread(
	entry: extern "C" fn(usize),
	argument: usize,
	timeslice: u32,
) -> Result<*mut Thread> {
	record_function("create_system_thread");
	irql::enforce_max(Irql::DISPATCH);
	if timeslice == 0 {
		return Err(Status::InvalidArgument);
	}

	let tid = allocate_tid();
	if tid == 0 {
		return Err(Status::NoResources);
	}

	let old_irql = irql::raise(Irql::DISPATCH);

	let stack = crate::mm::allocate_guarded(THREAD_STACK_SIZE, 16);
	let mut thread = Box::new(Thread::new(tid, timeslice));
	thread.stack_base = stack;
	thread.process = process::system_process();

	let top = ((stack as u64 + THREAD_STACK_SIZE as u64) & !0xF) - 8;
	thread.registers = TaskFrame {
		rsp: top,
		rip: thread_springboard as usize as u64,
		rdi: entry as usize as u64,
		rsi: argument as u64,
		rflags: RFLAGS_IF,
		cs: gdt::KERNEL_CODE,
		ss: gdt::KERNEL_DATA,
		..TaskFrame::default()
	};
	let thread = Box::into_raw(thread);
	unsafe {
		(*thread).registers.rdx = thread as u64;
	}

	CoreLocal::get().ready_queue.lock().enqueue(thread);
	irql::lower(old_irql);
	Ok(thread)
}

/// Create a user thread inside `process`.
///
/// The stack is a kernel buffer mapped user-accessible below the
/// process's stack bump pointer, leaving a one-page unmapped gap as an
/// implicit guard. The main thread of a fresh process is enqueued by the
/// process creator, not here.
pub fn create_thread(
	process: *mut Process,
	entry: u64,
	argument: u64,
	timeslice: u32,
) -> Result<*mut Thread> {
	record_function("create_thread");
	irql::enforce_max(Irql::DISPATCH);
	if process.is_null() || entry == 0 || timeslice == 0 {
		return Err(Status::InvalidArgument);
	}

	let tid = allocate_tid();
	if tid == 0 {
		return Err(Status::NoResources);
	}

	let process_ref = unsafe { &*process };
	let mut inner = process_ref.inner.lock();

	let pages = THREAD_STACK_SIZE.div_ceil(PAGE_SIZE);
	let stack = crate::mm::allocate(pages * PAGE_SIZE, PAGE_SIZE);

	let user_top = inner.next_stack_top;
	let user_base = user_top - (pages * PAGE_SIZE) as u64;
	if user_base < crate::config::USER_IMAGE_BASE {
		crate::mm::deallocate(stack);
		release_tid(tid);
		return Err(Status::NoMemory);
	}

	let mut flags = paging::PageTableEntryFlags::PRESENT;
	flags.writable().user();
	for page in 0..pages {
		let phys = paging::translate(stack as u64 + (page * PAGE_SIZE) as u64);
		inner
			.address_space
			.map(user_base + (page * PAGE_SIZE) as u64, phys, flags)?;
	}
	// Leave an unmapped page below the stack as an implicit guard.
	inner.next_stack_top = user_base - PAGE_SIZE as u64;

	let mut thread = Box::new(Thread::new(tid, timeslice));
	thread.stack_base = stack;
	thread.user_stack_top = user_top;
	thread.process = process;
	thread.registers = TaskFrame {
		rsp: user_top & !0xF,
		rip: entry,
		rdi: argument,
		rflags: RFLAGS_IF,
		cs: gdt::USER_CODE,
		ss: gdt::USER_DATA,
		..TaskFrame::default()
	};
	let thread = Box::into_raw(thread);

	inner.threads.enqueue(thread);
	inner.thread_count += 1;
	if inner.main_thread.is_null() {
		inner.main_thread = thread;
	} else {
		CoreLocal::get().ready_queue.lock().enqueue(thread);
	}

	Ok(thread)
}

pub fn current_thread() -> *mut Thread {
	CoreLocal::get().current_thread.get()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn thread_queue_is_fifo() {
		let mut queue = ThreadQueue::new();
		assert!(queue.is_empty());

		let a = Thread::fabricate(3);
		let b = Thread::fabricate(6);
		let c = Thread::fabricate(9);
		queue.enqueue(a);
		queue.enqueue(b);
		queue.enqueue(c);
		assert_eq!(queue.len(), 3);

		assert_eq!(queue.dequeue(), a);
		assert_eq!(queue.dequeue(), b);
		queue.enqueue(a);
		assert_eq!(queue.dequeue(), c);
		assert_eq!(queue.dequeue(), a);
		assert!(queue.dequeue().is_null());
		assert!(queue.is_empty());

		unsafe {
			drop(Box::from_raw(a));
			drop(Box::from_raw(b));
			drop(Box::from_raw(c));
		}
	}

	#[test]
	fn id_pool_steps_and_recycles() {
		let mut pool: IdPool<4> = IdPool::new(3, 3);
		assert_eq!(pool.allocate(), 3);
		assert_eq!(pool.allocate(), 6);
		assert_eq!(pool.allocate(), 9);

		pool.release(6);
		pool.release(3);
		// Most recently released comes back first.
		assert_eq!(pool.allocate(), 3);
		assert_eq!(pool.allocate(), 6);
		assert_eq!(pool.allocate(), 12);
	}

	#[test]
	fn id_pool_reports_exhaustion_as_zero() {
		let mut pool: IdPool<4> = IdPool::new(u32::MAX - 1, 2);
		assert_eq!(pool.allocate(), u32::MAX - 1);
		assert_eq!(pool.allocate(), 0);
	}

	#[test]
	fn id_pool_recycle_depth_is_bounded() {
		let mut pool: IdPool<2> = IdPool::new(4, 4);
		for _ in 0..5 {
			pool.allocate();
		}
		for id in [4, 8, 12, 16] {
			pool.release(id);
		}
		// Only the first two releases fit in the recycle stack.
		assert_eq!(pool.allocate(), 8);
		assert_eq!(pool.allocate(), 4);
		assert_eq!(pool.allocate(), 24);
	}

	#[test]
	fn timeslice_counts_down_and_resets() {
		let thread = Thread::new(3, 2);
		assert_eq!(thread.decrement_timeslice(), 1);
		assert_eq!(thread.decrement_timeslice(), 0);
		assert_eq!(thread.decrement_timeslice(), 0);
		thread.reset_timeslice();
		assert_eq!(thread.decrement_timeslice(), 1);
	}
}
