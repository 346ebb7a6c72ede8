// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-CPU preemptive scheduler.
//!
//! Every CPU owns a ready queue and an idle thread. `schedule` picks the
//! next thread from the local queue, steals one from a peer when the
//! local queue is dry, and falls back to the idle thread. A thread that
//! terminated is turned into a zombie whose stack and record are freed
//! by a DPC, never by `schedule` itself (the terminating thread's stack
//! is still the one we are standing on).

pub mod dpc;
pub mod process;
pub mod task;

use alloc::boxed::Box;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use self::dpc::{Dpc, DpcKind};
use self::task::{Thread, ThreadState};
use crate::arch::kernel::core_local::{CoreLocal, record_function};
#[cfg(feature = "smp")]
use crate::arch::kernel::core_local::with_core_registry;
use crate::arch::kernel::gdt;
use crate::arch::kernel::irql::{self, Irql};
use crate::arch::kernel::processor;
use crate::arch::kernel::switch::{RFLAGS_IF, TaskFrame, restore_context};
use crate::config::LOW_TIMESLICE_TICKS;

const IDLE_STACK_SIZE: usize = 2 * 4096;

static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn tick_count() -> u64 {
	TICK_COUNT.load(Ordering::Relaxed)
}

/// Idle body: drain deferred work, then sleep until the next interrupt.
extern "C" fn idle_main() -> ! {
	loop {
		dpc::retire_dpcs();
		processor::halt();
	}
}

/// Prepare the calling CPU's idle thread. Runs once per CPU during
/// bringup, after the heap is live.
pub fn init_core(core: &'static CoreLocal) {
	record_function("scheduler::init_core");

	let stack = crate::mm::allocate(IDLE_STACK_SIZE, 16);
	let mut idle = Box::new(Thread::idle());
	idle.stack_base = stack;
	idle.registers = TaskFrame {
		rsp: ((stack as u64 + IDLE_STACK_SIZE as u64) & !0xF) - 8,
		rip: idle_main as usize as u64,
		rflags: RFLAGS_IF,
		cs: gdt::KERNEL_CODE,
		ss: gdt::KERNEL_DATA,
		..TaskFrame::default()
	};
	core.idle_thread.set(Box::into_raw(idle));
	core.current_thread.set(ptr::null_mut());
}

/// Frees a terminated thread: stack first, then the record, then the
/// DPC that carried us here. This order is load-bearing; see `schedule`.
fn thread_cleanup(dpc: *mut Dpc, thread: usize, _b: usize, _c: usize) {
	record_function("thread_cleanup");
	let thread = thread as *mut Thread;
	unsafe {
		crate::mm::deallocate((*thread).stack_base);
		drop(Box::from_raw(thread));
		drop(Box::from_raw(dpc));
	}
}

/// Pick the next runnable thread: local queue first, then one steal
/// attempt per peer, in core order. Returns null when only idling is
/// left.
fn take_next_thread(core: &CoreLocal) -> *mut Thread {
	let local = core.ready_queue.lock().dequeue();
	if !local.is_null() {
		return local;
	}

	#[cfg(feature = "smp")]
	let stolen = with_core_registry(|registry| {
		for peer in registry.iter() {
			if peer.core_id() == core.core_id() {
				continue;
			}
			// Optimistic peek without the peer's lock. Only a hint to
			// skip queues that look empty; the locked dequeue below is
			// what decides.
			if unsafe { peer.ready_queue.peek_unlocked() }.is_empty() {
				continue;
			}
			let candidate = peer.ready_queue.lock().dequeue();
			if !candidate.is_null() {
				return candidate;
			}
		}
		ptr::null_mut()
	});
	#[cfg(not(feature = "smp"))]
	let stolen = ptr::null_mut();

	stolen
}

/// Switch to the next runnable thread. Never returns to the caller's
/// frame; resumption happens through the context saved elsewhere.
pub extern "C" fn schedule() -> ! {
	record_function("schedule");
	let old_irql = irql::raise(Irql::DISPATCH);
	let core = CoreLocal::get();

	let mut previous = core.current_thread.get();

	unsafe {
		if !previous.is_null() && (*previous).state() == ThreadState::Terminated {
			// We are still running on the dead thread's stack, so both
			// frees happen later, inside the DPC, stack before record.
			let cleanup = Box::into_raw(Box::new(
				Dpc::new(thread_cleanup, dpc::MEDIUM_PRIORITY, DpcKind::ThreadCleanup)
					.with_arguments([previous as usize, 0, 0]),
			));
			dpc::queue_dpc(cleanup);
			(*previous).set_state(ThreadState::Zombie);
			previous = ptr::null_mut();
		}

		// Anything not RUNNING (blocked, zombie, terminating) is some
		// other queue's business now.
		if !previous.is_null()
			&& previous != core.idle_thread.get()
			&& (*previous).state() == ThreadState::Running
		{
			(*previous).set_state(ThreadState::Ready);
			(*previous).reset_timeslice();
			core.ready_queue.lock().enqueue(previous);
		}

		let mut next = take_next_thread(core);
		if next.is_null() {
			next = core.idle_thread.get();
		}
		(*next).set_state(ThreadState::Running);
		core.current_thread.set(next);

		irql::lower(old_irql);
		restore_context(&raw const (*next).registers)
	}
}

/// One LAPIC timer tick: burn a slice of the running thread and request
/// a reschedule when it is used up.
pub(crate) fn timer_tick() {
	TICK_COUNT.fetch_add(1, Ordering::Relaxed);

	let core = CoreLocal::get();
	let current = core.current_thread.get();
	if current.is_null() {
		return;
	}
	unsafe {
		if current == core.idle_thread.get() {
			// The idle thread yields whenever anything is runnable.
			if !core.ready_queue.lock().is_empty() {
				core.reschedule_pending.store(true, Ordering::Release);
			}
			return;
		}
		if (*current).decrement_timeslice() == 0 {
			core.reschedule_pending.store(true, Ordering::Release);
		}
	}
}

/// Spin until `thread` has become a zombie, i.e. its cleanup DPC has
/// been scheduled. Preemption keeps the machine live while we wait.
pub fn wait_for_zombie(thread: *mut Thread) {
	record_function("wait_for_zombie");
	irql::enforce_max(Irql::PASSIVE);
	unsafe {
		while (*thread).state() != ThreadState::Zombie {
			processor::pause();
		}
	}
}

/// Spawn a kernel thread with the default timeslice.
pub fn spawn(entry: extern "C" fn(usize), argument: usize) -> crate::status::Result<*mut Thread> {
	task::create_system_thread(entry, argument, crate::config::DEFAULT_TIMESLICE_TICKS)
}

/// Spawn a kernel thread that yields after every tick.
pub fn spawn_low_latency(
	entry: extern "C" fn(usize),
	argument: usize,
) -> crate::status::Result<*mut Thread> {
	task::create_system_thread(entry, argument, LOW_TIMESLICE_TICKS)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::vec::Vec;

	use super::task::Thread;
	use super::*;
	use crate::arch::kernel::core_local::test_support::HOST_CORE_LOCK;

	#[test]
	fn stealing_transfers_exactly_one_thread_per_pass() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);

		let local = CoreLocal::get();
		let peer = CoreLocal::prepare(local.core_id() + 1, 1);
		while !local.ready_queue.lock().dequeue().is_null() {}

		const VICTIM_THREADS: usize = 4;
		let mut threads = Vec::new();
		for index in 0..VICTIM_THREADS {
			let thread = Thread::fabricate(3 * (index as u32 + 1));
			threads.push(thread);
			peer.ready_queue.lock().enqueue(thread);
		}

		// Each pass with an empty local queue takes exactly one thread
		// from the first non-empty peer, in order, and never the same
		// thread twice.
		let mut seen = Vec::new();
		for _ in 0..VICTIM_THREADS {
			let stolen = take_next_thread(local);
			assert!(!stolen.is_null());
			assert!(!seen.contains(&stolen));
			seen.push(stolen);
		}
		assert_eq!(seen, threads);
		assert!(peer.ready_queue.lock().is_empty());
		assert!(take_next_thread(local).is_null());

		for thread in threads {
			unsafe {
				drop(alloc::boxed::Box::from_raw(thread));
			}
		}
	}

	#[test]
	fn local_queue_wins_over_stealing() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);

		let local = CoreLocal::get();
		while !local.ready_queue.lock().dequeue().is_null() {}

		let own = Thread::fabricate(30);
		local.ready_queue.lock().enqueue(own);
		assert_eq!(take_next_thread(local), own);

		unsafe {
			drop(alloc::boxed::Box::from_raw(own));
		}
	}
}
