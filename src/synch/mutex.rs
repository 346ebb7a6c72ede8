// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A blocking mutex built on a synchronization event.
//!
//! Contenders never spin: a failed claim parks the thread on the
//! embedded event and `release` hands the lock over by waking exactly
//! one of them. The woken thread retries under the mutex spinlock, so a
//! newcomer racing in merely sends it around the loop once more.
//! Lock order: the mutex spinlock is taken before the event spinlock.

use core::ptr;

use crate::arch::kernel::core_local::record_function;
use crate::arch::kernel::irql::{self, Irql};
use crate::bugcheck::{self, AdditionalInfo, StopCode};
use crate::scheduler::task::{self, Thread, ThreadId};
use crate::synch::event::{Event, EventKind};
use crate::synch::spinlock::Spinlock;

struct MutexInner {
	/// 0 while unowned; `locked` is true exactly when this is non-zero.
	owner_tid: ThreadId,
	owner: *mut Thread,
	locked: bool,
}

unsafe impl Send for MutexInner {}

pub struct Mutex {
	inner: Spinlock<MutexInner>,
	/// Contenders wait here; `release` wakes exactly one.
	event: Event,
}

impl Mutex {
	pub const fn new() -> Self {
		Self {
			inner: Spinlock::new(MutexInner {
				owner_tid: 0,
				owner: ptr::null_mut(),
				locked: false,
			}),
			event: Event::new(EventKind::Synchronization),
		}
	}

	/// Acquire the mutex, blocking while another thread owns it.
	pub fn acquire(&self) {
		record_function("acquire_mutex");
		irql::enforce_max(Irql::DISPATCH);

		loop {
			let mut inner = self.inner.lock();
			if !inner.locked {
				let current = task::current_thread();
				inner.locked = true;
				inner.owner = current;
				inner.owner_tid = unsafe { (*current).id };
				return;
			}
			drop(inner);

			// Park until the owner hands over, then try again.
			self.event.wait();
		}
	}

	/// Release the mutex and wake one contender.
	///
	/// Releasing a mutex the caller does not own is fatal.
	pub fn release(&self) {
		record_function("release_mutex");
		irql::enforce_max(Irql::DISPATCH);

		{
			let mut inner = self.inner.lock();
			if inner.owner_tid == 0 {
				bugcheck::bugcheck_ex(
					StopCode::AssertionFailure,
					&AdditionalInfo::with_message(format_args!(
						"release of a mutex that has no owner"
					)),
				);
			}
			let current = task::current_thread();
			if !current.is_null() && unsafe { (*current).id } != inner.owner_tid {
				bugcheck::bugcheck_ex(
					StopCode::AssertionFailure,
					&AdditionalInfo::with_message(format_args!(
						"mutex owned by thread {} released by thread {}",
						inner.owner_tid,
						unsafe { (*current).id }
					)),
				);
			}

			inner.owner_tid = 0;
			inner.owner = ptr::null_mut();
			inner.locked = false;
		}

		// Outside the mutex spinlock, respecting the lock order.
		self.event.set();
	}

	pub fn owner_tid(&self) -> ThreadId {
		self.inner.lock().owner_tid
	}

	pub fn is_locked(&self) -> bool {
		self.inner.lock().locked
	}
}

impl Default for Mutex {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::boxed::Box;

	use super::*;
	use crate::arch::kernel::core_local::CoreLocal;
	use crate::arch::kernel::core_local::test_support::HOST_CORE_LOCK;
	use crate::scheduler::task::ThreadState;

	#[test]
	fn uncontended_acquire_records_the_owner() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);

		let core = CoreLocal::get();
		let me = Thread::fabricate(33);
		core.current_thread.set(me);

		let mutex = Mutex::new();
		assert!(!mutex.is_locked());
		mutex.acquire();
		assert!(mutex.is_locked());
		assert_eq!(mutex.owner_tid(), 33);

		mutex.release();
		assert!(!mutex.is_locked());
		assert_eq!(mutex.owner_tid(), 0);

		core.current_thread.set(core::ptr::null_mut());
		unsafe {
			drop(Box::from_raw(me));
		}
	}

	#[test]
	fn release_hands_over_to_exactly_one_contender() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);

		let core = CoreLocal::get();
		while !core.ready_queue.lock().dequeue().is_null() {}

		let me = Thread::fabricate(36);
		core.current_thread.set(me);

		let mutex = Mutex::new();
		mutex.acquire();

		// Two contenders parked on the internal event, in order.
		let first = Thread::fabricate(39);
		let second = Thread::fabricate(42);
		mutex.event.block_for_test(first);
		mutex.event.block_for_test(second);

		mutex.release();

		// Exactly one was made ready; the other still waits.
		let woken = core.ready_queue.lock().dequeue();
		assert_eq!(woken, first);
		unsafe {
			assert_eq!((*woken).state(), ThreadState::Ready);
		}
		assert!(core.ready_queue.lock().dequeue().is_null());
		assert_eq!(mutex.event.waiter_count(), 1);

		// The woken contender's retry finds the mutex free and claims it.
		core.current_thread.set(first);
		mutex.acquire();
		assert_eq!(mutex.owner_tid(), 39);
		mutex.release();

		core.current_thread.set(core::ptr::null_mut());
		for thread in [me, first, second] {
			unsafe {
				drop(Box::from_raw(thread));
			}
		}
	}

	#[test]
	#[should_panic]
	fn releasing_an_unowned_mutex_is_fatal() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);
		let mutex = Mutex::new();
		let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| mutex.release()));
		irql::set(Irql::PASSIVE);
		drop(_guard);
		result.unwrap();
	}
}
