// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Kernel event objects.
//!
//! Two flavours: a notification event wakes every waiter and stays
//! signaled until reset; a synchronization event hands one signal to one
//! waiter and resets itself in the act. Waiters park through the
//! scheduler's sleep primitive and are moved onto the waking CPU's ready
//! queue. Lock order: an event lock may be taken while holding a mutex
//! lock, and a ready-queue lock while holding an event lock, never the
//! other way around.

use core::ptr;

use crate::arch::kernel::core_local::{CoreLocal, record_function};
use crate::arch::kernel::irql::{self, Irql};
use crate::arch::kernel::switch::sleep_current_thread;
use crate::scheduler::task::{self, Thread, ThreadQueue, ThreadState};
use crate::synch::spinlock::Spinlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
	/// One `set` releases every waiter; the signal persists until reset.
	Notification,
	/// One `set` releases exactly one waiter and consumes the signal.
	Synchronization,
}

struct EventInner {
	signaled: bool,
	waiters: ThreadQueue,
}

pub struct Event {
	kind: EventKind,
	inner: Spinlock<EventInner>,
}

impl Event {
	pub const fn new(kind: EventKind) -> Self {
		Self {
			kind,
			inner: Spinlock::new(EventInner {
				signaled: false,
				waiters: ThreadQueue::new(),
			}),
		}
	}

	pub fn kind(&self) -> EventKind {
		self.kind
	}

	pub fn is_signaled(&self) -> bool {
		self.inner.lock().signaled
	}

	/// Signal the event.
	pub fn set(&self) {
		record_function("set_event");
		let core = CoreLocal::get();

		match self.kind {
			EventKind::Synchronization => {
				let mut inner = self.inner.lock();
				let waiter = inner.waiters.dequeue();
				if waiter.is_null() {
					// Nobody to hand the signal to; park it for the next
					// waiter.
					inner.signaled = true;
					return;
				}
				inner.signaled = false;
				drop(inner);
				wake(core, waiter);
			}
			EventKind::Notification => {
				let mut inner = self.inner.lock();
				let mut woken = ThreadQueue::new();
				loop {
					let waiter = inner.waiters.dequeue();
					if waiter.is_null() {
						break;
					}
					woken.enqueue(waiter);
				}
				inner.signaled = true;
				drop(inner);

				// Requeueing happens outside the event lock.
				loop {
					let waiter = woken.dequeue();
					if waiter.is_null() {
						break;
					}
					wake(core, waiter);
				}
			}
		}
	}

	/// Clear a persisted notification signal.
	pub fn reset(&self) {
		record_function("reset_event");
		self.inner.lock().signaled = false;
	}

	/// Wait until the event is signaled.
	///
	/// Returns immediately when the signal is already pending (consuming
	/// it for a synchronization event); otherwise the calling thread
	/// blocks and resumes once a `set` has moved it back to a ready
	/// queue.
	pub fn wait(&self) {
		record_function("wait_for_event");
		irql::enforce_max(Irql::PASSIVE);

		let current = task::current_thread();
		let mut inner = self.inner.lock();
		if inner.signaled {
			if self.kind == EventKind::Synchronization {
				inner.signaled = false;
			}
			return;
		}

		unsafe {
			(*current).set_state(ThreadState::Blocked);
			(*current).waiting_on.set(ptr::from_ref(self));
			inner.waiters.enqueue(current);
			drop(inner);

			sleep_current_thread(&raw mut (*current).registers);
		}
		// Back on some CPU; the waker has already made us RUNNING.
	}

	/// Park a fabricated thread on the waiter queue, for state-machine
	/// tests that cannot actually sleep.
	#[cfg(all(test, not(target_os = "none")))]
	pub(crate) fn block_for_test(&self, thread: *mut Thread) {
		unsafe {
			(*thread).set_state(ThreadState::Blocked);
			(*thread).waiting_on.set(ptr::from_ref(self));
		}
		self.inner.lock().waiters.enqueue(thread);
	}

	#[cfg(all(test, not(target_os = "none")))]
	pub(crate) fn waiter_count(&self) -> usize {
		self.inner.lock().waiters.len()
	}
}

fn wake(core: &CoreLocal, waiter: *mut Thread) {
	unsafe {
		(*waiter).waiting_on.set(ptr::null());
		(*waiter).set_state(ThreadState::Ready);
	}
	core.ready_queue.lock().enqueue(waiter);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use alloc::boxed::Box;
	use alloc::vec::Vec;

	use super::*;
	use crate::arch::kernel::core_local::test_support::HOST_CORE_LOCK;

	fn drain_ready_queue() -> Vec<*mut Thread> {
		let core = CoreLocal::get();
		let mut drained = Vec::new();
		loop {
			let thread = core.ready_queue.lock().dequeue();
			if thread.is_null() {
				break;
			}
			drained.push(thread);
		}
		drained
	}

	fn free(threads: &[*mut Thread]) {
		for &thread in threads {
			unsafe {
				drop(Box::from_raw(thread));
			}
		}
	}

	#[test]
	fn synchronization_event_wakes_waiters_in_order_one_per_set() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);
		drain_ready_queue();

		let event = Event::new(EventKind::Synchronization);
		let waiters: Vec<_> = (1..=3).map(|i| Thread::fabricate(3 * i)).collect();
		for &waiter in &waiters {
			event.block_for_test(waiter);
		}

		for expected_woken in 1..=3 {
			event.set();
			assert!(!event.is_signaled());
			assert_eq!(event.waiter_count(), 3 - expected_woken);
		}

		// Exactly once each, in blocking order.
		let woken = drain_ready_queue();
		assert_eq!(woken, waiters);
		for &thread in &woken {
			unsafe {
				assert_eq!((*thread).state(), ThreadState::Ready);
				assert!((*thread).waiting_on.get().is_null());
			}
		}
		free(&woken);
	}

	#[test]
	fn synchronization_set_without_waiter_parks_the_signal() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);

		let event = Event::new(EventKind::Synchronization);
		event.set();
		assert!(event.is_signaled());
		// A second set is absorbed.
		event.set();
		assert!(event.is_signaled());
	}

	#[test]
	fn notification_event_wakes_everyone_and_persists() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);
		drain_ready_queue();

		let event = Event::new(EventKind::Notification);
		let waiters: Vec<_> = (1..=4).map(|i| Thread::fabricate(30 + i)).collect();
		for &waiter in &waiters {
			event.block_for_test(waiter);
		}

		event.set();
		assert!(event.is_signaled());
		assert_eq!(event.waiter_count(), 0);

		let woken = drain_ready_queue();
		assert_eq!(woken, waiters);
		free(&woken);

		event.reset();
		assert!(!event.is_signaled());
	}
}
