// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The kernel spinlock.
//!
//! Acquiring raises the calling CPU to `DISPATCH`, so a holder can never
//! be preempted and must never block; the previous level is restored on
//! release. The wait loop is a plain test-and-set with a pause hint.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering, compiler_fence};

use crossbeam_utils::Backoff;

use crate::arch::kernel::irql::{self, Irql};

pub struct Spinlock<T: ?Sized> {
	lock: AtomicU32,
	data: UnsafeCell<T>,
}

/// A guard to which the protected data can be accessed
///
/// When the guard falls out of scope it will release the lock and lower
/// the IRQL back to the level it had before the acquisition.
pub struct SpinlockGuard<'a, T: ?Sized> {
	lock: &'a AtomicU32,
	prev_irql: Irql,
	data: &'a mut T,
}

unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
	pub const fn new(data: T) -> Spinlock<T> {
		Spinlock {
			lock: AtomicU32::new(0),
			data: UnsafeCell::new(data),
		}
	}

	/// Consumes this lock, returning the underlying data.
	#[allow(dead_code)]
	pub fn into_inner(self) -> T {
		// We know statically that there are no outstanding references to
		// `self` so there's no need to lock.
		self.data.into_inner()
	}
}

impl<T: ?Sized> Spinlock<T> {
	pub fn lock(&self) -> SpinlockGuard<'_, T> {
		let prev_irql = irql::raise(Irql::DISPATCH);

		let backoff = Backoff::new();
		while self
			.lock
			.compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			backoff.spin();
		}
		compiler_fence(Ordering::Acquire);

		SpinlockGuard {
			lock: &self.lock,
			prev_irql,
			data: unsafe { &mut *self.data.get() },
		}
	}

	/// Peek at the protected data without holding the lock.
	///
	/// The result is only a hint; nothing read through it may be relied on
	/// for correctness. Used by the work-stealing scan to skip queues that
	/// look empty.
	pub unsafe fn peek_unlocked(&self) -> &T {
		unsafe { &*self.data.get() }
	}
}

impl<T: ?Sized + Default> Default for Spinlock<T> {
	fn default() -> Spinlock<T> {
		Spinlock::new(T::default())
	}
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		&*self.data
	}
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		&mut *self.data
	}
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
	fn drop(&mut self) {
		compiler_fence(Ordering::Release);
		self.lock.store(0, Ordering::Release);
		irql::lower(self.prev_irql);
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use crate::arch::kernel::core_local::test_support::HOST_CORE_LOCK;
	use crate::arch::kernel::irql::{self, Irql};

	use super::*;

	#[test]
	fn lock_raises_to_dispatch_and_restores() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);

		let lock = Spinlock::new(0);
		{
			let mut data = lock.lock();
			*data = 2;
			assert_eq!(irql::current(), Irql::DISPATCH);
		}
		assert_eq!(irql::current(), Irql::PASSIVE);
		assert_eq!(*lock.lock(), 2);
		irql::set(Irql::PASSIVE);
	}

	#[test]
	fn nested_locks_unwind_in_order() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		irql::set(Irql::PASSIVE);

		let outer = Spinlock::new(());
		let inner = Spinlock::new(());
		{
			let _o = outer.lock();
			{
				let _i = inner.lock();
				assert_eq!(irql::current(), Irql::DISPATCH);
			}
			assert_eq!(irql::current(), Irql::DISPATCH);
		}
		assert_eq!(irql::current(), Irql::PASSIVE);
	}
}
