// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-CPU record and the kernel-GS discipline used to reach it.
//!
//! One [`CoreLocal`] exists per logical processor. The boot processor
//! prepares all records up front; every CPU installs its own record into
//! `GS` before it touches any other subsystem. Peers reach each other
//! through the global registry, which is what work stealing, TLB
//! shootdowns and the bugcheck STOP broadcast iterate over.

use alloc::boxed::Box;
use core::arch::asm;
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use core::{mem, ptr};

use hermit_sync::SpinMutex;
use x86_64::VirtAddr;
use x86_64::registers::model_specific::{GsBase, KernelGsBase};
use x86_64::structures::gdt::GlobalDescriptorTable;
use x86_64::structures::tss::TaskStateSegment;

use super::irql::Irql;
use crate::config::LAST_FUNCTION_RING_SIZE;
use crate::scheduler::dpc::{Dpc, DpcQueue};
use crate::scheduler::task::{Thread, ThreadQueue};
use crate::synch::spinlock::Spinlock;

/// Unique identifier for a core.
pub type CoreId = u32;

/// Number of CPUs that finished their bringup and entered the scheduler.
pub static CPU_ONLINE: AtomicU32 = AtomicU32::new(0);

/// Upper bound on the CPUs this kernel manages.
pub const MAX_CPUS: usize = 64;

/// All prepared CPU records in core-id order.
///
/// Fixed capacity: the boot core registers itself before the heap exists.
pub(crate) struct CoreRegistry {
	cores: [Option<&'static CoreLocal>; MAX_CPUS],
	count: usize,
}

impl CoreRegistry {
	const fn new() -> Self {
		Self {
			cores: [None; MAX_CPUS],
			count: 0,
		}
	}

	fn push(&mut self, core: &'static CoreLocal) {
		assert!(self.count < MAX_CPUS, "too many CPUs");
		self.cores[self.count] = Some(core);
		self.count += 1;
	}

	pub fn iter(&self) -> impl Iterator<Item = &'static CoreLocal> + '_ {
		self.cores[..self.count].iter().map(|core| core.unwrap())
	}

	pub fn len(&self) -> usize {
		self.count
	}
}

static CORE_REGISTRY: SpinMutex<CoreRegistry> = SpinMutex::new(CoreRegistry::new());

pub(crate) struct CoreLocal {
	this: *const Self,
	/// Sequential ID of this CPU core.
	core_id: CoreId,
	/// Local APIC ID reported by the firmware tables for this core.
	pub lapic_id: Cell<u8>,
	/// Current interrupt request level.
	irql: AtomicU8,
	/// `true` while the current IRQL permits context switches.
	scheduler_enabled: AtomicBool,
	/// Set by interrupt handlers to request a reschedule on exit.
	pub reschedule_pending: AtomicBool,
	/// Thread currently running on this core.
	pub current_thread: Cell<*mut Thread>,
	/// Idle thread of this core, selected when no other thread is runnable.
	pub idle_thread: Cell<*mut Thread>,
	/// Threads ready to run on this core. Peers may steal from it under
	/// the embedded lock.
	pub ready_queue: Spinlock<ThreadQueue>,
	/// Deferred procedure calls pending on this core.
	pub dpc_queue: DpcQueue,
	/// Guards against nested DPC drains on this core.
	pub dpc_active: AtomicBool,
	/// The DPC whose callback is currently executing.
	pub current_dpc: Cell<*mut Dpc>,
	/// Task State Segment of this core.
	pub tss: Cell<*mut TaskStateSegment>,
	/// Per-core GDT holding the TSS descriptor.
	pub gdt: Cell<*mut GlobalDescriptorTable>,
	/// Top of the main kernel stack.
	pub kernel_stack_top: Cell<u64>,
	/// Top of the IST stack used by the page-fault handler.
	pub page_fault_stack_top: Cell<u64>,
	/// Top of the IST stack used by the double-fault handler.
	pub double_fault_stack_top: Cell<u64>,
	/// Set once this core has finished bringup.
	pub online: AtomicBool,
	/// Pending generic IPI action, 0 when idle.
	ipi_action: AtomicU8,
	/// Parameter slot for the pending IPI action.
	ipi_parameter: AtomicU64,
	/// Bumped by this core to acknowledge a delivered IPI action.
	ipi_sequence: AtomicU64,
	/// Saved debug registers (DR0..DR3, DR6, DR7) of this core.
	pub debug_registers: Cell<[u64; 6]>,
	/// Ring of recently entered functions, rendered by bugcheck.
	last_functions: LastFunctionRing,
}

// One record per CPU; cross-CPU access is limited to the atomic fields,
// the locked ready queue and the DPC pending lists.
unsafe impl Sync for CoreLocal {}

struct LastFunctionRing {
	index: Cell<usize>,
	entries: [Cell<&'static str>; LAST_FUNCTION_RING_SIZE],
}

impl LastFunctionRing {
	const fn new() -> Self {
		const EMPTY: Cell<&'static str> = Cell::new("");
		Self {
			index: Cell::new(0),
			entries: [EMPTY; LAST_FUNCTION_RING_SIZE],
		}
	}

	fn record(&self, name: &'static str) {
		let index = self.index.get();
		self.entries[index % LAST_FUNCTION_RING_SIZE].set(name);
		self.index.set(index.wrapping_add(1));
	}

	/// Visit the recorded names, oldest first.
	fn visit(&self, mut f: impl FnMut(&'static str)) {
		let index = self.index.get();
		for i in 0..LAST_FUNCTION_RING_SIZE {
			let name = self.entries[(index + i) % LAST_FUNCTION_RING_SIZE].get();
			if !name.is_empty() {
				f(name);
			}
		}
	}
}

impl CoreLocal {
	fn new(core_id: CoreId, lapic_id: u8) -> Self {
		Self {
			this: ptr::null(),
			core_id,
			lapic_id: Cell::new(lapic_id),
			irql: AtomicU8::new(Irql::PASSIVE.as_raw()),
			scheduler_enabled: AtomicBool::new(true),
			reschedule_pending: AtomicBool::new(false),
			current_thread: Cell::new(ptr::null_mut()),
			idle_thread: Cell::new(ptr::null_mut()),
			ready_queue: Spinlock::new(ThreadQueue::new()),
			dpc_queue: DpcQueue::new(),
			dpc_active: AtomicBool::new(false),
			current_dpc: Cell::new(ptr::null_mut()),
			tss: Cell::new(ptr::null_mut()),
			gdt: Cell::new(ptr::null_mut()),
			kernel_stack_top: Cell::new(0),
			page_fault_stack_top: Cell::new(0),
			double_fault_stack_top: Cell::new(0),
			online: AtomicBool::new(false),
			ipi_action: AtomicU8::new(0),
			ipi_parameter: AtomicU64::new(0),
			ipi_sequence: AtomicU64::new(0),
			debug_registers: Cell::new([0; 6]),
			last_functions: LastFunctionRing::new(),
		}
	}

	/// Create the record for a core and add it to the registry.
	///
	/// The record for the boot core lives in static storage so it exists
	/// before the heap does; every other record is heap-allocated.
	pub fn prepare(core_id: CoreId, lapic_id: u8) -> &'static Self {
		let this = if core_id == 0 {
			take_static::take_static! {
				static BOOT_CORE_LOCAL: Option<CoreLocal> = None;
			}
			BOOT_CORE_LOCAL
				.take()
				.expect("boot core record prepared twice")
				.insert(Self::new(core_id, lapic_id))
		} else {
			Box::leak(Box::new(Self::new(core_id, lapic_id)))
		};
		this.this = ptr::from_ref(this);
		let this: &'static Self = this;

		CORE_REGISTRY.lock().push(this);
		this
	}

	/// Make this record reachable through `GS` on the calling CPU.
	pub unsafe fn install(&'static self) {
		GsBase::write(VirtAddr::from_ptr(self));
		// The user half of the swapgs pair starts out empty.
		KernelGsBase::write(VirtAddr::zero());
	}

	#[inline]
	pub fn get() -> &'static Self {
		if cfg!(target_os = "none") {
			unsafe {
				let raw: *const Self;
				asm!(
					"mov {}, gs:{}",
					out(reg) raw,
					const mem::offset_of!(Self, this),
					options(nomem, nostack, preserves_flags),
				);
				&*raw
			}
		} else {
			host_core_local()
		}
	}

	#[inline]
	pub fn core_id(&self) -> CoreId {
		self.core_id
	}

	#[inline]
	pub fn irql(&self) -> Irql {
		Irql::from_raw(self.irql.load(Ordering::Acquire))
	}

	/// Store a new level and refresh the scheduler-enabled flag.
	///
	/// Only the IRQL module may call this; everyone else goes through
	/// `irql::raise`/`irql::lower`.
	pub(super) fn set_irql(&self, new: Irql) {
		self.irql.store(new.as_raw(), Ordering::Release);
		self.scheduler_enabled
			.store(new < Irql::DISPATCH, Ordering::Release);
	}

	#[inline]
	pub fn scheduler_enabled(&self) -> bool {
		self.scheduler_enabled.load(Ordering::Acquire)
	}

	pub fn record_function(&self, name: &'static str) {
		self.last_functions.record(name);
	}

	pub fn visit_last_functions(&self, f: impl FnMut(&'static str)) {
		self.last_functions.visit(f);
	}

	/// Post an action for this core's IPI handler and return the
	/// acknowledge sequence observed beforehand.
	pub fn post_ipi_action(&self, action: u8, parameter: u64) -> u64 {
		let sequence = self.ipi_sequence.load(Ordering::Acquire);
		self.ipi_parameter.store(parameter, Ordering::Release);
		self.ipi_action.store(action, Ordering::Release);
		sequence
	}

	pub fn take_ipi_action(&self) -> (u8, u64) {
		let action = self.ipi_action.swap(0, Ordering::AcqRel);
		let parameter = self.ipi_parameter.load(Ordering::Acquire);
		(action, parameter)
	}

	pub fn acknowledge_ipi(&self) {
		self.ipi_sequence.fetch_add(1, Ordering::AcqRel);
	}

	pub fn ipi_sequence(&self) -> u64 {
		self.ipi_sequence.load(Ordering::Acquire)
	}
}

/// Record `name` in the calling CPU's last-function ring.
pub(crate) fn record_function(name: &'static str) {
	CoreLocal::get().record_function(name);
}

pub(crate) fn core_id() -> CoreId {
	CoreLocal::get().core_id
}

/// Run `f` over all prepared CPU records, in core-id order.
pub(crate) fn with_core_registry<R>(f: impl FnOnce(&CoreRegistry) -> R) -> R {
	let registry = CORE_REGISTRY.lock();
	f(&registry)
}

/// Number of CPUs prepared by the boot processor.
pub(crate) fn prepared_core_count() -> u32 {
	CORE_REGISTRY.lock().len() as u32
}

/// Number of CPUs that are fully online.
pub fn online_core_count() -> u32 {
	CPU_ONLINE.load(Ordering::Acquire)
}

#[cfg(not(target_os = "none"))]
fn host_core_local() -> &'static CoreLocal {
	use hermit_sync::Lazy;

	// Process-wide stand-in so logic-level tests can run per-CPU code paths.
	static HOST_CORE_LOCAL: Lazy<&'static CoreLocal> = Lazy::new(|| CoreLocal::prepare(0, 0));
	*HOST_CORE_LOCAL
}

#[cfg(target_os = "none")]
fn host_core_local() -> &'static CoreLocal {
	unreachable!()
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod test_support {
	use std::sync::Mutex;

	/// Serializes tests that mutate the shared host CPU record.
	pub(crate) static HOST_CORE_LOCK: Mutex<()> = Mutex::new(());
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	use alloc::vec::Vec;

	#[test]
	fn last_function_ring_keeps_most_recent_entries() {
		let ring = LastFunctionRing::new();
		for _ in 0..2 {
			ring.record("a");
			ring.record("b");
		}
		for i in 0..LAST_FUNCTION_RING_SIZE {
			if i % 2 == 0 {
				ring.record("x");
			} else {
				ring.record("y");
			}
		}

		let mut seen = Vec::new();
		ring.visit(|name| seen.push(name));
		assert_eq!(seen.len(), LAST_FUNCTION_RING_SIZE);
		assert!(seen.iter().all(|name| *name == "x" || *name == "y"));
	}

	#[test]
	fn ipi_mailbox_round_trip() {
		let core = CoreLocal::new(7, 7);
		let sequence = core.post_ipi_action(1, 0xDEAD_BEEF);
		assert_eq!(sequence, 0);
		assert_eq!(core.take_ipi_action(), (1, 0xDEAD_BEEF));
		// Taking the action clears it.
		assert_eq!(core.take_ipi_action().0, 0);
		core.acknowledge_ipi();
		assert_eq!(core.ipi_sequence(), 1);
	}
}
