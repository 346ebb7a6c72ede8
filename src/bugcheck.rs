// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fatal-error handling.
//!
//! A bugcheck halts the whole machine: interrupts are disabled, every
//! other CPU is stopped through an IPI, the faulting CPU raises itself to
//! `HIGH` and renders a diagnostic report before parking in a pause loop.
//! Nothing on this path may allocate or take a lock that could already be
//! held by the faulting code.

use core::fmt::{self, Write};
#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::kernel::core_local;
#[cfg(target_os = "none")]
use crate::arch::kernel::core_local::CoreLocal;
use crate::arch::kernel::interrupts::TrapFrame;
#[cfg(target_os = "none")]
use crate::arch::kernel::irql::{self, Irql};
#[cfg(target_os = "none")]
use crate::arch::kernel::processor;

/// Stop codes. The numeric value is rendered alongside the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum StopCode {
	UnexpectedInterrupt = 0x01,
	NonMaskableInterrupt = 0x02,
	InvalidOpcode = 0x06,
	DoubleFault = 0x08,
	GeneralProtectionFault = 0x0D,
	PageFault = 0x0E,
	AlignmentCheck = 0x11,
	MachineCheck = 0x12,
	IrqlNotGreaterOrEqual = 0x1337,
	IrqlNotLessOrEqual = 0x1338,
	BadPaging = 0xBAD,
	FrameLimitReached = 0xBADA55,
	FrameBitmapCreationFailure = 0xBADA56,
	MemoryLimitReached = 0xA110C,
	MemoryInvalidFree = 0xF4EE1,
	MemoryCorruptHeader = 0xF4EE2,
	MemoryDoubleFree = 0xF4EE3,
	MemoryCorruptFooter = 0xF4EE4,
	GuardPageDereference = 0x6A4D,
	BlockDeviceLimitReached = 0x420,
	ThreadExitFailure = 0x7E0F,
	NullThread = 0xDEAD7,
	AssertionFailure = 0xA55E47,
	KernelStackOverflow = 0x57ACC,
	ManuallyInitiatedCrash = 0xBABE,
}

/// Extra diagnostic context carried into a bugcheck.
///
/// Fixed capacity so the fatal path never allocates.
pub struct AdditionalInfo {
	buf: [u8; 120],
	len: usize,
	pointer: u64,
}

impl AdditionalInfo {
	pub fn with_message(args: fmt::Arguments<'_>) -> Self {
		let mut info = Self {
			buf: [0; 120],
			len: 0,
			pointer: 0,
		};
		// Truncation is fine; the report stays best-effort.
		let _ = info.write_fmt(args);
		info
	}

	pub fn pointer(mut self, pointer: u64) -> Self {
		self.pointer = pointer;
		self
	}

	pub fn message(&self) -> &str {
		core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<invalid>")
	}
}

impl Write for AdditionalInfo {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		let remaining = self.buf.len() - self.len;
		let take = s.len().min(remaining);
		self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
		self.len += take;
		Ok(())
	}
}

#[cfg(target_os = "none")]
static BUGCHECK_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

pub fn bugcheck(code: StopCode, additional: u64) -> ! {
	bugcheck_ex(
		code,
		&AdditionalInfo::with_message(format_args!("")).pointer(additional),
	)
}

pub fn bugcheck_ex(code: StopCode, info: &AdditionalInfo) -> ! {
	report(code, None, info)
}

pub fn bugcheck_with_frame(code: StopCode, frame: &TrapFrame, info: &AdditionalInfo) -> ! {
	report(code, Some(frame), info)
}

#[cfg(not(target_os = "none"))]
fn report(code: StopCode, _frame: Option<&TrapFrame>, info: &AdditionalInfo) -> ! {
	panic!(
		"bugcheck {:?} ({:#x}): {} [pointer {:#x}]",
		code, code as u64, info.message(), info.pointer
	);
}

#[cfg(target_os = "none")]
fn report(code: StopCode, frame: Option<&TrapFrame>, info: &AdditionalInfo) -> ! {
	processor::disable_interrupts();

	let nested = BUGCHECK_IN_PROGRESS.swap(true, Ordering::AcqRel);
	if !nested {
		// Stop the other CPUs before touching any shared state.
		crate::arch::kernel::apic::stop_other_cpus();
	}

	let irql_at_fault = irql::current();
	irql::set(Irql::HIGH);

	let mut out = unsafe { crate::console::PanicWriter::new() };
	let _ = writeln!(out);
	let _ = writeln!(out, "*** STOP: {:?} ({:#x})", code, code as u64);
	if info.len != 0 {
		let _ = writeln!(out, "*** {}", info.message());
	}
	if info.pointer != 0 {
		let _ = writeln!(out, "*** additional: {:#018x}", info.pointer);
	}

	let core = CoreLocal::get();
	let _ = writeln!(
		out,
		"*** CPU {} at IRQL {}",
		core.core_id(),
		irql_at_fault
	);

	if let Some(frame) = frame {
		render_frame(&mut out, frame);
		if code == StopCode::PageFault {
			render_fault_address(&mut out);
		}
	}

	let debug_registers = core.debug_registers.get();
	if debug_registers.iter().any(|&value| value != 0) {
		let _ = writeln!(out, "*** debug registers: {debug_registers:#x?}");
	}

	let _ = writeln!(out, "*** last functions:");
	core.visit_last_functions(|name| {
		let _ = writeln!(out, "***   {name}");
	});

	render_call_stack(&mut out, frame);

	let _ = writeln!(out, "*** system halted");
	loop {
		processor::pause();
		processor::halt();
	}
}

#[cfg(target_os = "none")]
fn render_frame(out: &mut impl Write, frame: &TrapFrame) {
	let _ = writeln!(
		out,
		"*** vector {} error code {:#x}",
		frame.vector, frame.error_code
	);
	let _ = writeln!(
		out,
		"*** rip={:#018x} rsp={:#018x} rflags={:#x} cs={:#x} ss={:#x}",
		frame.rip, frame.rsp, frame.rflags, frame.cs, frame.ss
	);
	let _ = writeln!(
		out,
		"*** rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
		frame.rax, frame.rbx, frame.rcx, frame.rdx
	);
	let _ = writeln!(
		out,
		"*** rsi={:#018x} rdi={:#018x} rbp={:#018x}",
		frame.rsi, frame.rdi, frame.rbp
	);
	let _ = writeln!(
		out,
		"*** r8 ={:#018x} r9 ={:#018x} r10={:#018x} r11={:#018x}",
		frame.r8, frame.r9, frame.r10, frame.r11
	);
	let _ = writeln!(
		out,
		"*** r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
		frame.r12, frame.r13, frame.r14, frame.r15
	);
}

#[cfg(target_os = "none")]
fn render_fault_address(out: &mut impl Write) {
	let fault_address = processor::read_page_fault_address().as_u64();
	let kind = if fault_address < 0x1000 {
		"null dereference"
	} else if guard_registry::contains(fault_address) {
		"guard-page dereference"
	} else {
		"invalid access"
	};
	let _ = writeln!(out, "*** faulting address {fault_address:#018x} ({kind})");
}

/// Walk the frame-pointer chain, bounded by canonicality, alignment and a
/// maximum distance between successive frames.
#[cfg(target_os = "none")]
fn render_call_stack(out: &mut impl Write, frame: Option<&TrapFrame>) {
	const MAX_FRAMES: usize = 16;
	const MAX_FRAME_DELTA: u64 = 64 * 1024;

	fn plausible(pointer: u64) -> bool {
		let canonical =
			pointer < 0x8000_0000_0000 || pointer >= 0xFFFF_8000_0000_0000;
		canonical && pointer % 8 == 0 && pointer != 0
	}

	let mut rbp = match frame {
		Some(frame) => frame.rbp,
		None => {
			let rbp: u64;
			unsafe {
				core::arch::asm!("mov {}, rbp", out(reg) rbp, options(nomem, nostack));
			}
			rbp
		}
	};

	let _ = writeln!(out, "*** call stack:");
	for _ in 0..MAX_FRAMES {
		if !plausible(rbp) {
			break;
		}
		let next = unsafe { *(rbp as *const u64) };
		let return_address = unsafe { *((rbp + 8) as *const u64) };
		if return_address == 0 {
			break;
		}
		let _ = writeln!(out, "***   {return_address:#018x}");
		if !plausible(next) || next <= rbp || next - rbp > MAX_FRAME_DELTA {
			break;
		}
		rbp = next;
	}
}

/// Registry of guarded virtual ranges, consulted by the page-fault path to
/// tell a guard-page hit apart from a stray access.
pub(crate) mod guard_registry {
	use super::core_local;
	use crate::synch::spinlock::Spinlock;

	const MAX_GUARDED_RANGES: usize = 128;

	#[derive(Clone, Copy)]
	struct GuardRange {
		start: u64,
		end: u64,
	}

	static REGISTRY: Spinlock<[Option<GuardRange>; MAX_GUARDED_RANGES]> =
		Spinlock::new([None; MAX_GUARDED_RANGES]);

	pub(crate) fn register(start: u64, size: u64) {
		core_local::record_function("guard_registry::register");
		let mut registry = REGISTRY.lock();
		let slot = registry
			.iter_mut()
			.find(|slot| slot.is_none())
			.expect("guard registry exhausted");
		*slot = Some(GuardRange {
			start,
			end: start + size,
		});
	}

	pub(crate) fn unregister(start: u64) {
		let mut registry = REGISTRY.lock();
		for slot in registry.iter_mut() {
			if slot.is_some_and(|range| range.start == start) {
				*slot = None;
				return;
			}
		}
	}

	/// Lock-free read for the bugcheck path; the faulting CPU may already
	/// hold arbitrary locks.
	pub(crate) fn contains(address: u64) -> bool {
		let registry = unsafe { REGISTRY.peek_unlocked() };
		registry
			.iter()
			.flatten()
			.any(|range| address >= range.start && address < range.end)
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;
	use crate::arch::kernel::core_local::test_support::HOST_CORE_LOCK;

	#[test]
	fn additional_info_truncates_long_messages() {
		let info = AdditionalInfo::with_message(format_args!(
			"{:a>200}",
			""
		));
		assert_eq!(info.message().len(), 120);
	}

	#[test]
	fn guard_registry_tracks_ranges() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		guard_registry::register(0x5000, 0x1000);
		assert!(guard_registry::contains(0x5000));
		assert!(guard_registry::contains(0x5FFF));
		assert!(!guard_registry::contains(0x6000));
		guard_registry::unregister(0x5000);
		assert!(!guard_registry::contains(0x5000));
	}
}
