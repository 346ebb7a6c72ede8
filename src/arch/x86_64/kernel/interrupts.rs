// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Interrupt dispatch.
//!
//! Every vector funnels through one common stub. It saves the full trap
//! frame, hands vector and frame to [`isr_dispatch`], and on return
//! takes one of two exits: restore the captured frame, or — when a
//! reschedule was requested while the interrupt ran and the scheduler is
//! enabled — copy the captured frame into the current thread and fall
//! into `schedule`, which never returns here.

use core::arch::naked_asm;
use core::sync::atomic::{AtomicUsize, Ordering};

use super::core_local::CoreLocal;
use super::irql::{self, Irql};
use super::{apic, idt, processor};
use crate::bugcheck::{self, AdditionalInfo, StopCode, guard_registry};

/// LAPIC timer tick.
pub const TIMER_INTERRUPT_NUMBER: u8 = 0xEF;
/// Generic IPI action vector (TLB shootdown, STOP).
pub const ACTION_INTERRUPT_NUMBER: u8 = 0xFD;
pub const SPURIOUS_INTERRUPT_NUMBER: u8 = 0xFE;
/// First vector of the remapped legacy IRQ range.
pub const LEGACY_IRQ_OFFSET: u8 = 32;

/// The register image the common stub captures on the interrupted
/// stack, exactly in push order plus the hardware frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
	pub r15: u64,
	pub r14: u64,
	pub r13: u64,
	pub r12: u64,
	pub r11: u64,
	pub r10: u64,
	pub r9: u64,
	pub r8: u64,
	pub rbp: u64,
	pub rdi: u64,
	pub rsi: u64,
	pub rdx: u64,
	pub rcx: u64,
	pub rbx: u64,
	pub rax: u64,
	pub vector: u64,
	pub error_code: u64,
	// Hardware-pushed interrupt frame.
	pub rip: u64,
	pub cs: u64,
	pub rflags: u64,
	pub rsp: u64,
	pub ss: u64,
}

/// Per-vector handlers installable by drivers. Stored as raw function
/// addresses so the table itself is lock-free.
static HANDLERS: [AtomicUsize; idt::IDT_ENTRIES] =
	[const { AtomicUsize::new(0) }; idt::IDT_ENTRIES];

pub type InterruptHandler = fn(&mut TrapFrame);

pub fn set_handler(vector: u8, handler: InterruptHandler) {
	HANDLERS[vector as usize].store(handler as usize, Ordering::Release);
}

fn registered_handler(vector: u8) -> Option<InterruptHandler> {
	let raw = HANDLERS[vector as usize].load(Ordering::Acquire);
	if raw == 0 {
		None
	} else {
		Some(unsafe { core::mem::transmute::<usize, InterruptHandler>(raw) })
	}
}

#[unsafe(naked)]
unsafe extern "C" fn isr_common() {
	naked_asm!(
		// cs of the interrupted context decides the swapgs dance; it sits
		// above [vector][error] on the stack here.
		"cmp qword ptr [rsp + 24], 0x08",
		"je 2f",
		"swapgs",
		"2:",
		"push rax",
		"push rbx",
		"push rcx",
		"push rdx",
		"push rsi",
		"push rdi",
		"push rbp",
		"push r8",
		"push r9",
		"push r10",
		"push r11",
		"push r12",
		"push r13",
		"push r14",
		"push r15",
		"mov rdi, rsp",
		"call {dispatch}",
		"test rax, rax",
		"jnz 3f",
		"pop r15",
		"pop r14",
		"pop r13",
		"pop r12",
		"pop r11",
		"pop r10",
		"pop r9",
		"pop r8",
		"pop rbp",
		"pop rdi",
		"pop rsi",
		"pop rdx",
		"pop rcx",
		"pop rbx",
		"pop rax",
		"add rsp, 16",
		"cmp qword ptr [rsp + 8], 0x08",
		"je 4f",
		"swapgs",
		"4:",
		"iretq",
		// Second exit: hand the captured frame to the scheduler.
		"3:",
		"mov rdi, rsp",
		"call {reschedule}",
		"ud2",
		dispatch = sym isr_dispatch,
		reschedule = sym isr_reschedule,
	)
}

macro_rules! isr_stub {
	($name:ident, $vector:literal) => {
		#[unsafe(naked)]
		unsafe extern "C" fn $name() {
			naked_asm!(
				"push 0",
				"push {vector}",
				"jmp {common}",
				vector = const $vector,
				common = sym isr_common,
			)
		}
	};
}

macro_rules! isr_stub_with_error_code {
	($name:ident, $vector:literal) => {
		#[unsafe(naked)]
		unsafe extern "C" fn $name() {
			naked_asm!(
				"push {vector}",
				"jmp {common}",
				vector = const $vector,
				common = sym isr_common,
			)
		}
	};
}

isr_stub!(isr0, 0);
isr_stub!(isr1, 1);
isr_stub!(isr2, 2);
isr_stub!(isr3, 3);
isr_stub!(isr4, 4);
isr_stub!(isr5, 5);
isr_stub!(isr6, 6);
isr_stub!(isr7, 7);
isr_stub_with_error_code!(isr8, 8);
isr_stub!(isr9, 9);
isr_stub_with_error_code!(isr10, 10);
isr_stub_with_error_code!(isr11, 11);
isr_stub_with_error_code!(isr12, 12);
isr_stub_with_error_code!(isr13, 13);
isr_stub_with_error_code!(isr14, 14);
isr_stub!(isr15, 15);
isr_stub!(isr16, 16);
isr_stub_with_error_code!(isr17, 17);
isr_stub!(isr18, 18);
isr_stub!(isr19, 19);
isr_stub!(isr20, 20);
isr_stub!(isr21, 21);
isr_stub!(isr22, 22);
isr_stub!(isr23, 23);
isr_stub!(isr24, 24);
isr_stub!(isr25, 25);
isr_stub!(isr26, 26);
isr_stub!(isr27, 27);
isr_stub!(isr28, 28);
isr_stub!(isr29, 29);
isr_stub_with_error_code!(isr30, 30);
isr_stub!(isr31, 31);
isr_stub!(irq0, 32);
isr_stub!(irq1, 33);
isr_stub!(irq2, 34);
isr_stub!(irq3, 35);
isr_stub!(irq4, 36);
isr_stub!(irq5, 37);
isr_stub!(irq6, 38);
isr_stub!(irq7, 39);
isr_stub!(irq8, 40);
isr_stub!(irq9, 41);
isr_stub!(irq10, 42);
isr_stub!(irq11, 43);
isr_stub!(irq12, 44);
isr_stub!(irq13, 45);
isr_stub!(irq14, 46);
isr_stub!(irq15, 47);
isr_stub!(isr_timer, 0xEF);
isr_stub!(isr_action, 0xFD);
isr_stub!(isr_spurious, 0xFE);

/// Populate the IDT. Page fault and double fault run on their dedicated
/// IST stacks.
pub fn install_handlers() {
	let exception_gates: [unsafe extern "C" fn(); 32] = [
		isr0, isr1, isr2, isr3, isr4, isr5, isr6, isr7, isr8, isr9, isr10, isr11, isr12, isr13,
		isr14, isr15, isr16, isr17, isr18, isr19, isr20, isr21, isr22, isr23, isr24, isr25, isr26,
		isr27, isr28, isr29, isr30, isr31,
	];
	for (vector, gate) in exception_gates.iter().enumerate() {
		idt::set_gate(vector as u8, *gate as usize, 0);
	}
	idt::set_gate(14, isr14 as usize, 1);
	idt::set_gate(8, isr8 as usize, 2);

	let irq_gates: [unsafe extern "C" fn(); 16] = [
		irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13,
		irq14, irq15,
	];
	for (line, gate) in irq_gates.iter().enumerate() {
		idt::set_gate(LEGACY_IRQ_OFFSET + line as u8, *gate as usize, 0);
	}

	idt::set_gate(TIMER_INTERRUPT_NUMBER, isr_timer as usize, 0);
	idt::set_gate(ACTION_INTERRUPT_NUMBER, isr_action as usize, 0);
	idt::set_gate(SPURIOUS_INTERRUPT_NUMBER, isr_spurious as usize, 0);
}

/// The language-level dispatcher. Returns nonzero when the stub should
/// branch into the scheduler instead of restoring the frame.
extern "C" fn isr_dispatch(frame: &mut TrapFrame) -> u64 {
	let core = CoreLocal::get();
	let vector = frame.vector as u8;

	match vector {
		0..32 => handle_exception(frame),
		TIMER_INTERRUPT_NUMBER => {
			let old_irql = irql::raise(Irql::CLOCK);
			crate::scheduler::timer_tick();
			apic::eoi();
			irql::lower(old_irql);
		}
		ACTION_INTERRUPT_NUMBER => {
			let old_irql = irql::raise(Irql::IPI);
			apic::handle_action_interrupt();
			apic::eoi();
			irql::lower(old_irql);
		}
		SPURIOUS_INTERRUPT_NUMBER => {
			// Spurious vector: no EOI, nothing to do.
		}
		vector if (LEGACY_IRQ_OFFSET..48).contains(&vector) => {
			let irq = vector - LEGACY_IRQ_OFFSET;
			let old_irql = irql::raise(Irql::device(irq));
			if let Some(handler) = registered_handler(vector) {
				handler(frame);
			}
			apic::eoi();
			irql::lower(old_irql);
		}
		vector => match registered_handler(vector) {
			Some(handler) => {
				handler(frame);
				apic::eoi();
			}
			None => {
				bugcheck::bugcheck_with_frame(
					StopCode::UnexpectedInterrupt,
					frame,
					&AdditionalInfo::with_message(format_args!(
						"no handler for vector {vector}"
					)),
				);
			}
		},
	}

	// Deferred work runs once the stack of pending IRQLs has unwound.
	if irql::current() < Irql::DISPATCH {
		crate::scheduler::dpc::retire_dpcs();
	}

	let reschedule = core.scheduler_enabled()
		&& irql::current() < Irql::DISPATCH
		&& core.reschedule_pending.swap(false, Ordering::AcqRel);
	u64::from(reschedule)
}

/// Second stub exit: the interrupted context becomes the current
/// thread's saved frame and the scheduler picks what runs next.
extern "C" fn isr_reschedule(frame: &TrapFrame) -> ! {
	let core = CoreLocal::get();
	let current = core.current_thread.get();
	if !current.is_null() {
		let registers = unsafe { &mut (*current).registers };
		registers.r15 = frame.r15;
		registers.r14 = frame.r14;
		registers.r13 = frame.r13;
		registers.r12 = frame.r12;
		registers.r11 = frame.r11;
		registers.r10 = frame.r10;
		registers.r9 = frame.r9;
		registers.r8 = frame.r8;
		registers.rbp = frame.rbp;
		registers.rdi = frame.rdi;
		registers.rsi = frame.rsi;
		registers.rdx = frame.rdx;
		registers.rcx = frame.rcx;
		registers.rbx = frame.rbx;
		registers.rax = frame.rax;
		registers.rsp = frame.rsp;
		registers.rip = frame.rip;
		registers.rflags = frame.rflags;
		registers.ss = frame.ss;
		registers.cs = frame.cs;
	}
	crate::scheduler::schedule()
}

fn handle_exception(frame: &mut TrapFrame) {
	match frame.vector {
		2 => {
			irql::set(Irql::HIGH);
			bugcheck::bugcheck_with_frame(
				StopCode::NonMaskableInterrupt,
				frame,
				&AdditionalInfo::with_message(format_args!("non-maskable interrupt")),
			);
		}
		6 => bugcheck::bugcheck_with_frame(
			StopCode::InvalidOpcode,
			frame,
			&AdditionalInfo::with_message(format_args!("invalid opcode")),
		),
		8 => {
			irql::set(Irql::HIGH);
			bugcheck::bugcheck_with_frame(
				StopCode::DoubleFault,
				frame,
				&AdditionalInfo::with_message(format_args!("double fault")),
			);
		}
		13 => bugcheck::bugcheck_with_frame(
			StopCode::GeneralProtectionFault,
			frame,
			&AdditionalInfo::with_message(format_args!(
				"general protection fault, selector {:#x}",
				frame.error_code
			)),
		),
		14 => page_fault(frame),
		17 => bugcheck::bugcheck_with_frame(
			StopCode::AlignmentCheck,
			frame,
			&AdditionalInfo::with_message(format_args!("alignment check")),
		),
		18 => {
			irql::set(Irql::HIGH);
			bugcheck::bugcheck_with_frame(
				StopCode::MachineCheck,
				frame,
				&AdditionalInfo::with_message(format_args!("machine check")),
			);
		}
		vector => match registered_handler(vector as u8) {
			Some(handler) => handler(frame),
			None => bugcheck::bugcheck_with_frame(
				StopCode::UnexpectedInterrupt,
				frame,
				&AdditionalInfo::with_message(format_args!("unhandled exception {vector}")),
			),
		},
	}
}

/// All page faults are fatal here (no demand paging); the interesting
/// part is telling a guard-page hit or null dereference apart from a
/// stray access.
fn page_fault(frame: &mut TrapFrame) -> ! {
	let fault_address = processor::read_page_fault_address().as_u64();

	let code = if guard_registry::contains(fault_address) {
		StopCode::GuardPageDereference
	} else {
		StopCode::PageFault
	};

	bugcheck::bugcheck_with_frame(
		code,
		frame,
		&AdditionalInfo::with_message(format_args!(
			"page fault at {fault_address:#018x}, error code {:#x}",
			frame.error_code
		))
		.pointer(fault_address),
	)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use core::mem::offset_of as offset;

	use super::*;

	#[test]
	fn trap_frame_matches_the_stub_push_order() {
		// The stub pushes rax..r15 on top of [vector][error][iret frame].
		assert_eq!(offset!(TrapFrame, r15), 0);
		assert_eq!(offset!(TrapFrame, rax), 14 * 8);
		assert_eq!(offset!(TrapFrame, vector), 15 * 8);
		assert_eq!(offset!(TrapFrame, error_code), 16 * 8);
		assert_eq!(offset!(TrapFrame, rip), 17 * 8);
		assert_eq!(offset!(TrapFrame, cs), 18 * 8);
		assert_eq!(offset!(TrapFrame, ss), 21 * 8);
	}
}
