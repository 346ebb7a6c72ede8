// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Local APIC driver: timer, EOI, and inter-processor interrupts,
//! including the generic action mailbox used for TLB shootdowns and the
//! bugcheck STOP broadcast.
//!
//! Registers are addressed by their x2APIC MSR number. On CPUs without
//! x2APIC, the number is translated to the memory-mapped xAPIC register
//! reached through the higher-half physical window.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

use raw_cpuid::CpuId;

use super::core_local::{CoreLocal, core_id, record_function, with_core_registry};
use super::interrupts::{ACTION_INTERRUPT_NUMBER, SPURIOUS_INTERRUPT_NUMBER, TIMER_INTERRUPT_NUMBER};
use super::{pit, processor};
use crate::arch::mm::{PhysAddr, VirtAddr, phys_to_virt};
use crate::config::TIMER_FREQUENCY_HZ;

const IA32_APIC_BASE: u32 = 0x1B;
const X2APIC_ENABLE: u64 = 1 << 10;

const IA32_X2APIC_ID: u32 = 0x802;
const IA32_X2APIC_EOI: u32 = 0x80B;
const IA32_X2APIC_TPR: u32 = 0x808;
const IA32_X2APIC_SIVR: u32 = 0x80F;
const IA32_X2APIC_ICR: u32 = 0x830;
const IA32_X2APIC_LVT_TIMER: u32 = 0x832;
const IA32_X2APIC_LVT_THERMAL: u32 = 0x833;
const IA32_X2APIC_LVT_PMI: u32 = 0x834;
const IA32_X2APIC_LVT_LINT0: u32 = 0x835;
const IA32_X2APIC_LVT_LINT1: u32 = 0x836;
const IA32_X2APIC_LVT_ERROR: u32 = 0x837;
const IA32_X2APIC_INIT_COUNT: u32 = 0x838;
const IA32_X2APIC_CUR_COUNT: u32 = 0x839;
const IA32_X2APIC_DIV_CONF: u32 = 0x83E;

const APIC_ICR2: u64 = 0x310;

const APIC_DIV_CONF_DIVIDE_BY_16: u64 = 0b0011;
const APIC_EOI_ACK: u64 = 0;
const APIC_ICR_DELIVERY_MODE_FIXED: u64 = 0x000;
const APIC_ICR_DELIVERY_MODE_INIT: u64 = 0x500;
const APIC_ICR_DELIVERY_MODE_STARTUP: u64 = 0x600;
const APIC_ICR_DELIVERY_STATUS_PENDING: u32 = 1 << 12;
const APIC_ICR_LEVEL_TRIGGERED: u64 = 1 << 15;
const APIC_ICR_LEVEL_ASSERT: u64 = 1 << 14;
const APIC_LVT_MASK: u64 = 1 << 16;
const APIC_LVT_TIMER_PERIODIC: u64 = 1 << 17;
const APIC_SIVR_ENABLED: u64 = 1 << 8;

/// Physical base of the memory-mapped xAPIC page.
const LOCAL_APIC_PHYSICAL: u64 = 0xFEE0_0000;

/// LAPIC timer ticks per calibration window, measured once on the BSP.
static CALIBRATED_COUNTS_PER_TICK: AtomicU64 = AtomicU64::new(0);

/// Window the timer is calibrated over.
const CALIBRATION_WINDOW_MS: u64 = 100;

fn local_apic_virtual() -> VirtAddr {
	phys_to_virt(PhysAddr::new(LOCAL_APIC_PHYSICAL))
}

/// Translate an x2APIC MSR number into the equivalent xAPIC address.
#[inline]
fn xapic_address(x2apic_msr: u32) -> VirtAddr {
	local_apic_virtual() + ((u64::from(x2apic_msr) & 0xFF) << 4)
}

fn local_apic_read(x2apic_msr: u32) -> u32 {
	if processor::supports_x2apic() {
		unsafe { processor::rdmsr(x2apic_msr) as u32 }
	} else {
		unsafe { xapic_address(x2apic_msr).as_ptr::<u32>().read_volatile() }
	}
}

fn local_apic_write(x2apic_msr: u32, value: u64) {
	if processor::supports_x2apic() {
		unsafe {
			processor::wrmsr(x2apic_msr, value);
		}
		return;
	}

	unsafe {
		if x2apic_msr == IA32_X2APIC_ICR {
			// xAPIC splits the ICR; the destination goes into ICR2 first.
			let destination = ((value >> 8) & 0xFF00_0000) as u32;
			(local_apic_virtual() + APIC_ICR2)
				.as_mut_ptr::<u32>()
				.write_volatile(destination);
		}

		let register = xapic_address(x2apic_msr).as_mut_ptr::<u32>();
		register.write_volatile(value as u32);

		if x2apic_msr == IA32_X2APIC_ICR {
			// Wait for the delivery-status bit, which x2APIC does away with.
			while register.read_volatile() & APIC_ICR_DELIVERY_STATUS_PENDING != 0 {
				processor::pause();
			}
		}
	}
}

/// The Local APIC ID of the calling CPU, readable before the APIC is set
/// up.
pub fn boot_lapic_id() -> u8 {
	CpuId::new()
		.get_feature_info()
		.map(|f| f.initial_local_apic_id())
		.unwrap_or(0)
}

pub extern "C" fn eoi() {
	local_apic_write(IA32_X2APIC_EOI, APIC_EOI_ACK);
}

/// Bring the APIC subsystem up on the boot processor.
pub fn init() {
	record_function("apic::init");

	init_x2apic();
	init_local_apic();
	calibrate_timer();
}

pub fn init_x2apic() {
	if processor::supports_x2apic() {
		debug!("enabling x2APIC mode");
		unsafe {
			let base = processor::rdmsr(IA32_APIC_BASE);
			processor::wrmsr(IA32_APIC_BASE, base | X2APIC_ENABLE);
		}
	}
}

/// Mask the local vectors, open the TPR and enable the APIC through the
/// spurious-interrupt register. Runs on every CPU.
pub fn init_local_apic() {
	local_apic_write(IA32_X2APIC_LVT_TIMER, APIC_LVT_MASK);
	local_apic_write(IA32_X2APIC_LVT_THERMAL, APIC_LVT_MASK);
	local_apic_write(IA32_X2APIC_LVT_PMI, APIC_LVT_MASK);
	local_apic_write(IA32_X2APIC_LVT_LINT0, APIC_LVT_MASK);
	local_apic_write(IA32_X2APIC_LVT_LINT1, APIC_LVT_MASK);

	local_apic_write(IA32_X2APIC_TPR, 0x00);
	local_apic_write(
		IA32_X2APIC_SIVR,
		APIC_SIVR_ENABLED | u64::from(SPURIOUS_INTERRUPT_NUMBER),
	);
}

/// One-shot calibration against the PIT: run the timer at divisor 16
/// over a 100 ms window and derive the reload value for one scheduler
/// tick.
fn calibrate_timer() {
	local_apic_write(IA32_X2APIC_DIV_CONF, APIC_DIV_CONF_DIVIDE_BY_16);
	local_apic_write(IA32_X2APIC_INIT_COUNT, u64::from(u32::MAX));

	pit::wait(CALIBRATION_WINDOW_MS);

	let elapsed = u64::from(u32::MAX - local_apic_read(IA32_X2APIC_CUR_COUNT));
	local_apic_write(IA32_X2APIC_LVT_TIMER, APIC_LVT_MASK);

	let ticks_per_window = u64::from(TIMER_FREQUENCY_HZ) * CALIBRATION_WINDOW_MS / 1000;
	let counts = (elapsed / ticks_per_window.max(1)).max(1);
	CALIBRATED_COUNTS_PER_TICK.store(counts, Ordering::Relaxed);
	debug!("APIC timer calibrated to {counts} counts per tick");
}

/// Start the periodic scheduler timer on the calling CPU.
pub fn start_timer() {
	let counts = CALIBRATED_COUNTS_PER_TICK.load(Ordering::Relaxed);
	local_apic_write(IA32_X2APIC_DIV_CONF, APIC_DIV_CONF_DIVIDE_BY_16);
	local_apic_write(
		IA32_X2APIC_LVT_TIMER,
		APIC_LVT_TIMER_PERIODIC | u64::from(TIMER_INTERRUPT_NUMBER),
	);
	local_apic_write(IA32_X2APIC_INIT_COUNT, counts);
}

fn icr_destination(lapic_id: u8) -> u64 {
	u64::from(lapic_id) << 32
}

/// Send a fixed-delivery IPI.
pub fn send_ipi(lapic_id: u8, vector: u8) {
	local_apic_write(
		IA32_X2APIC_ICR,
		icr_destination(lapic_id)
			| APIC_ICR_LEVEL_ASSERT
			| APIC_ICR_DELIVERY_MODE_FIXED
			| u64::from(vector),
	);
}

/// The INIT - SIPI - SIPI sequence that pulls an application processor
/// out of reset and into the trampoline page.
pub fn send_init_sipi(lapic_id: u8, start_page: u8) {
	local_apic_write(
		IA32_X2APIC_ICR,
		icr_destination(lapic_id)
			| APIC_ICR_LEVEL_TRIGGERED
			| APIC_ICR_LEVEL_ASSERT
			| APIC_ICR_DELIVERY_MODE_INIT,
	);
	pit::wait(10);

	for _ in 0..2 {
		local_apic_write(
			IA32_X2APIC_ICR,
			icr_destination(lapic_id)
				| APIC_ICR_DELIVERY_MODE_STARTUP
				| u64::from(start_page),
		);
		pit::wait(1);
	}
}

/// Actions a CPU can post to a peer through the IPI mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuAction {
	None = 0,
	PerformTlbShootdown = 1,
	Stop = 2,
}

/// Post `action` to every other online CPU and wait until each one has
/// bumped its acknowledge sequence.
pub fn send_action_to_cpus_and_wait(action: CpuAction, parameter: u64) {
	record_function("send_action_to_cpus_and_wait");
	let own_id = core_id();

	with_core_registry(|registry| {
		for peer in registry.iter() {
			if peer.core_id() == own_id || !peer.online.load(Ordering::Acquire) {
				continue;
			}
			let sequence = peer.post_ipi_action(action as u8, parameter);
			send_ipi(peer.lapic_id.get(), ACTION_INTERRUPT_NUMBER);
			while peer.ipi_sequence() == sequence {
				processor::pause();
			}
		}
	});
}

/// Invalidate `va` on every other CPU that may have cached it. The
/// caller has already fenced its page-table store.
pub fn ipi_tlb_shootdown(va: u64) {
	if cfg!(target_os = "none") && super::core_local::online_core_count() > 1 {
		send_action_to_cpus_and_wait(CpuAction::PerformTlbShootdown, va);
	}
}

/// Halt every other CPU. Used by the bugcheck path; waits only a bounded
/// time per target because a wedged peer must not stall the report.
pub fn stop_other_cpus() {
	let own_id = core_id();

	with_core_registry(|registry| {
		for peer in registry.iter() {
			if peer.core_id() == own_id || !peer.online.load(Ordering::Acquire) {
				continue;
			}
			let sequence = peer.post_ipi_action(CpuAction::Stop as u8, 0);
			send_ipi(peer.lapic_id.get(), ACTION_INTERRUPT_NUMBER);
			for _ in 0..1_000_000 {
				if peer.ipi_sequence() != sequence {
					break;
				}
				processor::pause();
			}
		}
	});
}

/// Handler body for the generic action vector, entered at IPI level.
pub(crate) fn handle_action_interrupt() {
	let core = CoreLocal::get();
	let (action, parameter) = core.take_ipi_action();

	match action {
		a if a == CpuAction::PerformTlbShootdown as u8 => {
			processor::invalidate_tlb_entry(VirtAddr::new(parameter));
			core.acknowledge_ipi();
		}
		a if a == CpuAction::Stop as u8 => {
			core.acknowledge_ipi();
			eoi();
			processor::shutdown();
		}
		_ => {
			core.acknowledge_ipi();
		}
	}
}
