// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A preemptive SMP kernel for x86_64 long mode.
//!
//! Entered from a UEFI-style loader through [`kernel_main`] with a
//! [`BootInfo`] handoff. The boot processor builds the memory managers,
//! brings the application processors up, starts the per-CPU timers and
//! hands control to the scheduler.

#![no_std]

// EXTERNAL CRATES
#[macro_use]
extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;
#[cfg(not(target_os = "none"))]
#[macro_use]
extern crate std;

#[macro_use]
mod macros;

pub mod arch;
pub mod bugcheck;
pub mod config;
pub mod console;
pub mod drivers;
pub mod fs;
pub mod logging;
pub mod mm;
#[cfg(target_os = "none")]
mod runtime_glue;
pub mod scheduler;
pub mod status;
pub mod synch;

pub use crate::arch::kernel::BootInfo;

/// First kernel thread: bring the collaborator layers up, then idle out.
#[cfg(target_os = "none")]
extern "C" fn initd(_argument: usize) {
	fs::init();
	info!("initd: system ready");
}

/// Entry point for the boot processor.
///
/// The loader is expected to have switched to long mode with the page
/// tables named by `boot_info` and to keep physical memory visible
/// through the higher-half window.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main(boot_info: &'static BootInfo) -> ! {
	arch::kernel::boot_processor_init(boot_info);

	info!("Welcome to mantle {}", env!("CARGO_PKG_VERSION"));
	info!(
		"framebuffer {}x{} at {:#x}",
		boot_info.framebuffer_width, boot_info.framebuffer_height, boot_info.framebuffer_base
	);

	scheduler::process::init_system_process();

	// Interrupts go live before the APs do: a booting AP may shoot down
	// TLB entries and needs this CPU to acknowledge.
	arch::kernel::processor::enable_interrupts();

	#[cfg(feature = "smp")]
	arch::kernel::smp::boot_application_processors();

	scheduler::spawn(initd, 0).expect("cannot spawn initd");

	arch::kernel::apic::start_timer();

	scheduler::schedule()
}
