// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use log::{Level, LevelFilter, Metadata, Record};

/// Kernel logger writing through the serial console.
///
/// Every record is prefixed with the id of the CPU that produced it.
struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= Level::Info
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			println!(
				"[{}][{}] {}",
				crate::arch::kernel::core_local::core_id(),
				record.level(),
				record.args()
			);
		}
	}

	fn flush(&self) {}
}

pub unsafe fn init() {
	log::set_logger(&LOGGER).expect("logging already initialized");
	log::set_max_level(LevelFilter::Info);
}
