// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use hermit_sync::InterruptSpinMutex;
use uart_16550::SerialPort;

const SERIAL_IO_PORT: u16 = 0x3F8;

pub(crate) static CONSOLE: InterruptSpinMutex<Console> =
	InterruptSpinMutex::new(Console::new());

pub(crate) struct Console {
	serial: SerialPort,
}

impl Console {
	const fn new() -> Self {
		Self {
			serial: unsafe { SerialPort::new(SERIAL_IO_PORT) },
		}
	}

	fn write_str(&mut self, s: &str) {
		for byte in s.bytes() {
			self.serial.send(byte);
		}
	}
}

impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		self.write_str(s);
		Ok(())
	}
}

pub fn init() {
	CONSOLE.lock().serial.init();
}

/// Emergency writer for the bugcheck path.
///
/// Bypasses the console lock, which may still be held by the faulting CPU.
#[cfg(target_os = "none")]
pub(crate) struct PanicWriter(SerialPort);

#[cfg(target_os = "none")]
impl PanicWriter {
	pub unsafe fn new() -> Self {
		Self(unsafe { SerialPort::new(SERIAL_IO_PORT) })
	}
}

#[cfg(target_os = "none")]
impl fmt::Write for PanicWriter {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		for byte in s.bytes() {
			self.0.send(byte);
		}
		Ok(())
	}
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
	use fmt::Write;
	CONSOLE.lock().write_fmt(args).unwrap();
}
