// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Glue between the language runtime and the kernel's fatal path.

use core::panic::PanicInfo;

use crate::bugcheck::{self, AdditionalInfo, StopCode};

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
	bugcheck::bugcheck_ex(
		StopCode::ManuallyInitiatedCrash,
		&AdditionalInfo::with_message(format_args!("kernel panic: {}", info.message())),
	)
}
