// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Status codes returned by fallible kernel services.
//!
//! Invariant violations never surface here. They take the bugcheck path
//! with a stop code instead (see [`crate::bugcheck`]).

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	#[error("invalid argument")]
	InvalidArgument,
	#[error("out of memory")]
	NoMemory,
	#[error("out of resources")]
	NoResources,
	#[error("not found")]
	NotFound,
	#[error("already exists")]
	AlreadyExists,
	#[error("translation already present")]
	AlreadyMapped,
	#[error("translation not present")]
	NotMapped,
	#[error("device table full")]
	DeviceTableFull,
	#[error("directory not empty")]
	NotEmpty,
	#[error("not a directory")]
	NotADirectory,
	#[error("operation timed out")]
	TimedOut,
	#[error("operation not supported")]
	Unsupported,
}

pub type Result<T> = core::result::Result<T, Status>;
