// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The block-device layer: a sector-granular interface and a fixed-size
//! registry the filesystem drivers index into.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::bugcheck::{self, StopCode};
use crate::config::MAX_BLOCK_DEVICES;
use crate::status::{Result, Status};
use crate::synch::spinlock::Spinlock;

pub const SECTOR_SIZE: usize = 512;

/// One registered block device. Implementations are expected to accept
/// concurrent calls.
pub trait BlockInterface: Send + Sync {
	fn read_sector(&self, lba: u64, buffer: &mut [u8; SECTOR_SIZE]) -> Result<()>;
	fn write_sector(&self, lba: u64, buffer: &[u8; SECTOR_SIZE]) -> Result<()>;
}

static BLOCK_DEVICES: Spinlock<[Option<&'static dyn BlockInterface>; MAX_BLOCK_DEVICES]> =
	Spinlock::new([None; MAX_BLOCK_DEVICES]);

/// Register a device and return its index.
///
/// Exceeding the table is fatal; a kernel that discovered more devices
/// than it can track is misconfigured beyond repair.
pub fn register_device(device: &'static dyn BlockInterface) -> usize {
	let mut devices = BLOCK_DEVICES.lock();
	for (index, slot) in devices.iter_mut().enumerate() {
		if slot.is_none() {
			*slot = Some(device);
			return index;
		}
	}
	bugcheck::bugcheck(StopCode::BlockDeviceLimitReached, MAX_BLOCK_DEVICES as u64);
}

pub fn device(index: usize) -> Option<&'static dyn BlockInterface> {
	BLOCK_DEVICES.lock().get(index).copied().flatten()
}

pub fn device_count() -> usize {
	BLOCK_DEVICES.lock().iter().filter(|slot| slot.is_some()).count()
}

/// A memory-backed disk. Stands in for rotating hardware wherever the
/// block contract is exercised without a controller.
pub struct RamDisk {
	sectors: Spinlock<Vec<[u8; SECTOR_SIZE]>>,
}

impl RamDisk {
	pub fn new(sector_count: usize) -> Self {
		Self {
			sectors: Spinlock::new(vec![[0; SECTOR_SIZE]; sector_count]),
		}
	}

	pub fn leak(sector_count: usize) -> &'static Self {
		Box::leak(Box::new(Self::new(sector_count)))
	}
}

impl BlockInterface for RamDisk {
	fn read_sector(&self, lba: u64, buffer: &mut [u8; SECTOR_SIZE]) -> Result<()> {
		let sectors = self.sectors.lock();
		let sector = sectors.get(lba as usize).ok_or(Status::InvalidArgument)?;
		buffer.copy_from_slice(sector);
		Ok(())
	}

	fn write_sector(&self, lba: u64, buffer: &[u8; SECTOR_SIZE]) -> Result<()> {
		let mut sectors = self.sectors.lock();
		let sector = sectors
			.get_mut(lba as usize)
			.ok_or(Status::InvalidArgument)?;
		sector.copy_from_slice(buffer);
		Ok(())
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;
	use crate::arch::kernel::core_local::test_support::HOST_CORE_LOCK;

	#[test]
	fn ram_disk_round_trips_sectors() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		let disk = RamDisk::new(8);
		let mut out = [0u8; SECTOR_SIZE];
		let mut pattern = [0u8; SECTOR_SIZE];
		for (index, byte) in pattern.iter_mut().enumerate() {
			*byte = index as u8;
		}

		disk.write_sector(3, &pattern).unwrap();
		disk.read_sector(3, &mut out).unwrap();
		assert_eq!(out, pattern);

		// Untouched sectors stay zeroed.
		disk.read_sector(4, &mut out).unwrap();
		assert!(out.iter().all(|&byte| byte == 0));
	}

	#[test]
	fn out_of_range_sectors_are_rejected() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		let disk = RamDisk::new(2);
		let mut buffer = [0u8; SECTOR_SIZE];
		assert_eq!(
			disk.read_sector(2, &mut buffer),
			Err(Status::InvalidArgument)
		);
		assert_eq!(disk.write_sector(9, &buffer), Err(Status::InvalidArgument));
	}

	#[test]
	fn registry_hands_out_indices_in_order() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		let first = register_device(RamDisk::leak(1));
		let second = register_device(RamDisk::leak(1));
		assert_eq!(second, first + 1);
		assert!(device(first).is_some());
		assert!(device_count() >= 2);
	}
}
