// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The virtual file system: a small mount table dispatching by longest
//! path-prefix match to whichever driver claims the subtree.

pub mod mem;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::config::MAX_MOUNT_POINTS;
use crate::status::{Result, Status};
use crate::synch::spinlock::Spinlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
	/// Create the file; fails if it already exists.
	Create,
	/// Create or replace the file's contents.
	Truncate,
	/// Create or extend the file.
	Append,
}

/// A mounted filesystem driver.
pub trait FsInterface: Send + Sync {
	fn read(&self, path: &str) -> Result<Vec<u8>>;
	fn write(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<()>;
	fn delete(&self, path: &str) -> Result<()>;
	fn mkdir(&self, path: &str) -> Result<()>;
	fn rmdir(&self, path: &str) -> Result<()>;
	fn listdir(&self, path: &str) -> Result<Vec<String>>;
	fn is_dir_empty(&self, path: &str) -> Result<bool>;
}

struct Mount {
	prefix: String,
	filesystem: Box<dyn FsInterface>,
}

static MOUNTS: Spinlock<Vec<Mount>> = Spinlock::new(Vec::new());

/// Mount a driver at `prefix`. The table is small and fixed by design.
pub fn mount(prefix: &str, filesystem: Box<dyn FsInterface>) -> Result<()> {
	if !prefix.starts_with('/') {
		return Err(Status::InvalidArgument);
	}
	let mut mounts = MOUNTS.lock();
	if mounts.len() >= MAX_MOUNT_POINTS {
		return Err(Status::NoResources);
	}
	if mounts.iter().any(|mount| mount.prefix == prefix) {
		return Err(Status::AlreadyExists);
	}
	mounts.push(Mount {
		prefix: String::from(prefix),
		filesystem,
	});
	Ok(())
}

/// Resolve `path` to its mount and run `f` on the driver with the
/// mount-relative remainder.
fn with_filesystem<R>(path: &str, f: impl FnOnce(&dyn FsInterface, &str) -> Result<R>) -> Result<R> {
	if !path.starts_with('/') {
		return Err(Status::InvalidArgument);
	}

	let mounts = MOUNTS.lock();
	let mount = mounts
		.iter()
		.filter(|mount| {
			let prefix = mount.prefix.as_str();
			path == prefix
				|| prefix == "/"
				|| (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
		})
		.max_by_key(|mount| mount.prefix.len())
		.ok_or(Status::NotFound)?;

	let relative = if mount.prefix == "/" {
		path
	} else {
		&path[mount.prefix.len()..]
	};
	let relative = if relative.is_empty() { "/" } else { relative };
	f(&*mount.filesystem, relative)
}

pub fn read(path: &str) -> Result<Vec<u8>> {
	with_filesystem(path, |fs, relative| fs.read(relative))
}

pub fn write(path: &str, data: &[u8], mode: WriteMode) -> Result<()> {
	with_filesystem(path, |fs, relative| fs.write(relative, data, mode))
}

pub fn delete(path: &str) -> Result<()> {
	with_filesystem(path, |fs, relative| fs.delete(relative))
}

pub fn mkdir(path: &str) -> Result<()> {
	with_filesystem(path, |fs, relative| fs.mkdir(relative))
}

pub fn rmdir(path: &str) -> Result<()> {
	with_filesystem(path, |fs, relative| fs.rmdir(relative))
}

pub fn listdir(path: &str) -> Result<Vec<String>> {
	with_filesystem(path, |fs, relative| fs.listdir(relative))
}

pub fn is_dir_empty(path: &str) -> Result<bool> {
	with_filesystem(path, |fs, relative| fs.is_dir_empty(relative))
}

/// Mount the root filesystem.
pub fn init() {
	mount("/", Box::new(mem::MemFilesystem::new())).expect("root already mounted");
	info!("mounted in-memory filesystem at /");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;
	use crate::arch::kernel::core_local::test_support::HOST_CORE_LOCK;

	#[test]
	fn longest_prefix_wins() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		mount("/vfs_a", Box::new(mem::MemFilesystem::new())).unwrap();
		mount("/vfs_a/nested", Box::new(mem::MemFilesystem::new())).unwrap();

		// A file under the nested mount is not visible through the outer
		// one.
		write("/vfs_a/nested/file", b"inner", WriteMode::Create).unwrap();
		assert_eq!(read("/vfs_a/nested/file").unwrap(), b"inner");
		assert_eq!(listdir("/vfs_a").unwrap().len(), 0);

		write("/vfs_a/other", b"outer", WriteMode::Create).unwrap();
		assert_eq!(listdir("/vfs_a").unwrap(), ["other"]);
	}

	#[test]
	fn unmounted_paths_and_relative_paths_are_rejected() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		assert_eq!(read("/vfs_nowhere/x"), Err(Status::NotFound));
		assert_eq!(read("relative"), Err(Status::InvalidArgument));
	}

	#[test]
	fn duplicate_mounts_are_rejected() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		mount("/vfs_dup", Box::new(mem::MemFilesystem::new())).unwrap();
		assert_eq!(
			mount("/vfs_dup", Box::new(mem::MemFilesystem::new())).err(),
			Some(Status::AlreadyExists)
		);
	}
}
