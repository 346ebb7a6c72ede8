// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An in-memory filesystem.
//!
//! Backs the root mount during bringup and gives the VFS contract a
//! self-contained implementation: a tree of directories and byte-vector
//! files behind one lock.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use super::{FsInterface, WriteMode};
use crate::status::{Result, Status};
use crate::synch::spinlock::Spinlock;

enum MemNode {
	File(Vec<u8>),
	Directory(BTreeMap<String, MemNode>),
}

impl MemNode {
	fn as_directory(&self) -> Result<&BTreeMap<String, MemNode>> {
		match self {
			MemNode::Directory(entries) => Ok(entries),
			MemNode::File(_) => Err(Status::NotADirectory),
		}
	}

	fn as_directory_mut(&mut self) -> Result<&mut BTreeMap<String, MemNode>> {
		match self {
			MemNode::Directory(entries) => Ok(entries),
			MemNode::File(_) => Err(Status::NotADirectory),
		}
	}
}

pub struct MemFilesystem {
	root: Spinlock<MemNode>,
}

impl MemFilesystem {
	pub fn new() -> Self {
		Self {
			root: Spinlock::new(MemNode::Directory(BTreeMap::new())),
		}
	}
}

impl Default for MemFilesystem {
	fn default() -> Self {
		Self::new()
	}
}

fn components(path: &str) -> impl Iterator<Item = &str> {
	path.split('/').filter(|component| !component.is_empty())
}

/// Split a path into its parent components and final name.
fn split_parent(path: &str) -> Result<(Vec<&str>, &str)> {
	let mut parts: Vec<&str> = components(path).collect();
	let name = parts.pop().ok_or(Status::InvalidArgument)?;
	Ok((parts, name))
}

fn descend<'a>(root: &'a MemNode, parts: &[&str]) -> Result<&'a MemNode> {
	let mut node = root;
	for part in parts {
		node = node
			.as_directory()?
			.get(*part)
			.ok_or(Status::NotFound)?;
	}
	Ok(node)
}

fn descend_mut<'a>(root: &'a mut MemNode, parts: &[&str]) -> Result<&'a mut MemNode> {
	let mut node = root;
	for part in parts {
		node = node
			.as_directory_mut()?
			.get_mut(*part)
			.ok_or(Status::NotFound)?;
	}
	Ok(node)
}

impl FsInterface for MemFilesystem {
	fn read(&self, path: &str) -> Result<Vec<u8>> {
		let root = self.root.lock();
		let parts: Vec<&str> = components(path).collect();
		match descend(&root, &parts)? {
			MemNode::File(data) => Ok(data.clone()),
			MemNode::Directory(_) => Err(Status::InvalidArgument),
		}
	}

	fn write(&self, path: &str, data: &[u8], mode: WriteMode) -> Result<()> {
		let mut root = self.root.lock();
		let (parents, name) = split_parent(path)?;
		let directory = descend_mut(&mut root, &parents)?.as_directory_mut()?;

		match directory.get_mut(name) {
			None => {
				directory.insert(String::from(name), MemNode::File(data.to_vec()));
				Ok(())
			}
			Some(MemNode::File(existing)) => match mode {
				WriteMode::Create => Err(Status::AlreadyExists),
				WriteMode::Truncate => {
					existing.clear();
					existing.extend_from_slice(data);
					Ok(())
				}
				WriteMode::Append => {
					existing.extend_from_slice(data);
					Ok(())
				}
			},
			Some(MemNode::Directory(_)) => Err(Status::InvalidArgument),
		}
	}

	fn delete(&self, path: &str) -> Result<()> {
		let mut root = self.root.lock();
		let (parents, name) = split_parent(path)?;
		let directory = descend_mut(&mut root, &parents)?.as_directory_mut()?;
		match directory.get(name) {
			Some(MemNode::File(_)) => {
				directory.remove(name);
				Ok(())
			}
			Some(MemNode::Directory(_)) => Err(Status::InvalidArgument),
			None => Err(Status::NotFound),
		}
	}

	fn mkdir(&self, path: &str) -> Result<()> {
		let mut root = self.root.lock();
		let (parents, name) = split_parent(path)?;
		let directory = descend_mut(&mut root, &parents)?.as_directory_mut()?;
		if directory.contains_key(name) {
			return Err(Status::AlreadyExists);
		}
		directory.insert(String::from(name), MemNode::Directory(BTreeMap::new()));
		Ok(())
	}

	fn rmdir(&self, path: &str) -> Result<()> {
		let mut root = self.root.lock();
		let (parents, name) = split_parent(path)?;
		let directory = descend_mut(&mut root, &parents)?.as_directory_mut()?;
		match directory.get(name) {
			Some(MemNode::Directory(entries)) => {
				if !entries.is_empty() {
					return Err(Status::NotEmpty);
				}
				directory.remove(name);
				Ok(())
			}
			Some(MemNode::File(_)) => Err(Status::NotADirectory),
			None => Err(Status::NotFound),
		}
	}

	fn listdir(&self, path: &str) -> Result<Vec<String>> {
		let root = self.root.lock();
		let parts: Vec<&str> = components(path).collect();
		let directory = descend(&root, &parts)?.as_directory()?;
		Ok(directory.keys().cloned().collect())
	}

	fn is_dir_empty(&self, path: &str) -> Result<bool> {
		let root = self.root.lock();
		let parts: Vec<&str> = components(path).collect();
		Ok(descend(&root, &parts)?.as_directory()?.is_empty())
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;
	use crate::arch::kernel::core_local::test_support::HOST_CORE_LOCK;

	#[test]
	fn files_round_trip() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		let fs = MemFilesystem::new();
		fs.write("/hello", b"first", WriteMode::Create).unwrap();
		assert_eq!(fs.read("/hello").unwrap(), b"first");

		assert_eq!(
			fs.write("/hello", b"again", WriteMode::Create),
			Err(Status::AlreadyExists)
		);
		fs.write("/hello", b"again", WriteMode::Truncate).unwrap();
		assert_eq!(fs.read("/hello").unwrap(), b"again");
		fs.write("/hello", b"+more", WriteMode::Append).unwrap();
		assert_eq!(fs.read("/hello").unwrap(), b"again+more");
	}

	#[test]
	fn directories_nest_and_list_sorted() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		let fs = MemFilesystem::new();
		fs.mkdir("/etc").unwrap();
		fs.mkdir("/etc/conf.d").unwrap();
		fs.write("/etc/passwd", b"root", WriteMode::Create).unwrap();
		fs.write("/etc/conf.d/net", b"dhcp", WriteMode::Create)
			.unwrap();

		assert_eq!(fs.listdir("/etc").unwrap(), ["conf.d", "passwd"]);
		assert!(!fs.is_dir_empty("/etc").unwrap());
		assert!(!fs.is_dir_empty("/etc/conf.d").unwrap());
	}

	#[test]
	fn rmdir_refuses_non_empty_directories() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		let fs = MemFilesystem::new();
		fs.mkdir("/tmp").unwrap();
		fs.write("/tmp/file", b"x", WriteMode::Create).unwrap();

		assert_eq!(fs.rmdir("/tmp"), Err(Status::NotEmpty));
		fs.delete("/tmp/file").unwrap();
		assert!(fs.is_dir_empty("/tmp").unwrap());
		fs.rmdir("/tmp").unwrap();
		assert_eq!(fs.listdir("/tmp"), Err(Status::NotFound));
	}

	#[test]
	fn deleting_missing_entries_reports_not_found() {
		let _guard = HOST_CORE_LOCK.lock().unwrap();
		let fs = MemFilesystem::new();
		assert_eq!(fs.delete("/ghost"), Err(Status::NotFound));
		assert_eq!(fs.read("/ghost"), Err(Status::NotFound));
		assert_eq!(fs.rmdir("/ghost"), Err(Status::NotFound));
	}
}
