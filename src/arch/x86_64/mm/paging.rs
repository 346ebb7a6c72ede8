// Copyright (c) The Mantle Project Developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! 4-level page-table management through the recursive mapping.
//!
//! Entry 511 of every PML4 points back at the PML4 itself. Any table of
//! the current address space is therefore reachable through a virtual
//! address built from recursive indices, without a physical-to-virtual
//! map for page tables. The slot is installed before the first access
//! and carried into every address space ever created.
//!
//! Every mutation of the active address space is published with a store
//! fence, shot down on all other CPUs and then invalidated locally.

#![allow(dead_code)]

use core::ptr;

use super::physicalmem::{self, FRAME_SIZE};
use super::{PhysAddr, VirtAddr};
use crate::arch::kernel::core_local::record_function;
use crate::arch::kernel::irql::{self, Irql};
use crate::arch::kernel::processor;
use crate::bugcheck::{self, AdditionalInfo, StopCode};
use crate::status::{Result, Status};

/// PML4 slot that maps the table hierarchy onto itself.
pub const RECURSIVE_INDEX: u64 = 511;

const PAGE_BITS: u64 = 12;
const PAGE_MAP_BITS: u64 = 9;
const PAGE_MAP_MASK: u64 = 0x1FF;

/// Mask selecting the frame base stored in an entry.
const ENTRY_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
	/// Possible flags for an entry in either table (PML4, PDPT, PD, PT).
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PageTableEntryFlags: u64 {
		/// Set if this entry is valid and points to a page or table.
		const PRESENT = 1 << 0;
		/// Set if memory referenced by this entry shall be writable.
		const WRITABLE = 1 << 1;
		/// Set if memory referenced by this entry shall be accessible from Ring 3.
		const USER_ACCESSIBLE = 1 << 2;
		/// Set if Write-Through caching shall be enabled for this entry.
		const WRITE_THROUGH = 1 << 3;
		/// Set if caching shall be disabled for memory referenced by this entry.
		const CACHE_DISABLE = 1 << 4;
		const ACCESSED = 1 << 5;
		/// Only for page entries: set if the referenced memory was written to.
		const DIRTY = 1 << 6;
		/// Only for PDPT/PD entries: this entry references a 1 GiB or 2 MiB page.
		const HUGE_PAGE = 1 << 7;
		/// Translation survives a CR3 reload.
		const GLOBAL = 1 << 8;
	}
}

impl PageTableEntryFlags {
	pub fn device(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::CACHE_DISABLE);
		self
	}

	pub fn normal(&mut self) -> &mut Self {
		self.remove(PageTableEntryFlags::CACHE_DISABLE);
		self
	}

	pub fn writable(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::WRITABLE);
		self
	}

	pub fn user(&mut self) -> &mut Self {
		self.insert(PageTableEntryFlags::USER_ACCESSIBLE);
		self
	}
}

/// Sign-extend bit 47 into bits 63..48.
#[inline]
pub const fn canonicalize(address: u64) -> u64 {
	if address & (1 << 47) != 0 {
		address | 0xFFFF_0000_0000_0000
	} else {
		address & 0x0000_FFFF_FFFF_FFFF
	}
}

#[inline]
pub const fn pml4_index(address: u64) -> u64 {
	(address >> 39) & PAGE_MAP_MASK
}

#[inline]
pub const fn pdpt_index(address: u64) -> u64 {
	(address >> 30) & PAGE_MAP_MASK
}

#[inline]
pub const fn pd_index(address: u64) -> u64 {
	(address >> 21) & PAGE_MAP_MASK
}

#[inline]
pub const fn pt_index(address: u64) -> u64 {
	(address >> PAGE_BITS) & PAGE_MAP_MASK
}

#[inline]
const fn page_offset(address: u64) -> u64 {
	address & 0xFFF
}

/// Virtual address of the PML4 of the current address space.
#[inline]
pub const fn recursive_pml4() -> u64 {
	canonicalize(
		(RECURSIVE_INDEX << 39)
			| (RECURSIVE_INDEX << 30)
			| (RECURSIVE_INDEX << 21)
			| (RECURSIVE_INDEX << PAGE_BITS),
	)
}

/// Virtual address of the PDPT covering `pml4_i`.
#[inline]
pub const fn recursive_pdpt(pml4_i: u64) -> u64 {
	canonicalize(
		(RECURSIVE_INDEX << 39)
			| (RECURSIVE_INDEX << 30)
			| (RECURSIVE_INDEX << 21)
			| (pml4_i << PAGE_BITS),
	)
}

/// Virtual address of the PD covering `pml4_i`/`pdpt_i`.
#[inline]
pub const fn recursive_pd(pml4_i: u64, pdpt_i: u64) -> u64 {
	canonicalize(
		(RECURSIVE_INDEX << 39)
			| (RECURSIVE_INDEX << 30)
			| (pml4_i << 21)
			| (pdpt_i << PAGE_BITS),
	)
}

/// Virtual address of the PT covering `pml4_i`/`pdpt_i`/`pd_i`.
#[inline]
pub const fn recursive_pt(pml4_i: u64, pdpt_i: u64, pd_i: u64) -> u64 {
	canonicalize((RECURSIVE_INDEX << 39) | (pml4_i << 30) | (pdpt_i << 21) | (pd_i << PAGE_BITS))
}

/// One entry in any of the four table levels.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
	pub const fn empty() -> Self {
		Self(0)
	}

	pub const fn new(address: PhysAddr, flags: PageTableEntryFlags) -> Self {
		Self((address.as_u64() & ENTRY_ADDRESS_MASK) | flags.bits())
	}

	pub const fn address(self) -> PhysAddr {
		PhysAddr::new(self.0 & ENTRY_ADDRESS_MASK)
	}

	pub const fn is_present(self) -> bool {
		self.0 & PageTableEntryFlags::PRESENT.bits() != 0
	}

	/// Whether this PDPT/PD entry maps a large page directly.
	pub const fn is_huge(self) -> bool {
		self.0 & PageTableEntryFlags::HUGE_PAGE.bits() != 0
	}

	pub const fn raw(self) -> u64 {
		self.0
	}

	pub fn insert_flags(&mut self, flags: PageTableEntryFlags) {
		self.0 |= flags.bits();
	}

	pub fn remove_flags(&mut self, flags: PageTableEntryFlags) {
		self.0 &= !flags.bits();
	}
}

#[inline]
unsafe fn entry_at(table: u64, index: u64) -> *mut PageTableEntry {
	(table as *mut PageTableEntry).wrapping_add(index as usize)
}

/// Publish a PTE store and invalidate `va` everywhere.
fn flush_everywhere(va: u64) {
	processor::store_fence();
	crate::arch::kernel::apic::ipi_tlb_shootdown(va);
	processor::invalidate_tlb_entry(VirtAddr::new(va));
}

/// Install the recursive slot in the loader-provided PML4 and reload CR3.
#[cfg(target_os = "none")]
pub fn init() {
	record_function("paging::init");

	let pml4_phys = PhysAddr::new(crate::arch::kernel::boot_info().pml4_physical);
	let pml4 = super::phys_to_virt(pml4_phys).as_mut_ptr::<PageTableEntry>();
	let mut flags = PageTableEntryFlags::PRESENT;
	flags.writable();
	unsafe {
		pml4.add(RECURSIVE_INDEX as usize)
			.write_volatile(PageTableEntry::new(pml4_phys, flags));
	}
	processor::flush_tlb_all();

	// `map` never creates intermediate tables, so the chain covering the
	// heap base has to exist before the first heap frame is mapped.
	ensure_kernel_tables(super::HEAP_START).expect("cannot build heap page tables");
}

/// Make sure the PDPT/PD/PT chain covering `va` exists in the kernel
/// address space, allocating tables straight from the frame pool.
///
/// Unlike [`AddressSpace::ensure_tables`] this works without the heap
/// and on the live tables; fresh intermediates are kernel-only. Newly
/// present entries cannot be stale in any TLB, so no shootdown is
/// needed here.
pub(crate) fn ensure_kernel_tables(va: u64) -> Result<()> {
	let va = canonicalize(va);

	unsafe {
		let pml4 = super::phys_to_virt(PhysAddr::new(processor::root_page_table()))
			.as_mut_ptr::<PageTableEntry>();
		let pdpt = boot_descend(pml4, pml4_index(va))?;
		let pd = boot_descend(pdpt, pdpt_index(va))?;
		boot_descend(pd, pd_index(va))?;
	}
	Ok(())
}

unsafe fn boot_descend(table: *mut PageTableEntry, index: u64) -> Result<*mut PageTableEntry> {
	let entry_ptr = unsafe { table.add(index as usize) };
	let entry = unsafe { *entry_ptr };
	if entry.is_present() {
		return Ok(super::phys_to_virt(entry.address()).as_mut_ptr());
	}

	let frame = physicalmem::allocate_frame();
	if frame == PhysAddr::zero() {
		return Err(Status::NoMemory);
	}
	let fresh = super::phys_to_virt(frame).as_mut_ptr::<PageTableEntry>();
	unsafe {
		ptr::write_bytes(fresh.cast::<u8>(), 0, FRAME_SIZE);
		let mut flags = PageTableEntryFlags::PRESENT;
		flags.writable();
		entry_ptr.write_volatile(PageTableEntry::new(frame, flags));
	}
	Ok(fresh)
}

/// Map one 4 KiB page in the current address space.
///
/// Refuses if a translation is already present. All intermediate tables
/// must exist; a hole at any level indicates a damaged kernel space.
pub fn map(va: u64, pa: PhysAddr, flags: PageTableEntryFlags) -> Result<()> {
	record_function("paging::map");
	if is_mapped(va) {
		return Err(Status::AlreadyMapped);
	}

	let va = canonicalize(va);
	let (p4, p3, p2, p1) = (pml4_index(va), pdpt_index(va), pd_index(va), pt_index(va));

	unsafe {
		if !(*entry_at(recursive_pml4(), p4)).is_present() {
			bugcheck::bugcheck_ex(
				StopCode::BadPaging,
				&AdditionalInfo::with_message(format_args!(
					"missing PDPT while mapping {va:#x} -> {pa:?}"
				)),
			);
		}
		if !(*entry_at(recursive_pdpt(p4), p3)).is_present() {
			bugcheck::bugcheck_ex(
				StopCode::BadPaging,
				&AdditionalInfo::with_message(format_args!(
					"missing PD while mapping {va:#x} -> {pa:?}"
				)),
			);
		}
		if !(*entry_at(recursive_pd(p4, p3), p2)).is_present() {
			bugcheck::bugcheck_ex(
				StopCode::BadPaging,
				&AdditionalInfo::with_message(format_args!(
					"missing PT while mapping {va:#x} -> {pa:?}"
				)),
			);
		}

		entry_at(recursive_pt(p4, p3, p2), p1).write_volatile(PageTableEntry::new(pa, flags));
	}
	flush_everywhere(va);
	Ok(())
}

/// Remove the translation for `va` and free the backing frame.
///
/// Returns whether a translation existed. 2 MiB and 1 GiB leaves are
/// recognized and freed as a whole.
pub fn unmap(va: u64) -> bool {
	record_function("paging::unmap");
	irql::enforce_max(Irql::DISPATCH);

	let va = canonicalize(va);
	let (p4, p3, p2, p1) = (pml4_index(va), pdpt_index(va), pd_index(va), pt_index(va));

	unsafe {
		if !(*entry_at(recursive_pml4(), p4)).is_present() {
			return false;
		}

		let pdpt_entry_ptr = entry_at(recursive_pdpt(p4), p3);
		let pdpt_entry = *pdpt_entry_ptr;
		if pdpt_entry.is_huge() {
			pdpt_entry_ptr.write_volatile(PageTableEntry::empty());
			flush_everywhere(va);
			physicalmem::deallocate_frame(pdpt_entry.address());
			return true;
		}
		if !pdpt_entry.is_present() {
			return false;
		}

		let pd_entry_ptr = entry_at(recursive_pd(p4, p3), p2);
		let pd_entry = *pd_entry_ptr;
		if pd_entry.is_huge() {
			pd_entry_ptr.write_volatile(PageTableEntry::empty());
			flush_everywhere(va);
			physicalmem::deallocate_frame(pd_entry.address());
			return true;
		}
		if !pd_entry.is_present() {
			return false;
		}

		let pt_entry_ptr = entry_at(recursive_pt(p4, p3, p2), p1);
		let pt_entry = *pt_entry_ptr;
		if !pt_entry.is_present() {
			return false;
		}

		pt_entry_ptr.write_volatile(PageTableEntry::empty());
		flush_everywhere(va);
		physicalmem::deallocate_frame(pt_entry.address());
		true
	}
}

/// Translate a virtual address. Returns the zero address if no
/// translation exists.
pub fn translate(va: u64) -> PhysAddr {
	let va = canonicalize(va);
	let (p4, p3, p2, p1) = (pml4_index(va), pdpt_index(va), pd_index(va), pt_index(va));

	unsafe {
		if !(*entry_at(recursive_pml4(), p4)).is_present() {
			return PhysAddr::zero();
		}

		let pdpt_entry = *entry_at(recursive_pdpt(p4), p3);
		if !pdpt_entry.is_present() {
			return PhysAddr::zero();
		}
		if pdpt_entry.is_huge() {
			return PhysAddr::new(pdpt_entry.address().as_u64() + (va & ((1 << 30) - 1)));
		}

		let pd_entry = *entry_at(recursive_pd(p4, p3), p2);
		if !pd_entry.is_present() {
			return PhysAddr::zero();
		}
		if pd_entry.is_huge() {
			return PhysAddr::new(pd_entry.address().as_u64() + (va & ((1 << 21) - 1)));
		}

		let pt_entry = *entry_at(recursive_pt(p4, p3, p2), p1);
		if !pt_entry.is_present() {
			return PhysAddr::zero();
		}
		PhysAddr::new(pt_entry.address().as_u64() + page_offset(va))
	}
}

/// Whether a translation exists for `va` at every level.
pub fn is_mapped(va: u64) -> bool {
	let va = canonicalize(va);
	let (p4, p3, p2, p1) = (pml4_index(va), pdpt_index(va), pd_index(va), pt_index(va));

	unsafe {
		if !(*entry_at(recursive_pml4(), p4)).is_present() {
			return false;
		}
		let pdpt_entry = *entry_at(recursive_pdpt(p4), p3);
		if !pdpt_entry.is_present() {
			return false;
		}
		if pdpt_entry.is_huge() {
			return true;
		}
		let pd_entry = *entry_at(recursive_pd(p4, p3), p2);
		if !pd_entry.is_present() {
			return false;
		}
		if pd_entry.is_huge() {
			return true;
		}
		(*entry_at(recursive_pt(p4, p3, p2), p1)).is_present()
	}
}

fn edit_leaf(va: u64, edit: impl FnOnce(&mut PageTableEntry)) {
	irql::enforce_max(Irql::DISPATCH);

	let va = canonicalize(va);
	let (p4, p3, p2, p1) = (pml4_index(va), pdpt_index(va), pd_index(va), pt_index(va));

	unsafe {
		if !(*entry_at(recursive_pml4(), p4)).is_present()
			|| !(*entry_at(recursive_pdpt(p4), p3)).is_present()
			|| !(*entry_at(recursive_pd(p4, p3), p2)).is_present()
		{
			return;
		}
		let entry_ptr = entry_at(recursive_pt(p4, p3, p2), p1);
		let mut entry = *entry_ptr;
		if !entry.is_present() {
			return;
		}
		edit(&mut entry);
		entry_ptr.write_volatile(entry);
	}
	flush_everywhere(va);
}

pub fn set_writable(va: u64, writable: bool) {
	record_function("paging::set_writable");
	edit_leaf(va, |entry| {
		if writable {
			entry.insert_flags(PageTableEntryFlags::WRITABLE);
		} else {
			entry.remove_flags(PageTableEntryFlags::WRITABLE);
		}
	});
}

pub fn set_user_accessible(va: u64, user: bool) {
	record_function("paging::set_user_accessible");
	edit_leaf(va, |entry| {
		if user {
			entry.insert_flags(PageTableEntryFlags::USER_ACCESSIBLE);
		} else {
			entry.remove_flags(PageTableEntryFlags::USER_ACCESSIBLE);
		}
	});
}

pub fn add_flags(va: u64, flags: PageTableEntryFlags) {
	record_function("paging::add_flags");
	edit_leaf(va, |entry| entry.insert_flags(flags));
}

/// An owning handle to a process address space.
///
/// The higher half is shared with the kernel by copying the kernel PML4
/// slots once at creation; it is never mutated afterwards. The lower half
/// belongs exclusively to the owning process.
pub struct AddressSpace {
	pml4_virt: *mut PageTableEntry,
	pml4_phys: PhysAddr,
}

unsafe impl Send for AddressSpace {}

impl AddressSpace {
	/// Create an address space with the kernel half mapped and the
	/// recursive slot installed (kernel-only, never user-visible).
	/// Tables covering the image base are allocated eagerly.
	pub fn new() -> Result<Self> {
		record_function("AddressSpace::new");

		let pml4_virt = table_page()?;
		let pml4_phys = translate(pml4_virt as u64);

		unsafe {
			let kernel_pml4 = recursive_pml4() as *const PageTableEntry;
			for index in 256..512 {
				let entry = if index == RECURSIVE_INDEX as usize {
					let mut flags = PageTableEntryFlags::PRESENT;
					flags.writable();
					PageTableEntry::new(pml4_phys, flags)
				} else if cfg!(target_os = "none") {
					ptr::read(kernel_pml4.add(index))
				} else {
					PageTableEntry::empty()
				};
				pml4_virt.add(index).write(entry);
			}
		}

		let mut space = Self {
			pml4_virt,
			pml4_phys,
		};
		space.ensure_tables(crate::config::USER_IMAGE_BASE)?;
		Ok(space)
	}

	/// Handle to the kernel's own address space.
	pub fn kernel() -> Self {
		Self {
			pml4_virt: recursive_pml4() as *mut PageTableEntry,
			pml4_phys: PhysAddr::new(processor::root_page_table()),
		}
	}

	pub fn pml4_physical(&self) -> PhysAddr {
		self.pml4_phys
	}

	/// Walk the lower half of this address space, allocating intermediate
	/// tables as needed, and return the PT covering `va`.
	fn ensure_tables(&mut self, va: u64) -> Result<*mut PageTableEntry> {
		let va = canonicalize(va);
		let (p4, p3, p2) = (pml4_index(va), pdpt_index(va), pd_index(va));

		unsafe {
			let pdpt = descend(self.pml4_virt, p4)?;
			let pd = descend(pdpt, p3)?;
			descend(pd, p2)
		}
	}

	/// Map one page into this address space.
	///
	/// The space is not live on any CPU until its process is first
	/// dispatched, so no shootdown is required here.
	pub fn map(&mut self, va: u64, pa: PhysAddr, flags: PageTableEntryFlags) -> Result<()> {
		record_function("AddressSpace::map");
		let va = canonicalize(va);
		let pt = self.ensure_tables(va)?;
		unsafe {
			pt.add(pt_index(va) as usize)
				.write_volatile(PageTableEntry::new(pa, flags));
		}
		processor::store_fence();
		processor::invalidate_tlb_entry(VirtAddr::new(va));
		Ok(())
	}
}

/// Follow (or create) the table an entry points to, returning its kernel
/// virtual address. Fresh tables are present+rw+user.
unsafe fn descend(table: *mut PageTableEntry, index: u64) -> Result<*mut PageTableEntry> {
	let entry_ptr = unsafe { table.add(index as usize) };
	let entry = unsafe { *entry_ptr };

	if entry.is_present() {
		let virt = super::phys_to_virt(entry.address());
		return Ok(virt.as_mut_ptr());
	}

	let fresh = table_page()?;
	let fresh_phys = translate(fresh as u64);
	let mut flags = PageTableEntryFlags::PRESENT;
	flags.writable().user();
	unsafe {
		entry_ptr.write_volatile(PageTableEntry::new(fresh_phys, flags));
	}
	Ok(fresh)
}

/// Allocate one zeroed, page-aligned table from the kernel heap.
fn table_page() -> Result<*mut PageTableEntry> {
	let page = crate::mm::allocate(FRAME_SIZE, FRAME_SIZE);
	if page.is_null() {
		return Err(Status::NoMemory);
	}
	unsafe {
		ptr::write_bytes(page, 0, FRAME_SIZE);
	}
	Ok(page.cast())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn canonicalization_sign_extends_bit_47() {
		assert_eq!(canonicalize(0x0000_7FFF_FFFF_FFFF), 0x0000_7FFF_FFFF_FFFF);
		assert_eq!(canonicalize(0x0000_8000_0000_0000), 0xFFFF_8000_0000_0000);
		assert_eq!(canonicalize(0xFFFF_8000_0020_0000), 0xFFFF_8000_0020_0000);
		assert_eq!(canonicalize(0x00F0_8000_0000_0000), 0xFFFF_8000_0000_0000);
	}

	#[test]
	fn indices_decompose_a_virtual_address() {
		let va = 0xFFFF_8000_0020_0000u64;
		assert_eq!(pml4_index(va), 256);
		assert_eq!(pdpt_index(va), 0);
		assert_eq!(pd_index(va), 1);
		assert_eq!(pt_index(va), 0);
		assert_eq!(page_offset(va | 0x123), 0x123);
	}

	#[test]
	fn recursive_addresses_hit_the_self_map() {
		assert_eq!(recursive_pml4(), 0xFFFF_FFFF_FFFF_F000);
		assert_eq!(recursive_pdpt(0), 0xFFFF_FFFF_FFE0_0000);
		assert_eq!(recursive_pt(0, 0, 0), 0xFFFF_FF80_0000_0000);
		// Any table address must itself decompose through index 511.
		assert_eq!(pml4_index(recursive_pt(5, 6, 7)), RECURSIVE_INDEX);
		assert_eq!(pdpt_index(recursive_pt(5, 6, 7)), 5);
		assert_eq!(pd_index(recursive_pt(5, 6, 7)), 6);
		assert_eq!(pt_index(recursive_pt(5, 6, 7)), 7);
	}

	#[test]
	fn entries_separate_address_and_flags() {
		let mut flags = PageTableEntryFlags::PRESENT;
		flags.writable().user();
		let entry = PageTableEntry::new(PhysAddr::new(0x20_0000), flags);
		assert!(entry.is_present());
		assert!(!entry.is_huge());
		assert_eq!(entry.address().as_u64(), 0x20_0000);

		let mut entry = entry;
		entry.remove_flags(PageTableEntryFlags::WRITABLE);
		assert_eq!(entry.address().as_u64(), 0x20_0000);
		assert_eq!(
			entry.raw() & PageTableEntryFlags::WRITABLE.bits(),
			0
		);
	}

	#[test]
	fn huge_entries_are_recognized() {
		let mut flags = PageTableEntryFlags::PRESENT;
		flags.insert(PageTableEntryFlags::HUGE_PAGE);
		let entry = PageTableEntry::new(PhysAddr::new(0x4000_0000), flags);
		assert!(entry.is_huge());
	}
}
