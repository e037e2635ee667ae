//! 2-level (page directory → page table) paging for `i686`.
//!
//! Entry/table shape follows the same builder idiom as the `x86_64`
//! module, sized down to 32-bit entries.

use corvid_mem::{MemoryMap, MemoryMapEntry, Phys, Pmm, PAGE_SIZE};
use corvid_sync::{Lock, Mutex};

use crate::{
	flags::{PageFlags, INTERMEDIATE_FLAGS},
	MapError, RemapError, UnmapError,
};

/// Entries per level of the 2-level tree.
const ENTRIES: usize = 1024;

/// Physical address bits of a 32-bit entry (`[31:12]`).
const ADDR_MASK: u32 = 0xffff_f000;

/// Bits `[31:22]` and `[21:12]` of a virtual address: page directory and
/// page table indices, respectively.
fn indices(virt: u64) -> [usize; 2] {
	let virt = virt as u32;
	[((virt >> 22) & 0x3ff) as usize, ((virt >> 12) & 0x3ff) as usize]
}

/// One level of the 2-level page table tree.
#[repr(C, align(4096))]
struct PageTable {
	/// The 1024 entries this table holds.
	entries: [PageTableEntry; ENTRIES],
}

static_assertions::const_assert_eq!(core::mem::size_of::<PageTable>(), 4096);

/// A single, 32-bit page table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
struct PageTableEntry(u32);

static_assertions::const_assert_eq!(core::mem::size_of::<PageTableEntry>(), 4);

impl PageTableEntry {
	/// Whether the present flag is set.
	const fn present(self) -> bool {
		self.0 & (PageFlags::PRESENT.bits() as u32) != 0
	}

	/// The physical address this entry points at, ignoring flag bits.
	const fn address(self) -> Phys {
		Phys::new((self.0 & ADDR_MASK) as u64)
	}

	/// This entry's flag bits, ignoring the address.
	fn flags(self) -> PageFlags {
		PageFlags::from_bits_truncate(u64::from(self.0 & !ADDR_MASK))
	}

	/// Overwrites this entry with `address` and `flags`. Bits of `flags`
	/// above 31 (e.g. [`PageFlags::NO_EXECUTE`]) are silently dropped —
	/// the 32-bit, non-PAE format this module implements has nowhere to
	/// put them.
	fn set(&mut self, address: Phys, flags: u64) {
		let address = address.address() as u32;
		self.0 = (address & ADDR_MASK) | (flags as u32 & !ADDR_MASK);
	}
}

/// A 32-bit address space: a page directory root plus the spinlock
/// serializing every walk of the tree beneath it.
pub struct Pagemap {
	/// Physical address of this pagemap's page directory.
	root: Phys,
	/// Serializes every `map`/`unmap`/`remap`/`translate` call against
	/// this pagemap. Distinct pagemaps never contend.
	lock: Mutex<()>,
}

impl Pagemap {
	/// Wraps an already-built page directory at `root`.
	///
	/// # Safety
	///
	/// `root` must be the physical address of a valid, page-aligned,
	/// zeroed-or-populated page directory that remains mapped for the
	/// handle's lifetime.
	#[must_use]
	pub const unsafe fn from_root(root: Phys) -> Self {
		Self { root, lock: Mutex::new(()) }
	}

	/// Allocates a fresh, zeroed page directory from `pmm`.
	///
	/// # Errors
	///
	/// Returns [`MapError`] if `pmm` cannot satisfy the single-page
	/// allocation.
	pub fn new(pmm: &Pmm) -> Result<Self, MapError> {
		let root = pmm.allocz(1)?;
		Ok(Self { root, lock: Mutex::new(()) })
	}

	/// The physical address of this pagemap's page directory.
	#[must_use]
	pub const fn root(&self) -> Phys {
		self.root
	}

	/// Returns the table `entry` points at, allocating and zeroing a
	/// fresh one (with `present | writable | user`) if it is absent.
	fn ensure_table<'a>(entry: &mut PageTableEntry, pmm: &Pmm) -> Result<&'a mut PageTable, MapError> {
		if entry.present() {
			// SAFETY: every address ever stored in a present entry was
			// produced by this same function (or `Pagemap::new`), always
			// the base of a full, page-aligned, zeroed `PageTable`.
			return Ok(unsafe { entry.address().as_mut_unchecked::<PageTable>() });
		}

		let phys = pmm.allocz(1)?;
		// SAFETY: see above.
		let table = unsafe { phys.as_mut_unchecked::<PageTable>() };
		entry.set(phys, INTERMEDIATE_FLAGS);
		Ok(table)
	}

	/// Establishes `virt → phys` with `flags`, allocating the page table
	/// if absent. Overwrites an existing leaf.
	///
	/// # Errors
	///
	/// Returns [`MapError`] if the page table needs allocating and `pmm`
	/// is out of memory.
	pub fn map(&self, pmm: &Pmm, phys: Phys, virt: u64, flags: PageFlags) -> Result<(), MapError> {
		let _guard = self.lock.lock();
		let [ld, lt] = indices(virt);

		// SAFETY: `self.root` is a valid page directory per `from_root`'s
		// or `new`'s contract.
		let pd = unsafe { self.root.as_mut_unchecked::<PageTable>() };
		let pt = Self::ensure_table(&mut pd.entries[ld], pmm)?;

		pt.entries[lt].set(phys, (flags | PageFlags::PRESENT).bits());
		Ok(())
	}

	/// Walks to the leaf entry for `virt` without allocating anything,
	/// failing if the page table or the leaf's own entry is absent.
	fn leaf_entry_mut(&self, virt: u64) -> Option<&mut PageTableEntry> {
		let [ld, lt] = indices(virt);

		// SAFETY: see `map`.
		let pd = unsafe { self.root.as_mut_unchecked::<PageTable>() };
		let pd_entry = pd.entries[ld];
		if !pd_entry.present() {
			return None;
		}
		// SAFETY: only ever populated by `ensure_table`/`Pagemap::new`.
		let pt = unsafe { pd_entry.address().as_mut_unchecked::<PageTable>() };

		let leaf = &mut pt.entries[lt];
		if !leaf.present() {
			return None;
		}
		Some(leaf)
	}

	/// Zeroes the leaf entry mapping `virt`. Never de-allocates the page
	/// table.
	///
	/// # Errors
	///
	/// Returns [`UnmapError::NotMapped`] if `virt` has no live mapping.
	pub fn unmap(&self, virt: u64) -> Result<(), UnmapError> {
		let _guard = self.lock.lock();
		let entry = self.leaf_entry_mut(virt).ok_or(UnmapError::NotMapped)?;
		entry.0 = 0;
		Ok(())
	}

	/// Updates the flag bits of the existing mapping at `virt`, preserving
	/// its physical address.
	///
	/// # Errors
	///
	/// Returns [`RemapError::NotMapped`] under the same conditions as
	/// [`Pagemap::unmap`].
	pub fn remap(&self, virt: u64, flags: PageFlags) -> Result<(), RemapError> {
		let _guard = self.lock.lock();
		let entry = self.leaf_entry_mut(virt).ok_or(RemapError::NotMapped)?;
		let address = entry.address();
		entry.set(address, (flags | PageFlags::PRESENT).bits());
		Ok(())
	}

	/// Walks to the leaf entry for `virt`, returning its physical address
	/// and flags if the page table and the leaf itself are present.
	#[must_use]
	pub fn translate(&self, virt: u64) -> Option<(Phys, PageFlags)> {
		let _guard = self.lock.lock();
		let [ld, lt] = indices(virt);

		// SAFETY: see `map`.
		let pd = unsafe { self.root.as_ref_unchecked::<PageTable>() };
		let pd_entry = pd.entries[ld];
		if !pd_entry.present() {
			return None;
		}
		// SAFETY: see `leaf_entry_mut`.
		let pt = unsafe { pd_entry.address().as_ref_unchecked::<PageTable>() };

		let leaf = pt.entries[lt];
		leaf.present().then(|| (leaf.address(), leaf.flags()))
	}
}

/// Physical address at which the identity map ends.
const FOUR_GIB: u64 = 0x1_0000_0000;

/// Size of the kernel-overlap window excluded from the identity map.
/// This is a *different* 32 MiB exclusion than the `x86_64` path's
/// `ASSUMED_USABLE_BASE` — one is a kernel-relative window, the other an
/// absolute low-memory range. See `DESIGN.md` for why the two are kept
/// distinct rather than unified.
const KERNEL_OVERLAP_SIZE: u64 = 0x0200_0000;

/// Builds the boot-time identity map: all of
/// `[0, 4 GiB)` with `present | writable`, excluding
/// `[kernel_phys_offset, kernel_phys_offset + 32 MiB)` because it
/// overlaps the kernel's own mapping. Unlike the `x86_64` build, there is
/// no second e820-driven pass.
///
/// `memmap` is accepted for API parity with the `x86_64` build, which
/// needs it for its second pass; it is unused here.
///
/// # Errors
///
/// Returns [`MapError`] if `pmm` runs out of memory while allocating the
/// page table for some 4 MiB region of the map.
pub fn identity_map_boot_memory<E: MemoryMapEntry>(
	pagemap: &Pagemap,
	pmm: &Pmm,
	_memmap: &MemoryMap<'_, E>,
	kernel_phys_offset: u64,
) -> Result<(), MapError> {
	let flags = PageFlags::PRESENT | PageFlags::WRITABLE;
	let overlap_end = kernel_phys_offset + KERNEL_OVERLAP_SIZE;

	let mut addr = 0;
	while addr < FOUR_GIB {
		if addr >= kernel_phys_offset && addr < overlap_end {
			addr += PAGE_SIZE;
			continue;
		}
		pagemap.map(pmm, Phys::new(addr), addr, flags)?;
		addr += PAGE_SIZE;
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;

	/// Sets the process-global physical offset to zero once per test
	/// binary, so `Phys::as_mut_unchecked` resolves the host-allocated
	/// backing pages this module's tests hand out as page-directory/page-
	/// table storage, unchanged.
	fn ensure_zero_phys_offset() {
		static DONE: AtomicBool = AtomicBool::new(false);
		if !DONE.swap(true, Ordering::SeqCst) {
			// SAFETY: called at most once, before any translation.
			unsafe { corvid_mem::translate::set_phys_offset(0) };
		}
	}

	struct OneRegion {
		base: u64,
		len:  u64,
	}

	impl MemoryMapEntry for OneRegion {
		fn base(&self) -> u64 {
			self.base
		}

		fn length(&self) -> u64 {
			self.len
		}

		fn is_usable(&self) -> bool {
			true
		}
	}

	fn host_pmm() -> Pmm {
		ensure_zero_phys_offset();
		let pmm = Pmm::new();
		let region = Box::leak(vec![0_u8; 4096 * 4096].into_boxed_slice());
		let base = (region.as_ptr() as u64 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

		let entries = [OneRegion { base, len: 4096 * 4095 }];
		let memmap = MemoryMap::new(&entries);
		pmm.init(&memmap).unwrap();
		pmm.change_allocation_method();
		pmm
	}

	#[test]
	fn map_then_translate_yields_leaf_with_forced_present_bit() {
		let pmm = host_pmm();
		let pagemap = Pagemap::new(&pmm).unwrap();
		let phys = pmm.alloc(1).unwrap();

		pagemap.map(&pmm, phys, 0x0040_0000, PageFlags::WRITABLE).unwrap();

		let (addr, flags) = pagemap.translate(0x0040_0000).unwrap();
		assert_eq!(addr, phys);
		assert_eq!(flags.bits(), (PageFlags::WRITABLE | PageFlags::PRESENT).bits());
	}

	#[test]
	fn unmap_then_unmap_again_fails() {
		let pmm = host_pmm();
		let pagemap = Pagemap::new(&pmm).unwrap();
		let phys = pmm.alloc(1).unwrap();

		pagemap.map(&pmm, phys, 0x0040_0000, PageFlags::WRITABLE).unwrap();
		pagemap.unmap(0x0040_0000).unwrap();
		assert_eq!(pagemap.unmap(0x0040_0000), Err(UnmapError::NotMapped));
	}

	#[test]
	fn remap_preserves_address_and_updates_flags() {
		let pmm = host_pmm();
		let pagemap = Pagemap::new(&pmm).unwrap();
		let phys = pmm.alloc(1).unwrap();

		pagemap.map(&pmm, phys, 0x0040_0000, PageFlags::WRITABLE).unwrap();
		pagemap.remap(0x0040_0000, PageFlags::USER).unwrap();

		let (addr, flags) = pagemap.translate(0x0040_0000).unwrap();
		assert_eq!(addr, phys);
		assert_eq!(flags.bits(), (PageFlags::USER | PageFlags::PRESENT).bits());
	}

	#[test]
	fn map_allocates_one_intermediate_table_on_first_touch() {
		let pmm = host_pmm();
		let pagemap = Pagemap::new(&pmm).unwrap();
		let before = pmm.stats().used_bytes;

		pagemap.map(&pmm, Phys::new(0x1000), 0x0040_0000, PageFlags::WRITABLE).unwrap();

		assert_eq!(pmm.stats().used_bytes - before, PAGE_SIZE);
	}
}
