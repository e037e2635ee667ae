//! Page-table entry flag bits.
//!
//! Bit positions below 12 are shared in meaning between the `i686` and
//! `x86_64` addressing schemes; [`PageFlags::NO_EXECUTE`] only exists in
//! the 64-bit format and is simply ignored if ever set on an `i686` build.

use bitflags::bitflags;

bitflags! {
	/// Flag bits of a page table entry, independent of the physical
	/// address it also carries.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct PageFlags: u64 {
		/// The entry is live and may be walked or dereferenced.
		const PRESENT       = 1 << 0;
		/// Writes through this mapping are permitted.
		const WRITABLE      = 1 << 1;
		/// Ring-3 accesses through this mapping are permitted.
		const USER          = 1 << 2;
		/// Writes through this mapping bypass the cache immediately
		/// instead of being written back lazily.
		const WRITE_THROUGH = 1 << 3;
		/// The mapped page is never cached.
		const CACHE_DISABLE = 1 << 4;
		/// Set by the CPU the first time the entry is used in a translation.
		const ACCESSED      = 1 << 5;
		/// Set by the CPU the first time a write lands on the mapped page.
		const DIRTY         = 1 << 6;
		/// The mapping is not flushed from the TLB on a CR3 reload.
		const GLOBAL        = 1 << 8;
		/// Instruction fetches through this mapping are forbidden.
		/// `x86_64` only.
		const NO_EXECUTE    = 1 << 63;
	}
}

/// The flag bits [`crate::Pagemap::map`] forces onto every intermediate
/// (non-leaf) table entry it allocates, so that a leaf reachable through
/// it can still grant user-mode or read-only access independent of how
/// the tree above it was built.
pub const INTERMEDIATE_FLAGS: u64 =
	PageFlags::PRESENT.bits() | PageFlags::WRITABLE.bits() | PageFlags::USER.bits();
