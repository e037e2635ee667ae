//! Physical-to-virtual address translation. Used globally.
//!
//! The core maps all usable physical memory into one contiguous region at
//! a fixed virtual offset very early in boot (before the PMM can be
//! trusted), then never moves it. Every later physical-address accessor
//! — the PMM's own bitmap, page table walks, MMIO register access —
//! resolves through this single offset rather than threading a mapping
//! context through every call site.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

#[cfg(any(debug_assertions, test))]
static PHYS_OFFSET_SET: AtomicBool = AtomicBool::new(false);

/// Records the kernel's linear-map offset (`MEM_PHYS_OFFSET`).
///
/// Must be called exactly once, before any other function in this crate
/// is used, and before any code that goes on to call [`to_virtual`].
///
/// # Safety
///
/// Calling this more than once, or from more than one core concurrently,
/// is undefined: every physical-address translation in the workspace
/// assumes the offset never changes once set.
pub unsafe fn set_phys_offset(offset: u64) {
	#[cfg(any(debug_assertions, test))]
	assert!(
		!PHYS_OFFSET_SET.swap(true, Ordering::SeqCst),
		"physical memory offset already set"
	);

	PHYS_OFFSET.store(offset, Ordering::SeqCst);
}

/// Returns the kernel's linear-map offset, as set by [`set_phys_offset`].
///
/// # Panics
///
/// In debug builds, panics if [`set_phys_offset`] has not yet been called.
#[must_use]
pub fn phys_offset() -> u64 {
	#[cfg(debug_assertions)]
	assert!(
		PHYS_OFFSET_SET.load(Ordering::SeqCst),
		"phys_offset() called but set_phys_offset() has not yet run"
	);

	PHYS_OFFSET.load(Ordering::SeqCst)
}

/// Translates a physical address to its virtual alias under the linear map.
#[must_use]
pub fn to_virtual(phys: u64) -> usize {
	usize::try_from(phys + phys_offset()).expect("physical address overflowed virtual address space")
}

/// Sets the offset for tests if it has not already been set by an earlier
/// test in this binary, instead of panicking.
///
/// `cargo test` links every `#[cfg(test)]` module in the crate into one
/// binary, and this offset is a one-shot global, so tests across modules
/// can't each call [`set_phys_offset`] directly without racing whichever
/// test runs first.
#[cfg(test)]
pub(crate) fn ensure_phys_offset_for_test(offset: u64) {
	if !PHYS_OFFSET_SET.swap(true, Ordering::SeqCst) {
		PHYS_OFFSET.store(offset, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn translates_with_offset() {
		ensure_phys_offset_for_test(0x1000);
		assert_eq!(to_virtual(0x2000) as u64, 0x2000 + phys_offset());
	}
}
