//! Bitmap-backed physical page frame allocator.
//!
//! One bit per page, one word (`u32`) at a time. Free pages read `0`,
//! used pages read `1`. The bitmap itself lives in the memory it
//! describes: at boot there is nowhere else to put it, so the allocator
//! bootstraps from a single hand-built word covering just enough pages to
//! hold its own first real bitmap page, then grows that bitmap in place
//! as the firmware memory map is walked.
//!
//! Two scan strategies are offered, matching the two the PMM is grounded
//! on: [`Strategy::Slow`] always scans from the bitmap's start and is
//! used until the memory map has been fully walked, after which callers
//! switch to [`Strategy::Fast`] (a rotating scan that remembers where it
//! left off) for the steady allocation pattern that follows.

use corvid_sync::{Lock, Mutex};

use crate::{error::OomError, memmap::MemoryMap, phys::Phys, MemoryMapEntry};

/// Page size assumed throughout the core.
pub const PAGE_SIZE: u64 = 4096;

/// The first physical address the PMM will ever hand out. Addresses below
/// this are reserved for the kernel image, the boot-time identity map,
/// and other fixed low-memory structures the PMM has no business touching.
pub const MEMORY_BASE: u64 = 0x0100_0000;

/// How many pages the bitmap grows by each time it outgrows its current
/// backing storage.
const BMREALLOC_STEP: u64 = 1;

/// Bits per backing word.
const WORD_BITS: u64 = 32;

/// The bootstrap bitmap: 32 bits relative to [`MEMORY_BASE`], all used
/// except bit 7, which is the one free page the allocator needs in order
/// to allocate its own first real bitmap page out of itself.
const INITIAL_BITMAP: u32 = 0xffff_ff7f;

/// Which end of the bitmap an allocation request scans from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
	/// Always scans from the very start of the bitmap. Used while the
	/// memory map is still being walked, since the bitmap's coverage (and
	/// therefore what "the start" even means) is still changing.
	Slow,
	/// Scans from wherever the last allocation left off, wrapping back to
	/// the start when it runs off the end. Used once the memory map has
	/// been fully walked and the bitmap's size is final.
	Fast,
}

/// Where the bitmap's backing words currently live.
#[derive(Debug, Clone, Copy)]
enum Storage {
	/// The single hand-built bootstrap word, not yet replaced by a real
	/// allocation.
	Initial,
	/// A real, page-backed bitmap.
	Allocated {
		/// The physical address of the bitmap's first word.
		base:  Phys,
		/// How many pages back this bitmap.
		pages: u64,
	},
}

/// Aggregate memory accounting, returned by [`Pmm::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemStats {
	/// Total bytes of usable memory registered with the allocator.
	pub total_bytes: u64,
	/// Bytes currently allocated out of that total.
	pub used_bytes:  u64,
}

struct Inner {
	initial_bitmap: u32,
	storage:        Storage,
	/// How many bits the current storage actually backs.
	bitmap_entries: u64,
	total_pages:    u64,
	free_pages:     u64,
	/// Scan cursor for [`Strategy::Fast`], relative to `BITMAP_BASE`.
	cur_ptr:        u64,
	strategy:       Strategy,
}

impl Inner {
	const fn new() -> Self {
		Self {
			initial_bitmap: INITIAL_BITMAP,
			storage:        Storage::Initial,
			bitmap_entries: WORD_BITS,
			total_pages:    1,
			free_pages:     1,
			cur_ptr:        0,
			strategy:       Strategy::Slow,
		}
	}

	fn word(&self, word_index: u64) -> u32 {
		match self.storage {
			Storage::Initial => {
				debug_assert_eq!(word_index, 0, "bootstrap bitmap is a single word");
				self.initial_bitmap
			}
			Storage::Allocated { base, .. } => {
				// SAFETY: `word_index` is bounds-checked by callers against
				// `bitmap_entries`, which tracks exactly how many words this
				// storage backs.
				unsafe { *base.as_ptr_unchecked::<u32>().add(word_index as usize) }
			}
		}
	}

	fn set_word(&mut self, word_index: u64, value: u32) {
		match self.storage {
			Storage::Initial => {
				debug_assert_eq!(word_index, 0, "bootstrap bitmap is a single word");
				self.initial_bitmap = value;
			}
			Storage::Allocated { base, .. } => {
				// SAFETY: see `word`.
				unsafe { *base.as_mut_ptr_unchecked::<u32>().add(word_index as usize) = value }
			}
		}
	}

	fn is_used(&self, bit: u64) -> bool {
		self.word(bit / WORD_BITS) & (1 << (bit % WORD_BITS)) != 0
	}

	fn mark_used(&mut self, bit: u64) {
		let word = self.word(bit / WORD_BITS);
		self.set_word(bit / WORD_BITS, word | (1 << (bit % WORD_BITS)));
	}

	fn mark_free(&mut self, bit: u64) {
		let word = self.word(bit / WORD_BITS);
		self.set_word(bit / WORD_BITS, word & !(1 << (bit % WORD_BITS)));
	}

	fn range_free(&self, start: u64, count: u64) -> bool {
		(start..start + count).all(|bit| !self.is_used(bit))
	}

	fn mark_range(&mut self, start: u64, count: u64, used: bool) {
		for bit in start..start + count {
			if used {
				self.mark_used(bit);
			} else {
				self.mark_free(bit);
			}
		}
	}

	/// Scans from the start of the bitmap for `count` contiguous free bits.
	fn scan_slow(&self, count: u64) -> Option<u64> {
		if count > self.bitmap_entries {
			return None;
		}
		(0..=self.bitmap_entries - count).find(|&bit| self.range_free(bit, count))
	}

	/// Scans from `cur_ptr`, wrapping once back to the start.
	fn scan_fast(&mut self, count: u64) -> Option<u64> {
		let mut bit = self.cur_ptr;
		let mut wrapped = false;

		loop {
			if bit + count > self.bitmap_entries {
				if wrapped {
					return None;
				}
				wrapped = true;
				bit = 0;
				continue;
			}

			if self.range_free(bit, count) {
				self.cur_ptr = bit + count;
				return Some(bit);
			}

			bit += 1;

			if bit >= self.bitmap_entries {
				if wrapped {
					return None;
				}
				wrapped = true;
				bit = 0;
			}
		}
	}

	fn alloc_bits(&mut self, count: u64) -> Option<u64> {
		let bit = match self.strategy {
			Strategy::Slow => self.scan_slow(count),
			Strategy::Fast => self.scan_fast(count),
		}?;
		self.mark_range(bit, count, true);
		self.free_pages = self.free_pages.saturating_sub(count);
		Some(bit)
	}

	fn free_bits(&mut self, bit: u64, count: u64) {
		self.mark_range(bit, count, false);
		self.free_pages += count;
	}

	/// The bit range currently backing the bitmap's own storage, if any.
	///
	/// The firmware memory map walk in [`Pmm::init`] must not mark these
	/// bits free even though they fall inside an otherwise-usable region:
	/// doing so would hand out the page the allocator's own bitmap lives
	/// on as if it were ordinary free memory.
	fn reserved_bits(&self) -> Option<(u64, u64)> {
		match self.storage {
			Storage::Allocated { base, pages } => Some(((base.address() - MEMORY_BASE) / PAGE_SIZE, pages)),
			Storage::Initial => None,
		}
	}

	fn grow(&mut self) -> Result<(), OomError> {
		let (old_base, old_pages) = match self.storage {
			Storage::Allocated { base, pages } => (base, pages),
			Storage::Initial => panic!("bitmap must hold a real allocation before it can grow"),
		};

		let new_pages = old_pages + BMREALLOC_STEP;
		let new_bit = self.alloc_bits(new_pages).ok_or(OomError)?;
		let new_base = Phys::new(MEMORY_BASE + new_bit * PAGE_SIZE);

		let old_words = (old_pages * PAGE_SIZE / 4) as usize;
		let new_words = (new_pages * PAGE_SIZE / 4) as usize;

		// SAFETY: `new_base` was just carved out of the bitmap itself and is
		// not yet visible to any other allocation; `old_base` remains valid
		// until `free_bits` below retires it.
		unsafe {
			let new_ptr = new_base.as_mut_ptr_unchecked::<u32>();
			let old_ptr = old_base.as_ptr_unchecked::<u32>();
			for i in 0..new_words {
				*new_ptr.add(i) = if i < old_words { *old_ptr.add(i) } else { 0xffff_ffff };
			}
		}

		let old_bit = (old_base.address() - MEMORY_BASE) / PAGE_SIZE;
		self.storage = Storage::Allocated { base: new_base, pages: new_pages };
		self.bitmap_entries = new_pages * PAGE_SIZE * 8;
		self.free_bits(old_bit, old_pages);

		Ok(())
	}
}

/// The bitmap physical page frame allocator.
pub struct Pmm {
	inner: Mutex<Inner>,
}

impl Pmm {
	/// Creates an un-initialized allocator. Call [`Pmm::init`] with the
	/// firmware memory map before using it for anything else.
	#[must_use]
	pub const fn new() -> Self {
		Self { inner: Mutex::new(Inner::new()) }
	}

	/// Walks the firmware memory map, growing the bitmap as needed and
	/// registering every usable page as free.
	///
	/// Must be called exactly once, after [`crate::translate::set_phys_offset`]
	/// and before any other method on this type.
	///
	/// # Errors
	///
	/// Returns [`OomError`] if the very first bitmap page cannot be
	/// bootstrapped, or if the bitmap cannot grow to cover the reported
	/// memory — both indicate there isn't enough usable memory to boot at
	/// all. Callers route this through whatever fatal-condition sink the
	/// workspace has installed (see `corvid_core::init_core`); this crate
	/// never panics on an allocation failure itself.
	pub fn init<E: MemoryMapEntry>(&self, memmap: &MemoryMap<'_, E>) -> Result<(), OomError> {
		let mut inner = self.inner.lock();

		let bitmap_bit = inner.alloc_bits(BMREALLOC_STEP).ok_or(OomError)?;
		let bitmap_base = Phys::new(MEMORY_BASE + bitmap_bit * PAGE_SIZE);

		// SAFETY: freshly carved out of the bootstrap bitmap, not yet
		// referenced by anything else.
		unsafe {
			let ptr = bitmap_base.as_mut_ptr_unchecked::<u32>();
			for i in 0..(BMREALLOC_STEP * PAGE_SIZE / 4) as usize {
				*ptr.add(i) = 0;
			}
		}

		inner.storage = Storage::Allocated { base: bitmap_base, pages: BMREALLOC_STEP };
		inner.bitmap_entries = BMREALLOC_STEP * PAGE_SIZE * 8;

		for entry in memmap.entries() {
			// Round the entry's base up to the next page boundary before
			// walking it: an unaligned base's own page may belong partly to
			// a different, non-usable region, and `bit = (addr -
			// MEMORY_BASE) / PAGE_SIZE` below floors, so starting from the
			// raw base would mark that whole page usable on its say-so
			// alone. Matches the original's `aligned_base` computation.
			let aligned_base = (entry.base() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
			let mut addr = aligned_base.max(MEMORY_BASE);
			let end = entry.end();

			while addr < end {
				if addr < MEMORY_BASE + PAGE_SIZE {
					addr += PAGE_SIZE;
					continue;
				}

				let bit = (addr - MEMORY_BASE) / PAGE_SIZE;

				while bit >= inner.bitmap_entries {
					inner.grow()?;
				}

				if entry.is_usable() {
					inner.total_pages += 1;

					let reserved = inner
						.reserved_bits()
						.is_some_and(|(start, count)| (start..start + count).contains(&bit));

					if reserved {
						// Already marked used as part of bootstrapping the
						// bitmap itself; counted above, but must not be
						// handed back out as free.
					} else {
						inner.free_pages += 1;
						inner.mark_free(bit);
					}
				}

				addr += PAGE_SIZE;
			}
		}

		Ok(())
	}

	/// Allocates `page_count` contiguous physical pages.
	///
	/// # Errors
	///
	/// Returns [`OomError`] if no run of `page_count` contiguous free
	/// pages exists.
	pub fn alloc(&self, page_count: u64) -> Result<Phys, OomError> {
		let bit = self.inner.lock().alloc_bits(page_count).ok_or(OomError)?;
		Ok(Phys::new(MEMORY_BASE + bit * PAGE_SIZE))
	}

	/// Allocates `page_count` contiguous physical pages and zeroes them.
	///
	/// # Errors
	///
	/// Returns [`OomError`] under the same conditions as [`Pmm::alloc`].
	pub fn allocz(&self, page_count: u64) -> Result<Phys, OomError> {
		let phys = self.alloc(page_count)?;

		// SAFETY: the pages just came out of `alloc` and are owned
		// exclusively by the caller until freed.
		unsafe {
			let ptr = phys.as_mut_ptr_unchecked::<u8>();
			ptr.write_bytes(0, (page_count * PAGE_SIZE) as usize);
		}

		Ok(phys)
	}

	/// Returns `page_count` contiguous pages starting at `phys` to the
	/// free pool.
	///
	/// # Panics
	///
	/// In debug builds, panics if `phys` does not lie on a page boundary
	/// within the range the PMM manages.
	pub fn free(&self, phys: Phys, page_count: u64) {
		debug_assert!(phys.address() >= MEMORY_BASE, "freed address below the managed range");
		debug_assert_eq!(phys.address() % PAGE_SIZE, 0, "freed address is not page-aligned");
		let bit = (phys.address() - MEMORY_BASE) / PAGE_SIZE;
		self.inner.lock().free_bits(bit, page_count);
	}

	/// Switches the allocator from [`Strategy::Slow`] to [`Strategy::Fast`].
	///
	/// Call once, after [`Pmm::init`] has finished walking the memory map.
	/// Scanning from the start on every allocation is only cheap while the
	/// bitmap is still small and mostly used; once it has settled, a
	/// rotating scan avoids re-walking already-allocated low memory.
	pub fn change_allocation_method(&self) {
		self.inner.lock().strategy = Strategy::Fast;
	}

	/// Current memory accounting.
	#[must_use]
	pub fn stats(&self) -> MemStats {
		let inner = self.inner.lock();
		MemStats {
			total_bytes: inner.total_pages * PAGE_SIZE,
			used_bytes:  (inner.total_pages - inner.free_pages) * PAGE_SIZE,
		}
	}

	/// Number of pages currently free.
	#[must_use]
	pub fn free_pages(&self) -> u64 {
		self.inner.lock().free_pages
	}
}

impl Default for Pmm {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{memmap::MemoryMap, translate::ensure_phys_offset_for_test};

	struct Region {
		base:   u64,
		length: u64,
		usable: bool,
	}

	impl MemoryMapEntry for Region {
		fn base(&self) -> u64 {
			self.base
		}

		fn length(&self) -> u64 {
			self.length
		}

		fn is_usable(&self) -> bool {
			self.usable
		}
	}

	/// Every test in this module addresses the same fixed physical range
	/// (starting at [`MEMORY_BASE`]) through the one process-global
	/// translator offset, so they cannot run concurrently against
	/// independent backing storage the way `cargo test`'s default
	/// parallelism would otherwise assume. This guards each test's body
	/// so only one runs at a time; the backing buffer itself is leaked
	/// once and reused by every test.
	static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

	/// Backs every "physical" address used by these tests with a leaked
	/// host allocation, standing in for the linear map a real boot would
	/// install. Only the first call actually allocates; later calls reuse
	/// the same backing buffer, which is fine since tests are serialized
	/// by [`TEST_LOCK`] and each creates its own fresh [`Pmm`].
	fn init_fake_phys_memory() {
		const SIZE: usize = 32 * 1024 * 1024;
		let buf = vec![0_u8; SIZE].into_boxed_slice();
		let ptr = Box::leak(buf).as_mut_ptr();
		ensure_phys_offset_for_test(ptr as u64);
	}

	fn small_map() -> [Region; 1] {
		// 8 MiB of usable RAM above MEMORY_BASE: enough for the bootstrap
		// bitmap plus a comfortable number of test allocations, without the
		// run needing to actually back ~16 MiB + 8 MiB of host memory.
		[Region { base: MEMORY_BASE, length: 8 * 1024 * 1024, usable: true }]
	}

	#[test]
	fn init_registers_usable_pages_as_free() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_fake_phys_memory();
		let pmm = Pmm::new();
		let map = small_map();
		pmm.init(&MemoryMap::new(&map)).unwrap();

		let stats = pmm.stats();
		assert!(stats.total_bytes > 0);
		assert!(stats.used_bytes < stats.total_bytes);
	}

	#[test]
	fn alloc_then_free_restores_availability() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_fake_phys_memory();
		let pmm = Pmm::new();
		let map = small_map();
		pmm.init(&MemoryMap::new(&map)).unwrap();

		let free_before = pmm.free_pages();
		let frame = pmm.alloc(4).expect("allocation should succeed with free memory available");
		assert_eq!(pmm.free_pages(), free_before - 4);

		pmm.free(frame, 4);
		assert_eq!(pmm.free_pages(), free_before);
	}

	#[test]
	fn allocz_zeroes_the_returned_pages() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_fake_phys_memory();
		let pmm = Pmm::new();
		let map = small_map();
		pmm.init(&MemoryMap::new(&map)).unwrap();

		let frame = pmm.allocz(1).expect("allocation should succeed");
		// SAFETY: test-only access to memory this process owns.
		let bytes = unsafe { core::slice::from_raw_parts(frame.as_ptr_unchecked::<u8>(), PAGE_SIZE as usize) };
		assert!(bytes.iter().all(|&b| b == 0));
	}

	#[test]
	fn fast_strategy_does_not_reuse_live_allocations() {
		let _guard = TEST_LOCK.lock().unwrap();
		init_fake_phys_memory();
		let pmm = Pmm::new();
		let map = small_map();
		pmm.init(&MemoryMap::new(&map)).unwrap();
		pmm.change_allocation_method();

		let a = pmm.alloc(1).unwrap();
		let b = pmm.alloc(1).unwrap();
		assert_ne!(a, b);
	}
}
