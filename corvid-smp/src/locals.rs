//! The per-CPU locals registry.
//!
//! Write-once-per-index during [`crate::init_smp`] (serialized by the BSP,
//! which is the only core running until it wakes the others), immutably
//! readable afterward. One registry holding both each CPU's local and its
//! TSS, rather than two free-standing arrays.

use core::{
	cell::UnsafeCell,
	mem::MaybeUninit,
	sync::atomic::{AtomicUsize, Ordering::Acquire},
};

use corvid_apic::Lapic;

use crate::tss::Tss;

/// Upper bound on the number of logical CPUs this core will ever install
/// a local for.
pub const MAX_CPUS: usize = 64;

/// One CPU's bring-up-time state.
///
/// `current_process`/`current_thread`/`current_task` are `-1` until the
/// (external) scheduler assigns real values; this core only ever writes
/// the sentinel rather than modeling "nothing scheduled yet" as an
/// `Option` the scheduler crate (external to this core) would have to
/// agree on the shape of.
#[derive(Debug, Clone, Copy)]
pub struct CpuLocal {
	/// This CPU's dense logical index: `cpu_locals[i].cpu_number == i`.
	pub cpu_number:      usize,
	/// Virtual address of the top of this CPU's kernel stack.
	pub kernel_stack_top: u64,
	/// This CPU's local APIC id, the target of every IPI/SIPI addressed
	/// to it.
	pub lapic_id:        u8,
	/// Opaque scheduler handle; `-1` until assigned.
	pub current_process: i64,
	/// Opaque scheduler handle; `-1` until assigned.
	pub current_thread:  i64,
	/// Opaque scheduler handle; `-1` until assigned.
	pub current_task:    i64,
}

impl CpuLocal {
	/// Builds a fresh local for `cpu_number`, with every scheduler handle
	/// set to the `-1` "nothing scheduled" sentinel.
	#[must_use]
	pub const fn new(cpu_number: usize, lapic_id: u8, kernel_stack_top: u64) -> Self {
		Self { cpu_number, kernel_stack_top, lapic_id, current_process: -1, current_thread: -1, current_task: -1 }
	}
}

/// The process-wide registry of every CPU's local and TSS.
///
/// Indices below [`CpuLocals::cpu_count`] are guaranteed initialized;
/// indices at or above it must not be read. [`crate::init_smp`] is the
/// only writer, and only ever writes index `cpu_count` (the next slot),
/// advancing the count after a slot is confirmed live — a slot whose CPU
/// failed to start is simply never published.
pub struct CpuLocals {
	/// Backing storage for each logical CPU's local.
	locals: [UnsafeCell<MaybeUninit<CpuLocal>>; MAX_CPUS],
	/// Backing storage for each logical CPU's TSS.
	tss:    [UnsafeCell<MaybeUninit<Tss>>; MAX_CPUS],
	/// How many entries at the front of `locals`/`tss` are initialized
	/// and safe to read. Advanced with `Release` ordering by the single
	/// writer (the BSP during bring-up); read with `Acquire` by anyone.
	count:  AtomicUsize,
}

// SAFETY: `locals`/`tss` are written only by the BSP, one slot at a time,
// strictly before `count` is advanced past that slot with `Release`
// ordering; every reader observes a fully-initialized slot or none at
// all, per the `Acquire` load in every accessor below.
unsafe impl Sync for CpuLocals {}

impl CpuLocals {
	/// Creates an empty registry.
	#[must_use]
	pub const fn new() -> Self {
		#[expect(clippy::declare_interior_mutable_const)]
		const EMPTY_LOCAL: UnsafeCell<MaybeUninit<CpuLocal>> = UnsafeCell::new(MaybeUninit::uninit());
		#[expect(clippy::declare_interior_mutable_const)]
		const EMPTY_TSS: UnsafeCell<MaybeUninit<Tss>> = UnsafeCell::new(MaybeUninit::uninit());

		Self { locals: [EMPTY_LOCAL; MAX_CPUS], tss: [EMPTY_TSS; MAX_CPUS], count: AtomicUsize::new(0) }
	}

	/// Writes `local`/`tss` into slot `index` and publishes it, advancing
	/// [`CpuLocals::cpu_count`] to `index + 1`.
	///
	/// # Safety
	///
	/// Must be called only by the BSP during [`crate::init_smp`], with
	/// `index` exactly equal to the registry's current `cpu_count`, and
	/// never concurrently with another call to this method (bring-up is
	/// single-core by construction: the AP being committed here has not
	/// yet been woken, and every other AP is still halted awaiting its
	/// own turn).
	pub unsafe fn commit(&self, index: usize, local: CpuLocal, tss: Tss) {
		debug_assert_eq!(index, self.count.load(Acquire), "locals must be committed in dense order");
		// SAFETY: exclusive writer access to slot `index` per this
		// method's contract; no reader observes it until `count` below
		// is advanced.
		unsafe {
			(*self.locals[index].get()).write(local);
			(*self.tss[index].get()).write(tss);
		}
		self.count.fetch_add(1, core::sync::atomic::Ordering::Release);
	}

	/// How many CPUs currently have a published local.
	#[must_use]
	pub fn cpu_count(&self) -> usize {
		self.count.load(Acquire)
	}

	/// The local for logical CPU `index`, if it has been published.
	#[must_use]
	pub fn get(&self, index: usize) -> Option<&CpuLocal> {
		if index >= self.cpu_count() {
			return None;
		}
		// SAFETY: `index < cpu_count()` (just loaded with `Acquire`)
		// proves slot `index` was published by `commit`, whose write
		// happens-before this load per that `Acquire`/`Release` pair.
		Some(unsafe { (*self.locals[index].get()).assume_init_ref() })
	}

	/// The TSS for logical CPU `index`, if it has been published.
	#[must_use]
	pub fn tss(&self, index: usize) -> Option<&Tss> {
		if index >= self.cpu_count() {
			return None;
		}
		// SAFETY: see `get`.
		Some(unsafe { (*self.tss[index].get()).assume_init_ref() })
	}

	/// The calling CPU's own local, found by matching its local APIC id
	/// against the registry.
	///
	/// Implemented as a linear search
	/// against `lapic.id()` (a CPU can always read its own APIC id back
	/// out of hardware) rather than a thread-local, since installing one
	/// would require an architecture-specific segment-register convention
	/// this core-agnostic crate has no business choosing.
	#[must_use]
	pub fn current_cpu(&self, lapic: &Lapic) -> Option<&CpuLocal> {
		let id = lapic.id();
		(0..self.cpu_count()).filter_map(|i| self.get(i)).find(|local| local.lapic_id == id)
	}
}

impl Default for CpuLocals {
	fn default() -> Self {
		Self::new()
	}
}

/// The process-wide locals registry singleton.
pub static LOCALS: CpuLocals = CpuLocals::new();

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn commit_publishes_in_order() {
		let locals = CpuLocals::new();
		assert_eq!(locals.cpu_count(), 0);

		// SAFETY: single-threaded test, committed in dense order.
		unsafe { locals.commit(0, CpuLocal::new(0, 0, 0x1000), Tss::for_kernel_stack(0x1000)) };
		assert_eq!(locals.cpu_count(), 1);
		assert_eq!(locals.get(0).unwrap().cpu_number, 0);
		assert!(locals.get(1).is_none());

		// SAFETY: see above.
		unsafe { locals.commit(1, CpuLocal::new(1, 1, 0x2000), Tss::for_kernel_stack(0x2000)) };
		assert_eq!(locals.cpu_count(), 2);
		assert_eq!(locals.get(1).unwrap().lapic_id, 1);
	}

	#[test]
	fn new_local_sets_scheduler_sentinels() {
		let local = CpuLocal::new(3, 7, 0x4000);
		assert_eq!(local.current_process, -1);
		assert_eq!(local.current_thread, -1);
		assert_eq!(local.current_task, -1);
	}
}
