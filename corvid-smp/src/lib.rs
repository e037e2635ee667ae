//! SMP bring-up for the corvid kernel core: per-CPU locals registry, TSS
//! allocation, and the `init_smp` entry point that wakes every
//! application processor.
//!
//! [`init_smp`] handles the exact bookkeeping and retry timings of the
//! INIT/SIPI/retry-SIPI-with-timeout handshake, expressed against an
//! external, trait-based trampoline hook instead of inline assembly — the
//! actual real-mode trampoline and segment-register programming stay an
//! external collaborator, so this crate only encodes the handshake
//! around them.
#![cfg_attr(not(test), no_std)]

mod error;
mod locals;
pub mod tss;

use corvid_acpi::MadtInfo;
use corvid_apic::Lapic;
use corvid_debug::{dbg, dbg_err, dbg_panic};
use corvid_mem::Phys;

pub use error::SmpError;
pub use locals::{CpuLocal, CpuLocals, LOCALS, MAX_CPUS};
pub use tss::Tss;

/// Bytes of kernel stack carved out for each CPU (including the BSP).
pub const CPU_STACK_SIZE: u64 = 16384;

/// How long `init_smp` waits after sending the INIT IPI before following
/// up with the Startup IPI.
const INIT_IPI_DELAY_MS: u64 = 10;

/// How long `init_smp` waits after the first Startup IPI before checking
/// whether the AP came up.
const FIRST_SIPI_DELAY_MS: u64 = 1;

/// How long `init_smp` waits after the *retried* Startup IPI — the final
/// chance an AP has to set its started flag — before giving up on it.
const RETRY_SIPI_TIMEOUT_MS: u64 = 1000;

/// How long `init_smp` waits between successive APs, letting each one
/// settle before the next INIT IPI goes out.
const BETWEEN_AP_DELAY_MS: u64 = 10;

/// Timekeeping the boot sequence busy-waits through while bringing up
/// APs.
///
/// A busy-wait is acceptable here: this all happens before the scheduler
/// exists, so there is nothing else any CPU could usefully be doing.
pub trait Clock {
	/// Busy-waits for approximately `ms` milliseconds.
	fn sleep_ms(&self, ms: u64);
}

/// Assembly helpers SMP bring-up needs but does not implement itself.
///
/// Unlike [`Clock`], every method here is an associated function rather
/// than one taking `&self`: the real-mode trampoline, CPU0 segment/TSS
/// programming, and `cpuid` are all stateless operations on the
/// currently-executing CPU, with no instance-level configuration to hold.
pub trait ArchHooks {
	/// Writes a fresh real-mode trampoline that, once executed by the
	/// target AP, loads `cr3`, switches to `stack_top`, installs
	/// `cpu_local`/`tss`, and jumps to `entry`. Returns the trampoline's
	/// physical address, which must be page-aligned and below 1 MiB so a
	/// Startup IPI can address it.
	///
	/// # Safety
	///
	/// `cpu_local` and `tss` must remain valid and exclusively owned by
	/// the AP this trampoline targets for as long as that AP might still
	/// be executing the trampoline.
	unsafe fn prepare_trampoline(
		entry: extern "C" fn() -> !,
		cr3: Phys,
		stack_top: u64,
		cpu_local: *const CpuLocal,
		tss: *const Tss,
	) -> Phys;

	/// Programs the boot processor's own segment registers and GDT TSS
	/// slot to point at `cpu_local`/`tss`, the way the trampoline does for
	/// an AP. The BSP never runs the trampoline itself, so this is its
	/// equivalent entry point.
	///
	/// # Safety
	///
	/// Must be called exactly once, by the BSP, before any other core is
	/// woken.
	unsafe fn init_cpu0_local(cpu_local: *const CpuLocal, tss: *const Tss);

	/// Polls the flag an AP's trampoline sets once it has reached Rust
	/// code and installed its own locals.
	fn check_ap_started() -> bool;

	/// Executes the `cpuid` instruction for `(leaf, subleaf)`, returning
	/// `(eax, ebx, ecx, edx)`.
	fn cpuid(leaf: u32, subleaf: u32) -> (u32, u32, u32, u32);
}

/// Builds CPU 0's local/TSS and installs them directly (no trampoline —
/// the BSP is already running kernel code), then wakes every other CPU
/// the MADT reports, routing each to `entry` on success.
///
/// `locals` is ordinarily [`LOCALS`], the process-wide registry; it is
/// taken as a parameter rather than hardcoded so a caller (in practice,
/// only this crate's own tests) can bring up a registry in isolation.
///
/// `stack_region_top` is the virtual address of the top of a contiguous,
/// already-mapped, kernel-reserved stack region; each successfully
/// started CPU claims [`CPU_STACK_SIZE`] bytes below the previous one, off
/// a cursor shared across every CPU's stack carve-out.
///
/// Returns the final CPU count ([`CpuLocals::cpu_count`] after bring-up).
///
/// # Panics
///
/// Panics (fatal: CPU limit exceeded) if the MADT reports more local
/// APICs than [`MAX_CPUS`].
///
/// # Safety
///
/// Must be called exactly once per `locals` registry, by the BSP, before
/// any scheduler or per-CPU state outside this crate is installed. `lapic`
/// must already be enabled on the calling CPU.
pub unsafe fn init_smp<H: ArchHooks, C: Clock>(
	locals: &CpuLocals,
	clock: &C,
	lapic: &Lapic,
	madt: &MadtInfo,
	entry: extern "C" fn() -> !,
	kernel_cr3: Phys,
	stack_region_top: u64,
) -> usize {
	let mut stack_cursor = stack_region_top;

	let bsp_lapic_id = madt.local_apics.iter().next().map_or_else(|| lapic.id(), |d| d.lapic_id);
	let cpu0_local = CpuLocal::new(0, bsp_lapic_id, stack_cursor);
	let cpu0_tss = Tss::for_kernel_stack(stack_cursor);

	// SAFETY: called once, before any AP has been woken, per this
	// function's own contract.
	unsafe { locals.commit(0, cpu0_local, cpu0_tss) };
	// SAFETY: the registry slot just committed above now owns stable
	// storage for `cpu0_local`/`cpu0_tss`'s contents; `locals.get`/`tss`
	// hand back references into that same storage.
	let local_ref = locals.get(0).expect("slot 0 was just committed");
	let tss_ref = locals.tss(0).expect("slot 0 was just committed");
	unsafe { H::init_cpu0_local(core::ptr::from_ref(local_ref), core::ptr::from_ref(tss_ref)) };
	stack_cursor -= CPU_STACK_SIZE;

	dbg!("smp", "starting CPU 0 (BSP), lapic id {bsp_lapic_id}");

	for descriptor in madt.local_apics.iter().skip(1) {
		let cpu_number = locals.cpu_count();
		if cpu_number >= MAX_CPUS {
			dbg_panic!("smp: CPU limit exceeded ({MAX_CPUS} CPUs)");
		}

		dbg!("smp", "starting up AP #{cpu_number} (lapic id {})", descriptor.lapic_id);

		match start_ap::<H, C>(locals, clock, lapic, descriptor.lapic_id, cpu_number, stack_cursor, entry, kernel_cr3) {
			Ok(()) => {
				stack_cursor -= CPU_STACK_SIZE;
				clock.sleep_ms(BETWEEN_AP_DELAY_MS);
			}
			Err(SmpError::ApStartTimeout) => {
				dbg_err!("smp", "failed to start AP #{cpu_number}");
			}
			Err(SmpError::CpuLimitExceeded) => unreachable!("checked above"),
		}
	}

	let count = locals.cpu_count();
	dbg!("smp", "total CPU count: {count}");
	count
}

/// Attempts to start one application processor. On success, commits its
/// local/TSS to [`LOCALS`] at `cpu_number` (which becomes its
/// [`CpuLocal::cpu_number`]) before returning.
///
/// Sequence: INIT IPI, 10 ms; Startup IPI, 1 ms; poll the started flag;
/// on failure, one retried Startup IPI with a 1 s timeout before giving
/// up.
#[expect(clippy::too_many_arguments)]
fn start_ap<H: ArchHooks, C: Clock>(
	locals: &CpuLocals,
	clock: &C,
	lapic: &Lapic,
	target_lapic_id: u8,
	cpu_number: usize,
	stack_top: u64,
	entry: extern "C" fn() -> !,
	kernel_cr3: Phys,
) -> Result<(), SmpError> {
	let local = CpuLocal::new(cpu_number, target_lapic_id, stack_top);
	let tss = Tss::for_kernel_stack(stack_top);

	// SAFETY: `local`/`tss` live on this stack frame until the AP either
	// commits them (via `LOCALS.commit` below, which copies their
	// contents into stable storage) or this function returns on failure,
	// at which point the AP never successfully read them (it never set
	// its started flag).
	let trampoline_phys = unsafe { H::prepare_trampoline(entry, kernel_cr3, stack_top, &raw const local, &raw const tss) };
	let trampoline_page = (trampoline_phys.address() >> 12) as u8;

	lapic.send_init(target_lapic_id);
	clock.sleep_ms(INIT_IPI_DELAY_MS);

	lapic.send_startup(target_lapic_id, trampoline_page);
	clock.sleep_ms(FIRST_SIPI_DELAY_MS);

	if !H::check_ap_started() {
		lapic.send_startup(target_lapic_id, trampoline_page);
		clock.sleep_ms(RETRY_SIPI_TIMEOUT_MS);

		if !H::check_ap_started() {
			return Err(SmpError::ApStartTimeout);
		}
	}

	// SAFETY: the AP's started flag is now set, meaning it has finished
	// reading `local`/`tss` out of the trampoline arguments; `cpu_number`
	// equals `locals.cpu_count()` by this function's only caller's
	// invariant.
	unsafe { locals.commit(cpu_number, local, tss) };

	Ok(())
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use corvid_acpi::{Bounded, LocalApicDescriptor};

	use super::*;

	/// Records every `sleep_ms` call instead of actually sleeping, so
	/// tests run instantly.
	#[derive(Default)]
	struct FakeClock {
		total_ms: std::sync::atomic::AtomicU64,
	}

	impl Clock for FakeClock {
		fn sleep_ms(&self, ms: u64) {
			self.total_ms.fetch_add(ms, Ordering::Relaxed);
		}
	}

	/// Starts every AP successfully on the first Startup IPI.
	struct AlwaysStartsHooks;

	impl ArchHooks for AlwaysStartsHooks {
		unsafe fn prepare_trampoline(
			_entry: extern "C" fn() -> !,
			_cr3: Phys,
			_stack_top: u64,
			_cpu_local: *const CpuLocal,
			_tss: *const Tss,
		) -> Phys {
			Phys::new(0x8000)
		}

		unsafe fn init_cpu0_local(_cpu_local: *const CpuLocal, _tss: *const Tss) {}

		fn check_ap_started() -> bool {
			true
		}

		fn cpuid(_leaf: u32, _subleaf: u32) -> (u32, u32, u32, u32) {
			(0, 0, 0, 0)
		}
	}

	/// Fails the first Startup IPI for every AP, then succeeds on the
	/// retry.
	struct RetryThenStartsHooks;

	static RETRY_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

	impl ArchHooks for RetryThenStartsHooks {
		unsafe fn prepare_trampoline(
			_entry: extern "C" fn() -> !,
			_cr3: Phys,
			_stack_top: u64,
			_cpu_local: *const CpuLocal,
			_tss: *const Tss,
		) -> Phys {
			Phys::new(0x9000)
		}

		unsafe fn init_cpu0_local(_cpu_local: *const CpuLocal, _tss: *const Tss) {}

		fn check_ap_started() -> bool {
			RETRY_CALL_COUNT.fetch_add(1, Ordering::SeqCst) >= 1
		}

		fn cpuid(_leaf: u32, _subleaf: u32) -> (u32, u32, u32, u32) {
			(0, 0, 0, 0)
		}
	}

	/// Never starts any AP.
	struct NeverStartsHooks;

	impl ArchHooks for NeverStartsHooks {
		unsafe fn prepare_trampoline(
			_entry: extern "C" fn() -> !,
			_cr3: Phys,
			_stack_top: u64,
			_cpu_local: *const CpuLocal,
			_tss: *const Tss,
		) -> Phys {
			Phys::new(0xa000)
		}

		unsafe fn init_cpu0_local(_cpu_local: *const CpuLocal, _tss: *const Tss) {}

		fn check_ap_started() -> bool {
			false
		}

		fn cpuid(_leaf: u32, _subleaf: u32) -> (u32, u32, u32, u32) {
			(0, 0, 0, 0)
		}
	}

	extern "C" fn fake_entry() -> ! {
		loop {
			core::hint::spin_loop();
		}
	}

	/// Backs a fake local APIC register window with host memory, the same
	/// way `corvid-apic`'s own tests do.
	fn fake_lapic() -> (Box<[u8]>, Lapic) {
		let mut page = vec![0_u8; 4096].into_boxed_slice();
		let base = page.as_mut_ptr();
		// SAFETY: `page` outlives the returned `Lapic`.
		let lapic = unsafe { Lapic::new(base) };
		(page, lapic)
	}

	fn madt_with(lapic_ids: &[u8]) -> MadtInfo {
		let mut local_apics = Bounded::new();
		for (i, &id) in lapic_ids.iter().enumerate() {
			local_apics.push(LocalApicDescriptor { processor_id: i as u8, lapic_id: id });
		}
		MadtInfo {
			local_apic_address: Phys::new(0),
			local_apics,
			io_apics: Bounded::new(),
			isos: Bounded::new(),
			nmi_sources: Bounded::new(),
		}
	}

	#[test]
	fn init_smp_brings_up_every_reported_cpu() {
		let locals = CpuLocals::new();
		let (_backing, lapic) = fake_lapic();
		let madt = madt_with(&[0, 1, 2]);
		let clock = FakeClock::default();

		// SAFETY: test-only, single-threaded, no real trampoline exists
		// because `AlwaysStartsHooks` never dereferences its inputs.
		let count =
			unsafe { init_smp::<AlwaysStartsHooks, _>(&locals, &clock, &lapic, &madt, fake_entry, Phys::new(0), 0x1_0000_0000) };

		assert_eq!(count, 3);
		for i in 0..3 {
			assert_eq!(locals.get(i).unwrap().cpu_number, i);
		}
	}

	#[test]
	fn failed_ap_is_skipped_but_does_not_abort_bring_up() {
		let locals = CpuLocals::new();
		let (_backing, lapic) = fake_lapic();
		let madt = madt_with(&[0, 1, 2]);
		let clock = FakeClock::default();

		// SAFETY: see above.
		let count =
			unsafe { init_smp::<NeverStartsHooks, _>(&locals, &clock, &lapic, &madt, fake_entry, Phys::new(0), 0x2_0000_0000) };

		// Only CPU 0 (the BSP, installed directly, never attempted over
		// IPI) is ever committed.
		assert_eq!(count, 1);
	}

	#[test]
	fn ap_retry_after_failed_first_sipi_still_succeeds() {
		let locals = CpuLocals::new();
		let (_backing, lapic) = fake_lapic();
		let madt = madt_with(&[0, 5]);
		let clock = FakeClock::default();

		// SAFETY: see above.
		let count = unsafe {
			init_smp::<RetryThenStartsHooks, _>(&locals, &clock, &lapic, &madt, fake_entry, Phys::new(0), 0x3_0000_0000)
		};

		assert_eq!(count, 2);
		assert_eq!(locals.get(1).unwrap().lapic_id, 5);
	}
}
