//! The corvid kernel core: ties the physical memory manager, virtual
//! memory manager, APIC drivers, and SMP bring-up together behind a
//! single boot-sequence entry point.
//!
//! [`init_core`] runs firmware-map → PMM → VMM → APIC → SMP in order;
//! each stage here is just a call into the crate that actually owns it.
#![cfg_attr(not(test), no_std)]

pub mod config;
mod error;

pub use error::CoreError;

use acpi::AcpiTables;
use corvid_acpi::{LinearMapAcpiHandler, MadtInfo};
use corvid_apic::{lapic, IoApicTable, Lapic};
use corvid_mem::{MemoryMap, MemoryMapEntry, Pmm};
use corvid_smp::{ArchHooks, Clock};
use corvid_vmm::Pagemap;

pub use corvid_apic::ApicError;
pub use corvid_mem::OomError;
pub use corvid_smp::{CpuLocal, SmpError, Tss, LOCALS, MAX_CPUS};
pub use corvid_vmm::{MapError, PageFlags, RemapError, UnmapError};

/// Everything [`init_core`] built, handed back so the scheduler/driver
/// layer external to this crate can keep using them.
pub struct Core {
	/// The physical page frame allocator, already walked over the
	/// firmware memory map and switched to [`corvid_mem::Strategy::Fast`].
	pub pmm:      Pmm,
	/// The kernel's own address space, with the boot-time identity map
	/// already established.
	pub pagemap:  Pagemap,
	/// The calling CPU's local APIC, already enabled.
	pub lapic:    Lapic,
	/// Every I/O APIC the MADT reported, ready for
	/// [`IoApicTable::set_up_legacy_irq`]/[`IoApicTable::connect_gsi_to_vec`].
	pub io_apics: IoApicTable,
	/// The normalized MADT, kept around in case a caller needs a detail
	/// this struct doesn't otherwise surface (e.g. NMI sources).
	pub madt:     MadtInfo,
	/// How many CPUs [`corvid_smp::init_smp`] successfully brought up,
	/// including the BSP.
	pub cpu_count: usize,
}

/// Runs the full boot sequence: walks `memmap` into the PMM, identity-maps
/// usable physical memory, discovers the MADT from `tables`, enables the
/// local APIC, builds the I/O APIC table, then wakes every other CPU the
/// MADT reports, routing each to `entry`.
///
/// `leaf1_edx` is the `cpuid` leaf 1 EDX value for the calling CPU — the
/// caller reads this itself (via the `cpuid` hook) rather than this
/// function executing the instruction, so that `corvid-core` stays
/// architecture-agnostic at the source level.
///
/// `stack_region_top` is forwarded unchanged to [`corvid_smp::init_smp`].
///
/// # Errors
///
/// Returns [`CoreError::Apic`] if the calling CPU reports no local APIC,
/// [`CoreError::Acpi`] if `tables` names no APIC interrupt model, or
/// [`CoreError::Map`] if the PMM runs out of memory while identity-mapping.
///
/// # Panics
///
/// Panics (via [`corvid_debug::dbg_panic`]) if there is not enough usable
/// memory to bootstrap the PMM's own bitmap, or if more local APICs are
/// reported than [`corvid_smp::MAX_CPUS`].
///
/// # Safety
///
/// Must be called exactly once, by the bootstrap processor, after
/// [`corvid_mem::translate::set_phys_offset`] has run and before any other
/// CPU is running kernel code. `tables`'s physical addresses must already
/// be reachable through that offset.
pub unsafe fn init_core<E: MemoryMapEntry, H: ArchHooks, C: Clock>(
	memmap: &MemoryMap<'_, E>,
	tables: &AcpiTables<LinearMapAcpiHandler>,
	leaf1_edx: u32,
	entry: extern "C" fn() -> !,
	clock: &C,
	stack_region_top: u64,
) -> Result<Core, CoreError> {
	let pmm = Pmm::new();
	pmm.init(memmap)
		.unwrap_or_else(|_| corvid_debug::dbg_panic!("not enough usable memory to bootstrap the page frame allocator"));

	let pagemap = Pagemap::new(&pmm)?;
	corvid_vmm::identity_map_boot_memory(&pagemap, &pmm, memmap, config::KERNEL_PHYS_OFFSET)?;

	pmm.change_allocation_method();

	let madt = MadtInfo::discover(tables)?;

	lapic::check_supported(leaf1_edx)?;
	// SAFETY: the local APIC's physical address falls within the first 4
	// GiB (per its hardware-fixed location near `0xFEE00000`), which
	// `identity_map_boot_memory` above always maps unconditionally.
	let lapic = unsafe { Lapic::new(madt.local_apic_address.as_mut_ptr_unchecked::<u8>()) };
	lapic.enable();

	// SAFETY: every I/O APIC address the MADT reports is likewise within
	// the first 4 GiB, per the same identity-map guarantee.
	let io_apics = unsafe { IoApicTable::from_madt(&madt) };

	// SAFETY: this is the BSP, called once, per this function's own
	// contract.
	let cpu_count = unsafe { corvid_smp::init_smp::<H, C>(&LOCALS, clock, &lapic, &madt, entry, pagemap.root(), stack_region_top) };

	Ok(Core { pmm, pagemap, lapic, io_apics, madt, cpu_count })
}
