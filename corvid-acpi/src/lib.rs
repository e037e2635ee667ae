//! Normalizes the firmware-supplied MADT (Multiple APIC Description Table)
//! into the fixed-capacity descriptor types `corvid-apic` and `corvid-smp`
//! consume.
//!
//! Parsing ACPI tables needs a heap (the `acpi` crate's [`PlatformInfo`]
//! builds `Vec`-backed lists internally), so this is the one crate in the
//! workspace that pulls in `alloc` — everything downstream of it works
//! with plain arrays sized by the architectural `MAX_*` constants, so the
//! rest of the core never needs one.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use acpi::{
	platform::interrupt::InterruptSourceOverride as AcpiIso, AcpiHandler, AcpiTables, InterruptModel, PhysicalMapping,
	PlatformInfo,
};
use corvid_mem::Phys;

/// Upper bound on the number of local APICs (and therefore logical CPUs)
/// this crate will normalize. Mirrors `corvid_smp::MAX_CPUS`; kept as an
/// independent constant so this crate does not have to depend on
/// `corvid-smp` just to size an array.
pub const MAX_LOCAL_APICS: usize = 64;

/// Upper bound on the number of I/O APICs normalized from one MADT.
pub const MAX_IO_APICS: usize = 8;

/// Upper bound on the number of Interrupt Source Overrides normalized.
pub const MAX_ISOS: usize = 16;

/// Upper bound on the number of local APIC NMI sources normalized.
pub const MAX_NMI_SOURCES: usize = 8;

/// Failure to locate or parse the firmware ACPI tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
	/// The `acpi` crate failed to locate or validate the root tables.
	Lookup,
	/// The tables were found, but described no APIC interrupt model (a
	/// legacy 8259-only system, or a malformed MADT).
	NoApicModel,
}

/// A single local APIC entry from the MADT: one per logical CPU.
#[derive(Debug, Clone, Copy)]
pub struct LocalApicDescriptor {
	/// The ACPI processor UID.
	pub processor_id: u8,
	/// This CPU's local APIC ID, the target of INIT/SIPI and IPI sends.
	pub lapic_id: u8,
}

/// A single I/O APIC entry from the MADT.
#[derive(Debug, Clone, Copy)]
pub struct IoApicDescriptor {
	/// The I/O APIC's ACPI id.
	pub id: u8,
	/// The physical address of the I/O APIC's register window.
	pub address: Phys,
	/// The first Global System Interrupt this I/O APIC is responsible for.
	pub gsi_base: u32,
}

/// An Interrupt Source Override: a firmware record remapping a legacy ISA
/// IRQ onto a GSI with possibly altered polarity/trigger mode.
#[derive(Debug, Clone, Copy)]
pub struct InterruptSourceOverrideDescriptor {
	/// The legacy ISA IRQ number being remapped.
	pub irq_source: u8,
	/// The GSI it is remapped to.
	pub gsi: u32,
	/// Raw MPS INTI flags (bit 1 = active-low, bit 3 = level-triggered).
	pub flags: u16,
}

/// A local APIC NMI source: a processor (or "all processors") / LINT pin
/// pair that should be programmed for NMI delivery.
#[derive(Debug, Clone, Copy)]
pub struct NmiSourceDescriptor {
	/// The LINT pin (0 or 1) the NMI is wired to.
	pub lint: u8,
	/// Raw MPS INTI flags, same encoding as [`InterruptSourceOverrideDescriptor::flags`].
	pub flags: u16,
}

/// A fixed-capacity, push-only list. Used throughout this crate instead of
/// `Vec` so that everything it hands to callers is plain, `'static`-sized
/// data with no heap involved once normalization has run.
#[derive(Debug, Clone, Copy)]
pub struct Bounded<T: Copy, const N: usize> {
	items: [Option<T>; N],
	len:   usize,
}

impl<T: Copy, const N: usize> Bounded<T, N> {
	/// Creates an empty list.
	#[must_use]
	pub const fn new() -> Self {
		Self { items: [None; N], len: 0 }
	}

	/// Appends `item`, silently dropping it if the list is already at
	/// capacity. A MADT reporting more entries than `N` is not expected on
	/// any system this core targets; dropping the overflow is preferable
	/// to a boot-time panic over a cosmetic limit.
	pub fn push(&mut self, item: T) {
		if self.len < N {
			self.items[self.len] = Some(item);
			self.len += 1;
		}
	}

	/// Iterates the entries actually present.
	pub fn iter(&self) -> impl Iterator<Item = &T> {
		self.items[..self.len].iter().map(|o| o.as_ref().unwrap())
	}

	/// How many entries are present.
	#[must_use]
	pub fn len(&self) -> usize {
		self.len
	}

	/// Whether this list holds no entries.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len == 0
	}
}

/// The normalized contents of the firmware MADT: everything `corvid-apic`
/// and `corvid-smp` need, with the `acpi` crate's table-walking machinery
/// already discarded.
#[derive(Debug, Clone, Copy)]
pub struct MadtInfo {
	/// The physical address of the local APIC register window, shared by
	/// every CPU (each core's local APIC is mapped at the same physical
	/// address; only the implicit "current CPU" addressee differs).
	pub local_apic_address: Phys,
	/// One entry per logical CPU, boot processor first.
	pub local_apics:        Bounded<LocalApicDescriptor, MAX_LOCAL_APICS>,
	/// Every I/O APIC in the system.
	pub io_apics:           Bounded<IoApicDescriptor, MAX_IO_APICS>,
	/// Every legacy-IRQ remapping.
	pub isos:                Bounded<InterruptSourceOverrideDescriptor, MAX_ISOS>,
	/// Every local APIC NMI source.
	pub nmi_sources:         Bounded<NmiSourceDescriptor, MAX_NMI_SOURCES>,
}

impl MadtInfo {
	/// Parses the MADT out of `tables` into fixed-capacity descriptor
	/// lists.
	///
	/// # Errors
	///
	/// Returns [`AcpiError::NoApicModel`] if the platform reports no APIC
	/// interrupt model (e.g. a legacy PIC-only MADT, which this core does
	/// not support).
	pub fn discover<H: AcpiHandler>(tables: &AcpiTables<H>) -> Result<Self, AcpiError> {
		let platform_info = PlatformInfo::new(tables).map_err(|_| AcpiError::Lookup)?;

		let InterruptModel::Apic(apic) = platform_info.interrupt_model else {
			return Err(AcpiError::NoApicModel);
		};

		let mut info = Self {
			local_apic_address: Phys::new(apic.local_apic_address),
			local_apics:        Bounded::new(),
			io_apics:           Bounded::new(),
			isos:                Bounded::new(),
			nmi_sources:         Bounded::new(),
		};

		if let Some(processor_info) = platform_info.processor_info {
			info.local_apics.push(LocalApicDescriptor {
				processor_id: processor_info.boot_processor.processor_uid as u8,
				lapic_id:     processor_info.boot_processor.local_apic_id as u8,
			});
			for ap in processor_info.application_processors.iter() {
				info.local_apics.push(LocalApicDescriptor {
					processor_id: ap.processor_uid as u8,
					lapic_id:     ap.local_apic_id as u8,
				});
			}
		}

		for io_apic in apic.io_apics.iter() {
			info.io_apics.push(IoApicDescriptor {
				id:       io_apic.id,
				address:  Phys::new(u64::from(io_apic.address)),
				gsi_base: io_apic.global_system_interrupt_base,
			});
		}

		for iso in apic.interrupt_source_overrides.iter() {
			info.isos.push(iso_to_descriptor(iso));
		}

		for nmi in apic.local_apic_nmi_lines.iter() {
			info.nmi_sources.push(NmiSourceDescriptor {
				lint:  nmi.line.into(),
				flags: nmi_flags(nmi),
			});
		}

		Ok(info)
	}
}

/// Re-encodes the `acpi` crate's typed polarity/trigger-mode enums back
/// into the raw MPS INTI flag bits (bit 1 = active-low, bit 3 =
/// level-triggered), since every consumer in this workspace works in
/// terms of that raw encoding rather than the typed enum.
fn iso_to_descriptor(iso: &AcpiIso) -> InterruptSourceOverrideDescriptor {
	InterruptSourceOverrideDescriptor {
		irq_source: iso.isa_source,
		gsi:        iso.global_system_interrupt,
		flags:      mps_flags(iso.polarity, iso.trigger_mode),
	}
}

/// See [`iso_to_descriptor`]; NMI lines carry the same polarity/trigger
/// encoding as interrupt source overrides.
fn nmi_flags(nmi: &acpi::platform::interrupt::NmiLine) -> u16 {
	mps_flags(nmi.polarity, nmi.trigger_mode)
}

fn mps_flags(polarity: acpi::platform::interrupt::Polarity, trigger_mode: acpi::platform::interrupt::TriggerMode) -> u16 {
	use acpi::platform::interrupt::{Polarity, TriggerMode};

	let mut flags = 0_u16;
	if matches!(polarity, Polarity::ActiveLow) {
		flags |= 1 << 1;
	}
	if matches!(trigger_mode, TriggerMode::Level) {
		flags |= 1 << 3;
	}
	flags
}

/// An [`AcpiHandler`] that resolves physical ACPI table addresses through
/// `corvid-mem`'s linear-map translator, rather than mapping each table
/// individually. This core identity-maps all usable physical memory
/// during VMM init, so by the time ACPI parsing runs every address the
/// `acpi` crate asks to map is already reachable.
#[derive(Debug, Clone, Copy)]
pub struct LinearMapAcpiHandler;

/// # Safety
///
/// Valid as an [`AcpiHandler`] only once `corvid_mem::translate::set_phys_offset`
/// has run and the VMM has identity-mapped the requested range, both of
/// which happen before ACPI/MADT parsing in this core's boot order.
impl AcpiHandler for LinearMapAcpiHandler {
	unsafe fn map_physical_region<T>(&self, physical_address: usize, size: usize) -> PhysicalMapping<Self, T> {
		let phys = Phys::new(physical_address as u64);
		// SAFETY: forwarded to the caller of `map_physical_region`, which
		// the `acpi` crate only calls on addresses it has already
		// validated as pointing at mapped ACPI tables.
		let virt = unsafe { phys.as_mut_ptr_unchecked::<T>() };
		// SAFETY: `virt` is non-null and points at memory the linear map
		// covers for at least `size` bytes, per this handler's contract.
		unsafe { PhysicalMapping::new(physical_address, core::ptr::NonNull::new_unchecked(virt), size, size, *self) }
	}

	fn unmap_physical_region<T>(_region: &PhysicalMapping<Self, T>) {
		// The linear map is never torn down; nothing to release.
	}
}

#[cfg(test)]
mod tests {
	use acpi::platform::interrupt::{Polarity, TriggerMode};

	use super::*;

	#[test]
	fn bounded_drops_overflow_silently() {
		let mut list: Bounded<u8, 2> = Bounded::new();
		list.push(1);
		list.push(2);
		list.push(3);

		assert_eq!(list.len(), 2);
		assert_eq!(list.iter().copied().collect::<alloc::vec::Vec<_>>(), [1, 2]);
	}

	#[test]
	fn bounded_starts_empty() {
		let list: Bounded<u8, 4> = Bounded::new();
		assert!(list.is_empty());
		assert_eq!(list.iter().count(), 0);
	}

	#[test]
	fn mps_flags_encodes_active_low_and_level_triggered() {
		assert_eq!(mps_flags(Polarity::ActiveLow, TriggerMode::Level), (1 << 1) | (1 << 3));
		assert_eq!(mps_flags(Polarity::ActiveHigh, TriggerMode::Edge), 0);
	}

	#[test]
	fn mps_flags_bus_default_is_treated_as_active_high_edge() {
		// `SameAsBus` has no "active-low"/"level" bit of its own; the MPS
		// INTI encoding this crate targets has nothing to set in that
		// case, matching legacy ISA IRQs' default polarity/trigger mode.
		assert_eq!(mps_flags(Polarity::SameAsBus, TriggerMode::SameAsBus), 0);
	}

	#[test]
	fn iso_to_descriptor_carries_irq_source_and_gsi_through() {
		let iso = AcpiIso {
			isa_source:             0,
			global_system_interrupt: 2,
			polarity:                Polarity::ActiveLow,
			trigger_mode:            TriggerMode::Level,
		};

		let descriptor = iso_to_descriptor(&iso);
		assert_eq!(descriptor.irq_source, 0);
		assert_eq!(descriptor.gsi, 2);
		assert_eq!(descriptor.flags, (1 << 1) | (1 << 3));
	}
}
