//! I/O APIC driver: programs the system-wide interrupt redirection table.

use corvid_acpi::{Bounded, InterruptSourceOverrideDescriptor, MadtInfo, MAX_IO_APICS};
use corvid_mem::Phys;

/// I/O Register Select — write the redirection-table/version register
/// index here before reading or writing [`REG_WIN`].
const REG_SEL: usize = 0x00;
/// I/O Window — the data register for whichever index [`REG_SEL`] selects.
const REG_WIN: usize = 0x10;
/// I/O APIC version register index; bits `[23:16]` hold the maximum
/// redirection-table entry index.
const IOAPICVER: u32 = 1;
/// The first redirection-table register index (low dword of GSI 0's
/// entry); each GSI occupies two consecutive dwords from here.
const IOREDTBL_BASE: u32 = 16;

/// One I/O APIC's MMIO register window and the GSI range it owns.
#[derive(Clone, Copy)]
pub struct IoApic {
	base:     *mut u8,
	/// This I/O APIC's ACPI id, used only for diagnostics.
	pub id:   u8,
	/// First GSI this I/O APIC is responsible for.
	pub gsi_base: u32,
}

// SAFETY: every access is a volatile read/write through the index/data
// register pair; no additional synchronization is required beyond what
// the hardware provides for that protocol.
unsafe impl Send for IoApic {}
// SAFETY: see above.
unsafe impl Sync for IoApic {}

impl IoApic {
	/// Creates a handle over the I/O APIC described by `descriptor`.
	///
	/// # Safety
	///
	/// `descriptor.address` must be mapped at the time any method on the
	/// returned handle is called.
	#[must_use]
	pub unsafe fn new(descriptor: &corvid_acpi::IoApicDescriptor) -> Self {
		// SAFETY: forwarded to the caller.
		let base = unsafe { descriptor.address.as_mut_ptr_unchecked::<u8>() };
		Self { base, id: descriptor.id, gsi_base: descriptor.gsi_base }
	}

	/// Reads the register at index `reg`.
	#[must_use]
	pub fn read(&self, reg: u32) -> u32 {
		// SAFETY: `base` is valid per `new`'s contract; `REG_SEL`/`REG_WIN`
		// are within the I/O APIC's fixed 32-byte MMIO window.
		unsafe {
			self.base.add(REG_SEL).cast::<u32>().write_volatile(reg);
			self.base.add(REG_WIN).cast::<u32>().read_volatile()
		}
	}

	/// Writes `value` to the register at index `reg`.
	pub fn write(&self, reg: u32, value: u32) {
		// SAFETY: see `read`.
		unsafe {
			self.base.add(REG_SEL).cast::<u32>().write_volatile(reg);
			self.base.add(REG_WIN).cast::<u32>().write_volatile(value);
		}
	}

	/// The highest redirection-table index this I/O APIC supports (its
	/// entry count minus one).
	#[must_use]
	pub fn max_redirects(&self) -> u32 {
		(self.read(IOAPICVER) >> 16) & 0xff
	}

	/// Whether `gsi` falls within the range this I/O APIC owns.
	#[must_use]
	pub fn handles_gsi(&self, gsi: u32) -> bool {
		gsi >= self.gsi_base && gsi < self.gsi_base + self.max_redirects() + 1
	}

	/// Writes a full redirection-table entry for `gsi`.
	fn set_redirect(&self, vector: u8, gsi: u32, flags: u16, target_lapic_id: u8, enabled: bool) {
		let entry = encode_redirect(vector, flags, target_lapic_id, enabled);
		let index = (gsi - self.gsi_base) * 2 + IOREDTBL_BASE;
		self.write(index, entry as u32);
		self.write(index + 1, (entry >> 32) as u32);
	}
}

/// Encodes a 64-bit I/O APIC redirection-table entry.
///
/// Low 8 bits = `vector`, bit 13 = active-low (flags bit 1), bit 15 =
/// level-triggered (flags bit 3), bit 16 = masked (`!enabled`), bits
/// `[63:56]` = `target_lapic_id`.
fn encode_redirect(vector: u8, flags: u16, target_lapic_id: u8, enabled: bool) -> u64 {
	let mut entry = u64::from(vector);

	if flags & (1 << 1) != 0 {
		entry |= 1 << 13;
	}
	if flags & (1 << 3) != 0 {
		entry |= 1 << 15;
	}
	if !enabled {
		entry |= 1 << 16;
	}
	entry |= u64::from(target_lapic_id) << 56;

	entry
}

/// Every I/O APIC in the system, as discovered from the MADT.
pub struct IoApicTable {
	apics: Bounded<IoApic, MAX_IO_APICS>,
	isos:  Bounded<InterruptSourceOverrideDescriptor, { corvid_acpi::MAX_ISOS }>,
}

impl IoApicTable {
	/// Builds the I/O APIC table from a normalized MADT.
	///
	/// # Safety
	///
	/// Every I/O APIC address in `madt` must already be mapped.
	#[must_use]
	pub unsafe fn from_madt(madt: &MadtInfo) -> Self {
		let mut apics = Bounded::new();
		for descriptor in madt.io_apics.iter() {
			// SAFETY: forwarded to the caller of `from_madt`.
			apics.push(unsafe { IoApic::new(descriptor) });
		}
		Self { apics, isos: madt.isos }
	}

	/// Finds the I/O APIC responsible for `gsi`.
	#[must_use]
	pub fn from_gsi(&self, gsi: u32) -> Option<&IoApic> {
		self.apics.iter().find(|a| a.handles_gsi(gsi))
	}

	/// Directly connects `gsi` to `vector`, bypassing the legacy-IRQ/ISO
	/// lookup `set_up_legacy_irq` performs.
	///
	/// Returns `false` if no I/O APIC owns `gsi`.
	pub fn connect_gsi_to_vec(&self, target_lapic_id: u8, vector: u8, gsi: u32, flags: u16, enabled: bool) -> bool {
		let Some(apic) = self.from_gsi(gsi) else {
			return false;
		};
		apic.set_redirect(vector, gsi, flags, target_lapic_id, enabled);
		true
	}

	/// Maps legacy ISA IRQ `irq` to vector `irq + 0x20`, consulting the
	/// MADT's Interrupt Source Overrides for a GSI/flags remapping.
	///
	/// If an ISO names `irq` as its `irq_source`, its GSI and flags are
	/// used instead of `irq` itself and the default (edge-triggered,
	/// active-high) flags — but the *vector* programmed is still
	/// `irq_source + 0x20`, not derived from the override.
	///
	/// Returns `false` if no I/O APIC owns the resolved GSI.
	pub fn set_up_legacy_irq(&self, target_lapic_id: u8, irq: u8, enabled: bool) -> bool {
		let Some(iso) = self.isos.iter().find(|iso| iso.irq_source == irq) else {
			return self.connect_gsi_to_vec(target_lapic_id, irq + 0x20, u32::from(irq), 0, enabled);
		};
		self.connect_gsi_to_vec(target_lapic_id, iso.irq_source + 0x20, iso.gsi, iso.flags, enabled)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;
	use corvid_acpi::IoApicDescriptor;

	/// Sets the process-global physical-address offset to zero the first
	/// time any test in this module needs it, so `Phys::as_mut_ptr_unchecked`
	/// resolves a test-local backing buffer's own address unchanged.
	fn ensure_zero_phys_offset() {
		static DONE: AtomicBool = AtomicBool::new(false);
		if !DONE.swap(true, Ordering::SeqCst) {
			// SAFETY: called at most once (guarded above), before any
			// translation in this test binary.
			unsafe { corvid_mem::translate::set_phys_offset(0) };
		}
	}

	/// Builds a one-I/O-APIC table backed by host memory standing in for
	/// its MMIO window, with `max_redirects()` faked to `23`. The backing
	/// buffer is sized generously since `IoApic` only ever touches its
	/// first two registers (`REG_SEL`/`REG_WIN`); real hardware resolves
	/// every other "register" internally rather than through addressable
	/// memory, so nothing beyond those two offsets is ever read back.
	fn fake_table() -> (Box<[u8]>, IoApicTable) {
		ensure_zero_phys_offset();
		let mut backing = vec![0_u8; 256].into_boxed_slice();
		let base = backing.as_mut_ptr();

		let descriptor = IoApicDescriptor { id: 0, address: Phys::new(base as u64), gsi_base: 0 };
		let mut madt = MadtInfo {
			local_apic_address: Phys::new(0),
			local_apics:        Bounded::new(),
			io_apics:           Bounded::new(),
			isos:                Bounded::new(),
			nmi_sources:         Bounded::new(),
		};
		madt.io_apics.push(descriptor);

		// SAFETY: `backing` outlives the returned table.
		let table = unsafe { IoApicTable::from_madt(&madt) };
		table.apics.iter().next().unwrap().write(IOAPICVER, 23 << 16);
		(backing, table)
	}

	#[test]
	fn max_redirects_reads_version_register_bits_23_16() {
		let (_backing, table) = fake_table();
		assert_eq!(table.apics.iter().next().unwrap().max_redirects(), 23);
	}

	#[test]
	fn from_gsi_finds_the_owning_apic_within_its_redirect_range() {
		let (_backing, table) = fake_table();
		assert!(table.from_gsi(5).is_some());
		assert!(table.from_gsi(24).is_none());
	}

	#[test]
	fn set_up_legacy_irq_without_iso_succeeds_against_the_identity_gsi() {
		let (_backing, table) = fake_table();
		assert!(table.set_up_legacy_irq(0, 0, true));
	}

	#[test]
	fn set_up_legacy_irq_with_no_owning_ioapic_fails() {
		let (_backing, table) = fake_table();
		assert!(!table.set_up_legacy_irq(0, 200, true));
	}

	#[test]
	fn set_up_legacy_irq_with_iso_resolves_override_gsi() {
		let (_backing, mut table) = fake_table();
		table.isos.push(InterruptSourceOverrideDescriptor { irq_source: 0, gsi: 2, flags: 0 });
		assert!(table.set_up_legacy_irq(0, 0, true));
	}

	#[test]
	fn encode_redirect_sets_vector_polarity_trigger_mask_and_target() {
		let entry = encode_redirect(0x20, 0b1010, 7, false);
		assert_eq!(entry & 0xff, 0x20);
		assert_ne!(entry & (1 << 13), 0, "active-low bit should be set");
		assert_ne!(entry & (1 << 15), 0, "level-triggered bit should be set");
		assert_ne!(entry & (1 << 16), 0, "masked bit should be set when disabled");
		assert_eq!(entry >> 56, 7);
	}

	#[test]
	fn encode_redirect_leaves_mask_clear_when_enabled() {
		let entry = encode_redirect(0x20, 0, 0, true);
		assert_eq!(entry & (1 << 16), 0);
	}
}
