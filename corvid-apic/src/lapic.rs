//! Local APIC (per-CPU interrupt controller) driver.

use corvid_acpi::NmiSourceDescriptor;
use corvid_mem::Phys;

use crate::error::ApicError;

/// Local APIC ID register.
const REG_ID: u32 = 0x20;
/// Local APIC version register.
const REG_VERSION: u32 = 0x30;
/// Error status register; writing any value clears it.
const REG_ESR: u32 = 0x280;
/// Interrupt Command Register, low 32 bits.
const REG_ICR_LOW: u32 = 0x300;
/// Interrupt Command Register, high 32 bits (destination field).
const REG_ICR_HIGH: u32 = 0x310;
/// LINT0 local vector table entry.
const REG_LVT_LINT0: u32 = 0x350;
/// LINT1 local vector table entry.
const REG_LVT_LINT1: u32 = 0x360;
/// End-Of-Interrupt register; writing 0 acknowledges the current interrupt.
const REG_EOI: u32 = 0xB0;
/// Spurious-interrupt vector register.
const REG_SVR: u32 = 0xF0;

/// CPUID leaf 1 EDX bit that reports LAPIC support.
const CPUID_APIC_BIT: u32 = 1 << 9;

/// The CPUID EDX value from leaf 1, subleaf 0 — the only field
/// [`is_supported`] needs. Callers already have a `cpuid(leaf, subleaf)`
/// hook; this type just avoids this crate depending on however that hook
/// is implemented.
#[must_use]
pub fn is_supported(leaf1_edx: u32) -> bool {
	leaf1_edx & CPUID_APIC_BIT != 0
}

/// As [`is_supported`], but returns [`ApicError::Unsupported`] instead of
/// `false` — the form `corvid-core`'s boot sequence calls, since a missing
/// local APIC is fatal rather than a condition it can recover from.
///
/// # Errors
///
/// Returns [`ApicError::Unsupported`] if `leaf1_edx` reports no local APIC.
pub fn check_supported(leaf1_edx: u32) -> Result<(), ApicError> {
	if is_supported(leaf1_edx) {
		Ok(())
	} else {
		Err(ApicError::Unsupported)
	}
}

/// A CPU's local APIC, accessed as memory-mapped IO.
///
/// Every core's local APIC lives at the same physical address (the MADT
/// reports one `local_apic_address` for the whole system); "the local
/// APIC" from any given core's perspective is always its own.
pub struct Lapic {
	/// Pre-translated virtual base of the LAPIC register window.
	base: *mut u8,
}

// SAFETY: every access goes through a volatile read/write of a fixed MMIO
// register; there is no interior aliasing beyond what the hardware itself
// already serializes.
unsafe impl Send for Lapic {}
// SAFETY: see above.
unsafe impl Sync for Lapic {}

impl Lapic {
	/// Creates a local APIC handle over `base`.
	///
	/// # Safety
	///
	/// `base` must be the linear-map virtual address of a mapped local
	/// APIC register window (typically `Phys::new(local_apic_address).as_mut_ptr_unchecked()`),
	/// and must remain mapped for the handle's lifetime.
	#[must_use]
	pub const unsafe fn new(base: *mut u8) -> Self {
		Self { base }
	}

	/// Reads a 32-bit LAPIC register.
	#[must_use]
	pub fn read(&self, reg: u32) -> u32 {
		// SAFETY: `reg` is one of this module's `REG_*` offsets, all
		// within the 4 KiB LAPIC register window, and `base` is valid for
		// the handle's lifetime per `new`'s contract.
		unsafe { self.base.add(reg as usize).cast::<u32>().read_volatile() }
	}

	/// Writes a 32-bit LAPIC register.
	pub fn write(&self, reg: u32, value: u32) {
		// SAFETY: see `read`.
		unsafe { self.base.add(reg as usize).cast::<u32>().write_volatile(value) }
	}

	/// This CPU's local APIC ID.
	#[must_use]
	pub fn id(&self) -> u8 {
		(self.read(REG_ID) >> 24) as u8
	}

	/// The local APIC's hardware version.
	#[must_use]
	pub fn version(&self) -> u32 {
		self.read(REG_VERSION)
	}

	/// Enables the local APIC and sets the spurious-interrupt vector to
	/// `0xFF`.
	///
	/// Sets the spurious-vector register's enable bit (bit 8) and vector
	/// field (bits 0-7) together by OR-ing in `0x1FF`.
	pub fn enable(&self) {
		self.write(REG_SVR, self.read(REG_SVR) | 0x1ff);
	}

	/// Acknowledges the interrupt currently being serviced.
	pub fn eoi(&self) {
		self.write(REG_EOI, 0);
	}

	/// Clears any pending error status.
	pub fn clear_errors(&self) {
		self.write(REG_ESR, 0);
	}

	/// Programs `lint` (0 or 1) for NMI delivery at `vector`, with
	/// polarity/trigger mode decoded from the raw MPS INTI `flags` (bit 1 =
	/// active-low, bit 3 = level-triggered).
	///
	/// # Panics
	///
	/// Panics if `lint` is neither 0 nor 1.
	pub fn set_nmi(&self, vector: u8, flags: u16, lint: u8) {
		let mut entry = 0x400_u32 | u32::from(vector);

		if flags & (1 << 1) != 0 {
			entry |= 1 << 13;
		}
		if flags & (1 << 3) != 0 {
			entry |= 1 << 15;
		}

		match lint {
			0 => self.write(REG_LVT_LINT0, entry),
			1 => self.write(REG_LVT_LINT1, entry),
			other => panic!("invalid LINT pin {other} (must be 0 or 1)"),
		}
	}

	/// Programs an NMI source discovered from the MADT at `vector`.
	pub fn install_nmi(&self, nmi: &NmiSourceDescriptor, vector: u8) {
		self.set_nmi(vector, nmi.flags, nmi.lint);
	}

	/// Sends an ordinary (fixed-delivery) IPI to `target_lapic_id`.
	pub fn send_ipi(&self, target_lapic_id: u8, vector: u8) {
		self.write(REG_ICR_HIGH, u32::from(target_lapic_id) << 24);
		self.write(REG_ICR_LOW, u32::from(vector));
	}

	/// Sends the INIT IPI that begins an application processor's wake-up
	/// sequence.
	///
	/// ICR low encoding `0x4500` is delivery mode INIT, level assert, no
	/// vector.
	pub fn send_init(&self, target_lapic_id: u8) {
		self.write(REG_ICR_HIGH, u32::from(target_lapic_id) << 24);
		self.write(REG_ICR_LOW, 0x4500);
	}

	/// Sends the Startup IPI (SIPI) pointing the target at the real-mode
	/// trampoline page.
	///
	/// `trampoline_page` is the trampoline's physical address divided by
	/// `0x1000`, per the Intel-documented SIPI vector-field encoding. See
	/// `DESIGN.md` for why this crate uses the page-number form rather
	/// than the original source's `0x4600 | trampoline_addr`.
	pub fn send_startup(&self, target_lapic_id: u8, trampoline_page: u8) {
		self.write(REG_ICR_HIGH, u32::from(target_lapic_id) << 24);
		self.write(REG_ICR_LOW, 0x4600 | u32::from(trampoline_page));
	}

	/// Whether the ICR's delivery-status bit (bit 12, "send pending") is
	/// still set — i.e. whether the last IPI has been accepted by the bus.
	#[must_use]
	pub fn ipi_pending(&self) -> bool {
		self.read(REG_ICR_LOW) & (1 << 12) != 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reports_support_from_cpuid_edx_bit_9() {
		assert!(is_supported(1 << 9));
		assert!(!is_supported(0));
	}

	#[test]
	fn check_supported_errs_when_cpuid_bit_clear() {
		assert_eq!(check_supported(1 << 9), Ok(()));
		assert_eq!(check_supported(0), Err(ApicError::Unsupported));
	}

	/// Backs a fake LAPIC register window with a page of host memory so
	/// the encode/decode logic above can be exercised without hardware.
	fn fake_lapic() -> (Box<[u8]>, Lapic) {
		let mut page = vec![0_u8; 4096].into_boxed_slice();
		let base = page.as_mut_ptr();
		// SAFETY: `page` outlives the returned `Lapic` (owned by the same
		// tuple the caller holds), and is large enough for every offset
		// this module touches.
		let lapic = unsafe { Lapic::new(base) };
		(page, lapic)
	}

	#[test]
	fn enable_sets_vector_and_enable_bit() {
		let (_backing, lapic) = fake_lapic();
		lapic.enable();
		assert_eq!(lapic.read(REG_SVR) & 0x1ff, 0x1ff);
	}

	#[test]
	fn set_nmi_encodes_active_low_and_level_triggered() {
		let (_backing, lapic) = fake_lapic();
		lapic.set_nmi(2, 0b1010, 1);
		let entry = lapic.read(REG_LVT_LINT1);
		assert_eq!(entry & 0xff, 2);
		assert_ne!(entry & (1 << 13), 0);
		assert_ne!(entry & (1 << 15), 0);
	}

	#[test]
	fn send_ipi_writes_target_then_vector() {
		let (_backing, lapic) = fake_lapic();
		lapic.send_ipi(7, 0x30);
		assert_eq!(lapic.read(REG_ICR_HIGH) >> 24, 7);
		assert_eq!(lapic.read(REG_ICR_LOW), 0x30);
	}
}
