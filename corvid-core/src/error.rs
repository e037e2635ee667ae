//! The one error type `corvid-core`'s boot sequence can fail with,
//! wrapping whichever component crate's own error actually fired.

use corvid_acpi::AcpiError;
use corvid_apic::ApicError;
use corvid_vmm::MapError;

/// A failure anywhere in [`crate::init_core`].
///
/// Every variant here is fatal at boot: `init_core` runs once, before any
/// of the recoverable per-AP retry logic in [`corvid_smp::init_smp`]
/// applies, so there is no partial-success case to report — either the
/// whole sequence completes or it stops at the first hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
	/// The firmware ACPI tables could not be parsed into a MADT.
	Acpi(AcpiError),
	/// Establishing the boot-time identity map ran out of memory.
	Map(MapError),
	/// The running CPU reports no local APIC.
	Apic(ApicError),
}

impl From<AcpiError> for CoreError {
	fn from(err: AcpiError) -> Self {
		Self::Acpi(err)
	}
}

impl From<MapError> for CoreError {
	fn from(err: MapError) -> Self {
		Self::Map(err)
	}
}

impl From<ApicError> for CoreError {
	fn from(err: ApicError) -> Self {
		Self::Apic(err)
	}
}
