//! Local and I/O APIC drivers for the corvid kernel core.
//!
//! [`lapic`] is the per-CPU interrupt controller each core enables for
//! itself and sends IPIs/EOIs through; [`ioapic`] is the system-wide
//! interrupt redirection layer `corvid-smp`'s legacy IRQ routing and any
//! PCI device driver external to this core programs through.
#![cfg_attr(not(test), no_std)]

mod error;
pub mod ioapic;
pub mod lapic;

pub use error::ApicError;
pub use ioapic::{IoApic, IoApicTable};
pub use lapic::{check_supported, is_supported, Lapic};
