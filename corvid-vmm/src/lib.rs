//! Multi-level page table management for the corvid kernel core.
//!
//! Exposes one capability set — [`Pagemap::map`]/[`Pagemap::unmap`]/
//! [`Pagemap::remap`] plus the boot-time [`identity_map_boot_memory`]
//! pass — behind two mutually-exclusive implementations selected at
//! compile time by Cargo feature: 4-level paging (`arch-x86_64`) or
//! 2-level paging (`arch-i686`). The two share an interface but differ in
//! walk depth, index extraction, and entry width; nothing outside this
//! crate needs to know which one is active.
#![cfg_attr(not(test), no_std)]

#[cfg(all(feature = "arch-x86_64", feature = "arch-i686"))]
compile_error!("corvid-vmm: `arch-x86_64` and `arch-i686` are mutually exclusive");
#[cfg(not(any(feature = "arch-x86_64", feature = "arch-i686")))]
compile_error!("corvid-vmm: exactly one of `arch-x86_64`/`arch-i686` must be enabled");

mod error;
mod flags;

#[cfg(feature = "arch-i686")]
#[path = "i686.rs"]
mod arch;
#[cfg(feature = "arch-x86_64")]
#[path = "x86_64.rs"]
mod arch;

pub use arch::{identity_map_boot_memory, Pagemap};
pub use error::{MapError, RemapError, UnmapError};
pub use flags::PageFlags;
