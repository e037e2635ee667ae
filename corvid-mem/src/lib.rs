//! Physical memory management for the corvid kernel core.
//!
//! Two things live here: a global physical-to-virtual [`translate`]
//! offset that every other crate in the workspace resolves hardware
//! addresses through, and [`Pmm`], the bitmap physical page frame
//! allocator built on top of it.
#![cfg_attr(not(test), no_std)]

pub mod error;
pub mod memmap;
pub mod phys;
pub mod pmm;
pub mod translate;

pub use error::OomError;
pub use memmap::{MemoryMap, MemoryMapEntry};
pub use phys::Phys;
pub use pmm::{MemStats, Pmm, Strategy, PAGE_SIZE};
