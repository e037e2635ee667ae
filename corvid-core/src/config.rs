//! Architectural constants for the core, mirrored here rather than in a
//! runtime configuration file: there is no configuration surface before
//! paging is up, so build-time tuning lives in plain `const`s instead.
//!
//! Most of these already have a natural home in the crate that owns the
//! concern they tune ([`corvid_mem::PAGE_SIZE`], [`corvid_smp::MAX_CPUS`],
//! [`corvid_smp::CPU_STACK_SIZE`]) and are simply re-exported here so a
//! caller assembling a boot sequence has one place to look. Only the two
//! offsets below have no other owner.

/// Virtual address the kernel image itself is linked at. Used only to
/// size the `i686` identity-map pass's kernel-overlap exclusion; the
/// `x86_64` path does not need it (see `DESIGN.md`).
pub const KERNEL_PHYS_OFFSET: u64 = 0xc000_0000;

/// Virtual address at which all usable physical memory is linearly
/// mapped, i.e. the value [`corvid_mem::translate::set_phys_offset`] is
/// called with during early boot.
pub const MEM_PHYS_OFFSET: u64 = 0xffff_8000_0000_0000;

/// Bytes per physical page frame. Re-exported from [`corvid_mem`].
pub const PAGE_SIZE: u64 = corvid_mem::PAGE_SIZE;

/// Upper bound on logical CPUs. Re-exported from [`corvid_smp`].
pub const MAX_CPUS: usize = corvid_smp::MAX_CPUS;

/// Bytes of kernel stack per CPU. Re-exported from [`corvid_smp`].
pub const CPU_STACK_SIZE: u64 = corvid_smp::CPU_STACK_SIZE;
