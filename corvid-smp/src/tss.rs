//! The x86_64 Task-State Segment.
//!
//! This crate only needs `rsp0` (the ring-0 stack pointer the CPU loads
//! on a privilege-level change) and `ist1` (the first interrupt-stack-
//! table slot) populated, but the full hardware-defined shape is kept so
//! a fault handler installed outside this crate can use the remaining
//! `ist*`/`rsp*` slots without this type needing to grow later.

/// One half of a TSS stack-pointer field, split low/high because the
/// hardware layout is not naturally 8-byte aligned at every field.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, align(4))]
pub struct TssPtr {
	/// Low 32 bits of the pointer.
	pub low:  u32,
	/// High 32 bits of the pointer.
	pub high: u32,
}

impl From<u64> for TssPtr {
	fn from(value: u64) -> Self {
		Self { low: value as u32, high: (value >> 32) as u32 }
	}
}

impl From<TssPtr> for u64 {
	fn from(ptr: TssPtr) -> Self {
		(u64::from(ptr.high) << 32) | u64::from(ptr.low)
	}
}

/// The x86_64 Task-State Segment. One per CPU, aligned to 16 bytes.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct Tss {
	res0:                u32,
	/// Ring-0 stack pointer, loaded by the CPU on a ring-3 → ring-0 transition.
	pub rsp0:            TssPtr,
	/// Ring-1 stack pointer. Unused by this core (no ring-1 tasks exist),
	/// kept for hardware layout completeness.
	pub rsp1:            TssPtr,
	/// Ring-2 stack pointer. Unused, see `rsp1`.
	pub rsp2:            TssPtr,
	res1:                u32,
	res2:                u32,
	/// Interrupt-stack-table slot 1: the stack an interrupt handler with
	/// IST index 1 in its IDT gate switches to, regardless of the
	/// interrupted code's privilege level.
	pub ist1:            TssPtr,
	/// IST slot 2. Unused by this core.
	pub ist2:            TssPtr,
	/// IST slot 3. Unused by this core.
	pub ist3:            TssPtr,
	/// IST slot 4. Unused by this core.
	pub ist4:            TssPtr,
	/// IST slot 5. Unused by this core.
	pub ist5:            TssPtr,
	/// IST slot 6. Unused by this core.
	pub ist6:            TssPtr,
	/// IST slot 7. Unused by this core.
	pub ist7:            TssPtr,
	res3:                u32,
	res4:                u32,
	res5:                u16,
	/// Offset of the I/O permission bitmap, relative to the TSS base.
	/// Set to `size_of::<Tss>()` so the CPU treats every I/O port as
	/// off-limits from ring 3 (there is no bitmap past the TSS itself).
	pub iopb_offset:     u16,
}

impl Default for Tss {
	fn default() -> Self {
		Self {
			res0:            0,
			rsp0:            TssPtr::default(),
			rsp1:            TssPtr::default(),
			rsp2:            TssPtr::default(),
			res1:            0,
			res2:            0,
			ist1:            TssPtr::default(),
			ist2:            TssPtr::default(),
			ist3:            TssPtr::default(),
			ist4:            TssPtr::default(),
			ist5:            TssPtr::default(),
			ist6:            TssPtr::default(),
			ist7:            TssPtr::default(),
			res3:            0,
			res4:            0,
			res5:            0,
			iopb_offset:     core::mem::size_of::<Tss>() as u16,
		}
	}
}

impl Tss {
	/// Builds a TSS with `rsp0` and `ist1` both pointing at `stack_top`:
	/// the one kernel stack this CPU uses whether it arrived via a
	/// privilege-level change or an IST-routed interrupt.
	#[must_use]
	pub fn for_kernel_stack(stack_top: u64) -> Self {
		Self { rsp0: stack_top.into(), ist1: stack_top.into(), ..Self::default() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tss_ptr_round_trips_through_u64() {
		let ptr = TssPtr::from(0x1122_3344_5566_7788_u64);
		assert_eq!(u64::from(ptr), 0x1122_3344_5566_7788);
	}

	#[test]
	fn for_kernel_stack_sets_rsp0_and_ist1() {
		let tss = Tss::for_kernel_stack(0xffff_8000_0010_0000);
		assert_eq!(u64::from(tss.rsp0), 0xffff_8000_0010_0000);
		assert_eq!(u64::from(tss.ist1), 0xffff_8000_0010_0000);
	}
}
