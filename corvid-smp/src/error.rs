//! Failure kinds for SMP bring-up.

/// A failure in starting one application processor.
///
/// [`SmpError::ApStartTimeout`] is recoverable: it is logged and
/// [`crate::init_smp`] moves on to the next AP, so it is only ever seen by
/// `start_ap`'s caller as the inner loop's own decision point, never
/// surfaced across `init_smp` itself, which has no fallible return — a CPU
/// limit overrun is the only condition that can abort bring-up entirely,
/// and it does so by panicking directly rather than returning this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpError {
	/// Starting this AP would exceed [`crate::MAX_CPUS`]. Fatal; callers
	/// never see this variant returned; `init_smp` panics instead.
	CpuLimitExceeded,
	/// The AP did not set its started flag even after a retried Startup
	/// IPI and a 1 second timeout. Recoverable: the AP is skipped.
	ApStartTimeout,
}
