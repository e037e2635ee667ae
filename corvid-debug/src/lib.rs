//! Log and panic sink plumbing for the corvid kernel core.
//!
//! The core bootstraps before any of its own subsystems exist, so it
//! cannot assume a global logger registry (`log`, `tracing`, ...) is
//! available — the printer backend itself is an external collaborator.
//! What lives here is the thin,
//! zero-dependency dispatch layer the rest of the workspace calls
//! through: a pluggable sink function pointer, set once during very
//! early boot, plus the [`dbg!`]/[`dbg_err!`]/[`dbg_warn!`] macros every
//! other crate in this workspace logs through instead of touching the
//! sink directly.
#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicBool, Ordering};

/// Severity of a logged message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
	/// Routine progress information.
	Info,
	/// A recoverable anomaly the caller handled, but which the operator
	/// should know about.
	Warn,
	/// A failure that was handled but indicates something is wrong.
	Err,
	/// Verbose, development-only detail.
	Debug,
}

/// The backend a [`LogSink`] ultimately writes to (serial port, framebuffer
/// console, ring buffer, ...). Implemented by external collaborators; this
/// crate only calls through it.
pub trait LogSink: Sync {
	/// Writes a single formatted message at the given severity.
	fn log(&self, level: LogLevel, args: core::fmt::Arguments<'_>);
}

/// The backend a fatal condition is reported through before the core halts.
///
/// Two entry points, a `panic`/`panic_with_frame` split:
/// [`PanicSink::panic`] for an ordinary fatal message, and
/// [`PanicSink::panic_with_frame`] for a fault handler that already has a
/// saved register frame to dump alongside it.
pub trait PanicSink: Sync {
	/// Reports `args` as fatal and halts the system. Never returns.
	fn panic(&self, args: core::fmt::Arguments<'_>) -> !;

	/// As [`PanicSink::panic`], additionally dumping `frame`.
	///
	/// Default implementation discards the frame and defers to
	/// [`PanicSink::panic`]; implementors with a real register-frame
	/// format should override this.
	fn panic_with_frame(&self, args: core::fmt::Arguments<'_>, _frame: &dyn core::fmt::Debug) -> ! {
		self.panic(args)
	}
}

/// A [`LogSink`] that drops every message. Used as the pre-boot default so
/// [`log`] is always safe to call, even before [`set_log_sink`] has run.
struct NullSink;

impl LogSink for NullSink {
	fn log(&self, _level: LogLevel, _args: core::fmt::Arguments<'_>) {}
}

static NULL_SINK: NullSink = NullSink;
static mut LOG_SINK: &'static dyn LogSink = &NULL_SINK;
static LOG_SINK_SET: AtomicBool = AtomicBool::new(false);

/// Installs the log sink the rest of boot will dispatch through.
///
/// Must be called exactly once, as early as possible — before
/// `corvid-mem`'s PMM is initialized, so that its own diagnostics have
/// somewhere to go.
///
/// # Safety
///
/// Must not be called concurrently with itself or with [`log`] from
/// another core; the bring-up sequence that calls this runs single-core
/// by construction (application processors have not yet been woken).
pub unsafe fn set_log_sink(sink: &'static dyn LogSink) {
	assert!(!LOG_SINK_SET.swap(true, Ordering::SeqCst), "log sink already installed");
	// SAFETY: forwarded to the caller; single-writer by precondition.
	unsafe {
		#[expect(static_mut_refs)]
		{
			LOG_SINK = sink;
		}
	}
}

/// Dispatches a message to the installed log sink, or silently drops it if
/// none has been installed yet.
pub fn log(level: LogLevel, args: core::fmt::Arguments<'_>) {
	// SAFETY: `LOG_SINK` is single-writer (see `set_log_sink`) and always
	// points at either `NULL_SINK` or a `'static` sink handed to us.
	#[expect(static_mut_refs)]
	unsafe {
		LOG_SINK.log(level, args);
	}
}

/// Logs an informational message.
#[macro_export]
macro_rules! dbg {
	($tag:literal, $($arg:tt)*) => {
		$crate::log($crate::LogLevel::Info, format_args!("{}: {}", $tag, format_args!($($arg)*)));
	};
}

/// Logs an error message.
#[macro_export]
macro_rules! dbg_err {
	($tag:literal, $($arg:tt)*) => {
		$crate::log($crate::LogLevel::Err, format_args!("{}: {}", $tag, format_args!($($arg)*)));
	};
}

/// Logs a warning message.
#[macro_export]
macro_rules! dbg_warn {
	($tag:literal, $($arg:tt)*) => {
		$crate::log($crate::LogLevel::Warn, format_args!("{}: {}", $tag, format_args!($($arg)*)));
	};
}

static mut PANIC_SINK: Option<&'static dyn PanicSink> = None;
static PANIC_SINK_SET: AtomicBool = AtomicBool::new(false);

/// Installs the panic sink. As with [`set_log_sink`], called exactly once
/// during very early boot.
///
/// # Safety
///
/// Same constraints as [`set_log_sink`].
pub unsafe fn set_panic_sink(sink: &'static dyn PanicSink) {
	assert!(!PANIC_SINK_SET.swap(true, Ordering::SeqCst), "panic sink already installed");
	// SAFETY: forwarded to the caller.
	unsafe {
		#[expect(static_mut_refs)]
		{
			PANIC_SINK = Some(sink);
		}
	}
}

/// Reports a fatal condition and halts.
///
/// If no panic sink has been installed yet (a fatal condition hit before
/// boot finished wiring one up), falls back to a bare `loop {}` after
/// logging through whatever log sink is available — there is nothing
/// else this crate can do.
#[expect(static_mut_refs)]
pub fn panic(args: core::fmt::Arguments<'_>) -> ! {
	log(LogLevel::Err, args);
	// SAFETY: `PANIC_SINK` is single-writer, set at most once during boot.
	match unsafe { PANIC_SINK } {
		Some(sink) => sink.panic(args),
		None => loop {
			core::hint::spin_loop();
		},
	}
}

/// Fatally reports `msg`, formatted with the caller's source location.
#[macro_export]
macro_rules! dbg_panic {
	($($arg:tt)*) => {
		$crate::panic(format_args!("{} ({}:{}:{})", format_args!($($arg)*), file!(), line!(), column!()))
	};
}

/// Panics with `msg` unless `cond` holds.
#[macro_export]
macro_rules! panic_unless {
	($cond:expr, $($arg:tt)*) => {
		if !($cond) {
			$crate::dbg_panic!($($arg)*);
		}
	};
}

/// Panics with `msg` if `cond` holds.
#[macro_export]
macro_rules! panic_if {
	($cond:expr, $($arg:tt)*) => {
		if $cond {
			$crate::dbg_panic!($($arg)*);
		}
	};
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex as StdMutex;

	struct RecordingSink {
		messages: StdMutex<Vec<String>>,
	}

	impl LogSink for RecordingSink {
		fn log(&self, level: LogLevel, args: core::fmt::Arguments<'_>) {
			self.messages.lock().unwrap().push(format!("{level:?}: {args}"));
		}
	}

	#[test]
	fn null_sink_swallows_messages_silently() {
		// Exercises the pre-install path without racing the process-global
		// sink that other tests in this binary may have already installed.
		NullSink.log(LogLevel::Info, format_args!("unreachable without a sink"));
	}

	#[test]
	fn recording_sink_captures_formatted_message() {
		let sink = RecordingSink { messages: StdMutex::new(Vec::new()) };
		sink.log(LogLevel::Warn, format_args!("frame {} lost", 3));
		assert_eq!(sink.messages.lock().unwrap()[0], "Warn: frame 3 lost");
	}
}
