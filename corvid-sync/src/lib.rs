//! Synchronization primitives for the corvid kernel core.
//!
//! The core bootstraps below any heap or scheduler, so every lock here
//! is a spinlock: there is nowhere to park a waiter. [`Mutex`] is the
//! default used by the PMM and by each pagemap; [`TicketMutex`] trades
//! a little throughput for fairness and is reserved for locks that are
//! contended across many cores for long stretches (none currently are,
//! but the type exists so a hot lock can be swapped in without a new
//! abstraction).
#![cfg_attr(not(test), no_std)]

use core::{
	cell::UnsafeCell,
	ops::{Deref, DerefMut},
	sync::atomic::{
		AtomicBool, AtomicUsize,
		Ordering::{AcqRel, Acquire, Relaxed, Release},
	},
};

/// The number of spin iterations a [`TicketMutex`] waits before forcibly
/// advancing a ticket it suspects belongs to a core that died mid-critical-section.
const TICKET_MUTEX_TIMEOUT: usize = 1000;

/// Standardized lock interface implemented for all lock types in this crate.
pub trait Lock<T: Send + 'static> {
	/// The lock guard type used by the lock implementation.
	type Guard<'a>: Drop + Deref + DerefMut
	where
		Self: 'a;

	/// Acquires a lock, spinning until it's available.
	fn lock(&self) -> Self::Guard<'_>;
}

/// A simple unfair, greedy spinlock.
///
/// No ordering is guaranteed between waiters; a core that loses the race
/// just spins and retries. This is the lock used by the PMM bitmap and by
/// each pagemap, where critical sections are short and uncontended in the
/// common case.
pub struct Mutex<T: Send + 'static> {
	/// The guarded value.
	value:  UnsafeCell<T>,
	/// Whether or not the lock is currently held.
	locked: AtomicBool,
}

// SAFETY: Access to `value` is only ever granted through a held lock.
unsafe impl<T: Send + 'static> Sync for Mutex<T> {}

impl<T: Send + 'static> Mutex<T> {
	/// Creates a new spinlock mutex guarding `value`.
	pub const fn new(value: T) -> Self {
		Self {
			value:  UnsafeCell::new(value),
			locked: AtomicBool::new(false),
		}
	}
}

impl<T: Send + 'static> Lock<T> for Mutex<T> {
	type Guard<'a> = MutexGuard<'a, T>;

	fn lock(&self) -> Self::Guard<'_> {
		loop {
			if !self.locked.swap(true, Acquire) {
				return MutexGuard { lock: self };
			}

			core::hint::spin_loop();
		}
	}
}

/// A lock guard for [`Mutex`].
pub struct MutexGuard<'a, T: Send + 'static>
where
	Self: 'a,
{
	/// The lock this guard releases on drop.
	lock: &'a Mutex<T>,
}

impl<T: Send + 'static> Drop for MutexGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.locked.store(false, Release);
	}
}

impl<T: Send + 'static> Deref for MutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		// SAFETY: Holding the guard proves exclusive access to `value`.
		unsafe { &*self.lock.value.get() }
	}
}

impl<T: Send + 'static> DerefMut for MutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		// SAFETY: Holding the guard proves exclusive access to `value`.
		unsafe { &mut *self.lock.value.get() }
	}
}

/// A ticketed, fair mutex.
///
/// Waiters are served in arrival order. A stale ticket (one whose holder
/// never shows up, e.g. because it was interrupted during boot) is
/// forcibly skipped after [`TICKET_MUTEX_TIMEOUT`] spins rather than
/// wedging every other core forever.
pub struct TicketMutex<T: Send + 'static> {
	/// The guarded value.
	value:       UnsafeCell<T>,
	/// The ticket currently being served.
	now_serving: AtomicUsize,
	/// The next ticket to hand out.
	next_ticket: AtomicUsize,
	/// Whether or not the lock is currently held.
	locked:      AtomicBool,
}

// SAFETY: Access to `value` is only ever granted through a held lock.
unsafe impl<T: Send + 'static> Sync for TicketMutex<T> {}

impl<T: Send + 'static> TicketMutex<T> {
	/// Creates a new ticket mutex guarding `value`.
	pub const fn new(value: T) -> Self {
		Self {
			value:       UnsafeCell::new(value),
			now_serving: AtomicUsize::new(0),
			next_ticket: AtomicUsize::new(0),
			locked:      AtomicBool::new(false),
		}
	}
}

impl<T: Send + 'static> Lock<T> for TicketMutex<T> {
	type Guard<'a> = TicketMutexGuard<'a, T>;

	fn lock(&self) -> Self::Guard<'_> {
		'new_ticket: loop {
			let ticket = self.next_ticket.fetch_add(1, Relaxed);
			let mut old_now_serving = self.now_serving.load(Acquire);
			let mut timeout = TICKET_MUTEX_TIMEOUT;

			loop {
				let now_serving = self.now_serving.load(Acquire);

				// NOTE: wrapping subtraction is intentional; `ticket` and
				// `now_serving` both wrap at `usize::MAX` together.
				#[expect(clippy::cast_possible_wrap)]
				let position = ticket.wrapping_sub(now_serving) as isize;

				if position == 0 && !self.locked.swap(true, AcqRel) {
					return TicketMutexGuard { lock: self, ticket };
				}

				if position < 0 {
					// Our ticket was forcibly skipped; start over.
					continue 'new_ticket;
				}

				if now_serving != old_now_serving {
					old_now_serving = now_serving;
					timeout = TICKET_MUTEX_TIMEOUT;
				} else if !self.locked.load(Acquire) {
					timeout -= 1;

					if timeout == 0 {
						let _ = self.now_serving.compare_exchange(
							now_serving,
							now_serving.wrapping_add(1),
							AcqRel,
							Relaxed,
						);
					}
				}

				core::hint::spin_loop();
			}
		}
	}
}

/// A lock guard for [`TicketMutex`].
pub struct TicketMutexGuard<'a, T: Send + 'static>
where
	Self: 'a,
{
	/// The lock this guard releases on drop.
	lock:   &'a TicketMutex<T>,
	/// The ticket this guard was issued.
	ticket: usize,
}

impl<T: Send + 'static> Drop for TicketMutexGuard<'_, T> {
	fn drop(&mut self) {
		let _ = self.lock.now_serving.compare_exchange(
			self.ticket,
			self.ticket.wrapping_add(1),
			Release,
			Relaxed,
		);
		self.lock.locked.store(false, Release);
	}
}

impl<T: Send + 'static> Deref for TicketMutexGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		// SAFETY: Holding the guard proves exclusive access to `value`.
		unsafe { &*self.lock.value.get() }
	}
}

impl<T: Send + 'static> DerefMut for TicketMutexGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		// SAFETY: Holding the guard proves exclusive access to `value`.
		unsafe { &mut *self.lock.value.get() }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mutex_mutates_under_lock() {
		let m = Mutex::new(0_u32);
		*m.lock() += 1;
		*m.lock() += 1;
		assert_eq!(*m.lock(), 2);
	}

	#[test]
	fn ticket_mutex_mutates_under_lock() {
		let m = TicketMutex::new(Vec::<u32>::new());
		for i in 0..8 {
			m.lock().push(i);
		}
		assert_eq!(m.lock().len(), 8);
	}
}
