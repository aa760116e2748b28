//! Fair spin lock granting access in arrival order.
//!
//! Each `lock` call draws a ticket and waits until that ticket is being
//! served, so a thread hammering the lock from the event loop cannot starve
//! the timer thread and vice versa. Waiters spin briefly and then yield.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

const SPINS_BEFORE_YIELD: u32 = 64;

pub struct TicketMutex<T> {
    next_ticket: AtomicUsize,
    now_serving: AtomicUsize,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by the ticket protocol.
unsafe impl<T: Send> Send for TicketMutex<T> {}
unsafe impl<T: Send> Sync for TicketMutex<T> {}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            next_ticket: AtomicUsize::new(0),
            now_serving: AtomicUsize::new(0),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> TicketMutexGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut spins = 0;

        while self.now_serving.load(Ordering::Acquire) != ticket {
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }

        TicketMutexGuard { mutex: self }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for TicketMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for TicketMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketMutex")
            .field("next_ticket", &self.next_ticket.load(Ordering::Relaxed))
            .field("now_serving", &self.now_serving.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Releases the lock to the next ticket holder on drop.
pub struct TicketMutexGuard<'a, T> {
    mutex: &'a TicketMutex<T>,
}

impl<T> Deref for TicketMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves this thread holds the current ticket.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for TicketMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves this thread holds the current ticket.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for TicketMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
    }
}
