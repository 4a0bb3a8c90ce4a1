//! Concurrency-related primitives.

mod sleep;

pub use sleep::{KSleepLock, KSleepLockGuard};

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A lock which "spins" when contended.
///
/// This lock is meant for short critical sections only: nothing that can
/// suspend the calling thread (disk I/O, [`KSleepLock::acquire`]) may run
/// while it is held.
pub struct KSpinLock<T: ?Sized> {
    /// The lock state.
    ///
    /// `false` means the lock is not held, and `true` means the lock is held.
    locked: AtomicBool,
    /// The value stored in the lock.
    value: UnsafeCell<T>,
}

impl<T> KSpinLock<T> {
    /// Construct a [`KSpinLock`] wrapping the given value.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Destruct the lock and return the inner value.
    ///
    /// No locking is needed because consuming the value means it cannot be in
    /// use anywhere else.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Get an exclusive reference to the inner value from an exclusive
    /// reference to the lock.
    ///
    /// No locking is needed because the exclusive reference means the value
    /// cannot be in use anywhere else.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

impl<T: ?Sized> KSpinLock<T> {
    /// Lock the value, returning an RAII guard.
    ///
    /// If the lock is already held, this method yields the calling thread in
    /// a loop until the holder releases it.
    pub fn lock(&self) -> KSpinLockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            std::thread::yield_now();
        }
    }

    /// Attempt to lock the value without blocking.
    pub fn try_lock(&self) -> Option<KSpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| KSpinLockGuard {
                // SAFETY:
                // We've set `locked`, so we have exclusive access.
                value: unsafe { &mut *self.value.get() },
                locked: &self.locked,
            })
    }
}

impl<T: Default> Default for KSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// UnsafeCell implements `Send` as appropriate, so we only need `Sync`.

// SAFETY:
// Sharing the lock between threads corresponds to sending the value to
// whichever thread locks it.
unsafe impl<T: Send> Sync for KSpinLock<T> {}

/// An RAII guard for a [`KSpinLock`].
///
/// This value is constructed by [`KSpinLock::lock`] and related methods.
pub struct KSpinLockGuard<'a, T: ?Sized> {
    value: &'a mut T,
    locked: &'a AtomicBool,
}

impl<T: ?Sized> Deref for KSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.value
    }
}
impl<T: ?Sized> DerefMut for KSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}
impl<T: ?Sized> Drop for KSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.locked.store(false, Ordering::Release);
    }
}
