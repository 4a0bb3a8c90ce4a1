//! A blocking exclusive-ownership lock.

use core::{cell::UnsafeCell, marker::PhantomData, ops::Deref};
use std::thread::{self, Thread, ThreadId};

use crate::sync::KSpinLock;

/// A lock which suspends the calling thread when contended.
///
/// Unlike [`KSpinLock`], this lock may be held across long operations such
/// as disk I/O: waiters park instead of spinning and are woken when the
/// holder releases. The holder is tracked per thread, so [`Self::holding`]
/// can answer whether the *calling* thread currently owns the lock.
pub struct KSleepLock<T: ?Sized> {
    /// Who holds the lock and who is waiting for it.
    state: KSpinLock<SleepState>,
    /// The value guarded by the lock.
    value: UnsafeCell<T>,
}

/// Book-keeping for a [`KSleepLock`], guarded by the state spin lock.
struct SleepState {
    /// The thread currently holding the lock, if any.
    holder: Option<ThreadId>,
    /// Threads parked waiting for the lock to be released.
    waiters: Vec<Thread>,
}

impl<T> KSleepLock<T> {
    /// Construct a [`KSleepLock`] wrapping the given value.
    pub const fn new(value: T) -> Self {
        Self {
            state: KSpinLock::new(SleepState {
                holder: None,
                waiters: Vec::new(),
            }),
            value: UnsafeCell::new(value),
        }
    }

    /// Destruct the lock and return the inner value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Get a raw pointer to the guarded value.
    ///
    /// The pointer is safe to produce but unsafe to use: writes through it
    /// are only sound while the caller can prove no thread holds or can
    /// acquire the lock (for example, a cache buffer whose reference count
    /// is zero while its bucket lock is held).
    pub const fn data_ptr(&self) -> *mut T {
        self.value.get()
    }
}

impl<T: ?Sized> KSleepLock<T> {
    /// Acquire the lock, suspending the calling thread until it is free.
    pub fn acquire(&self) -> KSleepLockGuard<'_, T> {
        loop {
            {
                let mut state = self.state.lock();
                if state.holder.is_none() {
                    state.holder = Some(thread::current().id());
                    return KSleepLockGuard {
                        lock: self,
                        _not_send: PhantomData,
                    };
                }
                state.waiters.push(thread::current());
            }
            // A wake-up between registering and parking makes `park` return
            // immediately, so the release cannot be missed. Spurious wakes
            // just go around the loop again.
            thread::park();
        }
    }

    /// Whether the *calling* thread currently holds the lock.
    pub fn holding(&self) -> bool {
        self.state.lock().holder == Some(thread::current().id())
    }
}

// SAFETY:
// Sharing the lock between threads corresponds to sending the value to
// whichever thread acquires it.
unsafe impl<T: Send> Sync for KSleepLock<T> {}

/// An RAII guard for a [`KSleepLock`], built by [`KSleepLock::acquire`].
///
/// Dropping the guard releases the lock and wakes every waiter.
pub struct KSleepLockGuard<'a, T: ?Sized> {
    lock: &'a KSleepLock<T>,
    /// Ownership is tied to the acquiring thread, so the guard must not move
    /// to another one.
    _not_send: PhantomData<*mut ()>,
}

impl<T: ?Sized> Deref for KSleepLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // SAFETY:
        // The guard proves the calling thread holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}
impl<T: ?Sized> core::ops::DerefMut for KSleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY:
        // The guard proves the calling thread holds the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}
impl<T: ?Sized> Drop for KSleepLockGuard<'_, T> {
    fn drop(&mut self) {
        let waiters = {
            let mut state = self.lock.state.lock();
            state.holder = None;
            core::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            waiter.unpark();
        }
    }
}
