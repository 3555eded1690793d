//! Boot-time one-shot initialization cell.
//!
//! [`InitOnce`] holds a value that is written exactly once during boot and
//! read freely afterwards without taking a lock. Used for the global VMM
//! and other process-wide singletons whose construction needs runtime data
//! (boot info, CR3) but whose access pattern is read-mostly.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

/// A cell initialized exactly once.
pub struct InitOnce<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: The atomic state machine guarantees the value is fully written
// before any reader can observe READY.
unsafe impl<T: Send + Sync> Send for InitOnce<T> {}
unsafe impl<T: Send + Sync> Sync for InitOnce<T> {}

impl<T> InitOnce<T> {
    /// Creates an empty cell.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Stores the value.
    ///
    /// # Panics
    ///
    /// Panics if the cell was already initialized (or is racing another
    /// initializer).
    pub fn init(&self, value: T) {
        self.state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
            .expect("InitOnce initialized twice");
        // SAFETY: The INITIALIZING state excludes all other writers and
        // readers.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
    }

    /// Returns the value, or `None` before initialization.
    pub fn try_get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY implies the value was fully written.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Returns the value.
    ///
    /// # Panics
    ///
    /// Panics before initialization.
    pub fn get(&self) -> &T {
        self.try_get().expect("InitOnce read before init")
    }

    /// Whether the value has been stored.
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }
}

impl<T> Default for InitOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_get() {
        let cell = InitOnce::new();
        assert!(cell.try_get().is_none());
        assert!(!cell.is_ready());
        cell.init(42u32);
        assert_eq!(cell.get(), &42);
        assert!(cell.is_ready());
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn double_init_panics() {
        let cell = InitOnce::new();
        cell.init(1u32);
        cell.init(2u32);
    }
}
