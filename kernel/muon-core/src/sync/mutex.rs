//! Yield-on-contention mutual exclusion lock.
//!
//! The kernel's general-purpose lock: a single atomic flag that, when
//! contended, yields the current task to the scheduler instead of spinning.
//! Flag transitions are bracketed by the scheduler's yield-block counter so
//! a lock operation is never torn by a preemptive switch.
//!
//! The scheduler is a higher layer, so its entry points are registered at
//! boot through [`register_scheduler_hooks`]. Before registration (early
//! boot, host tests) the yield hook degrades to a spin hint and the block
//! hooks are no-ops.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

// ---------------------------------------------------------------------------
// Registered scheduler hooks
// ---------------------------------------------------------------------------

fn nop_yield() {
    core::hint::spin_loop();
}

fn nop_gate() {}

static YIELD_FN: AtomicPtr<()> = AtomicPtr::new(nop_yield as fn() as *mut ());
static BLOCK_FN: AtomicPtr<()> = AtomicPtr::new(nop_gate as fn() as *mut ());
static UNBLOCK_FN: AtomicPtr<()> = AtomicPtr::new(nop_gate as fn() as *mut ());

/// Registers the scheduler entry points used by contended mutexes.
///
/// `yield_fn` is called while waiting for a held lock (cooperative yield
/// without an IRQ), `block_fn`/`unblock_fn` bracket flag transitions with
/// the scheduler's nesting-safe yield-block counter.
pub fn register_scheduler_hooks(yield_fn: fn(), block_fn: fn(), unblock_fn: fn()) {
    YIELD_FN.store(yield_fn as *mut (), Ordering::Release);
    BLOCK_FN.store(block_fn as *mut (), Ordering::Release);
    UNBLOCK_FN.store(unblock_fn as *mut (), Ordering::Release);
}

#[inline]
fn call_hook(slot: &AtomicPtr<()>) {
    let ptr = slot.load(Ordering::Acquire);
    // SAFETY: The pointer was stored via `register_scheduler_hooks` which
    // takes a valid `fn()`, or it is one of the defaults above.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// A yield-on-contention mutual exclusion lock.
///
/// Used pervasively by the memory and process layers (frame allocation,
/// the page-trap table, deferred-free staging, per-process task and file
/// descriptor lists). Const-constructable for `static` items.
pub struct Mutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The Mutex ensures exclusive access to `T` via atomic operations.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new unlocked `Mutex` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, yielding to other tasks while it is held.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            call_hook(&BLOCK_FN);
            let acquired = self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok();
            call_hook(&UNBLOCK_FN);

            if acquired {
                return MutexGuard { mutex: self };
            }

            // Lock is held: hand the CPU to whichever ready task has been
            // waiting longest and retry when we're switched back in.
            call_hook(&YIELD_FN);
        }
    }

    /// Attempts to acquire the lock without yielding.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        call_hook(&BLOCK_FN);
        let acquired = self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        call_hook(&UNBLOCK_FN);

        if acquired { Some(MutexGuard { mutex: self }) } else { None }
    }

    /// Non-destructive check of the lock flag.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// RAII guard that releases the [`Mutex`] when dropped.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        call_hook(&BLOCK_FN);
        self.mutex.locked.store(false, Ordering::Release);
        call_hook(&UNBLOCK_FN);
    }
}
