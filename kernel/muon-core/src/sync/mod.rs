//! Synchronization primitives.
//!
//! [`SpinLock`] is a plain TTAS spin lock for short critical sections that
//! must work before the scheduler exists (logging, early boot). [`Mutex`] is
//! the kernel's general-purpose lock: it yields to other tasks while
//! contended, once the scheduler has registered its hooks.

mod lazy;
mod mutex;
mod spinlock;

pub use lazy::InitOnce;
pub use mutex::{Mutex, MutexGuard, register_scheduler_hooks};
pub use spinlock::{SpinLock, SpinLockGuard};
