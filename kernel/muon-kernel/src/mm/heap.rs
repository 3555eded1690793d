//! Kernel heap glue.
//!
//! The allocator core lives in `muon-core`; this module gives it its
//! `morecore`: a break pointer confined to the heap window that grows by
//! whole frames, each taken from the PMM and mapped global + writable +
//! cached. The break never shrinks; exhaustion surfaces as the `sbrk`
//! sentinel and, from the allocator, as a null allocation.

use core::sync::atomic::{AtomicU32, Ordering};

use muon_core::addr::VirtAddr;
use muon_core::heap::KernelHeap;
use muon_core::paging::PAGE_SIZE;
use muon_mm::mapper::PageFlags;

use crate::config::{KHEAP_BASE, KHEAP_MAX_SIZE};
use crate::kinfo;
use crate::mm::{pmm, vmm};

#[global_allocator]
static HEAP: KernelHeap = KernelHeap::new();

/// The heap break: next unmapped address in the window. Grows only.
static BRK: AtomicU32 = AtomicU32::new(KHEAP_BASE);

/// The classic `sbrk` failure sentinel.
const SBRK_FAILED: u32 = u32::MAX;

/// Moves the break up by `incr` bytes (rounded to whole frames), mapping
/// fresh frames into the window. Returns the previous break, or the
/// sentinel on exhaustion.
fn sbrk(incr: u32) -> u32 {
    let prev = BRK.load(Ordering::Relaxed);
    if incr == 0 {
        return prev;
    }

    let frames = incr.div_ceil(PAGE_SIZE);
    let bytes = frames * PAGE_SIZE;
    if prev - KHEAP_BASE + bytes > KHEAP_MAX_SIZE {
        return SBRK_FAILED; // the window is pinned; the break cannot move
    }

    let vmm = vmm::vmm();
    let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL | PageFlags::CACHED;
    for i in 0..frames {
        let Ok(frame) = pmm::alloc_frames(1) else {
            // Partially grown is fine: the break only advances over
            // mapped frames.
            BRK.store(prev + i * PAGE_SIZE, Ordering::Relaxed);
            return if i == 0 { SBRK_FAILED } else { prev };
        };
        let va = VirtAddr::new(prev + i * PAGE_SIZE);
        // SAFETY: Fresh frame, unmapped heap-window address, current
        // (kernel) space.
        let mapped = unsafe { vmm.pgmap(vmm.current(), frame, va, 0, flags) };
        if mapped.is_err() {
            pmm::free_frames(frame, 1);
            BRK.store(prev + i * PAGE_SIZE, Ordering::Relaxed);
            return if i == 0 { SBRK_FAILED } else { prev };
        }
    }

    BRK.store(prev + bytes, Ordering::Relaxed);
    prev
}

/// The allocator's growth hook.
fn morecore(min_bytes: usize) -> Option<(*mut u8, usize)> {
    let incr = min_bytes as u32;
    let prev = sbrk(incr);
    if prev == SBRK_FAILED {
        return None;
    }
    let granted = BRK.load(Ordering::Relaxed) - prev;
    Some((prev as *mut u8, granted as usize))
}

/// Brings up the kernel heap: maps the first frame of the window, seeds
/// the allocator, and registers the growth hook.
///
/// # Safety
///
/// Must run once, after the PMM and VMM are initialized.
pub unsafe fn init() {
    let seed = sbrk(PAGE_SIZE);
    assert_ne!(seed, SBRK_FAILED, "heap: cannot map the initial frame");
    // SAFETY: The frame was just mapped writable and is exclusively the
    // heap's.
    unsafe { HEAP.seed(seed as *mut u8, PAGE_SIZE as usize) };
    HEAP.set_morecore(morecore);
    kinfo!(
        "heap: window {:#010x}..{:#010x}",
        KHEAP_BASE,
        KHEAP_BASE + KHEAP_MAX_SIZE
    );
}

/// Bytes currently handed out by the allocator.
pub fn used_bytes() -> usize {
    HEAP.used_bytes()
}
