//! Kernel heap allocator core.
//!
//! First-fit free-list allocator implementing `GlobalAlloc`, backed by a
//! Unix-style `morecore` growth hook. The free list is sorted by address so
//! freed blocks coalesce with their neighbours on insert. The break only
//! ever grows: `morecore` appends mapped memory at the top of the heap
//! window and the new region joins the free list.
//!
//! The kernel glue registers a `morecore` that maps frames one at a time
//! into the heap window; host tests register one backed by a plain buffer.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use crate::sync::SpinLock;

/// Minimum block size; must fit a `Hole` header.
const MIN_BLOCK_SIZE: usize = 16;

/// All blocks are aligned to 16 bytes.
const BLOCK_ALIGN: usize = 16;

/// Growth hook: given a minimum byte count, extends the heap and returns
/// the newly usable region, or `None` when the break cannot move (the
/// `sbrk` failure case).
pub type MoreCoreFn = fn(usize) -> Option<(*mut u8, usize)>;

/// Free block header, stored in-place at the start of each free block.
#[repr(C)]
struct Hole {
    /// Total size of this block, header included.
    size: usize,
    /// Next free block in address order, or null.
    next: *mut Hole,
}

struct HeapInner {
    /// Head of the address-sorted free list.
    head: *mut Hole,
    /// Bytes handed out and not yet freed.
    used: usize,
    /// Registered growth hook.
    morecore: Option<MoreCoreFn>,
}

// SAFETY: The raw pointers are only dereferenced under the SpinLock.
unsafe impl Send for HeapInner {}

/// The kernel heap allocator.
///
/// Suitable as `#[global_allocator]`; const-constructable, initialized once
/// with a seed region and grown on demand through the registered hook.
pub struct KernelHeap {
    inner: SpinLock<HeapInner>,
}

// SAFETY: All access goes through the SpinLock.
unsafe impl Sync for KernelHeap {}

impl KernelHeap {
    /// Creates an empty, ungrowable heap. Call [`seed`](Self::seed) and
    /// [`set_morecore`](Self::set_morecore) before use.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(HeapInner {
                head: ptr::null_mut(),
                used: 0,
                morecore: None,
            }),
        }
    }

    /// Seeds the heap with its initial region.
    ///
    /// # Safety
    ///
    /// `start` must point to `size` bytes of mapped, exclusively-owned
    /// memory aligned to [`BLOCK_ALIGN`], and may only be called once.
    pub unsafe fn seed(&self, start: *mut u8, size: usize) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.head.is_null(), "heap already seeded");
        debug_assert!(size >= MIN_BLOCK_SIZE);
        // SAFETY: Per contract, the region is valid and unaliased.
        unsafe { insert_free(&mut inner, start as usize, size) };
    }

    /// Registers the growth hook consulted when allocation fails.
    pub fn set_morecore(&self, f: MoreCoreFn) {
        self.inner.lock().morecore = Some(f);
    }

    /// Bytes currently allocated.
    pub fn used_bytes(&self) -> usize {
        self.inner.lock().used
    }
}

/// Inserts a block into the free list in address order, coalescing with
/// adjacent blocks on both sides.
///
/// # Safety
///
/// The region must be valid, unaliased, and not already on the list.
unsafe fn insert_free(inner: &mut HeapInner, addr: usize, size: usize) {
    debug_assert!(size >= MIN_BLOCK_SIZE);
    debug_assert!(addr % BLOCK_ALIGN == 0);

    let mut prev: *mut Hole = ptr::null_mut();
    let mut cur = inner.head;
    while !cur.is_null() && (cur as usize) < addr {
        prev = cur;
        // SAFETY: `cur` is a live free-list node.
        cur = unsafe { (*cur).next };
    }

    // Merge into the predecessor when the regions touch.
    if !prev.is_null() {
        // SAFETY: `prev` is a live free-list node.
        let prev_end = prev as usize + unsafe { (*prev).size };
        if prev_end == addr {
            unsafe {
                (*prev).size += size;
                let merged_end = prev as usize + (*prev).size;
                if !cur.is_null() && merged_end == cur as usize {
                    (*prev).size += (*cur).size;
                    (*prev).next = (*cur).next;
                }
            }
            return;
        }
    }

    let block = addr as *mut Hole;
    // SAFETY: The region is unaliased and large enough for a header.
    unsafe {
        if !cur.is_null() && addr + size == cur as usize {
            // Merge the successor into the new block.
            (*block).size = size + (*cur).size;
            (*block).next = (*cur).next;
        } else {
            (*block).size = size;
            (*block).next = cur;
        }
        if prev.is_null() {
            inner.head = block;
        } else {
            (*prev).next = block;
        }
    }
}

/// First-fit search. Unlinks and returns `(alloc_start, size)`; splits off
/// front padding and tail remainder back onto the free list.
fn take_first_fit(inner: &mut HeapInner, size: usize, align: usize) -> Option<usize> {
    let mut prev: *mut Hole = ptr::null_mut();
    let mut cur = inner.head;

    while !cur.is_null() {
        let block_addr = cur as usize;
        // SAFETY: `cur` is a live free-list node.
        let block_size = unsafe { (*cur).size };

        let alloc_start = align_up(block_addr, align);
        let alloc_end = alloc_start.checked_add(size)?;

        if alloc_end <= block_addr + block_size {
            // SAFETY: `cur` is a live free-list node; unlink it.
            let next = unsafe { (*cur).next };
            if prev.is_null() {
                inner.head = next;
            } else {
                unsafe { (*prev).next = next };
            }

            // Return front padding to the list when it can hold a header.
            let padding = alloc_start - block_addr;
            if padding >= MIN_BLOCK_SIZE {
                // SAFETY: Sub-range of the block we just unlinked.
                unsafe { insert_free(inner, block_addr, padding) };
            }

            // Split off the tail remainder.
            let tail = align_up(alloc_end, BLOCK_ALIGN);
            if block_addr + block_size >= tail + MIN_BLOCK_SIZE {
                // SAFETY: Sub-range of the block we just unlinked.
                unsafe { insert_free(inner, tail, block_addr + block_size - tail) };
            }

            return Some(alloc_start);
        }

        prev = cur;
        cur = unsafe { (*cur).next };
    }

    None
}

// SAFETY: `alloc` returns unaliased, suitably aligned blocks; `dealloc`
// returns them to the free list. Mutual exclusion via SpinLock.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = block_size_for(layout);
        let align = layout.align().max(BLOCK_ALIGN);

        let mut inner = self.inner.lock();
        if let Some(addr) = take_first_fit(&mut inner, size, align) {
            inner.used += size;
            return addr as *mut u8;
        }

        // Out of space: push the break. The hook may take the PMM lock, so
        // release ours first.
        let Some(morecore) = inner.morecore else {
            return ptr::null_mut();
        };
        drop(inner);

        let Some((region, region_size)) = morecore(size + align) else {
            return ptr::null_mut(); // sbrk failed: surface as a null allocation
        };

        let mut inner = self.inner.lock();
        // SAFETY: morecore returns freshly mapped, unaliased memory.
        unsafe { insert_free(&mut inner, region as usize, region_size) };
        match take_first_fit(&mut inner, size, align) {
            Some(addr) => {
                inner.used += size;
                addr as *mut u8
            }
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let size = block_size_for(layout);
        let mut inner = self.inner.lock();
        inner.used -= size;
        // SAFETY: The block was produced by `alloc` with the same layout.
        unsafe { insert_free(&mut inner, ptr as usize, size) };
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Rounds a layout to the block size actually reserved for it, so that
/// `alloc` and `dealloc` agree.
#[inline]
fn block_size_for(layout: Layout) -> usize {
    align_up(layout.size().max(MIN_BLOCK_SIZE), BLOCK_ALIGN)
}

#[inline]
fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_heap(size: usize) -> (KernelHeap, *mut u8, Layout) {
        let layout = Layout::from_size_align(size, BLOCK_ALIGN).unwrap();
        // SAFETY: Valid non-zero layout.
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!buf.is_null());
        let heap = KernelHeap::new();
        // SAFETY: Freshly allocated, exclusively owned region.
        unsafe { heap.seed(buf, size) };
        (heap, buf, layout)
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let (heap, buf, buf_layout) = test_heap(4096);
        let layout = Layout::from_size_align(64, 16).unwrap();

        let p = unsafe { heap.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(heap.used_bytes(), 64);
        unsafe { heap.dealloc(p, layout) };
        assert_eq!(heap.used_bytes(), 0);

        unsafe { std::alloc::dealloc(buf, buf_layout) };
    }

    #[test]
    fn allocations_do_not_overlap() {
        let (heap, buf, buf_layout) = test_heap(4096);
        let layout = Layout::from_size_align(128, 16).unwrap();

        let a = unsafe { heap.alloc(layout) } as usize;
        let b = unsafe { heap.alloc(layout) } as usize;
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert!(a.abs_diff(b) >= 128);

        unsafe { std::alloc::dealloc(buf, buf_layout) };
    }

    #[test]
    fn respects_alignment() {
        let (heap, buf, buf_layout) = test_heap(8192);
        let layout = Layout::from_size_align(32, 256).unwrap();

        let p = unsafe { heap.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 256, 0);

        unsafe { std::alloc::dealloc(buf, buf_layout) };
    }

    #[test]
    fn coalescing_allows_reuse() {
        let (heap, buf, buf_layout) = test_heap(1024);
        let small = Layout::from_size_align(256, 16).unwrap();

        let a = unsafe { heap.alloc(small) };
        let b = unsafe { heap.alloc(small) };
        let c = unsafe { heap.alloc(small) };
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        unsafe {
            heap.dealloc(a, small);
            heap.dealloc(b, small);
            heap.dealloc(c, small);
        }

        // After coalescing, one big allocation must fit again.
        let big = Layout::from_size_align(768, 16).unwrap();
        let p = unsafe { heap.alloc(big) };
        assert!(!p.is_null());

        unsafe { std::alloc::dealloc(buf, buf_layout) };
    }

    #[test]
    fn exhaustion_returns_null_without_morecore() {
        let (heap, buf, buf_layout) = test_heap(256);
        let layout = Layout::from_size_align(4096, 16).unwrap();
        let p = unsafe { heap.alloc(layout) };
        assert!(p.is_null());
        unsafe { std::alloc::dealloc(buf, buf_layout) };
    }

    #[test]
    fn morecore_extends_heap() {
        // 64 KiB static buffer stands in for the heap window; the morecore
        // hook hands out 4 KiB "frames" from it, like the kernel glue does.
        use std::sync::atomic::{AtomicUsize, Ordering};
        static WINDOW: AtomicUsize = AtomicUsize::new(0);
        static BRK: AtomicUsize = AtomicUsize::new(0);

        fn grow(min: usize) -> Option<(*mut u8, usize)> {
            let frames = min.div_ceil(4096);
            let brk = BRK.fetch_add(frames * 4096, Ordering::Relaxed);
            if brk + frames * 4096 > 64 * 1024 {
                return None; // break pinned at the top of the window
            }
            let base = WINDOW.load(Ordering::Relaxed);
            Some(((base + brk) as *mut u8, frames * 4096))
        }

        let layout = Layout::from_size_align(64 * 1024, BLOCK_ALIGN).unwrap();
        let buf = unsafe { std::alloc::alloc_zeroed(layout) };
        WINDOW.store(buf as usize, Ordering::Relaxed);

        let heap = KernelHeap::new();
        // Seed with the first frame, grow for the rest.
        BRK.store(4096, Ordering::Relaxed);
        unsafe { heap.seed(buf, 4096) };
        heap.set_morecore(grow);

        let big = Layout::from_size_align(16 * 1024, 16).unwrap();
        let p = unsafe { heap.alloc(big) };
        assert!(!p.is_null(), "allocation should trigger morecore growth");

        // Exhausting the window surfaces as a null allocation.
        let huge = Layout::from_size_align(128 * 1024, 16).unwrap();
        assert!(unsafe { heap.alloc(huge) }.is_null());

        unsafe { std::alloc::dealloc(buf, layout) };
    }
}
