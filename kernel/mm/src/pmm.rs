//! Bitmap-based physical frame allocator.
//!
//! One bit per frame in a flat word array; bit set = allocated. Single-frame
//! `alloc`/`free` are lock-free atomic bit operations; the contiguous
//! `alloc_free` path is serialized by a mutex so two callers never race on
//! the same run of frames. First-fit search fast-skips fully-allocated
//! words.

use core::sync::atomic::{AtomicU32, Ordering};

use muon_core::paging::PAGE_SIZE;
use muon_core::sync::Mutex;

/// Bits per bitmap word.
const BITS_PER_WORD: usize = 32;

/// Errors reported by the frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No run of free frames large enough exists.
    OutOfMemory,
    /// `alloc` hit a frame that is already allocated.
    AlreadyAllocated,
    /// Frame number beyond the tracked range.
    InvalidFrame,
}

/// The physical frame bitmap.
///
/// Bootstrap code owns the backing storage (placed after the kernel image)
/// and hands it over once, pre-marked for the kernel image and reserved
/// low-memory ranges.
pub struct FrameBitmap {
    words: &'static [AtomicU32],
    frames: usize,
    alloc_mutex: Mutex<()>,
}

impl FrameBitmap {
    /// The size of a physical frame in bytes (equal to the minimum page
    /// size).
    pub const fn frame_size() -> u32 {
        PAGE_SIZE
    }

    /// Wraps existing bitmap storage tracking `frames` frames.
    ///
    /// # Safety
    ///
    /// `words` must cover at least `frames` bits and must not be aliased by
    /// non-atomic writers.
    pub const unsafe fn new(words: &'static [AtomicU32], frames: usize) -> Self {
        Self {
            words,
            frames,
            alloc_mutex: Mutex::new(()),
        }
    }

    /// Total number of tracked frames.
    pub fn total_frames(&self) -> usize {
        self.frames
    }

    /// Marks `frame` allocated. Fails if it already was.
    pub fn alloc(&self, frame: usize) -> Result<(), PmmError> {
        if frame >= self.frames {
            return Err(PmmError::InvalidFrame);
        }
        let bit = 1u32 << (frame % BITS_PER_WORD);
        let old = self.words[frame / BITS_PER_WORD].fetch_or(bit, Ordering::AcqRel);
        if old & bit != 0 {
            return Err(PmmError::AlreadyAllocated);
        }
        Ok(())
    }

    /// Marks `frame` free. Idempotent.
    pub fn free(&self, frame: usize) {
        if frame >= self.frames {
            return;
        }
        let bit = 1u32 << (frame % BITS_PER_WORD);
        self.words[frame / BITS_PER_WORD].fetch_and(!bit, Ordering::AcqRel);
    }

    /// Returns whether `frame` is currently allocated.
    pub fn is_allocated(&self, frame: usize) -> bool {
        if frame >= self.frames {
            return true;
        }
        let bit = 1u32 << (frame % BITS_PER_WORD);
        self.words[frame / BITS_PER_WORD].load(Ordering::Acquire) & bit != 0
    }

    /// Finds the lowest frame number `f` such that frames `f..f + count`
    /// are all free.
    pub fn first_free(&self, count: usize) -> Result<usize, PmmError> {
        if count == 0 || count > self.frames {
            return Err(PmmError::OutOfMemory);
        }

        let mut frame = 0usize;
        'scan: while frame + count <= self.frames {
            let word_idx = frame / BITS_PER_WORD;
            let word = self.words[word_idx].load(Ordering::Acquire);

            // Fast-skip fully allocated words.
            if word == u32::MAX {
                frame = (word_idx + 1) * BITS_PER_WORD;
                continue;
            }

            if word & (1 << (frame % BITS_PER_WORD)) != 0 {
                frame += 1;
                continue;
            }

            // Candidate start: verify the rest of the run.
            for i in 1..count {
                let f = frame + i;
                let w = self.words[f / BITS_PER_WORD].load(Ordering::Acquire);
                if w & (1 << (f % BITS_PER_WORD)) != 0 {
                    frame = f + 1;
                    continue 'scan;
                }
            }
            return Ok(frame);
        }

        Err(PmmError::OutOfMemory)
    }

    /// Finds and allocates `count` contiguous frames, returning the first
    /// frame number.
    ///
    /// Serialized by the allocation mutex so concurrent callers never pick
    /// the same run.
    pub fn alloc_free(&self, count: usize) -> Result<usize, PmmError> {
        let _guard = self.alloc_mutex.lock();
        let frame = self.first_free(count)?;
        for i in 0..count {
            // Cannot fail: the run was observed free and the allocation
            // mutex is held.
            let _ = self.alloc(frame + i);
        }
        Ok(frame)
    }

    /// Number of free frames (full bitmap scan).
    pub fn free_frames(&self) -> usize {
        let mut free = 0usize;
        for (word_idx, word) in self.words.iter().enumerate() {
            let w = word.load(Ordering::Acquire);
            let base = word_idx * BITS_PER_WORD;
            let valid = BITS_PER_WORD.min(self.frames.saturating_sub(base));
            if valid == BITS_PER_WORD {
                free += w.count_zeros() as usize;
            } else {
                for bit in 0..valid {
                    if w & (1 << bit) == 0 {
                        free += 1;
                    }
                }
            }
        }
        free
    }

    /// Marks every frame overlapping `[start, start + size)` (byte
    /// addresses) as allocated or free. Used during bootstrap to apply the
    /// loader-provided memory map and reserve the kernel image.
    pub fn mark_region(&self, start: u32, size: u32, allocated: bool) {
        let framesz = Self::frame_size();
        let first = (start / framesz) as usize;
        let last = ((start as u64 + size as u64).div_ceil(framesz as u64)) as usize;
        for frame in first..last.min(self.frames) {
            if allocated {
                let bit = 1u32 << (frame % BITS_PER_WORD);
                self.words[frame / BITS_PER_WORD].fetch_or(bit, Ordering::AcqRel);
            } else {
                self.free(frame);
            }
        }
    }
}
