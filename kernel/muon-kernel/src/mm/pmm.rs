//! Global physical memory manager.
//!
//! The bitmap covers the full 4 GiB physical space, one bit per 4 KiB
//! frame, and lives in the kernel image so it exists before any
//! allocator does. Initialization marks everything reserved, frees the
//! loader's available regions, then re-reserves the low 16 MiB (legacy
//! BIOS structures stay reachable) and the kernel image.

use core::sync::atomic::AtomicU32;

use muon_core::addr::PhysAddr;
use muon_core::sync::InitOnce;
use muon_mm::pmm::{FrameBitmap, PmmError};

use crate::boot::{BootInfo, MemoryRegionKind};
use crate::config::{KERNEL_BASE, LOW_MEMORY_RESERVED};
use crate::kinfo;

/// Bitmap words for 4 GiB of 4 KiB frames (2^20 frames, 32 per word).
const BITMAP_WORDS: usize = (1 << 20) / 32;

#[allow(clippy::declare_interior_mutable_const)]
const ZERO_WORD: AtomicU32 = AtomicU32::new(0);

static BITMAP_STORAGE: [AtomicU32; BITMAP_WORDS] = [ZERO_WORD; BITMAP_WORDS];

static PMM: InitOnce<FrameBitmap> = InitOnce::new();

unsafe extern "C" {
    /// Physical load start of the image, from the linker script.
    static __pre_start: u8;
    /// End of the kernel image (virtual, higher half).
    static __kernel_end: u8;
}

/// Builds the frame bitmap from the loader-provided memory map.
pub fn init(boot_info: &impl BootInfo) {
    // SAFETY: The storage is a static with no other owner; init runs
    // once.
    let bitmap = unsafe { FrameBitmap::new(&BITMAP_STORAGE, BITMAP_WORDS * 32) };

    // Everything starts reserved; the memory map frees what exists.
    bitmap.mark_region(0, u32::MAX, true);
    for region in boot_info.memory_map() {
        if region.kind == MemoryRegionKind::Available {
            bitmap.mark_region(region.start, region.size, false);
        }
    }

    // Keep legacy device and BIOS structures reachable.
    bitmap.mark_region(0, LOW_MEMORY_RESERVED, true);

    // The kernel image itself.
    // SAFETY: Linker-script symbols; only their addresses are used.
    let image_start = unsafe { core::ptr::addr_of!(__pre_start) as u32 };
    let image_end = unsafe { core::ptr::addr_of!(__kernel_end) as u32 } - KERNEL_BASE;
    bitmap.mark_region(image_start, image_end - image_start, true);

    kinfo!(
        "pmm: {} frames tracked, {} free",
        bitmap.total_frames(),
        bitmap.free_frames()
    );
    PMM.init(bitmap);
}

/// Runs `f` against the global frame bitmap.
pub fn with<R>(f: impl FnOnce(&FrameBitmap) -> R) -> R {
    f(PMM.get())
}

/// Allocates `count` contiguous frames and returns the physical address
/// of the first.
pub fn alloc_frames(count: usize) -> Result<PhysAddr, PmmError> {
    let frame = PMM.get().alloc_free(count)?;
    Ok(PhysAddr::new((frame as u32) * FrameBitmap::frame_size()))
}

/// Returns `count` contiguous frames starting at `pa`.
pub fn free_frames(pa: PhysAddr, count: usize) {
    let pmm = PMM.get();
    let first = (pa.as_u32() / FrameBitmap::frame_size()) as usize;
    for frame in first..first + count {
        pmm.free(frame);
    }
}
