//! The page-table seam between the generic VMM engine and an architecture.
//!
//! [`PageTables`] is the contract an architecture implements once: single
//! page edits, attribute queries, address-space lifetime, and frame
//! allocation. The x86 port implements it with recursive self-mapping
//! (editing a non-current space by transiently mapping its directory into
//! the current one); the test suite implements it with a simulated
//! two-level table so the engine's algorithms run on the host.

use muon_core::addr::{PhysAddr, VirtAddr};

bitflags::bitflags! {
    /// Per-mapping attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Mapping is present.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Global page (TLB entry survives address-space switches).
        const GLOBAL        = 1 << 3;
        /// Page contents may be cached.
        const CACHED        = 1 << 4;
        /// Write-through instead of write-back caching.
        const WRITE_THROUGH = 1 << 5;
        /// A page trap is armed on this page; the next faulting access is
        /// handled by the kernel (copy-on-write).
        const TRAPPED       = 1 << 6;
    }
}

/// An address space, identified by the physical address of its top-level
/// page directory frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AddrSpace(pub PhysAddr);

impl AddrSpace {
    /// The directory frame's physical address.
    #[inline]
    pub const fn root(self) -> PhysAddr {
        self.0
    }
}

/// Errors from the virtual memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// The frame allocator is exhausted.
    OutOfMemory,
    /// A transient mapping of a foreign directory or table failed; the
    /// operation was rolled back.
    CannotMapDirectory,
    /// Page size index outside the supported list.
    InvalidPageSizeIndex,
    /// Attempt to map or unmap inside the recursive-mapping window.
    RecursiveSlotViolation,
    /// The queried virtual address has no mapping.
    Unmapped,
}

/// Architecture page-table operations consumed by the [`Vmm`](crate::Vmm)
/// engine.
///
/// All mutating operations accept a *target* space which need not be the
/// current one; implementations edit foreign spaces without switching to
/// them. TLB invalidation is the implementation's responsibility and must
/// happen exactly when the target is the current space or the old or new
/// mapping is global.
///
/// # Safety
///
/// Implementations must correctly maintain the hardware (or simulated)
/// page-table structures, keep every space's recursive slot intact, and
/// propagate kernel-region directory entries to all live spaces.
pub unsafe trait PageTables {
    /// Supported page sizes in bytes, ascending. Index into this slice is
    /// the "page size index" used everywhere else.
    fn page_sizes(&self) -> &'static [u32];

    /// The currently active address space.
    fn current(&self) -> AddrSpace;

    /// Switches to `space`.
    ///
    /// # Safety
    ///
    /// `space` must be a live, fully constructed address space.
    unsafe fn activate(&self, space: AddrSpace);

    /// Allocates `count` contiguous physical frames.
    fn alloc_frames(&self, count: usize) -> Result<PhysAddr, VmmError>;

    /// Returns `count` contiguous frames starting at `pa` to the frame
    /// allocator.
    ///
    /// # Safety
    ///
    /// The frames must have been allocated by [`alloc_frames`](Self::alloc_frames)
    /// and must no longer be referenced by any mapping.
    unsafe fn free_frames(&self, pa: PhysAddr, count: usize);

    /// Installs a single mapping of the given size.
    ///
    /// Replacing a larger page with a smaller one re-maps the remainder of
    /// the original page as small pages preserving frames and flags.
    /// Kernel-region directory edits propagate to all live spaces. Never
    /// partially succeeds.
    ///
    /// # Safety
    ///
    /// `pa` must reference memory the caller may map; aliasing rules are
    /// the caller's responsibility.
    unsafe fn map_page(
        &self,
        space: AddrSpace,
        pa: PhysAddr,
        va: VirtAddr,
        size_idx: usize,
        flags: PageFlags,
    ) -> Result<(), VmmError>;

    /// Removes a single mapping of the given size, freeing the backing
    /// page-table frame if the table becomes empty.
    ///
    /// # Safety
    ///
    /// The caller must have resolved any page trap armed on the mapping.
    unsafe fn unmap_page(&self, space: AddrSpace, va: VirtAddr, size_idx: usize)
    -> Result<(), VmmError>;

    /// Page size index of the mapping containing `va`, or `None` if
    /// unmapped.
    fn page_size_index(&self, space: AddrSpace, va: VirtAddr) -> Option<usize>;

    /// Lowest mapped virtual address in `[from, to)`, aligned to its page,
    /// or `None` if the range is entirely unmapped. Lets the engine walk
    /// sparse address spaces without probing every page.
    fn next_mapped(&self, space: AddrSpace, from: VirtAddr, to: VirtAddr) -> Option<VirtAddr>;

    /// Physical address backing `va`, or `None` if unmapped.
    fn frame_addr(&self, space: AddrSpace, va: VirtAddr) -> Option<PhysAddr>;

    /// Redirects the mapping containing `va` to a new physical address.
    /// No-op if unmapped.
    ///
    /// # Safety
    ///
    /// `pa` must reference memory valid for the mapping's current flags.
    unsafe fn set_frame_addr(&self, space: AddrSpace, va: VirtAddr, pa: PhysAddr);

    /// Flags of the mapping containing `va`; empty if unmapped.
    fn flags(&self, space: AddrSpace, va: VirtAddr) -> PageFlags;

    /// Replaces the flags of the mapping containing `va`. No-op if
    /// unmapped.
    ///
    /// # Safety
    ///
    /// Clearing `PRESENT` or `WRITABLE` on kernel mappings that are in use
    /// is the caller's responsibility.
    unsafe fn set_flags(&self, space: AddrSpace, va: VirtAddr, flags: PageFlags);

    /// Whether the mapping containing `va` has been written to.
    fn dirty(&self, space: AddrSpace, va: VirtAddr) -> bool;

    /// Sets or clears the dirty bit of the mapping containing `va`.
    ///
    /// # Safety
    ///
    /// Only meaningful on present mappings.
    unsafe fn set_dirty(&self, space: AddrSpace, va: VirtAddr, dirty: bool);

    /// Allocates a fresh address space: a new directory frame with the
    /// kernel-region entries of `template` copied verbatim and the
    /// recursive slot pointing at the new directory itself.
    ///
    /// # Safety
    ///
    /// `template` must be a live space whose kernel region is valid.
    unsafe fn new_space(&self, template: AddrSpace) -> Result<AddrSpace, VmmError>;

    /// Tears down `space`: frees user-region page-table frames and the
    /// directory frame. Mapped leaf frames are not freed; they belong to
    /// their owners.
    ///
    /// # Safety
    ///
    /// `space` must not be the current space of any CPU and must not be
    /// used again.
    unsafe fn destroy_space(&self, space: AddrSpace);

    /// Copies `len` bytes between two virtual ranges of the *current*
    /// space. This is the engine's single byte-copy primitive (used only
    /// by copy-on-write resolution through a private window).
    ///
    /// # Safety
    ///
    /// Both ranges must be mapped, non-overlapping, and writable at `dst`.
    unsafe fn copy_bytes(&self, dst: VirtAddr, src: VirtAddr, len: usize);
}
