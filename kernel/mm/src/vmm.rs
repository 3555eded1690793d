//! Generic virtual memory engine.
//!
//! Everything above the per-page seam: multi-size region mapping and
//! unmapping, free-range search, address-space cloning with copy-on-write,
//! page-fault triage, and deferred address-space reclamation. The engine is
//! generic over [`PageTables`] so the same algorithms run against the x86
//! recursive-mapping implementation in the kernel and against a simulated
//! backend in the tests.
//!
//! Lock order: PMM allocation mutex → traps mutex → stage mutex. No engine
//! path holds two of them at once; copy-on-write resolution copies trap
//! records out under the traps mutex and releases it before allocating
//! frames or editing mappings.

use alloc::vec::Vec;

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::sync::Mutex;

use crate::mapper::{AddrSpace, PageFlags, PageTables, VmmError};
use crate::trap::{TrapArena, TrapId};

/// A copied-out view of one CoW relation on a page: the record ids of both
/// sides and the location of the partner page.
struct CowPartner {
    own: TrapId,
    pair: TrapId,
    space: AddrSpace,
    page: VirtAddr,
}

/// The virtual memory manager.
pub struct Vmm<T: PageTables> {
    tables: T,
    kernel_space: AddrSpace,
    kernel_start: VirtAddr,
    /// Virtual range searched for transient copy windows (kernel region).
    scratch: (VirtAddr, VirtAddr),
    traps: Mutex<TrapArena>,
    stage: Mutex<Vec<AddrSpace>>,
}

impl<T: PageTables> Vmm<T> {
    /// Creates the engine over a page-table implementation.
    ///
    /// `kernel_start` is the user/kernel boundary; `scratch` is the virtual
    /// range used for private copy windows during CoW resolution.
    pub const fn new(
        tables: T,
        kernel_space: AddrSpace,
        kernel_start: VirtAddr,
        scratch: (VirtAddr, VirtAddr),
    ) -> Self {
        Self {
            tables,
            kernel_space,
            kernel_start,
            scratch,
            traps: Mutex::new(TrapArena::new()),
            stage: Mutex::new(Vec::new()),
        }
    }

    /// The underlying page-table implementation.
    pub fn tables(&self) -> &T {
        &self.tables
    }

    /// The kernel's address space.
    pub fn kernel_space(&self) -> AddrSpace {
        self.kernel_space
    }

    /// The currently active address space.
    pub fn current(&self) -> AddrSpace {
        self.tables.current()
    }

    /// Switches to `space` if it is not already active.
    ///
    /// # Safety
    ///
    /// `space` must be live and fully constructed.
    pub unsafe fn switch(&self, space: AddrSpace) {
        if self.tables.current() != space {
            unsafe { self.tables.activate(space) };
        }
    }

    /// Number of supported page sizes.
    pub fn page_size_count(&self) -> usize {
        self.tables.page_sizes().len()
    }

    /// Page size in bytes for a size index.
    pub fn page_size(&self, idx: usize) -> Option<u32> {
        self.tables.page_sizes().get(idx).copied()
    }

    fn min_page(&self) -> u32 {
        self.tables.page_sizes()[0]
    }

    // ── Single-page operations ──────────────────────────────────────────

    /// Installs a single mapping.
    ///
    /// # Safety
    ///
    /// See [`PageTables::map_page`].
    pub unsafe fn pgmap(
        &self,
        space: AddrSpace,
        pa: PhysAddr,
        va: VirtAddr,
        size_idx: usize,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        if size_idx >= self.page_size_count() {
            return Err(VmmError::InvalidPageSizeIndex);
        }
        unsafe { self.tables.map_page(space, pa, va, size_idx, flags) }
    }

    /// Removes a single mapping, resolving any page traps armed inside it
    /// first so no external observer is left with a dangling reference.
    ///
    /// # Safety
    ///
    /// See [`PageTables::unmap_page`].
    pub unsafe fn pgunmap(
        &self,
        space: AddrSpace,
        va: VirtAddr,
        size_idx: usize,
    ) -> Result<(), VmmError> {
        let sizes = self.tables.page_sizes();
        if size_idx >= sizes.len() {
            return Err(VmmError::InvalidPageSizeIndex);
        }
        let pgsz = sizes[size_idx];
        let va = va.align_down(pgsz);

        match self.tables.page_size_index(space, va) {
            None => {}
            Some(actual) if sizes[actual] >= pgsz => {
                self.resolve_traps_on(space, va.align_down(sizes[actual]));
            }
            Some(_) => {
                // Removing a large slot backed by smaller pages: resolve
                // traps page by page before the whole slot goes away.
                let mut sub = va.as_u32() as u64;
                let end = sub + pgsz as u64;
                while sub < end {
                    let sva = VirtAddr::new(sub as u32);
                    match self.tables.page_size_index(space, sva) {
                        Some(i) => {
                            self.resolve_traps_on(space, sva);
                            sub += sizes[i] as u64;
                        }
                        None => sub += sizes[0] as u64,
                    }
                }
            }
        }

        unsafe { self.tables.unmap_page(space, va, size_idx) }
    }

    /// Resolves every CoW trap touching `(space, page)` by giving the
    /// partner side its own copy of the data.
    fn resolve_traps_on(&self, space: AddrSpace, page: VirtAddr) {
        loop {
            let partner = {
                let traps = self.traps.lock();
                let Some(id) = traps.find_cow(space, page) else {
                    return;
                };
                let t = traps.get(id).expect("find_cow returned a live record");
                (id, t.pair, traps.get(t.pair))
            };

            match partner {
                (_, _, Some(p)) => {
                    // SAFETY: The partner page was recorded by cow_setup on
                    // a live space.
                    if !unsafe { self.cow_duplicate(p.space, p.page, None) } {
                        // Resolution failed (allocation); drop the relation
                        // rather than looping forever.
                        let mut traps = self.traps.lock();
                        traps.remove(partner.0);
                        traps.remove(partner.1);
                    }
                }
                (id, pair_id, None) => {
                    // Orphaned record: no partner left to preserve.
                    let mut traps = self.traps.lock();
                    traps.remove(id);
                    traps.remove(pair_id);
                }
            }
        }
    }

    // ── Attribute accessors ─────────────────────────────────────────────

    /// Page size index of the mapping containing `va`, or `None`.
    pub fn get_pgsz(&self, space: AddrSpace, va: VirtAddr) -> Option<usize> {
        self.tables.page_size_index(space, va)
    }

    /// Physical address of `va`, or `None` if unmapped.
    pub fn get_paddr(&self, space: AddrSpace, va: VirtAddr) -> Option<PhysAddr> {
        self.tables.frame_addr(space, va)
    }

    /// Redirects the mapping containing `va` to a new physical address.
    ///
    /// # Safety
    ///
    /// See [`PageTables::set_frame_addr`].
    pub unsafe fn set_paddr(&self, space: AddrSpace, va: VirtAddr, pa: PhysAddr) {
        unsafe { self.tables.set_frame_addr(space, va, pa) }
    }

    /// Flags of the mapping containing `va`; empty if unmapped.
    pub fn get_flags(&self, space: AddrSpace, va: VirtAddr) -> PageFlags {
        self.tables.flags(space, va)
    }

    /// Replaces the flags of the mapping containing `va`.
    ///
    /// # Safety
    ///
    /// See [`PageTables::set_flags`].
    pub unsafe fn set_flags(&self, space: AddrSpace, va: VirtAddr, flags: PageFlags) {
        unsafe { self.tables.set_flags(space, va, flags) }
    }

    /// Whether the mapping containing `va` has been written to.
    pub fn get_dirty(&self, space: AddrSpace, va: VirtAddr) -> bool {
        self.tables.dirty(space, va)
    }

    /// Sets or clears the dirty bit of the mapping containing `va`.
    ///
    /// # Safety
    ///
    /// See [`PageTables::set_dirty`].
    pub unsafe fn set_dirty(&self, space: AddrSpace, va: VirtAddr, dirty: bool) {
        unsafe { self.tables.set_dirty(space, va, dirty) }
    }

    // ── Region operations ───────────────────────────────────────────────

    /// Maps `size` bytes from `pa` at `va`, greedily covering the range
    /// with the largest aligned pages not exceeding `max_size_idx` and
    /// filling remainders with small pages.
    ///
    /// Returns the virtual address corresponding to the original `pa`.
    ///
    /// # Safety
    ///
    /// See [`PageTables::map_page`].
    pub unsafe fn map(
        &self,
        space: AddrSpace,
        pa: PhysAddr,
        va: VirtAddr,
        size: u32,
        max_size_idx: usize,
        flags: PageFlags,
    ) -> Result<VirtAddr, VmmError> {
        let sizes = self.tables.page_sizes();
        let mut max_idx = max_size_idx.min(sizes.len() - 1);
        let min = sizes[0];

        // Align both addresses down and widen the range accordingly.
        let pa_off = pa.as_u32() % min;
        let va_off = va.as_u32() % min;
        let delta = pa_off.max(va_off);
        let mut pa = pa.as_u32() as u64 - pa_off as u64;
        let mut va_cur = va.as_u32() as u64 - va_off as u64;
        let start = va_cur;
        let mut size = size as u64 + delta as u64;
        size = size.div_ceil(min as u64) * min as u64;

        // Reduce the maximum page size to the most suitable one.
        while max_idx > 0 && sizes[max_idx] as u64 > size {
            max_idx -= 1;
        }

        let va_end = va_cur + size;
        while va_cur < va_end {
            let mut chosen = 0;
            for i in (0..=max_idx).rev() {
                let s = sizes[i] as u64;
                if va_cur + s <= va_end && pa % s == 0 && va_cur % s == 0 {
                    chosen = i;
                    break;
                }
            }
            unsafe {
                self.pgmap(
                    space,
                    PhysAddr::new(pa as u32),
                    VirtAddr::new(va_cur as u32),
                    chosen,
                    flags,
                )?;
            }
            pa += sizes[chosen] as u64;
            va_cur += sizes[chosen] as u64;
        }

        Ok(VirtAddr::new(start as u32 + pa_off))
    }

    /// Unmaps `size` bytes starting at `va`, decomposing the range
    /// symmetrically to [`map`](Self::map).
    ///
    /// # Safety
    ///
    /// See [`PageTables::unmap_page`].
    pub unsafe fn unmap(&self, space: AddrSpace, va: VirtAddr, size: u32) -> Result<(), VmmError> {
        let sizes = self.tables.page_sizes();
        let min = sizes[0];
        let max_idx = sizes.len() - 1;

        let va_off = va.as_u32() % min;
        let mut va_cur = va.as_u32() as u64 - va_off as u64;
        let mut size = size as u64 + va_off as u64;
        size = size.div_ceil(min as u64) * min as u64;
        let va_end = va_cur + size;

        while va_cur < va_end {
            let mut chosen = 0;
            for i in (0..=max_idx).rev() {
                let s = sizes[i] as u64;
                if va_cur + s <= va_end && va_cur % s == 0 {
                    chosen = i;
                    break;
                }
            }
            unsafe { self.pgunmap(space, VirtAddr::new(va_cur as u32), chosen)? };
            va_cur += sizes[chosen] as u64;
        }
        Ok(())
    }

    /// Scans `[start, end)` for a contiguous unmapped run of `size` bytes,
    /// at minimum-page granularity, optionally backwards and with a
    /// start-address alignment (`0` for none). Returns the zero address if
    /// no run exists.
    pub fn first_free(
        &self,
        space: AddrSpace,
        start: VirtAddr,
        end: VirtAddr,
        size: u32,
        align: u32,
        reverse: bool,
    ) -> VirtAddr {
        let min = self.min_page() as u64;
        let align = if align == 0 { min } else { align as u64 };
        debug_assert!(align % min == 0, "alignment must be a multiple of the page size");

        // Never hand out the null page.
        let start = (start.as_u32() as u64).max(min);
        let end = end.as_u32() as u64;
        let size = (size as u64).div_ceil(min) * min;
        if size == 0 || start + size > end {
            return VirtAddr::zero();
        }
        let pages = size / min;

        let is_free_run = |base: u64| -> Option<u64> {
            // Returns the first blocked probe, or None if the run is free.
            for i in 0..pages {
                let probe = base + i * min;
                if self
                    .tables
                    .page_size_index(space, VirtAddr::new(probe as u32))
                    .is_some()
                {
                    return Some(probe);
                }
            }
            None
        };

        if !reverse {
            let mut va = start.div_ceil(align) * align;
            while va + size <= end {
                match is_free_run(va) {
                    None => return VirtAddr::new(va as u32),
                    Some(blocked) => {
                        va = (blocked + min).div_ceil(align) * align;
                    }
                }
            }
        } else {
            let mut va = ((end - size) / align) * align;
            loop {
                if va < start {
                    break;
                }
                match is_free_run(va) {
                    None => return VirtAddr::new(va as u32),
                    Some(blocked) => {
                        if blocked < size {
                            break;
                        }
                        let next = (blocked - size) / align * align;
                        if next >= va {
                            break;
                        }
                        va = next;
                    }
                }
            }
        }

        VirtAddr::zero()
    }

    /// Finds a free virtual window for `size` bytes of physical memory at
    /// `pa` and maps it. Returns the virtual address corresponding to `pa`.
    ///
    /// # Safety
    ///
    /// See [`PageTables::map_page`].
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn alloc_map(
        &self,
        space: AddrSpace,
        pa: PhysAddr,
        size: u32,
        va_start: VirtAddr,
        va_end: VirtAddr,
        va_align: u32,
        max_size_idx: usize,
        reverse: bool,
        flags: PageFlags,
    ) -> Result<VirtAddr, VmmError> {
        let off = pa.as_u32() % self.min_page();
        let pa = PhysAddr::new(pa.as_u32() - off);
        let size = size + off;

        let va = self.first_free(space, va_start, va_end, size, va_align, reverse);
        if va == VirtAddr::zero() {
            return Err(VmmError::OutOfMemory);
        }
        unsafe { self.map(space, pa, va, size, max_size_idx, flags)? };
        Ok(va + off)
    }

    // ── Copy-on-write ───────────────────────────────────────────────────

    /// Arms copy-on-write between `size` bytes at `src_va` in `src` and
    /// `dst_va` in `dst`: the destination maps the source's frames with
    /// write access cleared and the trap flag set, the source's write
    /// access is mirror-cleared, and a trap pair links the two sides.
    ///
    /// Source pages larger than the remaining range are subdivided first,
    /// preserving their frames and flags. Stops early if the source is
    /// unmapped or the destination already mapped; returns the number of
    /// bytes actually armed.
    ///
    /// # Safety
    ///
    /// Both spaces must be live; the source range must not be concurrently
    /// modified.
    pub unsafe fn cow_setup(
        &self,
        src: AddrSpace,
        src_va: VirtAddr,
        dst: AddrSpace,
        dst_va: VirtAddr,
        size: u32,
    ) -> Result<u32, VmmError> {
        let sizes = self.tables.page_sizes();
        let min = sizes[0];

        let src_off = src_va.as_u32() % min;
        let dst_off = dst_va.as_u32() % min;
        let mut src_va = src_va.align_down(min);
        let mut dst_va = dst_va.align_down(min);
        let size = (size as u64 + src_off.max(dst_off) as u64).div_ceil(min as u64) * min as u64;

        let mut done: u64 = 0;
        while done < size {
            let Some(src_idx) = self.tables.page_size_index(src, src_va) else {
                break; // source not mapped
            };
            if self.tables.page_size_index(dst, dst_va).is_some() {
                break; // destination already mapped
            }

            let mut idx = src_idx;
            if sizes[idx] as u64 > size - done {
                // The source page overshoots the range: subdivide it in
                // place, preserving frames and flags.
                while idx > 0 && sizes[idx] as u64 > size - done {
                    idx -= 1;
                }
                let fl = self.tables.flags(src, src_va);
                let pa = self
                    .tables
                    .frame_addr(src, src_va)
                    .ok_or(VmmError::Unmapped)?;
                unsafe { self.pgmap(src, pa, src_va, idx, fl)? };
            }
            let pgsz = sizes[idx];

            let src_flags = self.tables.flags(src, src_va);
            let pa = self
                .tables
                .frame_addr(src, src_va)
                .ok_or(VmmError::Unmapped)?;
            unsafe {
                self.pgmap(
                    dst,
                    pa,
                    dst_va,
                    idx,
                    (src_flags - PageFlags::WRITABLE) | PageFlags::TRAPPED,
                )?;
            }

            {
                let mut traps = self.traps.lock();
                let s = traps.insert(src, src_va);
                let d = traps.insert(dst, dst_va);
                traps.link(s, d);
            }

            // Disable writes on the source so the next write faults.
            unsafe {
                self.tables.set_flags(
                    src,
                    src_va,
                    (src_flags - PageFlags::WRITABLE) | PageFlags::TRAPPED,
                );
            }

            done += pgsz as u64;
            src_va = src_va + pgsz;
            dst_va = dst_va + pgsz;
        }

        Ok(done as u32)
    }

    /// Whether a CoW trap is armed on the page containing `va`.
    pub fn is_cow(&self, space: AddrSpace, va: VirtAddr) -> bool {
        let Some(idx) = self.tables.page_size_index(space, va) else {
            return false;
        };
        let page = va.align_down(self.tables.page_sizes()[idx]);
        self.traps.lock().find_cow(space, page).is_some()
    }

    /// Number of live trap records (diagnostics and tests).
    pub fn trap_count(&self) -> usize {
        self.traps.lock().live()
    }

    /// Splits a trapped huge page (and all its CoW partners) into small
    /// pages sharing the original frames, re-pairing each subpage.
    ///
    /// Returns `false` if the page carries no trap.
    unsafe fn split_trapped_huge(
        &self,
        space: AddrSpace,
        base: VirtAddr,
        size_idx: usize,
    ) -> Result<bool, VmmError> {
        let sizes = self.tables.page_sizes();
        let huge = sizes[size_idx];
        let small = sizes[0];

        let partners: Vec<CowPartner> = {
            let traps = self.traps.lock();
            self.collect_partners(&traps, space, base)
        };
        if partners.is_empty() {
            return Ok(false);
        }

        // Subdivide this side and every partner side in place.
        let fl = self.tables.flags(space, base);
        let pa = self
            .tables
            .frame_addr(space, base)
            .ok_or(VmmError::Unmapped)?;
        unsafe { self.pgmap(space, pa, base, 0, fl)? };
        for p in &partners {
            let fl = self.tables.flags(p.space, p.page);
            let pa = self
                .tables
                .frame_addr(p.space, p.page)
                .ok_or(VmmError::Unmapped)?;
            unsafe { self.pgmap(p.space, pa, p.page, 0, fl)? };
        }

        // Replace the huge pairs with one pair per subpage.
        let mut traps = self.traps.lock();
        for p in &partners {
            traps.remove(p.own);
            traps.remove(p.pair);
            let mut off = 0u32;
            while off < huge {
                let a = traps.insert(space, base + off);
                let b = traps.insert(p.space, p.page + off);
                traps.link(a, b);
                off += small;
            }
        }
        Ok(true)
    }

    /// Copies out every live CoW relation on `(space, page)`.
    fn collect_partners(
        &self,
        traps: &TrapArena,
        space: AddrSpace,
        page: VirtAddr,
    ) -> Vec<CowPartner> {
        let mut out = Vec::new();
        for id in 0..traps.len() {
            let Some(t) = traps.get(id) else { continue };
            if t.space != space || t.page != page {
                continue;
            }
            if let Some(p) = traps.get(t.pair) {
                out.push(CowPartner {
                    own: id,
                    pair: t.pair,
                    space: p.space,
                    page: p.page,
                });
            }
        }
        out
    }

    /// Resolves the CoW order on the page containing `vaddr` in `space`:
    /// the page receives freshly allocated frames carrying a copy of the
    /// shared data and becomes writable again.
    ///
    /// `size_hint` lets callers that already know the page size index skip
    /// the lookup. Returns `false` if the page has no CoW trap or the copy
    /// could not be made.
    ///
    /// This is the only place physical memory is copied: both sides are
    /// mapped into a private window of the current space and copied frame
    /// by frame.
    ///
    /// # Safety
    ///
    /// `space` must be live.
    pub unsafe fn cow_duplicate(
        &self,
        space: AddrSpace,
        vaddr: VirtAddr,
        size_hint: Option<usize>,
    ) -> bool {
        let sizes = self.tables.page_sizes();
        let mut idx = match size_hint.or_else(|| self.tables.page_size_index(space, vaddr)) {
            Some(i) if i < sizes.len() => i,
            _ => return false,
        };
        let mut page = vaddr.align_down(sizes[idx]);

        // A trapped huge page is subdivided first so that only the touched
        // small page is given a fresh frame; the rest keeps sharing the
        // original frames as small pages.
        if idx > 0 {
            match unsafe { self.split_trapped_huge(space, page, idx) } {
                Ok(true) => {
                    idx = 0;
                    page = vaddr.align_down(sizes[0]);
                }
                Ok(false) => return false,
                Err(_) => return false,
            }
        }

        let pgsz = sizes[idx];
        let framesz = sizes[0];
        let frames = (pgsz / framesz) as usize;

        let partners: Vec<CowPartner> = {
            let traps = self.traps.lock();
            self.collect_partners(&traps, space, page)
        };
        let Some(first) = partners.first() else {
            return false;
        };
        let (hub_space, hub_page) = (first.space, first.page);

        // All partners share the original frames; copy from the first.
        let Some(src_pa) = self.tables.frame_addr(hub_space, hub_page) else {
            return false;
        };

        // Private copy window: two small pages in the current space.
        let window_flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::CACHED;
        let current = self.tables.current();
        let win = match unsafe {
            self.alloc_map(
                current,
                PhysAddr::zero(),
                2 * framesz,
                self.scratch.0,
                self.scratch.1,
                0,
                0,
                false,
                window_flags,
            )
        } {
            Ok(w) => w,
            Err(_) => return false,
        };

        let new_pa = match self.tables.alloc_frames(frames) {
            Ok(pa) => pa,
            Err(_) => {
                // SAFETY: The window was just mapped by us.
                let _ = unsafe { self.unmap(current, win, 2 * framesz) };
                return false;
            }
        };

        // Walk the frame pairs through the window and copy.
        for i in 0..frames as u32 {
            unsafe {
                self.tables
                    .set_frame_addr(current, win, src_pa + i * framesz);
                self.tables
                    .set_frame_addr(current, win + framesz, new_pa + i * framesz);
                self.tables
                    .copy_bytes(win + framesz, win, framesz as usize);
            }
        }
        // SAFETY: The window was mapped by us and carries no traps.
        let _ = unsafe { self.unmap(current, win, 2 * framesz) };

        // Retarget the resolved page and restore its write access.
        unsafe {
            self.tables.set_frame_addr(space, page, new_pa);
            let fl = self.tables.flags(space, page);
            self.tables
                .set_flags(space, page, (fl | PageFlags::WRITABLE) - PageFlags::TRAPPED);
        }

        // Delete the pairs; remaining sharers re-link around the first
        // partner, which keeps the original frames.
        {
            let mut traps = self.traps.lock();
            for p in &partners {
                traps.remove(p.own);
                traps.remove(p.pair);
            }
            for p in partners.iter().skip(1) {
                if (p.space, p.page) != (hub_space, hub_page) {
                    let a = traps.insert(hub_space, hub_page);
                    let b = traps.insert(p.space, p.page);
                    traps.link(a, b);
                }
            }
        }

        // If nothing references the partner side anymore, it owns its
        // frames again.
        let hub_free = self.traps.lock().find_cow(hub_space, hub_page).is_none();
        if hub_free {
            unsafe {
                let fl = self.tables.flags(hub_space, hub_page);
                self.tables
                    .set_flags(hub_space, hub_page, (fl | PageFlags::WRITABLE) - PageFlags::TRAPPED);
            }
        }

        true
    }

    /// Page-fault triage, called by the architecture fault handler with
    /// the faulting address and the access kind (in [`PageFlags`] terms).
    ///
    /// Returns `true` if the fault was handled (CoW resolved) and the
    /// faulting instruction may be retried.
    ///
    /// # Safety
    ///
    /// Must be called on the fault path with a valid current space.
    pub unsafe fn handle_fault(&self, vaddr: VirtAddr, access: PageFlags) -> bool {
        if access.contains(PageFlags::WRITABLE) {
            // A write to a CoW page: resolve it.
            unsafe { self.cow_duplicate(self.tables.current(), vaddr, None) }
        } else {
            false
        }
    }

    // ── Cloning ─────────────────────────────────────────────────────────

    /// Clones `src` into a fresh address space.
    ///
    /// Kernel-region entries are shared verbatim. With `cow` set, every
    /// user-region page is armed for copy-on-write; otherwise the
    /// destination re-maps the same physical frames (fresh page tables,
    /// shared frames; only correct when the caller will not diverge).
    ///
    /// # Safety
    ///
    /// `src` must be live and not concurrently modified.
    pub unsafe fn clone_space(&self, src: AddrSpace, cow: bool) -> Result<AddrSpace, VmmError> {
        let dst = unsafe { self.tables.new_space(src)? };
        let sizes = self.tables.page_sizes();

        let mut cursor = VirtAddr::zero();
        let result = loop {
            let Some(page) = self.tables.next_mapped(src, cursor, self.kernel_start) else {
                break Ok(());
            };
            let Some(idx) = self.tables.page_size_index(src, page) else {
                cursor = page + sizes[0];
                continue;
            };
            let pgsz = sizes[idx];

            let step = if cow {
                unsafe { self.cow_setup(src, page, dst, page, pgsz).map(|_| ()) }
            } else {
                let pa = self.tables.frame_addr(src, page).ok_or(VmmError::Unmapped);
                match pa {
                    Ok(pa) => unsafe {
                        self.pgmap(dst, pa, page, idx, self.tables.flags(src, page))
                    },
                    Err(e) => Err(e),
                }
            };
            if let Err(e) = step {
                break Err(e);
            }

            let next = page.as_u32() as u64 + pgsz as u64;
            if next >= self.kernel_start.as_u32() as u64 {
                break Ok(());
            }
            cursor = VirtAddr::new(next as u32);
        };

        match result {
            Ok(()) => Ok(dst),
            Err(e) => {
                // Roll back the partial clone.
                unsafe {
                    self.trap_remove(dst);
                    self.tables.destroy_space(dst);
                }
                Err(e)
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Rewrites every CoW relation involving `space` so the space can be
    /// deallocated: for each of its pages shared with survivors, the first
    /// surviving partner takes ownership of the frames and any further
    /// partners are re-paired against it. Traps targeting `space` alone
    /// are dropped.
    ///
    /// # Safety
    ///
    /// `space` must not be used again after this call except to destroy it.
    pub unsafe fn trap_remove(&self, space: AddrSpace) {
        // Phase 1 (under the traps mutex): unlink pairs, record the work.
        let mut owners: Vec<(AddrSpace, VirtAddr)> = Vec::new();
        let mut relinks: Vec<((AddrSpace, VirtAddr), (AddrSpace, VirtAddr))> = Vec::new();
        {
            let mut traps = self.traps.lock();
            // Keyed by the dying page: its first surviving partner.
            let mut rehomed: Vec<(VirtAddr, AddrSpace, VirtAddr)> = Vec::new();

            for id in 0..traps.len() {
                let Some(t) = traps.get(id) else { continue };
                let pair = traps.get(t.pair);
                let t_dying = t.space == space;
                let p_dying = pair.is_some_and(|p| p.space == space);
                if !t_dying && !p_dying {
                    continue;
                }

                let pair_id = t.pair;
                let (dying, survivor) = if t_dying { (t, pair) } else { (pair.unwrap(), Some(t)) };
                traps.remove(id);
                traps.remove(pair_id);

                let Some(s) = survivor else { continue };
                if s.space == space {
                    continue; // both sides die with the space
                }

                match rehomed.iter().find(|(v, _, _)| *v == dying.page) {
                    Some(&(_, hub_space, hub_page)) => {
                        relinks.push(((hub_space, hub_page), (s.space, s.page)));
                    }
                    None => {
                        owners.push((s.space, s.page));
                        rehomed.push((dying.page, s.space, s.page));
                    }
                }
            }
        }

        // Phase 2: re-create pairs among the survivors.
        for (hub, other) in relinks {
            let mut traps = self.traps.lock();
            let a = traps.insert(hub.0, hub.1);
            let b = traps.insert(other.0, other.1);
            traps.link(a, b);
        }

        // Phase 3: survivors with no remaining relation own their frames.
        for (s_space, s_page) in owners {
            let free = self.traps.lock().find_cow(s_space, s_page).is_none();
            if free {
                unsafe {
                    let fl = self.tables.flags(s_space, s_page);
                    self.tables
                        .set_flags(s_space, s_page, (fl | PageFlags::WRITABLE) - PageFlags::TRAPPED);
                }
            }
        }
    }

    /// Deallocates `space`, or stages it if it is currently active.
    ///
    /// The kernel space is never freed.
    ///
    /// # Safety
    ///
    /// No task may reference `space` after this call.
    pub unsafe fn free(&self, space: AddrSpace) {
        if space == self.kernel_space {
            return;
        }
        if space == self.tables.current() {
            self.stage_free(space);
            return;
        }
        unsafe { self.free_now(space) };
    }

    unsafe fn free_now(&self, space: AddrSpace) {
        unsafe {
            self.trap_remove(space);
            self.tables.destroy_space(space);
        }
    }

    /// Stages `space` for deallocation once no CPU is using it.
    pub fn stage_free(&self, space: AddrSpace) {
        let mut stage = self.stage.lock();
        if !stage.contains(&space) {
            stage.push(space);
        }
    }

    /// Number of spaces currently staged for deallocation.
    pub fn staged_count(&self) -> usize {
        self.stage.lock().len()
    }

    /// Reaps staged address spaces that are no longer current. Called
    /// opportunistically by the scheduler at each yield.
    ///
    /// # Safety
    ///
    /// Staged spaces must not be re-activated concurrently.
    pub unsafe fn do_cleanup(&self) {
        // Someone else already doing our work is fine.
        let Some(mut stage) = self.stage.try_lock() else {
            return;
        };
        let current = self.tables.current();
        let mut eligible = Vec::new();
        stage.retain(|s| {
            if *s != current {
                eligible.push(*s);
                false
            } else {
                true
            }
        });
        drop(stage);

        for space in eligible {
            unsafe { self.free_now(space) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RMAP_BASE, SimTables};
    use muon_core::paging::{HUGE_PAGE_SIZE, PAGE_SIZE};

    const KERNEL_START: u32 = 0xC000_0000;
    const USER_VA: u32 = 0x0040_0000;

    fn engine() -> Vmm<SimTables> {
        let (sim, kernel) = SimTables::new(4096, VirtAddr::new(KERNEL_START));
        Vmm::new(
            sim,
            kernel,
            VirtAddr::new(KERNEL_START),
            (VirtAddr::new(0xD000_0000), VirtAddr::new(0xF000_0000)),
        )
    }

    /// Creates a user space sharing the kernel region.
    fn user_space(vmm: &Vmm<SimTables>) -> AddrSpace {
        unsafe { vmm.clone_space(vmm.kernel_space(), false).unwrap() }
    }

    /// Maps one small page of fresh memory at `va` in `space`.
    fn map_user_page(vmm: &Vmm<SimTables>, space: AddrSpace, va: u32) -> PhysAddr {
        let pa = vmm.tables().alloc_frames(1).unwrap();
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER | PageFlags::CACHED;
        unsafe {
            vmm.pgmap(space, pa, VirtAddr::new(va), 0, flags).unwrap();
        }
        pa
    }

    // ── Round-trip laws ─────────────────────────────────────────────────

    #[test]
    fn pgmap_get_paddr_roundtrip() {
        let vmm = engine();
        let space = user_space(&vmm);
        let pa = map_user_page(&vmm, space, USER_VA);

        assert_eq!(vmm.get_paddr(space, VirtAddr::new(USER_VA)), Some(pa));
        assert_eq!(
            vmm.get_paddr(space, VirtAddr::new(USER_VA + 0x123)),
            Some(pa + 0x123)
        );
        assert_eq!(vmm.get_pgsz(space, VirtAddr::new(USER_VA)), Some(0));
        assert!(
            vmm.get_flags(space, VirtAddr::new(USER_VA))
                .contains(PageFlags::PRESENT | PageFlags::WRITABLE)
        );
    }

    #[test]
    fn pgmap_pgunmap_leaves_no_mapping() {
        let vmm = engine();
        let space = user_space(&vmm);
        map_user_page(&vmm, space, USER_VA);

        unsafe { vmm.pgunmap(space, VirtAddr::new(USER_VA), 0).unwrap() };
        assert_eq!(vmm.get_pgsz(space, VirtAddr::new(USER_VA)), None);
        assert_eq!(vmm.get_paddr(space, VirtAddr::new(USER_VA)), None);
    }

    #[test]
    fn mapped_pages_reference_allocated_frames() {
        let vmm = engine();
        let space = user_space(&vmm);
        let pa = map_user_page(&vmm, space, USER_VA);
        assert!(vmm.tables().frame_is_allocated(pa.as_u32() / PAGE_SIZE));
    }

    #[test]
    fn invalid_size_index_is_rejected() {
        let vmm = engine();
        let space = user_space(&vmm);
        let res = unsafe {
            vmm.pgmap(
                space,
                PhysAddr::new(0x1000),
                VirtAddr::new(USER_VA),
                7,
                PageFlags::PRESENT,
            )
        };
        assert_eq!(res, Err(VmmError::InvalidPageSizeIndex));
    }

    #[test]
    fn recursive_window_is_off_limits() {
        let vmm = engine();
        let space = user_space(&vmm);
        let res = unsafe {
            vmm.pgmap(
                space,
                PhysAddr::new(0x1000),
                VirtAddr::new(RMAP_BASE),
                0,
                PageFlags::PRESENT,
            )
        };
        assert_eq!(res, Err(VmmError::RecursiveSlotViolation));
    }

    // ── Multi-size covering ─────────────────────────────────────────────

    #[test]
    fn map_covers_aligned_range_with_huge_pages() {
        let vmm = engine();
        let space = user_space(&vmm);
        // 8 MiB, both sides 4 MiB aligned: exactly two huge pages.
        let pa = PhysAddr::new(HUGE_PAGE_SIZE);
        unsafe {
            vmm.map(
                space,
                pa,
                VirtAddr::new(2 * HUGE_PAGE_SIZE),
                2 * HUGE_PAGE_SIZE,
                1,
                PageFlags::PRESENT | PageFlags::WRITABLE,
            )
            .unwrap();
        }
        assert_eq!(vmm.get_pgsz(space, VirtAddr::new(2 * HUGE_PAGE_SIZE)), Some(1));
        assert_eq!(vmm.get_pgsz(space, VirtAddr::new(3 * HUGE_PAGE_SIZE)), Some(1));
        assert_eq!(
            vmm.get_paddr(space, VirtAddr::new(3 * HUGE_PAGE_SIZE)),
            Some(PhysAddr::new(2 * HUGE_PAGE_SIZE))
        );
    }

    #[test]
    fn map_falls_back_to_small_pages_when_unaligned() {
        let vmm = engine();
        let space = user_space(&vmm);
        // Physical address not 4 MiB aligned: huge pages cannot be used.
        unsafe {
            vmm.map(
                space,
                PhysAddr::new(HUGE_PAGE_SIZE + PAGE_SIZE),
                VirtAddr::new(2 * HUGE_PAGE_SIZE),
                2 * PAGE_SIZE,
                1,
                PageFlags::PRESENT,
            )
            .unwrap();
        }
        assert_eq!(vmm.get_pgsz(space, VirtAddr::new(2 * HUGE_PAGE_SIZE)), Some(0));
        assert_eq!(
            vmm.get_pgsz(space, VirtAddr::new(2 * HUGE_PAGE_SIZE + PAGE_SIZE)),
            Some(0)
        );
    }

    #[test]
    fn small_map_into_huge_page_preserves_remainder() {
        let vmm = engine();
        let space = user_space(&vmm);
        // Huge pages need a 4 MiB aligned physical base.
        let pa = PhysAddr::new(HUGE_PAGE_SIZE);
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        unsafe {
            vmm.pgmap(space, pa, VirtAddr::new(USER_VA), 1, flags).unwrap();
        }

        // Replace the third 4 KiB slot with a different frame.
        let new_pa = vmm.tables().alloc_frames(1).unwrap();
        unsafe {
            vmm.pgmap(space, new_pa, VirtAddr::new(USER_VA + 2 * PAGE_SIZE), 0, flags)
                .unwrap();
        }

        assert_eq!(vmm.get_pgsz(space, VirtAddr::new(USER_VA)), Some(0));
        assert_eq!(
            vmm.get_paddr(space, VirtAddr::new(USER_VA + 2 * PAGE_SIZE)),
            Some(new_pa)
        );
        // Neighbours keep the original frames and flags.
        assert_eq!(vmm.get_paddr(space, VirtAddr::new(USER_VA)), Some(pa));
        assert_eq!(
            vmm.get_paddr(space, VirtAddr::new(USER_VA + 3 * PAGE_SIZE)),
            Some(pa + 3 * PAGE_SIZE)
        );
        assert_eq!(vmm.get_flags(space, VirtAddr::new(USER_VA + PAGE_SIZE)), flags);
    }

    // ── Free-range search ───────────────────────────────────────────────

    #[test]
    fn first_free_finds_gap_after_blocked_run() {
        let vmm = engine();
        let space = user_space(&vmm);
        // Mapped pages at +1 and +5 leave a 3-page run between them and
        // open space after.
        map_user_page(&vmm, space, USER_VA + PAGE_SIZE);
        map_user_page(&vmm, space, USER_VA + 5 * PAGE_SIZE);

        let found = vmm.first_free(
            space,
            VirtAddr::new(USER_VA),
            VirtAddr::new(USER_VA + 64 * PAGE_SIZE),
            4 * PAGE_SIZE,
            0,
            false,
        );
        assert_eq!(found.as_u32(), USER_VA + 6 * PAGE_SIZE);
    }

    #[test]
    fn first_free_respects_alignment() {
        let vmm = engine();
        let space = user_space(&vmm);
        map_user_page(&vmm, space, USER_VA);

        let found = vmm.first_free(
            space,
            VirtAddr::new(USER_VA),
            VirtAddr::new(USER_VA + 64 * PAGE_SIZE),
            PAGE_SIZE,
            4 * PAGE_SIZE,
            false,
        );
        assert_eq!(found.as_u32() % (4 * PAGE_SIZE), 0);
        assert!(found.as_u32() > USER_VA);
    }

    #[test]
    fn first_free_reverse_returns_highest_fit() {
        let vmm = engine();
        let space = user_space(&vmm);
        let end = USER_VA + 8 * PAGE_SIZE;
        map_user_page(&vmm, space, end - PAGE_SIZE);

        let found = vmm.first_free(
            space,
            VirtAddr::new(USER_VA),
            VirtAddr::new(end),
            2 * PAGE_SIZE,
            0,
            true,
        );
        assert_eq!(found.as_u32(), end - 3 * PAGE_SIZE);
    }

    #[test]
    fn first_free_returns_zero_when_full() {
        let vmm = engine();
        let space = user_space(&vmm);
        for i in 0..4 {
            map_user_page(&vmm, space, USER_VA + i * PAGE_SIZE);
        }
        let found = vmm.first_free(
            space,
            VirtAddr::new(USER_VA),
            VirtAddr::new(USER_VA + 4 * PAGE_SIZE),
            PAGE_SIZE,
            0,
            false,
        );
        assert_eq!(found, VirtAddr::zero());
    }

    #[test]
    fn alloc_map_finds_and_maps_a_window() {
        let vmm = engine();
        let space = user_space(&vmm);
        let pa = vmm.tables().alloc_frames(2).unwrap();
        let va = unsafe {
            vmm.alloc_map(
                space,
                pa + 0x80,
                2 * PAGE_SIZE,
                VirtAddr::new(USER_VA),
                VirtAddr::new(USER_VA + 64 * PAGE_SIZE),
                0,
                0,
                false,
                PageFlags::PRESENT | PageFlags::WRITABLE,
            )
            .unwrap()
        };
        assert_eq!(va.as_u32() % PAGE_SIZE, 0x80);
        assert_eq!(vmm.get_paddr(space, va), Some(pa + 0x80));
    }

    // ── TLB policy ──────────────────────────────────────────────────────

    #[test]
    fn cross_space_edit_emits_no_flush() {
        let vmm = engine();
        let space = user_space(&vmm);
        assert_ne!(vmm.current(), space);
        vmm.tables().take_flushes();

        // Non-global user mapping in a non-current space.
        map_user_page(&vmm, space, USER_VA);
        assert!(
            vmm.tables().take_flushes().is_empty(),
            "editing a non-current space must not invalidate the current TLB"
        );
    }

    #[test]
    fn current_space_edit_flushes() {
        let vmm = engine();
        let space = user_space(&vmm);
        unsafe { vmm.switch(space) };
        vmm.tables().take_flushes();

        map_user_page(&vmm, space, USER_VA);
        assert!(!vmm.tables().take_flushes().is_empty());
    }

    // ── Clone + copy-on-write ───────────────────────────────────────────

    #[test]
    fn clone_shares_reads_and_arms_traps() {
        let vmm = engine();
        let parent = user_space(&vmm);
        map_user_page(&vmm, parent, USER_VA);
        vmm.tables().write_byte(parent, VirtAddr::new(USER_VA + 5), 0xAA);

        let child = unsafe { vmm.clone_space(parent, true).unwrap() };

        // Trap-pair invariant: both sides read-only, trapped, same frame.
        let va = VirtAddr::new(USER_VA);
        for space in [parent, child] {
            let fl = vmm.get_flags(space, va);
            assert!(!fl.contains(PageFlags::WRITABLE), "{space:?} must be read-only");
            assert!(fl.contains(PageFlags::TRAPPED), "{space:?} must be trapped");
        }
        assert_eq!(vmm.get_paddr(parent, va), vmm.get_paddr(child, va));
        assert_eq!(vmm.trap_count(), 2);
        assert!(vmm.tables().recursive_slot_ok(child));

        // Reads see the same data from either side.
        assert_eq!(
            vmm.tables().read_byte(child, VirtAddr::new(USER_VA + 5)),
            Some(0xAA)
        );
    }

    #[test]
    fn cow_write_fault_diverges_parent_and_child() {
        let vmm = engine();
        let parent = user_space(&vmm);
        map_user_page(&vmm, parent, USER_VA);
        let addr = VirtAddr::new(USER_VA + 5);
        vmm.tables().write_byte(parent, addr, 0xAA);

        let child = unsafe { vmm.clone_space(parent, true).unwrap() };
        assert_eq!(vmm.tables().read_byte(child, addr), Some(0xAA));

        // Parent resumes and writes: the store faults, the fault is
        // resolved, and the write retries successfully.
        unsafe { vmm.switch(parent) };
        let frames_before = vmm.tables().allocated_frames();
        assert!(!vmm.tables().try_write_byte(parent, addr, 0xBB));
        assert!(unsafe { vmm.handle_fault(addr, PageFlags::WRITABLE) });
        assert!(vmm.tables().try_write_byte(parent, addr, 0xBB));

        assert_eq!(vmm.tables().read_byte(parent, addr), Some(0xBB));
        assert_eq!(vmm.tables().read_byte(child, addr), Some(0xAA));
        // Exactly one fresh frame was paid for the divergence.
        assert_eq!(vmm.tables().allocated_frames(), frames_before + 1);

        // Both sides own their frames again; no traps remain.
        assert!(vmm.get_flags(parent, addr).contains(PageFlags::WRITABLE));
        assert!(vmm.get_flags(child, addr).contains(PageFlags::WRITABLE));
        assert_eq!(vmm.trap_count(), 0);
    }

    #[test]
    fn read_fault_is_not_handled() {
        let vmm = engine();
        let parent = user_space(&vmm);
        unsafe { vmm.switch(parent) };
        assert!(!unsafe { vmm.handle_fault(VirtAddr::new(0xDEAD_0000), PageFlags::empty()) });
    }

    #[test]
    fn cow_on_huge_page_splits_and_copies_one_subpage() {
        let vmm = engine();
        let parent = user_space(&vmm);
        // A 4 MiB aligned physical range backs the huge page.
        let pa = PhysAddr::new(2 * HUGE_PAGE_SIZE);
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;
        unsafe {
            vmm.pgmap(parent, pa, VirtAddr::new(USER_VA), 1, flags).unwrap();
        }
        let addr = VirtAddr::new(USER_VA + 7 * PAGE_SIZE + 9);
        vmm.tables().write_byte(parent, addr, 0x5A);

        let child = unsafe { vmm.clone_space(parent, true).unwrap() };
        assert_eq!(vmm.get_pgsz(child, VirtAddr::new(USER_VA)), Some(1));

        unsafe { vmm.switch(parent) };
        assert!(unsafe { vmm.handle_fault(addr, PageFlags::WRITABLE) });
        vmm.tables().write_byte(parent, addr, 0xA5);

        // Both sides are now small pages; only the touched subpage has a
        // fresh frame.
        assert_eq!(vmm.get_pgsz(parent, VirtAddr::new(USER_VA)), Some(0));
        assert_eq!(vmm.get_pgsz(child, VirtAddr::new(USER_VA)), Some(0));
        let sub = VirtAddr::new(USER_VA + 7 * PAGE_SIZE);
        assert_ne!(vmm.get_paddr(parent, sub), vmm.get_paddr(child, sub));
        let other = VirtAddr::new(USER_VA + 8 * PAGE_SIZE);
        assert_eq!(vmm.get_paddr(parent, other), vmm.get_paddr(child, other));

        // Data diverged on the touched subpage only.
        assert_eq!(vmm.tables().read_byte(parent, addr), Some(0xA5));
        assert_eq!(vmm.tables().read_byte(child, addr), Some(0x5A));

        // 1023 of the 1024 subpage pairs remain armed.
        assert_eq!(vmm.trap_count(), 2 * 1023);
    }

    #[test]
    fn unmap_resolves_traps_for_the_surviving_side() {
        let vmm = engine();
        let parent = user_space(&vmm);
        map_user_page(&vmm, parent, USER_VA);
        let addr = VirtAddr::new(USER_VA + 1);
        vmm.tables().write_byte(parent, addr, 0x77);

        let child = unsafe { vmm.clone_space(parent, true).unwrap() };

        // Tearing down the child's page must not leave the parent trapped
        // or sharing a frame that is going away.
        unsafe { vmm.pgunmap(child, VirtAddr::new(USER_VA), 0).unwrap() };
        assert_eq!(vmm.get_pgsz(child, VirtAddr::new(USER_VA)), None);
        assert_eq!(vmm.trap_count(), 0);
        assert!(vmm.get_flags(parent, VirtAddr::new(USER_VA)).contains(PageFlags::WRITABLE));
        assert_eq!(vmm.tables().read_byte(parent, addr), Some(0x77));
    }

    // ── Deferred free ───────────────────────────────────────────────────

    #[test]
    fn free_of_current_space_is_staged_until_cleanup() {
        let vmm = engine();
        let baseline = vmm.tables().allocated_frames();
        let space = user_space(&vmm);
        map_user_page(&vmm, space, USER_VA);
        unsafe { vmm.switch(space) };

        unsafe { vmm.free(space) };
        assert_eq!(vmm.staged_count(), 1);
        assert!(vmm.tables().space_is_live(space));

        // Cleanup while the space is still current must not reap it.
        unsafe { vmm.do_cleanup() };
        assert!(vmm.tables().space_is_live(space));

        // After switching away, cleanup reaps the directory and its
        // user-region table frames.
        unsafe {
            vmm.switch(vmm.kernel_space());
            vmm.do_cleanup();
        }
        assert!(!vmm.tables().space_is_live(space));
        assert_eq!(vmm.staged_count(), 0);
        // Directory + page table freed; only the leaked leaf frame remains.
        assert_eq!(vmm.tables().allocated_frames(), baseline + 1);
    }

    #[test]
    fn free_of_inactive_space_is_immediate() {
        let vmm = engine();
        let space = user_space(&vmm);
        unsafe { vmm.free(space) };
        assert!(!vmm.tables().space_is_live(space));
        assert_eq!(vmm.staged_count(), 0);
    }

    #[test]
    fn kernel_space_is_never_freed() {
        let vmm = engine();
        unsafe { vmm.free(vmm.kernel_space()) };
        assert!(vmm.tables().space_is_live(vmm.kernel_space()));
    }

    #[test]
    fn freeing_a_cow_source_rehomes_its_traps() {
        let vmm = engine();
        let parent = user_space(&vmm);
        map_user_page(&vmm, parent, USER_VA);
        let addr = VirtAddr::new(USER_VA + 2);
        vmm.tables().write_byte(parent, addr, 0x42);

        let a = unsafe { vmm.clone_space(parent, true).unwrap() };
        let b = unsafe { vmm.clone_space(parent, true).unwrap() };

        // Parent dies; the shared data must survive in both clones.
        unsafe { vmm.free(parent) };
        assert!(!vmm.tables().space_is_live(parent));

        assert_eq!(vmm.tables().read_byte(a, addr), Some(0x42));
        assert_eq!(vmm.tables().read_byte(b, addr), Some(0x42));

        // The two survivors still share a frame through a rebuilt pair.
        assert_eq!(
            vmm.get_paddr(a, VirtAddr::new(USER_VA)),
            vmm.get_paddr(b, VirtAddr::new(USER_VA))
        );
        assert_eq!(vmm.trap_count(), 2);

        // Resolving one survivor's write releases the other.
        unsafe { vmm.switch(a) };
        assert!(unsafe { vmm.handle_fault(addr, PageFlags::WRITABLE) });
        assert!(vmm.get_flags(b, VirtAddr::new(USER_VA)).contains(PageFlags::WRITABLE));
        assert_eq!(vmm.trap_count(), 0);
    }

    #[test]
    fn kernel_region_maps_propagate_to_live_spaces() {
        let vmm = engine();
        let space = user_space(&vmm);
        let pa = vmm.tables().alloc_frames(1).unwrap();
        let kva = VirtAddr::new(KERNEL_START + 0x0100_0000);

        unsafe {
            vmm.pgmap(
                vmm.kernel_space(),
                pa,
                kva,
                0,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::GLOBAL,
            )
            .unwrap();
        }
        // The new kernel mapping is visible through the other space.
        assert_eq!(vmm.get_paddr(space, kva), Some(pa));
    }
}
