//! Recursive-mapping page tables.
//!
//! The x86 implementation of [`PageTables`]. Each address space's page
//! directory holds a self-referential slot (directory index 1023), which
//! projects the directory and every page table of the *current* space
//! into the window `[RMAP_BASE, 4 GiB)`: the directory itself appears at
//! `0xFFFF_F000` and the table for directory slot `n` at
//! `RMAP_BASE + n * 4096`.
//!
//! Editing a *non-current* space never switches CR3. Instead the foreign
//! directory (and, if needed, one of its tables) is mapped into one of a
//! small set of fixed transient slots in the kernel region, edited, and
//! unmapped again.
//!
//! Kernel-region directory entries are propagated to every live space at
//! edit time, via a registry maintained by `new_space`/`destroy_space`.

use alloc::vec::Vec;

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::paging::{HUGE_PAGE_SIZE, PAGE_SIZE, TABLE_ENTRIES, pd_index, pt_index};
use muon_core::sync::SpinLock;
use muon_mm::mapper::{AddrSpace, PageFlags, PageTables, VmmError};

use crate::arch::x86::instructions::tlb;
use crate::config::{KERNEL_BASE, RMAP_BASE, TRANSIENT_BASE, TRANSIENT_SLOTS};

// Hardware entry bits (Intel SDM, 32-bit paging with PSE).
const ENT_PRESENT: u32 = 1 << 0;
const ENT_RW: u32 = 1 << 1;
const ENT_USER: u32 = 1 << 2;
const ENT_PWT: u32 = 1 << 3;
const ENT_PCD: u32 = 1 << 4;
const ENT_DIRTY: u32 = 1 << 6;
const ENT_PSE: u32 = 1 << 7;
const ENT_GLOBAL: u32 = 1 << 8;
/// First available bit; carries the page-trap mark.
const ENT_TRAPPED: u32 = 1 << 9;

const ADDR_MASK: u32 = 0xFFFF_F000;
const PSE_ADDR_MASK: u32 = 0xFFC0_0000;

/// First kernel-region directory slot.
const KERNEL_PDE_FIRST: usize = (KERNEL_BASE >> 22) as usize;
/// Directory slot of the transient window.
const TRANSIENT_PDE: usize = (TRANSIENT_BASE >> 22) as usize;

/// Virtual address of the current space's directory via the recursive
/// slot.
const CUR_PD: u32 = 0xFFFF_F000;

#[inline]
fn cur_pd() -> *mut u32 {
    CUR_PD as *mut u32
}

/// Virtual address of the current space's table for directory slot `pde`.
#[inline]
fn cur_pt_addr(pde: usize) -> u32 {
    RMAP_BASE + (pde as u32) * PAGE_SIZE
}

/// Encodes [`PageFlags`] into hardware entry bits.
fn encode_flags(flags: PageFlags) -> u32 {
    let mut bits = 0;
    if flags.contains(PageFlags::PRESENT) {
        bits |= ENT_PRESENT;
    }
    if flags.contains(PageFlags::WRITABLE) {
        bits |= ENT_RW;
    }
    if flags.contains(PageFlags::USER) {
        bits |= ENT_USER;
    }
    if flags.contains(PageFlags::GLOBAL) {
        bits |= ENT_GLOBAL;
    }
    if !flags.contains(PageFlags::CACHED) {
        bits |= ENT_PCD;
    }
    if flags.contains(PageFlags::WRITE_THROUGH) {
        bits |= ENT_PWT;
    }
    if flags.contains(PageFlags::TRAPPED) {
        bits |= ENT_TRAPPED;
    }
    bits
}

/// Decodes hardware entry bits into [`PageFlags`].
fn decode_flags(entry: u32) -> PageFlags {
    let mut flags = PageFlags::empty();
    if entry & ENT_PRESENT != 0 {
        flags |= PageFlags::PRESENT;
    }
    if entry & ENT_RW != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if entry & ENT_USER != 0 {
        flags |= PageFlags::USER;
    }
    if entry & ENT_GLOBAL != 0 {
        flags |= PageFlags::GLOBAL;
    }
    if entry & ENT_PCD == 0 {
        flags |= PageFlags::CACHED;
    }
    if entry & ENT_PWT != 0 {
        flags |= PageFlags::WRITE_THROUGH;
    }
    if entry & ENT_TRAPPED != 0 {
        flags |= PageFlags::TRAPPED;
    }
    flags
}

/// Low bits carried over when a PSE page is re-expressed as small pages.
const PSE_INHERIT_MASK: u32 =
    ENT_PRESENT | ENT_RW | ENT_USER | ENT_PWT | ENT_PCD | ENT_DIRTY | ENT_GLOBAL | ENT_TRAPPED;

/// The recursive-mapping page-table implementation.
pub struct RecursiveTables {
    /// Live address spaces, for kernel-region propagation.
    spaces: SpinLock<Vec<AddrSpace>>,
    /// Bitmask of transient slots in use.
    slots: SpinLock<u8>,
}

/// RAII transient mapping of one foreign frame.
struct SlotGuard<'a> {
    tables: &'a RecursiveTables,
    idx: usize,
    va: u32,
}

impl SlotGuard<'_> {
    fn ptr(&self) -> *mut u32 {
        self.va as *mut u32
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: The transient table is present in every space and the
        // slot belongs to this guard.
        unsafe {
            let pt = cur_pt_addr(TRANSIENT_PDE) as *mut u32;
            pt.add(self.idx).write_volatile(0);
        }
        tlb::flush(VirtAddr::new(self.va));
        *self.tables.slots.lock() &= !(1 << self.idx);
    }
}

impl RecursiveTables {
    /// Creates the backend. [`adopt_boot_space`](Self::adopt_boot_space)
    /// and [`init_transients`](Self::init_transients) must run before any
    /// foreign-space edit.
    pub const fn new() -> Self {
        Self {
            spaces: SpinLock::new(Vec::new()),
            slots: SpinLock::new(0),
        }
    }

    /// Registers the boot-constructed kernel space.
    pub fn adopt_boot_space(&self, space: AddrSpace) {
        self.spaces.lock().push(space);
    }

    /// Allocates the transient window's page table in the current
    /// (kernel) space so every later space inherits it.
    ///
    /// # Safety
    ///
    /// Must be called exactly once during boot, on the kernel space, with
    /// the PMM initialized.
    pub unsafe fn init_transients(&self) -> Result<(), VmmError> {
        let table_pa = self.alloc_frames(1)?;
        // SAFETY: The recursive slot projects the current directory; the
        // transient slot was empty until now.
        unsafe {
            cur_pd()
                .add(TRANSIENT_PDE)
                .write_volatile(table_pa.as_u32() | ENT_PRESENT | ENT_RW);
            tlb::flush(VirtAddr::new(cur_pt_addr(TRANSIENT_PDE)));
            core::ptr::write_bytes(cur_pt_addr(TRANSIENT_PDE) as *mut u32, 0, TABLE_ENTRIES);
        }
        Ok(())
    }

    /// Maps a physical frame into a free transient slot of the current
    /// space.
    fn map_transient(&self, pa: PhysAddr) -> Result<SlotGuard<'_>, VmmError> {
        let idx = {
            let mut mask = self.slots.lock();
            let idx = (0..TRANSIENT_SLOTS).find(|i| *mask & (1 << i) == 0);
            match idx {
                Some(i) => {
                    *mask |= 1 << i;
                    i
                }
                None => return Err(VmmError::CannotMapDirectory),
            }
        };
        let va = TRANSIENT_BASE + (idx as u32) * PAGE_SIZE;
        // SAFETY: The transient table exists in every space; the slot is
        // exclusively ours until the guard drops.
        unsafe {
            let pt = cur_pt_addr(TRANSIENT_PDE) as *mut u32;
            pt.add(idx)
                .write_volatile((pa.as_u32() & ADDR_MASK) | ENT_PRESENT | ENT_RW);
        }
        tlb::flush(VirtAddr::new(va));
        Ok(SlotGuard {
            tables: self,
            idx,
            va,
        })
    }

    /// Directory pointer for `space`: the recursive window for the
    /// current space, a transient slot otherwise.
    fn pd_of(&self, space: AddrSpace) -> Result<(*mut u32, Option<SlotGuard<'_>>), VmmError> {
        if space == self.current() {
            Ok((cur_pd(), None))
        } else {
            let guard = self.map_transient(space.root())?;
            Ok((guard.ptr(), Some(guard)))
        }
    }

    /// Table pointer for directory slot `pde` of `space`.
    fn pt_of(
        &self,
        pde: usize,
        table_pa: PhysAddr,
        is_current: bool,
    ) -> Result<(*mut u32, Option<SlotGuard<'_>>), VmmError> {
        if is_current {
            Ok((cur_pt_addr(pde) as *mut u32, None))
        } else {
            let guard = self.map_transient(table_pa)?;
            Ok((guard.ptr(), Some(guard)))
        }
    }

    /// Copies a kernel-region directory entry to every other live space.
    fn propagate(&self, origin: AddrSpace, pde: usize, value: u32) {
        let current = self.current();
        let mut i = 0;
        loop {
            let space = {
                let registry = self.spaces.lock();
                match registry.get(i) {
                    Some(s) => *s,
                    None => break,
                }
            };
            i += 1;
            if space == origin {
                continue;
            }
            if space == current {
                // SAFETY: The recursive window projects the current
                // directory.
                unsafe { cur_pd().add(pde).write_volatile(value) };
            } else if let Ok(guard) = self.map_transient(space.root()) {
                // SAFETY: The guard maps the foreign directory frame.
                unsafe { guard.ptr().add(pde).write_volatile(value) };
            }
        }
    }

    fn unregister(&self, space: AddrSpace) {
        self.spaces.lock().retain(|s| *s != space);
    }

    fn map_small(
        &self,
        space: AddrSpace,
        pa: PhysAddr,
        va: VirtAddr,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        let pde = pd_index(va);
        let pte = pt_index(va);
        let is_current = space == self.current();
        let (pd, _pd_guard) = self.pd_of(space)?;

        // SAFETY: `pd` points at a directory frame for the whole scope.
        let pde_orig = unsafe { pd.add(pde).read_volatile() };
        let pse = pde_orig & ENT_PRESENT != 0 && pde_orig & ENT_PSE != 0;

        let mut flush = is_current;

        let (pt, _pt_guard) = if pde_orig & ENT_PRESENT != 0 && !pse {
            let table_pa = PhysAddr::new(pde_orig & ADDR_MASK);
            self.pt_of(pde, table_pa, is_current)?
        } else {
            // No usable table behind this slot: allocate one.
            let table_pa = self.alloc_frames(1)?;
            let mut new_pde = table_pa.as_u32() | ENT_PRESENT | ENT_RW;
            if pse {
                new_pde |= pde_orig & ENT_USER;
            }
            // SAFETY: Writing the directory slot of a live space.
            unsafe { pd.add(pde).write_volatile(new_pde) };
            let (pt, guard) = self.pt_of(pde, table_pa, is_current)?;
            if is_current {
                // Drop any stale recursive-window translation for this
                // table.
                tlb::flush(VirtAddr::new(cur_pt_addr(pde)));
            }
            // SAFETY: `pt` now references the freshly allocated table.
            unsafe { core::ptr::write_bytes(pt, 0, TABLE_ENTRIES) };

            if pse {
                // Re-express the former huge page as small pages,
                // preserving its frames and flags; the target slot is
                // rewritten below.
                let base = pde_orig & PSE_ADDR_MASK;
                let low = pde_orig & PSE_INHERIT_MASK;
                for i in 0..TABLE_ENTRIES {
                    if i != pte {
                        // SAFETY: In-bounds table write.
                        unsafe {
                            pt.add(i).write_volatile((base + (i as u32) * PAGE_SIZE) | low);
                        }
                    }
                }
                flush = flush || pde_orig & ENT_GLOBAL != 0;
            }

            if va.as_u32() >= KERNEL_BASE {
                self.propagate(space, pde, new_pde);
            }
            (pt, guard)
        };

        // Widen the directory entry's permissive bits.
        // SAFETY: `pd` is live for the scope.
        unsafe {
            let cur = pd.add(pde).read_volatile();
            let widen =
                encode_flags(flags) & (ENT_PRESENT | ENT_RW | ENT_USER);
            pd.add(pde).write_volatile(cur | widen);
        }

        // SAFETY: `pt` is live for the scope; `pte` is in bounds.
        let old = unsafe { pt.add(pte).read_volatile() };
        flush = flush || old & ENT_GLOBAL != 0 || flags.contains(PageFlags::GLOBAL);
        unsafe {
            pt.add(pte)
                .write_volatile((pa.as_u32() & ADDR_MASK) | encode_flags(flags));
        }

        if flush {
            tlb::flush(va.align_down(PAGE_SIZE));
        }
        Ok(())
    }

    fn map_huge(
        &self,
        space: AddrSpace,
        pa: PhysAddr,
        va: VirtAddr,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        let pde = pd_index(va);
        let is_current = space == self.current();
        let (pd, _pd_guard) = self.pd_of(space)?;

        // SAFETY: `pd` is live for the scope.
        let pde_orig = unsafe { pd.add(pde).read_volatile() };
        let had_table = pde_orig & ENT_PRESENT != 0 && pde_orig & ENT_PSE == 0;
        let was_global_pse =
            pde_orig & ENT_PRESENT != 0 && pde_orig & ENT_PSE != 0 && pde_orig & ENT_GLOBAL != 0;

        if had_table {
            // A table lazily backed this slot; it goes away with the
            // huge mapping replacing it.
            // SAFETY: The table frame is owned by this slot.
            unsafe { self.free_frames(PhysAddr::new(pde_orig & ADDR_MASK), 1) };
            if is_current {
                tlb::flush(VirtAddr::new(cur_pt_addr(pde)));
            }
        }

        let entry = (pa.as_u32() & PSE_ADDR_MASK) | ENT_PSE | encode_flags(flags);
        // SAFETY: Writing the directory slot of a live space.
        unsafe { pd.add(pde).write_volatile(entry) };

        if va.as_u32() >= KERNEL_BASE {
            self.propagate(space, pde, entry);
        }

        if is_current || was_global_pse || flags.contains(PageFlags::GLOBAL) {
            let base = va.align_down(HUGE_PAGE_SIZE);
            for i in 0..TABLE_ENTRIES as u32 {
                tlb::flush(base + i * PAGE_SIZE);
            }
        }
        Ok(())
    }

    fn unmap_small(&self, space: AddrSpace, va: VirtAddr) -> Result<(), VmmError> {
        let pde = pd_index(va);
        let pte = pt_index(va);
        let is_current = space == self.current();
        let (pd, _pd_guard) = self.pd_of(space)?;

        // SAFETY: `pd` is live for the scope.
        let pde_orig = unsafe { pd.add(pde).read_volatile() };
        if pde_orig & ENT_PRESENT == 0 {
            return Ok(());
        }

        if pde_orig & ENT_PSE != 0 {
            // Carving one small page out of a huge page: the remainder is
            // re-expressed as small pages.
            let table_pa = self.alloc_frames(1)?;
            let base = pde_orig & PSE_ADDR_MASK;
            let low = pde_orig & PSE_INHERIT_MASK;
            let new_pde = table_pa.as_u32() | ENT_PRESENT | ENT_RW | (pde_orig & ENT_USER);
            // SAFETY: Writing the directory slot of a live space.
            unsafe { pd.add(pde).write_volatile(new_pde) };
            let (pt, _pt_guard) = self.pt_of(pde, table_pa, is_current)?;
            if is_current {
                tlb::flush(VirtAddr::new(cur_pt_addr(pde)));
            }
            // SAFETY: `pt` references the fresh table.
            unsafe {
                core::ptr::write_bytes(pt, 0, TABLE_ENTRIES);
                for i in 0..TABLE_ENTRIES {
                    if i != pte {
                        pt.add(i).write_volatile((base + (i as u32) * PAGE_SIZE) | low);
                    }
                }
            }
            if va.as_u32() >= KERNEL_BASE {
                self.propagate(space, pde, new_pde);
            }
            if is_current || pde_orig & ENT_GLOBAL != 0 {
                let base_va = va.align_down(HUGE_PAGE_SIZE);
                for i in 0..TABLE_ENTRIES as u32 {
                    tlb::flush(base_va + i * PAGE_SIZE);
                }
            }
            return Ok(());
        }

        let table_pa = PhysAddr::new(pde_orig & ADDR_MASK);
        let (pt, _pt_guard) = self.pt_of(pde, table_pa, is_current)?;
        // SAFETY: `pt` is live for the scope.
        let old = unsafe { pt.add(pte).read_volatile() };
        unsafe { pt.add(pte).write_volatile(0) };
        if is_current || old & ENT_GLOBAL != 0 {
            tlb::flush(va.align_down(PAGE_SIZE));
        }

        // Free the table once it maps nothing.
        // SAFETY: `pt` is live for the scope.
        let empty = (0..TABLE_ENTRIES).all(|i| unsafe { pt.add(i).read_volatile() } == 0);
        if empty {
            // SAFETY: Clearing the directory slot that owned the table.
            unsafe { pd.add(pde).write_volatile(0) };
            if is_current {
                tlb::flush(VirtAddr::new(cur_pt_addr(pde)));
            }
            // SAFETY: No mapping references the table anymore.
            unsafe { self.free_frames(table_pa, 1) };
            if va.as_u32() >= KERNEL_BASE {
                self.propagate(space, pde, 0);
            }
        }
        Ok(())
    }

    fn unmap_huge(&self, space: AddrSpace, va: VirtAddr) -> Result<(), VmmError> {
        let pde = pd_index(va);
        let is_current = space == self.current();
        let (pd, _pd_guard) = self.pd_of(space)?;

        // SAFETY: `pd` is live for the scope.
        let pde_orig = unsafe { pd.add(pde).read_volatile() };
        if pde_orig & ENT_PRESENT == 0 {
            return Ok(());
        }

        let mut flush_whole = is_current;
        if pde_orig & ENT_PSE == 0 {
            // A table backs this slot: flush its global entries, then
            // free it.
            let table_pa = PhysAddr::new(pde_orig & ADDR_MASK);
            {
                let (pt, _pt_guard) = self.pt_of(pde, table_pa, is_current)?;
                for i in 0..TABLE_ENTRIES {
                    // SAFETY: In-bounds table read.
                    let entry = unsafe { pt.add(i).read_volatile() };
                    if entry & ENT_GLOBAL != 0 {
                        flush_whole = true;
                    }
                }
            }
            // SAFETY: The whole slot is going away.
            unsafe { self.free_frames(table_pa, 1) };
            if is_current {
                tlb::flush(VirtAddr::new(cur_pt_addr(pde)));
            }
        } else {
            flush_whole = flush_whole || pde_orig & ENT_GLOBAL != 0;
        }

        // SAFETY: Clearing the directory slot.
        unsafe { pd.add(pde).write_volatile(0) };
        if va.as_u32() >= KERNEL_BASE {
            self.propagate(space, pde, 0);
        }

        if flush_whole {
            let base = va.align_down(HUGE_PAGE_SIZE);
            for i in 0..TABLE_ENTRIES as u32 {
                tlb::flush(base + i * PAGE_SIZE);
            }
        }
        Ok(())
    }

    /// Reads the leaf entry covering `va`, with the size index it was
    /// found at.
    fn read_entry(&self, space: AddrSpace, va: VirtAddr) -> Option<(u32, usize)> {
        let is_current = space == self.current();
        let (pd, _pd_guard) = self.pd_of(space).ok()?;
        // SAFETY: `pd` is live for the scope.
        let pde_val = unsafe { pd.add(pd_index(va)).read_volatile() };
        if pde_val & ENT_PRESENT == 0 {
            return None;
        }
        if pde_val & ENT_PSE != 0 {
            return Some((pde_val, 1));
        }
        let (pt, _pt_guard) = self
            .pt_of(pd_index(va), PhysAddr::new(pde_val & ADDR_MASK), is_current)
            .ok()?;
        // SAFETY: `pt` is live for the scope.
        let entry = unsafe { pt.add(pt_index(va)).read_volatile() };
        if entry == 0 { None } else { Some((entry, 0)) }
    }

    /// Rewrites the leaf entry covering `va` through `edit`, handling the
    /// TLB per the invalidation policy.
    fn edit_entry(&self, space: AddrSpace, va: VirtAddr, edit: impl FnOnce(u32) -> u32) {
        let is_current = space == self.current();
        let Ok((pd, _pd_guard)) = self.pd_of(space) else {
            return;
        };
        let pde = pd_index(va);
        // SAFETY: `pd` is live for the scope.
        let pde_val = unsafe { pd.add(pde).read_volatile() };
        if pde_val & ENT_PRESENT == 0 {
            return;
        }

        if pde_val & ENT_PSE != 0 {
            let new = edit(pde_val) | ENT_PSE;
            // SAFETY: Writing the directory slot of a live space.
            unsafe { pd.add(pde).write_volatile(new) };
            if is_current || pde_val & ENT_GLOBAL != 0 || new & ENT_GLOBAL != 0 {
                let base = va.align_down(HUGE_PAGE_SIZE);
                for i in 0..TABLE_ENTRIES as u32 {
                    tlb::flush(base + i * PAGE_SIZE);
                }
            }
            return;
        }

        let Ok((pt, _pt_guard)) = self.pt_of(pde, PhysAddr::new(pde_val & ADDR_MASK), is_current)
        else {
            return;
        };
        let pte = pt_index(va);
        // SAFETY: `pt` is live for the scope.
        let old = unsafe { pt.add(pte).read_volatile() };
        if old == 0 {
            return;
        }
        let new = edit(old);
        unsafe { pt.add(pte).write_volatile(new) };
        if is_current || old & ENT_GLOBAL != 0 || new & ENT_GLOBAL != 0 {
            tlb::flush(va.align_down(PAGE_SIZE));
        }
    }
}

impl Default for RecursiveTables {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Table edits follow the x86 32-bit paging format with PSE; the
// recursive slot is installed by `new_space` and never handed out
// (`RMAP_BASE` and above is rejected); kernel-region directory edits are
// propagated through the live-space registry.
unsafe impl PageTables for RecursiveTables {
    fn page_sizes(&self) -> &'static [u32] {
        &[PAGE_SIZE, HUGE_PAGE_SIZE]
    }

    fn current(&self) -> AddrSpace {
        let cr3: u32;
        // SAFETY: Reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        AddrSpace(PhysAddr::new(cr3 & ADDR_MASK))
    }

    unsafe fn activate(&self, space: AddrSpace) {
        // SAFETY: The caller guarantees `space` is live and fully
        // constructed.
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) space.root().as_u32(),
                options(nostack, preserves_flags),
            );
        }
    }

    fn alloc_frames(&self, count: usize) -> Result<PhysAddr, VmmError> {
        crate::mm::pmm::alloc_frames(count).map_err(|_| VmmError::OutOfMemory)
    }

    unsafe fn free_frames(&self, pa: PhysAddr, count: usize) {
        crate::mm::pmm::free_frames(pa, count);
    }

    unsafe fn map_page(
        &self,
        space: AddrSpace,
        pa: PhysAddr,
        va: VirtAddr,
        size_idx: usize,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        if va.as_u32() >= RMAP_BASE {
            return Err(VmmError::RecursiveSlotViolation);
        }
        match size_idx {
            0 => self.map_small(space, pa, va, flags),
            1 => self.map_huge(space, pa, va, flags),
            _ => Err(VmmError::InvalidPageSizeIndex),
        }
    }

    unsafe fn unmap_page(
        &self,
        space: AddrSpace,
        va: VirtAddr,
        size_idx: usize,
    ) -> Result<(), VmmError> {
        if va.as_u32() >= RMAP_BASE {
            return Err(VmmError::RecursiveSlotViolation);
        }
        match size_idx {
            0 => self.unmap_small(space, va),
            1 => self.unmap_huge(space, va),
            _ => Err(VmmError::InvalidPageSizeIndex),
        }
    }

    fn page_size_index(&self, space: AddrSpace, va: VirtAddr) -> Option<usize> {
        self.read_entry(space, va).map(|(_, idx)| idx)
    }

    fn next_mapped(&self, space: AddrSpace, from: VirtAddr, to: VirtAddr) -> Option<VirtAddr> {
        let is_current = space == self.current();
        let (pd, _pd_guard) = self.pd_of(space).ok()?;

        let mut va = from.as_u32() as u64;
        let to = to.as_u32() as u64;
        while va < to {
            let pde = (va >> 22) as usize;
            // SAFETY: `pd` is live for the scope.
            let pde_val = unsafe { pd.add(pde).read_volatile() };
            if pde_val & ENT_PRESENT == 0 {
                va = ((va >> 22) + 1) << 22;
                continue;
            }
            if pde_val & ENT_PSE != 0 {
                return Some(VirtAddr::new(((va >> 22) << 22) as u32));
            }
            let Ok((pt, _pt_guard)) =
                self.pt_of(pde, PhysAddr::new(pde_val & ADDR_MASK), is_current)
            else {
                return None;
            };
            let first_slot = ((va >> 12) & 0x3FF) as usize;
            for slot in first_slot..TABLE_ENTRIES {
                let slot_va = ((pde as u64) << 22) | ((slot as u64) << 12);
                if slot_va >= to {
                    return None;
                }
                // SAFETY: In-bounds table read.
                if unsafe { pt.add(slot).read_volatile() } != 0 {
                    return Some(VirtAddr::new(slot_va as u32));
                }
            }
            va = ((va >> 22) + 1) << 22;
        }
        None
    }

    fn frame_addr(&self, space: AddrSpace, va: VirtAddr) -> Option<PhysAddr> {
        let (entry, idx) = self.read_entry(space, va)?;
        let pa = match idx {
            1 => (entry & PSE_ADDR_MASK) | (va.as_u32() & (HUGE_PAGE_SIZE - 1)),
            _ => (entry & ADDR_MASK) | (va.as_u32() & (PAGE_SIZE - 1)),
        };
        Some(PhysAddr::new(pa))
    }

    unsafe fn set_frame_addr(&self, space: AddrSpace, va: VirtAddr, pa: PhysAddr) {
        self.edit_entry(space, va, |old| {
            if old & ENT_PSE != 0 {
                (old & !PSE_ADDR_MASK) | (pa.as_u32() & PSE_ADDR_MASK)
            } else {
                (old & !ADDR_MASK) | (pa.as_u32() & ADDR_MASK)
            }
        });
    }

    fn flags(&self, space: AddrSpace, va: VirtAddr) -> PageFlags {
        self.read_entry(space, va)
            .map(|(entry, _)| decode_flags(entry))
            .unwrap_or(PageFlags::empty())
    }

    unsafe fn set_flags(&self, space: AddrSpace, va: VirtAddr, flags: PageFlags) {
        let bits = encode_flags(flags);
        self.edit_entry(space, va, |old| {
            (old & (ADDR_MASK | ENT_PSE | ENT_DIRTY)) | bits
        });
    }

    fn dirty(&self, space: AddrSpace, va: VirtAddr) -> bool {
        self.read_entry(space, va)
            .map(|(entry, _)| entry & ENT_DIRTY != 0)
            .unwrap_or(false)
    }

    unsafe fn set_dirty(&self, space: AddrSpace, va: VirtAddr, dirty: bool) {
        self.edit_entry(space, va, |old| {
            if dirty { old | ENT_DIRTY } else { old & !ENT_DIRTY }
        });
    }

    unsafe fn new_space(&self, template: AddrSpace) -> Result<AddrSpace, VmmError> {
        let dir_pa = self.alloc_frames(1)?;
        {
            let dst_guard = self.map_transient(dir_pa)?;
            let dst = dst_guard.ptr();
            let (src, _src_guard) = self.pd_of(template)?;

            // SAFETY: `dst` is a fresh frame; `src` is a live directory.
            unsafe {
                core::ptr::write_bytes(dst, 0, KERNEL_PDE_FIRST);
                for pde in KERNEL_PDE_FIRST..TABLE_ENTRIES {
                    dst.add(pde).write_volatile(src.add(pde).read_volatile());
                }
                // The recursive slot refers back to the new directory.
                dst.add(TABLE_ENTRIES - 1)
                    .write_volatile(dir_pa.as_u32() | ENT_PRESENT | ENT_RW);
            }
        }
        let space = AddrSpace(dir_pa);
        self.spaces.lock().push(space);
        Ok(space)
    }

    unsafe fn destroy_space(&self, space: AddrSpace) {
        self.unregister(space);
        {
            let Ok(guard) = self.map_transient(space.root()) else {
                return;
            };
            let pd = guard.ptr();
            for pde in 0..KERNEL_PDE_FIRST {
                // SAFETY: `pd` is live for the scope.
                let entry = unsafe { pd.add(pde).read_volatile() };
                if entry & ENT_PRESENT != 0 && entry & ENT_PSE == 0 {
                    // SAFETY: User-region tables are owned by this space.
                    unsafe { self.free_frames(PhysAddr::new(entry & ADDR_MASK), 1) };
                }
            }
        }
        // SAFETY: The directory frame is no longer referenced.
        unsafe { self.free_frames(space.root(), 1) };
    }

    unsafe fn copy_bytes(&self, dst: VirtAddr, src: VirtAddr, len: usize) {
        // SAFETY: The engine maps both ranges into the current space
        // before asking for the copy.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), len);
        }
    }
}
