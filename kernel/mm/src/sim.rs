//! Simulated two-level x86 page tables for host tests.
//!
//! Models the 10/10/12 split with PSE: a directory of 1024 entries, each
//! either empty, a 4 MiB PSE mapping, or a pointer to a 1024-entry page
//! table. Table frames come from a simulated frame pool so the engine's
//! allocation behavior (page-table frames, CoW copies) is observable, and
//! every TLB invalidation decision is journaled so tests can assert the
//! flush policy.

use std::cell::RefCell;
use std::collections::HashMap;

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::paging::{HUGE_PAGE_SIZE, PAGE_SIZE, TABLE_ENTRIES};

use crate::mapper::{AddrSpace, PageFlags, PageTables, VmmError};

/// Base of the recursive-mapping window: the last directory slot.
pub const RMAP_BASE: u32 = 0xFFC0_0000;

/// Supported page sizes, ascending.
const PAGE_SIZES: &[u32] = &[PAGE_SIZE, HUGE_PAGE_SIZE];

#[derive(Clone, Copy, Debug)]
struct SimEntry {
    pa: u32,
    flags: PageFlags,
    dirty: bool,
}

#[derive(Clone, Debug)]
enum SimPde {
    Empty,
    /// The per-space recursive slot.
    Recursive,
    Huge(SimEntry),
    /// Page table backed by a pool frame.
    Table(u32),
}

struct SimInner {
    /// Frame pool: `true` = allocated.
    pool: Vec<bool>,
    /// Simulated physical memory, one buffer per touched frame.
    mem: HashMap<u32, Box<[u8]>>,
    /// Live address spaces, keyed by directory frame number.
    spaces: HashMap<u32, Vec<SimPde>>,
    /// Page tables, keyed by table frame number (shared between spaces).
    tables: HashMap<u32, Vec<Option<SimEntry>>>,
    /// Directory frame number of the active space.
    current: u32,
    /// Journal of invalidated 4 KiB TLB slots.
    flushes: Vec<u32>,
}

/// Simulated [`PageTables`] implementation.
pub struct SimTables {
    inner: RefCell<SimInner>,
    kernel_start: VirtAddr,
}

impl SimTables {
    /// Creates a simulator with `frames` pool frames and a fresh kernel
    /// space; returns the simulator and the kernel space handle.
    pub fn new(frames: usize, kernel_start: VirtAddr) -> (Self, AddrSpace) {
        let mut inner = SimInner {
            pool: vec![false; frames],
            mem: HashMap::new(),
            spaces: HashMap::new(),
            tables: HashMap::new(),
            current: 0,
            flushes: Vec::new(),
        };
        let root = inner.alloc_pool(1).expect("pool too small");
        let mut dir = vec![SimPde::Empty; TABLE_ENTRIES];
        dir[(RMAP_BASE >> 22) as usize] = SimPde::Recursive;
        inner.spaces.insert(root, dir);
        inner.current = root;
        (
            Self {
                inner: RefCell::new(inner),
                kernel_start,
            },
            AddrSpace(PhysAddr::new(root * PAGE_SIZE)),
        )
    }

    fn kernel_pde(&self, pde: usize) -> bool {
        pde >= (self.kernel_start.as_u32() >> 22) as usize
    }

    /// Number of allocated pool frames.
    pub fn allocated_frames(&self) -> usize {
        self.inner.borrow().pool.iter().filter(|a| **a).count()
    }

    /// Drains and returns the TLB flush journal.
    pub fn take_flushes(&self) -> Vec<u32> {
        core::mem::take(&mut self.inner.borrow_mut().flushes)
    }

    /// Whether `space` is still registered as live.
    pub fn space_is_live(&self, space: AddrSpace) -> bool {
        self.inner
            .borrow()
            .spaces
            .contains_key(&(space.root().as_u32() / PAGE_SIZE))
    }

    /// Whether a frame number is allocated in the pool.
    pub fn frame_is_allocated(&self, frame: u32) -> bool {
        self.inner.borrow().pool[frame as usize]
    }

    /// Whether the recursive slot of `space` refers back to its own
    /// directory frame.
    pub fn recursive_slot_ok(&self, space: AddrSpace) -> bool {
        let inner = self.inner.borrow();
        let root = space.root().as_u32() / PAGE_SIZE;
        inner
            .spaces
            .get(&root)
            .map(|dir| matches!(dir[(RMAP_BASE >> 22) as usize], SimPde::Recursive))
            .unwrap_or(false)
    }

    /// Reads one byte through `space`.
    pub fn read_byte(&self, space: AddrSpace, va: VirtAddr) -> Option<u8> {
        let mut inner = self.inner.borrow_mut();
        let pa = inner.translate(space_root(space), va)?;
        Some(inner.frame_buf(pa / PAGE_SIZE)[(pa % PAGE_SIZE) as usize])
    }

    /// Writes one byte through `space` (bypassing permission checks, like
    /// a debugger would).
    pub fn write_byte(&self, space: AddrSpace, va: VirtAddr, value: u8) {
        let mut inner = self.inner.borrow_mut();
        let pa = inner
            .translate(space_root(space), va)
            .expect("write through unmapped address");
        inner.frame_buf(pa / PAGE_SIZE)[(pa % PAGE_SIZE) as usize] = value;
    }

    /// Simulates a CPU store: returns `false` (a fault) if the page is not
    /// present or not writable.
    pub fn try_write_byte(&self, space: AddrSpace, va: VirtAddr, value: u8) -> bool {
        {
            let inner = self.inner.borrow();
            match inner.entry(space_root(space), va) {
                Some(e)
                    if e.flags.contains(PageFlags::PRESENT)
                        && e.flags.contains(PageFlags::WRITABLE) => {}
                _ => return false,
            }
        }
        self.write_byte(space, va, value);
        true
    }
}

fn space_root(space: AddrSpace) -> u32 {
    space.root().as_u32() / PAGE_SIZE
}

impl SimInner {
    fn alloc_pool(&mut self, count: usize) -> Option<u32> {
        let mut run = 0usize;
        let mut start = 0usize;
        for (i, used) in self.pool.iter().enumerate() {
            if *used {
                run = 0;
                start = i + 1;
            } else {
                run += 1;
                if run == count {
                    for f in start..start + count {
                        self.pool[f] = true;
                    }
                    return Some(start as u32);
                }
            }
        }
        None
    }

    fn free_pool(&mut self, frame: u32, count: usize) {
        for f in frame..frame + count as u32 {
            self.pool[f as usize] = false;
        }
    }

    fn frame_buf(&mut self, frame: u32) -> &mut [u8] {
        self.mem
            .entry(frame)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice())
    }

    fn flush(&mut self, va: u32, count: usize) {
        for i in 0..count as u32 {
            self.flushes.push(va + i * PAGE_SIZE);
        }
    }

    /// Looks up the leaf entry covering `va` (a copy).
    fn entry(&self, root: u32, va: VirtAddr) -> Option<SimEntry> {
        let dir = self.spaces.get(&root)?;
        match &dir[(va.as_u32() >> 22) as usize] {
            SimPde::Empty | SimPde::Recursive => None,
            SimPde::Huge(e) => Some(*e),
            SimPde::Table(frame) => self.tables[frame][((va.as_u32() >> 12) & 0x3FF) as usize],
        }
    }

    fn translate(&self, root: u32, va: VirtAddr) -> Option<u32> {
        let dir = self.spaces.get(&root)?;
        match &dir[(va.as_u32() >> 22) as usize] {
            SimPde::Empty | SimPde::Recursive => None,
            SimPde::Huge(e) => Some(e.pa + (va.as_u32() & (HUGE_PAGE_SIZE - 1))),
            SimPde::Table(frame) => {
                let e = self.tables[frame][((va.as_u32() >> 12) & 0x3FF) as usize]?;
                Some(e.pa + (va.as_u32() & (PAGE_SIZE - 1)))
            }
        }
    }

    /// Applies `edit` to the leaf entry covering `va`, flushing per the
    /// invalidation policy. Returns `false` if unmapped.
    fn edit_entry(&mut self, root: u32, va: VirtAddr, edit: impl FnOnce(&mut SimEntry)) -> bool {
        let is_current = root == self.current;
        let dir = match self.spaces.get_mut(&root) {
            Some(d) => d,
            None => return false,
        };
        match dir[(va.as_u32() >> 22) as usize].clone() {
            SimPde::Empty | SimPde::Recursive => false,
            SimPde::Huge(mut e) => {
                let was_global = e.flags.contains(PageFlags::GLOBAL);
                edit(&mut e);
                let now_global = e.flags.contains(PageFlags::GLOBAL);
                dir[(va.as_u32() >> 22) as usize] = SimPde::Huge(e);
                if is_current || was_global || now_global {
                    self.flush(va.as_u32() & !(HUGE_PAGE_SIZE - 1), TABLE_ENTRIES);
                }
                true
            }
            SimPde::Table(frame) => {
                let slot = ((va.as_u32() >> 12) & 0x3FF) as usize;
                let table = self.tables.get_mut(&frame).expect("dangling table frame");
                match &mut table[slot] {
                    Some(e) => {
                        let was_global = e.flags.contains(PageFlags::GLOBAL);
                        edit(e);
                        let now_global = e.flags.contains(PageFlags::GLOBAL);
                        if is_current || was_global || now_global {
                            self.flush(va.as_u32() & !(PAGE_SIZE - 1), 1);
                        }
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Propagates a kernel-region directory entry to every live space.
    fn propagate_kernel_pde(&mut self, pde: usize, value: SimPde) {
        for dir in self.spaces.values_mut() {
            dir[pde] = value.clone();
        }
    }
}

// SAFETY: The simulator keeps its table structures, recursive slots, and
// kernel-region propagation consistent with the contract; it is a model,
// not hardware.
unsafe impl PageTables for SimTables {
    fn page_sizes(&self) -> &'static [u32] {
        PAGE_SIZES
    }

    fn current(&self) -> AddrSpace {
        AddrSpace(PhysAddr::new(self.inner.borrow().current * PAGE_SIZE))
    }

    unsafe fn activate(&self, space: AddrSpace) {
        self.inner.borrow_mut().current = space_root(space);
    }

    fn alloc_frames(&self, count: usize) -> Result<PhysAddr, VmmError> {
        let mut inner = self.inner.borrow_mut();
        let frame = inner.alloc_pool(count).ok_or(VmmError::OutOfMemory)?;
        Ok(PhysAddr::new(frame * PAGE_SIZE))
    }

    unsafe fn free_frames(&self, pa: PhysAddr, count: usize) {
        self.inner
            .borrow_mut()
            .free_pool(pa.as_u32() / PAGE_SIZE, count);
    }

    unsafe fn map_page(
        &self,
        space: AddrSpace,
        pa: PhysAddr,
        va: VirtAddr,
        size_idx: usize,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        if size_idx >= PAGE_SIZES.len() {
            return Err(VmmError::InvalidPageSizeIndex);
        }
        if va.as_u32() >= RMAP_BASE {
            return Err(VmmError::RecursiveSlotViolation);
        }

        let root = space_root(space);
        let mut inner = self.inner.borrow_mut();
        let is_current = root == inner.current;
        let pde = (va.as_u32() >> 22) as usize;

        if size_idx == 1 {
            // PSE mapping: a table previously backing this slot is freed.
            let old = inner.spaces.get(&root).ok_or(VmmError::Unmapped)?[pde].clone();
            let mut flush_whole = is_current || flags.contains(PageFlags::GLOBAL);
            if let SimPde::Table(frame) = old {
                inner.tables.remove(&frame);
                inner.free_pool(frame, 1);
            } else if let SimPde::Huge(e) = old {
                flush_whole |= e.flags.contains(PageFlags::GLOBAL);
            }
            let entry = SimPde::Huge(SimEntry {
                pa: pa.as_u32() & !(HUGE_PAGE_SIZE - 1),
                flags,
                dirty: false,
            });
            inner.spaces.get_mut(&root).unwrap()[pde] = entry.clone();
            if self.kernel_pde(pde) {
                inner.propagate_kernel_pde(pde, entry);
            }
            if flush_whole {
                inner.flush(va.as_u32() & !(HUGE_PAGE_SIZE - 1), TABLE_ENTRIES);
            }
            return Ok(());
        }

        // Small mapping.
        let slot = ((va.as_u32() >> 12) & 0x3FF) as usize;
        let old = inner.spaces.get(&root).ok_or(VmmError::Unmapped)?[pde].clone();
        let (table_frame, old_entry_global) = match old {
            SimPde::Table(frame) => {
                let g = inner.tables[&frame][slot]
                    .map(|e| e.flags.contains(PageFlags::GLOBAL))
                    .unwrap_or(false);
                (frame, g)
            }
            SimPde::Empty => {
                // Allocate a fresh page table.
                let frame = inner.alloc_pool(1).ok_or(VmmError::OutOfMemory)?;
                inner.tables.insert(frame, vec![None; TABLE_ENTRIES]);
                let entry = SimPde::Table(frame);
                inner.spaces.get_mut(&root).unwrap()[pde] = entry.clone();
                if self.kernel_pde(pde) {
                    inner.propagate_kernel_pde(pde, entry);
                }
                (frame, false)
            }
            SimPde::Huge(huge) => {
                // Replacing a huge page with a small one: the remainder of
                // the huge page is re-mapped as small pages preserving its
                // frames and flags.
                let frame = inner.alloc_pool(1).ok_or(VmmError::OutOfMemory)?;
                let mut table = vec![None; TABLE_ENTRIES];
                for (i, e) in table.iter_mut().enumerate() {
                    if i != slot {
                        *e = Some(SimEntry {
                            pa: huge.pa + (i as u32) * PAGE_SIZE,
                            flags: huge.flags,
                            dirty: huge.dirty,
                        });
                    }
                }
                inner.tables.insert(frame, table);
                let entry = SimPde::Table(frame);
                inner.spaces.get_mut(&root).unwrap()[pde] = entry.clone();
                if self.kernel_pde(pde) {
                    inner.propagate_kernel_pde(pde, entry);
                }
                (frame, huge.flags.contains(PageFlags::GLOBAL))
            }
            SimPde::Recursive => return Err(VmmError::RecursiveSlotViolation),
        };

        inner.tables.get_mut(&table_frame).unwrap()[slot] = Some(SimEntry {
            pa: pa.as_u32() & !(PAGE_SIZE - 1),
            flags,
            dirty: false,
        });
        if is_current || old_entry_global || flags.contains(PageFlags::GLOBAL) {
            inner.flush(va.as_u32() & !(PAGE_SIZE - 1), 1);
        }
        Ok(())
    }

    unsafe fn unmap_page(
        &self,
        space: AddrSpace,
        va: VirtAddr,
        size_idx: usize,
    ) -> Result<(), VmmError> {
        if size_idx >= PAGE_SIZES.len() {
            return Err(VmmError::InvalidPageSizeIndex);
        }
        if va.as_u32() >= RMAP_BASE {
            return Err(VmmError::RecursiveSlotViolation);
        }

        let root = space_root(space);
        let mut inner = self.inner.borrow_mut();
        let is_current = root == inner.current;
        let pde = (va.as_u32() >> 22) as usize;
        let old = inner.spaces.get(&root).ok_or(VmmError::Unmapped)?[pde].clone();

        if size_idx == 1 {
            let mut flush_whole = is_current;
            match old {
                SimPde::Empty | SimPde::Recursive => return Ok(()),
                SimPde::Huge(e) => flush_whole |= e.flags.contains(PageFlags::GLOBAL),
                SimPde::Table(frame) => {
                    let global = inner.tables[&frame]
                        .iter()
                        .flatten()
                        .any(|e| e.flags.contains(PageFlags::GLOBAL));
                    flush_whole |= global;
                    inner.tables.remove(&frame);
                    inner.free_pool(frame, 1);
                }
            }
            inner.spaces.get_mut(&root).unwrap()[pde] = SimPde::Empty;
            if self.kernel_pde(pde) {
                inner.propagate_kernel_pde(pde, SimPde::Empty);
            }
            if flush_whole {
                inner.flush(va.as_u32() & !(HUGE_PAGE_SIZE - 1), TABLE_ENTRIES);
            }
            return Ok(());
        }

        // Small unmap.
        let slot = ((va.as_u32() >> 12) & 0x3FF) as usize;
        match old {
            SimPde::Empty | SimPde::Recursive => Ok(()),
            SimPde::Table(frame) => {
                let global = {
                    let table = inner.tables.get_mut(&frame).expect("dangling table frame");
                    let g = table[slot]
                        .map(|e| e.flags.contains(PageFlags::GLOBAL))
                        .unwrap_or(false);
                    table[slot] = None;
                    g
                };
                // Free the table frame once it holds nothing.
                if inner.tables[&frame].iter().all(|e| e.is_none()) {
                    inner.tables.remove(&frame);
                    inner.free_pool(frame, 1);
                    inner.spaces.get_mut(&root).unwrap()[pde] = SimPde::Empty;
                    if self.kernel_pde(pde) {
                        inner.propagate_kernel_pde(pde, SimPde::Empty);
                    }
                }
                if is_current || global {
                    inner.flush(va.as_u32() & !(PAGE_SIZE - 1), 1);
                }
                Ok(())
            }
            SimPde::Huge(huge) => {
                // Carving one small page out of a huge page: the remainder
                // is re-mapped small.
                let frame = inner.alloc_pool(1).ok_or(VmmError::OutOfMemory)?;
                let mut table = vec![None; TABLE_ENTRIES];
                for (i, e) in table.iter_mut().enumerate() {
                    if i != slot {
                        *e = Some(SimEntry {
                            pa: huge.pa + (i as u32) * PAGE_SIZE,
                            flags: huge.flags,
                            dirty: huge.dirty,
                        });
                    }
                }
                inner.tables.insert(frame, table);
                let entry = SimPde::Table(frame);
                inner.spaces.get_mut(&root).unwrap()[pde] = entry.clone();
                if self.kernel_pde(pde) {
                    inner.propagate_kernel_pde(pde, entry);
                }
                if is_current || huge.flags.contains(PageFlags::GLOBAL) {
                    inner.flush(va.as_u32() & !(HUGE_PAGE_SIZE - 1), TABLE_ENTRIES);
                }
                Ok(())
            }
        }
    }

    fn page_size_index(&self, space: AddrSpace, va: VirtAddr) -> Option<usize> {
        let inner = self.inner.borrow();
        let dir = inner.spaces.get(&space_root(space))?;
        match &dir[(va.as_u32() >> 22) as usize] {
            SimPde::Empty | SimPde::Recursive => None,
            SimPde::Huge(_) => Some(1),
            SimPde::Table(frame) => inner.tables[frame][((va.as_u32() >> 12) & 0x3FF) as usize]
                .map(|_| 0),
        }
    }

    fn next_mapped(&self, space: AddrSpace, from: VirtAddr, to: VirtAddr) -> Option<VirtAddr> {
        let inner = self.inner.borrow();
        let dir = inner.spaces.get(&space_root(space))?;
        let mut va = from.as_u32() as u64;
        let to = to.as_u32() as u64;
        while va < to {
            let pde = (va >> 22) as usize;
            match &dir[pde] {
                SimPde::Empty | SimPde::Recursive => {
                    va = ((va >> 22) + 1) << 22;
                }
                SimPde::Huge(_) => return Some(VirtAddr::new(((va >> 22) << 22) as u32)),
                SimPde::Table(frame) => {
                    let table = &inner.tables[frame];
                    let first_slot = ((va >> 12) & 0x3FF) as usize;
                    for slot in first_slot..TABLE_ENTRIES {
                        let slot_va = ((pde as u64) << 22) | ((slot as u64) << 12);
                        if slot_va >= to {
                            return None;
                        }
                        if table[slot].is_some() {
                            return Some(VirtAddr::new(slot_va as u32));
                        }
                    }
                    va = ((va >> 22) + 1) << 22;
                }
            }
        }
        None
    }

    fn frame_addr(&self, space: AddrSpace, va: VirtAddr) -> Option<PhysAddr> {
        self.inner
            .borrow()
            .translate(space_root(space), va)
            .map(PhysAddr::new)
    }

    unsafe fn set_frame_addr(&self, space: AddrSpace, va: VirtAddr, pa: PhysAddr) {
        let mask = match self.page_size_index(space, va) {
            Some(1) => !(HUGE_PAGE_SIZE - 1),
            _ => !(PAGE_SIZE - 1),
        };
        self.inner
            .borrow_mut()
            .edit_entry(space_root(space), va, |e| e.pa = pa.as_u32() & mask);
    }

    fn flags(&self, space: AddrSpace, va: VirtAddr) -> PageFlags {
        self.inner
            .borrow()
            .entry(space_root(space), va)
            .map(|e| e.flags)
            .unwrap_or(PageFlags::empty())
    }

    unsafe fn set_flags(&self, space: AddrSpace, va: VirtAddr, flags: PageFlags) {
        self.inner
            .borrow_mut()
            .edit_entry(space_root(space), va, |e| e.flags = flags);
    }

    fn dirty(&self, space: AddrSpace, va: VirtAddr) -> bool {
        self.inner
            .borrow()
            .entry(space_root(space), va)
            .map(|e| e.dirty)
            .unwrap_or(false)
    }

    unsafe fn set_dirty(&self, space: AddrSpace, va: VirtAddr, dirty: bool) {
        self.inner
            .borrow_mut()
            .edit_entry(space_root(space), va, |e| e.dirty = dirty);
    }

    unsafe fn new_space(&self, template: AddrSpace) -> Result<AddrSpace, VmmError> {
        let mut inner = self.inner.borrow_mut();
        let root = inner.alloc_pool(1).ok_or(VmmError::OutOfMemory)?;
        let template_dir = inner
            .spaces
            .get(&space_root(template))
            .ok_or(VmmError::Unmapped)?;

        let kernel_pde = (self.kernel_start.as_u32() >> 22) as usize;
        let mut dir = vec![SimPde::Empty; TABLE_ENTRIES];
        for (i, e) in template_dir.iter().enumerate().skip(kernel_pde) {
            dir[i] = e.clone();
        }
        dir[(RMAP_BASE >> 22) as usize] = SimPde::Recursive;

        inner.spaces.insert(root, dir);
        Ok(AddrSpace(PhysAddr::new(root * PAGE_SIZE)))
    }

    unsafe fn destroy_space(&self, space: AddrSpace) {
        let mut inner = self.inner.borrow_mut();
        let root = space_root(space);
        let Some(dir) = inner.spaces.remove(&root) else {
            return;
        };
        let kernel_pde = (self.kernel_start.as_u32() >> 22) as usize;
        for pde in dir.iter().take(kernel_pde) {
            if let SimPde::Table(frame) = pde {
                inner.tables.remove(frame);
                inner.free_pool(*frame, 1);
            }
        }
        inner.free_pool(root, 1);
    }

    unsafe fn copy_bytes(&self, dst: VirtAddr, src: VirtAddr, len: usize) {
        let mut inner = self.inner.borrow_mut();
        let current = inner.current;
        for i in 0..len as u32 {
            let src_pa = inner
                .translate(current, src + i)
                .expect("copy_bytes: source unmapped");
            let byte = inner.frame_buf(src_pa / PAGE_SIZE)[(src_pa % PAGE_SIZE) as usize];
            let dst_pa = inner
                .translate(current, dst + i)
                .expect("copy_bytes: destination unmapped");
            inner.frame_buf(dst_pa / PAGE_SIZE)[(dst_pa % PAGE_SIZE) as usize] = byte;
        }
    }
}
