//! Page-trap arena.
//!
//! A trap marks a page whose next faulting access must be handled by the
//! kernel. Copy-on-write is the only trap kind: each CoW relation is a
//! *pair* of records, one on the source page and one on the destination,
//! referencing each other by arena index.
//!
//! Records live in a growable table; `None`-kind entries are tombstones and
//! are reused before the table grows. The arena itself is plain data; the
//! engine wraps it in the traps mutex.

use alloc::vec::Vec;

use muon_core::addr::VirtAddr;

use crate::mapper::AddrSpace;

/// Index of a trap record in the arena.
pub type TrapId = usize;

/// What kind of intervention a trap requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// Tombstone; slot is reusable.
    None,
    /// Copy-on-write; `pair` is the record on the other side.
    Cow,
}

/// A single trap record.
#[derive(Debug, Clone, Copy)]
pub struct PageTrap {
    /// Trap kind; `None` marks a free slot.
    pub kind: TrapKind,
    /// Address space the trapped page lives in.
    pub space: AddrSpace,
    /// Page-aligned virtual address of the trapped page.
    pub page: VirtAddr,
    /// Arena index of the paired record (CoW only).
    pub pair: TrapId,
}

const NO_PAIR: TrapId = usize::MAX;

/// The trap table.
#[derive(Default)]
pub struct TrapArena {
    slots: Vec<PageTrap>,
}

impl TrapArena {
    /// Creates an empty arena.
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Inserts a CoW record for `(space, page)`, reusing a tombstone slot
    /// if one exists. The pair link starts unset; use [`link`](Self::link).
    pub fn insert(&mut self, space: AddrSpace, page: VirtAddr) -> TrapId {
        let record = PageTrap {
            kind: TrapKind::Cow,
            space,
            page,
            pair: NO_PAIR,
        };
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.kind == TrapKind::None {
                *slot = record;
                return i;
            }
        }
        self.slots.push(record);
        self.slots.len() - 1
    }

    /// Links two records as a CoW pair.
    pub fn link(&mut self, a: TrapId, b: TrapId) {
        self.slots[a].pair = b;
        self.slots[b].pair = a;
    }

    /// Tombstones a record.
    pub fn remove(&mut self, id: TrapId) {
        if let Some(slot) = self.slots.get_mut(id) {
            slot.kind = TrapKind::None;
            slot.pair = NO_PAIR;
        }
    }

    /// Returns a copy of the record at `id` if it is live.
    pub fn get(&self, id: TrapId) -> Option<PageTrap> {
        self.slots
            .get(id)
            .filter(|t| t.kind != TrapKind::None)
            .copied()
    }

    /// Finds the first live CoW record on `(space, page)`.
    pub fn find_cow(&self, space: AddrSpace, page: VirtAddr) -> Option<TrapId> {
        self.slots
            .iter()
            .position(|t| t.kind == TrapKind::Cow && t.space == space && t.page == page)
    }

    /// Finds a live CoW record on `(space, page)` other than `exclude`.
    pub fn find_cow_excluding(
        &self,
        space: AddrSpace,
        page: VirtAddr,
        exclude: TrapId,
    ) -> Option<TrapId> {
        self.slots.iter().enumerate().position(|(i, t)| {
            i != exclude && t.kind == TrapKind::Cow && t.space == space && t.page == page
        })
    }

    /// Number of slots (live and tombstoned). Iteration bound for
    /// teardown walks.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the arena has no live records.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|t| t.kind == TrapKind::None)
    }

    /// Number of live records.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|t| t.kind != TrapKind::None)
            .count()
    }
}
