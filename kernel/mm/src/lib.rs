//! Muon memory management.
//!
//! Core memory-management data structures and algorithms, kept free of
//! hardware access so the whole crate runs under `cargo test` on the host:
//!
//! - [`pmm`]: bitmap physical frame allocator.
//! - [`mapper`]: the [`PageTables`](mapper::PageTables) seam between the
//!   generic engine and an architecture's page-table implementation.
//! - [`trap`]: the page-trap arena (copy-on-write bookkeeping).
//! - [`vmm`]: the generic virtual memory engine: region map/unmap,
//!   free-range search, address-space cloning with CoW, page-fault triage,
//!   and deferred address-space reclamation.
//!
//! The kernel crate provides the recursive-mapping x86 implementation of
//! the seam; the tests here provide a simulated one.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod mapper;
pub mod pmm;
pub mod trap;
pub mod vmm;

pub use mapper::{AddrSpace, PageFlags, PageTables, VmmError};
pub use pmm::{FrameBitmap, PmmError};
pub use vmm::Vmm;

#[cfg(test)]
pub(crate) mod sim;
