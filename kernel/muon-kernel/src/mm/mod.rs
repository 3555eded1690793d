//! Memory management glue.
//!
//! The algorithms live in `muon-mm`; this module wires them to the
//! machine: the frame bitmap over the loader's memory map, the global
//! VMM over the recursive page tables, and the heap over both.

pub mod heap;
pub mod pmm;
pub mod vmm;
