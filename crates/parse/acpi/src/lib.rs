//! `muon-acpi`, a standalone `no_std` ACPI table parser.
//!
//! Parses the tables the interrupt routing core consumes during early
//! boot: RSDP, RSDT, and MADT. The output is a flat
//! [`InterruptTopology`](topology::InterruptTopology): CPU APIC ids,
//! I/O APICs with their GSI bases, legacy-IRQ source overrides, NMI
//! sources, and the LAPIC base override. Whether the kernel wires its
//! interrupt controllers from this or from a defaulted fallback is the
//! consumer's concern.
//!
//! Physical memory is reached through an [`AcpiHandler`] that maps regions
//! on demand; host tests back it with plain byte buffers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod madt;
pub mod rsdp;
pub mod rsdt;
pub mod sdt;
pub mod topology;

pub use madt::{Madt, MadtEntry};
pub use rsdp::Rsdp;
pub use sdt::SdtHeader;
pub use topology::InterruptTopology;

/// Errors that can occur during ACPI table parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// The checksum of a table or the RSDP did not validate (sum != 0).
    InvalidChecksum,
    /// The table signature did not match the expected value.
    InvalidSignature,
    /// A table with the requested signature was not found in the RSDT.
    TableNotFound,
    /// No RSDP was found in the BIOS search areas.
    RsdpNotFound,
    /// A table or structure was too short to contain the expected data.
    TruncatedData,
}

/// Trait for mapping physical memory regions so ACPI tables can be read.
///
/// # Safety
///
/// Implementors must return a slice that is valid and readable for the
/// requested `size` bytes and remains valid for `'static`.
pub unsafe trait AcpiHandler {
    /// Maps a physical memory region and returns a byte slice over it.
    ///
    /// # Safety
    ///
    /// `phys` must be a firmware-provided table address and `size` must
    /// not extend beyond it.
    unsafe fn map_physical_region(&self, phys: u32, size: usize) -> &'static [u8];
}

/// Reads a little-endian `u16` at `offset`.
pub(crate) fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Reads a little-endian `u32` at `offset`.
pub(crate) fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::AcpiHandler;

    /// Test handler backed by a flat "physical memory" buffer.
    pub struct BufHandler {
        pub mem: &'static [u8],
    }

    impl BufHandler {
        pub fn new(mem: Vec<u8>) -> Self {
            Self {
                mem: Box::leak(mem.into_boxed_slice()),
            }
        }
    }

    // SAFETY: The buffer is leaked, so slices stay valid for 'static.
    unsafe impl AcpiHandler for BufHandler {
        unsafe fn map_physical_region(&self, phys: u32, size: usize) -> &'static [u8] {
            &self.mem[phys as usize..phys as usize + size]
        }
    }

    /// Fixes up a table's checksum byte (offset 9 of the SDT header).
    pub fn seal_checksum(table: &mut [u8]) {
        table[9] = 0;
        let sum: u8 = table.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        table[9] = 0u8.wrapping_sub(sum);
    }
}
