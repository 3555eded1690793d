//! Root System Description Pointer (RSDP) discovery.
//!
//! On legacy BIOS systems the RSDP lives on a 16-byte boundary either in
//! the first kilobyte of the EBDA or in the BIOS ROM window
//! `[0xE0000, 0xFFFFF]`.

use crate::{AcpiError, AcpiHandler, read_u32};

/// RSDP signature: `"RSD PTR "`.
const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

/// Length of the ACPI 1.0 RSDP structure.
const RSDP_V1_LEN: usize = 20;

/// Physical address word holding the EBDA segment.
const EBDA_POINTER: u32 = 0x040E;

/// BIOS ROM search window.
const BIOS_ROM: (u32, u32) = (0xE_0000, 0xF_FFFF);

/// The Root System Description Pointer.
#[derive(Debug, Clone, Copy)]
pub struct Rsdp {
    /// ACPI revision (0 for 1.0, 2 for 2.0+).
    pub revision: u8,
    /// Physical address of the RSDT.
    pub rsdt_address: u32,
}

impl Rsdp {
    /// Parses and validates an RSDP candidate at `phys`.
    fn parse(handler: &impl AcpiHandler, phys: u32) -> Option<Self> {
        // SAFETY: The candidate address lies in a BIOS search area.
        let data = unsafe { handler.map_physical_region(phys, RSDP_V1_LEN) };
        if &data[..8] != RSDP_SIGNATURE {
            return None;
        }
        if data.iter().fold(0u8, |s, b| s.wrapping_add(*b)) != 0 {
            return None;
        }
        Some(Self {
            revision: data[15],
            rsdt_address: read_u32(data, 16)?,
        })
    }

    /// Searches the EBDA and the BIOS ROM window for the RSDP.
    pub fn search(handler: &impl AcpiHandler) -> Result<Self, AcpiError> {
        // SAFETY: The BDA is always mapped on PC systems.
        let bda = unsafe { handler.map_physical_region(EBDA_POINTER, 2) };
        let ebda = u32::from(u16::from_le_bytes([bda[0], bda[1]])) << 4;
        if ebda != 0 {
            let mut phys = ebda;
            while phys < ebda + 1024 {
                if let Some(rsdp) = Self::parse(handler, phys) {
                    return Ok(rsdp);
                }
                phys += 16;
            }
        }

        let mut phys = BIOS_ROM.0;
        while phys < BIOS_ROM.1 {
            if let Some(rsdp) = Self::parse(handler, phys) {
                return Ok(rsdp);
            }
            phys += 16;
        }

        Err(AcpiError::RsdpNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::BufHandler;

    fn rsdp_bytes(rsdt: u32) -> [u8; RSDP_V1_LEN] {
        let mut raw = [0u8; RSDP_V1_LEN];
        raw[..8].copy_from_slice(RSDP_SIGNATURE);
        raw[15] = 0; // ACPI 1.0
        raw[16..20].copy_from_slice(&rsdt.to_le_bytes());
        let sum: u8 = raw.iter().fold(0u8, |a, b| a.wrapping_add(*b));
        raw[8] = 0u8.wrapping_sub(sum);
        raw
    }

    #[test]
    fn finds_rsdp_in_bios_rom() {
        let mut mem = vec![0u8; 0x10_0000];
        mem[0xE_4560..0xE_4560 + RSDP_V1_LEN].copy_from_slice(&rsdp_bytes(0x1234_5678));
        let handler = BufHandler::new(mem);

        let rsdp = Rsdp::search(&handler).unwrap();
        assert_eq!(rsdp.rsdt_address, 0x1234_5678);
        assert_eq!(rsdp.revision, 0);
    }

    #[test]
    fn finds_rsdp_in_ebda() {
        let mut mem = vec![0u8; 0x10_0000];
        // EBDA at segment 0x9FC0 -> 0x9FC00.
        mem[EBDA_POINTER as usize..EBDA_POINTER as usize + 2]
            .copy_from_slice(&0x9FC0u16.to_le_bytes());
        mem[0x9_FC30..0x9_FC30 + RSDP_V1_LEN].copy_from_slice(&rsdp_bytes(0xAABB_0000));
        let handler = BufHandler::new(mem);

        assert_eq!(Rsdp::search(&handler).unwrap().rsdt_address, 0xAABB_0000);
    }

    #[test]
    fn bad_checksum_is_skipped() {
        let mut mem = vec![0u8; 0x10_0000];
        let mut raw = rsdp_bytes(0x1000);
        raw[8] = raw[8].wrapping_add(1);
        mem[0xE_0000..0xE_0000 + RSDP_V1_LEN].copy_from_slice(&raw);
        let handler = BufHandler::new(mem);

        assert_eq!(Rsdp::search(&handler).unwrap_err(), AcpiError::RsdpNotFound);
    }
}
