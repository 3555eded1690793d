//! Root System Description Table (RSDT) walking.

use crate::sdt::{SdtHeader, ValidatedTable, load_table};
use crate::{AcpiError, AcpiHandler};

/// RSDT table signature.
pub const RSDT_SIGNATURE: &[u8; 4] = b"RSDT";

/// A loaded RSDT.
pub struct Rsdt {
    table: ValidatedTable,
}

impl Rsdt {
    /// Loads and validates the RSDT at `phys`.
    pub fn load(handler: &impl AcpiHandler, phys: u32) -> Result<Self, AcpiError> {
        Ok(Self {
            table: load_table(handler, phys, RSDT_SIGNATURE)?,
        })
    }

    /// Iterates over the physical addresses of the referenced tables.
    pub fn entries(&self) -> impl Iterator<Item = u32> + '_ {
        let payload = &self.table.data[SdtHeader::SIZE..];
        payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }

    /// Finds the first referenced table carrying `signature`.
    pub fn find(
        &self,
        handler: &impl AcpiHandler,
        signature: &[u8; 4],
    ) -> Result<u32, AcpiError> {
        for phys in self.entries() {
            // SAFETY: The RSDT references firmware table addresses.
            let head = unsafe { handler.map_physical_region(phys, 4) };
            if head == signature {
                return Ok(phys);
            }
        }
        Err(AcpiError::TableNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufHandler, seal_checksum};

    #[test]
    fn walks_entries_and_finds_tables() {
        let mut mem = vec![0u8; 0x4000];

        // Target table "APIC" at 0x2000 (header only, for the signature).
        mem[0x2000..0x2004].copy_from_slice(b"APIC");

        // RSDT at 0x1000 with two entries.
        let len = SdtHeader::SIZE + 8;
        let mut rsdt = vec![0u8; len];
        rsdt[..4].copy_from_slice(RSDT_SIGNATURE);
        rsdt[4..8].copy_from_slice(&(len as u32).to_le_bytes());
        rsdt[SdtHeader::SIZE..SdtHeader::SIZE + 4].copy_from_slice(&0x3000u32.to_le_bytes());
        rsdt[SdtHeader::SIZE + 4..SdtHeader::SIZE + 8].copy_from_slice(&0x2000u32.to_le_bytes());
        seal_checksum(&mut rsdt);
        mem[0x1000..0x1000 + len].copy_from_slice(&rsdt);

        let handler = BufHandler::new(mem);
        let rsdt = Rsdt::load(&handler, 0x1000).unwrap();
        assert_eq!(rsdt.entries().collect::<Vec<_>>(), vec![0x3000, 0x2000]);
        assert_eq!(rsdt.find(&handler, b"APIC").unwrap(), 0x2000);
        assert_eq!(
            rsdt.find(&handler, b"HPET").unwrap_err(),
            AcpiError::TableNotFound
        );
    }
}
