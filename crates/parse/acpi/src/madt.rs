//! Multiple APIC Description Table (MADT) parsing.
//!
//! The MADT describes the interrupt controller topology of the system:
//! local APICs, I/O APICs, legacy interrupt source overrides, and NMI
//! sources. Entries are variable-length records introduced by a
//! `(type, length)` byte pair.

use crate::sdt::{SdtHeader, ValidatedTable, load_table};
use crate::{AcpiError, AcpiHandler, read_u16, read_u32};

/// MADT table signature (`b"APIC"`).
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// MADT flags bit 0: dual 8259 PICs are installed.
pub const MADT_PCAT_COMPAT: u32 = 1 << 0;

/// Parsed MADT table.
pub struct Madt {
    /// Physical address of the local APIC.
    pub local_apic_address: u32,
    /// MADT flags.
    pub flags: u32,
    /// Byte slice covering the entry records.
    entries_data: &'static [u8],
}

impl Madt {
    /// Size of the fixed MADT fields after the SDT header.
    const FIELDS_SIZE: usize = 8;

    /// Loads and validates the MADT at `phys`.
    pub fn load(handler: &impl AcpiHandler, phys: u32) -> Result<Self, AcpiError> {
        let ValidatedTable { data, .. } = load_table(handler, phys, MADT_SIGNATURE)?;

        let local_apic_address =
            read_u32(data, SdtHeader::SIZE).ok_or(AcpiError::TruncatedData)?;
        let flags = read_u32(data, SdtHeader::SIZE + 4).ok_or(AcpiError::TruncatedData)?;
        let entries_data = data
            .get(SdtHeader::SIZE + Self::FIELDS_SIZE..)
            .unwrap_or(&[]);

        Ok(Self {
            local_apic_address,
            flags,
            entries_data,
        })
    }

    /// Iterates over the interrupt controller entries.
    pub fn entries(&self) -> MadtEntryIter<'_> {
        MadtEntryIter {
            data: self.entries_data,
        }
    }
}

/// A single MADT interrupt controller structure entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadtEntry {
    /// Type 0: Processor Local APIC.
    LocalApic {
        /// ACPI processor UID.
        acpi_processor_id: u8,
        /// The processor's local APIC id.
        apic_id: u8,
        /// Bit 0: enabled; bit 1: online capable.
        flags: u32,
    },
    /// Type 1: I/O APIC.
    IoApic {
        /// The I/O APIC id.
        io_apic_id: u8,
        /// Physical address of the I/O APIC registers.
        io_apic_address: u32,
        /// Global System Interrupt base for this I/O APIC.
        gsi_base: u32,
    },
    /// Type 2: Interrupt Source Override.
    InterruptSourceOverride {
        /// ISA source IRQ number.
        source: u8,
        /// GSI this source actually raises.
        gsi: u32,
        /// MPS INTI flags (polarity in bits 0..2, trigger in bits 2..4).
        flags: u16,
    },
    /// Type 3: Non-Maskable Interrupt Source.
    NmiSource {
        /// MPS INTI flags.
        flags: u16,
        /// GSI of the NMI source.
        gsi: u32,
    },
    /// Type 4: Local APIC NMI (LINT pin wiring).
    LocalApicNmi {
        /// ACPI processor UID (0xFF means all processors).
        acpi_processor_id: u8,
        /// MPS INTI flags.
        flags: u16,
        /// LINT pin (0 or 1).
        lint: u8,
    },
    /// Type 5: Local APIC Address Override.
    LocalApicAddressOverride {
        /// 64-bit LAPIC physical address; only the low half is usable in
        /// protected mode.
        address: u64,
    },
    /// An entry type that is not parsed.
    Unknown {
        /// The entry type byte.
        entry_type: u8,
    },
}

/// Iterator over MADT entries.
pub struct MadtEntryIter<'a> {
    data: &'a [u8],
}

impl Iterator for MadtEntryIter<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<MadtEntry> {
        if self.data.len() < 2 {
            return None;
        }
        let entry_type = self.data[0];
        let len = self.data[1] as usize;
        if len < 2 || len > self.data.len() {
            return None; // malformed; stop iterating
        }
        let rec = &self.data[..len];
        self.data = &self.data[len..];

        let entry = match entry_type {
            0 if len >= 8 => MadtEntry::LocalApic {
                acpi_processor_id: rec[2],
                apic_id: rec[3],
                flags: read_u32(rec, 4)?,
            },
            1 if len >= 12 => MadtEntry::IoApic {
                io_apic_id: rec[2],
                io_apic_address: read_u32(rec, 4)?,
                gsi_base: read_u32(rec, 8)?,
            },
            2 if len >= 10 => MadtEntry::InterruptSourceOverride {
                source: rec[3],
                gsi: read_u32(rec, 4)?,
                flags: read_u16(rec, 8)?,
            },
            3 if len >= 8 => MadtEntry::NmiSource {
                flags: read_u16(rec, 2)?,
                gsi: read_u32(rec, 4)?,
            },
            4 if len >= 6 => MadtEntry::LocalApicNmi {
                acpi_processor_id: rec[2],
                flags: read_u16(rec, 3)?,
                lint: rec[5],
            },
            5 if len >= 12 => MadtEntry::LocalApicAddressOverride {
                address: u64::from(read_u32(rec, 4)?)
                    | (u64::from(read_u32(rec, 8)?) << 32),
            },
            t => MadtEntry::Unknown { entry_type: t },
        };
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BufHandler, seal_checksum};

    /// Builds a MADT with the given entry records appended.
    fn build_madt(entries: &[&[u8]]) -> Vec<u8> {
        let body: Vec<u8> = entries.concat();
        let len = SdtHeader::SIZE + Madt::FIELDS_SIZE + body.len();
        let mut t = vec![0u8; len];
        t[..4].copy_from_slice(MADT_SIGNATURE);
        t[4..8].copy_from_slice(&(len as u32).to_le_bytes());
        t[SdtHeader::SIZE..SdtHeader::SIZE + 4].copy_from_slice(&0xFEE0_0000u32.to_le_bytes());
        t[SdtHeader::SIZE + 4..SdtHeader::SIZE + 8].copy_from_slice(&MADT_PCAT_COMPAT.to_le_bytes());
        t[SdtHeader::SIZE + Madt::FIELDS_SIZE..].copy_from_slice(&body);
        seal_checksum(&mut t);
        t
    }

    #[test]
    fn parses_the_common_entry_types() {
        let lapic = [0u8, 8, 0, 0xAB, 1, 0, 0, 0];
        let mut ioapic = vec![1u8, 12, 2, 0];
        ioapic.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        ioapic.extend_from_slice(&0u32.to_le_bytes());
        let mut over = vec![2u8, 10, 0, 0];
        over.extend_from_slice(&2u32.to_le_bytes());
        over.extend_from_slice(&0x0003u16.to_le_bytes());
        let unknown = [9u8, 4, 0, 0];

        let handler = BufHandler::new(build_madt(&[&lapic, &ioapic, &over, &unknown]));
        let madt = Madt::load(&handler, 0).unwrap();
        assert_eq!(madt.local_apic_address, 0xFEE0_0000);
        assert!(madt.flags & MADT_PCAT_COMPAT != 0);

        let entries: Vec<MadtEntry> = madt.entries().collect();
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[0],
            MadtEntry::LocalApic {
                acpi_processor_id: 0,
                apic_id: 0xAB,
                flags: 1,
            }
        );
        assert_eq!(
            entries[1],
            MadtEntry::IoApic {
                io_apic_id: 2,
                io_apic_address: 0xFEC0_0000,
                gsi_base: 0,
            }
        );
        assert_eq!(
            entries[2],
            MadtEntry::InterruptSourceOverride {
                source: 0,
                gsi: 2,
                flags: 0x0003,
            }
        );
        assert_eq!(entries[3], MadtEntry::Unknown { entry_type: 9 });
    }

    #[test]
    fn truncated_entry_stops_iteration() {
        // Entry claims 12 bytes but only 4 remain.
        let bad = [1u8, 12, 0, 0];
        let handler = BufHandler::new(build_madt(&[&bad]));
        let madt = Madt::load(&handler, 0).unwrap();
        assert_eq!(madt.entries().count(), 0);
    }
}
