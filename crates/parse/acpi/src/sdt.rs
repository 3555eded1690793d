//! System Description Table (SDT) header and checksum utilities.

use crate::{AcpiError, AcpiHandler, read_u32};

/// Standard 36-byte ACPI System Description Table header, present at the
/// start of every table (RSDT, MADT, FADT, ...).
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    /// 4-byte ASCII signature identifying the table type.
    pub signature: [u8; 4],
    /// Total length of the table, including the header, in bytes.
    pub length: u32,
    /// Revision of the table structure.
    pub revision: u8,
}

impl SdtHeader {
    /// The size of an SDT header in bytes.
    pub const SIZE: usize = 36;

    /// Reads an `SdtHeader` from a byte slice.
    ///
    /// Returns `None` if the slice is shorter than [`SdtHeader::SIZE`].
    #[must_use]
    pub fn read_from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            signature: [data[0], data[1], data[2], data[3]],
            length: read_u32(data, 4)?,
            revision: data[8],
        })
    }
}

/// Mapped ACPI table data with a validated header.
#[derive(Debug)]
pub struct ValidatedTable {
    /// The validated SDT header.
    pub header: SdtHeader,
    /// The full table data (including header), checksum-validated.
    pub data: &'static [u8],
}

/// Maps and validates an ACPI table at the given physical address.
///
/// Performs the standard sequence: map the header to learn the length,
/// verify the signature, map the full table, validate the checksum.
///
/// # Errors
///
/// [`AcpiError::TruncatedData`] if the header cannot be read,
/// [`AcpiError::InvalidSignature`] on a signature mismatch,
/// [`AcpiError::InvalidChecksum`] if the byte sum is non-zero.
pub fn load_table(
    handler: &impl AcpiHandler,
    phys: u32,
    expected_signature: &[u8; 4],
) -> Result<ValidatedTable, AcpiError> {
    // SAFETY: Caller provides a firmware table physical address.
    let header_data = unsafe { handler.map_physical_region(phys, SdtHeader::SIZE) };
    let header = SdtHeader::read_from_bytes(header_data).ok_or(AcpiError::TruncatedData)?;

    if &header.signature != expected_signature {
        return Err(AcpiError::InvalidSignature);
    }
    if (header.length as usize) < SdtHeader::SIZE {
        return Err(AcpiError::TruncatedData);
    }

    // SAFETY: The length comes from the validated header.
    let data = unsafe { handler.map_physical_region(phys, header.length as usize) };
    if !validate_checksum(data) {
        return Err(AcpiError::InvalidChecksum);
    }

    Ok(ValidatedTable { header, data })
}

/// ACPI tables sum to zero (mod 256) over all bytes.
#[must_use]
pub fn validate_checksum(data: &[u8]) -> bool {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
}
