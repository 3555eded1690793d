//! The flat interrupt-topology result table the kernel consumes.
//!
//! Whether this comes from the ACPI MADT or (on very old machines) Intel
//! MP configuration tables is this crate's concern; the interrupt routing
//! core only ever sees the collected result.

use alloc::vec::Vec;

use crate::madt::{Madt, MadtEntry};
use crate::rsdp::Rsdp;
use crate::rsdt::Rsdt;
use crate::{AcpiError, AcpiHandler};

/// One CPU as enumerated by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuEntry {
    /// Local APIC id.
    pub apic_id: u8,
    /// Whether the CPU is usable.
    pub enabled: bool,
}

/// One I/O APIC and the GSI range it serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoApicEntry {
    /// MMIO base of the register window.
    pub address: u32,
    /// First GSI routed through this controller.
    pub gsi_base: u32,
}

/// A legacy-IRQ to GSI override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceOverride {
    /// ISA IRQ line.
    pub irq: u8,
    /// GSI the line actually raises.
    pub gsi: u32,
    /// Active low instead of active high.
    pub active_low: bool,
    /// Level triggered instead of edge triggered.
    pub level_triggered: bool,
}

/// A non-maskable interrupt source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmiEntry {
    /// GSI wired to NMI.
    pub gsi: u32,
    /// Active low instead of active high.
    pub active_low: bool,
    /// Level triggered instead of edge triggered.
    pub level_triggered: bool,
}

/// A local APIC LINT pin wired to NMI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LintNmiEntry {
    /// ACPI processor UID (0xFF means all processors).
    pub acpi_processor_id: u8,
    /// LINT pin (0 or 1).
    pub lint: u8,
}

/// Everything the interrupt routing core needs to know about the
/// machine's interrupt controllers.
#[derive(Debug, Default)]
pub struct InterruptTopology {
    /// Local APIC MMIO base (override applied if present).
    pub lapic_base: u32,
    /// Enumerated CPUs. Only the bootstrap CPU is started.
    pub cpus: Vec<CpuEntry>,
    /// I/O APICs, in firmware order.
    pub io_apics: Vec<IoApicEntry>,
    /// Legacy-IRQ source overrides.
    pub overrides: Vec<SourceOverride>,
    /// GSI-routed NMI sources.
    pub nmis: Vec<NmiEntry>,
    /// LINT pins wired to NMI.
    pub lint_nmis: Vec<LintNmiEntry>,
    /// Whether dual 8259 PICs are present and must be masked.
    pub pcat_compat: bool,
}

/// MPS INTI polarity: bits 0..2, value 3 = active low.
fn inti_active_low(flags: u16) -> bool {
    flags & 0x3 == 0x3
}

/// MPS INTI trigger mode: bits 2..4, value 3 = level.
fn inti_level(flags: u16) -> bool {
    (flags >> 2) & 0x3 == 0x3
}

impl InterruptTopology {
    /// Discovers the topology from ACPI: RSDP search, RSDT walk, MADT
    /// parse.
    pub fn from_acpi(handler: &impl AcpiHandler) -> Result<Self, AcpiError> {
        let rsdp = Rsdp::search(handler)?;
        let rsdt = Rsdt::load(handler, rsdp.rsdt_address)?;
        let madt_phys = rsdt.find(handler, crate::madt::MADT_SIGNATURE)?;
        let madt = Madt::load(handler, madt_phys)?;
        Ok(Self::from_madt(&madt))
    }

    /// Collects the topology out of a parsed MADT.
    pub fn from_madt(madt: &Madt) -> Self {
        let mut topo = Self {
            lapic_base: madt.local_apic_address,
            pcat_compat: madt.flags & crate::madt::MADT_PCAT_COMPAT != 0,
            ..Self::default()
        };

        for entry in madt.entries() {
            match entry {
                MadtEntry::LocalApic { apic_id, flags, .. } => {
                    topo.cpus.push(CpuEntry {
                        apic_id,
                        enabled: flags & 1 != 0,
                    });
                }
                MadtEntry::IoApic {
                    io_apic_address,
                    gsi_base,
                    ..
                } => {
                    topo.io_apics.push(IoApicEntry {
                        address: io_apic_address,
                        gsi_base,
                    });
                }
                MadtEntry::InterruptSourceOverride { source, gsi, flags } => {
                    topo.overrides.push(SourceOverride {
                        irq: source,
                        gsi,
                        active_low: inti_active_low(flags),
                        level_triggered: inti_level(flags),
                    });
                }
                MadtEntry::NmiSource { flags, gsi } => {
                    topo.nmis.push(NmiEntry {
                        gsi,
                        active_low: inti_active_low(flags),
                        level_triggered: inti_level(flags),
                    });
                }
                MadtEntry::LocalApicNmi {
                    acpi_processor_id,
                    lint,
                    ..
                } => {
                    topo.lint_nmis.push(LintNmiEntry {
                        acpi_processor_id,
                        lint,
                    });
                }
                MadtEntry::LocalApicAddressOverride { address } => {
                    topo.lapic_base = address as u32;
                }
                MadtEntry::Unknown { .. } => {}
            }
        }
        topo
    }

    /// The defaulted topology used when ACPI is disabled or absent: one
    /// I/O APIC at the architectural address serving GSIs from 0, PIC
    /// compatibility assumed.
    pub fn fallback() -> Self {
        Self {
            lapic_base: 0xFEE0_0000,
            cpus: Vec::new(),
            io_apics: alloc::vec![IoApicEntry {
                address: 0xFEC0_0000,
                gsi_base: 0,
            }],
            overrides: Vec::new(),
            nmis: Vec::new(),
            lint_nmis: Vec::new(),
            pcat_compat: true,
        }
    }
}
