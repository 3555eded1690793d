//! Boot information and the kernel initialization sequence.
//!
//! The multiboot2 loader hands over a physical pointer to its info
//! structure; [`MultibootInfo`] adapts it to the small [`BootInfo`]
//! surface the kernel consumes (memory map, command line, modules), and
//! [`kernel_init`] runs the bring-up in dependency order: CPU tables,
//! PMM, VMM, heap, command line, interrupt routing, timer, processes.

use muon_core::addr::VirtAddr;

use crate::arch;
use crate::cmdline::{CMDLINE, CmdLine};
use crate::config::{KERNEL_BASE, TASK_INITIAL_STACK_SIZE};
use crate::{interrupts, kerror, kinfo, log, mm, proc, sched, time};

/// What a memory-map region is good for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Usable RAM.
    Available,
    /// Firmware-reserved or otherwise untouchable.
    Reserved,
}

/// One region of the loader-provided physical memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: u32,
    /// Size in bytes.
    pub size: u32,
    /// Usability.
    pub kind: MemoryRegionKind,
}

/// The boot-protocol surface the kernel consumes.
pub trait BootInfo {
    /// The physical memory map.
    fn memory_map(&self) -> impl Iterator<Item = MemoryRegion> + '_;
    /// The kernel command line.
    fn cmdline(&self) -> &str;
    /// A boot module by its command line, as a byte slice.
    fn module(&self, name: &str) -> Option<&'static [u8]>;
}

/// [`BootInfo`] over a multiboot2 information structure.
pub struct MultibootInfo {
    info: multiboot2::BootInformation<'static>,
}

impl MultibootInfo {
    /// Parses the loader-provided structure.
    ///
    /// # Safety
    ///
    /// `addr` must be the (mapped) multiboot2 info address handed to the
    /// kernel entry point.
    pub unsafe fn load(addr: usize) -> Option<Self> {
        // SAFETY: Per contract, the structure is mapped and valid.
        let info = unsafe {
            multiboot2::BootInformation::load(addr as *const multiboot2::BootInformationHeader)
        }
        .ok()?;
        Some(Self { info })
    }
}

impl BootInfo for MultibootInfo {
    fn memory_map(&self) -> impl Iterator<Item = MemoryRegion> + '_ {
        self.info
            .memory_map_tag()
            .into_iter()
            .flat_map(|tag| tag.memory_areas().iter())
            .map(|area| MemoryRegion {
                start: area.start_address() as u32,
                size: area.size() as u32,
                kind: if area.typ() == multiboot2::MemoryAreaType::Available {
                    MemoryRegionKind::Available
                } else {
                    MemoryRegionKind::Reserved
                },
            })
    }

    fn cmdline(&self) -> &str {
        self.info
            .command_line_tag()
            .and_then(|tag| tag.cmdline().ok())
            .unwrap_or("")
    }

    fn module(&self, name: &str) -> Option<&'static [u8]> {
        for module in self.info.module_tags() {
            if module.cmdline() == Ok(name) {
                let start = module.start_address() as usize;
                let len = (module.end_address() - module.start_address()) as usize;
                // SAFETY: The loader placed the module at this physical
                // range, identity-covered by the boot mapping.
                return Some(unsafe { core::slice::from_raw_parts(start as *const u8, len) });
            }
        }
        None
    }
}

unsafe extern "C" {
    /// Top of the boot stack, from the linker script.
    static __boot_stack_top: u8;
}

/// Brings the kernel up and becomes the idle loop of the kernel task.
///
/// # Safety
///
/// Must be the first and only call after the boot stub establishes the
/// higher-half mapping; `mb_ptr` must point at the multiboot2 info.
pub unsafe fn kernel_init(mb_ptr: usize) -> ! {
    log::init_early_serial();
    kinfo!("muon: booting");

    // SAFETY: Single boot call, interrupts disabled by the stub.
    unsafe { arch::cpu_init() };

    let boot_info = match unsafe { MultibootInfo::load(mb_ptr) } {
        Some(info) => info,
        None => {
            kerror!("boot: bad multiboot2 info at {:#x}", mb_ptr);
            crate::arch::x86::instructions::interrupts::halt_forever();
        }
    };

    mm::pmm::init(&boot_info);
    // SAFETY: PMM is live; we run on the boot page tables.
    unsafe { mm::vmm::init() };
    // SAFETY: PMM and VMM are live.
    unsafe { mm::heap::init() };
    mm::vmm::register_boot_space();
    log::init_logger();

    // The command line needs the heap, so it parses late; options that
    // matter earlier (none today) would need the early pass.
    let cmdline = CmdLine::parse(boot_info.cmdline());
    log::route_stderr(cmdline.stderr_route());
    let acpi_on = cmdline.acpi_enabled();
    CMDLINE.init(cmdline);

    // The VFS layer above this core mounts it; the kernel only locates
    // it.
    if let Some(initrd) = boot_info.module("/initrd.tar") {
        kinfo!("boot: initrd module, {} bytes", initrd.len());
    }

    // SAFETY: Boot thread, interrupts still disabled.
    unsafe { interrupts::init() };

    proc::init();
    let boot_stack_top = VirtAddr::new(unsafe { core::ptr::addr_of!(__boot_stack_top) } as u32);
    sched::init(boot_stack_top, TASK_INITIAL_STACK_SIZE);

    // The PIT drives the tick from here on.
    interrupts::handle(0, time::pit_tick);
    // SAFETY: Handler registered before the line opens.
    unsafe { arch::x86::pit::init() };
    interrupts::unmask(0);

    if acpi_on {
        match muon_acpi::topology::InterruptTopology::from_acpi(&AcpiMapper) {
            Ok(topology) => {
                // SAFETY: Boot thread, heap live, interrupts masked at
                // the controllers.
                unsafe { interrupts::apic_init(&topology) };
                time::adopt_lapic_timer();
            }
            Err(e) => {
                kerror!("acpi: discovery failed ({:?}); staying on the PIC", e);
            }
        }
    } else {
        kinfo!("acpi: disabled on the command line");
    }

    kinfo!(
        "muon: up, {} free frames, kernel base {:#010x}",
        mm::pmm::with(|pmm| pmm.free_frames()),
        KERNEL_BASE
    );

    // The kernel task becomes the idle task.
    loop {
        // SAFETY: Interrupt routing is fully initialized.
        unsafe { arch::x86::instructions::interrupts::enable_and_hlt() };
        sched::yield_now();
    }
}

/// Maps ACPI tables for the parser. The low physical ranges the tables
/// live in are covered by the boot identity window in the kernel
/// region.
struct AcpiMapper;

// SAFETY: Firmware tables live in the low ranges mapped at boot; the
// returned slices reference that static mapping.
unsafe impl muon_acpi::AcpiHandler for AcpiMapper {
    unsafe fn map_physical_region(&self, phys: u32, size: usize) -> &'static [u8] {
        // The boot stub keeps the first 16 MiB mapped at KERNEL_BASE;
        // ACPI tables above that are mapped on demand.
        if (phys as u64 + size as u64) <= 16 * 1024 * 1024 {
            // SAFETY: Inside the permanent low window.
            return unsafe {
                core::slice::from_raw_parts((KERNEL_BASE + phys) as *const u8, size)
            };
        }
        let vmm = mm::vmm::vmm();
        let flags = muon_mm::mapper::PageFlags::PRESENT | muon_mm::mapper::PageFlags::CACHED;
        // SAFETY: Firmware table address; mapped read-only into the MMIO
        // window and intentionally left in place (tables are read for
        // the life of the kernel).
        let mapped = unsafe {
            vmm.alloc_map(
                vmm.kernel_space(),
                muon_core::addr::PhysAddr::new(phys),
                size as u32,
                VirtAddr::new(crate::config::MMIO_BASE),
                VirtAddr::new(crate::config::MMIO_END),
                0,
                0,
                false,
                flags,
            )
        };
        match mapped {
            // SAFETY: Just mapped with at least `size` bytes.
            Ok(va) => unsafe { core::slice::from_raw_parts(va.as_ptr::<u8>(), size) },
            Err(_) => &[],
        }
    }
}
