//! Global virtual memory manager.
//!
//! Instantiates the generic engine over the recursive page tables,
//! adopting the address space the boot stub built, and routes CPU page
//! faults into it.

use muon_core::addr::VirtAddr;
use muon_core::sync::InitOnce;
use muon_mm::mapper::PageFlags;
use muon_mm::vmm::Vmm;

use crate::arch::x86::paging::RecursiveTables;
use crate::config::{KERNEL_BASE, SCRATCH_BASE, SCRATCH_END};
use crate::kdebug;

static VMM: InitOnce<Vmm<RecursiveTables>> = InitOnce::new();

/// Page-fault error-code bit 1: the access was a write.
const FAULT_WRITE: u32 = 1 << 1;
/// Page-fault error-code bit 2: the access came from user mode.
const FAULT_USER: u32 = 1 << 2;
/// Page-fault error-code bit 0: the page was present.
const FAULT_PRESENT: u32 = 1 << 0;

/// Builds the engine around the boot address space.
///
/// # Safety
///
/// Must run once, after the PMM is initialized, on the boot page tables
/// (recursive slot installed by the boot stub).
pub unsafe fn init() {
    let tables = RecursiveTables::new();
    let kernel_space = tables.current();
    // SAFETY: Single boot call, PMM live, current space is the kernel's.
    unsafe {
        tables
            .init_transients()
            .expect("vmm: cannot allocate the transient window table");
    }

    VMM.init(Vmm::new(
        tables,
        kernel_space,
        VirtAddr::new(KERNEL_BASE),
        (VirtAddr::new(SCRATCH_BASE), VirtAddr::new(SCRATCH_END)),
    ));
    kdebug!("vmm: engine up, kernel space {:?}", kernel_space.root());
}

/// Registers the boot space in the propagation registry. Runs after the
/// heap is up (the registry allocates); until then the kernel space is
/// the only live space and there is nothing to propagate to.
pub fn register_boot_space() {
    let vmm = VMM.get();
    vmm.tables().adopt_boot_space(vmm.kernel_space());
}

/// The global VMM.
pub fn vmm() -> &'static Vmm<RecursiveTables> {
    VMM.get()
}

/// CPU page-fault triage. Returns `true` if the fault was resolved and
/// the instruction may retry.
pub fn handle_page_fault(vaddr: u32, error_code: u32) -> bool {
    let Some(vmm) = VMM.try_get() else {
        return false;
    };

    let mut access = PageFlags::empty();
    if error_code & FAULT_WRITE != 0 {
        access |= PageFlags::WRITABLE;
    }
    if error_code & FAULT_USER != 0 {
        access |= PageFlags::USER;
    }
    if error_code & FAULT_PRESENT != 0 {
        access |= PageFlags::PRESENT;
    }

    // SAFETY: Called on the fault path with the faulting space current.
    unsafe { vmm.handle_fault(VirtAddr::new(vaddr), access) }
}
