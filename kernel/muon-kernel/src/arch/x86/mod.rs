//! x86 (32-bit protected mode) port.

pub mod apic;
pub mod context;
pub mod exceptions;
pub mod gdt;
pub mod idt;
pub mod instructions;
pub mod paging;
pub mod pic;
pub mod pit;
pub mod serial;

pub use instructions::Port;

/// Early CPU setup: GDT (with TSS) and IDT.
///
/// # Safety
///
/// Must run once, first thing after boot, with interrupts disabled.
pub unsafe fn cpu_init() {
    // SAFETY: Single-threaded boot, interrupts disabled.
    unsafe {
        gdt::init();
        idt::init();
    }
}
