//! CPU exception handling.
//!
//! The only exception with a recovery path is the page fault, which is
//! handed to the VMM for copy-on-write resolution. A fault the VMM
//! cannot resolve kills the offending user task; anything else is
//! fatal: registers are dumped and the CPU halts with interrupts
//! disabled.

use crate::arch::x86::instructions::interrupts::halt_forever;
use crate::irq::IrqContext;
use crate::mm::vmm;
use crate::{kerror, kwarn};

const NAMES: [&str; 21] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "SIMD floating point",
    "virtualization",
];

/// Reads the faulting linear address.
fn read_cr2() -> u32 {
    let cr2: u32;
    // SAFETY: Reading CR2 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
    }
    cr2
}

/// Exception entry from the generic dispatcher.
pub fn handle(ctx: &mut IrqContext) {
    let vector = ctx.vector as u8;

    if vector == 14 {
        let vaddr = read_cr2();
        if vmm::handle_page_fault(vaddr, ctx.error_code) {
            return; // resolved; retry the faulting instruction
        }
        if ctx.cs & 3 == 3 {
            // An unresolvable user fault takes down the task, not the
            // kernel.
            kwarn!(
                "page fault at {:#010x} (eip {:#010x}, error {:#x}): killing task",
                vaddr,
                ctx.eip,
                ctx.error_code
            );
            crate::sched::exit_current();
        }
        kerror!(
            "kernel page fault at {:#010x} (eip {:#010x}, error {:#x})",
            vaddr,
            ctx.eip,
            ctx.error_code
        );
        fatal(ctx);
    }

    if vector == 2 {
        // NMI: typically a hardware failure signal; record it and keep
        // running.
        kwarn!("non-maskable interrupt");
        return;
    }

    let name = NAMES.get(vector as usize).copied().unwrap_or("reserved");
    if ctx.cs & 3 == 3 {
        kwarn!(
            "{} in user mode (eip {:#010x}, error {:#x}): killing task",
            name,
            ctx.eip,
            ctx.error_code
        );
        crate::sched::exit_current();
    }
    kerror!("CPU exception: {} (vector {})", name, vector);
    fatal(ctx);
}

/// Dumps the saved register file and halts.
fn fatal(ctx: &IrqContext) -> ! {
    kerror!(
        "  eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        ctx.eax,
        ctx.ebx,
        ctx.ecx,
        ctx.edx
    );
    kerror!(
        "  esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
        ctx.esi,
        ctx.edi,
        ctx.ebp,
        ctx.esp
    );
    kerror!(
        "  eip={:#010x} cs={:#06x} eflags={:#010x}",
        ctx.eip,
        ctx.cs,
        ctx.eflags
    );
    halt_forever();
}
