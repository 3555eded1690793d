//! TLB invalidation.

use muon_core::addr::VirtAddr;

/// Invalidates the TLB entry for one 4 KiB slot.
#[inline]
pub fn flush(addr: VirtAddr) {
    // SAFETY: invlpg only drops a TLB entry.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) addr.as_u32(),
            options(nostack, preserves_flags),
        );
    }
}

/// Flushes all non-global TLB entries by reloading CR3.
#[inline]
pub fn flush_all() {
    // SAFETY: Rewriting CR3 with its own value only drops TLB entries.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
    }
}
