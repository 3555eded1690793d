//! Memory-mapped I/O accessors.
//!
//! Volatile reads and writes of the widths device registers use. The
//! 8-byte forms are two 4-byte accesses, low half first, since x86 protected
//! mode has no native 64-bit load, and the devices served here (LAPIC,
//! I/O APIC) tolerate split access.

use muon_core::addr::VirtAddr;

/// Reads one byte.
///
/// # Safety
///
/// `addr` must map a readable device register.
#[inline]
pub unsafe fn read8(addr: VirtAddr) -> u8 {
    unsafe { core::ptr::read_volatile(addr.as_ptr()) }
}

/// Reads a 16-bit word.
///
/// # Safety
///
/// `addr` must map a readable device register.
#[inline]
pub unsafe fn read16(addr: VirtAddr) -> u16 {
    unsafe { core::ptr::read_volatile(addr.as_ptr()) }
}

/// Reads a 32-bit dword.
///
/// # Safety
///
/// `addr` must map a readable device register.
#[inline]
pub unsafe fn read32(addr: VirtAddr) -> u32 {
    unsafe { core::ptr::read_volatile(addr.as_ptr()) }
}

/// Reads a 64-bit value as two dwords, low first.
///
/// # Safety
///
/// `addr` must map a readable device register pair.
#[inline]
pub unsafe fn read64(addr: VirtAddr) -> u64 {
    let low = unsafe { read32(addr) };
    let high = unsafe { read32(addr + 4) };
    u64::from(low) | (u64::from(high) << 32)
}

/// Writes one byte.
///
/// # Safety
///
/// `addr` must map a writable device register.
#[inline]
pub unsafe fn write8(addr: VirtAddr, value: u8) {
    unsafe { core::ptr::write_volatile(addr.as_mut_ptr(), value) }
}

/// Writes a 16-bit word.
///
/// # Safety
///
/// `addr` must map a writable device register.
#[inline]
pub unsafe fn write16(addr: VirtAddr, value: u16) {
    unsafe { core::ptr::write_volatile(addr.as_mut_ptr(), value) }
}

/// Writes a 32-bit dword.
///
/// # Safety
///
/// `addr` must map a writable device register.
#[inline]
pub unsafe fn write32(addr: VirtAddr, value: u32) {
    unsafe { core::ptr::write_volatile(addr.as_mut_ptr(), value) }
}

/// Writes a 64-bit value as two dwords, low first.
///
/// # Safety
///
/// `addr` must map a writable device register pair.
#[inline]
pub unsafe fn write64(addr: VirtAddr, value: u64) {
    unsafe {
        write32(addr, value as u32);
        write32(addr + 4, (value >> 32) as u32);
    }
}
