//! Global Descriptor Table.
//!
//! Flat 4 GiB segments for kernel and user code/data, plus one TSS whose
//! only job is to name the kernel stack used on ring transitions.

use core::cell::UnsafeCell;

use crate::arch::x86::instructions::tables::{DescriptorTablePointer, lgdt, ltr};

/// Kernel code segment selector.
pub const KERNEL_CODE: u16 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_DATA: u16 = 0x10;
/// User code segment selector (RPL 3).
pub const USER_CODE: u16 = 0x18 | 3;
/// User data segment selector (RPL 3).
pub const USER_DATA: u16 = 0x20 | 3;
/// TSS selector.
pub const TSS_SELECTOR: u16 = 0x28;

/// 32-bit Task State Segment. Only `ss0`/`esp0` (the ring-0 stack on
/// privilege transitions) and the I/O bitmap offset matter.
#[repr(C, packed)]
struct TaskStateSegment {
    prev: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 22],
    iomap_base: u16,
    trailer: u16,
}

struct GdtStorage {
    entries: UnsafeCell<[u64; 6]>,
    tss: UnsafeCell<TaskStateSegment>,
}

// SAFETY: Mutated only during single-threaded boot (`init`) and from the
// scheduler with interrupts disabled (`set_kernel_stack`).
unsafe impl Sync for GdtStorage {}

static GDT: GdtStorage = GdtStorage {
    entries: UnsafeCell::new([0; 6]),
    tss: UnsafeCell::new(TaskStateSegment {
        prev: 0,
        esp0: 0,
        ss0: KERNEL_DATA as u32,
        unused: [0; 22],
        iomap_base: core::mem::size_of::<TaskStateSegment>() as u16,
        trailer: 0,
    }),
};

/// Builds a flat segment descriptor.
const fn segment(access: u8) -> u64 {
    // base 0, limit 0xFFFFF, 4 KiB granularity, 32-bit.
    let limit_low = 0xFFFFu64;
    let limit_high = 0xFu64;
    let flags = 0xCu64; // G | D
    limit_low | ((access as u64) << 40) | (limit_high << 48) | (flags << 52)
}

/// Builds the TSS descriptor for the given base address.
fn tss_descriptor(base: u32, limit: u32) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | ((base & 0xFF_FFFF) << 16)
        | (0x89u64 << 40) // present, 32-bit available TSS
        | (((limit >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56)
}

/// Builds and loads the GDT and TSS.
///
/// # Safety
///
/// Must be called once during early boot with interrupts disabled.
pub unsafe fn init() {
    let tss_base = GDT.tss.get() as u32;
    let tss_limit = core::mem::size_of::<TaskStateSegment>() as u32 - 1;

    // SAFETY: Single-threaded boot; nothing reads the GDT yet.
    let entries = unsafe { &mut *GDT.entries.get() };
    entries[0] = 0;
    entries[1] = segment(0x9A); // kernel code: present, ring 0, exec/read
    entries[2] = segment(0x92); // kernel data: present, ring 0, read/write
    entries[3] = segment(0xFA); // user code: present, ring 3, exec/read
    entries[4] = segment(0xF2); // user data: present, ring 3, read/write
    entries[5] = tss_descriptor(tss_base, tss_limit);

    let ptr = DescriptorTablePointer {
        limit: (core::mem::size_of::<[u64; 6]>() - 1) as u16,
        base: entries.as_ptr() as u32,
    };

    // SAFETY: The table is fully built and lives in a static. The far
    // return reloads CS; the moves reload every data segment.
    unsafe {
        lgdt(&ptr);
        core::arch::asm!(
            "push {code}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            "mov ds, cx",
            "mov es, cx",
            "mov fs, cx",
            "mov gs, cx",
            "mov ss, cx",
            code = const KERNEL_CODE as u32,
            in("ecx") KERNEL_DATA as u32,
            out("eax") _,
        );
        ltr(TSS_SELECTOR);
    }
}

/// Points the TSS at the kernel stack to use for the next ring-3 → ring-0
/// transition.
///
/// # Safety
///
/// Must be called with interrupts disabled (the scheduler's switch path).
pub unsafe fn set_kernel_stack(esp0: u32) {
    // SAFETY: Exclusive by the caller's contract.
    unsafe { (*GDT.tss.get()).esp0 = esp0 };
}
