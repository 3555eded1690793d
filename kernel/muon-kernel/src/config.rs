//! Compile-time kernel configuration.
//!
//! A single source of truth for the virtual memory layout, scheduler
//! parameters, and interrupt vector assignments.

/// Virtual base of the kernel region; everything above is shared by all
/// address spaces.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// Kernel heap window base.
pub const KHEAP_BASE: u32 = 0xC800_0000;

/// Kernel heap window size: 64 MiB.
pub const KHEAP_MAX_SIZE: u32 = 64 * 1024 * 1024;

/// Virtual range searched for transient copy windows (CoW resolution).
pub const SCRATCH_BASE: u32 = 0xD000_0000;
/// End of the scratch window range.
pub const SCRATCH_END: u32 = 0xE000_0000;

/// Virtual range handed out for MMIO mappings (LAPIC, I/O APICs).
pub const MMIO_BASE: u32 = 0xE000_0000;
/// End of the MMIO range.
pub const MMIO_END: u32 = 0xF000_0000;

/// Base of the fixed transient-slot window used to edit foreign page
/// tables (directory slot 1022).
pub const TRANSIENT_BASE: u32 = 0xFF80_0000;

/// Number of transient slots.
pub const TRANSIENT_SLOTS: usize = 8;

/// Base of the recursive-mapping window (directory slot 1023).
pub const RMAP_BASE: u32 = 0xFFC0_0000;

/// The low-memory cutoff kept reserved for legacy BIOS structures.
pub const LOW_MEMORY_RESERVED: u32 = 16 * 1024 * 1024;

/// Scheduler quantum in timer ticks (microseconds).
pub const TASK_QUANTUM: u64 = 1000;

/// Kernel stack bytes reserved atop each user task's stack.
pub const TASK_KERNEL_STACK_SIZE: u32 = 8 * 1024;

/// Initial stack size for fresh tasks.
pub const TASK_INITIAL_STACK_SIZE: u32 = 16 * 1024;

/// First interrupt vector used for external interrupts; the PIC window
/// `[VECT_BASE, VECT_BASE + 16)` follows it.
pub const VECT_BASE: u8 = 0x20;

/// First vector of the GSI window (`VECT_BASE + GSI_VECT_OFFSET + gsi`),
/// placed above the software interrupt vectors.
pub const GSI_VECT_OFFSET: u8 = 0x20;

/// Software interrupt used for system calls.
pub const SYSCALL_VECTOR: u8 = 0x30;

/// Software interrupt used for cooperative yields.
pub const YIELD_VECTOR: u8 = 0x31;

/// Fixed LAPIC spurious vector.
pub const SPURIOUS_VECTOR: u8 = 0xFF;
