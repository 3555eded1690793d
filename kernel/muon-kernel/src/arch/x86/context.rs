//! Context switching and fork primitives.
//!
//! Every task owns a kernel stack. A switch saves the callee-visible
//! register file on the outgoing task's stack and loads the incoming
//! task's saved stack pointer; the incoming task resumes wherever it
//! last called [`switch_context`] (usually inside the scheduler) and
//! unwinds from there, ultimately through its own interrupt frame.
//!
//! `task_fork` must live in assembly: the compiler makes no promise
//! about which registers survive an arbitrary call boundary, so the
//! full file is captured by hand before the stacks diverge.

/// Saved execution state of a task: where its kernel stack pointer was
/// left at the last switch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskContext {
    /// Kernel stack pointer; points at a switch frame.
    pub esp: u32,
    /// Entry point for tasks that have not run yet (consumed by the
    /// entry thunk).
    pub entry: u32,
    /// Initial user-mode stack pointer (user tasks only).
    pub user_stack: u32,
}

/// Words in a switch frame: eflags, eax, edi, esi, ebx, ebp, return
/// address.
pub const SWITCH_FRAME_WORDS: usize = 7;

/// Saves the current register file on this stack, parks the stack
/// pointer in `*old_esp`, and resumes the stack at `new_esp`.
///
/// # Safety
///
/// `new_esp` must point at a switch frame fabricated by task creation,
/// a previous `switch_context` save, or a fork; interrupts must be
/// disabled.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(old_esp: *mut u32, new_esp: u32) {
    core::arch::naked_asm!(
        "push ebp",
        "push ebx",
        "push esi",
        "push edi",
        "push eax",
        "pushfd",
        "mov eax, [esp + 28]", // old_esp
        "mov [eax], esp",
        "mov eax, [esp + 32]", // new_esp
        "mov esp, eax",
        "popfd",
        "pop eax",
        "pop edi",
        "pop esi",
        "pop ebx",
        "pop ebp",
        "ret",
    )
}

/// Unwinds an interrupt context sitting at the stack pointer and returns
/// from the interrupt. The tail of the vector trampolines, reachable by
/// fabricated frames.
#[unsafe(naked)]
pub extern "C" fn irq_return() {
    core::arch::naked_asm!(
        "pop eax",
        "mov ds, ax",
        "mov es, ax",
        "popad",
        "add esp, 8", // vector + error code
        "iretd",
    )
}

/// Drops to ring 3 at `entry` with the given user stack. Does not
/// return; the task re-enters the kernel only via interrupts and
/// syscalls.
///
/// # Safety
///
/// `entry` and `user_stack` must be mapped user-accessible in the
/// current space, and the GDT user selectors must be live.
pub unsafe fn enter_user(entry: u32, user_stack: u32) -> ! {
    // SAFETY: Builds the canonical ring-3 iret frame.
    unsafe {
        core::arch::asm!(
            "mov ds, ax",
            "mov es, ax",
            "push eax",     // ss
            "push edx",     // esp
            "push 0x202",   // eflags: IF set
            "push {ucode}", // cs
            "push esi",     // eip
            "iretd",
            ucode = const 0x18 | 3,
            in("eax") 0x20u32 | 3, // user data selector
            in("edx") user_stack,
            in("esi") entry,
            options(noreturn),
        );
    }
}

/// Kernel-side fork primitive: captures the caller's register file and
/// hands it, with the current stack pointer, to the scheduler's fork
/// finisher. Returns twice: the finisher's return value in the parent,
/// zero in the child.
///
/// Kept in assembly because the calling convention alone does not pin
/// down enough register state to recreate the caller's world in the
/// child.
///
/// # Safety
///
/// Must be called from a task context with a live current process.
#[unsafe(naked)]
pub unsafe extern "C" fn task_fork(pid: u32) -> u32 {
    core::arch::naked_asm!(
        // Capture the callee-saved file exactly like switch_context, so
        // the copied stack resumes through the same frame layout.
        "push ebp",
        "push ebx",
        "push esi",
        "push edi",
        "push eax",
        "pushfd",
        "push esp",         // arg 2: frame base
        "mov eax, [esp + 32]", // original arg: pid
        "push eax",         // arg 1
        "call {finish}",
        "add esp, 8",
        // Parent path: unwind the captured file and return the child id
        // left in eax by the finisher.
        "add esp, 4",       // discard saved eflags
        "add esp, 4",       // discard saved eax (keep the return value)
        "pop edi",
        "pop esi",
        "pop ebx",
        "pop ebp",
        "ret",
        finish = sym crate::sched::fork_finish,
    )
}
