//! Scheduler glue.
//!
//! The task list and selection policy live in `muon-sched`; this module
//! owns the global instance and the machinery around it: the yield path
//! (cleanup, selection, deferred deletion, the stack switch), task
//! creation with stack allocation in the owning address space, safe
//! teardown, and fork.
//!
//! The task list is guarded by a spin lock, but consistency against
//! preemption comes from the yield gate: every mutation runs inside a
//! `block`/`unblock` bracket, and the yield path backs off when the gate
//! is closed or the lock is contended. The lock is released just before
//! the stack switch; interrupts stay disabled until the incoming
//! context lands, so nothing can interleave, and tasks entered through a
//! fabricated frame (first run, fork) never see it held.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use muon_core::addr::VirtAddr;
use muon_core::paging::PAGE_SIZE;
use muon_core::sync::register_scheduler_hooks;
use muon_mm::mapper::{AddrSpace, PageFlags, VmmError};
use muon_sched::gate::YieldGate;
use muon_sched::task::{TaskId, TaskKind, TaskList};

use crate::arch::x86::context::{self, SWITCH_FRAME_WORDS, TaskContext, switch_context};
use crate::arch::x86::gdt;
use crate::arch::x86::instructions::interrupts;
use crate::config::{
    KERNEL_BASE, SCRATCH_BASE, SCRATCH_END, TASK_KERNEL_STACK_SIZE, TASK_QUANTUM,
};
use crate::irq::IrqContext;
use crate::mm::{pmm, vmm};
use crate::proc;
use crate::{kdebug, kerror};

/// Sentinel for "no current task".
const NO_TASK: usize = usize::MAX;

static TASKS: muon_core::sync::SpinLock<TaskList<TaskContext>> =
    muon_core::sync::SpinLock::new(TaskList::new());
static GATE: YieldGate = YieldGate::new();
static CURRENT: AtomicUsize = AtomicUsize::new(NO_TASK);
/// Tick of the last context switch; enforces the quantum floor.
static SWITCH_TICK: AtomicU64 = AtomicU64::new(0);
/// Context-save sink for a task that is being deleted under our feet.
static mut DISCARD_ESP: u32 = 0;

/// Blocks yielding (nesting-safe).
pub fn yield_block() {
    GATE.block();
}

/// Unblocks yielding.
pub fn yield_unblock() {
    GATE.unblock();
}

/// The running task's id.
pub fn current() -> Option<TaskId> {
    match CURRENT.load(Ordering::Relaxed) {
        NO_TASK => None,
        id => Some(id),
    }
}

/// Brings up multitasking: adopts the boot stack as the kernel task and
/// registers the mutex contention hooks.
pub fn init(boot_stack_top: VirtAddr, boot_stack_size: u32) {
    {
        let mut tasks = TASKS.lock();
        let kernel = tasks.init_kernel(boot_stack_top, boot_stack_size, TaskContext::default());
        tasks.get_mut(kernel).expect("just created").ready = true;
        CURRENT.store(kernel, Ordering::Relaxed);
    }
    register_scheduler_hooks(yield_cooperative, yield_block, yield_unblock);
    kdebug!("sched: kernel task adopted");
}

/// Timer-tick entry: yields once the running task has had its quantum.
pub fn on_tick() {
    let now = crate::time::tick();
    if now.saturating_sub(SWITCH_TICK.load(Ordering::Relaxed)) >= TASK_QUANTUM {
        yield_now();
    }
}

/// Cooperative yield; the mutex contention hook.
pub fn yield_cooperative() {
    yield_now();
}

/// Hands the CPU to the longest-waiting ready task, if any.
///
/// Runs the deferred address-space cleanup first, performs a pending
/// deletion of the outgoing task, and switches stacks (and address
/// spaces) to the selected one.
pub fn yield_now() {
    if GATE.is_blocked() {
        return;
    }
    interrupts::without(|| {
        // Reap address spaces staged for deletion; anything still
        // current is skipped.
        // SAFETY: Staged spaces belong to dead processes.
        unsafe { vmm::vmm().do_cleanup() };

        let Some(mut tasks) = TASKS.try_lock() else {
            return;
        };
        if tasks.is_empty() {
            return;
        }
        let cur = CURRENT.load(Ordering::Relaxed);
        if cur == NO_TASK {
            return;
        }

        let now = crate::time::tick();
        let Some(next) = tasks.select_next(cur, now) else {
            return;
        };

        // The outgoing task may be awaiting deletion: do it now, while
        // we are about to leave it for good.
        let cur_esp_ptr: *mut u32 =
            if tasks.get(cur).map(|t| t.kind) == Some(TaskKind::DeletePending) {
                // Keep the dying task's stack mapped until the switch:
                // we are still running on it.
                delete_locked(&mut tasks, cur, false);
                CURRENT.store(NO_TASK, Ordering::Relaxed);
                &raw mut DISCARD_ESP
            } else {
                &raw mut tasks.get_mut(cur).expect("current is live").context.esp
            };

        SWITCH_TICK.store(now, Ordering::Relaxed);
        let next_task = tasks.get_mut(next).expect("selected task is live");
        next_task.last_switch = now;
        let next_esp = next_task.context.esp;
        let next_stack_top = next_task.stack_bottom.as_u32();
        let next_pid = next_task.pid;

        // Ring transitions of the incoming task land on its kernel
        // stack.
        // SAFETY: Interrupts are disabled.
        unsafe { gdt::set_kernel_stack(next_stack_top) };

        CURRENT.store(next, Ordering::Relaxed);
        let space = proc::space_of(next_pid);

        // Interrupts are disabled through the switch, so dropping the
        // lock here cannot let anyone interleave; `cur_esp_ptr` stays
        // valid because nothing else runs before the save completes.
        drop(tasks);
        // SAFETY: The process's space is live; the switch frame at
        // `next_esp` was fabricated by task creation, fork, or a
        // previous switch.
        unsafe {
            vmm::vmm().switch(space);
            switch_context(cur_esp_ptr, next_esp);
        }
        // Back here: someone switched to us again.
    });
}

// ── Task creation ───────────────────────────────────────────────────────

/// Allocates and maps a stack of `size` bytes ending (exclusive) at
/// `bottom` in `space`.
fn map_stack(
    space: AddrSpace,
    bottom: VirtAddr,
    size: u32,
    user: bool,
) -> Result<(), VmmError> {
    let vmm = vmm::vmm();
    let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::CACHED;
    if user {
        flags |= PageFlags::USER;
    }
    let pages = size / PAGE_SIZE;
    for i in 0..pages {
        let frame = vmm.tables().alloc_frames(1)?;
        let va = bottom - (i + 1) * PAGE_SIZE;
        // SAFETY: Fresh frame into a free slot of the task's own stack
        // region.
        unsafe { vmm.pgmap(space, frame, va, 0, flags)? };
    }
    Ok(())
}

/// Writes `words` at virtual address `va` of `space`, through a scratch
/// window when `space` is not current. Handles runs that cross page
/// boundaries by re-aiming the window per page.
fn write_words(space: AddrSpace, va: VirtAddr, words: &[u32]) -> Result<(), VmmError> {
    let vmm = vmm::vmm();
    if space == vmm.current() {
        for (i, w) in words.iter().enumerate() {
            // SAFETY: The target range is mapped writable in this space.
            unsafe { (va.as_mut_ptr::<u32>()).add(i).write_volatile(*w) };
        }
        return Ok(());
    }

    let window = unsafe {
        vmm.alloc_map(
            vmm.current(),
            muon_core::addr::PhysAddr::zero(),
            PAGE_SIZE,
            VirtAddr::new(SCRATCH_BASE),
            VirtAddr::new(SCRATCH_END),
            0,
            0,
            false,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::CACHED,
        )?
    };
    let mut mapped_page = VirtAddr::zero();
    for (i, w) in words.iter().enumerate() {
        let word_va = va + (i as u32) * 4;
        let page = word_va.align_down(PAGE_SIZE);
        if page != mapped_page {
            let pa = vmm.get_paddr(space, page).ok_or(VmmError::Unmapped)?;
            // SAFETY: Re-aiming our private window at the target frame.
            unsafe { vmm.set_paddr(vmm.current(), window, pa) };
            mapped_page = page;
        }
        let slot = window + (word_va.as_u32() & (PAGE_SIZE - 1));
        // SAFETY: The window maps the target frame writable.
        unsafe { slot.as_mut_ptr::<u32>().write_volatile(*w) };
    }
    // SAFETY: The window was mapped by us.
    unsafe { vmm.unmap(vmm.current(), window, PAGE_SIZE)? };
    Ok(())
}

/// Creates a task for process `pid`.
///
/// The stack is carved out of the process's address space: at
/// `stack_bottom` if given, otherwise at the top of the user region.
/// User tasks get [`TASK_KERNEL_STACK_SIZE`] extra bytes of kernel
/// stack above the user stack. The task is inserted after the kernel
/// task and left not-ready when `entry` is zero.
pub fn task_create(
    user: bool,
    pid: u32,
    stack_size: u32,
    entry: u32,
    stack_bottom: Option<VirtAddr>,
) -> Option<TaskId> {
    let vmm = vmm::vmm();
    let space = proc::space_of(pid);
    let stack_size = (stack_size + if user { TASK_KERNEL_STACK_SIZE } else { 0 })
        .next_multiple_of(PAGE_SIZE);

    let bottom = match stack_bottom {
        Some(b) => b,
        None => {
            let base = vmm.first_free(
                space,
                VirtAddr::zero(),
                VirtAddr::new(KERNEL_BASE),
                stack_size,
                0,
                true,
            );
            if base == VirtAddr::zero() {
                kerror!("sched: no address space for a {} byte stack", stack_size);
                return None;
            }
            base + stack_size
        }
    };

    if let Err(e) = map_stack(space, bottom, stack_size, user) {
        kerror!("sched: cannot map task stack: {:?}", e);
        return None;
    }

    // Fabricate the first switch frame at the top of the kernel stack.
    let thunk: extern "C" fn() -> ! = if user { user_task_entry } else { kernel_task_entry };
    let esp = bottom.as_u32() - (SWITCH_FRAME_WORDS as u32) * 4;
    let mut frame = [0u32; SWITCH_FRAME_WORDS];
    frame[0] = 0x0000_0002; // eflags, IF off until the thunk
    frame[6] = thunk as usize as u32;
    if write_words(space, VirtAddr::new(esp), &frame).is_err() {
        kerror!("sched: cannot seed task stack");
        return None;
    }

    let ctx = TaskContext {
        esp,
        entry,
        user_stack: bottom.as_u32() - TASK_KERNEL_STACK_SIZE,
    };

    GATE.block();
    let id = {
        let mut tasks = TASKS.lock();
        let anchor = tasks.head().expect("scheduler initialized");
        let id = tasks.insert_after(
            anchor,
            if user { TaskKind::User } else { TaskKind::Kernel },
            pid,
            bottom,
            stack_size,
            crate::time::tick(),
            ctx,
        );
        if entry != 0 {
            tasks.get_mut(id).expect("just inserted").ready = true;
        }
        id
    };
    GATE.unblock();

    proc::add_task(pid, id);
    Some(id)
}

/// Marks a task ready (or not).
pub fn set_ready(id: TaskId, ready: bool) {
    GATE.block();
    if let Some(task) = TASKS.lock().get_mut(id) {
        task.ready = ready;
    }
    GATE.unblock();
}

/// Entry thunk for kernel tasks: runs the stored entry function and
/// exits.
extern "C" fn kernel_task_entry() -> ! {
    let entry = with_current(|task| task.context.entry).unwrap_or(0);
    // SAFETY: The IDT is live; tasks run with interrupts on.
    unsafe { interrupts::enable() };
    if entry != 0 {
        // SAFETY: The creator passed a valid function address.
        let f: extern "C" fn() = unsafe { core::mem::transmute(entry) };
        f();
    }
    exit_current();
}

/// Entry thunk for user tasks: drops to ring 3 at the stored entry.
extern "C" fn user_task_entry() -> ! {
    let (entry, user_stack) =
        with_current(|task| (task.context.entry, task.context.user_stack)).unwrap_or((0, 0));
    if entry == 0 {
        exit_current();
    }
    // SAFETY: The process's image and stack are mapped user-accessible.
    unsafe { context::enter_user(entry, user_stack) }
}

/// Runs `f` against the current task.
pub fn with_current<R>(f: impl FnOnce(&muon_sched::task::Task<TaskContext>) -> R) -> Option<R> {
    let cur = current()?;
    let tasks = TASKS.lock();
    tasks.get(cur).map(f)
}

/// The current task's owning process.
pub fn current_pid() -> u32 {
    with_current(|t| t.pid).unwrap_or(1)
}

// ── Teardown ────────────────────────────────────────────────────────────

/// Deletes a task. Deleting the running task is deferred: the work
/// happens on the next yield, after the switch away from it.
pub fn task_delete(id: TaskId) {
    if Some(id) == current() {
        GATE.block();
        if let Some(task) = TASKS.lock().get_mut(id) {
            task.kind = TaskKind::DeletePending;
        }
        GATE.unblock();
        return;
    }
    GATE.block();
    {
        let mut tasks = TASKS.lock();
        delete_locked(&mut tasks, id, true);
    }
    GATE.unblock();
}

/// Splices a task out, returns its stack frames, and drops it from its
/// process (deleting the process when it was the last task).
///
/// `unmap_stack` is false only when tearing down the task we are still
/// running on; its mappings die with the address space instead.
fn delete_locked(tasks: &mut TaskList<TaskContext>, id: TaskId, unmap_stack: bool) {
    let Some(task) = tasks.remove(id) else {
        return;
    };
    let vmm = vmm::vmm();
    let space = proc::space_of(task.pid);

    // Return the stack's physical frames.
    let top = task.stack_bottom - task.stack_size;
    let pages = task.stack_size / PAGE_SIZE;
    for i in 0..pages {
        let va = top + i * PAGE_SIZE;
        if let Some(pa) = vmm.get_paddr(space, va) {
            pmm::free_frames(pa.align_down(PAGE_SIZE), 1);
        }
    }
    if unmap_stack {
        // SAFETY: The task is gone; nothing uses this range anymore.
        let _ = unsafe { vmm.unmap(space, top, task.stack_size) };
    }

    if proc::remove_task(task.pid, id) == 0 {
        proc::delete(task.pid);
    }
}

/// Terminates the calling task.
pub fn exit_current() -> ! {
    if let Some(id) = current() {
        task_delete(id);
    }
    loop {
        yield_now();
    }
}

// ── Fork ────────────────────────────────────────────────────────────────

/// Finishes a kernel-side [`task_fork`](context::task_fork): clones the
/// calling task into process `pid` (0 = the caller's own), copying its
/// stack. Returns the child task id; the child itself resumes at the
/// fork call site with zero in `eax`.
pub(crate) extern "C" fn fork_finish(pid: u32, frame_base: u32) -> u32 {
    let Some((cur_pid, cur_kind, cur_bottom, cur_size)) =
        with_current(|t| (t.pid, t.kind, t.stack_bottom, t.stack_size))
    else {
        return 0;
    };
    let pid = if pid == 0 { cur_pid } else { pid };
    let same_proc = pid == cur_pid;
    let user = matches!(cur_kind, TaskKind::User | TaskKind::UserSys);

    let stack_size = cur_size - if user { TASK_KERNEL_STACK_SIZE } else { 0 };
    let bottom = if same_proc { None } else { Some(cur_bottom) };
    let Some(child) = task_create(user, pid, stack_size, 0, bottom) else {
        return 0;
    };

    let (child_bottom, child_size) = {
        let tasks = TASKS.lock();
        let t = tasks.get(child).expect("just created");
        (t.stack_bottom, t.stack_size)
    };

    // Copy the parent's stack verbatim.
    let src_top = cur_bottom - cur_size;
    if copy_stack(proc::space_of(pid), child_bottom - child_size, src_top, child_size).is_err() {
        task_delete(child);
        return 0;
    }

    // The child resumes through the frame the fork assembly captured:
    // same offset from the stack bottom, with a zeroed eax.
    let frame_off = cur_bottom.as_u32() - frame_base;
    let child_frame = child_bottom.as_u32() - frame_off;
    let patched_eax_va = child_frame + 4;
    let space = proc::space_of(pid);
    if write_words(space, VirtAddr::new(patched_eax_va), &[0]).is_err() {
        task_delete(child);
        return 0;
    }

    GATE.block();
    {
        let mut tasks = TASKS.lock();
        if let Some(t) = tasks.get_mut(child) {
            t.kind = if user { TaskKind::UserSys } else { TaskKind::Kernel };
            t.context.esp = child_frame;
            t.ready = true;
        }
    }
    GATE.unblock();
    child as u32
}

/// Copies `size` stack bytes from `src_top` in the current space to
/// `dst_top` in `space`, page by page through a scratch window when the
/// target is foreign.
fn copy_stack(
    space: AddrSpace,
    dst_top: VirtAddr,
    src_top: VirtAddr,
    size: u32,
) -> Result<(), VmmError> {
    let vmm = vmm::vmm();
    let pages = size / PAGE_SIZE;

    if space == vmm.current() {
        // SAFETY: Both stacks are mapped in the current space.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src_top.as_ptr::<u8>(),
                dst_top.as_mut_ptr::<u8>(),
                size as usize,
            );
        }
        return Ok(());
    }

    // Map a one-page window and walk it across the destination frames.
    let window = unsafe {
        vmm.alloc_map(
            vmm.current(),
            muon_core::addr::PhysAddr::zero(),
            PAGE_SIZE,
            VirtAddr::new(SCRATCH_BASE),
            VirtAddr::new(SCRATCH_END),
            0,
            0,
            false,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::CACHED,
        )?
    };
    for i in 0..pages {
        let dst_va = dst_top + i * PAGE_SIZE;
        let pa = vmm.get_paddr(space, dst_va).ok_or(VmmError::Unmapped)?;
        // SAFETY: Redirecting our private window at the child's frame.
        unsafe {
            vmm.set_paddr(vmm.current(), window, pa);
            vmm.tables()
                .copy_bytes(window, src_top + i * PAGE_SIZE, PAGE_SIZE as usize);
        }
    }
    // SAFETY: The window was mapped by us.
    unsafe { vmm.unmap(vmm.current(), window, PAGE_SIZE)? };
    Ok(())
}

/// Spawns a forked user task in `child_pid`'s fresh address space,
/// resuming at the interrupt context `ctx` with `eax` zeroed. Used by
/// the fork syscall after the address space has been cloned.
pub fn spawn_forked_user(child_pid: u32, ctx: &IrqContext) -> Option<TaskId> {
    let (cur_bottom, cur_size) = with_current(|t| (t.stack_bottom, t.stack_size))?;
    let space = proc::space_of(child_pid);

    // The clone shared the parent's stack copy-on-write; the child gets
    // a private stack instead, so drop those mappings first.
    // SAFETY: The child has no tasks yet; nothing runs in that space.
    let _ = unsafe { vmm::vmm().unmap(space, cur_bottom - cur_size, cur_size) };

    let user_size = cur_size - TASK_KERNEL_STACK_SIZE;
    let child = task_create(true, child_pid, user_size, 0, Some(cur_bottom))?;
    if copy_stack(space, cur_bottom - cur_size, cur_bottom - cur_size, cur_size).is_err() {
        task_delete(child);
        return None;
    }

    // Rebuild the resume path in the child: its copied interrupt
    // context, with eax = 0, entered through a fabricated switch frame.
    let ctx_va = ctx as *const IrqContext as u32;
    let eax_off = core::mem::offset_of!(IrqContext, eax) as u32;
    if write_words(space, VirtAddr::new(ctx_va + eax_off), &[0]).is_err() {
        task_delete(child);
        return None;
    }
    let child_frame = ctx_va - (SWITCH_FRAME_WORDS as u32) * 4;
    let mut frame = [0u32; SWITCH_FRAME_WORDS];
    frame[0] = 0x0000_0002;
    frame[6] = context::irq_return as usize as u32;
    if write_words(space, VirtAddr::new(child_frame), &frame).is_err() {
        task_delete(child);
        return None;
    }

    GATE.block();
    {
        let mut tasks = TASKS.lock();
        if let Some(t) = tasks.get_mut(child) {
            t.kind = TaskKind::UserSys;
            t.context.esp = child_frame;
            t.ready = true;
        }
    }
    GATE.unblock();
    Some(child)
}

// The kernel-side fork entry point lives in the context module.
pub use context::task_fork;
