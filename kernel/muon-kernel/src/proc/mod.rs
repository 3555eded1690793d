//! Process management.
//!
//! A process owns an address space, a list of tasks, and a file
//! descriptor table. Control blocks are the payloads of the PID binary
//! tree from `muon-sched`: the PID encodes the tree path, lookups walk
//! the bits, and dead nodes are tombstoned until their subtree drains.

use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::addr::VirtAddr;
use muon_core::sync::{InitOnce, Mutex, SpinLock};
use muon_mm::mapper::AddrSpace;
use muon_sched::pid::PidTree;
use muon_sched::task::TaskId;

use crate::irq::IrqContext;
use crate::mm::vmm;
use crate::fd::{FdError, FdTable, FileLike, OpenMode};
use crate::{kdebug, kerror};

/// One loaded program segment (base, byte length).
pub type Segment = (VirtAddr, u32);

/// A process control block.
pub struct Process {
    /// Parent process id (1 for children of the kernel).
    pub parent_pid: u32,
    /// The owned address space.
    space: AddrSpace,
    /// Program segments loaded into the space (for teardown and
    /// diagnostics).
    pub segments: Vec<Segment>,
    /// Tasks belonging to this process.
    tasks: Mutex<Vec<TaskId>>,
    /// Per-process descriptor table.
    fds: Mutex<FdTable>,
}

impl Process {
    fn new(parent_pid: u32, space: AddrSpace) -> Self {
        Self {
            parent_pid,
            space,
            segments: Vec::new(),
            tasks: Mutex::new(Vec::new()),
            fds: Mutex::new(FdTable::new()),
        }
    }
}

static PROCS: InitOnce<SpinLock<PidTree<Process>>> = InitOnce::new();

/// Creates the kernel process (PID 1) around the kernel address space.
pub fn init() {
    let kernel = Process::new(0, vmm::vmm().kernel_space());
    PROCS.init(SpinLock::new(PidTree::new(kernel)));
}

/// Runs `f` against the control block of `pid`.
pub fn with_proc<R>(pid: u32, f: impl FnOnce(&Process) -> R) -> Option<R> {
    let procs = PROCS.get().lock();
    procs.get(pid).map(f)
}

/// Creates a process owning `space`. Returns its PID.
pub fn create(parent_pid: u32, space: AddrSpace) -> Option<u32> {
    let mut procs = PROCS.get().lock();
    let pid = procs.create(Process::new(parent_pid, space));
    match pid {
        Some(pid) => {
            kdebug!("proc: created pid {}", pid);
            Some(pid)
        }
        None => {
            kerror!("proc: PID space exhausted");
            None
        }
    }
}

/// The address space of `pid`; the kernel space when the PID is stale.
pub fn space_of(pid: u32) -> AddrSpace {
    with_proc(pid, |p| p.space).unwrap_or_else(|| vmm::vmm().kernel_space())
}

/// Records a task as belonging to `pid`.
pub fn add_task(pid: u32, task: TaskId) {
    if with_proc(pid, |p| p.tasks.lock().push(task)).is_none() {
        kerror!("proc: add_task on dead pid {}", pid);
    }
}

/// Drops a task from `pid`'s list; returns how many remain.
pub fn remove_task(pid: u32, task: TaskId) -> usize {
    with_proc(pid, |p| {
        let mut tasks = p.tasks.lock();
        tasks.retain(|t| *t != task);
        tasks.len()
    })
    .unwrap_or(0)
}

/// Deletes a process: frees its address space (deferred if it is still
/// current) and tombstones its PID-tree node.
pub fn delete(pid: u32) {
    let space = {
        let mut procs = PROCS.get().lock();
        let Some(proc) = procs.remove(pid) else {
            return;
        };
        proc.space
    };
    // SAFETY: The last task of the process is gone (or on its way out
    // through the deferred path).
    unsafe { vmm::vmm().free(space) };
    kdebug!("proc: deleted pid {}", pid);
}

// ── Descriptor plumbing for the syscall layer ───────────────────────────

/// Opens `file` for `pid` and returns the descriptor number.
pub fn fd_open(pid: u32, file: Arc<dyn FileLike>, mode: OpenMode) -> Option<usize> {
    with_proc(pid, |p| p.fds.lock().open(file, mode))
}

/// Closes a descriptor of `pid`.
pub fn fd_close(pid: u32, fd: usize) -> Result<(), FdError> {
    with_proc(pid, |p| p.fds.lock().close(fd)).unwrap_or(Err(FdError::BadDescriptor))
}

/// Reads from a descriptor of `pid`.
pub fn fd_read(pid: u32, fd: usize, buf: &mut [u8]) -> Result<usize, FdError> {
    let entry = with_proc(pid, |p| p.fds.lock().get(fd)).unwrap_or(Err(FdError::BadDescriptor))?;
    entry.read(buf)
}

/// Writes to a descriptor of `pid`.
pub fn fd_write(pid: u32, fd: usize, buf: &[u8]) -> Result<usize, FdError> {
    let entry = with_proc(pid, |p| p.fds.lock().get(fd)).unwrap_or(Err(FdError::BadDescriptor))?;
    entry.write(buf)
}

// ── Fork ────────────────────────────────────────────────────────────────

/// Forks the calling process: clones its address space copy-on-write,
/// creates the child control block, and spawns the child task resuming
/// at `ctx` with a zeroed return register.
///
/// Returns the child PID, or `u32::MAX` on failure.
pub fn fork_process(ctx: &IrqContext) -> u32 {
    let parent_pid = crate::sched::current_pid();
    let parent_space = space_of(parent_pid);

    // SAFETY: The parent is the current space and is not mutating its
    // own user mappings mid-syscall.
    let child_space = match unsafe { vmm::vmm().clone_space(parent_space, true) } {
        Ok(space) => space,
        Err(e) => {
            kerror!("proc: fork clone failed: {:?}", e);
            return u32::MAX;
        }
    };

    let Some(child_pid) = create(parent_pid, child_space) else {
        // SAFETY: The clone has no tasks; free it immediately.
        unsafe { vmm::vmm().free(child_space) };
        return u32::MAX;
    };

    match crate::sched::spawn_forked_user(child_pid, ctx) {
        Some(_) => child_pid,
        None => {
            delete(child_pid);
            u32::MAX
        }
    }
}
