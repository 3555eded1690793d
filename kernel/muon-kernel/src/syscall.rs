//! System call dispatch.
//!
//! User code enters through the syscall software interrupt with the
//! call number in `eax` and arguments in `ebx`/`ecx`/`edx`; the result
//! comes back in `eax`. The set is deliberately small, process and
//! descriptor control — since the VFS surface sits above this layer.

use crate::irq::IrqContext;
use crate::proc;
use crate::sched;
use crate::{kdebug, ktrace};

/// `exit(status)`.
pub const SYS_EXIT: u32 = 0;
/// `fork() -> pid | -1`.
pub const SYS_FORK: u32 = 1;
/// `yield()`.
pub const SYS_YIELD: u32 = 2;
/// `getpid() -> pid`.
pub const SYS_GETPID: u32 = 3;
/// `read(fd, buf, len) -> n | -1`.
pub const SYS_READ: u32 = 4;
/// `write(fd, buf, len) -> n | -1`.
pub const SYS_WRITE: u32 = 5;
/// `close(fd) -> 0 | -1`.
pub const SYS_CLOSE: u32 = 6;

/// Failure sentinel returned to user mode.
const ERR: u32 = u32::MAX;

/// Syscall entry from the generic dispatcher.
pub fn dispatch(ctx: &mut IrqContext) {
    let nr = ctx.eax;
    ktrace!("syscall {} from pid {}", nr, sched::current_pid());

    ctx.eax = match nr {
        SYS_EXIT => {
            kdebug!(
                "pid {} exited with status {}",
                sched::current_pid(),
                ctx.ebx
            );
            sched::exit_current();
        }
        SYS_FORK => proc::fork_process(ctx),
        SYS_YIELD => {
            sched::yield_now();
            0
        }
        SYS_GETPID => sched::current_pid(),
        SYS_READ => match user_slice_mut(ctx.ecx, ctx.edx) {
            Some(buf) => proc::fd_read(sched::current_pid(), ctx.ebx as usize, buf)
                .map(|n| n as u32)
                .unwrap_or(ERR),
            None => ERR,
        },
        SYS_WRITE => match user_slice(ctx.ecx, ctx.edx) {
            Some(buf) => proc::fd_write(sched::current_pid(), ctx.ebx as usize, buf)
                .map(|n| n as u32)
                .unwrap_or(ERR),
            None => ERR,
        },
        SYS_CLOSE => match proc::fd_close(sched::current_pid(), ctx.ebx as usize) {
            Ok(()) => 0,
            Err(_) => ERR,
        },
        _ => ERR,
    };
}

/// Validates a user buffer: entirely below the kernel region.
fn user_range_ok(ptr: u32, len: u32) -> bool {
    let end = ptr as u64 + len as u64;
    ptr != 0 && end <= u64::from(crate::config::KERNEL_BASE)
}

fn user_slice(ptr: u32, len: u32) -> Option<&'static [u8]> {
    if !user_range_ok(ptr, len) {
        return None;
    }
    // SAFETY: The range is confined to the user region of the current
    // space; a fault on an unmapped page is handled as a kill.
    Some(unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) })
}

fn user_slice_mut(ptr: u32, len: u32) -> Option<&'static mut [u8]> {
    if !user_range_ok(ptr, len) {
        return None;
    }
    // SAFETY: As `user_slice`, and writes are covered by CoW resolution.
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}
