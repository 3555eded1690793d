//! The cyclic task list and the yield selection policy.
//!
//! Tasks live in a slab arena and form a doubly linked cyclic list through
//! arena indices. The kernel task is the permanent head; it is created
//! once and never removed, so the list is non-empty for the lifetime of
//! the system. All mutations are expected to run inside a yield-block
//! bracket so the scheduler never observes a partially linked node.

use alloc::vec::Vec;

use muon_core::addr::VirtAddr;

/// Index of a task in the arena.
pub type TaskId = usize;

/// Scheduler time, in timer ticks.
pub type Tick = u64;

/// What a task is currently executing as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Kernel task.
    Kernel,
    /// User task running user code.
    User,
    /// User task running kernel code (syscall in progress).
    UserSys,
    /// Awaiting deletion at the next switch away from it.
    DeletePending,
}

/// A schedulable unit, generic over the architecture's saved register
/// context.
#[derive(Debug)]
pub struct Task<C> {
    /// Current kind.
    pub kind: TaskKind,
    /// Whether the scheduler may switch to this task.
    pub ready: bool,
    /// Owning process.
    pub pid: u32,
    /// Highest address of the task's stack (stacks grow down).
    pub stack_bottom: VirtAddr,
    /// Stack size in bytes.
    pub stack_size: u32,
    /// Tick at which this task was last switched in.
    pub last_switch: Tick,
    /// Saved register context.
    pub context: C,
    prev: TaskId,
    next: TaskId,
}

/// The cyclic task list.
#[derive(Debug)]
pub struct TaskList<C> {
    slots: Vec<Option<Task<C>>>,
    head: Option<TaskId>,
}

impl<C> TaskList<C> {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
        }
    }

    /// Installs the kernel task as the permanent, self-linked head.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn init_kernel(&mut self, stack_bottom: VirtAddr, stack_size: u32, context: C) -> TaskId {
        assert!(self.head.is_none(), "kernel task already exists");
        let id = self.store(Task {
            kind: TaskKind::Kernel,
            ready: false,
            pid: 1,
            stack_bottom,
            stack_size,
            last_switch: 0,
            context,
            prev: 0,
            next: 0,
        });
        let task = self.slots[id].as_mut().expect("just stored");
        task.prev = id;
        task.next = id;
        self.head = Some(id);
        id
    }

    fn store(&mut self, task: Task<C>) -> TaskId {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(task);
                return i;
            }
        }
        self.slots.push(Some(task));
        self.slots.len() - 1
    }

    /// The kernel task, if initialized.
    pub fn head(&self) -> Option<TaskId> {
        self.head
    }

    /// Inserts a new task immediately after `anchor` and returns its id.
    /// The task starts not-ready; the caller marks it ready once its
    /// context is finalized.
    pub fn insert_after(
        &mut self,
        anchor: TaskId,
        kind: TaskKind,
        pid: u32,
        stack_bottom: VirtAddr,
        stack_size: u32,
        now: Tick,
        context: C,
    ) -> TaskId {
        let anchor_next = self.slots[anchor].as_ref().expect("anchor is live").next;
        let id = self.store(Task {
            kind,
            ready: false,
            pid,
            stack_bottom,
            stack_size,
            // Start with a fresh timestamp so the new task competes fairly.
            last_switch: now,
            context,
            prev: anchor,
            next: anchor_next,
        });
        self.slots[anchor].as_mut().expect("anchor is live").next = id;
        self.slots[anchor_next].as_mut().expect("list is linked").prev = id;
        id
    }

    /// Splices a task out of the list and returns it.
    ///
    /// The kernel task cannot be removed; doing so would empty the list.
    pub fn remove(&mut self, id: TaskId) -> Option<Task<C>> {
        if Some(id) == self.head {
            return None;
        }
        let task = self.slots.get_mut(id)?.take()?;
        self.slots[task.prev].as_mut().expect("list is linked").next = task.next;
        self.slots[task.next].as_mut().expect("list is linked").prev = task.prev;
        Some(task)
    }

    /// Borrows a task.
    pub fn get(&self, id: TaskId) -> Option<&Task<C>> {
        self.slots.get(id)?.as_ref()
    }

    /// Mutably borrows a task.
    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task<C>> {
        self.slots.get_mut(id)?.as_mut()
    }

    /// Successor in list order.
    pub fn next_of(&self, id: TaskId) -> TaskId {
        self.slots[id].as_ref().expect("task is live").next
    }

    /// Predecessor in list order.
    pub fn prev_of(&self, id: TaskId) -> TaskId {
        self.slots[id].as_ref().expect("task is live").prev
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether no task exists yet.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Selection policy: starting after `current`, picks the ready task
    /// that has been waiting the longest (`now - last_switch` maximal;
    /// ties go to the earliest in scan order). Returns `None` when no
    /// other task is eligible.
    pub fn select_next(&self, current: TaskId, now: Tick) -> Option<TaskId> {
        let mut selected = None;
        let mut waited_max: Tick = 0;

        let mut id = self.next_of(current);
        while id != current {
            let task = self.slots[id].as_ref().expect("list is linked");
            if task.ready && task.kind != TaskKind::DeletePending {
                let waited = now.saturating_sub(task.last_switch);
                if waited > waited_max || selected.is_none() {
                    waited_max = waited;
                    selected = Some(id);
                }
            }
            id = task.next;
        }
        selected
    }
}

impl<C> Default for TaskList<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_with_kernel() -> (TaskList<u32>, TaskId) {
        let mut list = TaskList::new();
        let k = list.init_kernel(VirtAddr::new(0xC010_0000), 0x4000, 0);
        (list, k)
    }

    fn add_task(list: &mut TaskList<u32>, anchor: TaskId, now: Tick) -> TaskId {
        let id = list.insert_after(
            anchor,
            TaskKind::User,
            2,
            VirtAddr::new(0xBFFF_0000),
            0x1000,
            now,
            0,
        );
        list.get_mut(id).unwrap().ready = true;
        id
    }

    #[test]
    fn kernel_task_is_self_linked() {
        let (list, k) = list_with_kernel();
        assert_eq!(list.next_of(k), k);
        assert_eq!(list.prev_of(k), k);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn list_stays_cyclic_through_inserts_and_removals() {
        let (mut list, k) = list_with_kernel();
        let a = add_task(&mut list, k, 0);
        let b = add_task(&mut list, k, 0);
        let c = add_task(&mut list, a, 0);

        // Walking `next` len() times from any node returns to it, and
        // `prev` is the inverse at every step.
        let n = list.len();
        for start in [k, a, b, c] {
            let mut id = start;
            for _ in 0..n {
                let next = list.next_of(id);
                assert_eq!(list.prev_of(next), id);
                id = next;
            }
            assert_eq!(id, start);
        }

        list.remove(b).unwrap();
        let n = list.len();
        assert_eq!(n, 3);
        let mut id = k;
        for _ in 0..n {
            id = list.next_of(id);
        }
        assert_eq!(id, k);
    }

    #[test]
    fn insert_places_task_after_anchor() {
        let (mut list, k) = list_with_kernel();
        let a = add_task(&mut list, k, 0);
        let b = add_task(&mut list, k, 0);
        // b was inserted after the kernel task, pushing a one step out.
        assert_eq!(list.next_of(k), b);
        assert_eq!(list.next_of(b), a);
        assert_eq!(list.next_of(a), k);
    }

    #[test]
    fn kernel_task_cannot_be_removed() {
        let (mut list, k) = list_with_kernel();
        assert!(list.remove(k).is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn slots_are_reused_after_removal() {
        let (mut list, k) = list_with_kernel();
        let a = add_task(&mut list, k, 0);
        list.remove(a).unwrap();
        let b = add_task(&mut list, k, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn select_prefers_longest_waiting_ready_task() {
        let (mut list, k) = list_with_kernel();
        let a = add_task(&mut list, k, 0);
        let b = add_task(&mut list, k, 0);
        list.get_mut(a).unwrap().last_switch = 100;
        list.get_mut(b).unwrap().last_switch = 50;

        // b has been waiting longer.
        assert_eq!(list.select_next(k, 1000), Some(b));
    }

    #[test]
    fn select_skips_not_ready_and_delete_pending() {
        let (mut list, k) = list_with_kernel();
        let a = add_task(&mut list, k, 0);
        let b = add_task(&mut list, k, 0);
        list.get_mut(a).unwrap().ready = false;
        list.get_mut(b).unwrap().kind = TaskKind::DeletePending;

        assert_eq!(list.select_next(k, 1000), None);
    }

    #[test]
    fn select_ties_go_to_scan_order() {
        let (mut list, k) = list_with_kernel();
        let a = add_task(&mut list, k, 7);
        let b = add_task(&mut list, k, 7);
        // Equal wait times: the first in scan order after `current` wins.
        // Scan from k visits b first (inserted last, directly after k).
        assert_eq!(list.select_next(k, 1000), Some(b));
        assert_eq!(list.select_next(b, 1000), Some(a));
    }

    #[test]
    fn select_returns_none_when_alone() {
        let (mut list, k) = list_with_kernel();
        list.get_mut(k).unwrap().ready = true;
        assert_eq!(list.select_next(k, 10), None);
    }
}
