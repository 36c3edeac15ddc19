//! Cycle scheduler shared by every clocked component.
//!
//! Tasks are plain data: a [`TaskKind`] plus an opaque argument. Components
//! register the tasks they own once at construction and then schedule,
//! cancel and reschedule them by [`TaskId`]. The owner of the scheduler
//! (the machine) decides what a firing task does, so nothing here captures
//! behavior and the set of pending tasks can be written into a snapshot.
//!
//! Every task remembers its slot in the binary heap, which makes `cancel`
//! O(log n) without searching. All cycle counts are CPU machine cycles.

use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    TimerOverflow,
    TimerReload,
    AudioFrameTick,
    AudioSampleTick,
}

impl TaskKind {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            TaskKind::TimerOverflow => 0,
            TaskKind::TimerReload => 1,
            TaskKind::AudioFrameTick => 2,
            TaskKind::AudioSampleTick => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TaskKind::TimerOverflow),
            1 => Some(TaskKind::TimerReload),
            2 => Some(TaskKind::AudioFrameTick),
            3 => Some(TaskKind::AudioSampleTick),
            _ => None,
        }
    }
}

/// Handle to a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(usize);

#[derive(Debug, Clone)]
struct Task {
    kind: TaskKind,
    arg: u32,
    target: u64,
    /// Slot in `Scheduler::heap`, or -1 while unscheduled.
    heap_index: i32,
}

#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    now: u64,
    tasks: Vec<Task>,
    heap: Vec<TaskId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task to the arena. It starts unscheduled.
    pub fn register(&mut self, kind: TaskKind, arg: u32) -> TaskId {
        self.tasks.push(Task {
            kind,
            arg,
            target: 0,
            heap_index: -1,
        });
        TaskId(self.tasks.len() - 1)
    }

    /// Cumulative cycle count.
    #[inline]
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn kind(&self, id: TaskId) -> TaskKind {
        self.tasks[id.0].kind
    }

    pub fn arg(&self, id: TaskId) -> u32 {
        self.tasks[id.0].arg
    }

    pub fn heap_index(&self, id: TaskId) -> i32 {
        self.tasks[id.0].heap_index
    }

    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.tasks[id.0].heap_index >= 0
    }

    /// Target cycle of a scheduled task.
    pub fn target(&self, id: TaskId) -> Option<u64> {
        let task = &self.tasks[id.0];
        (task.heap_index >= 0).then_some(task.target)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn next_target(&self) -> Option<u64> {
        self.heap.first().map(|id| self.tasks[id.0].target)
    }

    /// Schedule `id` to fire at the absolute cycle `target`. A task that is
    /// already pending is moved to the new target.
    pub fn schedule(&mut self, id: TaskId, target: u64) {
        if self.is_scheduled(id) {
            self.cancel(id);
        }
        self.tasks[id.0].target = target;
        let slot = self.heap.len();
        self.heap.push(id);
        self.tasks[id.0].heap_index = slot as i32;
        self.sift_up(slot);
    }

    /// Schedule `id` to fire `delay` cycles from now.
    pub fn schedule_in(&mut self, id: TaskId, delay: u64) {
        self.schedule(id, self.now + delay);
    }

    /// Remove a pending task. Cancelling an unscheduled task does nothing.
    pub fn cancel(&mut self, id: TaskId) {
        let slot = self.tasks[id.0].heap_index;
        if slot < 0 {
            return;
        }
        self.remove_at(slot as usize);
    }

    /// Move the clock forward by `elapsed` cycles, firing every task whose
    /// target falls inside the window in target order.
    ///
    /// While a task fires, [`Scheduler::now`] reads as that task's target so
    /// periodic tasks can reschedule relative to their own deadline. `fire`
    /// may schedule or cancel any task, including the one being fired.
    pub fn advance<F>(&mut self, elapsed: u64, mut fire: F)
    where
        F: FnMut(&mut Scheduler, TaskId),
    {
        let end = self.now + elapsed;
        while let Some(&id) = self.heap.first() {
            let target = self.tasks[id.0].target;
            if target > end {
                break;
            }
            self.remove_at(0);
            self.now = self.now.max(target);
            trace!("task {:?}({}) fired at {}", self.tasks[id.0].kind, self.tasks[id.0].arg, target);
            fire(self, id);
        }
        self.now = end;
    }

    /// Drop every pending task without firing it.
    pub fn clear(&mut self) {
        for id in self.heap.drain(..) {
            self.tasks[id.0].heap_index = -1;
        }
    }

    /// Restore the clock, e.g. while loading a snapshot after [`Scheduler::clear`].
    pub(crate) fn set_now(&mut self, now: u64) {
        self.now = now;
    }

    /// Pending tasks in heap order.
    pub fn pending(&self) -> impl Iterator<Item = (TaskId, u64)> + '_ {
        self.heap.iter().map(|&id| (id, self.tasks[id.0].target))
    }

    /// Find a registered task by its kind and argument.
    pub fn find(&self, kind: TaskKind, arg: u32) -> Option<TaskId> {
        self.tasks
            .iter()
            .position(|t| t.kind == kind && t.arg == arg)
            .map(TaskId)
    }

    fn remove_at(&mut self, slot: usize) {
        let last = self.heap.len() - 1;
        let removed = self.heap[slot];
        self.heap.swap(slot, last);
        self.heap.pop();
        self.tasks[removed.0].heap_index = -1;
        if slot < self.heap.len() {
            self.tasks[self.heap[slot].0].heap_index = slot as i32;
            let slot = self.sift_up(slot);
            self.sift_down(slot);
        }
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.tasks[self.heap[a].0].target < self.tasks[self.heap[b].0].target
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.tasks[self.heap[a].0].heap_index = a as i32;
        self.tasks[self.heap[b].0].heap_index = b as i32;
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.less(slot, parent) {
                break;
            }
            self.swap_slots(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap_slots(slot, smallest);
            slot = smallest;
        }
    }

    #[cfg(test)]
    fn check_indices(&self) {
        for (slot, id) in self.heap.iter().enumerate() {
            assert_eq!(self.tasks[id.0].heap_index, slot as i32);
            if slot > 0 {
                let parent = (slot - 1) / 2;
                assert!(self.tasks[self.heap[parent].0].target <= self.tasks[id.0].target);
            }
        }
        let scheduled = self.tasks.iter().filter(|t| t.heap_index >= 0).count();
        assert_eq!(scheduled, self.heap.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn arena(n: usize) -> (Scheduler, Vec<TaskId>) {
        let mut s = Scheduler::new();
        let ids = (0..n)
            .map(|i| s.register(TaskKind::AudioSampleTick, i as u32))
            .collect();
        (s, ids)
    }

    #[test]
    fn randomized_insert_cancel_keeps_heap_indices() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..50 {
            let (mut s, ids) = arena(64);
            for _ in 0..400 {
                let id = ids[rng.gen_range(0..ids.len())];
                if rng.gen_bool(0.6) {
                    // Narrow range forces plenty of duplicate targets.
                    s.schedule(id, rng.gen_range(0..32));
                } else {
                    s.cancel(id);
                }
                s.check_indices();
            }

            let mut last = 0;
            let mut fired = Vec::new();
            s.advance(u64::MAX / 2, |sched, id| {
                sched.check_indices();
                fired.push((id, sched.now()));
            });
            for (id, at) in fired {
                assert!(at >= last);
                last = at;
                assert_eq!(s.heap_index(id), -1);
            }
            assert!(s.is_empty());
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let (mut s, ids) = arena(3);
        s.schedule(ids[0], 10);
        s.schedule(ids[1], 5);
        s.cancel(ids[0]);
        s.cancel(ids[0]);
        s.cancel(ids[2]);
        assert_eq!(s.heap_index(ids[0]), -1);
        assert_eq!(s.len(), 1);
        s.check_indices();
    }

    #[test]
    fn advance_fires_only_due_tasks() {
        let (mut s, ids) = arena(2);
        s.schedule(ids[0], 4);
        s.schedule(ids[1], 9);
        let mut fired = Vec::new();
        s.advance(5, |_, id| fired.push(id));
        assert_eq!(fired, vec![ids[0]]);
        assert_eq!(s.now(), 5);
        assert!(s.is_scheduled(ids[1]));
    }

    #[test]
    fn task_can_reschedule_itself() {
        let (mut s, ids) = arena(1);
        s.schedule(ids[0], 3);
        let mut count = 0;
        s.advance(10, |sched, id| {
            count += 1;
            sched.schedule_in(id, 3);
        });
        // fires at 3, 6, 9
        assert_eq!(count, 3);
        assert_eq!(s.target(ids[0]), Some(12));
    }

    #[test]
    fn clear_unschedules_everything() {
        let (mut s, ids) = arena(4);
        for (i, id) in ids.iter().enumerate() {
            s.schedule(*id, i as u64);
        }
        s.clear();
        assert!(s.is_empty());
        assert!(ids.iter().all(|id| s.heap_index(*id) == -1));
        let mut fired = false;
        s.advance(100, |_, _| fired = true);
        assert!(!fired);
    }
}
