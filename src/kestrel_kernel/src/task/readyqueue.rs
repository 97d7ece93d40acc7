//! Task ready queue implementation (internal use only).
//!
//! The queue is an array of FIFO slots indexed by priority. Tasks are linked
//! through the `next_ready` field of their control blocks, so a slot never
//! needs more backing storage than a head and a tail reference. A task is
//! queued in the slot of its *current* priority, which may have been raised
//! by a resource.
use crate::{port::Port, utils::Init, Kernel, Priority, TaskId};

/// One priority slot of the ready queue: a FIFO of task control blocks
/// ordered by arrival time, oldest at the head.
#[derive(Debug, Clone, Copy)]
pub struct ReadySlot {
    head: Option<TaskId>,
    tail: Option<TaskId>,
}

impl Init for ReadySlot {
    const INIT: Self = Self {
        head: None,
        tail: None,
    };
}

impl<P: Port> Kernel<'_, P> {
    /// Append `tid` to the FIFO of its current priority. Newly activated and
    /// re-activated tasks enter here.
    pub(crate) fn enqueue_task_tail(&mut self, tid: TaskId) {
        let prio = self.data.tasks[tid.0].priority;
        self.data.tasks[tid.0].next_ready = None;
        match self.data.ready[prio].tail {
            None => {
                self.data.ready[prio].head = Some(tid);
                self.data.ready[prio].tail = Some(tid);
            }
            Some(tail) => {
                self.data.tasks[tail.0].next_ready = Some(tid);
                self.data.ready[prio].tail = Some(tid);
            }
        }
    }

    /// Prepend `tid` to the FIFO of its current priority. A preempted task is
    /// considered the first task of its priority class and enters here.
    pub(crate) fn enqueue_task_head(&mut self, tid: TaskId) {
        let prio = self.data.tasks[tid.0].priority;
        let head = self.data.ready[prio].head;
        self.data.tasks[tid.0].next_ready = head;
        self.data.ready[prio].head = Some(tid);
        if head.is_none() {
            self.data.ready[prio].tail = Some(tid);
        }
    }

    /// Return the next ready task whose priority lies in `min..=max`,
    /// scanning from the highest slot down, and remove it from the queue.
    pub(crate) fn next_task(&mut self, max: Priority, min: Priority) -> Option<TaskId> {
        for prio in (min..=max).rev() {
            if let Some(head) = self.data.ready[prio].head {
                let next = self.data.tasks[head.0].next_ready.take();
                self.data.ready[prio].head = next;
                if next.is_none() {
                    self.data.ready[prio].tail = None;
                }
                return Some(head);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use crate::cfg::test_fixture::*;
    use crate::*;

    #[test]
    fn fifo_within_one_priority() {
        let attrs = [task_attr(0), task_attr(1), task_attr(1), task_attr(1)];
        let cfg = small_cfg(&attrs);
        kernel_fixture!(k, &cfg);

        for t in [1, 2, 3] {
            k.data.tasks[t].priority = 1;
            k.enqueue_task_tail(TaskId(t));
        }
        assert_eq!(k.next_task(2, 0), Some(TaskId(1)));
        assert_eq!(k.next_task(2, 0), Some(TaskId(2)));
        assert_eq!(k.next_task(2, 0), Some(TaskId(3)));
        assert_eq!(k.next_task(2, 0), None);
    }

    #[test]
    fn head_insert_resumes_first() {
        let attrs = [task_attr(0), task_attr(1), task_attr(1)];
        let cfg = small_cfg(&attrs);
        kernel_fixture!(k, &cfg);

        k.enqueue_task_tail(TaskId(1));
        k.enqueue_task_head(TaskId(2));
        assert_eq!(k.next_task(2, 0), Some(TaskId(2)));
        assert_eq!(k.next_task(2, 0), Some(TaskId(1)));
    }

    #[test]
    fn higher_slot_wins_and_min_bound_is_respected() {
        let attrs = [task_attr(0), task_attr(1), task_attr(2)];
        let cfg = small_cfg(&attrs);
        kernel_fixture!(k, &cfg);

        k.enqueue_task_tail(TaskId(1));
        k.enqueue_task_tail(TaskId(2));
        // Nothing above priority 2.
        assert_eq!(k.next_task(2, 3), None);
        assert_eq!(k.next_task(2, 0), Some(TaskId(2)));
        assert_eq!(k.next_task(2, 2), None);
        assert_eq!(k.next_task(2, 1), Some(TaskId(1)));
    }
}
