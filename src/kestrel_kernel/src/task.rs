//! Tasks: control blocks, the dispatcher, and the task services
use core::fmt;

use crate::{
    error::{OsError, ServiceId, StatusType},
    klock::CpuLockGuard,
    port::Port,
    utils::Init,
    EventMask, Kernel, Priority, TaskId,
};

pub mod readyqueue;

bitflags::bitflags! {
    /// Task property and state flags.
    pub struct TaskFlags: u8 {
        /// The task was preempted from an interrupt handler and its context
        /// was saved by the interrupt entry path.
        const PREEMPT_CTX = 1 << 0;
        /// The task may be preempted by higher-priority tasks. A
        /// non-preemptable task additionally carries an internal resource
        /// whose ceiling is the highest priority.
        const PREEMPTABLE = 1 << 1;
        /// The task is an extended task and may block on events.
        const EXTENDED = 1 << 2;
    }
}

impl Init for TaskFlags {
    const INIT: Self = Self::empty();
}

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Not activated; the initial state of every task.
    Suspended,
    /// Activated and queued, waiting for the processor.
    Ready,
    /// Blocked on an event (extended tasks only).
    Waiting,
    /// Executing. At most one task is in this state.
    Running,
}

impl Init for TaskState {
    const INIT: Self = Self::Suspended;
}

/// The static properties of a task, produced by the configuration generator.
#[derive(Debug, Clone, Copy)]
pub struct TaskAttr {
    /// The entry point of the task.
    pub entry: fn(),
    /// The statically assigned priority. Greater values denote higher
    /// priorities; the idle task has priority 0.
    pub priority: Priority,
    /// The ceiling priority of the task's internal resource, if it has one.
    /// Applied by the dispatcher whenever the task starts running without
    /// external resources held.
    pub internal_ceiling: Option<Priority>,
    /// How many activations may be pending at once, including the running
    /// one. Must be at least 1; only basic tasks may use more.
    pub max_activations: u8,
    /// Size of the task's stack region in bytes, consumed by the port when
    /// initializing the task context.
    pub stack_size: usize,
    /// Static property flags ([`TaskFlags::EXTENDED`],
    /// [`TaskFlags::PREEMPTABLE`]).
    pub flags: TaskFlags,
}

/// *Task control block*: the mutable state of a task.
///
/// A task is created statically and never ceases to exist; it only moves
/// between the states of [`TaskState`].
pub struct Tcb<P: Port> {
    /// Port-managed per-task state (saved context, stack pointer).
    pub port_state: P::PortTaskState,
    pub(crate) flags: TaskFlags,
    /// Current priority; raised by resources, restored on release.
    pub(crate) priority: Priority,
    pub(crate) state: TaskState,
    /// Events currently set for the task.
    pub(crate) cevent: EventMask,
    /// Events the task is waiting for.
    pub(crate) wevent: EventMask,
    /// Pending activation count, including the running instance.
    pub(crate) act: u8,
    /// Top of the task's LIFO stack of occupied resources.
    pub(crate) res_top: Option<crate::ResourceId>,
    /// Link used while the task sits in a ready-queue slot.
    pub(crate) next_ready: Option<TaskId>,
}

impl<P: Port> Init for Tcb<P> {
    const INIT: Self = Self {
        port_state: Init::INIT,
        flags: TaskFlags::INIT,
        priority: 0,
        state: TaskState::INIT,
        cevent: 0,
        wevent: 0,
        act: 0,
        res_top: None,
        next_ready: None,
    };
}

impl<P: Port> fmt::Debug for Tcb<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("flags", &self.flags)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("cevent", &self.cevent)
            .field("wevent", &self.wevent)
            .field("act", &self.act)
            .field("res_top", &self.res_top)
            .finish()
    }
}

/// Tells [`Kernel::dispatch`] what happens to the outgoing task's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchKind {
    /// Preserve the outgoing context in its control block.
    Block,
    /// The outgoing task terminated; its context is gone.
    Discard,
}

/// The processing level a preemption check runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PreemptKind {
    /// Scheduler level: tail of a system service.
    Sched,
    /// Interrupt level: tail of a category-2 interrupt handler.
    Isr,
}

impl<'a, P: Port> Kernel<'a, P> {
    /// Activate a task.
    ///
    /// Increments the task's pending-activation count; if the task was
    /// Suspended it is (re)initialized and queued at the tail of its priority
    /// slot. May preempt the caller.
    pub fn activate_task(&mut self, tid: TaskId) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_activate_task(tid);
        if ret.is_ok() {
            self.preempt_point();
        }
        ret
    }

    /// Terminate the calling task.
    ///
    /// On success the call does not logically return; the next ready task is
    /// dispatched with the caller's context discarded.
    pub fn terminate_task(&mut self) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_terminate_task();
        self.finish(ServiceId::TerminateTask, [0; 3], ret)
    }

    /// Atomically activate `tid` and terminate the calling task.
    pub fn chain_task(&mut self, tid: TaskId) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_chain_task(tid);
        self.finish(ServiceId::ChainTask, [tid.0, 0, 0], ret)
    }

    /// Yield the processor within the calling task's internal-resource group.
    ///
    /// Has an effect only for tasks with an internal resource: the caller's
    /// priority drops to its original value and any ready task in the range
    /// `(original, internal ceiling]` is given the processor.
    pub fn schedule(&mut self) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_schedule();
        self.finish(ServiceId::Schedule, [0; 3], ret)
    }

    /// The id of the calling task, or `None` before the first dispatch.
    pub fn get_task_id(&self) -> Option<TaskId> {
        self.running_task
    }

    /// The current state of a task.
    pub fn get_task_state(&mut self, tid: TaskId) -> Result<TaskState, OsError> {
        let ret = self
            .validate_task_id(tid)
            .map(|()| self.data.tasks[tid.0].state);
        self.finish(ServiceId::GetTaskState, [tid.0, 0, 0], ret)
    }
}

// Service bodies and the dispatcher. Split from the public wrappers because
// alarm actions, expiry points and auto-start run the same paths without
// taking another lock or an inline preemption check.
impl<'a, P: Port> Kernel<'a, P> {
    pub(crate) fn validate_task_id(&self, tid: TaskId) -> StatusType {
        if tid.0 >= self.cfg.tasks.len() {
            return Err(OsError::Id);
        }
        Ok(())
    }

    pub(crate) fn sys_activate_task(&mut self, tid: TaskId) -> StatusType {
        let ret = self.do_sys_activate_task(tid);
        self.finish(ServiceId::ActivateTask, [tid.0, 0, 0], ret)
    }

    fn do_sys_activate_task(&mut self, tid: TaskId) -> StatusType {
        self.validate_task_id(tid)?;
        let attr = &self.cfg.tasks[tid.0];
        if self.data.tasks[tid.0].act >= attr.max_activations {
            log::debug!("too many activations of task {}", tid.0);
            return Err(OsError::Limit);
        }
        self.do_activate_task(tid);
        Ok(())
    }

    /// Unchecked activation: bump the activation count and, if the task was
    /// Suspended, initialize it and queue it at the tail of its slot.
    fn do_activate_task(&mut self, tid: TaskId) {
        self.data.tasks[tid.0].act += 1;
        if self.data.tasks[tid.0].state == TaskState::Suspended {
            self.init_task(tid);
            self.data.tasks[tid.0].state = TaskState::Ready;
            self.enqueue_task_tail(tid);
        }
    }

    fn sys_terminate_task(&mut self) -> StatusType {
        let cur = self.expect_running_task();
        if self.cfg.status_level.is_extended() {
            if self.data.tasks[cur.0].res_top.is_some() {
                return Err(OsError::Resource);
            }
            if self.nested_isrs != 0 {
                return Err(OsError::CallLevel);
            }
        }
        self.do_terminate_task();
        Ok(())
    }

    /// Shared tail of `TerminateTask` and `ChainTask`.
    fn do_terminate_task(&mut self) {
        let cur = self.expect_running_task();
        // PostTaskHook runs after executing the task but before it leaves the
        // Running state.
        self.post_task_hook();
        // Release the internal resource, if any.
        self.data.tasks[cur.0].priority = self.cfg.tasks[cur.0].priority;
        self.data.tasks[cur.0].act -= 1;
        if self.data.tasks[cur.0].act > 0 {
            // A pending activation remains; restart the task from scratch.
            self.init_task(cur);
            self.data.tasks[cur.0].state = TaskState::Ready;
            self.enqueue_task_tail(cur);
        } else {
            self.data.tasks[cur.0].state = TaskState::Suspended;
        }
        self.jump_next();
    }

    fn sys_chain_task(&mut self, tid: TaskId) -> StatusType {
        let cur = self.expect_running_task();
        if self.cfg.status_level.is_extended() {
            if self.data.tasks[cur.0].res_top.is_some() {
                return Err(OsError::Resource);
            }
            if self.nested_isrs != 0 {
                return Err(OsError::CallLevel);
            }
        }
        self.validate_task_id(tid)?;
        // Chaining self is not an additional activation request and is exempt
        // from the limit.
        if tid != cur && self.data.tasks[tid.0].act >= self.cfg.tasks[tid.0].max_activations {
            return Err(OsError::Limit);
        }

        if tid == cur {
            // Chaining self: re-enqueue at the slot tail without a full
            // suspend.
            self.post_task_hook();
            self.data.tasks[cur.0].priority = self.cfg.tasks[cur.0].priority;
            self.init_task(cur);
            self.data.tasks[cur.0].state = TaskState::Ready;
            self.enqueue_task_tail(cur);
            self.jump_next();
        } else {
            self.do_activate_task(tid);
            self.do_terminate_task();
        }
        Ok(())
    }

    fn sys_schedule(&mut self) -> StatusType {
        let cur = self.expect_running_task();
        if self.cfg.status_level.is_extended() {
            if self.data.tasks[cur.0].res_top.is_some() {
                return Err(OsError::Resource);
            }
            if self.nested_isrs != 0 {
                return Err(OsError::CallLevel);
            }
        }
        let Some(ceiling) = self.cfg.tasks[cur.0].internal_ceiling else {
            return Ok(());
        };
        let orig = self.cfg.tasks[cur.0].priority;
        // Yield only to tasks of the same group: those above the caller's
        // original priority but within the internal ceiling.
        if let Some(tid) = self.next_task(ceiling, orig + 1) {
            self.post_task_hook();
            self.data.tasks[cur.0].state = TaskState::Ready;
            // Release the internal resource while queued.
            self.data.tasks[cur.0].priority = orig;
            self.enqueue_task_tail(cur);
            self.dispatch(tid, DispatchKind::Block);
        }
        Ok(())
    }

    /// Reset a task's volatile state before it starts a fresh instance.
    pub(crate) fn init_task(&mut self, tid: TaskId) {
        let tcb = &mut self.data.tasks[tid.0];
        debug_assert_eq!(tcb.priority, self.cfg.tasks[tid.0].priority);
        debug_assert!(tcb.res_top.is_none());
        tcb.cevent = 0;
        tcb.wevent = 0;
        P::initialize_task_state(&self.cfg.tasks[tid.0], &self.data.tasks[tid.0].port_state);
    }

    fn make_running(&mut self, tid: TaskId) {
        let attr = &self.cfg.tasks[tid.0];
        let tcb = &mut self.data.tasks[tid.0];
        tcb.state = TaskState::Running;
        // The preemption-context flag never survives into the Running state.
        tcb.flags.remove(TaskFlags::PREEMPT_CTX);
        if let Some(ceiling) = attr.internal_ceiling {
            if tcb.res_top.is_none() {
                tcb.priority = ceiling;
            }
        }
    }

    /// Switch the processor to `tid`.
    pub(crate) fn dispatch(&mut self, tid: TaskId, kind: DispatchKind) {
        let from = match kind {
            DispatchKind::Discard => {
                self.running_task = Some(tid);
                None
            }
            DispatchKind::Block => self.running_task.replace(tid),
        };
        self.make_running(tid);
        // PreTaskHook runs after the transition to Running, before the task
        // executes.
        self.pre_task_hook();
        let tasks = &self.data.tasks;
        P::switch_task(
            from.map(|f| (f, &tasks[f.0].port_state)),
            (tid, &tasks[tid.0].port_state),
        );
    }

    /// Dispatch the highest-priority ready task, discarding the outgoing
    /// context.
    pub(crate) fn jump_next(&mut self) {
        let max = self.max_prio();
        let Some(tid) = self.next_task(max, 0) else {
            // The idle task is always runnable; an empty queue here means the
            // configuration is corrupt.
            panic!("ready queue empty");
        };
        self.dispatch(tid, DispatchKind::Discard);
    }

    /// If a task of strictly higher priority than the running task is ready,
    /// preempt. Runs at the tail of every service that can make a task ready
    /// and at the tail of every category-2 interrupt handler.
    pub(crate) fn check_preemption(&mut self, kind: PreemptKind) {
        let Some(cur) = self.running_task else {
            debug_assert!(false, "preemption check without a running task");
            return;
        };
        // A non-preemptable task holds an internal resource with the highest
        // ceiling, so this search never finds a candidate for it.
        let max = self.max_prio();
        let cur_prio = self.data.tasks[cur.0].priority;
        if let Some(tid) = self.next_task(max, cur_prio + 1) {
            self.post_task_hook();
            let tcb = &mut self.data.tasks[cur.0];
            tcb.state = TaskState::Ready;
            match kind {
                PreemptKind::Isr => tcb.flags.insert(TaskFlags::PREEMPT_CTX),
                PreemptKind::Sched => tcb.flags.remove(TaskFlags::PREEMPT_CTX),
            }
            // The preempted task resumes ahead of its priority class.
            self.enqueue_task_head(cur);
            self.dispatch(tid, DispatchKind::Block);
        }
    }

    /// Inline preemption check for task-level service calls. Inside a
    /// category-2 handler the check is deferred to the handler's exit; before
    /// `StartOS` there is nothing to preempt.
    pub(crate) fn preempt_point(&mut self) {
        if self.nested_isrs == 0 && self.running_task.is_some() {
            self.check_preemption(PreemptKind::Sched);
        }
    }

    /// Critical-section guard for a task-level service invocation. Interrupt
    /// handlers already run with the OS interrupts masked.
    pub(crate) fn service_lock(&self) -> Option<CpuLockGuard<P>> {
        (self.nested_isrs == 0).then(CpuLockGuard::acquire)
    }

    #[inline]
    pub(crate) fn max_prio(&self) -> Priority {
        self.cfg.num_priorities - 1
    }

    #[inline]
    pub(crate) fn expect_running_task(&self) -> TaskId {
        let Some(cur) = self.running_task else {
            panic!("no running task");
        };
        cur
    }
}
