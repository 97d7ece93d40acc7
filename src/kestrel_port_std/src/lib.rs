//! Simulation environment for running the Kestrel kernel on a hosted target.
//!
//! [`StdPort`] implements the kernel's architecture-collaborator trait with
//! plain bookkeeping instead of real context switches: every dispatch is
//! appended to a per-thread switch log, and the interrupt mask is a pair of
//! counters. This is enough to drive the whole kernel state machine from
//! ordinary test code: the kernel performs all scheduling decisions *before*
//! handing over to the port, so a recorded switch is exactly what a real
//! port would have executed.
//!
//! State is thread-local so that `cargo test`'s parallel test threads get
//! independent instances.
use std::cell::{Cell, RefCell};

use kestrel_kernel::{port::Port, utils::Init, TaskAttr, TaskId};

/// The hosted port.
pub struct StdPort;

/// Per-task state of the hosted port: just a flag tracking whether the task
/// context was (re)initialized, which a real port would use to build the
/// initial stack frame.
pub struct TaskState {
    initialized: Cell<bool>,
}

impl TaskState {
    /// Whether `initialize_task_state` ran for this task since the last
    /// switch away from it.
    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }
}

impl Init for TaskState {
    const INIT: Self = Self {
        initialized: Cell::new(false),
    };
}

/// One recorded context switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// The outgoing task, `None` when its context was discarded.
    pub from: Option<TaskId>,
    /// The incoming task.
    pub to: TaskId,
}

thread_local! {
    static SWITCH_LOG: RefCell<Vec<Switch>> = const { RefCell::new(Vec::new()) };
    static ALL_MASKED: Cell<u32> = const { Cell::new(0) };
    static SUSPEND_DEPTH: Cell<u32> = const { Cell::new(0) };
    static TIMER_RUNNING: Cell<bool> = const { Cell::new(false) };
}

impl Port for StdPort {
    type PortTaskState = TaskState;

    fn initialize_task_state(_attr: &TaskAttr, state: &TaskState) {
        state.initialized.set(true);
    }

    fn switch_task(from: Option<(TaskId, &TaskState)>, to: (TaskId, &TaskState)) {
        log::trace!("switch {:?} -> {:?}", from.map(|f| f.0), to.0);
        SWITCH_LOG.with(|log| {
            log.borrow_mut().push(Switch {
                from: from.map(|(tid, _)| tid),
                to: to.0,
            })
        });
    }

    fn timer_init() {
        TIMER_RUNNING.with(|t| t.set(true));
    }

    fn enable_all_interrupts() {
        ALL_MASKED.with(|m| m.set(m.get().saturating_sub(1)));
    }

    fn disable_all_interrupts() {
        ALL_MASKED.with(|m| m.set(m.get() + 1));
    }

    fn suspend_all_interrupts() {
        SUSPEND_DEPTH.with(|d| d.set(d.get() + 1));
    }

    fn resume_all_interrupts() {
        SUSPEND_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }

    fn suspend_os_interrupts() {
        SUSPEND_DEPTH.with(|d| d.set(d.get() + 1));
    }

    fn resume_os_interrupts() {
        SUSPEND_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

/// Drain and return this thread's recorded context switches.
pub fn take_switch_log() -> Vec<Switch> {
    SWITCH_LOG.with(|log| log.borrow_mut().split_off(0))
}

/// Whether `Port::timer_init` ran on this thread.
pub fn timer_initialized() -> bool {
    TIMER_RUNNING.with(|t| t.get())
}

/// Initialize `env_logger` for a test binary. Safe to call repeatedly.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
