//! The architecture collaborator interface
//!
//! The kernel proper is architecture-agnostic. Everything that must touch the
//! processor (context initialization, the actual context switch, the timer
//! tick source, and the interrupt mask) is funneled through [`Port`], which
//! a port crate implements for a concrete target. [`kestrel_port_std`] is the
//! hosted reference implementation used by the test suite.
//!
//! [`kestrel_port_std`]: https://docs.rs/kestrel_port_std
use crate::{task::TaskAttr, utils::Init, TaskId};

/// Implemented by a port to provide the architecture-specific part of the
/// kernel.
///
/// All methods are associated functions: a port represents the one processor
/// the kernel runs on, not an object. Methods that need per-task storage
/// receive a reference to the task's [`Port::PortTaskState`], which lives
/// inside the task control block and is exclusively managed by the port
/// (through interior mutability if the port needs to mutate it).
pub trait Port {
    /// Port-specific per-task state, usually the saved processor context and
    /// the stack pointer. Whether this holds general-purpose or FPU registers
    /// is decided by the port at compile time; the kernel never inspects it.
    type PortTaskState: Init + 'static;

    /// Prepare `state` so that the task will start executing from
    /// `attr.entry` on a fresh stack the next time it is switched to.
    ///
    /// Called whenever a task moves out of the Suspended state.
    fn initialize_task_state(attr: &TaskAttr, state: &Self::PortTaskState);

    /// Perform the context switch to `to`.
    ///
    /// `from` carries the outgoing task when its context must be preserved
    /// (the *block* flavor of dispatching). `None` means the outgoing
    /// context is discarded because the previous task terminated or there
    /// was no previous task.
    ///
    /// On a real target this function returns only when the `from` task is
    /// scheduled again.
    fn switch_task(
        from: Option<(TaskId, &Self::PortTaskState)>,
        to: (TaskId, &Self::PortTaskState),
    );

    /// Bring up the hardware tick source driving the system counter.
    fn timer_init();

    /// Unmask all maskable interrupts.
    fn enable_all_interrupts();

    /// Mask all maskable interrupts.
    fn disable_all_interrupts();

    /// Mask all interrupts, remembering the previous mask so that
    /// [`Port::resume_all_interrupts`] can restore it.
    fn suspend_all_interrupts();

    /// Restore the mask saved by [`Port::suspend_all_interrupts`].
    fn resume_all_interrupts();

    /// Mask the interrupt priorities managed by the OS (category-2 sources).
    fn suspend_os_interrupts();

    /// Restore the mask saved by [`Port::suspend_os_interrupts`].
    fn resume_os_interrupts();
}
