//! Optional application hook routines
use crate::{
    error::{OsError, StatusType},
    port::Port,
    utils::Init,
    Kernel,
};

/// The set of optional hook routines supplied by the application.
///
/// Each hook is invoked exactly where the OSEK specification places it:
///
///  - `startup` at the end of `StartOS`, before the first task is dispatched.
///  - `shutdown` from `ShutdownOS`.
///  - `error` whenever a service returns an error, with re-entry suppressed
///    while the hook itself is running.
///  - `pre_task` after a task enters the Running state, before it executes.
///  - `post_task` after a task executed, before it leaves the Running state.
#[derive(Clone, Copy)]
pub struct HookTable {
    /// `StartupHook`
    pub startup: Option<fn()>,
    /// `ShutdownHook`
    pub shutdown: Option<fn(StatusType)>,
    /// `ErrorHook`
    pub error: Option<fn(OsError)>,
    /// `PreTaskHook`
    pub pre_task: Option<fn()>,
    /// `PostTaskHook`
    pub post_task: Option<fn()>,
}

impl Init for HookTable {
    const INIT: Self = Self {
        startup: None,
        shutdown: None,
        error: None,
        pre_task: None,
        post_task: None,
    };
}

impl<P: Port> Kernel<'_, P> {
    #[inline]
    pub(crate) fn startup_hook(&self) {
        if let Some(hook) = self.cfg.hooks.startup {
            hook();
        }
    }

    #[inline]
    pub(crate) fn shutdown_hook(&self, error: StatusType) {
        if let Some(hook) = self.cfg.hooks.shutdown {
            hook(error);
        }
    }

    #[inline]
    pub(crate) fn pre_task_hook(&self) {
        if let Some(hook) = self.cfg.hooks.pre_task {
            hook();
        }
    }

    #[inline]
    pub(crate) fn post_task_hook(&self) {
        if let Some(hook) = self.cfg.hooks.post_task {
            hook();
        }
    }

    /// Invoke `ErrorHook`, suppressing recursive invocations while the hook
    /// is already running.
    pub(crate) fn error_hook(&mut self, e: OsError) {
        if self.in_error_hook {
            return;
        }
        if let Some(hook) = self.cfg.hooks.error {
            self.in_error_hook = true;
            hook(e);
            self.in_error_hook = false;
        }
    }
}
