//! Interrupt management
//!
//! Two ISR categories: category-1 handlers bypass the kernel entirely and may
//! only use the interrupt-masking services; category-2 handlers run under the
//! kernel's wing: the glue counts the nesting depth and finishes the
//! outermost handler with a preemption check, which is the only point where
//! task activations or events signalled from the handler can manifest as a
//! context switch.
//!
//! The masking services come in three disciplines: `DisableAll`/`EnableAll`
//! (a single, non-nestable level), and the nestable `SuspendAll`/`ResumeAll`
//! and `SuspendOS`/`ResumeOS` pairs with saved-count bookkeeping.
use crate::{port::Port, task::PreemptKind, utils::Init, IsrId, Kernel};

/// The category of an interrupt service routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrCategory {
    /// Never interacts with the kernel; lowest latency.
    One,
    /// May call the restricted set of system services that can make tasks
    /// ready.
    Two,
}

/// The static properties of an interrupt service routine.
#[derive(Debug, Clone, Copy)]
pub struct IsrAttr {
    /// The routine's category.
    pub category: IsrCategory,
    /// The hardware priority the generator assigned to the source.
    pub priority: usize,
}

impl Init for IsrAttr {
    const INIT: Self = Self {
        category: IsrCategory::Two,
        priority: 0,
    };
}

impl<P: Port> Kernel<'_, P> {
    /// Kernel glue around a user interrupt handler.
    ///
    /// The port's vector stub routes an interrupt here. For a category-2
    /// routine the nesting counter is maintained and the outermost handler
    /// exit performs the preemption check.
    pub fn service_isr(&mut self, isr: IsrId, handler: impl FnOnce(&mut Self)) {
        match self.cfg.isrs[isr.0].category {
            IsrCategory::One => handler(self),
            IsrCategory::Two => {
                self.nested_isrs += 1;
                handler(self);
                self.nested_isrs -= 1;
                if self.nested_isrs == 0 {
                    self.check_preemption(PreemptKind::Isr);
                }
            }
        }
    }

    /// Disable all interrupts. May not be nested; the only services allowed
    /// until the matching [`Kernel::enable_all_interrupts`] are none at all.
    pub fn disable_all_interrupts(&mut self) {
        P::disable_all_interrupts();
        self.disable_all_count += 1;
        if self.disable_all_count != 1 {
            panic!("DisableAllInterrupts nested");
        }
    }

    /// Re-enable all interrupts after [`Kernel::disable_all_interrupts`].
    pub fn enable_all_interrupts(&mut self) {
        // Tolerate a stray call without a preceding disable.
        P::disable_all_interrupts();
        if self.disable_all_count > 0 {
            self.disable_all_count -= 1;
        }
        P::enable_all_interrupts();
    }

    /// Suspend all interrupts; nestable.
    pub fn suspend_all_interrupts(&mut self) {
        P::suspend_all_interrupts();
        self.suspend_all_count += 1;
    }

    /// Leave one level of the `SuspendAll` critical section, restoring the
    /// mask state the remaining nesting calls for.
    pub fn resume_all_interrupts(&mut self) {
        P::suspend_all_interrupts();
        if self.suspend_all_count > 0 {
            self.suspend_all_count -= 1;
        }
        if self.suspend_all_count > 0 {
            // Still inside an outer SuspendAll section.
        } else if self.suspend_os_count > 0 {
            P::suspend_os_interrupts();
        } else {
            P::resume_os_interrupts();
        }
    }

    /// Suspend the OS-managed interrupt priorities; nestable.
    pub fn suspend_os_interrupts(&mut self) {
        P::suspend_all_interrupts();
        self.suspend_os_count += 1;
        if self.suspend_all_count == 0 {
            P::suspend_os_interrupts();
        }
    }

    /// Leave one level of the `SuspendOS` critical section.
    pub fn resume_os_interrupts(&mut self) {
        P::suspend_all_interrupts();
        if self.suspend_os_count > 0 {
            self.suspend_os_count -= 1;
        }
        if self.suspend_all_count > 0 {
            // An enclosing SuspendAll section keeps everything masked.
        } else if self.suspend_os_count > 0 {
            P::suspend_os_interrupts();
        } else {
            P::resume_os_interrupts();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cfg::test_fixture::*;
    use crate::*;

    #[test]
    fn suspend_resume_nesting() {
        let attrs = [task_attr(0)];
        let cfg = small_cfg(&attrs);
        kernel_fixture!(k, &cfg);

        k.suspend_all_interrupts();
        k.suspend_all_interrupts();
        k.suspend_os_interrupts();
        k.resume_all_interrupts();
        assert_eq!(k.suspend_all_count, 1);
        assert_eq!(k.suspend_os_count, 1);
        k.resume_all_interrupts();
        k.resume_os_interrupts();
        assert_eq!(k.suspend_all_count, 0);
        assert_eq!(k.suspend_os_count, 0);
    }

    #[test]
    #[should_panic(expected = "DisableAllInterrupts nested")]
    fn disable_all_cannot_nest() {
        let attrs = [task_attr(0)];
        let cfg = small_cfg(&attrs);
        kernel_fixture!(k, &cfg);

        k.disable_all_interrupts();
        k.disable_all_interrupts();
    }

    #[test]
    fn services_from_isr_are_deferred_and_refused() {
        let mut attrs = [task_attr(0), task_attr(2), task_attr(4)];
        attrs[1].flags |= TaskFlags::EXTENDED;
        let isrs = [IsrAttr {
            category: IsrCategory::Two,
            priority: 1,
        }];
        let mut cfg = small_cfg(&attrs);
        cfg.isrs = &isrs;
        kernel_fixture!(k, &cfg);
        k.sys_activate_task(TaskId(1)).unwrap();
        k.jump_next();

        k.service_isr(IsrId(0), |k| {
            // Blocking and termination are call-level errors inside an ISR.
            assert_eq!(k.wait_event(1), Err(OsError::CallLevel));
            assert_eq!(k.terminate_task(), Err(OsError::CallLevel));
            // Activation succeeds but must not switch before the ISR ends.
            k.activate_task(TaskId(2)).unwrap();
            assert_eq!(k.get_task_id(), Some(TaskId(1)));
        });
        // The preemption check at ISR exit performed the switch and flagged
        // the preempted task's context.
        assert_eq!(k.get_task_id(), Some(TaskId(2)));
        assert!(k.data.tasks[1].flags.contains(TaskFlags::PREEMPT_CTX));
    }
}
