//! Operating system execution control
use crate::{
    error::StatusType,
    klock::CpuLockGuard,
    port::Port,
    schedtbl::ScheduleTableStartMode,
    AppModeId, Kernel,
};

impl<P: Port> Kernel<'_, P> {
    /// The application mode `StartOS` was invoked with.
    pub fn get_active_application_mode(&self) -> AppModeId {
        self.app_mode
    }

    /// Start the operating system in the given application mode.
    ///
    /// Activates the idle task and the mode's auto-start tasks, arms the
    /// auto-start alarms, starts the auto-start schedule tables (in that
    /// order), invokes `StartupHook`, and dispatches the highest-priority
    /// ready task. On a real port the dispatch does not return.
    pub fn start_os(&mut self, mode: AppModeId) {
        let _lock = CpuLockGuard::<P>::acquire();
        self.app_mode = mode;

        // The idle task keeps the ready queue non-empty forever.
        let _ = self.sys_activate_task(self.cfg.idle_task);

        if let Some(tasks) = self.cfg.auto_tasks.get(mode) {
            for &tid in *tasks {
                let _ = self.sys_activate_task(tid);
                log::debug!("task {} auto started", tid.0);
            }
        }

        self.alarm_init(mode);
        self.schedule_table_init(mode);

        // StartupHook runs at the end of the initialization, before the
        // scheduler takes over.
        self.startup_hook();

        log::debug!("starting in application mode {mode}");
        self.jump_next();
    }

    /// Shut the operating system down.
    pub fn shutdown_os(&mut self, error: StatusType) {
        self.shutdown_hook(error);
        P::disable_all_interrupts();
    }

    /// Arm the alarms auto-started in `mode`.
    ///
    /// The configuration provides each auto-start alarm's initial expiration
    /// and cycle; at this point no counter has ever wrapped, so the queue
    /// insertion needs no epoch correction.
    fn alarm_init(&mut self, mode: AppModeId) {
        if let Some(alarms) = self.cfg.auto_alarms.get(mode) {
            for &aid in *alarms {
                self.activate_alarm(aid);
                log::debug!("alarm {} auto started", aid.0);
            }
        }
        P::timer_init();
    }

    /// Start the schedule tables auto-started in `mode`. Runs after task and
    /// alarm auto-start.
    fn schedule_table_init(&mut self, mode: AppModeId) {
        for entry in self.cfg.auto_schedule_tables {
            if entry.app_mode != mode {
                continue;
            }
            let ret = match entry.mode {
                ScheduleTableStartMode::Absolute => {
                    self.sys_start_schedule_table_abs(entry.table, entry.value)
                }
                ScheduleTableStartMode::Relative => {
                    self.sys_start_schedule_table_rel(entry.table, entry.value)
                }
                ScheduleTableStartMode::Synchron => {
                    self.sys_start_schedule_table_synchron(entry.table)
                }
            };
            debug_assert_eq!(ret, Ok(()));
            log::debug!("schedule table {} auto started", entry.table.0);
        }
    }
}
