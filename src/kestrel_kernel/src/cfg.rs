//! Static configuration input
//!
//! An application is compiled together with a configuration emitted by the
//! generator: a [`KernelCfg`] holding the immutable attribute tables and
//! auto-start vectors, and a [`KernelData`] lending the kernel its mutable
//! backing storage: control-block arrays sized to the attribute tables plus
//! the ready-queue slots. Every id in the system is an index into one of
//! these arrays.
use crate::{
    alarm::{AlarmAttr, AlarmCb},
    counter::{AlarmBase, CounterCb},
    hook::HookTable,
    interrupt::IsrAttr,
    port::Port,
    resource::{ResourceAttr, ResourceCb},
    schedtbl::{ScheduleTableAttr, ScheduleTableAutoStart, ScheduleTableCb},
    task::{readyqueue::ReadySlot, TaskAttr, Tcb},
    AlarmId, CounterId, TaskId,
};

/// Error-checking level the kernel was configured for.
///
/// Extended status performs the full canonical precondition checks (id
/// validity, object state, value range) on every service; standard status
/// keeps only the checks whose omission would corrupt kernel state, which in
/// this implementation are the id checks guarding array accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    /// Production error checking.
    Standard,
    /// Full error checking, for development.
    Extended,
}

impl StatusLevel {
    #[inline]
    pub(crate) fn is_extended(self) -> bool {
        self == Self::Extended
    }
}

/// The immutable half of the configuration: attribute tables, auto-start
/// vectors, and hooks.
///
/// Auto-start vectors are indexed by application mode; a mode beyond a
/// vector's length simply auto-starts nothing of that kind.
#[derive(Clone, Copy)]
pub struct KernelCfg<'a> {
    /// Error-checking level.
    pub status_level: StatusLevel,
    /// Number of task priority levels; valid priorities are
    /// `0..num_priorities`.
    pub num_priorities: usize,
    /// Task attributes, indexed by [`TaskId`].
    pub tasks: &'a [TaskAttr],
    /// The always-runnable lowest-priority task dispatched when nothing else
    /// is ready. Activated by `StartOS`; must never terminate or wait.
    pub idle_task: TaskId,
    /// Resource attributes, indexed by [`crate::ResourceId`]. Entry 0 is
    /// `RES_SCHEDULER`.
    pub resources: &'a [ResourceAttr],
    /// Counter attributes, indexed by [`CounterId`].
    pub counters: &'a [AlarmBase],
    /// The counter advanced by [`crate::Kernel::tick_handler`].
    pub sys_counter: CounterId,
    /// Alarm attributes, indexed by [`AlarmId`].
    pub alarms: &'a [AlarmAttr],
    /// Schedule table attributes, indexed by [`crate::ScheduleTableId`].
    pub schedule_tables: &'a [ScheduleTableAttr<'a>],
    /// ISR attributes, indexed by [`crate::IsrId`].
    pub isrs: &'a [IsrAttr],
    /// Per-application-mode task auto-start vectors.
    pub auto_tasks: &'a [&'a [TaskId]],
    /// Per-application-mode alarm auto-start vectors. The initial expiration
    /// and cycle come from the alarm attributes.
    pub auto_alarms: &'a [&'a [AlarmId]],
    /// Schedule-table auto-start entries, filtered by application mode.
    pub auto_schedule_tables: &'a [ScheduleTableAutoStart],
    /// Optional application hooks.
    pub hooks: HookTable,
}

impl KernelCfg<'_> {
    /// Check the structural consistency the generator is supposed to
    /// guarantee. Violations are configuration bugs, not run-time errors.
    pub(crate) fn validate(&self) {
        assert!(self.num_priorities >= 1, "no priority levels");
        assert!(self.idle_task.0 < self.tasks.len(), "idle task id invalid");
        assert_eq!(
            self.tasks[self.idle_task.0].priority, 0,
            "idle task must have the lowest priority"
        );
        assert!(
            self.tasks[self.idle_task.0].max_activations >= 1,
            "idle task needs an activation"
        );
        for attr in self.tasks {
            assert!(attr.priority < self.num_priorities, "task priority range");
            assert!(attr.max_activations >= 1, "max_activations range");
            if let Some(ceiling) = attr.internal_ceiling {
                assert!(ceiling < self.num_priorities, "internal ceiling range");
                assert!(ceiling >= attr.priority, "internal ceiling below priority");
            }
        }
        for attr in self.resources {
            assert!(attr.ceiling < self.num_priorities, "resource ceiling range");
        }
        if !self.counters.is_empty() {
            assert!(self.sys_counter.0 < self.counters.len(), "system counter id");
        }
        for attr in self.alarms {
            assert!(attr.counter.0 < self.counters.len(), "alarm counter id");
        }
        for attr in self.schedule_tables {
            assert!(attr.counter.0 < self.counters.len(), "table counter id");
            assert!(!attr.exps.is_empty(), "schedule table without expiry points");
            let mut prev = None;
            for ep in attr.exps {
                if let Some(p) = prev {
                    assert!(ep.offset > p, "expiry offsets must increase");
                }
                prev = Some(ep.offset);
            }
            let last = attr.exps[attr.exps.len() - 1].offset;
            if attr.duration != 0 {
                assert_eq!(
                    attr.delay,
                    attr.duration - last,
                    "final delay must close the duration"
                );
            }
            if attr.repeating {
                assert!(attr.delay != 0, "repeating table needs a final delay");
            }
        }
    }
}

/// The mutable half of the configuration: the kernel's backing storage,
/// lengths matching the attribute tables of the [`KernelCfg`] it accompanies
/// (checked by [`crate::Kernel::new`]). The ready queue needs one slot per
/// priority level.
pub struct KernelData<'a, P: Port> {
    /// Task control blocks.
    pub tasks: &'a mut [Tcb<P>],
    /// Ready-queue slots, one per priority level.
    pub ready: &'a mut [ReadySlot],
    /// Resource control blocks.
    pub resources: &'a mut [ResourceCb],
    /// Counter control blocks.
    pub counters: &'a mut [CounterCb],
    /// Alarm queue nodes.
    pub alarms: &'a mut [AlarmCb],
    /// Schedule table control blocks.
    pub schedule_tables: &'a mut [ScheduleTableCb],
}

#[cfg(test)]
pub(crate) mod test_fixture {
    //! Shared scaffolding for the in-crate unit tests. The end-to-end suite
    //! lives in `kestrel_port_std`.
    use crate::counter::AlarmBase;
    use crate::port::Port;
    use crate::schedtbl::{ExpiryPoint, ScheduleTableAttr, SyncStrategy};
    use crate::task::{TaskAttr, TaskFlags};
    use crate::utils::Init;
    use crate::{CounterId, Kernel, Priority, TaskId};

    /// A port that does nothing; the unit tests drive the kernel state
    /// machine directly.
    pub(crate) struct NopPort;

    impl Port for NopPort {
        type PortTaskState = ();
        fn initialize_task_state(_attr: &TaskAttr, _state: &()) {}
        fn switch_task(_from: Option<(TaskId, &())>, _to: (TaskId, &())) {}
        fn timer_init() {}
        fn enable_all_interrupts() {}
        fn disable_all_interrupts() {}
        fn suspend_all_interrupts() {}
        fn resume_all_interrupts() {}
        fn suspend_os_interrupts() {}
        fn resume_os_interrupts() {}
    }

    pub(crate) type TestKernel<'a> = Kernel<'a, NopPort>;

    pub(crate) fn nop_entry() {}

    pub(crate) fn task_attr(priority: Priority) -> TaskAttr {
        TaskAttr {
            entry: nop_entry,
            priority,
            internal_ceiling: None,
            max_activations: 1,
            stack_size: 1024,
            flags: TaskFlags::PREEMPTABLE,
        }
    }

    pub(crate) const TEST_COUNTER: AlarmBase = AlarmBase {
        max_allowed_value: 0xffff,
        ticks_per_base: 1,
        min_cycle: 1,
    };

    pub(crate) fn expiry_point(offset: crate::Tick) -> ExpiryPoint<'static> {
        ExpiryPoint {
            offset,
            tasks: &[],
            events: &[],
            max_shorten: 0,
            max_lengthen: 0,
        }
    }

    pub(crate) fn table_attr<'a>(
        exps: &'a [ExpiryPoint<'a>],
        duration: crate::Tick,
    ) -> ScheduleTableAttr<'a> {
        let last = exps[exps.len() - 1].offset;
        ScheduleTableAttr {
            counter: CounterId(0),
            exps,
            delay: duration - last,
            duration,
            precision: 0,
            sync: SyncStrategy::None,
            repeating: false,
        }
    }

    /// An extended-status configuration with 8 priority levels, one default
    /// counter, and task 0 as the idle task.
    pub(crate) fn small_cfg<'a>(tasks: &'a [TaskAttr]) -> super::KernelCfg<'a> {
        super::KernelCfg {
            status_level: super::StatusLevel::Extended,
            num_priorities: 8,
            tasks,
            idle_task: TaskId(0),
            resources: &[],
            counters: core::slice::from_ref(&TEST_COUNTER),
            sys_counter: CounterId(0),
            alarms: &[],
            schedule_tables: &[],
            isrs: &[],
            auto_tasks: &[],
            auto_alarms: &[],
            auto_schedule_tables: &[],
            hooks: crate::hook::HookTable::INIT,
        }
    }

    /// Declare the backing storage for `$cfg` on the caller's stack and bind
    /// a fresh kernel to `$k`.
    macro_rules! kernel_fixture {
        ($k:ident, $cfg:expr) => {
            let cfg = $cfg;
            let mut tasks: Vec<crate::task::Tcb<crate::cfg::test_fixture::NopPort>> =
                (0..cfg.tasks.len()).map(|_| crate::utils::Init::INIT).collect();
            let mut ready: Vec<crate::task::readyqueue::ReadySlot> =
                (0..cfg.num_priorities).map(|_| crate::utils::Init::INIT).collect();
            let mut resources: Vec<crate::resource::ResourceCb> =
                (0..cfg.resources.len()).map(|_| crate::utils::Init::INIT).collect();
            let mut counters: Vec<crate::counter::CounterCb> =
                (0..cfg.counters.len()).map(|_| crate::utils::Init::INIT).collect();
            let mut alarms: Vec<crate::alarm::AlarmCb> =
                (0..cfg.alarms.len()).map(|_| crate::utils::Init::INIT).collect();
            let mut schedule_tables: Vec<crate::schedtbl::ScheduleTableCb> = (0..cfg
                .schedule_tables
                .len())
                .map(|_| crate::utils::Init::INIT)
                .collect();
            let mut $k = crate::Kernel::new(
                cfg,
                crate::cfg::KernelData {
                    tasks: &mut tasks[..],
                    ready: &mut ready[..],
                    resources: &mut resources[..],
                    counters: &mut counters[..],
                    alarms: &mut alarms[..],
                    schedule_tables: &mut schedule_tables[..],
                },
            );
        };
    }
    pub(crate) use kernel_fixture;
}
