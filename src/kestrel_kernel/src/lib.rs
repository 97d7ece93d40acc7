//! Kestrel: a statically configured OSEK/VDX + AUTOSAR real-time kernel.
//!
//! The kernel provides preemptive fixed-priority scheduling with the
//! Immediate Priority Ceiling Protocol, event-driven extended tasks, counters
//! with sorted alarm queues, and time-triggered schedule tables with optional
//! explicit synchronization. Every kernel object (task, resource, counter,
//! alarm, schedule table, ISR) is declared by a statically generated
//! configuration; nothing is created or freed at run time.
//!
//! The kernel state lives in a [`Kernel`] value built from the two halves of
//! that configuration: the immutable [`cfg::KernelCfg`] and the mutable
//! backing storage [`cfg::KernelData`]. System services are methods on
//! [`Kernel`]; the service surface and its error codes follow the OSEK OS
//! and AUTOSAR OS specifications.
//!
//! Architecture-specific concerns such as context switching, interrupt
//! masking and the hardware timer are delegated to an implementation of
//! [`port::Port`].
#![cfg_attr(not(test), no_std)]

pub mod cfg;
mod error;
pub mod hook;
mod klock;
pub mod port;
pub mod utils;

mod alarm;
mod counter;
mod event;
mod interrupt;
mod osctl;
mod resource;
mod schedtbl;
mod task;

pub use self::{
    alarm::{AlarmAction, AlarmAttr, AlarmCb, AlarmFlags},
    counter::{AlarmBase, CounterCb},
    error::{ErrorContext, OsError, ServiceId, StatusType},
    hook::HookTable,
    interrupt::{IsrAttr, IsrCategory},
    resource::{ResourceAttr, ResourceCb, RES_SCHEDULER},
    schedtbl::{
        ExpiryEvent, ExpiryPoint, ScheduleTableAttr, ScheduleTableAutoStart, ScheduleTableCb,
        ScheduleTableFlags, ScheduleTableStartMode, ScheduleTableStatus, SyncStrategy,
    },
    task::{readyqueue::ReadySlot, TaskAttr, TaskFlags, TaskState, Tcb},
};

use crate::{
    cfg::{KernelCfg, KernelData},
    port::Port,
    utils::Init,
};

/// A point on a counter's tick timeline, and a span of such ticks.
pub type Tick = u32;

/// A task scheduling priority. Greater values denote higher priorities; 0 is
/// reserved for the idle task.
pub type Priority = usize;

/// A set of events owned by an extended task.
pub type EventMask = u32;

/// An application mode index, selecting the auto-start vectors.
pub type AppModeId = usize;

macro_rules! define_id {
    (
        $( #[doc = $doc:literal] $Name:ident; )*
    ) => {
        $(
            #[doc = $doc]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $Name(pub usize);

            impl Init for $Name {
                const INIT: Self = Self(0);
            }
        )*
    };
}

define_id! {
    /// Index of a task in the configuration's task table.
    TaskId;
    /// Index of a resource in the configuration's resource table.
    ResourceId;
    /// Index of a counter in the configuration's counter table.
    CounterId;
    /// Index of an alarm in the configuration's alarm table.
    AlarmId;
    /// Index of a schedule table in the configuration's table array.
    ScheduleTableId;
    /// Index of an ISR in the configuration's ISR table.
    IsrId;
}

/// The kernel: configuration, backing storage, and the scheduler state,
/// passed explicitly through every system service.
pub struct Kernel<'a, P: Port> {
    pub(crate) cfg: &'a KernelCfg<'a>,
    pub(crate) data: KernelData<'a, P>,
    /// The task currently owning the processor.
    pub(crate) running_task: Option<TaskId>,
    pub(crate) app_mode: AppModeId,
    /// Depth of nested category-2 interrupt handlers.
    pub(crate) nested_isrs: u32,
    pub(crate) error_ctx: ErrorContext,
    /// Suppresses recursive `ErrorHook` invocations.
    pub(crate) in_error_hook: bool,
    pub(crate) disable_all_count: u32,
    pub(crate) suspend_all_count: u32,
    pub(crate) suspend_os_count: u32,
}

impl<'a, P: Port> Kernel<'a, P> {
    /// Bind the kernel to its configuration and backing storage.
    ///
    /// Checks the configuration's structural consistency, resets every
    /// control block to its boot state, and returns the kernel ready for
    /// [`Kernel::start_os`].
    ///
    /// # Panics
    ///
    /// Panics if the storage lengths don't match the attribute tables or the
    /// configuration is structurally inconsistent; both are generator bugs.
    pub fn new(cfg: &'a KernelCfg<'a>, data: KernelData<'a, P>) -> Self {
        cfg.validate();
        assert_eq!(data.tasks.len(), cfg.tasks.len(), "task storage length");
        assert_eq!(data.ready.len(), cfg.num_priorities, "ready storage length");
        assert_eq!(
            data.resources.len(),
            cfg.resources.len(),
            "resource storage length"
        );
        assert_eq!(
            data.counters.len(),
            cfg.counters.len(),
            "counter storage length"
        );
        assert_eq!(data.alarms.len(), cfg.alarms.len(), "alarm storage length");
        assert_eq!(
            data.schedule_tables.len(),
            cfg.schedule_tables.len(),
            "schedule table storage length"
        );

        let mut kernel = Self {
            cfg,
            data,
            running_task: None,
            app_mode: 0,
            nested_isrs: 0,
            error_ctx: ErrorContext::INIT,
            in_error_hook: false,
            disable_all_count: 0,
            suspend_all_count: 0,
            suspend_os_count: 0,
        };
        kernel.reset();
        kernel
    }

    /// Put every control block into its boot state.
    fn reset(&mut self) {
        let cfg = self.cfg;
        for (tcb, attr) in self.data.tasks.iter_mut().zip(cfg.tasks) {
            tcb.flags = attr.flags;
            tcb.priority = attr.priority;
            tcb.state = TaskState::Suspended;
            tcb.cevent = 0;
            tcb.wevent = 0;
            tcb.act = 0;
            tcb.res_top = None;
            tcb.next_ready = None;
        }
        for slot in self.data.ready.iter_mut() {
            *slot = ReadySlot::INIT;
        }
        for rcb in self.data.resources.iter_mut() {
            *rcb = ResourceCb::INIT;
        }
        for ccb in self.data.counters.iter_mut() {
            *ccb = CounterCb::INIT;
        }
        for (acb, attr) in self.data.alarms.iter_mut().zip(cfg.alarms) {
            *acb = AlarmCb::INIT;
            acb.exp = attr.start;
            acb.cycle = attr.cycle;
        }
        for stcb in self.data.schedule_tables.iter_mut() {
            *stcb = ScheduleTableCb::INIT;
        }
    }
}
