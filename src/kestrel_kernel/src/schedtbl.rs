//! Schedule tables: time-triggered expiry-point processing
//!
//! A schedule table is a sequence of expiry points on a counter's timeline,
//! each carrying task activations and event settings. The state machine:
//!
//! ```text
//! Stopped ──Start{Rel,Abs}──▶ Running ──(end, no next, one-shot)──▶ Stopped
//! Stopped ──StartSynchron──▶ Waiting ──SyncScheduleTable──▶ Running
//! Running ──NextScheduleTable(to)──▶ (Running; to: Stopped→Next)
//! Next    ──(predecessor ends)──▶ Running
//! Running ──(deviation ≤ precision)──▶ RunningAndSynchronous
//! Any     ──StopScheduleTable──▶ Stopped
//! ```
//!
//! Tables being processed on a counter form a doubly linked list headed by
//! the counter control block, walked on every increment. The `next_tick`
//! field tracks the counter value of the table's next event (an expiry
//! point, the end of the initial waiting time, or the end of the final
//! delay) with the same epoch bit scheme the alarm queue uses.
//!
//! Explicit synchronization: `SyncScheduleTable` tells the table where the
//! global time source stands on its duration. The resulting signed deviation
//! is worked off at every expiry point, bounded by the point's
//! `max_shorten`/`max_lengthen` budget, until it fits the table's precision.
use crate::{
    error::{OsError, ServiceId, StatusType},
    port::Port,
    utils::Init,
    CounterId, EventMask, Kernel, ScheduleTableId, TaskId, Tick,
};

bitflags::bitflags! {
    /// Dynamic schedule-table flags.
    pub struct ScheduleTableFlags: u8 {
        /// Epoch bit of `next_tick` relative to the driving counter.
        const OVF = 1 << 0;
        /// The initial waiting time has elapsed; expiry points are being
        /// processed.
        const PROCESSING = 1 << 1;
        /// The table is in its final delay.
        const DELAYING = 1 << 2;
        /// Sign of the synchronization deviation (set = the table runs
        /// behind the global time source).
        const DEVIATION_SIGN = 1 << 3;
        /// Synchronization has been requested and the deviation is being
        /// worked off.
        const SYNCING = 1 << 4;
    }
}

impl Init for ScheduleTableFlags {
    const INIT: Self = Self::empty();
}

/// Synchronization strategy of a schedule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// No synchronization support.
    None,
    /// The driving counter is itself the global time source; the table is
    /// synchronous from the moment it starts at tick zero.
    Implicit,
    /// The application feeds global time in through `SyncScheduleTable`.
    Explicit,
}

/// Schedule table states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTableStatus {
    /// Not started.
    Stopped,
    /// Queued to start when the table it was chained behind ends.
    Next,
    /// Started with `StartScheduleTableSynchron`; waiting for the first
    /// global time before processing begins.
    Waiting,
    /// Expiry points are processed, but the table is not (yet) synchronous.
    Running,
    /// Running with the deviation within the configured precision.
    RunningAndSynchronous,
}

impl Init for ScheduleTableStatus {
    const INIT: Self = Self::Stopped;
}

/// An event setting carried by an expiry point.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryEvent {
    /// The extended task to signal.
    pub task: TaskId,
    /// The events to set.
    pub mask: EventMask,
}

/// A point on the schedule table's timeline and the actions it carries.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPoint<'a> {
    /// Offset from the logical start of the table. Strictly increasing
    /// across the expiry-point array.
    pub offset: Tick,
    /// Tasks activated at this point, processed before any event settings.
    pub tasks: &'a [TaskId],
    /// Events set at this point.
    pub events: &'a [ExpiryEvent],
    /// How far this point's arrival may be brought forward while
    /// synchronizing.
    pub max_shorten: Tick,
    /// How far this point's arrival may be delayed while synchronizing.
    pub max_lengthen: Tick,
}

/// The static properties of a schedule table.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleTableAttr<'a> {
    /// The counter driving this table.
    pub counter: CounterId,
    /// The expiry points, sorted by offset. Never empty.
    pub exps: &'a [ExpiryPoint<'a>],
    /// Final delay after the last expiry point: `duration - last offset`.
    pub delay: Tick,
    /// One full turn of the table.
    pub duration: Tick,
    /// Largest deviation considered synchronous.
    pub precision: Tick,
    /// Synchronization strategy.
    pub sync: SyncStrategy,
    /// Restart from the first expiry point after the final delay.
    pub repeating: bool,
}

/// How an auto-start entry starts its schedule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTableStartMode {
    /// `StartScheduleTableAbs` with the entry's value.
    Absolute,
    /// `StartScheduleTableRel` with the entry's value.
    Relative,
    /// `StartScheduleTableSynchron`.
    Synchron,
}

/// A schedule table started automatically by `StartOS`.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleTableAutoStart {
    /// The table to start.
    pub table: ScheduleTableId,
    /// How to start it.
    pub mode: ScheduleTableStartMode,
    /// The absolute or relative start value, ignored for `Synchron`.
    pub value: Tick,
    /// The application mode this entry applies to.
    pub app_mode: crate::AppModeId,
}

/// *Schedule table control block*.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleTableCb {
    pub(crate) status: ScheduleTableStatus,
    pub(crate) flags: ScheduleTableFlags,
    /// Counter value of the table's next event.
    pub(crate) next_tick: Tick,
    /// Index of the next expiry point, `None` during the initial wait and
    /// the final delay.
    pub(crate) next_exp: Option<usize>,
    /// Remaining synchronization deviation, signed by
    /// [`ScheduleTableFlags::DEVIATION_SIGN`].
    pub(crate) deviation: Tick,
    /// Neighbors in the per-counter list of tables being processed.
    pub(crate) next: Option<ScheduleTableId>,
    pub(crate) prev: Option<ScheduleTableId>,
    /// The table queued to start when this one ends.
    pub(crate) to_tbl: Option<ScheduleTableId>,
    /// For a table in the `Next` state, the table it is queued behind.
    pub(crate) from_tbl: Option<ScheduleTableId>,
}

impl Init for ScheduleTableCb {
    const INIT: Self = Self {
        status: ScheduleTableStatus::INIT,
        flags: ScheduleTableFlags::INIT,
        next_tick: 0,
        next_exp: None,
        deviation: 0,
        next: None,
        prev: None,
        to_tbl: None,
        from_tbl: None,
    };
}

impl<P: Port> Kernel<'_, P> {
    /// Start a schedule table `offset` ticks from now.
    pub fn start_schedule_table_rel(&mut self, stid: ScheduleTableId, offset: Tick) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_start_schedule_table_rel(stid, offset);
        self.finish(
            ServiceId::StartScheduleTableRel,
            [stid.0, offset as usize, 0],
            ret,
        )
    }

    /// Start a schedule table when its counter next reaches the absolute
    /// tick `start`.
    pub fn start_schedule_table_abs(&mut self, stid: ScheduleTableId, start: Tick) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_start_schedule_table_abs(stid, start);
        self.finish(
            ServiceId::StartScheduleTableAbs,
            [stid.0, start as usize, 0],
            ret,
        )
    }

    /// Park an explicitly synchronized table in the `Waiting` state until the
    /// first `SyncScheduleTable` provides a global time reference.
    pub fn start_schedule_table_synchron(&mut self, stid: ScheduleTableId) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_start_schedule_table_synchron(stid);
        self.finish(ServiceId::StartScheduleTableSynchron, [stid.0, 0, 0], ret)
    }

    /// Stop a schedule table immediately, including a table still queued in
    /// the `Next` state.
    pub fn stop_schedule_table(&mut self, stid: ScheduleTableId) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.do_stop_schedule_table(stid);
        self.finish(ServiceId::StopScheduleTable, [stid.0, 0, 0], ret)
    }

    /// Queue `to` to start when `from` reaches the end of its final delay.
    pub fn next_schedule_table(
        &mut self,
        from: ScheduleTableId,
        to: ScheduleTableId,
    ) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.do_next_schedule_table(from, to);
        self.finish(ServiceId::NextScheduleTable, [from.0, to.0, 0], ret)
    }

    /// Provide the global time position `value` on the table's duration and
    /// start working off the resulting deviation.
    pub fn sync_schedule_table(&mut self, stid: ScheduleTableId, value: Tick) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.do_sync_schedule_table(stid, value);
        self.finish(
            ServiceId::SyncScheduleTable,
            [stid.0, value as usize, 0],
            ret,
        )
    }

    /// Abandon explicit synchronization; the table keeps running
    /// unsynchronized.
    pub fn set_schedule_table_async(&mut self, stid: ScheduleTableId) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.do_set_schedule_table_async(stid);
        self.finish(ServiceId::SetScheduleTableAsync, [stid.0, 0, 0], ret)
    }

    /// The current state of a schedule table.
    pub fn get_schedule_table_status(
        &mut self,
        stid: ScheduleTableId,
    ) -> Result<ScheduleTableStatus, OsError> {
        let ret = self
            .validate_schedule_table_id(stid)
            .map(|()| self.data.schedule_tables[stid.0].status);
        self.finish(ServiceId::GetScheduleTableStatus, [stid.0, 0, 0], ret)
    }
}

// Service bodies.
impl<P: Port> Kernel<'_, P> {
    pub(crate) fn validate_schedule_table_id(&self, stid: ScheduleTableId) -> StatusType {
        if stid.0 >= self.cfg.schedule_tables.len() {
            return Err(OsError::Id);
        }
        Ok(())
    }

    pub(crate) fn sys_start_schedule_table_rel(
        &mut self,
        stid: ScheduleTableId,
        offset: Tick,
    ) -> StatusType {
        self.validate_schedule_table_id(stid)?;
        let attr = &self.cfg.schedule_tables[stid.0];
        let cid = attr.counter;
        if self.cfg.status_level.is_extended() {
            // The initial offset plus the relative offset must fit the
            // counter's range so the start tick can be computed right away.
            let max = self.cfg.counters[cid.0].max_allowed_value;
            if offset == 0 || max - attr.exps[0].offset < offset {
                return Err(OsError::Value);
            }
            if attr.sync == SyncStrategy::Implicit {
                return Err(OsError::Id);
            }
        }
        if self.data.schedule_tables[stid.0].status != ScheduleTableStatus::Stopped {
            return Err(OsError::State);
        }
        self.update_table_next_tick(stid, offset);
        self.data.schedule_tables[stid.0].status = ScheduleTableStatus::Running;
        self.init_table_state(stid);
        self.skip_initial_wait_if_zero_offset(stid);
        self.link_table(stid, cid);
        log::trace!("schedule table {} started, +{} ticks", stid.0, offset);
        Ok(())
    }

    pub(crate) fn sys_start_schedule_table_abs(
        &mut self,
        stid: ScheduleTableId,
        start: Tick,
    ) -> StatusType {
        self.validate_schedule_table_id(stid)?;
        let attr = &self.cfg.schedule_tables[stid.0];
        let cid = attr.counter;
        if self.cfg.status_level.is_extended()
            && start > self.cfg.counters[cid.0].max_allowed_value
        {
            return Err(OsError::Value);
        }
        if self.data.schedule_tables[stid.0].status != ScheduleTableStatus::Stopped {
            return Err(OsError::State);
        }
        // If `start` lies in the past of this epoch, the table waits for the
        // counter to wrap and reach it again.
        self.set_table_next_tick(stid, start);
        self.data.schedule_tables[stid.0].status = if attr.sync == SyncStrategy::Implicit {
            // An implicitly synchronized table starts at the global zero.
            debug_assert_eq!(start, 0);
            ScheduleTableStatus::RunningAndSynchronous
        } else {
            ScheduleTableStatus::Running
        };
        self.init_table_state(stid);
        self.skip_initial_wait_if_zero_offset(stid);
        self.link_table(stid, cid);
        Ok(())
    }

    pub(crate) fn sys_start_schedule_table_synchron(
        &mut self,
        stid: ScheduleTableId,
    ) -> StatusType {
        self.validate_schedule_table_id(stid)?;
        if self.cfg.status_level.is_extended()
            && self.cfg.schedule_tables[stid.0].sync != SyncStrategy::Explicit
        {
            return Err(OsError::Id);
        }
        if self.data.schedule_tables[stid.0].status != ScheduleTableStatus::Stopped {
            return Err(OsError::State);
        }
        self.data.schedule_tables[stid.0].status = ScheduleTableStatus::Waiting;
        self.init_table_state(stid);
        // The table joins the counter's list once `SyncScheduleTable`
        // provides the first reference.
        Ok(())
    }

    fn do_stop_schedule_table(&mut self, stid: ScheduleTableId) -> StatusType {
        self.validate_schedule_table_id(stid)?;
        let status = self.data.schedule_tables[stid.0].status;
        match status {
            ScheduleTableStatus::Stopped => Err(OsError::NoFunc),
            ScheduleTableStatus::Waiting => {
                // Not on a counter list yet.
                self.data.schedule_tables[stid.0].status = ScheduleTableStatus::Stopped;
                Ok(())
            }
            ScheduleTableStatus::Next => {
                self.data.schedule_tables[stid.0].status = ScheduleTableStatus::Stopped;
                // Detach from the predecessor's chain link.
                let from = self.data.schedule_tables[stid.0].from_tbl;
                debug_assert!(from.is_some());
                if let Some(f) = from {
                    self.data.schedule_tables[f.0].to_tbl = None;
                }
                Ok(())
            }
            _ => {
                self.data.schedule_tables[stid.0].status = ScheduleTableStatus::Stopped;
                self.unlink_table(stid);
                // A queued next table stops with its predecessor.
                if let Some(next) = self.data.schedule_tables[stid.0].to_tbl {
                    self.data.schedule_tables[next.0].status = ScheduleTableStatus::Stopped;
                }
                Ok(())
            }
        }
    }

    fn do_next_schedule_table(
        &mut self,
        from: ScheduleTableId,
        to: ScheduleTableId,
    ) -> StatusType {
        self.validate_schedule_table_id(from)?;
        self.validate_schedule_table_id(to)?;
        if self.cfg.status_level.is_extended() {
            let from_attr = &self.cfg.schedule_tables[from.0];
            let to_attr = &self.cfg.schedule_tables[to.0];
            if from_attr.counter != to_attr.counter {
                return Err(OsError::Id);
            }
            if from_attr.sync != to_attr.sync {
                return Err(OsError::Id);
            }
        }
        if self.data.schedule_tables[from.0].status == ScheduleTableStatus::Stopped
            || self.data.schedule_tables[to.0].status == ScheduleTableStatus::Next
        {
            return Err(OsError::NoFunc);
        }
        if self.data.schedule_tables[to.0].status != ScheduleTableStatus::Stopped {
            return Err(OsError::State);
        }
        // A previously queued next table is displaced and stopped.
        if let Some(old) = self.data.schedule_tables[from.0].to_tbl {
            self.data.schedule_tables[old.0].status = ScheduleTableStatus::Stopped;
        }
        self.init_table_state(to);
        self.data.schedule_tables[from.0].to_tbl = Some(to);
        self.data.schedule_tables[to.0].from_tbl = Some(from);
        self.data.schedule_tables[to.0].status = ScheduleTableStatus::Next;
        Ok(())
    }

    fn do_sync_schedule_table(&mut self, stid: ScheduleTableId, value: Tick) -> StatusType {
        self.validate_schedule_table_id(stid)?;
        let attr = &self.cfg.schedule_tables[stid.0];
        let cid = attr.counter;
        let duration = attr.duration;
        if self.cfg.status_level.is_extended() {
            if attr.sync != SyncStrategy::Explicit {
                return Err(OsError::Id);
            }
            if value >= duration {
                return Err(OsError::Value);
            }
        }
        let status = self.data.schedule_tables[stid.0].status;
        if status == ScheduleTableStatus::Stopped || status == ScheduleTableStatus::Next {
            return Err(OsError::State);
        }
        self.data.schedule_tables[stid.0]
            .flags
            .insert(ScheduleTableFlags::SYNCING);

        if status == ScheduleTableStatus::Waiting {
            // First reference for a synchronously started table: place its
            // logical zero so that the global time position matches `value`,
            // i.e. start the remaining `duration - value` ticks from now.
            self.update_table_next_tick(stid, duration - value);
            self.data.schedule_tables[stid.0].status =
                ScheduleTableStatus::RunningAndSynchronous;
            self.link_table(stid, cid);
            return Ok(());
        }

        // The table is running: derive its own position on the duration. In
        // the initial waiting time and the final delay the next event is the
        // logical table start; in between it is an expiry point.
        let count = self.data.counters[cid.0].count;
        let tbl = &self.data.schedule_tables[stid.0];
        let until_next = tbl.next_tick.wrapping_sub(count);
        let pos_on_table = if !tbl.flags.contains(ScheduleTableFlags::PROCESSING)
            || tbl.flags.contains(ScheduleTableFlags::DELAYING)
        {
            duration.wrapping_sub(until_next)
        } else {
            let Some(ep) = tbl.next_exp else {
                panic!("processing schedule table without a next expiry point");
            };
            attr.exps[ep].offset.wrapping_sub(until_next)
        };

        // The deviation is the shorter way around the duration circle from
        // the table's position to the global position.
        let (deviation, behind) = if pos_on_table >= value {
            let direct = pos_on_table - value;
            let wrapped = duration - pos_on_table + value;
            if direct > wrapped {
                (wrapped, true)
            } else {
                (direct, false)
            }
        } else {
            let direct = value - pos_on_table;
            let wrapped = duration - value + pos_on_table;
            if direct > wrapped {
                (wrapped, false)
            } else {
                (direct, true)
            }
        };
        let precision = attr.precision;
        let tbl = &mut self.data.schedule_tables[stid.0];
        tbl.deviation = deviation;
        tbl.flags
            .set(ScheduleTableFlags::DEVIATION_SIGN, behind);
        tbl.status = if deviation > precision {
            ScheduleTableStatus::Running
        } else {
            ScheduleTableStatus::RunningAndSynchronous
        };
        Ok(())
    }

    fn do_set_schedule_table_async(&mut self, stid: ScheduleTableId) -> StatusType {
        self.validate_schedule_table_id(stid)?;
        if self.cfg.status_level.is_extended()
            && self.cfg.schedule_tables[stid.0].sync != SyncStrategy::Explicit
        {
            return Err(OsError::Id);
        }
        let status = self.data.schedule_tables[stid.0].status;
        if matches!(
            status,
            ScheduleTableStatus::Stopped | ScheduleTableStatus::Next | ScheduleTableStatus::Waiting
        ) {
            return Err(OsError::State);
        }
        let tbl = &mut self.data.schedule_tables[stid.0];
        tbl.status = ScheduleTableStatus::Running;
        tbl.deviation = 0;
        tbl.flags.remove(ScheduleTableFlags::SYNCING);
        Ok(())
    }
}

// The expiry-point state machine.
impl<P: Port> Kernel<'_, P> {
    fn table_ovf(&self, stid: ScheduleTableId) -> bool {
        self.data.schedule_tables[stid.0]
            .flags
            .contains(ScheduleTableFlags::OVF)
    }

    fn set_table_ovf_to(&mut self, stid: ScheduleTableId, ovf: bool) {
        self.data.schedule_tables[stid.0]
            .flags
            .set(ScheduleTableFlags::OVF, ovf);
    }

    /// Set `next_tick` to an absolute counter value; a value at or before
    /// the current count belongs to the next epoch.
    fn set_table_next_tick(&mut self, stid: ScheduleTableId, tick: Tick) {
        let cid = self.cfg.schedule_tables[stid.0].counter;
        let counter_ovf = self.data.counters[cid.0].ovf;
        if tick <= self.data.counters[cid.0].count {
            self.set_table_ovf_to(stid, !counter_ovf);
        } else {
            self.set_table_ovf_to(stid, counter_ovf);
        }
        self.data.schedule_tables[stid.0].next_tick = tick;
    }

    /// Advance `next_tick` by `inc`, toggling the epoch bit on wrap.
    fn inc_table_next_tick(&mut self, stid: ScheduleTableId, inc: Tick) {
        let cid = self.cfg.schedule_tables[stid.0].counter;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        if inc != 0 {
            let next_tick = self.data.schedule_tables[stid.0].next_tick;
            if max - inc < next_tick {
                self.data.schedule_tables[stid.0].next_tick = inc - (max - next_tick) - 1;
                let ovf = self.table_ovf(stid);
                self.set_table_ovf_to(stid, !ovf);
            } else {
                self.data.schedule_tables[stid.0].next_tick = next_tick + inc;
            }
        }
    }

    /// Bring `next_tick` forward by `dec`, toggling the epoch bit on wrap.
    fn dec_table_next_tick(&mut self, stid: ScheduleTableId, dec: Tick) {
        let cid = self.cfg.schedule_tables[stid.0].counter;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        if dec != 0 {
            let next_tick = self.data.schedule_tables[stid.0].next_tick;
            if next_tick >= dec {
                self.data.schedule_tables[stid.0].next_tick = next_tick - dec;
            } else {
                self.data.schedule_tables[stid.0].next_tick = max - (dec - next_tick - 1);
                let ovf = self.table_ovf(stid);
                self.set_table_ovf_to(stid, !ovf);
            }
        }
    }

    /// Set `next_tick` to `inc` ticks after the current count.
    fn update_table_next_tick(&mut self, stid: ScheduleTableId, inc: Tick) {
        let cid = self.cfg.schedule_tables[stid.0].counter;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        let count = self.data.counters[cid.0].count;
        let counter_ovf = self.data.counters[cid.0].ovf;
        self.set_table_ovf_to(stid, counter_ovf);
        if inc != 0 {
            if max - inc < count {
                self.data.schedule_tables[stid.0].next_tick = inc - (max - count) - 1;
                self.set_table_ovf_to(stid, !counter_ovf);
            } else {
                self.data.schedule_tables[stid.0].next_tick = count + inc;
            }
        }
    }

    /// Reset the dynamic state a table must not carry over from a previous
    /// run. The epoch bit and `next_tick` are set separately.
    fn init_table_state(&mut self, stid: ScheduleTableId) {
        let tbl = &mut self.data.schedule_tables[stid.0];
        tbl.flags.remove(
            ScheduleTableFlags::PROCESSING
                | ScheduleTableFlags::DELAYING
                | ScheduleTableFlags::SYNCING,
        );
        tbl.next_exp = None;
        tbl.to_tbl = None;
        tbl.from_tbl = None;
        tbl.deviation = 0;
    }

    /// A zero first offset skips the initial waiting period: the start tick
    /// itself processes expiry point 0.
    fn skip_initial_wait_if_zero_offset(&mut self, stid: ScheduleTableId) {
        if self.cfg.schedule_tables[stid.0].exps[0].offset == 0 {
            let tbl = &mut self.data.schedule_tables[stid.0];
            tbl.flags.insert(ScheduleTableFlags::PROCESSING);
            tbl.next_exp = Some(0);
        }
    }

    /// Append a table to its counter's list of tables being processed.
    fn link_table(&mut self, stid: ScheduleTableId, cid: CounterId) {
        self.data.schedule_tables[stid.0].next = None;
        match self.data.counters[cid.0].tbl_head {
            None => {
                self.data.counters[cid.0].tbl_head = Some(stid);
                self.data.schedule_tables[stid.0].prev = None;
            }
            Some(head) => {
                let mut tail = head;
                while let Some(n) = self.data.schedule_tables[tail.0].next {
                    tail = n;
                }
                self.data.schedule_tables[tail.0].next = Some(stid);
                self.data.schedule_tables[stid.0].prev = Some(tail);
            }
        }
    }

    /// Remove a table from its counter's list.
    fn unlink_table(&mut self, stid: ScheduleTableId) {
        let cid = self.cfg.schedule_tables[stid.0].counter;
        let (prev, next) = {
            let tbl = &self.data.schedule_tables[stid.0];
            (tbl.prev, tbl.next)
        };
        match prev {
            Some(p) => self.data.schedule_tables[p.0].next = next,
            None => self.data.counters[cid.0].tbl_head = next,
        }
        if let Some(n) = next {
            self.data.schedule_tables[n.0].prev = prev;
        }
        let tbl = &mut self.data.schedule_tables[stid.0];
        tbl.next = None;
        tbl.prev = None;
    }

    /// Mark a table started for processing, either keeping its status (the
    /// initial wait ended, a repeating turn begins) or with an explicit
    /// status (a chained table takes over).
    fn start_table(&mut self, stid: ScheduleTableId, status: ScheduleTableStatus, from_now: bool) {
        {
            let tbl = &mut self.data.schedule_tables[stid.0];
            tbl.status = status;
            tbl.flags.insert(ScheduleTableFlags::PROCESSING);
            tbl.next_exp = Some(0);
        }
        let offset0 = self.cfg.schedule_tables[stid.0].exps[0].offset;
        if from_now {
            self.update_table_next_tick(stid, offset0);
        } else {
            self.inc_table_next_tick(stid, offset0);
        }
    }

    /// Work off synchronization deviation on the interval to the next expiry
    /// point, bounded by that point's shorten/lengthen budget.
    fn adjust_schedule_table(&mut self, stid: ScheduleTableId) {
        let tbl = &self.data.schedule_tables[stid.0];
        if !tbl.flags.contains(ScheduleTableFlags::SYNCING) {
            return;
        }
        if tbl.deviation == 0 {
            self.data.schedule_tables[stid.0].status =
                ScheduleTableStatus::RunningAndSynchronous;
            return;
        }
        let Some(ep) = tbl.next_exp else {
            panic!("synchronizing schedule table without a next expiry point");
        };
        let behind = tbl.flags.contains(ScheduleTableFlags::DEVIATION_SIGN);
        let deviation = tbl.deviation;
        let attr = &self.cfg.schedule_tables[stid.0];
        let adj;
        if behind {
            // The table lags the global time source; bring the next expiry
            // forward.
            adj = deviation.min(attr.exps[ep].max_shorten);
            self.dec_table_next_tick(stid, adj);
        } else {
            // The table runs ahead; push the next expiry out.
            adj = deviation.min(attr.exps[ep].max_lengthen);
            self.inc_table_next_tick(stid, adj);
        }
        let precision = attr.precision;
        let tbl = &mut self.data.schedule_tables[stid.0];
        tbl.deviation -= adj;
        tbl.status = if tbl.deviation > precision {
            ScheduleTableStatus::Running
        } else {
            ScheduleTableStatus::RunningAndSynchronous
        };
    }

    /// Finish a table: stop it and hand its place on the counter over to a
    /// queued next table, if any.
    ///
    /// Returns the successor when its first expiry point carries offset 0,
    /// in which case the caller must process that point in the same tick.
    fn remove_schedule_table(&mut self, stid: ScheduleTableId) -> Option<ScheduleTableId> {
        let to = self.data.schedule_tables[stid.0].to_tbl;
        self.data.schedule_tables[stid.0].status = ScheduleTableStatus::Stopped;
        let cid = self.cfg.schedule_tables[stid.0].counter;

        let Some(next_tbl) = to else {
            self.unlink_table(stid);
            return None;
        };

        // Splice the successor into the finished table's position.
        let (prev, next) = {
            let tbl = &self.data.schedule_tables[stid.0];
            (tbl.prev, tbl.next)
        };
        match prev {
            Some(p) => self.data.schedule_tables[p.0].next = Some(next_tbl),
            None => self.data.counters[cid.0].tbl_head = Some(next_tbl),
        }
        if let Some(n) = next {
            self.data.schedule_tables[n.0].prev = Some(next_tbl);
        }
        {
            let tbl = &mut self.data.schedule_tables[next_tbl.0];
            tbl.prev = prev;
            tbl.next = next;
        }
        {
            let tbl = &mut self.data.schedule_tables[stid.0];
            tbl.prev = None;
            tbl.next = None;
        }

        let mut ret = None;
        if self.cfg.schedule_tables[next_tbl.0].exps[0].offset == 0 {
            // The successor's first expiry point coincides with the switch
            // tick; the caller handles it before returning.
            ret = Some(next_tbl);
            let count = self.data.counters[cid.0].count;
            let counter_ovf = self.data.counters[cid.0].ovf;
            let tbl = &mut self.data.schedule_tables[next_tbl.0];
            tbl.status = ScheduleTableStatus::Running;
            tbl.flags.insert(ScheduleTableFlags::PROCESSING);
            tbl.next_exp = Some(0);
            tbl.next_tick = count;
            tbl.flags.set(ScheduleTableFlags::OVF, counter_ovf);
        } else {
            self.start_table(next_tbl, ScheduleTableStatus::Running, true);
        }

        // An explicitly synchronized successor continues the predecessor's
        // synchronization.
        if self.cfg.schedule_tables[next_tbl.0].sync == SyncStrategy::Explicit
            && self.data.schedule_tables[stid.0]
                .flags
                .contains(ScheduleTableFlags::SYNCING)
        {
            let deviation = self.data.schedule_tables[stid.0].deviation;
            let behind = self.data.schedule_tables[stid.0]
                .flags
                .contains(ScheduleTableFlags::DEVIATION_SIGN);
            let tbl = &mut self.data.schedule_tables[next_tbl.0];
            tbl.flags.insert(ScheduleTableFlags::SYNCING);
            tbl.deviation = deviation;
            if behind {
                tbl.flags.insert(ScheduleTableFlags::DEVIATION_SIGN);
            }
        }
        ret
    }

    /// Execute an expiry point's actions: task activations first, then event
    /// settings.
    fn do_schedule_table_actions(&mut self, stid: ScheduleTableId, ep: usize) {
        let attr = &self.cfg.schedule_tables[stid.0];
        let tasks = attr.exps[ep].tasks;
        let events = attr.exps[ep].events;
        for &tid in tasks {
            let _ = self.sys_activate_task(tid);
        }
        for &ExpiryEvent { task, mask } in events {
            let _ = self.sys_set_event(task, mask);
        }
    }

    /// Has the table's next event tick arrived on its counter?
    fn table_event_due(&self, stid: ScheduleTableId) -> bool {
        let cid = self.cfg.schedule_tables[stid.0].counter;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        let tpb = self.cfg.counters[cid.0].ticks_per_base;
        let count = self.data.counters[cid.0].count;
        let next_tick = self.data.schedule_tables[stid.0].next_tick;
        if self.data.counters[cid.0].ovf == self.table_ovf(stid) {
            count >= next_tick
        } else {
            // Same degenerate wrap case the alarm queue handles.
            (max - next_tick).wrapping_add(count).wrapping_add(1) < tpb
        }
    }

    /// Process one table on a counter increment: handle the expiry point,
    /// the end of the initial wait, or the end of the final delay, then
    /// reprogram `next_tick`.
    fn process_schedule_table(&mut self, stid: ScheduleTableId) {
        if !self.table_event_due(stid) {
            return;
        }
        let mut stid = stid;
        loop {
            let next_exp = self.data.schedule_tables[stid.0].next_exp;
            if let Some(ep) = next_exp {
                self.do_schedule_table_actions(stid, ep);
                let attr = &self.cfg.schedule_tables[stid.0];
                if ep + 1 < attr.exps.len() {
                    let delta = attr.exps[ep + 1].offset - attr.exps[ep].offset;
                    self.inc_table_next_tick(stid, delta);
                    self.data.schedule_tables[stid.0].next_exp = Some(ep + 1);
                    self.adjust_schedule_table(stid);
                    break;
                }
                // That was the last expiry point.
                let delay = attr.delay;
                if delay != 0 {
                    self.data.schedule_tables[stid.0]
                        .flags
                        .insert(ScheduleTableFlags::DELAYING);
                    self.inc_table_next_tick(stid, delay);
                    self.data.schedule_tables[stid.0].next_exp = None;
                    break;
                }
                // No final delay: the table is one-shot (a repeating table
                // always has one).
                debug_assert!(!self.cfg.schedule_tables[stid.0].repeating);
                match self.remove_schedule_table(stid) {
                    Some(next_tbl) => {
                        stid = next_tbl;
                        continue;
                    }
                    None => break,
                }
            }

            let flags = self.data.schedule_tables[stid.0].flags;
            if !flags.contains(ScheduleTableFlags::PROCESSING) {
                // The initial waiting time is over; enter the table proper.
                let status = self.data.schedule_tables[stid.0].status;
                self.start_table(stid, status, false);
                self.adjust_schedule_table(stid);
                break;
            }
            if flags.contains(ScheduleTableFlags::DELAYING) {
                self.data.schedule_tables[stid.0]
                    .flags
                    .remove(ScheduleTableFlags::DELAYING);
                let has_next = self.data.schedule_tables[stid.0].to_tbl.is_some();
                let repeating = self.cfg.schedule_tables[stid.0].repeating;
                if has_next || !repeating {
                    // A queued successor takes over even if this table
                    // repeats.
                    match self.remove_schedule_table(stid) {
                        Some(next_tbl) => {
                            stid = next_tbl;
                            continue;
                        }
                        None => break,
                    }
                }
                if self.cfg.schedule_tables[stid.0].exps[0].offset == 0 {
                    // The new turn's first expiry point falls on this very
                    // tick; `next_tick` is already current.
                    self.data.schedule_tables[stid.0].next_exp = Some(0);
                    continue;
                }
                let status = self.data.schedule_tables[stid.0].status;
                self.start_table(stid, status, false);
                self.adjust_schedule_table(stid);
                break;
            }
            break;
        }
    }

    /// Process every schedule table driven by `cid`. Called on each counter
    /// increment after the alarms.
    pub(crate) fn check_schedule_tables(&mut self, cid: CounterId) {
        let mut cursor = self.data.counters[cid.0].tbl_head;
        while let Some(stid) = cursor {
            // Processing may unlink the table or splice in a successor, so
            // the walk position is saved first.
            cursor = self.data.schedule_tables[stid.0].next;
            self.process_schedule_table(stid);
        }
    }
}
