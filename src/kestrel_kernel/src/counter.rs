//! Counters: the tick sources driving alarms and schedule tables
use crate::{
    error::{OsError, ServiceId, StatusType},
    port::Port,
    utils::Init,
    AlarmId, CounterId, Kernel, ScheduleTableId, Tick,
};

/// The static properties of a counter. This is also what `GetAlarmBase`
/// reports for an alarm attached to the counter.
#[derive(Debug, Clone, Copy)]
pub struct AlarmBase {
    /// The largest value the count can take before wrapping to zero.
    pub max_allowed_value: Tick,
    /// How many ticks one `IncrementCounter` advances the count by.
    pub ticks_per_base: Tick,
    /// The smallest admissible cycle of a cyclic alarm.
    pub min_cycle: Tick,
}

/// *Counter control block*.
///
/// The overflow bit `ovf` toggles on every wrap of `count`. Queued alarms and
/// schedule-table events carry their own copy of the bit: an entry whose bit
/// differs from the counter's expires only after the next wrap.
#[derive(Debug, Clone, Copy)]
pub struct CounterCb {
    pub(crate) count: Tick,
    pub(crate) ovf: bool,
    /// Head of the expiration-sorted alarm queue.
    pub(crate) alarm_head: Option<AlarmId>,
    /// Head of the list of schedule tables currently processed on this
    /// counter.
    pub(crate) tbl_head: Option<ScheduleTableId>,
}

impl Init for CounterCb {
    const INIT: Self = Self {
        count: 0,
        ovf: false,
        alarm_head: None,
        tbl_head: None,
    };
}

impl<P: Port> Kernel<'_, P> {
    /// Advance a software counter by its tick base, firing any alarms and
    /// schedule-table expiry points that come due. May preempt the caller.
    pub fn increment_counter(&mut self, cid: CounterId) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_increment_counter(cid);
        if ret.is_ok() {
            self.preempt_point();
        }
        ret
    }

    /// The current count of a counter.
    pub fn get_counter_value(&mut self, cid: CounterId) -> Result<Tick, OsError> {
        let ret = self
            .validate_counter_id(cid)
            .map(|()| self.data.counters[cid.0].count);
        self.finish(ServiceId::GetCounterValue, [cid.0, 0, 0], ret)
    }

    /// The number of ticks elapsed since `*prev` was read from the counter;
    /// `*prev` is updated to the current count.
    pub fn get_elapsed_value(&mut self, cid: CounterId, prev: &mut Tick) -> Result<Tick, OsError> {
        let ret = self.do_get_elapsed_value(cid, prev);
        self.finish(
            ServiceId::GetElapsedValue,
            [cid.0, *prev as usize, 0],
            ret,
        )
    }

    /// Busy-wait until `counts` ticks of the given counter have elapsed.
    ///
    /// The counter must be advanced from an interrupt handler for the wait to
    /// make progress; this is usable by tasks only, after `StartOS`.
    pub fn delay(&mut self, cid: CounterId, counts: Tick) -> StatusType {
        self.validate_counter_id(cid)?;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        if counts > max {
            return Err(OsError::Value);
        }
        let start = self.data.counters[cid.0].count;
        let mut elapsed = 0;
        while elapsed < counts {
            let cur = self.data.counters[cid.0].count;
            elapsed = if cur >= start {
                cur - start
            } else {
                max - start + cur + 1
            };
        }
        Ok(())
    }

    /// The tick entry point wired to the hardware timer interrupt: advances
    /// the system counter.
    pub fn tick_handler(&mut self) {
        let _ = self.increment_counter(self.cfg.sys_counter);
    }

    pub(crate) fn validate_counter_id(&self, cid: CounterId) -> StatusType {
        if cid.0 >= self.cfg.counters.len() {
            return Err(OsError::Id);
        }
        Ok(())
    }

    pub(crate) fn sys_increment_counter(&mut self, cid: CounterId) -> StatusType {
        let ret = self.do_increment_counter(cid);
        self.finish(ServiceId::IncrementCounter, [cid.0, 0, 0], ret)
    }

    fn do_increment_counter(&mut self, cid: CounterId) -> StatusType {
        self.validate_counter_id(cid)?;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        let tpb = self.cfg.counters[cid.0].ticks_per_base;
        let cb = &mut self.data.counters[cid.0];
        if max - tpb < cb.count {
            // The counter wraps within this increment.
            cb.count = tpb - (max - cb.count) - 1;
            cb.ovf = !cb.ovf;
        } else {
            cb.count += tpb;
        }
        self.check_alarms(cid);
        self.check_schedule_tables(cid);
        Ok(())
    }

    fn do_get_elapsed_value(&mut self, cid: CounterId, prev: &mut Tick) -> Result<Tick, OsError> {
        self.validate_counter_id(cid)?;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        if self.cfg.status_level.is_extended() && *prev > max {
            return Err(OsError::Value);
        }
        let cur = self.data.counters[cid.0].count;
        let elapsed = if cur >= *prev {
            cur - *prev
        } else {
            // The count wrapped since `*prev` was taken.
            max - *prev + cur + 1
        };
        *prev = cur;
        Ok(elapsed)
    }
}
