//! Alarms: the expiration queue engine and the alarm services
//!
//! Every alarm belongs to one counter and, while active, sits in that
//! counter's queue sorted by absolute expiration time. Wrap-around is handled
//! with a single overflow bit per alarm: an alarm whose bit differs from its
//! counter's expires in the next counter epoch. Within the same epoch,
//! smaller expiration comes first; equal expirations keep activation order.
//!
//! The queue invariant relied upon throughout: no queued alarm's expiration
//! has already elapsed. `CheckAlarms` fires and removes such alarms on every
//! increment, so only the tick processing itself can momentarily observe one.
use crate::{
    counter::AlarmBase,
    error::{OsError, ServiceId, StatusType},
    port::Port,
    utils::Init,
    AlarmId, CounterId, EventMask, Kernel, TaskId, Tick,
};

bitflags::bitflags! {
    /// Alarm status flags.
    pub struct AlarmFlags: u8 {
        /// Expiration epoch bit, compared against the counter's overflow bit.
        const OVF = 1 << 0;
        /// The alarm is queued on its counter.
        const ACTIVE = 1 << 1;
    }
}

impl Init for AlarmFlags {
    const INIT: Self = Self::empty();
}

/// What an alarm does when it expires.
#[derive(Debug, Clone, Copy)]
pub enum AlarmAction {
    /// Activate a task.
    ActivateTask(TaskId),
    /// Set events for an extended task.
    SetEvent(TaskId, EventMask),
    /// Invoke an alarm callback routine.
    Callback(fn()),
}

/// The static properties of an alarm.
#[derive(Debug, Clone, Copy)]
pub struct AlarmAttr {
    /// The counter driving this alarm.
    pub counter: CounterId,
    /// The action performed on expiration.
    pub action: AlarmAction,
    /// Initial expiration tick, used when the alarm is auto-started.
    pub start: Tick,
    /// Initial cycle, used when the alarm is auto-started. 0 means one-shot.
    pub cycle: Tick,
}

/// *Alarm control block*: an alarm queue node.
#[derive(Debug, Clone, Copy)]
pub struct AlarmCb {
    pub(crate) flags: AlarmFlags,
    /// Period of a cyclic alarm; 0 for a one-shot alarm.
    pub(crate) cycle: Tick,
    /// Absolute expiration tick on the owning counter's timeline.
    pub(crate) exp: Tick,
    pub(crate) next: Option<AlarmId>,
    pub(crate) prev: Option<AlarmId>,
}

impl Init for AlarmCb {
    const INIT: Self = Self {
        flags: AlarmFlags::INIT,
        cycle: 0,
        exp: 0,
        next: None,
        prev: None,
    };
}

impl<P: Port> Kernel<'_, P> {
    /// The counter characteristics underlying an alarm.
    pub fn get_alarm_base(&mut self, aid: AlarmId) -> Result<AlarmBase, OsError> {
        let ret = self
            .validate_alarm_id(aid)
            .map(|()| self.cfg.counters[self.cfg.alarms[aid.0].counter.0]);
        self.finish(ServiceId::GetAlarmBase, [aid.0, 0, 0], ret)
    }

    /// The number of ticks until an active alarm expires.
    pub fn get_alarm(&mut self, aid: AlarmId) -> Result<Tick, OsError> {
        let ret = self.do_get_alarm(aid);
        self.finish(ServiceId::GetAlarm, [aid.0, 0, 0], ret)
    }

    /// Arm an alarm to expire `inc` ticks from now, then every `cycle` ticks
    /// if `cycle` is non-zero.
    pub fn set_rel_alarm(&mut self, aid: AlarmId, inc: Tick, cycle: Tick) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.do_set_rel_alarm(aid, inc, cycle);
        self.finish(
            ServiceId::SetRelAlarm,
            [aid.0, inc as usize, cycle as usize],
            ret,
        )
    }

    /// Arm an alarm to expire when its counter next reaches the absolute
    /// tick `start`, then every `cycle` ticks if `cycle` is non-zero.
    pub fn set_abs_alarm(&mut self, aid: AlarmId, start: Tick, cycle: Tick) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.do_set_abs_alarm(aid, start, cycle);
        self.finish(
            ServiceId::SetAbsAlarm,
            [aid.0, start as usize, cycle as usize],
            ret,
        )
    }

    /// Disarm an active alarm.
    pub fn cancel_alarm(&mut self, aid: AlarmId) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.do_cancel_alarm(aid);
        self.finish(ServiceId::CancelAlarm, [aid.0, 0, 0], ret)
    }

    pub(crate) fn validate_alarm_id(&self, aid: AlarmId) -> StatusType {
        if aid.0 >= self.cfg.alarms.len() {
            return Err(OsError::Id);
        }
        Ok(())
    }

    fn alarm_is_active(&self, aid: AlarmId) -> bool {
        self.data.alarms[aid.0].flags.contains(AlarmFlags::ACTIVE)
    }

    fn alarm_ovf(&self, aid: AlarmId) -> bool {
        self.data.alarms[aid.0].flags.contains(AlarmFlags::OVF)
    }

    fn set_alarm_ovf(&mut self, aid: AlarmId, ovf: bool) {
        self.data.alarms[aid.0].flags.set(AlarmFlags::OVF, ovf);
    }

    fn do_get_alarm(&mut self, aid: AlarmId) -> Result<Tick, OsError> {
        self.validate_alarm_id(aid)?;
        if !self.alarm_is_active(aid) {
            return Err(OsError::NoFunc);
        }
        let cid = self.cfg.alarms[aid.0].counter;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        let count = self.data.counters[cid.0].count;
        let exp = self.data.alarms[aid.0].exp;
        Ok(if exp > count {
            exp - count
        } else {
            // The expiration lies past the counter wrap.
            max - count + exp + 1
        })
    }

    fn do_set_rel_alarm(&mut self, aid: AlarmId, inc: Tick, cycle: Tick) -> StatusType {
        self.validate_alarm_id(aid)?;
        if self.alarm_is_active(aid) {
            return Err(OsError::State);
        }
        // A zero increment is rejected in standard and extended status alike.
        if inc == 0 {
            return Err(OsError::Value);
        }
        let cid = self.cfg.alarms[aid.0].counter;
        let base = self.cfg.counters[cid.0];
        if self.cfg.status_level.is_extended() {
            if inc > base.max_allowed_value {
                return Err(OsError::Value);
            }
            if cycle != 0 && (cycle < base.min_cycle || cycle > base.max_allowed_value) {
                return Err(OsError::Value);
            }
        }
        self.update_alarm(aid, inc, cycle);
        self.activate_alarm(aid);
        Ok(())
    }

    fn do_set_abs_alarm(&mut self, aid: AlarmId, start: Tick, cycle: Tick) -> StatusType {
        self.validate_alarm_id(aid)?;
        if self.alarm_is_active(aid) {
            return Err(OsError::State);
        }
        let cid = self.cfg.alarms[aid.0].counter;
        let base = self.cfg.counters[cid.0];
        if self.cfg.status_level.is_extended() {
            if start > base.max_allowed_value {
                return Err(OsError::Value);
            }
            if cycle != 0 && (cycle < base.min_cycle || cycle > base.max_allowed_value) {
                return Err(OsError::Value);
            }
        }
        self.set_alarm(aid, start, cycle);
        self.activate_alarm(aid);
        Ok(())
    }

    fn do_cancel_alarm(&mut self, aid: AlarmId) -> StatusType {
        self.validate_alarm_id(aid)?;
        if !self.alarm_is_active(aid) {
            return Err(OsError::NoFunc);
        }
        self.remove_alarm(aid);
        Ok(())
    }

    /// Set an alarm's absolute expiration. An expiration at or before the
    /// current count belongs to the next counter epoch.
    fn set_alarm(&mut self, aid: AlarmId, exp: Tick, cycle: Tick) {
        let cid = self.cfg.alarms[aid.0].counter;
        let counter_ovf = self.data.counters[cid.0].ovf;
        if exp <= self.data.counters[cid.0].count {
            self.set_alarm_ovf(aid, !counter_ovf);
        } else {
            self.set_alarm_ovf(aid, counter_ovf);
        }
        self.data.alarms[aid.0].cycle = cycle;
        self.data.alarms[aid.0].exp = exp;
    }

    /// Set an alarm's expiration `inc` ticks after the current count.
    fn update_alarm(&mut self, aid: AlarmId, inc: Tick, cycle: Tick) {
        let cid = self.cfg.alarms[aid.0].counter;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        let count = self.data.counters[cid.0].count;
        let counter_ovf = self.data.counters[cid.0].ovf;
        self.set_alarm_ovf(aid, counter_ovf);
        self.data.alarms[aid.0].cycle = cycle;
        if inc != 0 {
            if max - inc < count {
                self.data.alarms[aid.0].exp = inc - (max - count) - 1;
                self.set_alarm_ovf(aid, !counter_ovf);
            } else {
                self.data.alarms[aid.0].exp = count + inc;
            }
        }
    }

    /// Advance an alarm's expiration by `inc`, toggling the epoch bit on
    /// wrap. Used when re-arming a cyclic alarm.
    fn inc_alarm(&mut self, aid: AlarmId, inc: Tick) {
        let cid = self.cfg.alarms[aid.0].counter;
        let max = self.cfg.counters[cid.0].max_allowed_value;
        if inc != 0 {
            let exp = self.data.alarms[aid.0].exp;
            if max - inc < exp {
                self.data.alarms[aid.0].exp = inc - (max - exp) - 1;
                let ovf = self.alarm_ovf(aid);
                self.set_alarm_ovf(aid, !ovf);
            } else {
                self.data.alarms[aid.0].exp = exp + inc;
            }
        }
    }

    /// Insert an alarm into its counter's queue in expiration order and mark
    /// it active.
    ///
    /// Among equal expirations the new alarm goes last. The walk assumes no
    /// queued alarm has already elapsed; `CheckAlarms` upholds that.
    pub(crate) fn activate_alarm(&mut self, aid: AlarmId) {
        let cid = self.cfg.alarms[aid.0].counter;

        if self.data.counters[cid.0].alarm_head.is_none() {
            self.data.counters[cid.0].alarm_head = Some(aid);
            let cb = &mut self.data.alarms[aid.0];
            cb.next = None;
            cb.prev = None;
            cb.flags.insert(AlarmFlags::ACTIVE);
            return;
        }

        let counter_ovf = self.data.counters[cid.0].ovf;
        let new_ovf = self.alarm_ovf(aid);
        let new_exp = self.data.alarms[aid.0].exp;

        // Find the first queued alarm that expires after the new one.
        let mut cursor = self.data.counters[cid.0].alarm_head;
        let mut insert_before = None;
        let mut last = None;
        while let Some(q) = cursor {
            let q_ovf = self.alarm_ovf(q);
            let q_exp = self.data.alarms[q.0].exp;
            if q_ovf != new_ovf && counter_ovf == new_ovf {
                // `q` expires next epoch, the new alarm this epoch.
                insert_before = Some(q);
                break;
            }
            if q_ovf == new_ovf && new_exp < q_exp {
                insert_before = Some(q);
                break;
            }
            last = Some(q);
            cursor = self.data.alarms[q.0].next;
        }

        match insert_before {
            None => {
                // Queue tail; `last` is present because the queue is
                // non-empty.
                let Some(tail) = last else {
                    panic!("alarm queue corrupted");
                };
                self.data.alarms[tail.0].next = Some(aid);
                self.data.alarms[aid.0].prev = Some(tail);
                self.data.alarms[aid.0].next = None;
            }
            Some(q) => {
                let q_prev = self.data.alarms[q.0].prev;
                match q_prev {
                    None => self.data.counters[cid.0].alarm_head = Some(aid),
                    Some(p) => self.data.alarms[p.0].next = Some(aid),
                }
                self.data.alarms[aid.0].prev = q_prev;
                self.data.alarms[aid.0].next = Some(q);
                self.data.alarms[q.0].prev = Some(aid);
            }
        }
        self.data.alarms[aid.0].flags.insert(AlarmFlags::ACTIVE);
    }

    /// Unlink an alarm from its counter's queue and mark it inactive. Does
    /// nothing if the alarm is not active.
    fn remove_alarm(&mut self, aid: AlarmId) {
        if !self.alarm_is_active(aid) {
            return;
        }
        let cid = self.cfg.alarms[aid.0].counter;
        let (prev, next) = {
            let cb = &self.data.alarms[aid.0];
            (cb.prev, cb.next)
        };
        match prev {
            Some(p) => self.data.alarms[p.0].next = next,
            None => self.data.counters[cid.0].alarm_head = next,
        }
        if let Some(n) = next {
            self.data.alarms[n.0].prev = prev;
        }
        let cb = &mut self.data.alarms[aid.0];
        cb.next = None;
        cb.prev = None;
        cb.flags.remove(AlarmFlags::ACTIVE);
    }

    /// Perform an expired alarm's action, remove it from the queue, and
    /// re-arm it if it is cyclic.
    fn fire_alarm(&mut self, aid: AlarmId) {
        match self.cfg.alarms[aid.0].action {
            AlarmAction::ActivateTask(tid) => {
                log::trace!("alarm {}: activating task {}", aid.0, tid.0);
                let _ = self.sys_activate_task(tid);
            }
            AlarmAction::SetEvent(tid, mask) => {
                log::trace!("alarm {}: setting events {:#x} for task {}", aid.0, mask, tid.0);
                let _ = self.sys_set_event(tid, mask);
            }
            AlarmAction::Callback(callback) => {
                log::trace!("alarm {}: invoking callback", aid.0);
                callback();
            }
        }
        self.remove_alarm(aid);
        if self.data.alarms[aid.0].cycle != 0 {
            let cycle = self.data.alarms[aid.0].cycle;
            self.inc_alarm(aid, cycle);
            self.activate_alarm(aid);
        }
    }

    /// Fire every alarm of `cid` that has come due. The queue is sorted, so
    /// the walk stops at the first alarm still in the future.
    pub(crate) fn check_alarms(&mut self, cid: CounterId) {
        let max = self.cfg.counters[cid.0].max_allowed_value;
        let tpb = self.cfg.counters[cid.0].ticks_per_base;
        loop {
            let Some(head) = self.data.counters[cid.0].alarm_head else {
                break;
            };
            let count = self.data.counters[cid.0].count;
            let counter_ovf = self.data.counters[cid.0].ovf;
            let exp = self.data.alarms[head.0].exp;
            if counter_ovf == self.alarm_ovf(head) {
                if count >= exp {
                    self.fire_alarm(head);
                } else {
                    break;
                }
            } else if (max - exp).wrapping_add(count).wrapping_add(1) < tpb {
                // Degenerate case: the alarm was set between two increments
                // and this increment wrapped straight past it.
                self.fire_alarm(head);
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cfg::test_fixture::*;
    use crate::*;
    use quickcheck_macros::quickcheck;

    fn one_counter(max: Tick) -> [AlarmBase; 1] {
        [AlarmBase {
            max_allowed_value: max,
            ticks_per_base: 1,
            min_cycle: 1,
        }]
    }

    fn callback_alarms<const N: usize>() -> [AlarmAttr; N] {
        fn nop() {}
        [AlarmAttr {
            counter: CounterId(0),
            action: AlarmAction::Callback(nop),
            start: 0,
            cycle: 0,
        }; N]
    }

    /// Walk the queue and check the ordering invariant: alarms of the
    /// counter's epoch (sorted by expiration, all in the future) precede
    /// alarms of the next epoch (sorted by expiration).
    fn assert_queue_sorted(k: &TestKernel<'_>, cid: CounterId) {
        let count = k.data.counters[cid.0].count;
        let counter_ovf = k.data.counters[cid.0].ovf;
        let mut cursor = k.data.counters[cid.0].alarm_head;
        let mut seen_next_epoch = false;
        let mut prev_exp: Option<Tick> = None;
        let mut prev_id = None;
        while let Some(a) = cursor {
            let cb = &k.data.alarms[a.0];
            assert!(cb.flags.contains(AlarmFlags::ACTIVE));
            assert_eq!(cb.prev, prev_id);
            let same_epoch = cb.flags.contains(AlarmFlags::OVF) == counter_ovf;
            if same_epoch {
                assert!(
                    !seen_next_epoch,
                    "this-epoch alarm queued behind a next-epoch alarm"
                );
                assert!(cb.exp > count, "elapsed alarm left in queue");
            } else {
                if !seen_next_epoch {
                    prev_exp = None;
                }
                seen_next_epoch = true;
            }
            if let Some(p) = prev_exp {
                assert!(cb.exp >= p, "queue not sorted by expiration");
            }
            prev_exp = Some(cb.exp);
            prev_id = Some(a);
            cursor = cb.next;
        }
    }

    #[test]
    fn rel_alarm_fires_once_across_wrap() {
        let attrs = [task_attr(0)];
        let counters = one_counter(1000);
        let alarms = callback_alarms::<1>();
        let mut cfg = small_cfg(&attrs);
        cfg.counters = &counters;
        cfg.alarms = &alarms;
        kernel_fixture!(k, &cfg);

        for _ in 0..990 {
            k.sys_increment_counter(CounterId(0)).unwrap();
        }
        k.set_rel_alarm(AlarmId(0), 20, 0).unwrap();
        // Expiration lands past the wrap, in the next epoch.
        assert!(k.data.alarms[0].flags.contains(AlarmFlags::OVF) != k.data.counters[0].ovf);

        let mut fired_at = None;
        for i in 1..=25 {
            k.sys_increment_counter(CounterId(0)).unwrap();
            if fired_at.is_none() && !k.data.alarms[0].flags.contains(AlarmFlags::ACTIVE) {
                fired_at = Some(i);
            }
        }
        assert_eq!(fired_at, Some(20));
        assert!(k.data.counters[0].alarm_head.is_none());
    }

    #[test]
    fn cyclic_alarm_rearms_in_order() {
        let attrs = [task_attr(0)];
        let counters = one_counter(100);
        let alarms = callback_alarms::<2>();
        let mut cfg = small_cfg(&attrs);
        cfg.counters = &counters;
        cfg.alarms = &alarms;
        kernel_fixture!(k, &cfg);

        k.set_rel_alarm(AlarmId(0), 10, 10).unwrap();
        k.set_rel_alarm(AlarmId(1), 15, 0).unwrap();
        for _ in 0..10 {
            k.sys_increment_counter(CounterId(0)).unwrap();
        }
        // The cyclic alarm re-armed for tick 20, behind the one-shot at 15.
        assert_eq!(k.data.counters[0].alarm_head, Some(AlarmId(1)));
        assert_eq!(k.data.alarms[0].exp, 20);
        assert_queue_sorted(&k, CounterId(0));
    }

    #[test]
    fn set_and_cancel_round_trip() {
        let attrs = [task_attr(0)];
        let counters = one_counter(100);
        let alarms = callback_alarms::<1>();
        let mut cfg = small_cfg(&attrs);
        cfg.counters = &counters;
        cfg.alarms = &alarms;
        kernel_fixture!(k, &cfg);

        assert_eq!(k.get_alarm(AlarmId(0)), Err(OsError::NoFunc));
        k.set_rel_alarm(AlarmId(0), 30, 0).unwrap();
        assert_eq!(k.get_alarm(AlarmId(0)), Ok(30));
        assert_eq!(k.set_rel_alarm(AlarmId(0), 5, 0), Err(OsError::State));
        k.cancel_alarm(AlarmId(0)).unwrap();
        assert!(k.data.counters[0].alarm_head.is_none());
        assert_eq!(k.cancel_alarm(AlarmId(0)), Err(OsError::NoFunc));
    }

    #[test]
    fn value_checks() {
        let attrs = [task_attr(0)];
        let counters = [AlarmBase {
            max_allowed_value: 100,
            ticks_per_base: 1,
            min_cycle: 5,
        }];
        let alarms = callback_alarms::<1>();
        let mut cfg = small_cfg(&attrs);
        cfg.counters = &counters;
        cfg.alarms = &alarms;
        kernel_fixture!(k, &cfg);

        assert_eq!(k.set_rel_alarm(AlarmId(0), 0, 0), Err(OsError::Value));
        assert_eq!(k.set_rel_alarm(AlarmId(0), 101, 0), Err(OsError::Value));
        assert_eq!(k.set_rel_alarm(AlarmId(0), 10, 3), Err(OsError::Value));
        assert_eq!(k.set_abs_alarm(AlarmId(0), 101, 0), Err(OsError::Value));
        assert_eq!(k.set_rel_alarm(AlarmId(9), 1, 0), Err(OsError::Id));
    }

    #[test]
    fn abs_alarm_in_the_past_fires_next_epoch() {
        let attrs = [task_attr(0)];
        let counters = one_counter(100);
        let alarms = callback_alarms::<1>();
        let mut cfg = small_cfg(&attrs);
        cfg.counters = &counters;
        cfg.alarms = &alarms;
        kernel_fixture!(k, &cfg);

        for _ in 0..50 {
            k.sys_increment_counter(CounterId(0)).unwrap();
        }
        k.set_abs_alarm(AlarmId(0), 10, 0).unwrap();
        // 10 is in the past this epoch: 50 ticks to wrap, 10 more to reach
        // the expiration.
        assert_eq!(k.get_alarm(AlarmId(0)), Ok(60));
        for _ in 0..59 {
            k.sys_increment_counter(CounterId(0)).unwrap();
            assert!(k.data.alarms[0].flags.contains(AlarmFlags::ACTIVE));
        }
        k.sys_increment_counter(CounterId(0)).unwrap();
        assert!(!k.data.alarms[0].flags.contains(AlarmFlags::ACTIVE));
    }

    #[quickcheck]
    fn queue_stays_sorted(ops: Vec<(u8, u16, u8)>) {
        let attrs = [task_attr(0)];
        let counters = one_counter(997);
        let alarms = callback_alarms::<6>();
        let mut cfg = small_cfg(&attrs);
        cfg.counters = &counters;
        cfg.alarms = &alarms;
        kernel_fixture!(k, &cfg);

        for (sel, val, cycle) in ops {
            let aid = AlarmId(usize::from(sel % 8));
            match sel % 4 {
                0 => {
                    let _ = k.set_rel_alarm(aid, Tick::from(val) % 997 + 1, Tick::from(cycle));
                }
                1 => {
                    let _ = k.set_abs_alarm(aid, Tick::from(val) % 998, Tick::from(cycle));
                }
                2 => {
                    let _ = k.cancel_alarm(aid);
                }
                _ => {
                    k.sys_increment_counter(CounterId(0)).unwrap();
                }
            }
            assert_queue_sorted(&k, CounterId(0));
        }
    }
}
