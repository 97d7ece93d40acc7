//! Event control for extended tasks
use crate::{
    error::{OsError, ServiceId, StatusType},
    port::Port,
    task::{DispatchKind, TaskFlags, TaskState},
    EventMask, Kernel, TaskId,
};

impl<P: Port> Kernel<'_, P> {
    /// Set events for an extended task, waking it if it waits for any of
    /// them. May preempt the caller.
    pub fn set_event(&mut self, tid: TaskId, mask: EventMask) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_set_event(tid, mask);
        if ret.is_ok() {
            self.preempt_point();
        }
        ret
    }

    /// Clear events of the calling extended task.
    pub fn clear_event(&mut self, mask: EventMask) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.do_clear_event(mask);
        self.finish(ServiceId::ClearEvent, [mask as usize, 0, 0], ret)
    }

    /// The current event state of an extended task.
    pub fn get_event(&mut self, tid: TaskId) -> Result<EventMask, OsError> {
        let _lock = self.service_lock();
        let ret = self.do_get_event(tid);
        self.finish(ServiceId::GetEvent, [tid.0, 0, 0], ret)
    }

    /// Block the calling extended task until one of the events in `mask` is
    /// set. Returns immediately if one already is.
    pub fn wait_event(&mut self, mask: EventMask) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.do_wait_event(mask);
        self.finish(ServiceId::WaitEvent, [mask as usize, 0, 0], ret)
    }

    pub(crate) fn sys_set_event(&mut self, tid: TaskId, mask: EventMask) -> StatusType {
        let ret = self.do_set_event(tid, mask);
        self.finish(ServiceId::SetEvent, [tid.0, mask as usize, 0], ret)
    }

    fn do_set_event(&mut self, tid: TaskId, mask: EventMask) -> StatusType {
        self.validate_task_id(tid)?;
        if self.cfg.status_level.is_extended() {
            if !self.cfg.tasks[tid.0].flags.contains(TaskFlags::EXTENDED) {
                return Err(OsError::Access);
            }
            if self.data.tasks[tid.0].state == TaskState::Suspended {
                return Err(OsError::State);
            }
        }
        let tcb = &mut self.data.tasks[tid.0];
        tcb.cevent |= mask;
        if tcb.wevent & mask != 0 && tcb.state == TaskState::Waiting {
            tcb.state = TaskState::Ready;
            self.enqueue_task_tail(tid);
        }
        Ok(())
    }

    fn do_clear_event(&mut self, mask: EventMask) -> StatusType {
        let cur = self.expect_running_task();
        if self.cfg.status_level.is_extended() {
            if !self.cfg.tasks[cur.0].flags.contains(TaskFlags::EXTENDED) {
                return Err(OsError::Access);
            }
            if self.nested_isrs != 0 {
                return Err(OsError::CallLevel);
            }
        }
        self.data.tasks[cur.0].cevent &= !mask;
        Ok(())
    }

    fn do_get_event(&mut self, tid: TaskId) -> Result<EventMask, OsError> {
        self.validate_task_id(tid)?;
        if self.cfg.status_level.is_extended() {
            if !self.cfg.tasks[tid.0].flags.contains(TaskFlags::EXTENDED) {
                return Err(OsError::Access);
            }
            if self.data.tasks[tid.0].state == TaskState::Suspended {
                return Err(OsError::State);
            }
        }
        Ok(self.data.tasks[tid.0].cevent)
    }

    fn do_wait_event(&mut self, mask: EventMask) -> StatusType {
        let cur = self.expect_running_task();
        if self.cfg.status_level.is_extended() {
            if !self.cfg.tasks[cur.0].flags.contains(TaskFlags::EXTENDED) {
                return Err(OsError::Access);
            }
            if self.data.tasks[cur.0].res_top.is_some() {
                return Err(OsError::Resource);
            }
            if self.nested_isrs != 0 {
                return Err(OsError::CallLevel);
            }
        }
        if self.data.tasks[cur.0].cevent & mask != 0 {
            // At least one awaited event is already set.
            return Ok(());
        }
        self.data.tasks[cur.0].wevent = mask;
        let max = self.max_prio();
        let Some(tid) = self.next_task(max, 0) else {
            panic!("ready queue empty");
        };
        self.post_task_hook();
        let tcb = &mut self.data.tasks[cur.0];
        tcb.state = TaskState::Waiting;
        // Release the internal resource while blocked.
        tcb.priority = self.cfg.tasks[cur.0].priority;
        self.dispatch(tid, DispatchKind::Block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::cfg::test_fixture::*;
    use crate::*;

    fn cfg_with_extended() -> [TaskAttr; 3] {
        let mut attrs = [task_attr(0), task_attr(2), task_attr(1)];
        attrs[1].flags |= TaskFlags::EXTENDED;
        attrs
    }

    #[test]
    fn set_and_clear_round_trip() {
        let attrs = cfg_with_extended();
        let cfg = small_cfg(&attrs);
        kernel_fixture!(k, &cfg);
        k.sys_activate_task(TaskId(1)).unwrap();
        k.jump_next();

        k.set_event(TaskId(1), 0x0c).unwrap();
        assert_eq!(k.get_event(TaskId(1)), Ok(0x0c));
        k.clear_event(0x0c).unwrap();
        assert_eq!(k.get_event(TaskId(1)), Ok(0));
    }

    #[test]
    fn error_discipline() {
        let mut attrs = cfg_with_extended();
        attrs[2].flags |= TaskFlags::EXTENDED;
        let cfg = small_cfg(&attrs);
        kernel_fixture!(k, &cfg);
        k.sys_activate_task(TaskId(1)).unwrap();
        k.jump_next();

        // The idle task is basic.
        assert_eq!(k.set_event(TaskId(0), 1), Err(OsError::Access));
        assert_eq!(k.set_event(TaskId(9), 1), Err(OsError::Id));
        // Task 2 is extended but still suspended.
        assert_eq!(k.set_event(TaskId(2), 1), Err(OsError::State));
        assert_eq!(k.get_event(TaskId(2)), Err(OsError::State));
    }

    #[test]
    fn wait_blocks_and_set_wakes() {
        let attrs = cfg_with_extended();
        let cfg = small_cfg(&attrs);
        kernel_fixture!(k, &cfg);
        k.sys_activate_task(TaskId(1)).unwrap();
        k.sys_activate_task(TaskId(0)).unwrap();
        k.jump_next();
        assert_eq!(k.get_task_id(), Some(TaskId(1)));

        k.wait_event(0x0a).unwrap();
        // The extended task blocked; the idle task took over.
        assert_eq!(k.data.tasks[1].state, TaskState::Waiting);
        assert_eq!(k.get_task_id(), Some(TaskId(0)));

        k.set_event(TaskId(1), 0x08).unwrap();
        // Waking raised a preemption back to the extended task.
        assert_eq!(k.get_task_id(), Some(TaskId(1)));
        assert_eq!(k.data.tasks[1].state, TaskState::Running);
        k.clear_event(0x08).unwrap();
        assert_eq!(k.get_event(TaskId(1)), Ok(0));
    }

    #[test]
    fn wait_returns_immediately_if_event_set() {
        let attrs = cfg_with_extended();
        let cfg = small_cfg(&attrs);
        kernel_fixture!(k, &cfg);
        k.sys_activate_task(TaskId(1)).unwrap();
        k.jump_next();

        k.set_event(TaskId(1), 0x02).unwrap();
        k.wait_event(0x02).unwrap();
        assert_eq!(k.data.tasks[1].state, TaskState::Running);
    }
}
