//! Resource management with the Immediate Priority Ceiling Protocol
//!
//! A task acquiring a resource immediately adopts the resource's ceiling
//! priority, the maximum original priority of any task that may acquire it.
//! While the resource is held, no task of sufficient priority to contend for
//! it can be scheduled, which provides mutual exclusion without locks.
//!
//! Resources occupied by a task form a LIFO stack linked through the control
//! blocks; releases must come in reverse acquisition order. Entry 0 of the
//! resource array is `RES_SCHEDULER`, whose ceiling is the highest priority.
use crate::{
    error::{OsError, ServiceId, StatusType},
    port::Port,
    utils::Init,
    Kernel, Priority, ResourceId,
};

/// `RES_SCHEDULER`: acquiring it makes the caller non-preemptable.
pub const RES_SCHEDULER: ResourceId = ResourceId(0);

/// The static properties of a resource.
#[derive(Debug, Clone, Copy)]
pub struct ResourceAttr {
    /// The ceiling priority. For a group of linked resources the generator
    /// assigns all members the maximum ceiling of the group.
    pub ceiling: Priority,
}

/// *Resource control block*.
#[derive(Debug, Clone, Copy)]
pub struct ResourceCb {
    pub(crate) occupied: bool,
    /// The resource acquired just before this one by the occupying task.
    pub(crate) below: Option<ResourceId>,
}

impl Init for ResourceCb {
    const INIT: Self = Self {
        occupied: false,
        below: None,
    };
}

impl<P: Port> Kernel<'_, P> {
    /// Occupy a resource and raise the caller to its ceiling priority.
    pub fn get_resource(&mut self, rid: ResourceId) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_get_resource(rid);
        self.finish(ServiceId::GetResource, [rid.0, 0, 0], ret)
    }

    /// Release the most recently occupied resource and restore the caller's
    /// priority. May preempt if lowering the priority reveals a pending
    /// higher-priority task.
    pub fn release_resource(&mut self, rid: ResourceId) -> StatusType {
        let _lock = self.service_lock();
        let ret = self.sys_release_resource(rid);
        let ret = self.finish(ServiceId::ReleaseResource, [rid.0, 0, 0], ret);
        if ret.is_ok() {
            self.preempt_point();
        }
        ret
    }

    fn sys_get_resource(&mut self, rid: ResourceId) -> StatusType {
        if rid.0 >= self.cfg.resources.len() {
            return Err(OsError::Id);
        }
        let cur = self.expect_running_task();
        let ceiling = self.cfg.resources[rid.0].ceiling;
        if self.cfg.status_level.is_extended() {
            if self.data.resources[rid.0].occupied {
                return Err(OsError::Access);
            }
            if self.cfg.tasks[cur.0].priority > ceiling {
                // Statically mis-assigned ceiling; the caller may never
                // acquire this resource.
                return Err(OsError::Access);
            }
        }
        self.data.resources[rid.0].occupied = true;
        self.push_resource(cur, rid);
        self.data.tasks[cur.0].priority = ceiling;
        Ok(())
    }

    fn sys_release_resource(&mut self, rid: ResourceId) -> StatusType {
        if rid.0 >= self.cfg.resources.len() {
            return Err(OsError::Id);
        }
        let cur = self.expect_running_task();
        if self.cfg.status_level.is_extended() {
            if !self.data.resources[rid.0].occupied {
                return Err(OsError::NoFunc);
            }
            if self.data.tasks[cur.0].res_top != Some(rid) {
                // Releases must match acquisitions in reverse order.
                return Err(OsError::NoFunc);
            }
            if self.cfg.tasks[cur.0].priority > self.cfg.resources[rid.0].ceiling {
                return Err(OsError::Access);
            }
        }
        self.data.resources[rid.0].occupied = false;
        self.pop_resource(cur);
        // Restore the priority to the ceiling of the next stacked resource,
        // else the internal-resource ceiling, else the original priority.
        let restored: Priority = if let Some(top) = self.data.tasks[cur.0].res_top {
            self.cfg.resources[top.0].ceiling
        } else if let Some(ceiling) = self.cfg.tasks[cur.0].internal_ceiling {
            ceiling
        } else {
            self.cfg.tasks[cur.0].priority
        };
        self.data.tasks[cur.0].priority = restored;
        Ok(())
    }

    fn push_resource(&mut self, cur: crate::TaskId, rid: ResourceId) {
        self.data.resources[rid.0].below = self.data.tasks[cur.0].res_top;
        self.data.tasks[cur.0].res_top = Some(rid);
    }

    /// Pop the top of the calling task's resource stack.
    fn pop_resource(&mut self, cur: crate::TaskId) {
        let Some(top) = self.data.tasks[cur.0].res_top else {
            panic!("resource stack underflow");
        };
        self.data.tasks[cur.0].res_top = self.data.resources[top.0].below;
        self.data.resources[top.0].below = None;
    }
}
