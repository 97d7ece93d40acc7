//! Error taxonomy and the error-service context
use crate::{port::Port, utils::Init, Kernel};

/// The closed set of error conditions a system service can report.
///
/// `E_OK` has no variant; a successful service returns `Ok(_)` instead.
/// The discriminants follow the OSEK binding so that a generated application
/// can pass them through a foreign interface unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum OsError {
    /// `E_OS_ACCESS`
    Access = 1,
    /// `E_OS_CALLEVEL`
    CallLevel = 2,
    /// `E_OS_ID`
    Id = 3,
    /// `E_OS_LIMIT`
    Limit = 4,
    /// `E_OS_NOFUNC`
    NoFunc = 5,
    /// `E_OS_RESOURCE`
    Resource = 6,
    /// `E_OS_STATE`
    State = 7,
    /// `E_OS_VALUE`
    Value = 8,
}

impl OsError {
    /// The numeric `StatusType` value of the OSEK binding.
    #[inline]
    pub const fn code(self) -> i8 {
        self as i8
    }
}

/// The result of a system service that returns no value (`E_OK` = `Ok(())`).
pub type StatusType = Result<(), OsError>;

/// Identifies the system service that most recently recorded the
/// error-service context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ServiceId {
    ActivateTask,
    TerminateTask,
    ChainTask,
    Schedule,
    GetTaskState,
    GetResource,
    ReleaseResource,
    SetEvent,
    ClearEvent,
    GetEvent,
    WaitEvent,
    GetAlarmBase,
    GetAlarm,
    SetRelAlarm,
    SetAbsAlarm,
    CancelAlarm,
    IncrementCounter,
    GetCounterValue,
    GetElapsedValue,
    StartScheduleTableRel,
    StartScheduleTableAbs,
    StartScheduleTableSynchron,
    StopScheduleTable,
    NextScheduleTable,
    SyncScheduleTable,
    SetScheduleTableAsync,
    GetScheduleTableStatus,
}

/// Records the last service invocation for `ErrorHook` introspection:
/// the service id plus up to three raw parameters.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext {
    /// The service that was invoked last, if any service ran yet.
    pub service: Option<ServiceId>,
    /// The service's parameters, zero-padded. Ids, masks and tick values are
    /// widened to `usize`.
    pub params: [usize; 3],
}

impl Init for ErrorContext {
    const INIT: Self = Self {
        service: None,
        params: [0; 3],
    };
}

impl<P: Port> Kernel<'_, P> {
    /// Record the error-service context for a completed service and route any
    /// failure through `ErrorHook`. Every service returns through here.
    pub(crate) fn finish<T>(
        &mut self,
        service: ServiceId,
        params: [usize; 3],
        ret: Result<T, OsError>,
    ) -> Result<T, OsError> {
        self.error_ctx = ErrorContext {
            service: Some(service),
            params,
        };
        if let Err(e) = &ret {
            self.error_hook(*e);
        }
        ret
    }

    /// The error-service context of the most recent service invocation.
    pub fn error_context(&self) -> ErrorContext {
        self.error_ctx
    }
}
