use std::sync::Arc;

use crate::context::XbdmContext;
use crate::rdcp::requests::{
    ContinueThread, GetContext, GetExtContext, GetThreadInfo, HaltThread, IsStopped, ResumeThread,
    SetContext, SuspendThread,
};
use crate::rdcp::types::{ThreadContext, ThreadFloatContext, ThreadInfo};
use crate::rdcp::StopReason;
use crate::Error;

/// The x86 trap flag, OR-ed into `eflags` to arm a single step.
pub const TRAP_FLAG: u32 = 0x100;

/// One thread on the target, keyed by its XBDM thread id.
#[derive(Debug, Clone, Default)]
pub struct Thread {
    pub thread_id: u32,
    pub info: ThreadInfo,
    /// Last fetched integer registers.
    pub context: Option<ThreadContext>,
    /// Last fetched x87 state.
    pub float_context: Option<ThreadFloatContext>,
    /// Whether the thread is currently stopped as far as notifications say.
    pub stopped: bool,
    /// The most recent stop reason, shared with whoever is encoding it.
    pub last_stop_reason: Option<Arc<StopReason>>,
}

impl Thread {
    pub fn new(thread_id: u32) -> Thread {
        Thread {
            thread_id,
            ..Thread::default()
        }
    }

    /// Refreshes the `threadinfo` metadata.
    pub fn fetch_info(&mut self, context: &XbdmContext) -> Result<(), Error> {
        self.info = context.execute(&GetThreadInfo {
            thread_id: self.thread_id,
        })?;
        Ok(())
    }

    /// Refreshes the integer registers.
    pub fn fetch_context(&mut self, context: &XbdmContext) -> Result<ThreadContext, Error> {
        let registers = context.execute(&GetContext {
            thread_id: self.thread_id,
        })?;
        self.context = Some(registers);
        Ok(registers)
    }

    /// Refreshes the x87 state.
    pub fn fetch_float_context(
        &mut self,
        context: &XbdmContext,
    ) -> Result<ThreadFloatContext, Error> {
        let registers = context.execute(&GetExtContext {
            thread_id: self.thread_id,
        })?;
        self.float_context = Some(registers);
        Ok(registers)
    }

    /// Pushes registers back to the target and mirrors them locally.
    pub fn set_context(
        &mut self,
        context: &XbdmContext,
        registers: ThreadContext,
    ) -> Result<(), Error> {
        context.execute(&SetContext {
            thread_id: self.thread_id,
            context: registers,
        })?;
        if let Some(cached) = &mut self.context {
            merge_context(cached, &registers);
        } else {
            self.context = Some(registers);
        }
        Ok(())
    }

    /// Queries the target for this thread's stop reason.
    pub fn fetch_stop_reason(
        &mut self,
        context: &XbdmContext,
    ) -> Result<Option<Arc<StopReason>>, Error> {
        let reason = context.execute(&IsStopped {
            thread_id: self.thread_id,
        })?;
        self.stopped = reason.is_some();
        self.last_stop_reason = reason.map(Arc::new);
        Ok(self.last_stop_reason.clone())
    }

    /// `halt thread=`: stop this thread at its current position.
    pub fn halt(&self, context: &XbdmContext) -> Result<(), Error> {
        context.execute(&HaltThread {
            thread_id: self.thread_id,
        })
    }

    /// `continue thread=`.
    pub fn continue_thread(&self, context: &XbdmContext, exception: bool) -> Result<(), Error> {
        context.execute(&ContinueThread {
            thread_id: self.thread_id,
            exception,
        })
    }

    /// `suspend thread=`.
    pub fn suspend(&self, context: &XbdmContext) -> Result<(), Error> {
        context.execute(&SuspendThread {
            thread_id: self.thread_id,
        })
    }

    /// `resume thread=`.
    pub fn resume(&self, context: &XbdmContext) -> Result<(), Error> {
        context.execute(&ResumeThread {
            thread_id: self.thread_id,
        })
    }
}

/// Overlays the registers present in `update` onto `cached`.
pub(crate) fn merge_context(cached: &mut ThreadContext, update: &ThreadContext) {
    macro_rules! merge {
        ($($field:ident),*) => {
            $(if update.$field.is_some() {
                cached.$field = update.$field;
            })*
        };
    }
    merge!(ebp, esp, eip, eflags, eax, ebx, ecx, edx, edi, esi, cr0_npx_state);
}
