//! The debugger state model: threads, modules, memory, breakpoints, and the
//! attach state machine driven by XBDM notifications.

pub mod expression;

mod breakpoints;
mod thread;

pub use breakpoints::{BreakpointKey, BreakpointKind, BreakpointRecord, BreakpointRegistry};
pub use thread::{Thread, TRAP_FLAG};

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::{NotificationHandle, XbdmContext};
use crate::notification::Notification;
use crate::rdcp::requests::{
    Break, BreakMode, ContinueThread, Debugger, GetMem, GetThreadInfo, Go, LoadOnBootTitle,
    ModSections, Modules, NotifyAt, Reboot, RebootFlags, SetContext, SetMem, Stop, StopEvents,
    StopOn, Threads, WalkMem,
};
use crate::rdcp::types::{MemoryRegion, Module, Section, ThreadContext, ThreadFloatContext};
use crate::rdcp::{ExecutionState, Status, StopReason};
use crate::util::split_xbe_path;
use crate::Error;

/// Upper bound on the hex-encoded data bytes of one `setmem` line, chosen so
/// the full command fits XBDM's command buffer.
pub const SETMEM_MAX_BYTES: usize = 240;

/// How many bytes to fetch when decoding the instruction at EIP.
const DECODE_WINDOW: u32 = 16;

/// The debugger's attach state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    /// Not attached; no notification traffic is interpreted.
    Detached,
    /// `attach` has begun but the target has not reported execution state.
    Attaching,
    /// Attached, target running.
    Running,
    /// Attached, target stopped with at least one thread carrying a reason.
    Stopped,
    /// The target announced a reboot; all cached state is invalid.
    Rebooting,
}

#[derive(Default)]
struct DebuggerState {
    attach: Option<AttachState>,
    threads: BTreeMap<u32, Thread>,
    modules: Vec<Module>,
    memory_map: Vec<MemoryRegion>,
    breakpoints: BreakpointRegistry,
    active_thread: Option<u32>,
    /// Execute breakpoints temporarily cleared for a transparent step-over.
    pending_restore: Vec<BreakpointKey>,
    /// Reattach policy after a `debug_xbe` reboot.
    break_at_start: bool,
    /// Set by `execution rebooting`; consumed by the post-reboot reattach.
    reattach_pending: bool,
}

impl DebuggerState {
    fn attach_state(&self) -> AttachState {
        self.attach.unwrap_or(AttachState::Detached)
    }
}

/// The source-level debugger built on top of an [`XbdmContext`].
///
/// All mutation of the thread/module/breakpoint maps happens either on the
/// notification dispatcher or under the caller of a public method; one mutex
/// guards the whole state and is never held across a wire round-trip.
pub struct XbdmDebugger {
    weak_self: Weak<XbdmDebugger>,
    context: Arc<XbdmContext>,
    state: Mutex<DebuggerState>,
    notification_registration: Mutex<Option<NotificationHandle>>,
}

impl XbdmDebugger {
    /// Creates a detached debugger.
    pub fn new(context: Arc<XbdmContext>) -> Arc<XbdmDebugger> {
        Arc::new_cyclic(|weak_self| XbdmDebugger {
            weak_self: weak_self.clone(),
            context,
            state: Mutex::new(DebuggerState::default()),
            notification_registration: Mutex::new(None),
        })
    }

    /// The context this debugger drives.
    pub fn context(&self) -> &Arc<XbdmContext> {
        &self.context
    }

    /// Attaches to the target: `debugger connect`, `notifyat`, `stopon all`,
    /// then an initial sweep of threads, modules, and the memory map.
    pub fn attach(&self) -> Result<(), Error> {
        self.state.lock().attach = Some(AttachState::Attaching);

        let port = self.context.start_notification_listener()?;
        self.subscribe_notifications();

        match self.context.execute(&Debugger { connect: true }) {
            Ok(()) => {}
            Err(Error::Target {
                status: Status::NotDebuggable,
                message,
            }) => {
                self.state.lock().attach = Some(AttachState::Detached);
                return Err(Error::target(Status::NotDebuggable, message));
            }
            Err(err) => {
                self.state.lock().attach = Some(AttachState::Detached);
                return Err(err);
            }
        }

        self.context.execute(&NotifyAt {
            port,
            drop_connection: false,
            debug_flag: false,
        })?;
        self.context.execute(&StopOn {
            events: StopEvents::all(),
            enable: true,
        })?;

        self.state.lock().attach = Some(AttachState::Running);

        self.fetch_threads()?;
        self.fetch_modules()?;
        self.refresh_memory_map()?;
        tracing::info!("attached to {}", self.context.endpoint());
        Ok(())
    }

    /// Detaches, leaving the target in whatever execution state it is in.
    pub fn detach(&self) -> Result<(), Error> {
        self.notification_registration.lock().take();
        if let Some(port) = self.context.notification_port() {
            let _ = self.context.execute(&NotifyAt {
                port,
                drop_connection: true,
                debug_flag: false,
            });
        }
        let result = self.context.execute(&Debugger { connect: false });
        let mut state = self.state.lock();
        *state = DebuggerState::default();
        state.attach = Some(AttachState::Detached);
        result
    }

    fn subscribe_notifications(&self) {
        let mut registration = self.notification_registration.lock();
        if registration.is_some() {
            return;
        }
        let weak = self.weak_self.clone();
        *registration = Some(self.context.register_notification_handler(move |notification| {
            if let Some(debugger) = weak.upgrade() {
                debugger.on_notification(notification);
            }
        }));
    }

    /// The current attach state.
    pub fn attach_state(&self) -> AttachState {
        self.state.lock().attach_state()
    }

    fn ensure_attached(&self) -> Result<(), Error> {
        match self.attach_state() {
            AttachState::Detached => Err(Error::NotAttached),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Snapshot of all known threads.
    pub fn threads(&self) -> Vec<Thread> {
        self.state.lock().threads.values().cloned().collect()
    }

    /// Snapshot of one thread.
    pub fn thread(&self, thread_id: u32) -> Option<Thread> {
        self.state.lock().threads.get(&thread_id).cloned()
    }

    /// The explicitly selected thread, if any.
    pub fn active_thread_id(&self) -> Option<u32> {
        self.state.lock().active_thread
    }

    /// Selects the thread subsequent thread-scoped operations default to.
    pub fn set_active_thread(&self, thread_id: Option<u32>) {
        let mut state = self.state.lock();
        match thread_id {
            Some(id) if state.threads.contains_key(&id) => state.active_thread = Some(id),
            Some(id) => {
                tracing::warn!(thread_id = id, "selecting unknown thread");
                state.active_thread = Some(id);
            }
            None => state.active_thread = None,
        }
    }

    /// The active thread if set, otherwise the lowest-id thread.
    pub fn any_thread_id(&self) -> Option<u32> {
        let state = self.state.lock();
        state
            .active_thread
            .or_else(|| state.threads.keys().next().copied())
    }

    /// Re-enumerates threads via `threads` + `threadinfo`. Threads absent
    /// from the fresh enumeration are dropped; threads that vanish between
    /// the two commands are dropped without error.
    pub fn fetch_threads(&self) -> Result<Vec<u32>, Error> {
        self.ensure_attached()?;
        let ids = self.context.execute(&Threads)?;

        {
            let mut state = self.state.lock();
            state.threads.retain(|id, _| ids.contains(id));
            if let Some(active) = state.active_thread {
                if !ids.contains(&active) {
                    state.active_thread = None;
                }
            }
            for &id in &ids {
                state.threads.entry(id).or_insert_with(|| Thread::new(id));
            }
        }

        for &id in &ids {
            match self.context.execute(&GetThreadInfo { thread_id: id }) {
                Ok(info) => {
                    if let Some(thread) = self.state.lock().threads.get_mut(&id) {
                        thread.info = info;
                    }
                }
                Err(Error::Target { status, .. }) => {
                    tracing::debug!(thread_id = id, %status, "thread vanished during enumeration");
                    self.state.lock().threads.remove(&id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(ids)
    }

    /// Fetches and caches a thread's integer registers.
    pub fn fetch_context(&self, thread_id: u32) -> Result<ThreadContext, Error> {
        self.ensure_attached()?;
        let mut thread = self
            .thread(thread_id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown thread {thread_id}")))?;
        let registers = thread.fetch_context(&self.context)?;
        if let Some(entry) = self.state.lock().threads.get_mut(&thread_id) {
            entry.context = Some(registers);
        }
        Ok(registers)
    }

    /// Fetches and caches a thread's x87 state.
    pub fn fetch_float_context(&self, thread_id: u32) -> Result<ThreadFloatContext, Error> {
        self.ensure_attached()?;
        let mut thread = self
            .thread(thread_id)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown thread {thread_id}")))?;
        let registers = thread.fetch_float_context(&self.context)?;
        if let Some(entry) = self.state.lock().threads.get_mut(&thread_id) {
            entry.float_context = Some(registers);
        }
        Ok(registers)
    }

    /// Pushes registers to a thread via `setcontext`.
    pub fn set_context(&self, thread_id: u32, registers: ThreadContext) -> Result<(), Error> {
        self.ensure_attached()?;
        self.context.execute(&SetContext {
            thread_id,
            context: registers,
        })?;
        if let Some(entry) = self.state.lock().threads.get_mut(&thread_id) {
            entry.context = match entry.context.take() {
                Some(mut cached) => {
                    thread::merge_context(&mut cached, &registers);
                    Some(cached)
                }
                None => Some(registers),
            };
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Modules & memory
    // ------------------------------------------------------------------

    /// Snapshot of all known modules.
    pub fn modules(&self) -> Vec<Module> {
        self.state.lock().modules.clone()
    }

    /// The module named `name`, matched case-insensitively.
    pub fn module(&self, name: &str) -> Option<Module> {
        self.state
            .lock()
            .modules
            .iter()
            .find(|module| module.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Re-enumerates modules and their sections.
    pub fn fetch_modules(&self) -> Result<Vec<Module>, Error> {
        self.ensure_attached()?;
        let mut modules = self.context.execute(&Modules)?;
        for module in &mut modules {
            match self.context.execute(&ModSections { name: &module.name }) {
                Ok(sections) => module.sections = sections,
                Err(Error::Target { status, .. }) => {
                    tracing::debug!(module = %module.name, %status, "no section listing");
                }
                Err(err) => return Err(err),
            }
        }
        self.state.lock().modules = modules.clone();
        Ok(modules)
    }

    /// Snapshot of the cached memory map.
    pub fn memory_map(&self) -> Vec<MemoryRegion> {
        self.state.lock().memory_map.clone()
    }

    /// Re-walks the target's memory map.
    pub fn refresh_memory_map(&self) -> Result<Vec<MemoryRegion>, Error> {
        self.ensure_attached()?;
        let regions = self.context.execute(&WalkMem)?;
        self.state.lock().memory_map = regions.clone();
        Ok(regions)
    }

    /// Reads target memory.
    pub fn get_memory(&self, address: u32, length: u32) -> Result<Vec<u8>, Error> {
        self.ensure_attached()?;
        self.context.execute(&GetMem { address, length })
    }

    /// Reads one little-endian DWORD.
    pub fn get_dword(&self, address: u32) -> Result<u32, Error> {
        let bytes = self.get_memory(address, 4)?;
        let bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::ProtocolViolation("short getmem2 response".into()))?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes target memory, splitting into consecutive `setmem` commands so
    /// each line stays inside XBDM's command buffer.
    pub fn set_memory(&self, address: u32, data: &[u8]) -> Result<(), Error> {
        self.ensure_attached()?;
        for (index, chunk) in data.chunks(SETMEM_MAX_BYTES).enumerate() {
            let chunk_address = address + (index * SETMEM_MAX_BYTES) as u32;
            self.context.execute(&SetMem {
                address: chunk_address,
                data: chunk,
            })?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Breakpoints
    // ------------------------------------------------------------------

    /// Snapshot of the breakpoint registry.
    pub fn breakpoints(&self) -> Vec<BreakpointRecord> {
        self.state.lock().breakpoints.iter().copied().collect()
    }

    /// Installs a breakpoint: registry first, then the target; a wire
    /// failure rolls the registry entry back.
    pub fn add_breakpoint(&self, kind: BreakpointKind, address: u32, length: u32) -> Result<(), Error> {
        self.ensure_attached()?;
        let key = BreakpointKey {
            kind,
            address,
            length,
        };
        if !self.state.lock().breakpoints.insert(BreakpointRecord {
            key,
            one_shot: false,
        }) {
            return Ok(());
        }
        match self.context.execute(&key.command(false)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state.lock().breakpoints.remove(&key);
                Err(err)
            }
        }
    }

    /// Removes a breakpoint; a wire failure restores the registry entry.
    pub fn remove_breakpoint(
        &self,
        kind: BreakpointKind,
        address: u32,
        length: u32,
    ) -> Result<(), Error> {
        self.ensure_attached()?;
        let key = BreakpointKey {
            kind,
            address,
            length,
        };
        let Some(record) = self.state.lock().breakpoints.remove(&key) else {
            return Err(Error::InvalidArgument(format!(
                "no breakpoint registered at {address:#010x}"
            )));
        };
        match self.context.execute(&key.command(true)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.state.lock().breakpoints.insert(record);
                Err(err)
            }
        }
    }

    /// Removes the execute breakpoint at `address`, if registered.
    pub fn remove_breakpoint_at_address(&self, address: u32) -> Result<(), Error> {
        self.remove_breakpoint(BreakpointKind::Execute, address, 1)
    }

    // ------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------

    /// Breaks into the title (`stop`).
    pub fn halt(&self) -> Result<(), Error> {
        self.ensure_attached()?;
        self.context.execute(&Stop)?;
        self.state.lock().attach = Some(AttachState::Stopped);
        Ok(())
    }

    /// Fetches the stop reason of `thread_id` straight from the target and
    /// records it.
    pub fn fetch_stop_reason(&self, thread_id: u32) -> Result<Option<Arc<StopReason>>, Error> {
        self.ensure_attached()?;
        let mut thread = self
            .thread(thread_id)
            .unwrap_or_else(|| Thread::new(thread_id));
        let reason = thread.fetch_stop_reason(&self.context)?;
        let mut state = self.state.lock();
        state.threads.insert(thread_id, thread);
        if reason.is_some() && state.active_thread.is_none() {
            state.active_thread = Some(thread_id);
        }
        Ok(reason)
    }

    /// `continue thread=` for one thread.
    pub fn continue_thread(&self, thread_id: u32, exception: bool) -> Result<(), Error> {
        self.ensure_attached()?;
        self.context.execute(&ContinueThread {
            thread_id,
            exception,
        })
    }

    /// Continues every known thread.
    pub fn continue_all(&self, exception: bool) -> Result<(), Error> {
        for thread_id in self.state.lock().threads.keys().copied().collect::<Vec<_>>() {
            self.continue_thread(thread_id, exception)?;
        }
        Ok(())
    }

    /// Releases the stopped title (`go`), clearing recorded stop reasons.
    pub fn go(&self) -> Result<(), Error> {
        self.ensure_attached()?;
        {
            let mut state = self.state.lock();
            for thread in state.threads.values_mut() {
                thread.stopped = false;
                thread.last_stop_reason = None;
            }
        }
        self.context.execute(&Go)?;
        self.state.lock().attach = Some(AttachState::Running);
        Ok(())
    }

    /// Steps one instruction on `thread_id` by arming the trap flag. An
    /// execute breakpoint sitting at EIP is cleared for the step and
    /// reinstalled when the resulting stop notification arrives.
    pub fn step_instruction(&self, thread_id: u32) -> Result<(), Error> {
        self.ensure_attached()?;
        let registers = self.fetch_context(thread_id)?;
        let eip = registers
            .eip
            .ok_or_else(|| Error::ProtocolViolation("context missing Eip".into()))?;

        let trap = ThreadContext {
            eflags: Some(registers.eflags.unwrap_or(0) | TRAP_FLAG),
            ..ThreadContext::default()
        };
        self.set_context(thread_id, trap)?;

        let bypass = self.state.lock().breakpoints.execute_breakpoint_at(eip);
        if let Some(key) = bypass {
            tracing::debug!(address = format_args!("{eip:#010x}"), "suspending breakpoint for step");
            self.context.execute(&key.command(true))?;
            self.state.lock().pending_restore.push(key);
        }

        self.continue_thread(thread_id, false)?;
        self.context.execute(&Go)?;
        self.state.lock().attach = Some(AttachState::Running);
        Ok(())
    }

    /// Steps over one instruction: a `call` gets a one-shot breakpoint at
    /// its return site, anything else falls back to an instruction step.
    pub fn step_function(&self, thread_id: u32) -> Result<(), Error> {
        self.ensure_attached()?;
        let registers = self.fetch_context(thread_id)?;
        let eip = registers
            .eip
            .ok_or_else(|| Error::ProtocolViolation("context missing Eip".into()))?;

        let window = self.get_memory(eip, DECODE_WINDOW)?;
        match decode_call_length(&window, eip) {
            Some(length) => {
                let resume_address = eip + length;
                let key = BreakpointKey::execute(resume_address);
                self.state.lock().breakpoints.insert(BreakpointRecord {
                    key,
                    one_shot: true,
                });
                if let Err(err) = self.context.execute(&key.command(false)) {
                    self.state.lock().breakpoints.remove(&key);
                    return Err(err);
                }
                self.continue_all(false)?;
                self.go()
            }
            None => self.step_instruction(thread_id),
        }
    }

    /// Reboots the target.
    pub fn reboot(&self, flags: RebootFlags) -> Result<(), Error> {
        self.state.lock().attach = Some(AttachState::Rebooting);
        match self.context.execute(&Reboot { flags }) {
            // The connection drops as part of the reboot; losing the
            // response is expected.
            Ok(()) | Err(Error::Abandoned) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Configures a title to launch on reboot and reboots into it. With
    /// `break_at_start`, the debugger reattaches stopped at the entry point.
    pub fn debug_xbe(
        &self,
        path: &str,
        command_line: Option<&str>,
        break_at_start: bool,
    ) -> Result<(), Error> {
        self.ensure_attached()?;
        let (dir, name) = split_xbe_path(path)?;
        self.context.execute(&LoadOnBootTitle {
            name: &name,
            dir: &dir,
            command_line,
            persist: false,
        })?;

        self.state.lock().break_at_start = break_at_start;
        let mut flags = RebootFlags::WAIT;
        if break_at_start {
            flags |= RebootFlags::STOP;
        }
        self.reboot(flags)
    }

    // ------------------------------------------------------------------
    // Notification-driven state machine
    // ------------------------------------------------------------------

    fn on_notification(&self, notification: &Notification) {
        if self.attach_state() == AttachState::Detached {
            return;
        }
        let Notification::Debug(reason) = notification else {
            return;
        };
        tracing::trace!(%reason, "debug notification");

        match reason {
            StopReason::ModuleLoaded { module } => {
                let mut state = self.state.lock();
                state
                    .modules
                    .retain(|existing| existing.base_address != module.base_address);
                state.modules.push(module.clone());
            }
            StopReason::SectionLoaded { section } => {
                let mut state = self.state.lock();
                if let Some(module) = owning_module(&mut state.modules, section) {
                    module.sections.retain(|s| s.index != section.index);
                    module.sections.push(section.clone());
                }
            }
            StopReason::SectionUnloaded { section } => {
                let mut state = self.state.lock();
                if let Some(module) = owning_module(&mut state.modules, section) {
                    module.sections.retain(|s| s.index != section.index);
                }
            }
            StopReason::ThreadCreated {
                thread_id,
                start_address,
            } => {
                let mut state = self.state.lock();
                let thread = state
                    .threads
                    .entry(*thread_id)
                    .or_insert_with(|| Thread::new(*thread_id));
                thread.info.start = Some(*start_address);
            }
            StopReason::ThreadTerminated { thread_id } => {
                let mut state = self.state.lock();
                state.threads.remove(thread_id);
                if state.active_thread == Some(*thread_id) {
                    state.active_thread = None;
                }
            }
            StopReason::ExecutionStateChanged { state } => self.on_execution_state(*state),
            other => self.on_stop(other),
        }
    }

    fn on_execution_state(&self, execution: ExecutionState) {
        match execution {
            ExecutionState::Rebooting => {
                tracing::info!("target is rebooting; flushing debugger state");
                let mut state = self.state.lock();
                state.attach = Some(AttachState::Rebooting);
                state.threads.clear();
                state.modules.clear();
                state.memory_map.clear();
                state.active_thread = None;
                state.pending_restore.clear();
                state.reattach_pending = true;
                state.breakpoints.mark_needs_reinstall();
            }
            ExecutionState::Pending => {
                let (reattach_pending, break_at_start) = {
                    let state = self.state.lock();
                    (state.reattach_pending, state.break_at_start)
                };
                if reattach_pending {
                    if let Err(err) = self.context.execute(&Debugger { connect: true }) {
                        tracing::warn!(%err, "reattach during pending state failed");
                        return;
                    }
                    if break_at_start {
                        if let Err(err) = self.context.execute(&Break {
                            mode: BreakMode::Start,
                            clear: false,
                        }) {
                            tracing::warn!(%err, "break-at-start request failed");
                        }
                        self.state.lock().attach = Some(AttachState::Stopped);
                    }
                }
            }
            ExecutionState::Started => {
                let reattach = {
                    let mut state = self.state.lock();
                    std::mem::take(&mut state.reattach_pending)
                };
                if reattach {
                    self.reattach_after_reboot();
                }
                let mut state = self.state.lock();
                state.attach = Some(AttachState::Running);
                for thread in state.threads.values_mut() {
                    thread.stopped = false;
                    thread.last_stop_reason = None;
                }
            }
            ExecutionState::Stopped => {
                self.state.lock().attach = Some(AttachState::Stopped);
            }
            ExecutionState::Unknown => {
                tracing::warn!("unrecognized execution state notification");
            }
        }
    }

    /// Handles the rest of the reattach handshake once a rebooted target is
    /// running again. Runs on the notification dispatcher, which also
    /// guarantees no later notification is observed before the flush is
    /// complete.
    fn reattach_after_reboot(&self) {
        tracing::info!("target came back; reattaching");
        if let Err(err) = self.context.execute(&StopOn {
            events: StopEvents::all(),
            enable: true,
        }) {
            tracing::warn!(%err, "stopon after reboot failed");
        }

        let reinstall = self.state.lock().breakpoints.take_reinstall_set();
        for key in reinstall {
            if let Err(err) = self.context.execute(&key.command(false)) {
                tracing::warn!(?key, %err, "breakpoint reinstall failed");
                self.state.lock().breakpoints.remove(&key);
            }
        }

        if let Err(err) = self.fetch_threads() {
            tracing::warn!(%err, "thread enumeration after reboot failed");
        }
        if let Err(err) = self.fetch_modules() {
            tracing::warn!(%err, "module enumeration after reboot failed");
        }
    }

    fn on_stop(&self, reason: &StopReason) {
        let shared = Arc::new(reason.clone());
        let halting = reason.is_halting();

        let (restore, finished_one_shots) = {
            let mut state = self.state.lock();
            if let Some(thread_id) = reason.thread_id() {
                let thread = state
                    .threads
                    .entry(thread_id)
                    .or_insert_with(|| Thread::new(thread_id));
                thread.stopped = halting;
                thread.last_stop_reason = Some(shared.clone());
                if halting && state.active_thread.is_none() {
                    state.active_thread = Some(thread_id);
                }
            }
            if !halting {
                return;
            }
            state.attach = Some(AttachState::Stopped);

            let restore = std::mem::take(&mut state.pending_restore);
            let mut finished = Vec::new();
            for key in state.breakpoints.one_shots() {
                let consumed = matches!(
                    reason,
                    StopReason::Breakpoint { address, .. } if *address == key.address
                );
                if consumed {
                    state.breakpoints.remove(&key);
                    finished.push(key);
                }
            }
            (restore, finished)
        };

        // Wire traffic happens outside the state lock.
        for key in restore {
            tracing::debug!(?key, "reinstalling breakpoint after step");
            if let Err(err) = self.context.execute(&key.command(false)) {
                tracing::warn!(?key, %err, "breakpoint reinstall failed");
                self.state.lock().breakpoints.remove(&key);
            }
        }
        for key in finished_one_shots {
            if let Err(err) = self.context.execute(&key.command(true)) {
                tracing::warn!(?key, %err, "one-shot breakpoint removal failed");
            }
        }
    }
}

fn owning_module<'m>(modules: &'m mut [Module], section: &Section) -> Option<&'m mut Module> {
    modules.iter_mut().find(|module| {
        section.base_address >= module.base_address
            && section.base_address < module.base_address.wrapping_add(module.size)
    })
}

/// Length of the instruction at the start of `window` if it is a call,
/// otherwise `None`.
fn decode_call_length(window: &[u8], address: u32) -> Option<u32> {
    use capstone::arch::x86::ArchMode;
    use capstone::arch::BuildsCapstone;
    use capstone::Capstone;

    let capstone = Capstone::new().x86().mode(ArchMode::Mode32).build().ok()?;
    let instructions = capstone
        .disasm_count(window, u64::from(address), 1)
        .ok()?;
    let instruction = instructions.iter().next()?;
    let mnemonic = instruction.mnemonic()?;
    if mnemonic.starts_with("call") {
        Some(instruction.bytes().len() as u32)
    } else {
        None
    }
}
