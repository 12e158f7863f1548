//! Typed stop reasons, parsed from XBDM notification bodies and `isstopped`
//! responses.

use std::fmt;

use crate::rdcp::MapResponse;

/// Signal number the GDB front end reports for trap-like stops.
pub const SIGTRAP: u8 = 5;
/// Signal number reported for RIP (fatal error) stops.
pub const SIGABRT: u8 = 6;

/// How a watchpoint was tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
    Unknown,
}

/// The execution states announced by `execution …` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Stopped,
    Started,
    Rebooting,
    Pending,
    Unknown,
}

/// Why a thread (or the whole target) stopped.
///
/// Parsed once in the notification layer and shared until the GDB bridge has
/// encoded its stop reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    ThreadCreated {
        thread_id: u32,
        start_address: u32,
    },
    ThreadTerminated {
        thread_id: u32,
    },
    ModuleLoaded {
        module: crate::rdcp::types::Module,
    },
    SectionLoaded {
        section: crate::rdcp::types::Section,
    },
    SectionUnloaded {
        section: crate::rdcp::types::Section,
    },
    ExecutionStateChanged {
        state: ExecutionState,
    },
    Breakpoint {
        thread_id: u32,
        address: u32,
    },
    SingleStep {
        thread_id: u32,
        address: u32,
    },
    Watchpoint {
        thread_id: u32,
        address: u32,
        access_address: u32,
        access: AccessKind,
    },
    DebugStr {
        thread_id: u32,
        text: String,
    },
    Assertion {
        thread_id: u32,
    },
    Exception {
        thread_id: u32,
        address: u32,
        code: u32,
        first_chance: bool,
        noncontinuable: bool,
        kind: ExceptionKind,
    },
    Rip {
        thread_id: u32,
        message: String,
    },
    RipStop {
        thread_id: u32,
        message: String,
    },
    Unknown,
}

/// The two shapes of exception detail XBDM reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    General { nparams: u32, params: u32 },
    AccessViolation { write: bool, fault_address: u32 },
}

impl StopReason {
    /// The signal the GDB front end reports for this stop.
    pub fn signal(&self) -> u8 {
        match self {
            StopReason::Rip { .. } | StopReason::RipStop { .. } => SIGABRT,
            _ => SIGTRAP,
        }
    }

    /// The thread the stop is attributed to, when one is named.
    pub fn thread_id(&self) -> Option<u32> {
        match self {
            StopReason::ThreadCreated { thread_id, .. }
            | StopReason::ThreadTerminated { thread_id }
            | StopReason::Breakpoint { thread_id, .. }
            | StopReason::SingleStep { thread_id, .. }
            | StopReason::Watchpoint { thread_id, .. }
            | StopReason::DebugStr { thread_id, .. }
            | StopReason::Assertion { thread_id }
            | StopReason::Exception { thread_id, .. }
            | StopReason::Rip { thread_id, .. }
            | StopReason::RipStop { thread_id, .. } => Some(*thread_id),
            _ => None,
        }
    }

    /// Whether this reason halts execution (as opposed to informational
    /// module/section/thread traffic).
    pub fn is_halting(&self) -> bool {
        matches!(
            self,
            StopReason::Breakpoint { .. }
                | StopReason::SingleStep { .. }
                | StopReason::Watchpoint { .. }
                | StopReason::Assertion { .. }
                | StopReason::Exception { .. }
                | StopReason::Rip { .. }
                | StopReason::RipStop { .. }
        )
    }

    /// Parses a `break` notification body.
    pub fn parse_break(map: &MapResponse) -> StopReason {
        StopReason::Breakpoint {
            thread_id: map.get_u32("thread").unwrap_or(0),
            address: map.get_u32("addr").or_else(|| map.get_u32("address")).unwrap_or(0),
        }
    }

    /// Parses a `singlestep` notification body.
    pub fn parse_single_step(map: &MapResponse) -> StopReason {
        StopReason::SingleStep {
            thread_id: map.get_u32("thread").unwrap_or(0),
            address: map.get_u32("addr").or_else(|| map.get_u32("address")).unwrap_or(0),
        }
    }

    /// Parses a `data` (watchpoint) notification body. The access kind is
    /// keyed by which of `read`/`write`/`execute` carries the faulting
    /// address.
    pub fn parse_watchpoint(map: &MapResponse) -> StopReason {
        let thread_id = map.get_u32("thread").unwrap_or(0);
        let address = map.get_u32("addr").or_else(|| map.get_u32("address")).unwrap_or(0);
        let (access, access_address) = if let Some(addr) = map.get_u32("read") {
            (AccessKind::Read, addr)
        } else if let Some(addr) = map.get_u32("write") {
            (AccessKind::Write, addr)
        } else if let Some(addr) = map.get_u32("execute") {
            (AccessKind::Execute, addr)
        } else {
            (AccessKind::Unknown, 0)
        };
        StopReason::Watchpoint {
            thread_id,
            address,
            access_address,
            access,
        }
    }

    /// Parses an `exception` notification body.
    pub fn parse_exception(map: &MapResponse) -> StopReason {
        let kind = if let Some(fault_address) = map.get_u32("read") {
            ExceptionKind::AccessViolation {
                write: false,
                fault_address,
            }
        } else if let Some(fault_address) = map.get_u32("write") {
            ExceptionKind::AccessViolation {
                write: true,
                fault_address,
            }
        } else {
            ExceptionKind::General {
                nparams: map.get_u32("nparams").unwrap_or(0),
                params: map.get_u32("params").unwrap_or(0),
            }
        };
        StopReason::Exception {
            thread_id: map.get_u32("thread").unwrap_or(0),
            address: map.get_u32("addr").or_else(|| map.get_u32("address")).unwrap_or(0),
            code: map.get_u32("code").unwrap_or(0),
            first_chance: map.has_key("first"),
            noncontinuable: map.has_key("noncont"),
            kind,
        }
    }

    /// Parses an `execution` notification body.
    pub fn parse_execution(map: &MapResponse) -> StopReason {
        let state = if map.has_key("stopped") {
            ExecutionState::Stopped
        } else if map.has_key("started") {
            ExecutionState::Started
        } else if map.has_key("rebooting") {
            ExecutionState::Rebooting
        } else if map.has_key("pending") {
            ExecutionState::Pending
        } else {
            ExecutionState::Unknown
        };
        StopReason::ExecutionStateChanged { state }
    }

    /// Parses a `create` (thread created) notification body.
    pub fn parse_thread_created(map: &MapResponse) -> StopReason {
        StopReason::ThreadCreated {
            thread_id: map.get_u32("thread").unwrap_or(0),
            start_address: map.get_u32("start").unwrap_or(0),
        }
    }

    /// Parses a `terminate` notification body.
    pub fn parse_thread_terminated(map: &MapResponse) -> StopReason {
        StopReason::ThreadTerminated {
            thread_id: map.get_u32("thread").unwrap_or(0),
        }
    }

    /// Parses a `debugstr` notification body.
    pub fn parse_debugstr(map: &MapResponse, raw: &str) -> StopReason {
        let text = map
            .get_str("string")
            .map(str::to_owned)
            .unwrap_or_else(|| raw.to_owned());
        StopReason::DebugStr {
            thread_id: map.get_u32("thread").unwrap_or(0),
            text,
        }
    }

    /// Parses an `isstopped` response body, which names the reason as a
    /// leading flag key.
    pub fn parse_is_stopped(map: &MapResponse) -> StopReason {
        if map.has_key("break") {
            StopReason::parse_break(map)
        } else if map.has_key("singlestep") {
            StopReason::parse_single_step(map)
        } else if map.has_key("data") {
            StopReason::parse_watchpoint(map)
        } else if map.has_key("exception") {
            StopReason::parse_exception(map)
        } else if map.has_key("debugstr") {
            StopReason::parse_debugstr(map, "")
        } else if map.has_key("assert") {
            StopReason::Assertion {
                thread_id: map.get_u32("thread").unwrap_or(0),
            }
        } else if map.has_key("rip") {
            StopReason::Rip {
                thread_id: map.get_u32("thread").unwrap_or(0),
                message: map.get_str("message").unwrap_or("").to_owned(),
            }
        } else {
            StopReason::Unknown
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ThreadCreated {
                thread_id,
                start_address,
            } => write!(f, "create thread {thread_id} start {start_address:#010x}"),
            StopReason::ThreadTerminated { thread_id } => {
                write!(f, "terminate thread {thread_id}")
            }
            StopReason::ModuleLoaded { module } => {
                write!(f, "module load {} at {:#010x}", module.name, module.base_address)
            }
            StopReason::SectionLoaded { section } => {
                write!(f, "section load {} at {:#010x}", section.name, section.base_address)
            }
            StopReason::SectionUnloaded { section } => {
                write!(f, "section unload {}", section.name)
            }
            StopReason::ExecutionStateChanged { state } => {
                write!(f, "execution state changed to {state:?}")
            }
            StopReason::Breakpoint { thread_id, address } => {
                write!(f, "breakpoint on thread {thread_id} at {address:#010x}")
            }
            StopReason::SingleStep { thread_id, address } => {
                write!(f, "single step on thread {thread_id} at {address:#010x}")
            }
            StopReason::Watchpoint {
                thread_id,
                address,
                access_address,
                access,
            } => write!(
                f,
                "watchpoint on thread {thread_id} at {address:#010x} ({access:?} {access_address:#010x})"
            ),
            StopReason::DebugStr { thread_id, text } => {
                write!(f, "debugstr on thread {thread_id}: {text}")
            }
            StopReason::Assertion { thread_id } => write!(f, "assert prompt on thread {thread_id}"),
            StopReason::Exception {
                thread_id,
                address,
                code,
                ..
            } => write!(
                f,
                "exception {code:#010x} on thread {thread_id} at {address:#010x}"
            ),
            StopReason::Rip { thread_id, message } => {
                write!(f, "RIP on thread {thread_id} \"{message}\"")
            }
            StopReason::RipStop { thread_id, message } => {
                write!(f, "RIPStop on thread {thread_id} \"{message}\"")
            }
            StopReason::Unknown => write!(f, "unknown reason"),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn watchpoint_access_kind_follows_the_carrying_key() {
        let map = MapResponse::parse(b"thread=3 addr=0x80041000 write=0xd0002000");
        let reason = StopReason::parse_watchpoint(&map);
        assert_eq!(
            reason,
            StopReason::Watchpoint {
                thread_id: 3,
                address: 0x8004_1000,
                access_address: 0xd000_2000,
                access: AccessKind::Write,
            }
        );
        assert_eq!(reason.signal(), SIGTRAP);
    }

    #[test]
    fn access_violation_exceptions_carry_the_fault_address() {
        let map =
            MapResponse::parse(b"thread=1 addr=0x10000 code=0xc0000005 first read=0xdeadbeef");
        let reason = StopReason::parse_exception(&map);
        match reason {
            StopReason::Exception {
                first_chance,
                noncontinuable,
                kind,
                ..
            } => {
                assert!(first_chance);
                assert!(!noncontinuable);
                assert_eq!(
                    kind,
                    ExceptionKind::AccessViolation {
                        write: false,
                        fault_address: 0xdead_beef
                    }
                );
            }
            other => panic!("unexpected reason {other:?}"),
        }
    }

    #[test]
    fn rip_maps_to_sigabrt() {
        let reason = StopReason::Rip {
            thread_id: 1,
            message: "fatal".into(),
        };
        assert_eq!(reason.signal(), SIGABRT);
    }

    #[test]
    fn execution_states_parse_from_flag_keys() {
        for (body, expected) in [
            (&b"stopped"[..], ExecutionState::Stopped),
            (b"started", ExecutionState::Started),
            (b"rebooting", ExecutionState::Rebooting),
            (b"pending", ExecutionState::Pending),
        ] {
            let reason = StopReason::parse_execution(&MapResponse::parse(body));
            assert_eq!(reason, StopReason::ExecutionStateChanged { state: expected });
        }
    }
}
