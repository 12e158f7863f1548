//! Inbound notifications from XBDM.
//!
//! The bridge listens on a local port; after `notifyat`, XBDM opens a
//! reverse TCP connection and streams CRLF-delimited notifications over it.
//! Each line is classified by longest-prefix match against a table that
//! runtime-loaded handlers can extend with their own prefixes.

mod transport;

use std::sync::Arc;

use parking_lot::Mutex;

pub use transport::NotificationTransport;

use crate::rdcp::types::{Module, Section};
use crate::rdcp::{MapResponse, StopReason};

/// A classified notification line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A debug event that feeds the debugger state machine.
    Debug(StopReason),
    /// A `vx!` graphics-subsystem message.
    Vx(String),
    /// A line matching a runtime-registered prefix.
    Custom {
        /// The prefix that matched.
        prefix: String,
        /// Everything after the prefix.
        body: String,
    },
    /// A line matching no known prefix, kept verbatim for logging.
    Unknown(String),
}

/// The built-in prefix table. Order is irrelevant: classification always
/// picks the longest match.
const BUILTIN_PREFIXES: &[&str] = &[
    "vx!",
    "debugstr ",
    "modload ",
    "sectload ",
    "sectunload ",
    "create ",
    "terminate ",
    "execution ",
    "break ",
    "data ",
    "singlestep ",
    "exception ",
];

/// The extensible half of the prefix table, shared between the context and
/// every notification transport.
#[derive(Default)]
pub struct PrefixTable {
    custom: Mutex<Vec<String>>,
}

impl PrefixTable {
    /// Registers an additional prefix (e.g. `ntrc!`) for a runtime-loaded
    /// handler. Returns a guard that removes it again when dropped.
    pub fn register(self: &Arc<Self>, prefix: impl Into<String>) -> PrefixRegistration {
        let prefix = prefix.into();
        self.custom.lock().push(prefix.clone());
        PrefixRegistration {
            table: Arc::downgrade(self),
            prefix,
        }
    }

    fn longest_custom_match(&self, line: &str) -> Option<String> {
        self.custom
            .lock()
            .iter()
            .filter(|prefix| line.starts_with(prefix.as_str()))
            .max_by_key(|prefix| prefix.len())
            .cloned()
    }
}

/// Keeps a custom notification prefix registered; dropping it deregisters.
pub struct PrefixRegistration {
    table: std::sync::Weak<PrefixTable>,
    prefix: String,
}

impl Drop for PrefixRegistration {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.custom.lock().retain(|prefix| *prefix != self.prefix);
        }
    }
}

/// Classifies one notification line.
pub fn parse_notification(line: &str, prefixes: &PrefixTable) -> Notification {
    let builtin = BUILTIN_PREFIXES
        .iter()
        .filter(|prefix| line.starts_with(**prefix))
        .max_by_key(|prefix| prefix.len())
        .copied();
    let custom = prefixes.longest_custom_match(line);

    // Longest match wins across both halves of the table.
    if let Some(custom) = &custom {
        if custom.len() >= builtin.map_or(0, str::len) {
            return Notification::Custom {
                body: line[custom.len()..].to_owned(),
                prefix: custom.clone(),
            };
        }
    }

    let Some(prefix) = builtin else {
        return Notification::Unknown(line.to_owned());
    };
    let body = &line[prefix.len()..];
    let map = MapResponse::parse(body.as_bytes());

    match prefix {
        "vx!" => Notification::Vx(body.to_owned()),
        "debugstr " => Notification::Debug(StopReason::parse_debugstr(&map, body)),
        "modload " => match Module::parse(&map) {
            Some(module) => Notification::Debug(StopReason::ModuleLoaded { module }),
            None => Notification::Unknown(line.to_owned()),
        },
        "sectload " => match Section::parse(&map) {
            Some(section) => Notification::Debug(StopReason::SectionLoaded { section }),
            None => Notification::Unknown(line.to_owned()),
        },
        "sectunload " => match Section::parse(&map) {
            Some(section) => Notification::Debug(StopReason::SectionUnloaded { section }),
            None => Notification::Unknown(line.to_owned()),
        },
        "create " => Notification::Debug(StopReason::parse_thread_created(&map)),
        "terminate " => Notification::Debug(StopReason::parse_thread_terminated(&map)),
        "execution " => Notification::Debug(StopReason::parse_execution(&map)),
        "break " => Notification::Debug(StopReason::parse_break(&map)),
        "data " => Notification::Debug(StopReason::parse_watchpoint(&map)),
        "singlestep " => Notification::Debug(StopReason::parse_single_step(&map)),
        "exception " => Notification::Debug(StopReason::parse_exception(&map)),
        _ => Notification::Unknown(line.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::rdcp::ExecutionState;

    use super::*;

    fn table() -> PrefixTable {
        PrefixTable::default()
    }

    #[test]
    fn classifies_execution_state_changes() {
        let parsed = parse_notification("execution rebooting", &table());
        assert_eq!(
            parsed,
            Notification::Debug(StopReason::ExecutionStateChanged {
                state: ExecutionState::Rebooting
            })
        );
    }

    #[test]
    fn classifies_breakpoints_with_addresses() {
        let parsed = parse_notification("break thread=14 addr=0x80041000", &table());
        assert_eq!(
            parsed,
            Notification::Debug(StopReason::Breakpoint {
                thread_id: 14,
                address: 0x8004_1000
            })
        );
    }

    #[test]
    fn module_loads_carry_full_module_records() {
        let parsed = parse_notification(
            "modload name=\"xbdm.dll\" base=0xb0000000 size=0x12000 check=0xaabb timestamp=0x3f8a0000 tls",
            &table(),
        );
        match parsed {
            Notification::Debug(StopReason::ModuleLoaded { module }) => {
                assert_eq!(module.name, "xbdm.dll");
                assert_eq!(module.base_address, 0xb000_0000);
                assert!(module.has_tls);
                assert!(!module.is_xbe);
            }
            other => panic!("unexpected notification {other:?}"),
        }
    }

    #[test]
    fn unknown_prefixes_are_preserved() {
        let parsed = parse_notification("mystery line", &table());
        assert_eq!(parsed, Notification::Unknown("mystery line".into()));
    }

    #[test]
    fn custom_prefixes_win_when_longer() {
        let table = Arc::new(PrefixTable::default());
        let registration = table.register("ntrc!");
        let parsed = parse_notification("ntrc!new_frame id=3", &table);
        assert_eq!(
            parsed,
            Notification::Custom {
                prefix: "ntrc!".into(),
                body: "new_frame id=3".into()
            }
        );

        drop(registration);
        let parsed = parse_notification("ntrc!new_frame id=3", &table);
        assert_eq!(parsed, Notification::Unknown("ntrc!new_frame id=3".into()));
    }
}
