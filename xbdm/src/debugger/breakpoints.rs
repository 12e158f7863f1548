use std::collections::BTreeMap;

use crate::rdcp::requests::{Break, BreakMode};

/// The four breakpoint classes XBDM's `break` command supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BreakpointKind {
    /// Break when the address is executed.
    Execute,
    /// Break when the range is read.
    ReadWatch,
    /// Break when the range is written.
    WriteWatch,
    /// Break when the range is executed (a watch variant GDB has no exact
    /// counterpart for).
    ExecuteWatch,
}

/// Identity of a breakpoint: what, where, and how wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BreakpointKey {
    pub kind: BreakpointKind,
    pub address: u32,
    pub length: u32,
}

impl BreakpointKey {
    /// An execute breakpoint at `address`.
    pub fn execute(address: u32) -> BreakpointKey {
        BreakpointKey {
            kind: BreakpointKind::Execute,
            address,
            length: 1,
        }
    }

    /// The `break` command that installs (or, with `clear`, removes) this
    /// breakpoint.
    pub fn command(&self, clear: bool) -> Break {
        let mode = match self.kind {
            BreakpointKind::Execute => BreakMode::Address(self.address),
            BreakpointKind::ReadWatch => BreakMode::Read {
                address: self.address,
                size: self.length,
            },
            BreakpointKind::WriteWatch => BreakMode::Write {
                address: self.address,
                size: self.length,
            },
            BreakpointKind::ExecuteWatch => BreakMode::Execute {
                address: self.address,
                size: self.length,
            },
        };
        Break { mode, clear }
    }
}

/// One registered breakpoint.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointRecord {
    pub key: BreakpointKey,
    /// Removed automatically at the next stop (function-step return
    /// breakpoints).
    pub one_shot: bool,
}

/// The source of truth for what the target currently has set.
///
/// An entry is either live on the target or listed in the pending-restore
/// set because it was temporarily cleared for a transparent step-over. After
/// a reboot the whole registry is marked for reinstallation.
#[derive(Debug, Default)]
pub struct BreakpointRegistry {
    entries: BTreeMap<BreakpointKey, BreakpointRecord>,
    needs_reinstall: bool,
}

impl BreakpointRegistry {
    /// Records a breakpoint. Returns `false` if it was already present.
    pub fn insert(&mut self, record: BreakpointRecord) -> bool {
        self.entries.insert(record.key, record).is_none()
    }

    /// Drops a breakpoint, returning its record if it was present.
    pub fn remove(&mut self, key: &BreakpointKey) -> Option<BreakpointRecord> {
        self.entries.remove(key)
    }

    /// Whether `key` is registered.
    pub fn contains(&self, key: &BreakpointKey) -> bool {
        self.entries.contains_key(key)
    }

    /// All registered breakpoints.
    pub fn iter(&self) -> impl Iterator<Item = &BreakpointRecord> {
        self.entries.values()
    }

    /// Number of registered breakpoints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The execute-class breakpoint whose trigger address is `address`, used
    /// to decide whether a step must bypass one.
    pub fn execute_breakpoint_at(&self, address: u32) -> Option<BreakpointKey> {
        self.entries
            .keys()
            .find(|key| {
                matches!(
                    key.kind,
                    BreakpointKind::Execute | BreakpointKind::ExecuteWatch
                ) && key.address == address
            })
            .copied()
    }

    /// Registered one-shot breakpoints.
    pub fn one_shots(&self) -> Vec<BreakpointKey> {
        self.entries
            .values()
            .filter(|record| record.one_shot)
            .map(|record| record.key)
            .collect()
    }

    /// Marks every entry as needing reinstallation (the target lost them in
    /// a reboot).
    pub fn mark_needs_reinstall(&mut self) {
        self.needs_reinstall = !self.entries.is_empty();
    }

    /// Consumes the reinstall flag, returning the keys to reinstall.
    pub fn take_reinstall_set(&mut self) -> Vec<BreakpointKey> {
        if !self.needs_reinstall {
            return Vec::new();
        }
        self.needs_reinstall = false;
        self.entries.keys().copied().collect()
    }
}
