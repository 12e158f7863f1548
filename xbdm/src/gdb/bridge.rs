use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::context::NotificationHandle;
use crate::debugger::{BreakpointKind, XbdmDebugger};
use crate::gdb::packet::GdbPacket;
use crate::gdb::registers;
use crate::gdb::transport::GdbTransport;
use crate::notification::Notification;
use crate::rdcp::types::ThreadContext;
use crate::rdcp::{AccessKind, StopReason};

/// errno values used for RSP `E<code>` replies.
const EFAULT: u8 = 14;
const EBADMSG: u8 = 74;

/// The translator between RSP packets and debugger operations.
///
/// One bridge serves one GDB client connection. Packets arrive sequentially
/// from the transport's channel; resume-style commands (`c`, `s`, `vCont`)
/// defer their reply until the matching stop notification arrives.
pub struct GdbBridge {
    debugger: Arc<XbdmDebugger>,
    transport: Arc<Mutex<GdbTransport>>,
    no_ack: Arc<AtomicBool>,
    /// Thread selections made with `Hg`/`Hc`, keyed by operation class.
    thread_selection: Mutex<HashMap<char, i64>>,
    /// Set while the client waits for a stop reply to a resume command.
    awaiting_stop: AtomicBool,
    _notifications: NotificationHandle,
}

impl GdbBridge {
    /// Wires a bridge to its transport and subscribes it to stop
    /// notifications so resume commands can be answered asynchronously.
    pub fn new(
        debugger: Arc<XbdmDebugger>,
        transport: Arc<Mutex<GdbTransport>>,
        no_ack: Arc<AtomicBool>,
    ) -> Arc<GdbBridge> {
        Arc::new_cyclic(|weak_self: &Weak<GdbBridge>| {
            let weak = weak_self.clone();
            let registration =
                debugger
                    .context()
                    .register_notification_handler(move |notification| {
                        if let Some(bridge) = weak.upgrade() {
                            bridge.on_notification(notification);
                        }
                    });
            GdbBridge {
                debugger,
                transport,
                no_ack,
                thread_selection: Mutex::new(HashMap::new()),
                awaiting_stop: AtomicBool::new(false),
                _notifications: registration,
            }
        })
    }

    fn send(&self, packet: GdbPacket) {
        self.transport.lock().send(&packet);
    }

    fn send_ok(&self) {
        self.send(GdbPacket::new(&b"OK"[..]));
    }

    fn send_empty(&self) {
        self.send(GdbPacket::empty());
    }

    fn send_error(&self, code: u8) {
        self.send(GdbPacket::new(format!("E{code:02x}").into_bytes()));
    }

    /// Emits deferred stop replies for halting notifications.
    fn on_notification(&self, notification: &Notification) {
        let Notification::Debug(reason) = notification else {
            return;
        };
        if !reason.is_halting() {
            return;
        }
        if self.awaiting_stop.swap(false, Ordering::SeqCst) {
            self.send(stop_reply(reason));
        }
    }

    /// Dispatches one inbound packet.
    pub fn handle_packet(&self, packet: &GdbPacket) {
        if packet.is_interrupt() {
            self.handle_interrupt();
            return;
        }
        let text = packet.text().into_owned();
        let mut chars = text.chars();
        let Some(command) = chars.next() else {
            self.send_empty();
            return;
        };
        let rest = chars.as_str();

        match command {
            '?' => self.handle_halt_reason(),
            'q' => self.handle_query(rest),
            'Q' => self.handle_set(rest),
            'H' => self.handle_thread_select(rest),
            'g' => self.handle_read_registers(),
            'G' => self.handle_write_registers(rest),
            'p' => self.handle_read_register(rest),
            'P' => self.handle_write_register(rest),
            'm' => self.handle_read_memory(rest),
            'M' => self.handle_write_memory(rest),
            'X' => self.handle_write_memory_binary(packet.data()),
            'c' | 'C' => self.handle_continue(),
            's' | 'S' => self.handle_step(None),
            'v' => self.handle_v_command(rest),
            'Z' => self.handle_breakpoint(rest, true),
            'z' => self.handle_breakpoint(rest, false),
            'D' => self.handle_detach(),
            'k' => self.handle_kill(),
            'T' => self.handle_thread_alive(rest),
            _ => {
                tracing::debug!(command = %text, "unsupported packet");
                self.send_empty();
            }
        }
    }

    fn handle_interrupt(&self) {
        tracing::debug!("interrupt requested");
        self.awaiting_stop.store(false, Ordering::SeqCst);
        if let Err(err) = self.debugger.halt() {
            tracing::error!(%err, "halt failed");
            self.send_error(EBADMSG);
            return;
        }
        let Some(thread_id) = self.debugger.any_thread_id() else {
            self.send_error(EBADMSG);
            return;
        };
        match self.debugger.fetch_stop_reason(thread_id) {
            Ok(Some(reason)) => self.send(stop_reply(&reason)),
            Ok(None) => {
                // Halted but XBDM has not recorded a reason yet; report a
                // plain trap on the thread.
                self.send(stop_reply(&StopReason::Breakpoint {
                    thread_id,
                    address: 0,
                }))
            }
            Err(err) => {
                tracing::error!(%err, "stop reason fetch failed");
                self.send_error(EBADMSG);
            }
        }
    }

    fn handle_halt_reason(&self) {
        let Some(thread_id) = self.selected_thread('g') else {
            self.send_empty();
            return;
        };
        let reason = self
            .debugger
            .thread(thread_id)
            .and_then(|thread| thread.last_stop_reason);
        match reason {
            Some(reason) => self.send(stop_reply(&reason)),
            None => self.send_empty(),
        }
    }

    fn handle_query(&self, query: &str) {
        if query.starts_with("Supported") {
            self.send(GdbPacket::new(
                &b"PacketSize=4096;QStartNoAckMode+;qXfer:features:read+;vContSupported+;swbreak+;multiprocess-"[..],
            ));
        } else if query == "Attached" {
            self.send(GdbPacket::new(&b"1"[..]));
        } else if query == "C" {
            match self.debugger.any_thread_id() {
                Some(thread_id) => {
                    self.send(GdbPacket::new(format!("QC{thread_id:x}").into_bytes()))
                }
                None => self.send_empty(),
            }
        } else if query == "fThreadInfo" {
            let mut ids: Vec<u32> = self
                .debugger
                .threads()
                .iter()
                .map(|thread| thread.thread_id)
                .collect();
            // Lead with the thread GDB should select by default.
            if let Some(preferred) = self.debugger.any_thread_id() {
                ids.retain(|&id| id != preferred);
                ids.insert(0, preferred);
            }
            if ids.is_empty() {
                self.send(GdbPacket::new(&b"l"[..]));
            } else {
                let list = ids
                    .iter()
                    .map(|id| format!("{id:x}"))
                    .collect::<Vec<_>>()
                    .join(",");
                self.send(GdbPacket::new(format!("m{list}").into_bytes()));
            }
        } else if query == "sThreadInfo" {
            self.send(GdbPacket::new(&b"l"[..]));
        } else if let Some(rest) = query.strip_prefix("ThreadExtraInfo,") {
            self.handle_thread_extra_info(rest);
        } else if let Some(rest) = query.strip_prefix("Xfer:features:read:") {
            self.handle_features_read(rest);
        } else {
            tracing::debug!(query, "unsupported query packet");
            self.send_empty();
        }
    }

    fn handle_set(&self, set: &str) {
        if set == "StartNoAckMode" {
            self.no_ack.store(true, Ordering::SeqCst);
            self.send_ok();
        } else {
            tracing::debug!(set, "unsupported set packet");
            self.send_empty();
        }
    }

    fn handle_thread_extra_info(&self, tid_text: &str) {
        let Some(thread_id) = parse_tid(tid_text) else {
            self.send_error(EBADMSG);
            return;
        };
        let description = match self
            .debugger
            .thread(thread_id as u32)
            .and_then(|thread| thread.last_stop_reason)
        {
            Some(reason) => format!("{thread_id} {reason}"),
            None => format!("{thread_id} Running"),
        };
        self.send(GdbPacket::new(hex::encode(description).into_bytes()));
    }

    fn handle_features_read(&self, rest: &str) {
        // `<annex>:<offset>,<length>`
        let Some((annex, range)) = rest.split_once(':') else {
            self.send_error(EBADMSG);
            return;
        };
        if annex != "target.xml" {
            self.send_error(0);
            return;
        }
        let Some((offset, length)) = range.split_once(',').and_then(|(off, len)| {
            Some((
                usize::from_str_radix(off, 16).ok()?,
                usize::from_str_radix(len, 16).ok()?,
            ))
        }) else {
            self.send_error(EBADMSG);
            return;
        };

        let xml = registers::TARGET_XML.as_bytes();
        if offset >= xml.len() {
            self.send(GdbPacket::new(&b"l"[..]));
            return;
        }
        let end = (offset + length).min(xml.len());
        let prefix = if end == xml.len() { b'l' } else { b'm' };
        let mut body = vec![prefix];
        body.extend_from_slice(&xml[offset..end]);
        self.send(GdbPacket::new(body));
    }

    fn handle_thread_select(&self, rest: &str) {
        let mut chars = rest.chars();
        let Some(op) = chars.next() else {
            self.send_error(EBADMSG);
            return;
        };
        let Some(thread_id) = parse_tid(chars.as_str()) else {
            self.send_error(EBADMSG);
            return;
        };
        self.thread_selection.lock().insert(op, thread_id);
        if thread_id > 0 {
            self.debugger.set_active_thread(Some(thread_id as u32));
        }
        self.send_ok();
    }

    /// The thread a command class currently applies to. `-1` (all) and `0`
    /// (any) both resolve to the debugger's preferred thread.
    fn selected_thread(&self, op: char) -> Option<u32> {
        match self.thread_selection.lock().get(&op) {
            Some(&id) if id > 0 => Some(id as u32),
            _ => self.debugger.any_thread_id(),
        }
    }

    fn handle_read_registers(&self) {
        let Some(thread_id) = self.selected_thread('g') else {
            self.send_error(EBADMSG);
            return;
        };
        let context = self.debugger.fetch_context(thread_id).ok();
        let float_context = self.debugger.fetch_float_context(thread_id).ok();
        self.send(GdbPacket::new(
            registers::serialize_registers(context.as_ref(), float_context.as_ref()).into_bytes(),
        ));
    }

    fn handle_write_registers(&self, body: &str) {
        let Some(thread_id) = self.selected_thread('g') else {
            self.send_error(EBADMSG);
            return;
        };
        let Some(context) = registers::parse_g_body(body) else {
            self.send_error(EBADMSG);
            return;
        };
        match self.debugger.set_context(thread_id, context) {
            Ok(()) => self.send_ok(),
            Err(err) => {
                tracing::error!(%err, "register write failed");
                self.send_error(EFAULT);
            }
        }
    }

    fn handle_read_register(&self, rest: &str) {
        let Ok(slot) = usize::from_str_radix(rest, 16) else {
            self.send_error(EBADMSG);
            return;
        };
        let Some(thread_id) = self.selected_thread('g') else {
            self.send_error(EBADMSG);
            return;
        };
        let context = self.debugger.fetch_context(thread_id).ok();
        let float_context = if (registers::FLOAT_REGISTER_OFFSET
            ..registers::FLOAT_REGISTER_OFFSET + 8)
            .contains(&slot)
        {
            self.debugger.fetch_float_context(thread_id).ok()
        } else {
            None
        };
        match registers::read_register(slot, context.as_ref(), float_context.as_ref()) {
            Some(value) => self.send(GdbPacket::new(value.into_bytes())),
            None => self.send_empty(),
        }
    }

    fn handle_write_register(&self, rest: &str) {
        let Some((slot_text, value_text)) = rest.split_once('=') else {
            self.send_error(EBADMSG);
            return;
        };
        let Ok(slot) = usize::from_str_radix(slot_text, 16) else {
            self.send_error(EBADMSG);
            return;
        };
        let Some(thread_id) = self.selected_thread('g') else {
            self.send_error(EBADMSG);
            return;
        };

        let mut context = ThreadContext::default();
        if !registers::write_register(&mut context, slot, value_text) {
            // Slots XBDM cannot write back are acknowledged and dropped.
            tracing::warn!(slot, "write to unsupported register ignored");
            self.send_ok();
            return;
        }
        match self.debugger.set_context(thread_id, context) {
            Ok(()) => self.send_ok(),
            Err(err) => {
                tracing::error!(%err, "register write failed");
                self.send_error(EFAULT);
            }
        }
    }

    fn handle_read_memory(&self, rest: &str) {
        let Some((address, length)) = parse_addr_len(rest) else {
            self.send_error(EBADMSG);
            return;
        };
        match self.debugger.get_memory(address, length) {
            Ok(bytes) => self.send(GdbPacket::new(hex::encode(bytes).into_bytes())),
            Err(err) => {
                tracing::debug!(%err, address = format_args!("{address:#010x}"), "memory read failed");
                self.send_error(EFAULT);
            }
        }
    }

    fn handle_write_memory(&self, rest: &str) {
        let Some((place, data)) = rest.split_once(':') else {
            self.send_error(EBADMSG);
            return;
        };
        let Some((address, length)) = parse_addr_len(place) else {
            self.send_error(EBADMSG);
            return;
        };
        if length == 0 {
            self.send_ok();
            return;
        }
        let Ok(bytes) = hex::decode(data) else {
            self.send_error(EBADMSG);
            return;
        };
        if bytes.len() != length as usize {
            self.send_error(EBADMSG);
            return;
        }
        self.write_memory(address, &bytes);
    }

    fn handle_write_memory_binary(&self, raw: &[u8]) {
        // `X<addr>,<len>:<binary>`; the body after ':' is already unescaped.
        let Some(colon) = raw.iter().position(|&b| b == b':') else {
            self.send_error(EBADMSG);
            return;
        };
        let place = String::from_utf8_lossy(&raw[1..colon]);
        let Some((address, length)) = parse_addr_len(&place) else {
            self.send_error(EBADMSG);
            return;
        };
        let bytes = &raw[colon + 1..];
        if length == 0 {
            self.send_ok();
            return;
        }
        if bytes.len() != length as usize {
            self.send_error(EBADMSG);
            return;
        }
        self.write_memory(address, bytes);
    }

    fn write_memory(&self, address: u32, bytes: &[u8]) {
        match self.debugger.set_memory(address, bytes) {
            Ok(()) => self.send_ok(),
            Err(err) => {
                tracing::debug!(%err, address = format_args!("{address:#010x}"), "memory write failed");
                self.send_error(EFAULT);
            }
        }
    }

    fn handle_continue(&self) {
        self.awaiting_stop.store(true, Ordering::SeqCst);
        let result = self
            .debugger
            .continue_all(false)
            .and_then(|_| self.debugger.go());
        if let Err(err) = result {
            tracing::error!(%err, "continue failed");
            self.awaiting_stop.store(false, Ordering::SeqCst);
            self.send_error(EBADMSG);
        }
        // The stop reply is sent when the next halting notification lands.
    }

    fn handle_step(&self, thread_id: Option<u32>) {
        let Some(thread_id) = thread_id.or_else(|| self.selected_thread('c')) else {
            self.send_error(EBADMSG);
            return;
        };
        self.awaiting_stop.store(true, Ordering::SeqCst);
        if let Err(err) = self.debugger.step_instruction(thread_id) {
            tracing::error!(%err, "single step failed");
            self.awaiting_stop.store(false, Ordering::SeqCst);
            self.send_error(EBADMSG);
        }
    }

    fn handle_v_command(&self, rest: &str) {
        if rest == "Cont?" {
            self.send(GdbPacket::new(&b"vCont;c;C;s;S"[..]));
            return;
        }
        if let Some(actions) = rest.strip_prefix("Cont;") {
            self.handle_vcont(actions);
            return;
        }
        // vMustReplyEmpty and anything else unknown share this reply.
        self.send_empty();
    }

    fn handle_vcont(&self, actions: &str) {
        for action in actions.split(';').filter(|action| !action.is_empty()) {
            let (kind, thread) = match action.split_once(':') {
                Some((kind, tid)) => (kind, parse_tid(tid)),
                None => (action, None),
            };
            match kind.chars().next() {
                Some('c') | Some('C') => {
                    self.handle_continue();
                    return;
                }
                Some('s') | Some('S') => {
                    let thread_id = thread.filter(|&id| id > 0).map(|id| id as u32);
                    if let Some(id) = thread_id {
                        self.debugger.set_active_thread(Some(id));
                    }
                    self.handle_step(thread_id);
                    return;
                }
                _ => {
                    tracing::error!(action, "unsupported vCont action");
                    self.send_error(EBADMSG);
                    return;
                }
            }
        }
        self.send_error(EBADMSG);
    }

    fn handle_breakpoint(&self, rest: &str, insert: bool) {
        // `<type>,<addr>,<kind>[;...]`
        let mut fields = rest.split(';').next().unwrap_or("").split(',');
        let (Some(kind_text), Some(addr_text), Some(len_text)) =
            (fields.next(), fields.next(), fields.next())
        else {
            self.send_error(EBADMSG);
            return;
        };
        let (Some(address), Some(length)) = (
            u32::from_str_radix(addr_text, 16).ok(),
            u32::from_str_radix(len_text, 16).ok(),
        ) else {
            self.send_error(EBADMSG);
            return;
        };

        match kind_text {
            // Software breakpoints map onto XBDM execute breakpoints.
            "0" => self.apply_breakpoint(BreakpointKind::Execute, address, 1, insert),
            // Hardware breakpoints are not exposed.
            "1" => self.send_empty(),
            "2" => self.apply_breakpoint(BreakpointKind::WriteWatch, address, length, insert),
            "3" => self.apply_breakpoint(BreakpointKind::ReadWatch, address, length, insert),
            "4" => self.apply_access_watchpoint(address, length, insert),
            _ => self.send_empty(),
        }
    }

    fn apply_breakpoint(&self, kind: BreakpointKind, address: u32, length: u32, insert: bool) {
        let result = if insert {
            self.debugger.add_breakpoint(kind, address, length)
        } else {
            self.debugger.remove_breakpoint(kind, address, length)
        };
        match result {
            Ok(()) => self.send_ok(),
            Err(err) => {
                tracing::error!(%err, ?kind, address = format_args!("{address:#010x}"), "breakpoint change failed");
                self.send_error(EBADMSG);
            }
        }
    }

    /// An access watchpoint is a read plus a write watch; a partial install
    /// is rolled back so the pair stays atomic.
    fn apply_access_watchpoint(&self, address: u32, length: u32, insert: bool) {
        if insert {
            if let Err(err) = self
                .debugger
                .add_breakpoint(BreakpointKind::ReadWatch, address, length)
            {
                tracing::error!(%err, "access watchpoint (read half) failed");
                self.send_error(EBADMSG);
                return;
            }
            if let Err(err) = self
                .debugger
                .add_breakpoint(BreakpointKind::WriteWatch, address, length)
            {
                tracing::error!(%err, "access watchpoint (write half) failed");
                if let Err(rollback) =
                    self.debugger
                        .remove_breakpoint(BreakpointKind::ReadWatch, address, length)
                {
                    tracing::warn!(%rollback, "read half left behind after rollback");
                }
                self.send_error(EBADMSG);
                return;
            }
            self.send_ok();
        } else {
            let read = self
                .debugger
                .remove_breakpoint(BreakpointKind::ReadWatch, address, length);
            let write = self
                .debugger
                .remove_breakpoint(BreakpointKind::WriteWatch, address, length);
            if read.is_ok() && write.is_ok() {
                self.send_ok();
            } else {
                self.send_error(EBADMSG);
            }
        }
    }

    fn handle_thread_alive(&self, rest: &str) {
        match parse_tid(rest) {
            Some(id) if id > 0 && self.debugger.thread(id as u32).is_some() => self.send_ok(),
            _ => self.send_error(EBADMSG),
        }
    }

    /// Detach leaves the target stopped; resuming is the operator's call.
    fn handle_detach(&self) {
        self.send_ok();
        if let Err(err) = self.debugger.detach() {
            tracing::warn!(%err, "detach failed");
        }
        self.transport.lock().close();
    }

    /// `k` detaches without rebooting the target; GDB expects no reply.
    fn handle_kill(&self) {
        if let Err(err) = self.debugger.detach() {
            tracing::warn!(%err, "detach on kill failed");
        }
        self.transport.lock().close();
    }
}

/// Builds a `T` stop-reply packet for a stop reason.
fn stop_reply(reason: &StopReason) -> GdbPacket {
    let mut body = format!("T{:02x}", reason.signal());
    if let Some(thread_id) = reason.thread_id() {
        body.push_str(&format!("thread:{thread_id:x};"));
    }
    if let StopReason::Watchpoint {
        access,
        access_address,
        ..
    } = reason
    {
        let label = match access {
            AccessKind::Write => Some("watch"),
            AccessKind::Read => Some("rwatch"),
            AccessKind::Execute => {
                // GDB has no execute-watch stop class; awatch is the nearest.
                tracing::warn!("execute watchpoint reported to GDB as awatch");
                Some("awatch")
            }
            AccessKind::Unknown => None,
        };
        if let Some(label) = label {
            body.push_str(&format!("{label}:{access_address:08x};"));
        }
    }
    GdbPacket::new(body.into_bytes())
}

/// Parses a thread id field: `-1` means all, otherwise hex.
fn parse_tid(text: &str) -> Option<i64> {
    if text == "-1" {
        return Some(-1);
    }
    i64::from_str_radix(text, 16).ok()
}

/// Parses `<addr>,<len>` with both fields in hex.
fn parse_addr_len(text: &str) -> Option<(u32, u32)> {
    let (addr, len) = text.split_once(',')?;
    Some((
        u32::from_str_radix(addr, 16).ok()?,
        u32::from_str_radix(len, 16).ok()?,
    ))
}
