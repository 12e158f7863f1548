use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::net::{Endpoint, PollRegistry, Readiness, Selectable, SignalSender, TcpChannel};
use crate::rdcp::{
    BinarySize, RdcpRequest, RdcpResponse, Status, LINE_TERMINATOR, MULTILINE_TERMINATOR,
};

/// Where the transport is in the request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    /// No socket.
    Disconnected,
    /// Connected, waiting for the unprompted `201- connected` greeting.
    Connecting,
    /// Ready; no request in flight.
    Idle,
    /// Command line sent, waiting for the status line.
    AwaitingHeader,
    /// 202 received; collecting the body up to `\r\n.\r\n`.
    ReadingMultiline,
    /// 203 received; feeding bytes to the request's size parser.
    ReadingBinarySize,
    /// Size known; collecting the binary body.
    ReadingBinary,
    /// 204 received; flushing the outbound payload before the final status.
    SendingBinary,
    /// Closed for good; everything queued is abandoned.
    Closed,
}

/// The RDCP control connection to XBDM.
///
/// At most one request is in flight at a time; later requests queue. The
/// transport runs on the reactor and completes each request from its
/// `process` step. Once a `dedicate` handshake answers 205, the connection
/// stops being multiplexed and belongs to a single command handler, which
/// changes nothing about the framing here.
pub struct XbdmTransport {
    name: String,
    channel: TcpChannel,
    state: TransportState,
    queue: VecDeque<Arc<RdcpRequest>>,
    in_flight: Option<Arc<RdcpRequest>>,
    /// Status/message of the header being elaborated by a body.
    partial: Option<(Status, String)>,
    /// Binary framing decided by the size parser.
    binary: Option<BinarySize>,
    dedicated: bool,
    signal: Option<SignalSender>,
}

impl XbdmTransport {
    /// A disconnected transport. Attach a wake-up sender before sharing it
    /// with other threads.
    pub fn new(name: impl Into<String>) -> XbdmTransport {
        XbdmTransport {
            name: name.into(),
            channel: TcpChannel::detached(),
            state: TransportState::Disconnected,
            queue: VecDeque::new(),
            in_flight: None,
            partial: None,
            binary: None,
            dedicated: false,
            signal: None,
        }
    }

    /// Wires up the reactor wake-up used when requests are queued from other
    /// threads.
    pub fn set_signal(&mut self, signal: SignalSender) {
        self.signal = Some(signal);
    }

    /// Opens the TCP connection. The greeting is consumed asynchronously on
    /// the reactor; poll [`XbdmTransport::can_process_commands`] to learn
    /// when the transport is usable. Must not run on the reactor thread.
    pub fn connect(&mut self, endpoint: Endpoint, timeout: Duration) -> std::io::Result<()> {
        self.channel = TcpChannel::connect(endpoint, timeout)?;
        self.state = TransportState::Connecting;
        if let Some(signal) = &self.signal {
            signal.signal();
        }
        Ok(())
    }

    /// Whether the socket is open.
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Whether the greeting has been consumed and requests can be serviced.
    /// A peer disconnect resets this until the next reconnect.
    pub fn can_process_commands(&self) -> bool {
        !matches!(
            self.state,
            TransportState::Disconnected | TransportState::Connecting | TransportState::Closed
        )
    }

    /// Whether a 205 has converted this connection into a dedicated channel.
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// Enqueues a request, transmitting immediately if the line is idle.
    /// Requests submitted to a dead transport are completed as abandoned.
    pub fn send(&mut self, request: Arc<RdcpRequest>) {
        if matches!(
            self.state,
            TransportState::Disconnected | TransportState::Closed
        ) {
            tracing::debug!(transport = %self.name, command = request.command(), "send on dead transport");
            request.abandon();
            return;
        }
        self.queue.push_back(request);
        self.pump_queue();
        if let Some(signal) = &self.signal {
            signal.signal();
        }
    }

    /// Closes the connection and abandons every queued and in-flight request.
    pub fn close(&mut self) {
        self.channel.close();
        self.abandon_all();
        self.state = TransportState::Closed;
    }

    fn abandon_all(&mut self) {
        if let Some(request) = self.in_flight.take() {
            request.abandon();
        }
        for request in self.queue.drain(..) {
            request.abandon();
        }
        self.partial = None;
        self.binary = None;
    }

    /// Starts the next queued request if the line is free.
    fn pump_queue(&mut self) {
        if self.state != TransportState::Idle || self.in_flight.is_some() {
            return;
        }
        let Some(request) = self.queue.pop_front() else {
            return;
        };
        tracing::trace!(transport = %self.name, command = request.command(), "sending request");
        self.channel.queue(&request.command_line());
        self.in_flight = Some(request);
        self.state = TransportState::AwaitingHeader;
    }

    fn complete_in_flight(&mut self, response: RdcpResponse) {
        if let Some(request) = self.in_flight.take() {
            request.complete(response);
        }
        self.partial = None;
        self.binary = None;
        self.state = TransportState::Idle;
        self.pump_queue();
    }

    /// Parses as much of the read buffer as the current state allows.
    fn process_read_buffer(&mut self) {
        loop {
            match self.state {
                TransportState::Connecting => {
                    let Some((status, message)) = self.try_parse_header() else {
                        return;
                    };
                    if status != Status::Connected {
                        tracing::warn!(transport = %self.name, %status, "unexpected greeting");
                    }
                    tracing::debug!(transport = %self.name, %message, "control channel greeted");
                    self.state = TransportState::Idle;
                    self.pump_queue();
                }
                TransportState::AwaitingHeader => {
                    let Some((status, message)) = self.try_parse_header() else {
                        return;
                    };
                    self.dispatch_header(status, message);
                }
                TransportState::ReadingMultiline => {
                    let buffer = &self.channel.read_buffer;
                    let Some(end) = find(buffer, MULTILINE_TERMINATOR) else {
                        return;
                    };
                    let data: Vec<u8> = buffer[..end].to_vec();
                    self.channel
                        .read_buffer
                        .drain(..end + MULTILINE_TERMINATOR.len());
                    let (status, message) = self.partial.take().expect("header precedes body");
                    self.complete_in_flight(RdcpResponse {
                        status,
                        message,
                        data,
                    });
                }
                TransportState::ReadingBinarySize => {
                    let Some(request) = &self.in_flight else {
                        self.state = TransportState::Idle;
                        return;
                    };
                    match request.parse_binary_size(&self.channel.read_buffer) {
                        Some(Some(size)) => {
                            self.channel.read_buffer.drain(..size.consumed);
                            self.binary = Some(size);
                            self.state = TransportState::ReadingBinary;
                        }
                        Some(None) => return, // parser needs more bytes
                        None => {
                            tracing::error!(
                                transport = %self.name,
                                command = request.command(),
                                "binary response without a size parser"
                            );
                            self.close();
                            return;
                        }
                    }
                }
                TransportState::ReadingBinary => {
                    let size = self.binary.expect("binary framing decided").size;
                    if self.channel.read_buffer.len() < size {
                        return;
                    }
                    let data: Vec<u8> = self.channel.read_buffer.drain(..size).collect();
                    let (status, message) = self.partial.take().expect("header precedes body");
                    self.complete_in_flight(RdcpResponse {
                        status,
                        message,
                        data,
                    });
                }
                TransportState::SendingBinary => {
                    if self.channel.pending_write_len() != 0 {
                        return;
                    }
                    self.state = TransportState::AwaitingHeader;
                }
                TransportState::Disconnected
                | TransportState::Idle
                | TransportState::Closed => return,
            }
        }
    }

    fn dispatch_header(&mut self, status: Status, message: String) {
        match status {
            Status::Multiline => {
                self.partial = Some((status, message));
                self.state = TransportState::ReadingMultiline;
            }
            Status::Binary => {
                self.partial = Some((status, message));
                self.state = TransportState::ReadingBinarySize;
            }
            Status::SendBinaryData => {
                let payload = self
                    .in_flight
                    .as_ref()
                    .and_then(|request| request.take_payload());
                match payload {
                    Some(payload) => {
                        tracing::trace!(transport = %self.name, len = payload.len(), "uploading binary payload");
                        self.channel.queue(&payload);
                        self.state = TransportState::SendingBinary;
                    }
                    None => {
                        tracing::error!(transport = %self.name, "204 for a request with no payload");
                        self.complete_in_flight(RdcpResponse::status_only(status, message));
                    }
                }
            }
            Status::Dedicated => {
                self.dedicated = true;
                self.complete_in_flight(RdcpResponse::status_only(status, message));
            }
            _ => {
                self.complete_in_flight(RdcpResponse::status_only(status, message));
            }
        }
    }

    /// Parses `NNN- message\r\n` off the front of the read buffer.
    fn try_parse_header(&mut self) -> Option<(Status, String)> {
        let buffer = &self.channel.read_buffer;
        let line_end = find(buffer, LINE_TERMINATOR)?;
        let line = &buffer[..line_end];

        let parsed = parse_status_line(line);
        let consumed = line_end + LINE_TERMINATOR.len();
        match parsed {
            Some((status, message)) => {
                self.channel.read_buffer.drain(..consumed);
                Some((status, message))
            }
            None => {
                tracing::error!(
                    transport = %self.name,
                    line = %String::from_utf8_lossy(line),
                    "malformed status line"
                );
                self.close();
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, bytes: &[u8]) {
        self.channel.read_buffer.extend_from_slice(bytes);
        self.process_read_buffer();
    }

    #[cfg(test)]
    pub(crate) fn force_connected(&mut self) {
        self.state = TransportState::Connecting;
    }

    #[cfg(test)]
    pub(crate) fn written(&mut self) -> Vec<u8> {
        self.channel.take_queued()
    }
}

impl Selectable for XbdmTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, registry: &mut PollRegistry) -> bool {
        self.channel.register(registry);
        // A disconnected control channel stays registered; the context
        // reconnects it on demand.
        self.state != TransportState::Closed
    }

    fn process(&mut self, readiness: &Readiness<'_>) -> bool {
        let events = self.channel.handle_io(readiness);
        if events.closed {
            tracing::debug!(transport = %self.name, "connection closed by peer");
            self.abandon_all();
            self.state = TransportState::Disconnected;
            return true;
        }
        if events.read_any {
            self.process_read_buffer();
        } else if self.state == TransportState::SendingBinary {
            // Writes may have drained; check whether the upload finished.
            self.process_read_buffer();
        }
        true
    }
}

fn parse_status_line(line: &[u8]) -> Option<(Status, String)> {
    if line.len() < 4 || &line[3..4] != b"-" {
        return None;
    }
    let code = std::str::from_utf8(&line[..3]).ok()?.parse::<u16>().ok()?;
    let message = String::from_utf8_lossy(&line[4..]).trim().to_owned();
    Some((Status::from_code(code), message))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn connected_transport() -> XbdmTransport {
        let mut transport = XbdmTransport::new("test");
        transport.force_connected();
        transport.inject(b"201- connected\r\n");
        transport
    }

    #[test]
    fn greeting_moves_the_transport_to_idle() {
        let transport = connected_transport();
        assert!(transport.can_process_commands());
    }

    #[test]
    fn plain_ok_completes_after_the_header() {
        let mut transport = connected_transport();
        let request = Arc::new(RdcpRequest::new("go"));
        transport.send(request.clone());
        assert_eq!(transport.written(), b"go\r\n");

        transport.inject(b"200- OK\r\n");
        let response = request.wait(None).unwrap();
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.message, "OK");
        assert!(response.data.is_empty());
    }

    #[test]
    fn error_statuses_complete_without_a_body() {
        let mut transport = connected_transport();
        let request = Arc::new(RdcpRequest::with_args("isstopped", "thread=14"));
        transport.send(request.clone());
        transport.inject(b"408- not stopped\r\n");
        assert_eq!(request.wait(None).unwrap().status, Status::NotStopped);
    }

    #[test]
    fn binary_body_uses_the_request_size_parser() {
        let mut transport = connected_transport();
        let request = Arc::new(
            RdcpRequest::with_args("getmem2", "ADDR=0x10000 LENGTH=0x4").binary_size_fixed(4),
        );
        transport.send(request.clone());
        assert_eq!(transport.written(), b"getmem2 ADDR=0x10000 LENGTH=0x4\r\n");

        // Header and payload arriving in separate chunks.
        transport.inject(b"203- binary response follows\r\n\xDE\xAD");
        assert!(!request.is_completed());
        transport.inject(b"\xBE\xEF");

        let response = request.wait(None).unwrap();
        assert_eq!(response.status, Status::Binary);
        assert_eq!(response.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn prefixed_binary_consumes_its_header() {
        let mut transport = connected_transport();
        let request = Arc::new(
            RdcpRequest::with_args("getextcontext", "thread=14").binary_size_prefixed(),
        );
        transport.send(request.clone());
        transport.inject(b"203- binary response follows\r\n\x03\x00\x00\x00abc");
        assert_eq!(request.wait(None).unwrap().data, b"abc");
    }

    #[test]
    fn multiline_body_ends_at_the_terminator() {
        let mut transport = connected_transport();
        let request = Arc::new(RdcpRequest::new("modules"));
        transport.send(request.clone());
        transport.inject(b"202- multiline response follows\r\nline one\r\nline two\r\n.\r\n");

        let response = request.wait(None).unwrap();
        assert_eq!(response.status, Status::Multiline);
        assert_eq!(response.data, b"line one\r\nline two");
    }

    #[test]
    fn requests_queue_one_in_flight_at_a_time() {
        let mut transport = connected_transport();
        let first = Arc::new(RdcpRequest::new("stop"));
        let second = Arc::new(RdcpRequest::new("go"));
        transport.send(first.clone());
        transport.send(second.clone());
        // Only the first command is on the wire so far.
        assert_eq!(transport.written(), b"stop\r\n");

        transport.inject(b"200- OK\r\n");
        assert!(first.is_completed());
        assert_eq!(transport.written(), b"go\r\n");
        assert!(!second.is_completed());

        transport.inject(b"200- OK\r\n");
        assert!(second.is_completed());
    }

    #[test]
    fn dedicate_marks_the_connection() {
        let mut transport = connected_transport();
        let request = Arc::new(RdcpRequest::with_args("dedicate", "ddxt"));
        transport.send(request.clone());
        transport.inject(b"205- dedicated\r\n");
        assert!(transport.is_dedicated());
        assert_eq!(request.wait(None).unwrap().status, Status::Dedicated);
    }

    #[test]
    fn send_binary_uploads_payload_then_awaits_final_status() {
        let mut transport = connected_transport();
        let request = Arc::new(
            RdcpRequest::with_args("sendfile", "length=0x4").payload(vec![1, 2, 3, 4]),
        );
        transport.send(request.clone());
        assert_eq!(transport.written(), b"sendfile length=0x4\r\n");

        transport.inject(b"204- send binary data\r\n");
        // Payload was queued for transmission.
        assert_eq!(transport.written(), vec![1, 2, 3, 4]);
        assert!(!request.is_completed());

        // take_queued drained the write buffer, so the upload counts as
        // flushed and the final status completes the request.
        transport.inject(b"200- OK\r\n");
        assert_eq!(request.wait(None).unwrap().status, Status::Ok);
    }

    #[test]
    fn close_abandons_everything() {
        let mut transport = connected_transport();
        let in_flight = Arc::new(RdcpRequest::new("stop"));
        let queued = Arc::new(RdcpRequest::new("go"));
        transport.send(in_flight.clone());
        transport.send(queued.clone());
        transport.close();

        assert_eq!(in_flight.wait(None).unwrap().status, Status::Abandoned);
        assert_eq!(queued.wait(None).unwrap().status, Status::Abandoned);

        let late = Arc::new(RdcpRequest::new("go"));
        transport.send(late.clone());
        assert_eq!(late.wait(None).unwrap().status, Status::Abandoned);
    }

    #[test]
    fn malformed_status_line_kills_the_connection() {
        let mut transport = connected_transport();
        let request = Arc::new(RdcpRequest::new("go"));
        transport.send(request.clone());
        transport.inject(b"garbage with no code\r\n");
        assert_eq!(request.wait(None).unwrap().status, Status::Abandoned);
        assert!(!transport.can_process_commands());
    }
}
