use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::rdcp::{RdcpResponse, Status};

/// How much of a binary body to expect, as determined by a request-specific
/// parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinarySize {
    /// Payload bytes to deliver to the request.
    pub size: usize,
    /// Leading header bytes the parser consumed; these are not part of the
    /// payload.
    pub consumed: usize,
}

type SizeParser = Box<dyn FnMut(&[u8]) -> Option<BinarySize> + Send>;

struct Completion {
    outcome: Mutex<Option<RdcpResponse>>,
    signal: Condvar,
}

/// A single-use RDCP request.
///
/// Created, sent through a transport, awaited, and then discarded. The
/// transport holds a non-owning reference while the request is in flight and
/// fills in the outcome on the reactor thread; whoever called
/// [`RdcpRequest::wait`] wakes up with the completed response.
pub struct RdcpRequest {
    command: String,
    args: Option<String>,
    payload: Mutex<Option<Vec<u8>>>,
    size_parser: Mutex<Option<SizeParser>>,
    handler: Option<String>,
    completion: Completion,
}

impl RdcpRequest {
    /// A request with no arguments.
    pub fn new(command: impl Into<String>) -> RdcpRequest {
        RdcpRequest {
            command: command.into(),
            args: None,
            payload: Mutex::new(None),
            size_parser: Mutex::new(None),
            handler: None,
            completion: Completion {
                outcome: Mutex::new(None),
                signal: Condvar::new(),
            },
        }
    }

    /// A request with pre-rendered argument text.
    pub fn with_args(command: impl Into<String>, args: impl Into<String>) -> RdcpRequest {
        let mut request = RdcpRequest::new(command);
        request.args = Some(args.into());
        request
    }

    /// Attaches the binary payload to transmit after a 204 response.
    pub fn payload(self, payload: Vec<u8>) -> Self {
        *self.payload.lock() = Some(payload);
        self
    }

    /// Attaches the parser that sizes a 203 binary body.
    pub fn binary_size(self, parser: impl FnMut(&[u8]) -> Option<BinarySize> + Send + 'static) -> Self {
        *self.size_parser.lock() = Some(Box::new(parser));
        self
    }

    /// Fixed-size convenience form of [`RdcpRequest::binary_size`].
    pub fn binary_size_fixed(self, size: usize) -> Self {
        self.binary_size(move |_| Some(BinarySize { size, consumed: 0 }))
    }

    /// Expects a little-endian `u32` length prefix ahead of the body.
    pub fn binary_size_prefixed(self) -> Self {
        self.binary_size(|buffer| {
            let prefix: [u8; 4] = buffer.get(..4)?.try_into().ok()?;
            Some(BinarySize {
                size: u32::from_le_bytes(prefix) as usize,
                consumed: 4,
            })
        })
    }

    /// Routes the request over the dedicated channel registered for
    /// `handler` instead of the control connection.
    pub fn via_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// The command verb.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The dedicated-channel tag, if any.
    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    /// The serialized command line, terminator included.
    pub fn command_line(&self) -> Vec<u8> {
        let mut line = self.command.clone().into_bytes();
        if let Some(args) = &self.args {
            line.push(b' ');
            line.extend_from_slice(args.as_bytes());
        }
        line.extend_from_slice(b"\r\n");
        line
    }

    pub(crate) fn take_payload(&self) -> Option<Vec<u8>> {
        self.payload.lock().take()
    }

    pub(crate) fn has_payload(&self) -> bool {
        self.payload.lock().is_some()
    }

    pub(crate) fn parse_binary_size(&self, buffer: &[u8]) -> Option<Option<BinarySize>> {
        let mut parser = self.size_parser.lock();
        parser.as_mut().map(|parser| parser(buffer))
    }

    pub(crate) fn complete(&self, response: RdcpResponse) {
        let mut outcome = self.completion.outcome.lock();
        if outcome.is_some() {
            return;
        }
        *outcome = Some(response);
        self.completion.signal.notify_all();
    }

    /// Completes the request as lost: its transport closed before a response
    /// arrived.
    pub(crate) fn abandon(&self) {
        self.complete(RdcpResponse::status_only(
            Status::Abandoned,
            "transport closed",
        ));
    }

    /// Whether a completion has been recorded.
    pub fn is_completed(&self) -> bool {
        self.completion.outcome.lock().is_some()
    }

    /// Blocks until the request completes. With a timeout, returns `None` on
    /// expiry; the request stays in flight on the wire either way.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<RdcpResponse> {
        let mut outcome = self.completion.outcome.lock();
        match timeout {
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while outcome.is_none() {
                    if self
                        .completion
                        .signal
                        .wait_until(&mut outcome, deadline)
                        .timed_out()
                    {
                        return outcome.clone();
                    }
                }
                outcome.clone()
            }
            None => {
                while outcome.is_none() {
                    self.completion.signal.wait(&mut outcome);
                }
                outcome.clone()
            }
        }
    }
}

impl std::fmt::Debug for RdcpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdcpRequest")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("payload_len", &self.payload.lock().as_ref().map(Vec::len))
            .field("handler", &self.handler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn command_line_includes_args_and_terminator() {
        let request = RdcpRequest::with_args("getmem2", "ADDR=0x10000 LENGTH=0x4");
        assert_eq!(request.command_line(), b"getmem2 ADDR=0x10000 LENGTH=0x4\r\n");
        assert_eq!(RdcpRequest::new("go").command_line(), b"go\r\n");
    }

    #[test]
    fn prefixed_size_parser_needs_four_bytes() {
        let request = RdcpRequest::new("getextcontext").binary_size_prefixed();
        assert_eq!(request.parse_binary_size(b"\x10\x00"), Some(None));
        assert_eq!(
            request.parse_binary_size(b"\x10\x00\x00\x00rest"),
            Some(Some(BinarySize {
                size: 0x10,
                consumed: 4
            }))
        );
    }

    #[test]
    fn completion_is_idempotent() {
        let request = RdcpRequest::new("go");
        request.complete(RdcpResponse::status_only(Status::Ok, "OK"));
        request.abandon();
        let outcome = request.wait(None).unwrap();
        assert_eq!(outcome.status, Status::Ok);
    }

    #[test]
    fn wait_times_out_without_completion() {
        let request = RdcpRequest::new("go");
        assert!(request.wait(Some(Duration::from_millis(10))).is_none());
    }
}
