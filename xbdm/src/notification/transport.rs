use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use crate::net::{PollRegistry, Readiness, Selectable, TcpChannel};
use crate::notification::{parse_notification, Notification, PrefixTable};
use crate::rdcp::LINE_TERMINATOR;

/// The reverse connection XBDM opens after a `notifyat`.
///
/// Per XBDM convention the first message after a reboot-driven reconnect is
/// `hello`; it marks the channel established and is not forwarded. Everything
/// else is classified and handed to the sink, which forwards to the
/// notification executor.
pub struct NotificationTransport {
    channel: TcpChannel,
    prefixes: Arc<PrefixTable>,
    sink: Box<dyn FnMut(Notification) + Send>,
    hello_received: bool,
}

impl NotificationTransport {
    /// Wraps an accepted reverse connection.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        prefixes: Arc<PrefixTable>,
        sink: impl FnMut(Notification) + Send + 'static,
    ) -> std::io::Result<NotificationTransport> {
        Ok(NotificationTransport {
            channel: TcpChannel::from_stream(stream, peer)?,
            prefixes,
            sink: Box::new(sink),
            hello_received: false,
        })
    }

    /// Whether the `hello` greeting has arrived on this connection.
    pub fn hello_received(&self) -> bool {
        self.hello_received
    }

    fn drain_lines(&mut self) {
        while let Some(line_end) = find(&self.channel.read_buffer, LINE_TERMINATOR) {
            let line: Vec<u8> = self
                .channel
                .read_buffer
                .drain(..line_end + LINE_TERMINATOR.len())
                .take(line_end)
                .collect();
            let line = String::from_utf8_lossy(&line).into_owned();

            if line == "hello" {
                self.hello_received = true;
                continue;
            }
            if line.is_empty() {
                continue;
            }

            let notification = parse_notification(&line, &self.prefixes);
            if let Notification::Unknown(raw) = &notification {
                tracing::warn!(line = %raw, "unhandled notification");
            }
            (self.sink)(notification);
        }
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, bytes: &[u8]) {
        self.channel.read_buffer.extend_from_slice(bytes);
        self.drain_lines();
    }

    #[cfg(test)]
    pub(crate) fn detached(
        prefixes: Arc<PrefixTable>,
        sink: impl FnMut(Notification) + Send + 'static,
    ) -> NotificationTransport {
        NotificationTransport {
            channel: TcpChannel::detached(),
            prefixes,
            sink: Box::new(sink),
            hello_received: false,
        }
    }
}

impl Selectable for NotificationTransport {
    fn name(&self) -> &str {
        "xbdm-notification"
    }

    fn register(&mut self, registry: &mut PollRegistry) -> bool {
        self.channel.register(registry)
    }

    fn process(&mut self, readiness: &Readiness<'_>) -> bool {
        let events = self.channel.handle_io(readiness);
        if events.read_any {
            self.drain_lines();
        }
        if events.closed {
            tracing::debug!("notification channel closed");
            return false;
        }
        true
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use crate::rdcp::{ExecutionState, StopReason};

    use super::*;

    #[test]
    fn hello_is_consumed_and_lines_are_forwarded_in_order() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let received = received.clone();
            move |notification| received.lock().push(notification)
        };
        let mut transport = NotificationTransport::detached(Arc::new(PrefixTable::default()), sink);

        transport.inject(b"hello\r\nexecution pending\r\nexecution start");
        assert!(transport.hello_received());
        assert_eq!(
            *received.lock(),
            vec![Notification::Debug(StopReason::ExecutionStateChanged {
                state: ExecutionState::Pending
            })]
        );

        // The split line completes on the next read.
        transport.inject(b"ed\r\n");
        assert_eq!(received.lock().len(), 2);
        assert_eq!(
            received.lock()[1],
            Notification::Debug(StopReason::ExecutionStateChanged {
                state: ExecutionState::Started
            })
        );
    }
}
