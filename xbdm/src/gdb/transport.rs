use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::gdb::packet::{GdbPacket, PacketScan};
use crate::net::{PollRegistry, Readiness, Selectable, SignalSender, TcpChannel};

const ACK: &[u8] = b"+";
const NACK: &[u8] = b"-";
const INTERRUPT: u8 = 0x03;

/// Releases the server's single-client slot when the connection goes away.
pub struct ClientGuard(Arc<AtomicBool>);

impl ClientGuard {
    pub fn new(busy: Arc<AtomicBool>) -> ClientGuard {
        ClientGuard(busy)
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The RSP connection to one GDB client.
///
/// Inbound bytes are split into acks, out-of-band interrupts, and framed
/// packets. Well-formed packets are acknowledged with `+` and forwarded to
/// the bridge worker; corrupt ones are answered with `-` and dropped. Once
/// `QStartNoAckMode` is negotiated both directions stop acknowledging.
pub struct GdbTransport {
    channel: TcpChannel,
    no_ack: Arc<AtomicBool>,
    sink: crossbeam_channel::Sender<GdbPacket>,
    signal: Option<SignalSender>,
    _client: Option<ClientGuard>,
}

impl GdbTransport {
    /// Wraps an accepted client connection.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        no_ack: Arc<AtomicBool>,
        sink: crossbeam_channel::Sender<GdbPacket>,
        signal: SignalSender,
        client: ClientGuard,
    ) -> std::io::Result<GdbTransport> {
        Ok(GdbTransport {
            channel: TcpChannel::from_stream(stream, peer)?,
            no_ack,
            sink,
            signal: Some(signal),
            _client: Some(client),
        })
    }

    /// Whether the client connection is still open.
    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Queues an outbound packet and wakes the reactor.
    pub fn send(&mut self, packet: &GdbPacket) {
        let wire = packet.serialize();
        tracing::trace!(packet = %String::from_utf8_lossy(&wire), "gdb send");
        self.channel.queue(&wire);
        if let Some(signal) = &self.signal {
            signal.signal();
        }
    }

    /// Drops the connection.
    pub fn close(&mut self) {
        self.channel.close();
    }

    fn ack(&mut self, positive: bool) {
        if self.no_ack.load(Ordering::SeqCst) {
            return;
        }
        self.channel.queue(if positive { ACK } else { NACK });
    }

    fn process_read_buffer(&mut self) {
        loop {
            let Some(&first) = self.channel.read_buffer.first() else {
                return;
            };
            match first {
                b'+' => {
                    tracing::trace!("ack received");
                    self.channel.read_buffer.remove(0);
                }
                b'-' => {
                    tracing::warn!("client requested retransmission");
                    self.channel.read_buffer.remove(0);
                }
                INTERRUPT => {
                    self.channel.read_buffer.remove(0);
                    self.ack(true);
                    self.forward(GdbPacket::interrupt());
                }
                _ => match GdbPacket::scan(&self.channel.read_buffer) {
                    PacketScan::Complete {
                        packet,
                        consumed,
                        valid,
                    } => {
                        self.channel.read_buffer.drain(..consumed);
                        self.ack(valid);
                        if valid {
                            self.forward(packet);
                        }
                    }
                    PacketScan::Incomplete => return,
                },
            }
        }
    }

    fn forward(&mut self, packet: GdbPacket) {
        if self.sink.send(packet).is_err() {
            tracing::warn!("bridge worker is gone; dropping packet");
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(
        no_ack: Arc<AtomicBool>,
        sink: crossbeam_channel::Sender<GdbPacket>,
    ) -> GdbTransport {
        GdbTransport {
            channel: TcpChannel::detached(),
            no_ack,
            sink,
            signal: None,
            _client: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, bytes: &[u8]) {
        self.channel.read_buffer.extend_from_slice(bytes);
        self.process_read_buffer();
    }

    #[cfg(test)]
    pub(crate) fn written(&mut self) -> Vec<u8> {
        self.channel.take_queued()
    }
}

impl Selectable for GdbTransport {
    fn name(&self) -> &str {
        "gdb-client"
    }

    fn register(&mut self, registry: &mut PollRegistry) -> bool {
        self.channel.register(registry)
    }

    fn process(&mut self, readiness: &Readiness<'_>) -> bool {
        let events = self.channel.handle_io(readiness);
        if events.read_any {
            self.process_read_buffer();
        }
        if events.closed {
            tracing::info!("gdb client disconnected");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn transport() -> (
        GdbTransport,
        crossbeam_channel::Receiver<GdbPacket>,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let no_ack = Arc::new(AtomicBool::new(false));
        (GdbTransport::detached(no_ack.clone(), tx), rx, no_ack)
    }

    #[test]
    fn packets_are_acked_and_forwarded() {
        let (mut transport, rx, _) = transport();
        transport.inject(b"$qC#b4");
        assert_eq!(transport.written(), b"+");
        assert_eq!(rx.try_recv().unwrap().data(), b"qC");
    }

    #[test]
    fn corrupt_packets_are_nacked_and_dropped() {
        let (mut transport, rx, _) = transport();
        transport.inject(b"$qC#00");
        assert_eq!(transport.written(), b"-");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn interrupt_byte_becomes_a_synthetic_packet() {
        let (mut transport, rx, _) = transport();
        transport.inject(&[0x03]);
        assert!(rx.try_recv().unwrap().is_interrupt());
    }

    #[test]
    fn interrupt_mid_stream_does_not_corrupt_framing() {
        let (mut transport, rx, _) = transport();
        // Interrupt arrives while a packet is still incomplete.
        transport.inject(b"\x03$qC#");
        assert!(rx.try_recv().unwrap().is_interrupt());
        assert!(rx.try_recv().is_err());
        transport.inject(b"b4");
        assert_eq!(rx.try_recv().unwrap().data(), b"qC");
    }

    #[test]
    fn no_ack_mode_suppresses_acks() {
        let (mut transport, rx, no_ack) = transport();
        no_ack.store(true, Ordering::SeqCst);
        transport.inject(b"$qC#b4");
        assert!(transport.written().is_empty());
        assert_eq!(rx.try_recv().unwrap().data(), b"qC");
    }

    #[test]
    fn acks_from_the_client_are_swallowed() {
        let (mut transport, rx, _) = transport();
        transport.inject(b"++-$qC#b4");
        assert_eq!(transport.written(), b"+");
        assert_eq!(rx.try_recv().unwrap().data(), b"qC");
    }
}
