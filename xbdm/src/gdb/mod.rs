//! The GDB Remote Serial Protocol front end.
//!
//! A [`GdbServer`] accepts one GDB client at a time. Packet framing lives in
//! [`packet`], the connection plumbing in [`transport`], and the command →
//! debugger translation in [`bridge`].

mod bridge;
mod packet;
mod registers;
mod transport;

pub use bridge::GdbBridge;
pub use packet::{escape, unescape, GdbPacket, PacketScan};
pub use registers::{serialize_registers, NUM_REGISTERS, TARGET_XML};
pub use transport::GdbTransport;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::debugger::XbdmDebugger;
use crate::net::TcpServer;
use crate::Error;

use transport::ClientGuard;

/// The RSP listener.
///
/// Dropping the handle does not tear down an established client session;
/// the session ends when the client disconnects.
pub struct GdbServer {
    port: u16,
}

impl GdbServer {
    /// Binds `bind` and starts serving GDB clients against `debugger`.
    pub fn start(debugger: Arc<XbdmDebugger>, bind: SocketAddr) -> Result<GdbServer, Error> {
        let reactor = debugger.context().reactor().clone();
        let accept_reactor = reactor.clone();
        let busy = Arc::new(AtomicBool::new(false));

        let server = TcpServer::bind("gdb-server", bind, move |stream, peer| {
            if busy.swap(true, Ordering::SeqCst) {
                tracing::warn!(%peer, "rejecting second gdb client");
                return;
            }
            tracing::info!(%peer, "gdb client connected");

            let (packet_tx, packet_rx) = crossbeam_channel::unbounded();
            let no_ack = Arc::new(AtomicBool::new(false));
            let guard = ClientGuard::new(busy.clone());
            let transport = match GdbTransport::new(
                stream,
                peer,
                no_ack.clone(),
                packet_tx,
                accept_reactor.signal_sender(),
                guard,
            ) {
                Ok(transport) => Arc::new(Mutex::new(transport)),
                Err(err) => {
                    tracing::warn!(%err, "failed to wrap gdb client socket");
                    return;
                }
            };
            accept_reactor.add(transport.clone());

            let bridge = GdbBridge::new(debugger.clone(), transport, no_ack);
            let worker = std::thread::Builder::new().name("gdb-bridge".into()).spawn(move || {
                // The sender lives in the transport; the loop ends when the
                // client connection is dropped from the reactor.
                for gdb_packet in packet_rx {
                    bridge.handle_packet(&gdb_packet);
                }
                tracing::debug!("gdb bridge worker finished");
            });
            if let Err(err) = worker {
                tracing::error!(%err, "failed to spawn gdb bridge worker");
            }
        })?;

        let port = server
            .local_port()
            .ok_or(Error::Timeout("gdb listener bind"))?;
        reactor.add(Arc::new(Mutex::new(server)));
        tracing::info!(port, "gdb server listening");
        Ok(GdbServer { port })
    }

    /// The port the listener bound.
    pub fn port(&self) -> u16 {
        self.port
    }
}
