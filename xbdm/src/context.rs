//! The owner of all XBDM-facing connections.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::net::{Endpoint, ReactorHandle, TcpServer};
use crate::notification::{Notification, NotificationTransport, PrefixRegistration, PrefixTable};
use crate::rdcp::requests::{Dedicate, XbdmCommand};
use crate::rdcp::{RdcpRequest, RdcpResponse, Status, XbdmTransport};
use crate::Error;

/// Bound on the blocking TCP connect to the target.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on waiting for the unprompted `201- connected` greeting.
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll step while waiting for the greeting.
const GREETING_POLL: Duration = Duration::from_millis(5);
/// Reboot-driven reconnects retry this many times, one second apart.
const RECONNECT_ATTEMPTS: u32 = 10;
/// Backoff between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

type Job = Box<dyn FnOnce() + Send>;

/// A single worker thread fed by a channel of closures.
///
/// The control executor serializes send-plus-wait so request submission is
/// atomic; the notification executor serializes handler dispatch so
/// notifications are observed in arrival order.
struct Executor {
    sender: Option<crossbeam_channel::Sender<Job>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Executor {
    fn new(name: &str) -> Executor {
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .expect("executor thread spawn");
        Executor {
            sender: Some(sender),
            thread: Some(thread),
        }
    }

    fn post(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take() {
            // A queued job can own the last strong reference to the context,
            // which would make this drop run on the worker itself.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Deregisters its notification callback when dropped.
pub struct NotificationHandle {
    context: Weak<XbdmContext>,
    id: u64,
}

impl Drop for NotificationHandle {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.handlers.lock().remove(&self.id);
        }
    }
}

/// Owns the control connection, any dedicated channels, the notification
/// listener, and the executors that serialize work against them.
///
/// All public entry points are thread-safe; callers on any thread either
/// enqueue work on the reactor or post onto the control executor.
pub struct XbdmContext {
    weak_self: Weak<XbdmContext>,
    endpoint: Endpoint,
    reactor: ReactorHandle,
    transport: Arc<Mutex<XbdmTransport>>,
    dedicated: Mutex<BTreeMap<String, Arc<Mutex<XbdmTransport>>>>,
    handlers: Mutex<BTreeMap<u64, NotificationCallback>>,
    next_handler_id: AtomicU64,
    prefixes: Arc<PrefixTable>,
    notification_port: Mutex<Option<u16>>,
    control: Executor,
    notifications: Executor,
}

impl XbdmContext {
    /// Creates the context and registers its control transport with the
    /// reactor. No connection is opened until the first request (or an
    /// explicit [`XbdmContext::connect`]).
    pub fn new(endpoint: Endpoint, reactor: ReactorHandle) -> Arc<XbdmContext> {
        let mut transport = XbdmTransport::new("xbdm");
        transport.set_signal(reactor.signal_sender());
        let transport = Arc::new(Mutex::new(transport));
        reactor.add(transport.clone());

        Arc::new_cyclic(|weak_self| XbdmContext {
            weak_self: weak_self.clone(),
            endpoint,
            reactor,
            transport,
            dedicated: Mutex::new(BTreeMap::new()),
            handlers: Mutex::new(BTreeMap::new()),
            next_handler_id: AtomicU64::new(1),
            prefixes: Arc::new(PrefixTable::default()),
            notification_port: Mutex::new(None),
            control: Executor::new("xbdm-control"),
            notifications: Executor::new("xbdm-notify"),
        })
    }

    /// The target's control endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// The reactor everything runs on.
    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// Eagerly opens the control connection.
    pub fn connect(&self) -> Result<(), Error> {
        ensure_connected(&self.transport, self.endpoint)
    }

    /// Whether the control channel is connected and past its greeting.
    pub fn can_process_commands(&self) -> bool {
        self.transport.lock().can_process_commands()
    }

    /// Builds, sends, and parses a typed command, blocking until the
    /// response arrives.
    pub fn execute<C: XbdmCommand>(&self, command: &C) -> Result<C::Output, Error> {
        let response = self.send_command_sync(command.request(), None)?;
        command.parse(&response)
    }

    /// [`XbdmContext::execute`] with a response deadline. On expiry the
    /// in-flight request is *not* evicted (the wire cannot be rewound); it
    /// completes or is abandoned later.
    pub fn execute_with_timeout<C: XbdmCommand>(
        &self,
        command: &C,
        timeout: Duration,
    ) -> Result<C::Output, Error> {
        let response = self.send_command_sync(command.request(), Some(timeout))?;
        command.parse(&response)
    }

    /// Sends a raw request and waits for its completion.
    ///
    /// Connection management happens lazily on the control executor: a
    /// disconnected control channel (after a reboot, say) is transparently
    /// reconnected before the command goes out. Requests tagged with a
    /// handler name are routed to that handler's dedicated channel, opening
    /// and dedicating it on first use.
    pub fn send_command_sync(
        &self,
        request: RdcpRequest,
        timeout: Option<Duration>,
    ) -> Result<RdcpResponse, Error> {
        let request = Arc::new(request);
        let (reply_tx, reply_rx) = crossbeam_channel::bounded::<Result<RdcpResponse, Error>>(1);

        let weak = self.weak_self.clone();
        let job_request = request.clone();
        self.control.post(move || {
            let outcome = match weak.upgrade() {
                Some(context) => context.run_request(job_request),
                None => Err(Error::Abandoned),
            };
            let _ = reply_tx.send(outcome);
        });

        match timeout {
            Some(timeout) => reply_rx
                .recv_timeout(timeout)
                .map_err(|_| Error::Timeout("rdcp response"))?,
            None => reply_rx.recv().map_err(|_| Error::Abandoned)?,
        }
    }

    /// The control-executor half of [`XbdmContext::send_command_sync`]:
    /// resolve the transport, make sure it is usable, send, wait.
    fn run_request(&self, request: Arc<RdcpRequest>) -> Result<RdcpResponse, Error> {
        let transport = match request.handler() {
            Some(handler) => self.dedicated_transport(handler)?,
            None => {
                ensure_connected(&self.transport, self.endpoint)?;
                self.transport.clone()
            }
        };
        transport.lock().send(request.clone());
        match request.wait(None) {
            Some(response) if response.status == Status::Abandoned => Err(Error::Abandoned),
            Some(response) => Ok(response),
            None => Err(Error::Abandoned),
        }
    }

    /// The dedicated transport for `handler`, created and dedicated on first
    /// use and transparently reconnected (and re-dedicated) after a target
    /// reboot. Runs on the control executor.
    fn dedicated_transport(&self, handler: &str) -> Result<Arc<Mutex<XbdmTransport>>, Error> {
        let transport = {
            let mut dedicated = self.dedicated.lock();
            match dedicated.get(handler) {
                Some(existing) => existing.clone(),
                None => {
                    let mut transport = XbdmTransport::new(format!("xbdm-{handler}"));
                    transport.set_signal(self.reactor.signal_sender());
                    let transport = Arc::new(Mutex::new(transport));
                    self.reactor.add(transport.clone());
                    dedicated.insert(handler.to_owned(), transport.clone());
                    transport
                }
            }
        };

        let needs_handshake = {
            let guard = transport.lock();
            !(guard.can_process_commands() && guard.is_dedicated())
        };
        if needs_handshake {
            ensure_connected(&transport, self.endpoint)?;
            let dedicate = Dedicate { handler };
            let request = Arc::new(dedicate.request());
            transport.lock().send(request.clone());
            let response = request
                .wait(Some(GREETING_TIMEOUT))
                .ok_or(Error::Timeout("dedicated channel handshake"))?;
            dedicate.parse(&response)?;
            tracing::debug!(handler, "dedicated channel established");
        }
        Ok(transport)
    }

    /// Drops the dedicated channel for `handler`, if one exists.
    pub fn destroy_dedicated_channel(&self, handler: &str) {
        if let Some(transport) = self.dedicated.lock().remove(handler) {
            transport.lock().close();
        }
    }

    /// Starts the local listener XBDM connects back to after `notifyat`.
    /// Binds an OS-assigned port and returns it. Idempotent.
    pub fn start_notification_listener(&self) -> Result<u16, Error> {
        if let Some(port) = *self.notification_port.lock() {
            return Ok(port);
        }

        let weak = self.weak_self.clone();
        let server = TcpServer::bind(
            "xbdm-notification-server",
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            move |stream, peer| {
                if let Some(context) = weak.upgrade() {
                    context.on_notification_channel_connected(stream, peer);
                }
            },
        )?;
        let port = server
            .local_port()
            .ok_or(Error::Timeout("notification listener bind"))?;
        self.reactor.add(Arc::new(Mutex::new(server)));
        *self.notification_port.lock() = Some(port);
        tracing::debug!(port, "notification listener started");
        Ok(port)
    }

    /// The port of the running notification listener, if any.
    pub fn notification_port(&self) -> Option<u16> {
        *self.notification_port.lock()
    }

    /// Runs on the reactor thread when XBDM opens (or reopens) its reverse
    /// connection.
    fn on_notification_channel_connected(&self, stream: std::net::TcpStream, peer: SocketAddr) {
        tracing::debug!(%peer, "notification channel established");

        // After a reboot the reconnect doubles as the cue to bring the
        // control channel back up. The target may still be settling, so the
        // reconnect retries with a one-second backoff.
        if !self.can_process_commands() {
            let transport = self.transport.clone();
            let endpoint = self.endpoint;
            self.control.post(move || {
                for attempt in 1..=RECONNECT_ATTEMPTS {
                    match ensure_connected(&transport, endpoint) {
                        Ok(()) => return,
                        Err(err) if attempt == RECONNECT_ATTEMPTS => {
                            tracing::warn!(%err, "control reconnect after reboot failed");
                        }
                        Err(err) => {
                            tracing::debug!(%err, attempt, "control reconnect attempt failed");
                            std::thread::sleep(RECONNECT_BACKOFF);
                        }
                    }
                }
            });
        }

        let weak = self.weak_self.clone();
        let transport = NotificationTransport::new(
            stream,
            peer,
            self.prefixes.clone(),
            move |notification| {
                if let Some(context) = weak.upgrade() {
                    context.dispatch_notification(notification);
                }
            },
        );
        match transport {
            Ok(transport) => self.reactor.add(Arc::new(Mutex::new(transport))),
            Err(err) => tracing::warn!(%err, "failed to wrap notification channel"),
        }
    }

    /// Queues a notification for serialized dispatch to every registered
    /// handler.
    fn dispatch_notification(&self, notification: Notification) {
        let weak = self.weak_self.clone();
        self.notifications.post(move || {
            let Some(context) = weak.upgrade() else {
                return;
            };
            let handlers: Vec<NotificationCallback> =
                context.handlers.lock().values().cloned().collect();
            for handler in handlers {
                handler(&notification);
            }
        });
    }

    /// Registers a notification callback. Dispatch happens on a dedicated
    /// worker in arrival order; the callback must not block it for long. The
    /// registration lives as long as the returned handle.
    #[must_use = "dropping the handle deregisters the callback"]
    pub fn register_notification_handler(
        &self,
        callback: impl Fn(&Notification) + Send + Sync + 'static,
    ) -> NotificationHandle {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(id, Arc::new(callback));
        NotificationHandle {
            context: self.weak_self.clone(),
            id,
        }
    }

    /// Registers an additional notification prefix for a runtime-loaded
    /// handler.
    pub fn register_notification_prefix(&self, prefix: impl Into<String>) -> PrefixRegistration {
        self.prefixes.register(prefix)
    }

    /// Closes every connection. Queued and in-flight requests complete as
    /// abandoned.
    pub fn shutdown(&self) {
        self.transport.lock().close();
        for (_, transport) in self.dedicated.lock().iter() {
            transport.lock().close();
        }
        self.reactor.signal();
    }
}

impl Drop for XbdmContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Brings `transport` to the command-processing state: connects if needed,
/// then waits out the `201- connected` greeting.
fn ensure_connected(
    transport: &Arc<Mutex<XbdmTransport>>,
    endpoint: Endpoint,
) -> Result<(), Error> {
    {
        let mut guard = transport.lock();
        if guard.can_process_commands() {
            return Ok(());
        }
        if !guard.is_connected() {
            tracing::debug!(%endpoint, "connecting control channel");
            guard.connect(endpoint, CONNECT_TIMEOUT)?;
        }
    }

    let deadline = std::time::Instant::now() + GREETING_TIMEOUT;
    loop {
        if transport.lock().can_process_commands() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            return Err(Error::Timeout("xbdm connection greeting"));
        }
        std::thread::sleep(GREETING_POLL);
    }
}
