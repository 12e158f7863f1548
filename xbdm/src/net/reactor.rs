use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::net::signaller::{SignalSender, TaskQueue, TaskQueueState};

/// How long the reactor is willing to sleep while a quiescence fence is
/// pending. A short cap keeps the zero-ready-descriptors check responsive.
const FENCE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A participant in the reactor's poll loop.
///
/// Both callbacks run on the reactor thread and must not block; anything that
/// needs to wait goes through buffered state and another wake-up.
pub trait Selectable: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Declares the descriptors and events this selectable currently cares
    /// about, plus an optional earliest wake-up time. Returning `false` drops
    /// the selectable from the loop.
    fn register(&mut self, registry: &mut PollRegistry) -> bool;

    /// Invoked after the wait returns, whether or not any of the registered
    /// descriptors fired. Returning `false` drops the selectable.
    fn process(&mut self, readiness: &Readiness<'_>) -> bool;
}

/// Collects descriptor interest ahead of a single `poll(2)` call.
pub struct PollRegistry {
    fds: Vec<libc::pollfd>,
    deadline: Option<Instant>,
}

impl PollRegistry {
    fn new() -> Self {
        PollRegistry {
            fds: Vec::new(),
            deadline: None,
        }
    }

    /// Registers interest in `fd`. Error conditions are always reported.
    pub fn add(&mut self, fd: RawFd, readable: bool, writable: bool) {
        let mut events = 0;
        if readable {
            events |= libc::POLLIN;
        }
        if writable {
            events |= libc::POLLOUT;
        }
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
    }

    /// Asks the reactor to wake no later than `deadline` even if no
    /// descriptor becomes ready.
    pub fn wake_at(&mut self, deadline: Instant) {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
    }
}

/// Readiness results for one selectable's registered descriptors.
pub struct Readiness<'poll> {
    fds: &'poll [libc::pollfd],
}

impl Readiness<'_> {
    fn revents(&self, fd: RawFd) -> libc::c_short {
        self.fds
            .iter()
            .find(|entry| entry.fd == fd)
            .map(|entry| entry.revents)
            .unwrap_or(0)
    }

    /// Whether `fd` has bytes to read (or a pending accept).
    pub fn readable(&self, fd: RawFd) -> bool {
        self.revents(fd) & libc::POLLIN != 0
    }

    /// Whether `fd` can be written without blocking.
    pub fn writable(&self, fd: RawFd) -> bool {
        self.revents(fd) & libc::POLLOUT != 0
    }

    /// Whether `fd` reported an error or hangup.
    pub fn error(&self, fd: RawFd) -> bool {
        self.revents(fd) & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0
    }

    /// Whether any registered descriptor fired at all.
    pub fn any(&self) -> bool {
        self.fds.iter().any(|entry| entry.revents != 0)
    }
}

struct Fence {
    fulfilled: Mutex<bool>,
    condvar: Condvar,
}

struct ReactorShared {
    selectables: Mutex<Vec<Arc<Mutex<dyn Selectable>>>>,
    fences: Mutex<Vec<Arc<Fence>>>,
    running: AtomicBool,
    tasks: Arc<TaskQueueState>,
}

/// A cloneable handle for interacting with a running [`Reactor`].
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<ReactorShared>,
}

impl ReactorHandle {
    /// Adds a selectable to the poll loop, waking the reactor so the new
    /// entry is picked up immediately.
    pub fn add(&self, selectable: Arc<Mutex<dyn Selectable>>) {
        self.shared.selectables.lock().push(selectable);
        self.signal();
    }

    /// Runs `task` on the reactor thread as soon as possible.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.tasks.post(Box::new(task));
    }

    /// Runs `task` on the reactor thread after `delay`.
    pub fn post_delayed(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        self.shared.tasks.post_delayed(delay, Box::new(task));
    }

    /// Wakes the reactor from its wait without scheduling any work.
    pub fn signal(&self) {
        self.shared.tasks.signal();
    }

    /// A sender usable by transports to wake the reactor when they queue
    /// outbound bytes from another thread.
    pub fn signal_sender(&self) -> SignalSender {
        self.shared.tasks.sender()
    }

    /// Blocks the calling thread until the reactor completes a wait with no
    /// ready descriptors, meaning no more work is immediately schedulable.
    ///
    /// Intended for tests that need the system to settle.
    pub fn await_quiescence(&self) {
        let fence = Arc::new(Fence {
            fulfilled: Mutex::new(false),
            condvar: Condvar::new(),
        });
        self.shared.fences.lock().push(fence.clone());
        self.signal();

        let mut fulfilled = fence.fulfilled.lock();
        while !*fulfilled {
            fence.condvar.wait(&mut fulfilled);
        }
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.signal();
    }
}

/// The single-threaded cooperative scheduler all transports run on.
///
/// Dropping the reactor stops and joins its thread; selectables still
/// registered are dropped with it.
pub struct Reactor {
    handle: ReactorHandle,
    thread: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Starts the reactor thread.
    pub fn start() -> Reactor {
        let (queue, state) = TaskQueue::create();
        let shared = Arc::new(ReactorShared {
            selectables: Mutex::new(Vec::new()),
            fences: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            tasks: state,
        });
        let handle = ReactorHandle {
            shared: shared.clone(),
        };
        handle.add(Arc::new(Mutex::new(queue)));

        let thread = std::thread::Builder::new()
            .name("xbdm-reactor".into())
            .spawn(move || run_loop(&shared))
            .expect("reactor thread spawn");

        Reactor {
            handle,
            thread: Some(thread),
        }
    }

    /// A cloneable handle to this reactor.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_loop(shared: &ReactorShared) {
    while shared.running.load(Ordering::SeqCst) {
        let entries: Vec<Arc<Mutex<dyn Selectable>>> = shared.selectables.lock().clone();

        let mut registry = PollRegistry::new();
        let mut ranges = Vec::with_capacity(entries.len());
        let mut dead = Vec::new();

        for (index, entry) in entries.iter().enumerate() {
            let start = registry.fds.len();
            let alive = entry.lock().register(&mut registry);
            ranges.push(start..registry.fds.len());
            if !alive {
                dead.push(index);
            }
        }

        let fences_pending = !shared.fences.lock().is_empty();
        let timeout_ms = wait_budget(registry.deadline, fences_pending);

        let ready_count = unsafe {
            libc::poll(
                registry.fds.as_mut_ptr(),
                registry.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ready_count < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                tracing::error!(%err, "poll failed");
                std::thread::sleep(Duration::from_millis(1));
            }
            continue;
        }

        if ready_count == 0 && fences_pending {
            for fence in shared.fences.lock().drain(..) {
                *fence.fulfilled.lock() = true;
                fence.condvar.notify_all();
            }
        }

        for (index, entry) in entries.iter().enumerate() {
            if dead.contains(&index) {
                continue;
            }
            let readiness = Readiness {
                fds: &registry.fds[ranges[index].clone()],
            };
            if !entry.lock().process(&readiness) {
                dead.push(index);
            }
        }

        if !dead.is_empty() {
            let mut selectables = shared.selectables.lock();
            selectables.retain(|kept| {
                !entries
                    .iter()
                    .enumerate()
                    .any(|(index, entry)| dead.contains(&index) && Arc::ptr_eq(entry, kept))
            });
        }
    }
}

fn wait_budget(deadline: Option<Instant>, fences_pending: bool) -> libc::c_int {
    let from_deadline = deadline.map(|deadline| {
        deadline
            .saturating_duration_since(Instant::now())
            .as_millis()
            .min(libc::c_int::MAX as u128) as libc::c_int
    });
    if fences_pending {
        let cap = FENCE_POLL_INTERVAL.as_millis() as libc::c_int;
        from_deadline.map_or(cap, |ms| ms.min(cap))
    } else {
        from_deadline.unwrap_or(-1)
    }
}
