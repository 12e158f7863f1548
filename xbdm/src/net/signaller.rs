use std::collections::{BTreeMap, VecDeque};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::net::reactor::{PollRegistry, Readiness, Selectable};

type Task = Box<dyn FnOnce() + Send>;

/// The write end of the reactor's self-pipe.
///
/// Any thread may clone and use this to make a sleeping `poll(2)` return
/// immediately. Writes are fire-and-forget; a full pipe already guarantees a
/// pending wake-up.
#[derive(Clone)]
pub struct SignalSender {
    write_end: Arc<OwnedFd>,
}

impl SignalSender {
    /// Wakes the reactor.
    pub fn signal(&self) {
        let byte = [1u8];
        // EAGAIN means the pipe is full, which is as good as signalled.
        unsafe {
            libc::write(self.write_end.as_raw_fd(), byte.as_ptr().cast(), 1);
        }
    }
}

/// Shared state of the reactor's task queue: a FIFO of closures plus a
/// time-ordered map of delayed closures.
pub struct TaskQueueState {
    immediate: Mutex<VecDeque<Task>>,
    delayed: Mutex<BTreeMap<Instant, Vec<Task>>>,
    sender: SignalSender,
}

impl TaskQueueState {
    /// Enqueues `task` and wakes the reactor.
    pub fn post(&self, task: Task) {
        self.immediate.lock().push_back(task);
        self.sender.signal();
    }

    /// Enqueues `task` to run once `delay` has elapsed.
    pub fn post_delayed(&self, delay: Duration, task: Task) {
        let due = Instant::now() + delay;
        self.delayed.lock().entry(due).or_default().push(task);
        self.sender.signal();
    }

    /// Wakes the reactor without scheduling work.
    pub fn signal(&self) {
        self.sender.signal();
    }

    /// A cloneable wake-up sender.
    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }
}

/// The reactor's built-in task-running selectable, wrapping the read end of
/// the self-pipe.
pub struct TaskQueue {
    read_end: OwnedFd,
    state: Arc<TaskQueueState>,
}

impl TaskQueue {
    /// Creates the queue and its shared state. The queue side is registered
    /// with the reactor; the state side is what handles hold on to.
    pub fn create() -> (TaskQueue, Arc<TaskQueueState>) {
        let (read_end, write_end) = new_pipe();
        let state = Arc::new(TaskQueueState {
            immediate: Mutex::new(VecDeque::new()),
            delayed: Mutex::new(BTreeMap::new()),
            sender: SignalSender {
                write_end: Arc::new(write_end),
            },
        });
        (
            TaskQueue {
                read_end,
                state: state.clone(),
            },
            state,
        )
    }

    fn drain_pipe(&self) {
        let mut scratch = [0u8; 64];
        loop {
            let read = unsafe {
                libc::read(
                    self.read_end.as_raw_fd(),
                    scratch.as_mut_ptr().cast(),
                    scratch.len(),
                )
            };
            if read <= 0 {
                break;
            }
        }
    }
}

impl Selectable for TaskQueue {
    fn name(&self) -> &str {
        "task-queue"
    }

    fn register(&mut self, registry: &mut PollRegistry) -> bool {
        registry.add(self.read_end.as_raw_fd(), true, false);
        if let Some((due, _)) = self.state.delayed.lock().first_key_value() {
            registry.wake_at(*due);
        }
        true
    }

    fn process(&mut self, readiness: &Readiness<'_>) -> bool {
        if readiness.readable(self.read_end.as_raw_fd()) {
            self.drain_pipe();
        }

        let mut due_tasks: Vec<Task> = self.state.immediate.lock().drain(..).collect();
        {
            let now = Instant::now();
            let mut delayed = self.state.delayed.lock();
            while let Some(entry) = delayed.first_entry() {
                if *entry.key() > now {
                    break;
                }
                due_tasks.extend(entry.remove());
            }
        }

        for task in due_tasks {
            task();
        }
        true
    }
}

fn new_pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    let result = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert!(result == 0, "pipe creation failed: {}", std::io::Error::last_os_error());
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            let fd_flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC);
        }
    }
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}
