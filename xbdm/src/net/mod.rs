//! The IO reactor and its transports.
//!
//! Everything that touches a socket in this crate is a [`Selectable`] driven
//! by a single [`Reactor`] thread. Selectables describe their interest (file
//! descriptors plus an optional wake-up time) before each `poll(2)` and are
//! handed the readiness results afterwards. Work is pushed onto the reactor
//! thread through its built-in task queue, which doubles as the self-pipe
//! that interrupts a sleeping `poll`.

mod endpoint;
mod reactor;
mod signaller;
mod tcp;

pub use endpoint::Endpoint;
pub use reactor::{PollRegistry, Reactor, ReactorHandle, Readiness, Selectable};
pub use signaller::{SignalSender, TaskQueue};
pub use tcp::{TcpChannel, TcpServer};
