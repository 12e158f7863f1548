//! A debugging bridge between GDB and an original Xbox running the XBDM
//! debug monitor.
//!
//! The crate is organized around a few long-lived objects:
//!
//! - [`net::Reactor`]: the single poll-loop thread every socket runs on.
//! - [`XbdmContext`]: owns the RDCP control connection to the console, any
//!   dedicated handler channels, and the reverse notification listener.
//! - [`XbdmDebugger`]: the source-level debugger state (threads, modules,
//!   memory map, breakpoints) kept current by XBDM notifications.
//! - [`gdb::GdbServer`]: the GDB Remote Serial Protocol front end that
//!   translates RSP packets into debugger operations.
//! - [`dyndxt::DyndxtLoader`]: injects and feeds the runtime extension
//!   loader, using [`dxt_loader`] for the object-file side.
//!
//! ```no_run
//! use xbdm::net::{Endpoint, Reactor};
//! use xbdm::{GdbServer, XbdmContext, XbdmDebugger};
//!
//! # fn main() -> Result<(), xbdm::Error> {
//! let reactor = Reactor::start();
//! let context = XbdmContext::new(Endpoint::resolve("10.0.1.5", 731)?, reactor.handle());
//! let debugger = XbdmDebugger::new(context);
//! debugger.attach()?;
//! let gdb = GdbServer::start(debugger, "127.0.0.1:1999".parse().unwrap())?;
//! println!("gdb server on port {}", gdb.port());
//! # Ok(())
//! # }
//! ```

pub mod debugger;
pub mod dyndxt;
pub mod gdb;
pub mod net;
pub mod notification;
pub mod rdcp;
pub mod util;

mod context;
mod error;

pub use context::{NotificationHandle, XbdmContext};
pub use debugger::XbdmDebugger;
pub use dyndxt::DyndxtLoader;
pub use error::Error;
pub use gdb::GdbServer;
