//! The Remote Debugging Control Protocol client engine.
//!
//! RDCP is XBDM's wire protocol: CRLF-terminated ASCII commands answered by a
//! three-digit status line, optionally followed by a multiline or binary
//! body. This module provides the framing ([`transport`]), the single-use
//! request type ([`RdcpRequest`]), the response body parsers
//! ([`MapResponse`] and friends), and a typed catalog of the commands the
//! bridge issues ([`requests`]).

pub mod requests;
pub mod stop_reason;
pub mod types;

mod request;
mod response;
mod status;
mod transport;

pub use request::{BinarySize, RdcpRequest};
pub use response::{MapResponse, MultiMapResponse, MultilineResponse, RdcpResponse};
pub use status::Status;
pub use stop_reason::{AccessKind, ExecutionState, StopReason};
pub use transport::XbdmTransport;

/// The sequence terminating a multiline response body.
pub const MULTILINE_TERMINATOR: &[u8] = b"\r\n.\r\n";

/// The line terminator used throughout the protocol.
pub const LINE_TERMINATOR: &[u8] = b"\r\n";
