use std::fmt;

/// The status codes XBDM puts on the first line of every response.
///
/// Success codes (2xx) determine how the rest of the response is framed:
/// [`Status::Multiline`] bodies run until `\r\n.\r\n`, [`Status::Binary`]
/// bodies have a request-specific length, [`Status::SendBinaryData`] asks the
/// client to transmit its payload, and [`Status::Dedicated`] hands the whole
/// connection over to a command handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 200: the request succeeded with no body.
    Ok,
    /// 201: sent unprompted when a control connection is established.
    Connected,
    /// 202: a multiline body follows.
    Multiline,
    /// 203: a binary body follows.
    Binary,
    /// 204: the client should now send its binary payload.
    SendBinaryData,
    /// 205: this connection now belongs to a dedicated handler.
    Dedicated,
    /// 400
    Unexpected,
    /// 401
    MaxConnectionsExceeded,
    /// 402
    FileNotFound,
    /// 403
    NoSuchModule,
    /// 404
    MemoryNotMapped,
    /// 405
    NoSuchThread,
    /// 406
    SetSystemTimeFailed,
    /// 407
    UnknownCommand,
    /// 408: the queried thread is not stopped.
    NotStopped,
    /// 409
    FileMustBeCopied,
    /// 410
    Exists,
    /// 411
    DirectoryNotEmpty,
    /// 412
    FilenameInvalid,
    /// 413
    CreateFileFailed,
    /// 414
    AccessDenied,
    /// 415
    NoRoomOnDevice,
    /// 416: the running title was not launched debuggable.
    NotDebuggable,
    /// 417
    TypeInvalid,
    /// 418
    DataNotAvailable,
    /// 420
    BoxNotLocked,
    /// 421
    KeyExchangeRequired,
    /// 422
    DedicatedConnectionRequired,
    /// Synthesized locally when the owning transport closes before the
    /// response arrives. Never seen on the wire.
    Abandoned,
    /// A code outside the known set, kept verbatim.
    Unknown(u16),
}

impl Status {
    /// Maps a wire code onto the enum.
    pub fn from_code(code: u16) -> Status {
        match code {
            200 => Status::Ok,
            201 => Status::Connected,
            202 => Status::Multiline,
            203 => Status::Binary,
            204 => Status::SendBinaryData,
            205 => Status::Dedicated,
            400 => Status::Unexpected,
            401 => Status::MaxConnectionsExceeded,
            402 => Status::FileNotFound,
            403 => Status::NoSuchModule,
            404 => Status::MemoryNotMapped,
            405 => Status::NoSuchThread,
            406 => Status::SetSystemTimeFailed,
            407 => Status::UnknownCommand,
            408 => Status::NotStopped,
            409 => Status::FileMustBeCopied,
            410 => Status::Exists,
            411 => Status::DirectoryNotEmpty,
            412 => Status::FilenameInvalid,
            413 => Status::CreateFileFailed,
            414 => Status::AccessDenied,
            415 => Status::NoRoomOnDevice,
            416 => Status::NotDebuggable,
            417 => Status::TypeInvalid,
            418 => Status::DataNotAvailable,
            420 => Status::BoxNotLocked,
            421 => Status::KeyExchangeRequired,
            422 => Status::DedicatedConnectionRequired,
            other => Status::Unknown(other),
        }
    }

    /// The numeric wire code, zero for [`Status::Abandoned`].
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Connected => 201,
            Status::Multiline => 202,
            Status::Binary => 203,
            Status::SendBinaryData => 204,
            Status::Dedicated => 205,
            Status::Unexpected => 400,
            Status::MaxConnectionsExceeded => 401,
            Status::FileNotFound => 402,
            Status::NoSuchModule => 403,
            Status::MemoryNotMapped => 404,
            Status::NoSuchThread => 405,
            Status::SetSystemTimeFailed => 406,
            Status::UnknownCommand => 407,
            Status::NotStopped => 408,
            Status::FileMustBeCopied => 409,
            Status::Exists => 410,
            Status::DirectoryNotEmpty => 411,
            Status::FilenameInvalid => 412,
            Status::CreateFileFailed => 413,
            Status::AccessDenied => 414,
            Status::NoRoomOnDevice => 415,
            Status::NotDebuggable => 416,
            Status::TypeInvalid => 417,
            Status::DataNotAvailable => 418,
            Status::BoxNotLocked => 420,
            Status::KeyExchangeRequired => 421,
            Status::DedicatedConnectionRequired => 422,
            Status::Abandoned => 0,
            Status::Unknown(code) => *code,
        }
    }

    /// Whether the status is in the 2xx success range.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Status::Ok
                | Status::Connected
                | Status::Multiline
                | Status::Binary
                | Status::SendBinaryData
                | Status::Dedicated
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Abandoned => write!(f, "(abandoned)"),
            other => write!(f, "{}", other.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(200, true; "ok")]
    #[test_case(202, true; "multiline")]
    #[test_case(205, true; "dedicated")]
    #[test_case(400, false; "unexpected")]
    #[test_case(416, false; "not debuggable")]
    #[test_case(422, false; "dedicated required")]
    fn success_partition(code: u16, success: bool) {
        assert_eq!(Status::from_code(code).is_success(), success);
    }

    #[test]
    fn codes_round_trip() {
        for code in [200, 201, 202, 203, 204, 205, 408, 416, 422, 999] {
            assert_eq!(Status::from_code(code).code(), code);
        }
    }
}
