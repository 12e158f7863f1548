//! The typed catalog of XBDM commands.
//!
//! Each command declares its wire syntax and how to interpret its response by
//! implementing [`XbdmCommand`]; `XbdmContext::execute` provides the
//! send-and-wait plumbing. The catalog is open-ended: runtime-loaded handler
//! commands implement the same trait from their own modules.

use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::rdcp::types::{
    MemoryRegion, Module, Section, ThreadContext, ThreadFloatContext, ThreadInfo,
};
use crate::rdcp::{
    BinarySize, MapResponse, MultiMapResponse, MultilineResponse, RdcpRequest, RdcpResponse,
    Status, StopReason,
};
use crate::util::quote_arg;
use crate::Error;

/// A command with typed arguments and a typed response.
pub trait XbdmCommand {
    /// What a successful response parses into.
    type Output;

    /// Builds the single-use wire request.
    fn request(&self) -> RdcpRequest;

    /// Interprets the completed response.
    fn parse(&self, response: &RdcpResponse) -> Result<Self::Output, Error>;
}

/// Converts non-success statuses into errors, shared by most commands.
pub(crate) fn check_status(response: &RdcpResponse) -> Result<(), Error> {
    match response.status {
        Status::Abandoned => Err(Error::Abandoned),
        status if status.is_success() => Ok(()),
        status => Err(Error::target(status, response.message.clone())),
    }
}

/// `altaddr`: the target's alternate (title) IP address.
pub struct AltAddr;

impl XbdmCommand for AltAddr {
    type Output = Ipv4Addr;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::new("altaddr")
    }

    fn parse(&self, response: &RdcpResponse) -> Result<Ipv4Addr, Error> {
        check_status(response)?;
        let map = MapResponse::parse(&response.data);
        let addr = map
            .get_u32("addr")
            .ok_or_else(|| Error::ProtocolViolation("altaddr response missing addr".into()))?;
        // The DWORD is in network byte order; stringify as a dotted quad.
        Ok(Ipv4Addr::from(addr.swap_bytes()))
    }
}

/// What a `break` command should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakMode {
    /// Break at the start of the next launched title.
    Start,
    /// Remove every breakpoint.
    ClearAll,
    /// An execute breakpoint at the given address.
    Address(u32),
    /// A read watchpoint over `size` bytes.
    Read { address: u32, size: u32 },
    /// A write watchpoint over `size` bytes.
    Write { address: u32, size: u32 },
    /// An execute watchpoint over `size` bytes.
    Execute { address: u32, size: u32 },
}

/// `break`: install or remove a breakpoint.
pub struct Break {
    pub mode: BreakMode,
    /// Remove instead of install.
    pub clear: bool,
}

impl XbdmCommand for Break {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        let mut args = match self.mode {
            BreakMode::Start => "start".to_owned(),
            BreakMode::ClearAll => "clearall".to_owned(),
            BreakMode::Address(address) => format!("addr={address:#x}"),
            BreakMode::Read { address, size } => format!("read={address:#x} size={size:#x}"),
            BreakMode::Write { address, size } => format!("write={address:#x} size={size:#x}"),
            BreakMode::Execute { address, size } => {
                format!("execute={address:#x} size={size:#x}")
            }
        };
        if self.clear {
            args.push_str(" clear");
        }
        RdcpRequest::with_args("break", args)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `continue`: resume one thread, optionally also delivering the pending
/// exception to the title.
pub struct ContinueThread {
    pub thread_id: u32,
    pub exception: bool,
}

impl XbdmCommand for ContinueThread {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        let mut args = format!("thread={:#x}", self.thread_id);
        if self.exception {
            args.push_str(" exception");
        }
        RdcpRequest::with_args("continue", args)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

macro_rules! simple_command {
    ($(#[$doc:meta])* $name:ident, $command:literal) => {
        $(#[$doc])*
        pub struct $name;

        impl XbdmCommand for $name {
            type Output = ();

            fn request(&self) -> RdcpRequest {
                RdcpRequest::new($command)
            }

            fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
                check_status(response)
            }
        }
    };
}

simple_command!(
    /// `stop`: break into the title.
    Stop,
    "stop"
);
simple_command!(
    /// `go`: release the stopped title.
    Go,
    "go"
);

macro_rules! thread_command {
    ($(#[$doc:meta])* $name:ident, $command:literal) => {
        $(#[$doc])*
        pub struct $name {
            pub thread_id: u32,
        }

        impl XbdmCommand for $name {
            type Output = ();

            fn request(&self) -> RdcpRequest {
                RdcpRequest::with_args($command, format!("thread={:#x}", self.thread_id))
            }

            fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
                check_status(response)
            }
        }
    };
}

thread_command!(
    /// `halt thread=`: halt one thread.
    HaltThread,
    "halt"
);
thread_command!(
    /// `suspend thread=`: bump a thread's suspend count.
    SuspendThread,
    "suspend"
);
thread_command!(
    /// `resume thread=`: drop a thread's suspend count.
    ResumeThread,
    "resume"
);

/// `debugger connect` / `debugger disconnect`.
pub struct Debugger {
    pub connect: bool,
}

impl XbdmCommand for Debugger {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args(
            "debugger",
            if self.connect { "connect" } else { "disconnect" },
        )
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `getcontext`: fetch a thread's integer registers.
pub struct GetContext {
    pub thread_id: u32,
}

impl XbdmCommand for GetContext {
    type Output = ThreadContext;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args(
            "getcontext",
            format!("thread={:#x} control int", self.thread_id),
        )
    }

    fn parse(&self, response: &RdcpResponse) -> Result<ThreadContext, Error> {
        check_status(response)?;
        // The body is one register per line; a single map parse tolerates
        // both that and the one-line form.
        let joined = MultilineResponse::parse(&response.data).lines.join(" ");
        Ok(ThreadContext::parse(&MapResponse::parse(joined.as_bytes())))
    }
}

/// `setcontext`: push integer registers back to a thread.
pub struct SetContext {
    pub thread_id: u32,
    pub context: ThreadContext,
}

impl XbdmCommand for SetContext {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args(
            "setcontext",
            format!("thread={:#x}{}", self.thread_id, self.context.serialize()),
        )
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `getextcontext`: fetch a thread's x87 state as a length-prefixed blob.
pub struct GetExtContext {
    pub thread_id: u32,
}

impl XbdmCommand for GetExtContext {
    type Output = ThreadFloatContext;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args("getextcontext", format!("thread={:#x}", self.thread_id))
            .binary_size_prefixed()
    }

    fn parse(&self, response: &RdcpResponse) -> Result<ThreadFloatContext, Error> {
        check_status(response)?;
        ThreadFloatContext::parse(&response.data).ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "extended context blob too short ({} bytes)",
                response.data.len()
            ))
        })
    }
}

/// `getmem2`: read target memory.
pub struct GetMem {
    pub address: u32,
    pub length: u32,
}

impl XbdmCommand for GetMem {
    type Output = Vec<u8>;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args(
            "getmem2",
            format!("ADDR={:#x} LENGTH={:#x}", self.address, self.length),
        )
        .binary_size_fixed(self.length as usize)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<Vec<u8>, Error> {
        check_status(response)?;
        Ok(response.data.clone())
    }
}

/// `setmem`: write a hex-encoded run of bytes. Callers are responsible for
/// keeping the line inside XBDM's command buffer; the debugger splits large
/// writes before building these.
pub struct SetMem<'data> {
    pub address: u32,
    pub data: &'data [u8],
}

impl XbdmCommand for SetMem<'_> {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args(
            "setmem",
            format!("addr={:#x} data={}", self.address, hex::encode(self.data)),
        )
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `modules`: every module loaded on the target.
pub struct Modules;

impl XbdmCommand for Modules {
    type Output = Vec<Module>;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::new("modules")
    }

    fn parse(&self, response: &RdcpResponse) -> Result<Vec<Module>, Error> {
        check_status(response)?;
        Ok(MultiMapResponse::parse(&response.data)
            .maps
            .iter()
            .filter_map(Module::parse)
            .collect())
    }
}

/// `modsections`: the sections of one module.
pub struct ModSections<'name> {
    pub name: &'name str,
}

impl XbdmCommand for ModSections<'_> {
    type Output = Vec<Section>;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args("modsections", format!("name={}", quote_arg(self.name)))
    }

    fn parse(&self, response: &RdcpResponse) -> Result<Vec<Section>, Error> {
        check_status(response)?;
        Ok(MultiMapResponse::parse(&response.data)
            .maps
            .iter()
            .filter_map(Section::parse)
            .collect())
    }
}

/// `walkmem`: the target's memory map.
pub struct WalkMem;

impl XbdmCommand for WalkMem {
    type Output = Vec<MemoryRegion>;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::new("walkmem")
    }

    fn parse(&self, response: &RdcpResponse) -> Result<Vec<MemoryRegion>, Error> {
        check_status(response)?;
        Ok(MultiMapResponse::parse(&response.data)
            .maps
            .iter()
            .filter_map(MemoryRegion::parse)
            .collect())
    }
}

/// `threads`: the ids of all threads.
pub struct Threads;

impl XbdmCommand for Threads {
    type Output = Vec<u32>;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::new("threads")
    }

    fn parse(&self, response: &RdcpResponse) -> Result<Vec<u32>, Error> {
        check_status(response)?;
        Ok(MultilineResponse::parse(&response.data)
            .lines
            .iter()
            .filter_map(|line| crate::util::parse_u32(line))
            .collect())
    }
}

/// `threadinfo`: metadata for one thread.
pub struct GetThreadInfo {
    pub thread_id: u32,
}

impl XbdmCommand for GetThreadInfo {
    type Output = ThreadInfo;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args("threadinfo", format!("thread={:#x}", self.thread_id))
    }

    fn parse(&self, response: &RdcpResponse) -> Result<ThreadInfo, Error> {
        check_status(response)?;
        let joined = MultilineResponse::parse(&response.data).lines.join(" ");
        Ok(ThreadInfo::parse(&MapResponse::parse(joined.as_bytes())))
    }
}

/// `isstopped`: why a thread is stopped, or `None` if it is running.
pub struct IsStopped {
    pub thread_id: u32,
}

impl XbdmCommand for IsStopped {
    type Output = Option<StopReason>;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args("isstopped", format!("thread={:#x}", self.thread_id))
    }

    fn parse(&self, response: &RdcpResponse) -> Result<Option<StopReason>, Error> {
        if response.status == Status::NotStopped {
            return Ok(None);
        }
        check_status(response)?;
        let map = MapResponse::parse(response.message.as_bytes());
        Ok(Some(StopReason::parse_is_stopped(&map)))
    }
}

bitflags::bitflags! {
    /// The event classes `stopon`/`nostopon` control.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StopEvents: u32 {
        const CREATETHREAD = 1 << 0;
        const FCE = 1 << 1;
        const DEBUGSTR = 1 << 2;
        const STACKTRACE = 1 << 3;
    }
}

impl StopEvents {
    fn serialize(&self) -> String {
        if self.is_all() {
            return "all".to_owned();
        }
        let mut names = Vec::new();
        if self.contains(StopEvents::CREATETHREAD) {
            names.push("createthread");
        }
        if self.contains(StopEvents::FCE) {
            names.push("fce");
        }
        if self.contains(StopEvents::DEBUGSTR) {
            names.push("debugstr");
        }
        if self.contains(StopEvents::STACKTRACE) {
            names.push("stacktrace");
        }
        names.join(" ")
    }
}

/// `stopon` / `nostopon`: choose which events halt the title.
pub struct StopOn {
    pub events: StopEvents,
    pub enable: bool,
}

impl XbdmCommand for StopOn {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args(
            if self.enable { "stopon" } else { "nostopon" },
            self.events.serialize(),
        )
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `notifyat`: ask XBDM to open (or drop) a reverse notification connection
/// to the given local port.
pub struct NotifyAt {
    pub port: u16,
    pub drop_connection: bool,
    pub debug_flag: bool,
}

impl XbdmCommand for NotifyAt {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        let mut args = format!("port={:#x}", self.port);
        if self.drop_connection {
            args.push_str(" drop");
        }
        if self.debug_flag {
            args.push_str(" debug");
        }
        RdcpRequest::with_args("notifyat", args)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

bitflags::bitflags! {
    /// Modifiers for the `reboot` command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RebootFlags: u32 {
        const WARM = 1 << 0;
        const NO_DEBUG = 1 << 1;
        const WAIT = 1 << 2;
        const STOP = 1 << 3;
    }
}

/// `reboot`: restart the target. The control connection drops as a side
/// effect.
pub struct Reboot {
    pub flags: RebootFlags,
}

impl XbdmCommand for Reboot {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        let mut names = Vec::new();
        if self.flags.contains(RebootFlags::WARM) {
            names.push("warm");
        }
        if self.flags.contains(RebootFlags::NO_DEBUG) {
            names.push("nodebug");
        }
        if self.flags.contains(RebootFlags::WAIT) {
            names.push("wait");
        }
        if self.flags.contains(RebootFlags::STOP) {
            names.push("stop");
        }
        if names.is_empty() {
            RdcpRequest::new("reboot")
        } else {
            RdcpRequest::with_args("reboot", names.join(" "))
        }
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `title`: configure the title to load on the next boot.
pub struct LoadOnBootTitle<'a> {
    pub name: &'a str,
    pub dir: &'a str,
    pub command_line: Option<&'a str>,
    pub persist: bool,
}

impl XbdmCommand for LoadOnBootTitle<'_> {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        let mut args = format!(
            "name={} dir={}",
            quote_arg(self.name),
            quote_arg(self.dir)
        );
        if let Some(command_line) = self.command_line {
            args.push_str(&format!(" cmdline={}", quote_arg(command_line)));
        }
        if self.persist {
            args.push_str(" persist");
        }
        RdcpRequest::with_args("title", args)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `dedicate`: hand the current connection to a named command handler.
pub struct Dedicate<'a> {
    pub handler: &'a str,
}

impl XbdmCommand for Dedicate<'_> {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args("dedicate", self.handler)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        if response.status == Status::Dedicated {
            Ok(())
        } else {
            check_status(response)?;
            Err(Error::ProtocolViolation(format!(
                "dedicate answered {} instead of 205",
                response.status
            )))
        }
    }
}

/// The framebuffer metadata preceding a screenshot body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramebufferInfo {
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
}

/// A captured screenshot.
#[derive(Debug, Clone)]
pub struct ScreenshotData {
    pub info: FramebufferInfo,
    pub pixels: Vec<u8>,
}

/// `screenshot`: grab the current framebuffer. The binary body is preceded
/// by a map line declaring `framebuffersize` and the surface layout.
pub struct Screenshot {
    header: Arc<Mutex<FramebufferInfo>>,
}

impl Screenshot {
    pub fn new() -> Screenshot {
        Screenshot {
            header: Arc::new(Mutex::new(FramebufferInfo::default())),
        }
    }
}

impl Default for Screenshot {
    fn default() -> Self {
        Screenshot::new()
    }
}

impl XbdmCommand for Screenshot {
    type Output = ScreenshotData;

    fn request(&self) -> RdcpRequest {
        let header = self.header.clone();
        RdcpRequest::new("screenshot").binary_size(move |buffer| {
            let line_end = buffer.windows(2).position(|window| window == b"\r\n")?;
            let map = MapResponse::parse(&buffer[..line_end]);
            let size = map.get_u32("framebuffersize")?;
            *header.lock() = FramebufferInfo {
                pitch: map.get_u32("pitch").unwrap_or(0),
                width: map.get_u32("width").unwrap_or(0),
                height: map.get_u32("height").unwrap_or(0),
                format: map.get_u32("format").unwrap_or(0),
            };
            Some(BinarySize {
                size: size as usize,
                consumed: line_end + 2,
            })
        })
    }

    fn parse(&self, response: &RdcpResponse) -> Result<ScreenshotData, Error> {
        check_status(response)?;
        Ok(ScreenshotData {
            info: *self.header.lock(),
            pixels: response.data.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ok(data: &[u8]) -> RdcpResponse {
        RdcpResponse {
            status: Status::Multiline,
            message: "multiline response follows".into(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn altaddr_renders_a_dotted_quad() {
        // In-memory byte order c0 a8 00 01 is 192.168.0.1.
        let response = RdcpResponse {
            status: Status::Ok,
            message: "OK".into(),
            data: b"addr=0x0100a8c0".to_vec(),
        };
        assert_eq!(
            AltAddr.parse(&response).unwrap(),
            Ipv4Addr::new(192, 168, 0, 1)
        );
    }

    #[test]
    fn break_modes_serialize_their_arguments() {
        let request = Break {
            mode: BreakMode::Address(0x8004_1000),
            clear: false,
        }
        .request();
        assert_eq!(request.command_line(), b"break addr=0x80041000\r\n");

        let request = Break {
            mode: BreakMode::Write {
                address: 0xd000_0000,
                size: 4,
            },
            clear: true,
        }
        .request();
        assert_eq!(
            request.command_line(),
            b"break write=0xd0000000 size=0x4 clear\r\n"
        );
    }

    #[test]
    fn getmem_request_matches_the_wire_shape() {
        let request = GetMem {
            address: 0x10000,
            length: 4,
        }
        .request();
        assert_eq!(request.command_line(), b"getmem2 ADDR=0x10000 LENGTH=0x4\r\n");
    }

    #[test]
    fn setmem_hex_encodes_its_payload() {
        let request = SetMem {
            address: 0x10000,
            data: &[0xde, 0xad, 0xbe, 0xef],
        }
        .request();
        assert_eq!(
            request.command_line(),
            b"setmem addr=0x10000 data=deadbeef\r\n"
        );
    }

    #[test]
    fn modules_parse_into_typed_records() {
        let body = b"name=\"xbdm.dll\" base=0xb0000000 size=0x12000 check=0xaabb timestamp=0x3f8a0000 tls\r\nname=\"default.xbe\" base=0x10000 size=0x20000 xbe";
        let modules = Modules.parse(&ok(body)).unwrap();
        assert_eq!(modules.len(), 2);
        assert!(modules[0].has_tls);
        assert!(modules[1].is_xbe);
    }

    #[test]
    fn threads_parse_decimal_ids() {
        let threads = Threads.parse(&ok(b"14\r\n20\r\n36")).unwrap();
        assert_eq!(threads, vec![14, 20, 36]);
    }

    #[test]
    fn isstopped_translates_not_stopped_to_none() {
        let response = RdcpResponse::status_only(Status::NotStopped, "not stopped");
        assert_eq!(IsStopped { thread_id: 14 }.parse(&response).unwrap(), None);

        let stopped = RdcpResponse::status_only(
            Status::Ok,
            "break thread=14 addr=0x80041000",
        );
        let reason = IsStopped { thread_id: 14 }.parse(&stopped).unwrap();
        assert_eq!(
            reason,
            Some(StopReason::Breakpoint {
                thread_id: 14,
                address: 0x8004_1000
            })
        );
    }

    #[test]
    fn stopon_serializes_flag_names() {
        let request = StopOn {
            events: StopEvents::all(),
            enable: true,
        }
        .request();
        assert_eq!(request.command_line(), b"stopon all\r\n");

        let request = StopOn {
            events: StopEvents::DEBUGSTR | StopEvents::FCE,
            enable: false,
        }
        .request();
        assert_eq!(request.command_line(), b"nostopon fce debugstr\r\n");
    }

    #[test]
    fn reboot_flags_appear_in_canonical_order() {
        let request = Reboot {
            flags: RebootFlags::WAIT | RebootFlags::WARM,
        }
        .request();
        assert_eq!(request.command_line(), b"reboot warm wait\r\n");
    }

    #[test]
    fn title_quotes_values_with_whitespace() {
        let request = LoadOnBootTitle {
            name: "default.xbe",
            dir: r"e:\my games\halo",
            command_line: None,
            persist: false,
        }
        .request();
        assert_eq!(
            request.command_line(),
            b"title name=default.xbe dir=\"e:\\my games\\halo\"\r\n"
        );
    }

    #[test]
    fn screenshot_header_sizes_the_body() {
        let screenshot = Screenshot::new();
        let request = screenshot.request();
        let header = b"pitch=0xa00 width=0x280 height=0x1e0 format=0x12 framebuffersize=0x8\r\n";
        let parsed = request.parse_binary_size(header).unwrap().unwrap();
        assert_eq!(parsed.size, 8);
        assert_eq!(parsed.consumed, header.len());

        let response = RdcpResponse {
            status: Status::Binary,
            message: "binary response follows".into(),
            data: vec![0u8; 8],
        };
        let data = screenshot.parse(&response).unwrap();
        assert_eq!(data.info.width, 0x280);
        assert_eq!(data.info.height, 0x1e0);
        assert_eq!(data.pixels.len(), 8);
    }
}
