//! Requests understood by the `ddxt` handler once the bootstrap has
//! registered it, plus generic invoke shapes for other runtime-loaded
//! handlers.
//!
//! All of these are tagged with the handler's name, so the context routes
//! them over the handler's dedicated channel.

use crate::rdcp::requests::{check_status, XbdmCommand};
use crate::rdcp::{MapResponse, MultilineResponse, RdcpRequest, RdcpResponse};
use crate::util::quote_arg;
use crate::Error;

/// The handler name the L2 bootstrap registers.
pub const HANDLER: &str = "ddxt";

/// `ddxt!reserve size=`: allocate a block in the debug region.
pub struct DdxtReserve {
    pub size: u32,
}

impl XbdmCommand for DdxtReserve {
    type Output = u32;

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args("ddxt!reserve", format!("size={:#x}", self.size))
            .via_handler(HANDLER)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<u32, Error> {
        check_status(response)?;
        let map = MapResponse::parse(response.message.as_bytes());
        map.get_u32("addr")
            .or_else(|| MapResponse::parse(&response.data).get_u32("addr"))
            .ok_or_else(|| Error::ProtocolViolation("reserve response missing addr".into()))
    }
}

/// `ddxt!free base=`: release a reservation that will not be used.
pub struct DdxtFree {
    pub base: u32,
}

impl XbdmCommand for DdxtFree {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args("ddxt!free", format!("base={:#x}", self.base)).via_handler(HANDLER)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `ddxt!install`: ship one pre-relocated section image to its address.
pub struct DdxtInstall {
    pub base: u32,
    pub data: Vec<u8>,
    pub entrypoint: u32,
}

impl XbdmCommand for DdxtInstall {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args(
            "ddxt!install",
            format!(
                "base={:#x} length={:#x} entrypoint={:#x}",
                self.base,
                self.data.len(),
                self.entrypoint
            ),
        )
        .payload(self.data.clone())
        .via_handler(HANDLER)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `ddxt!load`: hand a whole DLL image to the target-side loader, which
/// performs relocation itself.
pub struct DdxtLoad {
    pub image: Vec<u8>,
}

impl XbdmCommand for DdxtLoad {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        RdcpRequest::with_args("ddxt!load", format!("size={:#x}", self.image.len()))
            .payload(self.image.clone())
            .via_handler(HANDLER)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// `ddxt!export`: register a function exported by a loaded module so later
/// loads can resolve imports against it.
pub struct DdxtExport<'a> {
    pub module: &'a str,
    pub ordinal: u32,
    pub address: u32,
    pub name: &'a str,
}

impl XbdmCommand for DdxtExport<'_> {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        let mut args = format!(
            "module={} ordinal={} addr={:#x}",
            quote_arg(self.module),
            self.ordinal,
            self.address
        );
        if !self.name.is_empty() {
            args.push_str(&format!(" name={}", quote_arg(self.name)));
        }
        RdcpRequest::with_args("ddxt!export", args).via_handler(HANDLER)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// A plain invocation of any runtime-registered handler command.
pub struct HandlerInvoke<'a> {
    pub handler: &'a str,
    pub command: &'a str,
    pub args: Option<&'a str>,
}

impl XbdmCommand for HandlerInvoke<'_> {
    type Output = String;

    fn request(&self) -> RdcpRequest {
        let request = match self.args {
            Some(args) => RdcpRequest::with_args(self.command, args),
            None => RdcpRequest::new(self.command),
        };
        request.via_handler(self.handler)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<String, Error> {
        check_status(response)?;
        Ok(response.message.clone())
    }
}

/// A handler invocation expecting a multiline body.
pub struct HandlerInvokeMultiline<'a> {
    pub handler: &'a str,
    pub command: &'a str,
    pub args: Option<&'a str>,
}

impl XbdmCommand for HandlerInvokeMultiline<'_> {
    type Output = Vec<String>;

    fn request(&self) -> RdcpRequest {
        let request = match self.args {
            Some(args) => RdcpRequest::with_args(self.command, args),
            None => RdcpRequest::new(self.command),
        };
        request.via_handler(self.handler)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<Vec<String>, Error> {
        check_status(response)?;
        Ok(MultilineResponse::parse(&response.data).lines)
    }
}

/// A handler invocation that uploads a binary payload.
pub struct HandlerInvokeSendBinary<'a> {
    pub handler: &'a str,
    pub command: &'a str,
    pub args: Option<&'a str>,
    pub data: Vec<u8>,
}

impl XbdmCommand for HandlerInvokeSendBinary<'_> {
    type Output = ();

    fn request(&self) -> RdcpRequest {
        let mut args = format!("length={:#x}", self.data.len());
        if let Some(extra) = self.args {
            args.push(' ');
            args.push_str(extra);
        }
        RdcpRequest::with_args(self.command, args)
            .payload(self.data.clone())
            .via_handler(self.handler)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<(), Error> {
        check_status(response)
    }
}

/// A handler invocation that downloads a length-prefixed binary body.
pub struct HandlerInvokeReceiveBinary<'a> {
    pub handler: &'a str,
    pub command: &'a str,
    pub args: Option<&'a str>,
}

impl XbdmCommand for HandlerInvokeReceiveBinary<'_> {
    type Output = Vec<u8>;

    fn request(&self) -> RdcpRequest {
        let request = match self.args {
            Some(args) => RdcpRequest::with_args(self.command, args),
            None => RdcpRequest::new(self.command),
        };
        request.binary_size_prefixed().via_handler(self.handler)
    }

    fn parse(&self, response: &RdcpResponse) -> Result<Vec<u8>, Error> {
        check_status(response)?;
        Ok(response.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reserve_parses_the_allocated_address() {
        let response = RdcpResponse::status_only(crate::rdcp::Status::Ok, "addr=0xd0040000");
        assert_eq!(DdxtReserve { size: 0x1000 }.parse(&response).unwrap(), 0xd004_0000);
    }

    #[test]
    fn install_carries_base_length_and_entrypoint() {
        let request = DdxtInstall {
            base: 0xd004_0000,
            data: vec![0x90; 16],
            entrypoint: 0xd004_0004,
        }
        .request();
        assert_eq!(request.handler(), Some(HANDLER));
        assert_eq!(
            request.command_line(),
            b"ddxt!install base=0xd0040000 length=0x10 entrypoint=0xd0040004\r\n"
        );
    }

    #[test]
    fn export_quotes_names() {
        let request = DdxtExport {
            module: "dyndxt_loader.dll",
            ordinal: 3,
            address: 0xd004_1000,
            name: "DxtRegisterCommandProcessor",
        }
        .request();
        assert_eq!(
            request.command_line(),
            b"ddxt!export module=dyndxt_loader.dll ordinal=3 addr=0xd0041000 name=DxtRegisterCommandProcessor\r\n"
        );
    }
}
