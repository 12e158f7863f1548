//! End-to-end GDB-RSP behavior: a fake GDB client on one side, the scripted
//! XBDM mock on the other.

mod support;

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use support::{wait_until, MockReply, MockXbdm};
use xbdm::debugger::{AttachState, BreakpointKind};
use xbdm::net::Reactor;
use xbdm::{GdbServer, XbdmContext, XbdmDebugger};

struct GdbClient {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl GdbClient {
    fn connect(port: u16) -> GdbClient {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).expect("gdb connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        GdbClient {
            stream,
            pending: Vec::new(),
        }
    }

    fn send(&mut self, body: &str) {
        let checksum = body.bytes().fold(0u8, |sum, b| sum.wrapping_add(b));
        let frame = format!("${body}#{checksum:02x}");
        self.stream.write_all(frame.as_bytes()).expect("gdb send");
    }

    fn send_interrupt(&mut self) {
        self.stream.write_all(&[0x03]).expect("interrupt send");
    }

    /// Reads the next framed packet, skipping ack bytes.
    fn recv(&mut self) -> String {
        let mut scratch = [0u8; 1024];
        loop {
            while let Some(start) = self.pending.iter().position(|&b| b == b'$') {
                if let Some(end) = self.pending[start..].iter().position(|&b| b == b'#') {
                    let end = start + end;
                    if self.pending.len() >= end + 3 {
                        let body =
                            String::from_utf8_lossy(&self.pending[start + 1..end]).into_owned();
                        self.pending.drain(..end + 3);
                        return body;
                    }
                }
                break;
            }
            let count = self.stream.read(&mut scratch).expect("gdb recv");
            assert!(count > 0, "gdb server closed the connection");
            self.pending.extend_from_slice(&scratch[..count]);
        }
    }
}

struct Session {
    mock: MockXbdm,
    _reactor: Reactor,
    debugger: Arc<XbdmDebugger>,
    client: GdbClient,
}

fn start_session() -> Session {
    let mock = MockXbdm::start();
    let reactor = Reactor::start();
    let context = XbdmContext::new(mock.endpoint, reactor.handle());
    let debugger = XbdmDebugger::new(context);
    debugger.attach().expect("attach");

    let server = GdbServer::start(debugger.clone(), "127.0.0.1:0".parse().unwrap())
        .expect("gdb server");
    let client = GdbClient::connect(server.port());

    Session {
        mock,
        _reactor: reactor,
        debugger,
        client,
    }
}

#[test]
fn feature_negotiation_and_thread_listing() {
    let mut session = start_session();

    session.client.send("qSupported:multiprocess+;swbreak+");
    let reply = session.client.recv();
    assert!(reply.contains("PacketSize=4096"));
    assert!(reply.contains("QStartNoAckMode+"));
    assert!(reply.contains("qXfer:features:read+"));
    assert!(reply.contains("multiprocess-"));

    session.client.send("QStartNoAckMode");
    assert_eq!(session.client.recv(), "OK");

    session.client.send("qAttached");
    assert_eq!(session.client.recv(), "1");

    session.client.send("qfThreadInfo");
    assert_eq!(session.client.recv(), "m1");
    session.client.send("qsThreadInfo");
    assert_eq!(session.client.recv(), "l");

    session.client.send("qC");
    assert_eq!(session.client.recv(), "QC1");
}

#[test]
fn target_xml_is_served_in_chunks() {
    let mut session = start_session();
    session.client.send("qXfer:features:read:target.xml:0,40");
    let first = session.client.recv();
    assert!(first.starts_with('m'));
    assert!(first.contains("<?xml"));

    session.client.send("qXfer:features:read:target.xml:0,ffff");
    let whole = session.client.recv();
    assert!(whole.starts_with('l'));
    assert!(whole.contains("i386:intel"));
    assert!(whole.ends_with("</target>"));
}

#[test]
fn memory_round_trips_as_hex() {
    let mut session = start_session();
    session.mock.shared.poke(0x10000, &[0xde, 0xad, 0xbe, 0xef]);

    session.client.send("m10000,4");
    assert_eq!(session.client.recv(), "deadbeef");

    session.client.send("M10000,2:0102");
    assert_eq!(session.client.recv(), "OK");
    assert_eq!(session.mock.shared.peek(0x10000, 4), vec![1, 2, 0xbe, 0xef]);
}

#[test]
fn registers_serialize_with_unavailable_slots() {
    let mut session = start_session();
    session.client.send("g");
    let registers = session.client.recv();
    // Eax=0x1 little-endian, from the mock's canned context.
    assert!(registers.starts_with("01000000"));
    // The segment registers XBDM cannot provide read as unavailable.
    assert!(registers.contains("xxxxxxxx"));

    session.client.send("p8");
    assert_eq!(session.client.recv(), "00100480"); // Eip 0x80041000
}

#[test]
fn single_step_bypasses_a_breakpoint_transparently() {
    let mut session = start_session();

    // Thread 1 is stopped on a registered execute breakpoint.
    session
        .debugger
        .add_breakpoint(BreakpointKind::Execute, 0x8004_1000, 1)
        .expect("add breakpoint");
    session.mock.shared.notify("break thread=1 addr=0x80041000");
    wait_until("stop recorded", || {
        session.debugger.attach_state() == AttachState::Stopped
    });

    session.client.send("?");
    assert_eq!(session.client.recv(), "T05thread:1;");

    let clears_before = session
        .mock
        .shared
        .commands_matching("break addr=0x80041000 clear")
        .len();

    session.client.send("vCont;s:1");

    // The bridge must clear the breakpoint, arm the trap flag, and resume.
    wait_until("trap flag set", || {
        !session
            .mock
            .shared
            .commands_matching("setcontext thread=0x1 EFlags=0x346")
            .is_empty()
    });
    wait_until("breakpoint suspended", || {
        session
            .mock
            .shared
            .commands_matching("break addr=0x80041000 clear")
            .len()
            > clears_before
    });
    wait_until("continue issued", || {
        !session.mock.shared.commands_matching("continue thread=0x1").is_empty()
    });
    wait_until("go issued", || {
        !session.mock.shared.commands_matching("go").is_empty()
    });

    let installs_before = session
        .mock
        .shared
        .commands_matching("break addr=0x80041000")
        .iter()
        .filter(|line| !line.contains("clear"))
        .count();

    // The step lands; the bridge reports it and reinstalls the breakpoint.
    session.mock.shared.notify("singlestep thread=1 addr=0x80041003");
    assert_eq!(session.client.recv(), "T05thread:1;");

    wait_until("breakpoint reinstalled", || {
        session
            .mock
            .shared
            .commands_matching("break addr=0x80041000")
            .iter()
            .filter(|line| !line.contains("clear"))
            .count()
            > installs_before
    });
}

#[test]
fn interrupt_halts_and_reports_a_stop() {
    let mut session = start_session();
    session.mock.respond(
        "isstopped",
        |_, _| MockReply::Status("200- break thread=1 addr=0x80041000"),
    );

    session.client.send("vCont;c");
    wait_until("resume forwarded", || {
        !session.mock.shared.commands_matching("go").is_empty()
    });

    session.client.send_interrupt();
    let reply = session.client.recv();
    assert!(reply.starts_with("T05thread:1;"), "unexpected reply {reply}");
    assert!(session
        .mock
        .shared
        .commands_matching("stop")
        .iter()
        .any(|line| line == "stop"));
}

#[test]
fn watchpoints_install_and_roll_back_as_pairs() {
    let mut session = start_session();

    session.client.send("Z2,d0000000,4");
    assert_eq!(session.client.recv(), "OK");
    assert!(!session
        .mock
        .shared
        .commands_matching("break write=0xd0000000 size=0x4")
        .is_empty());

    session.client.send("z2,d0000000,4");
    assert_eq!(session.client.recv(), "OK");

    // Access watchpoints are read+write; if the write half fails the read
    // half must be removed again.
    session
        .mock
        .respond("break write=", |_, _| MockReply::Status("405- no such thread"));
    session.client.send("Z4,d0000000,4");
    let reply = session.client.recv();
    assert!(reply.starts_with('E'), "expected an error, got {reply}");
    assert!(session.debugger.breakpoints().is_empty());
    assert!(!session
        .mock
        .shared
        .commands_matching("break read=0xd0000000 size=0x4 clear")
        .is_empty());
}

#[test]
fn unsupported_packets_answer_empty() {
    let mut session = start_session();
    session.client.send("bc");
    assert_eq!(session.client.recv(), "");
    session.client.send("vMustReplyEmpty");
    assert_eq!(session.client.recv(), "");
}
