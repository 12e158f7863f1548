#![allow(dead_code)] // shared by several test crates with different needs

//! A scripted XBDM stand-in for integration tests.
//!
//! The mock listens on a loopback port, greets with `201- connected`, and
//! answers commands from a table of prefix-matched responders. `notifyat`
//! gets the real treatment: the mock opens a reverse connection to the
//! requested port and says `hello`, after which tests can push notification
//! lines through it.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use xbdm::net::Endpoint;

/// What a responder sends back for one command.
pub enum MockReply {
    /// A bare status line, e.g. `200- OK`.
    Status(&'static str),
    /// `202`, the given lines, and the terminator.
    Multiline(Vec<String>),
    /// `203` followed by raw bytes.
    Binary(Vec<u8>),
    /// Raw bytes, verbatim.
    Raw(Vec<u8>),
    /// `204`, then read the `length=`-declared payload and answer `200`.
    AcceptUpload,
    /// Say nothing.
    Silence,
}

type Responder = Box<dyn FnMut(&str, &MockShared) -> MockReply + Send>;

#[derive(Default)]
pub struct MockShared {
    /// Every command line received, in order.
    pub commands: Mutex<Vec<String>>,
    /// Sparse target memory backing `getmem2`/`setmem`.
    pub memory: Mutex<BTreeMap<u32, u8>>,
    /// The reverse notification connection, once `notifyat` has run.
    pub notify_stream: Mutex<Option<TcpStream>>,
    /// Binary payloads received via `AcceptUpload`, with their commands.
    pub uploads: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockShared {
    pub fn poke(&self, address: u32, bytes: &[u8]) {
        let mut memory = self.memory.lock();
        for (offset, &byte) in bytes.iter().enumerate() {
            memory.insert(address + offset as u32, byte);
        }
    }

    pub fn peek(&self, address: u32, length: u32) -> Vec<u8> {
        let memory = self.memory.lock();
        (0..length)
            .map(|offset| memory.get(&(address + offset)).copied().unwrap_or(0))
            .collect()
    }

    /// Pushes one notification line at the bridge.
    pub fn notify(&self, line: &str) {
        let mut stream = self.notify_stream.lock();
        let stream = stream.as_mut().expect("notification channel not open");
        stream
            .write_all(format!("{line}\r\n").as_bytes())
            .expect("notification write");
    }

    pub fn has_notification_channel(&self) -> bool {
        self.notify_stream.lock().is_some()
    }

    /// All received commands whose line starts with `prefix`.
    pub fn commands_matching(&self, prefix: &str) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .cloned()
            .collect()
    }
}

pub struct MockXbdm {
    pub endpoint: Endpoint,
    pub shared: Arc<MockShared>,
    responders: Arc<Mutex<Vec<(String, Responder)>>>,
}

impl MockXbdm {
    /// Starts the mock with the standard responder set.
    pub fn start() -> MockXbdm {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .expect("mock bind");
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(MockShared::default());
        let responders: Arc<Mutex<Vec<(String, Responder)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let mock = MockXbdm {
            endpoint: Endpoint::new(Ipv4Addr::LOCALHOST, port),
            shared: shared.clone(),
            responders: responders.clone(),
        };
        mock.install_default_responders();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let shared = shared.clone();
                let responders = responders.clone();
                std::thread::spawn(move || serve_connection(stream, shared, responders));
            }
        });
        mock
    }

    /// Installs (or overrides) the responder for commands starting with
    /// `prefix`. Later registrations win on equal-length prefixes; the
    /// longest matching prefix always wins.
    pub fn respond(
        &self,
        prefix: &str,
        responder: impl FnMut(&str, &MockShared) -> MockReply + Send + 'static,
    ) {
        self.responders
            .lock()
            .push((prefix.to_owned(), Box::new(responder)));
    }

    pub fn respond_status(&self, prefix: &str, status: &'static str) {
        self.respond(prefix, move |_, _| MockReply::Status(status));
    }

    fn install_default_responders(&self) {
        self.respond_status("debugger", "200- OK");
        self.respond_status("stopon", "200- OK");
        self.respond_status("nostopon", "200- OK");
        self.respond_status("break", "200- OK");
        self.respond_status("continue", "200- OK");
        self.respond_status("go", "200- OK");
        self.respond_status("stop", "200- OK");
        self.respond_status("halt", "200- OK");
        self.respond_status("suspend", "200- OK");
        self.respond_status("resume", "200- OK");
        self.respond_status("setcontext", "200- OK");
        self.respond_status("title", "200- OK");
        self.respond("threads", |_, _| {
            MockReply::Multiline(vec!["1".to_owned()])
        });
        self.respond("threadinfo", |_, _| {
            MockReply::Multiline(vec![
                "suspend=0 priority=8 tlsbase=0x0 start=0x10000 base=0xd0000000 limit=0xd0010000 createlo=0x0 createhi=0x0"
                    .to_owned(),
            ])
        });
        self.respond("modules", |_, _| {
            MockReply::Multiline(vec![
                "name=\"xbdm.dll\" base=0xb0000000 size=0x12000 check=0xaabb timestamp=0x3f8a0000 tls"
                    .to_owned(),
                "name=\"default.xbe\" base=0x10000 size=0x20000 xbe".to_owned(),
            ])
        });
        self.respond_status("modsections", "402- file not found");
        self.respond("walkmem", |_, _| {
            MockReply::Multiline(vec![
                "base=0x10000 size=0x20000 protect=0x4".to_owned(),
                "base=0xb0000000 size=0x12000 protect=0x2".to_owned(),
            ])
        });
        self.respond("getcontext", |_, _| {
            MockReply::Multiline(vec![
                "Eax=0x1 Ebx=0x2 Ecx=0x3 Edx=0x4 Esi=0x5 Edi=0x6 Ebp=0xd000f000 Esp=0xd000e000 Eip=0x80041000 EFlags=0x246"
                    .to_owned(),
            ])
        });
        self.respond("getmem2", |line, shared| {
            let (address, length) = parse_addr_length(line);
            MockReply::Binary(shared.peek(address, length))
        });
        self.respond("setmem", |line, shared| {
            if let Some((address, data)) = parse_setmem(line) {
                shared.poke(address, &data);
            }
            MockReply::Status("200- OK")
        });
        self.respond("isstopped", |_, _| MockReply::Status("408- not stopped"));
    }
}

fn serve_connection(
    stream: TcpStream,
    shared: Arc<MockShared>,
    responders: Arc<Mutex<Vec<(String, Responder)>>>,
) {
    let mut writer = stream.try_clone().expect("mock stream clone");
    writer.write_all(b"201- connected\r\n").expect("greeting");

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end_matches(['\r', '\n']).to_owned();
        if command.is_empty() {
            continue;
        }
        shared.commands.lock().push(command.clone());

        if let Some(rest) = command.strip_prefix("notifyat port=") {
            let port_text = rest.split_whitespace().next().unwrap_or("");
            let port = parse_number(port_text).unwrap_or(0) as u16;
            if command.contains(" drop") {
                shared.notify_stream.lock().take();
            } else {
                let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
                    .expect("reverse notification connect");
                stream.write_all(b"hello\r\n").expect("hello");
                *shared.notify_stream.lock() = Some(stream);
            }
            writer.write_all(b"200- OK\r\n").expect("notifyat reply");
            continue;
        }

        let reply = {
            let mut responders = responders.lock();
            let best = responders
                .iter_mut()
                .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            match best {
                Some((_, responder)) => responder(&command, &shared),
                None => MockReply::Status("407- unknown command"),
            }
        };

        let bytes = match reply {
            MockReply::Status(status) => format!("{status}\r\n").into_bytes(),
            MockReply::Multiline(lines) => {
                let mut out = b"202- multiline response follows\r\n".to_vec();
                for line in lines {
                    out.extend_from_slice(line.as_bytes());
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(b".\r\n");
                out
            }
            MockReply::Binary(data) => {
                let mut out = b"203- binary response follows\r\n".to_vec();
                out.extend_from_slice(&data);
                out
            }
            MockReply::Raw(data) => data,
            MockReply::AcceptUpload => {
                writer
                    .write_all(b"204- send binary data\r\n")
                    .expect("204 reply");
                let length = parse_key(&command, "length").unwrap_or(0) as usize;
                let mut payload = vec![0u8; length];
                if reader.read_exact(&mut payload).is_err() {
                    return;
                }
                shared.uploads.lock().push((command.clone(), payload));
                b"200- OK\r\n".to_vec()
            }
            MockReply::Silence => continue,
        };
        if writer.write_all(&bytes).is_err() {
            return;
        }
    }
}

fn parse_number(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_key(line: &str, key: &str) -> Option<u32> {
    line.split_whitespace().find_map(|token| {
        let (token_key, value) = token.split_once('=')?;
        if token_key.eq_ignore_ascii_case(key) {
            parse_number(value)
        } else {
            None
        }
    })
}

fn parse_addr_length(line: &str) -> (u32, u32) {
    (
        parse_key(line, "addr").unwrap_or(0),
        parse_key(line, "length").unwrap_or(0),
    )
}

fn parse_setmem(line: &str) -> Option<(u32, Vec<u8>)> {
    let address = parse_key(line, "addr")?;
    let data_text = line.split_whitespace().find_map(|token| {
        token
            .split_once('=')
            .filter(|(key, _)| key.eq_ignore_ascii_case("data"))
            .map(|(_, value)| value)
    })?;
    let mut data = Vec::with_capacity(data_text.len() / 2);
    let bytes = data_text.as_bytes();
    for pair in bytes.chunks(2) {
        let text = std::str::from_utf8(pair).ok()?;
        data.push(u8::from_str_radix(text, 16).ok()?);
    }
    Some((address, data))
}

/// Polls `condition` until it holds or the timeout expires.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
