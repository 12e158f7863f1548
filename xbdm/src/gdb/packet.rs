//! GDB Remote Serial Protocol packet framing.

const LEADER: u8 = b'$';
const TRAILER: u8 = b'#';
const ESCAPE: u8 = b'}';

/// A single RSP packet, holding the unescaped body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GdbPacket {
    data: Vec<u8>,
}

/// Result of scanning a receive buffer for one packet.
#[derive(Debug)]
pub enum PacketScan {
    /// A complete frame was found. `valid` is false on checksum mismatch;
    /// the frame is consumed from the stream either way.
    Complete {
        packet: GdbPacket,
        consumed: usize,
        valid: bool,
    },
    /// No complete frame yet.
    Incomplete,
}

impl GdbPacket {
    /// A packet with the given unescaped body.
    pub fn new(body: impl Into<Vec<u8>>) -> GdbPacket {
        GdbPacket { data: body.into() }
    }

    /// The empty packet, used to answer any unsupported command.
    pub fn empty() -> GdbPacket {
        GdbPacket::default()
    }

    /// The synthetic packet representing an out-of-band interrupt byte.
    pub fn interrupt() -> GdbPacket {
        GdbPacket { data: vec![0x03] }
    }

    /// Whether this is the synthetic interrupt packet.
    pub fn is_interrupt(&self) -> bool {
        self.data == [0x03]
    }

    /// The unescaped body bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The body as text (RSP commands are ASCII).
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Frames the packet: `$<escaped body>#<checksum>`. The checksum covers
    /// the escaped form, exactly the bytes between `$` and `#`.
    pub fn serialize(&self) -> Vec<u8> {
        let escaped = escape(&self.data);
        let checksum = mod256_checksum(&escaped);
        let mut out = Vec::with_capacity(escaped.len() + 4);
        out.push(LEADER);
        out.extend_from_slice(&escaped);
        out.push(TRAILER);
        out.extend_from_slice(format!("{checksum:02x}").as_bytes());
        out
    }

    /// Scans `buffer` for the next frame. Bytes before the `$` leader are
    /// not consumed here; the transport strips acks and interrupts first.
    pub fn scan(buffer: &[u8]) -> PacketScan {
        let Some(start) = buffer.iter().position(|&b| b == LEADER) else {
            return PacketScan::Incomplete;
        };
        let body_start = start + 1;
        let Some(trailer) = buffer[body_start..]
            .iter()
            .position(|&b| b == TRAILER)
            .map(|p| body_start + p)
        else {
            return PacketScan::Incomplete;
        };
        if buffer.len() < trailer + 3 {
            return PacketScan::Incomplete;
        }

        let wire_body = &buffer[body_start..trailer];
        let checksum_text = std::str::from_utf8(&buffer[trailer + 1..trailer + 3]).ok();
        let sent_checksum = checksum_text.and_then(|text| u8::from_str_radix(text, 16).ok());
        let computed = mod256_checksum(wire_body);
        let valid = match sent_checksum {
            Some(sent) if sent == computed => true,
            Some(sent) => {
                tracing::error!(
                    computed,
                    sent,
                    body = %String::from_utf8_lossy(wire_body),
                    "checksum mismatch"
                );
                false
            }
            None => {
                tracing::error!("non-numeric checksum");
                false
            }
        };

        PacketScan::Complete {
            packet: GdbPacket {
                data: unescape(wire_body),
            },
            consumed: trailer + 3,
            valid,
        }
    }
}

/// Escapes `#`, `$`, and `}` as `}` followed by the byte XOR 0x20.
pub fn escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for &byte in body {
        if byte == LEADER || byte == TRAILER || byte == ESCAPE {
            out.push(ESCAPE);
            out.push(byte ^ 0x20);
        } else {
            out.push(byte);
        }
    }
    out
}

/// Reverses [`escape`]. A trailing lone `}` is dropped.
pub fn unescape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        if byte == ESCAPE {
            if let Some(&escaped) = bytes.next() {
                out.push(escaped ^ 0x20);
            }
        } else {
            out.push(byte);
        }
    }
    out
}

fn mod256_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ok_packet_matches_the_known_checksum() {
        assert_eq!(GdbPacket::new(&b"OK"[..]).serialize(), b"$OK#9a");
    }

    #[test]
    fn hash_in_body_is_escaped_and_checksummed_escaped() {
        let serialized = GdbPacket::new(&b"a#b"[..]).serialize();
        // 0x23 ^ 0x20 == 0x03.
        assert_eq!(&serialized[..6], b"$a}\x03b#");
        let checksum = u8::from_str_radix(
            std::str::from_utf8(&serialized[serialized.len() - 2..]).unwrap(),
            16,
        )
        .unwrap();
        let expected = b"a}\x03b".iter().fold(0u8, |s, &b| s.wrapping_add(b));
        assert_eq!(checksum, expected);
    }

    #[test]
    fn serialize_then_scan_round_trips() {
        for body in [&b"OK"[..], b"m4100,20", b"with } and $ and # inside", b""] {
            let wire = GdbPacket::new(body).serialize();
            match GdbPacket::scan(&wire) {
                PacketScan::Complete {
                    packet,
                    consumed,
                    valid,
                } => {
                    assert!(valid);
                    assert_eq!(consumed, wire.len());
                    assert_eq!(packet.data(), body);
                }
                PacketScan::Incomplete => panic!("packet did not scan"),
            }
        }
    }

    #[test]
    fn escape_unescape_round_trips() {
        let body = b"}}$$##}";
        assert_eq!(unescape(&escape(body)), body);
    }

    #[test]
    fn corrupt_checksum_is_flagged_but_consumed() {
        let mut wire = GdbPacket::new(&b"OK"[..]).serialize();
        let len = wire.len();
        wire[len - 1] = b'0';
        match GdbPacket::scan(&wire) {
            PacketScan::Complete {
                valid, consumed, ..
            } => {
                assert!(!valid);
                assert_eq!(consumed, wire.len());
            }
            PacketScan::Incomplete => panic!("frame should have been consumed"),
        }
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        assert!(matches!(GdbPacket::scan(b"$m41"), PacketScan::Incomplete));
        assert!(matches!(GdbPacket::scan(b"$m4100,20#e"), PacketScan::Incomplete));
    }
}
