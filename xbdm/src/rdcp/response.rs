use crate::rdcp::Status;
use crate::util::{parse_i32, parse_u32};

/// A fully received RDCP response: the status line plus whatever body the
/// status implied.
#[derive(Debug, Clone)]
pub struct RdcpResponse {
    /// Parsed status code.
    pub status: Status,
    /// The human-readable text after the `NNN- ` prefix.
    pub message: String,
    /// Multiline or binary body, empty for status-only responses.
    pub data: Vec<u8>,
}

impl RdcpResponse {
    /// A body-less response.
    pub fn status_only(status: Status, message: impl Into<String>) -> RdcpResponse {
        RdcpResponse {
            status,
            message: message.into(),
            data: Vec::new(),
        }
    }
}

/// A multiline response body split into its CRLF-delimited lines.
#[derive(Debug, Clone)]
pub struct MultilineResponse {
    /// The body lines, in order, without terminators.
    pub lines: Vec<String>,
}

impl MultilineResponse {
    /// Splits `data` on CRLF boundaries.
    pub fn parse(data: &[u8]) -> MultilineResponse {
        MultilineResponse {
            lines: split_lines(data)
                .map(|line| String::from_utf8_lossy(line).into_owned())
                .collect(),
        }
    }
}

/// A `key=value` response body.
///
/// Keys are matched case-insensitively. A key may appear without a value (a
/// flag), and values may be decimal, `0x` hex, or quoted strings.
#[derive(Debug, Clone, Default)]
pub struct MapResponse {
    entries: Vec<(String, Option<String>)>,
}

impl MapResponse {
    /// Parses one line of `key=value` pairs.
    pub fn parse(data: &[u8]) -> MapResponse {
        let text = String::from_utf8_lossy(data);
        let mut entries = Vec::new();
        let mut chars = text.chars().peekable();

        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                chars.next();
                continue;
            }

            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' || c.is_whitespace() {
                    break;
                }
                key.push(c);
                chars.next();
            }

            let value = if chars.peek() == Some(&'=') {
                chars.next();
                if chars.peek() == Some(&'"') {
                    chars.next();
                    let mut value = String::new();
                    for c in chars.by_ref() {
                        if c == '"' {
                            break;
                        }
                        value.push(c);
                    }
                    Some(value)
                } else {
                    let mut value = String::new();
                    while let Some(&c) = chars.peek() {
                        if c.is_whitespace() {
                            break;
                        }
                        value.push(c);
                        chars.next();
                    }
                    Some(value)
                }
            } else {
                None
            };

            if !key.is_empty() {
                entries.push((key.to_ascii_lowercase(), value));
            }
        }

        MapResponse { entries }
    }

    /// Whether `key` is present at all, value-less flags included.
    pub fn has_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.entries.iter().any(|(k, _)| *k == key)
    }

    /// The raw string value for `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// The value for `key` parsed as decimal or `0x` hex.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get_str(key).and_then(parse_u32)
    }

    /// Signed variant of [`MapResponse::get_u32`].
    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get_str(key).and_then(parse_i32)
    }

    /// Reassembles a 64-bit value split across `low_key`/`high_key`, the way
    /// XBDM reports timestamps.
    pub fn get_u64(&self, low_key: &str, high_key: &str) -> Option<u64> {
        let low = self.get_u32(low_key)?;
        let Some(high) = self.get_u32(high_key) else {
            tracing::warn!(low_key, high_key, "64-bit value missing its high half");
            return None;
        };
        Some((u64::from(high) << 32) | u64::from(low))
    }
}

/// An ordered sequence of [`MapResponse`] lines, as returned by `modules`,
/// `threads`, `walkmem`, and friends.
#[derive(Debug, Clone)]
pub struct MultiMapResponse {
    /// One parsed map per body line.
    pub maps: Vec<MapResponse>,
}

impl MultiMapResponse {
    /// Parses every line of the body as a map.
    pub fn parse(data: &[u8]) -> MultiMapResponse {
        MultiMapResponse {
            maps: split_lines(data).map(MapResponse::parse).collect(),
        }
    }
}

fn split_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_the_module_map_shape() {
        let body =
            b"name=\"xbdm.dll\" base=0xb0000000 size=0x12000 check=0xaabb timestamp=0x3f8a0000 tls";
        let map = MapResponse::parse(body);
        assert_eq!(map.get_str("name"), Some("xbdm.dll"));
        assert_eq!(map.get_u32("base"), Some(0xb000_0000));
        assert_eq!(map.get_u32("size"), Some(0x12000));
        assert_eq!(map.get_u32("check"), Some(0xaabb));
        assert_eq!(map.get_u32("timestamp"), Some(0x3f8a_0000));
        assert!(map.has_key("tls"));
        assert!(!map.has_key("xbe"));
    }

    #[test]
    fn keys_are_case_insensitive() {
        let map = MapResponse::parse(b"Addr=0x1000 THREAD=7");
        assert_eq!(map.get_u32("addr"), Some(0x1000));
        assert_eq!(map.get_u32("Thread"), Some(7));
    }

    #[test]
    fn quoted_values_may_contain_whitespace() {
        let map = MapResponse::parse(b"message=\"assertion failed: x > 0\" thread=3");
        assert_eq!(map.get_str("message"), Some("assertion failed: x > 0"));
        assert_eq!(map.get_u32("thread"), Some(3));
    }

    #[test]
    fn decimal_values_parse_without_prefix() {
        let map = MapResponse::parse(b"priority=12 suspend=0");
        assert_eq!(map.get_i32("priority"), Some(12));
        assert_eq!(map.get_u32("suspend"), Some(0));
    }

    #[test]
    fn sixty_four_bit_pairs_reassemble() {
        let map = MapResponse::parse(b"createlo=0x11223344 createhi=0x1");
        assert_eq!(map.get_u64("createlo", "createhi"), Some(0x1_1122_3344));
    }

    #[test]
    fn every_declared_pair_is_retrievable() {
        let body = b"alpha=1 beta=0x2 gamma=\"three\" delta";
        let map = MapResponse::parse(body);
        assert_eq!(map.get_u32("alpha"), Some(1));
        assert_eq!(map.get_u32("beta"), Some(2));
        assert_eq!(map.get_str("gamma"), Some("three"));
        assert!(map.has_key("delta"));
        assert_eq!(map.get_str("delta"), None);
    }

    #[test]
    fn multimap_splits_lines() {
        let body = b"base=0x10000 size=0x1000\r\nbase=0x20000 size=0x2000";
        let maps = MultiMapResponse::parse(body).maps;
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].get_u32("base"), Some(0x10000));
        assert_eq!(maps[1].get_u32("size"), Some(0x2000));
    }

    #[test]
    fn multiline_keeps_line_order() {
        let lines = MultilineResponse::parse(b"first\r\nsecond\r\nthird").lines;
        assert_eq!(lines, vec!["first", "second", "third"]);
    }
}
