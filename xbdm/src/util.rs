//! Small parsing and path helpers shared across the crate.

use crate::Error;

/// Parses a decimal or `0x`-prefixed hexadecimal unsigned integer, the way
/// XBDM renders numbers in map responses.
pub fn parse_u32(value: &str) -> Option<u32> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Signed variant of [`parse_u32`].
pub fn parse_i32(value: &str) -> Option<i32> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok().map(|v| v as i32)
    } else {
        value.parse().ok()
    }
}

/// Splits a title path into the directory and filename pair used by the
/// `title` command.
///
/// XBDM talks XFAT paths with backslash separators (`e:\games\halo\default.xbe`),
/// but callers routinely pass forward slashes. Both are accepted; the returned
/// directory uses backslashes and keeps its device prefix.
pub fn split_xbe_path(path: &str) -> Result<(String, String), Error> {
    let normalized = path.replace('/', "\\");
    let split = normalized
        .rfind('\\')
        .ok_or_else(|| Error::InvalidArgument(format!("`{path}` is not an XBE path")))?;
    let (dir, name) = normalized.split_at(split);
    let name = &name[1..];
    if name.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "`{path}` does not name an XBE file"
        )));
    }
    Ok((dir.to_owned(), name.to_owned()))
}

/// Quotes a value for an RDCP argument if it contains whitespace.
pub fn quote_arg(value: &str) -> String {
    if value.contains(char::is_whitespace) || value.is_empty() {
        format!("\"{value}\"")
    } else {
        value.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case("1234", Some(1234); "decimal")]
    #[test_case("0x10", Some(0x10); "hex")]
    #[test_case("0XaB", Some(0xab); "hex upper prefix")]
    #[test_case("  42 ", Some(42); "padded")]
    #[test_case("zebra", None; "garbage")]
    fn parses_numbers(input: &str, expected: Option<u32>) {
        assert_eq!(parse_u32(input), expected);
    }

    #[test]
    fn splits_backslash_paths() {
        let (dir, name) = split_xbe_path(r"e:\games\halo\default.xbe").unwrap();
        assert_eq!(dir, r"e:\games\halo");
        assert_eq!(name, "default.xbe");
    }

    #[test]
    fn normalizes_forward_slashes() {
        let (dir, name) = split_xbe_path("e:/demos/default.xbe").unwrap();
        assert_eq!(dir, r"e:\demos");
        assert_eq!(name, "default.xbe");
    }

    #[test]
    fn rejects_pathless_names() {
        assert!(split_xbe_path("default.xbe").is_err());
        assert!(split_xbe_path(r"e:\demos\").is_err());
    }

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg("with space"), "\"with space\"");
    }
}
