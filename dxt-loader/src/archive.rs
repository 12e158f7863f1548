//! Unix `ar` archive splitting.
//!
//! The original Xbox toolchain bundles COFF objects into thin `ar` archives.
//! Only three member layouts occur in practice: the symbol lookup table
//! (ignored here), the SysV extended-filename table, and ordinary file
//! members, with BSD `#1/<len>` inline long names as a variant of the latter.

use std::collections::BTreeMap;

use crate::LoaderError;

const SIGNATURE: &[u8; 8] = b"!<arch>\n";
const HEADER_LEN: usize = 60;
const MEMBER_MAGIC: &[u8; 2] = b"\x60\x0a";

/// What role an archive member plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// The symbol lookup table (`/` or `__.SYMDEF*`). Not needed for loading.
    SymbolTable,
    /// The SysV extended-filename table (`//`).
    ExtendedNames,
    /// An ordinary file member, normally a COFF object.
    File,
}

/// A single member of an `ar` archive, borrowing its body from the input.
#[derive(Debug)]
pub struct ArchiveMember<'data> {
    /// The member's filename with archive padding and name-table indirection
    /// already resolved.
    pub name: String,
    /// Role of this member.
    pub kind: MemberKind,
    /// Modification timestamp, as recorded in the header.
    pub mtime: u64,
    /// The member body.
    pub data: &'data [u8],
}

/// Splits `bytes` into archive members, resolving extended filenames.
pub fn members(bytes: &[u8]) -> Result<Vec<ArchiveMember<'_>>, LoaderError> {
    if bytes.len() < SIGNATURE.len() || &bytes[..SIGNATURE.len()] != SIGNATURE {
        return Err(LoaderError::BadSignature);
    }

    let mut offset = SIGNATURE.len();
    let mut extended_names: Option<BTreeMap<u32, String>> = None;
    let mut result = Vec::new();

    while offset < bytes.len() {
        let header_offset = offset;
        let header = bytes
            .get(offset..offset + HEADER_LEN)
            .ok_or(LoaderError::Truncated(offset))?;
        offset += HEADER_LEN;

        if &header[58..60] != MEMBER_MAGIC {
            return Err(LoaderError::BadMemberHeader {
                offset: header_offset,
                reason: "bad terminator",
            });
        }

        let mut name = trimmed_field(&header[..16]).to_owned();
        let mtime = parse_decimal(&header[16..28]).unwrap_or(0);
        let size = parse_decimal(&header[48..58]).ok_or(LoaderError::BadMemberHeader {
            offset: header_offset,
            reason: "non-numeric size",
        })? as usize;

        let mut data = bytes
            .get(offset..offset + size)
            .ok_or(LoaderError::Truncated(offset))?;
        offset += size;

        // Odd-sized bodies are followed by a single newline alignment byte.
        if size % 2 == 1 && offset < bytes.len() {
            let pad = bytes[offset];
            if pad != b'\n' {
                return Err(LoaderError::BadPadding(pad));
            }
            offset += 1;
        }

        let kind = if name == "/" || name.starts_with("__.SYMDEF") {
            MemberKind::SymbolTable
        } else if name == "//" {
            extended_names = Some(parse_extended_names(data));
            MemberKind::ExtendedNames
        } else {
            if let Some(reference) = name.strip_prefix('/') {
                // "/<decimal>" references a byte offset in the "//" table.
                if let Ok(table_offset) = reference.parse::<u32>() {
                    let table = extended_names.as_ref();
                    name = table
                        .and_then(|t| t.get(&table_offset))
                        .ok_or(LoaderError::BadExtendedName(table_offset))?
                        .clone();
                }
            } else if let Some(len_str) = name.strip_prefix("#1/") {
                // BSD style: the first <len> body bytes are the real name.
                let len = len_str.parse::<usize>().map_err(|_| {
                    LoaderError::BadMemberHeader {
                        offset: header_offset,
                        reason: "non-numeric BSD name length",
                    }
                })?;
                let name_bytes = data.get(..len).ok_or(LoaderError::Truncated(offset))?;
                name = String::from_utf8_lossy(name_bytes)
                    .trim_end_matches('\0')
                    .to_owned();
                data = &data[len..];
            }
            MemberKind::File
        };

        result.push(ArchiveMember {
            name,
            kind,
            mtime,
            data,
        });
    }

    Ok(result)
}

/// Returns the field with trailing ASCII space padding removed.
fn trimmed_field(field: &[u8]) -> &str {
    let end = field
        .iter()
        .rposition(|&b| b != b' ')
        .map(|p| p + 1)
        .unwrap_or(0);
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

fn parse_decimal(field: &[u8]) -> Option<u64> {
    let text = trimmed_field(field);
    if text.is_empty() {
        return None;
    }
    text.parse().ok()
}

/// The "//" member is a flat list of `\n`-separated names, referenced by byte
/// offset. GNU ar terminates each name with `/`, which is stripped here.
fn parse_extended_names(table: &[u8]) -> BTreeMap<u32, String> {
    let mut names = BTreeMap::new();
    let mut start = 0usize;
    while start < table.len() {
        while start < table.len() && table[start] == b'\n' {
            start += 1;
        }
        if start >= table.len() {
            break;
        }
        let end = table[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| start + p)
            .unwrap_or(table.len());
        let name = String::from_utf8_lossy(&table[start..end]);
        let name = name.trim_end_matches('/').to_owned();
        names.insert(start as u32, name);
        start = end + 1;
    }
    names
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn header(name: &str, size: usize) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(format!("{name:<16}").as_bytes());
        h.extend_from_slice(format!("{:<12}", 0).as_bytes());
        h.extend_from_slice(format!("{:<6}", 0).as_bytes());
        h.extend_from_slice(format!("{:<6}", 0).as_bytes());
        h.extend_from_slice(format!("{:<8}", "100644").as_bytes());
        h.extend_from_slice(format!("{size:<10}").as_bytes());
        h.extend_from_slice(MEMBER_MAGIC);
        assert_eq!(h.len(), HEADER_LEN);
        h
    }

    fn archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = SIGNATURE.to_vec();
        for (name, body) in members {
            out.extend_from_slice(&header(name, body.len()));
            out.extend_from_slice(body);
            if body.len() % 2 == 1 {
                out.push(b'\n');
            }
        }
        out
    }

    #[test]
    fn splits_simple_members() {
        let bytes = archive(&[("a.obj", b"AAAA"), ("b.obj", b"BBB")]);
        let members = members(&bytes).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "a.obj");
        assert_eq!(members[0].data, b"AAAA");
        assert_eq!(members[1].name, "b.obj");
        assert_eq!(members[1].data, b"BBB");
    }

    #[test]
    fn skips_symbol_table_members() {
        let bytes = archive(&[("/", b"\x00\x00\x00\x00"), ("a.obj", b"AA")]);
        let members = members(&bytes).unwrap();
        assert_eq!(members[0].kind, MemberKind::SymbolTable);
        assert_eq!(members[1].kind, MemberKind::File);
    }

    #[test]
    fn resolves_extended_filenames() {
        let table = b"a_name_longer_than_sixteen.obj/\nanother_long_name.obj/\n";
        let bytes = archive(&[("//", table), ("/0", b"AA"), ("/32", b"BB")]);
        let members = members(&bytes).unwrap();
        assert_eq!(members[1].name, "a_name_longer_than_sixteen.obj");
        assert_eq!(members[2].name, "another_long_name.obj");
    }

    #[test]
    fn unknown_extended_offset_is_an_error() {
        let bytes = archive(&[("//", b"x.obj/\n"), ("/99", b"AA")]);
        assert!(matches!(
            members(&bytes),
            Err(LoaderError::BadExtendedName(99))
        ));
    }

    #[test]
    fn bsd_inline_name_shrinks_the_body() {
        let mut body = b"inline_name.obj".to_vec();
        body.extend_from_slice(b"PAYLOAD!");
        let bytes = archive(&[("#1/15", &body)]);
        let members = members(&bytes).unwrap();
        assert_eq!(members[0].name, "inline_name.obj");
        assert_eq!(members[0].data, b"PAYLOAD!");
    }

    #[test]
    fn rejects_bad_signature() {
        assert!(matches!(
            members(b"!<arch>X"),
            Err(LoaderError::BadSignature)
        ));
    }

    #[test]
    fn rejects_bad_padding() {
        let mut bytes = archive(&[("a.obj", b"AAA")]);
        let last = bytes.len() - 1;
        bytes[last] = b'X';
        // Padding is only checked when another member could follow.
        bytes.extend_from_slice(&header("b.obj", 0));
        assert!(matches!(members(&bytes), Err(LoaderError::BadPadding(_))));
    }
}
