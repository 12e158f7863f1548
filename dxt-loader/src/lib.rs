//! Parsing and relocation of XBDM debug-extension images.
//!
//! Extensions for the Xbox Debug Monitor ship as Unix `ar` archives of i386
//! COFF objects (the `.lib` output of the original Xbox toolchain). This crate
//! turns such an archive into a set of loadable section images:
//!
//! 1. [`DxtLibrary::parse`] splits the archive and parses every COFF member.
//! 2. [`DxtImage::layout`] assigns target virtual addresses to all loadable
//!    sections, starting from a base supplied by the caller.
//! 3. [`DxtImage::resolve_symbols`] resolves every symbol, calling back into
//!    the host for imports the objects leave undefined.
//! 4. [`DxtImage::relocate`] applies the i386 relocations, after which each
//!    section body is ready to be copied to the target verbatim.
//!
//! The crate knows nothing about the wire protocol used to ship the bytes;
//! that lives with the caller.

mod archive;
mod coff;
mod image;

pub use archive::{ArchiveMember, MemberKind};
pub use coff::{
    CoffObject, CoffSection, CoffSymbol, Relocation, RelocationType, SectionFlags, SymbolSection,
};
pub use image::{DxtImage, DxtLibrary, LoadableSection};

/// Errors raised while parsing or relocating an extension image.
#[derive(thiserror::Error, Debug)]
pub enum LoaderError {
    /// The input ended before a complete structure could be read.
    #[error("input truncated at offset {0:#x}")]
    Truncated(usize),
    /// The archive does not start with the `!<arch>\n` signature.
    #[error("bad archive signature")]
    BadSignature,
    /// An archive member header field could not be parsed.
    #[error("malformed archive member header at offset {offset:#x}: {reason}")]
    BadMemberHeader {
        /// Offset of the offending header within the archive.
        offset: usize,
        /// Which field was malformed.
        reason: &'static str,
    },
    /// The alignment byte between archive members was not `\n`.
    #[error("bad archive padding byte {0:#04x}")]
    BadPadding(u8),
    /// An extended-filename reference did not resolve.
    #[error("extended filename offset {0} not present in the name table")]
    BadExtendedName(u32),
    /// The object was not built for i386.
    #[error("object `{name}` targets machine {machine:#06x}, not i386")]
    UnsupportedMachine {
        /// Archive member name.
        name: String,
        /// COFF machine field.
        machine: u16,
    },
    /// The object had its relocation information stripped.
    #[error("object `{0}` has relocation info stripped and cannot be loaded")]
    RelocationsStripped(String),
    /// A section carries link flags this loader refuses to process.
    #[error("section `{section}` in `{object}` uses unsupported link flags")]
    UnsupportedSection {
        /// Section name.
        section: String,
        /// Archive member name.
        object: String,
    },
    /// A long-name offset points outside the COFF string table.
    #[error("string table offset {0:#x} is out of bounds")]
    BadStringOffset(u32),
    /// A symbol references a section index that does not exist.
    #[error("symbol `{symbol}` references invalid section {section}")]
    BadSectionNumber {
        /// Symbol name.
        symbol: String,
        /// The out-of-range one-based section number.
        section: i32,
    },
    /// A relocation names a symbol index outside the symbol table.
    #[error("relocation references invalid symbol index {0}")]
    BadSymbolIndex(u32),
    /// A relocation type this loader does not implement.
    #[error("unimplemented i386 relocation type {0:#06x}")]
    UnimplementedRelocation(u16),
    /// An undefined symbol could not be resolved by the host.
    #[error("unresolved import `{0}`")]
    UnresolvedImport(String),
    /// Addresses have not been assigned yet.
    #[error("image has not been laid out")]
    NotLaidOut,
    /// Low-level read failure from the binary parser.
    #[error("malformed object data")]
    Parse(#[from] scroll::Error),
}
