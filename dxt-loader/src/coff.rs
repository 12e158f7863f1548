//! i386 COFF object parsing.

use scroll::Pread;

use crate::LoaderError;

const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
const IMAGE_FILE_RELOCS_STRIPPED: u16 = 0x0001;

const FILE_HEADER_LEN: usize = 20;
const SECTION_HEADER_LEN: usize = 40;
const SYMBOL_ENTRY_LEN: usize = 18;
const RELOCATION_LEN: usize = 10;

/// Special values of a symbol's section number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolSection {
    /// `IMAGE_SYM_UNDEFINED`: the symbol must be resolved by the host.
    Undefined,
    /// `IMAGE_SYM_ABSOLUTE`: the value is the address.
    Absolute,
    /// `IMAGE_SYM_DEBUG`: debug-only, skipped during resolution.
    Debug,
    /// A zero-based index into the object's section list.
    Section(usize),
}

bitflags::bitflags! {
    /// COFF section characteristics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        const CNT_CODE = 0x0000_0020;
        const CNT_INITIALIZED_DATA = 0x0000_0040;
        const CNT_UNINITIALIZED_DATA = 0x0000_0080;
        const LNK_INFO = 0x0000_0200;
        const LNK_REMOVE = 0x0000_0800;
        const GPREL = 0x0000_8000;
        const LNK_NRELOC_OVFL = 0x0100_0000;
        const MEM_DISCARDABLE = 0x0200_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}

const ALIGN_MASK: u32 = 0x00F0_0000;
const ALIGN_SHIFT: u32 = 20;

/// i386 relocation types this loader understands.
///
/// Anything else is a hard error at relocation time rather than a silent
/// success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationType {
    /// `IMAGE_REL_I386_DIR32` (0x06): 32-bit absolute address.
    Dir32,
    /// `IMAGE_REL_I386_REL32` (0x14): 32-bit PC-relative displacement.
    Rel32,
    /// Any other type, preserved for diagnostics.
    Unsupported(u16),
}

impl From<u16> for RelocationType {
    fn from(raw: u16) -> Self {
        match raw {
            0x06 => RelocationType::Dir32,
            0x14 => RelocationType::Rel32,
            other => RelocationType::Unsupported(other),
        }
    }
}

/// A single relocation record within a section.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    /// Offset of the patch site within the section body.
    pub offset: u32,
    /// Index into the object's symbol table.
    pub symbol_index: u32,
    /// The relocation kind.
    pub kind: RelocationType,
}

/// A section of a parsed COFF object.
#[derive(Debug, Clone)]
pub struct CoffSection {
    /// Section name, with string-table indirection already applied.
    pub name: String,
    /// Raw characteristics bitmap.
    pub flags: SectionFlags,
    /// Required alignment in bytes.
    pub alignment: u32,
    /// The section body. Uninitialized-data sections are zero-filled.
    pub body: Vec<u8>,
    /// Relocations to apply against this body.
    pub relocations: Vec<Relocation>,
    /// Target virtual address, assigned during layout. Zero until then.
    pub virtual_address: u32,
}

impl CoffSection {
    /// Whether this section contributes bytes to the loaded image.
    pub fn is_loadable(&self) -> bool {
        !self.flags.contains(SectionFlags::LNK_REMOVE) && !self.body.is_empty()
    }

    /// Whether the section holds executable code.
    pub fn is_executable(&self) -> bool {
        self.flags.contains(SectionFlags::MEM_EXECUTE)
    }

    /// Whether the section is writable once loaded.
    pub fn is_writable(&self) -> bool {
        self.flags.contains(SectionFlags::MEM_WRITE)
    }
}

/// A symbol table entry.
#[derive(Debug, Clone)]
pub struct CoffSymbol {
    /// Symbol name, with string-table indirection already applied.
    pub name: String,
    /// Raw value field; meaning depends on the section number.
    pub value: u32,
    /// Which section (or special class) the symbol belongs to.
    pub section: SymbolSection,
    /// COFF storage class byte.
    pub storage_class: u8,
    /// True for auxiliary entries that trail another symbol.
    pub auxiliary: bool,
}

const IMAGE_SYM_CLASS_EXTERNAL: u8 = 2;

impl CoffSymbol {
    /// Whether the symbol is an externally visible definition.
    pub fn is_global_definition(&self) -> bool {
        !self.auxiliary
            && self.storage_class == IMAGE_SYM_CLASS_EXTERNAL
            && matches!(self.section, SymbolSection::Section(_))
    }

    /// Whether the symbol is an import left for the host to resolve.
    pub fn is_import(&self) -> bool {
        !self.auxiliary && self.section == SymbolSection::Undefined
    }
}

/// A fully parsed COFF object file.
#[derive(Debug)]
pub struct CoffObject {
    /// Name of the archive member this object came from.
    pub name: String,
    /// Parsed sections, in file order.
    pub sections: Vec<CoffSection>,
    /// The symbol table, with auxiliary entries kept in place so relocation
    /// indices stay valid.
    pub symbols: Vec<CoffSymbol>,
}

impl CoffObject {
    /// Parses one COFF object from `data`.
    ///
    /// Objects that were not built for i386, or that had their relocation
    /// information stripped, are rejected outright.
    pub fn parse(name: &str, data: &[u8]) -> Result<Self, LoaderError> {
        let machine: u16 = data.pread_with(0, scroll::LE)?;
        if machine != IMAGE_FILE_MACHINE_I386 {
            return Err(LoaderError::UnsupportedMachine {
                name: name.to_owned(),
                machine,
            });
        }

        let section_count: u16 = data.pread_with(2, scroll::LE)?;
        let symbol_table_offset: u32 = data.pread_with(8, scroll::LE)?;
        let symbol_count: u32 = data.pread_with(12, scroll::LE)?;
        let characteristics: u16 = data.pread_with(18, scroll::LE)?;

        if characteristics & IMAGE_FILE_RELOCS_STRIPPED != 0 {
            return Err(LoaderError::RelocationsStripped(name.to_owned()));
        }

        let string_table = read_string_table(data, symbol_table_offset, symbol_count)?;

        let mut sections = Vec::with_capacity(section_count as usize);
        for index in 0..section_count as usize {
            let offset = FILE_HEADER_LEN + index * SECTION_HEADER_LEN;
            sections.push(parse_section(name, data, offset, &string_table)?);
        }

        let symbols = if symbol_table_offset != 0 {
            parse_symbols(data, symbol_table_offset, symbol_count, &string_table)?
        } else {
            Vec::new()
        };

        Ok(CoffObject {
            name: name.to_owned(),
            sections,
            symbols,
        })
    }
}

fn parse_section(
    object_name: &str,
    data: &[u8],
    offset: usize,
    string_table: &StringTable<'_>,
) -> Result<CoffSection, LoaderError> {
    let raw_name: &[u8] = data
        .get(offset..offset + 8)
        .ok_or(LoaderError::Truncated(offset))?;
    let size_of_raw_data: u32 = data.pread_with(offset + 16, scroll::LE)?;
    let pointer_to_raw_data: u32 = data.pread_with(offset + 20, scroll::LE)?;
    let pointer_to_relocations: u32 = data.pread_with(offset + 24, scroll::LE)?;
    let relocation_count: u16 = data.pread_with(offset + 32, scroll::LE)?;
    let characteristics: u32 = data.pread_with(offset + 36, scroll::LE)?;

    let flags = SectionFlags::from_bits_retain(characteristics);

    let name = section_name(raw_name, string_table)?;

    if flags.contains(SectionFlags::LNK_INFO) || flags.contains(SectionFlags::LNK_NRELOC_OVFL) {
        return Err(LoaderError::UnsupportedSection {
            section: name,
            object: object_name.to_owned(),
        });
    }

    // The alignment field is a 4-bit log2, biased by one.
    let align_field = (characteristics & ALIGN_MASK) >> ALIGN_SHIFT;
    let alignment = if align_field == 0 {
        1
    } else {
        1u32 << (align_field - 1)
    };

    let body = if flags.contains(SectionFlags::LNK_REMOVE) {
        Vec::new()
    } else if flags.contains(SectionFlags::CNT_UNINITIALIZED_DATA) || pointer_to_raw_data == 0 {
        vec![0; size_of_raw_data as usize]
    } else {
        let start = pointer_to_raw_data as usize;
        let end = start + size_of_raw_data as usize;
        data.get(start..end)
            .ok_or(LoaderError::Truncated(start))?
            .to_vec()
    };

    let mut relocations = Vec::with_capacity(relocation_count as usize);
    for index in 0..relocation_count as usize {
        let reloc_offset = pointer_to_relocations as usize + index * RELOCATION_LEN;
        let patch_offset: u32 = data.pread_with(reloc_offset, scroll::LE)?;
        let symbol_index: u32 = data.pread_with(reloc_offset + 4, scroll::LE)?;
        let raw_type: u16 = data.pread_with(reloc_offset + 8, scroll::LE)?;
        relocations.push(Relocation {
            offset: patch_offset,
            symbol_index,
            kind: RelocationType::from(raw_type),
        });
    }

    Ok(CoffSection {
        name,
        flags,
        alignment,
        body,
        relocations,
        virtual_address: 0,
    })
}

fn parse_symbols(
    data: &[u8],
    table_offset: u32,
    count: u32,
    string_table: &StringTable<'_>,
) -> Result<Vec<CoffSymbol>, LoaderError> {
    let mut symbols = Vec::with_capacity(count as usize);
    let mut index = 0u32;
    while index < count {
        let offset = table_offset as usize + index as usize * SYMBOL_ENTRY_LEN;
        let name_field: &[u8] = data
            .get(offset..offset + 8)
            .ok_or(LoaderError::Truncated(offset))?;
        let value: u32 = data.pread_with(offset + 8, scroll::LE)?;
        let section_number: i16 = data.pread_with(offset + 12, scroll::LE)?;
        let storage_class: u8 = data.pread_with(offset + 16, scroll::LE)?;
        let aux_count: u8 = data.pread_with(offset + 17, scroll::LE)?;

        let name = symbol_name(name_field, string_table)?;
        let section = match section_number {
            0 => SymbolSection::Undefined,
            -1 => SymbolSection::Absolute,
            -2 => SymbolSection::Debug,
            n if n > 0 => SymbolSection::Section(n as usize - 1),
            other => {
                return Err(LoaderError::BadSectionNumber {
                    symbol: name,
                    section: other as i32,
                })
            }
        };

        symbols.push(CoffSymbol {
            name: name.clone(),
            value,
            section,
            storage_class,
            auxiliary: false,
        });

        // Auxiliary entries belong to the preceding symbol. They are kept in
        // the table so relocation symbol indices remain valid.
        for aux in 0..aux_count {
            symbols.push(CoffSymbol {
                name: format!("{name}_aux{aux}"),
                value: 0,
                section: SymbolSection::Debug,
                storage_class: 0,
                auxiliary: true,
            });
        }
        index += 1 + u32::from(aux_count);
    }

    Ok(symbols)
}

/// The COFF string table follows the symbol table and is prefixed by its own
/// 32-bit size (which includes the prefix itself).
struct StringTable<'data> {
    data: &'data [u8],
}

impl<'data> StringTable<'data> {
    fn get(&self, offset: u32) -> Result<String, LoaderError> {
        let start = offset as usize;
        if start >= self.data.len() {
            return Err(LoaderError::BadStringOffset(offset));
        }
        let end = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(self.data.len());
        Ok(String::from_utf8_lossy(&self.data[start..end]).into_owned())
    }
}

fn read_string_table(
    data: &[u8],
    symbol_table_offset: u32,
    symbol_count: u32,
) -> Result<StringTable<'_>, LoaderError> {
    if symbol_table_offset == 0 {
        return Ok(StringTable { data: &[] });
    }
    let start = symbol_table_offset as usize + symbol_count as usize * SYMBOL_ENTRY_LEN;
    if start + 4 > data.len() {
        return Ok(StringTable { data: &[] });
    }
    let size: u32 = data.pread_with(start, scroll::LE)?;
    let end = (start + size as usize).min(data.len());
    // Offsets into the table are relative to the size prefix.
    Ok(StringTable {
        data: &data[start..end],
    })
}

fn symbol_name(
    name_field: &[u8],
    string_table: &StringTable<'_>,
) -> Result<String, LoaderError> {
    let zeroes = u32::from_le_bytes(name_field[..4].try_into().unwrap());
    if zeroes == 0 {
        let offset = u32::from_le_bytes(name_field[4..8].try_into().unwrap());
        string_table.get(offset)
    } else {
        let end = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_field.len());
        Ok(String::from_utf8_lossy(&name_field[..end]).into_owned())
    }
}

/// Section names beginning with `/` index into the string table just like
/// symbol long names.
fn section_name(
    raw_name: &[u8],
    string_table: &StringTable<'_>,
) -> Result<String, LoaderError> {
    let end = raw_name
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(raw_name.len());
    let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
    if let Some(reference) = name.strip_prefix('/') {
        if let Ok(offset) = reference.parse::<u32>() {
            return string_table.get(offset);
        }
    }
    Ok(name)
}
