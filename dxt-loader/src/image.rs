//! Section layout, symbol resolution, and relocation across a whole archive.

use std::collections::BTreeMap;

use crate::archive::{self, MemberKind};
use crate::coff::{CoffObject, CoffSection, RelocationType, SymbolSection};
use crate::LoaderError;

/// An `ar` archive parsed down to its COFF objects.
#[derive(Debug)]
pub struct DxtLibrary {
    /// The COFF objects in archive order. Symbol-table and name-table members
    /// have already been consumed.
    pub objects: Vec<CoffObject>,
}

impl DxtLibrary {
    /// Parses every COFF member of the archive at once.
    pub fn parse(bytes: &[u8]) -> Result<Self, LoaderError> {
        let mut objects = Vec::new();
        for member in archive::members(bytes)? {
            if member.kind != MemberKind::File {
                continue;
            }
            tracing::debug!(name = %member.name, size = member.data.len(), "parsing archive member");
            objects.push(CoffObject::parse(&member.name, member.data)?);
        }
        Ok(DxtLibrary { objects })
    }

    /// Treats a single raw COFF object as a one-member library.
    pub fn from_object(name: &str, bytes: &[u8]) -> Result<Self, LoaderError> {
        Ok(DxtLibrary {
            objects: vec![CoffObject::parse(name, bytes)?],
        })
    }

    /// Converts the library into a relocatable image.
    pub fn into_image(self) -> DxtImage {
        DxtImage::new(self.objects)
    }
}

/// A section that survived layout, with its assigned address.
#[derive(Debug)]
pub struct LoadableSection<'image> {
    /// Object and section indices, stable across the image's lifetime.
    pub object_index: usize,
    /// Index of the section within its object.
    pub section_index: usize,
    /// The section itself.
    pub section: &'image CoffSection,
}

/// The collected sections and symbols of an extension, moving through the
/// layout → resolve → relocate pipeline.
#[derive(Debug)]
pub struct DxtImage {
    objects: Vec<CoffObject>,
    /// Resolved address per symbol, parallel to each object's symbol table.
    resolved: Vec<Vec<u32>>,
    laid_out: bool,
}

impl DxtImage {
    fn new(objects: Vec<CoffObject>) -> Self {
        let resolved = objects
            .iter()
            .map(|object| vec![0u32; object.symbols.len()])
            .collect();
        DxtImage {
            objects,
            resolved,
            laid_out: false,
        }
    }

    /// Assigns a virtual address to every loadable section, packing them
    /// upward from `base` with each section's own alignment. Returns the
    /// total number of bytes the image occupies.
    pub fn layout(&mut self, base: u32) -> u32 {
        let mut cursor = base;
        for object in &mut self.objects {
            for section in &mut object.sections {
                if !section.is_loadable() {
                    continue;
                }
                cursor = align_up(cursor, section.alignment);
                section.virtual_address = cursor;
                cursor += section.body.len() as u32;
            }
        }
        self.laid_out = true;
        cursor - base
    }

    /// The names of all imports the objects leave undefined, deduplicated.
    pub fn extern_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .objects
            .iter()
            .flat_map(|object| object.symbols.iter())
            .filter(|symbol| symbol.is_import())
            .map(|symbol| symbol.name.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Computes the resolved address of every symbol.
    ///
    /// Undefined symbols are handed to `lookup`; returning `None` for any of
    /// them fails the whole load. Must run after [`DxtImage::layout`] so
    /// section-relative symbols have meaningful addresses.
    pub fn resolve_symbols(
        &mut self,
        mut lookup: impl FnMut(&str) -> Option<u32>,
    ) -> Result<(), LoaderError> {
        if !self.laid_out {
            return Err(LoaderError::NotLaidOut);
        }
        for (object, resolved) in self.objects.iter().zip(&mut self.resolved) {
            for (index, symbol) in object.symbols.iter().enumerate() {
                resolved[index] = match symbol.section {
                    SymbolSection::Debug => continue,
                    SymbolSection::Absolute => symbol.value,
                    SymbolSection::Undefined => {
                        if symbol.auxiliary {
                            continue;
                        }
                        lookup(&symbol.name)
                            .ok_or_else(|| LoaderError::UnresolvedImport(symbol.name.clone()))?
                    }
                    SymbolSection::Section(section_index) => {
                        let section = object.sections.get(section_index).ok_or_else(|| {
                            LoaderError::BadSectionNumber {
                                symbol: symbol.name.clone(),
                                section: section_index as i32 + 1,
                            }
                        })?;
                        section.virtual_address + symbol.value
                    }
                };
            }
        }
        Ok(())
    }

    /// Applies every relocation to the section bodies in place.
    ///
    /// Only `DIR32` and `REL32` are implemented; any other type present in
    /// the image is reported rather than silently skipped.
    pub fn relocate(&mut self) -> Result<(), LoaderError> {
        if !self.laid_out {
            return Err(LoaderError::NotLaidOut);
        }
        for (object, resolved) in self.objects.iter_mut().zip(&self.resolved) {
            for section in &mut object.sections {
                if !section.is_loadable() {
                    continue;
                }
                for relocation in &section.relocations {
                    let target = *resolved
                        .get(relocation.symbol_index as usize)
                        .ok_or(LoaderError::BadSymbolIndex(relocation.symbol_index))?;
                    let site = relocation.offset as usize;
                    let patch = section
                        .body
                        .get_mut(site..site + 4)
                        .ok_or(LoaderError::Truncated(site))?;

                    match relocation.kind {
                        RelocationType::Dir32 => {
                            patch.copy_from_slice(&target.to_le_bytes());
                        }
                        RelocationType::Rel32 => {
                            let origin = section.virtual_address + relocation.offset + 4;
                            let displacement = target.wrapping_sub(origin) as i32;
                            patch.copy_from_slice(&displacement.to_le_bytes());
                        }
                        RelocationType::Unsupported(raw) => {
                            return Err(LoaderError::UnimplementedRelocation(raw));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Iterates the sections that should be shipped to the target.
    pub fn loadable_sections(&self) -> impl Iterator<Item = LoadableSection<'_>> {
        self.objects
            .iter()
            .enumerate()
            .flat_map(|(object_index, object)| {
                object
                    .sections
                    .iter()
                    .enumerate()
                    .filter(|(_, section)| section.is_loadable())
                    .map(move |(section_index, section)| LoadableSection {
                        object_index,
                        section_index,
                        section,
                    })
            })
    }

    /// Externally visible definitions and their resolved addresses, for
    /// registering exports with the target after installation.
    pub fn global_symbols(&self) -> BTreeMap<String, u32> {
        let mut globals = BTreeMap::new();
        for (object, resolved) in self.objects.iter().zip(&self.resolved) {
            for (index, symbol) in object.symbols.iter().enumerate() {
                if symbol.is_global_definition() {
                    globals.insert(symbol.name.clone(), resolved[index]);
                }
            }
        }
        globals
    }

    /// Resolved address of a single symbol by name, if it is defined.
    pub fn symbol_address(&self, name: &str) -> Option<u32> {
        for (object, resolved) in self.objects.iter().zip(&self.resolved) {
            for (index, symbol) in object.symbols.iter().enumerate() {
                if symbol.name == name && !symbol.is_import() && !symbol.auxiliary {
                    return Some(resolved[index]);
                }
            }
        }
        None
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::coff::testing::{build_object, SectionSpec, SymbolSpec};

    use super::*;

    const TEXT_FLAGS: u32 = 0x6050_0020; // code | execute | read | align 16
    const DATA_FLAGS: u32 = 0xC030_0040; // initialized | read | write | align 4

    const DIR32: u16 = 0x06;
    const REL32: u16 = 0x14;

    fn image_with_call_and_data() -> DxtImage {
        // .text:
        //   call <import>        ; REL32 patch at offset 1
        //   mov eax, [data]      ; DIR32 patch at offset 6
        let text = vec![
            0xe8, 0x00, 0x00, 0x00, 0x00, // call rel32
            0xa1, 0x00, 0x00, 0x00, 0x00, // mov eax, moffs32 (patch at 6)
        ];
        let data = vec![0x11, 0x22, 0x33, 0x44];
        let object = build_object(
            &[
                SectionSpec {
                    name: ".text",
                    characteristics: TEXT_FLAGS,
                    body: text,
                    relocations: vec![(1, 1, REL32), (6, 2, DIR32)],
                },
                SectionSpec {
                    name: ".data",
                    characteristics: DATA_FLAGS,
                    body: data,
                    relocations: vec![],
                },
            ],
            &[
                SymbolSpec {
                    name: "_entry".into(),
                    value: 0,
                    section_number: 1,
                    storage_class: 2,
                },
                SymbolSpec {
                    name: "_DmFreePool@4".into(),
                    value: 0,
                    section_number: 0,
                    storage_class: 2,
                },
                SymbolSpec {
                    name: "_the_data".into(),
                    value: 0,
                    section_number: 2,
                    storage_class: 2,
                },
            ],
        );
        DxtLibrary::from_object("ext.obj", &object)
            .unwrap()
            .into_image()
    }

    #[test]
    fn layout_respects_alignment() {
        let mut image = image_with_call_and_data();
        let total = image.layout(0xB003_0001);
        let addresses: Vec<u32> = image
            .loadable_sections()
            .map(|s| s.section.virtual_address)
            .collect();
        // .text aligned up to 16, .data to 4.
        assert_eq!(addresses, vec![0xB003_0010, 0xB003_001C]);
        assert_eq!(total, 0xB003_0020 - 0xB003_0001);
    }

    #[test]
    fn externs_are_listed_before_resolution() {
        let image = {
            let mut image = image_with_call_and_data();
            image.layout(0xB003_0000);
            image
        };
        assert_eq!(image.extern_names(), vec!["_DmFreePool@4"]);
    }

    #[test]
    fn missing_import_fails_resolution() {
        let mut image = image_with_call_and_data();
        image.layout(0xB003_0000);
        let err = image.resolve_symbols(|_| None).unwrap_err();
        assert!(matches!(err, LoaderError::UnresolvedImport(name) if name == "_DmFreePool@4"));
    }

    #[test]
    fn dir32_and_rel32_patch_sites() {
        let mut image = image_with_call_and_data();
        image.layout(0xB003_0000);
        image
            .resolve_symbols(|name| (name == "_DmFreePool@4").then_some(0xB000_1234))
            .unwrap();
        image.relocate().unwrap();

        let sections: Vec<_> = image.loadable_sections().collect();
        let text = &sections[0].section;
        let data_va = sections[1].section.virtual_address;

        // REL32: target - (site_va + 4), site_va = .text + 1.
        let rel = i32::from_le_bytes(text.body[1..5].try_into().unwrap());
        assert_eq!(rel, 0xB000_1234u32.wrapping_sub(0xB003_0000 + 1 + 4) as i32);

        // DIR32: absolute address of _the_data.
        let abs = u32::from_le_bytes(text.body[6..10].try_into().unwrap());
        assert_eq!(abs, data_va);
    }

    #[test]
    fn unimplemented_relocation_is_diagnosed() {
        let object = build_object(
            &[SectionSpec {
                name: ".text",
                characteristics: TEXT_FLAGS,
                body: vec![0; 8],
                relocations: vec![(0, 0, 0x0b)], // IMAGE_REL_I386_SECTION
            }],
            &[SymbolSpec {
                name: "_entry".into(),
                value: 0,
                section_number: 1,
                storage_class: 2,
            }],
        );
        let mut image = DxtLibrary::from_object("ext.obj", &object)
            .unwrap()
            .into_image();
        image.layout(0xB003_0000);
        image.resolve_symbols(|_| None).unwrap();
        assert!(matches!(
            image.relocate(),
            Err(LoaderError::UnimplementedRelocation(0x0b))
        ));
    }

    #[test]
    fn globals_report_resolved_addresses() {
        let mut image = image_with_call_and_data();
        image.layout(0xB003_0000);
        image.resolve_symbols(|_| Some(0xB000_1234)).unwrap();
        let globals = image.global_symbols();
        assert_eq!(globals.get("_entry"), Some(&0xB003_0000));
        assert_eq!(globals.get("_the_data"), Some(&0xB003_000C));
        assert!(!globals.contains_key("_DmFreePool@4"));
    }
}
