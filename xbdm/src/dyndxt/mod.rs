//! Runtime loading of debug-extension code into XBDM.
//!
//! The bootstrap works in stages: a hand-crafted L1 trampoline is patched
//! over `DmResumeThread` to call the pool allocator, the position-independent
//! L2 stage is copied into the allocation and given control the same way,
//! and L2 registers the `ddxt` command handler. From then on extensions are
//! ordinary AR/COFF archives: laid out against a `ddxt!reserve` allocation,
//! resolved against known module exports, relocated on the host, and shipped
//! section by section with `ddxt!install`.

pub mod bootstrap;
pub mod requests;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use dxt_loader::DxtLibrary;

use crate::debugger::XbdmDebugger;
use crate::dyndxt::bootstrap::{
    export_address, jump_to, patched_l1, PatchGuard, BOOTSTRAP_L1,
    DM_ALLOCATE_POOL_WITH_TAG_ORDINAL, DM_RESUME_THREAD_ORDINAL, L1_RESULT_OFFSET,
};
use crate::dyndxt::requests::{DdxtExport, DdxtFree, DdxtInstall, DdxtReserve};
use crate::rdcp::requests::ResumeThread;
use crate::Error;

/// One export known to the loader, resolvable to a target address.
#[derive(Debug, Clone, Copy)]
struct ExportEntry {
    ordinal: u32,
    address: Option<u32>,
}

#[derive(Debug, Default)]
struct ModuleExports {
    entries: BTreeMap<String, ExportEntry>,
}

/// What `load` installed, for bookkeeping and follow-up loads.
#[derive(Debug, Clone)]
pub struct LoadedExtension {
    /// Base of the target-side reservation.
    pub base: u32,
    /// Bytes reserved.
    pub size: u32,
    /// Resolved entry point handed to `ddxt!install`.
    pub entrypoint: u32,
    /// Exported symbols and their resolved addresses.
    pub exports: BTreeMap<String, u32>,
}

/// The host side of the dynamic DXT loader.
pub struct DyndxtLoader {
    debugger: Arc<XbdmDebugger>,
    /// Known exports per module (lowercased name), fed by the built-in
    /// xbdm.dll table, `register_export`, and successful loads.
    module_exports: Mutex<BTreeMap<String, ModuleExports>>,
}

impl DyndxtLoader {
    /// A loader bound to an attached debugger.
    pub fn new(debugger: Arc<XbdmDebugger>) -> DyndxtLoader {
        let mut xbdm = ModuleExports::default();
        xbdm.entries.insert(
            "DmAllocatePoolWithTag".to_owned(),
            ExportEntry {
                ordinal: DM_ALLOCATE_POOL_WITH_TAG_ORDINAL,
                address: None,
            },
        );
        xbdm.entries.insert(
            "DmResumeThread".to_owned(),
            ExportEntry {
                ordinal: DM_RESUME_THREAD_ORDINAL,
                address: None,
            },
        );
        let mut module_exports = BTreeMap::new();
        module_exports.insert("xbdm.dll".to_owned(), xbdm);
        DyndxtLoader {
            debugger,
            module_exports: Mutex::new(module_exports),
        }
    }

    /// Records an export so later loads can resolve imports against it.
    pub fn register_export(&self, module: &str, name: &str, ordinal: u32, address: u32) {
        self.module_exports
            .lock()
            .entry(module.to_ascii_lowercase())
            .or_default()
            .entries
            .insert(
                name.to_owned(),
                ExportEntry {
                    ordinal,
                    address: Some(address),
                },
            );
    }

    /// Injects the L2 bootstrap, giving XBDM the `ddxt` command handler.
    ///
    /// The sequence patches `DmResumeThread` twice (first with the L1
    /// allocator trampoline, then with a jump into the freshly copied L2
    /// image) and restores the original bytes afterwards even on failure.
    /// The target should be fully halted before this runs.
    pub fn bootstrap(&self, l2_image: &[u8]) -> Result<u32, Error> {
        if l2_image.is_empty() {
            return Err(Error::InvalidArgument("empty L2 bootstrap image".into()));
        }
        self.debugger.halt()?;

        let xbdm = self
            .debugger
            .module("xbdm.dll")
            .ok_or_else(|| Error::InvalidArgument("xbdm.dll not in module list".into()))?;
        let resume_thread =
            export_address(&self.debugger, xbdm.base_address, DM_RESUME_THREAD_ORDINAL)?;
        let allocate_pool = export_address(
            &self.debugger,
            xbdm.base_address,
            DM_ALLOCATE_POOL_WITH_TAG_ORDINAL,
        )?;
        tracing::debug!(
            resume_thread = format_args!("{resume_thread:#010x}"),
            allocate_pool = format_args!("{allocate_pool:#010x}"),
            "resolved bootstrap exports"
        );

        {
            let mut exports = self.module_exports.lock();
            let xbdm_exports = exports.entry("xbdm.dll".to_owned()).or_default();
            if let Some(entry) = xbdm_exports.entries.get_mut("DmAllocatePoolWithTag") {
                entry.address = Some(allocate_pool);
            }
            if let Some(entry) = xbdm_exports.entries.get_mut("DmResumeThread") {
                entry.address = Some(resume_thread);
            }
        }

        let patch = patched_l1(allocate_pool, resume_thread);
        let guard = PatchGuard::apply(&self.debugger, resume_thread, &patch)?;

        // `resume` dispatches to the patched function; the thread id is the
        // allocation size.
        self.debugger.context().execute(&ResumeThread {
            thread_id: l2_image.len() as u32,
        })?;

        let l2_base = self
            .debugger
            .get_dword(resume_thread + L1_RESULT_OFFSET as u32)?;
        if l2_base == 0 {
            return Err(Error::InvalidArgument(
                "pool allocation for the L2 bootstrap failed".into(),
            ));
        }
        tracing::info!(base = format_args!("{l2_base:#010x}"), "L2 bootstrap allocated");

        self.debugger.set_memory(l2_base, l2_image)?;

        // Swap the trampoline for a jump into L2 and give it control once.
        guard.repatch(&jump_to(l2_base))?;
        self.debugger.context().execute(&ResumeThread { thread_id: 0 })?;

        guard.restore()?;
        Ok(l2_base)
    }

    /// Size of the L1 blob, which is also how many bytes of the hooked
    /// function get saved and restored.
    pub fn l1_patch_len() -> usize {
        BOOTSTRAP_L1.len()
    }

    /// Parses, lays out, resolves, relocates, and installs an AR/COFF
    /// extension archive. `module_name` is the name future loads use to
    /// resolve imports against this extension's exports.
    ///
    /// Failures after the target-side reservation free it again.
    pub fn load(&self, module_name: &str, archive: &[u8]) -> Result<LoadedExtension, Error> {
        let mut image = DxtLibrary::parse(archive)?.into_image();

        // A throwaway layout to learn the footprint before reserving.
        let size = image.layout(0);
        let base = self.debugger.context().execute(&DdxtReserve { size })?;
        tracing::debug!(
            base = format_args!("{base:#010x}"),
            size = format_args!("{size:#x}"),
            "reserved extension memory"
        );

        let result = self.load_at(&mut image, base);
        match result {
            Ok(mut extension) => {
                extension.size = size;
                for (name, address) in &extension.exports {
                    self.register_export(module_name, name, 0, *address);
                    if let Err(err) = self.debugger.context().execute(&DdxtExport {
                        module: module_name,
                        ordinal: 0,
                        address: *address,
                        name,
                    }) {
                        tracing::warn!(%err, name, "export registration failed");
                    }
                }
                Ok(extension)
            }
            Err(err) => {
                // The reservation must not leak when any later step fails.
                if let Err(free_err) = self.debugger.context().execute(&DdxtFree { base }) {
                    tracing::warn!(%free_err, "failed to free reservation after load error");
                }
                Err(err)
            }
        }
    }

    fn load_at(
        &self,
        image: &mut dxt_loader::DxtImage,
        base: u32,
    ) -> Result<LoadedExtension, Error> {
        image.layout(base);
        image.resolve_symbols(|name| self.resolve_import(name))?;
        image.relocate()?;

        let exports = image.global_symbols();
        let entrypoint = exports
            .iter()
            .find(|(name, _)| name.contains("DXTMain") || name.contains("DxtMain"))
            .map(|(_, address)| *address)
            .unwrap_or(base);

        for section in image.loadable_sections() {
            self.debugger.context().execute(&DdxtInstall {
                base: section.section.virtual_address,
                data: section.section.body.clone(),
                entrypoint,
            })?;
        }

        Ok(LoadedExtension {
            base,
            size: 0,
            entrypoint,
            exports: exports
                .into_iter()
                .map(|(name, address)| (normalize_import(&name), address))
                .collect(),
        })
    }

    /// Resolves an import symbol against every module's known exports,
    /// walking the on-target PE export table for entries that only have an
    /// ordinal so far.
    fn resolve_import(&self, symbol: &str) -> Option<u32> {
        let name = normalize_import(symbol);
        let mut exports = self.module_exports.lock();
        for (module_name, module) in exports.iter_mut() {
            let Some(entry) = module.entries.get_mut(&name) else {
                continue;
            };
            if let Some(address) = entry.address {
                return Some(address);
            }
            let Some(module_info) = self.debugger.module(module_name) else {
                tracing::warn!(module = %module_name, "export's module is not loaded");
                continue;
            };
            match export_address(&self.debugger, module_info.base_address, entry.ordinal) {
                Ok(address) => {
                    entry.address = Some(address);
                    return Some(address);
                }
                Err(err) => {
                    tracing::warn!(%err, symbol = %name, "export table walk failed");
                }
            }
        }
        None
    }
}

/// Strips the compiler decorations an i386 COFF import carries:
/// `__imp__Name@8` and `_Name@8` both resolve as `Name`.
fn normalize_import(symbol: &str) -> String {
    let mut name = symbol;
    if let Some(stripped) = name.strip_prefix("__imp_") {
        name = stripped;
    }
    if let Some(stripped) = name.strip_prefix('_') {
        name = stripped;
    }
    match name.rfind('@') {
        Some(position) if name[position + 1..].chars().all(|c| c.is_ascii_digit()) => {
            name[..position].to_owned()
        }
        _ => name.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case("_DmFreePool@4", "DmFreePool")]
    #[test_case("__imp__DmFreePool@4", "DmFreePool")]
    #[test_case("_cdecl_function", "cdecl_function")]
    #[test_case("plain", "plain")]
    #[test_case("_odd@name@8", "odd@name")]
    fn import_decorations_are_stripped(symbol: &str, expected: &str) {
        assert_eq!(normalize_import(symbol), expected);
    }
}
