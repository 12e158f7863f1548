//! Wire-level data shapes shared by the request catalog and the debugger.

use scroll::{Pread, Pwrite};

use crate::rdcp::MapResponse;

/// The integer-register snapshot XBDM reports for a thread.
///
/// Every field is optional: `getcontext` only returns the register groups
/// that were asked for, and `setcontext` accepts partial updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadContext {
    pub ebp: Option<u32>,
    pub esp: Option<u32>,
    pub eip: Option<u32>,
    pub eflags: Option<u32>,
    pub eax: Option<u32>,
    pub ebx: Option<u32>,
    pub ecx: Option<u32>,
    pub edx: Option<u32>,
    pub edi: Option<u32>,
    pub esi: Option<u32>,
    pub cr0_npx_state: Option<u32>,
}

impl ThreadContext {
    /// Reads the registers present in a `getcontext` response body.
    pub fn parse(map: &MapResponse) -> ThreadContext {
        ThreadContext {
            ebp: map.get_u32("Ebp"),
            esp: map.get_u32("Esp"),
            eip: map.get_u32("Eip"),
            eflags: map.get_u32("EFlags"),
            eax: map.get_u32("Eax"),
            ebx: map.get_u32("Ebx"),
            ecx: map.get_u32("Ecx"),
            edx: map.get_u32("Edx"),
            edi: map.get_u32("Edi"),
            esi: map.get_u32("Esi"),
            cr0_npx_state: map.get_u32("Cr0NpxState"),
        }
    }

    /// Renders the registers that are present as `setcontext` arguments.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let mut push = |name: &str, value: Option<u32>| {
            if let Some(value) = value {
                out.push_str(&format!(" {name}={value:#x}"));
            }
        };
        push("Ebp", self.ebp);
        push("Esp", self.esp);
        push("Eip", self.eip);
        push("EFlags", self.eflags);
        push("Eax", self.eax);
        push("Ebx", self.ebx);
        push("Ecx", self.ecx);
        push("Edx", self.edx);
        push("Edi", self.edi);
        push("Esi", self.esi);
        push("Cr0NpxState", self.cr0_npx_state);
        out
    }
}

/// Size of the packed x87 context blob `getextcontext` returns.
pub const FLOAT_CONTEXT_LEN: usize = 7 * 4 + 8 * 10 + 4;

/// The x87 snapshot: control words, the eight 80-bit stack registers, and a
/// trailing `Cr0NpxState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadFloatContext {
    pub control: u32,
    pub status: u32,
    pub tag: u32,
    pub error_offset: u32,
    pub error_selector: u32,
    pub data_offset: u32,
    pub data_selector: u32,
    /// ST0..ST7 as raw 80-bit little-endian values.
    pub st: [[u8; 10]; 8],
    pub cr0_npx_state: u32,
}

impl Default for ThreadFloatContext {
    fn default() -> Self {
        ThreadFloatContext {
            control: 0,
            status: 0,
            tag: 0,
            error_offset: 0,
            error_selector: 0,
            data_offset: 0,
            data_selector: 0,
            st: [[0; 10]; 8],
            cr0_npx_state: 0,
        }
    }
}

impl ThreadFloatContext {
    /// Decodes the packed little-endian blob.
    pub fn parse(data: &[u8]) -> Option<ThreadFloatContext> {
        if data.len() < FLOAT_CONTEXT_LEN {
            return None;
        }
        let mut context = ThreadFloatContext {
            control: data.pread_with(0, scroll::LE).ok()?,
            status: data.pread_with(4, scroll::LE).ok()?,
            tag: data.pread_with(8, scroll::LE).ok()?,
            error_offset: data.pread_with(12, scroll::LE).ok()?,
            error_selector: data.pread_with(16, scroll::LE).ok()?,
            data_offset: data.pread_with(20, scroll::LE).ok()?,
            data_selector: data.pread_with(24, scroll::LE).ok()?,
            st: [[0; 10]; 8],
            cr0_npx_state: 0,
        };
        for (index, st) in context.st.iter_mut().enumerate() {
            let offset = 28 + index * 10;
            st.copy_from_slice(&data[offset..offset + 10]);
        }
        context.cr0_npx_state = data.pread_with(28 + 80, scroll::LE).ok()?;
        Some(context)
    }

    /// Re-encodes the packed blob for `setcontext ext=`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = vec![0u8; FLOAT_CONTEXT_LEN];
        let mut offset = 0;
        for word in [
            self.control,
            self.status,
            self.tag,
            self.error_offset,
            self.error_selector,
            self.data_offset,
            self.data_selector,
        ] {
            out.pwrite_with(word, offset, scroll::LE).expect("fixed layout");
            offset += 4;
        }
        for st in &self.st {
            out[offset..offset + 10].copy_from_slice(st);
            offset += 10;
        }
        out.pwrite_with(self.cr0_npx_state, offset, scroll::LE)
            .expect("fixed layout");
        out
    }
}

bitflags::bitflags! {
    /// NT page-protection and allocation bits as reported by `walkmem`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageProtection: u32 {
        const NOACCESS = 0x01;
        const READONLY = 0x02;
        const READWRITE = 0x04;
        const WRITECOPY = 0x08;
        const EXECUTE = 0x10;
        const EXECUTE_READ = 0x20;
        const EXECUTE_READWRITE = 0x40;
        const EXECUTE_WRITECOPY = 0x80;
        const GUARD = 0x100;
        const NOCACHE = 0x200;
        const WRITECOMBINE = 0x400;
        const MEM_COMMIT = 0x1000;
        const MEM_RESERVE = 0x2000;
        const MEM_FREE = 0x10000;
        const MEM_PRIVATE = 0x20000;
        const MEM_MAPPED = 0x40000;
    }
}

/// One region of the target's memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// First address within the region.
    pub base: u32,
    /// Size in bytes.
    pub size: u32,
    /// Protection bitmap.
    pub protect: PageProtection,
}

impl MemoryRegion {
    /// Builds a region from one `walkmem` response line.
    pub fn parse(map: &MapResponse) -> Option<MemoryRegion> {
        Some(MemoryRegion {
            base: map.get_u32("base")?,
            size: map.get_u32("size")?,
            protect: PageProtection::from_bits_retain(map.get_u32("protect").unwrap_or(0)),
        })
    }

    /// First address past the region.
    pub fn end(&self) -> u32 {
        self.base.wrapping_add(self.size)
    }

    /// Whether `[start, start+size)` lies fully inside the region.
    pub fn contains(&self, start: u32, size: u32) -> bool {
        start >= self.base && start.wrapping_add(size) <= self.end()
    }

    /// Whether any of the write or execute-write bits is set.
    pub fn is_writable(&self) -> bool {
        self.protect.intersects(
            PageProtection::READWRITE
                | PageProtection::WRITECOPY
                | PageProtection::EXECUTE_READWRITE
                | PageProtection::EXECUTE_WRITECOPY,
        )
    }
}

/// A module loaded on the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub base_address: u32,
    pub size: u32,
    pub checksum: u32,
    pub timestamp: u32,
    pub has_tls: bool,
    pub is_xbe: bool,
    /// Sections observed for this module, in load order.
    pub sections: Vec<Section>,
}

impl Module {
    /// Builds a module from one `modules` response line or a `modload`
    /// notification body.
    pub fn parse(map: &MapResponse) -> Option<Module> {
        Some(Module {
            name: map.get_str("name")?.to_owned(),
            base_address: map.get_u32("base")?,
            size: map.get_u32("size").unwrap_or(0),
            checksum: map.get_u32("check").unwrap_or(0),
            timestamp: map.get_u32("timestamp").unwrap_or(0),
            has_tls: map.has_key("tls"),
            is_xbe: map.has_key("xbe"),
            sections: Vec::new(),
        })
    }
}

/// A section of a loaded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub base_address: u32,
    pub size: u32,
    /// Section index within its module.
    pub index: u32,
    pub flags: u32,
}

impl Section {
    /// Builds a section from a `modsections` line or a `sectload`
    /// notification body.
    pub fn parse(map: &MapResponse) -> Option<Section> {
        Some(Section {
            name: map.get_str("name")?.to_owned(),
            base_address: map.get_u32("base")?,
            size: map.get_u32("size").unwrap_or(0),
            index: map.get_u32("index").unwrap_or(0),
            flags: map.get_u32("flags").unwrap_or(0),
        })
    }
}

/// Per-thread metadata from `threadinfo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub suspend_count: Option<u32>,
    pub priority: Option<i32>,
    pub tls_base: Option<u32>,
    pub start: Option<u32>,
    pub base: Option<u32>,
    pub limit: Option<u32>,
    pub create_timestamp: Option<u64>,
}

impl ThreadInfo {
    /// Reads a `threadinfo` response body.
    pub fn parse(map: &MapResponse) -> ThreadInfo {
        ThreadInfo {
            suspend_count: map.get_u32("suspend"),
            priority: map.get_i32("priority"),
            tls_base: map.get_u32("tlsbase"),
            start: map.get_u32("start"),
            base: map.get_u32("base"),
            limit: map.get_u32("limit"),
            create_timestamp: map.get_u64("createlo", "createhi"),
        }
    }
}
