//! The L1 bootstrap blob and the PE export-table walk that places it.
//!
//! Code execution inside XBDM is gained by overwriting the body of
//! `DmResumeThread` (whose handler takes a single DWORD and does minimal
//! input processing) and then issuing `resume thread=<value>`: the DWORD
//! argument becomes the blob's parameter.

use crate::debugger::XbdmDebugger;
use crate::Error;

/// Offset of the PE header pointer within the DOS header.
pub const PE_HEADER_POINTER: u32 = 0x3c;
/// Offset of the export-table RVA within the PE optional header.
pub const EXPORT_TABLE_OFFSET: u32 = 0x78;
/// Offset of the function count within the export directory.
pub const EXPORT_NUM_FUNCTIONS_OFFSET: u32 = 0x14;
/// Offset of the address-table RVA within the export directory.
pub const EXPORT_ADDRESS_TABLE_OFFSET: u32 = 0x1c;

/// `DmAllocatePoolWithTag`'s export ordinal in xbdm.dll.
pub const DM_ALLOCATE_POOL_WITH_TAG_ORDINAL: u32 = 2;
/// `DmResumeThread`'s export ordinal in xbdm.dll.
pub const DM_RESUME_THREAD_ORDINAL: u32 = 35;

/// The pool tag passed to `DmAllocatePoolWithTag` (`"dbxt"`).
const POOL_TAG: u32 = 0x7478_6264;

/// The L1 trampoline, overlaid onto `DmResumeThread`:
///
/// ```text
/// push ebp
/// mov  ebp, esp
/// push POOL_TAG
/// push dword [ebp+8]          ; the "thread id" is the allocation size
/// mov  eax, DmAllocatePoolWithTag
/// call eax
/// mov  [result slot], eax
/// pop  ebp
/// ret  4
/// <alignment>
/// <4-byte result slot>
/// ```
///
/// The two absolute addresses are patched in by [`patched_l1`].
pub const BOOTSTRAP_L1: [u8; 32] = [
    0x55, // push ebp
    0x8b, 0xec, // mov ebp, esp
    0x68, 0x64, 0x62, 0x78, 0x74, // push POOL_TAG
    0xff, 0x75, 0x08, // push dword [ebp+8]
    0xb8, 0x00, 0x00, 0x00, 0x00, // mov eax, imm32 (pool fn)
    0xff, 0xd0, // call eax
    0xa3, 0x00, 0x00, 0x00, 0x00, // mov [imm32], eax (result slot)
    0x5d, // pop ebp
    0xc2, 0x04, 0x00, // ret 4
    0x90, // alignment
    0x00, 0x00, 0x00, 0x00, // result slot
];

/// Offset of the `mov eax, imm32` immediate (the allocator address).
const L1_POOL_FN_OFFSET: usize = 12;
/// Offset of the `mov [imm32], eax` immediate (the result slot address).
const L1_RESULT_PTR_OFFSET: usize = 19;
/// Offset of the result slot itself.
pub const L1_RESULT_OFFSET: usize = 28;

/// The L1 blob with its absolute addresses filled in for installation at
/// `install_address`.
pub fn patched_l1(pool_fn_address: u32, install_address: u32) -> Vec<u8> {
    let mut blob = BOOTSTRAP_L1.to_vec();
    let result_slot = install_address + L1_RESULT_OFFSET as u32;
    blob[L1_POOL_FN_OFFSET..L1_POOL_FN_OFFSET + 4]
        .copy_from_slice(&pool_fn_address.to_le_bytes());
    blob[L1_RESULT_PTR_OFFSET..L1_RESULT_PTR_OFFSET + 4]
        .copy_from_slice(&result_slot.to_le_bytes());
    debug_assert_eq!(blob[4..8], POOL_TAG.to_le_bytes());
    blob
}

/// A minimal `mov eax, imm32; jmp eax` trampoline to `target`.
pub fn jump_to(target: u32) -> Vec<u8> {
    let mut blob = vec![0xb8, 0, 0, 0, 0, 0xff, 0xe0];
    blob[1..5].copy_from_slice(&target.to_le_bytes());
    blob
}

/// Resolves an export by ordinal by walking the PE export directory in
/// target memory.
pub fn export_address(
    debugger: &XbdmDebugger,
    image_base: u32,
    ordinal: u32,
) -> Result<u32, Error> {
    if ordinal == 0 {
        return Err(Error::InvalidArgument("export ordinals start at 1".into()));
    }
    let pe_header = debugger.get_dword(image_base + PE_HEADER_POINTER)?;
    let export_table = debugger.get_dword(image_base + pe_header + EXPORT_TABLE_OFFSET)?;
    let export_base = image_base + export_table;

    let function_count = debugger.get_dword(export_base + EXPORT_NUM_FUNCTIONS_OFFSET)?;
    let index = ordinal - 1;
    if index >= function_count {
        return Err(Error::InvalidArgument(format!(
            "ordinal {ordinal} exceeds export table size {function_count}"
        )));
    }

    let address_table = debugger.get_dword(export_base + EXPORT_ADDRESS_TABLE_OFFSET)?;
    let function_rva = debugger.get_dword(image_base + address_table + index * 4)?;
    Ok(image_base + function_rva)
}

/// Restores a run of patched target bytes when dropped, so a failed
/// bootstrap cannot leave XBDM with a corrupted function body.
pub struct PatchGuard<'debugger> {
    debugger: &'debugger XbdmDebugger,
    address: u32,
    original: Option<Vec<u8>>,
}

impl<'debugger> PatchGuard<'debugger> {
    /// Saves `length` bytes at `address` and overwrites them with `patch`.
    pub fn apply(
        debugger: &'debugger XbdmDebugger,
        address: u32,
        patch: &[u8],
    ) -> Result<PatchGuard<'debugger>, Error> {
        let original = debugger.get_memory(address, patch.len() as u32)?;
        debugger.set_memory(address, patch)?;
        Ok(PatchGuard {
            debugger,
            address,
            original: Some(original),
        })
    }

    /// Replaces the current patch without changing what will be restored.
    pub fn repatch(&self, patch: &[u8]) -> Result<(), Error> {
        self.debugger.set_memory(self.address, patch)
    }

    /// Explicitly restores the original bytes, surfacing any failure.
    pub fn restore(mut self) -> Result<(), Error> {
        let original = self.original.take().expect("restore runs once");
        self.debugger.set_memory(self.address, &original)
    }
}

impl Drop for PatchGuard<'_> {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            if let Err(err) = self.debugger.set_memory(self.address, &original) {
                tracing::error!(
                    address = format_args!("{:#010x}", self.address),
                    %err,
                    "failed to restore patched bytes"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn l1_patch_sites_take_absolute_addresses() {
        let blob = patched_l1(0xb002_a962, 0xb003_0000);
        assert_eq!(blob.len(), BOOTSTRAP_L1.len());
        assert_eq!(&blob[L1_POOL_FN_OFFSET..L1_POOL_FN_OFFSET + 4], &0xb002_a962u32.to_le_bytes());
        // The result slot pointer lands on the blob's own trailing DWORD.
        assert_eq!(
            &blob[L1_RESULT_PTR_OFFSET..L1_RESULT_PTR_OFFSET + 4],
            &(0xb003_0000u32 + L1_RESULT_OFFSET as u32).to_le_bytes()
        );
    }

    #[test]
    fn jump_trampoline_encodes_its_target() {
        let blob = jump_to(0xd000_4000);
        assert_eq!(blob, vec![0xb8, 0x00, 0x40, 0x00, 0xd0, 0xff, 0xe0]);
    }
}
