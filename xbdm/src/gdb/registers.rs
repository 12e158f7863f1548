//! The register file exposed to GDB and its hex serialization.
//!
//! XBDM only reports the general-purpose integer registers and the x87
//! stack; every other slot in the i386 layout GDB expects is serialized as
//! unavailable (`xxxxxxxx`).

use crate::rdcp::types::{ThreadContext, ThreadFloatContext};

/// Slot index of the first ST register.
pub const FLOAT_REGISTER_OFFSET: usize = 28;
/// Total register slots in the target description.
pub const NUM_REGISTERS: usize = 44;

/// Slots 0..=9: the general-purpose registers XBDM reports.
const GP_COUNT: usize = 10;
/// Slots 10..=27: segment/control registers XBDM does not expose.
const UNSUPPORTED_COUNT: usize = 18;
/// Slots 36..=43: x87 control words XBDM does not expose individually.
const FLOAT_CONTROL_COUNT: usize = 8;

/// The target description handed to GDB through `qXfer:features:read`.
/// Register order here defines the slot numbering used by `g`/`G`/`p`/`P`.
pub const TARGET_XML: &str = concat!(
    r#"<?xml version="1.0"?><!DOCTYPE target SYSTEM "gdb-target.dtd"><target>"#,
    "<architecture>i386:intel</architecture>",
    r#"<feature name="i386.xbdm"/>"#,
    r#"<reg name="Eax" bitsize="32" type="int32" regnum="0"/>"#,
    r#"<reg name="Ecx" bitsize="32" type="int32"/>"#,
    r#"<reg name="Edx" bitsize="32" type="int32"/>"#,
    r#"<reg name="Ebx" bitsize="32" type="int32"/>"#,
    r#"<reg name="Esp" bitsize="32" type="data_ptr"/>"#,
    r#"<reg name="Ebp" bitsize="32" type="data_ptr"/>"#,
    r#"<reg name="Esi" bitsize="32" type="int32"/>"#,
    r#"<reg name="Edi" bitsize="32" type="int32"/>"#,
    r#"<reg name="Eip" bitsize="32" type="code_ptr"/>"#,
    r#"<reg name="EFlags" bitsize="32" type="int32"/>"#,
    r#"<reg name="cs" bitsize="32" type="int32"/>"#,
    r#"<reg name="ss" bitsize="32" type="int32"/>"#,
    r#"<reg name="ds" bitsize="32" type="int32"/>"#,
    r#"<reg name="es" bitsize="32" type="int32"/>"#,
    r#"<reg name="fs" bitsize="32" type="int32"/>"#,
    r#"<reg name="gs" bitsize="32" type="int32"/>"#,
    r#"<reg name="ss_base" bitsize="32" type="int32"/>"#,
    r#"<reg name="ds_base" bitsize="32" type="int32"/>"#,
    r#"<reg name="es_base" bitsize="32" type="int32"/>"#,
    r#"<reg name="fs_base" bitsize="32" type="int32"/>"#,
    r#"<reg name="gs_base" bitsize="32" type="int32"/>"#,
    r#"<reg name="k_gs_base" bitsize="32" type="int32"/>"#,
    r#"<reg name="cr0" bitsize="32" type="int32"/>"#,
    r#"<reg name="cr2" bitsize="32" type="int32"/>"#,
    r#"<reg name="cr3" bitsize="32" type="int32"/>"#,
    r#"<reg name="cr4" bitsize="32" type="int32"/>"#,
    r#"<reg name="cr8" bitsize="32" type="int32"/>"#,
    r#"<reg name="efer" bitsize="32" type="int32"/>"#,
    r#"<reg name="ST0" bitsize="80" type="i387_ext"/>"#,
    r#"<reg name="ST1" bitsize="80" type="i387_ext"/>"#,
    r#"<reg name="ST2" bitsize="80" type="i387_ext"/>"#,
    r#"<reg name="ST3" bitsize="80" type="i387_ext"/>"#,
    r#"<reg name="ST4" bitsize="80" type="i387_ext"/>"#,
    r#"<reg name="ST5" bitsize="80" type="i387_ext"/>"#,
    r#"<reg name="ST6" bitsize="80" type="i387_ext"/>"#,
    r#"<reg name="ST7" bitsize="80" type="i387_ext"/>"#,
    r#"<reg name="fctrl" bitsize="32" type="int" group="float"/>"#,
    r#"<reg name="fstat" bitsize="32" type="int" group="float"/>"#,
    r#"<reg name="ftag" bitsize="32" type="int" group="float"/>"#,
    r#"<reg name="fiseg" bitsize="32" type="int" group="float"/>"#,
    r#"<reg name="fioff" bitsize="32" type="int" group="float"/>"#,
    r#"<reg name="foseg" bitsize="32" type="int" group="float"/>"#,
    r#"<reg name="fooff" bitsize="32" type="int" group="float"/>"#,
    r#"<reg name="fop" bitsize="32" type="int" group="float"/>"#,
    "</target>"
);

fn append_u32(out: &mut String, value: Option<u32>) {
    match value {
        // GDB's wire order is the target's little-endian memory image.
        Some(value) => out.push_str(&hex::encode(value.to_le_bytes())),
        None => out.push_str("xxxxxxxx"),
    }
}

fn append_st(out: &mut String, value: Option<&[u8; 10]>) {
    match value {
        Some(bytes) => out.push_str(&hex::encode(bytes)),
        None => out.push_str(&"x".repeat(20)),
    }
}

fn gp_register(context: &ThreadContext, slot: usize) -> Option<u32> {
    match slot {
        0 => context.eax,
        1 => context.ecx,
        2 => context.edx,
        3 => context.ebx,
        4 => context.esp,
        5 => context.ebp,
        6 => context.esi,
        7 => context.edi,
        8 => context.eip,
        9 => context.eflags,
        _ => None,
    }
}

fn set_gp_register(context: &mut ThreadContext, slot: usize, value: u32) -> bool {
    let target = match slot {
        0 => &mut context.eax,
        1 => &mut context.ecx,
        2 => &mut context.edx,
        3 => &mut context.ebx,
        4 => &mut context.esp,
        5 => &mut context.ebp,
        6 => &mut context.esi,
        7 => &mut context.edi,
        8 => &mut context.eip,
        9 => &mut context.eflags,
        _ => return false,
    };
    *target = Some(value);
    true
}

/// Serializes the full register file for a `g` response.
pub fn serialize_registers(
    context: Option<&ThreadContext>,
    float_context: Option<&ThreadFloatContext>,
) -> String {
    let mut out = String::with_capacity(NUM_REGISTERS * 8 + 8 * 12);
    for slot in 0..GP_COUNT {
        append_u32(&mut out, context.and_then(|c| gp_register(c, slot)));
    }
    for _ in 0..UNSUPPORTED_COUNT {
        append_u32(&mut out, None);
    }
    for index in 0..8 {
        append_st(&mut out, float_context.map(|f| &f.st[index]));
    }
    for _ in 0..FLOAT_CONTROL_COUNT {
        append_u32(&mut out, None);
    }
    out
}

/// Serializes one register for a `p` response.
pub fn read_register(
    slot: usize,
    context: Option<&ThreadContext>,
    float_context: Option<&ThreadFloatContext>,
) -> Option<String> {
    if slot >= NUM_REGISTERS {
        return None;
    }
    let mut out = String::new();
    if slot < GP_COUNT {
        append_u32(&mut out, context.and_then(|c| gp_register(c, slot)));
    } else if (FLOAT_REGISTER_OFFSET..FLOAT_REGISTER_OFFSET + 8).contains(&slot) {
        append_st(
            &mut out,
            float_context.map(|f| &f.st[slot - FLOAT_REGISTER_OFFSET]),
        );
    } else {
        append_u32(&mut out, None);
    }
    Some(out)
}

/// Applies a `P` write. Returns `false` for slots XBDM cannot write back.
pub fn write_register(context: &mut ThreadContext, slot: usize, hex_value: &str) -> bool {
    if slot >= GP_COUNT {
        return false;
    }
    let Ok(bytes) = hex::decode(hex_value) else {
        return false;
    };
    let Ok(bytes) = <[u8; 4]>::try_from(bytes.as_slice()) else {
        return false;
    };
    set_gp_register(context, slot, u32::from_le_bytes(bytes))
}

/// Parses a `G` body back into the register subsets XBDM can accept. Slots
/// serialized as unavailable (`x` runs) are skipped.
pub fn parse_g_body(body: &str) -> Option<ThreadContext> {
    let mut context = ThreadContext::default();
    let mut cursor = 0usize;
    let bytes = body.as_bytes();

    for slot in 0..NUM_REGISTERS {
        let width = if (FLOAT_REGISTER_OFFSET..FLOAT_REGISTER_OFFSET + 8).contains(&slot) {
            20
        } else {
            8
        };
        if cursor + width > bytes.len() {
            break;
        }
        let field = &body[cursor..cursor + width];
        cursor += width;

        if field.starts_with('x') || width == 20 {
            // Unavailable, or an ST register with no writable wire form.
            continue;
        }
        if slot < GP_COUNT {
            let Ok(raw) = hex::decode(field) else {
                return None;
            };
            let raw: [u8; 4] = raw.as_slice().try_into().ok()?;
            set_gp_register(&mut context, slot, u32::from_le_bytes(raw));
        }
    }
    Some(context)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn context() -> ThreadContext {
        ThreadContext {
            eax: Some(0x0102_0304),
            ecx: Some(0x1111_1111),
            eip: Some(0x8004_1000),
            eflags: Some(0x246),
            ..ThreadContext::default()
        }
    }

    #[test]
    fn registers_serialize_little_endian() {
        let serialized = serialize_registers(Some(&context()), None);
        // Eax = 0x01020304 → bytes 04 03 02 01 on the wire.
        assert!(serialized.starts_with("04030201"));
        assert_eq!(serialized.len(), 36 * 8 + 8 * 20);
    }

    #[test]
    fn missing_context_serializes_as_unavailable() {
        let serialized = serialize_registers(None, None);
        assert!(serialized.starts_with(&"x".repeat(8)));
        assert_eq!(serialized.len(), 36 * 8 + 8 * 20);
    }

    #[test]
    fn st_registers_emit_ten_bytes() {
        let mut float_context = ThreadFloatContext::default();
        float_context.st[0] = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09];
        let serialized = read_register(FLOAT_REGISTER_OFFSET, None, Some(&float_context)).unwrap();
        assert_eq!(serialized, "00010203040506070809");
    }

    #[test]
    fn g_body_round_trips_general_registers() {
        let body = serialize_registers(Some(&context()), None);
        let parsed = parse_g_body(&body).unwrap();
        assert_eq!(parsed.eax, Some(0x0102_0304));
        assert_eq!(parsed.ecx, Some(0x1111_1111));
        assert_eq!(parsed.eip, Some(0x8004_1000));
        assert_eq!(parsed.eflags, Some(0x246));
        // Registers that were unavailable stay absent.
        assert_eq!(parsed.ebx, None);
        assert_eq!(parsed.esp, None);
    }

    #[test]
    fn single_register_read_and_write() {
        let mut ctx = ThreadContext::default();
        assert!(write_register(&mut ctx, 8, "00100480"));
        assert_eq!(ctx.eip, Some(0x8004_1000));
        assert_eq!(
            read_register(8, Some(&ctx), None).unwrap(),
            "00100480"
        );
        // Unsupported slots read as unavailable and refuse writes.
        assert_eq!(read_register(10, Some(&ctx), None).unwrap(), "xxxxxxxx");
        assert!(!write_register(&mut ctx, 10, "00000000"));
    }
}
