use anyhow::Context;

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
pub const fn align_up(value: u32, align: u32) -> Option<u32> {
    debug_assert!(align.is_power_of_two());

    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

pub fn usize_to_u32(val: usize) -> anyhow::Result<u32> {
    u32::try_from(val).ok().context("length is too large for a scratch region")
}

pub fn truncate_to_width(value: i64, size: u32) -> i64 {
    match size {
        1 => value as i8 as i64,
        2 => value as i16 as i64,
        4 => value as i32 as i64,
        _ => value,
    }
}
