//! Alignment and bit helpers shared by the allocator, policy and page-table code.

pub const SZ_4K: u64 = 4 << 10;
pub const SZ_64K: u64 = 64 << 10;
pub const SZ_128K: u64 = 128 << 10;
pub const SZ_2M: u64 = 2 << 20;
pub const SZ_1G: u64 = 1 << 30;
pub const SZ_4G: u64 = 4 << 30;

#[must_use]
pub const fn is_power_of_two(val: u64) -> bool {
    val != 0 && (val & (val - 1)) == 0
}

/// Rounds `val` up to `align`, which must be a power of two. `None` on overflow.
#[must_use]
pub const fn align_up(val: u64, align: u64) -> Option<u64> {
    match val.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Mask with the low `bits` bits set.
#[must_use]
pub const fn low_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1 << bits) - 1 }
}

#[must_use]
pub const fn ilog2(val: u64) -> u32 {
    63 - val.leading_zeros()
}

#[must_use]
pub const fn div_round_up(val: u64, div: u64) -> u64 {
    val.div_ceil(div)
}
