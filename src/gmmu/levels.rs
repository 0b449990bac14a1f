//! GMMU page-table level descriptions.
//!
//! A level table lists the translation hierarchy from the root PDE level down
//! to the PTE level. Each level decodes VA bits `lo_bit..=hi_bit`; column 0 of
//! `hi_bit` / `lo_bit` applies to small pages and column 1 to big pages.

use crate::utils::low_mask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuLevel {
    pub hi_bit: [u32; 2],
    pub lo_bit: [u32; 2],
    /// Size of one entry in bytes.
    pub entry_size: u32,
}

impl MmuLevel {
    #[must_use]
    pub const fn new(hi_bit: [u32; 2], lo_bit: [u32; 2], entry_size: u32) -> Self {
        Self {
            hi_bit,
            lo_bit,
            entry_size,
        }
    }

    /// Number of VA bits this level decodes. Zero when a big page consumes the whole level.
    #[must_use]
    pub const fn index_bits(&self, column: usize) -> u32 {
        (self.hi_bit[column] + 1).saturating_sub(self.lo_bit[column])
    }

    #[must_use]
    pub const fn num_entries(&self, column: usize) -> usize {
        1 << self.index_bits(column)
    }

    /// Entry index of `addr` at this level.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub const fn entry_index(&self, addr: u64, column: usize) -> usize {
        ((addr >> self.lo_bit[column]) & low_mask(self.index_bits(column))) as usize
    }

    /// Bytes of VA covered by one entry of this level.
    #[must_use]
    pub const fn entry_coverage(&self, column: usize) -> u64 {
        1 << self.lo_bit[column]
    }

    /// Bytes of backing memory a directory at this level needs.
    ///
    /// Sized for the small-page column, which always decodes the most bits.
    #[must_use]
    pub const fn pd_size(&self) -> u64 {
        self.num_entries(0) as u64 * self.entry_size as u64
    }
}

/// Two-level layout with 64 KiB big pages (38-bit VA).
pub const GM20B_LEVELS_64K: [MmuLevel; 2] = [
    MmuLevel::new([37, 37], [26, 26], 8),
    MmuLevel::new([25, 25], [12, 16], 8),
];

/// Five-level layout (49-bit VA, 64 KiB big pages, dual-size PDE at level 3).
pub const GP10B_LEVELS: [MmuLevel; 5] = [
    MmuLevel::new([48, 48], [47, 47], 8),
    MmuLevel::new([46, 46], [38, 38], 8),
    MmuLevel::new([37, 37], [29, 29], 8),
    MmuLevel::new([28, 28], [21, 21], 16),
    MmuLevel::new([20, 20], [12, 16], 8),
];

/// Number of low VA bits covered by one entry of the last PDE level.
///
/// The last level of the table holds PTEs, so the last PDE level is the one
/// before it. `None` for tables too short to contain a PDE level.
#[must_use]
pub fn pde_coverage_bit_count(levels: &[MmuLevel]) -> Option<u32> {
    let final_pde_level = levels.len().checked_sub(2)?;
    Some(levels[final_pde_level].lo_bit[0])
}

/// Whether `[base, base + size)` may hold pages that need `levels`' PDE alignment.
#[must_use]
pub fn pages_possible(levels: &[MmuLevel], base: u64, size: u64) -> bool {
    let Some(bits) = pde_coverage_bit_count(levels) else {
        return false;
    };
    let mask = low_mask(bits);
    base & mask == 0 && size & mask == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{SZ_2M, SZ_64K};

    #[test]
    fn gp10b_pde_coverage_is_two_megabytes() {
        assert_eq!(pde_coverage_bit_count(&GP10B_LEVELS), Some(21));
        assert!(pages_possible(&GP10B_LEVELS, SZ_2M, 16 * SZ_2M));
        assert!(!pages_possible(&GP10B_LEVELS, SZ_64K, 16 * SZ_2M));
        assert!(!pages_possible(&GP10B_LEVELS, SZ_2M, SZ_2M + SZ_64K));
    }

    #[test]
    fn gm20b_uses_level_zero() {
        assert_eq!(pde_coverage_bit_count(&GM20B_LEVELS_64K), Some(26));
        assert_eq!(pde_coverage_bit_count(&GM20B_LEVELS_64K[..1]), None);
    }

    #[test]
    fn entry_geometry() {
        let pte = GP10B_LEVELS[4];
        assert_eq!(pte.num_entries(0), 512);
        assert_eq!(pte.num_entries(1), 32);
        assert_eq!(pte.pd_size(), 4096);
        assert_eq!(pte.entry_index(0x0020_3000, 0), 3);
        assert_eq!(pte.entry_index(0x0021_0000, 1), 1);
        assert_eq!(GP10B_LEVELS[3].entry_coverage(0), SZ_2M);

        // A big page that swallows a whole level leaves a single entry.
        let flat = MmuLevel::new([15, 15], [12, 16], 8);
        assert_eq!(flat.index_bits(1), 0);
        assert_eq!(flat.num_entries(1), 1);
        assert_eq!(flat.entry_index(0xdead_0000, 1), 0);
    }
}
