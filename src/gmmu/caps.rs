use crate::utils::{SZ_1G, SZ_2M, SZ_4K, SZ_64K, SZ_128K};

/// Page-size classes a mapping can be placed with.
///
/// `Kernel` uses the small page size but allocates from the kernel region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PageSizeClass {
    Small = 0,
    Big = 1,
    Huge = 2,
    Kernel = 3,
}

impl PageSizeClass {
    pub const ALL: [Self; 4] = [Self::Small, Self::Big, Self::Huge, Self::Kernel];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Column of the MMU level table (`hi_bit` / `lo_bit`) this class walks.
    #[must_use]
    pub const fn level_column(self) -> usize {
        match self {
            Self::Small | Self::Kernel => 0,
            Self::Big | Self::Huge => 1,
        }
    }
}

/// Platform and chip description handed to a VM at construction time.
///
/// Everything the page-size policy needs to know about the platform lives
/// here, so the policy functions stay pure.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuCapabilities {
    pub small_page_size: u64,
    /// Bitmask of supported big page sizes (each a power of two).
    pub big_page_sizes: u64,
    pub default_big_page_size: u64,
    pub huge_page_size: Option<u64>,
    /// GPU accesses go through an IOMMU, so buffers are VA-contiguous.
    pub iommuable: bool,
    /// Single user region instead of a small/large split.
    pub unified_va: bool,
    /// Boundary between small- and big-page user VA in split mode.
    pub split_va_limit: u64,
    pub compression: bool,
    /// Smallest page size a compressible kind may be mapped with.
    pub compressible_page_size: u64,
    /// Bytes covered by one comptag line.
    pub compression_page_size: u64,
    pub max_aperture: u64,
    /// Legacy virtualized execution: page tables belong to the server.
    pub virtualized: bool,
}

impl Default for MmuCapabilities {
    fn default() -> Self {
        Self {
            small_page_size: SZ_4K,
            big_page_sizes: SZ_64K | SZ_128K,
            default_big_page_size: SZ_64K,
            huge_page_size: Some(SZ_2M),
            iommuable: true,
            unified_va: true,
            split_va_limit: 56 * SZ_1G,
            compression: true,
            compressible_page_size: SZ_64K,
            compression_page_size: SZ_64K,
            max_aperture: 1 << 49,
            virtualized: false,
        }
    }
}

impl MmuCapabilities {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_iommu(mut self, iommuable: bool) -> Self {
        self.iommuable = iommuable;
        self
    }

    #[must_use]
    pub const fn with_unified_va(mut self, unified: bool) -> Self {
        self.unified_va = unified;
        self
    }

    #[must_use]
    pub const fn with_split_va_limit(mut self, limit: u64) -> Self {
        self.split_va_limit = limit;
        self
    }

    #[must_use]
    pub const fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    #[must_use]
    pub const fn with_compressible_page_size(mut self, size: u64) -> Self {
        self.compressible_page_size = size;
        self
    }

    /// Bytes covered by one comptag line.
    #[must_use]
    pub const fn with_compression_page_size(mut self, size: u64) -> Self {
        self.compression_page_size = size;
        self
    }

    #[must_use]
    pub const fn with_huge_page_size(mut self, size: Option<u64>) -> Self {
        self.huge_page_size = size;
        self
    }

    #[must_use]
    pub const fn with_max_aperture(mut self, size: u64) -> Self {
        self.max_aperture = size;
        self
    }

    #[must_use]
    pub const fn virtualized(mut self) -> Self {
        self.virtualized = true;
        self
    }

    #[must_use]
    pub const fn supports_big_page_size(&self, size: u64) -> bool {
        size.is_power_of_two() && self.big_page_sizes & size != 0
    }

    /// Mask a fixed-offset compressible mapping's VA and physical offset must agree on.
    #[must_use]
    pub const fn compression_align_mask(&self) -> u64 {
        self.compression_page_size.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_caps_describe_integrated_gpu() {
        let caps = MmuCapabilities::default();
        assert!(caps.supports_big_page_size(SZ_64K));
        assert!(caps.supports_big_page_size(SZ_128K));
        assert!(!caps.supports_big_page_size(SZ_2M));
        assert_eq!(caps.compression_align_mask(), SZ_64K - 1);
    }

    #[test]
    fn level_columns() {
        assert_eq!(PageSizeClass::Kernel.level_column(), 0);
        assert_eq!(PageSizeClass::Huge.level_column(), 1);
        assert_eq!(PageSizeClass::Kernel.index(), 3);
    }
}
