use crate::gmmu::PageSizeClass;

/// The inputs that decide which page size a mapping uses.
///
/// Built once per VM from its configuration and capabilities; every method is
/// a pure function of these fields and its arguments.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSizePolicy {
    pub big_pages: bool,
    pub unified_va: bool,
    pub iommuable: bool,
    pub big_page_size: u64,
    pub split_va_limit: u64,
}

impl PageSizePolicy {
    /// Page-size class for a mapping of `size` bytes at `base` (zero: allocator chooses).
    ///
    /// `area` is the class of the reserved area containing `base`, if any.
    #[must_use]
    pub const fn resolve(&self, base: u64, size: u64, area: Option<PageSizeClass>) -> PageSizeClass {
        if !self.big_pages {
            return PageSizeClass::Small;
        }

        if !self.unified_va {
            return self.resolve_split(base, size);
        }

        if base != 0 {
            return Self::resolve_fixed(area);
        }

        // Without an IOMMU the pages are not guaranteed contiguous.
        if size >= self.big_page_size && self.iommuable {
            return PageSizeClass::Big;
        }

        PageSizeClass::Small
    }

    /// Fixed-address mappings inherit the class of their reservation.
    #[must_use]
    pub const fn resolve_fixed(area: Option<PageSizeClass>) -> PageSizeClass {
        match area {
            Some(pgsz) => pgsz,
            None => PageSizeClass::Small,
        }
    }

    /// Split address spaces decide by which side of the boundary `base` is on.
    #[must_use]
    pub const fn resolve_split(&self, base: u64, size: u64) -> PageSizeClass {
        if base == 0 {
            if size >= self.big_page_size {
                return PageSizeClass::Big;
            }
            return PageSizeClass::Small;
        }

        if base < self.split_va_limit {
            PageSizeClass::Small
        } else {
            PageSizeClass::Big
        }
    }
}

/// Maps a reservation's page size onto a class of this VM.
#[must_use]
pub fn class_for_page_size(
    page_size: u64,
    small: u64,
    big: u64,
    huge: Option<u64>,
) -> Option<PageSizeClass> {
    if page_size == small {
        Some(PageSizeClass::Small)
    } else if page_size == big {
        Some(PageSizeClass::Big)
    } else if huge == Some(page_size) {
        Some(PageSizeClass::Huge)
    } else {
        None
    }
}
