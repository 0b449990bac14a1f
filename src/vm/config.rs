use crate::gmmu::MemAperture;
use crate::vm::buffer::SgTable;

/// Backing pages for a VM's semaphore pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphorePoolConfig {
    pub sgt: SgTable,
    pub aperture: MemAperture,
}

/// Parameters of a new address space.
///
/// The VA limit is `low_hole + user_reserved + kernel_reserved`.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub name: String,
    /// Zero selects the chip default.
    pub big_page_size: u64,
    pub low_hole: u64,
    pub user_reserved: u64,
    pub kernel_reserved: u64,
    pub big_pages: bool,
    pub userspace_managed: bool,
    pub compression: bool,
    pub semaphore_pool: Option<SemaphorePoolConfig>,
}

impl VmConfig {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            big_page_size: 0,
            low_hole: 0,
            user_reserved: 0,
            kernel_reserved: 0,
            big_pages: true,
            userspace_managed: false,
            compression: true,
            semaphore_pool: None,
        }
    }

    #[must_use]
    pub const fn with_big_page_size(mut self, size: u64) -> Self {
        self.big_page_size = size;
        self
    }

    #[must_use]
    pub const fn with_low_hole(mut self, size: u64) -> Self {
        self.low_hole = size;
        self
    }

    #[must_use]
    pub const fn with_user_reserved(mut self, size: u64) -> Self {
        self.user_reserved = size;
        self
    }

    #[must_use]
    pub const fn with_kernel_reserved(mut self, size: u64) -> Self {
        self.kernel_reserved = size;
        self
    }

    #[must_use]
    pub const fn with_big_pages(mut self, enabled: bool) -> Self {
        self.big_pages = enabled;
        self
    }

    #[must_use]
    pub const fn userspace_managed(mut self) -> Self {
        self.userspace_managed = true;
        self
    }

    #[must_use]
    pub const fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    #[must_use]
    pub fn with_semaphore_pool(mut self, sgt: SgTable, aperture: MemAperture) -> Self {
        self.semaphore_pool = Some(SemaphorePoolConfig { sgt, aperture });
        self
    }

    /// `low_hole + user_reserved + kernel_reserved`, `None` on overflow.
    #[must_use]
    pub const fn aperture_size(&self) -> Option<u64> {
        match self.low_hole.checked_add(self.user_reserved) {
            Some(v) => v.checked_add(self.kernel_reserved),
            None => None,
        }
    }
}
