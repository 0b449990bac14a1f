pub mod caps;
pub mod levels;

use crate::error::{VmError, VmResult};
use crate::vm::buffer::SgTable;

pub use caps::{MmuCapabilities, PageSizeClass};
pub use levels::MmuLevel;

/// Where the pages behind a mapping live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAperture {
    Sysmem,
    SysmemCoherent,
    Vidmem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

/// A PTE kind as understood by the chip. Compressible kinds need comptags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Kind(pub u8);

impl Kind {
    /// Plain pitch-linear, never compressible.
    pub const PITCH: Self = Self(0);
}

// Raw attribute bits handed to the backend (Maps to `NVGPU_VM_MAP_*`)
pub const GMMU_MAP_FIXED_OFFSET: u32 = 1 << 0;
pub const GMMU_MAP_CACHEABLE: u32 = 1 << 1;
pub const GMMU_MAP_IO_COHERENT: u32 = 1 << 2;
pub const GMMU_MAP_UNMAPPED_PTE: u32 = 1 << 3;
pub const GMMU_MAP_L3_ALLOC: u32 = 1 << 4;
pub const GMMU_MAP_PLATFORM_ATOMIC: u32 = 1 << 5;

/// Flags controlling how a buffer is mapped.
///
/// Two map requests are only considered identical when their flags compare equal.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MapFlags {
    pub fixed_offset: bool,
    pub cacheable: bool,
    pub io_coherent: bool,
    pub unmapped_pte: bool,
    pub l3_alloc: bool,
    pub platform_atomic: bool,
}

impl MapFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn fixed_offset(mut self) -> Self {
        self.fixed_offset = true;
        self
    }

    #[must_use]
    pub const fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    #[must_use]
    pub const fn io_coherent(mut self) -> Self {
        self.io_coherent = true;
        self
    }

    #[must_use]
    pub const fn unmapped_pte(mut self) -> Self {
        self.unmapped_pte = true;
        self
    }

    #[must_use]
    pub const fn l3_alloc(mut self) -> Self {
        self.l3_alloc = true;
        self
    }

    #[must_use]
    pub const fn platform_atomic(mut self) -> Self {
        self.platform_atomic = true;
        self
    }

    /// Converts the flags into the raw bitmask the backend programs into PTEs.
    #[must_use]
    pub const fn bits(self) -> u32 {
        let mut bits = 0;

        if self.fixed_offset {
            bits |= GMMU_MAP_FIXED_OFFSET;
        }
        if self.cacheable {
            bits |= GMMU_MAP_CACHEABLE;
        }
        if self.io_coherent {
            bits |= GMMU_MAP_IO_COHERENT;
        }
        if self.unmapped_pte {
            bits |= GMMU_MAP_UNMAPPED_PTE;
        }
        if self.l3_alloc {
            bits |= GMMU_MAP_L3_ALLOC;
        }
        if self.platform_atomic {
            bits |= GMMU_MAP_PLATFORM_ATOMIC;
        }

        bits
    }
}

/// A block of DMA memory backing one page directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmaMem {
    pub gpu_va: u64,
    pub size: u64,
    pub handle: u64,
}

/// Handle for an address space shared with a virtualization server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsShare {
    pub handle: u64,
}

/// Groups several map/unmap operations behind one deferred TLB invalidate.
#[derive(Debug, Default)]
pub struct MappingBatch {
    pub need_tlb_invalidate: bool,
}

/// Arguments of a single hardware map.
#[derive(Debug, Clone, Copy)]
pub struct GmmuMapOp<'a> {
    pub pdb: Option<&'a DmaMem>,
    pub addr: u64,
    /// `None` for sparse mappings that have no backing pages.
    pub sgt: Option<&'a SgTable>,
    pub phys_offset: u64,
    pub size: u64,
    pub pgsz: PageSizeClass,
    pub page_size: u64,
    pub kind: Kind,
    pub ctag_offset: u64,
    pub flags: u32,
    pub rw: AccessMode,
    pub clear_ctags: bool,
    pub sparse: bool,
    pub privileged: bool,
    /// `None` for sparse mappings.
    pub aperture: Option<MemAperture>,
}

/// Arguments of a single hardware unmap.
#[derive(Debug, Clone, Copy)]
pub struct GmmuUnmapOp<'a> {
    pub pdb: Option<&'a DmaMem>,
    pub addr: u64,
    pub size: u64,
    pub pgsz: PageSizeClass,
    pub va_allocated: bool,
    pub rw: AccessMode,
    pub sparse: bool,
}

/// Chip-generation specific GMMU programming.
///
/// The VM core only ever talks to the hardware through this trait.
pub trait GmmuBackend: Send + Sync {
    /// Program PTEs for `op`. Returns the GPU VA that was mapped.
    fn map(&self, op: &GmmuMapOp<'_>, batch: Option<&mut MappingBatch>) -> VmResult<u64>;

    /// Clear the PTEs described by `op`.
    fn unmap(&self, op: &GmmuUnmapOp<'_>, batch: Option<&mut MappingBatch>);

    /// Invalidate the GPU TLB for the page directory rooted at `pdb`.
    fn tlb_invalidate(&self, pdb: &DmaMem) -> VmResult<()>;

    /// Page-table level table for a VM using `big_page_size`.
    fn mmu_levels(&self, big_page_size: u64) -> &[MmuLevel];

    /// Hard upper bound on the number of page-table levels of this chip.
    fn max_page_table_levels(&self) -> usize;

    /// Allocate zeroed backing memory for one page directory.
    fn alloc_pd(&self, size: u64) -> VmResult<DmaMem>;

    fn free_pd(&self, mem: DmaMem);

    /// Obtain an address-space share from the virtualization server.
    fn alloc_as_share(&self, _big_page_size: u64, _va_limit: u64) -> VmResult<AsShare> {
        Err(VmError::unsupported("address-space sharing"))
    }

    fn free_as_share(&self, _share: AsShare) {}
}
