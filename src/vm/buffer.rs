use crate::error::{VmError, VmResult};
use crate::gmmu::{AccessMode, Kind, MapFlags, MemAperture, PageSizeClass};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// One physically contiguous chunk of a scatter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgChunk {
    pub phys: u64,
    /// IOMMU address of the chunk, zero when not IOMMU mapped.
    pub dma: u64,
    pub length: u64,
}

/// Scatter list describing the pages behind a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgTable {
    chunks: Vec<SgChunk>,
}

impl SgTable {
    #[must_use]
    pub const fn new(chunks: Vec<SgChunk>) -> Self {
        Self { chunks }
    }

    /// A single physically contiguous chunk.
    #[must_use]
    pub fn contiguous(phys: u64, length: u64) -> Self {
        Self::new(vec![SgChunk {
            phys,
            dma: 0,
            length,
        }])
    }

    /// A buffer the IOMMU presents at `dma` as one contiguous range.
    #[must_use]
    pub fn iommu_mapped(dma: u64, chunks: Vec<SgChunk>) -> Self {
        let mut chunks = chunks;
        if let Some(first) = chunks.first_mut() {
            first.dma = dma;
        }
        Self::new(chunks)
    }

    #[must_use]
    pub fn chunks(&self) -> &[SgChunk] {
        &self.chunks
    }

    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.length).sum()
    }

    /// Largest power of two every GPU-visible address in the buffer is aligned to.
    ///
    /// With an IOMMU the buffer is contiguous in IOVA space, so only the
    /// starting IOVA matters. Otherwise each chunk's address and length count.
    /// Zero for an empty table.
    #[must_use]
    pub fn alignment(&self, iommuable: bool) -> u64 {
        if iommuable
            && let Some(first) = self.chunks.first()
            && first.dma != 0
        {
            return 1 << first.dma.trailing_zeros();
        }

        self.chunks
            .iter()
            .map(|c| c.phys | c.length)
            .filter(|&bits| bits != 0)
            .map(|bits| 1u64 << bits.trailing_zeros())
            .min()
            .unwrap_or(0)
    }
}

/// Compression tag lines attached to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Comptags {
    pub offset: u64,
    pub lines: u32,
    /// Freshly allocated lines whose compression state must be cleared on first map.
    pub needs_clear: bool,
}

/// The OS-side view of a buffer that can be mapped into a VM.
pub trait OsBuffer: Send + Sync {
    /// Stable identity used to recognise repeated map requests.
    fn id(&self) -> u64;

    fn size(&self) -> u64;

    /// Access the buffer was created with.
    fn rw_mode(&self) -> AccessMode {
        AccessMode::ReadWrite
    }

    /// Comptags already attached to this buffer, if any.
    fn comptags(&self) -> Option<Comptags>;

    /// Attach `lines` comptag lines. May fail when the pool is exhausted.
    ///
    /// # Errors
    /// Implementation defined; callers treat failure as "no compression".
    fn alloc_comptags(&self, lines: u32) -> VmResult<Comptags>;

    /// Called after the last mapping of this buffer in a VM is torn down.
    fn on_unmapped(&self, _addr: u64) {}
}

/// One active mapping of an [`OsBuffer`] into a VM.
pub struct MappedBuffer {
    pub addr: u64,
    pub size: u64,
    pub phys_offset: u64,
    pub aperture: MemAperture,
    pub pgsz: PageSizeClass,
    pub rw: AccessMode,
    /// Kind the caller asked for; part of the dedup key.
    pub kind: Kind,
    /// Kind actually programmed into the PTEs after compression fallback.
    pub pte_kind: Kind,
    pub ctag_offset: u64,
    pub ctag_lines: u32,
    pub flags: MapFlags,
    /// The VA was handed out by the VM's allocator rather than fixed by the caller.
    pub va_allocated: bool,
    pub vm_id: u64,
    /// Base of the reserved area this buffer lives in.
    pub area: Option<u64>,
    pub os_buf: Arc<dyn OsBuffer>,
    refs: AtomicU32,
}

impl fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("addr", &format_args!("0x{:x}", self.addr))
            .field("size", &format_args!("0x{:x}", self.size))
            .field("pgsz", &self.pgsz)
            .field("kind", &self.kind)
            .field("pte_kind", &self.pte_kind)
            .field("ctag_offset", &self.ctag_offset)
            .field("flags", &self.flags)
            .field("area", &self.area)
            .field("os_buf", &self.os_buf.id())
            .field("refs", &self.refs())
            .finish_non_exhaustive()
    }
}

impl MappedBuffer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        addr: u64,
        size: u64,
        phys_offset: u64,
        aperture: MemAperture,
        pgsz: PageSizeClass,
        rw: AccessMode,
        kind: Kind,
        pte_kind: Kind,
        ctag_offset: u64,
        ctag_lines: u32,
        flags: MapFlags,
        va_allocated: bool,
        vm_id: u64,
        area: Option<u64>,
        os_buf: Arc<dyn OsBuffer>,
    ) -> Self {
        Self {
            addr,
            size,
            phys_offset,
            aperture,
            pgsz,
            rw,
            kind,
            pte_kind,
            ctag_offset,
            ctag_lines,
            flags,
            va_allocated,
            vm_id,
            area,
            os_buf,
            refs: AtomicU32::new(1),
        }
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr + self.size
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }

    pub(crate) fn get(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference. Returns `true` when it was the last one.
    pub(crate) fn put(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

/// Every buffer mapped in one VM, ordered by GPU VA.
#[derive(Debug, Default)]
pub struct MappedBufferRegistry {
    buffers: BTreeMap<u64, Arc<MappedBuffer>>,
}

impl MappedBufferRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `buf`, refusing anything that would overlap an existing mapping.
    ///
    /// # Errors
    /// `InvalidArgument` on overlap.
    pub fn insert(&mut self, buf: Arc<MappedBuffer>) -> VmResult<()> {
        if let Some(prev) = self.find_overlap(buf.addr, buf.size) {
            return Err(VmError::invalid(format!(
                "mapping 0x{:x}+0x{:x} overlaps 0x{:x}+0x{:x}",
                buf.addr, buf.size, prev.addr, prev.size
            )));
        }
        self.buffers.insert(buf.addr, buf);
        Ok(())
    }

    pub fn remove(&mut self, addr: u64) -> Option<Arc<MappedBuffer>> {
        self.buffers.remove(&addr)
    }

    /// Buffer mapped exactly at `addr`.
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<&Arc<MappedBuffer>> {
        self.buffers.get(&addr)
    }

    /// Buffer whose range covers `addr`.
    #[must_use]
    pub fn find_containing(&self, addr: u64) -> Option<&Arc<MappedBuffer>> {
        self.buffers
            .range(..=addr)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.contains(addr))
    }

    /// Highest buffer starting strictly below `addr`.
    #[must_use]
    pub fn find_less_than(&self, addr: u64) -> Option<&Arc<MappedBuffer>> {
        self.buffers.range(..addr).next_back().map(|(_, b)| b)
    }

    /// A buffer intersecting `[addr, addr + size)`, if any.
    #[must_use]
    pub fn find_overlap(&self, addr: u64, size: u64) -> Option<&Arc<MappedBuffer>> {
        self.find_less_than(addr.saturating_add(size))
            .filter(|b| b.end() > addr)
    }

    /// A mapping of OS buffer `os_id` with key kind `kind` and `flags`, wherever it was placed.
    #[must_use]
    pub fn find_reverse(&self, os_id: u64, kind: Kind, flags: MapFlags) -> Option<&Arc<MappedBuffer>> {
        self.buffers
            .values()
            .find(|b| b.os_buf.id() == os_id && b.kind == kind && b.flags == flags)
    }

    /// Buffers intersecting `[start, end)`, in address order.
    pub fn range(&self, start: u64, end: u64) -> impl Iterator<Item = &Arc<MappedBuffer>> {
        let first = self
            .find_less_than(start.saturating_add(1))
            .filter(|b| b.end() > start)
            .map_or(start, |b| b.addr);
        self.buffers
            .range(first..end.max(first))
            .map(|(_, b)| b)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MappedBuffer>> {
        self.buffers.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
