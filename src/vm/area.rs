use crate::error::{VmError, VmResult};
use crate::gmmu::{AccessMode, GmmuMapOp, GmmuUnmapOp, Kind, MappingBatch, PageSizeClass};
use crate::utils::is_aligned;
use crate::vm::instance::{Vm, VmInner};
use crate::vm::policy::class_for_page_size;
use log::debug;
use std::collections::BTreeSet;

/// Flags for [`Vm::alloc_area`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AreaFlags {
    pub fixed_offset: bool,
    pub sparse: bool,
}

impl AreaFlags {
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
    pub const fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }
}

/// A reserved range of VA with a fixed page size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmArea {
    pub addr: u64,
    pub size: u64,
    pub pgsz: PageSizeClass,
    pub sparse: bool,
    pub fixed: bool,
    /// Start addresses of the buffers mapped inside this area.
    pub buffers: BTreeSet<u64>,
}

impl VmArea {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr + self.size
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }
}

pub(crate) fn find_area_locked(inner: &VmInner, addr: u64) -> Option<&VmArea> {
    inner
        .areas
        .range(..=addr)
        .next_back()
        .map(|(_, area)| area)
        .filter(|area| area.contains(addr))
}

impl Vm {
    /// Reserves `pages * page_size` bytes of VA.
    ///
    /// `page_size` selects the allocator and becomes the page size of every
    /// fixed mapping placed inside the area. With `fixed_offset`, the area is
    /// placed at `addr`. Sparse areas are mapped right away without backing
    /// pages. Returns the base of the area.
    ///
    /// # Errors
    /// - `InvalidArgument` for a page size this VM does not know, a zero or
    ///   overflowing size, or an address given without `fixed_offset`.
    /// - `Unsupported` when big or huge pages are disabled for this VM.
    /// - `OutOfMemory` from the allocator.
    pub fn alloc_area(
        &self,
        pages: u64,
        page_size: u64,
        flags: AreaFlags,
        addr: Option<u64>,
    ) -> VmResult<u64> {
        let pgsz = class_for_page_size(
            page_size,
            self.caps.small_page_size,
            self.big_page_size,
            self.caps.huge_page_size,
        )
        .ok_or_else(|| VmError::invalid(format!("{}: bad area page size 0x{page_size:x}", self.name)))?;

        match pgsz {
            PageSizeClass::Big if !self.big_pages => {
                return Err(VmError::unsupported("big pages are disabled for this VM"));
            }
            PageSizeClass::Huge if !self.huge_pages => {
                return Err(VmError::unsupported("huge pages are disabled for this VM"));
            }
            _ => {}
        }

        let size = pages
            .checked_mul(page_size)
            .filter(|&size| size != 0)
            .ok_or_else(|| VmError::invalid(format!("{}: bad area size", self.name)))?;

        let fixed_addr = match (flags.fixed_offset, addr) {
            (true, Some(addr)) => Some(addr),
            (false, None) => None,
            (true, None) => {
                return Err(VmError::invalid("fixed area without an address"));
            }
            (false, Some(addr)) => {
                return Err(VmError::invalid(format!(
                    "area address 0x{addr:x} given without fixed offset"
                )));
            }
        };

        let mut inner = self.lock();
        let va = inner.vma.get_mut(pgsz);
        let addr = match fixed_addr {
            Some(addr) => va.alloc_fixed(addr, size, page_size)?,
            None => va.alloc(size, page_size, None)?,
        };

        if flags.sparse {
            let mapped = self.ensure_pd(&mut inner, addr, size, pgsz).and_then(|()| {
                let op = GmmuMapOp {
                    pdb: inner.pd.pdb(),
                    addr,
                    sgt: None,
                    phys_offset: 0,
                    size,
                    pgsz,
                    page_size,
                    kind: Kind::PITCH,
                    ctag_offset: 0,
                    flags: 0,
                    rw: AccessMode::ReadWrite,
                    clear_ctags: false,
                    sparse: true,
                    privileged: false,
                    aperture: None,
                };
                self.backend_map(&op, None)
            });
            if let Err(e) = mapped {
                inner.vma.get_mut(pgsz).free(addr);
                return Err(e);
            }
            self.flush_or_defer(&inner, None);
        }

        inner.areas.insert(
            addr,
            VmArea {
                addr,
                size,
                pgsz,
                sparse: flags.sparse,
                fixed: flags.fixed_offset,
                buffers: BTreeSet::new(),
            },
        );

        debug!(
            "{}: area 0x{addr:x}+0x{size:x} {pgsz:?}{}",
            self.name,
            if flags.sparse { " sparse" } else { "" }
        );
        Ok(addr)
    }

    /// Releases the area at `addr`.
    ///
    /// Every buffer still mapped in it loses one reference. Buffers pinned
    /// elsewhere stay mapped, and the area's VA stays reserved until the last
    /// of them is unmapped. The area itself is gone right away.
    ///
    /// # Errors
    /// `NotFound` if no area starts at `addr`.
    pub fn free_area(&self, addr: u64) -> VmResult<()> {
        let mut inner = self.lock();
        let buffers: Vec<u64> = inner
            .areas
            .get(&addr)
            .ok_or(VmError::NotFound(addr))?
            .buffers
            .iter()
            .copied()
            .collect();

        let mut batch = MappingBatch::default();
        for buf_addr in buffers {
            if let Some(buf) = inner.buffers.find(buf_addr).cloned() {
                self.put_locked(&mut inner, &buf, Some(&mut batch));
            }
        }

        if let Some(area) = inner.areas.remove(&addr) {
            if area.buffers.is_empty() {
                self.release_area_locked(&mut inner, &area, Some(&mut batch));
            } else {
                debug!(
                    "{}: area 0x{addr:x} keeps its VA for {} pinned buffer(s)",
                    self.name,
                    area.buffers.len()
                );
                inner.retired_areas.insert(addr, area);
            }
        }

        debug!("{}: freed area 0x{addr:x}", self.name);
        self.batch_finish_locked(&inner, batch)
    }

    /// Drops `buf_addr` from the area at `base`, releasing a retired area once it is empty.
    pub(crate) fn unlink_from_area_locked(
        &self,
        inner: &mut VmInner,
        base: u64,
        buf_addr: u64,
        batch: Option<&mut MappingBatch>,
    ) {
        if let Some(area) = inner.areas.get_mut(&base) {
            area.buffers.remove(&buf_addr);
            return;
        }

        let drained = inner.retired_areas.get_mut(&base).is_some_and(|area| {
            area.buffers.remove(&buf_addr);
            area.buffers.is_empty()
        });
        if drained && let Some(area) = inner.retired_areas.remove(&base) {
            self.release_area_locked(inner, &area, batch);
            debug!("{}: released retired area 0x{base:x}", self.name);
        }
    }

    /// Unmaps a sparse area and returns its VA. The area must already be out of `inner.areas`.
    pub(crate) fn release_area_locked(
        &self,
        inner: &mut VmInner,
        area: &VmArea,
        mut batch: Option<&mut MappingBatch>,
    ) {
        if area.sparse {
            let op = GmmuUnmapOp {
                pdb: inner.pd.pdb(),
                addr: area.addr,
                size: area.size,
                pgsz: area.pgsz,
                va_allocated: true,
                rw: AccessMode::ReadWrite,
                sparse: true,
            };
            self.backend.unmap(&op, batch.as_deref_mut());
            self.flush_or_defer(inner, batch);
        }
        inner.vma.get_mut(area.pgsz).free(area.addr);
    }

    /// The area containing `addr`, if any.
    #[must_use]
    pub fn find_area(&self, addr: u64) -> Option<VmArea> {
        find_area_locked(&self.lock(), addr).cloned()
    }

    #[must_use]
    pub fn area_count(&self) -> usize {
        self.lock().areas.len()
    }

    /// Checks that a fixed mapping of `[addr, addr + size)` with class `pgsz`
    /// fits a reserved area and collides with nothing. Returns the area base.
    ///
    /// # Errors
    /// `InvalidArgument` describing the first violated condition.
    pub(crate) fn validate_fixed(
        &self,
        inner: &VmInner,
        addr: u64,
        size: u64,
        pgsz: PageSizeClass,
    ) -> VmResult<u64> {
        let page_size = self.page_size_of(pgsz);
        if !is_aligned(addr, page_size) {
            return Err(VmError::invalid(format!(
                "{}: fixed address 0x{addr:x} not aligned to 0x{page_size:x}",
                self.name
            )));
        }

        let area = find_area_locked(inner, addr).ok_or_else(|| {
            VmError::invalid(format!(
                "{}: fixed mapping at 0x{addr:x} without a reserved area",
                self.name
            ))
        })?;

        let end = addr
            .checked_add(size)
            .ok_or_else(|| VmError::invalid("fixed mapping overflows"))?;
        if end > area.end() {
            return Err(VmError::invalid(format!(
                "{}: fixed mapping 0x{addr:x}+0x{size:x} runs past area end 0x{:x}",
                self.name,
                area.end()
            )));
        }

        if area.pgsz != pgsz {
            return Err(VmError::invalid(format!(
                "{}: fixed mapping uses {pgsz:?} pages, area uses {:?}",
                self.name, area.pgsz
            )));
        }

        if let Some(buf) = inner.buffers.find_overlap(addr, size) {
            return Err(VmError::invalid(format!(
                "{}: fixed mapping 0x{addr:x}+0x{size:x} overlaps 0x{:x}+0x{:x}",
                self.name, buf.addr, buf.size
            )));
        }

        Ok(area.addr)
    }
}
