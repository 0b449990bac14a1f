//! Mapping protocol.
//!
//! A map request is first checked against the registry for an identical
//! mapping (same OS buffer, placement, kind and flags). A hit only takes a
//! reference. A miss picks a page size, finds VA, settles the PTE kind and
//! comptags, and programs the hardware. Nothing is entered in the registry
//! unless the hardware map succeeded.

use crate::error::{VmError, VmResult};
use crate::gmmu::{
    AccessMode, GmmuMapOp, GmmuUnmapOp, Kind, MapFlags, MappingBatch, MemAperture, PageSizeClass,
};
use crate::utils::{align_up, div_round_up, ilog2};
use crate::vm::area::find_area_locked;
use crate::vm::buffer::{MappedBuffer, OsBuffer, SgTable};
use crate::vm::instance::{Vm, VmInner};
use log::{debug, error, warn};
use std::sync::Arc;

/// Everything needed to map one buffer.
#[derive(Clone)]
pub struct MapRequest<'a> {
    pub os_buf: Arc<dyn OsBuffer>,
    pub sgt: &'a SgTable,
    /// Required with [`MapFlags::fixed_offset`], forbidden otherwise.
    pub addr: Option<u64>,
    /// Bytes to map; the whole buffer when `None`.
    pub map_size: Option<u64>,
    /// Byte offset into the buffer where the mapping starts.
    pub phys_offset: u64,
    pub rw: AccessMode,
    pub flags: MapFlags,
    pub compr_kind: Option<Kind>,
    pub incompr_kind: Option<Kind>,
    pub aperture: MemAperture,
}

impl<'a> MapRequest<'a> {
    /// A read-write, allocator-placed, pitch-kind mapping of the whole buffer.
    #[must_use]
    pub fn new(os_buf: Arc<dyn OsBuffer>, sgt: &'a SgTable, aperture: MemAperture) -> Self {
        Self {
            os_buf,
            sgt,
            addr: None,
            map_size: None,
            phys_offset: 0,
            rw: AccessMode::ReadWrite,
            flags: MapFlags::new(),
            compr_kind: None,
            incompr_kind: Some(Kind::PITCH),
            aperture,
        }
    }

    /// Places the mapping at `addr` and sets the fixed-offset flag.
    #[must_use]
    pub fn at(mut self, addr: u64) -> Self {
        self.addr = Some(addr);
        self.flags.fixed_offset = true;
        self
    }

    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.map_size = Some(size);
        self
    }

    #[must_use]
    pub fn offset(mut self, phys_offset: u64) -> Self {
        self.phys_offset = phys_offset;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.rw = AccessMode::ReadOnly;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: MapFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn kinds(mut self, compr: Option<Kind>, incompr: Option<Kind>) -> Self {
        self.compr_kind = compr;
        self.incompr_kind = incompr;
        self
    }
}

/// Outcome of kind and comptag resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Compression {
    pte_kind: Kind,
    ctag_offset: u64,
    ctag_lines: u32,
    clear_ctags: bool,
}

impl Vm {
    /// Maps a buffer, or takes another reference on an identical existing mapping.
    ///
    /// # Errors
    /// - `InvalidArgument` for access, size, placement or alignment violations.
    /// - `Unsupported` when only a compressible kind was given and the page
    ///   size cannot hold it.
    /// - `OutOfMemory` when no VA is left.
    /// - Backend failures.
    pub fn map(
        &self,
        req: &MapRequest<'_>,
        mut batch: Option<&mut MappingBatch>,
    ) -> VmResult<Arc<MappedBuffer>> {
        if req.rw == AccessMode::ReadWrite && req.os_buf.rw_mode() == AccessMode::ReadOnly {
            return Err(VmError::invalid(format!(
                "{}: read-write mapping of a read-only buffer",
                self.name
            )));
        }

        let buf_size = req.os_buf.size();
        if buf_size == 0 {
            return Err(VmError::invalid(format!("{}: zero sized buffer", self.name)));
        }

        let compr_kind = req.compr_kind.filter(|_| self.enable_ctag);
        let Some(key_kind) = compr_kind.or(req.incompr_kind) else {
            return Err(VmError::invalid("map request without a usable kind"));
        };

        let fixed = req.flags.fixed_offset;
        let fixed_addr = match (fixed, req.addr) {
            (true, Some(addr)) => Some(addr),
            (false, None) => None,
            (true, None) => return Err(VmError::invalid("fixed-offset mapping without an address")),
            (false, Some(addr)) => {
                return Err(VmError::invalid(format!(
                    "address 0x{addr:x} given without the fixed-offset flag"
                )));
            }
        };
        if self.userspace_managed && !fixed {
            return Err(VmError::invalid(format!(
                "{}: userspace-managed VM needs fixed-offset mappings",
                self.name
            )));
        }

        // Cheap reject before any VA or comptag work.
        if let (Some(addr), Some(_)) = (fixed_addr, compr_kind) {
            let mask = self.caps.compression_align_mask();
            if addr & mask != req.phys_offset & mask {
                return Err(VmError::invalid(format!(
                    "{}: compressible fixed mapping 0x{addr:x} and offset 0x{:x} disagree on alignment",
                    self.name, req.phys_offset
                )));
            }
        }

        if let Some(existing) =
            self.find_mapping(&self.lock(), req.os_buf.id(), fixed_addr, req.flags, key_kind)
        {
            existing.get();
            debug!(
                "{}: reusing mapping 0x{:x} (refs {})",
                self.name,
                existing.addr,
                existing.refs()
            );
            return Ok(existing);
        }

        let small = self.caps.small_page_size;
        let map_size = align_up(req.map_size.unwrap_or(buf_size), small)
            .ok_or_else(|| VmError::invalid("map size overflows"))?;
        let buf_span = align_up(buf_size, small).unwrap_or(buf_size);
        if map_size == 0 || map_size > buf_span || req.phys_offset > buf_span - map_size {
            return Err(VmError::invalid(format!(
                "{}: 0x{map_size:x} bytes at offset 0x{:x} do not fit a 0x{buf_size:x} buffer",
                self.name, req.phys_offset
            )));
        }

        let align = req.sgt.alignment(self.caps.iommuable);
        let policy_size = if align == 0 { buf_size } else { buf_size.min(align) };

        let mut inner = self.lock();

        let area_pgsz = fixed_addr
            .and_then(|addr| find_area_locked(&inner, addr))
            .map(|area| area.pgsz);
        let pgsz = self
            .policy()
            .resolve(fixed_addr.unwrap_or(0), policy_size, area_pgsz);
        let page_size = self.page_size_of(pgsz);

        let (addr, area) = match fixed_addr {
            Some(addr) => {
                let area = self.validate_fixed(&inner, addr, map_size, pgsz)?;
                (addr, Some(area))
            }
            None => {
                let addr = inner.vma.get_mut(pgsz).alloc(map_size, page_size, None)?;
                if let Some(live) = inner.buffers.find_overlap(addr, map_size) {
                    let err = VmError::invalid(format!(
                        "{}: allocator handed out 0x{addr:x}+0x{map_size:x} over live mapping 0x{:x}+0x{:x}",
                        self.name, live.addr, live.size
                    ));
                    error!("{err}");
                    inner.vma.get_mut(pgsz).free(addr);
                    return Err(err);
                }
                (addr, None)
            }
        };
        let va_allocated = fixed_addr.is_none();

        let result = self
            .resolve_compression(req, compr_kind, page_size, buf_size)
            .and_then(|compr| {
                self.ensure_pd(&mut inner, addr, map_size, pgsz)?;
                let op = GmmuMapOp {
                    pdb: inner.pd.pdb(),
                    addr,
                    sgt: Some(req.sgt),
                    phys_offset: req.phys_offset,
                    size: map_size,
                    pgsz,
                    page_size,
                    kind: compr.pte_kind,
                    ctag_offset: compr.ctag_offset,
                    flags: req.flags.bits(),
                    rw: req.rw,
                    clear_ctags: compr.clear_ctags,
                    sparse: false,
                    privileged: false,
                    aperture: Some(req.aperture),
                };
                self.backend_map(&op, batch.as_deref_mut())?;
                Ok(compr)
            });

        let compr = match result {
            Ok(compr) => compr,
            Err(e) => {
                if va_allocated {
                    inner.vma.get_mut(pgsz).free(addr);
                }
                return Err(e);
            }
        };
        self.flush_or_defer(&inner, batch.as_deref_mut());

        let mapped = Arc::new(MappedBuffer::new(
            addr,
            map_size,
            req.phys_offset,
            req.aperture,
            pgsz,
            req.rw,
            key_kind,
            compr.pte_kind,
            compr.ctag_offset,
            compr.ctag_lines,
            req.flags,
            va_allocated,
            self.id,
            area,
            Arc::clone(&req.os_buf),
        ));

        if let Err(e) = inner.buffers.insert(Arc::clone(&mapped)) {
            self.undo_hw_map(&mut inner, &mapped, batch);
            return Err(e);
        }
        if let Some(area) = area
            && let Some(area) = inner.areas.get_mut(&area)
        {
            area.buffers.insert(addr);
        }

        debug!(
            "{}: mapped 0x{addr:x}+0x{map_size:x} {pgsz:?} kind {:?} ctag 0x{:x}",
            self.name, compr.pte_kind, compr.ctag_offset
        );
        Ok(mapped)
    }

    /// Looks for a mapping a new request would duplicate.
    fn find_mapping(
        &self,
        inner: &VmInner,
        os_id: u64,
        addr: Option<u64>,
        flags: MapFlags,
        kind: Kind,
    ) -> Option<Arc<MappedBuffer>> {
        let found = match addr {
            Some(addr) => inner
                .buffers
                .find(addr)
                .filter(|b| b.os_buf.id() == os_id && b.kind == kind && b.flags == flags),
            None => inner.buffers.find_reverse(os_id, kind, flags),
        };
        found.cloned()
    }

    /// Picks the PTE kind and comptags for a mapping with pages of `page_size`.
    fn resolve_compression(
        &self,
        req: &MapRequest<'_>,
        compr_kind: Option<Kind>,
        page_size: u64,
        buf_size: u64,
    ) -> VmResult<Compression> {
        let incompressible = req.incompr_kind.map(|kind| Compression {
            pte_kind: kind,
            ctag_offset: 0,
            ctag_lines: 0,
            clear_ctags: false,
        });

        let Some(kind) = compr_kind else {
            return incompressible.ok_or_else(|| VmError::invalid("no incompressible kind"));
        };

        if page_size < self.caps.compressible_page_size {
            return incompressible.ok_or_else(|| {
                VmError::unsupported(format!(
                    "page size 0x{page_size:x} below compressible minimum 0x{:x} and no fallback kind",
                    self.caps.compressible_page_size
                ))
            });
        }

        let comptags = match req.os_buf.comptags() {
            Some(tags) if tags.lines > 0 => Some((tags, tags.needs_clear)),
            _ => {
                let lines = u32::try_from(div_round_up(buf_size, self.caps.compression_page_size))
                    .map_err(|_| VmError::invalid("buffer needs too many comptag lines"))?;
                match req.os_buf.alloc_comptags(lines) {
                    Ok(tags) if tags.lines > 0 => Some((tags, true)),
                    Ok(_) => None,
                    Err(e) => {
                        warn!("{}: comptag allocation failed: {e}", self.name);
                        None
                    }
                }
            }
        };

        let Some((tags, clear_ctags)) = comptags else {
            warn!("{}: no comptags, mapping incompressible", self.name);
            return incompressible.ok_or_else(|| {
                VmError::oom("no comptags available and no incompressible fallback kind")
            });
        };

        Ok(Compression {
            pte_kind: kind,
            ctag_offset: tags.offset + (req.phys_offset >> ilog2(self.caps.compression_page_size)),
            ctag_lines: tags.lines,
            clear_ctags,
        })
    }

    fn undo_hw_map(
        &self,
        inner: &mut VmInner,
        mapped: &MappedBuffer,
        mut batch: Option<&mut MappingBatch>,
    ) {
        let op = GmmuUnmapOp {
            pdb: inner.pd.pdb(),
            addr: mapped.addr,
            size: mapped.size,
            pgsz: mapped.pgsz,
            va_allocated: mapped.va_allocated,
            rw: mapped.rw,
            sparse: false,
        };
        self.backend.unmap(&op, batch.as_deref_mut());
        if mapped.va_allocated {
            inner.vma.get_mut(mapped.pgsz).free(mapped.addr);
        }
        self.flush_or_defer(inner, batch);
    }

    /// Page-size class a mapping of `size` bytes at `base` would get (zero: allocator placed).
    #[must_use]
    pub fn resolve_page_size(&self, base: u64, size: u64) -> PageSizeClass {
        let inner = self.lock();
        let area = if base == 0 {
            None
        } else {
            find_area_locked(&inner, base).map(|area| area.pgsz)
        };
        self.policy().resolve(base, size, area)
    }
}
