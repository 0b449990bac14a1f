//! The address-space object.
//!
//! A [`Vm`] is built by [`Vm::new`], which walks the initialisation states in
//! order and unwinds whatever it already created when a step fails. The VM is
//! handed out as an `Arc`; the last reference runs the full teardown from
//! `Drop`.
//!
//! All mutable state lives behind `update_gmmu_lock`. Helpers with a
//! `_locked` suffix expect the caller to hold it and take the guarded state
//! by `&mut`.

use crate::error::{VmError, VmResult};
use crate::gmmu::levels::pages_possible;
use crate::gmmu::{
    AccessMode, AsShare, GmmuBackend, GmmuMapOp, GmmuUnmapOp, Kind, MapFlags, MappingBatch,
    MemAperture, MmuCapabilities, MmuLevel, PageSizeClass,
};
use crate::utils::SZ_4G;
use crate::vm::allocator::{VaAllocatorSet, VmLayout};
use crate::vm::area::VmArea;
use crate::vm::buffer::{MappedBufferRegistry, SgTable};
use crate::vm::config::VmConfig;
use crate::vm::pd::PdTree;
use crate::vm::policy::PageSizePolicy;
use log::{debug, error, trace, warn};
use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Small pages backing the semaphore pool.
pub const SEMAPHORE_POOL_PAGES: u64 = 512;

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// Initialisation progress of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VmState {
    Uninitialized,
    AttributesSet,
    VmaAllocated,
    AddressSpaceBound,
    Active,
    Destroyed,
}

/// A mapping made with [`Vm::map_kernel`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct KernelMapping {
    pub size: u64,
    pub rw: AccessMode,
}

/// State guarded by `update_gmmu_lock`.
#[derive(Debug)]
pub(crate) struct VmInner {
    pub vma: VaAllocatorSet,
    pub pd: PdTree,
    pub buffers: MappedBufferRegistry,
    pub areas: BTreeMap<u64, VmArea>,
    /// Freed areas whose VA is held until their last surviving buffer is unmapped.
    pub retired_areas: BTreeMap<u64, VmArea>,
    pub kernel_maps: BTreeMap<u64, KernelMapping>,
    pub sema_pool: Option<u64>,
    pub state: VmState,
}

/// One GPU virtual address space.
pub struct Vm {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) caps: MmuCapabilities,
    pub(crate) backend: Arc<dyn GmmuBackend>,

    pub(crate) big_page_size: u64,
    pub(crate) va_start: u64,
    pub(crate) va_limit: u64,
    pub(crate) big_pages: bool,
    pub(crate) huge_pages: bool,
    pub(crate) unified_va: bool,
    pub(crate) enable_ctag: bool,
    pub(crate) userspace_managed: bool,
    pub(crate) layout: VmLayout,
    pub(crate) as_share: Option<AsShare>,
    pub(crate) levels: Vec<MmuLevel>,

    pub(crate) update_gmmu_lock: Mutex<VmInner>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("va_start", &format_args!("0x{:x}", self.va_start))
            .field("va_limit", &format_args!("0x{:x}", self.va_limit))
            .field("big_page_size", &self.big_page_size)
            .field("big_pages", &self.big_pages)
            .field("huge_pages", &self.huge_pages)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

fn advance(name: &str, state: &mut VmState, next: VmState) {
    debug_assert!(next > *state, "{name}: state {state:?} -> {next:?} goes backwards");
    trace!("{name}: {state:?} -> {next:?}");
    *state = next;
}

/// Splits `[low_hole, va_limit)` into the user, large-page user and kernel regions.
fn compute_layout(
    config: &VmConfig,
    caps: &MmuCapabilities,
    va_limit: u64,
) -> VmResult<VmLayout> {
    let kernel_start = va_limit - config.kernel_reserved;

    let (user, user_lp) = if !config.big_pages || caps.unified_va {
        (
            config.low_hole..kernel_start,
            kernel_start..kernel_start,
        )
    } else {
        let split = caps.split_va_limit;
        (config.low_hole..split, split..kernel_start)
    };

    let layout = VmLayout {
        user,
        user_lp,
        kernel: kernel_start..va_limit,
    };
    layout.validate()?;

    if !config.userspace_managed && layout.kernel.is_empty() {
        return Err(VmError::invalid(format!(
            "{}: kernel VMA is empty but the VM is not userspace managed",
            config.name
        )));
    }

    Ok(layout)
}

impl Vm {
    /// Creates an address space.
    ///
    /// # Errors
    /// - `InvalidArgument` for an unsupported big page size or compression
    ///   granule, or an inconsistent layout.
    /// - `OutOfMemory` when the aperture overflows or exceeds the chip maximum.
    /// - `Unsupported` for userspace-managed VMs under virtualization.
    /// - Backend errors from page-directory, share or semaphore-pool setup.
    pub fn new(
        config: VmConfig,
        caps: MmuCapabilities,
        backend: Arc<dyn GmmuBackend>,
    ) -> VmResult<Arc<Self>> {
        let name = config.name.clone();
        let mut state = VmState::Uninitialized;

        // =====================================================================
        // Attributes
        // =====================================================================

        let big_page_size = if config.big_page_size == 0 {
            caps.default_big_page_size
        } else {
            config.big_page_size
        };
        if !caps.supports_big_page_size(big_page_size) {
            return Err(VmError::invalid(format!(
                "{name}: big page size 0x{big_page_size:x} not supported"
            )));
        }
        if caps.virtualized && config.userspace_managed {
            return Err(VmError::unsupported(
                "userspace-managed address spaces under virtualization",
            ));
        }

        let enable_ctag = config.compression && caps.compression;
        if enable_ctag
            && (!caps.compression_page_size.is_power_of_two()
                || !caps.compressible_page_size.is_power_of_two())
        {
            return Err(VmError::invalid(format!(
                "{name}: compression granules 0x{:x}/0x{:x} must be powers of two",
                caps.compression_page_size, caps.compressible_page_size
            )));
        }

        let va_limit = config
            .aperture_size()
            .ok_or_else(|| VmError::oom(format!("{name}: aperture size overflows")))?;
        if va_limit > caps.max_aperture {
            return Err(VmError::oom(format!(
                "{name}: aperture 0x{va_limit:x} exceeds chip maximum 0x{:x}",
                caps.max_aperture
            )));
        }
        advance(&name, &mut state, VmState::AttributesSet);

        // =====================================================================
        // VMAs
        // =====================================================================

        let layout = compute_layout(&config, &caps, va_limit)?;
        let levels = backend.mmu_levels(big_page_size).to_vec();

        let lp_range = if caps.unified_va {
            &layout.user
        } else {
            &layout.user_lp
        };
        let lp_base = lp_range.start;
        let lp_len = lp_range.end - lp_range.start;

        let big_pages = config.big_pages
            && !layout.user.is_empty()
            && pages_possible(&levels, lp_base, lp_len);
        let huge_pages = big_pages
            && caps
                .huge_page_size
                .is_some_and(|huge| pages_possible(backend.mmu_levels(huge), lp_base, lp_len));

        if config.big_pages && !big_pages {
            debug!("{name}: user VMA cannot hold big pages, disabling them");
        }

        let vma = VaAllocatorSet::build(&name, &layout, caps.small_page_size, big_page_size)?;
        advance(&name, &mut state, VmState::VmaAllocated);

        // =====================================================================
        // Address space
        // =====================================================================

        let mut pd = PdTree::new(backend.max_page_table_levels());
        let as_share = if caps.virtualized {
            Some(backend.alloc_as_share(big_page_size, va_limit)?)
        } else {
            pd.alloc_root(backend.as_ref(), &levels)?;
            None
        };
        advance(&name, &mut state, VmState::AddressSpaceBound);

        // =====================================================================
        // Activation
        // =====================================================================

        let vm = Arc::new(Self {
            id: NEXT_VM_ID.fetch_add(1, Ordering::Relaxed),
            name: name.clone(),
            caps,
            backend,
            big_page_size,
            va_start: config.low_hole,
            va_limit,
            big_pages,
            huge_pages,
            unified_va: caps.unified_va,
            enable_ctag,
            userspace_managed: config.userspace_managed,
            layout,
            as_share,
            levels,
            update_gmmu_lock: Mutex::new(VmInner {
                vma,
                pd,
                buffers: MappedBufferRegistry::new(),
                areas: BTreeMap::new(),
                retired_areas: BTreeMap::new(),
                kernel_maps: BTreeMap::new(),
                sema_pool: None,
                state,
            }),
        });

        // A failure past this point drops `vm`, which tears everything down.
        if vm.va_limit > SZ_4G
            && let Some(pool) = &config.semaphore_pool
        {
            vm.init_semaphore_pool(&pool.sgt, pool.aperture)?;
        }

        {
            let mut inner = vm.lock();
            advance(&vm.name, &mut inner.state, VmState::Active);
        }

        debug!(
            "{}: VM {} [0x{:x}, 0x{:x}) big 0x{:x} (big pages {}, huge pages {})",
            vm.name, vm.id, vm.va_start, vm.va_limit, vm.big_page_size, vm.big_pages, vm.huge_pages
        );

        Ok(vm)
    }

    fn init_semaphore_pool(&self, sgt: &SgTable, aperture: MemAperture) -> VmResult<()> {
        let size = SEMAPHORE_POOL_PAGES * self.caps.small_page_size;
        if sgt.total_len() < size {
            return Err(VmError::invalid(format!(
                "{}: semaphore pool backing is 0x{:x} bytes, need 0x{size:x}",
                self.name,
                sgt.total_len()
            )));
        }

        let mut inner = self.lock();
        let (base, _) = inner.vma.get(PageSizeClass::Kernel).bounds();
        let addr = self.map_kernel_locked(
            &mut inner,
            sgt,
            Some(base),
            size,
            MapFlags::new(),
            AccessMode::ReadOnly,
            aperture,
        )?;
        inner.sema_pool = Some(addr);

        debug!("{}: semaphore pool at 0x{addr:x}", self.name);
        Ok(())
    }

    // =========================================================================
    // Locking and batches
    // =========================================================================

    pub(crate) fn lock(&self) -> MutexGuard<'_, VmInner> {
        self.update_gmmu_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a group of map/unmap calls that share one TLB invalidate.
    #[must_use]
    pub fn batch_start(&self) -> MappingBatch {
        MappingBatch::default()
    }

    /// Ends a batch, invalidating the TLB once if any operation asked for it.
    ///
    /// # Errors
    /// The backend's invalidate failure.
    pub fn batch_finish(&self, batch: MappingBatch) -> VmResult<()> {
        let inner = self.lock();
        self.batch_finish_locked(&inner, batch)
    }

    pub(crate) fn batch_finish_locked(&self, inner: &VmInner, batch: MappingBatch) -> VmResult<()> {
        if !batch.need_tlb_invalidate {
            return Ok(());
        }
        match inner.pd.pdb() {
            Some(pdb) => self.backend.tlb_invalidate(pdb),
            None => Ok(()),
        }
    }

    /// Defers the TLB invalidate into `batch`, or performs it right away.
    pub(crate) fn flush_or_defer(&self, inner: &VmInner, batch: Option<&mut MappingBatch>) {
        if let Some(batch) = batch {
            batch.need_tlb_invalidate = true;
            return;
        }
        if let Some(pdb) = inner.pd.pdb()
            && let Err(e) = self.backend.tlb_invalidate(pdb)
        {
            error!("{}: TLB invalidate failed: {e}", self.name);
        }
    }

    // =========================================================================
    // Backend helpers
    // =========================================================================

    #[must_use]
    pub(crate) const fn page_size_of(&self, pgsz: PageSizeClass) -> u64 {
        match pgsz {
            PageSizeClass::Small | PageSizeClass::Kernel => self.caps.small_page_size,
            PageSizeClass::Big => self.big_page_size,
            PageSizeClass::Huge => match self.caps.huge_page_size {
                Some(size) => size,
                None => self.big_page_size,
            },
        }
    }

    #[must_use]
    pub(crate) const fn policy(&self) -> PageSizePolicy {
        PageSizePolicy {
            big_pages: self.big_pages,
            unified_va: self.unified_va,
            iommuable: self.caps.iommuable,
            big_page_size: self.big_page_size,
            split_va_limit: self.caps.split_va_limit,
        }
    }

    /// Grows the page directory to cover `[addr, addr + size)`.
    pub(crate) fn ensure_pd(
        &self,
        inner: &mut VmInner,
        addr: u64,
        size: u64,
        pgsz: PageSizeClass,
    ) -> VmResult<()> {
        // Page tables of a shared address space belong to the server.
        if self.as_share.is_some() {
            return Ok(());
        }
        inner.pd.ensure(
            self.backend.as_ref(),
            &self.levels,
            addr,
            size,
            pgsz.level_column(),
        )
    }

    /// Calls the backend map primitive, treating a zero address as failure.
    pub(crate) fn backend_map(
        &self,
        op: &GmmuMapOp<'_>,
        batch: Option<&mut MappingBatch>,
    ) -> VmResult<u64> {
        match self.backend.map(op, batch) {
            Ok(0) => Err(VmError::Backend(format!(
                "{}: map of 0x{:x}+0x{:x} returned no address",
                self.name, op.addr, op.size
            ))),
            Ok(addr) => Ok(addr),
            Err(e) => {
                error!(
                    "{}: backend map of 0x{:x}+0x{:x} failed: {e}",
                    self.name, op.addr, op.size
                );
                Err(e)
            }
        }
    }

    // =========================================================================
    // Kernel mappings
    // =========================================================================

    /// Maps an internal buffer in the kernel region. It is not entered in the
    /// buffer registry.
    ///
    /// # Errors
    /// `OutOfMemory` when the kernel region is full, or the backend failure.
    pub fn map_kernel(
        &self,
        sgt: &SgTable,
        size: u64,
        flags: MapFlags,
        rw: AccessMode,
        aperture: MemAperture,
    ) -> VmResult<u64> {
        let mut inner = self.lock();
        self.map_kernel_locked(&mut inner, sgt, None, size, flags, rw, aperture)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn map_kernel_locked(
        &self,
        inner: &mut VmInner,
        sgt: &SgTable,
        addr: Option<u64>,
        size: u64,
        flags: MapFlags,
        rw: AccessMode,
        aperture: MemAperture,
    ) -> VmResult<u64> {
        let pgsz = PageSizeClass::Kernel;
        let page_size = self.page_size_of(pgsz);
        if size == 0 {
            return Err(VmError::invalid("zero sized kernel mapping"));
        }

        let va = inner.vma.get_mut(pgsz);
        let addr = match addr {
            Some(addr) => va.alloc_fixed(addr, size, page_size)?,
            None => va.alloc(size, page_size, None)?,
        };

        let mapped = self.ensure_pd(inner, addr, size, pgsz).and_then(|()| {
            let op = GmmuMapOp {
                pdb: inner.pd.pdb(),
                addr,
                sgt: Some(sgt),
                phys_offset: 0,
                size,
                pgsz,
                page_size,
                kind: Kind::PITCH,
                ctag_offset: 0,
                flags: flags.bits(),
                rw,
                clear_ctags: false,
                sparse: false,
                privileged: true,
                aperture: Some(aperture),
            };
            self.backend_map(&op, None)
        });

        if let Err(e) = mapped {
            inner.vma.get_mut(pgsz).free(addr);
            return Err(e);
        }

        self.flush_or_defer(inner, None);
        inner.kernel_maps.insert(addr, KernelMapping { size, rw });
        trace!("{}: kernel map 0x{addr:x}+0x{size:x}", self.name);
        Ok(addr)
    }

    /// Undoes [`map_kernel`](Self::map_kernel).
    ///
    /// # Errors
    /// `NotFound` if nothing was kernel-mapped at `addr`.
    pub fn unmap_kernel(&self, addr: u64) -> VmResult<()> {
        let mut inner = self.lock();
        if inner.sema_pool == Some(addr) {
            return Err(VmError::invalid(format!(
                "{}: 0x{addr:x} is the semaphore pool",
                self.name
            )));
        }
        self.unmap_kernel_locked(&mut inner, addr, None)
    }

    pub(crate) fn unmap_kernel_locked(
        &self,
        inner: &mut VmInner,
        addr: u64,
        mut batch: Option<&mut MappingBatch>,
    ) -> VmResult<()> {
        let km = inner
            .kernel_maps
            .remove(&addr)
            .ok_or(VmError::NotFound(addr))?;

        let op = GmmuUnmapOp {
            pdb: inner.pd.pdb(),
            addr,
            size: km.size,
            pgsz: PageSizeClass::Kernel,
            va_allocated: true,
            rw: km.rw,
            sparse: false,
        };
        self.backend.unmap(&op, batch.as_deref_mut());
        inner.vma.get_mut(PageSizeClass::Kernel).free(addr);
        self.flush_or_defer(inner, batch);
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn state(&self) -> VmState {
        self.lock().state
    }

    #[must_use]
    pub const fn layout(&self) -> &VmLayout {
        &self.layout
    }

    /// `[va_start, va_limit)` of the whole address space.
    #[must_use]
    pub const fn va_range(&self) -> (u64, u64) {
        (self.va_start, self.va_limit)
    }

    #[must_use]
    pub const fn big_page_size(&self) -> u64 {
        self.big_page_size
    }

    #[must_use]
    pub const fn big_pages(&self) -> bool {
        self.big_pages
    }

    #[must_use]
    pub const fn huge_pages(&self) -> bool {
        self.huge_pages
    }

    #[must_use]
    pub const fn compression_enabled(&self) -> bool {
        self.enable_ctag
    }

    #[must_use]
    pub const fn userspace_managed(&self) -> bool {
        self.userspace_managed
    }

    #[must_use]
    pub const fn as_share(&self) -> Option<AsShare> {
        self.as_share
    }

    /// Strong references to this VM.
    #[must_use]
    pub fn refs(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    /// Page directories currently backed by memory.
    #[must_use]
    pub fn pd_node_count(&self) -> usize {
        self.lock().pd.node_count()
    }

    /// GPU VA of the semaphore pool, if the VM has one.
    #[must_use]
    pub fn semaphore_pool_addr(&self) -> Option<u64> {
        self.lock().sema_pool
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        let mut inner = self.lock();
        let mut batch = MappingBatch::default();

        if let Some(addr) = inner.sema_pool.take()
            && let Err(e) = self.unmap_kernel_locked(&mut inner, addr, Some(&mut batch))
        {
            warn!("{}: semaphore pool teardown: {e}", self.name);
        }

        let buffers: Vec<_> = inner.buffers.iter().cloned().collect();
        for buf in &buffers {
            if buf.refs() > 1 {
                warn!(
                    "{}: tearing down 0x{:x} with {} reference(s) held",
                    self.name,
                    buf.addr,
                    buf.refs()
                );
            }
            self.do_unmap_locked(&mut inner, buf, Some(&mut batch));
        }

        let areas = mem::take(&mut inner.areas);
        let retired = mem::take(&mut inner.retired_areas);
        for area in areas.values().chain(retired.values()) {
            self.release_area_locked(&mut inner, area, Some(&mut batch));
        }

        let kernel_maps: Vec<u64> = inner.kernel_maps.keys().copied().collect();
        for addr in kernel_maps {
            if let Err(e) = self.unmap_kernel_locked(&mut inner, addr, Some(&mut batch)) {
                warn!("{}: kernel mapping teardown: {e}", self.name);
            }
        }

        if let Err(e) = self.batch_finish_locked(&inner, batch) {
            error!("{}: final TLB invalidate failed: {e}", self.name);
        }

        if !inner.vma.all_empty() {
            warn!("{}: VA still allocated at teardown", self.name);
        }

        inner.pd.free_all(self.backend.as_ref());

        if let Some(share) = self.as_share {
            self.backend.free_as_share(share);
        }

        inner.state = VmState::Destroyed;
        debug!("{}: VM {} destroyed", self.name, self.id);
    }
}
