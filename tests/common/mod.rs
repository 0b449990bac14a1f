#![allow(dead_code)]

use gpuvm::error::{VmError, VmResult};
use gpuvm::gmmu::{
    AccessMode, AsShare, DmaMem, GmmuBackend, GmmuMapOp, GmmuUnmapOp, Kind, MappingBatch,
    MmuCapabilities, MmuLevel, PageSizeClass,
};
use gpuvm::vm::{Comptags, OsBuffer, SgChunk, SgTable, Vm, VmConfig};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Three levels, 37-bit VA, one last-level PDE covers 64 KiB.
pub const TEST_LEVELS: [MmuLevel; 3] = [
    MmuLevel::new([36, 36], [27, 27], 8),
    MmuLevel::new([26, 26], [16, 16], 8),
    MmuLevel::new([15, 15], [12, 16], 8),
];

pub const COMPRESSIBLE: Kind = Kind(0xdb);
pub const INCOMPRESSIBLE: Kind = Kind(0xfe);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRecord {
    pub addr: u64,
    pub size: u64,
    pub pgsz: PageSizeClass,
    pub kind: Kind,
    pub ctag_offset: u64,
    pub clear_ctags: bool,
    pub sparse: bool,
    pub privileged: bool,
    pub rw: AccessMode,
    pub batched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmapRecord {
    pub addr: u64,
    pub size: u64,
    pub pgsz: PageSizeClass,
    pub va_allocated: bool,
    pub sparse: bool,
}

/// Records every call the VM makes into the hardware layer.
#[derive(Default)]
pub struct MockGmmu {
    pub maps: Mutex<Vec<MapRecord>>,
    pub unmaps: Mutex<Vec<UnmapRecord>>,
    pub invalidates: AtomicUsize,
    pub fail_maps: AtomicBool,
    next_handle: AtomicU64,
    live_pds: Mutex<BTreeSet<u64>>,
    live_shares: Mutex<BTreeSet<u64>>,
}

impl MockGmmu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn map_count(&self) -> usize {
        self.maps.lock().unwrap().len()
    }

    pub fn unmap_count(&self) -> usize {
        self.unmaps.lock().unwrap().len()
    }

    pub fn last_map(&self) -> MapRecord {
        self.maps.lock().unwrap().last().cloned().unwrap()
    }

    pub fn invalidate_count(&self) -> usize {
        self.invalidates.load(Ordering::SeqCst)
    }

    pub fn live_pd_count(&self) -> usize {
        self.live_pds.lock().unwrap().len()
    }

    pub fn live_share_count(&self) -> usize {
        self.live_shares.lock().unwrap().len()
    }
}

impl GmmuBackend for MockGmmu {
    fn map(&self, op: &GmmuMapOp<'_>, batch: Option<&mut MappingBatch>) -> VmResult<u64> {
        if self.fail_maps.load(Ordering::SeqCst) {
            return Err(VmError::Backend("injected map failure".into()));
        }
        self.maps.lock().unwrap().push(MapRecord {
            addr: op.addr,
            size: op.size,
            pgsz: op.pgsz,
            kind: op.kind,
            ctag_offset: op.ctag_offset,
            clear_ctags: op.clear_ctags,
            sparse: op.sparse,
            privileged: op.privileged,
            rw: op.rw,
            batched: batch.is_some(),
        });
        Ok(op.addr)
    }

    fn unmap(&self, op: &GmmuUnmapOp<'_>, _batch: Option<&mut MappingBatch>) {
        self.unmaps.lock().unwrap().push(UnmapRecord {
            addr: op.addr,
            size: op.size,
            pgsz: op.pgsz,
            va_allocated: op.va_allocated,
            sparse: op.sparse,
        });
    }

    fn tlb_invalidate(&self, _pdb: &DmaMem) -> VmResult<()> {
        self.invalidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn mmu_levels(&self, _big_page_size: u64) -> &[MmuLevel] {
        &TEST_LEVELS
    }

    fn max_page_table_levels(&self) -> usize {
        TEST_LEVELS.len()
    }

    fn alloc_pd(&self, size: u64) -> VmResult<DmaMem> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.live_pds.lock().unwrap().insert(handle);
        Ok(DmaMem {
            gpu_va: handle << 12,
            size,
            handle,
        })
    }

    fn free_pd(&self, mem: DmaMem) {
        assert!(self.live_pds.lock().unwrap().remove(&mem.handle), "double free of PD");
    }

    fn alloc_as_share(&self, _big_page_size: u64, _va_limit: u64) -> VmResult<AsShare> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.live_shares.lock().unwrap().insert(handle);
        Ok(AsShare { handle })
    }

    fn free_as_share(&self, share: AsShare) {
        self.live_shares.lock().unwrap().remove(&share.handle);
    }
}

/// An OS buffer with optional comptag support.
pub struct TestBuffer {
    id: u64,
    size: u64,
    rw: AccessMode,
    comptags_supported: bool,
    comptags: Mutex<Option<Comptags>>,
    pub comptag_allocs: AtomicUsize,
    pub unmapped: Mutex<Vec<u64>>,
}

impl TestBuffer {
    pub fn new(id: u64, size: u64) -> Arc<Self> {
        Arc::new(Self::build(id, size, AccessMode::ReadWrite, true))
    }

    pub fn read_only(id: u64, size: u64) -> Arc<Self> {
        Arc::new(Self::build(id, size, AccessMode::ReadOnly, true))
    }

    pub fn without_comptags(id: u64, size: u64) -> Arc<Self> {
        Arc::new(Self::build(id, size, AccessMode::ReadWrite, false))
    }

    fn build(id: u64, size: u64, rw: AccessMode, comptags_supported: bool) -> Self {
        Self {
            id,
            size,
            rw,
            comptags_supported,
            comptags: Mutex::new(None),
            comptag_allocs: AtomicUsize::new(0),
            unmapped: Mutex::new(Vec::new()),
        }
    }
}

impl OsBuffer for TestBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn rw_mode(&self) -> AccessMode {
        self.rw
    }

    fn comptags(&self) -> Option<Comptags> {
        *self.comptags.lock().unwrap()
    }

    fn alloc_comptags(&self, lines: u32) -> VmResult<Comptags> {
        if !self.comptags_supported {
            return Err(VmError::OutOfMemory("comptag pool exhausted".into()));
        }
        self.comptag_allocs.fetch_add(1, Ordering::SeqCst);
        let tags = Comptags {
            offset: self.id * 0x100,
            lines,
            needs_clear: true,
        };
        *self.comptags.lock().unwrap() = Some(Comptags {
            needs_clear: false,
            ..tags
        });
        Ok(tags)
    }

    fn on_unmapped(&self, addr: u64) {
        self.unmapped.lock().unwrap().push(addr);
    }
}

/// Scatter list of an IOMMU-mapped buffer, aligned far beyond any page size.
pub fn iommu_sgt(size: u64) -> SgTable {
    SgTable::iommu_mapped(
        0x4000_0000,
        vec![SgChunk {
            phys: 0x8000_0000,
            dma: 0,
            length: size,
        }],
    )
}

pub fn test_caps() -> MmuCapabilities {
    MmuCapabilities::new().with_max_aperture(1 << 37)
}

/// 4 GiB user VMA above a 64 KiB low hole, 64 KiB of kernel VMA on top.
pub fn scenario_config() -> VmConfig {
    VmConfig::new("test")
        .with_low_hole(0x10000)
        .with_user_reserved(0x1_0000_0000)
        .with_kernel_reserved(0x10000)
}

pub fn new_vm(backend: &Arc<MockGmmu>) -> Arc<Vm> {
    Vm::new(scenario_config(), test_caps(), backend.clone()).unwrap()
}
