use gpuvm::error::VmResult;
use gpuvm::gmmu::levels::GP10B_LEVELS;
use gpuvm::gmmu::{
    DmaMem, GmmuBackend, GmmuMapOp, GmmuUnmapOp, Kind, MappingBatch, MemAperture,
    MmuCapabilities, MmuLevel,
};
use gpuvm::utils::{SZ_1G, SZ_2M, SZ_4K, SZ_64K};
use gpuvm::vm::{AreaFlags, Comptags, MapRequest, OsBuffer, SgChunk, SgTable, Vm, VmConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// Pretends to be a gp10b: prints every hardware operation instead of writing PTEs.
struct PrintingGmmu {
    next_pd: AtomicU64,
}

impl GmmuBackend for PrintingGmmu {
    fn map(&self, op: &GmmuMapOp<'_>, batch: Option<&mut MappingBatch>) -> VmResult<u64> {
        println!(
            "  [hw] map   0x{:010x} +0x{:08x} {:?} kind 0x{:02x} ctag 0x{:x}{}{}",
            op.addr,
            op.size,
            op.pgsz,
            op.kind.0,
            op.ctag_offset,
            if op.sparse { " sparse" } else { "" },
            if batch.is_some() { " (batched)" } else { "" },
        );
        Ok(op.addr)
    }

    fn unmap(&self, op: &GmmuUnmapOp<'_>, _batch: Option<&mut MappingBatch>) {
        println!("  [hw] unmap 0x{:010x} +0x{:08x} {:?}", op.addr, op.size, op.pgsz);
    }

    fn tlb_invalidate(&self, pdb: &DmaMem) -> VmResult<()> {
        println!("  [hw] TLB invalidate (PDB 0x{:x})", pdb.gpu_va);
        Ok(())
    }

    fn mmu_levels(&self, _big_page_size: u64) -> &[MmuLevel] {
        &GP10B_LEVELS
    }

    fn max_page_table_levels(&self) -> usize {
        GP10B_LEVELS.len()
    }

    fn alloc_pd(&self, size: u64) -> VmResult<DmaMem> {
        let handle = self.next_pd.fetch_add(1, Ordering::Relaxed);
        Ok(DmaMem {
            gpu_va: 0x8_0000_0000 + handle * SZ_64K,
            size,
            handle,
        })
    }

    fn free_pd(&self, _mem: DmaMem) {}
}

struct DemoBuffer {
    id: u64,
    size: u64,
}

impl OsBuffer for DemoBuffer {
    fn id(&self) -> u64 {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn comptags(&self) -> Option<Comptags> {
        None
    }

    fn alloc_comptags(&self, lines: u32) -> VmResult<Comptags> {
        Ok(Comptags {
            offset: self.id * 0x40,
            lines,
            needs_clear: true,
        })
    }
}

fn sgt(size: u64) -> SgTable {
    SgTable::iommu_mapped(
        0x1_0000_0000,
        vec![SgChunk {
            phys: 0x8000_0000,
            dma: 0,
            length: size,
        }],
    )
}

fn main() -> VmResult<()> {
    println!("=== GPU VM walkthrough ===");

    let backend = Arc::new(PrintingGmmu {
        next_pd: AtomicU64::new(1),
    });
    let config = VmConfig::new("demo")
        .with_low_hole(SZ_2M)
        .with_user_reserved(16 * SZ_1G)
        .with_kernel_reserved(4 * SZ_1G)
        .with_semaphore_pool(SgTable::contiguous(0x9000_0000, SZ_2M), MemAperture::Sysmem);

    println!("\n[1] Creating the address space");
    let vm = Vm::new(config, MmuCapabilities::default(), backend)?;
    let layout = vm.layout();
    println!("  user   [0x{:x}, 0x{:x})", layout.user.start, layout.user.end);
    println!("  kernel [0x{:x}, 0x{:x})", layout.kernel.start, layout.kernel.end);
    println!("  big pages: {}, huge pages: {}", vm.big_pages(), vm.huge_pages());

    println!("\n[2] Mapping a texture (compressible) and a small constant buffer");
    let tex_sgt = sgt(4 * SZ_2M);
    let texture = Arc::new(DemoBuffer {
        id: 1,
        size: 4 * SZ_2M,
    });
    let tex = vm.map(
        &MapRequest::new(texture.clone(), &tex_sgt, MemAperture::Vidmem)
            .kinds(Some(Kind(0xdb)), Some(Kind(0xfe))),
        None,
    )?;

    let cb_sgt = sgt(SZ_4K);
    let cb = vm.map(
        &MapRequest::new(Arc::new(DemoBuffer { id: 2, size: SZ_4K }), &cb_sgt, MemAperture::Sysmem)
            .kinds(Some(Kind(0xdb)), Some(Kind(0xfe))),
        None,
    )?;
    println!("  texture -> {tex:?}");
    println!("  const   -> {cb:?}");

    println!("\n[3] Mapping the texture again is free");
    let again = vm.map(
        &MapRequest::new(texture, &tex_sgt, MemAperture::Vidmem)
            .kinds(Some(Kind(0xdb)), Some(Kind(0xfe))),
        None,
    )?;
    println!("  same mapping at 0x{:x}, refs {}", again.addr, again.refs());

    println!("\n[4] Reserving a sparse area and placing a buffer inside it");
    let area = vm.alloc_area(32, SZ_64K, AreaFlags::new().sparse(), None)?;
    let fixed_sgt = sgt(SZ_64K);
    vm.map(
        &MapRequest::new(Arc::new(DemoBuffer { id: 3, size: SZ_64K }), &fixed_sgt, MemAperture::Vidmem)
            .at(area + 4 * SZ_64K),
        None,
    )?;

    println!("\n[5] Unmapping in one batch");
    let mut batch = vm.batch_start();
    vm.unmap(tex.addr, Some(&mut batch))?;
    vm.unmap(tex.addr, Some(&mut batch))?;
    vm.unmap(cb.addr, Some(&mut batch))?;
    vm.batch_finish(batch)?;

    println!(
        "\n[6] Dropping the VM ({} mapping(s), {} page directories left)",
        vm.buffer_count(),
        vm.pd_node_count()
    );
    drop(vm);

    println!("\n=== done ===");
    Ok(())
}
