mod common;

use common::{COMPRESSIBLE, INCOMPRESSIBLE, MockGmmu, TestBuffer, iommu_sgt, new_vm, test_caps};
use gpuvm::error::{ErrorKind, VmError};
use gpuvm::gmmu::{MemAperture, PageSizeClass};
use gpuvm::utils::{SZ_2M, SZ_4K, SZ_64K};
use gpuvm::vm::{AreaFlags, MapRequest, Vm};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

const AREA_BASE: u64 = 0x1000_0000;

fn fixed_area(vm: &Vm, pages: u64, page_size: u64) -> u64 {
    vm.alloc_area(pages, page_size, AreaFlags::new().fixed_offset(), Some(AREA_BASE))
        .unwrap()
}

#[test]
fn fixed_mapping_dedup_needs_two_unmaps() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    assert_eq!(fixed_area(&vm, 16, SZ_64K), AREA_BASE);

    let buf = TestBuffer::new(1, 2 * SZ_64K);
    let sgt = iommu_sgt(2 * SZ_64K);
    let req = MapRequest::new(buf, &sgt, MemAperture::Vidmem).at(AREA_BASE);

    let first = vm.map(&req, None).unwrap();
    let second = vm.map(&req, None).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.refs(), 2);
    assert_eq!(first.pgsz, PageSizeClass::Big);
    assert!(!first.va_allocated);
    assert_eq!(first.area, Some(AREA_BASE));
    assert_eq!(backend.map_count(), 1);

    // The second holder never lets go, so the sync wait runs out.
    let err = vm.unmap(AREA_BASE, None).unwrap_err();
    assert_eq!(
        err,
        VmError::Timeout {
            addr: AREA_BASE,
            refs: 2
        }
    );
    assert_eq!(backend.unmap_count(), 0);
    assert_eq!(first.refs(), 1);

    vm.unmap(AREA_BASE, None).unwrap();
    let unmaps = backend.unmaps.lock().unwrap().clone();
    assert_eq!(unmaps.len(), 1);
    assert!(!unmaps[0].va_allocated);
    assert_eq!(vm.buffer_count(), 0);
    assert!(vm.find_area(AREA_BASE).unwrap().buffers.is_empty());
}

#[test]
fn sync_unmap_waits_for_other_holders() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    fixed_area(&vm, 16, SZ_64K);

    let sgt = iommu_sgt(SZ_64K);
    let mapped = vm
        .map(
            &MapRequest::new(TestBuffer::new(1, SZ_64K), &sgt, MemAperture::Vidmem).at(AREA_BASE),
            None,
        )
        .unwrap();
    let pinned = vm.pin(mapped.addr).unwrap();

    let holder = {
        let vm = Arc::clone(&vm);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            vm.put_buffer(&pinned, None).unwrap();
        })
    };

    vm.unmap(AREA_BASE, None).unwrap();
    holder.join().unwrap();

    assert_eq!(backend.unmap_count(), 1);
    assert_eq!(vm.buffer_count(), 0);
}

#[test]
fn sync_unmap_timeout_keeps_mapping_for_remaining_holder() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    fixed_area(&vm, 16, SZ_64K);

    let sgt = iommu_sgt(SZ_64K);
    let mapped = vm
        .map(
            &MapRequest::new(TestBuffer::new(1, SZ_64K), &sgt, MemAperture::Vidmem).at(AREA_BASE),
            None,
        )
        .unwrap();
    let pinned = vm.pin(mapped.addr).unwrap();

    let start = Instant::now();
    let err = vm.unmap(AREA_BASE, None).unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(err.kind(), ErrorKind::Timeout);

    assert_eq!(vm.buffer_count(), 1);
    assert_eq!(pinned.refs(), 1);
    assert_eq!(backend.unmap_count(), 0);

    vm.put_buffer(&pinned, None).unwrap();
    assert_eq!(backend.unmap_count(), 1);
}

#[test]
fn fixed_mappings_are_validated_against_areas() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    let sgt = iommu_sgt(2 * SZ_64K);
    let map_at = |id: u64, addr: u64| {
        vm.map(
            &MapRequest::new(TestBuffer::new(id, 2 * SZ_64K), &sgt, MemAperture::Vidmem).at(addr),
            None,
        )
    };

    // No reservation yet.
    assert_eq!(map_at(1, AREA_BASE).unwrap_err().kind(), ErrorKind::InvalidArgument);

    fixed_area(&vm, 4, SZ_64K);
    // Not aligned to the area's page size.
    assert_eq!(
        map_at(2, AREA_BASE + SZ_4K).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    // Runs past the end of the area.
    assert_eq!(
        map_at(3, AREA_BASE + 3 * SZ_64K).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    map_at(4, AREA_BASE).unwrap();
    // Overlaps the mapping above.
    assert_eq!(
        map_at(5, AREA_BASE + SZ_64K).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    map_at(6, AREA_BASE + 2 * SZ_64K).unwrap();

    assert_eq!(vm.find_area(AREA_BASE).unwrap().buffers.len(), 2);
    assert_eq!(backend.map_count(), 2);
}

#[test]
fn misaligned_compressible_fixed_map_fails_fast() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    fixed_area(&vm, 16, SZ_64K);

    let buf = TestBuffer::new(1, 4 * SZ_64K);
    let sgt = iommu_sgt(4 * SZ_64K);
    let req = MapRequest::new(buf.clone(), &sgt, MemAperture::Vidmem)
        .kinds(Some(COMPRESSIBLE), Some(INCOMPRESSIBLE))
        .at(AREA_BASE)
        .size(SZ_64K)
        .offset(SZ_4K);

    assert_eq!(vm.map(&req, None).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(buf.comptag_allocs.load(Ordering::SeqCst), 0);
    assert_eq!(backend.map_count(), 0);
}

#[test]
fn sparse_area_lifecycle() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);

    let base = vm
        .alloc_area(8, SZ_64K, AreaFlags::new().sparse(), None)
        .unwrap();
    let rec = backend.last_map();
    assert!(rec.sparse);
    assert_eq!(rec.addr, base);
    assert_eq!(rec.size, 8 * SZ_64K);
    assert_eq!(rec.pgsz, PageSizeClass::Big);

    let sgt = iommu_sgt(SZ_64K);
    let mapped = vm
        .map(
            &MapRequest::new(TestBuffer::new(1, SZ_64K), &sgt, MemAperture::Vidmem).at(base),
            None,
        )
        .unwrap();
    vm.unmap(mapped.addr, None).unwrap();

    vm.free_area(base).unwrap();
    let unmaps = backend.unmaps.lock().unwrap().clone();
    assert_eq!(unmaps.len(), 2);
    assert!(unmaps[0].sparse, "buffer unmap inherits the area's sparse flag");
    assert!(unmaps[1].sparse);
    assert_eq!(unmaps[1].size, 8 * SZ_64K);
    assert!(vm.find_area(base).is_none());
}

#[test]
fn freeing_an_area_drops_its_buffers() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    fixed_area(&vm, 16, SZ_64K);
    let sgt = iommu_sgt(SZ_64K);

    let a = vm
        .map(
            &MapRequest::new(TestBuffer::new(1, SZ_64K), &sgt, MemAperture::Vidmem).at(AREA_BASE),
            None,
        )
        .unwrap();
    let b = vm
        .map(
            &MapRequest::new(TestBuffer::new(2, SZ_64K), &sgt, MemAperture::Vidmem)
                .at(AREA_BASE + SZ_64K),
            None,
        )
        .unwrap();
    let pinned = vm.pin(b.addr).unwrap();

    let before = backend.invalidate_count();
    vm.free_area(AREA_BASE).unwrap();
    assert_eq!(backend.invalidate_count(), before + 1);
    assert_eq!(vm.area_count(), 0);
    assert!(vm.find_buffer(a.addr).is_none());
    assert_eq!(vm.find_buffer(b.addr).map(|m| m.refs()), Some(1));

    vm.put_buffer(&pinned, None).unwrap();
    assert_eq!(vm.buffer_count(), 0);
    assert_eq!(backend.unmap_count(), 2);

    assert_eq!(vm.free_area(AREA_BASE), Err(VmError::NotFound(AREA_BASE)));
}

#[test]
fn pinned_buffer_keeps_freed_area_va_reserved() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    let base = vm.alloc_area(1, SZ_64K, AreaFlags::new(), None).unwrap();
    let sgt = iommu_sgt(SZ_64K);

    let live = vm
        .map(
            &MapRequest::new(TestBuffer::new(1, SZ_64K), &sgt, MemAperture::Vidmem).at(base),
            None,
        )
        .unwrap();
    let pinned = vm.pin(live.addr).unwrap();
    vm.free_area(base).unwrap();
    assert_eq!(vm.area_count(), 0);
    assert!(vm.find_area(base).is_none());
    assert_eq!(vm.find_buffer(base).map(|m| m.refs()), Some(1));

    // The freed range is still backing the pinned buffer.
    let err = vm
        .alloc_area(1, SZ_64K, AreaFlags::new().fixed_offset(), Some(base))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);

    let other = vm
        .map(&MapRequest::new(TestBuffer::new(2, SZ_64K), &sgt, MemAperture::Vidmem), None)
        .unwrap();
    assert!(other.addr >= live.end() || other.end() <= live.addr);
    assert_eq!(backend.unmap_count(), 0);
    assert_eq!(vm.buffer_count(), 2);

    vm.put_buffer(&pinned, None).unwrap();
    assert!(vm.find_buffer(base).is_none());
    assert_eq!(backend.unmaps.lock().unwrap()[0].addr, base);
    assert_eq!(
        vm.alloc_area(1, SZ_64K, AreaFlags::new().fixed_offset(), Some(base)),
        Ok(base)
    );
}

#[test]
fn freed_sparse_area_stays_mapped_until_pinned_buffer_goes() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    let base = vm
        .alloc_area(4, SZ_64K, AreaFlags::new().sparse(), None)
        .unwrap();
    let sgt = iommu_sgt(SZ_64K);
    let live = vm
        .map(
            &MapRequest::new(TestBuffer::new(1, SZ_64K), &sgt, MemAperture::Vidmem)
                .at(base + SZ_64K),
            None,
        )
        .unwrap();
    let pinned = vm.pin(live.addr).unwrap();

    vm.free_area(base).unwrap();
    assert_eq!(backend.unmap_count(), 0);

    vm.put_buffer(&pinned, None).unwrap();
    let unmaps = backend.unmaps.lock().unwrap().clone();
    assert_eq!(unmaps.len(), 2);
    assert_eq!((unmaps[0].addr, unmaps[0].sparse), (base + SZ_64K, true));
    assert_eq!((unmaps[1].addr, unmaps[1].size), (base, 4 * SZ_64K));
    assert!(unmaps[1].sparse);
}

#[test]
fn failed_sparse_area_map_returns_its_va() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    let base = vm.alloc_area(4, SZ_64K, AreaFlags::new(), None).unwrap();
    vm.free_area(base).unwrap();

    backend.fail_maps.store(true, Ordering::SeqCst);
    let err = vm
        .alloc_area(4, SZ_64K, AreaFlags::new().sparse(), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Backend);
    assert_eq!(vm.area_count(), 0);
    assert!(vm.find_area(base).is_none());

    backend.fail_maps.store(false, Ordering::SeqCst);
    assert_eq!(
        vm.alloc_area(4, SZ_64K, AreaFlags::new().sparse(), None),
        Ok(base)
    );
}

#[test]
fn area_page_size_must_be_enabled() {
    let backend = MockGmmu::new();
    let config = common::scenario_config().with_big_pages(false);
    let vm = Vm::new(config, test_caps(), backend).unwrap();

    let err = vm.alloc_area(4, SZ_64K, AreaFlags::new(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    let err = vm.alloc_area(1, SZ_2M, AreaFlags::new(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    let err = vm.alloc_area(1, 0x8000, AreaFlags::new(), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    assert!(vm.alloc_area(4, SZ_4K, AreaFlags::new(), None).is_ok());
}

#[test]
fn huge_page_area_maps_with_huge_class() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    let base = vm.alloc_area(2, SZ_2M, AreaFlags::new(), None).unwrap();
    assert_eq!(base % SZ_2M, 0);
    assert_eq!(vm.find_area(base + SZ_2M).map(|a| a.pgsz), Some(PageSizeClass::Huge));

    let sgt = iommu_sgt(SZ_2M);
    let mapped = vm
        .map(
            &MapRequest::new(TestBuffer::new(1, SZ_2M), &sgt, MemAperture::Vidmem).at(base + SZ_2M),
            None,
        )
        .unwrap();
    assert_eq!(mapped.pgsz, PageSizeClass::Huge);
    assert_eq!(vm.resolve_page_size(base, SZ_4K), PageSizeClass::Huge);
}

#[test]
fn area_address_needs_fixed_flag() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);
    let err = vm
        .alloc_area(1, SZ_4K, AreaFlags::new(), Some(AREA_BASE))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = vm
        .alloc_area(1, SZ_4K, AreaFlags::new().fixed_offset(), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    fixed_area(&vm, 1, SZ_4K);
    let err = vm
        .alloc_area(1, SZ_4K, AreaFlags::new().fixed_offset(), Some(AREA_BASE))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
}

#[test]
fn teardown_releases_everything() {
    let backend = MockGmmu::new();
    let vm = new_vm(&backend);

    let sparse = vm
        .alloc_area(4, SZ_64K, AreaFlags::new().sparse(), None)
        .unwrap();
    fixed_area(&vm, 16, SZ_64K);

    let sgt = iommu_sgt(SZ_64K);
    let in_area = TestBuffer::new(1, SZ_64K);
    vm.map(
        &MapRequest::new(in_area.clone(), &sgt, MemAperture::Vidmem).at(AREA_BASE),
        None,
    )
    .unwrap();
    let loose = TestBuffer::new(2, SZ_64K);
    let held = vm
        .map(&MapRequest::new(loose.clone(), &sgt, MemAperture::Vidmem), None)
        .unwrap();
    vm.pin(held.addr).unwrap();
    assert!(vm.pd_node_count() > 1);

    drop(vm);

    let unmaps = backend.unmaps.lock().unwrap().clone();
    // Two buffers, then the sparse area.
    assert_eq!(unmaps.len(), 3);
    assert!(unmaps.iter().any(|u| u.addr == sparse && u.sparse));
    assert_eq!(in_area.unmapped.lock().unwrap().len(), 1);
    assert_eq!(loose.unmapped.lock().unwrap().len(), 1);
    assert_eq!(backend.live_pd_count(), 0);
}
