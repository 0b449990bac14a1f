use crate::error::{VmError, VmResult};
use crate::gmmu::PageSizeClass;
use crate::utils::{align_up, is_aligned, is_power_of_two};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::ops::Range;

/// A managed range of GPU virtual address space.
///
/// First-fit interval allocator over `[base, limit)`.
#[derive(Debug)]
pub struct VaAllocator {
    name: String,
    base: u64,
    limit: u64,
    block_size: u64,

    // Reserved spans keyed by start, value is the rounded-up length.
    allocations: BTreeMap<u64, u64>,
}

impl VaAllocator {
    /// Creates an allocator over `[base, base + length)` handing out multiples of `block_size`.
    ///
    /// # Errors
    /// `InvalidArgument` if the range is empty, overflows, or is not block aligned.
    pub fn new(name: &str, base: u64, length: u64, block_size: u64) -> VmResult<Self> {
        if length == 0 || !is_power_of_two(block_size) {
            return Err(VmError::invalid(format!(
                "{name}: bad allocator geometry (length 0x{length:x}, block 0x{block_size:x})"
            )));
        }
        if !is_aligned(base, block_size) || !is_aligned(length, block_size) {
            return Err(VmError::invalid(format!(
                "{name}: range 0x{base:x}+0x{length:x} not aligned to 0x{block_size:x}"
            )));
        }
        let limit = base
            .checked_add(length)
            .ok_or_else(|| VmError::invalid(format!("{name}: range overflows")))?;

        debug!("{name}: VA allocator [0x{base:x}, 0x{limit:x}) block 0x{block_size:x}");

        Ok(Self {
            name: name.to_string(),
            base,
            limit,
            block_size,
            allocations: BTreeMap::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn bounds(&self) -> (u64, u64) {
        (self.base, self.limit)
    }

    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.limit
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> u64 {
        self.allocations.values().sum()
    }

    /// Allocates `size` bytes rounded up to `page_size`.
    ///
    /// The result is aligned to `align` when given, otherwise to `page_size`.
    ///
    /// # Errors
    /// `OutOfMemory` when no hole is large enough.
    pub fn alloc(&mut self, size: u64, page_size: u64, align: Option<u64>) -> VmResult<u64> {
        let align = align.unwrap_or(page_size).max(page_size).max(self.block_size);
        if size == 0 || !is_power_of_two(page_size) || !is_power_of_two(align) {
            return Err(VmError::invalid(format!(
                "{}: bad alloc request size 0x{size:x} page 0x{page_size:x}",
                self.name
            )));
        }
        let request_size = align_up(size, page_size.max(self.block_size))
            .ok_or_else(|| VmError::oom(format!("{}: size overflow", self.name)))?;

        let mut candidate_start = align_up(self.base, align);

        // First gap between reservations wide enough once aligned.
        for (&alloc_start, &alloc_size) in &self.allocations {
            let Some(start) = candidate_start else { break };
            if let Some(end) = start.checked_add(request_size)
                && end <= alloc_start
            {
                self.allocations.insert(start, request_size);
                return Ok(start);
            }
            candidate_start = align_up(alloc_start + alloc_size, align);
        }

        // Tail of the range, past every reservation.
        if let Some(start) = candidate_start
            && let Some(end) = start.checked_add(request_size)
            && end <= self.limit
        {
            self.allocations.insert(start, request_size);
            return Ok(start);
        }

        Err(VmError::oom(format!(
            "{}: no hole for 0x{request_size:x} bytes",
            self.name
        )))
    }

    /// Reserves exactly `[base, base + size)`.
    ///
    /// # Errors
    /// `InvalidArgument` for misaligned or out-of-range requests, `OutOfMemory`
    /// if any part of the range is already taken.
    pub fn alloc_fixed(&mut self, base: u64, size: u64, page_size: u64) -> VmResult<u64> {
        let granule = page_size.max(self.block_size);
        if size == 0 || !is_aligned(base, granule) {
            return Err(VmError::invalid(format!(
                "{}: fixed alloc 0x{base:x}+0x{size:x} misaligned",
                self.name
            )));
        }
        let size = align_up(size, granule)
            .ok_or_else(|| VmError::invalid(format!("{}: size overflow", self.name)))?;
        let end = base
            .checked_add(size)
            .filter(|&end| base >= self.base && end <= self.limit)
            .ok_or_else(|| {
                VmError::invalid(format!(
                    "{}: fixed alloc 0x{base:x}+0x{size:x} outside [0x{:x}, 0x{:x})",
                    self.name, self.base, self.limit
                ))
            })?;

        let below = self.allocations.range(..end).next_back();
        if let Some((&start, &len)) = below
            && start + len > base
        {
            return Err(VmError::oom(format!(
                "{}: fixed alloc 0x{base:x} overlaps 0x{start:x}+0x{len:x}",
                self.name
            )));
        }

        self.allocations.insert(base, size);
        Ok(base)
    }

    /// Releases an allocation made by [`alloc`](Self::alloc) or [`alloc_fixed`](Self::alloc_fixed).
    ///
    /// Freeing an address that was never handed out is a caller bug; it is logged and ignored.
    pub fn free(&mut self, addr: u64) {
        if self.allocations.remove(&addr).is_none() {
            warn!("{}: tried to free VA 0x{addr:x} which was not tracked", self.name);
        }
    }
}

/// Sub-ranges of a VM: small-page user, large-page user and kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmLayout {
    pub user: Range<u64>,
    pub user_lp: Range<u64>,
    pub kernel: Range<u64>,
}

impl VmLayout {
    /// Checks ordering and pairwise disjointness of the three regions.
    ///
    /// # Errors
    /// `InvalidArgument` describing the first violated constraint.
    pub fn validate(&self) -> VmResult<()> {
        if self.user.start > self.user.end || self.user_lp.start > self.user_lp.end {
            return Err(VmError::invalid("inverted user VMA"));
        }
        if self.kernel.start > self.kernel.end {
            return Err(VmError::invalid("inverted kernel VMA"));
        }
        if self.user.is_empty() && self.kernel.is_empty() {
            return Err(VmError::invalid("both user and kernel VMAs are empty"));
        }
        let regions = [&self.user, &self.user_lp, &self.kernel];
        for (i, a) in regions.iter().enumerate() {
            for b in &regions[i + 1..] {
                if !a.is_empty() && !b.is_empty() && a.start < b.end && b.start < a.end {
                    return Err(VmError::invalid(format!(
                        "VMA [0x{:x}, 0x{:x}) overlaps [0x{:x}, 0x{:x})",
                        a.start, a.end, b.start, b.end
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One allocator per page-size class, possibly aliased onto a shared region.
#[derive(Debug)]
pub struct VaAllocatorSet {
    regions: Vec<VaAllocator>,
    slots: [usize; 4],
}

impl VaAllocatorSet {
    /// Builds the allocators for `layout`.
    ///
    /// A dedicated large-page allocator exists only when `user_lp` is non-empty;
    /// otherwise big and huge requests share the small-page user allocator. An
    /// empty user range routes every class to the kernel allocator, and an
    /// empty kernel range routes kernel requests to the user allocator.
    ///
    /// # Errors
    /// Propagates allocator construction failures. Allocators built before the
    /// failure are dropped.
    pub fn build(
        name: &str,
        layout: &VmLayout,
        small_page_size: u64,
        big_page_size: u64,
    ) -> VmResult<Self> {
        let mut regions = Vec::with_capacity(3);

        let mut add = |region: &Range<u64>, name: String, block: u64| -> VmResult<Option<usize>> {
            if region.is_empty() {
                return Ok(None);
            }
            let va = VaAllocator::new(&name, region.start, region.end - region.start, block)
                .inspect_err(|e| debug!("{name}: unwinding VMA setup: {e}"))?;
            regions.push(va);
            Ok(Some(regions.len() - 1))
        };

        let user = add(&layout.user, name.to_string(), small_page_size)?;
        let user_lp = add(&layout.user_lp, format!("{name}_lp"), big_page_size)?;
        let kernel = add(&layout.kernel, format!("{name}-sys"), small_page_size)?;

        let Some(small) = user.or(kernel) else {
            return Err(VmError::invalid(format!("{name}: no VMA to allocate from")));
        };
        let big = user_lp.unwrap_or(small);
        let kernel = kernel.unwrap_or(small);

        Ok(Self {
            regions,
            slots: [small, big, big, kernel],
        })
    }

    #[must_use]
    pub fn get(&self, pgsz: PageSizeClass) -> &VaAllocator {
        &self.regions[self.slots[pgsz.index()]]
    }

    pub fn get_mut(&mut self, pgsz: PageSizeClass) -> &mut VaAllocator {
        &mut self.regions[self.slots[pgsz.index()]]
    }

    /// Whether two classes draw from the same allocator.
    #[must_use]
    pub const fn aliased(&self, a: PageSizeClass, b: PageSizeClass) -> bool {
        self.slots[a.index()] == self.slots[b.index()]
    }

    #[must_use]
    pub fn all_empty(&self) -> bool {
        self.regions.iter().all(VaAllocator::is_empty)
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}
