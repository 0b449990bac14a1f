use crate::error::{VmError, VmResult};
use crate::gmmu::{GmmuUnmapOp, MappingBatch};
use crate::vm::buffer::MappedBuffer;
use crate::vm::instance::{Vm, VmInner};
use log::{debug, error, warn};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SYNC_UNMAP_POLL: Duration = Duration::from_millis(10);
const SYNC_UNMAP_TIMEOUT: Duration = Duration::from_millis(100);

/// Sleeps until the caller holds the only reference to `buf`, or the deadline passes.
fn sync_unmap_wait(buf: &MappedBuffer) -> VmResult<()> {
    let start = Instant::now();
    loop {
        let refs = buf.refs();
        if refs <= 1 {
            return Ok(());
        }
        if start.elapsed() >= SYNC_UNMAP_TIMEOUT {
            return Err(VmError::Timeout {
                addr: buf.addr,
                refs,
            });
        }
        thread::sleep(SYNC_UNMAP_POLL);
    }
}

impl Vm {
    /// Drops the caller's reference on the mapping at `addr`.
    ///
    /// The hardware mapping goes away with the last reference. Fixed-offset
    /// mappings first wait, without the VM lock, for every other holder to let go.
    ///
    /// # Errors
    /// - `NotFound` if nothing is mapped at `addr`.
    /// - `Timeout` if other holders kept their references past the deadline.
    ///   The caller's reference is dropped anyway and the mapping stays until
    ///   the remaining holders release it.
    pub fn unmap(&self, addr: u64, batch: Option<&mut MappingBatch>) -> VmResult<()> {
        let mut inner = self.lock();
        let buf = inner
            .buffers
            .find(addr)
            .cloned()
            .ok_or(VmError::NotFound(addr))?;

        let mut waited = Ok(());
        if buf.flags.fixed_offset {
            drop(inner);
            waited = sync_unmap_wait(&buf);
            inner = self.lock();

            let still_mapped = inner
                .buffers
                .find(addr)
                .is_some_and(|cur| Arc::ptr_eq(cur, &buf));
            if !still_mapped {
                return Err(VmError::NotFound(addr));
            }
        }

        self.put_locked(&mut inner, &buf, batch);

        if let Err(e) = &waited {
            error!("{}: {e}; dropped the caller's reference anyway", self.name);
        }
        waited
    }

    /// Drops one reference, unmapping on the last.
    pub(crate) fn put_locked(
        &self,
        inner: &mut VmInner,
        buf: &Arc<MappedBuffer>,
        batch: Option<&mut MappingBatch>,
    ) {
        if buf.put() {
            self.do_unmap_locked(inner, buf, batch);
        }
    }

    /// Removes a mapping from the hardware and from every index, regardless of references.
    pub(crate) fn do_unmap_locked(
        &self,
        inner: &mut VmInner,
        buf: &Arc<MappedBuffer>,
        mut batch: Option<&mut MappingBatch>,
    ) {
        let sparse = buf
            .area
            .and_then(|area| inner.areas.get(&area).or_else(|| inner.retired_areas.get(&area)))
            .is_some_and(|area| area.sparse);

        let op = GmmuUnmapOp {
            pdb: inner.pd.pdb(),
            addr: buf.addr,
            size: buf.size,
            pgsz: buf.pgsz,
            va_allocated: buf.va_allocated,
            rw: buf.rw,
            sparse,
        };
        self.backend.unmap(&op, batch.as_deref_mut());
        if buf.va_allocated {
            inner.vma.get_mut(buf.pgsz).free(buf.addr);
        }
        self.flush_or_defer(inner, batch.as_deref_mut());

        inner.buffers.remove(buf.addr);
        if let Some(area) = buf.area {
            self.unlink_from_area_locked(inner, area, buf.addr, batch);
        }
        buf.os_buf.on_unmapped(buf.addr);

        debug!("{}: unmapped 0x{:x}+0x{:x}", self.name, buf.addr, buf.size);
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    #[must_use]
    pub fn find_buffer(&self, addr: u64) -> Option<Arc<MappedBuffer>> {
        self.lock().buffers.find(addr).cloned()
    }

    #[must_use]
    pub fn find_buffer_containing(&self, addr: u64) -> Option<Arc<MappedBuffer>> {
        self.lock().buffers.find_containing(addr).cloned()
    }

    /// Mappings intersecting `[start, end)`, in address order.
    #[must_use]
    pub fn find_buffer_range(&self, start: u64, end: u64) -> Vec<Arc<MappedBuffer>> {
        self.lock().buffers.range(start, end).cloned().collect()
    }

    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.lock().buffers.len()
    }

    // =========================================================================
    // Reference management
    // =========================================================================

    /// Takes an extra reference on the mapping at `addr`.
    ///
    /// # Errors
    /// `NotFound` if nothing is mapped there.
    pub fn pin(&self, addr: u64) -> VmResult<Arc<MappedBuffer>> {
        let inner = self.lock();
        let buf = inner.buffers.find(addr).ok_or(VmError::NotFound(addr))?;
        buf.get();
        Ok(Arc::clone(buf))
    }

    /// Drops a reference taken by [`map`](Self::map) or [`pin`](Self::pin).
    ///
    /// # Errors
    /// `NotFound` if `buf` is not a live mapping of this VM.
    pub fn put_buffer(
        &self,
        buf: &Arc<MappedBuffer>,
        batch: Option<&mut MappingBatch>,
    ) -> VmResult<()> {
        let mut inner = self.lock();
        if !self.is_registered(&inner, buf) {
            return Err(VmError::NotFound(buf.addr));
        }
        self.put_locked(&mut inner, buf, batch);
        Ok(())
    }

    /// References every current mapping, e.g. to serialise the address space.
    ///
    /// Hand the result back to [`put_buffers`](Self::put_buffers).
    #[must_use]
    pub fn get_buffers(&self) -> Vec<Arc<MappedBuffer>> {
        let inner = self.lock();
        inner
            .buffers
            .iter()
            .inspect(|buf| buf.get())
            .cloned()
            .collect()
    }

    /// Releases the references taken by [`get_buffers`](Self::get_buffers)
    /// with a single TLB invalidate for the whole set.
    ///
    /// # Errors
    /// The backend's invalidate failure.
    pub fn put_buffers(&self, buffers: Vec<Arc<MappedBuffer>>) -> VmResult<()> {
        let mut inner = self.lock();
        let mut batch = MappingBatch::default();

        for buf in &buffers {
            if self.is_registered(&inner, buf) {
                self.put_locked(&mut inner, buf, Some(&mut batch));
            } else {
                warn!("{}: 0x{:x} is no longer mapped, skipping put", self.name, buf.addr);
            }
        }

        self.batch_finish_locked(&inner, batch)
    }

    fn is_registered(&self, inner: &VmInner, buf: &Arc<MappedBuffer>) -> bool {
        buf.vm_id == self.id
            && inner
                .buffers
                .find(buf.addr)
                .is_some_and(|cur| Arc::ptr_eq(cur, buf))
    }
}
