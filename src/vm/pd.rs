//! Page directory tree.
//!
//! Directories are allocated lazily the first time a mapping touches the VA
//! they decode and are only released when the whole tree is torn down.
//! Depth is tracked with a checked counter against the chip's level bound
//! instead of trusting the level table.

use crate::error::{VmError, VmResult};
use crate::gmmu::{DmaMem, GmmuBackend, MmuLevel};
use crate::utils::align_down;
use log::trace;

/// Depth of a node in the tree, never equal to or beyond `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Depth {
    cur: usize,
    max: usize,
}

impl Depth {
    fn root(max: usize) -> VmResult<Self> {
        if max == 0 {
            return Err(VmError::PageTableDepth { depth: 0, max });
        }
        Ok(Self { cur: 0, max })
    }

    fn descend(self) -> VmResult<Self> {
        let next = self.cur + 1;
        if next >= self.max {
            return Err(VmError::PageTableDepth {
                depth: next,
                max: self.max,
            });
        }
        Ok(Self {
            cur: next,
            max: self.max,
        })
    }
}

/// One level of the hardware page-table hierarchy.
#[derive(Debug, Default)]
pub struct PdNode {
    mem: Option<DmaMem>,
    entries: Vec<PdNode>,
}

impl PdNode {
    const fn is_populated(&self) -> bool {
        self.mem.is_some() || !self.entries.is_empty()
    }

    #[must_use]
    pub const fn mem(&self) -> Option<&DmaMem> {
        self.mem.as_ref()
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug)]
pub struct PdTree {
    root: PdNode,
    max_levels: usize,
    nodes: usize,
}

impl PdTree {
    #[must_use]
    pub fn new(max_levels: usize) -> Self {
        Self {
            root: PdNode::default(),
            max_levels,
            nodes: 0,
        }
    }

    /// Allocates the root directory (the PDB).
    ///
    /// # Errors
    /// Level table deeper than the chip allows, or backend allocation failure.
    pub fn alloc_root(&mut self, backend: &dyn GmmuBackend, levels: &[MmuLevel]) -> VmResult<()> {
        self.check_levels(levels)?;
        if self.root.mem.is_none() {
            let mem = backend.alloc_pd(levels[0].pd_size())?;
            trace!("pd: root at 0x{:x} (0x{:x} bytes)", mem.gpu_va, mem.size);
            self.root.mem = Some(mem);
            self.nodes += 1;
        }
        Ok(())
    }

    /// Makes sure every directory needed to translate `[addr, addr + size)` exists.
    ///
    /// `column` selects the small (0) or big (1) page decoding of the level table.
    ///
    /// # Errors
    /// Depth violations and page-directory allocation failures. Directories
    /// allocated before a failure stay in the tree until teardown.
    pub fn ensure(
        &mut self,
        backend: &dyn GmmuBackend,
        levels: &[MmuLevel],
        addr: u64,
        size: u64,
        column: usize,
    ) -> VmResult<()> {
        self.check_levels(levels)?;
        let end = addr.saturating_add(size);
        let depth = Depth::root(self.max_levels)?;
        Self::ensure_range(
            &mut self.root,
            depth,
            levels,
            addr,
            end,
            column,
            backend,
            &mut self.nodes,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn ensure_range(
        node: &mut PdNode,
        depth: Depth,
        levels: &[MmuLevel],
        start: u64,
        end: u64,
        column: usize,
        backend: &dyn GmmuBackend,
        nodes: &mut usize,
    ) -> VmResult<()> {
        let level = &levels[depth.cur];

        if node.mem.is_none() {
            let mem = backend.alloc_pd(level.pd_size())?;
            trace!(
                "pd: level {} directory for 0x{start:x} at 0x{:x}",
                depth.cur, mem.gpu_va
            );
            node.mem = Some(mem);
            *nodes += 1;
        }

        // PTE level: nothing below it.
        if depth.cur + 1 == levels.len() {
            return Ok(());
        }

        if node.entries.is_empty() {
            node.entries.resize_with(level.num_entries(0), PdNode::default);
        }

        let coverage = level.entry_coverage(column);
        let child_depth = depth.descend()?;
        let mut va = start;
        while va < end {
            let next = align_down(va, coverage).saturating_add(coverage);
            let idx = level.entry_index(va, column);
            Self::ensure_range(
                &mut node.entries[idx],
                child_depth,
                levels,
                va,
                end.min(next),
                column,
                backend,
                nodes,
            )?;
            if next == u64::MAX {
                break;
            }
            va = next;
        }
        Ok(())
    }

    fn check_levels(&self, levels: &[MmuLevel]) -> VmResult<()> {
        if levels.is_empty() || levels.len() > self.max_levels {
            return Err(VmError::PageTableDepth {
                depth: levels.len(),
                max: self.max_levels,
            });
        }
        Ok(())
    }

    /// Frees every directory, depth first, through an explicit work list.
    pub fn free_all(&mut self, backend: &dyn GmmuBackend) {
        let mut work = vec![(std::mem::take(&mut self.root), 0usize)];

        while let Some((mut node, depth)) = work.pop() {
            debug_assert!(depth < self.max_levels, "pd depth {depth} out of bounds");

            if let Some(mem) = node.mem.take() {
                backend.free_pd(mem);
                self.nodes -= 1;
            }
            work.extend(
                node.entries
                    .drain(..)
                    .filter(PdNode::is_populated)
                    .map(|child| (child, depth + 1)),
            );
        }
    }

    /// The root directory's backing memory.
    #[must_use]
    pub const fn pdb(&self) -> Option<&DmaMem> {
        self.root.mem()
    }

    #[must_use]
    pub fn root_entries(&self) -> usize {
        self.root.num_entries()
    }

    /// Number of directories currently backed by memory.
    #[must_use]
    pub const fn node_count(&self) -> usize {
        self.nodes
    }
}
