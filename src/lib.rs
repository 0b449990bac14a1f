//! GPU virtual address-space management.
//!
//! `gmmu` describes the hardware side: the backend trait a chip generation
//! implements, its page-table level tables and its capabilities. `vm` builds
//! address spaces on top of it: VA allocation, the page directory tree,
//! reserved areas and reference-counted buffer mappings.

pub mod error;
pub mod gmmu;
pub mod utils;
pub mod vm;

pub use error::{ErrorKind, VmError, VmResult};
pub use gmmu::{
    AccessMode, GmmuBackend, Kind, MapFlags, MappingBatch, MemAperture, MmuCapabilities,
    PageSizeClass,
};
pub use vm::{MapRequest, MappedBuffer, OsBuffer, SgTable, Vm, VmConfig};
