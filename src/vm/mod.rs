pub mod allocator;
pub mod area;
pub mod buffer;
pub mod config;
pub mod instance;
pub mod map;
pub mod pd;
pub mod policy;
pub mod unmap;

pub use allocator::{VaAllocator, VaAllocatorSet, VmLayout};
pub use area::{AreaFlags, VmArea};
pub use buffer::{Comptags, MappedBuffer, MappedBufferRegistry, OsBuffer, SgChunk, SgTable};
pub use config::{SemaphorePoolConfig, VmConfig};
pub use instance::{SEMAPHORE_POOL_PAGES, Vm, VmState};
pub use map::MapRequest;
pub use policy::PageSizePolicy;
