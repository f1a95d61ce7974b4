//! Memory that tango objects live in.
//!
//! - [`shmem`] - Named POSIX shared memory with typestate cleanup
//! - [`region`] - The [`Region`] abstraction and a heap-backed variant

pub mod region;
pub mod shmem;

pub use region::{HeapRegion, REGION_ALIGN, Region};
pub use shmem::{Creator, Opener, SharedMemorySafe, ShmError, ShmPath, ShmRegion};
