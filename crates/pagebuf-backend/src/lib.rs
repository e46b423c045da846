//! # pagebuf-backend: reference collaborators
//!
//! Implementations of the `pagebuf-core` traits, used by the tests, the
//! benchmark and the smoke binary.
//!
//! | Trait               | Implementation      | Notes                                   |
//! |---------------------|---------------------|-----------------------------------------|
//! | PageCache           | MemPageCache        | memfd arena, real `vmap`, page limit    |
//! | BlockDevice         | MemDevice           | in-memory, threaded or manual, faults   |
//! | BlockDevice         | UringDevice         | file-backed io_uring (`io-uring`)       |
//! | DescriptorAllocator | FaultyDescriptors   | refuses on demand                       |

mod arena;
pub mod faulty;
pub mod mem_cache;
pub mod mem_device;
#[cfg(all(feature = "io-uring", target_os = "linux"))]
pub mod uring_device;

pub use faulty::FaultyDescriptors;
pub use mem_cache::{MemCacheStats, MemPage, MemPageCache};
pub use mem_device::{MemDevice, MemDeviceStats};
#[cfg(all(feature = "io-uring", target_os = "linux"))]
pub use uring_device::UringDevice;
