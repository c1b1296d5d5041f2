pub mod allocator;

pub use allocator::{CacheFolder, CacheFolderAllocator, CachePlacement, DiskProbe, SysDiskProbe};
