pub mod fast;
pub mod keys;
pub mod memory;
pub mod primary;

pub use fast::{FastOp, FastStore, StoreError};
pub use memory::MemoryFastStore;
pub use primary::{MemoryPrimaryStore, PrimaryError, PrimaryStore};
