pub mod guard;
pub mod lru_k;
pub mod pool;

pub use guard::{PageGuard, PageReadGuard, PageWriteGuard};
pub use lru_k::{AccessType, FrameId, LruKReplacer};
pub use pool::{BufferPoolManager, FrameRef};
