pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;

pub use buffer::{
    AccessType, BufferPoolManager, FrameRef, LruKReplacer, PageGuard, PageReadGuard,
    PageWriteGuard,
};
pub use disk::{
    DiskFuture, DiskManager, DiskPromise, DiskRequest, DiskScheduler, FileDiskScheduler,
    PAGE_SIZE,
};
pub use error::{BufferError, BufferResult};
pub use page::PageId;
