pub mod manager;
pub mod scheduler;

pub use manager::{DiskManager, PageData, PAGE_SIZE};
pub use scheduler::{DiskFuture, DiskPromise, DiskRequest, DiskScheduler, FileDiskScheduler};
