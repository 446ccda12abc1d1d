//! Disk request scheduling.
//!
//! All page I/O funnels through a scheduler: callers build a [`DiskRequest`]
//! carrying a fresh [`DiskPromise`], submit it with [`DiskScheduler::schedule`],
//! and block on the paired [`DiskFuture`] until the request completes. The
//! file-backed implementation drains requests on a dedicated worker thread,
//! so requests are serialized in submission order.

use crate::disk::manager::{DiskManager, PageData};
use crate::page::PageId;
use anyhow::{bail, Result};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

/// One read or write of a single page.
///
/// For a write, `data` holds the bytes to persist; for a read, it is the
/// buffer the worker fills. Either way the buffer comes back through the
/// promise, so the caller regains ownership on completion.
pub struct DiskRequest {
    pub is_write: bool,
    pub data: Box<PageData>,
    pub page_id: PageId,
    pub ack: DiskPromise,
}

/// Completion side of a scheduled request.
pub struct DiskPromise {
    sender: Sender<Result<Box<PageData>>>,
}

impl DiskPromise {
    /// Creates a connected promise/future pair.
    pub fn pair() -> (DiskPromise, DiskFuture) {
        let (sender, receiver) = mpsc::channel();
        (DiskPromise { sender }, DiskFuture { receiver })
    }

    pub fn fulfill(self, result: Result<Box<PageData>>) {
        // The waiter may have given up; a send to a dropped future is fine.
        let _ = self.sender.send(result);
    }
}

/// Waiting side of a scheduled request.
pub struct DiskFuture {
    receiver: Receiver<Result<Box<PageData>>>,
}

impl DiskFuture {
    /// Blocks until the scheduler fulfills the paired promise.
    pub fn wait(self) -> Result<Box<PageData>> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => bail!("disk request was dropped before completion"),
        }
    }
}

/// The narrow interface the buffer pool consumes. Injected at pool
/// construction; tests substitute their own implementations.
pub trait DiskScheduler: Send + Sync {
    fn create_promise(&self) -> (DiskPromise, DiskFuture);
    fn schedule(&self, request: DiskRequest);
}

/// Scheduler backed by a [`DiskManager`] and a single worker thread.
pub struct FileDiskScheduler {
    sender: Mutex<Sender<Option<DiskRequest>>>,
    worker: Option<JoinHandle<()>>,
}

impl FileDiskScheduler {
    pub fn new(disk: DiskManager) -> Self {
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("disk-scheduler".into())
            .spawn(move || Self::run(disk, receiver))
            .expect("failed to spawn disk scheduler worker");

        Self {
            sender: Mutex::new(sender),
            worker: Some(worker),
        }
    }

    // A `None` on the queue is the shutdown signal.
    fn run(mut disk: DiskManager, receiver: Receiver<Option<DiskRequest>>) {
        debug!("disk scheduler worker started");
        while let Ok(Some(request)) = receiver.recv() {
            let DiskRequest {
                is_write,
                mut data,
                page_id,
                ack,
            } = request;

            let result = if is_write {
                disk.write_page(page_id, &data[..]).map(|_| data)
            } else {
                disk.read_page(page_id, &mut data[..]).map(|_| data)
            };

            if let Err(err) = &result {
                warn!("disk request for page {} failed: {:#}", page_id, err);
            }
            ack.fulfill(result);
        }
        debug!("disk scheduler worker stopped");
    }
}

impl DiskScheduler for FileDiskScheduler {
    fn create_promise(&self) -> (DiskPromise, DiskFuture) {
        DiskPromise::pair()
    }

    fn schedule(&self, request: DiskRequest) {
        if self.sender.lock().send(Some(request)).is_err() {
            // Worker already gone; dropping the request drops its promise and
            // the waiter observes the failure.
            warn!("disk scheduler is shut down, dropping request");
        }
    }
}

impl Drop for FileDiskScheduler {
    fn drop(&mut self) {
        let _ = self.sender.lock().send(None);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
