//! Block I/O requests: batches of page transfers against one device.
//!
//! A request collects directional entries, is submitted once, and records the outcome of every
//! entry separately. Failed entries are also pushed onto the request's error queue. Asynchronous
//! requests wait on the device queue until [`BlockDevice::run_queue`] or a [`BioWorker`] picks
//! them up.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use libc::{EBUSY, ECANCELED, EINVAL, ENODEV};
use parking_lot::Mutex;

use crate::{
    block::{BlockDevice, IoDirection},
    error::Result,
    pcache::PageRef,
    sync::{WaitQueue, WaitReason},
};

/// Progress of one request entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Added but not yet submitted.
    Idle,
    Queued,
    Running,
    /// The device transfer is in flight.
    Waiting,
    Completed,
    Failed(libc::c_int),
}

impl EntryState {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Run every entry on the calling thread before returning.
    Sync,
    /// Queue the request for the device worker.
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Building,
    Queued,
    Running,
    Done,
}

struct Entry {
    dir: IoDirection,
    offset: u64,
    state: EntryState,
    page: Option<PageRef>,
}

struct RequestInner {
    phase: Phase,
    entries: Vec<Entry>,
    errors: VecDeque<usize>,
    outcome: WaitReason,
}

/// A batch of page transfers against one device.
pub struct BioRequest {
    dev: Weak<BlockDevice>,
    inner: Mutex<RequestInner>,
    wait: WaitQueue,
}

impl BioRequest {
    pub fn new(dev: &Arc<BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            dev: Arc::downgrade(dev),
            inner: Mutex::new(RequestInner {
                phase: Phase::Building,
                entries: Vec::new(),
                errors: VecDeque::new(),
                outcome: WaitReason::Released,
            }),
            wait: WaitQueue::new(),
        })
    }

    /// Appends a transfer of the page at `offset`, returning the entry index.
    ///
    /// `offset` must be page aligned and inside the device.
    pub fn add(&self, dir: IoDirection, offset: u64) -> Result<usize> {
        let dev = self.dev.upgrade().ok_or(ENODEV)?;
        if offset % dev.page_size() as u64 != 0 || offset >= dev.capacity() {
            return Err(EINVAL);
        }

        let mut inner = self.inner.lock();
        if inner.phase != Phase::Building {
            return Err(EBUSY);
        }
        inner.entries.push(Entry {
            dir,
            offset,
            state: EntryState::Idle,
            page: None,
        });
        Ok(inner.entries.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry_state(&self, index: usize) -> Option<EntryState> {
        self.inner.lock().entries.get(index).map(|e| e.state)
    }

    /// Takes the page a completed read entry left behind.
    pub fn take_page(&self, index: usize) -> Option<PageRef> {
        self.inner.lock().entries.get_mut(index)?.page.take()
    }

    /// Pops the oldest failed entry as `(index, errno)`.
    pub fn pop_error(&self) -> Option<(usize, libc::c_int)> {
        let mut inner = self.inner.lock();
        let index = inner.errors.pop_front()?;
        match inner.entries[index].state {
            EntryState::Failed(e) => Some((index, e)),
            state => panic!("entry {index} on the error queue is {state:?}"),
        }
    }

    /// Number of entries on the error queue.
    pub fn error_count(&self) -> usize {
        self.inner.lock().errors.len()
    }

    /// First failure among the entries, in entry order.
    pub fn first_error(&self) -> Option<libc::c_int> {
        self.inner.lock().entries.iter().find_map(|e| match e.state {
            EntryState::Failed(e) => Some(e),
            _ => None,
        })
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().phase == Phase::Done
    }

    /// Waits for the request to finish.
    ///
    /// Returns `Released` once it completed, `Destroyed` if it was aborted or cancelled, or
    /// `Timeout` if `timeout` passed first.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitReason {
        match self.wait.wait_while(|| !self.is_done(), timeout) {
            WaitReason::Released => self.inner.lock().outcome,
            reason => reason,
        }
    }

    /// Removes a queued request from the device queue, failing every entry with `ECANCELED`.
    ///
    /// Fails with `EBUSY` once the request has left the queue.
    pub fn cancel(self: &Arc<Self>) -> Result<()> {
        let dev = self.dev.upgrade().ok_or(ENODEV)?;
        if !dev.queue.remove(self) {
            return Err(EBUSY);
        }
        self.fail_all(ECANCELED);
        Ok(())
    }

    fn set_entry_state(&self, index: usize, state: EntryState) {
        self.inner.lock().entries[index].state = state;
    }

    fn start(&self, phase: Phase) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.phase != Phase::Building {
            return Err(EBUSY);
        }
        inner.phase = phase;
        for entry in &mut inner.entries {
            entry.state = EntryState::Queued;
        }
        Ok(())
    }

    /// Runs every entry in order and completes the request.
    fn run(&self) {
        let count = {
            let mut inner = self.inner.lock();
            inner.phase = Phase::Running;
            inner.entries.len()
        };
        let dev = self.dev.upgrade();

        for index in 0..count {
            self.set_entry_state(index, EntryState::Running);
            let (dir, offset) = {
                let inner = self.inner.lock();
                (inner.entries[index].dir, inner.entries[index].offset)
            };
            let res = match &dev {
                Some(dev) => {
                    self.set_entry_state(index, EntryState::Waiting);
                    transfer(dev, dir, offset)
                }
                None => Err(ENODEV),
            };

            let mut inner = self.inner.lock();
            match res {
                Ok(page) => {
                    let entry = &mut inner.entries[index];
                    entry.state = EntryState::Completed;
                    if dir == IoDirection::Read {
                        entry.page = Some(page);
                    }
                }
                Err(e) => {
                    log::debug!("bio entry {index} ({dir:?} {offset:#x}) failed: {e}");
                    inner.entries[index].state = EntryState::Failed(e);
                    inner.errors.push_back(index);
                }
            }
        }

        self.finish(WaitReason::Released);
    }

    /// Fails every unfinished entry with `errno` and wakes waiters with `Destroyed`.
    fn fail_all(&self, errno: libc::c_int) {
        {
            let mut inner = self.inner.lock();
            let RequestInner {
                entries, errors, ..
            } = &mut *inner;
            for (index, entry) in entries.iter_mut().enumerate() {
                if !entry.state.is_finished() {
                    entry.state = EntryState::Failed(errno);
                    errors.push_back(index);
                }
            }
        }
        self.finish(WaitReason::Destroyed);
    }

    fn finish(&self, outcome: WaitReason) {
        {
            let mut inner = self.inner.lock();
            inner.phase = Phase::Done;
            inner.outcome = outcome;
        }
        self.wait.wake(outcome);
    }
}

impl fmt::Debug for BioRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BioRequest")
            .field("phase", &inner.phase)
            .field("entries", &inner.entries.len())
            .field("errors", &inner.errors.len())
            .finish()
    }
}

/// Fetches the page through the device pool, then makes the transfer the entry asks for.
///
/// A miss is filled by the pool itself, so a read only has work left when the page is invalid.
fn transfer(dev: &BlockDevice, dir: IoDirection, offset: u64) -> Result<PageRef> {
    let page = dev.page_cache_get(offset)?;
    let pending = match dir {
        IoDirection::Read => !page.state().is_valid(),
        IoDirection::Write => page.is_dirty(),
    };
    if pending {
        page.sync()?;
    }
    Ok(page)
}

#[derive(Default)]
struct QueueShared {
    pending: Mutex<VecDeque<Arc<BioRequest>>>,
    aborted: AtomicBool,
    wait: WaitQueue,
}

/// Requests waiting for a device worker.
#[derive(Default)]
pub struct RequestQueue {
    shared: Arc<QueueShared>,
}

impl RequestQueue {
    fn push(&self, req: Arc<BioRequest>) -> Result<()> {
        {
            let mut pending = self.shared.pending.lock();
            if self.shared.aborted.load(Ordering::Acquire) {
                return Err(ENODEV);
            }
            pending.push_back(req);
        }
        self.shared.wait.wake(WaitReason::Event);
        Ok(())
    }

    fn pop(&self) -> Option<Arc<BioRequest>> {
        self.shared.pending.lock().pop_front()
    }

    fn remove(&self, req: &Arc<BioRequest>) -> bool {
        let mut pending = self.shared.pending.lock();
        match pending.iter().position(|r| Arc::ptr_eq(r, req)) {
            Some(pos) => {
                pending.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails every queued request with `errno` and refuses new ones.
    pub(crate) fn abort(&self, errno: libc::c_int) {
        let drained: Vec<_> = {
            let mut pending = self.shared.pending.lock();
            self.shared.aborted.store(true, Ordering::Release);
            pending.drain(..).collect()
        };
        if !drained.is_empty() {
            log::debug!("aborting {} queued requests", drained.len());
        }
        for req in drained {
            req.fail_all(errno);
        }
        self.shared.wait.wake(WaitReason::Destroyed);
    }
}

impl fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl BlockDevice {
    /// Submits `req`, which must have been allocated against this device.
    ///
    /// Fails with `EBUSY` if the request was already submitted.
    pub fn submit(&self, req: &Arc<BioRequest>, mode: SubmitMode) -> Result<()> {
        if !Weak::ptr_eq(&req.dev, &self.this) {
            return Err(EINVAL);
        }
        match mode {
            SubmitMode::Sync => {
                req.start(Phase::Running)?;
                req.run();
                Ok(())
            }
            SubmitMode::Async => {
                req.start(Phase::Queued)?;
                if let Err(e) = self.queue.push(req.clone()) {
                    req.fail_all(e);
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    /// Runs queued requests on the calling thread until the queue is empty.
    pub fn run_queue(&self) -> usize {
        let mut ran = 0;
        while let Some(req) = self.queue.pop() {
            req.run();
            ran += 1;
        }
        ran
    }

    /// Number of requests waiting on the device queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// A thread serving one device queue. Dropping it stops the thread.
pub struct BioWorker {
    shared: Arc<QueueShared>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Starts a worker thread that runs requests as they are queued on `dev`.
pub fn spawn_worker(dev: &BlockDevice) -> BioWorker {
    let shared = dev.queue.shared.clone();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let shared = shared.clone();
        let stop = stop.clone();
        let name = format!("bio-{}", dev.id());
        thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&shared, &stop))
            .map_err(|e| log::error!("failed to spawn bio worker: {e}"))
            .ok()
    };
    BioWorker {
        shared,
        stop,
        handle,
    }
}

fn worker_loop(shared: &QueueShared, stop: &AtomicBool) {
    loop {
        shared.wait.wait_while(
            || {
                !stop.load(Ordering::Acquire)
                    && !shared.aborted.load(Ordering::Acquire)
                    && shared.pending.lock().is_empty()
            },
            None,
        );
        if stop.load(Ordering::Acquire) || shared.aborted.load(Ordering::Acquire) {
            return;
        }
        let next = shared.pending.lock().pop_front();
        if let Some(req) = next {
            req.run();
        }
    }
}

impl BioWorker {
    /// Stops the thread after the request it is running, if any.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.shared.wait.wake(WaitReason::Event);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("bio worker panicked");
            }
        }
    }
}

impl Drop for BioWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Returns the device page at `offset` after reading it through a request.
pub fn read_page(dev: &Arc<BlockDevice>, offset: u64) -> Result<PageRef> {
    let req = BioRequest::new(dev);
    let index = req.add(IoDirection::Read, offset)?;
    dev.submit(&req, SubmitMode::Sync)?;
    match req.entry_state(index) {
        Some(EntryState::Failed(e)) => Err(e),
        _ => req.take_page(index).ok_or(ENODEV),
    }
}

/// Writes `page` back to the device if it is dirty.
pub fn write_page(dev: &Arc<BlockDevice>, page: &PageRef) -> Result<()> {
    let req = BioRequest::new(dev);
    req.add(IoDirection::Write, page.offset())?;
    dev.submit(&req, SubmitMode::Sync)?;
    req.first_error().map_or(Ok(()), Err)
}

/// Writes back every dirty page of the device in one request, returning how many were written.
pub fn sync_device(dev: &Arc<BlockDevice>) -> Result<usize> {
    let Ok(pool) = dev.page_cache_pool() else {
        return Ok(0);
    };
    let req = BioRequest::new(dev);
    for offset in pool.dirty_offsets() {
        req.add(IoDirection::Write, offset)?;
    }
    if req.is_empty() {
        return Ok(0);
    }
    dev.submit(&req, SubmitMode::Sync)?;
    match req.first_error() {
        Some(e) => Err(e),
        None => Ok(req.len()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::{
        block::{
            DevId, DeviceOps, DeviceRegistry, Geometry,
            storage::{MemStorage, Storage, StorageDevice},
        },
        pcache::PageCache,
    };

    fn device() -> (
        DeviceRegistry,
        Arc<BlockDevice>,
        Arc<StorageDevice<MemStorage>>,
    ) {
        let registry = DeviceRegistry::default();
        let storage = Arc::new(StorageDevice::new(MemStorage::new(16 * 4096)));
        let dev = registry
            .register(
                DevId::new(8, 0),
                Geometry::new(512, 1024, 16 * 4096),
                storage.clone(),
            )
            .unwrap();
        (registry, dev, storage)
    }

    /// Fails writes of pages at or past `limit`.
    struct Faulty {
        inner: StorageDevice<MemStorage>,
        limit: u64,
        calls: AtomicU32,
    }

    impl DeviceOps for Faulty {
        fn strategy(&self, devid: DevId, page: &PageCache, dir: IoDirection) -> Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if dir == IoDirection::Write && page.offset() >= self.limit {
                return Err(libc::EIO);
            }
            self.inner.strategy(devid, page, dir)
        }
    }

    #[test]
    fn add_validates_offsets() {
        let (_registry, dev, _) = device();
        let req = BioRequest::new(&dev);
        assert_eq!(req.add(IoDirection::Read, 100), Err(EINVAL));
        assert_eq!(req.add(IoDirection::Read, 16 * 4096), Err(EINVAL));
        assert_eq!(req.add(IoDirection::Read, 4096), Ok(0));
        assert_eq!(req.entry_state(0), Some(EntryState::Idle));
    }

    #[test]
    fn sync_submit_reads_pages() {
        let (_registry, dev, storage) = device();
        storage
            .with_storage_mut(|s| s.write_at(&[7; 4096], 2 * 4096))
            .unwrap();

        let req = BioRequest::new(&dev);
        req.add(IoDirection::Read, 0).unwrap();
        req.add(IoDirection::Read, 2 * 4096).unwrap();
        dev.submit(&req, SubmitMode::Sync).unwrap();

        assert!(req.is_done());
        assert_eq!(req.wait(None), WaitReason::Released);
        assert_eq!(req.entry_state(1), Some(EntryState::Completed));
        let page = req.take_page(1).unwrap();
        page.with_data(|data| assert!(data.iter().all(|&b| b == 7)));
        assert_eq!(storage.reads(), 8);
    }

    #[test]
    fn resubmit_is_busy() {
        let (_registry, dev, _) = device();
        let req = BioRequest::new(&dev);
        req.add(IoDirection::Read, 0).unwrap();
        dev.submit(&req, SubmitMode::Sync).unwrap();
        assert_eq!(dev.submit(&req, SubmitMode::Sync), Err(EBUSY));
        assert_eq!(req.add(IoDirection::Read, 0), Err(EBUSY));
    }

    #[test]
    fn failures_are_recorded_per_entry() {
        let registry = DeviceRegistry::default();
        let ops = Arc::new(Faulty {
            inner: StorageDevice::new(MemStorage::new(4 * 4096)),
            limit: 2 * 4096,
            calls: AtomicU32::new(0),
        });
        let dev = registry
            .register(DevId::new(8, 1), Geometry::new(512, 4096, 4 * 4096), ops)
            .unwrap();

        for offset in [0, 4096, 2 * 4096, 3 * 4096] {
            dev.page_cache_get(offset).unwrap().write(0, b"x").unwrap();
        }

        let req = BioRequest::new(&dev);
        for offset in [0, 4096, 2 * 4096, 3 * 4096] {
            req.add(IoDirection::Write, offset).unwrap();
        }
        dev.submit(&req, SubmitMode::Sync).unwrap();

        assert_eq!(req.entry_state(0), Some(EntryState::Completed));
        assert_eq!(req.entry_state(1), Some(EntryState::Completed));
        assert_eq!(req.entry_state(2), Some(EntryState::Failed(libc::EIO)));
        assert_eq!(req.error_count(), 2);
        assert_eq!(req.pop_error(), Some((2, libc::EIO)));
        assert_eq!(req.pop_error(), Some((3, libc::EIO)));
        assert_eq!(req.pop_error(), None);

        // Failed pages stay dirty for a later retry.
        let pool = dev.page_cache_pool().unwrap();
        assert_eq!(pool.dirty_offsets(), vec![2 * 4096, 3 * 4096]);
    }

    #[test]
    fn async_requests_wait_for_the_queue() {
        let (_registry, dev, _) = device();
        let req = BioRequest::new(&dev);
        req.add(IoDirection::Read, 0).unwrap();
        dev.submit(&req, SubmitMode::Async).unwrap();

        assert_eq!(req.entry_state(0), Some(EntryState::Queued));
        assert_eq!(
            req.wait(Some(Duration::from_millis(10))),
            WaitReason::Timeout
        );
        assert_eq!(dev.run_queue(), 1);
        assert_eq!(req.wait(None), WaitReason::Released);
        assert_eq!(req.entry_state(0), Some(EntryState::Completed));
    }

    #[test]
    fn cancel_only_while_queued() {
        let (_registry, dev, _) = device();
        let req = BioRequest::new(&dev);
        req.add(IoDirection::Read, 0).unwrap();
        dev.submit(&req, SubmitMode::Async).unwrap();

        req.cancel().unwrap();
        assert_eq!(req.wait(None), WaitReason::Destroyed);
        assert_eq!(req.entry_state(0), Some(EntryState::Failed(ECANCELED)));
        assert_eq!(dev.run_queue(), 0);
        assert_eq!(req.cancel(), Err(EBUSY));
    }

    #[test]
    fn worker_completes_requests() {
        let (_registry, dev, storage) = device();
        let worker = spawn_worker(&dev);

        let reqs: Vec<_> = (0..4)
            .map(|i| {
                let req = BioRequest::new(&dev);
                req.add(IoDirection::Read, i * 4096).unwrap();
                dev.submit(&req, SubmitMode::Async).unwrap();
                req
            })
            .collect();
        for req in &reqs {
            assert_eq!(req.wait(Some(Duration::from_secs(10))), WaitReason::Released);
        }
        worker.stop();
        assert_eq!(storage.reads(), 16);
    }

    #[test]
    fn unregister_aborts_queued_requests() {
        let (registry, dev, _) = device();
        let req = BioRequest::new(&dev);
        req.add(IoDirection::Read, 0).unwrap();
        dev.submit(&req, SubmitMode::Async).unwrap();

        registry.unregister(dev.id());
        assert_eq!(req.wait(None), WaitReason::Destroyed);
        assert_eq!(req.entry_state(0), Some(EntryState::Failed(ENODEV)));

        let late = BioRequest::new(&dev);
        late.add(IoDirection::Read, 0).unwrap();
        assert_eq!(dev.submit(&late, SubmitMode::Async), Err(ENODEV));
    }

    #[test]
    fn page_helpers_round_trip_through_storage() {
        let (_registry, dev, storage) = device();
        let page = read_page(&dev, 4096).unwrap();
        page.write(100, b"bio").unwrap();
        write_page(&dev, &page).unwrap();
        assert!(!page.is_dirty());

        let mut out = [0u8; 3];
        storage.with_storage(|s| s.read_at(&mut out, 4096 + 100)).unwrap();
        assert_eq!(&out, b"bio");
    }

    #[test]
    fn sync_device_writes_every_dirty_page() {
        let (_registry, dev, storage) = device();
        for offset in [0, 3 * 4096, 5 * 4096] {
            dev.page_cache_get(offset).unwrap().write(0, &[1]).unwrap();
        }
        assert_eq!(sync_device(&dev).unwrap(), 3);
        assert_eq!(dev.page_cache_pool().unwrap().dirty_len(), 0);
        assert_eq!(storage.writes(), 12);
        assert_eq!(sync_device(&dev).unwrap(), 0);
    }

    #[test]
    fn foreign_request_is_rejected() {
        let (_registry, dev, _) = device();
        let other_registry = DeviceRegistry::default();
        let other = other_registry
            .register(
                DevId::new(8, 2),
                Geometry::new(512, 4096, 4096),
                Arc::new(StorageDevice::new(MemStorage::new(4096))),
            )
            .unwrap();
        let req = BioRequest::new(&other);
        assert_eq!(dev.submit(&req, SubmitMode::Sync), Err(EINVAL));
    }
}
