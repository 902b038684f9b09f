//! Flash partition primitives used by the update session.
//!
//! The platform's partition table and boot selector are opaque to this
//! crate. [`FlashStorage`] is the whole contract: find the next free update
//! slot, stream an image into it, and commit it as the next boot target.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::StorageStep;

/// Platform error codes reported in the `code` reply field.
pub mod codes {
    pub const FAIL: i32 = -1;
    pub const INVALID_ARG: i32 = 0x102;
    pub const INVALID_STATE: i32 = 0x103;
    pub const INVALID_SIZE: i32 = 0x104;
    pub const TIMEOUT: i32 = 0x107;
    pub const VALIDATE_FAILED: i32 = 0x1503;
}

/// Update slot index in the platform partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub u8);

impl PartitionId {
    pub fn label(self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ota_{}", self.0)
    }
}

/// Failure reported by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("storage error {code:#x}: {message}")]
pub struct StorageError {
    pub code: i32,
    pub message: String,
}

impl StorageError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn timeout(operation: &str, elapsed: Duration) -> Self {
        Self::new(
            codes::TIMEOUT,
            format!("{operation} exceeded deadline after {}ms", elapsed.as_millis()),
        )
    }
}

/// Persistent image storage with an atomic boot-target selector.
pub trait FlashStorage {
    /// Open write handle bound to one partition.
    type Handle;

    /// Next partition that may be overwritten, never the running one.
    fn next_update_partition(&mut self) -> Option<PartitionId>;

    fn begin(&mut self, partition: PartitionId, image_size: u64)
        -> Result<Self::Handle, StorageError>;

    fn write(&mut self, handle: &mut Self::Handle, data: &[u8]) -> Result<(), StorageError>;

    /// Finalize and validate the written image. The handle is still owned by
    /// the caller and must be passed to [`FlashStorage::release`].
    fn end(&mut self, handle: &mut Self::Handle) -> Result<(), StorageError>;

    /// Give a handle back. An image that was not finalized is discarded and
    /// can never be selected for boot.
    fn release(&mut self, handle: Self::Handle);

    /// Atomically mark `partition` as the image to boot on next restart.
    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), StorageError>;
}

/// Runs every storage call on a dedicated worker thread and waits at most
/// `deadline` for it.
///
/// A call that misses the deadline is reported as a [`codes::TIMEOUT`] failure
/// while the worker keeps running it. Later calls queue behind it and are
/// bounded by the same deadline, so a wedged flash never blocks the caller.
/// The real handles stay on the worker; callers hold [`DeadlineHandle`] tokens.
pub struct DeadlineStorage<S: FlashStorage> {
    jobs: Option<mpsc::Sender<Job<S>>>,
    deadline: Duration,
    next_handle: u64,
}

struct Worker<S: FlashStorage> {
    storage: S,
    handles: HashMap<u64, S::Handle>,
}

type Job<S> = Box<dyn FnOnce(&mut Worker<S>) + Send>;

/// Write handle issued by [`DeadlineStorage`].
#[derive(Debug, PartialEq, Eq)]
pub struct DeadlineHandle {
    id: u64,
}

impl<S: FlashStorage> std::fmt::Debug for DeadlineStorage<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineStorage")
            .field("deadline", &self.deadline)
            .field("worker", &self.jobs.is_some())
            .finish()
    }
}

impl<S> DeadlineStorage<S>
where
    S: FlashStorage + Send + 'static,
    S::Handle: Send + 'static,
{
    pub fn new(inner: S, deadline: Duration) -> Self {
        let (jobs, inbox) = mpsc::channel::<Job<S>>();
        let spawned = thread::Builder::new()
            .name("beacon-storage".into())
            .spawn(move || run_worker(inner, inbox));
        let jobs = match spawned {
            Ok(_) => Some(jobs),
            Err(err) => {
                log::error!("ota: failed to start storage worker: {}", err);
                None
            }
        };
        Self { jobs, deadline, next_handle: 0 }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Run `f` against the wrapped storage once every queued call has
    /// finished. Waits without a deadline.
    pub fn with_inner<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut S) -> T + Send + 'static,
    ) -> Result<T, StorageError> {
        let (reply, outcome) = mpsc::sync_channel(1);
        self.submit(Box::new(move |worker: &mut Worker<S>| {
            let _ = reply.send(f(&mut worker.storage));
        }))?;
        outcome.recv().map_err(|_| worker_stopped())
    }

    fn submit(&self, job: Job<S>) -> Result<(), StorageError> {
        let jobs = self.jobs.as_ref().ok_or_else(worker_stopped)?;
        jobs.send(job).map_err(|_| worker_stopped())
    }

    fn call<T: Send + 'static>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Worker<S>) -> Result<T, StorageError> + Send + 'static,
    ) -> Result<T, StorageError> {
        let (reply, outcome) = mpsc::sync_channel(1);
        let started = Instant::now();
        self.submit(Box::new(move |worker: &mut Worker<S>| {
            let _ = reply.send(f(worker));
        }))?;
        match outcome.recv_timeout(self.deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "ota: storage {} missed its {}ms deadline",
                    operation,
                    self.deadline.as_millis()
                );
                Err(StorageError::timeout(operation, started.elapsed()))
            }
            Err(RecvTimeoutError::Disconnected) => Err(worker_stopped()),
        }
    }

    /// Queue the release of handle `id`; it runs after any call still in flight.
    fn discard(&self, id: u64) {
        let job: Job<S> = Box::new(move |worker: &mut Worker<S>| {
            if let Some(handle) = worker.handles.remove(&id) {
                worker.storage.release(handle);
            }
        });
        if let Err(err) = self.submit(job) {
            log::warn!("ota: could not release storage handle {}: {}", id, err);
        }
    }
}

fn worker_stopped() -> StorageError {
    StorageError::new(codes::FAIL, "storage worker stopped")
}

fn unknown_handle(id: u64) -> StorageError {
    StorageError::new(codes::INVALID_ARG, format!("unknown storage handle {id}"))
}

fn run_worker<S: FlashStorage>(storage: S, inbox: mpsc::Receiver<Job<S>>) {
    let mut worker = Worker { storage, handles: HashMap::new() };
    while let Ok(job) = inbox.recv() {
        job(&mut worker);
    }
    let Worker { mut storage, handles } = worker;
    for (_, handle) in handles {
        storage.release(handle);
    }
    log::debug!("ota: storage worker stopped");
}

impl<S> FlashStorage for DeadlineStorage<S>
where
    S: FlashStorage + Send + 'static,
    S::Handle: Send + 'static,
{
    type Handle = DeadlineHandle;

    fn next_update_partition(&mut self) -> Option<PartitionId> {
        match self.call("next_update_partition", |worker| {
            Ok(worker.storage.next_update_partition())
        }) {
            Ok(partition) => partition,
            Err(err) => {
                log::warn!("ota: no update partition: {}", err);
                None
            }
        }
    }

    fn begin(
        &mut self,
        partition: PartitionId,
        image_size: u64,
    ) -> Result<Self::Handle, StorageError> {
        let id = self.next_handle;
        self.next_handle += 1;
        let opened = self.call("begin", move |worker| {
            let handle = worker.storage.begin(partition, image_size)?;
            worker.handles.insert(id, handle);
            Ok(())
        });
        if let Err(err) = opened {
            self.discard(id);
            return Err(err);
        }
        Ok(DeadlineHandle { id })
    }

    fn write(&mut self, handle: &mut Self::Handle, data: &[u8]) -> Result<(), StorageError> {
        let id = handle.id;
        let data = data.to_vec();
        self.call("write", move |worker| {
            let Worker { storage, handles } = worker;
            let handle = handles.get_mut(&id).ok_or_else(|| unknown_handle(id))?;
            storage.write(handle, &data)
        })
    }

    fn end(&mut self, handle: &mut Self::Handle) -> Result<(), StorageError> {
        let id = handle.id;
        self.call("end", move |worker| {
            let Worker { storage, handles } = worker;
            let handle = handles.get_mut(&id).ok_or_else(|| unknown_handle(id))?;
            storage.end(handle)
        })
    }

    fn release(&mut self, handle: Self::Handle) {
        self.discard(handle.id);
    }

    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), StorageError> {
        self.call("set_boot_partition", move |worker| {
            worker.storage.set_boot_partition(partition)
        })
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    image: Vec<u8>,
    validated: bool,
}

/// RAM-backed partition table for tests and host simulation.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    slots: Vec<Slot>,
    capacity: u64,
    running: PartitionId,
    boot: PartitionId,
    open_handles: usize,
    faults: Vec<(StorageStep, StorageError)>,
}

/// Write handle issued by [`MemoryFlash`].
#[derive(Debug)]
pub struct MemoryHandle {
    partition: PartitionId,
    declared: u64,
    written: u64,
}

impl MemoryHandle {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }
}

impl MemoryFlash {
    /// `partitions` update slots of `capacity` bytes each, running from slot 0.
    pub fn new(partitions: u8, capacity: u64) -> Self {
        Self {
            slots: vec![Slot::default(); usize::from(partitions)],
            capacity,
            running: PartitionId(0),
            boot: PartitionId(0),
            open_handles: 0,
            faults: Vec::new(),
        }
    }

    /// Fail the next call at `point` with `error`.
    pub fn inject_fault(&mut self, point: StorageStep, error: StorageError) {
        self.faults.push((point, error));
    }

    pub fn image(&self, partition: PartitionId) -> Option<&[u8]> {
        self.slots.get(usize::from(partition.0)).map(|slot| slot.image.as_slice())
    }

    pub fn boot_partition(&self) -> PartitionId {
        self.boot
    }

    pub fn running_partition(&self) -> PartitionId {
        self.running
    }

    /// Handles issued by `begin` and not yet released.
    pub fn open_handles(&self) -> usize {
        self.open_handles
    }

    /// Simulate a restart into the committed boot partition.
    pub fn reboot(&mut self) {
        self.running = self.boot;
    }

    fn take_fault(&mut self, point: StorageStep) -> Result<(), StorageError> {
        match self.faults.iter().position(|(candidate, _)| *candidate == point) {
            Some(index) => Err(self.faults.remove(index).1),
            None => Ok(()),
        }
    }

    fn slot_mut(&mut self, partition: PartitionId) -> Result<&mut Slot, StorageError> {
        self.slots
            .get_mut(usize::from(partition.0))
            .ok_or_else(|| StorageError::new(codes::INVALID_ARG, format!("no slot {partition}")))
    }
}

impl FlashStorage for MemoryFlash {
    type Handle = MemoryHandle;

    fn next_update_partition(&mut self) -> Option<PartitionId> {
        let count = u8::try_from(self.slots.len()).ok()?;
        if count < 2 {
            return None;
        }
        Some(PartitionId((self.running.0 + 1) % count))
    }

    fn begin(
        &mut self,
        partition: PartitionId,
        image_size: u64,
    ) -> Result<Self::Handle, StorageError> {
        self.take_fault(StorageStep::Begin)?;
        if partition == self.running {
            return Err(StorageError::new(codes::INVALID_ARG, "cannot write running partition"));
        }
        if image_size > self.capacity {
            return Err(StorageError::new(
                codes::INVALID_SIZE,
                format!("image of {image_size} bytes exceeds slot capacity {}", self.capacity),
            ));
        }
        let slot = self.slot_mut(partition)?;
        slot.image.clear();
        slot.validated = false;
        self.open_handles += 1;
        Ok(MemoryHandle { partition, declared: image_size, written: 0 })
    }

    fn write(&mut self, handle: &mut Self::Handle, data: &[u8]) -> Result<(), StorageError> {
        self.take_fault(StorageStep::Write)?;
        let capacity = self.capacity;
        let slot = self.slot_mut(handle.partition)?;
        if slot.image.len() as u64 + data.len() as u64 > capacity {
            return Err(StorageError::new(codes::INVALID_SIZE, "write past end of partition"));
        }
        slot.image.extend_from_slice(data);
        handle.written += data.len() as u64;
        Ok(())
    }

    fn end(&mut self, handle: &mut Self::Handle) -> Result<(), StorageError> {
        self.take_fault(StorageStep::End)?;
        if handle.written == 0 || handle.written < handle.declared {
            return Err(StorageError::new(codes::VALIDATE_FAILED, "image incomplete"));
        }
        self.slot_mut(handle.partition)?.validated = true;
        Ok(())
    }

    fn release(&mut self, handle: Self::Handle) {
        self.open_handles = self.open_handles.saturating_sub(1);
        let _ = handle;
    }

    fn set_boot_partition(&mut self, partition: PartitionId) -> Result<(), StorageError> {
        self.take_fault(StorageStep::SetBootPartition)?;
        if !self.slot_mut(partition)?.validated {
            return Err(StorageError::new(codes::INVALID_STATE, "partition holds no valid image"));
        }
        self.boot = partition;
        Ok(())
    }
}
