//! In-memory record and snapshot stores for tests.
//!
//! Staged writes land in the shared state only on commit, like the file
//! stores. `fail_next_stage` makes the next `stage` call fail so flush
//! atomicity can be checked.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::domain::{Snapshot, SyncError, TaskRecord};
use crate::ports::{RecordStore, SnapshotStore, StagedWrite};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Commits `value` into `slot`.
struct SlotWrite<T> {
    slot: Arc<Mutex<T>>,
    value: T,
    commits: Arc<AtomicUsize>,
}

impl<T: Send> StagedWrite for SlotWrite<T> {
    fn commit(self: Box<Self>) -> Result<(), SyncError> {
        let SlotWrite { slot, value, commits } = *self;
        *lock(&slot) = value;
        commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Slot<T> {
    value: Arc<Mutex<T>>,
    commits: Arc<AtomicUsize>,
    fail_next: AtomicBool,
}

impl<T: Clone + Send + 'static> Slot<T> {
    fn new(value: T) -> Self {
        Self {
            value: Arc::new(Mutex::new(value)),
            commits: Arc::default(),
            fail_next: AtomicBool::new(false),
        }
    }

    fn get(&self) -> T {
        lock(&self.value).clone()
    }

    fn stage(&self, value: T) -> Result<Box<dyn StagedWrite>, SyncError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Store("injected stage failure".into()));
        }
        Ok(Box::new(SlotWrite {
            slot: Arc::clone(&self.value),
            value,
            commits: Arc::clone(&self.commits),
        }))
    }
}

#[derive(Default)]
pub struct InMemoryRecordStore {
    slot: Slot<Vec<TaskRecord>>,
}

impl InMemoryRecordStore {
    pub fn new(records: Vec<TaskRecord>) -> Self {
        Self { slot: Slot::new(records) }
    }

    pub fn records(&self) -> Vec<TaskRecord> {
        self.slot.get()
    }

    /// Overwrite the stored records, as a user editing the file would.
    pub fn replace(&self, records: Vec<TaskRecord>) {
        *lock(&self.slot.value) = records;
    }

    pub fn commits(&self) -> usize {
        self.slot.commits.load(Ordering::SeqCst)
    }

    pub fn fail_next_stage(&self) {
        self.slot.fail_next.store(true, Ordering::SeqCst);
    }
}

impl RecordStore for InMemoryRecordStore {
    fn load(&self) -> Result<Vec<TaskRecord>, SyncError> {
        Ok(self.slot.get())
    }

    fn stage(&self, records: &[TaskRecord]) -> Result<Box<dyn StagedWrite>, SyncError> {
        self.slot.stage(records.to_vec())
    }
}

#[derive(Default)]
pub struct InMemorySnapshotStore {
    slot: Slot<Snapshot>,
}

impl InMemorySnapshotStore {
    pub fn new(snapshot: Snapshot) -> Self {
        Self { slot: Slot::new(snapshot) }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.slot.get()
    }

    /// Forget everything, as if the snapshot file had been deleted.
    pub fn clear(&self) {
        *lock(&self.slot.value) = Snapshot::default();
    }

    pub fn commits(&self) -> usize {
        self.slot.commits.load(Ordering::SeqCst)
    }

    pub fn fail_next_stage(&self) {
        self.slot.fail_next.store(true, Ordering::SeqCst);
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(&self) -> Result<Snapshot, SyncError> {
        Ok(self.slot.get())
    }

    fn stage(&self, snapshot: &Snapshot) -> Result<Box<dyn StagedWrite>, SyncError> {
        self.slot.stage(snapshot.clone())
    }
}
