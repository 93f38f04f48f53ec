//! RecordSet - in-memory view of the local store.
//!
//! Keeps file order and rejects duplicate ids.

use std::collections::BTreeMap;

use super::errors::SyncError;
use super::ids::TaskId;
use super::record::TaskRecord;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSet {
    records: Vec<TaskRecord>,
    index: BTreeMap<TaskId, usize>,
}

impl RecordSet {
    /// Fails on the first duplicated id.
    pub fn from_records(records: Vec<TaskRecord>) -> Result<Self, SyncError> {
        let mut set = Self::default();
        for record in records {
            set.insert(record)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, record: TaskRecord) -> Result<(), SyncError> {
        if self.index.contains_key(&record.id) {
            return Err(SyncError::Store(format!("task id {} appears twice", record.id)));
        }
        self.index.insert(record.id.clone(), self.records.len());
        self.records.push(record);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskRecord> {
        self.index.get(id).map(|&i| &mut self.records[i])
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn as_slice(&self) -> &[TaskRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TaskRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_ids_are_rejected() {
        let a = TaskRecord::new(TaskId::new("T-1"), "a", "TODO");
        let b = TaskRecord::new(TaskId::new("T-1"), "b", "TODO");
        let err = RecordSet::from_records(vec![a, b]).unwrap_err();
        assert!(err.to_string().contains("T-1"));
    }

    #[test]
    fn insertion_order_is_kept() {
        let mut set = RecordSet::default();
        set.insert(TaskRecord::new(TaskId::new("b"), "b", "TODO")).unwrap();
        set.insert(TaskRecord::new(TaskId::new("a"), "a", "TODO")).unwrap();
        set.get_mut(&TaskId::new("a")).unwrap().title = "A".into();

        let titles: Vec<_> = set.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "A"]);
    }
}
