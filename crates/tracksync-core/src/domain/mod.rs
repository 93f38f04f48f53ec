//! Domain model (ids, records, snapshot, change set, plan, errors).

pub mod change;
pub mod errors;
pub mod ids;
pub mod plan;
pub mod record;
pub mod record_set;
pub mod snapshot;

pub use self::change::{Classification, EntityChange, Field, FieldValues, Side};
pub use self::errors::{ErrorKind, SyncError};
pub use self::ids::{IssueNumber, TaskId};
pub use self::plan::{IssueDraft, IssuePatch, IssueRef, OpKey, Operation, Plan, RecordPatch};
pub use self::record::{LabelSet, RemoteIssue, Status, TaskRecord};
pub use self::record_set::RecordSet;
pub use self::snapshot::{Snapshot, SnapshotEntry};
