//! InMemoryGateway - テスト用のリモート
//!
//! Issue と board を BTreeMap に持つだけの RemoteGateway 実装です。
//! 失敗注入（特定 issue への変更を一時的エラーにする、create の応答を
//! 落とす、list を失敗させる）と呼び出しログを持ち、ネットワーク無しで
//! engine 全体を検証できます。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::domain::{IssueDraft, IssueNumber, IssuePatch, RemoteIssue, Status, SyncError, TaskId};
use crate::ports::RemoteGateway;

#[derive(Debug, Default)]
struct State {
    issues: BTreeMap<IssueNumber, RemoteIssue>,
    next_number: u64,
    board: bool,
    failing: BTreeSet<IssueNumber>,
    list_failures: u32,
    lost_creates: u32,
    calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryGateway {
    state: Mutex<State>,
}

impl InMemoryGateway {
    /// A tracker without a board.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_board() -> Self {
        let gateway = Self::default();
        gateway.state().board = true;
        gateway
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an issue as if someone had filed it directly on the tracker.
    pub fn seed(&self, issue: RemoteIssue) -> IssueNumber {
        let mut state = self.state();
        let number = issue.number;
        state.next_number = state.next_number.max(number.get());
        state.issues.insert(number, issue);
        number
    }

    /// Edit an issue behind the synchroniser's back.
    pub fn edit(&self, number: IssueNumber, edit: impl FnOnce(&mut RemoteIssue)) {
        if let Some(issue) = self.state().issues.get_mut(&number) {
            edit(issue);
        }
    }

    pub fn issue(&self, number: IssueNumber) -> Option<RemoteIssue> {
        self.state().issues.get(&number).cloned()
    }

    pub fn issues(&self) -> Vec<RemoteIssue> {
        self.state().issues.values().cloned().collect()
    }

    /// Issues whose body carries `id`'s back-reference.
    pub fn issues_for(&self, id: &TaskId) -> Vec<RemoteIssue> {
        self.state()
            .issues
            .values()
            .filter(|issue| issue.back_reference().as_ref() == Some(id))
            .cloned()
            .collect()
    }

    /// Every mutating call on `number` fails with a transient error.
    pub fn fail_mutations_of(&self, number: IssueNumber) {
        self.state().failing.insert(number);
    }

    pub fn heal(&self, number: IssueNumber) {
        self.state().failing.remove(&number);
    }

    /// The next `n` listings fail with a transient error.
    pub fn fail_next_lists(&self, n: u32) {
        self.state().list_failures = n;
    }

    /// The next `n` creations succeed remotely but report a transient error.
    pub fn lose_create_responses(&self, n: u32) {
        self.state().lost_creates = n;
    }

    /// Calls made so far, e.g. `"close #3"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Mutating calls made so far (everything but listing).
    pub fn mutation_count(&self) -> usize {
        self.state().calls.iter().filter(|c| *c != "list").count()
    }

    fn mutate<T>(
        &self,
        call: String,
        number: IssueNumber,
        apply: impl FnOnce(&mut RemoteIssue, bool) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.failing.contains(&number) {
            return Err(SyncError::Transient(format!("injected failure for {number}")));
        }
        let board = state.board;
        let issue = state
            .issues
            .get_mut(&number)
            .ok_or_else(|| SyncError::Permanent(format!("{number} not found")))?;
        apply(issue, board)
    }
}

#[async_trait]
impl RemoteGateway for InMemoryGateway {
    async fn list_issues(&self) -> Result<Vec<RemoteIssue>, SyncError> {
        let mut state = self.state();
        state.calls.push("list".to_string());
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(SyncError::Transient("injected list failure".into()));
        }
        Ok(state.issues.values().cloned().collect())
    }

    async fn create_issue(&self, draft: &IssueDraft) -> Result<IssueNumber, SyncError> {
        let mut state = self.state();
        state.calls.push(format!("create {}", draft.title));
        state.next_number += 1;
        let number = IssueNumber::new(state.next_number);
        let mut issue = RemoteIssue::new(number, draft.title.clone());
        issue.labels = draft.labels.clone();
        issue.milestone = draft.milestone.clone();
        issue.body = draft.body.clone();
        state.issues.insert(number, issue);
        if state.lost_creates > 0 {
            state.lost_creates -= 1;
            return Err(SyncError::Transient("connection reset after create".into()));
        }
        Ok(number)
    }

    async fn update_issue(&self, number: IssueNumber, patch: &IssuePatch) -> Result<(), SyncError> {
        self.mutate(format!("update {number}"), number, |issue, _| {
            if let Some(title) = &patch.title {
                issue.title = title.clone();
            }
            if let Some(labels) = &patch.labels {
                issue.labels = labels.clone();
            }
            if let Some(milestone) = &patch.milestone {
                issue.milestone = milestone.clone();
            }
            if let Some(body) = &patch.body {
                issue.body = body.clone();
            }
            Ok(())
        })
    }

    async fn close_issue(&self, number: IssueNumber) -> Result<(), SyncError> {
        self.mutate(format!("close {number}"), number, |issue, _| {
            issue.status = Status::Closed;
            Ok(())
        })
    }

    async fn reopen_issue(&self, number: IssueNumber) -> Result<(), SyncError> {
        self.mutate(format!("reopen {number}"), number, |issue, _| {
            issue.status = Status::Open;
            Ok(())
        })
    }

    async fn add_to_board(&self, number: IssueNumber) -> Result<(), SyncError> {
        self.mutate(format!("add {number}"), number, |issue, board| {
            if !board {
                return Err(SyncError::Permanent("no board configured".into()));
            }
            issue.on_board = true;
            Ok(())
        })
    }

    async fn move_column(&self, number: IssueNumber, column: &str) -> Result<(), SyncError> {
        self.mutate(format!("move {number} {column}"), number, |issue, _| {
            if !issue.on_board {
                return Err(SyncError::Permanent(format!("{} is not on the board", issue.number)));
            }
            issue.board_column = Some(column.to_string());
            Ok(())
        })
    }
}
