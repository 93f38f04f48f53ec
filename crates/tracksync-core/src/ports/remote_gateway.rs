//! RemoteGateway port - issue tracker + board への capability interface
//!
//! 実装は薄いアダプタに留めます。リトライは executor 側の
//! `RetryPolicy` が担当するので、実装は一時的な失敗を
//! `SyncError::Transient` として返すだけで良い。

use async_trait::async_trait;

use crate::domain::{IssueDraft, IssueNumber, IssuePatch, RemoteIssue, SyncError};

/// Issue and board operations against the remote tracker.
///
/// Calls are idempotent where the remote allows it: closing a closed issue or
/// adding an issue that is already on the board is not an error.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// All issues, open and closed, with board membership filled in.
    async fn list_issues(&self) -> Result<Vec<RemoteIssue>, SyncError>;

    async fn create_issue(&self, draft: &IssueDraft) -> Result<IssueNumber, SyncError>;

    async fn update_issue(&self, number: IssueNumber, patch: &IssuePatch) -> Result<(), SyncError>;

    async fn close_issue(&self, number: IssueNumber) -> Result<(), SyncError>;

    async fn reopen_issue(&self, number: IssueNumber) -> Result<(), SyncError>;

    async fn add_to_board(&self, number: IssueNumber) -> Result<(), SyncError>;

    async fn move_column(&self, number: IssueNumber, column: &str) -> Result<(), SyncError>;
}
