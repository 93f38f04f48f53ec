//! Task records (local side) and remote issues (tracker side).

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ids::{IssueNumber, TaskId};

/// Labels are compared as a set; order in the file or on the remote is irrelevant.
pub type LabelSet = BTreeSet<String>;

/// Normalized open/closed status.
///
/// Local `[ ]`/`[x]` and remote `open`/`closed` are both mapped here before any
/// comparison. Raw representations are never compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Open,
    Closed,
}

impl Status {
    /// `- [x]` → Closed, `- [ ]` → Open.
    pub fn from_checkbox(checked: bool) -> Self {
        if checked { Status::Closed } else { Status::Open }
    }

    /// Remote issue state (`"open"` / `"closed"`), case-insensitive.
    pub fn from_remote_state(state: &str) -> Option<Self> {
        match state.to_ascii_lowercase().as_str() {
            "open" => Some(Status::Open),
            "closed" => Some(Status::Closed),
            _ => None,
        }
    }

    pub fn is_closed(self) -> bool {
        self == Status::Closed
    }

    pub fn checkbox(self) -> &'static str {
        match self {
            Status::Open => "[ ]",
            Status::Closed => "[x]",
        }
    }
}

/// Parse a comma separated label list, dropping blanks.
pub fn parse_labels(raw: &str) -> LabelSet {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A local unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub title: String,
    pub status: Status,
    pub section: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: LabelSet,
    /// Absent means "never pushed".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<IssueNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tracker lines under the task that tracksync does not interpret,
    /// written back verbatim. Never synced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<String>,
}

impl TaskRecord {
    pub fn new(id: TaskId, title: impl Into<String>, section: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            status: Status::Open,
            section: section.into(),
            kind: None,
            priority: None,
            milestone: None,
            labels: LabelSet::new(),
            remote_ref: None,
            epic: None,
            description: None,
            extra: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_remote_ref(mut self, number: IssueNumber) -> Self {
        self.remote_ref = Some(number);
        self
    }

    /// Issue body projected from this record, carrying the back-reference.
    pub fn render_issue_body(&self) -> String {
        let mut body = format!("{}\n\n", back_reference_marker(&self.id));
        if let Some(epic) = &self.epic {
            body.push_str(&format!("**Epic**: {epic}\n"));
        }
        body.push_str(&format!(
            "**Type**: {}\n",
            self.kind.as_deref().unwrap_or("task")
        ));
        body.push_str(&format!(
            "**Priority**: {}\n",
            self.priority.as_deref().unwrap_or("p2")
        ));
        if let Some(description) = &self.description {
            body.push('\n');
            body.push_str(description);
            body.push('\n');
        }
        body
    }
}

static BACK_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*tracker-id:\s*(\S+?)\s*-->").expect("back-reference pattern is valid")
});

/// HTML comment embedded in an issue body to rejoin it to a task record.
pub fn back_reference_marker(id: &TaskId) -> String {
    format!("<!-- tracker-id: {id} -->")
}

/// Find the back-reference in an issue body.
pub fn extract_back_reference(body: &str) -> Option<TaskId> {
    BACK_REFERENCE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| TaskId::new(m.as_str()))
}

/// Return `body` with its back-reference set to `id` (prepended if missing).
pub fn with_back_reference(body: &str, id: &TaskId) -> String {
    let marker = back_reference_marker(id);
    if BACK_REFERENCE.is_match(body) {
        BACK_REFERENCE.replace(body, marker.as_str()).into_owned()
    } else if body.is_empty() {
        marker
    } else {
        format!("{marker}\n\n{body}")
    }
}

/// The tracker-side unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIssue {
    pub number: IssueNumber,
    pub title: String,
    pub status: Status,
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default)]
    pub milestone: Option<String>,
    /// Whether the issue is an item of the configured board.
    #[serde(default)]
    pub on_board: bool,
    #[serde(default)]
    pub board_column: Option<String>,
    #[serde(default)]
    pub body: String,
}

impl RemoteIssue {
    pub fn new(number: IssueNumber, title: impl Into<String>) -> Self {
        Self {
            number,
            title: title.into(),
            status: Status::Open,
            labels: LabelSet::new(),
            milestone: None,
            on_board: false,
            board_column: None,
            body: String::new(),
        }
    }

    pub fn back_reference(&self) -> Option<TaskId> {
        extract_back_reference(&self.body)
    }
}
