//! MarkdownStore - tracker.md の読み書き
//!
//! # フォーマット
//! ```text
//! ## TODO
//! - [ ] Add dark mode
//!   id: T-001
//!   github: 12
//!   labels: ui, theme
//! ```
//!
//! - `## ` で始まる行がセクション
//! - `- [ ]` / `- [x]` がタスク
//! - タスク直後のインデント付き `key: value` がメタデータ
//! - 最初のセクションより前のテキストはそのまま残す
//! - `id:` の無いタスクには読み込み時に一度だけ id を割り当て、その場で書き戻す
//! - 知らないメタデータやサブ項目はタスクに付いたまま残す
//!
//! 書き出しは設定のセクション順で全体を再生成します。内容が変わらない
//! ときは書き込みません。

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info};

use crate::domain::record::parse_labels;
use crate::domain::{IssueNumber, Status, SyncError, TaskId, TaskRecord};
use crate::ports::{IdGenerator, RecordStore, StagedWrite};

use super::atomic::{FileStage, Unchanged};

static SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^##\s+(.+?)\s*$").expect("section pattern is valid"));
static TASK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \[([ xX])\] (.+?)\s*$").expect("task pattern is valid"));
static FIELD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s+(\w+):\s*(.*?)\s*$").expect("field pattern is valid"));

/// Text around the tasks that tracksync keeps but does not interpret.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    /// Text before the first section, kept verbatim.
    pub preamble: String,
    /// Lines between a section header and its first task.
    pub notes: BTreeMap<String, Vec<String>>,
}

impl Layout {
    /// Read the preamble and section notes of an existing tracker file.
    pub fn read(text: &str) -> Self {
        let mut layout = Layout::default();
        let mut section: Option<&str> = None;
        let mut tasks_seen = false;
        for line in text.lines() {
            if let Some(caps) = SECTION.captures(line) {
                section = caps.get(1).map(|m| m.as_str());
                tasks_seen = false;
                continue;
            }
            match section {
                None => {
                    layout.preamble.push_str(line);
                    layout.preamble.push('\n');
                }
                Some(_) if TASK.is_match(line) => tasks_seen = true,
                Some(name) if !tasks_seen && !line.trim().is_empty() => layout
                    .notes
                    .entry(name.to_string())
                    .or_default()
                    .push(line.trim_end().to_string()),
                Some(_) => {}
            }
        }
        layout
    }
}

/// Parsed tracker file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerDocument {
    pub layout: Layout,
    pub records: Vec<TaskRecord>,
    /// Number of records that received a fresh id while parsing.
    pub assigned_ids: usize,
}

pub fn parse_tracker(text: &str, ids: &dyn IdGenerator) -> Result<TrackerDocument, SyncError> {
    let mut doc = TrackerDocument {
        layout: Layout::read(text),
        ..TrackerDocument::default()
    };
    let mut section: Option<String> = None;
    let mut current: Option<TaskRecord> = None;

    for (index, line) in text.lines().enumerate() {
        let line_no = index + 1;
        if let Some(caps) = SECTION.captures(line) {
            finish(&mut doc, current.take(), ids);
            section = Some(caps[1].to_string());
            continue;
        }
        if section.is_none() {
            continue;
        }
        if let Some(caps) = TASK.captures(line) {
            finish(&mut doc, current.take(), ids);
            let status = Status::from_checkbox(&caps[1] != " ");
            let mut record = TaskRecord::new(
                TaskId::new(""),
                &caps[2],
                section.clone().unwrap_or_default(),
            );
            record.status = status;
            current = Some(record);
            continue;
        }
        let Some(record) = current.as_mut() else {
            // section notes, see Layout
            continue;
        };
        match FIELD.captures(line) {
            Some(caps) => apply_field(record, &caps[1], &caps[2], line, line_no)?,
            None if !line.trim().is_empty() => record.extra.push(line.trim_end().to_string()),
            None => {}
        }
    }
    finish(&mut doc, current, ids);
    Ok(doc)
}

fn finish(doc: &mut TrackerDocument, record: Option<TaskRecord>, ids: &dyn IdGenerator) {
    let Some(mut record) = record else {
        return;
    };
    if record.id.as_str().is_empty() {
        record.id = ids.generate_task_id();
        doc.assigned_ids += 1;
        debug!("assigned {} to `{}`", record.id, record.title);
    }
    doc.records.push(record);
}

fn apply_field(
    record: &mut TaskRecord,
    key: &str,
    value: &str,
    line: &str,
    line_no: usize,
) -> Result<(), SyncError> {
    let optional = || (!value.is_empty()).then(|| value.to_string());
    match key {
        "id" => record.id = TaskId::new(value),
        "github" => {
            record.remote_ref = match value.trim_start_matches('#') {
                "" => None,
                raw => Some(raw.parse().map(IssueNumber::new).map_err(|_| {
                    SyncError::Store(format!("line {line_no}: `github: {value}` is not an issue number"))
                })?),
            }
        }
        "type" => record.kind = optional(),
        "priority" => record.priority = optional(),
        "labels" => record.labels = parse_labels(value),
        "milestone" => record.milestone = optional(),
        "epic" => record.epic = optional(),
        "description" => record.description = optional(),
        other => {
            debug!("line {line_no}: `{other}` kept as is");
            record.extra.push(line.trim_end().to_string());
        }
    }
    Ok(())
}

/// Render records grouped by section. Configured sections come first, in
/// order, even when empty; any other section follows in first-seen order.
pub fn render_tracker(layout: &Layout, sections: &[String], records: &[TaskRecord]) -> String {
    let mut order: Vec<&str> = sections.iter().map(String::as_str).collect();
    let seen = records
        .iter()
        .map(|r| r.section.as_str())
        .chain(layout.notes.keys().map(String::as_str));
    for section in seen {
        if !order.contains(&section) {
            order.push(section);
        }
    }

    let mut out = String::new();
    let preamble = layout.preamble.trim_end();
    if !preamble.is_empty() {
        out.push_str(preamble);
        out.push_str("\n\n");
    }
    for (i, section) in order.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        out.push_str(&format!("## {section}\n"));
        if let Some(notes) = layout.notes.get(*section) {
            out.push('\n');
            for note in notes {
                out.push_str(note);
                out.push('\n');
            }
        }
        let mut first = true;
        for record in records.iter().filter(|r| r.section == *section) {
            if first {
                out.push('\n');
                first = false;
            }
            render_record(&mut out, record);
        }
    }
    out
}

fn render_record(out: &mut String, record: &TaskRecord) {
    out.push_str(&format!("- {} {}\n", record.status.checkbox(), record.title));
    out.push_str(&format!("  id: {}\n", record.id));
    if let Some(number) = record.remote_ref {
        out.push_str(&format!("  github: {}\n", number.get()));
    }
    let fields = [
        ("type", record.kind.as_deref()),
        ("priority", record.priority.as_deref()),
        ("milestone", record.milestone.as_deref()),
        ("epic", record.epic.as_deref()),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            out.push_str(&format!("  {key}: {value}\n"));
        }
    }
    if !record.labels.is_empty() {
        let labels: Vec<&str> = record.labels.iter().map(String::as_str).collect();
        out.push_str(&format!("  labels: {}\n", labels.join(", ")));
    }
    if let Some(description) = &record.description {
        out.push_str(&format!("  description: {description}\n"));
    }
    for line in &record.extra {
        out.push_str(line);
        out.push('\n');
    }
}

/// Record store backed by a markdown file.
pub struct MarkdownStore {
    path: PathBuf,
    sections: Vec<String>,
    ids: Arc<dyn IdGenerator>,
}

impl MarkdownStore {
    pub fn new(path: impl Into<PathBuf>, sections: Vec<String>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            path: path.into(),
            sections,
            ids,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Option<String>, SyncError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::io(&self.path, e)),
        }
    }
}

impl RecordStore for MarkdownStore {
    fn load(&self) -> Result<Vec<TaskRecord>, SyncError> {
        let Some(text) = self.read()? else {
            debug!("{} does not exist yet", self.path.display());
            return Ok(Vec::new());
        };
        let doc = parse_tracker(&text, self.ids.as_ref())?;
        if doc.assigned_ids > 0 {
            // Ids go to disk before anything is created remotely under them.
            self.save(&doc.records)?;
            info!(
                "{} tasks received new ids, written to {}",
                doc.assigned_ids,
                self.path.display()
            );
        }
        Ok(doc.records)
    }

    fn stage(&self, records: &[TaskRecord]) -> Result<Box<dyn StagedWrite>, SyncError> {
        let current = self.read()?;
        let layout = current.as_deref().map(Layout::read).unwrap_or_default();
        let rendered = render_tracker(&layout, &self.sections, records);
        if current.as_deref() == Some(rendered.as_str()) {
            return Ok(Box::new(Unchanged));
        }
        Ok(Box::new(FileStage::prepare(&self.path, rendered.as_bytes())?))
    }
}
