//! The task-safety predicate and the `tinyTasks.md` reader.
//!
//! `tinyTasks.md` is an external collaborator: parsed, never written, never
//! authoritative. Recall uses it for one thing: keeping incomplete dormant
//! tasks out of context unless the user explicitly asks to pick work back
//! up, so a stale task list cannot steer the model into resuming abandoned
//! work on its own.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};

use tinymem_types::{Memory, MemoryKind};

/// Query phrasings that count as an explicit request to continue tasks.
const CONTINUATION_HINTS: [&str; 4] = ["continue", "resume", "pick up", "unfinished"];

/// One checkbox line from the task file.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEntry {
    /// Whether the box is checked.
    pub done: bool,
    /// The task text after the checkbox.
    pub text: String,
}

/// Parsed view of a `tinyTasks.md` file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFile {
    /// Entries in file order.
    pub entries: Vec<TaskEntry>,
}

impl TaskFile {
    /// Parse markdown checkbox lines (`- [ ]` / `- [x]`). Anything else is
    /// ignored.
    pub fn parse(content: &str) -> Self {
        let mut entries = Vec::new();
        for line in content.lines() {
            let trimmed = line.trim_start();
            let rest = trimmed
                .strip_prefix("- [ ] ")
                .map(|text| (false, text))
                .or_else(|| trimmed.strip_prefix("- [x] ").map(|text| (true, text)))
                .or_else(|| trimmed.strip_prefix("- [X] ").map(|text| (true, text)));
            if let Some((done, text)) = rest {
                entries.push(TaskEntry {
                    done,
                    text: text.trim().to_string(),
                });
            }
        }
        Self { entries }
    }

    /// Read and parse the file; a missing or unreadable file is an empty
    /// task list, not an error.
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::parse(&content),
            Err(_) => Self::default(),
        }
    }

    /// Whether the file lists this text as an unchecked task.
    pub fn is_open(&self, text: &str) -> bool {
        self.entries
            .iter()
            .any(|e| !e.done && e.text.eq_ignore_ascii_case(text))
    }
}

/// The task-safety predicate for recall.
#[derive(Debug, Clone)]
pub struct TaskGuard {
    /// A task untouched for this long is dormant.
    pub dormant_after: Duration,
    /// Parsed task file, when one was found.
    pub task_file: TaskFile,
}

impl TaskGuard {
    /// A guard with the given dormancy window and task file.
    pub fn new(dormant_after: Duration, task_file: TaskFile) -> Self {
        Self {
            dormant_after,
            task_file,
        }
    }

    /// Whether the query explicitly asks to continue earlier work.
    pub fn query_requests_continuation(query: &str) -> bool {
        let lowered = query.to_lowercase();
        CONTINUATION_HINTS.iter().any(|h| lowered.contains(h))
    }

    /// Whether this memory should be withheld from recall: an incomplete
    /// task that has gone dormant.
    pub fn withholds(&self, memory: &Memory, now: DateTime<Utc>) -> bool {
        if memory.kind != MemoryKind::Task {
            return false;
        }
        if now.signed_duration_since(memory.updated_at) < self.dormant_after {
            return false;
        }
        self.is_incomplete(memory)
    }

    fn is_incomplete(&self, memory: &Memory) -> bool {
        if memory.classification.as_deref() == Some("done") {
            return false;
        }
        if memory.summary.contains("[x]") || memory.detail.contains("[x]") {
            return false;
        }
        // The task file can mark a task finished even when the memory row
        // was never updated; absence from the file changes nothing.
        if self
            .task_file
            .entries
            .iter()
            .any(|e| e.done && e.text.eq_ignore_ascii_case(&memory.summary))
        {
            return false;
        }
        true
    }
}
