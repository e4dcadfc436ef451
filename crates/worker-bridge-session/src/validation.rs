//! Checks applied to a worker manifest before it is published.

use std::fmt::{self, Write as _};

use worker_bridge_core::{BuildManifest, TaskDescriptor, TaskId, WorkerManifest};

/// Where the task authoring docs live.
pub const TASKS_DOCS_URL: &str = "https://trigger.dev/docs/tasks/overview";

/// Reason a manifest cannot be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    /// The build exported no tasks at all.
    NoTasksDefined,
    /// Two or more tasks share an id.
    DuplicateTaskIds { duplicates: Vec<DuplicateTaskId> },
}

/// One id defined more than once, with every place it was defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateTaskId {
    pub id: TaskId,
    pub occurrences: Vec<TaskDescriptor>,
}

/// Validate a manifest. Returns the first issue found.
#[must_use]
pub fn validate_worker_manifest(manifest: &WorkerManifest) -> Option<ValidationIssue> {
    if manifest.tasks.is_empty() {
        return Some(ValidationIssue::NoTasksDefined);
    }

    // Ordered by first appearance.
    let mut seen: Vec<DuplicateTaskId> = Vec::new();
    for task in &manifest.tasks {
        match seen.iter_mut().find(|entry| entry.id == task.id) {
            Some(entry) => entry.occurrences.push(task.clone()),
            None => seen.push(DuplicateTaskId {
                id: task.id.clone(),
                occurrences: vec![task.clone()],
            }),
        }
    }

    let duplicates: Vec<_> = seen
        .into_iter()
        .filter(|entry| entry.occurrences.len() > 1)
        .collect();

    if duplicates.is_empty() {
        None
    } else {
        Some(ValidationIssue::DuplicateTaskIds { duplicates })
    }
}

impl ValidationIssue {
    /// Render the issue for the developer.
    #[must_use]
    pub fn report(&self, build: &BuildManifest) -> ValidationReport {
        match self {
            Self::NoTasksDefined => {
                let mut message = String::from("Files:\n");
                for file in &build.files {
                    let _ = writeln!(message, "  {}", file.entry);
                }
                message.push_str(
                    "\nMake sure you have at least one task exported from your task files.\n\n\
                     You may have defined a task and forgotten to add the export statement.",
                );

                ValidationReport {
                    header: "No tasks exported from your task files".to_string(),
                    message,
                    footer: footer(),
                }
            }
            Self::DuplicateTaskIds { duplicates } => {
                let mut message = String::from("Duplicate task ids detected:");
                for duplicate in duplicates {
                    let _ = write!(message, "\n\n{} was found in:", duplicate.id);
                    for task in &duplicate.occurrences {
                        let _ = write!(message, "\n  {} -> {}", task.file_path, task.export_name);
                    }
                }

                ValidationReport {
                    header: "Duplicate task ids detected".to_string(),
                    message,
                    footer: footer(),
                }
            }
        }
    }
}

fn footer() -> String {
    format!("Read the docs: {TASKS_DOCS_URL}")
}

/// Human readable form of a [`ValidationIssue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub header: String,
    pub message: String,
    pub footer: String,
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\n{}\n\n{}", self.header, self.message, self.footer)
    }
}
