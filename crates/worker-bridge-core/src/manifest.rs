//! Build artifacts and the task manifests they produce.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::TaskId;

/// Output of the external builder for one source change.
///
/// `content_hash` is the build's identity: two manifests with the same
/// hash are the same build, whatever else differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildManifest {
    /// Deterministic fingerprint of the build output.
    pub content_hash: String,
    /// Version of the user's SDK package.
    pub package_version: String,
    /// Version of the tool that produced the build.
    pub cli_package_version: String,
    /// Entry points that were bundled.
    #[serde(default)]
    pub files: Vec<BuildEntry>,
    /// Source contents keyed by path relative to the project root.
    #[serde(default)]
    pub sources: HashMap<String, SourceFile>,
    /// Directory the bundle was written to.
    #[serde(default)]
    pub output_path: String,
}

impl BuildManifest {
    /// Create a manifest with no files or sources.
    pub fn new(
        content_hash: impl Into<String>,
        package_version: impl Into<String>,
        cli_package_version: impl Into<String>,
    ) -> Self {
        Self {
            content_hash: content_hash.into(),
            package_version: package_version.into(),
            cli_package_version: cli_package_version.into(),
            files: Vec::new(),
            sources: HashMap::new(),
            output_path: String::new(),
        }
    }

    /// Add a bundled entry point.
    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.files.push(BuildEntry {
            entry: entry.into(),
            out: None,
        });
        self
    }

    /// Add a source file.
    #[must_use]
    pub fn with_source(mut self, path: impl Into<String>, source: SourceFile) -> Self {
        self.sources.insert(path.into(), source);
        self
    }
}

/// One bundled entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEntry {
    pub entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out: Option<String>,
}

/// Contents of a source file captured at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub contents: String,
    pub content_hash: String,
}

/// A task exported by the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub file_path: String,
    pub export_name: String,
}

impl TaskDescriptor {
    /// Create a descriptor.
    pub fn new(
        id: impl Into<TaskId>,
        file_path: impl Into<String>,
        export_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            export_name: export_name.into(),
        }
    }
}

/// Task manifest reported by an initialized bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerManifest {
    #[serde(default)]
    pub tasks: Vec<TaskDescriptor>,
}

impl WorkerManifest {
    /// Create a manifest from task descriptors, preserving order.
    #[must_use]
    pub fn new(tasks: Vec<TaskDescriptor>) -> Self {
        Self { tasks }
    }
}

/// Source file sent alongside a registration, limited to files that define tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFileMetadata {
    pub file_path: String,
    pub contents: String,
    pub content_hash: String,
    pub task_ids: Vec<TaskId>,
}
