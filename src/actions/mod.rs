//! Local actions: discovery and the capability document.
//!
//! An action is any executable file below the configured actions directory;
//! its file name is the action name. [`ActionCatalog`] holds what was found at
//! startup and [`ActionCatalog::capability_document`] asks every action to
//! describe itself and assembles the fragments into one OpenAPI document.

pub mod runner;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::SpecInfo;
use runner::{ActionRunner, ExecError};

/// An executable exposed as a remotely invocable operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub path: PathBuf,
}

/// The set of actions this client declares.
#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    actions: Vec<Action>,
    by_name: HashMap<String, usize>,
}

impl ActionCatalog {
    pub fn new(actions: Vec<Action>) -> Self {
        let mut by_name = HashMap::with_capacity(actions.len());
        for (i, action) in actions.iter().enumerate() {
            if by_name.insert(action.name.clone(), i).is_some() {
                warn!(action = %action.name, path = %action.path.display(), "Duplicate action name, last one wins");
            }
        }
        Self { actions, by_name }
    }

    /// Walk `dir` recursively and register every executable file.
    pub fn scan(dir: &Path) -> std::io::Result<Self> {
        let mut actions = Vec::new();
        walk(dir, &mut actions)?;
        actions.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(dir = %dir.display(), count = actions.len(), "Scanned actions");
        Ok(Self::new(actions))
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.by_name.get(name).map(|&i| &self.actions[i])
    }

    pub fn names(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Describe every action and assemble the capability document.
    ///
    /// Actions that print nothing are left out of the document (they are still
    /// declared). Any action failing to describe itself fails the whole call.
    pub async fn capability_document(
        &self,
        runner: &ActionRunner,
        info: &SpecInfo,
        server_api_url: &str,
    ) -> Result<String, DescribeError> {
        let mut fragments = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            let fragment = runner
                .describe(action)
                .await
                .map_err(|source| DescribeError {
                    action: action.name.clone(),
                    source,
                })?;
            if !fragment.trim().is_empty() {
                fragments.push((action.name.as_str(), fragment));
            }
        }
        Ok(render_document(info, server_api_url, &fragments))
    }
}

/// Symlinked files are followed; symlinked directories are not descended into.
/// Entries that cannot be inspected are skipped with a warning.
fn walk(dir: &Path, out: &mut Vec<Action>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), "Skipping unreadable entry: {e}");
                continue;
            }
        };
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), "Skipping entry: {e}");
                continue;
            }
        };
        if file_type.is_dir() {
            if let Err(e) = walk(&path, out) {
                warn!(path = %path.display(), "Skipping directory: {e}");
            }
            continue;
        }
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %path.display(), "Skipping entry: {e}");
                continue;
            }
        };
        if is_executable(&meta) {
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(Action { name, path });
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.is_file() && meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    meta.is_file()
}

/// Assemble the OpenAPI document around the per-action `post` fragments.
fn render_document(info: &SpecInfo, server_api_url: &str, fragments: &[(&str, String)]) -> String {
    let mut doc = String::new();
    let _ = writeln!(doc, "openapi: 3.1.0");
    let _ = writeln!(doc, "info:");
    let _ = writeln!(doc, "  title: {}", info.title);
    let _ = writeln!(doc, "  summary: {}", info.summary);
    let _ = writeln!(doc, "  description: {}", info.description);
    let _ = writeln!(doc, "  version: {}", info.version);
    let _ = writeln!(doc, "servers:");
    let _ = writeln!(doc, "  - url: {server_api_url}");
    let _ = writeln!(doc, "components:");
    let _ = writeln!(doc, "  securitySchemes:");
    let _ = writeln!(doc, "    bearerAuth:");
    let _ = writeln!(doc, "      type: http");
    let _ = writeln!(doc, "      scheme: bearer");
    let _ = writeln!(doc, "      bearerFormat: JWT");
    // Some consumers reject a components section without `schemas`.
    let _ = writeln!(doc, "  schemas: {{}}");
    let _ = writeln!(doc, "security:");
    let _ = writeln!(doc, "  - bearerAuth: []");
    let _ = writeln!(doc, "paths:");
    for (name, fragment) in fragments {
        let _ = writeln!(doc, "  /actions/{name}:");
        let _ = writeln!(doc, "    post:");
        doc.push_str(&indent("      ", fragment));
    }
    doc
}

/// Prefix every non-empty line of `text` with `prefix`.
fn indent(prefix: &str, text: &str) -> String {
    text.lines()
        .filter(|l| !l.is_empty())
        .fold(String::new(), |mut out, line| {
            let _ = writeln!(out, "{prefix}{line}");
            out
        })
}

/// An action failed to describe itself.
#[derive(Debug)]
pub struct DescribeError {
    pub action: String,
    pub source: ExecError,
}

impl std::fmt::Display for DescribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to describe action {}: {}", self.action, self.source)
    }
}

impl std::error::Error for DescribeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}
