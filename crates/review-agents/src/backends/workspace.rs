//! Scoped read-only workspace for agent CLIs with tool access.
//!
//! Only files named in the diff headers are copied, never sensitive files,
//! and never anything outside the project root. The directory is removed
//! when the workspace is dropped.

use std::path::{Component, Path, PathBuf};

use review_coordination::multipass::complexity::DiffStats;
use review_coordination::redaction::is_sensitive_file;
use tempfile::TempDir;
use tracing::{debug, info};

#[derive(Debug)]
pub struct ScopedWorkspace {
    dir: TempDir,
    files: Vec<PathBuf>,
    excluded: Vec<PathBuf>,
}

impl ScopedWorkspace {
    /// Workspace with no files; the agent sees only its prompt.
    pub fn empty() -> std::io::Result<Self> {
        Ok(Self {
            dir: tempfile::Builder::new().prefix("review-ws-").tempdir()?,
            files: Vec::new(),
            excluded: Vec::new(),
        })
    }

    /// Copy the files a diff touches from `project_root`.
    pub fn populate(project_root: &Path, diff: &str) -> std::io::Result<Self> {
        let mut ws = Self::empty()?;
        let root = project_root.canonicalize()?;
        for name in DiffStats::from_diff(diff).files {
            let rel = PathBuf::from(&name);
            if !is_contained(&rel) {
                debug!(path = %name, "Skipping path outside project root");
                continue;
            }
            if is_sensitive_file(&rel) {
                ws.excluded.push(rel);
                continue;
            }
            let src = root.join(&rel);
            let Ok(meta) = std::fs::symlink_metadata(&src) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                debug!(path = %name, "Skipping symlink");
                continue;
            }
            if !meta.is_file() {
                continue;
            }
            // A symlinked parent directory can still lead out of the root.
            let resolved = src.canonicalize()?;
            if !resolved.starts_with(&root) {
                debug!(path = %name, "Skipping path resolving outside project root");
                continue;
            }
            if is_sensitive_file(&resolved) {
                ws.excluded.push(rel);
                continue;
            }
            let dest = ws.dir.path().join(&rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dest)?;
            ws.files.push(rel);
        }
        info!(
            copied = ws.files.len(),
            excluded = ws.excluded.len(),
            "Prepared review workspace"
        );
        Ok(ws)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Relative paths copied in.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Relative paths withheld as sensitive.
    pub fn excluded(&self) -> &[PathBuf] {
        &self.excluded
    }
}

/// Relative, with no `..`, root or prefix components.
fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
