//! The single on-disk directory every component (including sub-agent
//! processes) is permitted to write into.
//!
//! Every relative path passed in from a chat session's extracted file-write
//! blocks, or from a sub-agent's `workspace_write` IPC message, is resolved
//! through [`Workspace::resolve`] before touching disk: absolute paths are
//! rejected, `.`/`..` components are normalized, and the result is
//! canonicalized and checked to have the workspace root as a prefix. Writes
//! are capped at a configurable size per file.

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub enum WorkspaceError {
    PathTraversal(String),
    SizeExceeded { limit: usize, actual: usize },
    Io(String),
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceError::PathTraversal(p) => write!(f, "path escapes workspace root: {}", p),
            WorkspaceError::SizeExceeded { limit, actual } => {
                write!(f, "write of {} bytes exceeds cap of {} bytes", actual, limit)
            }
            WorkspaceError::Io(msg) => write!(f, "workspace io error: {}", msg),
        }
    }
}

impl Error for WorkspaceError {}

/// The workspace jail: a single directory root plus a per-file write cap.
#[derive(Clone)]
pub struct Workspace {
    root: PathBuf,
    max_write_size: usize,
}

impl Workspace {
    pub fn new(root: PathBuf, max_write_size: usize) -> Self {
        Workspace { root, max_write_size }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `rel` against the workspace root, rejecting absolute paths,
    /// normalizing `.`/`..` components, and verifying the canonicalized
    /// result still has the workspace root as a prefix (catching symlink
    /// escapes through parent-directory components for paths that don't
    /// exist yet).
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, WorkspaceError> {
        let rel_path = PathBuf::from(rel);
        if rel_path.is_absolute() {
            return Err(WorkspaceError::PathTraversal(rel.to_string()));
        }

        let mut normalized = PathBuf::new();
        let mut depth: i32 = 0;
        for component in rel_path.components() {
            use std::path::Component;
            match component {
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(WorkspaceError::PathTraversal(rel.to_string()));
                    }
                    normalized.pop();
                    depth -= 1;
                }
                Component::Normal(c) => {
                    normalized.push(c);
                    depth += 1;
                }
                Component::CurDir => {}
                _ => {}
            }
        }

        let candidate = self.root.join(&normalized);

        let root_canonical = self
            .root
            .canonicalize()
            .map_err(|e| WorkspaceError::Io(format!("cannot canonicalize workspace root: {}", e)))?;

        let canonical_to_check = if candidate.exists() {
            candidate
                .canonicalize()
                .map_err(|e| WorkspaceError::Io(format!("cannot canonicalize path: {}", e)))?
        } else {
            let parent = candidate
                .parent()
                .ok_or_else(|| WorkspaceError::PathTraversal(rel.to_string()))?;
            let mut ancestor = parent;
            let canonical_ancestor = loop {
                if ancestor.exists() {
                    break ancestor
                        .canonicalize()
                        .map_err(|e| WorkspaceError::Io(format!("cannot canonicalize ancestor: {}", e)))?;
                }
                ancestor = ancestor
                    .parent()
                    .ok_or_else(|| WorkspaceError::PathTraversal(rel.to_string()))?;
            };
            let suffix = candidate.strip_prefix(parent).unwrap_or(&candidate);
            canonical_ancestor.join(suffix)
        };

        if !canonical_to_check.starts_with(&root_canonical) {
            return Err(WorkspaceError::PathTraversal(rel.to_string()));
        }

        Ok(candidate)
    }

    /// Write `content` to `rel`, resolving through the jail and enforcing the
    /// per-file size cap. Creates parent directories as needed.
    pub fn write(&self, rel: &str, content: &[u8]) -> Result<PathBuf, WorkspaceError> {
        if content.len() > self.max_write_size {
            return Err(WorkspaceError::SizeExceeded {
                limit: self.max_write_size,
                actual: content.len(),
            });
        }

        let target = self.resolve(rel)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| WorkspaceError::Io(e.to_string()))?;
        }
        fs::write(&target, content).map_err(|e| WorkspaceError::Io(e.to_string()))?;
        Ok(target)
    }

    pub fn read(&self, rel: &str) -> Result<Vec<u8>, WorkspaceError> {
        let target = self.resolve(rel)?;
        fs::read(&target).map_err(|e| WorkspaceError::Io(e.to_string()))
    }

    pub fn max_write_size(&self) -> usize {
        self.max_write_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_and_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf(), 1024);
        ws.write("notes/a.txt", b"hello").unwrap();
        assert_eq!(ws.read("notes/a.txt").unwrap(), b"hello");
    }

    #[test]
    fn rejects_absolute_path() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf(), 1024);
        assert!(matches!(ws.resolve("/etc/passwd"), Err(WorkspaceError::PathTraversal(_))));
    }

    #[test]
    fn rejects_parent_dir_escape() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf(), 1024);
        let result = ws.write("../../../etc/passwd", b"pwned");
        assert!(matches!(result, Err(WorkspaceError::PathTraversal(_))));
    }

    #[test]
    fn rejects_oversized_write() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf(), 4);
        let result = ws.write("big.txt", b"too large");
        assert!(matches!(result, Err(WorkspaceError::SizeExceeded { .. })));
    }

    #[test]
    fn rejects_symlink_escape_via_nonexistent_path() {
        let dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let link = dir.path().join("escape");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path(), &link).unwrap();
            let ws = Workspace::new(dir.path().to_path_buf(), 1024);
            let result = ws.write("escape/new_file.txt", b"data");
            assert!(matches!(result, Err(WorkspaceError::PathTraversal(_))));
        }
    }
}
