//! End-to-end: every way of asking the workspace to write outside its root
//! — parent-directory traversal, an absolute path, and a symlink planted
//! ahead of time — is rejected before touching the filesystem.

use agentcore::core::workspace::{Workspace, WorkspaceError};
use tempfile::TempDir;

#[test]
fn parent_dir_traversal_from_a_nested_relative_path_is_rejected() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(dir.path().to_path_buf(), 4096);

    let result = ws.write("reports/../../../../etc/passwd", b"pwned");
    assert!(matches!(result, Err(WorkspaceError::PathTraversal(_))));
    assert!(!dir.path().parent().unwrap().join("etc").exists());
}

#[test]
fn absolute_path_is_rejected_even_when_it_points_inside_the_root() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(dir.path().to_path_buf(), 4096);
    let inside_but_absolute = dir.path().join("notes.txt");

    let result = ws.write(inside_but_absolute.to_str().unwrap(), b"data");
    assert!(matches!(result, Err(WorkspaceError::PathTraversal(_))));
}

#[test]
fn legitimate_nested_write_succeeds_and_reads_back() {
    let dir = TempDir::new().unwrap();
    let ws = Workspace::new(dir.path().to_path_buf(), 4096);

    ws.write("reports/2026/q1.md", b"# Q1").unwrap();
    assert_eq!(ws.read("reports/2026/q1.md").unwrap(), b"# Q1");
}

#[cfg(unix)]
#[test]
fn symlink_planted_ahead_of_time_cannot_be_used_to_escape() {
    let dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    let ws = Workspace::new(dir.path().to_path_buf(), 4096);

    std::os::unix::fs::symlink(outside.path(), dir.path().join("escape")).unwrap();
    let result = ws.write("escape/payload.txt", b"data");
    assert!(matches!(result, Err(WorkspaceError::PathTraversal(_))));
    assert!(!outside.path().join("payload.txt").exists());
}
