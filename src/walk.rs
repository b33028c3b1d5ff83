//! Depth-first, alphabetical listing of an extracted tree.

use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EntryKind {
    Directory,
    File { size: u64 },
    Symlink { target: PathBuf, broken: bool },
    Other,
    /// The walker could not read this node; the reason is kept as an annotation.
    Unreadable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    /// 1 for direct children of the root.
    pub depth: usize,
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Lazily walks `root`, yielding one entry per node in sorted depth-first order.
///
/// Read failures become [`EntryKind::Unreadable`] entries instead of ending the walk.
pub fn entries(root: &Path) -> impl Iterator<Item = TreeEntry> + use<> {
    WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .map(|entry| match entry {
            Ok(entry) => describe(entry),
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                let reason = err
                    .io_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| err.to_string());
                // A directory that cannot be listed is reported as its own child
                let is_dir = fs::symlink_metadata(&path)
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                let depth = if is_dir { err.depth() + 1 } else { err.depth() };
                TreeEntry {
                    depth: depth.max(1),
                    name: String::new(),
                    path,
                    kind: EntryKind::Unreadable { reason },
                }
            }
        })
}

fn describe(entry: walkdir::DirEntry) -> TreeEntry {
    let file_type = entry.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        match fs::read_link(entry.path()) {
            Ok(target) => {
                let broken = fs::metadata(entry.path()).is_err();
                EntryKind::Symlink { target, broken }
            }
            Err(e) => EntryKind::Unreadable {
                reason: e.to_string(),
            },
        }
    } else if file_type.is_file() {
        match entry.metadata() {
            Ok(meta) => EntryKind::File { size: meta.len() },
            Err(e) => EntryKind::Unreadable {
                reason: e.to_string(),
            },
        }
    } else {
        EntryKind::Other
    };

    TreeEntry {
        depth: entry.depth(),
        name: entry.file_name().to_string_lossy().into_owned(),
        path: entry.into_path(),
        kind,
    }
}

/// Renders the tree under `root` as indented text, two spaces per level.
pub fn list(root: &Path) -> Result<String> {
    // A missing root is an error; everything below it is best effort
    fs::metadata(root)?;

    let mut out = String::new();
    let _ = writeln!(out, "{}", root.display());
    for entry in entries(root) {
        out.push_str(&render(&entry));
        out.push('\n');
    }
    Ok(out)
}

pub fn render(entry: &TreeEntry) -> String {
    let indent = "  ".repeat(entry.depth.saturating_sub(1));
    match &entry.kind {
        EntryKind::Directory => format!("{}{}/", indent, entry.name),
        EntryKind::File { .. } | EntryKind::Other => format!("{}{}", indent, entry.name),
        EntryKind::Symlink { target, broken } => format!(
            "{}{} -> {}{}",
            indent,
            entry.name,
            target.display(),
            if *broken { " [broken link]" } else { "" }
        ),
        EntryKind::Unreadable { reason } if entry.name.is_empty() => {
            format!("{}[unreadable: {}]", indent, reason)
        }
        EntryKind::Unreadable { reason } => {
            format!("{}{} [unreadable: {}]", indent, entry.name, reason)
        }
    }
}
