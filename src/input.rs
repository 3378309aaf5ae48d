//! Loading plain-text documents from disk.

use crate::chunking::Document;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// File extensions picked up when a directory is given.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand files and directories into a sorted list of text files.
///
/// Directories are scanned one level deep. Explicit file paths are kept
/// whatever their extension.
pub fn collect_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();

    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(input)
                .with_context(|| format!("Failed to read directory {}", input.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_text_file(p))
                .collect();
            found.sort();
            tracing::debug!("Found {} text files in {}", found.len(), input.display());
            paths.extend(found);
        } else if input.is_file() {
            paths.push(input.clone());
        } else {
            anyhow::bail!("Input not found: {}", input.display());
        }
    }

    Ok(paths)
}

/// Load documents from files and directories.
///
/// A document's id is its file stem; when two files share a stem the later
/// one is identified by its full path instead.
pub fn load_documents(inputs: &[PathBuf]) -> Result<Vec<Document>> {
    let paths = collect_paths(inputs)?;
    let mut seen = HashSet::new();
    let mut documents = Vec::with_capacity(paths.len());

    for path in paths {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let id = if !stem.is_empty() && seen.insert(stem.clone()) {
            stem
        } else {
            let full = path.display().to_string();
            seen.insert(full.clone());
            full
        };

        documents.push(Document::new(id, text));
    }

    tracing::info!("Loaded {} documents", documents.len());
    Ok(documents)
}
