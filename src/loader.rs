//! Filesystem scanning for the ingest command.
//!
//! Explicit file arguments are always taken; directories are walked with
//! include/exclude glob filtering. Ordering is deterministic (sorted by URI).

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::error::{Result, ThreatScopeError};

/// A file selected for ingestion, with its canonical source URI.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub uri: String,
}

/// Resolve a mix of file and directory paths into a deduplicated,
/// deterministically ordered list of files to ingest.
pub fn scan_paths(paths: &[PathBuf], config: &IngestConfig) -> Result<Vec<ScannedFile>> {
    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    for path in paths {
        if !path.exists() {
            return Err(ThreatScopeError::Config(format!(
                "ingest path does not exist: {}",
                path.display()
            )));
        }
        if path.is_file() {
            // Explicitly named files bypass glob filtering.
            files.push(scanned(path));
        } else {
            scan_directory(path, config, &include_set, &exclude_set, &mut files)?;
        }
    }

    files.sort_by(|a, b| a.uri.cmp(&b.uri));
    files.dedup_by(|a, b| a.uri == b.uri);
    Ok(files)
}

fn scan_directory(
    root: &Path,
    config: &IngestConfig,
    include_set: &GlobSet,
    exclude_set: &GlobSet,
    files: &mut Vec<ScannedFile>,
) -> Result<()> {
    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        files.push(scanned(path));
    }
    Ok(())
}

fn scanned(path: &Path) -> ScannedFile {
    ScannedFile {
        path: path.to_path_buf(),
        uri: file_uri(path),
    }
}

/// Canonical URI for a local file. Absolute where the filesystem can
/// resolve it so re-ingests of the same file dedup correctly.
pub fn file_uri(path: &Path) -> String {
    let absolute = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.display())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| ThreatScopeError::Config(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| ThreatScopeError::Config(format!("glob set: {}", e)))
}
