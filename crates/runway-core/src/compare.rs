//! Bit-accuracy comparison of two output trees.
//!
//! The fast path compares precomputed manifests by hash equality alone.
//! Without manifests on both sides, the fallback walks both directory
//! trees and compares file contents byte-for-byte; a size+mtime shortcut
//! would miss exactly the behavioral drift this exists to catch.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{RunwayError, RunwayResult};
use crate::manifest::{OutputManifest, MANIFEST_NAME};

const READ_CHUNK: usize = 64 * 1024;

/// Set-based diff of two sides, keyed by posix-style relative paths.
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    pub matched: BTreeSet<String>,
    pub mismatch: BTreeSet<String>,
    pub only_in_a: BTreeSet<String>,
    pub only_in_b: BTreeSet<String>,
    /// Per-path errors; any entry fails the overall comparison.
    pub errors: BTreeMap<String, String>,
}

impl Comparison {
    /// Nothing was compared at all. Not automatically a failure, but
    /// flagged distinctly from a clean pass since it usually means a
    /// misconfiguration.
    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
            && self.mismatch.is_empty()
            && self.only_in_a.is_empty()
            && self.only_in_b.is_empty()
            && self.errors.is_empty()
    }

    /// Non-strict mode fails on mismatches and errors; strict mode also
    /// treats files present on only one side as failures.
    pub fn passed(&self, strict: bool) -> bool {
        if !self.mismatch.is_empty() || !self.errors.is_empty() {
            return false;
        }
        if strict && (!self.only_in_a.is_empty() || !self.only_in_b.is_empty()) {
            return false;
        }
        true
    }
}

/// Path filters applied before either comparison strategy: `ignore`
/// removes paths, `patterns` restricts scope (empty = everything).
#[derive(Debug, Clone, Default)]
pub struct CompareFilters {
    pub patterns: Vec<String>,
    pub ignore: Vec<String>,
}

impl CompareFilters {
    fn build(&self) -> RunwayResult<(Option<GlobSet>, Option<GlobSet>)> {
        Ok((
            build_glob_set(&self.patterns)?,
            build_glob_set(&self.ignore)?,
        ))
    }
}

fn build_glob_set(patterns: &[String]) -> RunwayResult<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| RunwayError::Config(format!("bad pattern `{}`: {}", pattern, e)))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| RunwayError::Config(format!("bad pattern set: {}", e)))?;
    Ok(Some(set))
}

fn selected(path: &str, include: &Option<GlobSet>, ignore: &Option<GlobSet>) -> bool {
    if let Some(ignore) = ignore {
        if ignore.is_match(path) {
            return false;
        }
    }
    match include {
        Some(include) => include.is_match(path),
        None => true,
    }
}

/// Compares two sides, each either a manifest file or a directory tree.
/// The manifest fast path is used whenever both sides expose one.
pub fn compare(a: &Path, b: &Path, filters: &CompareFilters) -> RunwayResult<Comparison> {
    let (include, ignore) = filters.build()?;
    match (OutputManifest::locate(a), OutputManifest::locate(b)) {
        (Some(manifest_a), Some(manifest_b)) => {
            let manifest_a = OutputManifest::load(&manifest_a)?;
            let manifest_b = OutputManifest::load(&manifest_b)?;
            Ok(compare_manifests(
                &manifest_a,
                &manifest_b,
                &include,
                &ignore,
            ))
        }
        _ => {
            if !a.is_dir() || !b.is_dir() {
                return Err(RunwayError::Config(format!(
                    "cannot compare {} and {}: need two directories or two manifests",
                    a.display(),
                    b.display()
                )));
            }
            Ok(compare_dirs(a, b, &include, &ignore))
        }
    }
}

/// Hash-equality comparison over two manifests; no file is re-read.
pub fn compare_manifests(
    a: &OutputManifest,
    b: &OutputManifest,
    include: &Option<GlobSet>,
    ignore: &Option<GlobSet>,
) -> Comparison {
    let mut result = Comparison::default();
    let paths: BTreeSet<&String> = a.files.keys().chain(b.files.keys()).collect();
    for path in paths {
        if !selected(path, include, ignore) {
            continue;
        }
        match (a.files.get(path), b.files.get(path)) {
            (Some(digest_a), Some(digest_b)) => match (&digest_a.md5, &digest_b.md5) {
                (Some(md5_a), Some(md5_b)) => {
                    if md5_a == md5_b {
                        result.matched.insert(path.clone());
                    } else {
                        result.mismatch.insert(path.clone());
                    }
                }
                // The fast path may not re-read files, so an absent
                // digest cannot be resolved here.
                _ => {
                    result
                        .errors
                        .insert(path.clone(), "no digest recorded".to_string());
                }
            },
            (Some(_), None) => {
                result.only_in_a.insert(path.clone());
            }
            (None, Some(_)) => {
                result.only_in_b.insert(path.clone());
            }
            (None, None) => unreachable!("path came from one of the manifests"),
        }
    }
    if result.is_empty() {
        warn!("comparison selected no files; check patterns and inputs");
    }
    result
}

/// Byte-for-byte comparison of two directory trees.
pub fn compare_dirs(
    a: &Path,
    b: &Path,
    include: &Option<GlobSet>,
    ignore: &Option<GlobSet>,
) -> Comparison {
    let mut result = Comparison::default();
    let files_a = list_files(a, include, ignore, &mut result);
    let files_b = list_files(b, include, ignore, &mut result);

    for path in files_a.union(&files_b) {
        match (files_a.contains(path), files_b.contains(path)) {
            (true, false) => {
                result.only_in_a.insert(path.clone());
            }
            (false, true) => {
                result.only_in_b.insert(path.clone());
            }
            (true, true) => match files_identical(&a.join(path), &b.join(path)) {
                Ok(true) => {
                    result.matched.insert(path.clone());
                }
                Ok(false) => {
                    result.mismatch.insert(path.clone());
                }
                Err(e) => {
                    result.errors.insert(path.clone(), e.to_string());
                }
            },
            (false, false) => unreachable!("path came from one of the sides"),
        }
    }
    if result.is_empty() {
        warn!("comparison selected no files; check patterns and inputs");
    }
    result
}

fn list_files(
    root: &Path,
    include: &Option<GlobSet>,
    ignore: &Option<GlobSet>,
    result: &mut Comparison,
) -> BTreeSet<String> {
    let mut files = BTreeSet::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| root.display().to_string());
                result.errors.insert(path, e.to_string());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = relative.to_string_lossy().replace('\\', "/");
        if key == MANIFEST_NAME {
            continue;
        }
        if selected(&key, include, ignore) {
            files.insert(key);
        }
    }
    files
}

fn files_identical(a: &Path, b: &Path) -> std::io::Result<bool> {
    let mut file_a = File::open(a)?;
    let mut file_b = File::open(b)?;
    if file_a.metadata()?.len() != file_b.metadata()?.len() {
        return Ok(false);
    }
    let mut buf_a = vec![0u8; READ_CHUNK];
    let mut buf_b = vec![0u8; READ_CHUNK];
    loop {
        let read_a = file_a.read(&mut buf_a)?;
        let read_b = file_b.read(&mut buf_b)?;
        if read_a != read_b || buf_a[..read_a] != buf_b[..read_b] {
            return Ok(false);
        }
        if read_a == 0 {
            return Ok(true);
        }
    }
}
