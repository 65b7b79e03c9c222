//! Output manifests: path -> {size, md5} for fast bit-accuracy checks.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::{RunwayError, RunwayResult};

/// File name of the manifest inside an output directory.
pub const MANIFEST_NAME: &str = "manifest.outputs.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDigest {
    pub st_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
}

/// Map of posix-style relative path -> digest, sorted for stable output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputManifest {
    pub files: BTreeMap<String, FileDigest>,
}

impl OutputManifest {
    /// Hashes every file under `dir` (the manifest file itself excluded).
    pub fn from_dir(dir: &Path) -> RunwayResult<Self> {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let Ok(relative) = entry.path().strip_prefix(dir) else {
                continue;
            };
            let key = relative.to_string_lossy().replace('\\', "/");
            if key == MANIFEST_NAME {
                continue;
            }
            let data = std::fs::read(entry.path()).map_err(|source| RunwayError::ReadFile {
                path: entry.path().to_path_buf(),
                source,
            })?;
            files.insert(
                key,
                FileDigest {
                    st_size: data.len() as u64,
                    md5: Some(hex::encode(Md5::digest(&data))),
                },
            );
        }
        Ok(Self { files })
    }

    pub fn load(path: &Path) -> RunwayResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| RunwayError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Whole-file rewrite: written to a temp file in the same directory,
    /// then renamed over the target.
    pub fn write_atomic(&self, path: &Path) -> RunwayResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let write = || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            tmp.persist(path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|source| RunwayError::WriteFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Locates the manifest for a side of a comparison: the path itself if
    /// it is a file, else `<dir>/manifest.outputs.json` if present.
    pub fn locate(side: &Path) -> Option<std::path::PathBuf> {
        if side.is_file() {
            return Some(side.to_path_buf());
        }
        let candidate = side.join(MANIFEST_NAME);
        candidate.is_file().then_some(candidate)
    }
}
