//! Capability seams a project plugs into the engine.
//!
//! The engine depends only on these traits; how an implementation is
//! loaded (static link, dynamic library, subprocess) is the host's
//! concern.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::context::RunContext;
use crate::error::RunwayResult;

/// Builds the shell command for one task.
pub trait CommandBuilder: Send + Sync {
    fn command(&self, context: &RunContext) -> RunwayResult<String>;
}

/// Computes per-input metadata evaluated by `only`/`exclude` predicates.
pub trait MetadataProvider: Send + Sync {
    fn metadata(&self, input_path: &Path) -> Option<Value>;
}

/// Overrides filesystem enumeration entirely.
pub trait InputIterator: Send + Sync {
    fn iter_inputs(&self, database: &Path, pattern: &str) -> RunwayResult<Vec<PathBuf>>;
}

/// Default command builder: substitutes `{input}`, `{output_dir}`,
/// `{database}` and `{platform}` placeholders in a template string.
pub struct ShellCommandBuilder {
    pub template: String,
}

impl ShellCommandBuilder {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl CommandBuilder for ShellCommandBuilder {
    fn command(&self, context: &RunContext) -> RunwayResult<String> {
        Ok(self
            .template
            .replace("{input}", &context.input_path.to_string_lossy())
            .replace("{output_dir}", &context.output_dir.to_string_lossy())
            .replace("{database}", &context.database.to_string_lossy())
            .replace("{platform}", &context.platform))
    }
}

/// Default metadata provider: no metadata, so `only` predicates match
/// nothing non-falsy and `exclude` predicates never fire.
pub struct NoMetadata;

impl MetadataProvider for NoMetadata {
    fn metadata(&self, _input_path: &Path) -> Option<Value> {
        None
    }
}
