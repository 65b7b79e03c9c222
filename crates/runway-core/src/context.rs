//! The immutable-after-construction description of one task.

use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{RunwayError, RunwayResult};
use crate::types::{ConfigLayer, TaskStatus};

/// Width of the configuration hash embedded in output directories.
const HASH_WIDTH: usize = 8;

/// One expanded (input x tuning) task. Created once, owned by the Job
/// that wraps it, and not mutated after dispatch begins except for its
/// status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    /// Absolute path of the resource under test. Always inside `database`.
    pub input_path: PathBuf,
    /// The database root `input_path` is relative to.
    pub database: PathBuf,
    pub batch_label: String,
    pub platform: String,
    /// Ordered configuration layers; last wins.
    pub configurations: Vec<ConfigLayer>,
    /// Tuning values merged on top of `configurations`.
    pub extra_parameters: Map<String, Value>,
    pub output_dir: PathBuf,
    /// Resolved shell command to execute.
    pub command: String,
    /// Runner type tag plus runner-specific fields.
    pub runner_options: Map<String, Value>,
    status: TaskStatus,
}

impl RunContext {
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Applies a status transition. Illegal transitions (other than a
    /// forced failure, which is always legal) are logged and ignored.
    pub fn set_status(&mut self, next: TaskStatus) {
        if self.status == next {
            return;
        }
        if self.status.can_transition(next) {
            self.status = next;
        } else {
            warn!(
                input = %self.input_path.display(),
                from = self.status.as_str(),
                to = next.as_str(),
                "ignoring illegal status transition"
            );
        }
    }

    /// Input path relative to the database root.
    pub fn relative_input(&self) -> &Path {
        self.input_path
            .strip_prefix(&self.database)
            .unwrap_or(&self.input_path)
    }

    /// A short human label for logs and job names.
    pub fn label(&self) -> String {
        self.relative_input().to_string_lossy().replace('\\', "/")
    }
}

/// Builder for [`RunContext`]. The output directory is derived, not set:
/// `<output_root>/<batch_label>/<platform>/<hash>/<relative input>` with
/// a deterministic hash over configurations + extra parameters.
#[derive(Debug, Clone, Default)]
pub struct RunContextBuilder {
    batch_label: String,
    platform: String,
    database: PathBuf,
    input_path: PathBuf,
    output_root: PathBuf,
    configurations: Vec<ConfigLayer>,
    extra_parameters: Map<String, Value>,
    command: String,
    runner_options: Map<String, Value>,
}

impl RunContextBuilder {
    pub fn new(batch_label: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            batch_label: batch_label.into(),
            platform: platform.into(),
            ..Default::default()
        }
    }

    pub fn database(mut self, database: impl Into<PathBuf>) -> Self {
        self.database = database.into();
        self
    }

    pub fn input(mut self, input_path: impl Into<PathBuf>) -> Self {
        self.input_path = input_path.into();
        self
    }

    pub fn output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
        self.output_root = output_root.into();
        self
    }

    pub fn configurations(mut self, configurations: Vec<ConfigLayer>) -> Self {
        self.configurations = configurations;
        self
    }

    pub fn extra_parameters(mut self, extra_parameters: Map<String, Value>) -> Self {
        self.extra_parameters = extra_parameters;
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn runner_options(mut self, runner_options: Map<String, Value>) -> Self {
        self.runner_options = runner_options;
        self
    }

    pub fn build(self) -> RunwayResult<RunContext> {
        let relative = self.input_path.strip_prefix(&self.database).map_err(|_| {
            RunwayError::Config(format!(
                "input {} is not inside database root {}",
                self.input_path.display(),
                self.database.display()
            ))
        })?;

        let hash = configuration_hash(&self.configurations, &self.extra_parameters);
        let output_dir = self
            .output_root
            .join(&self.batch_label)
            .join(&self.platform)
            .join(&hash)
            .join(relative);

        Ok(RunContext {
            input_path: self.input_path,
            database: self.database,
            batch_label: self.batch_label,
            platform: self.platform,
            configurations: self.configurations,
            extra_parameters: self.extra_parameters,
            output_dir,
            command: self.command,
            runner_options: self.runner_options,
            status: TaskStatus::NotStarted,
        })
    }
}

/// Stable hash over configuration layers and tuning parameters.
///
/// Serialization is canonical (object keys sorted) so two calls with
/// identical inputs are byte-identical regardless of map insertion order.
pub fn configuration_hash(
    configurations: &[ConfigLayer],
    extra_parameters: &Map<String, Value>,
) -> String {
    let mut canonical = String::new();
    canonical.push('[');
    for (i, layer) in configurations.iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        match layer {
            ConfigLayer::Label(s) => canonical.push_str(&Value::String(s.clone()).to_string()),
            ConfigLayer::Object(map) => {
                canonical_value(&Value::Object(map.clone()), &mut canonical)
            }
        }
    }
    canonical.push(']');
    canonical_value(&Value::Object(extra_parameters.clone()), &mut canonical);

    let digest = Md5::digest(canonical.as_bytes());
    hex::encode(digest)[..HASH_WIDTH].to_string()
}

fn canonical_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                canonical_value(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_value(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
