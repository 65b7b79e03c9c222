//! Batch specification files.
//!
//! A batch file is YAML with two top-level maps: `groups` (batch name ->
//! inputs/settings) and `aliases` (name -> list of batch names). Multiple
//! files are deep-merged before resolution, later files winning on leaf
//! conflicts while nested maps merge key-by-key.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{RunwayError, RunwayResult};
use crate::types::ConfigLayer;

/// Backstop for alias expansion; a chain deeper than this is a
/// configuration error even without a detected cycle.
pub const MAX_ALIAS_DEPTH: usize = 10;

/// One batch group as written in a batch file. All fields are optional:
/// anything unset falls back to the caller-supplied defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchGroup {
    #[serde(default)]
    pub inputs: Vec<InputEntry>,
    #[serde(default)]
    pub only: Option<Value>,
    #[serde(default)]
    pub exclude: Option<Value>,
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub configurations: Vec<ConfigLayer>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default, rename = "type")]
    pub group_type: Option<String>,
    /// Runner overrides: `type` tag plus runner-specific fields
    /// (LSF queue/memory/priority, local concurrency, ...).
    #[serde(default)]
    pub runner: Map<String, Value>,
    #[serde(default)]
    pub use_parent_folder: bool,
}

/// An input is either a bare path (or glob) or a single-key map carrying
/// per-input overrides, merged one level deep.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputEntry {
    Path(String),
    Override(IndexMap<String, BatchGroup>),
}

impl InputEntry {
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Path(p) => Some(p),
            Self::Override(map) => map.keys().next().map(|k| k.as_str()),
        }
    }

    pub fn overrides(&self) -> Option<&BatchGroup> {
        match self {
            Self::Path(_) => None,
            Self::Override(map) => map.values().next(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchFile {
    #[serde(default)]
    pub groups: IndexMap<String, BatchGroup>,
    #[serde(default)]
    pub aliases: IndexMap<String, Vec<String>>,
}

/// Caller-supplied defaults a resolved group overlays.
#[derive(Debug, Clone, Default)]
pub struct BatchDefaults {
    pub database: Option<PathBuf>,
    pub platform: Option<String>,
    pub configurations: Vec<ConfigLayer>,
    pub runner_options: Map<String, Value>,
}

/// A fully merged group ready for input enumeration.
#[derive(Debug, Clone)]
pub struct ResolvedBatch {
    pub name: String,
    pub group: BatchGroup,
}

/// Recursive merge over JSON values: maps merge key-by-key, everything
/// else is replaced by the overlay (last wins on leaves).
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Loads and deep-merges one or more batch files. An empty file is `{}`.
pub fn load_batch_files(paths: &[PathBuf]) -> RunwayResult<BatchFile> {
    let mut merged = Value::Object(Map::new());
    for path in paths {
        let raw = std::fs::read_to_string(path).map_err(|source| RunwayError::ReadFile {
            path: path.clone(),
            source,
        })?;
        let value: Value =
            serde_yaml::from_str(&raw).map_err(|source| RunwayError::YamlParse {
                path: path.clone(),
                source,
            })?;
        match value {
            Value::Null => {}
            value @ Value::Object(_) => deep_merge(&mut merged, &value),
            _ => {
                return Err(RunwayError::Config(format!(
                    "batch file {} must be a mapping",
                    path.display()
                )));
            }
        }
    }
    let file: BatchFile = serde_json::from_value(merged)?;
    Ok(file)
}

/// Expands aliases in `names` to a flat list of group names.
///
/// Resolution is idempotent: plain group names pass through unchanged.
/// A name appearing in its own expansion chain is a configuration error,
/// as is a chain deeper than [`MAX_ALIAS_DEPTH`].
pub fn resolve_names(names: &[String], file: &BatchFile) -> RunwayResult<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = Vec::new();
    for name in names {
        expand_name(name, file, &mut stack, &mut out)?;
    }
    Ok(out)
}

fn expand_name<'a>(
    name: &'a str,
    file: &'a BatchFile,
    stack: &mut Vec<&'a str>,
    out: &mut Vec<String>,
) -> RunwayResult<()> {
    let Some(targets) = file.aliases.get(name) else {
        out.push(name.to_string());
        return Ok(());
    };
    if stack.contains(&name) {
        return Err(RunwayError::Config(format!(
            "alias `{}` references itself (chain: {})",
            name,
            stack.join(" -> ")
        )));
    }
    if stack.len() >= MAX_ALIAS_DEPTH {
        return Err(RunwayError::Config(format!(
            "alias chain exceeds depth {} at `{}`",
            MAX_ALIAS_DEPTH, name
        )));
    }
    stack.push(name);
    for target in targets {
        expand_name(target, file, stack, out)?;
    }
    stack.pop();
    Ok(())
}

/// Resolves `batch_names` against `file`, applying `defaults` to each
/// matched group. A name matching neither a group nor an alias is treated
/// as an input glob under the default database root when one is set,
/// otherwise it is an [`RunwayError::UnknownBatch`].
pub fn resolve(
    batch_names: &[String],
    file: &BatchFile,
    defaults: &BatchDefaults,
) -> RunwayResult<Vec<ResolvedBatch>> {
    let names = resolve_names(batch_names, file)?;
    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        if let Some(group) = file.groups.get(&name) {
            resolved.push(ResolvedBatch {
                group: overlay_defaults(group, defaults),
                name,
            });
        } else if defaults.database.is_some() {
            // Implicit fallback: the name itself is an input glob.
            let group = BatchGroup {
                inputs: vec![InputEntry::Path(name.clone())],
                ..Default::default()
            };
            resolved.push(ResolvedBatch {
                group: overlay_defaults(&group, defaults),
                name,
            });
        } else {
            return Err(RunwayError::UnknownBatch { name });
        }
    }
    Ok(resolved)
}

/// Overlays caller defaults under a group: scalars shallow-replace (the
/// group wins when set), configuration lists append with the defaults as
/// prefix, runner option maps deep-merge.
fn overlay_defaults(group: &BatchGroup, defaults: &BatchDefaults) -> BatchGroup {
    let mut effective = group.clone();
    if effective.database.is_none() {
        effective.database = defaults.database.clone();
    }
    if effective.platform.is_none() {
        effective.platform = defaults.platform.clone();
    }
    effective.configurations = concat_layers(&defaults.configurations, &group.configurations);
    effective.runner = merge_option_maps(&defaults.runner_options, &group.runner);
    effective
}

/// Merges per-input overrides onto an already resolved group, one level
/// deep, with the same append/replace semantics as group overrides.
pub fn overlay_input(group: &BatchGroup, overrides: &BatchGroup) -> BatchGroup {
    let mut effective = group.clone();
    if overrides.database.is_some() {
        effective.database = overrides.database.clone();
    }
    if overrides.platform.is_some() {
        effective.platform = overrides.platform.clone();
    }
    if overrides.only.is_some() {
        effective.only = overrides.only.clone();
    }
    if overrides.exclude.is_some() {
        effective.exclude = overrides.exclude.clone();
    }
    if overrides.use_parent_folder {
        effective.use_parent_folder = true;
    }
    effective.configurations = concat_layers(&group.configurations, &overrides.configurations);
    effective.runner = merge_option_maps(&group.runner, &overrides.runner);
    effective.inputs = Vec::new();
    effective
}

fn concat_layers(prefix: &[ConfigLayer], suffix: &[ConfigLayer]) -> Vec<ConfigLayer> {
    let mut layers = Vec::with_capacity(prefix.len() + suffix.len());
    layers.extend_from_slice(prefix);
    layers.extend_from_slice(suffix);
    layers
}

fn merge_option_maps(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = Value::Object(base.clone());
    deep_merge(&mut merged, &Value::Object(overlay.clone()));
    match merged {
        Value::Object(map) => map,
        _ => unreachable!("merge of two objects is an object"),
    }
}

/// Convenience for tests and callers holding YAML in memory.
pub fn parse_batch_file(yaml: &str, origin: &Path) -> RunwayResult<BatchFile> {
    let value: Value = serde_yaml::from_str(yaml).map_err(|source| RunwayError::YamlParse {
        path: origin.to_path_buf(),
        source,
    })?;
    match value {
        Value::Null => Ok(BatchFile::default()),
        value @ Value::Object(_) => Ok(serde_json::from_value(value)?),
        _ => Err(RunwayError::Config(format!(
            "batch file {} must be a mapping",
            origin.display()
        ))),
    }
}
