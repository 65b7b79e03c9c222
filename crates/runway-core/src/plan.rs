//! Batch expansion: resolved groups + enumerated inputs + tuning
//! combinations -> one RunContext per (input x tuning) pair.

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, warn};

use crate::batches::{overlay_input, resolve, BatchDefaults, BatchFile};
use crate::context::{RunContext, RunContextBuilder};
use crate::error::{RunwayError, RunwayResult};
use crate::hooks::{CommandBuilder, InputIterator, MetadataProvider};
use crate::inputs::enumerate_inputs;
use crate::tuning::tuning_combinations;

pub struct PlanRequest<'a> {
    pub batch_names: &'a [String],
    pub file: &'a BatchFile,
    pub defaults: &'a BatchDefaults,
    /// Label grouping all tasks of this invocation (first path segment of
    /// every output directory).
    pub batch_label: String,
    pub output_root: PathBuf,
    pub tuning_search: Option<&'a Value>,
    pub command_builder: &'a dyn CommandBuilder,
    pub metadata: &'a dyn MetadataProvider,
    /// Overrides filesystem enumeration when a project supplies its own.
    pub input_iterator: Option<&'a dyn InputIterator>,
}

/// Expands the requested batches into RunContexts, dispatch order =
/// enumeration order. Duplicate output directories within one plan are
/// collapsed (identical work would race on its own outputs).
pub fn expand(request: &PlanRequest<'_>) -> RunwayResult<Vec<RunContext>> {
    let resolved = resolve(request.batch_names, request.file, request.defaults)?;
    let combinations = tuning_combinations(request.tuning_search)?;

    let mut contexts = Vec::new();
    let mut seen_output_dirs: HashSet<PathBuf> = HashSet::new();

    for batch in &resolved {
        let entries = if batch.group.inputs.is_empty() {
            warn!(batch = %batch.name, "group has no inputs");
            continue;
        } else {
            &batch.group.inputs
        };

        for entry in entries {
            let Some(pattern) = entry.path() else {
                continue;
            };
            let group = match entry.overrides() {
                Some(overrides) => overlay_input(&batch.group, overrides),
                None => batch.group.clone(),
            };
            let database = group.database.clone().ok_or_else(|| {
                RunwayError::Config(format!(
                    "batch `{}` has no database root (set one in the batch file or pass --database)",
                    batch.name
                ))
            })?;
            let platform = group
                .platform
                .clone()
                .unwrap_or_else(|| "linux".to_string());

            let inputs = match request.input_iterator {
                Some(iterator) => iterator.iter_inputs(&database, pattern)?,
                None => enumerate_inputs(
                    &database,
                    std::slice::from_ref(&pattern.to_string()),
                    group.only.as_ref(),
                    group.exclude.as_ref(),
                    group.use_parent_folder,
                    request.metadata,
                )?,
            };
            debug!(batch = %batch.name, pattern, count = inputs.len(), "enumerated inputs");

            for input in inputs {
                for combination in &combinations {
                    let mut context = RunContextBuilder::new(&request.batch_label, &platform)
                        .database(&database)
                        .input(&input)
                        .output_root(&request.output_root)
                        .configurations(group.configurations.clone())
                        .extra_parameters(combination.clone())
                        .runner_options(group.runner.clone())
                        .build()?;
                    context.command = request.command_builder.command(&context)?;

                    if !seen_output_dirs.insert(context.output_dir.clone()) {
                        warn!(
                            output_dir = %context.output_dir.display(),
                            "duplicate task collapsed"
                        );
                        continue;
                    }
                    contexts.push(context);
                }
            }
        }
    }
    Ok(contexts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batches::parse_batch_file;
    use crate::hooks::{NoMetadata, ShellCommandBuilder};
    use serde_json::json;
    use std::path::Path;

    fn fixture() -> (tempfile::TempDir, BatchFile) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scenes")).unwrap();
        std::fs::write(dir.path().join("scenes/a.raw"), b"a").unwrap();
        std::fs::write(dir.path().join("scenes/b.raw"), b"b").unwrap();
        let yaml = r#"
groups:
  g:
    inputs: [ "scenes/*.raw" ]
    configurations: [ base ]
"#;
        let file = parse_batch_file(yaml, Path::new("t.yaml")).unwrap();
        (dir, file)
    }

    fn request<'a>(
        names: &'a [String],
        dir: &'a tempfile::TempDir,
        file: &'a BatchFile,
        defaults: &'a BatchDefaults,
        builder: &'a ShellCommandBuilder,
        tuning: Option<&'a Value>,
    ) -> PlanRequest<'a> {
        PlanRequest {
            batch_names: names,
            file,
            defaults,
            batch_label: "ci-42".into(),
            output_root: dir.path().join("out"),
            tuning_search: tuning,
            command_builder: builder,
            metadata: &NoMetadata,
            input_iterator: None,
        }
    }

    #[test]
    fn test_expand_inputs_times_tuning() {
        let (dir, file) = fixture();
        let defaults = BatchDefaults {
            database: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let builder = ShellCommandBuilder::new("process {input}");
        let tuning = json!({"gain": [1, 2]});
        let names = vec!["g".to_string()];
        let req = request(&names, &dir, &file, &defaults, &builder, Some(&tuning));
        let contexts = expand(&req).unwrap();
        assert_eq!(contexts.len(), 4, "2 inputs x 2 tuning combinations");
        // Output directories are unique within a plan.
        let dirs: HashSet<_> = contexts.iter().map(|c| c.output_dir.clone()).collect();
        assert_eq!(dirs.len(), 4);
        assert!(contexts[0].command.starts_with("process "));
    }

    #[test]
    fn test_expand_without_tuning_is_one_per_input() {
        let (dir, file) = fixture();
        let defaults = BatchDefaults {
            database: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let builder = ShellCommandBuilder::new("echo {input}");
        let names = vec!["g".to_string()];
        let req = request(&names, &dir, &file, &defaults, &builder, None);
        let contexts = expand(&req).unwrap();
        assert_eq!(contexts.len(), 2);
    }

    #[test]
    fn test_missing_database_is_config_error() {
        let (dir, file) = fixture();
        let defaults = BatchDefaults::default();
        let builder = ShellCommandBuilder::new("echo");
        let names = vec!["g".to_string()];
        let req = request(&names, &dir, &file, &defaults, &builder, None);
        let err = expand(&req).unwrap_err();
        assert!(matches!(err, RunwayError::Config(_)));
    }
}
