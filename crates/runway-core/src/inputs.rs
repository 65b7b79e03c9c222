//! Input enumeration: glob matching under a database root plus
//! metadata predicate filtering.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSetBuilder};
use serde_json::Value;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{RunwayError, RunwayResult};
use crate::hooks::MetadataProvider;

/// Enumerates inputs matching `patterns` under `database`.
///
/// Matching is recursive and relative to `database`. With
/// `use_parent_folder`, the match is an anchor file and its parent
/// directory is yielded instead. Results are sorted and de-duplicated, so
/// a second call with identical arguments yields the same set.
///
/// Zero matches for a pattern is a warning, not an error: the batch
/// continues with fewer tasks.
pub fn enumerate_inputs(
    database: &Path,
    patterns: &[String],
    only: Option<&Value>,
    exclude: Option<&Value>,
    use_parent_folder: bool,
    metadata: &dyn MetadataProvider,
) -> RunwayResult<Vec<PathBuf>> {
    let mut found: BTreeSet<PathBuf> = BTreeSet::new();

    for pattern in patterns {
        let matched = match_pattern(database, pattern, use_parent_folder)?;
        if matched.is_empty() {
            warn!(pattern, database = %database.display(), "no inputs found");
        }
        found.extend(matched);
    }

    let selected = found
        .into_iter()
        .filter(|path| {
            let meta = metadata.metadata(path);
            let meta_ref = meta.as_ref();
            if let Some(pred) = only {
                if !matches_predicate(meta_ref, pred) {
                    return false;
                }
            }
            if let Some(pred) = exclude {
                if matches_predicate(meta_ref, pred) {
                    return false;
                }
            }
            true
        })
        .collect();
    Ok(selected)
}

fn match_pattern(
    database: &Path,
    pattern: &str,
    use_parent_folder: bool,
) -> RunwayResult<BTreeSet<PathBuf>> {
    // A pattern naming an existing file or directory short-circuits the walk.
    let direct = database.join(pattern);
    if direct.exists() && !pattern.contains(['*', '?', '[']) {
        let mut set = BTreeSet::new();
        set.insert(redirect(&direct, database, use_parent_folder));
        return Ok(set);
    }

    let glob = Glob::new(pattern)
        .map_err(|e| RunwayError::Config(format!("bad input pattern `{}`: {}", pattern, e)))?;
    let set = GlobSetBuilder::new()
        .add(glob)
        .build()
        .map_err(|e| RunwayError::Config(format!("bad input pattern `{}`: {}", pattern, e)))?;

    let mut matched = BTreeSet::new();
    for entry in WalkDir::new(database)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
    {
        let Ok(relative) = entry.path().strip_prefix(database) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        if set.is_match(relative) {
            matched.insert(redirect(entry.path(), database, use_parent_folder));
        }
    }
    Ok(matched)
}

fn redirect(path: &Path, database: &Path, use_parent_folder: bool) -> PathBuf {
    if use_parent_folder {
        if let Some(parent) = path.parent() {
            if parent.starts_with(database) {
                return parent.to_path_buf();
            }
        }
    }
    path.to_path_buf()
}

/// Evaluates a predicate tree against input metadata.
///
/// A map predicate requires all its keys to match (AND). Expected values
/// support exact equality, list membership, case-insensitive wildcard
/// match for strings, and numeric comparisons encoded as prefixed
/// strings (`=`, `>`, `>=`, `<`, `<=`). A missing metadata key matches
/// only an explicitly falsy expectation.
pub fn matches_predicate(metadata: Option<&Value>, predicate: &Value) -> bool {
    match predicate {
        Value::Object(expectations) => expectations.iter().all(|(key, expected)| {
            let actual = metadata.and_then(|m| m.get(key));
            matches_value(actual, expected)
        }),
        other => matches_value(metadata, other),
    }
}

fn matches_value(actual: Option<&Value>, expected: &Value) -> bool {
    match expected {
        Value::Array(choices) => choices.iter().any(|choice| matches_value(actual, choice)),
        Value::Object(nested) => {
            let Some(actual) = actual else {
                return nested.is_empty();
            };
            nested
                .iter()
                .all(|(key, value)| matches_value(actual.get(key), value))
        }
        Value::String(s) => match_string_expectation(actual, s),
        Value::Null => is_falsy(actual),
        Value::Bool(false) => is_falsy(actual),
        other => actual == Some(other),
    }
}

fn match_string_expectation(actual: Option<&Value>, expected: &str) -> bool {
    if let Some(op) = numeric_operator(expected) {
        let Some(actual_num) = actual.and_then(as_number) else {
            return false;
        };
        let Ok(threshold) = expected[op.len()..].trim().parse::<f64>() else {
            return false;
        };
        return match op {
            ">=" => actual_num >= threshold,
            "<=" => actual_num <= threshold,
            ">" => actual_num > threshold,
            "<" => actual_num < threshold,
            "=" => actual_num == threshold,
            _ => false,
        };
    }
    if expected.is_empty() {
        return is_falsy(actual);
    }
    match actual {
        Some(Value::String(s)) => wildcard_match(expected, s),
        Some(other) => wildcard_match(expected, &other.to_string()),
        None => false,
    }
}

fn numeric_operator(expected: &str) -> Option<&'static str> {
    // Longest prefixes first.
    for op in [">=", "<=", ">", "<", "="] {
        if let Some(rest) = expected.strip_prefix(op) {
            if rest.trim().parse::<f64>().is_ok() {
                return Some(op);
            }
        }
    }
    None
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn is_falsy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// Case-insensitive wildcard match supporting `*` and `?`.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();
    wildcard_inner(&pattern, &text)
}

fn wildcard_inner(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => {
            (0..=text.len()).any(|skip| wildcard_inner(rest, &text[skip..]))
        }
        Some(('?', rest)) => match text.split_first() {
            Some((_, text_rest)) => wildcard_inner(rest, text_rest),
            None => false,
        },
        Some((c, rest)) => match text.split_first() {
            Some((t, text_rest)) if t == c => wildcard_inner(rest, text_rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoMetadata;
    use serde_json::json;
    use std::collections::HashMap;

    struct FixedMetadata(HashMap<PathBuf, Value>);

    impl MetadataProvider for FixedMetadata {
        fn metadata(&self, input_path: &Path) -> Option<Value> {
            self.0.get(input_path).cloned()
        }
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scenes/day")).unwrap();
        std::fs::write(dir.path().join("scenes/day/a.raw"), b"a").unwrap();
        std::fs::write(dir.path().join("scenes/day/b.raw"), b"b").unwrap();
        std::fs::write(dir.path().join("scenes/c.raw"), b"c").unwrap();
        std::fs::write(dir.path().join("scenes/readme.txt"), b"r").unwrap();
        dir
    }

    #[test]
    fn test_enumeration_matches_and_is_restartable() {
        let dir = fixture();
        let patterns = vec!["scenes/**/*.raw".to_string()];
        let first =
            enumerate_inputs(dir.path(), &patterns, None, None, false, &NoMetadata).unwrap();
        assert_eq!(first.len(), 3, "3 matching files, 1 non-matching");
        let second =
            enumerate_inputs(dir.path(), &patterns, None, None, false, &NoMetadata).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_matches_is_not_an_error() {
        let dir = fixture();
        let patterns = vec!["missing/**/*.raw".to_string()];
        let found =
            enumerate_inputs(dir.path(), &patterns, None, None, false, &NoMetadata).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_use_parent_folder_yields_directories() {
        let dir = fixture();
        let patterns = vec!["scenes/day/*.raw".to_string()];
        let found =
            enumerate_inputs(dir.path(), &patterns, None, None, true, &NoMetadata).unwrap();
        assert_eq!(found, vec![dir.path().join("scenes/day")]);
    }

    #[test]
    fn test_literal_path_short_circuits() {
        let dir = fixture();
        let patterns = vec!["scenes/c.raw".to_string()];
        let found =
            enumerate_inputs(dir.path(), &patterns, None, None, false, &NoMetadata).unwrap();
        assert_eq!(found, vec![dir.path().join("scenes/c.raw")]);
    }

    #[test]
    fn test_only_and_exclude_predicates() {
        let dir = fixture();
        let a = dir.path().join("scenes/day/a.raw");
        let b = dir.path().join("scenes/day/b.raw");
        let c = dir.path().join("scenes/c.raw");
        let mut meta = HashMap::new();
        meta.insert(a.clone(), json!({"sensor": "IMX600", "lux": 120}));
        meta.insert(b.clone(), json!({"sensor": "IMX700", "lux": 3}));
        meta.insert(c.clone(), json!({"sensor": "OV2740", "lux": 80}));
        let provider = FixedMetadata(meta);

        let patterns = vec!["scenes/**/*.raw".to_string()];
        let only = json!({"sensor": "imx*"});
        let exclude = json!({"lux": "<10"});
        let found = enumerate_inputs(
            dir.path(),
            &patterns,
            Some(&only),
            Some(&exclude),
            false,
            &provider,
        )
        .unwrap();
        assert_eq!(found, vec![a]);
    }

    #[test]
    fn test_predicate_operators() {
        let meta = json!({"lux": 120, "sensor": "IMX600", "hdr": false});
        let m = Some(&meta);
        assert!(matches_predicate(m, &json!({"lux": ">=120"})));
        assert!(matches_predicate(m, &json!({"lux": ">100"})));
        assert!(!matches_predicate(m, &json!({"lux": "<100"})));
        assert!(matches_predicate(m, &json!({"lux": "=120"})));
        assert!(matches_predicate(m, &json!({"sensor": ["ov*", "imx*"]})));
        assert!(!matches_predicate(m, &json!({"sensor": ["ov*"]})));
        // AND semantics across keys.
        assert!(!matches_predicate(m, &json!({"lux": ">100", "sensor": "ov*"})));
        // Missing key matches only a falsy expectation.
        assert!(matches_predicate(m, &json!({"night_mode": false})));
        assert!(matches_predicate(m, &json!({"night_mode": null})));
        assert!(!matches_predicate(m, &json!({"night_mode": true})));
        assert!(matches_predicate(m, &json!({"hdr": false})));
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("imx*", "IMX600"));
        assert!(wildcard_match("*600", "imx600"));
        assert!(wildcard_match("imx?00", "imx600"));
        assert!(!wildcard_match("imx?0", "imx600"));
        assert!(wildcard_match("*", ""));
    }
}
