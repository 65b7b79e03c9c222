//! Tuning parameter search: expands a search specification into the
//! concrete parameter combinations each input is run with.

use serde_json::{Map, Value};

use crate::error::{RunwayError, RunwayResult};

/// Expands a tuning search into parameter combinations.
///
/// Accepts `{"parameter_search": {param: [values...]}, "search_type":
/// "grid"}` or a bare parameter map. Grid search takes the cartesian
/// product in sorted key order, so the combination order is stable.
/// No search yields a single empty combination.
pub fn tuning_combinations(search: Option<&Value>) -> RunwayResult<Vec<Map<String, Value>>> {
    let Some(search) = search else {
        return Ok(vec![Map::new()]);
    };

    let (parameters, search_type) = match search {
        Value::Object(map) if map.contains_key("parameter_search") => {
            let parameters = map["parameter_search"].as_object().ok_or_else(|| {
                RunwayError::Config("parameter_search must be a map".to_string())
            })?;
            let search_type = map
                .get("search_type")
                .and_then(Value::as_str)
                .unwrap_or("grid");
            (parameters, search_type)
        }
        Value::Object(map) => (map, "grid"),
        _ => {
            return Err(RunwayError::Config(
                "tuning search must be a JSON object".to_string(),
            ));
        }
    };

    if search_type != "grid" {
        return Err(RunwayError::Config(format!(
            "unsupported search_type `{}` (only `grid` is supported)",
            search_type
        )));
    }

    let mut keys: Vec<&String> = parameters.keys().collect();
    keys.sort();

    let mut combinations = vec![Map::new()];
    for key in keys {
        let choices: Vec<Value> = match &parameters[key.as_str()] {
            Value::Array(values) => values.clone(),
            scalar => vec![scalar.clone()],
        };
        let mut expanded = Vec::with_capacity(combinations.len() * choices.len());
        for combination in &combinations {
            for choice in &choices {
                let mut next = combination.clone();
                next.insert(key.to_string(), choice.clone());
                expanded.push(next);
            }
        }
        combinations = expanded;
    }
    Ok(combinations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_search_is_one_empty_combination() {
        let combos = tuning_combinations(None).unwrap();
        assert_eq!(combos.len(), 1);
        assert!(combos[0].is_empty());
    }

    #[test]
    fn test_grid_cartesian_product() {
        let search = json!({
            "parameter_search": {"gain": [1, 2], "mode": ["fast", "slow"]},
            "search_type": "grid"
        });
        let combos = tuning_combinations(Some(&search)).unwrap();
        assert_eq!(combos.len(), 4);
        // Sorted key order makes the sequence stable.
        assert_eq!(combos[0]["gain"], json!(1));
        assert_eq!(combos[0]["mode"], json!("fast"));
        assert_eq!(combos[3]["gain"], json!(2));
        assert_eq!(combos[3]["mode"], json!("slow"));
    }

    #[test]
    fn test_bare_map_and_scalars() {
        let search = json!({"gain": [1, 2], "clip": true});
        let combos = tuning_combinations(Some(&search)).unwrap();
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().all(|c| c["clip"] == json!(true)));
    }

    #[test]
    fn test_unsupported_search_type() {
        let search = json!({"parameter_search": {"x": [1]}, "search_type": "bayesian"});
        let err = tuning_combinations(Some(&search)).unwrap_err();
        assert!(matches!(err, RunwayError::Config(_)));
    }
}
