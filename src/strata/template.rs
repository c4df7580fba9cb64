/*
 * Copyright (C) 2024 The Strata Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::strata::util::error::{new_error, with_context, DynError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Deterministic `${VAR}` expansion over nested string/map/list structures.
/// Undefined variables and empty values are errors; errors carry the
/// dotted/indexed path to the offending string.
pub struct Substitution {
    name: String,
    values: HashMap<String, String>,
}

impl Substitution {
    pub fn new(name: impl Into<String>, values: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Expands `${VAR}` tokens within a single string. Bare `$` characters
    /// not followed by `{` pass through untouched.
    pub fn substitute_string(&self, template: &str) -> Result<String, DynError> {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                return Err(new_error(format!(
                    "{}: unterminated variable reference in {:?}",
                    self.name, template
                )));
            };
            let var = &after[..end];
            match self.values.get(var) {
                None => {
                    return Err(new_error(format!(
                        "{}: variable ${{{var}}} is not set",
                        self.name
                    )));
                }
                Some(value) if value.is_empty() => {
                    return Err(new_error(format!(
                        "{}: variable ${{{var}}} is set but empty",
                        self.name
                    )));
                }
                Some(value) => result.push_str(value),
            }
            rest = &after[end + 1..];
        }
        result.push_str(rest);
        Ok(result)
    }

    /// Expands every string within a nested JSON value; leaf scalars other
    /// than strings are untouched.
    pub fn substitute_value(&self, template: Value) -> Result<Value, DynError> {
        self.substitute(template, "")
    }

    fn substitute(&self, template: Value, path: &str) -> Result<Value, DynError> {
        match template {
            Value::String(s) => self
                .substitute_string(&s)
                .map(Value::String)
                .map_err(|e| with_context(e, path.to_string())),
            Value::Object(map) => {
                let mut result = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    let child_path = format!("{path}.{key}");
                    result.insert(key, self.substitute(value, &child_path)?);
                }
                Ok(Value::Object(result))
            }
            Value::Array(items) => {
                let mut result = Vec::with_capacity(items.len());
                for (index, value) in items.into_iter().enumerate() {
                    let child_path = format!("{path}[{index}]");
                    result.push(self.substitute(value, &child_path)?);
                }
                Ok(Value::Array(result))
            }
            other => Ok(other),
        }
    }

    /// Expands a typed object through a JSON round-trip.
    pub fn substitute_object<T>(&self, object: &T) -> Result<T, DynError>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = serde_json::to_value(object)
            .map_err(|e| with_context(e, format!("convert {} to value", self.name)))?;
        let substituted = self.substitute_value(value)?;
        serde_json::from_value(substituted)
            .map_err(|e| with_context(e, format!("convert substituted {} back", self.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn substitution(values: &[(&str, &str)]) -> Substitution {
        Substitution::new(
            "test template",
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn expands_variables_in_nested_structures() {
        let sub = substitution(&[("STORAGE_NODE_NAME", "node-1"), ("STORAGE_PV_NAME", "pvc-u1")]);
        let template = json!({
            "spec": {
                "containers": [{
                    "name": "provisioner",
                    "command": ["sh", "-c", "mkdir /data/${STORAGE_PV_NAME}"],
                    "env": [{"name": "NODE", "value": "${STORAGE_NODE_NAME}"}],
                }],
                "replicas": 1,
            }
        });
        let result = sub.substitute_value(template).unwrap();
        assert_eq!(
            result["spec"]["containers"][0]["command"][2],
            "mkdir /data/pvc-u1"
        );
        assert_eq!(result["spec"]["containers"][0]["env"][0]["value"], "node-1");
        assert_eq!(result["spec"]["replicas"], 1);
    }

    #[test]
    fn undefined_variable_errors_with_path() {
        let sub = substitution(&[]);
        let template = json!({
            "spec": {"containers": [{"command": ["a", "b", "${MISSING}"]}]}
        });
        let err = sub.substitute_value(template).unwrap_err().to_string();
        assert!(
            err.contains(".spec.containers[0].command[2]"),
            "missing path in error: {err}"
        );
        assert!(err.contains("${MISSING}"), "missing variable name: {err}");
    }

    #[test]
    fn empty_variable_is_rejected() {
        let sub = substitution(&[("EMPTY", "")]);
        let err = sub.substitute_string("x ${EMPTY} y").unwrap_err().to_string();
        assert!(err.contains("set but empty"), "unexpected error: {err}");
    }

    #[test]
    fn unterminated_reference_is_rejected() {
        let sub = substitution(&[("A", "1")]);
        assert!(sub.substitute_string("x ${A").is_err());
    }

    #[test]
    fn bare_dollar_passes_through() {
        let sub = substitution(&[]);
        assert_eq!(sub.substitute_string("cost is $5").unwrap(), "cost is $5");
    }

    #[test]
    fn substitution_is_idempotent_when_no_tokens_remain() {
        let sub = substitution(&[("V", "value")]);
        let once = sub.substitute_string("a ${V} b").unwrap();
        let twice = sub.substitute_string(&once).unwrap();
        assert_eq!(once, twice);
    }
}
