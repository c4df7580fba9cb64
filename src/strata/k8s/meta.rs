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

use chrono::{DateTime, Utc};
use openssl::hash::{hash, MessageDigest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Minimal representation of Kubernetes object metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: Option<String>,
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: i64,
    #[serde(rename = "creationTimestamp", skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "deletionTimestamp", skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

const fn is_zero(value: &i64) -> bool {
    *value == 0
}

impl ObjectMeta {
    pub fn named(namespace: Option<&str>, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            namespace: namespace.map(|ns| ns.to_string()),
            ..Default::default()
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Sets an annotation; returns true if the stored value changed.
    pub fn set_annotation(&mut self, key: &str, value: &str) -> bool {
        if self.annotation(key) == Some(value) {
            return false;
        }
        self.annotations.insert(key.to_string(), value.to_string());
        true
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds a finalizer; returns true if it was absent.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes a finalizer; returns true if it was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A `(namespace, name)` pair identifying a namespaced resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: String::new(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Reference to another object, stored on volumes and events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectReference {
    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Rolling status condition keyed by type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(rename = "observedGeneration", default, skip_serializing_if = "is_zero")]
    pub observed_generation: i64,
}

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

pub fn get_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.condition_type == condition_type)
}

/// Adds or updates a condition, keeping the previous transition time when the
/// status did not change. Returns true when anything observable changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new_cond: Condition) -> bool {
    new_cond.last_transition_time = Some(Utc::now());
    for existing in conditions.iter_mut() {
        if existing.condition_type == new_cond.condition_type {
            if existing.status == new_cond.status {
                new_cond.last_transition_time = existing.last_transition_time;
            }
            let changed = existing.status != new_cond.status
                || existing.observed_generation != new_cond.observed_generation
                || existing.reason != new_cond.reason
                || existing.message != new_cond.message;
            *existing = new_cond;
            return changed;
        }
    }
    conditions.push(new_cond);
    true
}

/// Builds `<owner>-<suffix>` bounded to the 63-character object name limit,
/// replacing the owner tail with a short digest when truncation is needed.
pub fn resource_name(owner_name: &str, suffix: &str) -> String {
    let max_len = 63 - 8 - 1 - suffix.len();
    let name = format!("{owner_name}-{suffix}");
    if owner_name.len() <= max_len {
        return name;
    }
    let digest = hash(MessageDigest::sha256(), name.as_bytes())
        .map(|d| {
            d.iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        })
        .unwrap_or_default();
    format!("{}-{}", &owner_name[..max_len], &digest[..7])
}

/// Matches a shell-style pattern against a name. Supports `*`, `?` and
/// `[...]` character classes; `*` does not cross `/` boundaries.
pub fn glob_match(pattern: &str, name: &str) -> Result<bool, String> {
    fn class_match(chars: &[char], pos: usize, c: char) -> Result<(bool, usize), String> {
        // pos points just after '['
        let mut i = pos;
        let negated = chars.get(i) == Some(&'!') || chars.get(i) == Some(&'^');
        if negated {
            i += 1;
        }
        let mut matched = false;
        let mut first = true;
        loop {
            let Some(&ch) = chars.get(i) else {
                return Err("unterminated character class".to_string());
            };
            if ch == ']' && !first {
                return Ok((matched != negated, i + 1));
            }
            first = false;
            if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).map(|&c| c != ']').unwrap_or(false)
            {
                let hi = chars[i + 2];
                if ch <= c && c <= hi {
                    matched = true;
                }
                i += 3;
            } else {
                if ch == c {
                    matched = true;
                }
                i += 1;
            }
        }
    }

    fn matches(pattern: &[char], name: &[char]) -> Result<bool, String> {
        if pattern.is_empty() {
            return Ok(name.is_empty());
        }
        match pattern[0] {
            '*' => {
                // Collapse consecutive stars, then try all split points up to
                // the next '/'.
                let rest = &pattern[1..];
                for i in 0..=name.len() {
                    if matches(rest, &name[i..])? {
                        return Ok(true);
                    }
                    if i < name.len() && name[i] == '/' {
                        break;
                    }
                }
                Ok(false)
            }
            '?' => {
                if name.is_empty() || name[0] == '/' {
                    Ok(false)
                } else {
                    matches(&pattern[1..], &name[1..])
                }
            }
            '[' => {
                if name.is_empty() {
                    // Still validate the class so invalid patterns surface.
                    class_match(pattern, 1, '\0')?;
                    return Ok(false);
                }
                let (ok, next) = class_match(pattern, 1, name[0])?;
                if !ok {
                    return Ok(false);
                }
                matches(&pattern[next..], &name[1..])
            }
            c => {
                if name.first() == Some(&c) {
                    matches(&pattern[1..], &name[1..])
                } else {
                    Ok(false)
                }
            }
        }
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    matches(&pattern, &name)
}
