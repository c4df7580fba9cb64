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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI image configuration document.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OciImage {
    pub created: String,
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub config: Config,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Entrypoint", skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(rename = "Labels", skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub type_field: String,
    #[serde(rename = "diff_ids")]
    pub diff_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(rename = "created_by", skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "empty_layer", skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// Structural history comparison: created, createdBy, author, comment and
/// emptyLayer must match pairwise.
pub fn histories_equal(a: &[HistoryEntry], b: &[HistoryEntry]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|(x, y)| {
            x.created == y.created
                && x.created_by == y.created_by
                && x.author == y.author
                && x.comment == y.comment
                && x.empty_layer.unwrap_or(false) == y.empty_layer.unwrap_or(false)
        })
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// Multi-platform image index; pulls resolve it to a single manifest.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub manifests: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(created_by: &str) -> HistoryEntry {
        HistoryEntry {
            created: Some("2024-01-01T00:00:00Z".to_string()),
            created_by: Some(created_by.to_string()),
            author: None,
            comment: None,
            empty_layer: None,
        }
    }

    #[test]
    fn history_comparison_is_structural() {
        let a = vec![entry("commit"), entry("commit")];
        let mut b = a.clone();
        assert!(histories_equal(&a, &b));

        // An absent empty_layer equals an explicit false.
        b[0].empty_layer = Some(false);
        assert!(histories_equal(&a, &b));

        b[1].created_by = Some("other".to_string());
        assert!(!histories_equal(&a, &b));
        assert!(!histories_equal(&a, &a[..1]));
    }

    #[test]
    fn manifest_round_trips() {
        let manifest = OciManifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config: Descriptor {
                media_type: MEDIA_TYPE_CONFIG.to_string(),
                digest: format!("sha256:{}", "0".repeat(64)),
                size: 5,
            },
            layers: vec![Descriptor {
                media_type: MEDIA_TYPE_LAYER.to_string(),
                digest: format!("sha256:{}", "1".repeat(64)),
                size: 9,
            }],
            annotations: None,
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"schemaVersion\":2"));
        let parsed: OciManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.layers.len(), 1);
    }
}
