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

use crate::strata::k8s::meta::{Condition, ObjectMeta};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CACHE_PHASE_READY: &str = "Ready";
pub const CACHE_PHASE_REJECT: &str = "Reject";

pub const CONDITION_STORAGE_RESET: &str = "StorageReset";
pub const CONDITION_PODS_CLEARED: &str = "PodsCleared";

/// CacheSpec defines the desired state of a Cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSpec {
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
}

/// Error recorded on a node when a commit or unmount failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeError {
    #[serde(rename = "volumeName")]
    pub volume_name: String,
    #[serde(rename = "cacheGeneration", skip_serializing_if = "Option::is_none")]
    pub cache_generation: Option<i64>,
    pub error: String,
    pub happened: DateTime<Utc>,
}

/// Per-volume entry within a node: one mounted cache container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheVolumeStatus {
    pub name: String,
    #[serde(rename = "cacheGeneration")]
    pub cache_generation: i64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub committable: bool,
    #[serde(rename = "commitStartTime", skip_serializing_if = "Option::is_none")]
    pub commit_start_time: Option<DateTime<Utc>>,
}

/// Per-node slice of the cache status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheNodeStatus {
    pub name: String,
    #[serde(rename = "lastUsed")]
    pub last_used: DateTime<Utc>,
    #[serde(rename = "lastImageID", skip_serializing_if = "Option::is_none")]
    pub last_image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<CacheVolumeStatus>,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<VolumeError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResetStatus {
    #[serde(rename = "cacheGeneration")]
    pub cache_generation: i64,
    #[serde(rename = "resetTime")]
    pub reset_time: DateTime<Utc>,
}

/// CacheStatus is the observed, cluster-wide state of a cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatus {
    /// Current registry reference advertised to readers; stable for the
    /// lifetime of a generation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(rename = "cacheGeneration", default)]
    pub cache_generation: i64,
    #[serde(default)]
    pub used: i64,
    #[serde(rename = "lastImageID", skip_serializing_if = "Option::is_none")]
    pub last_image_id: Option<String>,
    #[serde(rename = "lastUsed", skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(rename = "lastWritten", skip_serializing_if = "Option::is_none")]
    pub last_written: Option<DateTime<Utc>>,
    #[serde(rename = "lastReset", skip_serializing_if = "Option::is_none")]
    pub last_reset: Option<ResetStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<CacheNodeStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Cache is the schema for the distributed cache volume API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cache {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CacheSpec,
    #[serde(default)]
    pub status: CacheStatus,
}

impl Cache {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            api_version: "strata.dev/v1alpha1".to_string(),
            kind: "Cache".to_string(),
            metadata,
            spec: CacheSpec::default(),
            status: CacheStatus::default(),
        }
    }

    pub fn is_rejecting(&self) -> bool {
        self.status.phase == CACHE_PHASE_REJECT
    }

    /// Returns the node entry, creating it when absent, and refreshes its
    /// last-used timestamp.
    pub fn upsert_node(&mut self, node_name: &str) -> &mut CacheNodeStatus {
        let index = self
            .status
            .nodes
            .iter()
            .position(|n| n.name == node_name)
            .unwrap_or_else(|| {
                self.status.nodes.push(CacheNodeStatus {
                    name: node_name.to_string(),
                    last_used: Utc::now(),
                    last_image_id: None,
                    volumes: Vec::new(),
                    last_error: None,
                });
                self.status.nodes.len() - 1
            });
        let node = &mut self.status.nodes[index];
        node.last_used = Utc::now();
        node
    }

    pub fn find_volume(&self, node_name: &str, volume_name: &str) -> Option<&CacheVolumeStatus> {
        self.status
            .nodes
            .iter()
            .find(|n| n.name == node_name)?
            .volumes
            .iter()
            .find(|v| v.name == volume_name)
    }

    pub fn find_volume_mut(
        &mut self,
        node_name: &str,
        volume_name: &str,
    ) -> Option<&mut CacheVolumeStatus> {
        self.status
            .nodes
            .iter_mut()
            .find(|n| n.name == node_name)?
            .volumes
            .iter_mut()
            .find(|v| v.name == volume_name)
    }

    /// Removes the volume entry from the node, returning the generation it
    /// carried.
    pub fn remove_volume(&mut self, node_name: &str, volume_name: &str) -> Option<i64> {
        let node = self.status.nodes.iter_mut().find(|n| n.name == node_name)?;
        let index = node.volumes.iter().position(|v| v.name == volume_name)?;
        Some(node.volumes.remove(index).cache_generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_node_is_idempotent() {
        let mut cache = Cache::new(ObjectMeta::named(Some("default"), "mycache"));
        cache.upsert_node("node-1");
        cache.upsert_node("node-1");
        assert_eq!(cache.status.nodes.len(), 1);
        cache.upsert_node("node-2");
        assert_eq!(cache.status.nodes.len(), 2);
    }

    #[test]
    fn remove_volume_returns_generation() {
        let mut cache = Cache::new(ObjectMeta::named(Some("default"), "mycache"));
        cache.upsert_node("node-1").volumes.push(CacheVolumeStatus {
            name: "v1".to_string(),
            cache_generation: 7,
            created: Utc::now(),
            committable: true,
            commit_start_time: None,
        });
        assert_eq!(cache.remove_volume("node-1", "v1"), Some(7));
        assert_eq!(cache.remove_volume("node-1", "v1"), None);
        assert_eq!(cache.remove_volume("node-2", "v1"), None);
    }

    #[test]
    fn status_serializes_with_wire_names() {
        let mut cache = Cache::new(ObjectMeta::named(Some("default"), "mycache"));
        cache.status.cache_generation = 4;
        cache.status.image = "registry.example.com/cache/mycache:latest".to_string();
        let json = serde_json::to_value(&cache).unwrap();
        assert_eq!(json["status"]["cacheGeneration"], 4);
        assert_eq!(
            json["status"]["image"],
            "registry.example.com/cache/mycache:latest"
        );
    }
}
