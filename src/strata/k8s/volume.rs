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

use super::meta::{ObjectMeta, ObjectReference};
use super::pod::HostPathVolumeSource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const ACCESS_MODE_RWO: &str = "ReadWriteOnce";

pub const VOLUME_MODE_FILESYSTEM: &str = "Filesystem";
pub const VOLUME_MODE_BLOCK: &str = "Block";

pub const VOLUME_BOUND: &str = "Bound";
pub const VOLUME_RELEASED: &str = "Released";
pub const VOLUME_AVAILABLE: &str = "Available";

pub const RECLAIM_DELETE: &str = "Delete";
pub const RECLAIM_RETAIN: &str = "Retain";

pub const BINDING_WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";
pub const BINDING_IMMEDIATE: &str = "Immediate";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub requests: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub limits: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentVolumeClaimSpec {
    #[serde(rename = "accessModes", default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "storageClassName", skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(rename = "volumeMode", skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(rename = "volumeName", skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentVolumeClaimStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentVolumeClaim {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PersistentVolumeClaimSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PersistentVolumeClaimStatus>,
}

impl PersistentVolumeClaim {
    pub fn new(metadata: ObjectMeta, spec: PersistentVolumeClaimSpec) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "PersistentVolumeClaim".to_string(),
            metadata,
            spec,
            status: None,
        }
    }
}

/// PersistentVolume spec; doubles as the provisioner volume template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentVolumeSpec {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub capacity: HashMap<String, String>,
    #[serde(rename = "accessModes", default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(rename = "hostPath", skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolumeSource>,
    #[serde(rename = "storageClassName", skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(rename = "volumeMode", skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    #[serde(
        rename = "persistentVolumeReclaimPolicy",
        skip_serializing_if = "Option::is_none"
    )]
    pub reclaim_policy: Option<String>,
    #[serde(rename = "claimRef", skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ObjectReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentVolumeStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentVolume {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PersistentVolumeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PersistentVolumeStatus>,
}

impl PersistentVolume {
    pub fn new(metadata: ObjectMeta, spec: PersistentVolumeSpec) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "PersistentVolume".to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or(VOLUME_AVAILABLE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageClass {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub provisioner: String,
    #[serde(rename = "volumeBindingMode", skip_serializing_if = "Option::is_none")]
    pub volume_binding_mode: Option<String>,
}

impl StorageClass {
    pub fn new(name: &str, provisioner: &str, binding_mode: Option<&str>) -> Self {
        Self {
            api_version: "storage.k8s.io/v1".to_string(),
            kind: "StorageClass".to_string(),
            metadata: ObjectMeta::named(None, name),
            provisioner: provisioner.to_string(),
            volume_binding_mode: binding_mode.map(|m| m.to_string()),
        }
    }
}
