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
use crate::strata::k8s::pod::PodSpec;
use crate::strata::k8s::volume::PersistentVolumeSpec;
use crate::strata::util::error::{with_context, DynError};
use serde::{Deserialize, Serialize};

pub const CONDITION_CONFIGURED: &str = "Configured";

/// Maps an annotation value to an env var provided to the worker pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvMapping {
    pub name: String,
    pub annotation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl EnvMapping {
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(true)
    }
}

/// Maps node names (glob) to the host path volumes are created under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodePath {
    pub name: String,
    pub path: String,
}

/// Container parameters merged into the pod template's named container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerContainer {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<crate::strata::k8s::pod::EnvVar>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerContainers {
    pub provisioner: WorkerContainer,
    pub deprovisioner: WorkerContainer,
}

/// StorageProvisionerSpec defines the desired state of StorageProvisioner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageProvisionerSpec {
    pub name: String,
    #[serde(rename = "persistentVolumeTemplate")]
    pub persistent_volume_template: PersistentVolumeSpec,
    #[serde(rename = "podTemplate")]
    pub pod_template: PodSpec,
    pub containers: WorkerContainers,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<NodePath>,
    #[serde(rename = "deprovisionOnPodCompletion", default)]
    pub deprovision_on_pod_completion: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageProvisionerStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// StorageProvisioner is the schema for user-supplied provisioner jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageProvisioner {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: StorageProvisionerSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StorageProvisionerStatus>,
}

impl StorageProvisioner {
    pub fn new(metadata: ObjectMeta, spec: StorageProvisionerSpec) -> Self {
        Self {
            api_version: "strata.dev/v1alpha1".to_string(),
            kind: "StorageProvisioner".to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    /// The provisioner name claims select via annotation; distinct from the
    /// resource name.
    pub fn provisioner_name(&self) -> &str {
        &self.spec.name
    }

    /// Serialises the definition for the provisioner-spec annotation,
    /// keeping identity fields and dropping status.
    pub fn to_annotation_json(&self) -> Result<String, DynError> {
        let mut copy = StorageProvisioner::new(ObjectMeta::default(), self.spec.clone());
        copy.metadata.name = self.metadata.name.clone();
        copy.metadata.namespace = self.metadata.namespace.clone();
        copy.metadata.uid = self.metadata.uid.clone();
        copy.metadata.generation = self.metadata.generation;
        serde_json::to_string(&copy).map_err(|e| with_context(e, "marshal provisioner spec"))
    }

    pub fn from_annotation_json(data: &str) -> Result<Self, DynError> {
        serde_json::from_str(data).map_err(|e| with_context(e, "unmarshal provisioner spec"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strata::k8s::pod::{ContainerSpec, EnvVar};
    use crate::strata::k8s::volume::VOLUME_MODE_FILESYSTEM;

    pub fn sample_provisioner(name: &str) -> StorageProvisioner {
        let mut metadata = ObjectMeta::named(Some("strata-system"), name);
        metadata.uid = Some("uid-1".to_string());
        metadata.generation = 3;
        let mut spec = StorageProvisionerSpec {
            name: format!("{name}.strata.dev"),
            ..Default::default()
        };
        spec.pod_template.containers = vec![ContainerSpec {
            name: "main".to_string(),
            image: Some("docker.io/library/busybox:latest".to_string()),
            ..Default::default()
        }];
        spec.containers.provisioner = WorkerContainer {
            command: vec!["sh".to_string(), "-c".to_string(), "mkdir -p $STORAGE_NODE_PATH/$STORAGE_PV_NAME".to_string()],
            env: vec![EnvVar::new("MODE", "provision")],
        };
        spec.containers.deprovisioner = WorkerContainer {
            command: vec!["sh".to_string(), "-c".to_string(), "rm -rf $STORAGE_NODE_PATH/$STORAGE_PV_NAME".to_string()],
            env: Vec::new(),
        };
        spec.persistent_volume_template.volume_mode = Some(VOLUME_MODE_FILESYSTEM.to_string());
        spec.nodes = vec![NodePath {
            name: "*".to_string(),
            path: "/var/lib/strata/volumes".to_string(),
        }];
        StorageProvisioner::new(metadata, spec)
    }

    #[test]
    fn annotation_json_round_trips_modulo_status() {
        let mut provisioner = sample_provisioner("local");
        provisioner.status = Some(StorageProvisionerStatus::default());
        let json = provisioner.to_annotation_json().unwrap();
        let parsed = StorageProvisioner::from_annotation_json(&json).unwrap();
        assert_eq!(parsed.spec.name, provisioner.spec.name);
        assert_eq!(parsed.metadata.uid, provisioner.metadata.uid);
        assert_eq!(parsed.metadata.generation, provisioner.metadata.generation);
        assert!(parsed.status.is_none());
        assert_eq!(
            parsed.spec.containers.provisioner.command,
            provisioner.spec.containers.provisioner.command
        );
    }

    #[test]
    fn required_defaults_to_true() {
        let mapping = EnvMapping {
            name: "CACHE_NAME".to_string(),
            annotation: "strata.dev/cache-name".to_string(),
            required: None,
        };
        assert!(mapping.is_required());
    }
}
