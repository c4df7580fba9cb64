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

use crate::strata::api::provisioner::StorageProvisioner;
use crate::strata::controller::worker::{
    new_worker_pod, substitute_provisioner_placeholders, validate_node_path, PodSource,
    ProvisionerParams,
};
use crate::strata::controller::PROVISIONER;
use crate::strata::k8s::meta::{glob_match, NamespacedName};
use crate::strata::util::error::{new_error, with_context, DynError};
use std::collections::HashMap;
use std::sync::Mutex;

/// Process-wide, mutex-guarded map of provisioner definitions.
///
/// A `None` entry is a tombstone: two resources claimed the same provisioner
/// name, so lookups fail until the duplicate is removed and the survivor is
/// re-registered.
pub struct ProvisionerRegistry {
    provisioners: Mutex<HashMap<String, Option<StorageProvisioner>>>,
}

impl Default for ProvisionerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        Self {
            provisioners: Mutex::new(HashMap::new()),
        }
    }

    /// Registered, resolvable provisioner names in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let provisioners = self.provisioners.lock().expect("registry poisoned");
        let mut keys: Vec<String> = provisioners
            .iter()
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Validates and registers a definition. A second resource claiming an
    /// already-taken provisioner name poisons the entry.
    pub fn put(&self, provisioner: &StorageProvisioner) -> Result<(), DynError> {
        validate_provisioner(provisioner).map_err(|e| {
            with_context(
                e,
                format!("validate StorageProvisioner {}", provisioner.spec.name),
            )
        })?;

        let mut provisioners = self.provisioners.lock().expect("registry poisoned");
        let key = provisioner.provisioner_name().to_string();
        if let Some(existing) = provisioners.get(&key) {
            let same_origin = existing
                .as_ref()
                .map(|e| {
                    e.metadata.name == provisioner.metadata.name
                        && e.metadata.namespace == provisioner.metadata.namespace
                })
                .unwrap_or(false);
            if !same_origin {
                provisioners.insert(key.clone(), None);
                return Err(new_error(format!(
                    "duplicate provisioner {key} - key is disabled until the duplicate is removed"
                )));
            }
        }
        provisioners.insert(key, Some(provisioner.clone()));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<StorageProvisioner> {
        let provisioners = self.provisioners.lock().expect("registry poisoned");
        provisioners.get(name).and_then(|p| p.clone())
    }

    /// Drops the registration originating from the given resource. Clears a
    /// tombstone for the name unconditionally so a surviving definition can
    /// be re-registered after the duplicate is gone.
    pub fn forget(&self, provisioner_name: &str, origin: &NamespacedName) {
        let mut provisioners = self.provisioners.lock().expect("registry poisoned");
        let should_remove = match provisioners.get(provisioner_name) {
            Some(None) => true, // tombstone cleared once the duplicate is gone
            Some(Some(existing)) => {
                existing.metadata.name.as_deref() == Some(origin.name.as_str())
                    && existing.metadata.namespace.as_deref().unwrap_or_default()
                        == origin.namespace.as_str()
            }
            None => false,
        };
        if should_remove {
            provisioners.remove(provisioner_name);
        }
    }
}

fn validate_provisioner(provisioner: &StorageProvisioner) -> Result<(), DynError> {
    // Trial expansion with synthetic values proves the template is sound
    // before any claim selects it.
    let substituted = substitute_provisioner_placeholders(
        provisioner,
        &ProvisionerParams {
            node_name: "test-node".to_string(),
            node_path: "/test-node-path".to_string(),
            persistent_volume_name: "test-pv".to_string(),
            claim: NamespacedName::new("test-pvc-ns", "test-pvc"),
        },
    )?;
    new_worker_pod(PodSource {
        pod_name: NamespacedName::new("test-namespace", "test-pod"),
        container_name: PROVISIONER,
        substituted_provisioner: &substituted,
        container: &substituted.spec.containers.provisioner,
        env: Vec::new(),
    })?;

    if provisioner
        .spec
        .persistent_volume_template
        .volume_mode
        .is_none()
    {
        return Err(new_error("spec.persistentVolumeTemplate.volumeMode is empty"));
    }
    for (index, env) in provisioner.spec.env.iter().enumerate() {
        if env.name.is_empty() {
            return Err(new_error(format!("spec.env[{index}].name is empty")));
        }
        if env.annotation.is_empty() {
            return Err(new_error(format!("spec.env[{index}].annotation is empty")));
        }
    }
    if provisioner.spec.nodes.is_empty() {
        return Err(new_error("spec.nodes is empty"));
    }
    for (index, node) in provisioner.spec.nodes.iter().enumerate() {
        if node.name.is_empty() {
            return Err(new_error(format!("spec.nodes[{index}].name is empty")));
        }
        if glob_match(&node.name, "test-node").is_err() {
            return Err(new_error(format!(
                "spec.nodes[{index}].name is an invalid matcher"
            )));
        }
        validate_node_path(&node.path)
            .map_err(|e| with_context(e, format!("spec.nodes[{index}].path")))?;
    }
    Ok(())
}
