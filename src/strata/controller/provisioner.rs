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

use crate::strata::api::provisioner::{StorageProvisioner, CONDITION_CONFIGURED};
use crate::strata::controller::registry::ProvisionerRegistry;
use crate::strata::k8s::client::{Cluster, ClusterObject};
use crate::strata::k8s::meta::{
    set_condition, Condition, NamespacedName, CONDITION_FALSE, CONDITION_TRUE,
};
use crate::strata::logger::{log_error, log_info};
use crate::strata::util::error::{with_context, DynError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Keeps the in-process registry in sync with StorageProvisioner resources
/// and maintains their `Configured` condition.
pub struct ProvisionerReconciler {
    cluster: Arc<Cluster>,
    provisioners: Arc<ProvisionerRegistry>,
    namespace: String,
    registered_names: Mutex<HashMap<NamespacedName, String>>,
}

impl ProvisionerReconciler {
    pub fn new(
        cluster: Arc<Cluster>,
        provisioners: Arc<ProvisionerRegistry>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            provisioners,
            namespace: namespace.into(),
            registered_names: Mutex::new(HashMap::new()),
        }
    }

    pub fn reconcile(&self, key: &NamespacedName) -> Result<(), DynError> {
        if !self.namespace.is_empty() && key.namespace != self.namespace {
            return Ok(());
        }
        let mut config = match self.cluster.provisioners().get(key) {
            Ok(config) => config,
            Err(err) if err.is_not_found() => {
                self.recover_after_delete(key);
                return Ok(());
            }
            Err(err) => return Err(with_context(err, "get storageprovisioner")),
        };

        log_info(
            "provisioner",
            "Reconciling StorageProvisioner",
            &[("storageprovisioner", &key.to_string())],
        );

        // The claimed name is recorded before registration so that deleting
        // the resource later can release a poisoned entry as well.
        self.registered_names
            .lock()
            .expect("provisioner reconciler poisoned")
            .insert(key.clone(), config.spec.name.clone());

        if let Err(err) = self.provisioners.put(&config) {
            let mut status = config.status.clone().unwrap_or_default();
            let changed = set_condition(
                &mut status.conditions,
                Condition {
                    condition_type: CONDITION_CONFIGURED.to_string(),
                    status: CONDITION_FALSE.to_string(),
                    reason: "InvalidProvisioner".to_string(),
                    message: err.to_string(),
                    last_transition_time: None,
                    observed_generation: config.metadata.generation,
                },
            );
            if changed {
                log_error(
                    "provisioner",
                    "Invalid StorageProvisioner",
                    &[
                        ("storageprovisioner", &key.to_string()),
                        ("error", &err.to_string()),
                    ],
                );
                config.status = Some(status);
                self.cluster
                    .provisioners()
                    .update_status(config)
                    .map_err(|e| with_context(e, "update storageprovisioner status"))?;
            }
            return Ok(()); // only an external change can fix the definition
        }

        let mut status = config.status.clone().unwrap_or_default();
        let changed = set_condition(
            &mut status.conditions,
            Condition {
                condition_type: CONDITION_CONFIGURED.to_string(),
                status: CONDITION_TRUE.to_string(),
                reason: "Success".to_string(),
                message: "provisioner configured".to_string(),
                last_transition_time: None,
                observed_generation: config.metadata.generation,
            },
        );
        if changed {
            log_info(
                "provisioner",
                "Configured StorageProvisioner",
                &[
                    ("storageprovisioner", &key.to_string()),
                    ("provisioner", &config.spec.name),
                ],
            );
            config.status = Some(status);
            self.cluster
                .provisioners()
                .update_status(config)
                .map_err(|e| with_context(e, "update storageprovisioner status"))?;
        }
        Ok(())
    }

    /// Drops the deleted resource's registration. If its name was poisoned
    /// by a duplicate, the surviving definition is re-registered so the name
    /// resolves again.
    fn recover_after_delete(&self, origin: &NamespacedName) {
        let name = self
            .registered_names
            .lock()
            .expect("provisioner reconciler poisoned")
            .remove(origin);
        let Some(name) = name else {
            return;
        };
        self.provisioners.forget(&name, origin);
        for survivor in self.cluster.provisioners().list() {
            if survivor.spec.name != name || &survivor.key() == origin {
                continue;
            }
            match self.provisioners.put(&survivor) {
                Ok(()) => log_info(
                    "provisioner",
                    "Re-registered surviving provisioner after duplicate removal",
                    &[("provisioner", name.as_str())],
                ),
                Err(err) => log_error(
                    "provisioner",
                    "Invalid provisioner",
                    &[
                        ("storageprovisioner", &survivor.key().to_string()),
                        ("error", &err.to_string()),
                    ],
                ),
            }
        }
    }

}

/// Loads all StorageProvisioner resources from the cluster into a fresh
/// registry, logging invalid definitions instead of failing startup.
pub fn load_provisioners(
    cluster: &Cluster,
    namespace: &str,
) -> Result<Arc<ProvisionerRegistry>, DynError> {
    let registry = Arc::new(ProvisionerRegistry::new());
    for provisioner in cluster.provisioners().list() {
        if !namespace.is_empty()
            && provisioner.metadata.namespace.as_deref() != Some(namespace)
        {
            continue;
        }
        if let Err(err) = registry.put(&provisioner) {
            log_error(
                "provisioner",
                "Invalid provisioner",
                &[
                    ("storageprovisioner", provisioner.metadata.name.as_deref().unwrap_or("")),
                    ("error", &err.to_string()),
                ],
            );
        }
    }
    Ok(registry)
}
