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

use crate::strata::api::{ANN_NO_PROTECTION, ANN_STORAGE_PROVISIONER, ENABLED};
use crate::strata::controller::registry::ProvisionerRegistry;
use crate::strata::k8s::client::Cluster;
use crate::strata::k8s::meta::NamespacedName;
use crate::strata::k8s::pod::Pod;
use crate::strata::k8s::volume::{PersistentVolumeClaim, ACCESS_MODE_RWO};
use crate::strata::logger::{log_info, log_warn};
use crate::strata::util::error::{new_error, DynError};
use std::sync::Arc;

/// On completion of a workload pod whose provisioner enables
/// delete-on-pod-completion, annotates and deletes its writable claims.
pub struct PodReconciler {
    cluster: Arc<Cluster>,
    provisioners: Arc<ProvisionerRegistry>,
}

impl PodReconciler {
    pub fn new(cluster: Arc<Cluster>, provisioners: Arc<ProvisionerRegistry>) -> Self {
        Self {
            cluster,
            provisioners,
        }
    }

    /// Fires only for pods that are terminal under their restart policy and
    /// reference at least one writable claim.
    pub fn wants(&self, pod: &Pod) -> bool {
        pod.is_finished() && !writable_claims(pod).is_empty()
    }

    pub fn reconcile(&self, key: &NamespacedName) -> Result<(), DynError> {
        let pod = match self.cluster.pods().get(key) {
            Ok(pod) => pod,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(Box::new(err)),
        };
        if !self.wants(&pod) {
            return Ok(());
        }
        log_info("pod", "Reconciling Pod", &[("pod", &key.to_string())]);

        let mut failed = false;
        for claim_key in writable_claims(&pod) {
            let claim = match self.cluster.claims().get(&claim_key) {
                Ok(claim) => claim,
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    log_warn(
                        "pod",
                        "Failed to get PVC",
                        &[("pvc", &claim_key.to_string()), ("error", &err.to_string())],
                    );
                    failed = true;
                    continue;
                }
            };
            if !self.should_delete(&claim) {
                // Claims of provisioners without completion-driven deletion
                // and claims with other access modes stay untouched.
                continue;
            }
            let mut claim = claim;
            if claim.metadata.set_annotation(ANN_NO_PROTECTION, ENABLED) {
                match self.cluster.claims().update(claim.clone()) {
                    Ok(updated) => claim = updated,
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => {
                        log_warn(
                            "pod",
                            "Failed to set PVC annotation",
                            &[("pvc", &claim_key.to_string()), ("error", &err.to_string())],
                        );
                        failed = true;
                        continue;
                    }
                }
            }
            if !claim.metadata.is_deleting() {
                log_info("pod", "Deleting PVC", &[("pvc", &claim_key.to_string())]);
                match self.cluster.claims().delete(&claim_key) {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(err) => {
                        log_warn(
                            "pod",
                            "Failed to delete PVC",
                            &[("pvc", &claim_key.to_string()), ("error", &err.to_string())],
                        );
                        failed = true;
                    }
                }
            }
        }

        if failed {
            return Err(new_error("pvc deletion failed"));
        }
        Ok(())
    }

    fn should_delete(&self, claim: &PersistentVolumeClaim) -> bool {
        if !has_single_access_mode(claim, ACCESS_MODE_RWO) {
            return false;
        }
        let Some(provisioner_name) = claim.metadata.annotation(ANN_STORAGE_PROVISIONER) else {
            return false;
        };
        self.provisioners
            .get(provisioner_name)
            .map(|p| p.spec.deprovision_on_pod_completion)
            .unwrap_or(false)
    }
}

fn has_single_access_mode(claim: &PersistentVolumeClaim, mode: &str) -> bool {
    claim.spec.access_modes.len() == 1 && claim.spec.access_modes[0] == mode
}

fn writable_claims(pod: &Pod) -> Vec<NamespacedName> {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    pod.spec
        .volumes
        .iter()
        .filter_map(|volume| {
            let claim = volume.persistent_volume_claim.as_ref()?;
            if claim.read_only.unwrap_or(false) {
                return None;
            }
            Some(NamespacedName::new(
                namespace.clone(),
                claim.claim_name.clone(),
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strata::api::provisioner::{
        NodePath, StorageProvisioner, StorageProvisionerSpec, WorkerContainer,
    };
    use crate::strata::k8s::client::ClusterObject;
    use crate::strata::k8s::meta::ObjectMeta;
    use crate::strata::k8s::pod::{
        ContainerSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodStatus, VolumeSpec,
        POD_SUCCEEDED, RESTART_POLICY_NEVER,
    };
    use crate::strata::k8s::volume::{PersistentVolumeClaimSpec, VOLUME_MODE_FILESYSTEM};

    fn provisioner(name: &str, deprovision_on_pod_completion: bool) -> StorageProvisioner {
        let mut spec = StorageProvisionerSpec {
            name: name.to_string(),
            deprovision_on_pod_completion,
            ..Default::default()
        };
        spec.pod_template.containers = vec![ContainerSpec {
            name: "main".to_string(),
            image: Some("fake-image".to_string()),
            ..Default::default()
        }];
        spec.containers.provisioner = WorkerContainer {
            command: vec!["true".to_string()],
            env: Vec::new(),
        };
        spec.persistent_volume_template.volume_mode = Some(VOLUME_MODE_FILESYSTEM.to_string());
        spec.nodes = vec![NodePath {
            name: "*".to_string(),
            path: "/fake/test/path".to_string(),
        }];
        StorageProvisioner::new(ObjectMeta::named(Some("strata-system"), name), spec)
    }

    struct Fixture {
        cluster: Arc<Cluster>,
        registry: Arc<ProvisionerRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ProvisionerRegistry::new());
            registry
                .put(&provisioner("delete-on-pod-termination.fake.provisioner", true))
                .unwrap();
            registry
                .put(&provisioner("ignore-terminating-pod.fake.provisioner", false))
                .unwrap();
            Self {
                cluster: Cluster::in_memory(),
                registry,
            }
        }

        fn reconciler(&self) -> PodReconciler {
            PodReconciler::new(self.cluster.clone(), self.registry.clone())
        }

        fn create_claim(&self, name: &str, provisioner_name: &str) -> PersistentVolumeClaim {
            let mut metadata = ObjectMeta::named(Some("default"), name);
            metadata.set_annotation(ANN_STORAGE_PROVISIONER, provisioner_name);
            self.cluster
                .claims()
                .create(PersistentVolumeClaim::new(
                    metadata,
                    PersistentVolumeClaimSpec {
                        access_modes: vec![ACCESS_MODE_RWO.to_string()],
                        ..Default::default()
                    },
                ))
                .unwrap()
        }

        fn create_pod(&self, name: &str, restart_policy: &str, phase: &str, claims: &[&str]) -> Pod {
            let volumes = claims
                .iter()
                .map(|claim| VolumeSpec {
                    name: format!("{claim}-volume"),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                })
                .collect();
            let mut pod = Pod::new(
                ObjectMeta::named(Some("default"), name),
                PodSpec {
                    restart_policy: Some(restart_policy.to_string()),
                    volumes,
                    ..Default::default()
                },
            );
            pod.status = Some(PodStatus {
                phase: Some(phase.to_string()),
                start_time: None,
            });
            self.cluster.pods().create(pod).unwrap()
        }
    }

    #[test]
    fn deletes_matching_claim_on_pod_completion() {
        let fixture = Fixture::new();
        let matching = fixture.create_claim("matching-pvc", "delete-on-pod-termination.fake.provisioner");
        let other = fixture.create_claim("other-pvc", "ignore-terminating-pod.fake.provisioner");
        let pod = fixture.create_pod(
            "completed",
            RESTART_POLICY_NEVER,
            POD_SUCCEEDED,
            &["matching-pvc", "other-pvc"],
        );

        fixture.reconciler().reconcile(&pod.key()).unwrap();

        assert!(fixture
            .cluster
            .claims()
            .get(&matching.key())
            .unwrap_err()
            .is_not_found());
        assert!(fixture.cluster.claims().get(&other.key()).is_ok());
    }

    #[test]
    fn restartable_pod_is_ignored() {
        let fixture = Fixture::new();
        let claim = fixture.create_claim("restarting-pvc", "delete-on-pod-termination.fake.provisioner");
        let pod = fixture.create_pod("restarting", "Always", POD_SUCCEEDED, &["restarting-pvc"]);

        fixture.reconciler().reconcile(&pod.key()).unwrap();
        let claim = fixture.cluster.claims().get(&claim.key()).unwrap();
        assert!(claim.metadata.annotation(ANN_NO_PROTECTION).is_none());
    }

    #[test]
    fn running_pod_is_ignored() {
        let fixture = Fixture::new();
        let claim = fixture.create_claim("active-pvc", "delete-on-pod-termination.fake.provisioner");
        let pod = fixture.create_pod("running", RESTART_POLICY_NEVER, "Running", &["active-pvc"]);

        fixture.reconciler().reconcile(&pod.key()).unwrap();
        assert!(fixture.cluster.claims().get(&claim.key()).is_ok());
    }

    #[test]
    fn missing_claim_is_swallowed() {
        let fixture = Fixture::new();
        let pod = fixture.create_pod(
            "completed-orphan",
            RESTART_POLICY_NEVER,
            POD_SUCCEEDED,
            &["deleted-pvc"],
        );
        fixture.reconciler().reconcile(&pod.key()).unwrap();
    }

    #[test]
    fn non_rwo_claim_is_ignored() {
        let fixture = Fixture::new();
        let mut metadata = ObjectMeta::named(Some("default"), "shared-pvc");
        metadata.set_annotation(
            ANN_STORAGE_PROVISIONER,
            "delete-on-pod-termination.fake.provisioner",
        );
        let claim = fixture
            .cluster
            .claims()
            .create(PersistentVolumeClaim::new(
                metadata,
                PersistentVolumeClaimSpec {
                    access_modes: vec!["ReadWriteMany".to_string()],
                    ..Default::default()
                },
            ))
            .unwrap();
        let pod = fixture.create_pod("completed-shared", RESTART_POLICY_NEVER, POD_SUCCEEDED, &["shared-pvc"]);

        fixture.reconciler().reconcile(&pod.key()).unwrap();
        assert!(fixture.cluster.claims().get(&claim.key()).is_ok());
    }
}
