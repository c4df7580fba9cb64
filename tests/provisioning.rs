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

//! End-to-end provisioning lifecycle: claim -> provisioner job -> volume ->
//! released -> deprovisioner job -> deletion.

use std::collections::HashMap;
use std::sync::Arc;

use strata::strata::api::provisioner::{
    EnvMapping, NodePath, StorageProvisioner, StorageProvisionerSpec, WorkerContainer,
};
use strata::strata::api::{
    ANN_PROVISIONER_SPEC, ANN_PVC_NAME, ANN_PVC_NAMESPACE, ANN_PV_NAME, ANN_SELECTED_NODE,
    ANN_STORAGE_PROVISIONER, FINALIZER,
};
use strata::strata::controller::claim::ClaimReconciler;
use strata::strata::controller::job::JobRunner;
use strata::strata::controller::provisioner::ProvisionerReconciler;
use strata::strata::controller::registry::ProvisionerRegistry;
use strata::strata::controller::volume::VolumeReconciler;
use strata::strata::controller::{DEPROVISIONER, PROVISIONER};
use strata::strata::k8s::client::{Cluster, ClusterObject};
use strata::strata::k8s::event::EventRecorder;
use strata::strata::k8s::meta::{resource_name, NamespacedName, ObjectMeta};
use strata::strata::k8s::pod::{ContainerSpec, EnvVar, PodStatus, POD_SUCCEEDED};
use strata::strata::k8s::volume::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements, StorageClass,
    BINDING_WAIT_FOR_FIRST_CONSUMER, RECLAIM_DELETE, VOLUME_MODE_FILESYSTEM,
};

const MANAGER_NAMESPACE: &str = "strata-system";
const PROVISIONER_NAME: &str = "local.strata.dev";

struct Harness {
    cluster: Arc<Cluster>,
    registry: Arc<ProvisionerRegistry>,
    recorder: EventRecorder,
}

impl Harness {
    fn new() -> Self {
        let cluster = Cluster::in_memory();
        let registry = Arc::new(ProvisionerRegistry::new());
        Self {
            cluster,
            registry,
            recorder: EventRecorder::new("test"),
        }
    }

    fn claim_reconciler(&self) -> ClaimReconciler {
        ClaimReconciler::new(
            self.cluster.clone(),
            self.registry.clone(),
            self.recorder.clone(),
            JobRunner::new(
                self.cluster.clone(),
                self.recorder.clone(),
                ANN_PVC_NAME,
                Some(ANN_PVC_NAMESPACE),
            ),
            MANAGER_NAMESPACE,
        )
    }

    fn volume_reconciler(&self) -> VolumeReconciler {
        VolumeReconciler::new(
            self.cluster.clone(),
            self.registry.clone(),
            self.recorder.clone(),
            JobRunner::new(self.cluster.clone(), self.recorder.clone(), ANN_PV_NAME, None),
            MANAGER_NAMESPACE,
        )
    }

    fn provisioner_resource(&self) -> StorageProvisioner {
        let mut spec = StorageProvisionerSpec {
            name: PROVISIONER_NAME.to_string(),
            ..Default::default()
        };
        spec.pod_template.containers = vec![ContainerSpec {
            name: "main".to_string(),
            image: Some("docker.io/library/busybox:latest".to_string()),
            ..Default::default()
        }];
        spec.containers.provisioner = WorkerContainer {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "mkdir -p ${STORAGE_NODE_PATH}/${STORAGE_PV_NAME}".to_string(),
            ],
            env: vec![
                EnvVar::new("STORAGE_NODE_NAME", "${STORAGE_NODE_NAME}"),
                EnvVar::new("STORAGE_PV_NAME", "${STORAGE_PV_NAME}"),
            ],
        };
        spec.containers.deprovisioner = WorkerContainer {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "rm -rf ${STORAGE_NODE_PATH}/${STORAGE_PV_NAME}".to_string(),
            ],
            env: Vec::new(),
        };
        spec.env = vec![EnvMapping {
            name: "CACHE_NAME".to_string(),
            annotation: "strata.dev/cache-name".to_string(),
            required: Some(false),
        }];
        spec.persistent_volume_template.volume_mode = Some(VOLUME_MODE_FILESYSTEM.to_string());
        spec.persistent_volume_template.reclaim_policy = Some(RECLAIM_DELETE.to_string());
        spec.nodes = vec![NodePath {
            name: "*".to_string(),
            path: "/var/lib/strata/volumes".to_string(),
        }];
        StorageProvisioner::new(ObjectMeta::named(Some(MANAGER_NAMESPACE), "local"), spec)
    }

    fn setup_provisioner(&self) {
        let created = self
            .cluster
            .provisioners()
            .create(self.provisioner_resource())
            .unwrap();
        let reconciler = ProvisionerReconciler::new(
            self.cluster.clone(),
            self.registry.clone(),
            MANAGER_NAMESPACE,
        );
        reconciler.reconcile(&created.key()).unwrap();
        assert!(self.registry.get(PROVISIONER_NAME).is_some());
    }

    fn create_claim(&self, name: &str, node: &str) -> PersistentVolumeClaim {
        let mut metadata = ObjectMeta::named(Some("default"), name);
        metadata.set_annotation(ANN_STORAGE_PROVISIONER, PROVISIONER_NAME);
        metadata.set_annotation(ANN_SELECTED_NODE, node);
        metadata.set_annotation("strata.dev/cache-name", "mycache");
        let mut requests = HashMap::new();
        requests.insert("storage".to_string(), "5Gi".to_string());
        self.cluster
            .claims()
            .create(PersistentVolumeClaim::new(
                metadata,
                PersistentVolumeClaimSpec {
                    access_modes: vec!["ReadWriteOnce".to_string()],
                    resources: Some(ResourceRequirements {
                        requests,
                        limits: HashMap::new(),
                    }),
                    storage_class_name: Some("fast".to_string()),
                    volume_mode: Some(VOLUME_MODE_FILESYSTEM.to_string()),
                    volume_name: None,
                },
            ))
            .unwrap()
    }

    fn create_storage_class(&self) {
        self.cluster
            .storage_classes()
            .create(StorageClass::new(
                "fast",
                PROVISIONER_NAME,
                Some(BINDING_WAIT_FOR_FIRST_CONSUMER),
            ))
            .unwrap();
    }

    fn complete_pod(&self, pod_name: &NamespacedName) {
        let mut pod = self.cluster.pods().get(pod_name).unwrap();
        pod.status = Some(PodStatus {
            phase: Some(POD_SUCCEEDED.to_string()),
            start_time: None,
        });
        self.cluster.pods().update_status(pod).unwrap();
    }
}

#[test]
fn provision_bind_deprovision_lifecycle() {
    let harness = Harness::new();
    harness.setup_provisioner();
    harness.create_storage_class();
    let claim = harness.create_claim("c1", "n2");
    let claim_key = claim.key();
    let uid = claim.metadata.uid.clone().unwrap();
    let pv_name = format!("pvc-{uid}");
    let claim_reconciler = harness.claim_reconciler();

    // Finalizer first, then the provisioner pod on the selected node.
    claim_reconciler.reconcile(&claim_key).unwrap();
    claim_reconciler.reconcile(&claim_key).unwrap();
    let pod_name = NamespacedName::new(MANAGER_NAMESPACE, resource_name(&pv_name, PROVISIONER));
    let pod = harness.cluster.pods().get(&pod_name).unwrap();
    assert_eq!(pod.spec.node_name.as_deref(), Some("n2"));
    let container = &pod.spec.containers[0];
    let env: HashMap<&str, &str> = container
        .env
        .iter()
        .map(|e| (e.name.as_str(), e.value.as_deref().unwrap_or_default()))
        .collect();
    assert_eq!(env.get("STORAGE_NODE_NAME"), Some(&"n2"));
    assert_eq!(env.get("STORAGE_PV_NAME"), Some(&pv_name.as_str()));
    assert_eq!(env.get("CACHE_NAME"), Some(&"mycache"));

    // Pod success materialises the volume with claimRef and finalizer.
    harness.complete_pod(&pod_name);
    claim_reconciler.reconcile(&claim_key).unwrap();
    let pv_key = NamespacedName::cluster_scoped(pv_name.clone());
    let pv = harness.cluster.volumes().get(&pv_key).unwrap();
    assert!(pv.metadata.has_finalizer(FINALIZER));
    assert_eq!(
        pv.spec.claim_ref.as_ref().and_then(|r| r.uid.as_deref()),
        Some(uid.as_str())
    );
    assert_eq!(pv.spec.capacity.get("storage").map(String::as_str), Some("5Gi"));
    assert!(pv.metadata.annotation(ANN_PROVISIONER_SPEC).is_some());
    assert!(harness.recorder.has_event("c1", "Provisioned"));

    // Terminal state: reconciling again creates no new pods.
    claim_reconciler.reconcile(&claim_key).unwrap();
    claim_reconciler.reconcile(&claim_key).unwrap();
    assert!(harness.cluster.pods().list().is_empty());

    // Claim deletion: the claim-side finalizer releases after requesting
    // volume deletion.
    harness.cluster.claims().delete(&claim_key).unwrap();
    claim_reconciler.reconcile(&claim_key).unwrap();
    assert!(harness
        .cluster
        .claims()
        .get(&claim_key)
        .unwrap_err()
        .is_not_found());

    // Volume side: clear claimRef, run the deprovisioner pod, release.
    let volume_reconciler = harness.volume_reconciler();
    volume_reconciler.reconcile(&pv_key).unwrap();
    volume_reconciler.reconcile(&pv_key).unwrap();
    let deprovisioner_pod =
        NamespacedName::new(MANAGER_NAMESPACE, resource_name(&pv_name, DEPROVISIONER));
    let pod = harness.cluster.pods().get(&deprovisioner_pod).unwrap();
    assert_eq!(pod.spec.containers[0].name, "deprovisioner");
    assert!(pod
        .spec
        .containers[0]
        .command
        .iter()
        .any(|arg| arg.contains(&pv_name)));

    harness.complete_pod(&deprovisioner_pod);
    volume_reconciler.reconcile(&pv_key).unwrap();
    assert!(harness
        .cluster
        .volumes()
        .get(&pv_key)
        .unwrap_err()
        .is_not_found());
    assert!(harness.recorder.has_event(&pv_name, "Deprovisioned"));
}

#[test]
fn provisioner_serialisation_survives_registration_loss() {
    let harness = Harness::new();
    harness.setup_provisioner();
    harness.create_storage_class();
    let claim = harness.create_claim("c2", "n1");
    let claim_key = claim.key();
    let uid = claim.metadata.uid.clone().unwrap();
    let pv_name = format!("pvc-{uid}");
    let claim_reconciler = harness.claim_reconciler();

    claim_reconciler.reconcile(&claim_key).unwrap();
    claim_reconciler.reconcile(&claim_key).unwrap();
    let pod_name = NamespacedName::new(MANAGER_NAMESPACE, resource_name(&pv_name, PROVISIONER));
    harness.complete_pod(&pod_name);
    claim_reconciler.reconcile(&claim_key).unwrap();

    // Drop the registration: deprovisioning must still work from the
    // serialised definition stored on the volume.
    harness.registry.forget(
        PROVISIONER_NAME,
        &NamespacedName::new(MANAGER_NAMESPACE, "local"),
    );
    assert!(harness.registry.get(PROVISIONER_NAME).is_none());

    let pv_key = NamespacedName::cluster_scoped(pv_name.clone());
    harness.cluster.claims().delete(&claim_key).unwrap();
    claim_reconciler.reconcile(&claim_key).unwrap();

    let volume_reconciler = harness.volume_reconciler();
    volume_reconciler.reconcile(&pv_key).unwrap();
    volume_reconciler.reconcile(&pv_key).unwrap();
    let deprovisioner_pod =
        NamespacedName::new(MANAGER_NAMESPACE, resource_name(&pv_name, DEPROVISIONER));
    harness.complete_pod(&deprovisioner_pod);
    volume_reconciler.reconcile(&pv_key).unwrap();
    assert!(harness
        .cluster
        .volumes()
        .get(&pv_key)
        .unwrap_err()
        .is_not_found());
}
