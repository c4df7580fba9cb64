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
use crate::strata::api::{
    ANN_NO_PROTECTION, ANN_PROVISIONED_BY, ANN_PROVISIONER_SPEC, ANN_SELECTED_NODE,
    ANN_STORAGE_PROVISIONER, ENABLED, FINALIZER, FINALIZER_PVC_PROTECTION, PROVISIONED_BY_VALUE,
};
use crate::strata::controller::job::{delete_pod, JobRequest, JobRunner};
use crate::strata::controller::registry::ProvisionerRegistry;
use crate::strata::controller::worker::{
    annotations_to_env, copy_annotations, new_worker_pod, storage_root_path_for_node,
    substitute_provisioner_placeholders, PodSource, ProvisionerParams,
};
use crate::strata::controller::PROVISIONER;
use crate::strata::k8s::client::Cluster;
use crate::strata::k8s::event::{EventRecorder, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::strata::k8s::meta::{resource_name, NamespacedName, ObjectMeta, ObjectReference};
use crate::strata::k8s::volume::{
    PersistentVolume, PersistentVolumeClaim, BINDING_WAIT_FOR_FIRST_CONSUMER, RECLAIM_DELETE,
};
use crate::strata::logger::{log_debug, log_info, log_warn};
use crate::strata::util::error::{with_context, DynError};
use std::sync::Arc;

/// Drives a claim through provision/bind/deprovision and owns the
/// claim-side finalizer.
pub struct ClaimReconciler {
    cluster: Arc<Cluster>,
    provisioners: Arc<ProvisionerRegistry>,
    recorder: EventRecorder,
    job_runner: JobRunner,
    manager_namespace: String,
}

pub fn pv_name_for_claim(claim: &PersistentVolumeClaim) -> String {
    format!("pvc-{}", claim.metadata.uid.as_deref().unwrap_or_default())
}

pub fn resolve_provisioner(
    meta: &ObjectMeta,
    provisioners: &ProvisionerRegistry,
) -> Option<StorageProvisioner> {
    provisioners.get(meta.annotation(ANN_STORAGE_PROVISIONER)?)
}

impl ClaimReconciler {
    pub fn new(
        cluster: Arc<Cluster>,
        provisioners: Arc<ProvisionerRegistry>,
        recorder: EventRecorder,
        job_runner: JobRunner,
        manager_namespace: impl Into<String>,
    ) -> Self {
        Self {
            cluster,
            provisioners,
            recorder,
            job_runner,
            manager_namespace: manager_namespace.into(),
        }
    }

    pub fn reconcile(&self, key: &NamespacedName) -> Result<(), DynError> {
        let claim = match self.cluster.claims().get(key) {
            Ok(claim) => claim,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(with_context(err, "get persistentvolumeclaim")),
        };

        if claim.metadata.is_deleting() {
            return self.reconcile_deleting(key, claim);
        }

        let Some(provisioner) = resolve_provisioner(&claim.metadata, &self.provisioners) else {
            return Ok(());
        };

        log_debug(
            "claim",
            "Reconciling PersistentVolumeClaim",
            &[
                ("persistentvolumeclaim", &key.to_string()),
                ("provisioner", provisioner.provisioner_name()),
            ],
        );

        if !self.should_provision(&claim, &provisioner)? {
            return Ok(());
        }

        // The finalizer lands in a separate update so that pending/failed
        // provisioner pods are cleaned up even if the claim is deleted
        // before provisioning succeeded.
        let mut claim = claim;
        if claim.metadata.add_finalizer(FINALIZER) {
            log_debug(
                "claim",
                "Adding finalizer to PersistentVolumeClaim",
                &[("persistentvolumeclaim", &key.to_string())],
            );
            self.cluster
                .claims()
                .update(claim)
                .map_err(|e| with_context(e, "add finalizer to persistentvolumeclaim"))?;
            return Ok(());
        }

        self.provision(&claim, &provisioner)?;
        Ok(())
    }

    fn reconcile_deleting(
        &self,
        key: &NamespacedName,
        mut claim: PersistentVolumeClaim,
    ) -> Result<(), DynError> {
        if claim.metadata.has_finalizer(FINALIZER_PVC_PROTECTION) {
            if claim.metadata.annotation(ANN_NO_PROTECTION) == Some(ENABLED) {
                claim.metadata.remove_finalizer(FINALIZER_PVC_PROTECTION);
                self.cluster
                    .claims()
                    .update(claim)
                    .map_err(|e| with_context(e, "remove claim protection finalizer"))?;
            }
            return Ok(());
        }
        if !claim.metadata.has_finalizer(FINALIZER) {
            return Ok(());
        }
        if claim.metadata.finalizers.len() != 1 {
            // Another controller still holds the claim; the deprovisioner
            // must not run while the claim is in use.
            log_debug(
                "claim",
                "Skipping PersistentVolumeClaim deletion since external finalizers are still present",
                &[("persistentvolumeclaim", &key.to_string())],
            );
            return Ok(());
        }

        // Clean up a pending/failed provisioner pod before touching the
        // volume it may have partially created.
        let pod_name = NamespacedName::new(
            self.manager_namespace.clone(),
            resource_name(&pv_name_for_claim(&claim), PROVISIONER),
        );
        if !delete_pod(&self.cluster, &pod_name)? {
            return Ok(());
        }
        if !self.deprovision(&claim)? {
            return Ok(());
        }

        claim.metadata.remove_finalizer(FINALIZER);
        self.cluster
            .claims()
            .update(claim)
            .map_err(|e| with_context(e, "remove finalizer from persistentvolumeclaim"))?;
        Ok(())
    }

    /// Best-effort deletion of the volume the claim's provisioner run may
    /// have created; the volume reconciler runs the deprovisioner job.
    fn deprovision(&self, claim: &PersistentVolumeClaim) -> Result<bool, DynError> {
        let pv_key = NamespacedName::cluster_scoped(pv_name_for_claim(claim));
        let pv = match self.cluster.volumes().get(&pv_key) {
            Ok(pv) => pv,
            Err(err) if err.is_not_found() => return Ok(true),
            Err(err) => return Err(with_context(err, "get persistentvolume")),
        };
        if pv.spec.reclaim_policy.as_deref() != Some(RECLAIM_DELETE) {
            log_debug(
                "claim",
                "Skipping PersistentVolume deletion due to reclaim policy",
                &[
                    ("persistentvolume", &pv_key.name),
                    ("policy", pv.spec.reclaim_policy.as_deref().unwrap_or("")),
                ],
            );
            return Ok(true);
        }
        log_debug(
            "claim",
            "Deleting PersistentVolume",
            &[("persistentvolume", &pv_key.name)],
        );
        match self.cluster.volumes().delete(&pv_key) {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(true),
            Err(err) => Err(with_context(err, "delete persistentvolume")),
        }
    }

    fn should_provision(
        &self,
        claim: &PersistentVolumeClaim,
        provisioner: &StorageProvisioner,
    ) -> Result<bool, DynError> {
        if claim.spec.volume_name.as_deref().unwrap_or_default() != "" {
            return Ok(false); // already provisioned
        }
        let Some(class_name) = claim.spec.storage_class_name.as_deref() else {
            return Ok(false);
        };

        let class = match self
            .cluster
            .storage_classes()
            .get(&NamespacedName::cluster_scoped(class_name))
        {
            Ok(class) => class,
            Err(err) if err.is_not_found() => {
                self.recorder.event(
                    claim,
                    EVENT_TYPE_WARNING,
                    "StorageClassNotFound",
                    format!("StorageClass {class_name} not found"),
                );
                return Ok(false);
            }
            Err(err) => return Err(with_context(err, "get storageclass")),
        };

        let pv_mode = provisioner
            .spec
            .persistent_volume_template
            .volume_mode
            .as_deref()
            .unwrap_or_default();
        if claim.spec.volume_mode.as_deref() != Some(pv_mode) {
            let mode = claim.spec.volume_mode.as_deref().unwrap_or("nil");
            self.recorder.event(
                claim,
                EVENT_TYPE_WARNING,
                "InvalidVolumeMode",
                format!("Invalid volume mode {mode}, expected {pv_mode}"),
            );
            return Ok(false);
        }

        if class.volume_binding_mode.as_deref() == Some(BINDING_WAIT_FOR_FIRST_CONSUMER) {
            // A delayed-binding claim only provisions once the scheduler has
            // picked a node; the scheduler may clear the annotation again to
            // force a reschedule.
            if claim
                .metadata
                .annotation(ANN_SELECTED_NODE)
                .unwrap_or_default()
                != ""
            {
                return Ok(true);
            }
            log_info(
                "claim",
                "Waiting for first consumer to bind to a node",
                &[(
                    "persistentvolumeclaim",
                    &NamespacedName::new(
                        claim.metadata.namespace.clone().unwrap_or_default(),
                        claim.metadata.name.clone().unwrap_or_default(),
                    )
                    .to_string(),
                )],
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn provision(
        &self,
        claim: &PersistentVolumeClaim,
        provisioner: &StorageProvisioner,
    ) -> Result<(), DynError> {
        let pv_name = pv_name_for_claim(claim);
        let pv_key = NamespacedName::cluster_scoped(pv_name.clone());
        let pv_exists = match self.cluster.volumes().get(&pv_key) {
            Ok(_) => true,
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(with_context(err, "get persistentvolume")),
        };

        let (env, annotation_err) = annotations_to_env(&claim.metadata, &provisioner.spec.env);
        if let Some(err) = annotation_err.as_ref() {
            self.recorder
                .event(claim, EVENT_TYPE_WARNING, "AnnotationMissing", err.to_string());
        }

        let node_name = claim
            .metadata
            .annotation(ANN_SELECTED_NODE)
            .unwrap_or_default()
            .to_string();
        if node_name.is_empty() {
            log_info(
                "claim",
                "PersistentVolumeClaim is not assigned to a node",
                &[("persistentvolume", pv_name.as_str())],
            );
        }

        let pod_name = NamespacedName::new(
            self.manager_namespace.clone(),
            resource_name(&pv_name, PROVISIONER),
        );
        let claim_key = NamespacedName::new(
            claim.metadata.namespace.clone().unwrap_or_default(),
            claim.metadata.name.clone().unwrap_or_default(),
        );

        let cluster = self.cluster.clone();
        let recorder = self.recorder.clone();
        let pv_name_for_callback = pv_name.clone();
        let claim_for_callback = claim.clone();

        let mut create = || {
            let node_path = storage_root_path_for_node(&node_name, &provisioner.spec.nodes)
                .map_err(|e| with_context(e, "invalid storageprovisioner"))?;
            let substituted = substitute_provisioner_placeholders(
                provisioner,
                &ProvisionerParams {
                    node_name: node_name.clone(),
                    node_path,
                    persistent_volume_name: pv_name.clone(),
                    claim: claim_key.clone(),
                },
            )?;
            let mut pod = new_worker_pod(PodSource {
                pod_name: pod_name.clone(),
                container_name: PROVISIONER,
                substituted_provisioner: &substituted,
                container: &substituted.spec.containers.provisioner,
                env: env.clone(),
            })?;
            pod.spec.node_name = Some(node_name.clone());
            copy_annotations(&claim.metadata, &mut pod.metadata, &provisioner.spec.env);
            let spec_json = substituted.to_annotation_json()?;
            pod.metadata.set_annotation(ANN_PROVISIONER_SPEC, &spec_json);

            self.recorder.event(
                claim,
                EVENT_TYPE_NORMAL,
                "Provisioning",
                "Provisioning PersistentVolume",
            );
            Ok(pod)
        };

        let mut on_completed = |pod: &crate::strata::k8s::pod::Pod| {
            // The volume is created after the pod succeeded and before the
            // pod is deleted, so an interrupted run is always retried.
            let provisioner_json = pod
                .metadata
                .annotation(ANN_PROVISIONER_SPEC)
                .unwrap_or_default()
                .to_string();
            let substituted = StorageProvisioner::from_annotation_json(&provisioner_json)
                .map_err(|e| {
                    with_context(
                        e,
                        format!("invalid/missing provisioner pod annotation {ANN_PROVISIONER_SPEC}"),
                    )
                })?;
            let mut pv = persistent_volume_for_claim(
                &claim_for_callback,
                &substituted,
                &provisioner_json,
            );
            copy_annotations(&pod.metadata, &mut pv.metadata, &substituted.spec.env);
            if let Some(host_path) = pv.spec.host_path.as_ref() {
                log_info(
                    "claim",
                    "Successfully provisioned PersistentVolume",
                    &[
                        ("persistentvolume", pv_name_for_callback.as_str()),
                        ("path", host_path.path.as_str()),
                    ],
                );
            } else {
                log_info(
                    "claim",
                    "Successfully provisioned PersistentVolume",
                    &[("persistentvolume", pv_name_for_callback.as_str())],
                );
            }
            cluster
                .volumes()
                .create(pv)
                .map_err(|e| with_context(e, "create persistentvolume"))?;
            recorder.event(
                &claim_for_callback,
                EVENT_TYPE_NORMAL,
                "Provisioned",
                format!("Provisioned PersistentVolume {pv_name_for_callback}"),
            );
            Ok(true)
        };

        let should_run = !pv_exists && !node_name.is_empty() && annotation_err.is_none();
        let result = self.job_runner.reconcile_job(
            claim,
            JobRequest {
                name: PROVISIONER,
                pod_name: pod_name.clone(),
                should_run,
                create: &mut create,
                on_completed: &mut on_completed,
            },
        );
        if let Err(err) = &result {
            log_warn(
                "claim",
                "Failed to provision PersistentVolume",
                &[
                    ("persistentvolume", pv_name.as_str()),
                    ("error", &err.to_string()),
                ],
            );
        }
        result.map(|_| ())
    }
}

fn persistent_volume_for_claim(
    claim: &PersistentVolumeClaim,
    provisioner: &StorageProvisioner,
    provisioner_json: &str,
) -> PersistentVolume {
    let mut pv = PersistentVolume::new(
        ObjectMeta::named(None, &pv_name_for_claim(claim)),
        provisioner.spec.persistent_volume_template.clone(),
    );
    pv.metadata
        .set_annotation(ANN_STORAGE_PROVISIONER, &provisioner.spec.name);
    pv.metadata
        .set_annotation(ANN_PROVISIONER_SPEC, provisioner_json);
    pv.metadata
        .set_annotation(ANN_PROVISIONED_BY, PROVISIONED_BY_VALUE);
    pv.metadata.add_finalizer(FINALIZER);
    if pv.spec.capacity.is_empty() {
        if let Some(resources) = claim.spec.resources.as_ref() {
            pv.spec.capacity = resources.requests.clone();
        }
    }
    if let Some(class) = claim.spec.storage_class_name.as_deref() {
        pv.spec.storage_class_name = Some(class.to_string());
    }
    pv.spec.claim_ref = Some(ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolumeClaim".to_string()),
        name: claim.metadata.name.clone(),
        namespace: claim.metadata.namespace.clone(),
        uid: claim.metadata.uid.clone(),
        resource_version: claim.metadata.resource_version.clone(),
    });
    pv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strata::api::provisioner::{NodePath, StorageProvisionerSpec, WorkerContainer};
    use crate::strata::api::ANN_PVC_NAME;
    use crate::strata::api::ANN_PVC_NAMESPACE;
    use crate::strata::k8s::client::ClusterObject;
    use crate::strata::k8s::pod::{ContainerSpec, EnvVar, PodStatus, POD_SUCCEEDED};
    use crate::strata::k8s::volume::{
        PersistentVolumeClaimSpec, ResourceRequirements, StorageClass, VOLUME_MODE_FILESYSTEM,
    };
    use std::collections::HashMap;

    const MANAGER_NAMESPACE: &str = "strata-system";

    struct Fixture {
        cluster: Arc<Cluster>,
        registry: Arc<ProvisionerRegistry>,
        recorder: EventRecorder,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                cluster: Cluster::in_memory(),
                registry: Arc::new(ProvisionerRegistry::new()),
                recorder: EventRecorder::new("test"),
            }
        }

        fn reconciler(&self) -> ClaimReconciler {
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

        fn register_provisioner(&self, provisioner_name: &str) {
            let mut spec = StorageProvisionerSpec {
                name: provisioner_name.to_string(),
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
                env: vec![EnvVar::new("STORAGE_NODE_NAME", "${STORAGE_NODE_NAME}")],
            };
            spec.containers.deprovisioner = WorkerContainer {
                command: vec!["true".to_string()],
                env: Vec::new(),
            };
            spec.persistent_volume_template.volume_mode =
                Some(VOLUME_MODE_FILESYSTEM.to_string());
            spec.persistent_volume_template.reclaim_policy = Some(RECLAIM_DELETE.to_string());
            spec.nodes = vec![NodePath {
                name: "*".to_string(),
                path: "/var/lib/strata/volumes".to_string(),
            }];
            let provisioner = StorageProvisioner::new(
                ObjectMeta::named(Some(MANAGER_NAMESPACE), "local"),
                spec,
            );
            self.registry.put(&provisioner).unwrap();
        }

        fn create_storage_class(&self, name: &str, binding_mode: Option<&str>) {
            self.cluster
                .storage_classes()
                .create(StorageClass::new(name, "local.strata.dev", binding_mode))
                .unwrap();
        }

        fn create_claim(
            &self,
            name: &str,
            class: &str,
            node: Option<&str>,
            provisioner_name: &str,
        ) -> PersistentVolumeClaim {
            let mut metadata = ObjectMeta::named(Some("default"), name);
            metadata.set_annotation(ANN_STORAGE_PROVISIONER, provisioner_name);
            if let Some(node) = node {
                metadata.set_annotation(ANN_SELECTED_NODE, node);
            }
            let mut requests = HashMap::new();
            requests.insert("storage".to_string(), "1Gi".to_string());
            let claim = PersistentVolumeClaim::new(
                metadata,
                PersistentVolumeClaimSpec {
                    access_modes: vec!["ReadWriteOnce".to_string()],
                    resources: Some(ResourceRequirements {
                        requests,
                        limits: HashMap::new(),
                    }),
                    storage_class_name: Some(class.to_string()),
                    volume_mode: Some(VOLUME_MODE_FILESYSTEM.to_string()),
                    volume_name: None,
                },
            );
            self.cluster.claims().create(claim).unwrap()
        }

        fn reconcile(&self, key: &NamespacedName) {
            self.reconciler().reconcile(key).unwrap();
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
    fn provisions_volume_through_job_pod() {
        let fixture = Fixture::new();
        fixture.register_provisioner("local.strata.dev");
        fixture.create_storage_class("fast", Some(BINDING_WAIT_FOR_FIRST_CONSUMER));
        let claim = fixture.create_claim("c1", "fast", Some("n2"), "local.strata.dev");
        let key = claim.key();
        let pv_name = pv_name_for_claim(&claim);

        // First tick adds the finalizer.
        fixture.reconcile(&key);
        let claim = fixture.cluster.claims().get(&key).unwrap();
        assert!(claim.metadata.has_finalizer(FINALIZER));

        // Second tick creates the provisioner pod on the selected node.
        fixture.reconcile(&key);
        let pod_name =
            NamespacedName::new(MANAGER_NAMESPACE, resource_name(&pv_name, PROVISIONER));
        let pod = fixture.cluster.pods().get(&pod_name).unwrap();
        assert_eq!(pod.spec.node_name.as_deref(), Some("n2"));
        let container = &pod.spec.containers[0];
        assert_eq!(container.name, "provisioner");
        assert!(container
            .command
            .iter()
            .any(|arg| arg.contains(&format!("/var/lib/strata/volumes/{pv_name}"))));
        assert!(container
            .env
            .iter()
            .any(|e| e.name == "STORAGE_NODE_NAME" && e.value.as_deref() == Some("n2")));
        assert!(fixture.recorder.has_event("c1", "Provisioning"));

        // Pod success produces the volume, bound to the claim.
        fixture.complete_pod(&pod_name);
        fixture.reconcile(&key);
        let pv = fixture
            .cluster
            .volumes()
            .get(&NamespacedName::cluster_scoped(pv_name.clone()))
            .unwrap();
        assert!(pv.metadata.has_finalizer(FINALIZER));
        assert_eq!(
            pv.spec.claim_ref.as_ref().and_then(|r| r.name.as_deref()),
            Some("c1")
        );
        assert_eq!(pv.spec.capacity.get("storage").map(String::as_str), Some("1Gi"));
        assert_eq!(pv.spec.storage_class_name.as_deref(), Some("fast"));
        assert!(pv.metadata.annotation(ANN_PROVISIONER_SPEC).is_some());
        assert!(fixture.recorder.has_event("c1", "Provisioned"));
        assert!(fixture.cluster.pods().get(&pod_name).unwrap_err().is_not_found());

        // Further reconciles are observationally equivalent.
        fixture.reconcile(&key);
        assert!(fixture.cluster.pods().get(&pod_name).unwrap_err().is_not_found());
    }

    #[test]
    fn no_pod_without_selected_node_in_delayed_binding() {
        let fixture = Fixture::new();
        fixture.register_provisioner("local.strata.dev");
        fixture.create_storage_class("fast", Some(BINDING_WAIT_FOR_FIRST_CONSUMER));
        let claim = fixture.create_claim("c1", "fast", None, "local.strata.dev");
        let key = claim.key();

        fixture.reconcile(&key);
        fixture.reconcile(&key);
        assert!(fixture.cluster.pods().list().is_empty());
    }

    #[test]
    fn missing_storage_class_emits_warning() {
        let fixture = Fixture::new();
        fixture.register_provisioner("local.strata.dev");
        let claim = fixture.create_claim("c1", "missing", Some("n1"), "local.strata.dev");
        fixture.reconcile(&claim.key());
        assert!(fixture.recorder.has_event("c1", "StorageClassNotFound"));
        assert!(fixture.cluster.pods().list().is_empty());
    }

    #[test]
    fn volume_mode_mismatch_emits_warning() {
        let fixture = Fixture::new();
        fixture.register_provisioner("local.strata.dev");
        fixture.create_storage_class("fast", None);
        let mut claim = fixture.create_claim("c1", "fast", Some("n1"), "local.strata.dev");
        claim.spec.volume_mode = Some("Block".to_string());
        let claim = fixture.cluster.claims().update(claim).unwrap();
        fixture.reconcile(&claim.key());
        assert!(fixture.recorder.has_event("c1", "InvalidVolumeMode"));
        assert!(fixture.cluster.pods().list().is_empty());
    }

    #[test]
    fn unknown_provisioner_is_ignored() {
        let fixture = Fixture::new();
        let claim = fixture.create_claim("c1", "fast", Some("n1"), "unknown.strata.dev");
        fixture.reconcile(&claim.key());
        assert!(fixture.cluster.pods().list().is_empty());
    }

    #[test]
    fn deletion_cleans_up_pod_and_volume_before_releasing_finalizer() {
        let fixture = Fixture::new();
        fixture.register_provisioner("local.strata.dev");
        fixture.create_storage_class("fast", Some(BINDING_WAIT_FOR_FIRST_CONSUMER));
        let claim = fixture.create_claim("c1", "fast", Some("n2"), "local.strata.dev");
        let key = claim.key();
        let pv_name = pv_name_for_claim(&claim);
        let pod_name =
            NamespacedName::new(MANAGER_NAMESPACE, resource_name(&pv_name, PROVISIONER));

        fixture.reconcile(&key);
        fixture.reconcile(&key);
        fixture.complete_pod(&pod_name);
        fixture.reconcile(&key);

        fixture.cluster.claims().delete(&key).unwrap();
        fixture.reconcile(&key);
        // The volume was asked to delete and the claim finalizer released.
        assert!(fixture.cluster.claims().get(&key).unwrap_err().is_not_found());
        let pv = fixture
            .cluster
            .volumes()
            .get(&NamespacedName::cluster_scoped(pv_name))
            .unwrap();
        assert!(pv.metadata.is_deleting());
    }

    #[test]
    fn no_protection_annotation_strips_protection_finalizer() {
        let fixture = Fixture::new();
        let mut metadata = ObjectMeta::named(Some("default"), "c2");
        metadata.set_annotation(ANN_NO_PROTECTION, ENABLED);
        metadata.add_finalizer(FINALIZER_PVC_PROTECTION);
        let claim = fixture
            .cluster
            .claims()
            .create(PersistentVolumeClaim::new(
                metadata,
                PersistentVolumeClaimSpec::default(),
            ))
            .unwrap();
        let key = claim.key();
        fixture.cluster.claims().delete(&key).unwrap();
        fixture.reconcile(&key);
        assert!(fixture.cluster.claims().get(&key).unwrap_err().is_not_found());
    }
}
