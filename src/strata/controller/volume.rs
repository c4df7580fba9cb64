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
use crate::strata::api::{ANN_DEPROVISIONER_DISABLED, ANN_PROVISIONER_SPEC, ENABLED, FINALIZER};
use crate::strata::controller::claim::resolve_provisioner;
use crate::strata::controller::job::{JobRequest, JobRunner};
use crate::strata::controller::registry::ProvisionerRegistry;
use crate::strata::controller::worker::{annotations_to_env, new_worker_pod, PodSource};
use crate::strata::controller::DEPROVISIONER;
use crate::strata::k8s::client::Cluster;
use crate::strata::k8s::event::{EventRecorder, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::strata::k8s::meta::{resource_name, NamespacedName};
use crate::strata::k8s::volume::{PersistentVolume, VOLUME_BOUND};
use crate::strata::logger::{log_debug, log_error, log_info, log_warn};
use crate::strata::util::error::{with_context, DynError};
use std::sync::Arc;

/// Drives a released volume through deprovisioning and deletion; owns the
/// volume-side finalizer.
pub struct VolumeReconciler {
    cluster: Arc<Cluster>,
    provisioners: Arc<ProvisionerRegistry>,
    recorder: EventRecorder,
    job_runner: JobRunner,
    manager_namespace: String,
}

impl VolumeReconciler {
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

    /// Only volumes carrying our finalizer or managed by a known
    /// provisioner are relevant, and only once deletion was requested.
    pub fn wants(&self, pv: &PersistentVolume) -> bool {
        pv.metadata.is_deleting()
            && (pv.metadata.has_finalizer(FINALIZER)
                || resolve_provisioner(&pv.metadata, &self.provisioners).is_some())
    }

    pub fn reconcile(&self, key: &NamespacedName) -> Result<(), DynError> {
        let pv = match self.cluster.volumes().get(key) {
            Ok(pv) => pv,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(with_context(err, "get persistentvolume")),
        };
        if !pv.metadata.is_deleting() || !pv.metadata.has_finalizer(FINALIZER) {
            return Ok(());
        }
        log_debug(
            "volume",
            "Reconciling PersistentVolume",
            &[("persistentvolume", key.name.as_str())],
        );

        if !self.can_deprovision(&pv)? {
            return Ok(());
        }
        if !self.deprovision_volume(&pv)? {
            return Ok(());
        }

        let mut pv = self
            .cluster
            .volumes()
            .get(key)
            .map_err(|e| with_context(e, "reload persistentvolume"))?;
        pv.metadata.remove_finalizer(FINALIZER);
        self.cluster
            .volumes()
            .update(pv.clone())
            .map_err(|e| with_context(e, "remove finalizer from persistentvolume"))?;
        log_info(
            "volume",
            "Deleted PersistentVolume",
            &[("persistentvolume", key.name.as_str())],
        );
        self.recorder.event(
            &pv,
            EVENT_TYPE_NORMAL,
            "Deprovisioned",
            "Deprovisioned PersistentVolume",
        );
        Ok(())
    }

    /// The deprovisioner must not run while the volume is bound; a released
    /// volume first has its claim ref cleared so it can leave `Bound`.
    fn can_deprovision(&self, pv: &PersistentVolume) -> Result<bool, DynError> {
        let mut pv = pv.clone();
        // One retry resolves the expected conflict when the volume was
        // updated between read and write.
        for attempt in 0..2 {
            if pv.phase() == VOLUME_BOUND {
                return Ok(false);
            }
            let Some(claim_ref) = pv.spec.claim_ref.as_ref() else {
                return Ok(true);
            };
            let claim_key = NamespacedName::new(
                claim_ref.namespace.clone().unwrap_or_default(),
                claim_ref.name.clone().unwrap_or_default(),
            );
            match self.cluster.claims().get(&claim_key) {
                Ok(_) => {
                    // The claim ref is never cleared while the claim exists.
                    log_debug(
                        "volume",
                        "Waiting for PersistentVolumeClaim to be deleted before deprovisioning",
                        &[("persistentvolumeclaim", &claim_key.to_string())],
                    );
                    return Ok(false);
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(with_context(err, "get persistentvolumeclaim")),
            }

            if resolve_provisioner(&pv.metadata, &self.provisioners).is_none()
                && !pv.metadata.has_finalizer(FINALIZER)
            {
                return Ok(false); // not managed by a known provisioner
            }

            pv.spec.claim_ref = None;
            match self.cluster.volumes().update(pv.clone()) {
                Ok(_) => {
                    log_debug(
                        "volume",
                        "Removed claimRef from PersistentVolume",
                        &[("persistentvolume", pv.metadata.name.as_deref().unwrap_or(""))],
                    );
                    return Ok(false); // next reconciliation continues deprovisioning
                }
                Err(err) if err.is_conflict() && attempt == 0 => {
                    let key = NamespacedName::cluster_scoped(
                        pv.metadata.name.clone().unwrap_or_default(),
                    );
                    pv = self
                        .cluster
                        .volumes()
                        .get(&key)
                        .map_err(|e| with_context(e, "reload persistentvolume"))?;
                }
                Err(err) => {
                    return Err(with_context(err, "remove claimRef from persistentvolume"))
                }
            }
        }
        Ok(false)
    }

    fn deprovision_volume(&self, pv: &PersistentVolume) -> Result<bool, DynError> {
        let pv_name = pv.metadata.name.clone().unwrap_or_default();
        let Some(provisioner_json) = pv
            .metadata
            .annotation(ANN_PROVISIONER_SPEC)
            .filter(|v| !v.is_empty())
            .map(String::from)
        else {
            // Without the serialised definition there is no deprovisioner to
            // run; the finalizer path still proceeds so the volume is not
            // stuck forever.
            log_error(
                "volume",
                "Cannot derive deprovisioner for PersistentVolume",
                &[("persistentvolume", pv_name.as_str())],
            );
            self.recorder.event(
                pv,
                EVENT_TYPE_WARNING,
                "DeprovisionerSpecAnnotationMissing",
                format!("missing annotation {ANN_PROVISIONER_SPEC}"),
            );
            return Ok(true);
        };
        let provisioner = match StorageProvisioner::from_annotation_json(&provisioner_json) {
            Ok(provisioner) => provisioner,
            Err(err) => {
                log_error(
                    "volume",
                    "Cannot derive deprovisioner from PersistentVolume",
                    &[
                        ("persistentvolume", pv_name.as_str()),
                        ("error", &err.to_string()),
                    ],
                );
                self.recorder.event(
                    pv,
                    EVENT_TYPE_WARNING,
                    "DeprovisionerSpecAnnotationInvalid",
                    err.to_string(),
                );
                return Ok(false);
            }
        };

        let pod_name = NamespacedName::new(
            self.manager_namespace.clone(),
            resource_name(&pv_name, DEPROVISIONER),
        );
        let should_run = pv.metadata.annotation(ANN_DEPROVISIONER_DISABLED) != Some(ENABLED);

        let cluster = self.cluster.clone();
        let pv_for_callback = pv.clone();

        let mut create = || {
            let (env, annotation_err) = annotations_to_env(&pv.metadata, &provisioner.spec.env);
            if let Some(err) = annotation_err {
                return Err(with_context(
                    err,
                    "persistentvolume does not specify annotation",
                ));
            }
            let mut pod = new_worker_pod(PodSource {
                pod_name: pod_name.clone(),
                container_name: DEPROVISIONER,
                substituted_provisioner: &provisioner,
                container: &provisioner.spec.containers.deprovisioner,
                env,
            })?;
            pod.metadata
                .set_annotation(ANN_PROVISIONER_SPEC, &provisioner_json);
            Ok(pod)
        };

        let mut on_completed = |_: &crate::strata::k8s::pod::Pod| {
            // Disable the deprovisioner on the volume so a subsequent
            // reconcile does not rerun it.
            let key = NamespacedName::cluster_scoped(
                pv_for_callback.metadata.name.clone().unwrap_or_default(),
            );
            let mut current = cluster
                .volumes()
                .get(&key)
                .map_err(|e| with_context(e, "reload persistentvolume"))?;
            current
                .metadata
                .set_annotation(ANN_DEPROVISIONER_DISABLED, ENABLED);
            cluster
                .volumes()
                .update(current)
                .map_err(|e| with_context(e, "disable deprovisioner on persistentvolume"))?;
            Ok(true)
        };

        let result = self.job_runner.reconcile_job(
            pv,
            JobRequest {
                name: DEPROVISIONER,
                pod_name: pod_name.clone(),
                should_run,
                create: &mut create,
                on_completed: &mut on_completed,
            },
        );
        if let Err(err) = &result {
            log_warn(
                "volume",
                "Failed to deprovision PersistentVolume",
                &[
                    ("persistentvolume", pv_name.as_str()),
                    ("pod", &pod_name.to_string()),
                    ("error", &err.to_string()),
                ],
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strata::api::provisioner::{
        NodePath, StorageProvisionerSpec, WorkerContainer,
    };
    use crate::strata::api::{ANN_PV_NAME, ANN_STORAGE_PROVISIONER};
    use crate::strata::k8s::client::ClusterObject;
    use crate::strata::k8s::meta::{ObjectMeta, ObjectReference};
    use crate::strata::k8s::pod::{ContainerSpec, PodStatus, POD_SUCCEEDED};
    use crate::strata::k8s::volume::{
        PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeSpec,
        PersistentVolumeStatus, VOLUME_MODE_FILESYSTEM,
    };

    const MANAGER_NAMESPACE: &str = "strata-system";

    fn sample_provisioner() -> StorageProvisioner {
        let mut spec = StorageProvisionerSpec {
            name: "local.strata.dev".to_string(),
            ..Default::default()
        };
        spec.pod_template.containers = vec![ContainerSpec {
            name: "main".to_string(),
            image: Some("docker.io/library/busybox:latest".to_string()),
            ..Default::default()
        }];
        spec.containers.deprovisioner = WorkerContainer {
            command: vec!["true".to_string()],
            env: Vec::new(),
        };
        spec.containers.provisioner = WorkerContainer {
            command: vec!["true".to_string()],
            env: Vec::new(),
        };
        spec.persistent_volume_template.volume_mode = Some(VOLUME_MODE_FILESYSTEM.to_string());
        spec.nodes = vec![NodePath {
            name: "*".to_string(),
            path: "/var/lib/strata/volumes".to_string(),
        }];
        StorageProvisioner::new(ObjectMeta::named(Some(MANAGER_NAMESPACE), "local"), spec)
    }

    struct Fixture {
        cluster: Arc<Cluster>,
        registry: Arc<ProvisionerRegistry>,
        recorder: EventRecorder,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(ProvisionerRegistry::new());
            registry.put(&sample_provisioner()).unwrap();
            Self {
                cluster: Cluster::in_memory(),
                registry,
                recorder: EventRecorder::new("test"),
            }
        }

        fn reconciler(&self) -> VolumeReconciler {
            VolumeReconciler::new(
                self.cluster.clone(),
                self.registry.clone(),
                self.recorder.clone(),
                JobRunner::new(self.cluster.clone(), self.recorder.clone(), ANN_PV_NAME, None),
                MANAGER_NAMESPACE,
            )
        }

        fn create_volume(&self, name: &str, phase: &str, claim_ref: Option<&str>) -> PersistentVolume {
            let provisioner = sample_provisioner();
            let mut metadata = ObjectMeta::named(None, name);
            metadata.add_finalizer(FINALIZER);
            metadata.set_annotation(ANN_STORAGE_PROVISIONER, "local.strata.dev");
            metadata.set_annotation(
                ANN_PROVISIONER_SPEC,
                &provisioner.to_annotation_json().unwrap(),
            );
            let mut pv = PersistentVolume::new(metadata, PersistentVolumeSpec::default());
            pv.spec.claim_ref = claim_ref.map(|claim_name| ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("PersistentVolumeClaim".to_string()),
                name: Some(claim_name.to_string()),
                namespace: Some("default".to_string()),
                uid: None,
                resource_version: None,
            });
            pv.status = Some(PersistentVolumeStatus {
                phase: Some(phase.to_string()),
            });
            self.cluster.volumes().create(pv).unwrap()
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
    fn bound_volume_is_left_alone() {
        let fixture = Fixture::new();
        let pv = fixture.create_volume("pvc-u1", VOLUME_BOUND, Some("c1"));
        let key = pv.key();
        fixture.cluster.volumes().delete(&key).unwrap();
        fixture.reconciler().reconcile(&key).unwrap();
        assert!(fixture.cluster.pods().list().is_empty());
        assert!(fixture.cluster.volumes().get(&key).is_ok());
    }

    #[test]
    fn waits_for_claim_before_clearing_claim_ref() {
        let fixture = Fixture::new();
        fixture
            .cluster
            .claims()
            .create(PersistentVolumeClaim::new(
                ObjectMeta::named(Some("default"), "c1"),
                PersistentVolumeClaimSpec::default(),
            ))
            .unwrap();
        let pv = fixture.create_volume("pvc-u1", "Released", Some("c1"));
        let key = pv.key();
        fixture.cluster.volumes().delete(&key).unwrap();
        fixture.reconciler().reconcile(&key).unwrap();
        // claimRef survives while the claim exists.
        let pv = fixture.cluster.volumes().get(&key).unwrap();
        assert!(pv.spec.claim_ref.is_some());
        assert!(fixture.cluster.pods().list().is_empty());
    }

    #[test]
    fn deprovisions_and_removes_finalizer() {
        let fixture = Fixture::new();
        let pv = fixture.create_volume("pvc-u1", "Released", Some("gone-claim"));
        let key = pv.key();
        fixture.cluster.volumes().delete(&key).unwrap();
        let reconciler = fixture.reconciler();

        // Tick 1 clears the claim ref.
        reconciler.reconcile(&key).unwrap();
        let pv = fixture.cluster.volumes().get(&key).unwrap();
        assert!(pv.spec.claim_ref.is_none());

        // Tick 2 creates the deprovisioner pod.
        reconciler.reconcile(&key).unwrap();
        let pod_name = NamespacedName::new(
            MANAGER_NAMESPACE,
            resource_name("pvc-u1", DEPROVISIONER),
        );
        let pod = fixture.cluster.pods().get(&pod_name).unwrap();
        assert_eq!(pod.spec.containers[0].name, "deprovisioner");
        assert_eq!(pod.metadata.annotation(ANN_PV_NAME), Some("pvc-u1"));

        // Pod success disables the deprovisioner and releases the finalizer.
        fixture.complete_pod(&pod_name);
        reconciler.reconcile(&key).unwrap();
        assert!(fixture.cluster.volumes().get(&key).unwrap_err().is_not_found());
        assert!(fixture.recorder.has_event("pvc-u1", "Deprovisioned"));
        assert!(fixture.cluster.pods().get(&pod_name).unwrap_err().is_not_found());
    }

    #[test]
    fn missing_spec_annotation_still_releases_finalizer() {
        let fixture = Fixture::new();
        let mut metadata = ObjectMeta::named(None, "pvc-u2");
        metadata.add_finalizer(FINALIZER);
        let mut pv = PersistentVolume::new(metadata, PersistentVolumeSpec::default());
        pv.status = Some(PersistentVolumeStatus {
            phase: Some("Released".to_string()),
        });
        let pv = fixture.cluster.volumes().create(pv).unwrap();
        let key = pv.key();
        fixture.cluster.volumes().delete(&key).unwrap();
        fixture.reconciler().reconcile(&key).unwrap();
        assert!(fixture.recorder.has_event("pvc-u2", "DeprovisionerSpecAnnotationMissing"));
        assert!(fixture.cluster.volumes().get(&key).unwrap_err().is_not_found());
    }
}
