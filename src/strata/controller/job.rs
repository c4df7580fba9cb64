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

use crate::strata::k8s::client::{Cluster, ClusterObject};
use crate::strata::k8s::event::{EventRecorder, EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::strata::k8s::meta::NamespacedName;
use crate::strata::k8s::pod::{Pod, POD_FAILED, POD_SUCCEEDED, RESTART_POLICY_NEVER};
use crate::strata::logger::{log_error, log_info};
use crate::strata::util::error::{new_error, with_context, DynError};
use std::sync::Arc;

/// Runs one short-lived worker pod to completion, then deletes it.
///
/// Owner back-references are carried as pod annotations so pod events can be
/// mapped back to the owning resource.
pub struct JobRunner {
    cluster: Arc<Cluster>,
    recorder: EventRecorder,
    annotation_owner_name: &'static str,
    annotation_owner_namespace: Option<&'static str>,
}

/// One job reconciliation request: the gate, the pod factory and the
/// completion callback as plain function values.
pub struct JobRequest<'a> {
    /// Short job name ("provisioner"/"deprovisioner"), used for events.
    pub name: &'a str,
    pub pod_name: NamespacedName,
    pub should_run: bool,
    pub create: &'a mut dyn FnMut() -> Result<Pod, DynError>,
    pub on_completed: &'a mut dyn FnMut(&Pod) -> Result<bool, DynError>,
}

impl JobRunner {
    pub fn new(
        cluster: Arc<Cluster>,
        recorder: EventRecorder,
        annotation_owner_name: &'static str,
        annotation_owner_namespace: Option<&'static str>,
    ) -> Self {
        Self {
            cluster,
            recorder,
            annotation_owner_name,
            annotation_owner_namespace,
        }
    }

    /// One idempotent reconciliation tick driving the pod toward
    /// deleted-because-should-not-run, completed-and-cleaned-up or failed.
    pub fn reconcile_job<O: ClusterObject>(
        &self,
        owner: &O,
        mut req: JobRequest<'_>,
    ) -> Result<bool, DynError> {
        if !req.should_run {
            return delete_pod(&self.cluster, &req.pod_name);
        }

        let pod = match self.cluster.pods().get(&req.pod_name) {
            Ok(pod) => pod,
            Err(err) if err.is_not_found() => {
                let mut pod = (req.create)()?;
                pod.metadata.name = Some(req.pod_name.name.clone());
                pod.metadata.namespace = Some(req.pod_name.namespace.clone());
                let owner_meta = owner.metadata();
                pod.metadata.set_annotation(
                    self.annotation_owner_name,
                    owner_meta.name.as_deref().unwrap_or_default(),
                );
                if let Some(annotation) = self.annotation_owner_namespace {
                    pod.metadata.set_annotation(
                        annotation,
                        owner_meta.namespace.as_deref().unwrap_or_default(),
                    );
                }
                pod.spec.restart_policy = Some(RESTART_POLICY_NEVER.to_string());

                let node = pod.spec.node_name.clone().unwrap_or_default();
                log_info(
                    "job",
                    "Creating worker pod",
                    &[
                        ("job", req.name),
                        ("pod", &req.pod_name.to_string()),
                        ("node", node.as_str()),
                    ],
                );
                match self.cluster.pods().create(pod) {
                    Ok(_) => return Ok(false), // watch triggers the next tick
                    Err(err) if err.is_already_exists() => {
                        // Lost the creation race; reload instead of surfacing
                        // the error.
                        self.cluster
                            .pods()
                            .get(&req.pod_name)
                            .map_err(|e| with_context(e, "reconcile pod"))?
                    }
                    Err(err) => return Err(with_context(err, "reconcile pod")),
                }
            }
            Err(err) => return Err(with_context(err, "reconcile pod")),
        };

        match pod.phase() {
            POD_FAILED => {
                let err = new_error(format!(
                    "pod {} failed",
                    pod.metadata.name.as_deref().unwrap_or_default()
                ));
                let reason = format!("{}Failed", capitalize(req.name));
                let message = format!("{} Pod failed", capitalize(req.name));
                log_error(
                    "job",
                    &message,
                    &[("pod", &req.pod_name.to_string()), ("error", &err.to_string())],
                );
                self.recorder
                    .event(owner, EVENT_TYPE_WARNING, &reason, message);
                Err(err)
            }
            POD_SUCCEEDED => {
                let reason = format!("{}Completed", capitalize(req.name));
                let message = format!("{} Pod completed", capitalize(req.name));
                log_info("job", &message, &[("pod", &req.pod_name.to_string())]);
                self.recorder
                    .event(owner, EVENT_TYPE_NORMAL, &reason, message);

                // The callback runs before pod deletion so a concurrent
                // reconcile cannot recreate the pod while its output is
                // still being processed.
                let done = (req.on_completed)(&pod)?;
                if !done {
                    return Ok(false);
                }
                delete_pod(&self.cluster, &req.pod_name)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Best-effort pod deletion; reports whether the pod is gone.
pub fn delete_pod(cluster: &Cluster, name: &NamespacedName) -> Result<bool, DynError> {
    match cluster.pods().delete(name) {
        Ok(()) => match cluster.pods().get(name) {
            Ok(_) => Ok(false), // deletion pending behind finalizers
            Err(err) if err.is_not_found() => Ok(true),
            Err(err) => Err(with_context(err, "delete pod")),
        },
        Err(err) if err.is_not_found() => Ok(true),
        Err(err) => Err(with_context(err, "delete pod")),
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strata::k8s::meta::ObjectMeta;
    use crate::strata::k8s::pod::{ContainerSpec, PodSpec, PodStatus};

    fn runner(cluster: &Arc<Cluster>) -> (JobRunner, EventRecorder) {
        let recorder = EventRecorder::new("test");
        (
            JobRunner::new(
                cluster.clone(),
                recorder.clone(),
                "strata.dev/pvc-name",
                Some("strata.dev/pvc-namespace"),
            ),
            recorder,
        )
    }

    fn owner_pod(cluster: &Arc<Cluster>) -> Pod {
        cluster
            .pods()
            .create(Pod::new(
                ObjectMeta::named(Some("default"), "owner"),
                PodSpec::default(),
            ))
            .unwrap()
    }

    fn worker_pod() -> Pod {
        Pod::new(
            ObjectMeta::default(),
            PodSpec {
                containers: vec![ContainerSpec {
                    name: "provisioner".to_string(),
                    image: Some("busybox".to_string()),
                    command: vec!["true".to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    fn set_phase(cluster: &Arc<Cluster>, name: &NamespacedName, phase: &str) {
        let mut pod = cluster.pods().get(name).unwrap();
        pod.status = Some(PodStatus {
            phase: Some(phase.to_string()),
            start_time: None,
        });
        cluster.pods().update_status(pod).unwrap();
    }

    #[test]
    fn creates_pod_with_owner_annotations() {
        let cluster = Cluster::in_memory();
        let (runner, _) = runner(&cluster);
        let owner = owner_pod(&cluster);
        let pod_name = NamespacedName::new("strata-system", "pvc-u1-provisioner");

        let done = runner
            .reconcile_job(
                &owner,
                JobRequest {
                    name: "provisioner",
                    pod_name: pod_name.clone(),
                    should_run: true,
                    create: &mut || Ok(worker_pod()),
                    on_completed: &mut |_| Ok(true),
                },
            )
            .unwrap();
        assert!(!done);

        let created = cluster.pods().get(&pod_name).unwrap();
        assert_eq!(
            created.metadata.annotation("strata.dev/pvc-name"),
            Some("owner")
        );
        assert_eq!(
            created.metadata.annotation("strata.dev/pvc-namespace"),
            Some("default")
        );
        assert_eq!(created.spec.restart_policy.as_deref(), Some("Never"));
    }

    #[test]
    fn callback_runs_before_deletion_on_success() {
        let cluster = Cluster::in_memory();
        let (runner, recorder) = runner(&cluster);
        let owner = owner_pod(&cluster);
        let pod_name = NamespacedName::new("strata-system", "pvc-u1-provisioner");

        let mut callback_saw_pod = false;
        let mut create = || Ok(worker_pod());
        runner
            .reconcile_job(
                &owner,
                JobRequest {
                    name: "provisioner",
                    pod_name: pod_name.clone(),
                    should_run: true,
                    create: &mut create,
                    on_completed: &mut |_| Ok(true),
                },
            )
            .unwrap();
        set_phase(&cluster, &pod_name, POD_SUCCEEDED);

        let cluster_for_callback = cluster.clone();
        let pod_name_for_callback = pod_name.clone();
        let done = runner
            .reconcile_job(
                &owner,
                JobRequest {
                    name: "provisioner",
                    pod_name: pod_name.clone(),
                    should_run: true,
                    create: &mut create,
                    on_completed: &mut |pod| {
                        // The pod must still exist while the callback runs.
                        callback_saw_pod = cluster_for_callback
                            .pods()
                            .get(&pod_name_for_callback)
                            .is_ok();
                        assert_eq!(pod.phase(), POD_SUCCEEDED);
                        Ok(true)
                    },
                },
            )
            .unwrap();
        assert!(done);
        assert!(callback_saw_pod);
        assert!(cluster.pods().get(&pod_name).unwrap_err().is_not_found());
        assert!(recorder.has_event("owner", "ProvisionerCompleted"));
    }

    #[test]
    fn failed_pod_reports_error_without_callback() {
        let cluster = Cluster::in_memory();
        let (runner, recorder) = runner(&cluster);
        let owner = owner_pod(&cluster);
        let pod_name = NamespacedName::new("strata-system", "pvc-u1-provisioner");

        let mut create = || Ok(worker_pod());
        runner
            .reconcile_job(
                &owner,
                JobRequest {
                    name: "provisioner",
                    pod_name: pod_name.clone(),
                    should_run: true,
                    create: &mut create,
                    on_completed: &mut |_| Ok(true),
                },
            )
            .unwrap();
        set_phase(&cluster, &pod_name, POD_FAILED);

        let mut callback_ran = false;
        let err = runner
            .reconcile_job(
                &owner,
                JobRequest {
                    name: "provisioner",
                    pod_name: pod_name.clone(),
                    should_run: true,
                    create: &mut create,
                    on_completed: &mut |_| {
                        callback_ran = true;
                        Ok(true)
                    },
                },
            )
            .unwrap_err();
        assert!(err.to_string().contains("failed"));
        assert!(!callback_ran);
        assert!(recorder.has_event("owner", "ProvisionerFailed"));
    }

    #[test]
    fn should_not_run_deletes_pod() {
        let cluster = Cluster::in_memory();
        let (runner, _) = runner(&cluster);
        let owner = owner_pod(&cluster);
        let pod_name = NamespacedName::new("strata-system", "pvc-u1-provisioner");

        let mut create = || Ok(worker_pod());
        runner
            .reconcile_job(
                &owner,
                JobRequest {
                    name: "provisioner",
                    pod_name: pod_name.clone(),
                    should_run: true,
                    create: &mut create,
                    on_completed: &mut |_| Ok(true),
                },
            )
            .unwrap();
        assert!(cluster.pods().get(&pod_name).is_ok());

        let done = runner
            .reconcile_job(
                &owner,
                JobRequest {
                    name: "provisioner",
                    pod_name: pod_name.clone(),
                    should_run: false,
                    create: &mut create,
                    on_completed: &mut |_| Ok(true),
                },
            )
            .unwrap();
        assert!(done);
        assert!(cluster.pods().get(&pod_name).unwrap_err().is_not_found());
    }
}
