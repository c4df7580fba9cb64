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

use crate::strata::api::{ANN_PVC_NAME, ANN_PVC_NAMESPACE, ANN_PV_NAME};
use crate::strata::controller::claim::ClaimReconciler;
use crate::strata::controller::job::JobRunner;
use crate::strata::controller::pod::PodReconciler;
use crate::strata::controller::provisioner::{load_provisioners, ProvisionerReconciler};
use crate::strata::controller::registry::ProvisionerRegistry;
use crate::strata::controller::volume::VolumeReconciler;
use crate::strata::k8s::client::Cluster;
use crate::strata::k8s::event::EventRecorder;
use crate::strata::k8s::meta::{NamespacedName, ObjectMeta};
use crate::strata::logger::{log_info, log_warn};
use crate::strata::util::error::DynError;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_QUEUE_CAPACITY: usize = 256;
const REQUEUE_DELAY: Duration = Duration::from_secs(1);
const BUSY_KEY_DELAY: Duration = Duration::from_millis(20);

/// Reconciliation target: one object key per reconciler kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControllerTarget {
    Claim(NamespacedName),
    Volume(NamespacedName),
    Pod(NamespacedName),
    Provisioner(NamespacedName),
}

impl fmt::Display for ControllerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerTarget::Claim(key) => write!(f, "PersistentVolumeClaim/{key}"),
            ControllerTarget::Volume(key) => write!(f, "PersistentVolume/{key}"),
            ControllerTarget::Pod(key) => write!(f, "Pod/{key}"),
            ControllerTarget::Provisioner(key) => write!(f, "StorageProvisioner/{key}"),
        }
    }
}

/// Bounded multi-producer work queue feeding one executor.
#[derive(Clone)]
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

struct WorkQueueInner<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
}

impl<T> WorkQueue<T>
where
    T: Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(WorkQueueInner {
                sender,
                receiver: Mutex::new(receiver),
            }),
        }
    }

    pub async fn enqueue(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.inner.sender.send(item).await
    }

    pub async fn next(&self) -> Option<T> {
        let mut guard = self.inner.receiver.lock().await;
        guard.recv().await
    }
}

/// Spawns an executor that is single-flight per key but concurrent across
/// keys: an item whose key is already being reconciled is put back on the
/// queue instead of running a second reconcile in parallel.
pub fn spawn_keyed_executor<H, Fut>(
    queue: WorkQueue<ControllerTarget>,
    cancellation: CancellationToken,
    handler: H,
) -> JoinHandle<()>
where
    H: Fn(ControllerTarget) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DynError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let inflight: Arc<Mutex<HashSet<ControllerTarget>>> = Arc::new(Mutex::new(HashSet::new()));
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = cancellation.cancelled() => return,
                item = queue.next() => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            let mut guard = inflight.lock().await;
            if !guard.insert(item.clone()) {
                drop(guard);
                let queue = queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(BUSY_KEY_DELAY).await;
                    let _ = queue.enqueue(item).await;
                });
                continue;
            }
            drop(guard);

            let handler = handler.clone();
            let inflight = inflight.clone();
            let queue = queue.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                let result = (handler.as_ref())(item.clone()).await;
                inflight.lock().await.remove(&item);
                if let Err(err) = result {
                    let target = item.to_string();
                    log_warn(
                        "controller",
                        "Reconciliation failed; requeueing",
                        &[("target", target.as_str()), ("error", &err.to_string())],
                    );
                    if !cancellation.is_cancelled() {
                        tokio::time::sleep(REQUEUE_DELAY).await;
                        let _ = queue.enqueue(item).await;
                    }
                }
            });
        }
    })
}

fn meta_key(meta: &ObjectMeta) -> NamespacedName {
    NamespacedName {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
    }
}

/// Maps worker-pod events back to the owning resource via the owner
/// annotations the job runner stamps.
fn pod_owner_key(
    meta: &ObjectMeta,
    manager_namespace: &str,
    ann_name: &str,
    ann_namespace: Option<&str>,
) -> Option<NamespacedName> {
    if meta.namespace.as_deref().unwrap_or_default() != manager_namespace {
        return None;
    }
    let name = meta.annotation(ann_name)?.to_string();
    if name.is_empty() {
        return None;
    }
    let namespace = match ann_namespace {
        Some(annotation) => {
            let value = meta.annotation(annotation).unwrap_or_default();
            if value.is_empty() {
                return None;
            }
            value.to_string()
        }
        None => String::new(),
    };
    Some(NamespacedName { namespace, name })
}

/// Control-plane wiring: one work queue and executor per reconciler,
/// watch forwarders and startup seeding.
pub struct ControllerManager {
    cluster: Arc<Cluster>,
    provisioners: Arc<ProvisionerRegistry>,
    manager_namespace: String,
}

impl ControllerManager {
    pub fn new(cluster: Arc<Cluster>, manager_namespace: impl Into<String>) -> Result<Self, DynError> {
        let manager_namespace = manager_namespace.into();
        let provisioners = load_provisioners(&cluster, &manager_namespace)?;
        let keys = provisioners.keys();
        if keys.is_empty() {
            log_info(
                "manager",
                "No provisioners configured. Please create StorageProvisioner resources within the operator namespace",
                &[],
            );
        } else {
            log_info(
                "manager",
                "Configured provisioners",
                &[("provisioners", &keys.join(", "))],
            );
        }
        Ok(Self {
            cluster,
            provisioners,
            manager_namespace,
        })
    }

    pub fn provisioners(&self) -> Arc<ProvisionerRegistry> {
        self.provisioners.clone()
    }

    /// Runs all reconcilers until the cancellation token fires.
    pub async fn run(&self, cancellation: CancellationToken) -> Result<(), DynError> {
        let recorder = EventRecorder::new("manager");

        let claim_reconciler = Arc::new(ClaimReconciler::new(
            self.cluster.clone(),
            self.provisioners.clone(),
            recorder.clone(),
            JobRunner::new(
                self.cluster.clone(),
                recorder.clone(),
                ANN_PVC_NAME,
                Some(ANN_PVC_NAMESPACE),
            ),
            self.manager_namespace.clone(),
        ));
        let volume_reconciler = Arc::new(VolumeReconciler::new(
            self.cluster.clone(),
            self.provisioners.clone(),
            recorder.clone(),
            JobRunner::new(self.cluster.clone(), recorder.clone(), ANN_PV_NAME, None),
            self.manager_namespace.clone(),
        ));
        let pod_reconciler = Arc::new(PodReconciler::new(
            self.cluster.clone(),
            self.provisioners.clone(),
        ));
        let provisioner_reconciler = Arc::new(ProvisionerReconciler::new(
            self.cluster.clone(),
            self.provisioners.clone(),
            self.manager_namespace.clone(),
        ));

        let claim_queue = WorkQueue::new(DEFAULT_QUEUE_CAPACITY);
        let volume_queue = WorkQueue::new(DEFAULT_QUEUE_CAPACITY);
        let pod_queue = WorkQueue::new(DEFAULT_QUEUE_CAPACITY);
        let provisioner_queue = WorkQueue::new(DEFAULT_QUEUE_CAPACITY);

        let mut tasks = Vec::new();

        {
            let reconciler = claim_reconciler.clone();
            tasks.push(spawn_keyed_executor(
                claim_queue.clone(),
                cancellation.clone(),
                move |target| {
                    let reconciler = reconciler.clone();
                    async move {
                        match target {
                            ControllerTarget::Claim(key) => reconciler.reconcile(&key),
                            _ => Ok(()),
                        }
                    }
                },
            ));
        }
        {
            let reconciler = volume_reconciler.clone();
            tasks.push(spawn_keyed_executor(
                volume_queue.clone(),
                cancellation.clone(),
                move |target| {
                    let reconciler = reconciler.clone();
                    async move {
                        match target {
                            ControllerTarget::Volume(key) => reconciler.reconcile(&key),
                            _ => Ok(()),
                        }
                    }
                },
            ));
        }
        {
            let reconciler = pod_reconciler.clone();
            tasks.push(spawn_keyed_executor(
                pod_queue.clone(),
                cancellation.clone(),
                move |target| {
                    let reconciler = reconciler.clone();
                    async move {
                        match target {
                            ControllerTarget::Pod(key) => reconciler.reconcile(&key),
                            _ => Ok(()),
                        }
                    }
                },
            ));
        }
        {
            let reconciler = provisioner_reconciler.clone();
            tasks.push(spawn_keyed_executor(
                provisioner_queue.clone(),
                cancellation.clone(),
                move |target| {
                    let reconciler = reconciler.clone();
                    async move {
                        match target {
                            ControllerTarget::Provisioner(key) => reconciler.reconcile(&key),
                            _ => Ok(()),
                        }
                    }
                },
            ));
        }

        // Watch forwarders: claims, volumes, provisioners map to their own
        // keys; pod events additionally map back to job owners.
        {
            let mut watch = self.cluster.claims().watch();
            let queue = claim_queue.clone();
            let cancellation = cancellation.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => return,
                        event = watch.recv() => match event {
                            Ok(event) => {
                                let key = meta_key(&event.object.metadata);
                                let _ = queue.enqueue(ControllerTarget::Claim(key)).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            }));
        }
        {
            let mut watch = self.cluster.volumes().watch();
            let queue = volume_queue.clone();
            let reconciler = volume_reconciler.clone();
            let cancellation = cancellation.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => return,
                        event = watch.recv() => match event {
                            Ok(event) => {
                                if reconciler.wants(&event.object) {
                                    let key = meta_key(&event.object.metadata);
                                    let _ = queue.enqueue(ControllerTarget::Volume(key)).await;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            }));
        }
        {
            let mut watch = self.cluster.provisioners().watch();
            let queue = provisioner_queue.clone();
            let cancellation = cancellation.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => return,
                        event = watch.recv() => match event {
                            Ok(event) => {
                                let key = meta_key(&event.object.metadata);
                                let _ = queue.enqueue(ControllerTarget::Provisioner(key)).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            }));
        }
        {
            let mut watch = self.cluster.pods().watch();
            let pods = pod_queue.clone();
            let claims = claim_queue.clone();
            let volumes = volume_queue.clone();
            let pod_filter = pod_reconciler.clone();
            let manager_namespace = self.manager_namespace.clone();
            let cancellation = cancellation.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancellation.cancelled() => return,
                        event = watch.recv() => match event {
                            Ok(event) => {
                                let meta = &event.object.metadata;
                                if let Some(owner) = pod_owner_key(
                                    meta,
                                    &manager_namespace,
                                    ANN_PVC_NAME,
                                    Some(ANN_PVC_NAMESPACE),
                                ) {
                                    let _ = claims.enqueue(ControllerTarget::Claim(owner)).await;
                                }
                                if let Some(owner) =
                                    pod_owner_key(meta, &manager_namespace, ANN_PV_NAME, None)
                                {
                                    let _ = volumes.enqueue(ControllerTarget::Volume(owner)).await;
                                }
                                if pod_filter.wants(&event.object) {
                                    let key = meta_key(meta);
                                    let _ = pods.enqueue(ControllerTarget::Pod(key)).await;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            }));
        }

        // Seed: reconcile everything that already exists.
        for provisioner in self.cluster.provisioners().list() {
            let key = meta_key(&provisioner.metadata);
            let _ = provisioner_queue
                .enqueue(ControllerTarget::Provisioner(key))
                .await;
        }
        for claim in self.cluster.claims().list() {
            let key = meta_key(&claim.metadata);
            let _ = claim_queue.enqueue(ControllerTarget::Claim(key)).await;
        }
        for volume in self.cluster.volumes().list() {
            if volume_reconciler.wants(&volume) {
                let key = meta_key(&volume.metadata);
                let _ = volume_queue.enqueue(ControllerTarget::Volume(key)).await;
            }
        }

        log_info("manager", "Starting manager", &[]);
        cancellation.cancelled().await;
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}
