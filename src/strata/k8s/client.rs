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

use crate::strata::api::cache::Cache;
use crate::strata::api::provisioner::StorageProvisioner;
use crate::strata::k8s::meta::{NamespacedName, ObjectMeta};
use crate::strata::k8s::pod::Pod;
use crate::strata::k8s::volume::{PersistentVolume, PersistentVolumeClaim, StorageClass};
use crate::strata::logger::log_warn;
use crate::strata::util::error::{with_context, DynError};

use chrono::Utc;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

const WATCH_BUFFER_SIZE: usize = 256;

/// Error taxonomy of the cluster resource surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    NotFound { kind: &'static str, name: String },
    AlreadyExists { kind: &'static str, name: String },
    Conflict { kind: &'static str, name: String },
    Invalid(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ApiError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict { .. })
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::NotFound { kind, name } => write!(f, "{kind} {name} not found"),
            ApiError::AlreadyExists { kind, name } => write!(f, "{kind} {name} already exists"),
            ApiError::Conflict { kind, name } => {
                write!(f, "{kind} {name} was modified concurrently")
            }
            ApiError::Invalid(message) => f.write_str(message),
        }
    }
}

impl Error for ApiError {}

/// Returns the `ApiError` within a boxed error chain, if any.
pub fn as_api_error(err: &DynError) -> Option<&ApiError> {
    let mut source: Option<&(dyn Error + 'static)> = Some(err.as_ref());
    while let Some(current) = source {
        if let Some(api) = current.downcast_ref::<ApiError>() {
            return Some(api);
        }
        source = current.source();
    }
    None
}

pub fn is_not_found(err: &DynError) -> bool {
    as_api_error(err).map(ApiError::is_not_found).unwrap_or(false)
}

pub fn is_conflict(err: &DynError) -> bool {
    as_api_error(err).map(ApiError::is_conflict).unwrap_or(false)
}

/// Typed resource stored by the cluster.
pub trait ClusterObject:
    Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> NamespacedName {
        NamespacedName {
            namespace: self.metadata().namespace.clone().unwrap_or_default(),
            name: self.metadata().name.clone().unwrap_or_default(),
        }
    }
}

macro_rules! cluster_object {
    ($type:ty, $kind:literal) => {
        impl ClusterObject for $type {
            const KIND: &'static str = $kind;

            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

cluster_object!(Pod, "Pod");
cluster_object!(PersistentVolumeClaim, "PersistentVolumeClaim");
cluster_object!(PersistentVolume, "PersistentVolume");
cluster_object!(StorageClass, "StorageClass");
cluster_object!(StorageProvisioner, "StorageProvisioner");
cluster_object!(Cache, "Cache");

/// Generic Kubernetes-style watch event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub object: T,
}

pub const WATCH_ADDED: &str = "ADDED";
pub const WATCH_MODIFIED: &str = "MODIFIED";
pub const WATCH_DELETED: &str = "DELETED";

/// One typed collection of cluster objects with optimistic concurrency,
/// finalizer-aware deletion and watch broadcast.
pub struct Collection<T: ClusterObject> {
    objects: RwLock<HashMap<NamespacedName, T>>,
    watchers: broadcast::Sender<WatchEvent<T>>,
    versions: Arc<AtomicU64>,
    dir: Option<PathBuf>,
}

impl<T: ClusterObject> Collection<T> {
    fn new(versions: Arc<AtomicU64>, dir: Option<PathBuf>) -> Result<Self, DynError> {
        let collection = Self {
            objects: RwLock::new(HashMap::new()),
            watchers: broadcast::channel(WATCH_BUFFER_SIZE).0,
            versions,
            dir,
        };
        collection.load()?;
        Ok(collection)
    }

    fn load(&self) -> Result<(), DynError> {
        let Some(dir) = self.dir.as_ref() else {
            return Ok(());
        };
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(dir).map_err(|e| {
                    with_context(e, format!("create state directory {}", dir.display()))
                })?;
                return Ok(());
            }
            Err(err) => {
                return Err(with_context(
                    err,
                    format!("read state directory {}", dir.display()),
                ))
            }
        };
        let mut objects = self.objects.write().expect("cluster store poisoned");
        for entry in entries {
            let path = entry
                .map_err(|e| with_context(e, format!("iterate {}", dir.display())))?
                .path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let data = fs::read(&path)
                .map_err(|e| with_context(e, format!("read {}", path.display())))?;
            let object: T = serde_json::from_slice(&data)
                .map_err(|e| with_context(e, format!("parse {}", path.display())))?;
            // Keep the version counter ahead of everything already on disk.
            if let Some(version) = object
                .metadata()
                .resource_version
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
            {
                self.versions.fetch_max(version + 1, Ordering::SeqCst);
            }
            objects.insert(object.key(), object);
        }
        Ok(())
    }

    fn object_path(&self, key: &NamespacedName) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| {
            let namespace = if key.namespace.is_empty() {
                "_cluster"
            } else {
                key.namespace.as_str()
            };
            dir.join(format!("{}__{}.json", namespace, key.name))
        })
    }

    fn persist(&self, object: &T) -> Result<(), DynError> {
        let Some(path) = self.object_path(&object.key()) else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| with_context(e, format!("create {}", parent.display())))?;
        }
        let data = serde_json::to_vec_pretty(object)
            .map_err(|e| with_context(e, format!("serialize {}", T::KIND)))?;
        fs::write(&path, data).map_err(|e| with_context(e, format!("write {}", path.display())))
    }

    fn unpersist(&self, key: &NamespacedName) {
        let Some(path) = self.object_path(key) else {
            return;
        };
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != ErrorKind::NotFound {
                let path_display = path.display().to_string();
                let error_text = err.to_string();
                log_warn(
                    "cluster",
                    "Failed to remove persisted object",
                    &[("path", path_display.as_str()), ("error", error_text.as_str())],
                );
            }
        }
    }

    fn next_version(&self) -> String {
        self.versions.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn broadcast(&self, event_type: &str, object: T) {
        let _ = self.watchers.send(WatchEvent {
            event_type: event_type.to_string(),
            object,
        });
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.watchers.subscribe()
    }

    pub fn get(&self, key: &NamespacedName) -> Result<T, ApiError> {
        let objects = self.objects.read().expect("cluster store poisoned");
        objects.get(key).cloned().ok_or_else(|| ApiError::NotFound {
            kind: T::KIND,
            name: key.to_string(),
        })
    }

    /// Lists all objects ordered by key for deterministic iteration.
    pub fn list(&self) -> Vec<T> {
        let objects = self.objects.read().expect("cluster store poisoned");
        let mut items: Vec<(NamespacedName, T)> =
            objects.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        items.sort_by(|a, b| (&a.0.namespace, &a.0.name).cmp(&(&b.0.namespace, &b.0.name)));
        items.into_iter().map(|(_, v)| v).collect()
    }

    pub fn create(&self, mut object: T) -> Result<T, ApiError> {
        let key = object.key();
        if key.name.is_empty() {
            return Err(ApiError::Invalid(format!("{} has no name", T::KIND)));
        }
        let mut objects = self.objects.write().expect("cluster store poisoned");
        if objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists {
                kind: T::KIND,
                name: key.to_string(),
            });
        }
        let meta = object.metadata_mut();
        meta.uid = Some(random_uid());
        meta.creation_timestamp = Some(Utc::now());
        meta.generation = 1;
        meta.resource_version = Some(self.next_version());
        objects.insert(key, object.clone());
        drop(objects);
        if let Err(err) = self.persist(&object) {
            log_warn(
                "cluster",
                "Failed to persist created object",
                &[("kind", T::KIND), ("error", &err.to_string())],
            );
        }
        self.broadcast(WATCH_ADDED, object.clone());
        Ok(object)
    }

    pub fn update(&self, object: T) -> Result<T, ApiError> {
        self.write(object, true)
    }

    /// Writes only because of a `status.*` change; does not bump the
    /// object generation.
    pub fn update_status(&self, object: T) -> Result<T, ApiError> {
        self.write(object, false)
    }

    fn write(&self, mut object: T, bump_generation: bool) -> Result<T, ApiError> {
        let key = object.key();
        let mut objects = self.objects.write().expect("cluster store poisoned");
        let existing = objects.get(&key).ok_or_else(|| ApiError::NotFound {
            kind: T::KIND,
            name: key.to_string(),
        })?;
        if existing.metadata().resource_version != object.metadata().resource_version {
            return Err(ApiError::Conflict {
                kind: T::KIND,
                name: key.to_string(),
            });
        }
        // A deleting object whose last finalizer was removed is gone.
        if object.metadata().is_deleting() && object.metadata().finalizers.is_empty() {
            objects.remove(&key);
            drop(objects);
            self.unpersist(&key);
            self.broadcast(WATCH_DELETED, object.clone());
            return Ok(object);
        }
        let meta = object.metadata_mut();
        if bump_generation {
            meta.generation += 1;
        }
        meta.resource_version = Some(self.next_version());
        objects.insert(key, object.clone());
        drop(objects);
        if let Err(err) = self.persist(&object) {
            log_warn(
                "cluster",
                "Failed to persist updated object",
                &[("kind", T::KIND), ("error", &err.to_string())],
            );
        }
        self.broadcast(WATCH_MODIFIED, object.clone());
        Ok(object)
    }

    /// Requests deletion: removes the object when no finalizers remain,
    /// otherwise stamps the deletion timestamp and waits for controllers.
    pub fn delete(&self, key: &NamespacedName) -> Result<(), ApiError> {
        let mut objects = self.objects.write().expect("cluster store poisoned");
        let Some(existing) = objects.get(key) else {
            return Err(ApiError::NotFound {
                kind: T::KIND,
                name: key.to_string(),
            });
        };
        if existing.metadata().finalizers.is_empty() {
            let object = objects.remove(key).expect("checked above");
            drop(objects);
            self.unpersist(key);
            self.broadcast(WATCH_DELETED, object);
            return Ok(());
        }
        if existing.metadata().is_deleting() {
            return Ok(()); // deletion already pending
        }
        let mut object = existing.clone();
        let meta = object.metadata_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version = Some(self.next_version());
        objects.insert(key.clone(), object.clone());
        drop(objects);
        if let Err(err) = self.persist(&object) {
            log_warn(
                "cluster",
                "Failed to persist deleting object",
                &[("kind", T::KIND), ("error", &err.to_string())],
            );
        }
        self.broadcast(WATCH_MODIFIED, object);
        Ok(())
    }
}

fn random_uid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Typed cluster state store shared by the manager, the node agent and the
/// tests. In-memory by default; persisted per-object under a state
/// directory when one is given so separate processes observe the same
/// records.
pub struct Cluster {
    pods: Collection<Pod>,
    claims: Collection<PersistentVolumeClaim>,
    volumes: Collection<PersistentVolume>,
    storage_classes: Collection<StorageClass>,
    provisioners: Collection<StorageProvisioner>,
    caches: Collection<Cache>,
}

impl Cluster {
    pub fn in_memory() -> Arc<Self> {
        Self::build(None).expect("in-memory cluster store cannot fail to open")
    }

    pub fn open(state_dir: PathBuf) -> Result<Arc<Self>, DynError> {
        Self::build(Some(state_dir))
    }

    fn build(state_dir: Option<PathBuf>) -> Result<Arc<Self>, DynError> {
        let versions = Arc::new(AtomicU64::new(1));
        let dir = |kind: &str| state_dir.as_ref().map(|d| d.join(kind));
        Ok(Arc::new(Self {
            pods: Collection::new(versions.clone(), dir("pods"))?,
            claims: Collection::new(versions.clone(), dir("persistentvolumeclaims"))?,
            volumes: Collection::new(versions.clone(), dir("persistentvolumes"))?,
            storage_classes: Collection::new(versions.clone(), dir("storageclasses"))?,
            provisioners: Collection::new(versions.clone(), dir("storageprovisioners"))?,
            caches: Collection::new(versions, dir("caches"))?,
        }))
    }

    pub fn pods(&self) -> &Collection<Pod> {
        &self.pods
    }

    pub fn claims(&self) -> &Collection<PersistentVolumeClaim> {
        &self.claims
    }

    pub fn volumes(&self) -> &Collection<PersistentVolume> {
        &self.volumes
    }

    pub fn storage_classes(&self) -> &Collection<StorageClass> {
        &self.storage_classes
    }

    pub fn provisioners(&self) -> &Collection<StorageProvisioner> {
        &self.provisioners
    }

    pub fn caches(&self) -> &Collection<Cache> {
        &self.caches
    }
}
