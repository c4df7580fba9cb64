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

use crate::strata::api::cache::{Cache, CacheVolumeStatus, VolumeError};
use crate::strata::cache::store::{CacheMountOptions, CacheStore, UnmountResult};
use crate::strata::k8s::client::Cluster;
use crate::strata::k8s::meta::{NamespacedName, ObjectMeta};
use crate::strata::logger::{log_error, log_warn};
use crate::strata::util::error::{new_error, with_context, DynError};
use chrono::{Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on a writer's exclusive hold on a cache.
pub fn commit_timeout() -> ChronoDuration {
    ChronoDuration::minutes(15)
}

const CONFLICT_RETRY_STEPS: usize = 10;
const CONFLICT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Coordinates cache mounts across nodes through the shared Cache record,
/// using compare-and-swap status updates with bounded retry.
pub struct ClusterSync {
    cluster: Arc<Cluster>,
    node_name: String,
}

impl ClusterSync {
    pub fn new(cluster: Arc<Cluster>, node_name: impl Into<String>) -> Self {
        Self {
            cluster,
            node_name: node_name.into(),
        }
    }

    /// Registers a volume in the cluster-wide cache record and returns the
    /// effective image readers should mount. Writable registrations bump
    /// the cache generation.
    pub async fn register_cache_volume(
        &self,
        cache_key: &NamespacedName,
        volume_name: &str,
        default_image: &str,
        commit: bool,
    ) -> Result<String, DynError> {
        let mut image = String::new();
        let node_name = self.node_name.clone();
        self.update_cache(cache_key, true, |cache| {
            if cache.status.image.is_empty() {
                cache.status.image = default_image.to_string();
            }
            image = cache.status.image.clone();
            cache.status.used += 1;
            cache.status.last_used = Some(Utc::now());
            add_volume(cache, &node_name, volume_name, commit)
        })
        .await
        .map_err(|e| with_context(e, "register volume in cluster"))?;
        Ok(image)
    }

    /// Commit pre-flight: elects at most one committer per cache. A stale
    /// lock (older than the commit timeout) is reclaimed by the caller.
    pub async fn prepare_commit(
        &self,
        cache_key: &NamespacedName,
        volume_name: &str,
    ) -> Result<bool, DynError> {
        let mut commit = false;
        let node_name = self.node_name.clone();
        let key_text = cache_key.to_string();
        let result = self
            .update_cache(cache_key, false, |cache| {
                commit = false;
                if cache.spec.read_only || cache.is_rejecting() {
                    return Ok(());
                }
                if cache.find_volume(&node_name, volume_name).is_none() {
                    log_warn(
                        "sync",
                        "Volume is not registered with the cache; denying commit",
                        &[
                            ("cache", key_text.as_str()),
                            ("node", node_name.as_str()),
                            ("volume", volume_name),
                        ],
                    );
                    return Ok(());
                }
                let in_flight = reclaim_or_detect_commit(cache, &key_text);
                let volume = cache
                    .find_volume_mut(&node_name, volume_name)
                    .expect("checked above");
                if !volume.committable || in_flight {
                    return Ok(());
                }
                volume.commit_start_time = Some(Utc::now());
                commit = true;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(commit),
            Err(err) if is_not_found(&err) => {
                log_warn(
                    "sync",
                    "Prepare cache commit: cache not found",
                    &[("cache", &cache_key.to_string())],
                );
                Ok(false)
            }
            Err(err) => Err(with_context(err, "prepare cache commit")),
        }
    }

    /// Removes the volume from the cache record after unmount, recording
    /// the outcome on the node entry.
    pub async fn unregister_cache_volume(
        &self,
        cache_key: &NamespacedName,
        volume_name: &str,
        commit_err: Option<&DynError>,
        image_id: Option<&str>,
    ) -> Result<(), DynError> {
        let node_name = self.node_name.clone();
        let error_text = commit_err.map(|e| e.to_string());
        let result = self
            .update_cache(cache_key, false, |cache| {
                let generation = cache.remove_volume(&node_name, volume_name);
                if let Some(image_id) = image_id {
                    cache.status.last_image_id = Some(image_id.to_string());
                    cache.status.last_written = Some(Utc::now());
                }
                let node = cache.upsert_node(&node_name);
                match error_text.as_ref() {
                    Some(error) => {
                        node.last_error = Some(VolumeError {
                            volume_name: volume_name.to_string(),
                            cache_generation: generation,
                            error: error.clone(),
                            happened: Utc::now(),
                        });
                    }
                    None => {
                        node.last_error = None;
                        if let Some(image_id) = image_id {
                            node.last_image_id = Some(image_id.to_string());
                        }
                    }
                }
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            // The record may have been deleted by an operator meanwhile.
            Err(err) if is_not_found(&err) => {
                log_warn(
                    "sync",
                    "Unregister volume from cluster: cache not found",
                    &[
                        ("cache", &cache_key.to_string()),
                        ("node", node_name.as_str()),
                        ("volume", volume_name),
                    ],
                );
                Ok(())
            }
            Err(err) => Err(with_context(
                err,
                format!("unregister volume {volume_name:?} from cluster"),
            )),
        }
    }

    /// Fetch-modify-update loop with optimistic concurrency; conflicts back
    /// off with a fixed delay for a bounded number of attempts.
    async fn update_cache(
        &self,
        cache_key: &NamespacedName,
        create: bool,
        mut modify: impl FnMut(&mut Cache) -> Result<(), DynError>,
    ) -> Result<(), DynError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut cache = match self.cluster.caches().get(cache_key) {
                Ok(cache) => cache,
                Err(err) if err.is_not_found() && create => {
                    let metadata = ObjectMeta::named(
                        Some(cache_key.namespace.as_str()),
                        cache_key.name.as_str(),
                    );
                    match self.cluster.caches().create(Cache::new(metadata)) {
                        Ok(cache) => cache,
                        Err(err) if err.is_already_exists() => {
                            self.cluster.caches().get(cache_key)?
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            };
            modify(&mut cache)?;
            match self.cluster.caches().update_status(cache) {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() && attempt < CONFLICT_RETRY_STEPS => {
                    tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn is_not_found(err: &DynError) -> bool {
    crate::strata::k8s::client::is_not_found(err)
}

fn add_volume(
    cache: &mut Cache,
    node_name: &str,
    volume_name: &str,
    commit: bool,
) -> Result<(), DynError> {
    if cache.find_volume(node_name, volume_name).is_some() {
        return Err(new_error(format!(
            "volume {volume_name:?} on node {node_name:?} already exists"
        )));
    }
    let commit = commit && !cache.spec.read_only;
    if commit {
        cache.status.cache_generation += 1;
    }
    let generation = cache.status.cache_generation;
    let node = cache.upsert_node(node_name);
    node.volumes.push(CacheVolumeStatus {
        name: volume_name.to_string(),
        cache_generation: generation,
        created: Utc::now(),
        committable: commit,
        commit_start_time: None,
    });
    Ok(())
}

/// Scans for an in-flight commit. A lock older than the commit timeout is
/// abandoned: it is cleared, a timeout error is recorded on its node and
/// the stale volume entry is removed, letting the caller take the slot.
fn reclaim_or_detect_commit(cache: &mut Cache, cache_name: &str) -> bool {
    let now = Utc::now();
    let mut stale: Vec<(String, String, i64)> = Vec::new();
    let mut in_flight = false;
    for node in &cache.status.nodes {
        for volume in &node.volumes {
            let Some(started) = volume.commit_start_time else {
                continue;
            };
            if started + commit_timeout() > now {
                in_flight = true;
            } else {
                stale.push((node.name.clone(), volume.name.clone(), volume.cache_generation));
            }
        }
    }
    for (node_name, volume_name, generation) in stale {
        log_error(
            "sync",
            "Commit timed out - removing its lock from cluster",
            &[
                ("cache", cache_name),
                ("node", node_name.as_str()),
                ("volume", volume_name.as_str()),
            ],
        );
        cache.remove_volume(&node_name, &volume_name);
        if let Some(node) = cache.status.nodes.iter_mut().find(|n| n.name == node_name) {
            node.last_error = Some(VolumeError {
                volume_name,
                cache_generation: Some(generation),
                error: "commit timed out".to_string(),
                happened: now,
            });
        }
    }
    in_flight
}

/// Wraps a node-local cache store with cluster-wide coordination.
pub struct SyncedStore<S: CacheStore> {
    inner: S,
    sync: ClusterSync,
}

impl<S: CacheStore> SyncedStore<S> {
    pub fn new(inner: S, cluster: Arc<Cluster>, node_name: impl Into<String>) -> Self {
        Self {
            inner,
            sync: ClusterSync::new(cluster, node_name),
        }
    }

    fn cache_key(opts: &CacheMountOptions) -> Result<NamespacedName, DynError> {
        if opts.cache_name.is_empty() || opts.cache_namespace.is_empty() {
            return Err(new_error("no cache name or namespace provided"));
        }
        Ok(NamespacedName::new(
            opts.cache_namespace.clone(),
            opts.cache_name.clone(),
        ))
    }
}

impl<S: CacheStore + Sync> CacheStore for SyncedStore<S> {
    async fn mount(
        &self,
        mut opts: CacheMountOptions,
        cancellation: &CancellationToken,
    ) -> Result<PathBuf, DynError> {
        let cache_key = Self::cache_key(&opts)?;
        let volume_name = opts.container_name()?;
        // The effective image is the record's image, not the caller's;
        // readers on other nodes inherit the latest committed generation.
        opts.image = self
            .sync
            .register_cache_volume(&cache_key, &volume_name, &opts.image, true)
            .await?;
        match self.inner.mount(opts, cancellation).await {
            Ok(dir) => Ok(dir),
            Err(err) => {
                let _ = self
                    .sync
                    .unregister_cache_volume(&cache_key, &volume_name, Some(&err), None)
                    .await;
                Err(err)
            }
        }
    }

    async fn unmount(
        &self,
        mut opts: CacheMountOptions,
        cancellation: &CancellationToken,
    ) -> Result<UnmountResult, DynError> {
        let cache_key = Self::cache_key(&opts)?;
        let volume_name = opts.container_name()?;
        let (commit, sync_err) = match self.sync.prepare_commit(&cache_key, &volume_name).await {
            Ok(commit) => (commit, None),
            Err(err) => (false, Some(err)),
        };
        opts.commit = commit;
        if !commit {
            // The loser of the election must not push.
            opts.image = String::new();
        }
        let mut result = self.inner.unmount(opts, cancellation).await;
        if result.is_ok() {
            if let Some(err) = sync_err {
                result = Err(err);
            }
        }
        let (commit_err, image_id) = match &result {
            Ok(unmounted) if unmounted.new_image => (None, Some(unmounted.image_id.as_str())),
            Ok(_) => (None, None),
            Err(err) => (Some(err), None),
        };
        let unregister = self
            .sync
            .unregister_cache_volume(&cache_key, &volume_name, commit_err, image_id)
            .await;
        match (result, unregister) {
            (Err(err), _) => Err(with_context(err, "unmount")),
            (Ok(_), Err(err)) => Err(err),
            (Ok(unmounted), Ok(())) => Ok(unmounted),
        }
    }

    async fn prune(&self, cancellation: &CancellationToken) -> Result<(), DynError> {
        self.inner.prune(cancellation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strata::api::cache::CACHE_PHASE_REJECT;

    fn sync(cluster: &Arc<Cluster>, node: &str) -> ClusterSync {
        ClusterSync::new(cluster.clone(), node)
    }

    fn cache_key() -> NamespacedName {
        NamespacedName::new("default", "mycache")
    }

    #[tokio::test]
    async fn registration_creates_record_and_bumps_generation() {
        let cluster = Cluster::in_memory();
        let sync = sync(&cluster, "node-1");

        let image = sync
            .register_cache_volume(&cache_key(), "v1", "fs/default/mycache:latest", true)
            .await
            .unwrap();
        assert_eq!(image, "fs/default/mycache:latest");

        let cache = cluster.caches().get(&cache_key()).unwrap();
        assert_eq!(cache.status.cache_generation, 1);
        assert_eq!(cache.status.used, 1);
        let volume = cache.find_volume("node-1", "v1").expect("volume registered");
        assert!(volume.committable);
        assert!(volume.commit_start_time.is_none());

        // A second registration of the same volume name on the node fails.
        let err = sync
            .register_cache_volume(&cache_key(), "v1", "", true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn readers_inherit_the_recorded_image() {
        let cluster = Cluster::in_memory();
        let writer = sync(&cluster, "node-1");
        let reader = sync(&cluster, "node-2");

        writer
            .register_cache_volume(&cache_key(), "v1", "registry.example.com/c:latest", true)
            .await
            .unwrap();
        let image = reader
            .register_cache_volume(&cache_key(), "v2", "ignored-default", true)
            .await
            .unwrap();
        assert_eq!(image, "registry.example.com/c:latest");
    }

    #[tokio::test]
    async fn commit_election_grants_exactly_one_writer() {
        let cluster = Cluster::in_memory();
        let a = sync(&cluster, "node-a");
        let b = sync(&cluster, "node-b");
        a.register_cache_volume(&cache_key(), "va", "", true)
            .await
            .unwrap();
        b.register_cache_volume(&cache_key(), "vb", "", true)
            .await
            .unwrap();

        let first = a.prepare_commit(&cache_key(), "va").await.unwrap();
        let second = b.prepare_commit(&cache_key(), "vb").await.unwrap();
        assert!(first);
        assert!(!second, "second writer must lose the election");
    }

    #[tokio::test]
    async fn stale_commit_lock_is_reclaimed() {
        let cluster = Cluster::in_memory();
        let a = sync(&cluster, "node-a");
        let b = sync(&cluster, "node-b");
        a.register_cache_volume(&cache_key(), "va", "", true)
            .await
            .unwrap();
        b.register_cache_volume(&cache_key(), "vb", "", true)
            .await
            .unwrap();
        assert!(a.prepare_commit(&cache_key(), "va").await.unwrap());

        // Age node-a's lock past the commit timeout (node-a crashed).
        let mut cache = cluster.caches().get(&cache_key()).unwrap();
        let volume = cache.find_volume_mut("node-a", "va").unwrap();
        volume.commit_start_time = Some(Utc::now() - commit_timeout() - ChronoDuration::minutes(1));
        cluster.caches().update_status(cache).unwrap();

        // node-b observes the stale lock, reclaims it and takes the slot.
        assert!(b.prepare_commit(&cache_key(), "vb").await.unwrap());
        let cache = cluster.caches().get(&cache_key()).unwrap();
        assert!(cache.find_volume("node-a", "va").is_none(), "stale entry removed");
        let node_a = cache.status.nodes.iter().find(|n| n.name == "node-a").unwrap();
        let error = node_a.last_error.as_ref().expect("timeout error recorded");
        assert_eq!(error.error, "commit timed out");
        assert_eq!(error.volume_name, "va");
    }

    #[tokio::test]
    async fn read_only_and_rejecting_caches_deny_commit() {
        let cluster = Cluster::in_memory();
        let sync = sync(&cluster, "node-1");
        sync.register_cache_volume(&cache_key(), "v1", "", true)
            .await
            .unwrap();

        let mut cache = cluster.caches().get(&cache_key()).unwrap();
        cache.status.phase = CACHE_PHASE_REJECT.to_string();
        cluster.caches().update_status(cache).unwrap();
        assert!(!sync.prepare_commit(&cache_key(), "v1").await.unwrap());

        let mut cache = cluster.caches().get(&cache_key()).unwrap();
        cache.status.phase = String::new();
        let cache = cluster.caches().update_status(cache).unwrap();
        let mut cache = cache;
        cache.spec.read_only = true;
        cluster.caches().update(cache).unwrap();
        assert!(!sync.prepare_commit(&cache_key(), "v1").await.unwrap());
    }

    #[tokio::test]
    async fn read_only_cache_registers_non_committable_volumes() {
        let cluster = Cluster::in_memory();
        let metadata = ObjectMeta::named(Some("default"), "mycache");
        let mut cache = Cache::new(metadata);
        cache.spec.read_only = true;
        cluster.caches().create(cache).unwrap();

        let sync = sync(&cluster, "node-1");
        sync.register_cache_volume(&cache_key(), "v1", "", true)
            .await
            .unwrap();
        let cache = cluster.caches().get(&cache_key()).unwrap();
        assert_eq!(cache.status.cache_generation, 0);
        let volume = cache.find_volume("node-1", "v1").unwrap();
        assert!(!volume.committable);
    }

    #[tokio::test]
    async fn unregister_records_outcome() {
        let cluster = Cluster::in_memory();
        let sync = sync(&cluster, "node-1");
        sync.register_cache_volume(&cache_key(), "v1", "", true)
            .await
            .unwrap();

        sync.unregister_cache_volume(&cache_key(), "v1", None, Some("sha256:abc"))
            .await
            .unwrap();
        let cache = cluster.caches().get(&cache_key()).unwrap();
        assert!(cache.find_volume("node-1", "v1").is_none());
        assert_eq!(cache.status.last_image_id.as_deref(), Some("sha256:abc"));
        assert!(cache.status.last_written.is_some());
        let node = cache.status.nodes.iter().find(|n| n.name == "node-1").unwrap();
        assert_eq!(node.last_image_id.as_deref(), Some("sha256:abc"));
        assert!(node.last_error.is_none());

        // A failed unmount records the error on the node.
        sync.register_cache_volume(&cache_key(), "v2", "", true)
            .await
            .unwrap();
        let failure = new_error("overlay exploded");
        sync.unregister_cache_volume(&cache_key(), "v2", Some(&failure), None)
            .await
            .unwrap();
        let cache = cluster.caches().get(&cache_key()).unwrap();
        let node = cache.status.nodes.iter().find(|n| n.name == "node-1").unwrap();
        assert_eq!(node.last_error.as_ref().unwrap().error, "overlay exploded");
    }

    #[tokio::test]
    async fn unregister_swallows_missing_cache() {
        let cluster = Cluster::in_memory();
        let sync = sync(&cluster, "node-1");
        sync.unregister_cache_volume(&cache_key(), "v1", None, None)
            .await
            .unwrap();
        assert!(!sync.prepare_commit(&cache_key(), "v1").await.unwrap());
    }
}
