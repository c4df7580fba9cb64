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

pub mod manager;
pub mod mount;
pub mod prune;
pub mod umount;

use crate::strata::cache::LayeredCacheStore;
use crate::strata::config::{env_string, Config, Settings, ENV_CACHE_NAME, ENV_CACHE_NAMESPACE, ENV_CONTAINER_NAME};
use crate::strata::k8s::Cluster;
use crate::strata::logger::log_debug;
use crate::strata::oci::{LayerStore, RegistryClient};
use crate::strata::util::error::{new_error, with_context, DynError};
use std::sync::Arc;

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Builds the node-local cache store from the resolved settings.
pub fn new_store(settings: &Settings) -> Result<LayeredCacheStore, DynError> {
    log_debug(
        "cli",
        "Opening layer store",
        &[
            ("root", &settings.storage_root.to_string_lossy()),
            ("runroot", &settings.storage_run_root.to_string_lossy()),
        ],
    );
    let store = LayerStore::open(
        settings.storage_root.clone(),
        settings.storage_run_root.clone(),
    )
    .map_err(|e| {
        with_context(
            e,
            format!("init store at {}", settings.storage_root.display()),
        )
    })?;
    let registry = RegistryClient::new(settings)?;
    Ok(LayeredCacheStore::new(store, registry))
}

/// The embedded cluster store shared with the manager process.
pub fn cluster_handle() -> Result<Arc<Cluster>, DynError> {
    Cluster::open(Config::StateDir.get_path())
}

/// Node name required for cluster-synchronised cache operations.
pub fn require_node_name(settings: &Settings) -> Result<String, DynError> {
    settings
        .node_name
        .clone()
        .ok_or_else(|| new_error("node name has not been specified"))
}

/// The cache namespace: flag, environment, or the mounted service account
/// namespace.
pub fn default_cache_namespace(explicit: Option<&str>) -> String {
    if let Some(namespace) = explicit.filter(|ns| !ns.is_empty()) {
        return namespace.to_string();
    }
    if let Some(namespace) = env_string(ENV_CACHE_NAMESPACE) {
        return namespace;
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .map(|ns| ns.trim().to_string())
        .unwrap_or_default()
}

pub fn default_cache_name(explicit: Option<&str>) -> String {
    explicit
        .filter(|name| !name.is_empty())
        .map(String::from)
        .or_else(|| env_string(ENV_CACHE_NAME))
        .unwrap_or_default()
}

pub fn default_container_name(explicit: Option<&str>) -> String {
    explicit
        .filter(|name| !name.is_empty())
        .map(String::from)
        .or_else(|| env_string(ENV_CONTAINER_NAME))
        .unwrap_or_default()
}
