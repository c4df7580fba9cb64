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

use crate::strata::config::{
    env_bool, env_string, Config, Settings, ENV_DEBUG, ENV_ENABLE_K8S_SYNC,
    ENV_INSECURE_SKIP_TLS_VERIFY, ENV_NODE_NAME, ENV_REGISTRY, ENV_REGISTRY_PASSWORD,
    ENV_REGISTRY_USERNAME,
};
use clap::{Args, Parser, Subcommand};

/// A distributed, layered, container-storage-backed cache for clusters.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Strata {
    /// Enables debug log (STRATA_DEBUG)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Sets the storage root directory (STRATA_STORAGE_ROOT)
    #[arg(long, global = true)]
    pub storage_root: Option<String>,

    /// Sets the storage state directory (STRATA_STORAGE_RUNROOT)
    #[arg(long, global = true)]
    pub storage_runroot: Option<String>,

    /// Sets the registry (STRATA_REGISTRY)
    #[arg(long, global = true)]
    pub registry: Option<String>,

    /// Registry basic auth user (STRATA_REGISTRY_USERNAME)
    #[arg(long, global = true)]
    pub registry_username: Option<String>,

    /// Registry basic auth password (STRATA_REGISTRY_PASSWORD)
    #[arg(long, global = true)]
    pub registry_password: Option<String>,

    /// Skips registry TLS verification (STRATA_INSECURE_SKIP_TLS_VERIFY)
    #[arg(long, global = true)]
    pub insecure_skip_tls_verify: bool,

    /// Synchronizes cache operations with a cluster Cache resource
    /// (STRATA_ENABLE_K8S_SYNC)
    #[arg(long, global = true)]
    pub enable_k8s_sync: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Mount a cache image to a directory
    Mount(MountArgs),

    /// Unmount a cache directory and optionally publish it as new image
    Umount(UmountArgs),

    /// Remove dangling images from the local store
    Prune,

    /// Run the storage control plane
    Manager(ManagerArgs),
}

#[derive(Args)]
pub struct MountArgs {
    /// The directory to mount the cache at
    #[arg(value_name = "PATH")]
    pub path: Option<String>,

    /// Sets the cache's name (STRATA_CACHE_NAME)
    #[arg(long)]
    pub name: Option<String>,

    /// Sets the cache's namespace (STRATA_CACHE_NAMESPACE)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Sets the cache image name
    #[arg(long)]
    pub image: Option<String>,

    /// Sets the name of the cache container (otherwise derived from the
    /// mount path)
    #[arg(long)]
    pub container_name: Option<String>,

    /// Commits the container to a new image on unmount if contents changed
    #[arg(long)]
    pub commit: bool,

    /// Octal permissions applied to the mounted directory
    #[arg(long)]
    pub mode: Option<String>,
}

#[derive(Args)]
pub struct UmountArgs {
    /// The mounted directory
    #[arg(value_name = "PATH")]
    pub path: Option<String>,

    /// Sets the cache's name (STRATA_CACHE_NAME)
    #[arg(long)]
    pub name: Option<String>,

    /// Sets the cache's namespace (STRATA_CACHE_NAMESPACE)
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Sets the cache image name
    #[arg(long)]
    pub image: Option<String>,

    /// Sets the name of the cache container (otherwise derived from the
    /// mount path)
    #[arg(long)]
    pub container_name: Option<String>,

    /// Commits the container to a new image if contents changed
    #[arg(long)]
    pub commit: bool,
}

#[derive(Args)]
pub struct ManagerArgs {
    /// The namespace provisioner pods run in (STRATA_MANAGER_NAMESPACE)
    #[arg(long)]
    pub manager_namespace: Option<String>,

    /// Directory backing the embedded cluster state store (STRATA_STATE_DIR)
    #[arg(long)]
    pub state_dir: Option<String>,
}

/// Merges root flags over their mirrored environment variables; a flag
/// always wins.
pub fn resolve_settings(cli: &Strata) -> Settings {
    Settings {
        debug: cli.debug || env_bool(ENV_DEBUG),
        storage_root: cli
            .storage_root
            .as_deref()
            .map(Config::normalize_path)
            .unwrap_or_else(|| Config::StorageRoot.get_path()),
        storage_run_root: cli
            .storage_runroot
            .as_deref()
            .map(Config::normalize_path)
            .unwrap_or_else(|| Config::StorageRunRoot.get_path()),
        registry: cli.registry.clone().or_else(|| env_string(ENV_REGISTRY)),
        registry_username: cli
            .registry_username
            .clone()
            .or_else(|| env_string(ENV_REGISTRY_USERNAME)),
        registry_password: cli
            .registry_password
            .clone()
            .or_else(|| env_string(ENV_REGISTRY_PASSWORD)),
        insecure_skip_tls_verify: cli.insecure_skip_tls_verify
            || env_bool(ENV_INSECURE_SKIP_TLS_VERIFY),
        enable_k8s_sync: cli.enable_k8s_sync || env_bool(ENV_ENABLE_K8S_SYNC),
        node_name: env_string(ENV_NODE_NAME),
    }
}
