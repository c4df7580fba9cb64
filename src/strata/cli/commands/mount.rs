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

use crate::strata::cache::{CacheMountOptions, CacheStore, SyncedStore};
use crate::strata::cli::args::MountArgs;
use crate::strata::cli::commands::{
    cluster_handle, default_cache_name, default_cache_namespace, default_container_name,
    new_store, require_node_name,
};
use crate::strata::config::Settings;
use crate::strata::util::error::{new_error, with_context, DynError};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

pub async fn run(
    args: &MountArgs,
    settings: &Settings,
    cancellation: &CancellationToken,
) -> Result<(), DynError> {
    let opts = CacheMountOptions {
        cache_name: default_cache_name(args.name.as_deref()),
        cache_namespace: default_cache_namespace(args.namespace.as_deref()),
        image: args.image.clone().unwrap_or_default(),
        container_name: default_container_name(args.container_name.as_deref()),
        ext_mount_dir: args.path.clone().unwrap_or_default(),
        commit: args.commit,
    };

    let store = new_store(settings)?;
    let dir = if settings.enable_k8s_sync {
        let node_name = require_node_name(settings)?;
        let cluster = cluster_handle().map_err(|e| with_context(e, "cannot enable k8s sync"))?;
        let synced = SyncedStore::new(store, cluster, node_name);
        synced.mount(opts, cancellation).await?
    } else {
        store.mount(opts, cancellation).await?
    };

    if let Some(mode) = args.mode.as_deref() {
        apply_mode(&dir, mode)?;
    }
    println!("{}", dir.display());
    Ok(())
}

fn apply_mode(dir: &PathBuf, mode: &str) -> Result<(), DynError> {
    let parsed = u32::from_str_radix(mode, 8)
        .map_err(|_| new_error(format!("invalid mode {mode:?}, expected octal permissions")))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(parsed))
        .map_err(|e| with_context(e, format!("chmod {} to {mode}", dir.display())))
}
