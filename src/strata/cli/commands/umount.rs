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
use crate::strata::cli::args::UmountArgs;
use crate::strata::cli::commands::{
    cluster_handle, default_cache_name, default_cache_namespace, default_container_name,
    new_store, require_node_name,
};
use crate::strata::config::Settings;
use crate::strata::util::error::{with_context, DynError};
use tokio_util::sync::CancellationToken;

pub async fn run(
    args: &UmountArgs,
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
    let result = if settings.enable_k8s_sync {
        let node_name = require_node_name(settings)?;
        let cluster = cluster_handle().map_err(|e| with_context(e, "cannot enable k8s sync"))?;
        let synced = SyncedStore::new(store, cluster, node_name);
        synced.unmount(opts, cancellation).await?
    } else {
        store.unmount(opts, cancellation).await?
    };

    if !result.image_id.is_empty() && result.new_image {
        println!("{}", result.image_id);
    }
    Ok(())
}
