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

use crate::strata::cli::args::ManagerArgs;
use crate::strata::config::{env_string, Config, ENV_MANAGER_NAMESPACE};
use crate::strata::controller::runtime::ControllerManager;
use crate::strata::k8s::Cluster;
use crate::strata::util::error::{new_error, DynError};
use tokio_util::sync::CancellationToken;

pub async fn run(args: &ManagerArgs, cancellation: &CancellationToken) -> Result<(), DynError> {
    let manager_namespace = args
        .manager_namespace
        .clone()
        .or_else(|| env_string(ENV_MANAGER_NAMESPACE))
        .ok_or_else(|| new_error("no --manager-namespace specified"))?;
    let state_dir = args
        .state_dir
        .as_deref()
        .map(Config::normalize_path)
        .unwrap_or_else(|| Config::StateDir.get_path());

    let cluster = Cluster::open(state_dir)?;
    let manager = ControllerManager::new(cluster, manager_namespace)?;
    manager.run(cancellation.clone()).await
}
