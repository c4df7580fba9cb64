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

use crate::strata::api::provisioner::{EnvMapping, NodePath, StorageProvisioner, WorkerContainer};
use crate::strata::k8s::meta::{glob_match, NamespacedName, ObjectMeta};
use crate::strata::k8s::pod::{EnvVar, Pod, PodSpec};
use crate::strata::template::Substitution;
use crate::strata::util::error::{new_error, with_context, DynError};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Values substituted into provisioner templates.
pub struct ProvisionerParams {
    pub node_name: String,
    pub node_path: String,
    pub persistent_volume_name: String,
    pub claim: NamespacedName,
}

/// Expands the recognised `${STORAGE_*}` placeholders throughout a
/// provisioner definition.
pub fn substitute_provisioner_placeholders(
    provisioner: &StorageProvisioner,
    params: &ProvisionerParams,
) -> Result<StorageProvisioner, DynError> {
    let values: HashMap<String, String> = [
        ("STORAGE_NODE_NAME", params.node_name.as_str()),
        ("STORAGE_NODE_PATH", params.node_path.as_str()),
        ("STORAGE_PV_NAME", params.persistent_volume_name.as_str()),
        ("STORAGE_PVC_NAME", params.claim.name.as_str()),
        ("STORAGE_PVC_NAMESPACE", params.claim.namespace.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let substitution = Substitution::new("provisioner template", values);
    substitution.substitute_object(provisioner).map_err(|e| {
        with_context(
            e,
            format!("invalid provisioner template {}", provisioner.spec.name),
        )
    })
}

/// Resolves the host storage root for a node by first-match glob lookup.
pub fn storage_root_path_for_node(node_name: &str, mapping: &[NodePath]) -> Result<String, DynError> {
    for (index, entry) in mapping.iter().enumerate() {
        let matched = glob_match(&entry.name, node_name).map_err(|_| {
            new_error(format!(
                "invalid node name matcher specified in spec.nodes[{index}].name"
            ))
        })?;
        if matched {
            return Ok(entry.path.clone());
        }
    }
    Err(new_error(format!(
        "no storage root path mapped for node {node_name:?}"
    )))
}

/// Maps required/optional annotation values on an owner object to env vars.
/// Missing required annotations surface the first violation while still
/// returning the resolvable part of the environment.
pub fn annotations_to_env(
    meta: &ObjectMeta,
    mapping: &[EnvMapping],
) -> (Vec<EnvVar>, Option<DynError>) {
    let mut env = Vec::with_capacity(mapping.len());
    let mut first_err = None;
    for entry in mapping {
        let value = meta.annotation(&entry.annotation).unwrap_or_default();
        if !value.is_empty() {
            env.push(EnvVar::new(entry.name.clone(), value));
        } else if entry.is_required() && first_err.is_none() {
            first_err = Some(new_error(format!(
                "missing or empty annotation {:?}",
                entry.annotation
            )));
        }
    }
    (env, first_err)
}

/// Copies the annotation values named by the env mapping from one object to
/// another (forwarding claim annotations onto pods and volumes).
pub fn copy_annotations(src: &ObjectMeta, dest: &mut ObjectMeta, mapping: &[EnvMapping]) {
    for entry in mapping {
        if let Some(value) = src.annotation(&entry.annotation) {
            dest.annotations
                .insert(entry.annotation.clone(), value.to_string());
        }
    }
}

/// Source data for one worker pod built from a substituted provisioner.
pub struct PodSource<'a> {
    pub pod_name: NamespacedName,
    pub container_name: &'a str,
    pub substituted_provisioner: &'a StorageProvisioner,
    pub container: &'a WorkerContainer,
    pub env: Vec<EnvVar>,
}

const TEMPLATE_CONTAINER: &str = "main";

/// Builds the worker pod from the provisioner's pod template, merging the
/// configured container command and environment into the template's `main`
/// container and renaming it.
pub fn new_worker_pod(src: PodSource<'_>) -> Result<Pod, DynError> {
    let provisioner_name = &src.substituted_provisioner.spec.name;
    let mut spec: PodSpec = src.substituted_provisioner.spec.pod_template.clone();
    let container = spec
        .containers
        .iter_mut()
        .find(|c| c.name == TEMPLATE_CONTAINER)
        .ok_or_else(|| {
            new_error(format!(
                "provisioner {provisioner_name} pod template does not contain a {TEMPLATE_CONTAINER} container"
            ))
        })?;
    container.name = src.container_name.to_string();
    let mut env = container.env.clone();
    env.extend(src.container.env.iter().cloned());
    env.extend(src.env);
    container.env = unique_env(env);
    if !src.container.command.is_empty() {
        container.command = src.container.command.clone();
    }
    if container.image.as_deref().unwrap_or_default().is_empty() {
        return Err(new_error(format!(
            "provisioner {provisioner_name} pod template does not specify an image for the {TEMPLATE_CONTAINER} container"
        )));
    }
    if container.command.is_empty() {
        return Err(new_error(format!(
            "provisioner {provisioner_name} pod template does not specify a command for the {TEMPLATE_CONTAINER} container"
        )));
    }
    if !container.args.is_empty() {
        return Err(new_error(format!(
            "provisioner {provisioner_name} pod template specifies args for the {TEMPLATE_CONTAINER} container"
        )));
    }

    let metadata = ObjectMeta::named(
        Some(src.pod_name.namespace.as_str()),
        src.pod_name.name.as_str(),
    );
    Ok(Pod::new(metadata, spec))
}

/// Deduplicates env vars by name (last wins) and sorts them by name.
fn unique_env(env: Vec<EnvVar>) -> Vec<EnvVar> {
    let mut by_name: HashMap<String, EnvVar> = HashMap::with_capacity(env.len());
    for var in env {
        by_name.insert(var.name.clone(), var);
    }
    let mut names: Vec<String> = by_name.keys().cloned().collect();
    names.sort();
    names
        .into_iter()
        .map(|name| by_name.remove(&name).expect("name collected above"))
        .collect()
}

/// Validates that a node path is an absolute proper sub-directory
/// (path != "/", dirname(path) != path).
pub fn validate_node_path(path: &str) -> Result<(), DynError> {
    let cleaned: PathBuf = Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();
    if !cleaned.is_absolute() || cleaned.parent().map(Path::as_os_str).is_none() {
        return Err(new_error(format!(
            "path must be an absolute sub directory but is {path:?}"
        )));
    }
    Ok(())
}
