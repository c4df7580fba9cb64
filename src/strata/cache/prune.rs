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

use crate::strata::logger::{log_debug, log_info};
use crate::strata::oci::store::{ImageRecord, LayerStore};
use crate::strata::util::error::{new_error, DynError};
use tokio_util::sync::CancellationToken;

/// Removes dangling images and their unreferenced parent chain from the
/// local store. The first error is recorded; remaining images are still
/// visited.
pub fn prune(store: &LayerStore, cancellation: &CancellationToken) -> Result<(), DynError> {
    let dangling: Vec<String> = store
        .images()?
        .into_iter()
        .filter(|image| image.names.is_empty())
        .map(|image| image.id)
        .collect();
    delete_images(store, &dangling, false, cancellation)
}

fn delete_images(
    store: &LayerStore,
    ids: &[String],
    force: bool,
    cancellation: &CancellationToken,
) -> Result<(), DynError> {
    let mut first_error: Option<DynError> = None;
    let mut record_error = |err: DynError| {
        if first_error.is_none() {
            first_error = Some(err);
        }
    };

    for id in ids {
        if cancellation.is_cancelled() {
            break;
        }
        // Resolve the argument to a concrete image: by name first, then by
        // (truncated) ID.
        let mut image = match resolve_image(store, id) {
            Ok(Some(image)) => image,
            Ok(None) => {
                record_error(new_error(format!("could not get image {id:?}")));
                continue;
            }
            Err(err) => {
                record_error(err);
                continue;
            }
        };

        if image.read_only {
            record_error(new_error(format!("can not remove readonly image {id:?}")));
            continue;
        }

        let containers = match store.containers_using_image(&image.id) {
            Ok(containers) => containers,
            Err(err) => {
                record_error(err);
                continue;
            }
        };
        if !containers.is_empty() && image.names.len() <= 1 && !force {
            for container in &containers {
                record_error(new_error(format!(
                    "could not remove image {id:?} (must force) - container {:?} is using its reference image",
                    container.id
                )));
            }
            continue;
        }

        // When a tag was passed, only that name is removed; the image is
        // kept as long as other tags reference it.
        if !image.id.trim_start_matches("sha256:").starts_with(id.trim_start_matches("sha256:")) {
            match untag_image(store, id, &image) {
                Ok(Some(removed)) => {
                    log_info("prune", "Untagged image", &[("name", removed.as_str())]);
                    match store.image(&image.id) {
                        Ok(Some(reloaded)) => image = reloaded,
                        Ok(None) => continue,
                        Err(err) => {
                            record_error(err);
                            continue;
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    record_error(err);
                    continue;
                }
            }
        } else if image.names.len() > 1 && !force {
            record_error(new_error(format!(
                "unable to delete {} (must force) - image is referred to in multiple tags",
                image.id
            )));
            continue;
        }

        if !image.names.is_empty() {
            continue; // still tagged
        }
        let is_parent = match store.is_parent(&image) {
            Ok(is_parent) => is_parent,
            Err(err) => {
                record_error(err);
                continue;
            }
        };
        if is_parent {
            continue; // a child still layers on top of it
        }

        if let Err(err) = remove_image_and_parents(store, &image) {
            record_error(err);
            continue;
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn resolve_image(store: &LayerStore, id: &str) -> Result<Option<ImageRecord>, DynError> {
    if let Some(image) = store.image_by_name(id)? {
        return Ok(Some(image));
    }
    store.image(id)
}

fn untag_image(
    store: &LayerStore,
    name_arg: &str,
    image: &ImageRecord,
) -> Result<Option<String>, DynError> {
    let mut removed = None;
    let mut kept = Vec::with_capacity(image.names.len());
    for name in &image.names {
        if removed.is_none() && matches_reference(name, name_arg) {
            removed = Some(name.clone());
        } else {
            kept.push(name.clone());
        }
    }
    if removed.is_some() {
        store.set_names(&image.id, kept)?;
    }
    Ok(removed)
}

/// Deletes the image, then walks up the parent chain deleting each parent
/// that is untagged and has no other children. Intermediate failures are
/// logged and the walk continues.
fn remove_image_and_parents(store: &LayerStore, image: &ImageRecord) -> Result<(), DynError> {
    let mut parent = store.parent_of(image)?;
    store.delete_image(&image.id)?;
    log_info("prune", "Removed image", &[("imageID", image.id.as_str())]);

    while let Some(current) = parent {
        let next = store.parent_of(&current)?;
        if !current.names.is_empty() || store.is_parent(&current)? {
            return Ok(());
        }
        if let Err(err) = store.delete_image(&current.id) {
            log_debug(
                "prune",
                "Unable to remove intermediate image",
                &[("imageID", current.id.as_str()), ("error", &err.to_string())],
            );
        } else {
            log_info("prune", "Removed image", &[("imageID", current.id.as_str())]);
        }
        parent = next;
    }
    Ok(())
}

fn matches_reference(name: &str, arg: &str) -> bool {
    if arg.is_empty() {
        return true;
    }
    let (name_repo, name_tag) = match name.split_once(':') {
        Some((repo, tag)) => (repo, Some(tag)),
        None => (name, None),
    };
    match arg.split_once(':') {
        Some((arg_repo, arg_tag)) => name_repo.ends_with(arg_repo) && name_tag == Some(arg_tag),
        None => name_repo.ends_with(arg),
    }
}
