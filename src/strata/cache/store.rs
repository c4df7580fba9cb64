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

use crate::strata::logger::{log_debug, log_info, log_warn};
use crate::strata::oci::mount::mounter;
use crate::strata::oci::reference::{local_cache_reference, parse_image_reference, ImageReference};
use crate::strata::oci::store::{Container, ImageRecord, LayerStore, ARG_MOUNT_DIR};
use crate::strata::oci::RegistryClient;
use crate::strata::util::error::{new_error, with_context, DynError};
use rand::RngCore;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Options shared by mount and unmount.
#[derive(Debug, Clone, Default)]
pub struct CacheMountOptions {
    pub cache_name: String,
    pub cache_namespace: String,
    pub image: String,
    pub container_name: String,
    pub ext_mount_dir: String,
    pub commit: bool,
}

impl CacheMountOptions {
    pub fn validate(&self) -> Result<(), DynError> {
        if self.image.is_empty() && self.cache_name.is_empty() {
            return Err(new_error("neither cache name nor image specified"));
        }
        if !self.ext_mount_dir.is_empty() && !Path::new(&self.ext_mount_dir).is_absolute() {
            return Err(new_error(format!(
                "non-absolute mount path {:?} provided",
                self.ext_mount_dir
            )));
        }
        Ok(())
    }

    /// The container name: the explicit value, else the last path component
    /// of the external mount dir.
    pub fn container_name(&self) -> Result<String, DynError> {
        if !self.container_name.is_empty() {
            return Ok(self.container_name.clone());
        }
        if !self.ext_mount_dir.is_empty() {
            let name = Path::new(&self.ext_mount_dir)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name.is_empty() || name == "." || name == ".." || name == "/" {
                return Err(new_error(format!(
                    "cannot derive container name from provided mount path {:?}, requires sub directory",
                    self.ext_mount_dir
                )));
            }
            return Ok(name);
        }
        Ok(String::new())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnmountResult {
    pub image_id: String,
    pub new_image: bool,
}

/// Node-local cache volume engine.
pub trait CacheStore {
    fn mount(
        &self,
        opts: CacheMountOptions,
        cancellation: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<PathBuf, DynError>> + Send;

    fn unmount(
        &self,
        opts: CacheMountOptions,
        cancellation: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<UnmountResult, DynError>> + Send;

    fn prune(
        &self,
        cancellation: &CancellationToken,
    ) -> impl std::future::Future<Output = Result<(), DynError>> + Send;
}

/// Creates a writable overlay container from an image, mounts it, tracks
/// changes, commits and pushes.
pub struct LayeredCacheStore {
    store: LayerStore,
    registry: RegistryClient,
}

impl LayeredCacheStore {
    pub fn new(store: LayerStore, registry: RegistryClient) -> Self {
        Self { store, registry }
    }

    pub fn layer_store(&self) -> &LayerStore {
        &self.store
    }

    /// The store-local reference a cache commits to.
    fn local_reference(&self, opts: &CacheMountOptions) -> Result<ImageReference, DynError> {
        if !opts.cache_name.is_empty() && !opts.cache_namespace.is_empty() {
            return local_cache_reference(&opts.cache_namespace, &opts.cache_name);
        }
        parse_image_reference(&opts.image)
    }

    /// Resolves the base image for a new cache container: a pull when the
    /// caller supplied an external reference, the local store otherwise,
    /// scratch as the fallback.
    async fn resolve_base_image(
        &self,
        opts: &CacheMountOptions,
        cancellation: &CancellationToken,
    ) -> Result<Option<ImageRecord>, DynError> {
        if !opts.image.is_empty() {
            let reference = parse_image_reference(&opts.image)?;
            match self.registry.pull(&self.store, &reference, cancellation).await {
                Ok(record) => return Ok(Some(record)),
                Err(err) => {
                    if let Some(local) = self.store.image_by_name(&reference.name())? {
                        log_warn(
                            "cache",
                            "Using local image since pull failed",
                            &[
                                ("image", opts.image.as_str()),
                                ("error", &err.to_string()),
                            ],
                        );
                        return Ok(Some(local));
                    }
                    log_info(
                        "cache",
                        "Creating empty cache since image does not exist",
                        &[("image", opts.image.as_str())],
                    );
                    return Ok(None);
                }
            }
        }
        let reference = self.local_reference(opts)?;
        let local = self.store.image_by_name(&reference.name())?;
        if local.is_none() {
            log_info(
                "cache",
                "Creating empty cache since image does not exist",
                &[("image", &reference.name())],
            );
        }
        Ok(local)
    }

    fn open_container(
        &self,
        opts: &CacheMountOptions,
        name: &str,
    ) -> Result<Option<Container>, DynError> {
        if let Some(container) = self.store.container_by_name(name)? {
            return Ok(Some(container));
        }
        if !opts.ext_mount_dir.is_empty() {
            return self.store.container_by_path(&opts.ext_mount_dir);
        }
        Ok(None)
    }
}

impl CacheStore for LayeredCacheStore {
    async fn mount(
        &self,
        opts: CacheMountOptions,
        cancellation: &CancellationToken,
    ) -> Result<PathBuf, DynError> {
        opts.validate()?;
        let mut name = opts.container_name()?;
        if name.is_empty() {
            name = generated_container_name();
        }

        let mut ext_dir_created = false;
        let result = async {
            if !opts.ext_mount_dir.is_empty() {
                // Mode 0000 keeps other processes out of the mount point
                // until setup finished.
                fs::create_dir(&opts.ext_mount_dir).map_err(|e| {
                    with_context(e, format!("create mount dir {}", opts.ext_mount_dir))
                })?;
                fs::set_permissions(&opts.ext_mount_dir, fs::Permissions::from_mode(0o000))
                    .map_err(|e| {
                        with_context(e, format!("chmod mount dir {}", opts.ext_mount_dir))
                    })?;
                ext_dir_created = true;
            }

            let image = self.resolve_base_image(&opts, cancellation).await?;
            if let Some(image) = image.as_ref() {
                log_info(
                    "cache",
                    "Mounting cache container",
                    &[("container", name.as_str()), ("imageID", image.id.as_str())],
                );
            } else {
                log_info(
                    "cache",
                    "Mounting cache container",
                    &[("container", name.as_str()), ("imageID", "scratch")],
                );
            }

            let mut container = self.store.create_container(&name, image.as_ref())?;
            let mount_result = async {
                let dir = self.store.mount_container(&mut container)?;
                if opts.ext_mount_dir.is_empty() {
                    return Ok(dir);
                }
                container
                    .args
                    .insert(ARG_MOUNT_DIR.to_string(), opts.ext_mount_dir.clone());
                self.store.save_container(&container)?;
                log_debug(
                    "cache",
                    "Binding container dir to external mount path",
                    &[
                        ("dir", &dir.to_string_lossy()),
                        ("target", opts.ext_mount_dir.as_str()),
                    ],
                );
                mounter().bind_mount(&dir, Path::new(&opts.ext_mount_dir))?;
                Ok(PathBuf::from(&opts.ext_mount_dir))
            }
            .await;
            match mount_result {
                Ok(dir) => Ok(dir),
                Err(err) => {
                    let _ = self.store.unmount_container(&mut container);
                    let _ = self.store.delete_container(&container);
                    Err(err)
                }
            }
        }
        .await;

        if result.is_err() && ext_dir_created {
            let _ = fs::remove_dir(&opts.ext_mount_dir);
        }
        result
    }

    async fn unmount(
        &self,
        opts: CacheMountOptions,
        cancellation: &CancellationToken,
    ) -> Result<UnmountResult, DynError> {
        opts.validate()?;
        if opts.container_name.is_empty() && opts.ext_mount_dir.is_empty() {
            return Err(new_error("neither container name nor mount path provided"));
        }
        let name = opts.container_name()?;

        let mut first_err: Option<DynError> = None;
        if !opts.ext_mount_dir.is_empty() {
            if let Err(err) = unmount_and_delete(&opts.ext_mount_dir) {
                first_err = Some(err);
            }
        }

        let Some(mut container) = self.open_container(&opts, &name)? else {
            // Already unmounted and deleted; repeating the call is fine.
            log_debug(
                "cache",
                "Cache container already gone",
                &[("container", name.as_str())],
            );
            return match first_err {
                Some(err) => Err(err),
                None => Ok(UnmountResult::default()),
            };
        };
        if let Some(saved_dir) = container.args.get(ARG_MOUNT_DIR).cloned() {
            if !saved_dir.is_empty() && saved_dir != opts.ext_mount_dir {
                if let Err(err) = unmount_and_delete(&saved_dir) {
                    first_err.get_or_insert(err);
                }
            }
        }

        if let Err(err) = self.store.unmount_container(&mut container) {
            first_err.get_or_insert(err);
        }

        let outcome = if first_err.is_none() && opts.commit {
            self.commit_container(&opts, &container, cancellation).await
        } else {
            match first_err.take() {
                Some(err) => Err(err),
                None => Ok(UnmountResult::default()),
            }
        };

        // The container (and with it the overlay data) is only deleted when
        // the operation was not cancelled, so an interrupted commit can be
        // retried without data loss.
        if !cancellation.is_cancelled() {
            log_debug(
                "cache",
                "Deleting container",
                &[("container", container.id.as_str())],
            );
            if let Err(err) = self.store.delete_container(&container) {
                if outcome.is_ok() {
                    return Err(err);
                }
            }
        }
        outcome
    }

    async fn prune(&self, cancellation: &CancellationToken) -> Result<(), DynError> {
        crate::strata::cache::prune::prune(&self.store, cancellation)
    }
}

impl LayeredCacheStore {
    async fn commit_container(
        &self,
        opts: &CacheMountOptions,
        container: &Container,
        cancellation: &CancellationToken,
    ) -> Result<UnmountResult, DynError> {
        let changes = self.store.changes(container)?;
        if changes.is_empty() {
            if let Some(image_id) = container.image_id.as_deref() {
                log_info(
                    "cache",
                    "Skipping commit since nothing changed",
                    &[("container", container.name.as_str()), ("imageID", image_id)],
                );
                return Ok(UnmountResult {
                    image_id: image_id.to_string(),
                    new_image: false,
                });
            }
        }
        for change in &changes {
            log_info(
                "cache",
                "Path changed",
                &[
                    ("path", change.path.as_str()),
                    ("kind", change.kind.as_str()),
                ],
            );
        }

        let local_ref = self.local_reference(opts)?;
        let image_id = self
            .store
            .commit(container, &local_ref)
            .map_err(|e| with_context(e, "commit"))?;
        let log_msg = if changes.is_empty() {
            "Created new empty image"
        } else {
            "Created new image from volume"
        };
        log_info(
            "cache",
            log_msg,
            &[
                ("container", container.name.as_str()),
                ("image", &local_ref.name()),
                ("imageID", image_id.as_str()),
            ],
        );

        if !opts.image.is_empty() {
            let remote_ref = parse_image_reference(&opts.image)?;
            let image = self
                .store
                .image(&image_id)?
                .ok_or_else(|| new_error(format!("committed image {image_id} not found")))?;
            self.registry
                .push(&self.store, &image, &remote_ref, cancellation)
                .await?;
        }

        Ok(UnmountResult {
            image_id,
            new_image: true,
        })
    }
}

fn unmount_and_delete(dir: &str) -> Result<(), DynError> {
    log_debug("cache", "Unmounting cache", &[("dir", dir)]);
    let unmount_err = mounter().unmount(Path::new(dir)).err();
    if let Err(err) = fs::remove_dir(dir) {
        if err.kind() != ErrorKind::NotFound {
            if let Some(unmount_err) = unmount_err {
                log_warn(
                    "cache",
                    "Unmount failed",
                    &[("dir", dir), ("error", &unmount_err.to_string())],
                );
            }
            return Err(with_context(err, format!("remove mount dir {dir}")));
        }
    }
    Ok(())
}

fn generated_container_name() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("cache-{suffix}")
}
