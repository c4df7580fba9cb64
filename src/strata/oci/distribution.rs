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

use crate::strata::config::Settings;
use crate::strata::logger::{log_info, log_warn};
use crate::strata::oci::image::{
    ImageIndex, OciManifest, MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST,
};
use crate::strata::oci::reference::ImageReference;
use crate::strata::oci::store::{sha256_digest, ImageRecord, LayerStore};
use crate::strata::util::error::{new_error, with_context, DynError};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const PUSH_MAX_RETRY: usize = 10;
const PUSH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Directory-backed stand-in for a remote registry, enabling hermetic
/// environments and tests.
pub fn fake_registry_root() -> Option<PathBuf> {
    env::var("STRATA_FAKE_REGISTRY")
        .ok()
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// OCI distribution client used for cache image pull and push.
pub struct RegistryClient {
    client: Client,
    username: Option<String>,
    password: Option<String>,
    fake_root: Option<PathBuf>,
}

impl RegistryClient {
    pub fn new(settings: &Settings) -> Result<Self, DynError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(settings.insecure_skip_tls_verify)
            .build()
            .map_err(|e| with_context(e, "build registry client"))?;
        Ok(Self {
            client,
            username: settings.registry_username.clone(),
            password: settings.registry_password.clone(),
            fake_root: fake_registry_root(),
        })
    }

    /// Test constructor: route pulls and pushes through a directory.
    pub fn with_fake_root(fake_root: PathBuf) -> Self {
        Self {
            client: Client::new(),
            username: None,
            password: None,
            fake_root: Some(fake_root),
        }
    }

    fn auth_header(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or_default();
        Some(format!(
            "Basic {}",
            BASE64.encode(format!("{username}:{password}"))
        ))
    }

    fn url(&self, reference: &ImageReference, path: &str) -> String {
        format!(
            "https://{}/v2/{}/{}",
            reference.registry, reference.repository, path
        )
    }

    /// Pulls the referenced image into the local store (policy Always) and
    /// returns the recorded image.
    pub async fn pull(
        &self,
        store: &LayerStore,
        reference: &ImageReference,
        cancellation: &CancellationToken,
    ) -> Result<ImageRecord, DynError> {
        if let Some(fake_root) = self.fake_root.as_ref() {
            return pull_from_fake_registry(store, reference, fake_root);
        }

        let manifest_ref = reference
            .digest
            .clone()
            .unwrap_or_else(|| reference.tag_or_default().to_string());
        let (manifest, manifest_bytes) = self
            .fetch_manifest(reference, &manifest_ref, cancellation)
            .await?;
        if manifest.config.media_type != MEDIA_TYPE_CONFIG {
            return Err(new_error(format!(
                "unsupported config media type {}",
                manifest.config.media_type
            )));
        }
        let manifest_digest = store.write_blob(&manifest_bytes)?;

        self.download_blob(store, reference, &manifest.config.digest, cancellation)
            .await?;
        for layer in &manifest.layers {
            let excerpt = layer.digest.get(7..19).unwrap_or(&layer.digest);
            log_info(
                "registry",
                "Fetching layer",
                &[("digest", layer.digest.as_str()), ("excerpt", excerpt)],
            );
            self.download_blob(store, reference, &layer.digest, cancellation)
                .await?;
            store.extract_layer(&layer.digest)?;
        }

        let record =
            store.record_image(&manifest.config.digest, &manifest_digest, Some(&reference.name()))?;
        store.tag_ref(reference, &manifest_digest)?;
        Ok(record)
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        manifest_ref: &str,
        cancellation: &CancellationToken,
    ) -> Result<(OciManifest, Vec<u8>), DynError> {
        let bytes = self
            .get_manifest_bytes(reference, manifest_ref, cancellation)
            .await?;
        if let Ok(index) = serde_json::from_slice::<ImageIndex>(&bytes) {
            if index.media_type == MEDIA_TYPE_INDEX
                || bytes_look_like_index(&index)
            {
                let digest = pick_platform_manifest(&index)?;
                let bytes = self
                    .get_manifest_bytes(reference, &digest, cancellation)
                    .await?;
                let manifest: OciManifest = serde_json::from_slice(&bytes)
                    .map_err(|e| with_context(e, "parse image manifest"))?;
                return Ok((manifest, bytes));
            }
        }
        let manifest: OciManifest =
            serde_json::from_slice(&bytes).map_err(|e| with_context(e, "parse image manifest"))?;
        Ok((manifest, bytes))
    }

    async fn get_manifest_bytes(
        &self,
        reference: &ImageReference,
        manifest_ref: &str,
        cancellation: &CancellationToken,
    ) -> Result<Vec<u8>, DynError> {
        if cancellation.is_cancelled() {
            return Err(new_error("registry pull cancelled"));
        }
        let url = self.url(reference, &format!("manifests/{manifest_ref}"));
        let mut request = self.client.get(&url).header(
            ACCEPT,
            format!("{MEDIA_TYPE_MANIFEST}, {MEDIA_TYPE_INDEX}"),
        );
        if let Some(auth) = self.auth_header() {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request
            .send()
            .await
            .map_err(|e| with_context(e, format!("fetch manifest {url}")))?;
        if !response.status().is_success() {
            return Err(new_error(format!(
                "fetch manifest {url}: HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| with_context(e, format!("read manifest {url}")))?;
        Ok(bytes.to_vec())
    }

    async fn download_blob(
        &self,
        store: &LayerStore,
        reference: &ImageReference,
        digest: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), DynError> {
        if store.has_blob(digest) {
            return Ok(());
        }
        if cancellation.is_cancelled() {
            return Err(new_error("registry pull cancelled"));
        }
        let url = self.url(reference, &format!("blobs/{digest}"));
        let mut request = self.client.get(&url);
        if let Some(auth) = self.auth_header() {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request
            .send()
            .await
            .map_err(|e| with_context(e, format!("fetch blob {url}")))?;
        if !response.status().is_success() {
            return Err(new_error(format!(
                "fetch blob {url}: HTTP {}",
                response.status()
            )));
        }
        let data = response
            .bytes()
            .await
            .map_err(|e| with_context(e, format!("read blob {url}")))?;
        let actual = sha256_digest(&data)?;
        if actual != digest {
            return Err(new_error(format!(
                "blob digest mismatch for {digest}: got {actual}"
            )));
        }
        store.write_blob(&data)?;
        Ok(())
    }

    /// Pushes a committed image to the registry, retrying transient
    /// failures with a fixed delay.
    pub async fn push(
        &self,
        store: &LayerStore,
        image: &ImageRecord,
        reference: &ImageReference,
        cancellation: &CancellationToken,
    ) -> Result<(), DynError> {
        log_info(
            "registry",
            "Pushing cache image to registry",
            &[("image", &reference.to_string()), ("imageID", &image.id)],
        );
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.push_once(store, image, reference, cancellation).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if cancellation.is_cancelled() || attempt >= PUSH_MAX_RETRY {
                        return Err(with_context(err, "push image"));
                    }
                    let attempt_text = attempt.to_string();
                    log_warn(
                        "registry",
                        "Push failed; retrying",
                        &[
                            ("attempt", attempt_text.as_str()),
                            ("error", &err.to_string()),
                        ],
                    );
                    tokio::time::sleep(PUSH_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn push_once(
        &self,
        store: &LayerStore,
        image: &ImageRecord,
        reference: &ImageReference,
        cancellation: &CancellationToken,
    ) -> Result<(), DynError> {
        if let Some(fake_root) = self.fake_root.as_ref() {
            return push_to_fake_registry(store, image, reference, fake_root);
        }
        let manifest = store.manifest(image)?;
        let mut digests: Vec<String> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
        digests.push(manifest.config.digest.clone());
        for digest in &digests {
            if cancellation.is_cancelled() {
                return Err(new_error("registry push cancelled"));
            }
            self.upload_blob(store, reference, digest).await?;
        }

        let manifest_bytes = store.read_blob(&image.manifest_digest)?;
        let url = self.url(
            reference,
            &format!("manifests/{}", reference.tag_or_default()),
        );
        let mut request = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, MEDIA_TYPE_MANIFEST)
            .body(manifest_bytes);
        if let Some(auth) = self.auth_header() {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request
            .send()
            .await
            .map_err(|e| with_context(e, format!("put manifest {url}")))?;
        if !response.status().is_success() {
            return Err(new_error(format!(
                "put manifest {url}: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn upload_blob(
        &self,
        store: &LayerStore,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<(), DynError> {
        let head_url = self.url(reference, &format!("blobs/{digest}"));
        let mut head = self.client.head(&head_url);
        if let Some(auth) = self.auth_header() {
            head = head.header(AUTHORIZATION, auth);
        }
        let response = head
            .send()
            .await
            .map_err(|e| with_context(e, format!("check blob {head_url}")))?;
        if response.status() == StatusCode::OK {
            return Ok(()); // registry already has the blob
        }

        let start_url = self.url(reference, "blobs/uploads/");
        let mut start = self.client.post(&start_url);
        if let Some(auth) = self.auth_header() {
            start = start.header(AUTHORIZATION, auth);
        }
        let response = start
            .send()
            .await
            .map_err(|e| with_context(e, format!("start blob upload {start_url}")))?;
        if !response.status().is_success() {
            return Err(new_error(format!(
                "start blob upload {start_url}: HTTP {}",
                response.status()
            )));
        }
        let location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| new_error("blob upload response is missing a Location header"))?
            .to_string();
        let separator = if location.contains('?') { '&' } else { '?' };
        let upload_url = if location.starts_with("http") {
            format!("{location}{separator}digest={digest}")
        } else {
            format!("https://{}{location}{separator}digest={digest}", reference.registry)
        };

        let data = store.read_blob(digest)?;
        let mut put = self
            .client
            .put(&upload_url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data);
        if let Some(auth) = self.auth_header() {
            put = put.header(AUTHORIZATION, auth);
        }
        let response = put
            .send()
            .await
            .map_err(|e| with_context(e, format!("upload blob {digest}")))?;
        if !response.status().is_success() {
            return Err(new_error(format!(
                "upload blob {digest}: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

fn bytes_look_like_index(index: &ImageIndex) -> bool {
    !index.manifests.is_empty() && index.manifests.iter().all(|m| !m.digest.is_empty())
}

fn pick_platform_manifest(index: &ImageIndex) -> Result<String, DynError> {
    let arch = std::env::consts::ARCH;
    let preferred = index.manifests.iter().find(|entry| {
        entry
            .platform
            .as_ref()
            .map(|p| p.os == "linux" && p.architecture == arch)
            .unwrap_or(false)
    });
    preferred
        .or_else(|| index.manifests.first())
        .map(|entry| entry.digest.clone())
        .ok_or_else(|| new_error("image index contains no manifests"))
}

fn fake_manifest_path(root: &Path, reference: &ImageReference) -> PathBuf {
    root.join("manifests")
        .join(&reference.registry)
        .join(&reference.repository)
        .join(format!("{}.json", reference.tag_or_default()))
}

fn fake_blob_path(root: &Path, digest: &str) -> PathBuf {
    root.join("blobs")
        .join("sha256")
        .join(digest.trim_start_matches("sha256:"))
}

fn pull_from_fake_registry(
    store: &LayerStore,
    reference: &ImageReference,
    fake_root: &Path,
) -> Result<ImageRecord, DynError> {
    let manifest_path = fake_manifest_path(fake_root, reference);
    let manifest_bytes = fs::read(&manifest_path).map_err(|e| {
        with_context(
            e,
            format!("read fake manifest at {}", manifest_path.display()),
        )
    })?;
    let manifest: OciManifest = serde_json::from_slice(&manifest_bytes).map_err(|e| {
        with_context(
            e,
            format!("parse fake manifest at {}", manifest_path.display()),
        )
    })?;
    let manifest_digest = store.write_blob(&manifest_bytes)?;

    let mut digests: Vec<String> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
    digests.push(manifest.config.digest.clone());
    for digest in &digests {
        if store.has_blob(digest) {
            continue;
        }
        let path = fake_blob_path(fake_root, digest);
        let data = fs::read(&path)
            .map_err(|e| with_context(e, format!("read fake blob at {}", path.display())))?;
        store.write_blob(&data)?;
    }
    for layer in &manifest.layers {
        store.extract_layer(&layer.digest)?;
    }

    let record = store.record_image(
        &manifest.config.digest,
        &manifest_digest,
        Some(&reference.name()),
    )?;
    store.tag_ref(reference, &manifest_digest)?;
    Ok(record)
}

fn push_to_fake_registry(
    store: &LayerStore,
    image: &ImageRecord,
    reference: &ImageReference,
    fake_root: &Path,
) -> Result<(), DynError> {
    let manifest = store.manifest(image)?;
    let mut digests: Vec<String> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
    digests.push(manifest.config.digest.clone());
    for digest in &digests {
        let target = fake_blob_path(fake_root, digest);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| with_context(e, format!("create {}", parent.display())))?;
        }
        fs::write(&target, store.read_blob(digest)?)
            .map_err(|e| with_context(e, format!("write fake blob {}", target.display())))?;
    }
    let manifest_path = fake_manifest_path(fake_root, reference);
    if let Some(parent) = manifest_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| with_context(e, format!("create {}", parent.display())))?;
    }
    fs::write(&manifest_path, store.read_blob(&image.manifest_digest)?).map_err(|e| {
        with_context(
            e,
            format!("write fake manifest {}", manifest_path.display()),
        )
    })?;
    Ok(())
}
