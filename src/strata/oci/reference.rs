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

use crate::strata::util::error::{new_error, DynError};
use std::fmt;

/// Registry used when an image reference does not name one.
pub const DEFAULT_REGISTRY: &str = "registry.local";

/// Store-internal registry component of cache image names.
pub const LOCAL_STORE_REGISTRY: &str = "fs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// Canonical `registry/repository:tag` form used as an image name in the
    /// local store.
    pub fn name(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag_or_default())
    }

    /// Whether this reference points at the node-local store rather than a
    /// remote registry.
    pub fn is_local(&self) -> bool {
        self.registry == LOCAL_STORE_REGISTRY
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = self.tag.as_deref() {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = self.digest.as_deref() {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Synthesised store-local reference for a named cache.
pub fn local_cache_reference(namespace: &str, name: &str) -> Result<ImageReference, DynError> {
    if namespace.is_empty() || name.is_empty() {
        return Err(new_error("cache name and namespace must be specified"));
    }
    parse_image_reference(&format!("{LOCAL_STORE_REGISTRY}/{namespace}/{name}:latest"))
}

pub fn parse_image_reference(image: &str) -> Result<ImageReference, DynError> {
    if image.trim().is_empty() {
        return Err(new_error("Image reference is empty"));
    }

    let (without_digest, digest) = match image.split_once('@') {
        Some((reference, digest)) => {
            validate_digest(digest, image)?;
            (reference, Some(digest.to_string()))
        }
        None => (image, None),
    };

    let (reference_without_tag, tag) = match without_digest.rsplit_once(':') {
        Some((reference, tag_candidate)) if !tag_candidate.contains('/') => {
            validate_tag(tag_candidate)?;
            (reference, Some(tag_candidate.to_string()))
        }
        _ => (without_digest, None),
    };

    let (registry, repository) = match reference_without_tag.split_once('/') {
        Some((registry_candidate, remainder)) => {
            if remainder.is_empty() {
                return Err(new_error(format!(
                    "Image reference missing repository: {image}"
                )));
            }
            validate_registry(registry_candidate)?;
            validate_repository(remainder)?;
            (registry_candidate.to_string(), remainder.to_string())
        }
        None => {
            validate_repository(reference_without_tag)?;
            (DEFAULT_REGISTRY.to_string(), reference_without_tag.to_string())
        }
    };

    let tag = match (&tag, &digest) {
        (None, None) => Some("latest".to_string()),
        _ => tag,
    };

    Ok(ImageReference {
        registry,
        repository,
        tag,
        digest,
    })
}

fn validate_registry(registry: &str) -> Result<(), DynError> {
    if registry.is_empty()
        || !registry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
    {
        return Err(new_error(format!(
            "Invalid registry component in image reference: {registry}"
        )));
    }
    Ok(())
}

fn validate_repository(repository: &str) -> Result<(), DynError> {
    if repository.is_empty() {
        return Err(new_error("Image reference missing repository"));
    }
    for segment in repository.split('/') {
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(new_error(format!(
                "Invalid repository component in image reference: {repository}"
            )));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> Result<(), DynError> {
    if tag.is_empty()
        || !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(new_error(format!("Invalid image tag: {tag}")));
    }
    Ok(())
}

fn validate_digest(digest: &str, original: &str) -> Result<(), DynError> {
    const PREFIX: &str = "sha256:";
    if !digest.starts_with(PREFIX) {
        return Err(new_error(format!("Invalid image reference: {original}")));
    }
    let hex = &digest[PREFIX.len()..];
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(new_error(format!("Invalid image reference: {original}")));
    }
    Ok(())
}
