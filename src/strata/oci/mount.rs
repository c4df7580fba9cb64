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

use crate::strata::util::error::{with_context, DynError};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

/// Mount primitives behind a provider so tests and alternative drivers can
/// replace the kernel implementation.
pub trait Mounter: Send + Sync {
    /// Mounts an overlay filesystem; `lower` is ordered top-most first.
    fn mount_overlay(
        &self,
        lower: &[PathBuf],
        upper: &Path,
        work: &Path,
        merged: &Path,
    ) -> Result<(), DynError>;

    /// Recursive shared bind mount.
    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), DynError>;

    /// Lazy, forced unmount.
    fn unmount(&self, target: &Path) -> Result<(), DynError>;
}

/// Kernel-space overlayfs implementation. Mounts must run with effective
/// root; overlay options always carry `nodev`.
pub struct KernelMounter;

impl Mounter for KernelMounter {
    fn mount_overlay(
        &self,
        lower: &[PathBuf],
        upper: &Path,
        work: &Path,
        merged: &Path,
    ) -> Result<(), DynError> {
        let lowerdir = lower
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        let options = format!(
            "lowerdir={lowerdir},upperdir={},workdir={},nodev",
            upper.display(),
            work.display()
        );
        mount(
            Some("overlay"),
            merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| with_context(e, format!("mount overlay at {}", merged.display())))
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<(), DynError> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SHARED,
            None::<&str>,
        )
        .map_err(|e| {
            with_context(
                e,
                format!("bind mount {} to {}", source.display(), target.display()),
            )
        })
    }

    fn unmount(&self, target: &Path) -> Result<(), DynError> {
        umount2(target, MntFlags::MNT_DETACH | MntFlags::MNT_FORCE)
            .map_err(|e| with_context(e, format!("unmount {}", target.display())))
    }
}

fn provider() -> &'static RwLock<Arc<dyn Mounter>> {
    static PROVIDER: OnceLock<RwLock<Arc<dyn Mounter>>> = OnceLock::new();
    PROVIDER.get_or_init(|| RwLock::new(Arc::new(KernelMounter)))
}

/// Returns the active mounter.
pub fn mounter() -> Arc<dyn Mounter> {
    provider().read().expect("mounter provider poisoned").clone()
}

/// Replaces the active mounter (used by tests and alternative drivers).
pub fn register_mounter(mounter: Arc<dyn Mounter>) {
    *provider().write().expect("mounter provider poisoned") = mounter;
}
