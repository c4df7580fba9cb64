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

use std::env;
use std::path::{Component, PathBuf};

/// Enum for supported path configuration parameters.
#[derive(Debug)]
pub enum Config {
    StorageRoot,
    StorageRunRoot,
    StateDir,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::StorageRoot => "STRATA_STORAGE_ROOT",
            Config::StorageRunRoot => "STRATA_STORAGE_RUNROOT",
            Config::StateDir => "STRATA_STATE_DIR",
        }
    }

    /// Returns the compiled default for the config parameter.
    pub fn default_path(&self) -> &'static str {
        match self {
            Config::StorageRoot => {
                #[cfg(test)]
                {
                    "/tmp/strata-test/storage"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/strata/storage"
                }
            }
            Config::StorageRunRoot => {
                #[cfg(test)]
                {
                    "/tmp/strata-test/runroot"
                }
                #[cfg(not(test))]
                {
                    "/run/strata/storage"
                }
            }
            Config::StateDir => {
                #[cfg(test)]
                {
                    "/tmp/strata-test/state"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/strata/state"
                }
            }
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Normalize a directory path by expanding ~, resolving . and .., and
    /// returning an absolute, cleaned path.
    pub fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }
}

/// Resolved node agent settings: each field mirrors a root CLI flag and a
/// `STRATA_*` environment variable, with the flag taking precedence.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub debug: bool,
    pub storage_root: PathBuf,
    pub storage_run_root: PathBuf,
    pub registry: Option<String>,
    pub registry_username: Option<String>,
    pub registry_password: Option<String>,
    pub insecure_skip_tls_verify: bool,
    pub enable_k8s_sync: bool,
    pub node_name: Option<String>,
}

pub const ENV_REGISTRY: &str = "STRATA_REGISTRY";
pub const ENV_REGISTRY_USERNAME: &str = "STRATA_REGISTRY_USERNAME";
pub const ENV_REGISTRY_PASSWORD: &str = "STRATA_REGISTRY_PASSWORD";
pub const ENV_INSECURE_SKIP_TLS_VERIFY: &str = "STRATA_INSECURE_SKIP_TLS_VERIFY";
pub const ENV_ENABLE_K8S_SYNC: &str = "STRATA_ENABLE_K8S_SYNC";
pub const ENV_DEBUG: &str = "STRATA_DEBUG";
pub const ENV_NODE_NAME: &str = "STRATA_NODE_NAME";
pub const ENV_CACHE_NAME: &str = "STRATA_CACHE_NAME";
pub const ENV_CACHE_NAMESPACE: &str = "STRATA_CACHE_NAMESPACE";
pub const ENV_CONTAINER_NAME: &str = "STRATA_CONTAINER_NAME";
pub const ENV_MANAGER_NAMESPACE: &str = "STRATA_MANAGER_NAMESPACE";

pub fn env_string(var: &str) -> Option<String> {
    env::var(var).ok().filter(|value| !value.is_empty())
}

pub fn env_bool(var: &str) -> bool {
    env::var(var)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}
