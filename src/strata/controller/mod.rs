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

pub mod claim;
pub mod job;
pub mod pod;
pub mod provisioner;
pub mod registry;
pub mod runtime;
pub mod volume;
pub mod worker;

pub use registry::ProvisionerRegistry;

/// Container name and pod-name suffix of provisioner jobs.
pub const PROVISIONER: &str = "provisioner";
/// Container name and pod-name suffix of deprovisioner jobs.
pub const DEPROVISIONER: &str = "deprovisioner";
