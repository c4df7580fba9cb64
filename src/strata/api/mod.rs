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

pub mod cache;
pub mod provisioner;

/// Selects the provisioner by name on a claim.
pub const ANN_STORAGE_PROVISIONER: &str = "volume.beta.kubernetes.io/storage-provisioner";
/// Node selected for a wait-for-first-consumer claim.
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";
/// Stamped on produced volumes.
pub const ANN_PROVISIONED_BY: &str = "pv.kubernetes.io/provisioned-by";

/// Owner back-references on provisioner pods.
pub const ANN_PVC_NAME: &str = "strata.dev/pvc-name";
pub const ANN_PVC_NAMESPACE: &str = "strata.dev/pvc-namespace";
/// Owner back-reference on deprovisioner pods.
pub const ANN_PV_NAME: &str = "strata.dev/pv-name";
/// Set once the deprovisioner succeeded so a later reconcile does not rerun it.
pub const ANN_DEPROVISIONER_DISABLED: &str = "strata.dev/pv-deprovisioner-disabled";
/// JSON-serialised provisioner definition on produced volumes and pods.
pub const ANN_PROVISIONER_SPEC: &str = "strata.dev/provisioner-spec";
/// Instructs the pod-completion reconciler to strip claim protection.
pub const ANN_NO_PROTECTION: &str = "strata.dev/no-protection";

pub const ENABLED: &str = "true";

/// System finalizer applied to claims and produced volumes.
pub const FINALIZER: &str = "strata.dev/finalizer";
pub const FINALIZER_PVC_PROTECTION: &str = "kubernetes.io/pvc-protection";
pub const FINALIZER_PV_PROTECTION: &str = "kubernetes.io/pv-protection";

pub const PROVISIONED_BY_VALUE: &str = "strata";
