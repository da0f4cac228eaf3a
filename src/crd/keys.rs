/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Well known label and annotation keys shared between the controllers,
//! the workload and the pods.

pub const GROUP: &str = "game.kruise.io";

/// Name of the owning `GameServerSet`, set on pods and `GameServer`s.
pub const OWNER_GSS: &str = "game.kruise.io/owner-gss";
pub const OPS_STATE: &str = "game.kruise.io/gs-opsState";
pub const UPDATE_PRIORITY: &str = "game.kruise.io/gs-update-priority";
pub const DELETION_PRIORITY: &str = "game.kruise.io/gs-deletion-priority";
pub const STATE: &str = "game.kruise.io/gs-state";
pub const NETWORK_DISABLED: &str = "game.kruise.io/network-disabled";
/// Set to `"true"` on a `GameServer` whose ordinal left the fleet.
pub const DELETING: &str = "game.kruise.io/gs-deleting";

/// Labels and annotations under this prefix are mirrored between a
/// `GameServer` and its pod.
pub const SYNC_PREFIX: &str = "gs-sync/";

pub const RESERVE_IDS: &str = "game.kruise.io/gss-reserve-ids";
pub const WORKLOAD_HASH: &str = "game.kruise.io/asts-hash";
pub const TEMPLATE_HASH: &str = "game.kruise.io/gss-template-hash";
pub const PROBE_MARKER_HASH: &str = "game.kruise.io/ppm-hash";

pub const NETWORK_TYPE: &str = "game.kruise.io/network-type";
pub const NETWORK_CONF: &str = "game.kruise.io/network-conf";
pub const NETWORK_STATUS: &str = "game.kruise.io/network-status";
pub const NETWORK_TIMEOUT_REPORTED: &str = "game.kruise.io/network-timeout-reported";

/// Lifecycle state written onto pods by the workload controller.
pub const LIFECYCLE_STATE: &str = "lifecycle.apps.kruise.io/state";
pub const LIFECYCLE_PREPARING_UPDATE: &str = "PreparingUpdate";
pub const LIFECYCLE_UPDATING: &str = "Updating";
pub const LIFECYCLE_PREPARING_DELETE: &str = "PreparingDelete";

pub const IN_PLACE_UPDATE_READY: &str = "InPlaceUpdateReady";

/// The pod condition type carrying the probe result for a service quality.
pub fn service_quality_condition(name: &str) -> String {
    format!("{GROUP}/{name}")
}

pub fn is_sync_key(key: &str) -> bool {
    key.starts_with(SYNC_PREFIX)
}
