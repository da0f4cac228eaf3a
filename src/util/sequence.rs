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

//! The order in which fleet members are chosen as scale down victims.

use std::cmp::Ordering;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::{keys, OpsState};

/// Deletion band of an ops state; higher bands are deleted first.
fn band(state: OpsState) -> u8 {
    match state {
        OpsState::Kill => 4,
        OpsState::WaitToDelete => 3,
        OpsState::None => 2,
        OpsState::Allocated => 1,
        OpsState::Maintaining => 0,
    }
}

fn sequence_key<K: Resource>(object: &K) -> (u8, i32, i32) {
    let labels = object.labels();
    let state = OpsState::from_label(labels.get(keys::OPS_STATE).map(String::as_str));
    let priority = crate::crd::priority_value(
        labels
            .get(keys::DELETION_PRIORITY)
            .map(|value| IntOrString::String(value.clone()))
            .as_ref(),
    );

    (band(state), priority, crate::util::ordinal(&object.name_any()))
}

/// Compares two fleet members by how eagerly they should be deleted, with
/// the preferred victim ordered first.
///
/// Members are ranked by ops state band (`Kill`, `WaitToDelete`, `None`,
/// `Allocated`, `Maintaining`), then by the higher deletion priority label,
/// then by the higher ordinal.
pub fn delete_sequence<K: Resource>(a: &K, b: &K) -> Ordering {
    sequence_key(b).cmp(&sequence_key(a))
}

pub fn sort_for_deletion<K: Resource>(objects: &mut [K]) {
    objects.sort_by(delete_sequence);
}
