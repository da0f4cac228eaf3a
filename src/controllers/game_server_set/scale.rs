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

//! Planning which ordinals a fleet keeps, adds and removes when it is scaled
//! or its reservations change.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::util::{self, in_a_and_in_b, in_a_not_in_b, sort_for_deletion};

/// The observed state a scale is planned from.
#[derive(Debug)]
pub struct ScaleInput<'a> {
    /// Reservations applied by the previous scale.
    pub old_reserved: &'a [i32],
    /// Reservations currently declared on the fleet.
    pub new_reserved: &'a [i32],
    /// Ordinals the workload skips that the fleet never reserved.
    pub not_exist: &'a [i32],
    pub replicas: i32,
    pub pods: &'a [Pod],
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScalePlan {
    /// Live ordinals that leave the fleet.
    pub to_delete: Vec<i32>,
    /// Ordinals that (re)join the fleet.
    pub to_add: Vec<i32>,
    /// Ordinals picked by delete sequence to shrink the fleet.
    pub victims: Vec<i32>,
    /// Every ordinal in the fleet once the plan is applied.
    pub ordinals: Vec<i32>,
    /// The workload's `reserveOrdinals` once the plan is applied.
    pub reserve_ordinals: Vec<i32>,
}

pub fn plan(input: &ScaleInput<'_>) -> ScalePlan {
    let live = util::dedup(
        &input
            .pods
            .iter()
            .map(|pod| util::ordinal(&pod.name_any()))
            .collect::<Vec<_>>(),
    );
    let max_live = live.last().copied().unwrap_or(-1);

    let newly_reserved = in_a_not_in_b(input.new_reserved, input.old_reserved);
    let mut to_delete = in_a_and_in_b(&newly_reserved, &live);

    let mut to_add: Vec<i32> = in_a_not_in_b(input.old_reserved, input.new_reserved)
        .into_iter()
        .filter(|ordinal| *ordinal < max_live && !live.contains(ordinal))
        .collect();

    let delta = input.replicas - live.len() as i32 + to_delete.len() as i32 - to_add.len() as i32;
    let mut victims = Vec::new();

    if delta < 0 {
        let mut candidates: Vec<Pod> = input
            .pods
            .iter()
            .filter(|pod| !to_delete.contains(&util::ordinal(&pod.name_any())))
            .cloned()
            .collect();
        sort_for_deletion(&mut candidates);

        victims = candidates
            .iter()
            .take(delta.unsigned_abs() as usize)
            .map(|pod| util::ordinal(&pod.name_any()))
            .collect();
        to_delete.extend_from_slice(&victims);
    } else if delta > 0 {
        let mut needed = delta as usize;
        let free = |ordinal: &i32, to_add: &[i32]| {
            !input.new_reserved.contains(ordinal) && !live.contains(ordinal) && !to_add.contains(ordinal)
        };

        for ordinal in util::dedup(input.not_exist) {
            if needed == 0 {
                break;
            }
            if free(&ordinal, &to_add) {
                to_add.push(ordinal);
                needed -= 1;
            }
        }

        let mut next = max_live + 1;
        while needed > 0 {
            if free(&next, &to_add) {
                to_add.push(next);
                needed -= 1;
            }
            next += 1;
        }
    }

    let to_delete = util::dedup(&to_delete);
    let to_add = util::dedup(&to_add);

    let mut ordinals = in_a_not_in_b(&live, &to_delete);
    ordinals.extend_from_slice(&to_add);
    let ordinals = util::dedup(&ordinals);

    let upper = live
        .iter()
        .chain(&to_add)
        .chain(input.new_reserved)
        .copied()
        .max()
        .unwrap_or(-1);
    let mut reserve_ordinals = input.new_reserved.to_vec();
    reserve_ordinals.extend((0..=upper).filter(|ordinal| !ordinals.contains(ordinal)));

    ScalePlan {
        to_delete,
        to_add,
        victims: util::dedup(&victims),
        ordinals,
        reserve_ordinals: util::dedup(&reserve_ordinals),
    }
}
