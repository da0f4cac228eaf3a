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

//! Rolls the conditions of a pod, its node and its persistent volumes up into
//! the `PodNormal`, `NodeNormal` and `PersistentVolumeNormal` conditions of a
//! `GameServer`.

use k8s_openapi::{
    api::core::v1::{ContainerStatus, Node, PersistentVolume, Pod},
    apimachinery::pkg::apis::meta::v1::Time,
};

use crate::crd::{GameServerCondition, GameServerConditionType};

pub const PERSISTENT_VOLUME_NOT_FOUND: &str = "PersistentVolumeNotFound";

const TRUE: &str = "True";
const FALSE: &str = "False";

/// The health of one rolled up object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub normal: bool,
    pub reason: String,
    pub message: String,
}

impl Summary {
    pub fn normal() -> Self {
        Self {
            normal: true,
            ..<_>::default()
        }
    }

    pub fn abnormal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            normal: false,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Appends `piece` to `acc` with a `"; "` separator, unless `acc` already
/// contains it.
pub fn append(acc: &mut String, piece: &str) {
    if piece.is_empty() || acc.contains(piece) {
        return;
    }

    if !acc.is_empty() {
        acc.push_str("; ");
    }
    acc.push_str(piece);
}

/// Merges candidate summaries into one. Any abnormal candidate makes the
/// result abnormal, and normal candidates are then left out of the merge.
pub fn poly_condition(candidates: impl IntoIterator<Item = Summary>) -> Summary {
    let candidates: Vec<_> = candidates.into_iter().collect();
    let normal = candidates.iter().all(|candidate| candidate.normal);
    let mut merged = Summary {
        normal,
        ..<_>::default()
    };

    for candidate in candidates.iter().filter(|c| c.normal == normal) {
        append(&mut merged.reason, &candidate.reason);
        append(&mut merged.message, &candidate.message);
    }

    merged
}

pub fn pod_condition(pod: &Pod) -> Summary {
    let Some(status) = pod.status.as_ref() else {
        return Summary::normal();
    };

    let conditions = status.conditions.as_deref().unwrap_or_default();
    let find = |type_: &str| conditions.iter().find(|c| c.type_ == type_);
    let mut candidates = Vec::new();

    for type_ in ["PodScheduled", "Initialized", "ContainersReady"] {
        if let Some(condition) = find(type_).filter(|c| c.status == FALSE) {
            candidates.push(Summary::abnormal(
                condition
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("{type_}False")),
                condition.message.clone().unwrap_or_default(),
            ));
        }
    }

    let containers_ready = find("ContainersReady").is_some_and(|c| c.status == TRUE);
    if let Some(ready) = find("Ready").filter(|c| containers_ready && c.status == FALSE) {
        candidates.push(Summary::abnormal(
            ready.reason.clone().unwrap_or_else(|| "PodNotReady".into()),
            ready.message.clone().unwrap_or_default(),
        ));
    }

    let statuses = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    candidates.extend(statuses.flat_map(container_summaries));

    poly_condition(candidates)
}

fn container_summaries(status: &ContainerStatus) -> Vec<Summary> {
    let mut summaries = Vec::new();

    if let Some(state) = &status.state {
        if let Some(waiting) = state.waiting.as_ref().filter(|w| w.reason.is_some()) {
            summaries.push(Summary::abnormal(
                format!("ContainerWaiting:{}", waiting.reason.as_deref().unwrap_or_default()),
                waiting.message.clone().unwrap_or_default(),
            ));
        }

        if let Some(terminated) = state.terminated.as_ref().filter(|t| t.exit_code != 0) {
            summaries.push(terminated_summary(
                terminated.reason.as_deref(),
                terminated.message.as_deref(),
                terminated.exit_code,
            ));
        }
    }

    // A previous crash only matters while the container has not recovered.
    if !status.ready {
        if let Some(terminated) = status
            .last_state
            .as_ref()
            .and_then(|state| state.terminated.as_ref())
        {
            summaries.push(terminated_summary(
                terminated.reason.as_deref(),
                terminated.message.as_deref(),
                terminated.exit_code,
            ));
        }
    }

    summaries
}

fn terminated_summary(reason: Option<&str>, message: Option<&str>, exit_code: i32) -> Summary {
    let message = match message.filter(|m| !m.is_empty()) {
        Some(message) => format!("{message}, ExitCode: {exit_code}"),
        None => format!("ExitCode: {exit_code}"),
    };

    Summary::abnormal(
        format!("ContainerTerminated:{}", reason.unwrap_or("Unknown")),
        message,
    )
}

pub fn node_condition(node: &Node) -> Summary {
    let conditions = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_deref())
        .unwrap_or_default();

    poly_condition(conditions.iter().map(|condition| {
        let healthy = match &*condition.type_ {
            "Ready" | "SufficientIP" => condition.status == TRUE,
            _ => condition.status == FALSE,
        };

        if healthy {
            Summary::normal()
        } else {
            Summary::abnormal(
                condition
                    .reason
                    .clone()
                    .unwrap_or_else(|| condition.type_.clone()),
                condition.message.clone().unwrap_or_default(),
            )
        }
    }))
}

/// The result of resolving one of a pod's volume claims.
#[derive(Clone, Debug)]
pub enum VolumeLookup {
    /// The claim does not exist.
    ClaimMissing(String),
    /// The claim exists but its volume does not.
    VolumeMissing(String),
    Found(Box<PersistentVolume>),
}

pub fn persistent_volume_condition(lookups: &[VolumeLookup]) -> Summary {
    poly_condition(lookups.iter().map(|lookup| match lookup {
        VolumeLookup::ClaimMissing(claim) => Summary::abnormal(
            PERSISTENT_VOLUME_NOT_FOUND,
            format!("persistent volume claim {claim} not found"),
        ),
        VolumeLookup::VolumeMissing(claim) => Summary::abnormal(
            PERSISTENT_VOLUME_NOT_FOUND,
            format!("persistent volume for claim {claim} not found"),
        ),
        VolumeLookup::Found(volume) => {
            let status = volume.status.as_ref();
            match status.and_then(|s| s.phase.as_deref()) {
                Some(phase @ ("Failed" | "Pending")) => Summary::abnormal(
                    status
                        .and_then(|s| s.reason.clone())
                        .unwrap_or_else(|| format!("PersistentVolume{phase}")),
                    status.and_then(|s| s.message.clone()).unwrap_or_default(),
                ),
                _ => Summary::normal(),
            }
        }
    }))
}

/// Whether two conditions carry the same content, ignoring timestamps.
pub fn is_condition_equal(a: &GameServerCondition, b: &GameServerCondition) -> bool {
    a.type_ == b.type_ && a.status == b.status && a.reason == b.reason && a.message == b.message
}

/// Builds the condition of `type_` from `summary`, keeping `previous` as is
/// when nothing but time changed.
pub fn to_condition(
    type_: GameServerConditionType,
    summary: Summary,
    previous: &[GameServerCondition],
    now: &Time,
) -> GameServerCondition {
    let condition = GameServerCondition {
        type_,
        status: String::from(if summary.normal { TRUE } else { FALSE }),
        last_probe_time: Some(now.clone()),
        last_transition_time: Some(now.clone()),
        reason: summary.reason,
        message: summary.message,
    };

    match previous.iter().find(|c| c.type_ == type_) {
        Some(previous) if is_condition_equal(previous, &condition) => previous.clone(),
        _ => condition,
    }
}
