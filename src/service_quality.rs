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

//! Evaluates probe results reported as pod conditions against the service
//! quality action tables of a fleet.

use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::PodCondition, apimachinery::pkg::apis::meta::v1::Time};

use crate::crd::{keys, GameServerSpec, ServiceQuality, ServiceQualityAction, ServiceQualityCondition};

/// The result of evaluating every service quality of a game server.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    /// The game server spec with every matched action applied.
    pub spec: GameServerSpec,
    /// Labels contributed by matched actions.
    pub labels: BTreeMap<String, String>,
    /// Annotations contributed by matched actions.
    pub annotations: BTreeMap<String, String>,
    pub conditions: Vec<ServiceQualityCondition>,
}

pub fn evaluate(
    qualities: &[ServiceQuality],
    pod_conditions: &[PodCondition],
    previous: &[ServiceQualityCondition],
    spec: &GameServerSpec,
    now: &Time,
) -> Evaluation {
    let mut evaluation = Evaluation {
        spec: spec.clone(),
        ..<_>::default()
    };

    for quality in qualities {
        let condition_type = keys::service_quality_condition(&quality.name);
        let Some(probe) = pod_conditions.iter().find(|c| c.type_ == condition_type) else {
            evaluation.conditions.push(ServiceQualityCondition {
                name: quality.name.clone(),
                ..<_>::default()
            });
            continue;
        };

        let status = probe.status.clone();
        let result = probe_result(probe);
        let previous = previous.iter().find(|c| c.name == quality.name);

        let changed = previous.map_or(true, |previous| {
            previous.status.as_deref() != Some(&*status)
                || previous.result.as_deref().unwrap_or_default() != result
        });

        let mut last_action_transition_time =
            previous.and_then(|previous| previous.last_action_transition_time.clone());

        if changed {
            if let Some(action) = match_action(&quality.service_quality_action, &status, &result) {
                tracing::debug!(quality = %quality.name, %status, %result, "service quality action matched");
                apply(action, &mut evaluation);
                last_action_transition_time = Some(now.clone());
            }
        }

        let last_probe_time = probe
            .last_probe_time
            .clone()
            .or_else(|| probe.last_transition_time.clone());
        let last_transition_time = latest(&last_action_transition_time, &last_probe_time);

        evaluation.conditions.push(ServiceQualityCondition {
            name: quality.name.clone(),
            status: Some(status),
            result: (!result.is_empty()).then_some(result),
            last_probe_time,
            last_transition_time,
            last_action_transition_time,
        });
    }

    evaluation
}

/// The probe's message with surrounding whitespace, such as the trailing
/// newline of an exec probe, removed.
fn probe_result(condition: &PodCondition) -> String {
    condition
        .message
        .as_deref()
        .unwrap_or_default()
        .trim()
        .to_owned()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Returns the first action, in declaration order, whose state matches the
/// probe status and whose result is empty or equal to the probe result.
pub fn match_action<'a>(
    actions: &'a [ServiceQualityAction],
    status: &str,
    result: &str,
) -> Option<&'a ServiceQualityAction> {
    let state = parse_bool(status)?;

    actions.iter().find(|action| {
        action.state == state
            && action
                .result
                .as_deref()
                .map_or(true, |expected| expected.is_empty() || expected == result)
    })
}

fn apply(action: &ServiceQualityAction, evaluation: &mut Evaluation) {
    let spec = &mut evaluation.spec;
    if let Some(priority) = &action.deletion_priority {
        spec.deletion_priority = Some(priority.clone());
    }
    if let Some(priority) = &action.update_priority {
        spec.update_priority = Some(priority.clone());
    }
    if let Some(state) = action.ops_state {
        spec.ops_state = state;
    }
    if let Some(disabled) = action.network_disabled {
        spec.network_disabled = disabled;
    }

    evaluation
        .labels
        .extend(action.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    evaluation
        .annotations
        .extend(action.annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
}

fn latest(a: &Option<Time>, b: &Option<Time>) -> Option<Time> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if a.0 >= b.0 { a.clone() } else { b.clone() }),
        (Some(time), None) | (None, Some(time)) => Some(time.clone()),
        (None, None) => None,
    }
}
