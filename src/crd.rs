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

//! Custom resources managed by the operator, and the foreign resources it
//! drives.

pub mod game_server;
pub mod game_server_set;
pub mod keys;
pub mod kruise;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

pub use self::{
    game_server::{
        GameServer, GameServerCondition, GameServerConditionType, GameServerContainer,
        GameServerSpec, GameServerState, GameServerStatus, NetworkAddress, NetworkPort,
        NetworkState, NetworkStatus, OpsState, ServiceQualityCondition,
    },
    game_server_set::{
        AutoUpdateStrategy, AutoUpdateStrategyType, GameServerSet, GameServerSetSpec,
        GameServerSetStatus, GameServerTemplate, Network, NetworkConfParam, PodUpdatePolicy,
        RollingUpdateStrategy, ScaleDownStrategyType, ScaleStrategy, ServiceQuality,
        ServiceQualityAction, UpdateStrategy,
    },
    kruise::{PodProbeMarker, StatefulSet},
};

/// Interprets a priority value as an integer, falling back to `0` for
/// strings which are not numbers.
pub fn priority_value(priority: Option<&IntOrString>) -> i32 {
    match priority {
        Some(IntOrString::Int(value)) => *value,
        Some(IntOrString::String(value)) => value.trim().parse().unwrap_or_default(),
        None => 0,
    }
}

/// Renders a priority value the way it is stored in a pod label.
pub fn priority_label(priority: Option<&IntOrString>) -> String {
    match priority {
        Some(IntOrString::Int(value)) => value.to_string(),
        Some(IntOrString::String(value)) => value.clone(),
        None => String::from("0"),
    }
}
