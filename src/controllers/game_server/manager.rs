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

//! Keeps a `GameServer` and its pod in sync: spec flows down into pod labels,
//! observed state flows up into the `GameServer` status.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use k8s_openapi::{
    api::core::v1::Pod,
    apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString},
};
use kube::{runtime::events::EventType, Resource, ResourceExt};
use serde_json::{json, Map, Value};

use crate::{
    condition::{self, Summary, VolumeLookup},
    controllers::{status_patch, Context},
    crd::{
        keys, priority_label, GameServer, GameServerConditionType, GameServerCondition,
        GameServerSet, GameServerState, GameServerStatus, NetworkState, NetworkStatus,
    },
    error::ResultExt,
    events::reasons,
    service_quality, Error,
};

/// Derives the state of a game server from its pod.
pub fn derive_state(pod: &Pod) -> GameServerState {
    let Some(status) = pod.status.as_ref() else {
        return GameServerState::Unknown;
    };

    match status.phase.as_deref() {
        Some("Running") => {
            match pod.labels().get(keys::LIFECYCLE_STATE).map(String::as_str) {
                Some(keys::LIFECYCLE_UPDATING) => return GameServerState::Updating,
                Some(keys::LIFECYCLE_PREPARING_UPDATE) => return GameServerState::PreUpdate,
                Some(keys::LIFECYCLE_PREPARING_DELETE) => return GameServerState::PreDelete,
                _ => {}
            }

            if pod.metadata.deletion_timestamp.is_some() {
                return GameServerState::Deleting;
            }

            let ready = status
                .conditions
                .iter()
                .flatten()
                .any(|c| c.type_ == "Ready" && c.status == "True");
            if ready {
                GameServerState::Ready
            } else {
                GameServerState::NotReady
            }
        }
        Some("Failed") => GameServerState::Crash,
        Some("Pending") => GameServerState::Creating,
        _ => GameServerState::Unknown,
    }
}

/// Whether to keep waiting on a game server's network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkWait {
    /// The network is where it should be, or there is none.
    Proceed,
    /// The network is still converging.
    Wait,
    /// The network did not converge within the allowed time.
    TimedOut,
}

pub fn network_wait(status: Option<&NetworkStatus>, now: &Time, budget: Duration) -> NetworkWait {
    let Some(status) = status else {
        return NetworkWait::Proceed;
    };

    if status.desired_network_state == status.current_network_state {
        return NetworkWait::Proceed;
    }

    let Some(since) = status
        .last_transition_time
        .as_ref()
        .or(status.create_time.as_ref())
    else {
        return NetworkWait::Wait;
    };

    let elapsed = (now.0 - since.0).to_std().unwrap_or_default();
    if elapsed < budget {
        NetworkWait::Wait
    } else {
        NetworkWait::TimedOut
    }
}

pub struct GameServerManager {
    pod: Pod,
    gs: GameServer,
    gss: Option<GameServerSet>,
    context: Arc<Context>,
    namespace: String,
    name: String,
}

impl GameServerManager {
    pub fn new(
        pod: Pod,
        gs: GameServer,
        gss: Option<GameServerSet>,
        context: Arc<Context>,
    ) -> Result<Self, Error> {
        let namespace = crate::controllers::namespace_of(&gs)?;
        let name = gs.name_any();
        Ok(Self {
            pod,
            gs,
            gss,
            context,
            namespace,
            name,
        })
    }

    async fn publish(&self, type_: EventType, reason: &str, note: String) {
        self.context
            .events
            .publish(&self.gs.object_ref(&()), type_, reason, Some(note))
            .await;
    }

    /// The pod labels mirroring the `GameServer` spec, with the event reason
    /// used when each one changes.
    fn desired_pod_labels(&self) -> [(&'static str, String, &'static str); 5] {
        let spec = &self.gs.spec;
        [
            (keys::OPS_STATE, spec.ops_state.to_string(), reasons::OPS_STATE_CHANGED),
            (
                keys::UPDATE_PRIORITY,
                priority_label(spec.update_priority.as_ref()),
                reasons::UPDATE_PRIORITY_CHANGED,
            ),
            (
                keys::DELETION_PRIORITY,
                priority_label(spec.deletion_priority.as_ref()),
                reasons::DELETION_PRIORITY_CHANGED,
            ),
            (
                keys::NETWORK_DISABLED,
                spec.network_disabled.to_string(),
                reasons::NETWORK_DISABLED_CHANGED,
            ),
            (
                keys::STATE,
                derive_state(&self.pod).to_string(),
                reasons::STATE_CHANGED,
            ),
        ]
    }

    /// Writes the `GameServer` spec onto the pod. Returns whether the pod was
    /// patched.
    #[tracing::instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn sync_gs_to_pod(&self) -> Result<bool, Error> {
        let pod_labels = self.pod.labels();
        let pod_annotations = self.pod.annotations();
        let mut labels = Map::new();
        let mut annotations = Map::new();
        let mut changes = Vec::new();

        for (key, value, reason) in self.desired_pod_labels() {
            let current = pod_labels.get(key);
            if current == Some(&value) {
                continue;
            }

            if let Some(previous) = current.filter(|previous| !previous.is_empty()) {
                changes.push((reason, format!("{key} changed from {previous} to {value}")));
            }
            labels.insert(key.into(), value.into());
        }

        for (key, value) in self.gs.labels().iter().filter(|(k, _)| keys::is_sync_key(k)) {
            if pod_labels.get(key) != Some(value) {
                labels.insert(key.clone(), value.clone().into());
            }
        }

        for (key, value) in self.gs.annotations().iter().filter(|(k, _)| keys::is_sync_key(k)) {
            if pod_annotations.get(key) != Some(value) {
                annotations.insert(key.clone(), value.clone().into());
            }
        }

        let pod_containers = self
            .pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default();
        let containers: Vec<Value> = self
            .gs
            .spec
            .containers
            .iter()
            .filter_map(|container| {
                let image = container.image.as_ref()?;
                let live = pod_containers.iter().find(|c| c.name == container.name)?;
                (live.image.as_ref() != Some(image))
                    .then(|| json!({ "name": container.name, "image": image }))
            })
            .collect();

        if labels.is_empty() && annotations.is_empty() && containers.is_empty() {
            return Ok(false);
        }

        let mut metadata = Map::new();
        if !labels.is_empty() {
            metadata.insert("labels".into(), labels.into());
        }
        if !annotations.is_empty() {
            metadata.insert("annotations".into(), annotations.into());
        }
        let mut patch = json!({ "metadata": metadata });
        if !containers.is_empty() {
            patch["spec"] = json!({ "containers": containers });
        }

        tracing::debug!(%patch, "syncing game server to pod");
        if self
            .context
            .client
            .patch_pod(&self.namespace, &self.name, &patch)
            .await
            .ignore_not_found()?
            .is_none()
        {
            return Ok(false);
        }

        for (reason, note) in changes {
            self.publish(EventType::Normal, reason, note).await;
        }

        Ok(true)
    }

    /// Writes what was observed of the pod into the `GameServer`, returning
    /// the computed status.
    #[tracing::instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn sync_pod_to_gs(&self, now: &Time) -> Result<GameServerStatus, Error> {
        let previous = self.gs.status.clone().unwrap_or_default();
        let pod_conditions = self
            .pod
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default();
        let qualities = self
            .gss
            .as_ref()
            .map(|gss| gss.spec.service_qualities.as_slice())
            .unwrap_or_default();

        let evaluation = service_quality::evaluate(
            qualities,
            pod_conditions,
            &previous.service_qualities_condition,
            &self.gs.spec,
            now,
        );

        self.sync_metadata_and_spec(&evaluation).await?;

        let state = derive_state(&self.pod);
        let status = GameServerStatus {
            desired_state: GameServerState::Ready,
            current_state: state,
            network_status: self.sync_network_status(now).await?,
            pod_status: self.pod.status.clone(),
            service_qualities_condition: evaluation.conditions,
            conditions: self.conditions(&previous.conditions, now).await?,
            update_priority: self.priority_from_pod(keys::UPDATE_PRIORITY),
            deletion_priority: self.priority_from_pod(keys::DELETION_PRIORITY),
            last_transition_time: if previous.current_state == state && self.gs.status.is_some() {
                previous.last_transition_time.clone()
            } else {
                Some(now.clone())
            },
        };

        if self.gs.status.as_ref() != Some(&status) {
            let patch = status_patch(self.gs.status.as_ref(), &status)?;
            self.context
                .client
                .patch_game_server_status(&self.namespace, &self.name, &patch)
                .await
                .ignore_not_found()?;
        }

        Ok(status)
    }

    fn priority_from_pod(&self, key: &str) -> Option<IntOrString> {
        self.pod.labels().get(key).map(|value| {
            value
                .parse()
                .map(IntOrString::Int)
                .unwrap_or_else(|_| IntOrString::String(value.clone()))
        })
    }

    /// Applies service quality results to the spec, and mirrors sync-prefixed
    /// metadata which only exists on the pod.
    async fn sync_metadata_and_spec(
        &self,
        evaluation: &service_quality::Evaluation,
    ) -> Result<(), Error> {
        let gs_labels = self.gs.labels();
        let gs_annotations = self.gs.annotations();

        let pod_only = |pod: &BTreeMap<String, String>, gs: &BTreeMap<String, String>| {
            pod.iter()
                .filter(|(k, _)| keys::is_sync_key(k) && !gs.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>()
        };
        let changed = |extra: &BTreeMap<String, String>, gs: &BTreeMap<String, String>| {
            extra
                .iter()
                .filter(|(k, v)| gs.get(*k) != Some(*v))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>()
        };

        let mut labels = pod_only(self.pod.labels(), gs_labels);
        labels.extend(changed(&evaluation.labels, gs_labels));
        let mut annotations = pod_only(self.pod.annotations(), gs_annotations);
        annotations.extend(changed(&evaluation.annotations, gs_annotations));

        if evaluation.spec == self.gs.spec && labels.is_empty() && annotations.is_empty() {
            return Ok(());
        }

        let patch = json!({
            "metadata": { "labels": labels, "annotations": annotations },
            "spec": evaluation.spec,
        });
        tracing::debug!(%patch, "updating game server spec");
        self.context
            .client
            .patch_game_server(&self.namespace, &self.name, &patch)
            .await
            .ignore_not_found()?;
        Ok(())
    }

    async fn conditions(
        &self,
        previous: &[GameServerCondition],
        now: &Time,
    ) -> Result<Vec<GameServerCondition>, Error> {
        let node = match self.pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) {
            Some(node_name) => match self.context.client.get_node(node_name).await? {
                Some(node) => condition::node_condition(&node),
                None => Summary::abnormal("NodeNotFound", format!("node {node_name} not found")),
            },
            None => Summary::normal(),
        };
        let volumes = condition::persistent_volume_condition(&self.volume_lookups().await?);

        Ok(vec![
            condition::to_condition(
                GameServerConditionType::PodNormal,
                condition::pod_condition(&self.pod),
                previous,
                now,
            ),
            condition::to_condition(GameServerConditionType::NodeNormal, node, previous, now),
            condition::to_condition(
                GameServerConditionType::PersistentVolumeNormal,
                volumes,
                previous,
                now,
            ),
        ])
    }

    async fn volume_lookups(&self) -> Result<Vec<VolumeLookup>, Error> {
        let claims = self
            .pod
            .spec
            .iter()
            .flat_map(|spec| spec.volumes.iter().flatten())
            .filter_map(|volume| volume.persistent_volume_claim.as_ref())
            .map(|claim| claim.claim_name.clone());

        let mut lookups = Vec::new();
        for claim in claims {
            let client = &self.context.client;
            let Some(pvc) = client
                .get_persistent_volume_claim(&self.namespace, &claim)
                .await?
            else {
                lookups.push(VolumeLookup::ClaimMissing(claim));
                continue;
            };

            let volume_name = pvc.spec.as_ref().and_then(|spec| spec.volume_name.as_deref());
            let volume = match volume_name {
                Some(name) => client.get_persistent_volume(name).await?,
                None => None,
            };

            lookups.push(match volume {
                Some(volume) => VolumeLookup::Found(Box::new(volume)),
                None => VolumeLookup::VolumeMissing(claim),
            });
        }

        Ok(lookups)
    }

    /// Reads the network status reported for the pod, and asks the network
    /// plugin to move it to the state the `GameServer` wants.
    async fn sync_network_status(&self, now: &Time) -> Result<Option<NetworkStatus>, Error> {
        let Some(manager) = self.context.network.manager_for(&self.pod) else {
            return Ok(None);
        };

        let desired = if self.gs.spec.network_disabled {
            NetworkState::NotReady
        } else {
            NetworkState::Ready
        };

        let previous = self
            .gs
            .status
            .as_ref()
            .and_then(|status| status.network_status.clone());
        let mut status = match manager.network_status()?.or(previous) {
            Some(status) => status,
            None => NetworkStatus {
                desired_network_state: desired,
                current_network_state: NetworkState::NotReady,
                create_time: Some(now.clone()),
                last_transition_time: Some(now.clone()),
                ..<_>::default()
            },
        };
        status.network_type = manager.network_type();

        if status.desired_network_state != desired {
            status.desired_network_state = desired;
            status.last_transition_time = Some(now.clone());

            let pod = manager.update_network_status(&status, self.pod.clone())?;
            let patch = json!({
                "metadata": {
                    "annotations": {
                        keys::NETWORK_STATUS: pod.annotations().get(keys::NETWORK_STATUS),
                    }
                }
            });
            self.context
                .client
                .patch_pod(&self.namespace, &self.name, &patch)
                .await
                .ignore_not_found()?;
        }

        Ok(Some(status))
    }

    /// Whether to keep waiting on the network before the game server is
    /// considered settled. A timeout is reported once per network transition.
    #[tracing::instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn wait_or_not(&self, status: &GameServerStatus, now: &Time) -> Result<bool, Error> {
        let network = status.network_status.as_ref();
        match network_wait(network, now, self.context.config.network_total_wait_time) {
            NetworkWait::Proceed => Ok(false),
            NetworkWait::Wait => Ok(true),
            NetworkWait::TimedOut => {
                let marker = network
                    .and_then(|n| n.last_transition_time.as_ref().or(n.create_time.as_ref()))
                    .map(|time| time.0.to_rfc3339())
                    .unwrap_or_default();

                if self.gs.annotations().get(keys::NETWORK_TIMEOUT_REPORTED) == Some(&marker) {
                    return Ok(false);
                }

                tracing::warn!("network did not become ready in time");
                let budget = self.context.config.network_total_wait_time;
                self.publish(
                    EventType::Warning,
                    reasons::NETWORK_WAIT_TIMEOUT,
                    format!("network did not reach its desired state within {budget:?}"),
                )
                .await;

                let patch = json!({
                    "metadata": { "annotations": { keys::NETWORK_TIMEOUT_REPORTED: marker } }
                });
                self.context
                    .client
                    .patch_game_server(&self.namespace, &self.name, &patch)
                    .await
                    .ignore_not_found()?;
                Ok(false)
            }
        }
    }
}
