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

//! Builds the objects a fleet is made of: its workload and its probe marker.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{PodReadinessGate, PodSpec, PodTemplateSpec},
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::{Resource, ResourceExt};
use serde::Serialize;

use crate::{
    crd::{
        keys,
        kruise::{
            ContainerProbeSpec, PodContainerProbe, PodProbeMarkerSpec,
            RollingUpdateStatefulSetStrategy, StatefulSetScaleStrategy, StatefulSetSpec,
            StatefulSetUpdateStrategy, UnorderedUpdateStrategy, UpdatePriorityOrderTerm,
            UpdatePriorityStrategy,
        },
        GameServerSet, GameServerTemplate, Network, PodProbeMarker, ScaleStrategy, StatefulSet,
        UpdateStrategy,
    },
    hash, Error,
};

const PARALLEL: &str = "Parallel";

/// The parts of a fleet which, when changed, require the workload to be
/// rebuilt.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkloadHashInput<'a> {
    template: &'a GameServerTemplate,
    update_strategy: &'a UpdateStrategy,
    scale_strategy: &'a ScaleStrategy,
    service_name: String,
    network: Option<&'a Network>,
}

pub fn workload_hash(gss: &GameServerSet) -> Result<String, Error> {
    Ok(hash::content_hash(&WorkloadHashInput {
        template: &gss.spec.game_server_template,
        update_strategy: &gss.spec.update_strategy,
        scale_strategy: &gss.spec.scale_strategy,
        service_name: gss.service_name(),
        network: gss.spec.network.as_ref(),
    })?)
}

/// Hash of what a game server is created from, used to detect template
/// rollouts.
pub fn template_hash(gss: &GameServerSet) -> Result<String, Error> {
    Ok(hash::content_hash(&(
        &gss.spec.game_server_template,
        gss.spec.network.as_ref(),
    ))?)
}

pub fn selector(gss: &GameServerSet) -> LabelSelector {
    LabelSelector {
        match_labels: Some([(keys::OWNER_GSS.to_owned(), gss.name_any())].into()),
        ..<_>::default()
    }
}

/// Builds the workload backing `gss`. Replica count and reserved ordinals
/// are left for the scale path to fill in.
pub fn build_workload(gss: &GameServerSet) -> Result<StatefulSet, Error> {
    let name = gss.name_any();
    let template = &gss.spec.game_server_template;

    let mut metadata = template.metadata.clone().unwrap_or_default();
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(keys::OWNER_GSS.into(), name.clone());
    if let Some(network) = &gss.spec.network {
        let annotations = metadata.annotations.get_or_insert_with(BTreeMap::new);
        if let Some(network_type) = &network.network_type {
            annotations.insert(keys::NETWORK_TYPE.into(), network_type.clone());
        }
        annotations.insert(
            keys::NETWORK_CONF.into(),
            serde_json::to_string(&network.network_conf)?,
        );
    }

    let mut spec = template.spec.clone().unwrap_or_default();
    add_in_place_readiness_gate(&mut spec);

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: gss.namespace(),
            labels: Some([(keys::OWNER_GSS.to_owned(), gss.name_any())].into()),
            annotations: Some([(keys::WORKLOAD_HASH.to_owned(), workload_hash(gss)?)].into()),
            owner_references: gss.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..<_>::default()
        },
        spec: StatefulSetSpec {
            replicas: Some(gss.spec.replicas),
            selector: selector(gss),
            template: PodTemplateSpec {
                metadata: Some(metadata),
                spec: Some(spec),
            },
            volume_claim_templates: template.volume_claim_templates.clone(),
            service_name: gss.service_name(),
            pod_management_policy: Some(PARALLEL.into()),
            update_strategy: Some(update_strategy(&gss.spec.update_strategy)),
            scale_strategy: Some(StatefulSetScaleStrategy {
                max_unavailable: gss.spec.scale_strategy.max_unavailable.clone(),
            }),
            reserve_ordinals: gss.spec.reserve_game_server_ids.clone(),
        },
        status: None,
    })
}

/// `workload` rebuilt from the current fleet spec, keeping the replica count
/// and reservations the scale path manages.
pub fn rebuild_workload(gss: &GameServerSet, workload: &StatefulSet) -> Result<StatefulSet, Error> {
    let mut rebuilt = build_workload(gss)?;
    rebuilt.spec.replicas = workload.spec.replicas;
    rebuilt.spec.reserve_ordinals = workload.spec.reserve_ordinals.clone();

    let mut metadata = workload.metadata.clone();
    metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(keys::WORKLOAD_HASH.into(), workload_hash(gss)?);
    rebuilt.metadata = metadata;
    Ok(rebuilt)
}

fn add_in_place_readiness_gate(spec: &mut PodSpec) {
    let gates = spec.readiness_gates.get_or_insert_with(Vec::new);
    if !gates
        .iter()
        .any(|gate| gate.condition_type == keys::IN_PLACE_UPDATE_READY)
    {
        gates.push(PodReadinessGate {
            condition_type: keys::IN_PLACE_UPDATE_READY.into(),
        });
    }
}

fn update_strategy(strategy: &UpdateStrategy) -> StatefulSetUpdateStrategy {
    let rolling = strategy.rolling_update.clone().unwrap_or_default();
    StatefulSetUpdateStrategy {
        type_: strategy.type_.clone(),
        rolling_update: Some(RollingUpdateStatefulSetStrategy {
            partition: rolling.partition,
            max_unavailable: rolling.max_unavailable,
            pod_update_policy: rolling
                .pod_update_policy
                .map(|policy| policy.as_ref().to_owned()),
            paused: rolling.paused,
            min_ready_seconds: rolling.min_ready_seconds,
            unordered_update: Some(UnorderedUpdateStrategy {
                priority_strategy: Some(UpdatePriorityStrategy {
                    order_priority: vec![UpdatePriorityOrderTerm {
                        ordered_key: keys::UPDATE_PRIORITY.into(),
                    }],
                }),
            }),
        }),
    }
}

/// One probe per service quality which declares a probe.
pub fn probes(gss: &GameServerSet) -> Vec<PodContainerProbe> {
    let first_container = gss
        .spec
        .game_server_template
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .map(|container| container.name.clone())
        .unwrap_or_default();

    gss.spec
        .service_qualities
        .iter()
        .filter_map(|quality| {
            let probe = quality.probe.clone()?;
            Some(PodContainerProbe {
                name: quality.name.clone(),
                container_name: quality
                    .container_name
                    .clone()
                    .unwrap_or_else(|| first_container.clone()),
                probe: ContainerProbeSpec { probe },
                pod_condition_type: Some(keys::service_quality_condition(&quality.name)),
            })
        })
        .collect()
}

pub fn probe_marker_hash(probes: &[PodContainerProbe]) -> Result<String, Error> {
    Ok(hash::content_hash(probes)?)
}

pub fn build_probe_marker(gss: &GameServerSet) -> Result<PodProbeMarker, Error> {
    let probes = probes(gss);
    Ok(PodProbeMarker {
        metadata: ObjectMeta {
            name: Some(gss.name_any()),
            namespace: gss.namespace(),
            annotations: Some(
                [(keys::PROBE_MARKER_HASH.to_owned(), probe_marker_hash(&probes)?)].into(),
            ),
            owner_references: gss.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..<_>::default()
        },
        spec: PodProbeMarkerSpec {
            selector: selector(gss),
            probes,
        },
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{Container, Probe, TCPSocketAction};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crd::{
        GameServerSetSpec, NetworkConfParam, PodUpdatePolicy, RollingUpdateStrategy,
        ServiceQuality,
    };

    fn fleet() -> GameServerSet {
        let mut gss = GameServerSet::new(
            "minecraft",
            GameServerSetSpec {
                replicas: 3,
                game_server_template: GameServerTemplate {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "minecraft".into(),
                            image: Some("minecraft:1.0".into()),
                            ..<_>::default()
                        }],
                        ..<_>::default()
                    }),
                    ..<_>::default()
                },
                update_strategy: UpdateStrategy {
                    rolling_update: Some(RollingUpdateStrategy {
                        pod_update_policy: Some(PodUpdatePolicy::InPlaceIfPossible),
                        ..<_>::default()
                    }),
                    ..<_>::default()
                },
                network: Some(Network {
                    network_type: Some("Kubernetes-HostPort".into()),
                    network_conf: vec![NetworkConfParam {
                        name: "ContainerPorts".into(),
                        value: "minecraft:25565/TCP".into(),
                    }],
                }),
                ..<_>::default()
            },
        );
        gss.metadata.namespace = Some("default".into());
        gss.metadata.uid = Some("gss-uid".into());
        gss
    }

    fn healthy(name: &str, container: Option<&str>) -> ServiceQuality {
        ServiceQuality {
            name: name.into(),
            container_name: container.map(String::from),
            probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(25565),
                    ..<_>::default()
                }),
                ..<_>::default()
            }),
            ..<_>::default()
        }
    }

    #[test]
    fn workload_shape() {
        let gss = fleet();
        let workload = build_workload(&gss).unwrap();

        assert_eq!(workload.name_any(), "minecraft");
        assert_eq!(workload.spec.replicas, Some(3));
        assert_eq!(workload.spec.service_name, "minecraft");
        assert_eq!(workload.spec.pod_management_policy.as_deref(), Some("Parallel"));
        assert_eq!(workload.owner_references()[0].uid, "gss-uid");
        assert_eq!(
            workload.annotations().get(keys::WORKLOAD_HASH),
            Some(&workload_hash(&gss).unwrap())
        );

        let template = workload.spec.template.metadata.as_ref().unwrap();
        assert_eq!(
            template.labels.as_ref().unwrap().get(keys::OWNER_GSS).unwrap(),
            "minecraft"
        );
        let annotations = template.annotations.as_ref().unwrap();
        assert_eq!(annotations[keys::NETWORK_TYPE], "Kubernetes-HostPort");
        assert_eq!(
            annotations[keys::NETWORK_CONF],
            r#"[{"name":"ContainerPorts","value":"minecraft:25565/TCP"}]"#
        );

        let gates = workload.spec.template.spec.as_ref().unwrap().readiness_gates.as_ref().unwrap();
        assert_eq!(gates[0].condition_type, "InPlaceUpdateReady");

        let rolling = workload.spec.update_strategy.unwrap().rolling_update.unwrap();
        assert_eq!(rolling.pod_update_policy.as_deref(), Some("InPlaceIfPossible"));
        assert_eq!(
            rolling.unordered_update.unwrap().priority_strategy.unwrap().order_priority[0].ordered_key,
            keys::UPDATE_PRIORITY
        );
    }

    #[test]
    fn readiness_gate_is_added_once() {
        let mut spec = PodSpec::default();
        add_in_place_readiness_gate(&mut spec);
        add_in_place_readiness_gate(&mut spec);
        assert_eq!(spec.readiness_gates.unwrap().len(), 1);
    }

    #[test]
    fn rebuild_keeps_scale_state() {
        let gss = fleet();
        let mut workload = build_workload(&gss).unwrap();
        workload.spec.replicas = Some(7);
        workload.spec.reserve_ordinals = vec![2];
        workload.metadata.resource_version = Some("42".into());

        let mut changed = gss.clone();
        changed.spec.game_server_template.spec.as_mut().unwrap().containers[0].image =
            Some("minecraft:1.1".into());
        assert_ne!(workload_hash(&gss).unwrap(), workload_hash(&changed).unwrap());

        let rebuilt = rebuild_workload(&changed, &workload).unwrap();
        assert_eq!(rebuilt.spec.replicas, Some(7));
        assert_eq!(rebuilt.spec.reserve_ordinals, vec![2]);
        assert_eq!(rebuilt.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(
            rebuilt.annotations().get(keys::WORKLOAD_HASH),
            Some(&workload_hash(&changed).unwrap())
        );
        assert_eq!(
            rebuilt.spec.template.spec.unwrap().containers[0].image.as_deref(),
            Some("minecraft:1.1")
        );
    }

    #[test]
    fn replica_changes_do_not_change_hashes() {
        let gss = fleet();
        let mut scaled = gss.clone();
        scaled.spec.replicas = 10;
        scaled.spec.reserve_game_server_ids = vec![1];

        assert_eq!(workload_hash(&gss).unwrap(), workload_hash(&scaled).unwrap());
        assert_eq!(template_hash(&gss).unwrap(), template_hash(&scaled).unwrap());
    }

    #[test]
    fn probe_marker_shape() {
        let mut gss = fleet();
        gss.spec.service_qualities = vec![
            healthy("healthy", None),
            healthy("idle", Some("sidecar")),
            ServiceQuality {
                name: "no-probe".into(),
                ..<_>::default()
            },
        ];

        let marker = build_probe_marker(&gss).unwrap();
        let declared = &marker.spec.probes;
        assert_eq!(declared.len(), 2);
        assert_eq!(declared[0].container_name, "minecraft");
        assert_eq!(declared[0].pod_condition_type.as_deref(), Some("game.kruise.io/healthy"));
        assert_eq!(declared[1].container_name, "sidecar");
        assert_eq!(
            marker.spec.selector.match_labels.as_ref().unwrap()[keys::OWNER_GSS],
            "minecraft"
        );
        assert_eq!(
            marker.annotations()[keys::PROBE_MARKER_HASH],
            probe_marker_hash(declared).unwrap()
        );
    }
}
