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

//! Keeps a fleet's workload, probe marker, `GameServer`s and status in line
//! with its spec.

use std::{sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::Pod;
use kube::{runtime::events::EventType, Resource, ResourceExt};
use serde_json::{json, Value};
use tokio::task::JoinSet;

use super::{
    scale::{self, ScaleInput},
    workload,
};
use crate::{
    controllers::{namespace_of, status_patch, Context},
    crd::{
        keys, GameServerSet, GameServerSetStatus, OpsState, ScaleDownStrategyType, StatefulSet,
    },
    error::ResultExt,
    events::reasons,
    hash,
    util::{self, in_a_not_in_b, is_slice_equal, to_ranges},
    Error,
};

/// Upper bound on marking stale `GameServer`s after a scale.
const SYNC_REPLICAS_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GameServerSetManager {
    gss: GameServerSet,
    context: Arc<Context>,
    namespace: String,
    name: String,
}

impl GameServerSetManager {
    pub fn new(gss: GameServerSet, context: Arc<Context>) -> Result<Self, Error> {
        let namespace = namespace_of(&gss)?;
        let name = gss.name_any();
        Ok(Self {
            gss,
            context,
            namespace,
            name,
        })
    }

    /// Label selector matching every member of the fleet.
    pub fn member_selector(&self) -> String {
        format!("{}={}", keys::OWNER_GSS, self.name)
    }

    async fn publish(&self, type_: EventType, reason: &str, note: String) {
        self.context
            .events
            .publish(&self.gss.object_ref(&()), type_, reason, Some(note))
            .await;
    }

    async fn patch_fleet(&self, patch: &Value) -> Result<(), Error> {
        self.context
            .client
            .patch_game_server_set(&self.namespace, &self.name, patch)
            .await
    }

    /// Makes the probe marker match the fleet's service qualities. Returns
    /// whether it is in sync and observed.
    #[tracing::instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn sync_pod_probe_marker(&self) -> Result<bool, Error> {
        let client = &self.context.client;
        let qualities = &self.gss.spec.service_qualities;
        let existing = client.get_probe_marker(&self.namespace, &self.name).await?;

        let Some(existing) = existing else {
            if qualities.is_empty() {
                return Ok(true);
            }

            let marker = workload::build_probe_marker(&self.gss)?;
            client.create_probe_marker(&self.namespace, &marker).await?;
            tracing::info!("created pod probe marker");
            self.publish(
                EventType::Normal,
                reasons::CREATE_PROBE_MARKER,
                format!("created PodProbeMarker {}", self.name),
            )
            .await;
            return Ok(false);
        };

        if qualities.is_empty() {
            client
                .delete_probe_marker(&self.namespace, &self.name)
                .await
                .ignore_not_found()?;
            self.publish(
                EventType::Normal,
                reasons::DELETE_PROBE_MARKER,
                format!("deleted PodProbeMarker {}", self.name),
            )
            .await;
            return Ok(true);
        }

        let probes = workload::probes(&self.gss);
        let hash = workload::probe_marker_hash(&probes)?;
        if !hash::matches(existing.annotations(), keys::PROBE_MARKER_HASH, &hash) {
            let mut marker = workload::build_probe_marker(&self.gss)?;
            marker.metadata = existing.metadata.clone();
            marker
                .annotations_mut()
                .insert(keys::PROBE_MARKER_HASH.into(), hash);
            client.replace_probe_marker(&self.namespace, &marker).await?;
            tracing::info!("updated pod probe marker");
            self.publish(
                EventType::Normal,
                reasons::UPDATE_PROBE_MARKER,
                format!("updated PodProbeMarker {}", self.name),
            )
            .await;
            return Ok(false);
        }

        Ok(existing.is_observed())
    }

    /// Fetches the fleet's workload, creating it when missing. Returns `None`
    /// when the workload was only just created.
    pub async fn get_or_create_workload(&self) -> Result<Option<StatefulSet>, Error> {
        let client = &self.context.client;
        if let Some(workload) = client.get_workload(&self.namespace, &self.name).await? {
            return Ok(Some(workload));
        }

        let workload = workload::build_workload(&self.gss)?;
        match client.create_workload(&self.namespace, &workload).await {
            Ok(()) => {
                tracing::info!(replicas = self.gss.spec.replicas, "created workload");
                self.publish(
                    EventType::Normal,
                    reasons::CREATE_WORKLOAD,
                    format!("created workload {}", self.name),
                )
                .await;
                Ok(None)
            }
            Err(error) if error.is_already_exists() => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// The replica count with every `Kill` marked member removed, when any are
    /// waiting and the fleet is otherwise at rest.
    pub fn replicas_after_killing(&self, workload: &StatefulSet, pods: &[Pod]) -> Option<i32> {
        let replicas = self.gss.spec.replicas;
        if replicas != workload.spec_replicas() || replicas != workload.status_replicas() {
            return None;
        }

        let killed = pods
            .iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter(|pod| {
                OpsState::from_label(pod.labels().get(keys::OPS_STATE).map(String::as_str))
                    == OpsState::Kill
            })
            .count() as i32;

        (killed > 0).then(|| replicas - killed)
    }

    pub async fn kill(&self, replicas: i32) -> Result<(), Error> {
        tracing::info!(from = self.gss.spec.replicas, to = replicas, "killing game servers");
        self.patch_fleet(&json!({ "spec": { "replicas": replicas } }))
            .await?;
        self.publish(
            EventType::Normal,
            reasons::KILL,
            format!(
                "replicas lowered from {} to {} to remove killed game servers",
                self.gss.spec.replicas, replicas
            ),
        )
        .await;
        Ok(())
    }

    pub fn is_need_to_scale(&self, workload: &StatefulSet) -> bool {
        if workload.is_resizing() {
            return false;
        }

        self.gss.spec.replicas != workload.spec_replicas()
            || !is_slice_equal(
                &self.gss.spec.reserve_game_server_ids,
                &self.gss.applied_reserve_ids(),
            )
    }

    /// Moves the workload to the fleet's replica count and reservations.
    #[tracing::instrument(skip_all, fields(namespace = %self.namespace, name = %self.name))]
    pub async fn game_server_scale(&self, workload: &StatefulSet, pods: &[Pod]) -> Result<(), Error> {
        let old_reserved = self.gss.applied_reserve_ids();
        let new_reserved = util::dedup(&self.gss.spec.reserve_game_server_ids);
        let not_exist = in_a_not_in_b(&workload.spec.reserve_ordinals, &old_reserved);

        let plan = scale::plan(&ScaleInput {
            old_reserved: &old_reserved,
            new_reserved: &new_reserved,
            not_exist: &not_exist,
            replicas: self.gss.spec.replicas,
            pods,
        });
        tracing::info!(
            current = pods.len(),
            desired = self.gss.spec.replicas,
            to_add = ?plan.to_add,
            to_delete = ?plan.to_delete,
            reserve_ordinals = ?plan.reserve_ordinals,
            "scaling fleet"
        );

        let scale_strategy = workload::build_workload(&self.gss)?.spec.scale_strategy;
        self.context
            .client
            .patch_workload(
                &self.namespace,
                &self.name,
                &json!({
                    "spec": {
                        "replicas": self.gss.spec.replicas,
                        "reserveOrdinals": plan.reserve_ordinals,
                        "scaleStrategy": scale_strategy,
                    }
                }),
            )
            .await?;

        let mut fleet_patch = json!({ "metadata": { "annotations": {} } });
        let reserved = match self.gss.spec.scale_strategy.scale_down_strategy_type {
            ScaleDownStrategyType::General => new_reserved,
            ScaleDownStrategyType::ReserveIds => {
                let mut reserved = new_reserved;
                reserved.extend_from_slice(&plan.victims);
                let reserved = util::dedup(&reserved);
                fleet_patch["spec"] = json!({ "reserveGameServerIds": reserved });
                reserved
            }
        };
        fleet_patch["metadata"]["annotations"][keys::RESERVE_IDS] = to_ranges(&reserved).into();
        self.patch_fleet(&fleet_patch).await?;

        self.publish(
            EventType::Normal,
            reasons::SCALE,
            format!(
                "scaled from {} to {} replicas",
                workload.spec_replicas(),
                self.gss.spec.replicas
            ),
        )
        .await;

        self.sync_game_server_replicas(&plan.ordinals).await
    }

    /// Marks the `GameServer`s whose ordinal left the fleet as deleting, and
    /// clears the mark from those which are back.
    pub async fn sync_game_server_replicas(&self, ordinals: &[i32]) -> Result<(), Error> {
        let game_servers = self
            .context
            .client
            .list_game_servers(&self.namespace, &self.member_selector())
            .await?;

        let mut tasks = JoinSet::new();
        for gs in game_servers {
            let in_fleet = ordinals.contains(&util::ordinal(&gs.name_any()));
            let patch = match (in_fleet, gs.is_marked_deleting()) {
                (false, false) => json!({ "metadata": { "labels": { keys::DELETING: "true" } } }),
                (true, true) => json!({ "metadata": { "labels": { keys::DELETING: null } } }),
                _ => continue,
            };

            let client = self.context.client.clone();
            let namespace = self.namespace.clone();
            let name = gs.name_any();
            tasks.spawn(async move {
                tracing::debug!(game_server = %name, %patch, "updating deletion mark");
                client
                    .patch_game_server(&namespace, &name, &patch)
                    .await
                    .ignore_not_found()
                    .map(drop)
            });
        }

        tokio::time::timeout(SYNC_REPLICAS_TIMEOUT, async {
            while let Some(result) = tasks.join_next().await {
                result??;
            }
            Ok::<_, Error>(())
        })
        .await
        .map_err(|_| Error::Timeout(SYNC_REPLICAS_TIMEOUT))?
    }

    /// Whether the template changed under an `OnlyNew` auto update, so the
    /// partition has to be pinned to keep existing game servers as they are.
    pub fn is_need_to_adjust_partition(&self) -> Result<bool, Error> {
        if !self.gss.is_only_new_auto_update() {
            return Ok(false);
        }

        let hash = workload::template_hash(&self.gss)?;
        Ok(!hash::matches(self.gss.annotations(), keys::TEMPLATE_HASH, &hash))
    }

    pub async fn adjust_partition(&self) -> Result<(), Error> {
        let replicas = self.gss.spec.replicas;
        self.patch_fleet(&json!({
            "metadata": {
                "annotations": { keys::TEMPLATE_HASH: workload::template_hash(&self.gss)? }
            },
            "spec": { "updateStrategy": { "rollingUpdate": { "partition": replicas } } }
        }))
        .await?;

        tracing::info!(partition = replicas, "pinned update partition");
        self.publish(
            EventType::Normal,
            reasons::ADJUST_PARTITION,
            format!("partition set to {replicas} so only new game servers are updated"),
        )
        .await;
        Ok(())
    }

    pub fn is_need_to_update_workload(&self, workload: &StatefulSet) -> Result<bool, Error> {
        let hash = workload::workload_hash(&self.gss)?;
        Ok(!hash::matches(workload.annotations(), keys::WORKLOAD_HASH, &hash))
    }

    pub async fn update_workload(&self, workload: &StatefulSet) -> Result<(), Error> {
        let rebuilt = workload::rebuild_workload(&self.gss, workload)?;
        self.context
            .client
            .replace_workload(&self.namespace, &rebuilt)
            .await?;

        tracing::info!("updated workload");
        self.publish(
            EventType::Normal,
            reasons::UPDATE_WORKLOAD,
            format!("updated workload {}", self.name),
        )
        .await;
        Ok(())
    }

    /// Computes the fleet status from the workload and its pods, writing it
    /// only when it changed.
    pub async fn sync_status(
        &self,
        workload: &StatefulSet,
        pods: &[Pod],
    ) -> Result<GameServerSetStatus, Error> {
        let observed = workload.status.clone().unwrap_or_default();
        let tally = |state: OpsState| {
            pods.iter()
                .filter(|pod| {
                    OpsState::from_label(pod.labels().get(keys::OPS_STATE).map(String::as_str))
                        == state
                })
                .count() as i32
        };
        let pre_delete = pods
            .iter()
            .filter(|pod| {
                pod.labels().get(keys::LIFECYCLE_STATE).map(String::as_str)
                    == Some(keys::LIFECYCLE_PREPARING_DELETE)
            })
            .count() as i32;

        let status = GameServerSetStatus {
            observed_generation: self.gss.metadata.generation.unwrap_or_default(),
            replicas: observed.replicas,
            ready_replicas: observed.ready_replicas,
            available_replicas: observed.available_replicas,
            current_replicas: observed.current_replicas,
            updated_replicas: observed.updated_replicas,
            updated_ready_replicas: observed.updated_ready_replicas,
            maintaining_replicas: tally(OpsState::Maintaining),
            wait_to_be_deleted_replicas: tally(OpsState::WaitToDelete),
            pre_delete_replicas: pre_delete,
            label_selector: Some(
                observed
                    .label_selector
                    .unwrap_or_else(|| self.member_selector()),
            ),
        };

        if self.gss.status.as_ref() != Some(&status) {
            let patch = status_patch(self.gss.status.as_ref(), &status)?;
            self.context
                .client
                .patch_game_server_set_status(&self.namespace, &self.name, &patch)
                .await
                .ignore_not_found()?;
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::{
        api::core::v1::{Container, PodSpec, Probe, TCPSocketAction},
        apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
    };
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        client::MockKubeApi,
        controllers::test::{context, quiet_events},
        crd::{
            kruise::{PodProbeMarkerStatus, StatefulSetStatus},
            GameServer, GameServerSetSpec, GameServerSpec, GameServerTemplate, ServiceQuality,
        },
        events::MockEventPublisher,
    };

    fn fleet(replicas: i32) -> GameServerSet {
        let mut gss = GameServerSet::new(
            "minecraft",
            GameServerSetSpec {
                replicas,
                game_server_template: GameServerTemplate {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "minecraft".into(),
                            ..<_>::default()
                        }],
                        ..<_>::default()
                    }),
                    ..<_>::default()
                },
                ..<_>::default()
            },
        );
        gss.metadata.namespace = Some("default".into());
        gss.metadata.uid = Some("gss-uid".into());
        gss.metadata.generation = Some(4);
        gss
    }

    /// A workload at rest with `replicas` replicas.
    fn workload(gss: &GameServerSet, replicas: i32) -> StatefulSet {
        let mut workload = workload::build_workload(gss).unwrap();
        workload.spec.replicas = Some(replicas);
        workload.status = Some(StatefulSetStatus {
            replicas,
            ready_replicas: replicas,
            ..<_>::default()
        });
        workload
    }

    fn pod(ordinal: i32, ops_state: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("minecraft-{ordinal}")),
                namespace: Some("default".into()),
                labels: Some(
                    [
                        (keys::OWNER_GSS.to_owned(), "minecraft".to_owned()),
                        (keys::OPS_STATE.to_owned(), ops_state.to_owned()),
                    ]
                    .into(),
                ),
                ..<_>::default()
            },
            ..<_>::default()
        }
    }

    fn game_server(ordinal: i32, deleting: bool) -> GameServer {
        let mut gs = GameServer::new(&format!("minecraft-{ordinal}"), GameServerSpec::default());
        gs.metadata.namespace = Some("default".into());
        if deleting {
            gs.labels_mut().insert(keys::DELETING.into(), "true".into());
        }
        gs
    }

    fn quality(port: i32) -> ServiceQuality {
        ServiceQuality {
            name: "healthy".into(),
            probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(port),
                    ..<_>::default()
                }),
                ..<_>::default()
            }),
            ..<_>::default()
        }
    }

    type Captured = Arc<Mutex<Vec<(String, Value)>>>;

    fn capture(captured: &Captured) -> impl Fn(&str, &str, &Value) -> Result<(), Error> {
        let captured = captured.clone();
        move |_, name, patch| {
            captured.lock().unwrap().push((name.to_owned(), patch.clone()));
            Ok(())
        }
    }

    fn manager(gss: GameServerSet, client: MockKubeApi) -> GameServerSetManager {
        GameServerSetManager::new(gss, context(client, quiet_events())).unwrap()
    }

    #[tokio::test]
    async fn probe_marker_follows_qualities() {
        let mut gss = fleet(1);
        gss.spec.service_qualities = vec![quality(25565)];

        let mut observed = workload::build_probe_marker(&gss).unwrap();
        observed.metadata.generation = Some(1);
        observed.status = Some(PodProbeMarkerStatus {
            observed_generation: 1,
        });

        // Unchanged qualities: no writes.
        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning({
            let observed = observed.clone();
            move |_, _| Ok(Some(observed.clone()))
        });
        client.expect_replace_probe_marker().never();
        client.expect_create_probe_marker().never();
        assert!(manager(gss.clone(), client).sync_pod_probe_marker().await.unwrap());

        // A changed probe: exactly one replace carrying the new hash.
        let mut changed = gss.clone();
        changed.spec.service_qualities = vec![quality(25566)];
        let replaced = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning({
            let observed = observed.clone();
            move |_, _| Ok(Some(observed.clone()))
        });
        client.expect_replace_probe_marker().times(1).returning({
            let replaced = replaced.clone();
            move |_, marker| {
                replaced.lock().unwrap().push(marker.clone());
                Ok(())
            }
        });
        assert!(!manager(changed.clone(), client).sync_pod_probe_marker().await.unwrap());

        let replaced = replaced.lock().unwrap();
        assert_ne!(
            replaced[0].annotations()[keys::PROBE_MARKER_HASH],
            observed.annotations()[keys::PROBE_MARKER_HASH]
        );
        assert_eq!(replaced[0].metadata.generation, Some(1));
        assert_eq!(
            replaced[0].spec.probes[0].probe.probe.tcp_socket.as_ref().unwrap().port,
            IntOrString::Int(25566)
        );
    }

    #[tokio::test]
    async fn probe_marker_lifecycle() {
        let mut gss = fleet(1);

        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning(|_, _| Ok(None));
        assert!(manager(gss.clone(), client).sync_pod_probe_marker().await.unwrap());

        gss.spec.service_qualities = vec![quality(25565)];
        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning(|_, _| Ok(None));
        client.expect_create_probe_marker().times(1).returning(|_, _| Ok(()));
        assert!(!manager(gss.clone(), client).sync_pod_probe_marker().await.unwrap());

        // Not yet observed by its controller.
        let marker = workload::build_probe_marker(&gss).unwrap();
        let mut client = MockKubeApi::new();
        client
            .expect_get_probe_marker()
            .returning(move |_, _| Ok(Some(marker.clone())));
        assert!(!manager(gss.clone(), client).sync_pod_probe_marker().await.unwrap());

        let marker = workload::build_probe_marker(&gss).unwrap();
        gss.spec.service_qualities.clear();
        let mut client = MockKubeApi::new();
        client
            .expect_get_probe_marker()
            .returning(move |_, _| Ok(Some(marker.clone())));
        client
            .expect_delete_probe_marker()
            .times(1)
            .returning(|_, _| Err(Error::not_found()));
        assert!(manager(gss, client).sync_pod_probe_marker().await.unwrap());
    }

    #[tokio::test]
    async fn workload_is_created_when_missing() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockKubeApi::new();
        client.expect_get_workload().returning(|_, _| Ok(None));
        client.expect_create_workload().times(1).returning({
            let created = created.clone();
            move |_, workload| {
                created.lock().unwrap().push(workload.clone());
                Ok(())
            }
        });

        let result = manager(fleet(3), client).get_or_create_workload().await.unwrap();
        assert!(result.is_none());
        assert_eq!(created.lock().unwrap()[0].spec.replicas, Some(3));
    }

    #[test]
    fn kills_only_at_rest() {
        let gss = fleet(3);
        let pods = vec![pod(0, "None"), pod(1, "Kill"), pod(2, "Kill")];
        let client = MockKubeApi::new();
        let manager = manager(gss.clone(), client);

        assert_eq!(manager.replicas_after_killing(&workload(&gss, 3), &pods), Some(1));
        assert_eq!(manager.replicas_after_killing(&workload(&gss, 4), &pods), None);

        let mut terminating = pods.clone();
        for pod in &mut terminating[1..] {
            pod.metadata.deletion_timestamp = Some(crate::controllers::test::time(1));
        }
        assert_eq!(manager.replicas_after_killing(&workload(&gss, 3), &terminating), None);
    }

    #[test]
    fn scale_needed() {
        let gss = fleet(3);
        let m = manager(gss.clone(), MockKubeApi::new());
        assert!(!m.is_need_to_scale(&workload(&gss, 3)));
        assert!(m.is_need_to_scale(&workload(&gss, 2)));

        let mut resizing = workload(&gss, 2);
        resizing.status.as_mut().unwrap().replicas = 1;
        assert!(!m.is_need_to_scale(&resizing));

        let mut reserved = fleet(3);
        reserved.spec.reserve_game_server_ids = vec![3, 1];
        reserved
            .annotations_mut()
            .insert(keys::RESERVE_IDS.into(), "1".into());
        let m = manager(reserved.clone(), MockKubeApi::new());
        assert!(m.is_need_to_scale(&workload(&reserved, 3)));

        reserved
            .annotations_mut()
            .insert(keys::RESERVE_IDS.into(), "1,3".into());
        let m = manager(reserved.clone(), MockKubeApi::new());
        assert!(!m.is_need_to_scale(&workload(&reserved, 3)));
    }

    #[tokio::test]
    async fn scale_up_adds_next_ordinal() {
        let gss = fleet(3);
        let workloads: Captured = <_>::default();
        let fleets: Captured = <_>::default();

        let mut client = MockKubeApi::new();
        client
            .expect_patch_workload()
            .times(1)
            .returning(capture(&workloads));
        client
            .expect_patch_game_server_set()
            .times(1)
            .returning(capture(&fleets));
        client
            .expect_list_game_servers()
            .returning(|_, _| Ok(vec![game_server(0, false), game_server(1, false)]));
        client.expect_patch_game_server().never();

        let pods = vec![pod(0, "None"), pod(1, "None")];
        manager(gss.clone(), client)
            .game_server_scale(&workload(&gss, 2), &pods)
            .await
            .unwrap();

        let workloads = workloads.lock().unwrap();
        assert_eq!(workloads[0].1["spec"]["replicas"], 3);
        assert_eq!(workloads[0].1["spec"]["reserveOrdinals"], json!([]));
        assert_eq!(
            fleets.lock().unwrap()[0].1,
            json!({ "metadata": { "annotations": { keys::RESERVE_IDS: "" } } })
        );
    }

    #[tokio::test]
    async fn scale_down_marks_removed_game_servers() {
        let gss = fleet(2);
        let workloads: Captured = <_>::default();
        let game_servers: Captured = <_>::default();

        let mut client = MockKubeApi::new();
        client
            .expect_patch_workload()
            .times(1)
            .returning(capture(&workloads));
        client
            .expect_patch_game_server_set()
            .times(1)
            .returning(|_, _, _| Ok(()));
        client.expect_list_game_servers().returning(|_, _| {
            Ok((0..4).map(|ordinal| game_server(ordinal, false)).collect())
        });
        client
            .expect_patch_game_server()
            .times(2)
            .returning(capture(&game_servers));

        let pods = vec![
            pod(0, "None"),
            pod(1, "None"),
            pod(2, "WaitToDelete"),
            pod(3, "None"),
        ];
        manager(gss.clone(), client)
            .game_server_scale(&workload(&gss, 4), &pods)
            .await
            .unwrap();

        assert_eq!(workloads.lock().unwrap()[0].1["spec"]["reserveOrdinals"], json!([2, 3]));

        let mut marked: Vec<_> = game_servers.lock().unwrap().clone();
        marked.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(marked[0].0, "minecraft-2");
        assert_eq!(marked[1].0, "minecraft-3");
        assert_eq!(marked[0].1["metadata"]["labels"][keys::DELETING], "true");

        // The applied reservation is recorded, so the next pass is a no-op.
        let mut scaled = gss.clone();
        scaled
            .annotations_mut()
            .insert(keys::RESERVE_IDS.into(), String::new());
        let m = manager(scaled.clone(), MockKubeApi::new());
        assert!(!m.is_need_to_scale(&workload(&scaled, 2)));
    }

    #[tokio::test]
    async fn reserve_ids_strategy_records_victims() {
        let mut gss = fleet(1);
        gss.spec.scale_strategy.scale_down_strategy_type = ScaleDownStrategyType::ReserveIds;
        let fleets: Captured = <_>::default();

        let mut client = MockKubeApi::new();
        client.expect_patch_workload().returning(|_, _, _| Ok(()));
        client
            .expect_patch_game_server_set()
            .times(1)
            .returning(capture(&fleets));
        client.expect_list_game_servers().returning(|_, _| Ok(Vec::new()));

        let pods = vec![pod(0, "None"), pod(1, "None"), pod(2, "None")];
        manager(gss.clone(), client)
            .game_server_scale(&workload(&gss, 3), &pods)
            .await
            .unwrap();

        assert_eq!(
            fleets.lock().unwrap()[0].1,
            json!({
                "metadata": { "annotations": { keys::RESERVE_IDS: "1,2" } },
                "spec": { "reserveGameServerIds": [1, 2] }
            })
        );
    }

    #[tokio::test]
    async fn returning_game_servers_are_unmarked() {
        let game_servers: Captured = <_>::default();
        let mut client = MockKubeApi::new();
        client.expect_list_game_servers().returning(|_, _| {
            Ok(vec![game_server(0, false), game_server(1, true), game_server(5, true)])
        });
        client
            .expect_patch_game_server()
            .times(1)
            .returning(capture(&game_servers));

        manager(fleet(2), client)
            .sync_game_server_replicas(&[0, 1])
            .await
            .unwrap();

        let game_servers = game_servers.lock().unwrap();
        assert_eq!(game_servers[0].0, "minecraft-1");
        assert_eq!(
            game_servers[0].1,
            json!({ "metadata": { "labels": { keys::DELETING: null } } })
        );
    }

    #[tokio::test]
    async fn marking_surfaces_first_failure() {
        let mut client = MockKubeApi::new();
        client.expect_list_game_servers().returning(|_, _| {
            Ok(vec![game_server(3, false), game_server(4, false)])
        });
        client.expect_patch_game_server().returning(|_, name, _| {
            if name == "minecraft-3" {
                Err(Error::not_found())
            } else {
                Err(Error::api(500, "InternalError"))
            }
        });

        let error = manager(fleet(2), client)
            .sync_game_server_replicas(&[0, 1])
            .await
            .unwrap_err();
        assert!(!error.is_not_found());
    }

    #[tokio::test]
    async fn partition_pinned_for_only_new() {
        let mut gss = fleet(3);
        assert!(!manager(gss.clone(), MockKubeApi::new())
            .is_need_to_adjust_partition()
            .unwrap());

        gss.spec.update_strategy.auto_update_strategy = Some(<_>::default());
        let fleets: Captured = <_>::default();
        let mut client = MockKubeApi::new();
        client
            .expect_patch_game_server_set()
            .times(1)
            .returning(capture(&fleets));
        let m = manager(gss.clone(), client);
        assert!(m.is_need_to_adjust_partition().unwrap());
        m.adjust_partition().await.unwrap();

        let patch = fleets.lock().unwrap()[0].1.clone();
        assert_eq!(patch["spec"]["updateStrategy"]["rollingUpdate"]["partition"], 3);

        let hash = patch["metadata"]["annotations"][keys::TEMPLATE_HASH].clone();
        gss.annotations_mut()
            .insert(keys::TEMPLATE_HASH.into(), hash.as_str().unwrap().into());
        assert!(!manager(gss, MockKubeApi::new())
            .is_need_to_adjust_partition()
            .unwrap());
    }

    #[tokio::test]
    async fn workload_follows_template() {
        let gss = fleet(3);
        let current = workload(&gss, 3);
        assert!(!manager(gss.clone(), MockKubeApi::new())
            .is_need_to_update_workload(&current)
            .unwrap());

        let mut changed = gss.clone();
        changed.spec.service_name = Some("minecraft-headless".into());
        let mut client = MockKubeApi::new();
        client
            .expect_replace_workload()
            .times(1)
            .returning(|_, workload| {
                assert_eq!(workload.spec.service_name, "minecraft-headless");
                assert_eq!(workload.spec.replicas, Some(3));
                Ok(())
            });
        let m = manager(changed, client);
        assert!(m.is_need_to_update_workload(&current).unwrap());
        m.update_workload(&current).await.unwrap();
    }

    #[tokio::test]
    async fn status_tallies_members() {
        let gss = fleet(4);
        let mut pods = vec![
            pod(0, "Maintaining"),
            pod(1, "WaitToDelete"),
            pod(2, "WaitToDelete"),
            pod(3, "None"),
        ];
        pods[3]
            .labels_mut()
            .insert(keys::LIFECYCLE_STATE.into(), keys::LIFECYCLE_PREPARING_DELETE.into());

        let statuses: Captured = <_>::default();
        let mut client = MockKubeApi::new();
        client
            .expect_patch_game_server_set_status()
            .times(1)
            .returning(capture(&statuses));

        let status = manager(gss.clone(), client)
            .sync_status(&workload(&gss, 4), &pods)
            .await
            .unwrap();

        assert_eq!(status.observed_generation, 4);
        assert_eq!(status.replicas, 4);
        assert_eq!(status.ready_replicas, 4);
        assert_eq!(status.maintaining_replicas, 1);
        assert_eq!(status.wait_to_be_deleted_replicas, 2);
        assert_eq!(status.pre_delete_replicas, 1);
        assert_eq!(
            status.label_selector.as_deref(),
            Some("game.kruise.io/owner-gss=minecraft")
        );
        assert_eq!(statuses.lock().unwrap()[0].1["status"]["waitToBeDeletedReplicas"], 2);

        // Stored status is current: nothing to write.
        let mut synced = gss.clone();
        synced.status = Some(status.clone());
        let unchanged = manager(synced, MockKubeApi::new())
            .sync_status(&workload(&gss, 4), &pods)
            .await
            .unwrap();
        assert_eq!(unchanged, status);
    }

    #[tokio::test]
    async fn create_event_is_published() {
        let mut client = MockKubeApi::new();
        client.expect_get_workload().returning(|_, _| Ok(None));
        client.expect_create_workload().returning(|_, _| Ok(()));
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .times(1)
            .returning(|_, _, reason, _| assert_eq!(reason, reasons::CREATE_WORKLOAD));

        GameServerSetManager::new(fleet(1), context(client, events))
            .unwrap()
            .get_or_create_workload()
            .await
            .unwrap();
    }
}
