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

//! Reconciles a `GameServerSet` into its workload, probe marker and
//! `GameServer`s.

mod manager;
mod scale;
mod workload;

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::Api,
    runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
    ResourceExt,
};

pub use self::{
    manager::GameServerSetManager,
    scale::{plan, ScaleInput, ScalePlan},
};

use super::{controller_config, log_reconcile_result, observe, Context, ERROR_REQUEUE};
use crate::{
    crd::{keys, GameServerSet, PodProbeMarker, StatefulSet},
    Error,
};

const CONTROLLER: &str = "gameserverset";

/// Delay before checking again on a probe marker which is not yet in sync.
const PROBE_MARKER_REQUEUE: Duration = Duration::from_secs(3);

pub async fn controller(client: kube::Client, context: Arc<Context>, watcher_config: watcher::Config) {
    tracing::info!("starting game server set controller");
    let fleets = Api::<GameServerSet>::all(client.clone());
    let workloads = Api::<StatefulSet>::all(client.clone());
    let probe_markers = Api::<PodProbeMarker>::all(client.clone());
    let pods = Api::<Pod>::all(client);

    Controller::new(fleets, watcher_config.clone())
        .owns(workloads, watcher_config.clone())
        .owns(probe_markers, watcher_config.clone())
        .watches(pods, watcher_config.labels(keys::OWNER_GSS), |pod| {
            let owner = pod.labels().get(keys::OWNER_GSS)?;
            Some(ObjectRef::<GameServerSet>::new(owner).within(&pod.namespace()?))
        })
        .with_config(controller_config(&context))
        .run(reconcile, error_policy, context)
        .for_each(log_reconcile_result("GameServerSet"))
        .await;
}

fn error_policy(gss: Arc<GameServerSet>, error: &Error, _: Arc<Context>) -> Action {
    tracing::error!(name = %gss.name_any(), %error, "game server set reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}

#[tracing::instrument(skip_all, fields(namespace = ?gss.metadata.namespace, name = ?gss.metadata.name))]
async fn reconcile(gss: Arc<GameServerSet>, context: Arc<Context>) -> Result<Action, Error> {
    let started = std::time::Instant::now();
    let result = reconcile_inner(gss.as_ref().clone(), context).await;
    observe(CONTROLLER, started, &result);
    result
}

async fn reconcile_inner(gss: GameServerSet, context: Arc<Context>) -> Result<Action, Error> {
    if gss.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let manager = GameServerSetManager::new(gss, context.clone())?;
    if !manager.sync_pod_probe_marker().await? {
        return Ok(Action::requeue(PROBE_MARKER_REQUEUE));
    }

    let Some(workload) = manager.get_or_create_workload().await? else {
        return Ok(Action::await_change());
    };

    let namespace = super::namespace_of(&workload)?;
    let pods = context
        .client
        .list_pods(&namespace, &manager.member_selector())
        .await?;

    // Terminating pods are already leaving the workload and are not counted
    // again here.
    if let Some(replicas) = manager.replicas_after_killing(&workload, &pods) {
        manager.kill(replicas).await?;
        return Ok(Action::await_change());
    }

    if manager.is_need_to_scale(&workload) {
        manager.game_server_scale(&workload, &pods).await?;
        return Ok(Action::await_change());
    }

    if manager.is_need_to_adjust_partition()? {
        manager.adjust_partition().await?;
        return Ok(Action::await_change());
    }

    if manager.is_need_to_update_workload(&workload)? {
        manager.update_workload(&workload).await?;
        return Ok(Action::await_change());
    }

    manager.sync_status(&workload, &pods).await?;
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    use super::*;
    use crate::{
        client::MockKubeApi,
        controllers::test::{context, quiet_events},
        crd::{kruise::StatefulSetStatus, GameServerSetSpec, GameServerTemplate},
        events::{reasons, MockEventPublisher},
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
        gss
    }

    fn at_rest(gss: &GameServerSet, replicas: i32) -> StatefulSet {
        let mut workload = workload::build_workload(gss).unwrap();
        workload.spec.replicas = Some(replicas);
        workload.status = Some(StatefulSetStatus {
            replicas,
            ..<_>::default()
        });
        workload
    }

    #[tokio::test]
    async fn new_fleet_creates_workload_and_stops() {
        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning(|_, _| Ok(None));
        client.expect_get_workload().returning(|_, _| Ok(None));
        client.expect_create_workload().times(1).returning(|_, _| Ok(()));
        client.expect_list_pods().never();

        let action = reconcile(Arc::new(fleet(2)), context(client, quiet_events()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn unsynced_probe_marker_requeues() {
        let mut gss = fleet(2);
        gss.spec.service_qualities = vec![<_>::default()];

        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning(|_, _| Ok(None));
        client.expect_create_probe_marker().returning(|_, _| Ok(()));
        client.expect_get_workload().never();

        let action = reconcile(Arc::new(gss), context(client, quiet_events()))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(PROBE_MARKER_REQUEUE));
    }

    #[tokio::test]
    async fn scale_runs_before_status() {
        let gss = fleet(3);
        let workload = at_rest(&gss, 2);

        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning(|_, _| Ok(None));
        client
            .expect_get_workload()
            .returning(move |_, _| Ok(Some(workload.clone())));
        client.expect_list_pods().returning(|_, _| Ok(Vec::new()));
        client.expect_patch_workload().times(1).returning(|_, _, _| Ok(()));
        client
            .expect_patch_game_server_set()
            .times(1)
            .returning(|_, _, _| Ok(()));
        client.expect_list_game_servers().returning(|_, _| Ok(Vec::new()));
        client.expect_patch_game_server_set_status().never();

        reconcile(Arc::new(gss), context(client, quiet_events()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn settled_fleet_only_syncs_status() {
        let mut gss = fleet(2);
        gss.annotations_mut().insert(keys::RESERVE_IDS.into(), String::new());
        let workload = at_rest(&gss, 2);

        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning(|_, _| Ok(None));
        client
            .expect_get_workload()
            .returning(move |_, _| Ok(Some(workload.clone())));
        client.expect_list_pods().returning(|_, _| Ok(Vec::new()));
        client.expect_patch_workload().never();
        client.expect_replace_workload().never();
        client.expect_patch_game_server_set().never();
        client
            .expect_patch_game_server_set_status()
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconcile(Arc::new(gss), context(client, quiet_events()))
            .await
            .unwrap();
    }

    /// A fleet whose reservations are already applied, so no scale is due.
    fn settled(replicas: i32) -> GameServerSet {
        let mut gss = fleet(replicas);
        gss.annotations_mut().insert(keys::RESERVE_IDS.into(), String::new());
        gss
    }

    fn member(ordinal: i32, ops_state: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(format!("minecraft-{ordinal}"));
        pod.metadata.namespace = Some("default".into());
        pod.labels_mut().extend([
            (keys::OWNER_GSS.to_owned(), "minecraft".to_owned()),
            (keys::OPS_STATE.to_owned(), ops_state.to_owned()),
        ]);
        pod
    }

    fn capture(patches: &Arc<Mutex<Vec<Value>>>) -> impl Fn(&str, &str, &Value) -> Result<(), Error> {
        let patches = patches.clone();
        move |_, _, patch| {
            patches.lock().unwrap().push(patch.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn kill_runs_before_everything_else() {
        let gss = settled(3);
        let workload = at_rest(&gss, 3);
        let pods = vec![member(0, "None"), member(1, "Kill"), member(2, "None")];

        let patches = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning(|_, _| Ok(None));
        client
            .expect_get_workload()
            .returning(move |_, _| Ok(Some(workload.clone())));
        client
            .expect_list_pods()
            .returning(move |_, _| Ok(pods.clone()));
        client
            .expect_patch_game_server_set()
            .times(1)
            .returning(capture(&patches));
        client.expect_patch_workload().never();
        client.expect_replace_workload().never();
        client.expect_list_game_servers().never();
        client.expect_patch_game_server_set_status().never();

        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .times(1)
            .returning(|_, _, reason, _| assert_eq!(reason, reasons::KILL));

        let action = reconcile(Arc::new(gss), context(client, events))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());

        let patches = patches.lock().unwrap();
        assert_eq!(patches[0]["spec"]["replicas"], 2);
    }

    #[tokio::test]
    async fn partition_adjustment_stops_the_pass() {
        let mut gss = settled(2);
        gss.spec.update_strategy.auto_update_strategy = Some(<_>::default());
        let workload = at_rest(&gss, 2);

        let patches = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning(|_, _| Ok(None));
        client
            .expect_get_workload()
            .returning(move |_, _| Ok(Some(workload.clone())));
        client.expect_list_pods().returning(|_, _| Ok(Vec::new()));
        client
            .expect_patch_game_server_set()
            .times(1)
            .returning(capture(&patches));
        client.expect_patch_workload().never();
        client.expect_replace_workload().never();
        client.expect_patch_game_server_set_status().never();

        reconcile(Arc::new(gss), context(client, quiet_events()))
            .await
            .unwrap();

        let patches = patches.lock().unwrap();
        assert_eq!(patches[0]["spec"]["updateStrategy"]["rollingUpdate"]["partition"], 2);
    }

    #[tokio::test]
    async fn workload_update_stops_the_pass() {
        let mut gss = settled(2);
        let workload = at_rest(&gss, 2);
        gss.spec.service_name = Some("minecraft-headless".into());

        let mut client = MockKubeApi::new();
        client.expect_get_probe_marker().returning(|_, _| Ok(None));
        client
            .expect_get_workload()
            .returning(move |_, _| Ok(Some(workload.clone())));
        client.expect_list_pods().returning(|_, _| Ok(Vec::new()));
        client
            .expect_replace_workload()
            .times(1)
            .returning(|_, _| Ok(()));
        client.expect_patch_workload().never();
        client.expect_patch_game_server_set().never();
        client.expect_patch_game_server_set_status().never();

        reconcile(Arc::new(gss), context(client, quiet_events()))
            .await
            .unwrap();
    }
}
