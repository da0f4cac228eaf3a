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

//! Reconciles a pod and the `GameServer` of the same name.
//!
//! Both objects share a reconcile key. The pod controller owns every key whose
//! pod exists, `GameServer` changes included. The `GameServer` controller only
//! cleans up `GameServer`s whose pod is gone.

mod manager;

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use k8s_openapi::{
    api::core::v1::Pod,
    apimachinery::pkg::{apis::meta::v1::Time, util::intstr::IntOrString},
    chrono::Utc,
};
use kube::{
    api::Api,
    runtime::{controller::Action, reflector::ObjectRef, watcher, Controller},
    Resource, ResourceExt,
};

pub use self::manager::{derive_state, network_wait, GameServerManager, NetworkWait};

use super::{controller_config, log_reconcile_result, observe, Context, ERROR_REQUEUE};
use crate::{
    crd::{keys, GameServer, GameServerSpec},
    error::ResultExt,
    Error,
};

const CONTROLLER: &str = "gameserver";

/// Delay after writing to a pod, before reading it back.
const POD_SETTLE_REQUEUE: Duration = Duration::from_millis(500);

pub async fn pod_controller(
    client: kube::Client,
    context: Arc<Context>,
    watcher_config: watcher::Config,
) {
    tracing::info!("starting pod controller");
    let pods = Api::<Pod>::all(client.clone());
    let game_servers = Api::<GameServer>::all(client);

    Controller::new(pods, watcher_config.clone().labels(keys::OWNER_GSS))
        .watches(game_servers, watcher_config, |gs| {
            gs.namespace()
                .map(|namespace| ObjectRef::<Pod>::new(&gs.name_any()).within(&namespace))
        })
        .with_config(controller_config(&context))
        .run(reconcile_pod, error_policy, context)
        .for_each(log_reconcile_result("Pod"))
        .await;
}

pub async fn game_server_controller(
    client: kube::Client,
    context: Arc<Context>,
    watcher_config: watcher::Config,
) {
    tracing::info!("starting game server controller");
    let game_servers = Api::<GameServer>::all(client);

    Controller::new(game_servers, watcher_config)
        .with_config(controller_config(&context))
        .run(reconcile_game_server, error_policy, context)
        .for_each(log_reconcile_result("GameServer"))
        .await;
}

async fn reconcile_pod(pod: Arc<Pod>, context: Arc<Context>) -> Result<Action, Error> {
    let namespace = super::namespace_of(pod.as_ref())?;
    reconcile(&namespace, &pod.name_any(), &context).await
}

async fn reconcile_game_server(gs: Arc<GameServer>, context: Arc<Context>) -> Result<Action, Error> {
    let namespace = super::namespace_of(gs.as_ref())?;
    reconcile_without_pod(&namespace, &gs.name_any(), &context).await
}

fn error_policy<K>(object: Arc<K>, error: &Error, _: Arc<Context>) -> Action
where
    K: Resource,
{
    tracing::error!(name = ?object.meta().name, %error, "game server reconcile failed");
    Action::requeue(ERROR_REQUEUE)
}

/// Drives the pod and `GameServer` named `name` towards each other.
#[tracing::instrument(skip(context))]
pub async fn reconcile(namespace: &str, name: &str, context: &Arc<Context>) -> Result<Action, Error> {
    let started = std::time::Instant::now();
    let result = reconcile_inner(namespace, name, context).await;
    observe(CONTROLLER, started, &result);
    result
}

/// Removes the `GameServer` named `name` once its pod is gone. Keys with a
/// live pod are left to [`reconcile`].
#[tracing::instrument(skip(context))]
pub async fn reconcile_without_pod(
    namespace: &str,
    name: &str,
    context: &Arc<Context>,
) -> Result<Action, Error> {
    let started = std::time::Instant::now();
    let result = cleanup_inner(namespace, name, context).await;
    observe(CONTROLLER, started, &result);
    result
}

async fn cleanup_inner(namespace: &str, name: &str, context: &Context) -> Result<Action, Error> {
    let client = &context.client;
    if client.get_pod(namespace, name).await?.is_some() {
        return Ok(Action::await_change());
    }

    if let Some(gs) = client.get_game_server(namespace, name).await? {
        delete_orphan(namespace, &gs, context).await?;
    }
    Ok(Action::await_change())
}

async fn delete_orphan(namespace: &str, gs: &GameServer, context: &Context) -> Result<(), Error> {
    if gs.is_marked_deleting() || is_owned_by_pod(gs) {
        tracing::info!("deleting game server without a pod");
        context
            .client
            .delete_game_server(namespace, &gs.name_any())
            .await
            .ignore_not_found()?;
    }
    Ok(())
}

async fn reconcile_inner(
    namespace: &str,
    name: &str,
    context: &Arc<Context>,
) -> Result<Action, Error> {
    let client = &context.client;
    let pod = client.get_pod(namespace, name).await?;
    let gs = client.get_game_server(namespace, name).await?;

    match (pod, gs) {
        (None, None) => Ok(Action::await_change()),
        (Some(pod), None) => {
            init_game_server(namespace, &pod, context).await?;
            Ok(Action::await_change())
        }
        (None, Some(gs)) => {
            delete_orphan(namespace, &gs, context).await?;
            Ok(Action::await_change())
        }
        (Some(pod), Some(gs)) => {
            let gss = match pod.labels().get(keys::OWNER_GSS) {
                Some(owner) => client.get_game_server_set(namespace, owner).await?,
                None => None,
            };

            let manager = GameServerManager::new(pod, gs, gss, context.clone())?;
            if manager.sync_gs_to_pod().await? {
                return Ok(Action::requeue(POD_SETTLE_REQUEUE));
            }

            let now = Time(Utc::now());
            let status = manager.sync_pod_to_gs(&now).await?;
            if manager.wait_or_not(&status, &now).await? {
                Ok(Action::requeue(context.config.network_probe_interval))
            } else {
                Ok(Action::await_change())
            }
        }
    }
}

fn is_owned_by_pod(gs: &GameServer) -> bool {
    gs.owner_references()
        .iter()
        .any(|owner| owner.kind == "Pod" && owner.api_version == "v1")
}

/// Creates the `GameServer` for `pod`, owned by it.
async fn init_game_server(namespace: &str, pod: &Pod, context: &Context) -> Result<(), Error> {
    let spec = GameServerSpec {
        update_priority: Some(IntOrString::Int(0)),
        deletion_priority: Some(IntOrString::Int(0)),
        ..<_>::default()
    };
    let mut gs = GameServer::new(&pod.name_any(), spec);
    gs.metadata.namespace = Some(namespace.to_owned());
    gs.metadata.owner_references = pod.controller_owner_ref(&()).map(|owner| vec![owner]);
    if let Some(owner) = pod.labels().get(keys::OWNER_GSS) {
        gs.labels_mut().insert(keys::OWNER_GSS.into(), owner.clone());
    }

    match context.client.create_game_server(namespace, &gs).await {
        Ok(()) => {
            tracing::info!(game_server = %gs.name_any(), "created game server");
            Ok(())
        }
        Err(error) if error.is_already_exists() || error.is_not_found() => {
            tracing::debug!(%error, "game server already handled");
            Ok(())
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        client::MockKubeApi,
        controllers::test::{context, quiet_events},
        crd::OpsState,
        events::MockEventPublisher,
    };

    fn pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("minecraft-1".into()),
                namespace: Some("default".into()),
                uid: Some("pod-uid".into()),
                labels: Some([(keys::OWNER_GSS.to_owned(), "minecraft".to_owned())].into()),
                ..<_>::default()
            },
            ..<_>::default()
        }
    }

    fn game_server() -> GameServer {
        let mut gs = GameServer::new("minecraft-1", GameServerSpec::default());
        gs.metadata.namespace = Some("default".into());
        gs
    }

    fn found(
        client: &mut MockKubeApi,
        pod: Option<Pod>,
        gs: Option<GameServer>,
    ) {
        client
            .expect_get_pod()
            .returning(move |_, _| Ok(pod.clone()));
        client
            .expect_get_game_server()
            .returning(move |_, _| Ok(gs.clone()));
    }

    #[tokio::test]
    async fn nothing_to_do_without_either() {
        let mut client = MockKubeApi::new();
        found(&mut client, None, None);

        let action = reconcile("default", "minecraft-1", &context(client, MockEventPublisher::new()))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn pod_without_game_server_creates_one() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockKubeApi::new();
        found(&mut client, Some(pod()), None);
        client.expect_create_game_server().times(1).returning({
            let created = created.clone();
            move |_, gs| {
                created.lock().unwrap().push(gs.clone());
                Ok(())
            }
        });

        reconcile("default", "minecraft-1", &context(client, MockEventPublisher::new()))
            .await
            .unwrap();

        let created = created.lock().unwrap();
        let gs = &created[0];
        assert_eq!(gs.name_any(), "minecraft-1");
        assert_eq!(gs.spec.ops_state, OpsState::None);
        assert_eq!(gs.spec.update_priority, Some(IntOrString::Int(0)));
        assert_eq!(gs.spec.deletion_priority, Some(IntOrString::Int(0)));
        assert_eq!(gs.labels().get(keys::OWNER_GSS).map(String::as_str), Some("minecraft"));

        let owner = &gs.owner_references()[0];
        assert_eq!(owner.kind, "Pod");
        assert_eq!(owner.uid, "pod-uid");
        assert_eq!(owner.controller, Some(true));
    }

    #[tokio::test]
    async fn create_races_are_swallowed() {
        for error in [Error::already_exists, Error::not_found] {
            let mut client = MockKubeApi::new();
            found(&mut client, Some(pod()), None);
            client
                .expect_create_game_server()
                .returning(move |_, _| Err(error()));

            assert!(reconcile("default", "minecraft-1", &context(client, MockEventPublisher::new()))
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn create_failure_is_returned() {
        let mut client = MockKubeApi::new();
        found(&mut client, Some(pod()), None);
        client
            .expect_create_game_server()
            .returning(|_, _| Err(Error::api(500, "InternalError")));

        assert!(reconcile("default", "minecraft-1", &context(client, MockEventPublisher::new()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn marked_game_server_without_pod_is_deleted() {
        let mut gs = game_server();
        gs.labels_mut().insert(keys::DELETING.into(), "true".into());

        let mut client = MockKubeApi::new();
        found(&mut client, None, Some(gs));
        client
            .expect_delete_game_server()
            .times(1)
            .returning(|_, _| Err(Error::not_found()));

        reconcile("default", "minecraft-1", &context(client, MockEventPublisher::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn orphaned_game_server_is_deleted() {
        let mut gs = game_server();
        gs.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".into(),
            kind: "Pod".into(),
            name: "minecraft-1".into(),
            uid: "pod-uid".into(),
            controller: Some(true),
            ..<_>::default()
        }]);

        let mut client = MockKubeApi::new();
        found(&mut client, None, Some(gs));
        client
            .expect_delete_game_server()
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile("default", "minecraft-1", &context(client, MockEventPublisher::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unmarked_game_server_without_pod_is_kept() {
        let mut client = MockKubeApi::new();
        found(&mut client, None, Some(game_server()));
        client.expect_delete_game_server().never();

        reconcile("default", "minecraft-1", &context(client, MockEventPublisher::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn game_server_path_leaves_live_pods_alone() {
        let mut client = MockKubeApi::new();
        found(&mut client, Some(pod()), Some(game_server()));
        client.expect_get_game_server_set().never();
        client.expect_patch_pod().never();
        client.expect_patch_game_server_status().never();
        client.expect_delete_game_server().never();

        let action = reconcile_without_pod(
            "default",
            "minecraft-1",
            &context(client, MockEventPublisher::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn game_server_path_deletes_orphans() {
        let mut gs = game_server();
        gs.labels_mut().insert(keys::DELETING.into(), "true".into());

        let mut client = MockKubeApi::new();
        found(&mut client, None, Some(gs));
        client
            .expect_delete_game_server()
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile_without_pod("default", "minecraft-1", &context(client, MockEventPublisher::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pod_update_is_given_time_to_settle() {
        let mut client = MockKubeApi::new();
        found(&mut client, Some(pod()), Some(game_server()));
        client
            .expect_get_game_server_set()
            .returning(|_, _| Ok(None));
        client.expect_patch_pod().times(1).returning(|_, _, _| Ok(()));
        client.expect_patch_game_server_status().never();

        let action = reconcile("default", "minecraft-1", &context(client, quiet_events()))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(POD_SETTLE_REQUEUE));
    }
}
