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

//! Access to the Kubernetes API, behind a trait so the managers can be
//! tested without a cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Api,
};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use crate::{
    crd::{GameServer, GameServerSet, PodProbeMarker, StatefulSet},
    Error,
};

/// The API operations used by the reconcilers.
///
/// `get_*` calls return `None` for objects which do not exist. Pod patches
/// are strategic merge patches, every other patch is a JSON merge patch.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error>;
    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error>;
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;
    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;
    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>, Error>;

    async fn get_game_server(&self, namespace: &str, name: &str)
        -> Result<Option<GameServer>, Error>;
    async fn list_game_servers(&self, namespace: &str, selector: &str)
        -> Result<Vec<GameServer>, Error>;
    async fn create_game_server(&self, namespace: &str, gs: &GameServer) -> Result<(), Error>;
    async fn delete_game_server(&self, namespace: &str, name: &str) -> Result<(), Error>;
    async fn patch_game_server(&self, namespace: &str, name: &str, patch: &Value)
        -> Result<(), Error>;
    async fn patch_game_server_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error>;

    async fn get_game_server_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<GameServerSet>, Error>;
    async fn patch_game_server_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error>;
    async fn patch_game_server_set_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error>;

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>, Error>;
    async fn create_workload(&self, namespace: &str, workload: &StatefulSet) -> Result<(), Error>;
    async fn patch_workload(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error>;
    async fn replace_workload(&self, namespace: &str, workload: &StatefulSet) -> Result<(), Error>;

    async fn get_probe_marker(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodProbeMarker>, Error>;
    async fn create_probe_marker(&self, namespace: &str, marker: &PodProbeMarker)
        -> Result<(), Error>;
    async fn replace_probe_marker(
        &self,
        namespace: &str,
        marker: &PodProbeMarker,
    ) -> Result<(), Error>;
    async fn delete_probe_marker(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`KubeApi`] backed by a live cluster.
#[derive(Clone)]
pub struct Client {
    client: kube::Client,
}

impl Client {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn name_of<K: kube::Resource>(object: &K) -> Result<&str, Error> {
    object.meta().name.as_deref().ok_or(Error::MissingObjectKey {
        kind: "object",
        field: "metadata.name",
    })
}

#[async_trait]
impl KubeApi for Client {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        Ok(self.namespaced::<Pod>(namespace).get_opt(name).await?)
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>, Error> {
        let params = ListParams::default().labels(selector);
        Ok(self.namespaced::<Pod>(namespace).list(&params).await?.items)
    }

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error> {
        self.namespaced::<Pod>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        Ok(Api::<Node>::all(self.client.clone()).get_opt(name).await?)
    }

    async fn get_persistent_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        Ok(self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>, Error> {
        Ok(Api::<PersistentVolume>::all(self.client.clone())
            .get_opt(name)
            .await?)
    }

    async fn get_game_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<GameServer>, Error> {
        Ok(self.namespaced::<GameServer>(namespace).get_opt(name).await?)
    }

    async fn list_game_servers(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<GameServer>, Error> {
        let params = ListParams::default().labels(selector);
        Ok(self
            .namespaced::<GameServer>(namespace)
            .list(&params)
            .await?
            .items)
    }

    async fn create_game_server(&self, namespace: &str, gs: &GameServer) -> Result<(), Error> {
        self.namespaced::<GameServer>(namespace)
            .create(&PostParams::default(), gs)
            .await?;
        Ok(())
    }

    async fn delete_game_server(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.namespaced::<GameServer>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch_game_server(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.namespaced::<GameServer>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_game_server_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.namespaced::<GameServer>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn get_game_server_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<GameServerSet>, Error> {
        Ok(self
            .namespaced::<GameServerSet>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn patch_game_server_set(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.namespaced::<GameServerSet>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_game_server_set_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<(), Error> {
        self.namespaced::<GameServerSet>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>, Error> {
        Ok(self.namespaced::<StatefulSet>(namespace).get_opt(name).await?)
    }

    async fn create_workload(&self, namespace: &str, workload: &StatefulSet) -> Result<(), Error> {
        self.namespaced::<StatefulSet>(namespace)
            .create(&PostParams::default(), workload)
            .await?;
        Ok(())
    }

    async fn patch_workload(&self, namespace: &str, name: &str, patch: &Value) -> Result<(), Error> {
        self.namespaced::<StatefulSet>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn replace_workload(&self, namespace: &str, workload: &StatefulSet) -> Result<(), Error> {
        self.namespaced::<StatefulSet>(namespace)
            .replace(name_of(workload)?, &PostParams::default(), workload)
            .await?;
        Ok(())
    }

    async fn get_probe_marker(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodProbeMarker>, Error> {
        Ok(self
            .namespaced::<PodProbeMarker>(namespace)
            .get_opt(name)
            .await?)
    }

    async fn create_probe_marker(
        &self,
        namespace: &str,
        marker: &PodProbeMarker,
    ) -> Result<(), Error> {
        self.namespaced::<PodProbeMarker>(namespace)
            .create(&PostParams::default(), marker)
            .await?;
        Ok(())
    }

    async fn replace_probe_marker(
        &self,
        namespace: &str,
        marker: &PodProbeMarker,
    ) -> Result<(), Error> {
        self.namespaced::<PodProbeMarker>(namespace)
            .replace(name_of(marker)?, &PostParams::default(), marker)
            .await?;
        Ok(())
    }

    async fn delete_probe_marker(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.namespaced::<PodProbeMarker>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }
}
