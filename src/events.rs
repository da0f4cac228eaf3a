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

//! Kubernetes events, the user visible record of what the reconcilers did.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
#[cfg(test)]
use mockall::automock;

/// Publishes events about an object. Publishing never fails a reconcile.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by the events API.
pub struct KubePublisher {
    client: kube::Client,
    reporter: Reporter,
}

impl KubePublisher {
    pub fn new(client: kube::Client, controller: &str, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller.into(),
                instance,
            },
        }
    }
}

#[async_trait]
impl EventPublisher for KubePublisher {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: EventType,
        reason: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.clone());
        let event = Event {
            type_,
            reason: reason.into(),
            note,
            action: String::from("Reconcile"),
            secondary: None,
        };

        if let Err(error) = recorder.publish(event).await {
            tracing::warn!(%error, reason, object = ?object.name, "failed to publish event");
        }
    }
}

/// Event reasons.
pub mod reasons {
    pub const CREATE_WORKLOAD: &str = "CreateWorkload";
    pub const UPDATE_WORKLOAD: &str = "UpdateWorkload";
    pub const CREATE_PROBE_MARKER: &str = "CreatePodProbeMarker";
    pub const UPDATE_PROBE_MARKER: &str = "UpdatePodProbeMarker";
    pub const DELETE_PROBE_MARKER: &str = "DeletePodProbeMarker";
    pub const SCALE: &str = "Scale";
    pub const KILL: &str = "Kill";
    pub const ADJUST_PARTITION: &str = "AdjustPartition";

    pub const STATE_CHANGED: &str = "GsStateChanged";
    pub const OPS_STATE_CHANGED: &str = "GsOpsStateChanged";
    pub const UPDATE_PRIORITY_CHANGED: &str = "GsUpdatePriorityChanged";
    pub const DELETION_PRIORITY_CHANGED: &str = "GsDeletionPriorityChanged";
    pub const NETWORK_DISABLED_CHANGED: &str = "GsNetworkDisabledChanged";
    pub const NETWORK_WAIT_TIMEOUT: &str = "NetworkWaitTimeout";
}
