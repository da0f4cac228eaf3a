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

//! The reconcilers, and the state they share.

pub mod game_server;
pub mod game_server_set;

use std::{sync::Arc, time::Duration};

use kube::{runtime::watcher, Resource, ResourceExt};
use serde::Serialize;
use serde_json::Value;

use crate::{client::KubeApi, events::EventPublisher, network, signal::ShutdownRx, Config, Error};

/// How long a failed reconcile waits before retrying.
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Must stay below the client read timeout so idle watches are closed by the
/// API server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// State shared by every reconcile.
pub struct Context {
    pub client: Arc<dyn KubeApi>,
    pub events: Arc<dyn EventPublisher>,
    pub network: network::Registry,
    pub config: Config,
}

/// Runs every controller until `shutdown_rx` fires.
pub async fn run(client: kube::Client, context: Arc<Context>, mut shutdown_rx: ShutdownRx) {
    let watcher_config = || watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);

    let controllers = futures::future::join3(
        game_server_set::controller(client.clone(), context.clone(), watcher_config()),
        game_server::pod_controller(client.clone(), context.clone(), watcher_config()),
        game_server::game_server_controller(client, context, watcher_config()),
    );

    tokio::select! {
        _ = controllers => tracing::warn!("controllers exited"),
        _ = shutdown_rx.changed() => tracing::info!("stopping controllers"),
    }
}

fn controller_config(context: &Context) -> kube::runtime::controller::Config {
    kube::runtime::controller::Config::default().concurrency(context.config.max_concurrent_reconciles)
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Display>(
    controller: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => tracing::debug!(controller, ?object, "reconciled"),
            Err(error) => tracing::warn!(controller, %error, "reconcile failed"),
        }
        std::future::ready(())
    }
}

/// Records the outcome of a reconcile in the metrics registry.
fn observe<T>(controller: &str, started: std::time::Instant, result: &Result<T, Error>) {
    crate::metrics::reconcile_duration(controller).observe(started.elapsed().as_secs_f64());
    let label = match result {
        Ok(_) => "success",
        Err(error) => error.metric_label(),
    };
    crate::metrics::reconciles(controller, label).inc();
}

pub(crate) fn namespace_of<K: Resource>(object: &K) -> Result<String, Error> {
    object.namespace().ok_or(Error::MissingObjectKey {
        kind: "object",
        field: "metadata.namespace",
    })
}

/// Builds a merge patch which replaces `status` with `next`, nulling fields
/// at any depth which `previous` had and `next` no longer has.
pub(crate) fn status_patch<T: Serialize>(previous: Option<&T>, next: &T) -> Result<Value, Error> {
    let mut next = serde_json::to_value(next)?;
    if let Some(previous) = previous.map(serde_json::to_value).transpose()? {
        null_removed(&previous, &mut next);
    }

    Ok(serde_json::json!({ "status": next }))
}

// Arrays are replaced wholesale by a merge patch, so only objects recurse.
fn null_removed(previous: &Value, next: &mut Value) {
    let (Value::Object(previous), Value::Object(next)) = (previous, next) else {
        return;
    };

    for (key, old) in previous {
        match next.get_mut(key) {
            Some(new) => null_removed(old, new),
            None => {
                next.insert(key.clone(), Value::Null);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn status_patch_nulls_removed_fields() {
        let previous = json!({ "replicas": 2, "labelSelector": "a=b" });
        let next = json!({ "replicas": 3 });

        assert_eq!(
            status_patch(Some(&previous), &next).unwrap(),
            json!({ "status": { "replicas": 3, "labelSelector": null } })
        );
        assert_eq!(
            status_patch(None, &next).unwrap(),
            json!({ "status": { "replicas": 3 } })
        );
    }

    #[test]
    fn status_patch_nulls_removed_nested_fields() {
        let previous = json!({
            "podStatus": { "phase": "Pending", "nominatedNodeName": "n1" },
            "networkStatus": { "internalAddresses": [{ "ip": "10.0.0.1" }] },
        });
        let next = json!({
            "podStatus": { "phase": "Running" },
            "networkStatus": { "internalAddresses": [] },
        });

        assert_eq!(
            status_patch(Some(&previous), &next).unwrap(),
            json!({ "status": {
                "podStatus": { "phase": "Running", "nominatedNodeName": null },
                "networkStatus": { "internalAddresses": [] },
            } })
        );
    }
}
