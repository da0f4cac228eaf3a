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

//! Exposes fleet sizes to an external autoscaler over the
//! `externalscaler.ExternalScaler` gRPC service.

use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use futures::TryFutureExt;

use crate::{
    client::KubeApi,
    crd::GameServerSet,
    generated::externalscaler::{
        external_scaler_server::{ExternalScaler, ExternalScalerServer},
        GetMetricSpecResponse, GetMetricsRequest, GetMetricsResponse, IsActiveResponse,
        MetricSpec, MetricValue, ScaledObjectRef,
    },
};

pub const PORT: u16 = 6000;

/// The scaler metadata entry naming the fleet to scale.
pub const GAME_SERVER_SET_NAME: &str = "gameServerSetName";
pub const METRIC_NAME: &str = "gssReplicas";

const STREAM_INTERVAL: Duration = Duration::from_secs(5);

pub fn server(
    address: SocketAddr,
    client: Arc<dyn KubeApi>,
) -> impl std::future::Future<Output = crate::Result<()>> {
    let server = ExternalScalerServer::new(Scaler::new(client));
    tracing::info!(%address, "serving external scaler");
    tonic::transport::Server::builder()
        .add_service(server)
        .serve(address)
        .map_err(From::from)
}

/// Replicas the fleet wants, less those waiting to be deleted.
pub fn remaining_replicas(gss: &GameServerSet) -> i64 {
    let waiting = gss
        .status
        .as_ref()
        .map_or(0, |status| status.wait_to_be_deleted_replicas);
    i64::from(gss.spec.replicas) - i64::from(waiting)
}

pub fn is_active(gss: &GameServerSet) -> bool {
    gss.spec.replicas != 0 && remaining_replicas(gss) > 0
}

/// The value reported for [`METRIC_NAME`].
pub fn metric_value(gss: &GameServerSet) -> i64 {
    gss.status.as_ref().map_or(0, |status| {
        i64::from(status.current_replicas) - i64::from(status.wait_to_be_deleted_replicas)
    })
}

#[derive(Clone)]
pub struct Scaler {
    client: Arc<dyn KubeApi>,
}

impl Scaler {
    pub fn new(client: Arc<dyn KubeApi>) -> Self {
        Self { client }
    }

    async fn fleet(&self, object: &ScaledObjectRef) -> Result<GameServerSet, tonic::Status> {
        let name = object
            .scaler_metadata
            .get(GAME_SERVER_SET_NAME)
            .filter(|name| !name.is_empty())
            .unwrap_or(&object.name);

        self.client
            .get_game_server_set(&object.namespace, name)
            .await
            .map_err(|error| tonic::Status::internal(error.to_string()))?
            .ok_or_else(|| {
                tonic::Status::not_found(format!(
                    "game server set {}/{name} not found",
                    object.namespace
                ))
            })
    }
}

impl std::fmt::Debug for Scaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scaler").finish_non_exhaustive()
    }
}

#[tonic::async_trait]
impl ExternalScaler for Scaler {
    type StreamIsActiveStream = Pin<
        Box<dyn futures::Stream<Item = Result<IsActiveResponse, tonic::Status>> + Send + 'static>,
    >;

    #[tracing::instrument(skip_all, fields(namespace = %request.get_ref().namespace, name = %request.get_ref().name))]
    async fn is_active(
        &self,
        request: tonic::Request<ScaledObjectRef>,
    ) -> Result<tonic::Response<IsActiveResponse>, tonic::Status> {
        let gss = self.fleet(request.get_ref()).await?;
        Ok(tonic::Response::new(IsActiveResponse {
            result: is_active(&gss),
        }))
    }

    async fn stream_is_active(
        &self,
        request: tonic::Request<ScaledObjectRef>,
    ) -> Result<tonic::Response<Self::StreamIsActiveStream>, tonic::Status> {
        let object = request.into_inner();
        let this = self.clone();
        tracing::debug!(namespace = %object.namespace, name = %object.name, "starting active stream");

        Ok(tonic::Response::new(Box::pin(async_stream::try_stream! {
            let mut interval = tokio::time::interval(STREAM_INTERVAL);
            loop {
                interval.tick().await;
                let gss = this.fleet(&object).await?;
                yield IsActiveResponse { result: is_active(&gss) };
            }
        })))
    }

    #[tracing::instrument(skip_all, fields(namespace = %request.get_ref().namespace, name = %request.get_ref().name))]
    async fn get_metric_spec(
        &self,
        request: tonic::Request<ScaledObjectRef>,
    ) -> Result<tonic::Response<GetMetricSpecResponse>, tonic::Status> {
        let desired = i64::from(self.fleet(request.get_ref()).await?.spec.replicas);
        Ok(tonic::Response::new(GetMetricSpecResponse {
            metric_specs: vec![MetricSpec {
                metric_name: METRIC_NAME.into(),
                target_size: desired,
                target_size_float: desired as f64,
            }],
        }))
    }

    #[tracing::instrument(skip_all, fields(metric = %request.get_ref().metric_name))]
    async fn get_metrics(
        &self,
        request: tonic::Request<GetMetricsRequest>,
    ) -> Result<tonic::Response<GetMetricsResponse>, tonic::Status> {
        let request = request.into_inner();
        let object = request
            .scaled_object_ref
            .ok_or_else(|| tonic::Status::invalid_argument("scaledObjectRef is required"))?;
        let replicas = metric_value(&self.fleet(&object).await?);

        Ok(tonic::Response::new(GetMetricsResponse {
            metric_values: vec![MetricValue {
                metric_name: METRIC_NAME.into(),
                metric_value: replicas,
                metric_value_float: replicas as f64,
            }],
        }))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::{
        client::MockKubeApi,
        crd::{GameServerSetSpec, GameServerSetStatus},
        Error,
    };

    fn fleet(desired: i32, current: i32, waiting: i32) -> GameServerSet {
        let mut gss = GameServerSet::new(
            "minecraft",
            GameServerSetSpec {
                replicas: desired,
                ..<_>::default()
            },
        );
        gss.status = Some(GameServerSetStatus {
            current_replicas: current,
            wait_to_be_deleted_replicas: waiting,
            ..<_>::default()
        });
        gss
    }

    fn object(metadata: &[(&str, &str)]) -> ScaledObjectRef {
        ScaledObjectRef {
            name: "scaled".into(),
            namespace: "default".into(),
            scaler_metadata: metadata
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }

    fn scaler(expected_name: &'static str, gss: Option<GameServerSet>) -> Scaler {
        let mut client = MockKubeApi::new();
        client
            .expect_get_game_server_set()
            .times(1..)
            .returning(move |namespace, name| {
                assert_eq!((namespace, name), ("default", expected_name));
                Ok(gss.clone())
            });
        Scaler::new(Arc::new(client))
    }

    #[test]
    fn activity() {
        assert!(is_active(&fleet(3, 3, 1)));
        assert!(!is_active(&fleet(2, 2, 2)));
        assert!(!is_active(&fleet(0, 1, 0)));
        assert!(is_active(&fleet(2, 0, 0)));

        let mut unobserved = fleet(1, 0, 0);
        unobserved.status = None;
        assert!(is_active(&unobserved));
        assert_eq!(metric_value(&unobserved), 0);
        assert_eq!(metric_value(&fleet(4, 5, 2)), 3);
    }

    #[tokio::test]
    async fn fleet_name_comes_from_metadata() {
        let scaler = scaler("minecraft", Some(fleet(4, 4, 1)));
        let response = scaler
            .is_active(tonic::Request::new(object(&[(GAME_SERVER_SET_NAME, "minecraft")])))
            .await
            .unwrap();
        assert!(response.into_inner().result);
    }

    #[tokio::test]
    async fn fleet_name_falls_back_to_object_name() {
        let scaler = scaler("scaled", Some(fleet(1, 1, 1)));
        let response = scaler
            .is_active(tonic::Request::new(object(&[])))
            .await
            .unwrap();
        assert!(!response.into_inner().result);
    }

    #[tokio::test]
    async fn missing_fleet_is_not_found() {
        let scaler = scaler("scaled", None);
        let status = scaler
            .is_active(tonic::Request::new(object(&[])))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn api_failures_are_internal() {
        let mut client = MockKubeApi::new();
        client
            .expect_get_game_server_set()
            .returning(|_, _| Err(Error::api(500, "InternalError")));
        let scaler = Scaler::new(Arc::new(client));

        let status = scaler
            .get_metrics(tonic::Request::new(GetMetricsRequest {
                scaled_object_ref: Some(object(&[])),
                metric_name: METRIC_NAME.into(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn metrics_report_desired_replicas() {
        let scaler = scaler("minecraft", Some(fleet(5, 6, 2)));

        let spec = scaler
            .get_metric_spec(tonic::Request::new(object(&[(GAME_SERVER_SET_NAME, "minecraft")])))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(spec.metric_specs[0].metric_name, METRIC_NAME);
        assert_eq!(spec.metric_specs[0].target_size, 5);

        let metrics = scaler
            .get_metrics(tonic::Request::new(GetMetricsRequest {
                scaled_object_ref: Some(object(&[(GAME_SERVER_SET_NAME, "minecraft")])),
                metric_name: METRIC_NAME.into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(metrics.metric_values[0].metric_value, 4);
    }

    #[tokio::test]
    async fn metrics_require_an_object() {
        let scaler = Scaler::new(Arc::new(MockKubeApi::new()));
        let status = scaler
            .get_metrics(tonic::Request::new(GetMetricsRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn stream_reports_activity() {
        let scaler = scaler("minecraft", Some(fleet(2, 0, 0)));
        let mut stream = scaler
            .stream_is_active(tonic::Request::new(object(&[(GAME_SERVER_SET_NAME, "minecraft")])))
            .await
            .unwrap()
            .into_inner();

        let first = stream.next().await.unwrap().unwrap();
        assert!(first.result);
    }
}
