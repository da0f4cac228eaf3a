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

mod health;

use std::convert::Infallible;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server as HyperServer, StatusCode};

pub use self::health::Health;

pub const PORT: u16 = 8000;

pub fn server(
    address: Option<std::net::SocketAddr>,
    health: Health,
) -> tokio::task::JoinHandle<Result<(), hyper::Error>> {
    let address = address.unwrap_or_else(|| (std::net::Ipv6Addr::UNSPECIFIED, PORT).into());
    tracing::info!(address = %address, "Starting admin endpoint");

    let make_svc = make_service_fn(move |_conn| {
        let health = health.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let health = health.clone();
                async move { Ok::<_, Infallible>(handle_request(req, health)) }
            }))
        }
    });

    tokio::spawn(HyperServer::bind(&address).serve(make_svc))
}

#[tracing::instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
fn handle_request(request: Request<Body>, health: Health) -> Response<Body> {
    tracing::trace!("handling request");

    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => collect_metrics(),
        (&Method::GET, "/live" | "/livez") => health.check_liveness(),
        (&Method::GET, "/ready" | "/readyz") => health.check_readiness(),
        (_, path) => {
            let mut response = Response::new(Body::from(format!("{path} not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    }
}

fn collect_metrics() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let mut buffer = vec![];
    let encoder = prometheus::TextEncoder::new();
    let body =
        prometheus::Encoder::encode(&encoder, &crate::metrics::registry().gather(), &mut buffer)
            .map_err(|error| tracing::warn!(%error, "Failed to encode metrics"))
            .and_then(|_| {
                String::from_utf8(buffer)
                    .map(Body::from)
                    .map_err(|error| tracing::warn!(%error, "Failed to convert metrics to utf8"))
            });

    match body {
        Ok(body) => {
            *response.body_mut() = body;
        }
        Err(_) => {
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    response
}
