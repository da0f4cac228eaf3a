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

use std::panic;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use hyper::{Body, Response, StatusCode};

#[derive(Clone)]
pub struct Health {
    healthy: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    shutdown_tx: crate::signal::ShutdownTx,
}

impl Health {
    pub fn new(shutdown_tx: crate::signal::ShutdownTx) -> Self {
        let health = Self {
            healthy: Arc::new(AtomicBool::new(true)),
            ready: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        };

        let healthy = health.healthy.clone();
        let shutdown_tx = health.shutdown_tx.clone();
        let default_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            tracing::error!(%panic_info, "Panic has occurred. Moving to Unhealthy");
            healthy.swap(false, Relaxed);
            let _ = shutdown_tx.send(());
            default_hook(panic_info);
        }));

        health
    }

    /// Marks the controllers as started.
    pub fn set_ready(&self) {
        self.ready.store(true, Relaxed);
    }

    /// returns a HTTP 200 response if the operator is healthy.
    pub fn check_liveness(&self) -> Response<Body> {
        Self::respond(self.healthy.load(Relaxed), StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// returns a HTTP 200 response once the controllers are running.
    pub fn check_readiness(&self) -> Response<Body> {
        Self::respond(self.ready.load(Relaxed), StatusCode::SERVICE_UNAVAILABLE)
    }

    fn respond(ok: bool, failure: StatusCode) -> Response<Body> {
        if ok {
            return Response::new("ok".into());
        }

        let mut response = Response::new(Body::empty());
        *response.status_mut() = failure;
        response
    }
}
