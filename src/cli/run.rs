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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use crate::{
    admin::Health,
    client::Client,
    controllers::{self, Context},
    events::KubePublisher,
    network,
    signal::ShutdownRx,
    Config,
};

/// Name reported as the source of published events.
const REPORTER: &str = "gamekeeper";

/// Runs the game server controllers against the current cluster.
#[derive(clap::Args, Clone, Debug)]
pub struct Run {
    /// Upper bound of concurrent reconciles per controller.
    #[clap(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = Config::DEFAULT_MAX_CONCURRENT_RECONCILES)]
    pub max_concurrent_reconciles: u16,
    /// The address to bind for the external scaler.
    #[clap(long, env = "SCALER_ADDRESS", default_value_t = (std::net::Ipv6Addr::UNSPECIFIED, crate::scaler::PORT).into())]
    pub scaler_address: SocketAddr,
    /// Whether to skip serving the external scaler.
    #[clap(long, env)]
    pub no_scaler: bool,
    /// A network plugin pods may name, may be repeated. Defaults to the
    /// well known plugins.
    #[clap(long = "network-type")]
    pub network_types: Vec<String>,
    /// Seconds a game server waits for its network before reporting a
    /// timeout.
    #[clap(long, env = "NETWORK_TOTAL_WAIT_TIME", default_value_t = Config::DEFAULT_NETWORK_TOTAL_WAIT_TIME.as_secs())]
    pub network_total_wait_time: u64,
    /// Seconds between checks of a game server waiting on its network.
    #[clap(long, env = "NETWORK_PROBE_INTERVAL_TIME", default_value_t = Config::DEFAULT_NETWORK_PROBE_INTERVAL.as_secs())]
    pub network_probe_interval_time: u64,
}

impl Run {
    pub fn config(&self) -> Config {
        Config {
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            network_total_wait_time: Duration::from_secs(self.network_total_wait_time),
            network_probe_interval: Duration::from_secs(self.network_probe_interval_time),
        }
    }

    pub fn network_registry(&self) -> network::Registry {
        if self.network_types.is_empty() {
            network::Registry::with_types(network::DEFAULT_NETWORK_TYPES.iter().copied())
        } else {
            network::Registry::with_types(self.network_types.iter().cloned())
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&self, health: Health, shutdown_rx: ShutdownRx) -> crate::Result<()> {
        let client = kube::Client::try_default().await?;
        let instance = std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let context = Arc::new(Context {
            client: Arc::new(Client::new(client.clone())),
            events: Arc::new(KubePublisher::new(client.clone(), REPORTER, Some(instance))),
            network: self.network_registry(),
            config: self.config(),
        });
        tracing::info!(config = ?context.config, "starting controllers");

        let scaler = if self.no_scaler {
            None
        } else {
            Some(tokio::spawn(crate::scaler::server(
                self.scaler_address,
                context.client.clone(),
            )))
        };

        health.set_ready();
        let controllers = controllers::run(client, context, shutdown_rx);

        match scaler {
            Some(scaler) => {
                let abort = scaler.abort_handle();
                tokio::select! {
                    _ = controllers => {
                        abort.abort();
                        Ok(())
                    }
                    result = scaler => result?,
                }
            }
            None => {
                controllers.await;
                Ok(())
            }
        }
    }
}
