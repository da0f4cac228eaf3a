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

mod crds;
mod run;

use crate::admin::Health;

pub use self::{crds::Crds, run::Run};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The Command-Line Interface for gamekeeper.
#[derive(clap::Parser)]
#[command(version, about)]
#[non_exhaustive]
pub struct Cli {
    /// Whether to spawn the admin server or not.
    #[clap(env, long)]
    pub no_admin: bool,
    /// The address to bind for the admin server.
    #[clap(long, env = "GAMEKEEPER_ADMIN_ADDRESS")]
    pub admin_address: Option<std::net::SocketAddr>,
    /// Whether gamekeeper will report any results to stdout/stderr.
    #[clap(short, long, env)]
    pub quiet: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

/// The various gamekeeper commands.
#[derive(Clone, clap::Subcommand)]
pub enum Commands {
    Run(Run),
    Crds(Crds),
}

impl Commands {
    fn serves_admin(&self) -> bool {
        matches!(self, Self::Run(_))
    }
}

impl Cli {
    /// Drives the gamekeeper application lifecycle using the command line
    /// arguments.
    #[tracing::instrument(skip_all)]
    pub async fn drive(self) -> crate::Result<()> {
        let version: std::borrow::Cow<'static, str> = if cfg!(debug_assertions) {
            format!("{VERSION}+debug").into()
        } else {
            VERSION.into()
        };

        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_file(true)
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(
            version = &*version,
            commit = crate::metadata::build::GIT_COMMIT_HASH,
            "Starting gamekeeper"
        );

        let (shutdown_tx, mut shutdown_rx) = crate::signal::channel();
        crate::signal::spawn_handler(shutdown_tx.clone())?;

        let health = Health::new(shutdown_tx);
        let _admin_task = (self.command.serves_admin() && !self.no_admin)
            .then(|| crate::admin::server(self.admin_address, health.clone()));

        let fut = tryhard::retry_fn({
            let shutdown_rx = shutdown_rx.clone();
            move || match self.command.clone() {
                Commands::Run(runner) => {
                    let health = health.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move { runner.run(health, shutdown_rx).await })
                }
                Commands::Crds(crds) => {
                    tokio::spawn(std::future::ready(crds.print(&mut std::io::stdout())))
                }
            }
        })
        .retries(3)
        .on_retry(|_, _, error| {
            let error = error.to_string();
            async move {
                tracing::warn!(%error, "error would have caused fatal crash");
            }
        });

        tokio::select! {
            result = fut => result?,
            _ = shutdown_rx.changed() => Ok(())
        }
    }
}
