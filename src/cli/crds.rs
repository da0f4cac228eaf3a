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

use kube::CustomResourceExt;

use crate::crd::{GameServer, GameServerSet};

/// Prints the custom resource definitions as YAML.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct Crds {}

impl Crds {
    pub fn print(&self, out: &mut impl std::io::Write) -> crate::Result<()> {
        for crd in [GameServerSet::crd(), GameServer::crd()] {
            tracing::debug!(name = ?crd.metadata.name, "printing custom resource definition");
            writeln!(out, "---")?;
            out.write_all(serde_yaml::to_string(&crd)?.as_bytes())?;
        }

        Ok(())
    }
}
