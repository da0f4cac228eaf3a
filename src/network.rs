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

//! The boundary between the controllers and network plugins.
//!
//! Network plugins run outside of the reconcilers and communicate through
//! pod annotations. Each pod names its plugin with the
//! `game.kruise.io/network-type` annotation, which is resolved against a
//! [`Registry`] built at startup.

use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::{
    crd::{keys, NetworkConfParam, NetworkStatus},
    Error,
};

/// Network plugin names understood by default.
pub const DEFAULT_NETWORK_TYPES: &[&str] = &[
    "Kubernetes-HostPort",
    "Kubernetes-NodePort",
    "Kubernetes-Ingress",
    "AlibabaCloud-SLB",
    "AlibabaCloud-NLB",
    "AlibabaCloud-EIP",
    "AmazonWebServices-NLB",
    "Volcengine-CLB",
];

/// Network access for a single pod.
pub trait NetworkManager: Send + Sync {
    fn network_type(&self) -> Option<String>;
    fn network_config(&self) -> Vec<NetworkConfParam>;
    fn network_disabled(&self) -> bool;
    /// The status last reported by the plugin, if any.
    fn network_status(&self) -> Result<Option<NetworkStatus>, Error>;
    /// Returns `pod` carrying `status` for the plugin to act on.
    fn update_network_status(&self, status: &NetworkStatus, pod: Pod) -> Result<Pod, Error>;
}

/// A network plugin, able to hand out a [`NetworkManager`] for its pods.
pub trait NetworkProvider: Send + Sync {
    fn manager<'pod>(&self, pod: &'pod Pod) -> Box<dyn NetworkManager + 'pod>;
}

/// Maps network type names to their providers.
#[derive(Clone, Default)]
pub struct Registry {
    providers: BTreeMap<String, Arc<dyn NetworkProvider>>,
}

impl Registry {
    /// A registry where every name in `types` is served through pod
    /// annotations.
    pub fn with_types<S: Into<String>>(types: impl IntoIterator<Item = S>) -> Self {
        let mut registry = Self::default();
        let provider: Arc<dyn NetworkProvider> = Arc::new(PodAnnotations);
        for name in types {
            registry.register(name, provider.clone());
        }
        registry
    }

    /// # Panics
    /// If `name` is empty.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn NetworkProvider>) {
        let name = name.into();
        assert!(!name.is_empty(), "network provider registered without a name");
        tracing::debug!(%name, "registering network provider");
        self.providers.insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn NetworkProvider>> {
        self.providers.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// The manager for `pod`, or `None` when the pod has no network or names
    /// a network type which is not registered.
    pub fn manager_for<'pod>(&self, pod: &'pod Pod) -> Option<Box<dyn NetworkManager + 'pod>> {
        let network_type = pod.annotations().get(keys::NETWORK_TYPE)?;
        match self.get(network_type) {
            Some(provider) => Some(provider.manager(pod)),
            None => {
                tracing::warn!(pod = %pod.name_any(), %network_type, "unknown network type");
                None
            }
        }
    }
}

/// Reads and writes network state through the pod's annotations.
pub struct PodAnnotations;

impl NetworkProvider for PodAnnotations {
    fn manager<'pod>(&self, pod: &'pod Pod) -> Box<dyn NetworkManager + 'pod> {
        Box::new(AnnotatedPod { pod })
    }
}

struct AnnotatedPod<'pod> {
    pod: &'pod Pod,
}

impl NetworkManager for AnnotatedPod<'_> {
    fn network_type(&self) -> Option<String> {
        self.pod.annotations().get(keys::NETWORK_TYPE).cloned()
    }

    fn network_config(&self) -> Vec<NetworkConfParam> {
        let Some(conf) = self.pod.annotations().get(keys::NETWORK_CONF) else {
            return Vec::new();
        };

        serde_json::from_str(conf).unwrap_or_else(|error| {
            tracing::debug!(%error, pod = %self.pod.name_any(), "ignoring malformed network config");
            Vec::new()
        })
    }

    fn network_disabled(&self) -> bool {
        self.pod
            .labels()
            .get(keys::NETWORK_DISABLED)
            .is_some_and(|value| value == "true")
    }

    fn network_status(&self) -> Result<Option<NetworkStatus>, Error> {
        self.pod
            .annotations()
            .get(keys::NETWORK_STATUS)
            .map(|status| serde_json::from_str(status))
            .transpose()
            .map_err(From::from)
    }

    fn update_network_status(&self, status: &NetworkStatus, mut pod: Pod) -> Result<Pod, Error> {
        let status = serde_json::to_string(status)?;
        pod.annotations_mut()
            .insert(keys::NETWORK_STATUS.into(), status);
        Ok(pod)
    }
}
