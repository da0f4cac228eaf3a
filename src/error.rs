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

use std::time::Duration;

/// Errors returned from reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes request failed: {0}")]
    Kube(#[from] kube::Error),
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{kind} is missing `{field}`")]
    MissingObjectKey {
        kind: &'static str,
        field: &'static str,
    },
    #[error("timed out after {0:?} waiting for game server updates")]
    Timeout(Duration),
    #[error("update task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    fn api_code(&self) -> Option<(u16, &str)> {
        match self {
            Self::Kube(kube::Error::Api(response)) => Some((response.code, &response.reason)),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.api_code(), Some((404, _)))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.api_code(), Some((409, "AlreadyExists")))
    }

    /// Label value used for the reconcile result metric.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube",
            Self::Serialization(_) => "serialization",
            Self::MissingObjectKey { .. } => "missing_key",
            Self::Timeout(_) => "timeout",
            Self::Join(_) => "join",
        }
    }

    #[cfg(test)]
    pub(crate) fn api(code: u16, reason: &str) -> Self {
        Self::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} in test"),
            reason: reason.into(),
            code,
        }))
    }

    #[cfg(test)]
    pub(crate) fn not_found() -> Self {
        Self::api(404, "NotFound")
    }

    #[cfg(test)]
    pub(crate) fn already_exists() -> Self {
        Self::api(409, "AlreadyExists")
    }
}

pub trait ResultExt<T> {
    /// Treats a not found response as success, as the object is already gone.
    fn ignore_not_found(self) -> Result<Option<T>, Error>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn ignore_not_found(self) -> Result<Option<T>, Error> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.is_not_found() => {
                tracing::debug!(%error, "ignoring not found");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}
