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

//! Deterministic content hashes, stored in annotations to detect whether the
//! meaningful part of an object changed.

use serde::Serialize;

/// Hashes the JSON representation of `value`.
///
/// Map keys are serialised in sorted order, so equal values always produce
/// the same hash.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    // Round trip through `Value` so that maps are key-sorted.
    let value = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&value)?;
    Ok(format!("{:016x}", seahash::hash(&bytes)))
}

/// Whether the `annotation` entry already records `hash`. A missing entry
/// never matches.
pub fn matches(
    annotations: &std::collections::BTreeMap<String, String>,
    annotation: &str,
    hash: &str,
) -> bool {
    annotations.get(annotation).is_some_and(|stored| stored == hash)
}
