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

//! Ordinal extraction, set arithmetic over ordinals, and the compact range
//! notation (`"2-5,9"`) used to store reserved ordinals in annotations.

use std::collections::BTreeSet;

/// Returns the trailing numeric suffix after the last `-` in `name`.
///
/// Malformed names yield `0`.
pub fn ordinal(name: &str) -> i32 {
    name.rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse().ok())
        .unwrap_or_default()
}

/// Parses a range string such as `"0,2-5,9"` into a sorted, de-duplicated
/// list of ordinals. Tokens which are not valid numbers or ranges are skipped.
pub fn parse_ranges(value: &str) -> Vec<i32> {
    let mut ordinals = BTreeSet::new();

    for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token.split_once('-') {
            Some((start, end)) => {
                let (Ok(start), Ok(end)) = (start.trim().parse::<i32>(), end.trim().parse::<i32>())
                else {
                    tracing::debug!(token, "skipping malformed ordinal range");
                    continue;
                };

                if start > end || start < 0 {
                    tracing::debug!(token, "skipping malformed ordinal range");
                    continue;
                }

                ordinals.extend(start..=end);
            }
            None => match token.parse::<i32>() {
                Ok(ordinal) if ordinal >= 0 => {
                    ordinals.insert(ordinal);
                }
                _ => tracing::debug!(token, "skipping malformed ordinal"),
            },
        }
    }

    ordinals.into_iter().collect()
}

/// Encodes ordinals into the compact range notation, collapsing consecutive
/// runs of three or more values into `start-end`.
pub fn to_ranges(ordinals: &[i32]) -> String {
    let sorted = dedup(ordinals);
    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }

        match end - start {
            0 => parts.push(start.to_string()),
            1 => {
                parts.push(start.to_string());
                parts.push(end.to_string());
            }
            _ => parts.push(format!("{start}-{end}")),
        }
    }

    parts.join(",")
}

/// Values of `a` which are not present in `b`, in the order they appear in `a`.
pub fn in_a_not_in_b(a: &[i32], b: &[i32]) -> Vec<i32> {
    let b: BTreeSet<_> = b.iter().collect();
    let mut seen = BTreeSet::new();
    a.iter()
        .filter(|value| !b.contains(value) && seen.insert(**value))
        .copied()
        .collect()
}

/// Values present in both `a` and `b`, in the order they appear in `a`.
pub fn in_a_and_in_b(a: &[i32], b: &[i32]) -> Vec<i32> {
    let b: BTreeSet<_> = b.iter().collect();
    let mut seen = BTreeSet::new();
    a.iter()
        .filter(|value| b.contains(value) && seen.insert(**value))
        .copied()
        .collect()
}

/// Sorted copy of `values` with duplicates removed.
pub fn dedup(values: &[i32]) -> Vec<i32> {
    values
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Whether `a` and `b` hold the same values, ignoring order and duplicates.
pub fn is_slice_equal(a: &[i32], b: &[i32]) -> bool {
    dedup(a) == dedup(b)
}
