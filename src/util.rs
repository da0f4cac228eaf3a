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

//! Pure helpers for reasoning about fleet members by ordinal.

pub mod ordinal;
pub mod sequence;

pub use self::{
    ordinal::{dedup, in_a_and_in_b, in_a_not_in_b, is_slice_equal, ordinal, parse_ranges, to_ranges},
    sequence::{delete_sequence, sort_for_deletion},
};
