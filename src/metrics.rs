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

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    DEFAULT_BUCKETS,
};

pub const CONTROLLER_LABEL: &str = "controller";
pub const RESULT_LABEL: &str = "result";

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Returns the [`Registry`] containing every metric the operator exports.
#[inline]
pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace("gamekeeper")
        .subsystem(subsystem)
}

pub fn histogram_opts(
    name: &str,
    subsystem: &str,
    description: &str,
    buckets: Option<Vec<f64>>,
) -> HistogramOpts {
    HistogramOpts {
        common_opts: opts(name, subsystem, description),
        buckets: buckets.unwrap_or(Vec::from(DEFAULT_BUCKETS as &'static [f64])),
    }
}

pub fn reconciles(controller: &str, result: &str) -> IntCounter {
    static RECONCILES: Lazy<IntCounterVec> = Lazy::new(|| {
        prometheus::register_int_counter_vec_with_registry! {
            opts("total", "reconcile", "Total number of reconciles, by outcome"),
            &[CONTROLLER_LABEL, RESULT_LABEL],
            registry(),
        }
        .unwrap()
    });

    RECONCILES.with_label_values(&[controller, result])
}

pub fn reconcile_duration(controller: &str) -> Histogram {
    static RECONCILE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
        prometheus::register_histogram_vec_with_registry! {
            histogram_opts(
                "duration_seconds",
                "reconcile",
                "Seconds taken by a single reconcile",
                Some(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            ),
            &[CONTROLLER_LABEL],
            registry(),
        }
        .unwrap()
    });

    RECONCILE_DURATION.with_label_values(&[controller])
}

pub fn shutdown_initiated() -> &'static IntGauge {
    static SHUTDOWN_INITATED: Lazy<IntGauge> = Lazy::new(|| {
        prometheus::register_int_gauge_with_registry! {
            opts("shutdown_initiated", "", "Shutdown process has been started"),
            registry(),
        }
        .unwrap()
    });

    &SHUTDOWN_INITATED
}
