// Copyright 2025 cloudpool contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use lazy_static::lazy_static;
use prometheus::*;

pub const CATEGORY_LABEL: &str = "category";
pub const STATE_LABEL: &str = "state";
pub const OPERATION_LABEL: &str = "operation";
pub const ERROR_LABEL: &str = "error";

/// The five buckets a worker's instance is classified into for the gauges
/// below. `inuse` takes priority over every other bucket: a worker running or
/// starting a container is `inuse` even if its `idle_behavior` is `Hold` or
/// its state is `Unknown`.
pub const CATEGORIES: [&str; 5] = ["inuse", "hold", "booting", "unknown", "idle"];

/// Every non-`Shutdown` worker state, used to pre-register
/// `instances_disappeared{state}` at zero so absence reads as `0`, not as a
/// missing series.
pub const DISAPPEARANCE_STATES: [&str; 4] = ["unknown", "booting", "idle", "running"];

lazy_static! {
    pub static ref CONTAINERS_RUNNING: IntGauge = register_int_gauge!(
        "containers_running",
        "Number of containers reported running by cloud VMs."
    )
    .unwrap();
    pub static ref INSTANCES_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "instances_total",
        "Number of cloud VMs.",
        &[CATEGORY_LABEL]
    )
    .unwrap();
    pub static ref INSTANCES_PRICE: GaugeVec = register_gauge_vec!(
        "instances_price",
        "Price of cloud VMs.",
        &[CATEGORY_LABEL]
    )
    .unwrap();
    pub static ref VCPUS_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "vcpus_total",
        "Total VCPUs on all cloud VMs.",
        &[CATEGORY_LABEL]
    )
    .unwrap();
    pub static ref MEMORY_BYTES_TOTAL: IntGaugeVec = register_int_gauge_vec!(
        "memory_bytes_total",
        "Total memory on all cloud VMs.",
        &[CATEGORY_LABEL]
    )
    .unwrap();
    pub static ref INSTANCES_DISAPPEARED: IntCounterVec = register_int_counter_vec!(
        "instances_disappeared",
        "Number of occurrences of an instance disappearing from the cloud provider's instance list.",
        &[STATE_LABEL]
    )
    .unwrap();
    pub static ref DRIVER_OPERATIONS: IntCounterVec = register_int_counter_vec!(
        "driver_operations",
        "Number of cloud driver operations, by kind and outcome.",
        &[OPERATION_LABEL, ERROR_LABEL]
    )
    .unwrap();
}

/// Touches every metric so they register (and every disappearance-state label
/// reads zero) before the first real observation, rather than appearing for
/// the first time an event occurs.
pub fn register_zero_values() {
    for state in DISAPPEARANCE_STATES {
        let _ = INSTANCES_DISAPPEARED.with_label_values(&[state]);
    }
    for op in ["Create", "List", "Destroy"] {
        for err in ["0", "1"] {
            let _ = DRIVER_OPERATIONS.with_label_values(&[op, err]);
        }
    }
    for cat in CATEGORIES {
        INSTANCES_TOTAL.with_label_values(&[cat]).set(0);
        INSTANCES_PRICE.with_label_values(&[cat]).set(0.0);
        VCPUS_TOTAL.with_label_values(&[cat]).set(0);
        MEMORY_BYTES_TOTAL.with_label_values(&[cat]).set(0);
    }
}

pub fn record_driver_operation(operation: &str, succeeded: bool) {
    DRIVER_OPERATIONS.with_label_values(&[operation, if succeeded { "0" } else { "1" }]).inc();
}
