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

//! Data types shared by every cloud driver implementation.

use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Opaque identifier for a cloud VM, as assigned by the provider.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self { Self(s) }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Identifies the fleet of instances a single dispatcher manages. Used as the
/// value of the `InstanceSetID` tag so that `Instances()` can be filtered to
/// just this dispatcher's VMs even when a cloud account hosts several.
#[derive(Clone, Debug, Default, Display, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSetId(pub String);

impl From<String> for InstanceSetId {
    fn from(s: String) -> Self { Self(s) }
}

impl From<&str> for InstanceSetId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Provider-side key/value metadata attached to an instance. The pool uses a
/// handful of reserved keys (see [`crate::tags`]) to persist scheduling intent
/// across dispatcher restarts; everything else is opaque passthrough.
pub type InstanceTags = BTreeMap<String, String>;

/// A shape of compute the scheduler can ask for: a name known to operators, the
/// provider's own type name, and the resources/price that shape implies.
///
/// Immutable in the pool's view: once a `Pool` is constructed with a set of
/// instance types, it never mutates them, only looks them up by name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    /// Name used in scheduler-facing APIs and in the `InstanceType` tag.
    pub name: String,
    /// The provider's own name for this shape (e.g. "m5.xlarge").
    pub provider_type: String,
    pub vcpus: u32,
    pub ram_bytes: u64,
    /// Local scratch space included with the instance, in bytes.
    pub scratch_bytes: u64,
    /// Price per hour, in the provider's native currency.
    pub price: f64,
    /// Whether this type can be reclaimed by the provider at any time.
    pub preemptible: bool,
}

/// Operator-set policy controlling whether a worker may be assigned new
/// containers and whether it may be auto-shutdown when idle. Persisted as a
/// cloud tag so it survives dispatcher restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleBehavior {
    /// May run containers; shut down automatically after the idle timeout.
    #[display("run")]
    Run,
    /// May run containers; never shut down automatically.
    #[display("hold")]
    Hold,
    /// Will not be assigned new containers; shuts down like `Run` once idle.
    #[display("drain")]
    Drain,
}

impl IdleBehavior {
    #[must_use]
    pub fn as_tag_value(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Hold => "hold",
            Self::Drain => "drain",
        }
    }

    #[must_use]
    pub fn from_tag_value(s: &str) -> Option<Self> {
        match s {
            "run" => Some(Self::Run),
            "hold" => Some(Self::Hold),
            "drain" => Some(Self::Drain),
            _ => None,
        }
    }
}

