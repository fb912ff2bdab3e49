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

//! Reserved tag keys the pool writes to and reads from the provider.
//!
//! Every key is prefixed so a fleet shared with other tooling doesn't collide
//! with the pool's bookkeeping. The prefix is configurable because some
//! providers cap tag-key length or forbid certain characters.

/// Default prefix for every reserved tag key below, matching the system this
/// pool reimplements.
pub const DEFAULT_TAG_KEY_PREFIX: &str = "Arvados";

/// Identifies which dispatcher's fleet an instance belongs to. Used to filter
/// `InstanceSet::instances` so that several dispatchers can share one cloud
/// account without stepping on each other.
pub const TAG_INSTANCE_SET_ID: &str = "InstanceSetID";

/// The scheduler-facing `InstanceType` name (see
/// [`crate::instance::InstanceType::name`]) this instance was created as.
pub const TAG_INSTANCE_TYPE: &str = "InstanceType";

/// The current [`crate::instance::IdleBehavior`], tag-encoded via
/// [`crate::instance::IdleBehavior::as_tag_value`]. Persisted so a restarted
/// dispatcher restores hold/drain decisions instead of defaulting to `Run`.
pub const TAG_IDLE_BEHAVIOR: &str = "IdleBehavior";

/// A random per-instance value embedded in the init script and echoed back by
/// a probe once the instance has booted. Distinguishes a genuinely-booted
/// instance from a stale or reused address still answering for a previous
/// occupant — `cloudpool-pool`'s tag verifier compares this against what the
/// boot probe observes in lieu of cryptographic host-key attestation, which
/// most providers can't offer.
pub const TAG_INSTANCE_SECRET: &str = "InstanceSecret";

/// Builds the full tag key for `name` under `prefix`, e.g.
/// `qualify("CloudPool", TAG_INSTANCE_SECRET) == "CloudPoolInstanceSecret"`.
#[must_use]
pub fn qualify(prefix: &str, name: &str) -> String {
    let mut key = String::with_capacity(prefix.len() + name.len());
    key.push_str(prefix);
    key.push_str(name);
    key
}

#[cfg(test)]
mod tests {
    use super::{TAG_INSTANCE_SECRET, qualify};

    #[test]
    fn qualify_concatenates_prefix_and_name() {
        assert_eq!(qualify("Arvados", TAG_INSTANCE_SECRET), "ArvadosInstanceSecret");
        assert_eq!(qualify("", TAG_INSTANCE_SECRET), "InstanceSecret");
    }
}
