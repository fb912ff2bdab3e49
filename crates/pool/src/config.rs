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

//! Pool configuration: every field enumerated in the external config surface,
//! with the same defaults as the system this pool reimplements.

use std::{collections::BTreeMap, time::Duration};

use cloudpool_cloud::{InstanceSetId, InstanceTags, InstanceType, tags::DEFAULT_TAG_KEY_PREFIX};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

fn default_tag_key_prefix() -> String { DEFAULT_TAG_KEY_PREFIX.to_string() }

fn default_ssh_port() -> u16 { 22 }

/// Static configuration the pool is constructed with. Durations are
/// deserialized from humantime strings (`"30s"`, `"10m"`); a `"0s"` disables
/// the feature it controls, where noted on the field.
#[derive(Clone, Debug, Serialize, Deserialize, SmartDefault, bon::Builder)]
pub struct PoolConfig {
    /// Identifies this dispatcher's fleet among others that may share a cloud
    /// account. Written as the `InstanceSetID` tag on every instance this
    /// pool creates, and used to filter `InstanceSet::instances`.
    #[builder(into)]
    pub instance_set_id: InstanceSetId,

    /// Command run over the executor to decide whether an instance has
    /// finished booting. Exit 0 means booted.
    #[builder(into)]
    pub boot_probe_command: String,

    /// Image handed to the driver's `create()` call.
    #[builder(into)]
    pub image_id: String,

    /// Port the executor connects to for probes and container commands.
    #[default(default_ssh_port())]
    #[builder(default = default_ssh_port())]
    pub ssh_port: u16,

    /// How often `run_sync` reconciles the worker map against the cloud
    /// provider's instance list. Default: 1 minute.
    #[default(Duration::from_secs(60))]
    #[builder(default = Duration::from_secs(60))]
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    /// How often `run_probes` takes a fresh snapshot of worker IDs to probe.
    /// Default: 10 seconds.
    #[default(Duration::from_secs(10))]
    #[builder(default = Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Fleet-wide cap on probes started per second, enforced by a ticker
    /// independent of `probe_interval`. Default: 10.
    #[default(10)]
    #[builder(default = 10)]
    pub max_probes_per_second: u32,

    /// Proactive fleet-wide cap on cloud create/destroy calls per second,
    /// enforced by a ticker independent of the reactive create/list
    /// throttles (which only widen after an observed rate-limit error).
    /// Default: 0 (unlimited beyond what the throttles' own backoff
    /// enforces).
    #[default(0)]
    #[builder(default = 0)]
    pub max_cloud_ops_per_second: u32,

    /// How long an `Idle` worker with `IdleBehavior::Run` may go unused
    /// before `shutdown_if_idle` shuts it down. Default: 1 minute.
    #[default(Duration::from_secs(60))]
    #[builder(default = Duration::from_secs(60))]
    #[serde(with = "humantime_serde")]
    pub timeout_idle: Duration,

    /// How long a `Booting` worker may go without a successful boot probe
    /// before it is shut down. Default: 10 minutes.
    #[default(Duration::from_secs(600))]
    #[builder(default = Duration::from_secs(600))]
    #[serde(with = "humantime_serde")]
    pub timeout_booting: Duration,

    /// How long since the last successful probe before a worker is shut down
    /// regardless of state. Default: 10 minutes.
    #[default(Duration::from_secs(600))]
    #[builder(default = Duration::from_secs(600))]
    #[serde(with = "humantime_serde")]
    pub timeout_probe: Duration,

    /// How long a `Shutdown` worker may remain listed by the cloud provider
    /// before `run_sync` retries `destroy()`. Default: 10 seconds.
    #[default(Duration::from_secs(10))]
    #[builder(default = Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub timeout_shutdown: Duration,

    /// Grace period between SIGTERM and SIGKILL when killing a container.
    /// Default: 2 minutes.
    #[default(Duration::from_secs(120))]
    #[builder(default = Duration::from_secs(120))]
    #[serde(with = "humantime_serde")]
    pub timeout_term: Duration,

    /// Grace period after SIGKILL before giving up on a clean exit
    /// observation. Default: 5 seconds.
    #[default(Duration::from_secs(5))]
    #[builder(default = Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub timeout_signal: Duration,

    /// Extra tags applied to every instance this pool creates, merged under
    /// the reserved tags (which always win on key collision).
    #[builder(default)]
    pub resource_tags: InstanceTags,

    /// Prefix prepended to every reserved tag key (see
    /// `cloudpool_cloud::tags`). Default: `"Arvados"`, matching the system
    /// this pool reimplements.
    #[default(default_tag_key_prefix())]
    #[builder(default = default_tag_key_prefix())]
    pub tag_key_prefix: String,

    /// Name of the registered cloud driver factory to use.
    #[builder(into)]
    pub driver: String,

    /// Opaque, driver-specific parameters (API endpoint, credentials
    /// reference, region, ...), passed through unparsed.
    #[builder(default)]
    pub driver_parameters: BTreeMap<String, String>,

    /// Path to the private key installed on every instance this pool
    /// creates, used by the executor to authenticate.
    #[builder(into)]
    pub dispatch_private_key_path: String,

    /// An instance whose last probe is older than this is treated as having
    /// a stale lock and is not reused for new work. `"0s"` disables the
    /// check.
    #[default(Duration::ZERO)]
    #[builder(default = Duration::ZERO)]
    #[serde(with = "humantime_serde")]
    pub stale_lock_timeout: Duration,

    /// The scheduler-facing instance shapes this pool may create, keyed by
    /// `InstanceType::name`.
    #[builder(default)]
    pub instance_types: BTreeMap<String, InstanceType>,
}

#[cfg(test)]
mod tests {
    use super::PoolConfig;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PoolConfig::builder()
            .instance_set_id("disp1")
            .boot_probe_command("true")
            .image_id("img-123")
            .driver("fake")
            .dispatch_private_key_path("/etc/cloudpool/id_dispatcher")
            .build();
        assert_eq!(cfg.ssh_port, 22);
        assert_eq!(cfg.sync_interval.as_secs(), 60);
        assert_eq!(cfg.probe_interval.as_secs(), 10);
        assert_eq!(cfg.max_probes_per_second, 10);
        assert_eq!(cfg.timeout_idle.as_secs(), 60);
        assert_eq!(cfg.timeout_booting.as_secs(), 600);
        assert_eq!(cfg.tag_key_prefix, "Arvados");
    }

    #[test]
    fn deserializes_humantime_durations_from_toml() {
        let toml = r#"
            instance_set_id = "disp1"
            boot_probe_command = "true"
            image_id = "img-123"
            driver = "fake"
            dispatch_private_key_path = "/etc/cloudpool/id_dispatcher"
            sync_interval = "30s"
            timeout_idle = "2m"
        "#;
        let cfg: PoolConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.sync_interval.as_secs(), 30);
        assert_eq!(cfg.timeout_idle.as_secs(), 120);
    }
}
