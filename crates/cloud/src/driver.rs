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

//! The cloud driver surface the pool is built against.
//!
//! A concrete driver (EC2, GCE, Azure, a local libvirt pool, ...) is supplied
//! by whoever embeds the pool; this crate only defines the contract. Tests and
//! examples use [`crate::fake::FakeInstanceSet`].

use std::fmt;

use async_trait::async_trait;

use crate::{
    error::{CloudError, Result},
    instance::{InstanceId, InstanceTags, InstanceType},
};

/// A single cloud VM, as reported by the driver's `instances()` call or
/// returned from `create()`.
#[async_trait]
pub trait Instance: Send + Sync + fmt::Debug {
    /// The provider-assigned identifier. Stable for the instance's lifetime.
    fn id(&self) -> InstanceId;

    /// The address (host or host:port) the executor should connect to. May
    /// change across calls as the provider assigns/reassigns addresses.
    fn address(&self) -> String;

    /// The instance's current tags, as last observed from the provider.
    fn tags(&self) -> InstanceTags;

    /// Replace the instance's tags at the provider. Used to persist
    /// `IdleBehavior` so it survives a dispatcher restart.
    async fn set_tags(&self, tags: InstanceTags) -> Result<()>;

    /// Request that the provider terminate this VM. Idempotent: destroying an
    /// already-destroyed instance should not be treated as an error by
    /// callers (the pool relies on eventual disappearance from `instances()`
    /// rather than a success return to know the destroy "worked").
    async fn destroy(&self) -> Result<()>;
}

/// Creates, lists, and destroys instances for one `InstanceSetId`.
///
/// Implementations are expected to tolerate concurrent calls; the pool itself
/// is responsible for rate-limiting (see `cloudpool_pool::throttle`).
#[async_trait]
pub trait InstanceSet: Send + Sync {
    /// Launch a new instance of the given type. `init_script` is handed to
    /// the provider's user-data/init mechanism; `tags` are applied at
    /// creation so the instance is immediately visible to a filtered
    /// `instances()` call.
    async fn create(
        &self,
        instance_type: &InstanceType,
        image_id: &str,
        tags: InstanceTags,
        init_script: &str,
        public_key: &[u8],
    ) -> Result<Box<dyn Instance>>;

    /// List every instance whose tags are a superset of `tag_filter`.
    async fn instances(&self, tag_filter: &InstanceTags) -> Result<Vec<Box<dyn Instance>>>;
}

impl CloudError {
    /// True if this error represents the provider refusing to create more
    /// instances right now (as opposed to a transient or programmer error).
    #[must_use]
    pub fn is_quota_error(&self) -> bool { matches!(self, CloudError::Quota { .. }) }

    /// True if this error represents API throttling: the caller should widen
    /// its request interval rather than treat the operation as failed.
    #[must_use]
    pub fn is_rate_limit_error(&self) -> bool { matches!(self, CloudError::RateLimit { .. }) }
}
