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

//! The cloud worker pool: the concurrency and state-machine core of the
//! dispatcher. Maintains a fleet of cloud VMs that mirrors demand from a
//! container queue, probes them over SSH to discover their state, and hands
//! containers to idle workers.
//!
//! [`Pool`] is the crate's single public aggregate; everything else here is
//! either a building block it owns ([`worker`], [`remote_runner`],
//! [`throttle`], [`tag_verifier`]) or supporting infrastructure
//! ([`config`], [`clock`], [`metrics`], [`err`]).

pub mod clock;
pub mod config;
pub mod err;
pub mod metrics;
pub mod pool;
pub mod remote_runner;
pub mod tag_verifier;
pub mod throttle;
pub mod worker;

pub use clock::{Clock, FakeClock, SharedClock, SystemClock};
pub use config::PoolConfig;
pub use err::{Error, Result};
pub use pool::{Pool, SubscriptionId};
pub use remote_runner::{ContainerUuid, RemoteRunner};
pub use worker::{InstanceView, State};
