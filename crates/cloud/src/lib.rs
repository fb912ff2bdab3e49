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

//! Trait surface and data types a worker pool is built against: what an
//! `Instance` is, how a fleet of them is created/listed/destroyed, and how
//! commands get run on one once it's up.
//!
//! This crate has no opinion on *which* cloud. A concrete driver (EC2, GCE,
//! a local libvirt pool, ...) lives outside it and is supplied by whoever
//! constructs a `cloudpool_pool::Pool`.

pub mod driver;
pub mod error;
pub mod executor;
pub mod instance;
pub mod registry;
pub mod tags;

#[cfg(feature = "fake")]
pub mod fake;

pub use driver::{Instance, InstanceSet};
pub use error::{CloudError, Result};
pub use executor::{Executor, ExecutorError, ExecutorFactory};
pub use instance::{IdleBehavior, InstanceId, InstanceSetId, InstanceTags, InstanceType};
pub use registry::{DriverFactory, DriverRegistry, RegistryError};
