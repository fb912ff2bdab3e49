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

//! Process-wide table of cloud driver factories, keyed by the name a
//! dispatcher's configuration refers to them by (e.g. `"ec2"`, `"azure"`,
//! `"fake"`).
//!
//! Concrete drivers live outside this crate and register themselves here
//! during process startup, before any `Pool` is constructed. Registration
//! after that point is rejected: the set of available drivers is meant to be
//! fixed for the life of the process, not mutated while a pool may be reading
//! from it concurrently.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use snafu::Snafu;

use crate::driver::InstanceSet;

pub type DriverFactory = Arc<dyn Fn(&BTreeMap<String, String>) -> Result<Arc<dyn InstanceSet>, RegistryError> + Send + Sync>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    #[snafu(display("driver {name:?} is not registered"))]
    UnknownDriver { name: String },

    #[snafu(display("driver {name:?} is already registered"))]
    AlreadyRegistered { name: String },

    #[snafu(display("driver {name:?} rejected its parameters: {message}"))]
    InvalidParameters { name: String, message: String },
}

struct Inner {
    factories: BTreeMap<String, DriverFactory>,
    sealed: bool,
}

/// The process-wide driver registration table. Registration is only allowed
/// before the registry is [`DriverRegistry::seal`]ed; a `Pool` built against
/// a sealed registry can look drivers up from any thread without taking a
/// write lock.
pub struct DriverRegistry {
    inner: RwLock<Inner>,
}

impl Default for DriverRegistry {
    fn default() -> Self { Self { inner: RwLock::new(Inner { factories: BTreeMap::new(), sealed: false }) } }
}

impl DriverRegistry {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register `factory` under `name`. Fails if the registry has been
    /// [`seal`](Self::seal)ed, or if `name` is already taken.
    pub fn register(&self, name: impl Into<String>, factory: DriverFactory) -> Result<(), RegistryError> {
        let name = name.into();
        let mut inner = self.inner.write().unwrap();
        if inner.sealed {
            return AlreadyRegisteredSnafu { name }.fail();
        }
        if inner.factories.contains_key(&name) {
            return AlreadyRegisteredSnafu { name }.fail();
        }
        inner.factories.insert(name, factory);
        Ok(())
    }

    /// Forbids further registration. Call once at startup, after every
    /// built-in and plugin driver has registered itself and before any
    /// `Pool` is constructed.
    pub fn seal(&self) { self.inner.write().unwrap().sealed = true; }

    /// Construct an `InstanceSet` from the driver registered as `name`,
    /// passing through `parameters` unparsed.
    pub fn build(&self, name: &str, parameters: &BTreeMap<String, String>) -> Result<Arc<dyn InstanceSet>, RegistryError> {
        let inner = self.inner.read().unwrap();
        let factory = inner.factories.get(name).cloned().ok_or_else(|| UnknownDriverSnafu { name: name.to_string() }.build())?;
        drop(inner);
        factory(parameters)
    }
}

#[cfg(all(test, feature = "fake"))]
mod tests {
    use std::sync::Arc;

    use super::{DriverRegistry, RegistryError};
    use crate::fake::FakeInstanceSet;

    #[test]
    fn register_then_build_round_trips() {
        let registry = DriverRegistry::new();
        registry.register("fake", Arc::new(|_params| Ok(Arc::new(FakeInstanceSet::new()) as _))).unwrap();
        assert!(registry.build("fake", &Default::default()).is_ok());
    }

    #[test]
    fn unknown_driver_errors() {
        let registry = DriverRegistry::new();
        let err = registry.build("nope", &Default::default()).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDriver { .. }));
    }

    #[test]
    fn duplicate_registration_errors() {
        let registry = DriverRegistry::new();
        registry.register("fake", Arc::new(|_params| Ok(Arc::new(FakeInstanceSet::new()) as _))).unwrap();
        let err = registry.register("fake", Arc::new(|_params| Ok(Arc::new(FakeInstanceSet::new()) as _))).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }

    #[test]
    fn registration_after_seal_errors() {
        let registry = DriverRegistry::new();
        registry.seal();
        let err = registry.register("fake", Arc::new(|_params| Ok(Arc::new(FakeInstanceSet::new()) as _))).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
    }
}
