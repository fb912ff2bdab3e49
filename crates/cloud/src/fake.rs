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

//! An in-memory [`InstanceSet`] for tests. Feature-gated behind `fake` so it
//! never ships in a production binary.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    error::{CloudError, DriverSnafu, QuotaSnafu, RateLimitSnafu, Result},
    executor::{Executor, ExecutorFactory, HostKeyMismatchSnafu, Result as ExecResult, TransportSnafu},
    instance::{InstanceId, InstanceTags, InstanceType},
};

#[derive(Debug, Clone)]
struct FakeInstanceState {
    id: InstanceId,
    address: String,
    tags: InstanceTags,
    destroyed: bool,
}

#[derive(Debug)]
pub struct FakeInstance {
    state: Arc<Mutex<FakeInstanceState>>,
    set: Arc<FakeInstanceSetInner>,
}

#[async_trait]
impl crate::driver::Instance for FakeInstance {
    fn id(&self) -> InstanceId { self.state.lock().id.clone() }

    fn address(&self) -> String { self.state.lock().address.clone() }

    fn tags(&self) -> InstanceTags { self.state.lock().tags.clone() }

    async fn set_tags(&self, tags: InstanceTags) -> Result<()> {
        self.state.lock().tags = tags;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if let Some(err) = self.set.take_injected_error() {
            return Err(err);
        }
        let mut st = self.state.lock();
        st.destroyed = true;
        self.set.instances.lock().retain(|i| !Arc::ptr_eq(i, &self.state));
        Ok(())
    }
}

struct FakeInstanceSetInner {
    instances: Mutex<Vec<Arc<Mutex<FakeInstanceState>>>>,
    next_id: AtomicU64,
    /// Queue of errors to return from the next `create`/`destroy` calls, FIFO.
    injected_errors: Mutex<Vec<InjectedError>>,
}

#[derive(Clone, Copy)]
enum InjectedError {
    Quota,
    RateLimit,
    Driver,
}

impl FakeInstanceSetInner {
    fn take_injected_error(&self) -> Option<CloudError> {
        let mut errs = self.injected_errors.lock();
        if errs.is_empty() {
            return None;
        }
        Some(match errs.remove(0) {
            InjectedError::Quota => QuotaSnafu { message: "fake quota exhausted" }.build(),
            InjectedError::RateLimit => RateLimitSnafu { message: "fake rate limited" }.build(),
            InjectedError::Driver => DriverSnafu { message: "fake driver error" }.build(),
        })
    }
}

/// An [`InstanceSet`](crate::driver::InstanceSet) backed by an in-memory
/// vector, for unit and integration tests. Errors can be queued with
/// [`FakeInstanceSet::inject_quota_error`] and friends to exercise the pool's
/// throttling behavior deterministically.
pub struct FakeInstanceSet {
    inner: Arc<FakeInstanceSetInner>,
}

impl Default for FakeInstanceSet {
    fn default() -> Self {
        Self {
            inner: Arc::new(FakeInstanceSetInner {
                instances: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                injected_errors: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl FakeInstanceSet {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    pub fn inject_quota_error(&self) { self.inner.injected_errors.lock().push(InjectedError::Quota); }

    pub fn inject_rate_limit_error(&self) {
        self.inner.injected_errors.lock().push(InjectedError::RateLimit);
    }

    pub fn inject_driver_error(&self) { self.inner.injected_errors.lock().push(InjectedError::Driver); }

    #[must_use]
    pub fn len(&self) -> usize { self.inner.instances.lock().len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait]
impl crate::driver::InstanceSet for FakeInstanceSet {
    async fn create(
        &self,
        _instance_type: &InstanceType,
        _image_id: &str,
        tags: InstanceTags,
        _init_script: &str,
        _public_key: &[u8],
    ) -> Result<Box<dyn crate::driver::Instance>> {
        if let Some(err) = self.inner.take_injected_error() {
            return Err(err);
        }
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(Mutex::new(FakeInstanceState {
            id: InstanceId(format!("fake-{n}")),
            address: format!("10.0.0.{}", (n % 254) + 1),
            tags,
            destroyed: false,
        }));
        self.inner.instances.lock().push(state.clone());
        Ok(Box::new(FakeInstance { state, set: self.inner.clone() }))
    }

    async fn instances(&self, tag_filter: &InstanceTags) -> Result<Vec<Box<dyn crate::driver::Instance>>> {
        if let Some(err) = self.inner.take_injected_error() {
            return Err(err);
        }
        let matches: Vec<_> = self
            .inner
            .instances
            .lock()
            .iter()
            .filter(|st| {
                let st = st.lock();
                tag_filter.iter().all(|(k, v)| st.tags.get(k) == Some(v))
            })
            .cloned()
            .collect();
        Ok(matches
            .into_iter()
            .map(|state| Box::new(FakeInstance { state, set: self.inner.clone() }) as Box<dyn crate::driver::Instance>)
            .collect())
    }
}

/// Canned responses an [`Executor::execute`] call should return for a given
/// command, keyed by an exact match against the command string. Commands not
/// present in the table return exit 0 with empty output, which is enough for
/// a probe command that the test doesn't care about.
#[derive(Default)]
struct FakeExecutorState {
    address: Mutex<String>,
    responses: Mutex<BTreeMap<String, (Vec<u8>, Vec<u8>, i32)>>,
    closed: std::sync::atomic::AtomicBool,
    /// Consumed by the next `execute` call, regardless of command.
    host_key_mismatch: std::sync::atomic::AtomicBool,
}

/// An in-memory [`Executor`] for tests. Responses are programmed per-command
/// via [`FakeExecutor::set_response`]; anything unprogrammed succeeds with
/// empty output, which is the common case for a kill/start command a test
/// doesn't need to inspect.
#[derive(Default)]
pub struct FakeExecutor {
    state: Arc<FakeExecutorState>,
}

impl FakeExecutor {
    #[must_use]
    pub fn new(address: String) -> Self {
        Self { state: Arc::new(FakeExecutorState { address: Mutex::new(address), ..Default::default() }) }
    }

    /// Program the exact stdout/stderr/exit code the next `execute(_, cmd,
    /// _)` call should return.
    pub fn set_response(&self, cmd: impl Into<String>, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>, exit_code: i32) {
        self.state.responses.lock().insert(cmd.into(), (stdout.into(), stderr.into(), exit_code));
    }

    #[must_use]
    pub fn current_target(&self) -> String { self.state.address.lock().clone() }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.state.closed.load(Ordering::Relaxed) }

    /// Makes the next `execute` call (regardless of command) fail with
    /// `ExecutorError::HostKeyMismatch`, simulating an address that's started
    /// answering for a different host.
    pub fn inject_host_key_mismatch(&self) { self.state.host_key_mismatch.store(true, Ordering::Relaxed); }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, _env: &BTreeMap<String, String>, cmd: &str, _stdin: &[u8]) -> ExecResult<(Vec<u8>, Vec<u8>, i32)> {
        if self.is_closed() {
            return TransportSnafu { message: "executor closed" }.fail();
        }
        if self.state.host_key_mismatch.swap(false, Ordering::Relaxed) {
            return HostKeyMismatchSnafu { address: self.current_target() }.fail();
        }
        Ok(self.state.responses.lock().get(cmd).cloned().unwrap_or((Vec::new(), Vec::new(), 0)))
    }

    fn set_target(&self, address: String) { *self.state.address.lock() = address; }

    fn close(&self) { self.state.closed.store(true, Ordering::Relaxed); }
}

/// Builds a fresh [`FakeExecutor`] per worker and keeps a handle to every one
/// it has built, so a test can reach in and program responses for a
/// specific worker's address after the pool has already created it.
#[derive(Default)]
pub struct FakeExecutorFactory {
    built: Mutex<Vec<Arc<FakeExecutor>>>,
}

impl FakeExecutorFactory {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    #[must_use]
    pub fn executor_for(&self, address: &str) -> Option<Arc<FakeExecutor>> {
        self.built.lock().iter().find(|e| e.current_target() == address).cloned()
    }
}

impl ExecutorFactory for FakeExecutorFactory {
    fn create(&self, address: String) -> Arc<dyn Executor> {
        let executor = Arc::new(FakeExecutor::new(address));
        self.built.lock().push(executor.clone());
        executor
    }
}

#[cfg(test)]
mod tests {
    use super::FakeInstanceSet;
    use crate::{driver::InstanceSet, instance::InstanceType};

    fn instance_type() -> InstanceType {
        InstanceType {
            name: "small".into(),
            provider_type: "m5.large".into(),
            vcpus: 2,
            ram_bytes: 4 << 30,
            scratch_bytes: 0,
            price: 0.1,
            preemptible: false,
        }
    }

    #[tokio::test]
    async fn create_then_instances_round_trips() {
        let set = FakeInstanceSet::new();
        let it = instance_type();
        let tags = [("InstanceSetID".to_string(), "disp1".to_string())].into_iter().collect();
        let inst = set.create(&it, "img", tags, "#!/bin/sh", b"ssh-ed25519 x").await.unwrap();
        let id = inst.id();

        let listed = set.instances(&Default::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), id);
    }

    #[tokio::test]
    async fn destroy_removes_from_instances() {
        let set = FakeInstanceSet::new();
        let it = instance_type();
        let inst = set.create(&it, "img", Default::default(), "", b"").await.unwrap();
        inst.destroy().await.unwrap();
        assert_eq!(set.instances(&Default::default()).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn injected_quota_error_surfaces_once() {
        let set = FakeInstanceSet::new();
        set.inject_quota_error();
        let it = instance_type();
        let err = set.create(&it, "img", Default::default(), "", b"").await.unwrap_err();
        assert!(err.is_quota_error());
        // second call succeeds, error was consumed
        set.create(&it, "img", Default::default(), "", b"").await.unwrap();
    }
}
