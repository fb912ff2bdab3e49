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

//! One `Worker` per live cloud instance: the per-instance state machine,
//! bookkeeping for the containers it's running, and probe scheduling.
//!
//! All mutation happens under the pool's lock (see `crate::pool`); a
//! `Worker` never takes a lock of its own, which rules out the
//! worker-then-pool / pool-then-worker lock-ordering deadlock that a
//! per-worker lock would invite.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use cloudpool_cloud::{Executor, IdleBehavior, Instance, InstanceId, InstanceTags, InstanceType, tags};
use derive_more::Display;
use tracing::{debug, info, warn};

use crate::remote_runner::{ContainerUuid, RemoteRunner};

/// Where a worker sits in its lifecycle. Never regresses from `Shutdown`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum State {
    #[display("unknown")]
    Unknown,
    #[display("booting")]
    Booting,
    #[display("idle")]
    Idle,
    #[display("running")]
    Running,
    #[display("shutdown")]
    Shutdown,
}

impl State {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Booting => "booting",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Shutdown => "shutdown",
        }
    }
}

/// One worker's current state and recent activity, for introspection.
#[derive(Clone, Debug, serde::Serialize)]
pub struct InstanceView {
    pub instance: InstanceId,
    pub address: String,
    pub price: f64,
    pub instance_type: String,
    pub provider_instance_type: String,
    pub last_container_uuid: Option<ContainerUuid>,
    #[serde(with = "humantime_serde")]
    pub last_busy: SystemTime,
    pub worker_state: String,
    pub idle_behavior: IdleBehavior,
}

/// Outcome of a single `probe_and_update` tick, reported back to the pool so
/// it can update metrics/notify subscribers and decide whether to retry
/// `destroy()`.
///
/// `destroy` carries the instance handle to destroy when this tick decided to
/// shut the worker down: state mutation happens synchronously under the
/// pool's lock, but the destroy call itself is I/O and must run after the
/// caller has released that lock.
#[derive(Default)]
pub struct ProbeOutcome {
    pub newly_idle: bool,
    pub newly_shutdown: bool,
    pub moved_starting_to_running: Vec<ContainerUuid>,
    pub exited: Vec<ContainerUuid>,
    pub destroy: Option<Arc<dyn Instance>>,
}

impl std::fmt::Debug for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeOutcome")
            .field("newly_idle", &self.newly_idle)
            .field("newly_shutdown", &self.newly_shutdown)
            .field("moved_starting_to_running", &self.moved_starting_to_running)
            .field("exited", &self.exited)
            .field("destroy", &self.destroy.is_some())
            .finish()
    }
}

pub struct Worker {
    id: InstanceId,
    state: State,
    idle_behavior: IdleBehavior,
    instance: Arc<dyn Instance>,
    inst_type: InstanceType,

    pub appeared: SystemTime,
    pub probed: SystemTime,
    pub busy: SystemTime,
    pub updated: SystemTime,
    pub destroyed: Option<SystemTime>,
    pub last_boot: Option<SystemTime>,

    pub running: BTreeMap<ContainerUuid, Arc<RemoteRunner>>,
    pub starting: BTreeMap<ContainerUuid, Arc<RemoteRunner>>,
    last_uuid: Option<ContainerUuid>,

    /// At most one in-flight probe per worker; a tick that finds this `true`
    /// is dropped rather than queued.
    probing: AtomicBool,

    tag_key_prefix: String,

    /// The SSH-like connection this worker's probes and container commands
    /// are run through. Retargeted (never rebuilt) as the instance's address
    /// changes; see [`Worker::set_instance`].
    executor: Arc<dyn Executor>,

    /// The per-instance secret minted at `Create` time (or recovered from the
    /// instance's tags for a worker discovered on startup). Compared against
    /// the boot probe's stdout to rule out a stale or reused address
    /// answering for a previous occupant.
    secret: String,
}

impl Worker {
    #[must_use]
    pub fn new(
        instance: Arc<dyn Instance>,
        inst_type: InstanceType,
        state: State,
        idle_behavior: IdleBehavior,
        now: SystemTime,
        tag_key_prefix: String,
        executor: Arc<dyn Executor>,
        secret: String,
    ) -> Self {
        Self {
            id: instance.id(),
            state,
            idle_behavior,
            instance,
            inst_type,
            appeared: now,
            probed: now,
            busy: now,
            updated: now,
            destroyed: None,
            last_boot: None,
            running: BTreeMap::new(),
            starting: BTreeMap::new(),
            last_uuid: None,
            probing: AtomicBool::new(false),
            tag_key_prefix,
            executor,
            secret,
        }
    }

    #[must_use]
    pub fn id(&self) -> &InstanceId { &self.id }

    #[must_use]
    pub fn state(&self) -> State { self.state }

    #[must_use]
    pub fn idle_behavior(&self) -> IdleBehavior { self.idle_behavior }

    #[must_use]
    pub fn instance_type(&self) -> &InstanceType { &self.inst_type }

    #[must_use]
    pub fn instance(&self) -> &Arc<dyn Instance> { &self.instance }

    #[must_use]
    pub fn last_uuid(&self) -> Option<&ContainerUuid> { self.last_uuid.as_ref() }

    #[must_use]
    pub fn executor(&self) -> &Arc<dyn Executor> { &self.executor }

    #[must_use]
    pub fn secret(&self) -> &str { &self.secret }

    #[must_use]
    pub fn tag_key_prefix(&self) -> &str { &self.tag_key_prefix }

    pub fn set_instance(&mut self, instance: Arc<dyn Instance>, now: SystemTime) {
        let new_address = instance.address();
        if new_address != self.instance.address() {
            self.executor.set_target(new_address);
        }
        self.instance = instance;
        self.updated = now;
    }

    pub fn set_idle_behavior(&mut self, idle_behavior: IdleBehavior) { self.idle_behavior = idle_behavior; }

    /// True if this worker is `Idle`, has been unused for longer than
    /// `timeout_idle`, has no containers starting, and its `IdleBehavior`
    /// permits auto-shutdown. `Drain` behaves like `Run` for this check (it
    /// still shuts down when idle); `Hold` never does.
    #[must_use]
    pub fn should_shutdown_idle(&self, now: SystemTime, timeout_idle: std::time::Duration) -> bool {
        self.state == State::Idle
            && self.idle_behavior != IdleBehavior::Hold
            && self.running.is_empty()
            && self.starting.is_empty()
            && now.duration_since(self.busy).unwrap_or_default() > timeout_idle
    }

    /// Transition to `Shutdown` and return the instance handle to destroy.
    /// Idempotent: calling this on an already-`Shutdown` worker just returns
    /// the handle again, so the caller can retry the destroy. The destroy
    /// itself is I/O and is the caller's responsibility, performed outside
    /// whatever lock guards this worker (see `crate::pool`'s "acquire lock →
    /// snapshot → release → I/O" pattern) — `Shutdown` means "we've told it
    /// to stop", not "it's gone" (see design notes on destroy semantics).
    pub fn begin_shutdown(&mut self, now: SystemTime) -> Arc<dyn Instance> {
        let was_shutdown = self.state == State::Shutdown;
        self.state = State::Shutdown;
        self.destroyed = Some(now);
        if !was_shutdown {
            info!(instance = %self.id, "shutting down worker");
        }
        self.instance.clone()
    }

    /// Transition to `Shutdown` immediately, with no grace period or retry
    /// logic of its own: used when a probe result is conclusive on its own,
    /// e.g. an executor-reported host-key mismatch, where there's nothing to
    /// wait out, only to tear down.
    pub fn shutdown_immediately(&mut self, now: SystemTime) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::default();
        outcome.destroy = Some(self.begin_shutdown(now));
        outcome.newly_shutdown = true;
        outcome
    }

    /// Acquire the single probing slot. Returns `false` (and leaves the
    /// worker untouched) if a probe is already in flight.
    #[must_use]
    pub fn try_start_probe(&self) -> bool {
        self.probing.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn finish_probe(&self) { self.probing.store(false, Ordering::Release); }

    /// The boot-probe half of `probe_and_update`: called while not yet
    /// booted. `probe_exit_0` is whether `BootProbeCommand` exited zero;
    /// `secret_match` is the tag-verifier's verdict on whatever the probe
    /// observed. On success the worker transitions to `Idle`; on a boot
    /// timeout it transitions to `Shutdown`. Synchronous: any destroy this
    /// triggers is reported via `ProbeOutcome::destroy` for the caller to run
    /// after releasing the pool lock.
    pub fn apply_boot_probe(&mut self, now: SystemTime, probe_exit_0: bool, secret_match: bool, timeout_booting: std::time::Duration) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::default();
        if probe_exit_0 && secret_match {
            self.state = State::Idle;
            self.probed = now;
            self.last_boot = Some(now);
            outcome.newly_idle = true;
            info!(instance = %self.id, "boot probe succeeded");
        } else if probe_exit_0 && !secret_match {
            // Only a completed probe's output is meaningful to the secret
            // check; a still-booting instance has nothing to compare yet.
            warn!(instance = %self.id, "instance secret mismatch on boot probe, treating as foreign instance");
            outcome.destroy = Some(self.begin_shutdown(now));
            outcome.newly_shutdown = true;
        } else if now.duration_since(self.appeared).unwrap_or_default() > timeout_booting {
            warn!(instance = %self.id, "boot timed out");
            outcome.destroy = Some(self.begin_shutdown(now));
            outcome.newly_shutdown = true;
        }
        outcome
    }

    /// The status-probe half of `probe_and_update`: called once booted.
    /// `observed_uuids` is the set of container UUIDs the status probe
    /// parsed out of the remote process list. Synchronous, for the same
    /// reason as `apply_boot_probe`.
    pub fn apply_status_probe(
        &mut self,
        now: SystemTime,
        observed_uuids: &std::collections::BTreeSet<ContainerUuid>,
        timeout_probe: std::time::Duration,
    ) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::default();
        let previously_probed = self.probed;

        for uuid in observed_uuids {
            if let Some(runner) = self.starting.remove(uuid) {
                self.running.insert(uuid.clone(), runner);
                outcome.moved_starting_to_running.push(uuid.clone());
                self.last_uuid = Some(uuid.clone());
            } else if self.running.contains_key(uuid) {
                self.last_uuid = Some(uuid.clone());
            }
        }

        let vanished: Vec<ContainerUuid> =
            self.running.keys().filter(|u| !observed_uuids.contains(*u)).cloned().collect();
        for uuid in &vanished {
            if let Some(runner) = self.running.remove(uuid) {
                runner.close();
            }
            outcome.exited.push(uuid.clone());
            debug!(instance = %self.id, container = uuid, "container process no longer observed");
        }

        if !self.running.is_empty() || !self.starting.is_empty() {
            self.busy = now;
            if self.state != State::Running {
                self.state = State::Running;
            }
        } else if self.state == State::Running {
            self.state = State::Idle;
            outcome.newly_idle = true;
        }

        self.probed = now;

        if now.duration_since(previously_probed).unwrap_or_default() > timeout_probe {
            warn!(instance = %self.id, "probe timed out");
            outcome.destroy = Some(self.begin_shutdown(now));
            outcome.newly_shutdown = true;
        }

        outcome
    }

    /// Called in place of `apply_status_probe` when the status probe itself
    /// failed (transport error or nonzero exit). Leaves `running`/`starting`
    /// untouched — a single failed probe is not evidence every container
    /// exited — and does not advance `probed`, so repeated failures
    /// accumulate toward `timeout_probe` instead of resetting it every tick.
    pub fn apply_status_probe_failure(&mut self, now: SystemTime, timeout_probe: std::time::Duration) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::default();
        if now.duration_since(self.probed).unwrap_or_default() > timeout_probe {
            warn!(instance = %self.id, "probe timed out");
            outcome.destroy = Some(self.begin_shutdown(now));
            outcome.newly_shutdown = true;
        }
        outcome
    }

    /// Assigns `uuid` to this worker: records it under `starting` and flips
    /// the worker to `Running`. The caller (pool) is responsible for
    /// actually issuing the start command via the returned runner.
    pub fn start_container(&mut self, uuid: ContainerUuid, runner: Arc<RemoteRunner>, now: SystemTime) {
        self.starting.insert(uuid.clone(), runner);
        self.last_uuid = Some(uuid);
        self.state = State::Running;
        self.busy = now;
    }

    #[must_use]
    pub fn to_view(&self) -> InstanceView {
        InstanceView {
            instance: self.id.clone(),
            address: self.instance.address(),
            price: self.inst_type.price,
            instance_type: self.inst_type.name.clone(),
            provider_instance_type: self.inst_type.provider_type.clone(),
            last_container_uuid: self.last_uuid.clone(),
            last_busy: self.busy,
            worker_state: self.state.as_str().to_string(),
            idle_behavior: self.idle_behavior,
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("idle_behavior", &self.idle_behavior)
            .field("running", &self.running.len())
            .field("starting", &self.starting.len())
            .finish_non_exhaustive()
    }
}

#[must_use]
pub fn resolve_tag_idle_behavior(tags: &InstanceTags, tag_key_prefix: &str) -> IdleBehavior {
    let key = tags::qualify(tag_key_prefix, tags::TAG_IDLE_BEHAVIOR);
    tags.get(&key).and_then(|v| IdleBehavior::from_tag_value(v)).unwrap_or(IdleBehavior::Run)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, time::Duration};

    use async_trait::async_trait;
    use cloudpool_cloud::{CloudError, Instance, InstanceId, InstanceTags, InstanceType};

    use super::{State, Worker};

    #[derive(Debug)]
    struct StubInstance {
        id: InstanceId,
    }

    #[async_trait]
    impl Instance for StubInstance {
        fn id(&self) -> InstanceId { self.id.clone() }

        fn address(&self) -> String { "10.0.0.1".to_string() }

        fn tags(&self) -> InstanceTags { InstanceTags::new() }

        async fn set_tags(&self, _tags: InstanceTags) -> Result<(), CloudError> { Ok(()) }

        async fn destroy(&self) -> Result<(), CloudError> { Ok(()) }
    }

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

    fn new_worker(state: State) -> Worker {
        let instance = std::sync::Arc::new(StubInstance { id: InstanceId("i-1".into()) });
        let executor = std::sync::Arc::new(crate::remote_runner::tests_support::NullExecutor);
        Worker::new(
            instance,
            instance_type(),
            state,
            cloudpool_cloud::IdleBehavior::Run,
            std::time::SystemTime::now(),
            "Arvados".into(),
            executor,
            "secret".into(),
        )
    }

    #[test]
    fn boot_probe_success_transitions_to_idle() {
        let mut w = new_worker(State::Booting);
        let now = w.appeared + Duration::from_secs(1);
        let outcome = w.apply_boot_probe(now, true, true, Duration::from_secs(600));
        assert_eq!(w.state(), State::Idle);
        assert!(outcome.newly_idle);
    }

    #[test]
    fn boot_probe_secret_mismatch_shuts_down() {
        let mut w = new_worker(State::Booting);
        let now = w.appeared + Duration::from_secs(1);
        let outcome = w.apply_boot_probe(now, true, false, Duration::from_secs(600));
        assert_eq!(w.state(), State::Shutdown);
        assert!(outcome.newly_shutdown);
        assert!(outcome.destroy.is_some());
    }

    #[test]
    fn boot_probe_not_yet_exited_zero_keeps_booting() {
        let mut w = new_worker(State::Booting);
        let now = w.appeared + Duration::from_secs(1);
        let outcome = w.apply_boot_probe(now, false, false, Duration::from_secs(600));
        assert_eq!(w.state(), State::Booting);
        assert!(!outcome.newly_shutdown);
        assert!(outcome.destroy.is_none());
    }

    #[test]
    fn boot_timeout_shuts_down() {
        let mut w = new_worker(State::Booting);
        let now = w.appeared + Duration::from_secs(601);
        let outcome = w.apply_boot_probe(now, false, true, Duration::from_secs(600));
        assert_eq!(w.state(), State::Shutdown);
        assert!(outcome.newly_shutdown);
    }

    #[test]
    fn should_shutdown_idle_respects_hold() {
        let mut w = new_worker(State::Idle);
        w.set_idle_behavior(cloudpool_cloud::IdleBehavior::Hold);
        let now = w.busy + Duration::from_secs(1000);
        assert!(!w.should_shutdown_idle(now, Duration::from_secs(60)));
    }

    #[test]
    fn should_shutdown_idle_true_after_timeout_for_run() {
        let w = new_worker(State::Idle);
        let now = w.busy + Duration::from_secs(1000);
        assert!(w.should_shutdown_idle(now, Duration::from_secs(60)));
    }

    #[test]
    fn status_probe_moves_starting_to_running_and_detects_exit() {
        use std::sync::Arc;

        let mut w = new_worker(State::Idle);
        let executor = Arc::new(crate::remote_runner::tests_support::NullExecutor);
        let runner = Arc::new(crate::remote_runner::RemoteRunner::new("uuid-1".into(), executor));
        w.start_container("uuid-1".into(), runner, w.busy);
        assert_eq!(w.state(), State::Running);

        let mut observed = BTreeSet::new();
        observed.insert("uuid-1".to_string());
        let now = w.probed + Duration::from_secs(1);
        let outcome = w.apply_status_probe(now, &observed, Duration::from_secs(600));
        assert_eq!(outcome.moved_starting_to_running, vec!["uuid-1".to_string()]);
        assert_eq!(w.state(), State::Running);

        let now2 = now + Duration::from_secs(1);
        let outcome2 = w.apply_status_probe(now2, &BTreeSet::new(), Duration::from_secs(600));
        assert_eq!(outcome2.exited, vec!["uuid-1".to_string()]);
        assert_eq!(w.state(), State::Idle);
    }

    #[test]
    fn status_probe_timeout_shuts_down_using_previous_probed_time() {
        let mut w = new_worker(State::Idle);
        let first = w.probed + Duration::from_secs(1);
        let _ = w.apply_status_probe(first, &BTreeSet::new(), Duration::from_secs(600));
        assert_eq!(w.state(), State::Idle);

        let second = first + Duration::from_secs(601);
        let outcome = w.apply_status_probe(second, &BTreeSet::new(), Duration::from_secs(600));
        assert_eq!(w.state(), State::Shutdown);
        assert!(outcome.newly_shutdown);
        assert!(outcome.destroy.is_some());
    }

    #[test]
    fn status_probe_failure_does_not_reset_probed_or_clear_running() {
        use std::sync::Arc;

        let mut w = new_worker(State::Idle);
        let executor = Arc::new(crate::remote_runner::tests_support::NullExecutor);
        let runner = Arc::new(crate::remote_runner::RemoteRunner::new("uuid-1".into(), executor));
        w.start_container("uuid-1".into(), runner, w.busy);
        let probed_before = w.probed;

        let now = w.probed + Duration::from_secs(1);
        let outcome = w.apply_status_probe_failure(now, Duration::from_secs(600));
        assert!(!outcome.newly_shutdown);
        assert_eq!(w.probed, probed_before);
        assert_eq!(w.state(), State::Running);
        assert!(w.starting.contains_key("uuid-1"));
    }

    #[test]
    fn status_probe_failure_shuts_down_once_timeout_elapsed_without_touching_probed() {
        let mut w = new_worker(State::Idle);
        let probed_before = w.probed;

        let now = w.probed + Duration::from_secs(601);
        let outcome = w.apply_status_probe_failure(now, Duration::from_secs(600));
        assert_eq!(w.state(), State::Shutdown);
        assert!(outcome.newly_shutdown);
        assert!(outcome.destroy.is_some());
        // Shutdown happened via begin_shutdown, not by bumping probed first.
        assert_eq!(w.probed, probed_before);
    }

    #[test]
    fn shutdown_immediately_transitions_to_shutdown() {
        let mut w = new_worker(State::Idle);
        let now = w.busy + Duration::from_secs(1);
        let outcome = w.shutdown_immediately(now);
        assert_eq!(w.state(), State::Shutdown);
        assert!(outcome.newly_shutdown);
        assert!(outcome.destroy.is_some());
    }
}
