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

//! The top-level aggregate: owns every worker, every in-flight create, the
//! exited-container placeholders, and the three background loops (sync,
//! probe, metrics).

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, RwLock},
    time::{Duration, SystemTime},
};

use cloudpool_cloud::{Executor, ExecutorError, ExecutorFactory, IdleBehavior, Instance, InstanceId, InstanceSet, InstanceTags, InstanceType, tags};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clock::SharedClock,
    config::PoolConfig,
    err::{Result, UnknownInstanceSnafu},
    metrics,
    remote_runner::{ContainerUuid, RemoteRunner},
    tag_verifier::{TagVerifier, generate_secret},
    throttle::Throttle,
    worker::{InstanceView, ProbeOutcome, State, Worker, resolve_tag_idle_behavior},
};

const QUOTA_ERROR_TTL: Duration = Duration::from_secs(60);

/// Lists `crunch-run` processes on a worker so the status probe can parse out
/// which container UUIDs are still alive. Not part of the external config
/// surface: unlike `BootProbeCommand`, this one is a fixed detail of the
/// system this pool manages workers for, not something an operator would
/// plausibly want to override.
const LIST_PROCESSES_COMMAND: &str = "crunch-run --list";

/// Parses `crunch-run --list`'s output: one container UUID per line, blank
/// lines ignored.
fn parse_container_uuids(stdout: &str) -> BTreeSet<ContainerUuid> {
    stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(ToString::to_string).collect()
}

fn term_command(uuid: &str) -> String { format!("crunch-run --kill TERM {uuid}") }

fn kill_command(uuid: &str) -> String { format!("crunch-run --kill KILL {uuid}") }

struct CreateCall {
    time: SystemTime,
    instance_type: InstanceType,
}

/// A subscriber's single-slot notification channel. A full channel just
/// means the subscriber hasn't drained the previous "something changed" yet;
/// sends are non-blocking and drop rather than block or queue.
type Subscriber = mpsc::Sender<()>;

struct Shared {
    creating: BTreeMap<String, CreateCall>,
    workers: BTreeMap<InstanceId, Worker>,
    exited: BTreeMap<ContainerUuid, SystemTime>,
    at_quota_until: Option<SystemTime>,
    loaded: bool,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscriber_id: u64,
}

/// Handle returned by [`Pool::subscribe`], used to remove that subscription
/// via [`Pool::unsubscribe`] before its receiver is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// The worker pool. Cheap to clone (everything is behind `Arc`); clones share
/// the same underlying state and background loops.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

struct Inner {
    config: PoolConfig,
    clock: SharedClock,
    instance_set: Arc<dyn InstanceSet>,
    executor_factory: Arc<dyn ExecutorFactory>,
    shared: RwLock<Shared>,
    create_throttle: Throttle,
    list_throttle: Throttle,
    /// Fleet-wide cap on cloud API operations (create/destroy) per second,
    /// independent of the reactive create/list throttles: this one limits
    /// proactively, the throttles only react to observed rate-limit errors.
    /// `None` when `MaxCloudOpsPerSecond` is `0` (unlimited).
    cloud_op_limiter: Option<AsyncMutex<tokio::time::Interval>>,
    cancel: CancellationToken,
    loaded_notify: Notify,
}

impl Pool {
    #[must_use]
    pub fn new(config: PoolConfig, instance_set: Arc<dyn InstanceSet>, executor_factory: Arc<dyn ExecutorFactory>, clock: SharedClock) -> Self {
        metrics::register_zero_values();
        let cloud_op_limiter = (config.max_cloud_ops_per_second > 0)
            .then(|| AsyncMutex::new(tokio::time::interval(Duration::from_secs(1) / config.max_cloud_ops_per_second)));
        Self {
            inner: Arc::new(Inner {
                config,
                create_throttle: Throttle::new(clock.clone()),
                list_throttle: Throttle::new(clock.clone()),
                cloud_op_limiter,
                clock,
                instance_set,
                executor_factory,
                shared: RwLock::new(Shared {
                    creating: BTreeMap::new(),
                    workers: BTreeMap::new(),
                    exited: BTreeMap::new(),
                    at_quota_until: None,
                    loaded: false,
                    subscribers: BTreeMap::new(),
                    next_subscriber_id: 0,
                }),
                cancel: CancellationToken::new(),
                loaded_notify: Notify::new(),
            }),
        }
    }

    fn now(&self) -> SystemTime { self.inner.clock.now() }

    /// Blocks until the fleet-wide cloud-op rate (`MaxCloudOpsPerSecond`)
    /// allows another create/destroy call through. A no-op when the config
    /// leaves the limit at `0` (unlimited).
    async fn wait_for_cloud_op_slot(&self) {
        if let Some(limiter) = &self.inner.cloud_op_limiter {
            limiter.lock().await.tick().await;
        }
    }

    /// Notifies every subscriber, dropping any whose receiver has already
    /// been dropped rather than letting it sit in `subscribers` forever.
    fn notify(&self) {
        let mut shared = self.inner.shared.write().unwrap();
        shared.subscribers.retain(|_, sub| !matches!(sub.try_send(()), Err(mpsc::error::TrySendError::Closed(_))));
    }

    /// Returns a single-slot channel that becomes ready after any
    /// state-changing event, plus the [`SubscriptionId`] to pass to
    /// [`Pool::unsubscribe`] when done. Consumers should treat a received
    /// value as "something changed since you last looked", never as "exactly
    /// one change happened" — the channel may coalesce bursts.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let mut shared = self.inner.shared.write().unwrap();
        let id = shared.next_subscriber_id;
        shared.next_subscriber_id += 1;
        shared.subscribers.insert(id, tx);
        (SubscriptionId(id), rx)
    }

    /// Removes a subscription registered via [`Pool::subscribe`]. A no-op if
    /// it was already removed, e.g. by [`Pool::notify`] noticing the
    /// receiver had been dropped.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.shared.write().unwrap().subscribers.remove(&id.0);
    }

    /// Spawn a new instance of the given type. Returns `false` if refused
    /// outright (quota cooldown or create-throttle open); the caller does
    /// not need to log anything in that case, the refusal reason was already
    /// logged.
    pub fn create(&self, instance_type: InstanceType) -> bool {
        let now = self.now();
        {
            let shared = self.inner.shared.read().unwrap();
            if shared.at_quota_until.is_some_and(|t| now < t) {
                return false;
            }
        }
        if self.inner.create_throttle.error().is_some() {
            return false;
        }

        let secret = generate_secret();
        {
            let mut shared = self.inner.shared.write().unwrap();
            shared.creating.insert(secret.clone(), CreateCall { time: now, instance_type: instance_type.clone() });
        }

        let this = self.clone();
        tokio::spawn(async move {
            let prefix = &this.inner.config.tag_key_prefix;
            let mut create_tags: InstanceTags = this.inner.config.resource_tags.clone();
            create_tags.insert(tags::qualify(prefix, tags::TAG_INSTANCE_SET_ID), this.inner.config.instance_set_id.to_string());
            create_tags.insert(tags::qualify(prefix, tags::TAG_INSTANCE_TYPE), instance_type.name.clone());
            create_tags.insert(tags::qualify(prefix, tags::TAG_IDLE_BEHAVIOR), IdleBehavior::Run.as_tag_value().to_string());
            create_tags.insert(tags::qualify(prefix, tags::TAG_INSTANCE_SECRET), secret.clone());

            let verifier = TagVerifier::new(secret.clone());
            let init_script = verifier.init_command();
            let public_key = std::fs::read(&this.inner.config.dispatch_private_key_path).unwrap_or_default();

            this.wait_for_cloud_op_slot().await;
            let result = this
                .inner
                .instance_set
                .create(&instance_type, &this.inner.config.image_id, create_tags, &init_script, &public_key)
                .await;

            // Keep `creating` populated until the matching sync/updateWorker
            // has a chance to see it and classify the worker as Booting.
            match result {
                Ok(instance) => {
                    metrics::record_driver_operation("Create", true);
                    this.inner.create_throttle.record_success();
                    this.update_worker(Arc::from(instance), instance_type, Some(secret.clone()));
                }
                Err(err) => {
                    metrics::record_driver_operation("Create", false);
                    if err.is_quota_error() {
                        let until = this.now() + QUOTA_ERROR_TTL;
                        this.inner.shared.write().unwrap().at_quota_until = Some(until);
                        let notify_pool = this.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(QUOTA_ERROR_TTL).await;
                            notify_pool.notify();
                        });
                        error!(error = %err, "create failed: at quota");
                    } else {
                        error!(error = %err, "create failed");
                        this.inner.create_throttle.check_rate_limit_error(&err, "create");
                    }
                }
            }
            this.inner.shared.write().unwrap().creating.remove(&secret);
            this.notify();
        });
        true
    }

    /// True if `Create` is not expected to work right now.
    #[must_use]
    pub fn at_quota(&self) -> bool {
        let now = self.now();
        self.inner.shared.read().unwrap().at_quota_until.is_some_and(|t| now < t)
    }

    /// Number of unallocated (creating + booting + idle + unknown) workers
    /// per instance type. Workers in `Hold`/`Drain` are excluded, as is
    /// anything `Running`.
    #[must_use]
    pub fn unallocated(&self) -> BTreeMap<String, i64> {
        let shared = self.inner.shared.read().unwrap();
        let mut unalloc: BTreeMap<String, i64> = BTreeMap::new();
        let mut creating: BTreeMap<String, i64> = BTreeMap::new();
        let mut oldest_create: BTreeMap<String, SystemTime> = BTreeMap::new();

        for call in shared.creating.values() {
            let name = call.instance_type.name.clone();
            *creating.entry(name.clone()).or_insert(0) += 1;
            oldest_create.entry(name).and_modify(|t| *t = (*t).min(call.time)).or_insert(call.time);
        }

        for wkr in shared.workers.values() {
            if wkr.state() == State::Shutdown || wkr.state() == State::Running || wkr.idle_behavior() != IdleBehavior::Run || !wkr.running.is_empty() {
                continue;
            }
            let name = wkr.instance_type().name.clone();
            *unalloc.entry(name.clone()).or_insert(0) += 1;
            if wkr.state() == State::Unknown {
                if let (Some(&c), Some(&oldest)) = (creating.get(&name), oldest_create.get(&name)) {
                    if c > 0 && wkr.appeared > oldest {
                        *creating.get_mut(&name).unwrap() -= 1;
                    }
                }
            }
        }

        for (name, count) in creating {
            *unalloc.entry(name).or_insert(0) += count;
        }
        unalloc
    }

    /// Shut down a `Booting` or `Idle` worker of the given type (preferring
    /// `Booting`), skipping `Hold`. Returns `false` if none is available.
    pub async fn shutdown(&self, instance_type: &str) -> bool {
        let now = self.now();
        let candidate = {
            let shared = self.inner.shared.read().unwrap();
            [State::Booting, State::Idle].into_iter().find_map(|try_state| {
                shared
                    .workers
                    .values()
                    .find(|w| w.idle_behavior() != IdleBehavior::Hold && w.state() == try_state && w.instance_type().name == instance_type)
                    .map(|w| w.id().clone())
            })
        };
        let Some(id) = candidate else { return false };
        let instance = {
            let mut shared = self.inner.shared.write().unwrap();
            let wkr = shared.workers.get_mut(&id);
            wkr.map(|wkr| {
                info!(instance = %id, "shutdown requested");
                wkr.begin_shutdown(now)
            })
        };
        if let Some(instance) = instance {
            self.destroy_in_background(id, instance);
        }
        self.notify();
        true
    }

    /// Assigns `container_uuid` to the idle worker of `instance_type` with
    /// the most recent `busy` timestamp (most-recently-used, to encourage
    /// reuse and let older idle workers hit their idle timeout first).
    pub fn start_container(&self, instance_type: &str, container_uuid: ContainerUuid, executor: Arc<dyn cloudpool_cloud::Executor>, crunch_run_command: &str, record: &[u8]) -> bool {
        let now = self.now();
        let target_id = {
            let shared = self.inner.shared.read().unwrap();
            shared
                .workers
                .values()
                .filter(|w| w.instance_type().name == instance_type && w.state() == State::Idle)
                .max_by_key(|w| w.busy)
                .map(|w| w.id().clone())
        };
        let Some(id) = target_id else { return false };

        let runner = Arc::new(RemoteRunner::new(container_uuid.clone(), executor));
        {
            let mut shared = self.inner.shared.write().unwrap();
            if let Some(wkr) = shared.workers.get_mut(&id) {
                wkr.start_container(container_uuid, runner.clone(), now);
            } else {
                return false;
            }
        }
        self.notify();

        let crunch_run_command = crunch_run_command.to_string();
        let record = record.to_vec();
        tokio::spawn(async move { runner.start(&crunch_run_command, &record).await });
        true
    }

    /// Kill the crunch-run process for `uuid`, if any worker has it in
    /// `running` or `starting`. Returns immediately; the kill runs in the
    /// background. Returns `false` if the container has already disappeared.
    #[must_use]
    pub fn kill_container(&self, uuid: &str, reason: &str) -> bool {
        let shared = self.inner.shared.read().unwrap();
        for wkr in shared.workers.values() {
            let runner = wkr.running.get(uuid).or_else(|| wkr.starting.get(uuid));
            if let Some(runner) = runner {
                runner.kill(reason.to_string(), term_command(uuid), kill_command(uuid), self.inner.config.timeout_term, self.inner.config.timeout_signal);
                return true;
            }
        }
        debug!(container = uuid, "cannot kill: already disappeared");
        false
    }

    /// Union of every worker's running+starting UUIDs (zero time, i.e.
    /// `UNIX_EPOCH`) with `exited` (actual exit time). Callers distinguish
    /// "never saw this container finish" from "finished at T".
    #[must_use]
    pub fn running(&self) -> BTreeMap<ContainerUuid, Option<SystemTime>> {
        let shared = self.inner.shared.read().unwrap();
        let mut r = BTreeMap::new();
        for wkr in shared.workers.values() {
            for uuid in wkr.running.keys().chain(wkr.starting.keys()) {
                r.insert(uuid.clone(), None);
            }
        }
        for (uuid, exited) in &shared.exited {
            r.insert(uuid.clone(), Some(*exited));
        }
        r
    }

    /// Clears the exited-container placeholder for `uuid`, if present. A
    /// no-op if the container hasn't exited (or was already forgotten).
    pub fn forget_container(&self, uuid: &str) {
        let mut shared = self.inner.shared.write().unwrap();
        if shared.exited.remove(uuid).is_some() {
            debug!(container = uuid, "cleared exited-container placeholder");
        }
    }

    /// Blocks until the first sync has completed, then returns the current
    /// worker count by state.
    pub async fn count_workers(&self) -> BTreeMap<State, usize> {
        self.wait_until_loaded().await;
        let shared = self.inner.shared.read().unwrap();
        let mut r = BTreeMap::new();
        for wkr in shared.workers.values() {
            *r.entry(wkr.state()).or_insert(0) += 1;
        }
        r
    }

    async fn wait_until_loaded(&self) {
        loop {
            if self.inner.shared.read().unwrap().loaded {
                return;
            }
            self.inner.loaded_notify.notified().await;
        }
    }

    /// Snapshot of every worker, sorted by instance ID.
    #[must_use]
    pub fn instances(&self) -> Vec<InstanceView> {
        let shared = self.inner.shared.read().unwrap();
        let mut views: Vec<InstanceView> = shared.workers.values().map(Worker::to_view).collect();
        views.sort_by(|a, b| a.instance.as_str().cmp(b.instance.as_str()));
        views
    }

    /// Set the `IdleBehavior` of a running instance. Synchronous, typed
    /// error on an unknown id: this is an operator action, not an
    /// infrastructure failure.
    pub fn set_idle_behavior(&self, id: &InstanceId, idle_behavior: IdleBehavior) -> Result<()> {
        let mut shared = self.inner.shared.write().unwrap();
        let wkr = shared.workers.get_mut(id).ok_or_else(|| UnknownInstanceSnafu { id: id.clone() }.build())?;
        wkr.set_idle_behavior(idle_behavior);
        drop(shared);
        self.notify();
        Ok(())
    }

    /// Destroys a cloud VM instance directly. Synchronous, typed error if
    /// the id is unknown. The actual destroy runs in the background after
    /// the pool lock is released.
    pub async fn kill_instance(&self, id: &InstanceId, reason: &str) -> Result<()> {
        let now = self.now();
        let instance = {
            let mut shared = self.inner.shared.write().unwrap();
            let wkr = shared.workers.get_mut(id).ok_or_else(|| UnknownInstanceSnafu { id: id.clone() }.build())?;
            info!(instance = %id, reason, "shutting down (operator request)");
            wkr.begin_shutdown(now)
        };
        self.destroy_in_background(id.clone(), instance);
        self.notify();
        Ok(())
    }

    /// Runs `instance.destroy()` in the background, outside any lock.
    /// Failures are logged and left for the next `sync` to retry once
    /// `timeout_shutdown` has elapsed.
    fn destroy_in_background(&self, id: InstanceId, instance: Arc<dyn Instance>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.wait_for_cloud_op_slot().await;
            match instance.destroy().await {
                Ok(()) => metrics::record_driver_operation("Destroy", true),
                Err(err) => {
                    metrics::record_driver_operation("Destroy", false);
                    warn!(instance = %id, error = %err, "destroy failed, will retry on next sync");
                }
            }
        });
    }

    fn update_worker(&self, instance: Arc<dyn Instance>, instance_type: InstanceType, fresh_secret: Option<String>) {
        let now = self.now();
        let id = instance.id();
        let prefix = self.inner.config.tag_key_prefix.clone();
        let mut shared = self.inner.shared.write().unwrap();

        if let Some(wkr) = shared.workers.get_mut(&id) {
            wkr.set_instance(instance, now);
            drop(shared);
            self.spawn_save_tags(id);
            return;
        }

        let secret = fresh_secret.unwrap_or_else(|| instance.tags().get(&tags::qualify(&prefix, tags::TAG_INSTANCE_SECRET)).cloned().unwrap_or_default());
        let state = if shared.creating.contains_key(&secret) { State::Booting } else { State::Unknown };
        let idle_behavior = resolve_tag_idle_behavior(&instance.tags(), &prefix);
        let executor = self.inner.executor_factory.create(instance.address());

        info!(instance = %id, ?state, ?idle_behavior, "instance appeared in cloud");
        let wkr = Worker::new(instance, instance_type, state, idle_behavior, now, prefix, executor, secret);
        shared.workers.insert(id.clone(), wkr);
        drop(shared);
        self.loaded_wakeup();
        self.spawn_save_tags(id);
    }

    /// Persists the worker's current `IdleBehavior` as a cloud tag, so a
    /// restarted dispatcher recovers operator intent. Runs outside any lock;
    /// failures are logged and swallowed, tags are best-effort (the
    /// in-memory field is the source of truth).
    fn spawn_save_tags(&self, id: InstanceId) {
        let this = self.clone();
        tokio::spawn(async move {
            let snapshot = {
                let shared = this.inner.shared.read().unwrap();
                shared.workers.get(&id).map(|wkr| (wkr.instance().clone(), wkr.idle_behavior(), wkr.tag_key_prefix().to_string()))
            };
            let Some((instance, idle_behavior, prefix)) = snapshot else { return };
            let mut tags = instance.tags();
            tags.insert(tags::qualify(&prefix, tags::TAG_IDLE_BEHAVIOR), idle_behavior.as_tag_value().to_string());
            if let Err(err) = instance.set_tags(tags).await {
                warn!(instance = %id, error = %err, "failed to persist tags");
            }
        });
    }

    fn loaded_wakeup(&self) { self.inner.loaded_notify.notify_waiters(); }

    /// Reconciles the worker map against a fresh `instances()` listing.
    /// Workers not seen in `instances` and not updated since `threshold` are
    /// removed and counted as a disappearance keyed by their last state.
    fn sync(&self, threshold: SystemTime, instances: Vec<Arc<dyn Instance>>) {
        let prefix = self.inner.config.tag_key_prefix.clone();
        let mut notify = false;

        for inst in instances {
            let it_tag = inst.tags().get(&tags::qualify(&prefix, tags::TAG_INSTANCE_TYPE)).cloned().unwrap_or_default();
            let Some(it) = self.inner.config.instance_types.get(&it_tag).cloned() else {
                warn!(instance = %inst.id(), tag = it_tag, "unknown instance type tag, ignoring");
                continue;
            };
            let existed = self.inner.shared.read().unwrap().workers.contains_key(&inst.id());
            self.update_worker(inst.clone(), it, None);
            if !existed {
                notify = true;
            } else {
                let retry = {
                    let mut shared = self.inner.shared.write().unwrap();
                    let timeout_shutdown = self.inner.config.timeout_shutdown;
                    let now = self.now();
                    shared.workers.get_mut(&inst.id()).and_then(|wkr| {
                        if wkr.state() == State::Shutdown && wkr.destroyed.is_some_and(|d| now.duration_since(d).unwrap_or_default() > timeout_shutdown) {
                            info!(instance = %inst.id(), "worker still listed after shutdown, retrying destroy");
                            Some(wkr.begin_shutdown(now))
                        } else {
                            None
                        }
                    })
                };
                if let Some(instance) = retry {
                    self.destroy_in_background(inst.id(), instance);
                }
            }
        }

        let mut shared = self.inner.shared.write().unwrap();
        let to_remove: Vec<InstanceId> = shared.workers.iter().filter(|(_, w)| w.updated <= threshold).map(|(id, _)| id.clone()).collect();
        for id in to_remove {
            if let Some(wkr) = shared.workers.remove(&id) {
                info!(instance = %id, state = %wkr.state(), "instance disappeared in cloud");
                metrics::INSTANCES_DISAPPEARED.with_label_values(&[wkr.state().as_str()]).inc();
                notify = true;
            }
        }

        if !shared.loaded {
            shared.loaded = true;
            notify = true;
            info!(workers = shared.workers.len(), "loaded initial instance list");
        }
        drop(shared);

        if notify {
            self.loaded_wakeup();
            self.notify();
        }
    }

    async fn get_instances_and_sync(&self) {
        if self.inner.list_throttle.error().is_some() {
            return;
        }
        let threshold = self.now();
        let prefix = self.inner.config.tag_key_prefix.clone();
        let mut filter = InstanceTags::new();
        filter.insert(tags::qualify(&prefix, tags::TAG_INSTANCE_SET_ID), self.inner.config.instance_set_id.to_string());

        match self.inner.instance_set.instances(&filter).await {
            Ok(instances) => {
                metrics::record_driver_operation("List", true);
                self.inner.list_throttle.record_success();
                let instances: Vec<Arc<dyn Instance>> = instances.into_iter().map(Arc::from).collect();
                self.sync(threshold, instances);
            }
            Err(err) => {
                metrics::record_driver_operation("List", false);
                warn!(error = %err, "sync failed");
                self.inner.list_throttle.check_rate_limit_error(&err, "list");
            }
        }
    }

    fn update_metrics(&self) {
        let shared = self.inner.shared.read().unwrap();
        let mut instances: BTreeMap<&str, i64> = BTreeMap::new();
        let mut price: BTreeMap<&str, f64> = BTreeMap::new();
        let mut cpu: BTreeMap<&str, i64> = BTreeMap::new();
        let mut mem: BTreeMap<&str, i64> = BTreeMap::new();
        let mut running = 0i64;

        for wkr in shared.workers.values() {
            let cat = if !wkr.running.is_empty() || !wkr.starting.is_empty() {
                "inuse"
            } else if wkr.idle_behavior() == IdleBehavior::Hold {
                "hold"
            } else if wkr.state() == State::Booting {
                "booting"
            } else if wkr.state() == State::Unknown {
                "unknown"
            } else {
                "idle"
            };
            *instances.entry(cat).or_insert(0) += 1;
            *price.entry(cat).or_insert(0.0) += wkr.instance_type().price;
            *cpu.entry(cat).or_insert(0) += i64::from(wkr.instance_type().vcpus);
            *mem.entry(cat).or_insert(0) += wkr.instance_type().ram_bytes as i64;
            running += (wkr.running.len() + wkr.starting.len()) as i64;
        }

        for cat in metrics::CATEGORIES {
            metrics::INSTANCES_TOTAL.with_label_values(&[cat]).set(*instances.get(cat).unwrap_or(&0));
            metrics::INSTANCES_PRICE.with_label_values(&[cat]).set(*price.get(cat).unwrap_or(&0.0));
            metrics::VCPUS_TOTAL.with_label_values(&[cat]).set(*cpu.get(cat).unwrap_or(&0));
            metrics::MEMORY_BYTES_TOTAL.with_label_values(&[cat]).set(*mem.get(cat).unwrap_or(&0));
        }
        metrics::CONTAINERS_RUNNING.set(running);
    }

    /// Spawns the sync, probe, and metrics background loops. Call once after
    /// constructing the pool. Loops stop when [`Pool::stop`] is called.
    pub fn start_background_loops(&self) {
        let sync_pool = self.clone();
        tokio::spawn(async move { sync_pool.run_sync().await });

        let probe_pool = self.clone();
        tokio::spawn(async move { probe_pool.run_probes().await });

        let metrics_pool = self.clone();
        tokio::spawn(async move { metrics_pool.run_metrics().await });
    }

    async fn run_sync(&self) {
        let mut interval = tokio::time::interval(self.inner.config.sync_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.get_instances_and_sync().await;
                }
                () = self.inner.cancel.cancelled() => {
                    debug!("sync loop stopped");
                    return;
                }
            }
        }
    }

    async fn run_probes(&self) {
        let max_pps = self.inner.config.max_probes_per_second.max(1);
        let mut limiter = tokio::time::interval(Duration::from_secs(1) / max_pps);
        let mut probe_ticker = tokio::time::interval(self.inner.config.probe_interval);

        loop {
            tokio::select! {
                _ = probe_ticker.tick() => {}
                () = self.inner.cancel.cancelled() => {
                    debug!("probe loop stopped");
                    return;
                }
            }

            let now = self.now();
            let timeout_idle = self.inner.config.timeout_idle;
            let (ids, idle_timed_out): (Vec<InstanceId>, Vec<InstanceId>) = {
                let shared = self.inner.shared.read().unwrap();
                let mut ids = Vec::new();
                let mut idle_timed_out = Vec::new();
                for (id, w) in &shared.workers {
                    if w.state() == State::Shutdown {
                        continue;
                    }
                    if w.should_shutdown_idle(now, timeout_idle) {
                        idle_timed_out.push(id.clone());
                    } else {
                        ids.push(id.clone());
                    }
                }
                (ids, idle_timed_out)
            };

            for id in idle_timed_out {
                self.shutdown_idle_worker(&id, now);
            }

            for id in ids {
                let this = self.clone();
                tokio::spawn(async move { this.probe_and_update(&id).await });
                tokio::select! {
                    _ = limiter.tick() => {}
                    () = self.inner.cancel.cancelled() => return,
                }
            }
        }
    }

    /// Shuts down a worker that `should_shutdown_idle` flagged: mutates state
    /// under the lock, then destroys outside it, same pattern as
    /// `shutdown`/`kill_instance`.
    fn shutdown_idle_worker(&self, id: &InstanceId, now: SystemTime) {
        let instance = {
            let mut shared = self.inner.shared.write().unwrap();
            shared.workers.get_mut(id).map(|wkr| {
                info!(instance = %id, "idle timeout elapsed, shutting down");
                wkr.begin_shutdown(now)
            })
        };
        if let Some(instance) = instance {
            self.destroy_in_background(id.clone(), instance);
        }
        self.notify();
    }

    async fn run_metrics(&self) {
        // Lives for the pool's lifetime, so there's no matching unsubscribe.
        let (_id, mut rx) = self.subscribe();
        self.update_metrics();
        loop {
            tokio::select! {
                got = rx.recv() => {
                    if got.is_none() { return; }
                    self.update_metrics();
                }
                () = self.inner.cancel.cancelled() => {
                    debug!("metrics loop stopped");
                    return;
                }
            }
        }
    }

    /// The per-worker probe tick: acquires the worker's probing slot (drops
    /// the tick if one is already in flight), runs the boot or status probe
    /// as appropriate, and applies the result.
    async fn probe_and_update(&self, id: &InstanceId) {
        let acquired = {
            let shared = self.inner.shared.read().unwrap();
            shared.workers.get(id).is_some_and(Worker::try_start_probe)
        };
        if !acquired {
            return;
        }

        let snapshot = {
            let shared = self.inner.shared.read().unwrap();
            shared.workers.get(id).map(|wkr| {
                (
                    wkr.executor().clone(),
                    wkr.secret().to_string(),
                    wkr.state() != State::Booting && wkr.state() != State::Unknown,
                )
            })
        };
        let Some((executor, secret, booted)) = snapshot else {
            return;
        };

        let outcome = if !booted {
            self.run_boot_probe(id, &executor, &secret, self.inner.config.timeout_booting).await
        } else {
            self.run_status_probe(id, &executor, self.inner.config.timeout_probe).await
        };

        if let Some(wkr) = self.inner.shared.read().unwrap().workers.get(id) {
            wkr.finish_probe();
        }

        let Some(outcome) = outcome else { return };

        if let Some(instance) = outcome.destroy.clone() {
            self.destroy_in_background(id.clone(), instance);
        }

        if !outcome.exited.is_empty() {
            let now = self.now();
            let mut shared = self.inner.shared.write().unwrap();
            for uuid in &outcome.exited {
                shared.exited.insert(uuid.clone(), now);
            }
        }

        if outcome.newly_idle || outcome.newly_shutdown || !outcome.exited.is_empty() || !outcome.moved_starting_to_running.is_empty() {
            self.notify();
        }
    }

    /// Runs `BootProbeCommand` over `executor` and applies its result to the
    /// worker. A transport error is treated the same as a nonzero exit: still
    /// booting, not (yet) a secret mismatch. A host-key mismatch is
    /// conclusive on its own and shuts the worker down immediately.
    async fn run_boot_probe(&self, id: &InstanceId, executor: &Arc<dyn Executor>, secret: &str, timeout_booting: Duration) -> Option<ProbeOutcome> {
        let now = self.now();
        let env = BTreeMap::new();
        let boot_probe_command = self.inner.config.boot_probe_command.clone();
        let (stdout, exit_code) = match executor.execute(&env, &boot_probe_command, &[]).await {
            Ok((stdout, _stderr, code)) => (stdout, code),
            Err(ExecutorError::HostKeyMismatch { .. }) => {
                warn!(instance = %id, "host key mismatch on boot probe, shutting down");
                let mut shared = self.inner.shared.write().unwrap();
                let wkr = shared.workers.get_mut(id)?;
                return Some(wkr.shutdown_immediately(now));
            }
            Err(err) => {
                debug!(instance = %id, error = %err, "boot probe transport error");
                (Vec::new(), -1)
            }
        };
        let verifier = TagVerifier::new(secret.to_string());
        let secret_match = verifier.verify(&String::from_utf8_lossy(&stdout));

        let mut shared = self.inner.shared.write().unwrap();
        let wkr = shared.workers.get_mut(id)?;
        Some(wkr.apply_boot_probe(now, exit_code == 0, secret_match, timeout_booting))
    }

    /// Runs the status probe (lists `crunch-run` processes) over `executor`
    /// and applies the observed container UUIDs to the worker. A host-key
    /// mismatch shuts the worker down immediately. Any other failure (nonzero
    /// exit or transport error) does not reconcile containers or advance
    /// `probed`, so a single bad probe never reads as "every container
    /// exited" and persistent failure is judged against the last *successful*
    /// probe.
    async fn run_status_probe(&self, id: &InstanceId, executor: &Arc<dyn Executor>, timeout_probe: Duration) -> Option<ProbeOutcome> {
        let now = self.now();
        let env = BTreeMap::new();
        match executor.execute(&env, LIST_PROCESSES_COMMAND, &[]).await {
            Ok((stdout, _stderr, code)) if code == 0 => {
                let observed = parse_container_uuids(&String::from_utf8_lossy(&stdout));
                let mut shared = self.inner.shared.write().unwrap();
                let wkr = shared.workers.get_mut(id)?;
                Some(wkr.apply_status_probe(now, &observed, timeout_probe))
            }
            Ok((_, stderr, code)) => {
                warn!(instance = %id, code, stderr = %String::from_utf8_lossy(&stderr), "status probe exited nonzero");
                let mut shared = self.inner.shared.write().unwrap();
                let wkr = shared.workers.get_mut(id)?;
                Some(wkr.apply_status_probe_failure(now, timeout_probe))
            }
            Err(ExecutorError::HostKeyMismatch { .. }) => {
                warn!(instance = %id, "host key mismatch on status probe, shutting down");
                let mut shared = self.inner.shared.write().unwrap();
                let wkr = shared.workers.get_mut(id)?;
                Some(wkr.shutdown_immediately(now))
            }
            Err(err) => {
                warn!(instance = %id, error = %err, "status probe transport error");
                let mut shared = self.inner.shared.write().unwrap();
                let wkr = shared.workers.get_mut(id)?;
                Some(wkr.apply_status_probe_failure(now, timeout_probe))
            }
        }
    }

    /// Cancels the background loops. Already-running probes finish.
    pub fn stop(&self) { self.inner.cancel.cancel(); }

    #[must_use]
    pub fn instance_types(&self) -> &BTreeMap<String, InstanceType> { &self.inner.config.instance_types }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cloudpool_cloud::fake::{FakeExecutorFactory, FakeInstanceSet};

    use super::Pool;
    use crate::{clock::FakeClock, config::PoolConfig};

    fn instance_type(name: &str) -> cloudpool_cloud::InstanceType {
        cloudpool_cloud::InstanceType {
            name: name.to_string(),
            provider_type: "m5.large".into(),
            vcpus: 2,
            ram_bytes: 4 << 30,
            scratch_bytes: 0,
            price: 0.1,
            preemptible: false,
        }
    }

    fn test_pool() -> (Pool, Arc<FakeExecutorFactory>) {
        let mut instance_types = std::collections::BTreeMap::new();
        instance_types.insert("small".to_string(), instance_type("small"));
        let config = PoolConfig::builder()
            .instance_set_id("disp1")
            .boot_probe_command("true")
            .image_id("img-123")
            .driver("fake")
            .dispatch_private_key_path("/dev/null")
            .instance_types(instance_types)
            .build();
        let clock = Arc::new(FakeClock::default());
        let driver = Arc::new(FakeInstanceSet::new());
        let executor_factory = Arc::new(FakeExecutorFactory::new());
        let pool = Pool::new(config, driver, executor_factory.clone(), clock);
        (pool, executor_factory)
    }

    #[tokio::test]
    async fn create_returns_true_and_adds_to_creating() {
        let (pool, _executors) = test_pool();
        assert!(pool.create(instance_type("small")));
        // Give the spawned create task a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let unalloc = pool.unallocated();
        assert_eq!(unalloc.get("small").copied().unwrap_or(0), 1);
    }

    #[tokio::test]
    async fn forget_container_is_idempotent_noop_when_absent() {
        let (pool, _executors) = test_pool();
        pool.forget_container("no-such-uuid");
        assert!(pool.running().is_empty());
    }

    #[tokio::test]
    async fn set_idle_behavior_on_unknown_id_errors() {
        let (pool, _executors) = test_pool();
        let err = pool.set_idle_behavior(&cloudpool_cloud::InstanceId("nope".into()), cloudpool_cloud::IdleBehavior::Hold).unwrap_err();
        assert!(matches!(err, crate::err::Error::UnknownInstance { .. }));
    }

    #[tokio::test]
    async fn kill_instance_on_unknown_id_errors() {
        let (pool, _executors) = test_pool();
        let err = pool.kill_instance(&cloudpool_cloud::InstanceId("nope".into()), "test").await.unwrap_err();
        assert!(matches!(err, crate::err::Error::UnknownInstance { .. }));
    }

    #[tokio::test]
    async fn create_then_sync_promotes_to_booting_and_boot_probe_goes_idle() {
        let (pool, executors) = test_pool();
        assert!(pool.create(instance_type("small")));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let unalloc = pool.unallocated();
        assert_eq!(unalloc.get("small").copied().unwrap_or(0), 1);

        let views = pool.instances();
        assert_eq!(views.len(), 1);
        let id = views[0].instance.clone();

        let executor = executors.executor_for(&views[0].address).expect("executor built for worker");
        executor.set_response("true", b"", b"", 0);

        pool.probe_and_update(&id).await;
        let views = pool.instances();
        assert_eq!(views[0].worker_state, "idle");
    }

    #[tokio::test]
    async fn kill_instance_destroys_and_notifies() {
        let (pool, _executors) = test_pool();
        assert!(pool.create(instance_type("small")));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let views = pool.instances();
        assert_eq!(views.len(), 1);
        let id = views[0].instance.clone();

        let (_id, mut rx) = pool.subscribe();
        pool.kill_instance(&id, "test").await.unwrap();
        assert_eq!(pool.instances()[0].worker_state, "shutdown");
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_removes_subscriber_before_next_notify() {
        let (pool, _executors) = test_pool();
        let (id, mut rx) = pool.subscribe();
        pool.unsubscribe(id);
        assert!(pool.create(instance_type("small")));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
