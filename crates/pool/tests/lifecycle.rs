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

//! End-to-end lifecycle scenarios driven entirely through `Pool`'s public
//! surface, with the background loops actually running (unlike the in-module
//! unit tests in `pool.rs`, which drive `probe_and_update` directly).

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use cloudpool_cloud::{
    IdleBehavior, InstanceType,
    fake::{FakeExecutorFactory, FakeInstanceSet},
};
use cloudpool_pool::{Pool, PoolConfig, SystemClock};

fn small_instance_type() -> InstanceType {
    InstanceType { name: "small".into(), provider_type: "m5.large".into(), vcpus: 2, ram_bytes: 4 << 30, scratch_bytes: 0, price: 0.1, preemptible: false }
}

/// Background loops poll on wall-clock intervals, so tests that exercise
/// them run against `SystemClock` with intervals short enough to complete
/// in well under a second.
fn fast_test_pool() -> (Pool, Arc<FakeInstanceSet>, Arc<FakeExecutorFactory>) {
    let mut instance_types = BTreeMap::new();
    instance_types.insert("small".to_string(), small_instance_type());
    let config = PoolConfig::builder()
        .instance_set_id("disp1")
        .boot_probe_command("true")
        .image_id("img-123")
        .driver("fake")
        .dispatch_private_key_path("/dev/null")
        .instance_types(instance_types)
        .sync_interval(Duration::from_millis(20))
        .probe_interval(Duration::from_millis(20))
        .max_probes_per_second(50)
        .timeout_idle(Duration::from_secs(60))
        .timeout_shutdown(Duration::from_millis(10))
        .build();
    let instance_set = Arc::new(FakeInstanceSet::new());
    let executor_factory = Arc::new(FakeExecutorFactory::new());
    let pool = Pool::new(config, instance_set.clone(), executor_factory.clone(), Arc::new(SystemClock));
    (pool, instance_set, executor_factory)
}

async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

#[tokio::test]
async fn happy_path_create_boot_probe_run_container() {
    let (pool, _instance_set, executors) = fast_test_pool();
    pool.start_background_loops();

    assert!(pool.create(small_instance_type()));

    assert!(wait_until(|| pool.instances().len() == 1, Duration::from_secs(2)).await, "worker never appeared");

    let address = pool.instances()[0].address.clone();
    let executor = executors.executor_for(&address).expect("executor built for the new worker");
    executor.set_response("true", b"", b"", 0);

    assert!(wait_until(|| pool.instances()[0].worker_state == "idle", Duration::from_secs(2)).await, "worker never reached idle");

    let container_executor = executors.executor_for(&address).expect("executor still registered");
    assert!(pool.start_container("small", "zzzzz-dz642-0000000000000aa".to_string(), container_executor, "crunch-run", b"{}"));

    let running = pool.running();
    assert!(running.contains_key("zzzzz-dz642-0000000000000aa"));

    pool.stop();
}

#[tokio::test]
async fn kill_instance_is_reflected_in_instances_and_notifies_subscribers() {
    let (pool, _instance_set, _executors) = fast_test_pool();
    pool.start_background_loops();

    assert!(pool.create(small_instance_type()));
    assert!(wait_until(|| pool.instances().len() == 1, Duration::from_secs(2)).await);
    let id = pool.instances()[0].instance.clone();

    let (_subscription_id, mut subscription) = pool.subscribe();
    pool.kill_instance(&id, "test teardown").await.unwrap();
    assert_eq!(pool.instances()[0].worker_state, "shutdown");
    assert!(subscription.try_recv().is_ok() || wait_until(|| subscription.try_recv().is_ok(), Duration::from_millis(200)).await);

    // The fake driver actually removes the instance once `destroy` succeeds;
    // the next sync tick should notice it is gone.
    assert!(wait_until(|| pool.instances().is_empty(), Duration::from_secs(2)).await, "worker was never reaped after disappearing");

    pool.stop();
}

#[tokio::test]
async fn idle_worker_past_timeout_is_shut_down_automatically() {
    let mut instance_types = BTreeMap::new();
    instance_types.insert("small".to_string(), small_instance_type());
    let config = PoolConfig::builder()
        .instance_set_id("disp1")
        .boot_probe_command("true")
        .image_id("img-123")
        .driver("fake")
        .dispatch_private_key_path("/dev/null")
        .instance_types(instance_types)
        .sync_interval(Duration::from_millis(20))
        .probe_interval(Duration::from_millis(20))
        .max_probes_per_second(50)
        .timeout_idle(Duration::from_millis(50))
        .timeout_shutdown(Duration::from_millis(10))
        .build();
    let instance_set = Arc::new(FakeInstanceSet::new());
    let executor_factory = Arc::new(FakeExecutorFactory::new());
    let pool = Pool::new(config, instance_set.clone(), executor_factory.clone(), Arc::new(SystemClock));
    pool.start_background_loops();

    assert!(pool.create(small_instance_type()));
    assert!(wait_until(|| pool.instances().len() == 1, Duration::from_secs(2)).await);
    let address = pool.instances()[0].address.clone();
    executor_factory.executor_for(&address).unwrap().set_response("true", b"", b"", 0);
    assert!(wait_until(|| pool.instances()[0].worker_state == "idle", Duration::from_secs(2)).await);

    assert!(
        wait_until(|| pool.instances().first().map_or(true, |v| v.worker_state == "shutdown"), Duration::from_secs(2)).await,
        "worker sat idle past timeout_idle without ever being shut down"
    );

    pool.stop();
}

#[tokio::test]
async fn host_key_mismatch_on_booted_worker_shuts_it_down() {
    let (pool, _instance_set, executors) = fast_test_pool();
    pool.start_background_loops();

    assert!(pool.create(small_instance_type()));
    assert!(wait_until(|| pool.instances().len() == 1, Duration::from_secs(2)).await);
    let address = pool.instances()[0].address.clone();
    let executor = executors.executor_for(&address).unwrap();
    executor.set_response("true", b"", b"", 0);
    assert!(wait_until(|| pool.instances()[0].worker_state == "idle", Duration::from_secs(2)).await);

    executor.inject_host_key_mismatch();
    assert!(
        wait_until(|| pool.instances().first().map_or(true, |v| v.worker_state == "shutdown"), Duration::from_secs(2)).await,
        "worker was never shut down after a host key mismatch"
    );

    pool.stop();
}

#[tokio::test]
async fn persistent_status_probe_failure_does_not_wipe_running_then_shuts_down() {
    let mut instance_types = BTreeMap::new();
    instance_types.insert("small".to_string(), small_instance_type());
    let config = PoolConfig::builder()
        .instance_set_id("disp1")
        .boot_probe_command("true")
        .image_id("img-123")
        .driver("fake")
        .dispatch_private_key_path("/dev/null")
        .instance_types(instance_types)
        .sync_interval(Duration::from_millis(20))
        .probe_interval(Duration::from_millis(20))
        .max_probes_per_second(50)
        .timeout_probe(Duration::from_millis(150))
        .timeout_shutdown(Duration::from_millis(10))
        .build();
    let instance_set = Arc::new(FakeInstanceSet::new());
    let executor_factory = Arc::new(FakeExecutorFactory::new());
    let pool = Pool::new(config, instance_set.clone(), executor_factory.clone(), Arc::new(SystemClock));
    pool.start_background_loops();

    assert!(pool.create(small_instance_type()));
    assert!(wait_until(|| pool.instances().len() == 1, Duration::from_secs(2)).await);
    let address = pool.instances()[0].address.clone();
    let executor = executor_factory.executor_for(&address).unwrap();
    executor.set_response("true", b"", b"", 0);
    assert!(wait_until(|| pool.instances()[0].worker_state == "idle", Duration::from_secs(2)).await);

    let container_executor = executor_factory.executor_for(&address).unwrap();
    assert!(pool.start_container("small", "zzzzz-dz642-0000000000000bb".to_string(), container_executor, "crunch-run", b"{}"));
    assert!(wait_until(|| pool.instances()[0].worker_state == "running", Duration::from_secs(2)).await);

    // Simulate the SSH transport going down: every subsequent probe fails.
    executor.close();

    // A handful of failed probes pass (probe_interval 20ms); a single one of
    // them must not be read as "every container exited".
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(
        pool.running().contains_key("zzzzz-dz642-0000000000000bb"),
        "a transient-looking probe failure must not clear running containers"
    );

    // Once failures persist past timeout_probe the worker is shut down.
    assert!(
        wait_until(|| pool.instances().first().map_or(true, |v| v.worker_state == "shutdown"), Duration::from_secs(2)).await,
        "worker was never shut down after persistent probe failure"
    );

    pool.stop();
}

#[tokio::test]
async fn quota_error_blocks_further_creates_until_cooldown() {
    // No background loops here: quota cooldown is a `Pool::create`-local
    // concern, and running `run_sync` concurrently could let a background
    // `instances()` call consume the injected error instead of `create`.
    let (pool, instance_set, _executors) = fast_test_pool();

    instance_set.inject_quota_error();
    assert!(pool.create(small_instance_type()));
    assert!(wait_until(|| pool.at_quota(), Duration::from_secs(1)).await, "quota error never registered");

    assert!(!pool.create(small_instance_type()), "create should be refused while at quota");
    assert!(instance_set.is_empty(), "no instance should have been created while refused");
}

#[tokio::test]
async fn set_idle_behavior_hold_keeps_worker_out_of_unallocated_shutdown_candidates() {
    let (pool, _instance_set, executors) = fast_test_pool();
    pool.start_background_loops();

    assert!(pool.create(small_instance_type()));
    assert!(wait_until(|| pool.instances().len() == 1, Duration::from_secs(2)).await);
    let id = pool.instances()[0].instance.clone();
    let address = pool.instances()[0].address.clone();
    executors.executor_for(&address).unwrap().set_response("true", b"", b"", 0);
    assert!(wait_until(|| pool.instances()[0].worker_state == "idle", Duration::from_secs(2)).await);

    pool.set_idle_behavior(&id, IdleBehavior::Hold).unwrap();
    assert!(!pool.shutdown("small").await, "a held worker must not be selected for shutdown");

    pool.stop();
}
