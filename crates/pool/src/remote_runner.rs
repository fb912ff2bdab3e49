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

//! A handle on a single container process (crunch-run, in the system this
//! pool reimplements) running on one worker.
//!
//! `RemoteRunner` only tracks intent: `start` writes the command that begins
//! the remote process, `kill` writes the command that ends it. Whether those
//! commands actually took effect is only known once the next probe observes
//! the container's process state; the runner itself does not poll.

use std::sync::Arc;

use cloudpool_cloud::Executor;
use tracing::{debug, info, warn};

/// Container UUID this runner is responsible for.
pub type ContainerUuid = String;

pub struct RemoteRunner {
    uuid: ContainerUuid,
    executor: Arc<dyn Executor>,
}

impl RemoteRunner {
    #[must_use]
    pub fn new(uuid: ContainerUuid, executor: Arc<dyn Executor>) -> Self { Self { uuid, executor } }

    #[must_use]
    pub fn uuid(&self) -> &str { &self.uuid }

    /// Writes `record` (the container's runtime constraints and auth token)
    /// over the executor's stdin to a detached `crunch-run` invocation.
    /// Returns once the command has been issued; the caller is responsible
    /// for tracking the container under `starting` until the next probe
    /// confirms it's alive.
    pub async fn start(&self, crunch_run_command: &str, record: &[u8]) {
        info!(container = self.uuid, "starting container");
        let env = std::collections::BTreeMap::new();
        match self.executor.execute(&env, crunch_run_command, record).await {
            Ok((_, _, code)) if code == 0 => {}
            Ok((_, stderr, code)) => {
                warn!(container = self.uuid, code, stderr = %String::from_utf8_lossy(&stderr), "start command exited nonzero");
            }
            Err(err) => warn!(container = self.uuid, error = %err, "failed to issue start command"),
        }
    }

    /// Issues the kill sequence in the background: a polite `term_command`
    /// first, then (if the caller hasn't called `close` in the meantime,
    /// i.e. the container hasn't been observed to exit) an unconditional
    /// `kill_command` after `timeout_term`. Gives up `timeout_signal` after
    /// that; subsequent probes reflect whatever the remote side actually
    /// did. This runner does not poll the container's state itself.
    pub fn kill(self: &Arc<Self>, reason: String, term_command: String, kill_command: String, timeout_term: std::time::Duration, timeout_signal: std::time::Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            info!(container = this.uuid, reason, "sending terminate signal");
            let env = std::collections::BTreeMap::new();
            if let Err(err) = this.executor.execute(&env, &term_command, &[]).await {
                warn!(container = this.uuid, error = %err, "terminate command failed");
            }

            tokio::time::sleep(timeout_term).await;
            info!(container = this.uuid, "terminate grace period elapsed, sending kill signal");
            if let Err(err) = this.executor.execute(&env, &kill_command, &[]).await {
                warn!(container = this.uuid, error = %err, "kill command failed");
            }

            tokio::time::sleep(timeout_signal).await;
            debug!(container = this.uuid, "kill sequence complete, next probe will confirm");
        });
    }

    /// Releases local resources only. Does not touch the remote process: if
    /// it's still running, the next probe will see it and the pool will
    /// reconcile.
    pub fn close(&self) { self.executor.close(); }
}

impl std::fmt::Debug for RemoteRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRunner").field("uuid", &self.uuid).finish_non_exhaustive()
    }
}

/// A no-op [`Executor`] shared by this module's and `worker`'s tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use async_trait::async_trait;
    use cloudpool_cloud::{Executor, ExecutorError};

    #[derive(Debug, Default)]
    pub(crate) struct NullExecutor;

    #[async_trait]
    impl Executor for NullExecutor {
        async fn execute(
            &self,
            _env: &std::collections::BTreeMap<String, String>,
            _cmd: &str,
            _stdin: &[u8],
        ) -> Result<(Vec<u8>, Vec<u8>, i32), ExecutorError> {
            Ok((Vec::new(), Vec::new(), 0))
        }

        fn set_target(&self, _address: String) {}

        fn close(&self) {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use cloudpool_cloud::{Executor, ExecutorError};

    use super::RemoteRunner;

    #[derive(Default)]
    struct RecordingExecutor {
        executed: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl Executor for RecordingExecutor {
        async fn execute(
            &self,
            _env: &std::collections::BTreeMap<String, String>,
            _cmd: &str,
            _stdin: &[u8],
        ) -> Result<(Vec<u8>, Vec<u8>, i32), ExecutorError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok((Vec::new(), Vec::new(), 0))
        }

        fn set_target(&self, _address: String) {}

        fn close(&self) { self.closed.fetch_add(1, Ordering::SeqCst); }
    }

    #[tokio::test]
    async fn start_issues_one_execute_call() {
        let executor = Arc::new(RecordingExecutor::default());
        let runner = RemoteRunner::new("uuid-1".into(), executor.clone());
        runner.start("crunch-run --detach", b"record").await;
        assert_eq!(executor.executed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_delegates_to_executor() {
        let executor = Arc::new(RecordingExecutor::default());
        let runner = RemoteRunner::new("uuid-1".into(), executor.clone());
        runner.close();
        assert_eq!(executor.closed.load(Ordering::SeqCst), 1);
    }
}
