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

//! The SSH-like command runner the pool drives probes and container
//! start/kill commands through.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExecutorError {
    #[snafu(display("command timed out after {elapsed_ms}ms"))]
    Timeout {
        elapsed_ms: u64,
        #[snafu(implicit)]
        loc: snafu::Location,
    },
    #[snafu(display("host key verification failed for {address}"))]
    HostKeyMismatch {
        address: String,
        #[snafu(implicit)]
        loc: snafu::Location,
    },
    #[snafu(display("transport error: {message}"))]
    Transport {
        message: String,
        #[snafu(implicit)]
        loc: snafu::Location,
    },
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Runs commands on a single remote target, retargetable without tearing down
/// the underlying connection when the new target is the same host.
///
/// `set_target` is called frequently (on every sync that re-resolves an
/// instance's address) and in the common case the new target is identical to
/// the old one; implementations should make that path cheap and must not
/// block a concurrently running `execute`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        env: &BTreeMap<String, String>,
        cmd: &str,
        stdin: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>, i32)>;

    fn set_target(&self, address: String);

    fn close(&self);
}

/// Builds a fresh [`Executor`] bound to `address` for a newly-discovered
/// worker. The pool calls this once per `Worker` and thereafter retargets the
/// same executor via [`Executor::set_target`] rather than rebuilding it, so a
/// real implementation can amortize connection setup (host key caching,
/// multiplexed sessions, ...) across a worker's lifetime.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, address: String) -> Arc<dyn Executor>;
}
