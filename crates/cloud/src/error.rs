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

use snafu::Snafu;

/// Errors a cloud driver can report back to the pool.
///
/// The pool only branches on [`CloudError::is_quota_error`] and
/// [`CloudError::is_rate_limit_error`] (see [`crate::driver`]); every other
/// variant is treated uniformly as an infrastructure failure that gets
/// logged and fed to a throttle.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CloudError {
    /// The provider cannot create more instances right now (account limit,
    /// capacity exhaustion, ...). Pauses `Pool::create` for `quota_error_ttl`.
    #[snafu(display("quota exceeded: {message}"))]
    Quota {
        message: String,
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    /// The provider is rate-limiting this account/credential.
    #[snafu(display("rate limited: {message}"))]
    RateLimit {
        message: String,
        #[snafu(implicit)]
        loc: snafu::Location,
    },

    /// Any other provider-side failure (network error, auth failure, 5xx, ...).
    #[snafu(display("cloud driver error: {message}"))]
    Driver {
        message: String,
        #[snafu(implicit)]
        loc: snafu::Location,
    },
}

pub type Result<T> = std::result::Result<T, CloudError>;
