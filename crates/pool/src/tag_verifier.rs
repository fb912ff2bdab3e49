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

//! Proves that an instance answering on a probed address is the one this
//! pool created, not a stale or reused IP still answering for a previous
//! occupant.
//!
//! A random secret is minted per `Create` call, embedded in the instance's
//! tags and in its init script (which echoes it back over stdout once the
//! instance boots). [`TagVerifier::verify`] compares what the boot probe
//! actually observed against the tagged value.

use rand::RngCore;

/// Number of hex characters in a minted secret (32 random bytes).
pub const SECRET_LENGTH: usize = 64;

#[must_use]
pub fn generate_secret() -> String {
    let mut buf = [0u8; SECRET_LENGTH / 2];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Wraps the secret minted for one instance and the init-script fragment
/// that makes the instance prove it knows that secret.
#[derive(Clone, Debug)]
pub struct TagVerifier {
    secret: String,
}

impl TagVerifier {
    #[must_use]
    pub fn new(secret: String) -> Self { Self { secret } }

    /// The line appended to an instance's init script so that its first
    /// successful boot probe can echo the secret back.
    #[must_use]
    pub fn init_command(&self) -> String { format!("echo {}", self.secret) }

    /// True if `observed` (the boot probe's stdout, trimmed) matches the
    /// secret this verifier was constructed with. A mismatch (including a
    /// probe that returned nothing) means the address is answering for some
    /// other instance and the worker should be shut down, not promoted to
    /// `Idle`.
    #[must_use]
    pub fn verify(&self, observed: &str) -> bool { observed.trim() == self.secret }

    #[must_use]
    pub fn secret(&self) -> &str { &self.secret }
}

#[cfg(test)]
mod tests {
    use super::{SECRET_LENGTH, TagVerifier, generate_secret};

    #[test]
    fn generated_secret_has_expected_length_and_charset() {
        let secret = generate_secret();
        assert_eq!(secret.len(), SECRET_LENGTH);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_matches_trimmed_output() {
        let v = TagVerifier::new("abc123".to_string());
        assert!(v.verify("abc123\n"));
        assert!(v.verify("  abc123  "));
        assert!(!v.verify("xyz"));
        assert!(!v.verify(""));
    }

    #[test]
    fn init_command_embeds_secret() {
        let v = TagVerifier::new("deadbeef".to_string());
        assert_eq!(v.init_command(), "echo deadbeef");
    }
}
