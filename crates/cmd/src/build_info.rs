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

/// Package author information from Cargo.toml, baked in at compile time.
pub const AUTHOR: &str = env!("CARGO_PKG_AUTHORS");

/// Package version from Cargo.toml. No VCS metadata is embedded: this
/// workspace has no build script to capture it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
