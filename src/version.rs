// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_GIT_REVISION: Option<&str> = option_env!("GIT_REVISION");
const BUILD_RUST_VERSION: Option<&str> = option_env!("RUSTC_VERSION");

#[derive(serde::Serialize, Clone, Debug)]
pub struct BuildInfo {
    version: &'static str,
    git_revision: &'static str,
    rust_version: &'static str,
}

impl BuildInfo {
    pub fn new() -> Self {
        BuildInfo {
            version: BUILD_VERSION,
            git_revision: BUILD_GIT_REVISION.unwrap_or("unknown"),
            rust_version: BUILD_RUST_VERSION.unwrap_or("unknown"),
        }
    }

    pub fn version(&self) -> &str {
        self.version
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "version.BuildInfo{{Version:\"{}\", GitRevision:\"{}\", RustVersion:\"{}\"}}",
            self.version, self.git_revision, self.rust_version
        )
    }
}
