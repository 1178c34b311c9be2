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

use k8s_openapi::api::core::v1::Node;
use kube::Api;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to load cluster configuration: {0}")]
    Config(#[from] kube::config::InferConfigError),
    #[error("failed to create cluster client: {0}")]
    Client(#[source] kube::Error),
    #[error("failed to get node {name}: {source}")]
    Node {
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Builds a client from the in-cluster service account, or the local kubeconfig outside a pod.
pub async fn client() -> Result<kube::Client, Error> {
    let config = kube::Config::infer().await?;
    kube::Client::try_from(config).map_err(Error::Client)
}

pub async fn get_node(client: kube::Client, name: &str) -> Result<Node, Error> {
    Api::<Node>::all(client)
        .get(name)
        .await
        .map_err(|source| Error::Node {
            name: name.to_string(),
            source,
        })
}
