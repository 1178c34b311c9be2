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

use std::net::IpAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::ListParams;

use super::{Error, PodProvider, PodRecord, ResolutionQuery, select_owner};

/// PodLister runs a field-selected list against the pod collection of every namespace.
#[async_trait::async_trait]
pub trait PodLister: Send + Sync {
    async fn list_pods(&self, field_selector: &str) -> Result<Vec<Pod>, kube::Error>;
}

#[async_trait::async_trait]
impl PodLister for Api<Pod> {
    async fn list_pods(&self, field_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        let lp = ListParams::default().fields(field_selector);
        Ok(self.list(&lp).await?.items)
    }
}

/// ListProvider asks the API server on every lookup.
pub struct ListProvider {
    node_name: String,
    lister: Arc<dyn PodLister>,
}

impl ListProvider {
    pub fn new(node_name: impl Into<String>, client: kube::Client) -> Self {
        Self::with_lister(node_name, Arc::new(Api::<Pod>::all(client)))
    }

    pub fn with_lister(node_name: impl Into<String>, lister: Arc<dyn PodLister>) -> Self {
        ListProvider {
            node_name: node_name.into(),
            lister,
        }
    }
}

#[async_trait::async_trait]
impl PodProvider for ListProvider {
    async fn get_by_ip(&self, ip: IpAddr) -> Result<PodRecord, Error> {
        let query = ResolutionQuery {
            node_name: &self.node_name,
            ip,
        };
        let pods = self
            .lister
            .list_pods(&query.field_selector())
            .await
            .map_err(|source| Error::Query { ip, source })?;
        select_owner(ip, pods.iter().map(PodRecord::from))
    }
}
