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

use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::pods::list::PodLister;

/// FakePodLister answers every list with the same pods and records the selectors it was given.
pub struct FakePodLister {
    pods: Vec<Pod>,
    fail: bool,
    delay: Option<Duration>,
    selectors: Mutex<Vec<String>>,
}

impl FakePodLister {
    pub fn new(pods: Vec<Pod>) -> Self {
        FakePodLister {
            pods,
            fail: false,
            delay: None,
            selectors: Mutex::new(Vec::new()),
        }
    }

    /// A lister whose API server always answers with an internal error.
    pub fn failing() -> Self {
        FakePodLister {
            fail: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn selectors(&self) -> Vec<String> {
        self.selectors.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PodLister for FakePodLister {
    async fn list_pods(&self, field_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        self.selectors
            .lock()
            .unwrap()
            .push(field_selector.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "etcdserver: request timed out".to_string(),
                reason: "InternalError".to_string(),
                code: 500,
            }));
        }
        Ok(self.pods.clone())
    }
}

/// A pod scheduled on `node-1` with its own network namespace.
pub fn test_pod(namespace: &str, name: &str, ip: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some("node-1".to_string()),
            host_network: Some(false),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
    }
}
