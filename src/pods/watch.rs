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

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::metrics::Metrics;
use super::{Error, PodProvider, PodRecord, pod_ip, select_owner};

/// IpIndex maps pod IPs to the cached pods currently holding them.
#[derive(Default)]
struct IpIndex {
    by_ip: HashMap<IpAddr, HashSet<ObjectRef<Pod>>>,
    by_pod: HashMap<ObjectRef<Pod>, IpAddr>,
}

impl IpIndex {
    fn insert(&mut self, pod: &Pod) {
        let key = ObjectRef::from_obj(pod);
        self.remove(&key);
        if let Some(ip) = pod_ip(pod) {
            self.by_ip.entry(ip).or_default().insert(key.clone());
            self.by_pod.insert(key, ip);
        }
    }

    fn remove(&mut self, key: &ObjectRef<Pod>) {
        let Some(ip) = self.by_pod.remove(key) else {
            return;
        };
        if let Some(refs) = self.by_ip.get_mut(&ip) {
            refs.remove(key);
            if refs.is_empty() {
                self.by_ip.remove(&ip);
            }
        }
    }

    fn rebuild(&mut self, pods: impl IntoIterator<Item = Arc<Pod>>) {
        self.by_ip.clear();
        self.by_pod.clear();
        for pod in pods {
            self.insert(&pod);
        }
    }

    /// Follows the reflector: `store` already reflects `event`.
    fn apply(&mut self, event: &watcher::Event<Pod>, store: &Store<Pod>) {
        match event {
            watcher::Event::Apply(pod) => self.insert(pod),
            watcher::Event::Delete(pod) => self.remove(&ObjectRef::from_obj(pod)),
            // the store swaps in the relisted state on InitDone
            watcher::Event::InitDone => self.rebuild(store.state()),
            _ => {}
        }
    }

    fn get(&self, ip: IpAddr) -> Vec<ObjectRef<Pod>> {
        self.by_ip
            .get(&ip)
            .map(|refs| refs.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// WatchProvider answers lookups from a node-local cache of pods, kept current by a watch.
pub struct WatchProvider {
    store: Store<Pod>,
    index: Arc<RwLock<IpIndex>>,
    fallback: Option<Arc<dyn PodProvider>>,
    metrics: Arc<Metrics>,
}

fn watch_selector(node_name: &str) -> String {
    format!("spec.nodeName={node_name},spec.hostNetwork=false")
}

impl WatchProvider {
    /// Starts the watch in the background. The returned task ends once `cancel` fires.
    pub fn start(
        client: kube::Client,
        node_name: &str,
        fallback: Option<Arc<dyn PodProvider>>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let api = Api::<Pod>::all(client);
        let (store, writer) = reflector::store();
        let cfg = watcher::Config::default().fields(&watch_selector(node_name));
        let stream = watcher(api, cfg).default_backoff().reflect(writer);
        let provider = Self::from_store(store, fallback, metrics);

        let task = {
            let store = provider.store.clone();
            let index = provider.index.clone();
            let metrics = provider.metrics.clone();
            tokio::spawn(async move {
                let mut stream = std::pin::pin!(stream);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("pod watch cancelled");
                            break;
                        }
                        event = stream.next() => match event {
                            Some(Ok(event)) => {
                                index
                                    .write()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .apply(&event, &store);
                                metrics.cached_pods.set(store.len() as i64);
                            }
                            Some(Err(e)) => warn!("pod watch error: {e}"),
                            None => break,
                        },
                    }
                }
                info!("pod watch stopped");
            })
        };

        (provider, task)
    }

    /// Serves from an existing store. The IP index is built from its current contents.
    pub fn from_store(
        store: Store<Pod>,
        fallback: Option<Arc<dyn PodProvider>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut index = IpIndex::default();
        index.rebuild(store.state());
        WatchProvider {
            store,
            index: Arc::new(RwLock::new(index)),
            fallback,
            metrics,
        }
    }

    fn lookup(&self, ip: IpAddr) -> Result<PodRecord, Error> {
        let refs = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ip);
        let candidates = refs
            .iter()
            .filter_map(|key| self.store.get(key))
            // the store may have moved on since the index was read
            .filter(|pod| pod_ip(pod) == Some(ip))
            .map(|pod| PodRecord::from(&*pod))
            .filter(|pod| !pod.host_network)
            .collect::<Vec<_>>();
        select_owner(ip, candidates)
    }
}

#[async_trait::async_trait]
impl PodProvider for WatchProvider {
    async fn get_by_ip(&self, ip: IpAddr) -> Result<PodRecord, Error> {
        let err = match self.lookup(ip) {
            Ok(pod) => return Ok(pod),
            Err(e) => e,
        };
        let Some(fallback) = &self.fallback else {
            return Err(Error::Cache(Box::new(err)));
        };
        warn!(%ip, "pod cache lookup failed, querying the api server: {err}");
        let pod = fallback.get_by_ip(ip).await?;
        self.metrics.cache_misses.inc();
        Ok(pod)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pods::list::ListProvider;
    use crate::test_helpers::pods::{FakePodLister, test_pod};
    use kube::runtime::reflector::store::Writer;
    use matches::assert_matches;
    use prometheus_client::registry::Registry;

    fn ip() -> IpAddr {
        "10.1.2.3".parse().unwrap()
    }

    fn cache(pods: Vec<Pod>) -> Store<Pod> {
        let (store, mut writer): (Store<Pod>, Writer<Pod>) = reflector::store();
        for pod in pods {
            writer.apply_watcher_event(&watcher::Event::Apply(pod));
        }
        store
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new(&mut Registry::default()))
    }

    #[test]
    fn selector_excludes_host_network() {
        assert_eq!(
            watch_selector("node-1"),
            "spec.nodeName=node-1,spec.hostNetwork=false"
        );
    }

    #[tokio::test]
    async fn cache_hit() {
        let m = metrics();
        let lister = Arc::new(FakePodLister::new(vec![]));
        let fallback = Arc::new(ListProvider::with_lister("node-1", lister.clone()));
        let provider = WatchProvider::from_store(
            cache(vec![
                test_pod("ns", "a", "10.1.2.3", "Running"),
                test_pod("ns", "b", "10.1.2.4", "Running"),
            ]),
            Some(fallback),
            m.clone(),
        );
        let pod = provider.get_by_ip(ip()).await.unwrap();
        assert_eq!(pod.reference(), "ns/a");
        assert!(lister.selectors().is_empty());
        assert_eq!(m.cache_misses(), 0);
    }

    #[tokio::test]
    async fn miss_uses_fallback() {
        let m = metrics();
        let lister = Arc::new(FakePodLister::new(vec![test_pod(
            "ns", "late", "10.1.2.3", "Running",
        )]));
        let fallback = Arc::new(ListProvider::with_lister("node-1", lister.clone()));
        let provider = WatchProvider::from_store(cache(vec![]), Some(fallback), m.clone());
        let pod = provider.get_by_ip(ip()).await.unwrap();
        assert_eq!(pod.name, "late");
        assert_eq!(lister.selectors().len(), 1);
        assert_eq!(m.cache_misses(), 1);
    }

    #[tokio::test]
    async fn failed_fallback_is_not_counted() {
        let m = metrics();
        let fallback = Arc::new(ListProvider::with_lister(
            "node-1",
            Arc::new(FakePodLister::failing()),
        ));
        let provider = WatchProvider::from_store(cache(vec![]), Some(fallback), m.clone());
        assert_matches!(provider.get_by_ip(ip()).await, Err(Error::Query { .. }));
        assert_eq!(m.cache_misses(), 0);
    }

    #[test]
    fn index_follows_watch_events() {
        let (store, mut writer): (Store<Pod>, Writer<Pod>) = reflector::store();
        let mut index = IpIndex::default();
        let mut apply = |event: watcher::Event<Pod>| {
            writer.apply_watcher_event(&event);
            index.apply(&event, &store);
            index.get(ip()).len()
        };

        assert_eq!(
            apply(watcher::Event::Apply(test_pod("ns", "a", "10.1.2.3", "Running"))),
            1
        );
        // the pod moves to another address
        assert_eq!(
            apply(watcher::Event::Apply(test_pod("ns", "a", "10.1.2.9", "Running"))),
            0
        );
        assert_eq!(
            apply(watcher::Event::Apply(test_pod("ns", "b", "10.1.2.3", "Running"))),
            1
        );
        assert_eq!(
            apply(watcher::Event::Delete(test_pod("ns", "b", "10.1.2.3", "Running"))),
            0
        );

        // a relist replaces everything indexed before it
        apply(watcher::Event::Init);
        apply(watcher::Event::InitApply(test_pod("ns", "c", "10.1.2.3", "Running")));
        assert_eq!(apply(watcher::Event::InitDone), 1);
        assert!(index.get("10.1.2.9".parse().unwrap()).is_empty());
    }

    #[tokio::test]
    async fn ambiguity_without_fallback() {
        let provider = WatchProvider::from_store(
            cache(vec![
                test_pod("ns", "a", "10.1.2.3", "Running"),
                test_pod("other", "b", "10.1.2.3", "Pending"),
            ]),
            None,
            metrics(),
        );
        let err = provider.get_by_ip(ip()).await.unwrap_err();
        assert_matches!(&err, Error::Cache(inner) if matches!(**inner, Error::AmbiguousOwner { .. }));
        assert_eq!(err.outcome(), crate::pods::metrics::LookupOutcome::Ambiguous);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn finished_pods_are_skipped() {
        let provider = WatchProvider::from_store(
            cache(vec![
                test_pod("ns", "old", "10.1.2.3", "Failed"),
                test_pod("ns", "new", "10.1.2.3", "Running"),
            ]),
            None,
            metrics(),
        );
        assert_eq!(provider.get_by_ip(ip()).await.unwrap().name, "new");
    }
}
