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

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Copy, Hash, Debug, PartialEq, Eq, EncodeLabelValue)]
pub enum LookupOutcome {
    Found,
    NotFound,
    Ambiguous,
    QueryError,
    Cancelled,
    Timeout,
}

#[derive(Clone, Hash, Debug, PartialEq, Eq, EncodeLabelSet)]
struct LookupLabels {
    outcome: LookupOutcome,
}

#[derive(Default)]
pub struct Metrics {
    lookups: Family<LookupLabels, Counter>,
    pub(super) cache_misses: Counter,
    pub(super) cached_pods: Gauge,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let m = Self::default();
        registry.register(
            "pod_lookups",
            "The total number of pod lookups by source IP, by outcome",
            m.lookups.clone(),
        );
        registry.register(
            "pod_cache_misses",
            "The total number of pod lookups served by the fallback after a cache miss",
            m.cache_misses.clone(),
        );
        registry.register(
            "cached_pods",
            "The number of pods currently held in the node-local watch cache",
            m.cached_pods.clone(),
        );
        m
    }

    pub fn record_lookup(&self, outcome: LookupOutcome) {
        self.lookups.get_or_create(&LookupLabels { outcome }).inc();
    }

    pub fn lookups(&self, outcome: LookupOutcome) -> u64 {
        self.lookups.get_or_create(&LookupLabels { outcome }).get()
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.get()
    }
}
