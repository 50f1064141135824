/*
 * Copyright 2025 tablet-compactor
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


//! A metrics registry that keeps every series in process memory. Useful when
//! no metrics backend is wired up but the numbers should still be visible,
//! for example in logs at shutdown or in tests.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use mixtrics::metrics::{
    BoxedCounter, BoxedCounterVec, BoxedGauge, BoxedGaugeVec, BoxedHistogram, BoxedHistogramVec,
    CounterOps, CounterVecOps, GaugeOps, GaugeVecOps, HistogramOps, HistogramVecOps, RegistryOps,
};
use parking_lot::Mutex;

type Store = Arc<Mutex<BTreeMap<String, f64>>>;

/// Series are keyed as `name{label="value",...}` with labels in registration
/// order. Histograms keep a `_count` and a `_sum` series instead of buckets.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetricsRegistry {
    store: Store,
}

impl InMemoryMetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of one series, if it was ever touched.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let key = series_key(name, labels.iter().copied());
        self.store.lock().get(&key).copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.store.lock().clone()
    }

    fn series_vec(
        &self,
        name: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> SeriesVec {
        SeriesVec {
            name,
            label_names,
            store: self.store.clone(),
        }
    }
}

fn series_key<'a, 'b>(name: &str, labels: impl Iterator<Item = (&'a str, &'b str)>) -> String {
    let labels = labels
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>();
    if labels.is_empty() {
        name.to_owned()
    } else {
        format!("{name}{{{}}}", labels.join(","))
    }
}

#[derive(Debug)]
struct SeriesVec {
    name: Cow<'static, str>,
    label_names: &'static [&'static str],
    store: Store,
}

impl SeriesVec {
    fn series(&self, suffix: &str, labels: &[Cow<'static, str>]) -> Series {
        let name = format!("{}{suffix}", self.name);
        let pairs = self
            .label_names
            .iter()
            .copied()
            .zip(labels.iter().map(|v| v.as_ref()));
        Series {
            key: series_key(&name, pairs),
            store: self.store.clone(),
        }
    }
}

#[derive(Debug)]
struct Series {
    key: String,
    store: Store,
}

impl Series {
    fn update(&self, f: impl FnOnce(&mut f64)) {
        f(self.store.lock().entry(self.key.clone()).or_default());
    }
}

impl CounterOps for Series {
    fn increase(&self, val: u64) {
        self.update(|v| *v += val as f64);
    }
}

impl GaugeOps for Series {
    fn increase(&self, val: u64) {
        self.update(|v| *v += val as f64);
    }

    fn decrease(&self, val: u64) {
        self.update(|v| *v -= val as f64);
    }

    fn absolute(&self, val: u64) {
        self.update(|v| *v = val as f64);
    }
}

#[derive(Debug)]
struct HistogramSeries {
    count: Series,
    sum: Series,
}

impl HistogramOps for HistogramSeries {
    fn record(&self, val: f64) {
        self.count.update(|v| *v += 1.0);
        self.sum.update(|v| *v += val);
    }
}

impl CounterVecOps for SeriesVec {
    fn counter(&self, labels: &[Cow<'static, str>]) -> BoxedCounter {
        Box::new(self.series("", labels))
    }
}

impl GaugeVecOps for SeriesVec {
    fn gauge(&self, labels: &[Cow<'static, str>]) -> BoxedGauge {
        Box::new(self.series("", labels))
    }
}

impl HistogramVecOps for SeriesVec {
    fn histogram(&self, labels: &[Cow<'static, str>]) -> BoxedHistogram {
        Box::new(HistogramSeries {
            count: self.series("_count", labels),
            sum: self.series("_sum", labels),
        })
    }
}

impl RegistryOps for InMemoryMetricsRegistry {
    fn register_counter_vec(
        &self,
        name: Cow<'static, str>,
        _desc: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> BoxedCounterVec {
        Box::new(self.series_vec(name, label_names))
    }

    fn register_gauge_vec(
        &self,
        name: Cow<'static, str>,
        _desc: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> BoxedGaugeVec {
        Box::new(self.series_vec(name, label_names))
    }

    fn register_histogram_vec(
        &self,
        name: Cow<'static, str>,
        _desc: Cow<'static, str>,
        label_names: &'static [&'static str],
    ) -> BoxedHistogramVec {
        Box::new(self.series_vec(name, label_names))
    }

    fn register_histogram_vec_with_buckets(
        &self,
        name: Cow<'static, str>,
        desc: Cow<'static, str>,
        label_names: &'static [&'static str],
        _buckets: Vec<f64>,
    ) -> BoxedHistogramVec {
        self.register_histogram_vec(name, desc, label_names)
    }
}
