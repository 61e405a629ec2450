use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Groups `items` by the interval returned from `key`. Non-positive
/// intervals are dropped.
pub fn group_by_interval<T>(items: Vec<T>, key: impl Fn(&T) -> i64) -> BTreeMap<u64, Vec<T>> {
    let mut groups: BTreeMap<u64, Vec<T>> = BTreeMap::new();
    for item in items {
        let interval = key(&item);
        if interval > 0 {
            groups.entry(interval as u64).or_default().push(item);
        }
    }
    groups
}

/// One timer per distinct interval. Each tick hands the whole group to the
/// tick callback.
pub struct GroupedTimers {
    name: &'static str,
    unit: Duration,
    handles: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl GroupedTimers {
    /// `unit` is the length of one interval step (a second for probes, a
    /// minute for load rules).
    pub fn new(name: &'static str, unit: Duration) -> Self {
        Self {
            name,
            unit,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Stops every running timer and starts one per group. Holding the lock
    /// for the whole swap keeps concurrent reloads from interleaving.
    pub async fn reload<T, F, Fut>(&self, groups: BTreeMap<u64, Vec<T>>, on_tick: F)
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<Vec<T>>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.abort();
        }

        for (interval, items) in groups {
            let period = self.unit * interval as u32;
            let items = Arc::new(items);
            let on_tick = on_tick.clone();
            let name = self.name;
            let handle = tokio::spawn(async move {
                let mut ticker = time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    debug!(timer = name, interval, items = items.len(), "Timer group tick.");
                    on_tick(items.clone()).await;
                }
            });
            handles.insert(interval, handle);
        }
        info!(timer = self.name, groups = handles.len(), "Timer groups reloaded.");
    }

    pub async fn active_intervals(&self) -> Vec<u64> {
        let mut intervals: Vec<u64> = self.handles.lock().await.keys().copied().collect();
        intervals.sort_unstable();
        intervals
    }

    pub async fn stop(&self) {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.abort();
        }
    }
}

impl Drop for GroupedTimers {
    fn drop(&mut self) {
        for (_, handle) in self.handles.get_mut().drain() {
            handle.abort();
        }
    }
}
