use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{self, DEFAULT_POLL_INTERVAL};
use crate::diff::diff_snapshots;
use crate::types::{DeviceId, DeviceSnapshot, Event};
use crate::{Error, Result};

/// Where the coordinator gets device state from.
pub trait DeviceSource: Send + Sync + 'static {
    fn list_devices(&self) -> impl Future<Output = Result<Vec<DeviceId>>> + Send;
    fn get_device(&self, id: &DeviceId) -> impl Future<Output = Result<DeviceSnapshot>> + Send;
}

impl<S: DeviceSource> DeviceSource for Arc<S> {
    fn list_devices(&self) -> impl Future<Output = Result<Vec<DeviceId>>> + Send {
        (**self).list_devices()
    }

    fn get_device(&self, id: &DeviceId) -> impl Future<Output = Result<DeviceSnapshot>> + Send {
        (**self).get_device(id)
    }
}

/// Every known device as of one published cycle. Never mutated after
/// publication.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
    pub devices: BTreeMap<DeviceId, DeviceSnapshot>,
    /// Number of completed full cycles.
    pub cycle: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Aggregate {
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceSnapshot> {
        self.devices.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceSnapshot> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub cycle: u64,
    pub succeeded: usize,
    pub failed: usize,
    /// Failed devices whose previous snapshot was kept.
    pub carried_over: usize,
    /// Failed devices with nothing to carry over.
    pub omitted: usize,
    /// Known devices missing from the listing.
    pub removed: usize,
}

type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;
type UpdateCallback = Box<dyn Fn(&Aggregate) + Send + Sync>;

pub struct CoordinatorBuilder<S> {
    source: S,
    poll_interval: Duration,
    cycle_deadline: Option<Duration>,
    event_callbacks: Vec<EventCallback>,
    update_callbacks: Vec<UpdateCallback>,
}

impl<S: DeviceSource> CoordinatorBuilder<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cycle_deadline: None,
            event_callbacks: Vec::new(),
            update_callbacks: Vec::new(),
        }
    }

    /// 10..=300 seconds.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wall-clock bound on one cycle. Defaults to the poll interval.
    pub fn cycle_deadline(mut self, deadline: Duration) -> Self {
        self.cycle_deadline = Some(deadline);
        self
    }

    pub fn on_event(mut self, f: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.event_callbacks.push(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Aggregate) + Send + Sync + 'static) -> Self {
        self.update_callbacks.push(Box::new(f));
        self
    }

    pub fn build(self) -> Result<Coordinator<S>> {
        let poll_interval = config::validate_poll_interval(self.poll_interval)?;
        let (published, _) = watch::channel(Arc::new(Aggregate::default()));
        Ok(Coordinator {
            source: self.source,
            poll_interval,
            cycle_deadline: self.cycle_deadline.unwrap_or(poll_interval),
            published,
            cycle_lock: tokio::sync::Mutex::new(()),
            failures: Mutex::new(HashMap::new()),
            last_report: Mutex::new(None),
            event_callbacks: self.event_callbacks,
            update_callbacks: self.update_callbacks,
        })
    }
}

/// Keeps the aggregate current. Cycles never overlap: full refreshes,
/// single-device refreshes and timer ticks all take the same lock.
pub struct Coordinator<S> {
    source: S,
    poll_interval: Duration,
    cycle_deadline: Duration,
    published: watch::Sender<Arc<Aggregate>>,
    cycle_lock: tokio::sync::Mutex<()>,
    failures: Mutex<HashMap<DeviceId, u32>>,
    last_report: Mutex<Option<CycleReport>>,
    event_callbacks: Vec<EventCallback>,
    update_callbacks: Vec<UpdateCallback>,
}

/// Owns the background polling task. Dropping it aborts the task.
pub struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Stop after the cycle in progress, if any, completes.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await
            && e.is_panic()
        {
            warn!("poll task panicked: {e}");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<S: DeviceSource> Coordinator<S> {
    pub fn builder(source: S) -> CoordinatorBuilder<S> {
        CoordinatorBuilder::new(source)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn get(&self, id: &DeviceId) -> Option<DeviceSnapshot> {
        self.published.borrow().get(id).cloned()
    }

    pub fn get_all(&self) -> Arc<Aggregate> {
        self.published.borrow().clone()
    }

    /// Receives every published aggregate.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Aggregate>> {
        self.published.subscribe()
    }

    /// Consecutive failed fetches for a device; zero after any success.
    pub fn failure_count(&self, id: &DeviceId) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one full cycle. A listing failure fails the cycle and leaves the
    /// published aggregate untouched.
    pub async fn refresh_all(&self) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        self.run_cycle().await
    }

    /// Fetch a single device and publish it into the current aggregate.
    /// On failure the previous snapshot stays in place.
    pub async fn refresh_one(&self, id: &DeviceId) -> Result<DeviceSnapshot> {
        let _cycle = self.cycle_lock.lock().await;
        let deadline = Instant::now() + self.cycle_deadline;

        let outcome = match timeout_at(deadline, self.source.get_device(id)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded(self.cycle_deadline)),
        };

        match outcome {
            Ok(snapshot) => {
                self.failures
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(id);
                let previous = self.get_all();
                let mut devices = previous.devices.clone();
                devices.insert(id.clone(), snapshot.clone());
                let next = Aggregate {
                    devices,
                    cycle: previous.cycle,
                    updated_at: Some(Utc::now()),
                };
                self.publish(&previous, next, Vec::new());
                Ok(snapshot)
            }
            Err(e) => {
                let consecutive = self.record_failure(id);
                warn!(device_id = %id, consecutive, "refresh failed: {e}");
                self.emit(&Event::DeviceFetchFailed {
                    device_id: id.clone(),
                    consecutive,
                });
                Err(e)
            }
        }
    }

    /// Spawn the periodic refresh. The first cycle runs immediately; a tick
    /// that lands while another cycle holds the lock is skipped.
    pub fn start(self: &Arc<Self>) -> PollHandle {
        let this = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs = this.poll_interval.as_secs(), "polling started");

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Ok(_cycle) = this.cycle_lock.try_lock() else {
                            debug!("cycle still running, skipping tick");
                            continue;
                        };
                        if let Err(e) = this.run_cycle().await {
                            warn!("poll cycle failed, keeping last known state: {e}");
                        }
                    }
                }
            }
            info!("polling stopped");
        });

        PollHandle { cancel, task }
    }

    fn record_failure(&self, id: &DeviceId) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(id.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Caller holds the cycle lock.
    async fn run_cycle(&self) -> Result<CycleReport> {
        let deadline = Instant::now() + self.cycle_deadline;

        let listed = match timeout_at(deadline, self.source.list_devices()).await {
            Ok(Ok(ids)) => ids,
            Ok(Err(e)) => {
                warn!("device listing failed, keeping previous snapshot: {e}");
                return Err(e);
            }
            Err(_) => {
                warn!("device listing missed the cycle deadline");
                return Err(Error::DeadlineExceeded(self.cycle_deadline));
            }
        };

        let mut seen = HashSet::new();
        let ids: Vec<DeviceId> = listed.into_iter().filter(|id| seen.insert(id.clone())).collect();

        let fetches = ids.iter().map(|id| async move {
            match timeout_at(deadline, self.source.get_device(id)).await {
                Ok(result) => result,
                Err(_) => Err(Error::DeadlineExceeded(self.cycle_deadline)),
            }
        });
        let mut results = join_all(fetches).await;

        // A rejected credential is not a per-device problem: fail the cycle.
        let rejected = results
            .iter()
            .position(|r| r.as_ref().is_err_and(|e| e.is_authentication()));
        if let Some(i) = rejected
            && let Err(e) = results.swap_remove(i)
        {
            warn!(device_id = %ids[i], "authentication failed mid-cycle, keeping previous snapshot: {e}");
            return Err(e);
        }

        let previous = self.get_all();
        let (next, report, failed) = self.merge(&previous, &ids, results);

        info!(
            cycle = report.cycle,
            succeeded = report.succeeded,
            failed = report.failed,
            carried_over = report.carried_over,
            omitted = report.omitted,
            removed = report.removed,
            "poll cycle complete"
        );
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
        self.publish(&previous, next, failed);
        Ok(report)
    }

    /// Build the next aggregate from one cycle's results: fresh snapshots
    /// replace old ones, failures carry the old snapshot over.
    fn merge(
        &self,
        previous: &Aggregate,
        ids: &[DeviceId],
        results: Vec<Result<DeviceSnapshot>>,
    ) -> (Aggregate, CycleReport, Vec<Event>) {
        let mut devices = BTreeMap::new();
        let mut report = CycleReport {
            cycle: previous.cycle + 1,
            ..CycleReport::default()
        };
        let mut failed = Vec::new();
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());

        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(snapshot) => {
                    failures.remove(id);
                    devices.insert(id.clone(), snapshot);
                    report.succeeded += 1;
                }
                Err(e) => {
                    let count = failures.entry(id.clone()).or_insert(0);
                    *count += 1;
                    report.failed += 1;
                    warn!(device_id = %id, consecutive = *count, "device fetch failed: {e}");
                    failed.push(Event::DeviceFetchFailed {
                        device_id: id.clone(),
                        consecutive: *count,
                    });
                    match previous.get(id) {
                        Some(old) => {
                            devices.insert(id.clone(), old.clone());
                            report.carried_over += 1;
                        }
                        None => report.omitted += 1,
                    }
                }
            }
        }

        let listed: HashSet<&DeviceId> = ids.iter().collect();
        failures.retain(|id, _| listed.contains(id));
        for id in previous.devices.keys().filter(|id| !listed.contains(id)) {
            info!(device_id = %id, "device no longer listed, removing");
            report.removed += 1;
        }

        let next = Aggregate {
            devices,
            cycle: report.cycle,
            updated_at: Some(Utc::now()),
        };
        (next, report, failed)
    }

    fn publish(&self, previous: &Aggregate, next: Aggregate, failed: Vec<Event>) {
        let next = Arc::new(next);
        self.published.send_replace(Arc::clone(&next));

        for callback in &self.update_callbacks {
            callback(&next);
        }
        for event in diff_snapshots(&previous.devices, &next.devices)
            .iter()
            .chain(failed.iter())
        {
            self.emit(event);
        }
    }

    fn emit(&self, event: &Event) {
        debug!(?event, "event");
        for callback in &self.event_callbacks {
            callback(event);
        }
    }
}
