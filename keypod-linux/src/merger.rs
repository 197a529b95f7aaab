//! Discovery merger: supervises both advertisement mechanisms and publishes one merged view.
//!
//! Each source runs on its own task and pushes tagged events into a single merge task, which owns
//! the [`PeerMap`] and republishes the sorted snapshot on a watch channel whenever it changes.
//! Readers never block the sources.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keypod_core::discovery::{preferred, DiscoveredPeer, DiscoveryEvent, Mechanism, PeerMap};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EVENT_QUEUE: usize = 256;

/// One advertisement mechanism.
#[async_trait]
pub trait DiscoverySource: Send + Sync + 'static {
    fn mechanism(&self) -> Mechanism;

    /// Run until the mechanism fails. Returning `Ok` means it stopped for good.
    async fn run(&self, sink: SourceSink) -> std::io::Result<()>;
}

/// Where a source reports its events. Remembers which names are currently published through it.
#[derive(Clone)]
pub struct SourceSink {
    mechanism: Mechanism,
    tx: mpsc::Sender<(Mechanism, DiscoveryEvent)>,
    published: Arc<Mutex<BTreeSet<String>>>,
}

impl SourceSink {
    fn new(mechanism: Mechanism, tx: mpsc::Sender<(Mechanism, DiscoveryEvent)>) -> Self {
        Self {
            mechanism,
            tx,
            published: Arc::default(),
        }
    }

    pub async fn emit(&self, event: DiscoveryEvent) {
        if let Ok(mut names) = self.published.lock() {
            match &event {
                DiscoveryEvent::Resolved { name, .. } => {
                    names.insert(name.clone());
                }
                DiscoveryEvent::Removed { name } | DiscoveryEvent::ResolveFailed { name, .. } => {
                    names.remove(name);
                }
                DiscoveryEvent::Found { .. } => {}
            }
        }
        if self.tx.send((self.mechanism, event)).await.is_err() {
            debug!(mechanism = %self.mechanism, "merger gone, event dropped");
        }
    }

    /// Remove everything this sink published.
    async fn withdraw_all(&self) {
        let names = match self.published.lock() {
            Ok(mut names) => std::mem::take(&mut *names),
            Err(_) => BTreeSet::new(),
        };
        for name in names {
            self.emit(DiscoveryEvent::Removed { name }).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergerOptions {
    /// Polling interval for [`DiscoveryMerger::wait_for`].
    pub poll_interval: Duration,
    /// Pause before restarting a failed source.
    pub restart_delay: Duration,
}

impl Default for MergerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            restart_delay: Duration::from_secs(2),
        }
    }
}

pub struct DiscoveryMerger {
    events: mpsc::Sender<(Mechanism, DiscoveryEvent)>,
    snapshot: watch::Receiver<Vec<DiscoveredPeer>>,
    options: MergerOptions,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryMerger {
    /// Start the merge task and every source. Must be called inside a tokio runtime.
    pub fn start(sources: Vec<Arc<dyn DiscoverySource>>, options: MergerOptions) -> Self {
        let (events, rx) = mpsc::channel(EVENT_QUEUE);
        let (snapshot_tx, snapshot) = watch::channel(Vec::new());
        let mut tasks = vec![tokio::spawn(merge_loop(rx, snapshot_tx))];
        for source in sources {
            tasks.push(tokio::spawn(supervise(source, events.clone(), options.restart_delay)));
        }
        info!(sources = tasks.len() - 1, "discovery started");
        Self {
            events,
            snapshot,
            options,
            tasks: Mutex::new(tasks),
        }
    }

    /// Sink for events produced outside the supervised sources.
    pub fn sink(&self, mechanism: Mechanism) -> SourceSink {
        SourceSink::new(mechanism, self.events.clone())
    }

    /// Current merged view, sorted by name.
    pub fn results(&self) -> Vec<DiscoveredPeer> {
        self.snapshot.borrow().clone()
    }

    /// Change notifications for the merged view.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredPeer>> {
        self.snapshot.clone()
    }

    /// Wait for a reachable peer.
    ///
    /// A `cached` dedup key present in the live view is returned at once. Otherwise the view is
    /// polled until it is non-empty (returning the cached entry if it appeared, else the
    /// preferred one) or `timeout` elapses, in which case `None` is returned.
    pub async fn wait_for(&self, cached: Option<&str>, timeout: Duration) -> Option<DiscoveredPeer> {
        let deadline = Instant::now() + timeout;
        loop {
            let peers = self.results();
            if let Some(hit) = cached.and_then(|key| peers.iter().find(|p| p.dedup_key == key)) {
                return Some(hit.clone());
            }
            if let Some(peer) = preferred(&peers) {
                return Some(peer.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(?timeout, "no peer discovered before timeout");
                return None;
            }
            tokio::time::sleep(self.options.poll_interval.min(deadline - now)).await;
        }
    }

    pub fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for DiscoveryMerger {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn merge_loop(
    mut rx: mpsc::Receiver<(Mechanism, DiscoveryEvent)>,
    snapshot: watch::Sender<Vec<DiscoveredPeer>>,
) {
    let mut map = PeerMap::new();
    while let Some((mechanism, event)) = rx.recv().await {
        if map.apply(mechanism, event) {
            debug!(peers = map.len(), "discovery view changed");
            snapshot.send_replace(map.snapshot());
        }
    }
}

/// Run `source` until it stops for good. A failed or panicked run withdraws whatever it
/// published, since its sightings are lost, and is restarted after `restart_delay`.
async fn supervise(
    source: Arc<dyn DiscoverySource>,
    events: mpsc::Sender<(Mechanism, DiscoveryEvent)>,
    restart_delay: Duration,
) {
    let mechanism = source.mechanism();
    loop {
        let sink = SourceSink::new(mechanism, events.clone());
        // Aborts the run along with this task when the merger stops.
        let mut run = JoinSet::new();
        let task_source = source.clone();
        let task_sink = sink.clone();
        run.spawn(async move { task_source.run(task_sink).await });
        let error = match run.join_next().await {
            Some(Ok(Ok(()))) | None => {
                debug!(%mechanism, "discovery mechanism stopped");
                return;
            }
            Some(Ok(Err(e))) => e.to_string(),
            Some(Err(e)) => e.to_string(),
        };
        warn!(%mechanism, error = %error, "discovery mechanism failed, restarting");
        sink.withdraw_all().await;
        tokio::time::sleep(restart_delay).await;
    }
}
