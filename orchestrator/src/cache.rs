use crate::errors::OrchestratorError;
use crate::keyer::{AggregationKey, Keyer};
use crate::metrics_defs::{
    ENTRIES, ENTRIES_CREATED, ENTRIES_EVICTED, KEY_MATCH_FAILURES, RESPONSES_FANNED_OUT,
    WATCHES_CANCELLED, WATCHES_REGISTERED,
};
use crate::watch::{ResponseSlot, Watch, WatchId};
use parking_lot::Mutex;
use serde::Serialize;
use shared::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use upstream::{
    DiscoveryRequest, DiscoveryResponse, StreamShutdown, UpstreamClient, validate_request,
};

type Sender = Arc<watch::Sender<ResponseSlot>>;

/// Point-in-time view of one entry, as served by the admin endpoints.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntryInfo {
    pub key: AggregationKey,
    pub watchers: usize,
    /// Version of the most recent response, if any arrived yet.
    pub version: Option<String>,
    pub upstream_open: bool,
}

#[derive(Clone, Copy, Debug)]
enum EvictReason {
    LastWatchCancelled,
    NoWatchersAfterOpen,
    UpstreamClosed,
}

impl EvictReason {
    fn as_str(&self) -> &'static str {
        match self {
            EvictReason::LastWatchCancelled => "last_watch_cancelled",
            EvictReason::NoWatchersAfterOpen => "no_watchers_after_open",
            EvictReason::UpstreamClosed => "upstream_closed",
        }
    }
}

enum Upstream {
    /// `open_stream` is in flight. The opening task owns eviction until it
    /// returns.
    Opening,
    Open(StreamShutdown),
}

struct EntryState {
    watchers: HashMap<WatchId, Sender>,
    last_response: Option<Arc<DiscoveryResponse>>,
    upstream: Upstream,
    /// Set together with removal from the key table, under this lock. A closed
    /// entry never accepts watchers again.
    closed: bool,
}

pub(crate) struct Entry {
    key: AggregationKey,
    state: Mutex<EntryState>,
}

impl Entry {
    fn new(key: AggregationKey, id: WatchId, sender: Sender) -> Self {
        Entry {
            key,
            state: Mutex::new(EntryState {
                watchers: HashMap::from([(id, sender)]),
                last_response: None,
                upstream: Upstream::Opening,
                closed: false,
            }),
        }
    }

    fn info(&self) -> EntryInfo {
        let state = self.state.lock();
        EntryInfo {
            key: self.key.clone(),
            watchers: state.watchers.len(),
            version: state
                .last_response
                .as_ref()
                .map(|response| response.version_info.clone()),
            upstream_open: !state.closed
                && matches!(&state.upstream, Upstream::Open(shutdown) if !shutdown.is_closed()),
        }
    }
}

// Lock order is entry, then key table. Nothing locks an entry while holding
// the key table.
pub(crate) struct Shared {
    keyer: Arc<dyn Keyer>,
    client: UpstreamClient,
    entries: Mutex<HashMap<AggregationKey, Arc<Entry>>>,
    next_watch_id: AtomicU64,
}

impl Shared {
    /// Must be called with the entry's lock held and `closed` just set.
    fn evict(&self, entry: &Arc<Entry>, reason: EvictReason) {
        let mut entries = self.entries.lock();
        if entries
            .get(&entry.key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(&entry.key);
            gauge!(ENTRIES).set(entries.len() as f64);
            counter!(ENTRIES_EVICTED, "reason" => reason.as_str()).increment(1);
            tracing::debug!(key = %entry.key, reason = reason.as_str(), "evicted entry");
        }
    }

    pub(crate) fn remove_watcher(&self, entry: &Arc<Entry>, id: WatchId) {
        let shutdown = {
            let mut state = entry.state.lock();
            if state.watchers.remove(&id).is_none() {
                return;
            }
            counter!(WATCHES_CANCELLED).increment(1);

            if !state.watchers.is_empty() || state.closed {
                return;
            }
            let Upstream::Open(shutdown) = &state.upstream else {
                return;
            };
            let shutdown = shutdown.clone();
            state.closed = true;
            self.evict(entry, EvictReason::LastWatchCancelled);
            shutdown
        };

        shutdown.shutdown();
    }

    /// Opens the upstream stream of a new entry and broadcasts its responses
    /// until the stream closes.
    async fn run_entry(self: Arc<Self>, entry: Arc<Entry>, request: DiscoveryRequest) {
        let (mut responses, shutdown) = match self.client.open_stream(request).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!(key = %entry.key, error = %e, "could not open upstream stream");
                self.teardown(&entry);
                return;
            }
        };

        {
            let mut state = entry.state.lock();
            if state.watchers.is_empty() {
                state.closed = true;
                self.evict(&entry, EvictReason::NoWatchersAfterOpen);
                drop(state);
                shutdown.shutdown();
                return;
            }
            state.upstream = Upstream::Open(shutdown);
        }

        while let Some(response) = responses.recv().await {
            let response = Arc::new(response);
            let senders: Vec<Sender> = {
                let mut state = entry.state.lock();
                if state.closed {
                    break;
                }
                state.last_response = Some(response.clone());
                state.watchers.values().cloned().collect()
            };

            tracing::debug!(
                key = %entry.key,
                version = %response.version_info,
                watchers = senders.len(),
                "fanning out response"
            );
            for sender in &senders {
                sender.send_replace(Some(response.clone()));
            }
            counter!(RESPONSES_FANNED_OUT).increment(senders.len() as u64);
        }

        self.teardown(&entry);
    }

    /// Closes every watch on the entry and evicts it. Idempotent.
    fn teardown(&self, entry: &Arc<Entry>) {
        let (watchers, upstream) = {
            let mut state = entry.state.lock();
            if !state.closed {
                state.closed = true;
                self.evict(entry, EvictReason::UpstreamClosed);
            }
            let upstream = std::mem::replace(&mut state.upstream, Upstream::Opening);
            (std::mem::take(&mut state.watchers), upstream)
        };

        if let Upstream::Open(shutdown) = upstream {
            shutdown.shutdown();
        }
        if !watchers.is_empty() {
            tracing::info!(
                key = %entry.key,
                watchers = watchers.len(),
                "upstream stream closed, closing watches"
            );
        }
        // Dropping the last sender closes each watch's channel.
        drop(watchers);
    }
}

/// Deduplicates watches onto one upstream stream per aggregation key and fans
/// each response out to every watch on that key.
///
/// All methods must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(keyer: Arc<dyn Keyer>, client: UpstreamClient) -> Self {
        Orchestrator {
            shared: Arc::new(Shared {
                keyer,
                client,
                entries: Mutex::new(HashMap::new()),
                next_watch_id: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a watch for `request`.
    ///
    /// The first watch on a key opens the upstream stream with its request. Later
    /// watches join the existing entry and, if a response is already cached and
    /// its version differs from the version the request acknowledges, receive
    /// that response right away.
    pub fn watch(&self, request: DiscoveryRequest) -> Result<Watch, OrchestratorError> {
        let key = self.shared.keyer.match_key(&request).inspect_err(|e| {
            counter!(KEY_MATCH_FAILURES).increment(1);
            tracing::debug!(
                type_url = %request.type_url,
                node_id = request.node_id().unwrap_or_default(),
                error = %e,
                "could not match request"
            );
        })?;
        validate_request(&request)?;

        let id = self.shared.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        let sender = Arc::new(sender);

        let entry = loop {
            let existing = self.shared.entries.lock().get(&key).cloned();

            if let Some(entry) = existing {
                let mut state = entry.state.lock();
                if state.closed {
                    // Lost a race with eviction, which already removed it.
                    continue;
                }
                if let Some(last) = &state.last_response {
                    if last.version_info != request.version_info {
                        sender.send_replace(Some(last.clone()));
                    }
                }
                state.watchers.insert(id, sender.clone());
                tracing::debug!(key = %key, watchers = state.watchers.len(), "joined entry");
                drop(state);
                break entry;
            }

            let mut entries = self.shared.entries.lock();
            if entries.contains_key(&key) {
                continue;
            }
            let entry = Arc::new(Entry::new(key.clone(), id, sender.clone()));
            entries.insert(key.clone(), entry.clone());
            gauge!(ENTRIES).set(entries.len() as f64);
            drop(entries);

            counter!(ENTRIES_CREATED).increment(1);
            tracing::debug!(key = %key, type_url = %request.type_url, "created entry");
            tokio::spawn(self.shared.clone().run_entry(entry.clone(), request.clone()));
            break entry;
        };

        counter!(WATCHES_REGISTERED).increment(1);

        Ok(Watch::new(
            id,
            key,
            receiver,
            Arc::downgrade(&self.shared),
            Arc::downgrade(&entry),
        ))
    }

    pub fn cancel(&self, watch: Watch) {
        watch.cancel();
    }

    pub fn keys(&self) -> Vec<AggregationKey> {
        let mut keys: Vec<_> = self.shared.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let entry = self.shared.entries.lock().get(key).cloned()?;
        Some(entry.info())
    }

    /// Every live entry, sorted by key.
    pub fn snapshot(&self) -> Vec<EntryInfo> {
        let entries: Vec<Arc<Entry>> = self.shared.entries.lock().values().cloned().collect();
        let mut infos: Vec<EntryInfo> = entries.iter().map(|entry| entry.info()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// True while the governing token of the upstream client is live.
    pub fn is_live(&self) -> bool {
        !self.shared.client.is_shut_down()
    }
}
